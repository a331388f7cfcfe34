use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    vgg::VggLayer,
};

/// Channel correlation matrix of `[batch, channels, height, width]` activations,
/// normalized by `channels * height * width`.
pub fn gram_matrix<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 3> {
    let [batch, channels, height, width] = x.dims();
    let features = x.reshape([batch, channels, height * width]);
    let gram = features.clone().matmul(features.swap_dims(1, 2));

    gram / (channels * height * width) as f32
}

/// Squared Gram difference summed over both matrix axes, one value per batch item.
pub fn style_loss<B: Backend>(pred: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
    let [batch, ..] = pred.dims();
    let diff = gram_matrix(pred) - gram_matrix(target);

    (diff.clone() * diff).sum_dim(2).sum_dim(1).reshape([batch])
}

/// Mean squared error over the feature axes, one value per batch item.
pub fn content_loss<B: Backend>(pred: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
    let [batch, channels, height, width] = pred.dims();
    let diff = pred - target;

    (diff.clone() * diff)
        .reshape([batch, channels * height * width])
        .mean_dim(1)
        .reshape([batch])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeadKind {
    /// Index into the style extractor's taps.
    Style(usize),
    /// Index into the content extractor's taps.
    Content(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossHead {
    pub name: String,
    pub kind: HeadKind,
    pub weight: f64,
}

impl LossHead {
    pub fn style(layer: VggLayer, index: usize, weight: f64) -> Self {
        Self {
            name: format!("style_{}", layer.name()),
            kind: HeadKind::Style(index),
            weight,
        }
    }

    pub fn content(layer: VggLayer, index: usize, weight: f64) -> Self {
        Self {
            name: format!("content_{}", layer.name()),
            kind: HeadKind::Content(index),
            weight,
        }
    }

    pub fn loss<B: Backend>(&self, pred: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
        match self.kind {
            HeadKind::Style(_) => style_loss(pred, target),
            HeadKind::Content(_) => content_loss(pred, target),
        }
    }
}

/// Ordered loss heads. The graph binds its outputs and the generator orders its
/// targets by walking this same list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossHeads {
    heads: Vec<LossHead>,
}

impl LossHeads {
    pub fn new(heads: Vec<LossHead>) -> Self {
        Self { heads }
    }

    pub fn iter(&self) -> impl Iterator<Item = &LossHead> {
        self.heads.iter()
    }

    pub fn len(&self) -> usize {
        self.heads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    /// Checks that every style and content tap is bound by exactly one head.
    pub fn validate(&self, style_taps: usize, content_taps: usize) -> Result<()> {
        if self.heads.is_empty() {
            return Err(Error::HeadMismatch("no loss heads configured".into()));
        }

        let mut style_bound = vec![0; style_taps];
        let mut content_bound = vec![0; content_taps];

        for head in &self.heads {
            if !head.weight.is_finite() || head.weight < 0. {
                return Err(Error::HeadMismatch(format!(
                    "{} has invalid weight {}",
                    head.name, head.weight
                )));
            }

            let (bound, index, taps) = match head.kind {
                HeadKind::Style(index) => (&mut style_bound, index, "style"),
                HeadKind::Content(index) => (&mut content_bound, index, "content"),
            };
            let Some(count) = bound.get_mut(index) else {
                return Err(Error::HeadMismatch(format!(
                    "{} refers to {taps} tap {index}, which does not exist",
                    head.name
                )));
            };
            *count += 1;
        }

        for (taps, bound) in [("style", style_bound), ("content", content_bound)] {
            if let Some(index) = bound.iter().position(|&count| count != 1) {
                return Err(Error::HeadMismatch(format!(
                    "{taps} tap {index} is bound by {} heads, expected exactly one",
                    bound[index]
                )));
            }
        }

        Ok(())
    }
}

#[derive(Config, Debug)]
pub struct LossConfig {
    #[config(default = "[1.0, 1.0, 1.0, 1.0]")]
    pub style_weights: [f64; 4],

    /// Outweighs the style heads combined.
    #[config(default = 5.0)]
    pub content_weight: f64,
}

impl LossConfig {
    /// One head per style layer in order, followed by the content head.
    pub fn heads(&self, style_layers: &[VggLayer], content_layer: VggLayer) -> Result<LossHeads> {
        if style_layers.len() != self.style_weights.len() {
            return Err(Error::InvalidConfig(format!(
                "{} style weights for {} style layers",
                self.style_weights.len(),
                style_layers.len()
            )));
        }

        let mut heads: Vec<_> = style_layers
            .iter()
            .zip(self.style_weights)
            .enumerate()
            .map(|(index, (&layer, weight))| LossHead::style(layer, index, weight))
            .collect();
        heads.push(LossHead::content(content_layer, 0, self.content_weight));

        Ok(LossHeads::new(heads))
    }
}

#[cfg(test)]
mod tests {
    use burn::{backend::NdArray, tensor::Distribution};

    use super::*;

    type TestBackend = NdArray<f32>;

    const STYLE_LAYERS: [VggLayer; 4] = [
        VggLayer::Block1Conv2,
        VggLayer::Block2Conv2,
        VggLayer::Block3Conv3,
        VggLayer::Block4Conv3,
    ];

    fn random(shape: [usize; 4]) -> Tensor<TestBackend, 4> {
        Tensor::random(shape, Distribution::Normal(0.0, 1.0), &Default::default())
    }

    #[test]
    fn gram_matrix_is_symmetric() {
        let gram = gram_matrix(random([3, 5, 4, 6]));
        assert_eq!(gram.dims(), [3, 5, 5]);

        let transposed = gram.clone().swap_dims(1, 2);
        let max_diff = (gram - transposed).abs().max().into_scalar();

        assert!(max_diff < 1e-5, "max asymmetry {max_diff}");
    }

    #[test]
    fn gram_matrix_is_normalized_by_feature_size() {
        let device = Default::default();
        let ones = Tensor::<TestBackend, 4>::ones([1, 2, 3, 4], &device);

        let gram = gram_matrix(ones);

        // each entry is h*w / (c*h*w)
        let expected = Tensor::<TestBackend, 3>::full([1, 2, 2], 0.5, &device);
        let max_diff = (gram - expected).abs().max().into_scalar();
        assert!(max_diff < 1e-6);
    }

    #[test]
    fn style_loss_is_zero_for_identical_activations() {
        let x = random([2, 4, 3, 3]);

        let loss = style_loss(x.clone(), x);

        assert_eq!(loss.dims(), [2]);
        let values = loss.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn style_loss_is_positive_for_different_statistics() {
        let pred = random([2, 4, 3, 3]);
        let target = random([2, 4, 3, 3]) * 3.0 + 1.0;

        let values = style_loss(pred, target).into_data().to_vec::<f32>().unwrap();

        assert_eq!(values.len(), 2);
        assert!(values.iter().all(|&v| v > 0.));
    }

    #[test]
    fn content_loss_is_per_item_mean_squared_error() {
        let device = Default::default();
        let pred = Tensor::<TestBackend, 4>::zeros([2, 1, 2, 2], &device);
        let target = Tensor::<TestBackend, 4>::from_floats(
            [[[[1.0, 1.0], [1.0, 1.0]]], [[[2.0, 0.0], [0.0, 0.0]]]],
            &device,
        );

        let values = content_loss(pred, target).into_data().to_vec::<f32>().unwrap();

        assert_eq!(values, vec![1.0, 1.0]);
    }

    #[test]
    fn heads_follow_configured_order() {
        let heads = LossConfig::new()
            .heads(&STYLE_LAYERS, VggLayer::Block3Conv3)
            .unwrap();

        let names: Vec<_> = heads.iter().map(|head| head.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "style_block1_conv2",
                "style_block2_conv2",
                "style_block3_conv3",
                "style_block4_conv3",
                "content_block3_conv3",
            ]
        );
        assert!(heads.validate(4, 1).is_ok());
    }

    #[test]
    fn default_content_weight_exceeds_all_style_weights_combined() {
        let config = LossConfig::new();

        assert!(config.content_weight > config.style_weights.iter().sum::<f64>());
    }

    #[test]
    fn validate_rejects_unbound_and_duplicate_taps() {
        let heads = LossConfig::new()
            .heads(&STYLE_LAYERS, VggLayer::Block3Conv3)
            .unwrap();
        assert!(matches!(heads.validate(5, 1), Err(Error::HeadMismatch(_))));
        assert!(matches!(heads.validate(3, 1), Err(Error::HeadMismatch(_))));

        let duplicated = LossHeads::new(vec![
            LossHead::style(VggLayer::Block1Conv2, 0, 1.0),
            LossHead::style(VggLayer::Block1Conv2, 0, 1.0),
            LossHead::content(VggLayer::Block3Conv3, 0, 1.0),
        ]);
        assert!(matches!(duplicated.validate(1, 1), Err(Error::HeadMismatch(_))));
    }

    #[test]
    fn validate_rejects_negative_weight() {
        let heads = LossHeads::new(vec![
            LossHead::style(VggLayer::Block1Conv2, 0, -1.0),
            LossHead::content(VggLayer::Block3Conv3, 0, 1.0),
        ]);

        assert!(heads.validate(1, 1).is_err());
    }
}
