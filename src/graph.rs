use burn::{
    data::dataloader::batcher::Batcher,
    module::AutodiffModule,
    optim::{GradientsParams, Optimizer},
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use image::RgbImage;
use tracing::debug;

use crate::{
    data::{tensor_to_image, ContentImage, ImageBatcher, ImageShape},
    error::{Error, Result},
    generator::{StyleBatch, StyleTarget},
    loss::{HeadKind, LossHeads},
    model::ConvertNetwork,
    vgg::FeatureExtractor,
};

/// Loss values of one train step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepLosses {
    /// Weighted sum of the batch-averaged head losses.
    pub total: f32,
    pub heads: Vec<(String, f32)>,
}

impl StepLosses {
    /// `[total, head_1, .., head_n]`.
    pub fn values(&self) -> Vec<f32> {
        std::iter::once(self.total)
            .chain(self.heads.iter().map(|(_, loss)| *loss))
            .collect()
    }
}

/// Convert network feeding both frozen extractors, with one loss per head.
///
/// Only the convert network's parameters are updated.
pub struct StyleTransferGraph<B: AutodiffBackend, O> {
    convert: ConvertNetwork<B>,
    style_extractor: FeatureExtractor<B>,
    content_extractor: FeatureExtractor<B>,
    heads: LossHeads,
    optimizer: O,
    learning_rate: f64,
}

impl<B, O> StyleTransferGraph<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<ConvertNetwork<B>, B>,
{
    /// Binds the heads to the extractors' taps and checks the style target against
    /// the activation shapes produced for `shape`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        convert: ConvertNetwork<B>,
        style_extractor: FeatureExtractor<B>,
        content_extractor: FeatureExtractor<B>,
        heads: LossHeads,
        style_target: &StyleTarget<B>,
        shape: &ImageShape,
        optimizer: O,
        learning_rate: f64,
    ) -> Result<Self> {
        heads.validate(style_extractor.taps().len(), content_extractor.taps().len())?;

        let expected_dims = style_extractor.output_dims(shape);
        if style_target.features().len() != expected_dims.len() {
            return Err(Error::HeadMismatch(format!(
                "style target has {} features for {} style taps",
                style_target.features().len(),
                expected_dims.len()
            )));
        }

        for head in heads.iter() {
            let HeadKind::Style(index) = head.kind else {
                continue;
            };
            let [c, h, w] = expected_dims[index];
            let got = style_target.features()[index].dims();
            if got != [1, c, h, w] {
                return Err(Error::TargetShape {
                    head: head.name.clone(),
                    expected: [1, c, h, w],
                    got,
                });
            }
        }

        Ok(Self {
            convert,
            style_extractor,
            content_extractor,
            heads,
            optimizer,
            learning_rate,
        })
    }

    pub fn convert(&self) -> &ConvertNetwork<B> {
        &self.convert
    }

    pub fn heads(&self) -> &LossHeads {
        &self.heads
    }

    /// Predicted activations, one per head in head order.
    pub fn forward(&self, images: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let generated = self.convert.forward(images);
        let styles = self.style_extractor.extract(generated.clone());
        let contents = self.content_extractor.extract(generated);

        self.heads
            .iter()
            .map(|head| match head.kind {
                HeadKind::Style(index) => styles[index].clone(),
                HeadKind::Content(index) => contents[index].clone(),
            })
            .collect()
    }

    /// Per-head losses, each of shape `[batch]`.
    pub fn losses(&self, images: Tensor<B, 4>, targets: Vec<Tensor<B, 4>>) -> Result<Vec<Tensor<B, 1>>> {
        if targets.len() != self.heads.len() {
            return Err(Error::HeadMismatch(format!(
                "{} targets for {} loss heads",
                targets.len(),
                self.heads.len()
            )));
        }

        Ok(self
            .forward(images)
            .into_iter()
            .zip(targets)
            .zip(self.heads.iter())
            .map(|((pred, target), head)| head.loss(pred, target))
            .collect())
    }

    /// One optimization step on `batch`.
    pub fn train_step(&mut self, batch: StyleBatch<B>) -> Result<StepLosses> {
        let losses = self.losses(batch.images, batch.targets)?;

        let mut heads = Vec::with_capacity(losses.len());
        let mut objective = None;

        for (loss, head) in losses.into_iter().zip(self.heads.iter()) {
            let loss = loss.mean();
            heads.push((head.name.clone(), loss.clone().into_scalar().elem::<f32>()));

            let weighted = loss * head.weight;
            objective = Some(match objective {
                Some(total) => total + weighted,
                None => weighted,
            });
        }

        let objective: Tensor<B, 1> = objective.ok_or_else(|| Error::HeadMismatch("no loss heads".into()))?;
        let total = objective.clone().into_scalar().elem::<f32>();

        let grads = objective.backward();
        let grads = GradientsParams::from_grads(grads, &self.convert);
        self.convert = self
            .optimizer
            .step(self.learning_rate, self.convert.clone(), grads);

        debug!(total, ?heads, "train step");

        Ok(StepLosses { total, heads })
    }

    /// Restyles a single image with the current weights, outside the autodiff graph.
    pub fn render(&self, image: ContentImage) -> Result<RgbImage> {
        let convert = self.convert.valid();
        let device = convert.devices().into_iter().next().unwrap_or_default();
        let batcher = ImageBatcher::<B::InnerBackend>::new(device);

        let output = convert.forward(batcher.batch(vec![image]));
        let [_, channels, height, width] = output.dims();

        tensor_to_image(output.reshape([channels, height, width]))
    }
}
