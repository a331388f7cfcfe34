use std::{fs, path::Path};

use burn::{
    module::Param,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        PaddingConfig2d,
    },
    prelude::*,
    tensor::activation::relu,
};
use safetensors::{tensor::Dtype, SafeTensors};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    data::ImageShape,
    error::{Error, Result},
};

/// Normalization the torchvision ImageNet weights were trained with, on `0..=1` RGB.
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

const VGG16_BLOCKS: [[usize; 2]; 4] = [
    // c = output channels; n = conv layers
    // c, n
    [64, 2],
    [128, 2],
    [256, 3],
    [512, 3],
];

/// Activation maps the backbone can expose, named after the last conv of each block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VggLayer {
    Block1Conv2,
    Block2Conv2,
    Block3Conv3,
    Block4Conv3,
}

impl VggLayer {
    fn block(self) -> usize {
        match self {
            VggLayer::Block1Conv2 => 0,
            VggLayer::Block2Conv2 => 1,
            VggLayer::Block3Conv3 => 2,
            VggLayer::Block4Conv3 => 3,
        }
    }

    pub fn channels(self) -> usize {
        VGG16_BLOCKS[self.block()][0]
    }

    pub fn name(self) -> &'static str {
        match self {
            VggLayer::Block1Conv2 => "block1_conv2",
            VggLayer::Block2Conv2 => "block2_conv2",
            VggLayer::Block3Conv3 => "block3_conv3",
            VggLayer::Block4Conv3 => "block4_conv3",
        }
    }
}

#[derive(Module, Debug)]
struct VggBlock<B: Backend> {
    convs: Vec<Conv2d<B>>,
}

impl<B: Backend> VggBlock<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.convs
            .iter()
            .fold(x, |x, conv| relu(conv.forward(x)))
    }
}

/// VGG16 convolution trunk, blocks 1 to 4. Block 5 is never tapped.
#[derive(Module, Debug)]
pub struct Vgg16Features<B: Backend> {
    blocks: Vec<VggBlock<B>>,
    pool: MaxPool2d,
}

impl<B: Backend> Vgg16Features<B> {
    pub fn new(device: &B::Device) -> Self {
        Self::with_blocks(&VGG16_BLOCKS, device)
    }

    fn with_blocks(settings: &[[usize; 2]], device: &B::Device) -> Self {
        let mut input_channel = 3;
        let mut blocks = vec![];

        for &[c, n] in settings {
            let convs = (0..n)
                .map(|i| {
                    let channels = if i == 0 { [input_channel, c] } else { [c, c] };
                    Conv2dConfig::new(channels, [3, 3])
                        .with_padding(PaddingConfig2d::Explicit(1, 1))
                        .init(device)
                })
                .collect();
            input_channel = c;

            blocks.push(VggBlock { convs });
        }

        Self {
            blocks,
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    /// Builds the backbone, loads pretrained weights when given, and freezes it.
    ///
    /// `weights` is a safetensors export of torchvision's `vgg16` (for example
    /// `timm/vgg16.tv_in1k`), keyed `features.{index}.weight` / `features.{index}.bias`.
    pub fn load(weights: Option<&Path>, device: &B::Device) -> Result<Self> {
        let backbone = Self::new(device);

        let backbone = match weights {
            Some(path) => {
                info!(path = %path.display(), "loading backbone weights");
                backbone.load_torchvision(path, device)?
            }
            None => {
                warn!("no backbone weights configured, features come from a random VGG16");
                backbone
            }
        };

        Ok(backbone.no_grad())
    }

    /// Copies conv weights from a torchvision-layout safetensors file.
    ///
    /// torchvision numbers `features` sequentially: every conv is followed by its ReLU
    /// and every block by a max pool, so block 2 starts at index 5.
    fn load_torchvision(mut self, path: &Path, device: &B::Device) -> Result<Self> {
        let bytes = fs::read(path)?;
        let tensors = SafeTensors::deserialize(&bytes)?;

        let mut index = 0;
        let mut loaded = 0;
        for block in self.blocks.iter_mut() {
            for conv in block.convs.iter_mut() {
                let [channels, ..] = conv.weight.dims();
                let weight = read_tensor::<B, 4>(
                    &tensors,
                    &format!("features.{index}.weight"),
                    conv.weight.dims(),
                    device,
                )?;
                let bias = read_tensor::<B, 1>(&tensors, &format!("features.{index}.bias"), [channels], device)?;

                conv.weight = Param::from_tensor(weight);
                conv.bias = Some(Param::from_tensor(bias));
                loaded += 1;
                index += 2;
            }
            index += 1;
        }
        debug!(convs = loaded, "copied backbone weights");

        Ok(self)
    }

    /// Runs the trunk up to the deepest requested layer and returns one map per tap, in tap order.
    pub fn forward_taps(&self, x: Tensor<B, 4>, taps: &[VggLayer]) -> Vec<Tensor<B, 4>> {
        let Some(deepest) = taps.iter().map(|tap| tap.block()).max() else {
            return vec![];
        };

        let device = x.device();
        let mean = Tensor::<B, 1>::from_floats(IMAGENET_MEAN, &device).reshape([1, 3, 1, 1]);
        let std = Tensor::<B, 1>::from_floats(IMAGENET_STD, &device).reshape([1, 3, 1, 1]);
        let mut x = (x / 255.0 - mean) / std;
        let mut activations = vec![None; taps.len()];

        for (index, block) in self.blocks.iter().enumerate().take(deepest + 1) {
            if index > 0 {
                x = self.pool.forward(x);
            }
            x = block.forward(x);

            for (slot, tap) in activations.iter_mut().zip(taps) {
                if tap.block() == index {
                    *slot = Some(x.clone());
                }
            }
        }

        activations.into_iter().flatten().collect()
    }
}

fn read_tensor<B: Backend, const D: usize>(
    tensors: &SafeTensors,
    name: &str,
    shape: [usize; D],
    device: &B::Device,
) -> Result<Tensor<B, D>> {
    let view = tensors.tensor(name)?;
    let incompatible = |reason: String| Error::Weight {
        name: name.to_string(),
        reason,
    };

    if view.dtype() != Dtype::F32 {
        return Err(incompatible(format!("expected F32, got {:?}", view.dtype())));
    }
    if view.shape() != shape.as_slice() {
        return Err(incompatible(format!("expected shape {shape:?}, got {:?}", view.shape())));
    }

    let values: Vec<f32> = view
        .data()
        .chunks_exact(4)
        .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        .collect();

    Ok(Tensor::from_data(TensorData::new(values, shape), device))
}

/// Frozen backbone plus the ordered list of layers it reports.
#[derive(Debug, Clone)]
pub struct FeatureExtractor<B: Backend> {
    backbone: Vgg16Features<B>,
    taps: Vec<VggLayer>,
}

impl<B: Backend> FeatureExtractor<B> {
    pub fn new(backbone: Vgg16Features<B>, taps: Vec<VggLayer>) -> Self {
        Self { backbone, taps }
    }

    pub fn taps(&self) -> &[VggLayer] {
        &self.taps
    }

    pub fn extract(&self, x: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        self.backbone.forward_taps(x, &self.taps)
    }

    /// `[channels, height, width]` of every tap for inputs of `shape`.
    pub fn output_dims(&self, shape: &ImageShape) -> Vec<[usize; 3]> {
        self.taps
            .iter()
            .map(|tap| {
                let scale = 1 << tap.block();
                [tap.channels(), shape.height / scale, shape.width / scale]
            })
            .collect()
    }
}
