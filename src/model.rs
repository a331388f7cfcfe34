use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        PaddingConfig2d,
    },
    prelude::*,
};

use crate::module::{
    conv2d_norm::{Conv2dNorm, Conv2dNormConfig},
    residual::{ResidualBlock, ResidualBlockConfig},
    upsample::{Upsample, UpsampleConfig},
};

const ENCODER_SETTINGS: [[usize; 3]; 3] = [
    // (m = channel multiplier of base_channels; k = kernel size; s = stride)
    // m, k, s
    [1, 9, 1],
    [2, 3, 2],
    [4, 3, 2],
];

/// Image-to-image network trained to restyle content images.
///
/// Takes and returns `[batch, 3, height, width]` pixels in `0..=255`; height and
/// width must be multiples of 4.
#[derive(Module, Debug)]
pub struct ConvertNetwork<B: Backend> {
    encoder: Vec<Conv2dNorm<B>>,
    residual_blocks: Vec<ResidualBlock<B>>,
    decoder: Vec<Upsample<B>>,
    output: Conv2d<B>,
}

impl<B: Backend> ConvertNetwork<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = x / 255.;

        let x = self
            .encoder
            .iter()
            .fold(x, |x, conv2d_norm| conv2d_norm.forward(x));
        let x = self
            .residual_blocks
            .iter()
            .fold(x, |x, residual_block| residual_block.forward(x));
        let x = self
            .decoder
            .iter()
            .fold(x, |x, upsample| upsample.forward(x));

        let x = self.output.forward(x);
        (x.tanh() + 1.) * 127.5
    }
}

#[derive(Config, Debug)]
pub struct ConvertNetworkConfig {
    #[config(default = 32)]
    pub base_channels: usize,

    #[config(default = 5)]
    pub residual_blocks: usize,
}

impl ConvertNetworkConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvertNetwork<B> {
        let mut input_channel = 3;
        let mut encoder = vec![];

        for [m, k, s] in ENCODER_SETTINGS {
            let c = self.base_channels * m;

            encoder.push(
                Conv2dNormConfig::new([input_channel, c], [k, k])
                    .with_stride([s, s])
                    .init(device),
            );
            input_channel = c;
        }

        let residual_blocks = (0..self.residual_blocks)
            .map(|_| ResidualBlockConfig::new(input_channel).init(device))
            .collect();

        let decoder = vec![
            UpsampleConfig::new([input_channel, self.base_channels * 2]).init(device),
            UpsampleConfig::new([self.base_channels * 2, self.base_channels]).init(device),
        ];

        let output = Conv2dConfig::new([self.base_channels, 3], [9, 9])
            .with_padding(PaddingConfig2d::Explicit(4, 4))
            .init(device);

        ConvertNetwork {
            encoder,
            residual_blocks,
            decoder,
            output,
        }
    }
}
