use burn::prelude::*;

use super::conv2d_norm::{Conv2dNorm, Conv2dNormConfig};

#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    pub expand: Conv2dNorm<B>,
    pub project: Conv2dNorm<B>,
}

impl<B: Backend> ResidualBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let original = x.clone();

        let x = self.expand.forward(x);
        let x = self.project.forward(x);

        original + x
    }
}

#[derive(Config, Debug)]
pub struct ResidualBlockConfig {
    pub channels: usize,
}

impl ResidualBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ResidualBlock<B> {
        ResidualBlock {
            expand: Conv2dNormConfig::new([self.channels, self.channels], [3, 3]).init(device),
            project: Conv2dNormConfig::new([self.channels, self.channels], [3, 3])
                .with_activate(false)
                .init(device),
        }
    }
}
