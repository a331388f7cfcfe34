use burn::{module::Module, nn::conv::Conv2d, prelude::*, tensor::activation::relu};
use nn::{conv::Conv2dConfig, BatchNorm, BatchNormConfig, PaddingConfig2d};

#[derive(Module, Debug)]
pub struct Conv2dNorm<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
    activate: bool,
}

impl<B: Backend> Conv2dNorm<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.norm.forward(x);

        if self.activate {
            relu(x)
        } else {
            x
        }
    }
}

#[derive(Config, Debug)]
pub struct Conv2dNormConfig {
    channels: [usize; 2],

    kernel_size: [usize; 2],

    #[config(default = "[1, 1]")]
    stride: [usize; 2],

    #[config(default = true)]
    activate: bool,
}

impl Conv2dNormConfig {
    /// Same-size convolution for stride 1 and odd kernels.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Conv2dNorm<B> {
        let [kernel_h, kernel_w] = self.kernel_size;

        Conv2dNorm {
            conv: Conv2dConfig::new(self.channels, self.kernel_size)
                .with_stride(self.stride)
                .with_padding(PaddingConfig2d::Explicit(kernel_h / 2, kernel_w / 2))
                .with_bias(false)
                .init(device),
            norm: BatchNormConfig::new(self.channels[1]).init(device),
            activate: self.activate,
        }
    }
}
