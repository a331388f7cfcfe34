use std::{
    fs,
    path::{Path, PathBuf},
};

use burn::{data::dataloader::batcher::Batcher, prelude::*};
use image::{imageops::FilterType, ImageError, ImageReader, Rgb, RgbImage};

use crate::error::{Error, Result};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Spatial shape every image is resized to for a run.
#[derive(Config, Debug, PartialEq)]
pub struct ImageShape {
    #[config(default = 224)]
    pub height: usize,

    #[config(default = 224)]
    pub width: usize,

    #[config(default = 3)]
    pub channels: usize,
}

impl ImageShape {
    pub fn validate(&self) -> Result<()> {
        if self.channels != 3 {
            return Err(Error::InvalidConfig(format!(
                "only RGB images are supported, got {} channels",
                self.channels
            )));
        }

        if self.height == 0 || self.width == 0 || self.height % 8 != 0 || self.width % 8 != 0 {
            return Err(Error::InvalidConfig(format!(
                "image size must be a non-zero multiple of 8, got {}x{}",
                self.height, self.width
            )));
        }

        Ok(())
    }
}

/// Decoded image, channel-major (`[channel][row][column]`).
#[derive(Debug, Clone)]
pub struct ContentImage {
    pub pixels: Vec<u8>,
    pub height: usize,
    pub width: usize,
}

/// Lists the images directly inside `dir`, sorted by path.
pub fn discover_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<_> = fs::read_dir(dir)?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .and_then(|extension| extension.to_str())
                .is_some_and(|extension| {
                    IMAGE_EXTENSIONS
                        .iter()
                        .any(|known| extension.eq_ignore_ascii_case(known))
                })
        })
        .collect();

    if paths.is_empty() {
        return Err(Error::NoContentImages(dir.to_path_buf()));
    }

    paths.sort();
    Ok(paths)
}

pub fn load_image(path: &Path, shape: &ImageShape) -> Result<ContentImage> {
    let image_raw = ImageReader::open(path)
        .map_err(ImageError::from)
        .and_then(|reader| reader.decode())
        .map_err(|source| Error::Image {
            path: path.to_path_buf(),
            source,
        })?;

    let image_raw = image_raw.resize_exact(shape.width as u32, shape.height as u32, FilterType::Triangle);
    let image_raw = image_raw.to_rgb8();

    let plane = shape.height * shape.width;
    let mut pixels = vec![0; plane * 3];

    for (i, pixel) in image_raw.pixels().enumerate() {
        let [r, g, b] = pixel.0;
        pixels[i] = r;
        pixels[plane + i] = g;
        pixels[2 * plane + i] = b;
    }

    Ok(ContentImage {
        pixels,
        height: shape.height,
        width: shape.width,
    })
}

/// Converts a `[3, height, width]` tensor with values in `0..=255` back into an image.
pub fn tensor_to_image<B: Backend>(tensor: Tensor<B, 3>) -> Result<RgbImage> {
    let [channels, height, width] = tensor.dims();
    if channels != 3 {
        return Err(Error::InvalidConfig(format!(
            "expected an RGB tensor, got {channels} channels"
        )));
    }

    let values = tensor
        .clamp(0., 255.)
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| Error::TensorData(format!("{err:?}")))?;

    let plane = height * width;
    Ok(RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let i = y as usize * width + x as usize;
        Rgb([
            values[i].round() as u8,
            values[plane + i].round() as u8,
            values[2 * plane + i].round() as u8,
        ])
    }))
}

#[derive(Clone)]
pub struct ImageBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> ImageBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

impl<B: Backend> Batcher<ContentImage, Tensor<B, 4>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<ContentImage>) -> Tensor<B, 4> {
        let images = items
            .into_iter()
            .map(|item| {
                let shape = [1, 3, item.height, item.width];
                TensorData::new(item.pixels, shape).convert::<B::FloatElem>()
            })
            .map(|data| Tensor::<B, 4>::from_data(data, &self.device))
            .collect();

        Tensor::cat(images, 0)
    }
}
