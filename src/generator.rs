use std::path::PathBuf;

use burn::{data::dataloader::batcher::Batcher, prelude::*};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use tracing::debug;

use crate::{
    data::{load_image, ImageBatcher, ImageShape},
    error::{Error, Result},
    loss::{HeadKind, LossHeads},
    vgg::FeatureExtractor,
};

/// Hands out shuffled batches of paths, one epoch after another.
pub struct EpochSampler {
    paths: Vec<PathBuf>,
    batch_size: usize,
    epoch_limit: Option<usize>,
    completed_epochs: usize,
    cursor: usize,
    in_epoch: bool,
    rng: StdRng,
}

impl EpochSampler {
    pub fn new(paths: Vec<PathBuf>, batch_size: usize, epoch_limit: Option<usize>, seed: u64) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::InvalidConfig("batch size must be positive".into()));
        }

        Ok(Self {
            paths,
            batch_size,
            epoch_limit,
            completed_epochs: 0,
            cursor: 0,
            in_epoch: false,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn batches_per_epoch(&self) -> usize {
        self.paths.len().div_ceil(self.batch_size)
    }

    pub fn completed_epochs(&self) -> usize {
        self.completed_epochs
    }

    /// Next slice of the current epoch; `None` once the epoch limit is reached.
    pub fn next_batch(&mut self) -> Option<Vec<PathBuf>> {
        if !self.in_epoch {
            if self.paths.is_empty() || self.epoch_limit.is_some_and(|limit| self.completed_epochs >= limit) {
                return None;
            }

            self.paths.shuffle(&mut self.rng);
            self.cursor = 0;
            self.in_epoch = true;
            debug!(epoch = self.completed_epochs + 1, "shuffled content images");
        }

        let start = self.cursor;
        let end = (start + self.batch_size).min(self.paths.len());
        self.cursor = end;

        if end == self.paths.len() {
            self.in_epoch = false;
            self.completed_epochs += 1;
        }

        Some(self.paths[start..end].to_vec())
    }
}

/// Style activations of the reference image, one `[1, C, H, W]` tensor per style tap.
#[derive(Debug, Clone)]
pub struct StyleTarget<B: Backend> {
    features: Vec<Tensor<B, 4>>,
}

impl<B: Backend> StyleTarget<B> {
    pub fn compute(extractor: &FeatureExtractor<B>, style_image: Tensor<B, 4>) -> Self {
        let features = extractor
            .extract(style_image)
            .into_iter()
            .map(|feature| feature.detach())
            .collect();

        Self { features }
    }

    pub fn features(&self) -> &[Tensor<B, 4>] {
        &self.features
    }

    /// Repeats every feature along the batch axis.
    pub fn replicate(&self, batch_size: usize) -> Vec<Tensor<B, 4>> {
        self.features
            .iter()
            .map(|feature| Tensor::cat(vec![feature.clone(); batch_size], 0))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct StyleBatch<B: Backend> {
    pub paths: Vec<PathBuf>,
    pub images: Tensor<B, 4>,
    /// One target per loss head, in head order.
    pub targets: Vec<Tensor<B, 4>>,
}

impl<B: Backend> StyleBatch<B> {
    pub fn batch_size(&self) -> usize {
        self.images.dims()[0]
    }
}

pub struct StyleBatchGenerator<B: Backend> {
    sampler: EpochSampler,
    shape: ImageShape,
    batcher: ImageBatcher<B>,
    style_target: StyleTarget<B>,
    content_extractor: FeatureExtractor<B>,
    heads: LossHeads,
}

impl<B: Backend> StyleBatchGenerator<B> {
    pub fn new(
        sampler: EpochSampler,
        shape: ImageShape,
        batcher: ImageBatcher<B>,
        style_target: StyleTarget<B>,
        content_extractor: FeatureExtractor<B>,
        heads: LossHeads,
    ) -> Self {
        Self {
            sampler,
            shape,
            batcher,
            style_target,
            content_extractor,
            heads,
        }
    }

    pub fn batches_per_epoch(&self) -> usize {
        self.sampler.batches_per_epoch()
    }

    pub fn completed_epochs(&self) -> usize {
        self.sampler.completed_epochs()
    }

    fn produce(&self, paths: Vec<PathBuf>) -> Result<StyleBatch<B>> {
        let shape = &self.shape;
        let images = paths
            .par_iter()
            .map(|path| load_image(path, shape))
            .collect::<Result<Vec<_>>>()?;

        let images = self.batcher.batch(images);
        let [batch_size, ..] = images.dims();

        let styles = self.style_target.replicate(batch_size);
        let contents: Vec<_> = self
            .content_extractor
            .extract(images.clone())
            .into_iter()
            .map(|feature| feature.detach())
            .collect();

        let targets = self
            .heads
            .iter()
            .map(|head| {
                let (features, index) = match head.kind {
                    HeadKind::Style(index) => (&styles, index),
                    HeadKind::Content(index) => (&contents, index),
                };
                features
                    .get(index)
                    .cloned()
                    .ok_or_else(|| Error::HeadMismatch(format!("no target for {}", head.name)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(StyleBatch {
            paths,
            images,
            targets,
        })
    }
}

impl<B: Backend> Iterator for StyleBatchGenerator<B> {
    type Item = Result<StyleBatch<B>>;

    fn next(&mut self) -> Option<Self::Item> {
        let paths = self.sampler.next_batch()?;

        Some(self.produce(paths))
    }
}
