use std::{
    collections::VecDeque,
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use burn::{
    config::Config,
    data::dataloader::batcher::Batcher,
    module::Module,
    optim::{AdamConfig, Optimizer},
    record::CompactRecorder,
    tensor::backend::AutodiffBackend,
};
use chrono::Local;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    data::{discover_images, load_image, ContentImage, ImageBatcher, ImageShape},
    error::{Error, Result},
    generator::{EpochSampler, StyleBatchGenerator, StyleTarget},
    graph::StyleTransferGraph,
    loss::{LossConfig, LossHeads},
    model::{ConvertNetwork, ConvertNetworkConfig},
    vgg::{FeatureExtractor, Vgg16Features, VggLayer},
};

const STYLE_LAYERS: [VggLayer; 4] = [
    VggLayer::Block1Conv2,
    VggLayer::Block2Conv2,
    VggLayer::Block3Conv3,
    VggLayer::Block4Conv3,
];
const CONTENT_LAYER: VggLayer = VggLayer::Block3Conv3;

/// Extension `CompactRecorder` gives its files.
const CHECKPOINT_EXTENSION: &str = "mpk";

/// Steps kept in `TrainingSummary`'s per-step history.
const SUMMARY_WINDOW: usize = 1024;

#[derive(Config)]
pub struct TrainingConfig {
    pub artifact_dir: String,

    pub content_dir: String,

    pub style_image: String,

    pub test_image: String,

    pub convert: ConvertNetworkConfig,

    pub optimizer: AdamConfig,

    #[config(default = "LossConfig::new()")]
    pub loss: LossConfig,

    #[config(default = "ImageShape::new()")]
    pub image: ImageShape,

    /// torchvision VGG16 weights as safetensors; random features when unset.
    #[config(default = "None")]
    pub backbone_weights: Option<String>,

    #[config(default = 2)]
    pub batch_size: usize,

    /// Unset to train until interrupted.
    #[config(default = "Some(10)")]
    pub epoch_count: Option<usize>,

    /// Steps between checkpoints; one epoch when unset.
    #[config(default = "None")]
    pub checkpoint_period: Option<usize>,

    /// Steps between test renders; one epoch when unset.
    #[config(default = "None")]
    pub test_period: Option<usize>,

    #[config(default = 1.0e-3)]
    pub learning_rate: f64,

    #[config(default = 42)]
    pub seed: u64,
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        self.image.validate()?;

        let invalid = |message: &str| -> Result<()> { Err(Error::InvalidConfig(message.into())) };

        if self.batch_size == 0 {
            return invalid("batch size must be positive");
        }
        if self.epoch_count == Some(0) {
            return invalid("epoch count must be positive when set");
        }
        if self.checkpoint_period == Some(0) || self.test_period == Some(0) {
            return invalid("checkpoint and test periods must be positive when set");
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0. {
            return invalid("learning rate must be a positive number");
        }

        Ok(())
    }
}

/// Structure of the trained network, written once per run.
#[derive(Serialize)]
struct ModelDescriptor<'a> {
    convert: &'a ConvertNetworkConfig,
    parameters: usize,
    image: &'a ImageShape,
    style_layers: Vec<&'static str>,
    content_layer: &'static str,
    heads: &'a LossHeads,
}

#[derive(Debug)]
pub struct TrainingSummary {
    pub run_dir: PathBuf,
    pub steps: usize,
    pub images_seen: usize,
    /// Batch sizes of the most recent steps, oldest first.
    pub batch_sizes: VecDeque<usize>,
    /// Weighted total loss of the most recent steps, oldest first.
    pub losses: VecDeque<f32>,
    pub checkpoints: Vec<PathBuf>,
    pub interrupted: bool,
}

impl TrainingSummary {
    fn new(run_dir: PathBuf) -> Self {
        Self {
            run_dir,
            steps: 0,
            images_seen: 0,
            batch_sizes: VecDeque::with_capacity(SUMMARY_WINDOW),
            losses: VecDeque::with_capacity(SUMMARY_WINDOW),
            checkpoints: vec![],
            interrupted: false,
        }
    }

    /// Counts one finished step, dropping history older than `SUMMARY_WINDOW` steps.
    fn record(&mut self, batch_size: usize, loss: f32) {
        self.steps += 1;
        self.images_seen += batch_size;

        if self.losses.len() == SUMMARY_WINDOW {
            self.batch_sizes.pop_front();
            self.losses.pop_front();
        }
        self.batch_sizes.push_back(batch_size);
        self.losses.push_back(loss);
    }
}

fn create_run_dir(artifact_dir: &Path) -> Result<PathBuf> {
    let run_dir = artifact_dir.join(Local::now().format("%Y-%m-%d_%H-%M-%S").to_string());
    fs::create_dir_all(&run_dir)?;

    Ok(run_dir)
}

fn save_checkpoint<B: AutodiffBackend>(
    convert: &ConvertNetwork<B>,
    run_dir: &Path,
    step: usize,
    loss: f32,
) -> Result<PathBuf> {
    let path = run_dir.join(format!("step{step}_loss{loss:.6}.{CHECKPOINT_EXTENSION}"));
    convert.clone().save_file(path.clone(), &CompactRecorder::new())?;
    info!(step, loss, path = %path.display(), "saved checkpoint");

    Ok(path)
}

fn render_test<B, O>(
    graph: &StyleTransferGraph<B, O>,
    image: &ContentImage,
    path: PathBuf,
) -> Result<()>
where
    B: AutodiffBackend,
    O: Optimizer<ConvertNetwork<B>, B>,
{
    graph
        .render(image.clone())?
        .save(&path)
        .map_err(|source| Error::Image {
            path: path.clone(),
            source,
        })?;
    info!(path = %path.display(), "rendered test image");

    Ok(())
}

pub fn train<B: AutodiffBackend>(
    config: &TrainingConfig,
    device: B::Device,
    stop: &AtomicBool,
) -> Result<TrainingSummary> {
    config.validate()?;

    let run_dir = create_run_dir(Path::new(&config.artifact_dir))?;
    config.save(run_dir.join("config.json"))?;
    info!(run_dir = %run_dir.display(), "starting run");

    B::seed(config.seed);

    let backbone = Vgg16Features::<B>::load(config.backbone_weights.as_deref().map(Path::new), &device)?;
    let style_extractor = FeatureExtractor::new(backbone.clone(), STYLE_LAYERS.to_vec());
    let content_extractor = FeatureExtractor::new(backbone, vec![CONTENT_LAYER]);
    info!("built feature extractors");

    let batcher = ImageBatcher::<B>::new(device.clone());
    let style_image = load_image(Path::new(&config.style_image), &config.image)?;
    let style_target = StyleTarget::compute(&style_extractor, batcher.batch(vec![style_image]));
    info!(path = %config.style_image, "computed style target");

    let test_image = load_image(Path::new(&config.test_image), &config.image)?;
    let content_paths = discover_images(Path::new(&config.content_dir))?;
    info!(count = content_paths.len(), dir = %config.content_dir, "found content images");

    let heads = config.loss.heads(&STYLE_LAYERS, CONTENT_LAYER)?;
    let convert = config.convert.init::<B>(&device);

    let descriptor = ModelDescriptor {
        convert: &config.convert,
        parameters: convert.num_params(),
        image: &config.image,
        style_layers: STYLE_LAYERS.iter().map(|layer| layer.name()).collect(),
        content_layer: CONTENT_LAYER.name(),
        heads: &heads,
    };
    fs::write(run_dir.join("model.json"), serde_json::to_string_pretty(&descriptor)?)?;

    let mut graph = StyleTransferGraph::new(
        convert,
        style_extractor,
        content_extractor.clone(),
        heads.clone(),
        &style_target,
        &config.image,
        config.optimizer.init::<B, ConvertNetwork<B>>(),
        config.learning_rate,
    )?;
    info!(parameters = descriptor.parameters, "built training graph");

    let mut generator = StyleBatchGenerator::new(
        EpochSampler::new(content_paths, config.batch_size, config.epoch_count, config.seed)?,
        config.image.clone(),
        batcher,
        style_target,
        content_extractor,
        heads,
    );

    let batches_per_epoch = generator.batches_per_epoch();
    let checkpoint_period = config.checkpoint_period.unwrap_or(batches_per_epoch);
    let test_period = config.test_period.unwrap_or(batches_per_epoch);

    let progress = match config.epoch_count {
        Some(epochs) => ProgressBar::new((epochs * batches_per_epoch) as u64),
        None => ProgressBar::new_spinner(),
    };
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        progress.set_style(style.progress_chars("#>-"));
    }

    let mut summary = TrainingSummary::new(run_dir);

    info!(batches_per_epoch, checkpoint_period, test_period, "training");

    for batch in generator.by_ref() {
        let batch = batch?;
        let batch_size = batch.batch_size();

        let losses = graph.train_step(batch)?;
        summary.record(batch_size, losses.total);
        let step = summary.steps;
        progress.set_message(format!("loss {:.4}", losses.total));
        progress.inc(1);

        if step % batches_per_epoch == 0 {
            info!(epoch = step / batches_per_epoch, loss = losses.total, "finished epoch");
        }

        let mut saved = false;
        if step % checkpoint_period == 0 {
            let path = save_checkpoint(graph.convert(), &summary.run_dir, step, losses.total)?;
            summary.checkpoints.push(path);
            saved = true;
        }

        if step % test_period == 0 {
            let path = summary.run_dir.join(format!("test_step{step}.png"));
            render_test(&graph, &test_image, path)?;
        }

        if stop.load(Ordering::SeqCst) {
            warn!(step, "interrupted");
            if !saved {
                let path = save_checkpoint(graph.convert(), &summary.run_dir, step, losses.total)?;
                summary.checkpoints.push(path);
            }
            summary.interrupted = true;
            break;
        }
    }

    progress.finish_with_message("training complete");

    render_test(&graph, &test_image, summary.run_dir.join("test_final.png"))?;
    info!(
        steps = summary.steps,
        epochs = generator.completed_epochs(),
        "training finished"
    );

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use burn::backend::{Autodiff, NdArray};
    use tempfile::TempDir;

    use super::*;
    use crate::data::tests::write_images;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn config(root: &Path) -> TrainingConfig {
        for dir in ["contents", "style", "test"] {
            fs::create_dir_all(root.join(dir)).unwrap();
        }
        write_images(&root.join("contents"), 5, 20);
        let style = write_images(&root.join("style"), 1, 24).remove(0);
        let test = write_images(&root.join("test"), 1, 16).remove(0);

        TrainingConfig::new(
            root.join("artifact").display().to_string(),
            root.join("contents").display().to_string(),
            style.display().to_string(),
            test.display().to_string(),
            ConvertNetworkConfig::new()
                .with_base_channels(4)
                .with_residual_blocks(1),
            AdamConfig::new(),
        )
        .with_image(ImageShape::new().with_height(16).with_width(16))
        .with_batch_size(2)
        .with_epoch_count(Some(1))
    }

    fn checkpoint_loss(path: &Path) -> f32 {
        let name = path.file_name().unwrap().to_str().unwrap();
        let loss = name
            .split("_loss")
            .nth(1)
            .unwrap()
            .strip_suffix(".mpk")
            .unwrap();
        loss.parse().unwrap()
    }

    #[test]
    fn one_epoch_writes_a_checkpoint_at_the_epoch_boundary() {
        let root = TempDir::new().unwrap();
        let config = config(root.path());

        let summary = train::<TestBackend>(&config, Default::default(), &AtomicBool::new(false)).unwrap();

        assert_eq!(summary.steps, 3);
        assert_eq!(summary.images_seen, 5);
        assert_eq!(summary.batch_sizes, [2, 2, 1]);
        assert!(!summary.interrupted);
        assert_eq!(summary.checkpoints.len(), 1);

        let checkpoint = &summary.checkpoints[0];
        assert!(checkpoint.exists());
        let name = checkpoint.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("step3_loss"), "{name}");
        let loss = checkpoint_loss(checkpoint);
        assert!(loss.is_finite() && loss >= 0.0);

        for file in ["config.json", "model.json", "test_step3.png", "test_final.png"] {
            assert!(summary.run_dir.join(file).exists(), "missing {file}");
        }
    }

    #[test]
    fn interrupt_saves_a_checkpoint_and_stops() {
        let root = TempDir::new().unwrap();
        let config = config(root.path()).with_epoch_count(None);

        let summary = train::<TestBackend>(&config, Default::default(), &AtomicBool::new(true)).unwrap();

        assert!(summary.interrupted);
        assert_eq!(summary.steps, 1);
        assert_eq!(summary.checkpoints.len(), 1);
        assert!(summary.checkpoints[0].exists());
        assert!(summary.run_dir.join("test_final.png").exists());
    }

    #[test]
    fn independent_periods_are_respected() {
        let root = TempDir::new().unwrap();
        let config = config(root.path())
            .with_epoch_count(Some(2))
            .with_checkpoint_period(Some(2))
            .with_test_period(Some(4));

        let summary = train::<TestBackend>(&config, Default::default(), &AtomicBool::new(false)).unwrap();

        assert_eq!(summary.steps, 6);
        assert_eq!(summary.checkpoints.len(), 3);
        assert!(summary.run_dir.join("test_step4.png").exists());
        assert!(!summary.run_dir.join("test_step3.png").exists());
    }

    #[test]
    fn missing_content_images_abort_the_run() {
        let root = TempDir::new().unwrap();
        let config = config(root.path());
        fs::remove_dir_all(root.path().join("contents")).unwrap();
        fs::create_dir_all(root.path().join("contents")).unwrap();

        let result = train::<TestBackend>(&config, Default::default(), &AtomicBool::new(false));

        assert!(matches!(result, Err(Error::NoContentImages(_))));
    }

    #[test]
    fn summary_history_is_bounded() {
        let mut summary = TrainingSummary::new(PathBuf::from("run"));

        for step in 0..SUMMARY_WINDOW + 5 {
            summary.record(2, step as f32);
        }

        assert_eq!(summary.steps, SUMMARY_WINDOW + 5);
        assert_eq!(summary.images_seen, 2 * (SUMMARY_WINDOW + 5));
        assert_eq!(summary.losses.len(), SUMMARY_WINDOW);
        assert_eq!(summary.batch_sizes.len(), SUMMARY_WINDOW);
        assert_eq!(summary.losses.front(), Some(&5.0));
        assert_eq!(summary.losses.back(), Some(&((SUMMARY_WINDOW + 4) as f32)));
    }

    #[test]
    fn validate_rejects_zero_sizes() {
        let config = TrainingConfig::new(
            "artifact".into(),
            "contents".into(),
            "style.png".into(),
            "test.png".into(),
            ConvertNetworkConfig::new(),
            AdamConfig::new(),
        );

        assert!(config.validate().is_ok());
        assert!(config.clone().with_batch_size(0).validate().is_err());
        assert!(config.clone().with_epoch_count(Some(0)).validate().is_err());
        assert!(config.with_test_period(Some(0)).validate().is_err());
    }
}
