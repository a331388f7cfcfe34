use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use burn::{
    backend::{wgpu::WgpuDevice, Autodiff, Wgpu},
    optim::AdamConfig,
};
use style_transfer::{
    model::ConvertNetworkConfig,
    training::{train, TrainingConfig},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const ARTIFACT_DIR: &str = "model";
const CONTENT_DIR: &str = "img/contents";
const STYLE_IMAGE: &str = "img/style/style.jpg";
const TEST_IMAGE: &str = "img/test/test.jpg";
const BACKBONE_WEIGHTS: &str = "weights/vgg16.safetensors";

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    type Backend = Wgpu<f32, i32>;
    type AutodiffBackend = Autodiff<Backend>;

    let device = WgpuDevice::default();

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))?;
    }

    let config = TrainingConfig::new(
        ARTIFACT_DIR.into(),
        CONTENT_DIR.into(),
        STYLE_IMAGE.into(),
        TEST_IMAGE.into(),
        ConvertNetworkConfig::new(),
        AdamConfig::new(),
    )
    .with_backbone_weights(Some(BACKBONE_WEIGHTS.into()));

    let summary = train::<AutodiffBackend>(&config, device, &stop)?;

    info!(
        run_dir = %summary.run_dir.display(),
        steps = summary.steps,
        images = summary.images_seen,
        checkpoints = summary.checkpoints.len(),
        last_loss = summary.losses.back().copied().unwrap_or_default(),
        "done"
    );

    Ok(())
}
