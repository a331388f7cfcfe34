use std::path::PathBuf;

use burn::record::RecorderError;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to read image {}: {source}", path.display())]
    Image {
        path: PathBuf,
        source: image::ImageError,
    },

    #[error("recorder error: {0}")]
    Recorder(#[from] RecorderError),

    #[error("safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    /// A pretrained tensor has the wrong dtype or shape for the layer it feeds.
    #[error("incompatible weight {name}: {reason}")]
    Weight { name: String, reason: String },

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no content images found in {}", .0.display())]
    NoContentImages(PathBuf),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Loss heads do not line up with the extractor taps or the target list.
    #[error("loss head mismatch: {0}")]
    HeadMismatch(String),

    #[error("target shape mismatch for {head}: expected {expected:?}, got {got:?}")]
    TargetShape {
        head: String,
        expected: [usize; 4],
        got: [usize; 4],
    },

    #[error("failed to read tensor data: {0}")]
    TensorData(String),
}
