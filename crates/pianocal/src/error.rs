use crate::ArtifactError;
use pianocal_camera::{CalibrateError, OrientationError};
use pianocal_fusion::FusionError;
use pianocal_keyboard::FrameError;

/// Errors produced by the facade helpers.
#[derive(thiserror::Error, Debug)]
pub enum PianocalError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Calibrate(#[from] CalibrateError),

    #[error(transparent)]
    Orientation(#[from] OrientationError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Fusion(#[from] FusionError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid grayscale image buffer length (expected {expected} bytes, got {got})")]
    InvalidGrayBuffer { expected: usize, got: usize },

    #[cfg(feature = "image")]
    #[error(transparent)]
    Image(#[from] image::ImageError),
}
