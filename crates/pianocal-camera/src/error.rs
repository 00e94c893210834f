use serde::{Deserialize, Serialize};

/// Why a single checkerboard image could not be used. Never fatal on its own:
/// the calibrator skips the image and records the reason.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CornerDetectionError {
    #[error("checkerboard not found")]
    NotFound,
    #[error("checkerboard not fully visible (expected {expected} corners, found {found})")]
    IncompleteGrid { expected: usize, found: usize },
    #[error("corner coordinates are not finite")]
    NonFinite,
    #[error("corner grid is degenerate (no plane homography)")]
    DegenerateView,
}

/// Errors returned by the checkerboard calibrator.
#[derive(thiserror::Error, Debug)]
pub enum CalibrateError {
    #[error("insufficient calibration data: {found} usable images, at least {required} required")]
    InsufficientCalibrationData { found: usize, required: usize },
    #[error("invalid checkerboard parameters: {0}")]
    InvalidParams(String),
    #[error("closed-form intrinsics estimate failed: {0}")]
    InitializationFailed(&'static str),
    #[error("refinement produced non-finite camera parameters")]
    NonFiniteResult,
}

/// Errors returned by the camera orientation estimator.
#[derive(thiserror::Error, Clone, Debug, PartialEq)]
pub enum OrientationError {
    #[error("keyboard orientation is ambiguous: {reason}")]
    OrientationAmbiguous { reason: String },
    #[error("invalid orientation image ({width}x{height})")]
    InvalidImage { width: usize, height: usize },
}

impl OrientationError {
    pub(crate) fn ambiguous(reason: impl Into<String>) -> Self {
        Self::OrientationAmbiguous {
            reason: reason.into(),
        }
    }
}
