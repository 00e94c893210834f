//! Camera-side calibration for piano recordings.
//!
//! - [`calibrate`] / [`calibrate_from_detections`]: intrinsics and lens
//!   distortion from images of a planar checkerboard.
//! - [`estimate_orientation`]: checks how the camera is mounted relative to
//!   the keyboard and returns the quarter-turn/flip that normalizes frames.
//!
//! Corner detection is pluggable through [`CornerDetector`]. With the `chess`
//! feature, [`ChessGridDetector`] detects boards in real images.

mod calibrate;
#[cfg(feature = "chess")]
mod chess;
mod detection;
mod error;
mod orientation;
mod params;

pub use calibrate::{
    calibrate, calibrate_from_detections, CalibrationSummary, CameraCalibration, SkippedView,
    ViewCalibration,
};
#[cfg(feature = "chess")]
pub use chess::{default_chess_config, ChessGridDetector};
pub use detection::{detect_all, validate_corners, CornerDetector, ViewDetection};
pub use error::{CalibrateError, CornerDetectionError, OrientationError};
pub use orientation::{
    apply_correction, estimate_orientation, BlackKeyBand, HandSidedness, OrientationCorrection,
    OrientationEstimate, OrientationMetadata, QuarterTurn,
};
pub use params::{CheckerboardParams, OrientationParams, PatternSize};
