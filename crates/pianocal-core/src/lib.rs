//! Core types and utilities for piano keyboard calibration.
//!
//! This crate is intentionally small and purely geometric. It does *not*
//! depend on any image decoder, corner detector or MIDI backend.
//!
//! - [`Homography`]: planar projective transforms (4-point and DLT estimation).
//! - [`CameraIntrinsics`] / [`Distortion`]: pinhole camera with Brown–Conrady lens model.
//! - [`Pose`]: rigid camera pose, recoverable from a plane homography.
//! - [`piano`]: the standard 88-key layout in physical millimetres.

mod camera;
mod homography;
mod image;
mod logger;
pub mod piano;
mod pose;

pub use camera::{CameraIntrinsics, Distortion};
pub use homography::{estimate_homography, homography_from_4pt, Homography};
pub use image::{GrayImage, GrayImageView};
pub use pose::{pose_from_homography, Pose};

#[cfg(feature = "tracing")]
pub use logger::init_tracing;

pub use logger::init_with_level;
