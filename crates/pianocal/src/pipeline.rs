//! End-to-end helpers over an [`ArtifactStore`].
//!
//! Each calibration step computes its result completely before publishing a
//! single artifact; a failing step leaves every published artifact as it was.
//! Fusion only reads the store.
//!
//! Orientation correction is applied to frames before any other step, so
//! checkerboard corners, keyboard corners and landmark pixels are all
//! expressed in the corrected frame.

use crate::{ArtifactStore, CameraParamsRecord, KeyboardRecord, PianocalError};
use pianocal_camera::{
    apply_correction, calibrate_from_detections, estimate_orientation, CameraCalibration,
    CheckerboardParams, OrientationError, OrientationMetadata, OrientationParams, ViewDetection,
};
use pianocal_core::{CameraIntrinsics, GrayImage, GrayImageView};
use pianocal_fusion::{
    attribute_notes, fuse, AttributionParams, FusedSample, FusionParams, LandmarkSample,
    MidiEvent, NoteAttribution,
};
use pianocal_keyboard::{KeyboardCorners, KeyboardFrame};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Calibrate from per-image corner detections and publish the camera
/// parameters.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "info", skip(store, detections, params), fields(images = detections.len()))
)]
pub fn calibrate_camera(
    store: &ArtifactStore,
    detections: &[ViewDetection],
    params: &CheckerboardParams,
    lens_setting: Option<&str>,
) -> Result<CameraCalibration, PianocalError> {
    let calibration = calibrate_from_detections(detections, params)?;
    publish_calibration(store, &calibration, lens_setting)?;
    Ok(calibration)
}

/// Detect boards in photos with the ChESS grid detector, calibrate and
/// publish the camera parameters.
#[cfg(feature = "chess")]
pub fn calibrate_camera_images(
    store: &ArtifactStore,
    images: &[(String, image::GrayImage)],
    params: &CheckerboardParams,
    lens_setting: Option<&str>,
) -> Result<CameraCalibration, PianocalError> {
    let detector = pianocal_camera::ChessGridDetector::default();
    let calibration = pianocal_camera::calibrate(&detector, images, params)?;
    publish_calibration(store, &calibration, lens_setting)?;
    Ok(calibration)
}

fn publish_calibration(
    store: &ArtifactStore,
    calibration: &CameraCalibration,
    lens_setting: Option<&str>,
) -> Result<(), PianocalError> {
    log::info!(
        "calibrated from {} images ({} skipped), rms {:.4} px",
        calibration.summary.used.len(),
        calibration.summary.skipped.len(),
        calibration.rms_error
    );
    let mut record = CameraParamsRecord::from_calibration(calibration);
    if let Some(lens) = lens_setting {
        record = record.with_lens_setting(lens);
    }
    store.publish(&record)?;
    Ok(())
}

/// Classify the camera mounting from one frame and publish the result.
///
/// An ambiguous frame publishes nothing and returns the error, unless the
/// operator accepts the raw frame as it is (`accept_identity`), in which case
/// an identity correction is published.
pub fn record_orientation(
    store: &ArtifactStore,
    view: &GrayImageView<'_>,
    params: &OrientationParams,
    accept_identity: bool,
) -> Result<OrientationMetadata, PianocalError> {
    let metadata = match estimate_orientation(view, params) {
        Ok(estimate) => estimate.metadata,
        Err(OrientationError::OrientationAmbiguous { reason }) if accept_identity => {
            log::warn!("orientation ambiguous ({reason}); continuing without correction");
            OrientationMetadata::identity()
        }
        Err(e) => return Err(e.into()),
    };
    store.publish(&metadata)?;
    Ok(metadata)
}

/// Published orientation, or no correction when none was recorded.
pub fn load_orientation(store: &ArtifactStore) -> Result<OrientationMetadata, PianocalError> {
    Ok(store
        .load_optional::<OrientationMetadata>()?
        .unwrap_or_else(OrientationMetadata::identity))
}

/// Apply the published orientation correction to a raw frame.
pub fn normalize_frame(
    store: &ArtifactStore,
    view: &GrayImageView<'_>,
) -> Result<GrayImage, PianocalError> {
    let correction = load_orientation(store)?.correction();
    Ok(apply_correction(view, correction))
}

/// Published camera intrinsics, if any. With `lens_setting`, the record is
/// checked against the camera's current focus/zoom first.
pub fn load_camera(
    store: &ArtifactStore,
    lens_setting: Option<&str>,
) -> Result<Option<CameraIntrinsics>, PianocalError> {
    let Some(record) = store.load_optional::<CameraParamsRecord>()? else {
        return Ok(None);
    };
    if let Some(current) = lens_setting {
        record.check_lens_setting(current)?;
    }
    Ok(Some(record.intrinsics()?))
}

/// Build the keyboard frame from marked corners and publish its geometry.
///
/// With `undistort`, the published camera parameters are required and the
/// frame works on undistorted pixels.
pub fn build_keyboard(
    store: &ArtifactStore,
    corners: &KeyboardCorners,
    undistort: bool,
) -> Result<KeyboardFrame, PianocalError> {
    let intrinsics = if undistort {
        Some(store.load::<CameraParamsRecord>()?.intrinsics()?)
    } else {
        None
    };
    let frame = KeyboardFrame::build(corners, intrinsics.as_ref())?;
    store.publish(&KeyboardRecord::from_frame(&frame))?;
    Ok(frame)
}

/// Rebuild the published keyboard frame together with the camera intrinsics
/// it needs.
pub fn load_keyboard(
    store: &ArtifactStore,
    lens_setting: Option<&str>,
) -> Result<(KeyboardFrame, Option<CameraIntrinsics>), PianocalError> {
    let record = store.load::<KeyboardRecord>()?;
    let intrinsics = load_camera(store, lens_setting)?;
    let frame = record.to_frame(intrinsics.as_ref())?;
    Ok((frame, intrinsics))
}

/// Fuse a recording's landmark and MIDI streams against the published
/// calibration.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "info", skip_all, fields(root = %store.root().display()))
)]
pub fn fuse_session(
    store: &ArtifactStore,
    landmarks: &[LandmarkSample],
    midi: &[MidiEvent],
    params: &FusionParams,
    lens_setting: Option<&str>,
) -> Result<Vec<FusedSample>, PianocalError> {
    let (frame, intrinsics) = load_keyboard(store, lens_setting)?;
    Ok(fuse(landmarks, midi, &frame, intrinsics.as_ref(), params)?)
}

/// Link the notes of a fused timeline to the landmarks playing them, using
/// the published keyboard.
pub fn attribute_session(
    store: &ArtifactStore,
    fused: &[FusedSample],
    params: &AttributionParams,
) -> Result<Vec<NoteAttribution>, PianocalError> {
    let record = store.load::<KeyboardRecord>()?;
    let corners = record.keyboard_corners()?;
    let frame = KeyboardFrame::build(&corners, None)?;
    Ok(attribute_notes(fused, &frame, params))
}
