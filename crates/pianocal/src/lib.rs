//! High-level facade for the `pianocal-*` workspace.
//!
//! This crate provides:
//! - stable re-exports of the underlying crates
//! - the persisted calibration artifacts and an [`ArtifactStore`] that only
//!   ever exposes fully written files
//! - end-to-end helpers in [`pipeline`] that run one calibration step and
//!   publish its artifact, or fuse a recording against the stored artifacts
//!
//! ## Quickstart
//!
//! ```no_run
//! use pianocal::fusion::{FusionParams, LandmarkSample, MidiEvent};
//! use pianocal::{pipeline, read_json, ArtifactStore};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = ArtifactStore::new("session_01");
//! let landmarks: Vec<LandmarkSample> = read_json("landmarks.json")?;
//! let midi: Vec<MidiEvent> = read_json("midi.json")?;
//!
//! let timeline = pipeline::fuse_session(&store, &landmarks, &midi, &FusionParams::default(), None)?;
//! println!("{} fused samples", timeline.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## API map
//! - `pianocal::core`: homographies, camera model, poses, gray images, key layout.
//! - `pianocal::camera`: checkerboard calibration and camera-orientation checks.
//! - `pianocal::keyboard`: keyboard corners, keyspace frame and key lookup.
//! - `pianocal::fusion`: note normalizer, landmark/MIDI fusion and note attribution.
//! - `pianocal::io` (feature `image`): decode photos into gray images.

pub use pianocal_camera as camera;
pub use pianocal_core as core;
pub use pianocal_fusion as fusion;
pub use pianocal_keyboard as keyboard;

mod artifacts;
mod config;
mod error;
mod inputs;
pub mod pipeline;

#[cfg(feature = "image")]
pub mod io;

pub use artifacts::{
    read_json, write_json, Artifact, ArtifactError, ArtifactKind, ArtifactStore,
    CameraParamsRecord, KeyboardRecord, StagedArtifact,
};
pub use config::RunConfig;
pub use error::PianocalError;
pub use inputs::{load_corner_files, CornerFile};

pub use pianocal_camera::{CheckerboardParams, OrientationMetadata, OrientationParams};
pub use pianocal_fusion::{AttributionParams, FusedSample, FusionParams, NoteAttribution};
pub use pianocal_keyboard::{KeyboardCorners, KeyboardFrame};
