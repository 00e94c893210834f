//! Landmark/MIDI fusion into keyboard space.
//!
//! Landmarks and MIDI come from independent clocks. Each landmark sample is
//! mapped into keyspace and paired with the note state right after the MIDI
//! group (events sharing a timestamp) nearest in time, if one lies within the
//! tolerance window. The transform is a pure function of its inputs.

use crate::error::Stream;
use crate::{FusionError, NoteState};
use nalgebra::{Point2, Point3};
use pianocal_core::CameraIntrinsics;
use pianocal_keyboard::{KeyboardFrame, PixelSpace};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// One video-frame period at 30 fps.
pub const DEFAULT_TOLERANCE: f64 = 1.0 / 30.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionParams {
    /// Largest landmark/MIDI time offset, in seconds, that still pairs them.
    pub tolerance: f64,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

/// Raw MIDI input; velocity 0 is a note-off.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MidiEvent {
    pub timestamp: f64,
    pub pitch: u8,
    pub velocity: u8,
}

/// Landmark position: a raw image pixel or a 3D point in camera coordinates.
/// Serialized as a plain `[x, y]` or `[x, y, z]` array.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub enum LandmarkPoint {
    Pixel(Point2<f64>),
    Camera(Point3<f64>),
}

impl TryFrom<Vec<f64>> for LandmarkPoint {
    type Error = String;

    fn try_from(v: Vec<f64>) -> Result<Self, Self::Error> {
        match v.as_slice() {
            &[x, y] => Ok(Self::Pixel(Point2::new(x, y))),
            &[x, y, z] => Ok(Self::Camera(Point3::new(x, y, z))),
            other => Err(format!(
                "landmark point needs 2 or 3 coordinates, got {}",
                other.len()
            )),
        }
    }
}

impl From<LandmarkPoint> for Vec<f64> {
    fn from(p: LandmarkPoint) -> Self {
        match p {
            LandmarkPoint::Pixel(p) => vec![p.x, p.y],
            LandmarkPoint::Camera(p) => vec![p.x, p.y, p.z],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LandmarkSample {
    pub timestamp: f64,
    pub landmark_id: u32,
    pub point: LandmarkPoint,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FusedSample {
    pub timestamp: f64,
    pub landmark_id: u32,
    pub keyspace_x: f64,
    pub keyspace_y: f64,
    pub key_index: Option<usize>,
    /// Sounding pitch → velocity.
    pub active_notes: BTreeMap<u8, u8>,
}

/// Note state after each group of simultaneous MIDI events.
struct MidiTimeline {
    times: Vec<f64>,
    states: Vec<BTreeMap<u8, u8>>,
}

impl MidiTimeline {
    fn build(midi: &[MidiEvent]) -> Result<Self, FusionError> {
        let mut state = NoteState::new();
        let mut scratch = Vec::new();
        let mut times: Vec<f64> = Vec::new();
        let mut states = Vec::new();
        let mut previous = f64::NEG_INFINITY;

        for (index, e) in midi.iter().enumerate() {
            if !(e.timestamp >= previous) || !e.timestamp.is_finite() {
                return Err(FusionError::NonMonotonicTimestamp {
                    stream: Stream::Midi,
                    index,
                    previous,
                    current: e.timestamp,
                });
            }
            if index > 0 && e.timestamp > previous {
                states.push(state.snapshot());
            }
            if times.last() != Some(&e.timestamp) {
                times.push(e.timestamp);
            }
            state.apply(e.pitch, e.velocity, &mut scratch)?;
            previous = e.timestamp;
        }
        if !midi.is_empty() {
            states.push(state.snapshot());
        }
        Ok(Self { times, states })
    }

    /// State after the group nearest to `t` within `tolerance`; ties go to
    /// the earlier group.
    fn active_at(&self, t: f64, tolerance: f64) -> Option<&BTreeMap<u8, u8>> {
        let next = self.times.partition_point(|&g| g < t);
        let before = next.checked_sub(1).map(|i| (i, t - self.times[i]));
        let after = (next < self.times.len()).then(|| (next, self.times[next] - t));
        let (index, distance) = match (before, after) {
            (Some(b), Some(a)) => {
                if b.1 <= a.1 {
                    b
                } else {
                    a
                }
            }
            (Some(b), None) => b,
            (None, Some(a)) => a,
            (None, None) => return None,
        };
        (distance <= tolerance).then(|| &self.states[index])
    }
}

fn check_landmark_order(landmarks: &[LandmarkSample]) -> Result<(), FusionError> {
    let mut previous = f64::NEG_INFINITY;
    let mut ids_at_previous = HashSet::new();
    for (index, s) in landmarks.iter().enumerate() {
        let t = s.timestamp;
        if !(t >= previous) || !t.is_finite() {
            return Err(FusionError::NonMonotonicTimestamp {
                stream: Stream::Landmarks,
                index,
                previous,
                current: t,
            });
        }
        if t > previous {
            ids_at_previous.clear();
            previous = t;
        }
        if !ids_at_previous.insert(s.landmark_id) {
            // Same landmark twice at one instant.
            return Err(FusionError::NonMonotonicTimestamp {
                stream: Stream::Landmarks,
                index,
                previous,
                current: t,
            });
        }
    }
    Ok(())
}

/// Landmark position in the frame's pixel space, `None` for a camera-space
/// point that does not project (behind the camera).
fn frame_pixel(
    sample: &LandmarkSample,
    index: usize,
    frame: &KeyboardFrame,
    intrinsics: Option<&CameraIntrinsics>,
) -> Result<Option<Point2<f64>>, FusionError> {
    match (sample.point, frame.pixel_space()) {
        (LandmarkPoint::Pixel(p), PixelSpace::Raw) => Ok(Some(p)),
        (LandmarkPoint::Pixel(p), PixelSpace::Undistorted) => {
            let k = intrinsics.ok_or(FusionError::PixelSpaceMismatch {
                expected: PixelSpace::Undistorted,
                provided: PixelSpace::Raw,
            })?;
            Ok(Some(k.undistort_pixel(p)))
        }
        (LandmarkPoint::Camera(pc), space) => {
            let k = intrinsics.ok_or(FusionError::MissingIntrinsics { index })?;
            Ok(k.project_undistorted(&pc).map(|ideal| match space {
                PixelSpace::Raw => k.distort_pixel(ideal),
                PixelSpace::Undistorted => ideal,
            }))
        }
    }
}

/// Fuse time-ordered landmark and MIDI streams into keyboard space.
///
/// Pixel landmarks are raw camera pixels; they are undistorted when the
/// frame was built in undistorted pixel space, which requires `intrinsics`.
/// Camera-space landmarks are projected with `intrinsics`. A sample that
/// cannot be placed on the keyboard plane is dropped from the output and
/// counted in the run summary; the rest of the run is unaffected.
#[cfg_attr(
    feature = "tracing",
    instrument(
        level = "info",
        skip_all,
        fields(landmarks = landmarks.len(), midi = midi.len())
    )
)]
pub fn fuse(
    landmarks: &[LandmarkSample],
    midi: &[MidiEvent],
    frame: &KeyboardFrame,
    intrinsics: Option<&CameraIntrinsics>,
    params: &FusionParams,
) -> Result<Vec<FusedSample>, FusionError> {
    if frame.pixel_space() == PixelSpace::Undistorted && intrinsics.is_none() {
        return Err(FusionError::PixelSpaceMismatch {
            expected: PixelSpace::Undistorted,
            provided: PixelSpace::Raw,
        });
    }
    check_landmark_order(landmarks)?;
    let timeline = MidiTimeline::build(midi)?;
    let tolerance = params.tolerance.max(0.0);

    let mut out = Vec::with_capacity(landmarks.len());
    let mut unmatched = 0usize;
    let mut unmapped = 0usize;
    for (index, sample) in landmarks.iter().enumerate() {
        let keyspace =
            frame_pixel(sample, index, frame, intrinsics)?.and_then(|p| frame.to_keyspace(p));
        let Some(k) = keyspace else {
            log::debug!(
                "landmark {} at t={} (index {index}) does not map onto the keyboard plane",
                sample.landmark_id,
                sample.timestamp
            );
            unmapped += 1;
            continue;
        };
        let active_notes = match timeline.active_at(sample.timestamp, tolerance) {
            Some(state) => state.clone(),
            None => {
                unmatched += 1;
                BTreeMap::new()
            }
        };
        out.push(FusedSample {
            timestamp: sample.timestamp,
            landmark_id: sample.landmark_id,
            keyspace_x: k.x,
            keyspace_y: k.y,
            key_index: frame.key_at_keyspace(k),
            active_notes,
        });
    }
    log::info!(
        "fused {} landmark samples with {} MIDI events ({} without MIDI within {:.4}s, {} unmapped)",
        out.len(),
        midi.len(),
        unmatched,
        tolerance,
        unmapped
    );
    Ok(out)
}
