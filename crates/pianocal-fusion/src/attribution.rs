//! Which landmarks are playing each sounding note.
//!
//! For every landmark instant of a fused timeline and every pitch sounding
//! at that instant, the candidate landmarks (fingertips by default) are
//! compared against the key's outline. Distances are measured on the
//! keyboard plane in millimetres, so the result does not depend on camera
//! perspective.

use crate::FusedSample;
use nalgebra::Point2;
use pianocal_core::piano;
use pianocal_keyboard::KeyboardFrame;
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Fingertip ids of the 21-point hand model (thumb to little finger).
pub const FINGERTIP_IDS: [u32; 5] = [4, 8, 12, 16, 20];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributionParams {
    /// Landmark ids that can press a key; empty admits every landmark.
    pub candidate_ids: Vec<u32>,
}

impl Default for AttributionParams {
    fn default() -> Self {
        Self {
            candidate_ids: FINGERTIP_IDS.to_vec(),
        }
    }
}

impl AttributionParams {
    fn admits(&self, landmark_id: u32) -> bool {
        self.candidate_ids.is_empty() || self.candidate_ids.contains(&landmark_id)
    }
}

/// Position within a key's bounding box: `u` from its left (0) to right (1)
/// side, `v` from the back edge (0) to the front (1). Values outside `[0, 1]`
/// lie off the key.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyPosition {
    pub u: f64,
    pub v: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NoteAttribution {
    pub timestamp: f64,
    pub pitch: u8,
    pub velocity: u8,
    pub key_index: usize,
    /// Landmarks on the key, deepest inside first; otherwise the single
    /// nearest landmark.
    pub landmark_ids: Vec<u32>,
    pub on_key: bool,
    /// Where the first of `landmark_ids` sits on the key.
    pub position: KeyPosition,
}

fn to_mm(keyspace_x: f64, keyspace_y: f64) -> Point2<f64> {
    Point2::new(
        keyspace_x * piano::KEYBOARD_WIDTH,
        keyspace_y * piano::WHITE_KEY_LENGTH,
    )
}

fn segment_distance(p: Point2<f64>, a: Point2<f64>, b: Point2<f64>) -> f64 {
    let ab = b - a;
    let len2 = ab.norm_squared();
    let t = if len2 > 0.0 {
        ((p - a).dot(&ab) / len2).clamp(0.0, 1.0)
    } else {
        0.0
    };
    (p - (a + ab * t)).norm()
}

/// Distance to the outline, negative inside the polygon.
fn signed_distance(p: Point2<f64>, outline: &[Point2<f64>]) -> f64 {
    let mut distance = f64::INFINITY;
    let mut inside = false;
    for (i, &a) in outline.iter().enumerate() {
        let b = outline[(i + 1) % outline.len()];
        distance = distance.min(segment_distance(p, a, b));
        if (a.y > p.y) != (b.y > p.y) && p.x < a.x + (p.y - a.y) * (b.x - a.x) / (b.y - a.y) {
            inside = !inside;
        }
    }
    if inside {
        -distance
    } else {
        distance
    }
}

fn key_position(p: Point2<f64>, outline: &[Point2<f64>]) -> KeyPosition {
    let (mut lo, mut hi) = (p, p);
    if let Some(first) = outline.first() {
        (lo, hi) = (*first, *first);
    }
    for q in outline {
        lo = Point2::new(lo.x.min(q.x), lo.y.min(q.y));
        hi = Point2::new(hi.x.max(q.x), hi.y.max(q.y));
    }
    let span = hi - lo;
    KeyPosition {
        u: if span.x > 0.0 { (p.x - lo.x) / span.x } else { 0.5 },
        v: if span.y > 0.0 { (p.y - lo.y) / span.y } else { 0.5 },
    }
}

fn attribute(
    instant: &[&FusedSample],
    pitch: u8,
    velocity: u8,
    frame: &KeyboardFrame,
) -> Option<NoteAttribution> {
    let key_index = piano::key_of_pitch(pitch)?;
    let outline = piano::key_outline_mm(key_index, frame.black_key_length())?;

    let mut ranked: Vec<(u32, f64, Point2<f64>)> = instant
        .iter()
        .map(|s| {
            let p = to_mm(s.keyspace_x, s.keyspace_y);
            (s.landmark_id, signed_distance(p, &outline), p)
        })
        .collect();
    ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
    let &(_, nearest, at) = ranked.first()?;

    let on_key = nearest <= 0.0;
    let landmark_ids = if on_key {
        ranked
            .iter()
            .take_while(|r| r.1 <= 0.0)
            .map(|r| r.0)
            .collect()
    } else {
        vec![ranked[0].0]
    };
    Some(NoteAttribution {
        timestamp: instant[0].timestamp,
        pitch,
        velocity,
        key_index,
        landmark_ids,
        on_key,
        position: key_position(at, &outline),
    })
}

/// Attribute every sounding note of a fused timeline to the candidate
/// landmarks seen at the same instant.
///
/// Pitches outside the 88-key range and instants without a candidate
/// landmark produce nothing.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "info", skip_all, fields(samples = fused.len()))
)]
pub fn attribute_notes(
    fused: &[FusedSample],
    frame: &KeyboardFrame,
    params: &AttributionParams,
) -> Vec<NoteAttribution> {
    let mut out = Vec::new();
    for instant in fused.chunk_by(|a, b| a.timestamp == b.timestamp) {
        let candidates: Vec<&FusedSample> =
            instant.iter().filter(|s| params.admits(s.landmark_id)).collect();
        let Some(first) = candidates.first() else {
            continue;
        };
        for (&pitch, &velocity) in &first.active_notes {
            out.extend(attribute(&candidates, pitch, velocity, frame));
        }
    }
    log::info!(
        "attributed {} note instants ({} off-key fallbacks)",
        out.len(),
        out.iter().filter(|a| !a.on_key).count()
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use pianocal_keyboard::KeyboardCorners;
    use std::collections::BTreeMap;

    const MIDDLE_C: u8 = 60;

    fn frame() -> KeyboardFrame {
        let corners = KeyboardCorners::new(
            Point2::new(10.0, 10.0),
            Point2::new(110.0, 10.0),
            Point2::new(10.0, 60.0),
            Point2::new(110.0, 60.0),
            20.0,
        )
        .expect("valid corners");
        KeyboardFrame::build(&corners, None).expect("frame")
    }

    /// Keyspace `x` halfway across the back of middle C.
    fn middle_c_x(frame: &KeyboardFrame) -> f64 {
        let key = piano::key_of_pitch(MIDDLE_C).expect("on keyboard");
        let b = frame.boundaries();
        0.5 * (b[key] + b[key + 1])
    }

    fn sample(timestamp: f64, landmark_id: u32, x: f64, y: f64) -> FusedSample {
        FusedSample {
            timestamp,
            landmark_id,
            keyspace_x: x,
            keyspace_y: y,
            key_index: None,
            active_notes: BTreeMap::from([(MIDDLE_C, 90)]),
        }
    }

    #[test]
    fn fingertips_on_the_key_are_ranked_by_depth() {
        let frame = frame();
        let x = middle_c_x(&frame);
        let fused = [
            sample(1.0, 0, x, 0.05),
            sample(1.0, 12, x, 0.02),
            sample(1.0, 8, x, 0.05),
            sample(1.0, 20, 0.9, 0.5),
        ];
        let notes = attribute_notes(&fused, &frame, &AttributionParams::default());

        assert_eq!(notes.len(), 1);
        let note = &notes[0];
        assert_eq!((note.pitch, note.velocity, note.key_index), (MIDDLE_C, 90, 39));
        assert!(note.on_key);
        assert_eq!(note.landmark_ids, vec![8, 12]);
        assert!(note.position.u > 0.0 && note.position.u < 1.0);
        assert_relative_eq!(note.position.v, 0.05, epsilon = 1e-9);
    }

    #[test]
    fn nearest_fingertip_is_used_when_none_is_on_the_key() {
        let frame = frame();
        let left_of_c = frame.boundaries()[39] - 0.02;
        let fused = [sample(2.0, 4, left_of_c, 0.05), sample(2.0, 16, 0.9, 0.05)];
        let notes = attribute_notes(&fused, &frame, &AttributionParams::default());

        assert_eq!(notes.len(), 1);
        assert!(!notes[0].on_key);
        assert_eq!(notes[0].landmark_ids, vec![4]);
        assert!(notes[0].position.u < 0.0);
    }

    #[test]
    fn empty_candidate_list_admits_every_landmark() {
        let frame = frame();
        let fused = [sample(1.0, 0, middle_c_x(&frame), 0.05)];
        assert!(attribute_notes(&fused, &frame, &AttributionParams::default()).is_empty());

        let all = AttributionParams {
            candidate_ids: Vec::new(),
        };
        let notes = attribute_notes(&fused, &frame, &all);
        assert_eq!(notes[0].landmark_ids, vec![0]);
    }

    #[test]
    fn each_instant_and_sounding_pitch_is_attributed() {
        let frame = frame();
        let x = middle_c_x(&frame);
        let mut chord = sample(1.0, 8, x, 0.05);
        chord.active_notes = BTreeMap::from([(10, 50), (MIDDLE_C, 90), (64, 70)]);
        let mut silent = sample(2.0, 8, x, 0.05);
        silent.active_notes.clear();
        let fused = [chord, silent, sample(3.0, 8, x, 0.05)];

        let notes = attribute_notes(&fused, &frame, &AttributionParams::default());
        let seen: Vec<(f64, u8)> = notes.iter().map(|n| (n.timestamp, n.pitch)).collect();
        // Pitch 10 is below A0.
        assert_eq!(seen, vec![(1.0, MIDDLE_C), (1.0, 64), (3.0, MIDDLE_C)]);
    }

    #[test]
    fn signed_distance_is_negative_inside() {
        let square = [
            Point2::new(0.0, 0.0),
            Point2::new(0.0, 10.0),
            Point2::new(10.0, 10.0),
            Point2::new(10.0, 0.0),
        ];
        assert_relative_eq!(signed_distance(Point2::new(3.0, 5.0), &square), -3.0);
        assert_relative_eq!(signed_distance(Point2::new(13.0, 5.0), &square), 3.0);
    }
}
