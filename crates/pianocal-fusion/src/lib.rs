//! Time-aligned fusion of hand landmarks and MIDI in keyboard space.
//!
//! - [`NoteState`]: per-pitch note state machine that normalizes retriggers
//!   into explicit off/on pairs.
//! - [`fuse`]: maps landmark samples into keyspace and attaches the notes
//!   sounding at the nearest MIDI instant.
//! - [`attribute_notes`]: links each sounding note to the fingertips on (or
//!   nearest to) its key.

mod attribution;
mod error;
mod fusion;
mod normalizer;

pub use attribution::{
    attribute_notes, AttributionParams, KeyPosition, NoteAttribution, FINGERTIP_IDS,
};
pub use error::{FusionError, Stream};
pub use fusion::{
    fuse, FusedSample, FusionParams, LandmarkPoint, LandmarkSample, MidiEvent, DEFAULT_TOLERANCE,
};
pub use normalizer::{NoteEvent, NoteState, Transition, PITCH_COUNT};
