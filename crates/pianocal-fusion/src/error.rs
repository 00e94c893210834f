use pianocal_keyboard::PixelSpace;
use std::fmt;

/// Input stream of a fusion run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stream {
    Landmarks,
    Midi,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Landmarks => f.write_str("landmark"),
            Stream::Midi => f.write_str("MIDI"),
        }
    }
}

#[derive(thiserror::Error, Clone, Debug, PartialEq)]
pub enum FusionError {
    #[error("{stream} stream: timestamp {current} at index {index} does not follow {previous}")]
    NonMonotonicTimestamp {
        stream: Stream,
        index: usize,
        previous: f64,
        current: f64,
    },
    #[error("invalid MIDI event (pitch {pitch}, velocity {velocity})")]
    InvalidMidi { pitch: u8, velocity: u8 },
    #[error("keyboard frame expects {expected:?} pixels but landmarks are {provided:?}")]
    PixelSpaceMismatch {
        expected: PixelSpace,
        provided: PixelSpace,
    },
    #[error("landmark {index} is a camera-space point but no camera intrinsics were given")]
    MissingIntrinsics { index: usize },
}
