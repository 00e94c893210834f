//! Per-pitch note state machine.
//!
//! A pitch is either silent or sounding with a velocity. A note-on for a
//! pitch that is already sounding is split into an explicit off/on pair, so
//! consumers never see two consecutive note-ons for the same pitch.

use crate::FusionError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const PITCH_COUNT: usize = 128;

/// Normalized note event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoteEvent {
    On { pitch: u8, velocity: u8 },
    Off { pitch: u8 },
}

impl NoteEvent {
    pub fn pitch(&self) -> u8 {
        match *self {
            NoteEvent::On { pitch, .. } | NoteEvent::Off { pitch } => pitch,
        }
    }
}

/// What one input did to its pitch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Note-off for a silent pitch.
    Ignored,
    Started,
    Stopped,
    /// Note-on while sounding: emitted as off followed by on.
    Retriggered,
}

/// Sounding velocity per MIDI pitch. Owned by a single consumer; inputs
/// must be applied in receipt order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NoteState {
    velocities: [Option<u8>; PITCH_COUNT],
    sounding: usize,
}

impl Default for NoteState {
    fn default() -> Self {
        Self::new()
    }
}

impl NoteState {
    /// All pitches silent.
    pub fn new() -> Self {
        Self {
            velocities: [None; PITCH_COUNT],
            sounding: 0,
        }
    }

    pub fn velocity(&self, pitch: u8) -> Option<u8> {
        self.velocities.get(pitch as usize).copied().flatten()
    }

    pub fn is_sounding(&self, pitch: u8) -> bool {
        self.velocity(pitch).is_some()
    }

    pub fn is_silent(&self) -> bool {
        self.sounding == 0
    }

    pub fn sounding_count(&self) -> usize {
        self.sounding
    }

    /// Sounding `(pitch, velocity)` pairs in ascending pitch order.
    pub fn active(&self) -> impl Iterator<Item = (u8, u8)> + '_ {
        self.velocities
            .iter()
            .enumerate()
            .filter_map(|(p, v)| v.map(|v| (p as u8, v)))
    }

    pub fn snapshot(&self) -> BTreeMap<u8, u8> {
        self.active().collect()
    }

    /// Apply one raw `(pitch, velocity)` input, appending the normalized
    /// events to `out`. Velocity 0 means note-off.
    pub fn apply(
        &mut self,
        pitch: u8,
        velocity: u8,
        out: &mut Vec<NoteEvent>,
    ) -> Result<Transition, FusionError> {
        if pitch as usize >= PITCH_COUNT || velocity > 127 {
            return Err(FusionError::InvalidMidi { pitch, velocity });
        }
        let slot = &mut self.velocities[pitch as usize];
        let transition = match (*slot, velocity) {
            (None, 0) => Transition::Ignored,
            (Some(_), 0) => {
                out.push(NoteEvent::Off { pitch });
                *slot = None;
                self.sounding -= 1;
                Transition::Stopped
            }
            (None, v) => {
                out.push(NoteEvent::On { pitch, velocity: v });
                *slot = Some(v);
                self.sounding += 1;
                Transition::Started
            }
            (Some(_), v) => {
                out.push(NoteEvent::Off { pitch });
                out.push(NoteEvent::On { pitch, velocity: v });
                *slot = Some(v);
                Transition::Retriggered
            }
        };
        Ok(transition)
    }

    /// Apply a sequence of inputs in order. On error, inputs before the
    /// offending one stay applied.
    pub fn process<I>(&mut self, inputs: I) -> Result<Vec<NoteEvent>, FusionError>
    where
        I: IntoIterator<Item = (u8, u8)>,
    {
        let mut out = Vec::new();
        for (pitch, velocity) in inputs {
            self.apply(pitch, velocity, &mut out)?;
        }
        Ok(out)
    }

    /// Silence every sounding pitch, emitting one note-off each in ascending
    /// pitch order.
    pub fn reset(&mut self) -> Vec<NoteEvent> {
        let out: Vec<NoteEvent> = self
            .active()
            .map(|(pitch, _)| NoteEvent::Off { pitch })
            .collect();
        self.velocities = [None; PITCH_COUNT];
        self.sounding = 0;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn on(pitch: u8, velocity: u8) -> NoteEvent {
        NoteEvent::On { pitch, velocity }
    }

    fn off(pitch: u8) -> NoteEvent {
        NoteEvent::Off { pitch }
    }

    #[test]
    fn on_off_on_is_passed_through() {
        let mut state = NoteState::new();
        let events = state.process([(60, 100), (60, 0), (60, 90)]).expect("valid");
        assert_eq!(events, vec![on(60, 100), off(60), on(60, 90)]);
        assert_eq!(state.velocity(60), Some(90));
    }

    #[test]
    fn retrigger_without_off_is_split() {
        let mut state = NoteState::new();
        let events = state.process([(60, 100), (60, 80)]).expect("valid");
        assert_eq!(events, vec![on(60, 100), off(60), on(60, 80)]);
        assert_eq!(state.sounding_count(), 1);
    }

    #[test]
    fn note_off_for_silent_pitch_is_ignored() {
        let mut state = NoteState::new();
        let mut out = Vec::new();
        assert_eq!(state.apply(64, 0, &mut out), Ok(Transition::Ignored));
        assert!(out.is_empty());
        assert!(state.is_silent());
    }

    #[test]
    fn reset_releases_every_sounding_pitch_in_order() {
        let mut state = NoteState::new();
        state
            .process([(72, 50), (48, 60), (60, 70), (48, 0), (55, 20)])
            .expect("valid");
        assert_eq!(state.reset(), vec![off(55), off(60), off(72)]);
        assert!(state.is_silent());
        assert!(state.reset().is_empty());
    }

    #[test]
    fn out_of_range_input_is_rejected() {
        let mut state = NoteState::new();
        let mut out = Vec::new();
        assert_eq!(
            state.apply(128, 10, &mut out),
            Err(FusionError::InvalidMidi {
                pitch: 128,
                velocity: 10
            })
        );
        assert!(state.apply(60, 200, &mut out).is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn never_two_ons_in_a_row_for_a_pitch() {
        // Deterministic pseudo-random input sequence.
        let mut seed: u32 = 0x1234_5678;
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed
        };
        let inputs: Vec<(u8, u8)> = (0..2000)
            .map(|_| {
                let r = next();
                let pitch = 58 + (r % 6) as u8;
                let velocity = if (r >> 8) % 3 == 0 { 0 } else { ((r >> 16) % 127) as u8 + 1 };
                (pitch, velocity)
            })
            .collect();

        let mut state = NoteState::new();
        let mut events = state.process(inputs).expect("valid");
        let sounding_before_reset = state.sounding_count();
        let released = state.reset();
        assert_eq!(released.len(), sounding_before_reset);
        events.extend(released);

        let mut last_on = [false; PITCH_COUNT];
        for e in events {
            let p = e.pitch() as usize;
            match e {
                NoteEvent::On { .. } => {
                    assert!(!last_on[p], "two note-ons for pitch {p}");
                    last_on[p] = true;
                }
                NoteEvent::Off { .. } => {
                    assert!(last_on[p], "note-off for silent pitch {p}");
                    last_on[p] = false;
                }
            }
        }
        assert!(last_on.iter().all(|on| !on));
    }

    #[test]
    fn events_serialize_with_a_kind_tag() {
        let json = serde_json::to_string(&on(60, 100)).expect("serialize");
        assert_eq!(json, r#"{"kind":"on","pitch":60,"velocity":100}"#);
    }
}
