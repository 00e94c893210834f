//! Physical layout of a standard 88-key keyboard (A0..C8), in millimetres.
//!
//! The keyboard is split into two rows. In the back row (the black-key zone)
//! every key, white or black, owns a slot and the 88 slots tile the full
//! width. In the front row only the 52 white keys exist, all 23.6 mm wide.
//! Key index `i` is MIDI pitch `21 + i`.

use nalgebra::Point2;

pub const KEY_COUNT: usize = 88;
pub const WHITE_KEY_COUNT: usize = 52;
pub const LOWEST_PITCH: u8 = 21;
pub const HIGHEST_PITCH: u8 = 108;

pub const BLACK_WIDTH: f64 = 12.7;
pub const WHITE_FRONT_WIDTH: f64 = 23.6;
pub const KEYBOARD_WIDTH: f64 = WHITE_KEY_COUNT as f64 * WHITE_FRONT_WIDTH;
pub const WHITE_KEY_LENGTH: f64 = 145.0;
pub const DEFAULT_BLACK_KEY_LENGTH: f64 = 100.0;

// Back-row widths of the white keys, indexed by pitch class.
const C_TOP: f64 = 15.05;
const D_TOP: f64 = 15.3;
const E_TOP: f64 = 15.05;
const F_TOP: f64 = 13.95;
const G_TOP: f64 = 14.2;
const A_TOP: f64 = 14.2;
const B_TOP: f64 = 13.95;
// A0 has no black key to its left and absorbs half a black key.
const LOWEST_A_TOP: f64 = A_TOP + BLACK_WIDTH / 2.0;

const NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

#[inline]
pub fn is_black_pitch(pitch: u8) -> bool {
    matches!(pitch % 12, 1 | 3 | 6 | 8 | 10)
}

#[inline]
pub fn is_black_key(index: usize) -> bool {
    is_black_pitch(LOWEST_PITCH + index as u8)
}

/// MIDI pitch of key `index`, `None` outside `0..88`.
#[inline]
pub fn pitch_of_key(index: usize) -> Option<u8> {
    (index < KEY_COUNT).then(|| LOWEST_PITCH + index as u8)
}

/// Key index of a MIDI pitch, `None` when the pitch is not on the keyboard.
#[inline]
pub fn key_of_pitch(pitch: u8) -> Option<usize> {
    (LOWEST_PITCH..=HIGHEST_PITCH)
        .contains(&pitch)
        .then(|| (pitch - LOWEST_PITCH) as usize)
}

/// Scientific pitch name, e.g. `60 -> "C4"`.
pub fn pitch_name(pitch: u8) -> String {
    let octave = pitch as i32 / 12 - 1;
    format!("{}{}", NAMES[(pitch % 12) as usize], octave)
}

fn back_width(index: usize) -> f64 {
    let pitch = LOWEST_PITCH + index as u8;
    if pitch == LOWEST_PITCH {
        return LOWEST_A_TOP;
    }
    if pitch == HIGHEST_PITCH {
        return WHITE_FRONT_WIDTH;
    }
    match pitch % 12 {
        0 => C_TOP,
        2 => D_TOP,
        4 => E_TOP,
        5 => F_TOP,
        7 => G_TOP,
        9 => A_TOP,
        11 => B_TOP,
        _ => BLACK_WIDTH,
    }
}

/// The 89 back-row key edges in millimetres, from 0 to [`KEYBOARD_WIDTH`].
/// Key `i` spans `[edges[i], edges[i + 1]]`.
pub fn back_edges_mm() -> [f64; KEY_COUNT + 1] {
    let mut edges = [0.0; KEY_COUNT + 1];
    for i in 0..KEY_COUNT {
        edges[i + 1] = edges[i] + back_width(i);
    }
    edges
}

/// The 53 front-row white-key edges in millimetres.
pub fn front_edges_mm() -> [f64; WHITE_KEY_COUNT + 1] {
    std::array::from_fn(|i| i as f64 * WHITE_FRONT_WIDTH)
}

/// Back-row edges normalized to `[0, 1]`.
pub fn back_boundaries() -> [f64; KEY_COUNT + 1] {
    let mut edges = back_edges_mm();
    for e in edges.iter_mut() {
        *e /= KEYBOARD_WIDTH;
    }
    // Pin the ends so the partition covers exactly [0, 1].
    edges[0] = 0.0;
    edges[KEY_COUNT] = 1.0;
    edges
}

/// Front-row white-key edges normalized to `[0, 1]`.
pub fn front_boundaries() -> [f64; WHITE_KEY_COUNT + 1] {
    std::array::from_fn(|i| i as f64 / WHITE_KEY_COUNT as f64)
}

/// Number of white keys left of key `index`; for a white key this is its
/// position among the 52 white keys.
pub fn white_ordinal(index: usize) -> usize {
    (0..index.min(KEY_COUNT)).filter(|&i| !is_black_key(i)).count()
}

/// Key index of the `ordinal`-th white key.
pub fn white_key_index(ordinal: usize) -> Option<usize> {
    (0..KEY_COUNT)
        .filter(|&i| !is_black_key(i))
        .nth(ordinal)
}

/// Outline of key `index` in millimetres with `y = 0` at the back edge.
///
/// White keys are the 8-point "T"-like shape (narrow back part, full-width
/// front part below `black_key_length`); black keys are rectangles.
pub fn key_outline_mm(index: usize, black_key_length: f64) -> Option<Vec<Point2<f64>>> {
    if index >= KEY_COUNT {
        return None;
    }
    let back = back_edges_mm();
    let (lt, rt) = (back[index], back[index + 1]);
    let by = black_key_length;

    if is_black_key(index) {
        return Some(vec![
            Point2::new(lt, 0.0),
            Point2::new(lt, by),
            Point2::new(rt, by),
            Point2::new(rt, 0.0),
        ]);
    }

    let w = white_ordinal(index) as f64;
    let (lb, rb) = (w * WHITE_FRONT_WIDTH, (w + 1.0) * WHITE_FRONT_WIDTH);
    Some(vec![
        Point2::new(lt, 0.0),
        Point2::new(lt, by),
        Point2::new(lb, by),
        Point2::new(lb, WHITE_KEY_LENGTH),
        Point2::new(rb, WHITE_KEY_LENGTH),
        Point2::new(rb, by),
        Point2::new(rt, by),
        Point2::new(rt, 0.0),
    ])
}
