//! Coarse camera orientation check.
//!
//! In the normalized view the keyboard sits at the top of the frame (black
//! keys above the white-key fronts, hands entering from below) and the low
//! keys are on the left. The estimator finds the band of black keys in each
//! quarter-turn of the input, keeps the turn in which the white-key fronts lie
//! below the band, and reads the hand sidedness off the lone A#0 black key at
//! the bass end.

use crate::{OrientationError, OrientationParams};
use nalgebra::Point2;
use pianocal_core::{GrayImage, GrayImageView};
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Clockwise rotation in 90° steps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum QuarterTurn {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl QuarterTurn {
    pub const ALL: [QuarterTurn; 4] = [Self::Deg0, Self::Deg90, Self::Deg180, Self::Deg270];

    pub fn degrees(self) -> u16 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }

    pub fn from_degrees(deg: u16) -> Option<Self> {
        match deg {
            0 => Some(Self::Deg0),
            90 => Some(Self::Deg90),
            180 => Some(Self::Deg180),
            270 => Some(Self::Deg270),
            _ => None,
        }
    }

    fn swaps_axes(self) -> bool {
        matches!(self, Self::Deg90 | Self::Deg270)
    }
}

impl TryFrom<u16> for QuarterTurn {
    type Error = String;

    fn try_from(deg: u16) -> Result<Self, Self::Error> {
        Self::from_degrees(deg).ok_or_else(|| format!("rotation must be 0, 90, 180 or 270, got {deg}"))
    }
}

impl From<QuarterTurn> for u16 {
    fn from(q: QuarterTurn) -> u16 {
        q.degrees()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandSidedness {
    /// Low keys on the image left.
    #[default]
    Normal,
    /// Low keys on the image right; corrected by a horizontal flip.
    Mirrored,
}

/// Rotate clockwise by `rotation`, then optionally mirror left/right.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct OrientationCorrection {
    pub rotation: QuarterTurn,
    pub flip_horizontal: bool,
}

impl OrientationCorrection {
    pub const IDENTITY: Self = Self {
        rotation: QuarterTurn::Deg0,
        flip_horizontal: false,
    };

    pub fn new(rotation: QuarterTurn, flip_horizontal: bool) -> Self {
        Self {
            rotation,
            flip_horizontal,
        }
    }

    /// Express independent horizontal/vertical flips as a correction.
    pub fn from_flips(flip_horizontal: bool, flip_vertical: bool) -> Self {
        match (flip_horizontal, flip_vertical) {
            (false, false) => Self::IDENTITY,
            (true, false) => Self::new(QuarterTurn::Deg0, true),
            (false, true) => Self::new(QuarterTurn::Deg180, true),
            (true, true) => Self::new(QuarterTurn::Deg180, false),
        }
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }

    /// Size of a corrected `width x height` frame.
    pub fn output_size(&self, width: usize, height: usize) -> (usize, usize) {
        if self.rotation.swaps_axes() {
            (height, width)
        } else {
            (width, height)
        }
    }

    /// Map a pixel of a raw `width x height` frame into the corrected frame.
    /// Pixel centres sit at integer coordinates.
    pub fn correct_point(&self, p: Point2<f64>, width: usize, height: usize) -> Point2<f64> {
        let (w, h) = (width as f64 - 1.0, height as f64 - 1.0);
        let rotated = match self.rotation {
            QuarterTurn::Deg0 => p,
            QuarterTurn::Deg90 => Point2::new(h - p.y, p.x),
            QuarterTurn::Deg180 => Point2::new(w - p.x, h - p.y),
            QuarterTurn::Deg270 => Point2::new(p.y, w - p.x),
        };
        if self.flip_horizontal {
            let (out_w, _) = self.output_size(width, height);
            Point2::new(out_w as f64 - 1.0 - rotated.x, rotated.y)
        } else {
            rotated
        }
    }
}

/// Persisted orientation of one recording session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrientationMetadata {
    /// The keyboard already appears at the top of the raw frame.
    pub keyboard_top: bool,
    /// Sidedness after the rotation, before any flip.
    pub hand_sidedness: HandSidedness,
    pub correction_rotation_deg: QuarterTurn,
}

impl OrientationMetadata {
    /// No correction: the raw frame is taken as already normalized.
    pub fn identity() -> Self {
        Self::from_correction(OrientationCorrection::IDENTITY)
    }

    pub fn from_correction(correction: OrientationCorrection) -> Self {
        Self {
            keyboard_top: correction.rotation == QuarterTurn::Deg0,
            hand_sidedness: if correction.flip_horizontal {
                HandSidedness::Mirrored
            } else {
                HandSidedness::Normal
            },
            correction_rotation_deg: correction.rotation,
        }
    }

    pub fn correction(&self) -> OrientationCorrection {
        OrientationCorrection::new(
            self.correction_rotation_deg,
            self.hand_sidedness == HandSidedness::Mirrored,
        )
    }
}

/// Black-key band located in the corrected frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlackKeyBand {
    /// First band row.
    pub top: usize,
    /// One past the last band row.
    pub bottom: usize,
    /// Left edge of the first black key.
    pub left: usize,
    /// One past the right edge of the last black key.
    pub right: usize,
    pub black_keys: usize,
    /// Sizes of the black-key groups from left to right.
    pub groups: Vec<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrientationEstimate {
    pub metadata: OrientationMetadata,
    pub band: BlackKeyBand,
}

impl OrientationEstimate {
    pub fn correction(&self) -> OrientationCorrection {
        self.metadata.correction()
    }
}

/// Apply `correction` to a frame.
pub fn apply_correction(view: &GrayImageView<'_>, correction: OrientationCorrection) -> GrayImage {
    let (w, h) = (view.width, view.height);
    let (out_w, out_h) = correction.output_size(w, h);
    GrayImage::from_fn(out_w, out_h, |x, y| {
        let x = if correction.flip_horizontal { out_w - 1 - x } else { x };
        let (sx, sy) = match correction.rotation {
            QuarterTurn::Deg0 => (x, y),
            QuarterTurn::Deg90 => (y, h - 1 - x),
            QuarterTurn::Deg180 => (w - 1 - x, h - 1 - y),
            QuarterTurn::Deg270 => (w - 1 - y, x),
        };
        view.get(sx, sy)
    })
}

/// Classify the keyboard orientation in `view`.
///
/// Fails with [`OrientationError::OrientationAmbiguous`] when no single
/// quarter-turn shows an upright keyboard or when the bass end cannot be told
/// from the treble end (for instance when the keyboard is cropped).
#[cfg_attr(
    feature = "tracing",
    instrument(level = "info", skip(view, params), fields(width = view.width, height = view.height))
)]
pub fn estimate_orientation(
    view: &GrayImageView<'_>,
    params: &OrientationParams,
) -> Result<OrientationEstimate, OrientationError> {
    if view.width < 8 || view.height < 8 || view.data.len() != view.width * view.height {
        return Err(OrientationError::InvalidImage {
            width: view.width,
            height: view.height,
        });
    }
    let threshold = otsu_threshold(&view.histogram(), view.data.len());
    log::debug!("orientation: otsu threshold {threshold}");

    let mut upright = Vec::new();
    for rotation in QuarterTurn::ALL {
        let turned = apply_correction(view, OrientationCorrection::new(rotation, false));
        if let Some(band) = find_upright_band(&turned.view(), threshold, params) {
            log::debug!(
                "orientation: upright band at {}°, rows {}..{}, {} black keys",
                rotation.degrees(),
                band.top,
                band.bottom,
                band.black_keys
            );
            upright.push((rotation, band, turned.width));
        }
    }

    let (rotation, mut band, width) = match upright.len() {
        0 => return Err(OrientationError::ambiguous("no black-key band found")),
        1 => upright.remove(0),
        n => {
            return Err(OrientationError::ambiguous(format!(
                "keyboard looks upright in {n} orientations"
            )))
        }
    };

    let first = band.groups.first().copied().unwrap_or(0);
    let last = band.groups.last().copied().unwrap_or(0);
    let sidedness = match (first, last) {
        (1, l) if l != 1 => HandSidedness::Normal,
        (f, 1) if f != 1 => HandSidedness::Mirrored,
        _ => {
            return Err(OrientationError::ambiguous(format!(
                "cannot tell bass from treble end (black-key groups {:?})",
                band.groups
            )))
        }
    };

    if sidedness == HandSidedness::Mirrored {
        let (left, right) = (width - band.right, width - band.left);
        band.left = left;
        band.right = right;
        band.groups.reverse();
    }

    let metadata = OrientationMetadata {
        keyboard_top: rotation == QuarterTurn::Deg0,
        hand_sidedness: sidedness,
        correction_rotation_deg: rotation,
    };
    log::info!(
        "orientation: rotate {}°, {:?} sidedness",
        rotation.degrees(),
        sidedness
    );
    Ok(OrientationEstimate { metadata, band })
}

/// Otsu's threshold; pixels `<= threshold` are dark.
fn otsu_threshold(hist: &[u32; 256], total: usize) -> u8 {
    let total = total as f64;
    let sum: f64 = hist.iter().enumerate().map(|(i, &c)| i as f64 * c as f64).sum();
    let (mut w_b, mut sum_b) = (0.0, 0.0);
    let (mut best, mut best_var) = (0u8, 0.0);
    for (t, &count) in hist.iter().enumerate() {
        w_b += count as f64;
        if w_b == 0.0 {
            continue;
        }
        let w_f = total - w_b;
        if w_f == 0.0 {
            break;
        }
        sum_b += t as f64 * count as f64;
        let m_b = sum_b / w_b;
        let m_f = (sum - sum_b) / w_f;
        let between = w_b * w_f * (m_b - m_f) * (m_b - m_f);
        if between > best_var {
            best_var = between;
            best = t as u8;
        }
    }
    best
}

/// Dark runs `[start, end)` of a row.
fn dark_runs(row: &[u8], threshold: u8) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut start = None;
    for (x, &v) in row.iter().enumerate() {
        match (v <= threshold, start) {
            (true, None) => start = Some(x),
            (false, Some(s)) => {
                runs.push((s, x));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push((s, row.len()));
    }
    runs
}

/// Dark runs shaped like black keys: wide enough to not be a key gap and of
/// similar width to their peers, which drops background and piano body.
fn black_key_runs(row: &[u8], threshold: u8, min_width: usize) -> Vec<(usize, usize)> {
    let mut runs: Vec<(usize, usize)> = dark_runs(row, threshold)
        .into_iter()
        .filter(|(s, e)| e - s >= min_width)
        .collect();
    if runs.is_empty() {
        return runs;
    }
    let mut widths: Vec<usize> = runs.iter().map(|(s, e)| e - s).collect();
    widths.sort_unstable();
    let median = widths[widths.len() / 2] as f64;
    runs.retain(|(s, e)| {
        let w = (e - s) as f64;
        w >= 0.5 * median && w <= 2.0 * median
    });
    runs
}

fn is_band_row(row: &[u8], threshold: u8, params: &OrientationParams) -> bool {
    let runs = black_key_runs(row, threshold, params.min_key_width_px);
    if runs.len() < params.min_black_keys {
        return false;
    }
    let (left, right) = (runs[0].0, runs[runs.len() - 1].1);
    let dark = row[left..right].iter().filter(|&&v| v <= threshold).count();
    let fraction = dark as f64 / (right - left) as f64;
    let (lo, hi) = params.dark_fraction_range;
    (lo..=hi).contains(&fraction)
}

fn light_fraction(view: &GrayImageView<'_>, rows: std::ops::Range<usize>, left: usize, right: usize, threshold: u8) -> f64 {
    let mut light = 0usize;
    let mut total = 0usize;
    for y in rows {
        let row = &view.row(y)[left..right];
        light += row.iter().filter(|&&v| v > threshold).count();
        total += row.len();
    }
    if total == 0 {
        0.0
    } else {
        light as f64 / total as f64
    }
}

fn find_upright_band(
    view: &GrayImageView<'_>,
    threshold: u8,
    params: &OrientationParams,
) -> Option<BlackKeyBand> {
    // Longest run of consecutive band rows.
    let (mut best, mut current): (Option<(usize, usize)>, Option<usize>) = (None, None);
    for y in 0..=view.height {
        let hit = y < view.height && is_band_row(view.row(y), threshold, params);
        match (hit, current) {
            (true, None) => current = Some(y),
            (false, Some(start)) => {
                if best.is_none_or(|(s, e)| y - start > e - s) {
                    best = Some((start, y));
                }
                current = None;
            }
            _ => {}
        }
    }
    let (top, bottom) = best?;
    if bottom - top < params.min_band_rows {
        return None;
    }

    let mid = view.row((top + bottom) / 2);
    let runs = black_key_runs(mid, threshold, params.min_key_width_px);
    let (left, right) = (runs.first()?.0, runs.last()?.1);

    // The white-key fronts continue below the black keys.
    let reach = ((bottom - top) / 4).max(2);
    let below = light_fraction(view, bottom..(bottom + reach).min(view.height), left, right, threshold);
    let above = light_fraction(view, top.saturating_sub(reach)..top, left, right, threshold);
    if below < 0.6 || below < above + 0.2 {
        return None;
    }

    Some(BlackKeyBand {
        top,
        bottom,
        left,
        right,
        black_keys: runs.len(),
        groups: group_sizes(&runs, params.group_gap_ratio),
    })
}

/// Split black keys into groups at gaps wider than `ratio` times the median gap.
fn group_sizes(runs: &[(usize, usize)], ratio: f64) -> Vec<usize> {
    let centers: Vec<f64> = runs.iter().map(|(s, e)| (s + e) as f64 / 2.0).collect();
    let gaps: Vec<f64> = centers.windows(2).map(|w| w[1] - w[0]).collect();
    if gaps.is_empty() {
        return vec![centers.len()];
    }
    let mut sorted = gaps.clone();
    sorted.sort_by(f64::total_cmp);
    let median = sorted[sorted.len() / 2];

    let mut groups = vec![1];
    for gap in gaps {
        if gap > ratio * median {
            groups.push(1);
        } else if let Some(last) = groups.last_mut() {
            *last += 1;
        }
    }
    groups
}
