use nalgebra::Point3;
use serde::{Deserialize, Serialize};

/// Inner-corner count of a checkerboard (squares minus one per axis).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSize {
    pub cols: usize,
    pub rows: usize,
}

impl PatternSize {
    pub const fn new(cols: usize, rows: usize) -> Self {
        Self { cols, rows }
    }

    pub fn corner_count(&self) -> usize {
        self.cols * self.rows
    }

    /// Board-frame corner positions (`Z = 0`), row-major with columns
    /// varying fastest.
    pub fn object_points(&self, square_size: f64) -> Vec<Point3<f64>> {
        (0..self.rows)
            .flat_map(|r| {
                (0..self.cols)
                    .map(move |c| Point3::new(c as f64 * square_size, r as f64 * square_size, 0.0))
            })
            .collect()
    }
}

impl Default for PatternSize {
    fn default() -> Self {
        Self::new(10, 7)
    }
}

/// Checkerboard calibration settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckerboardParams {
    /// Inner-corner pattern, 10x7 for the reference board.
    pub pattern: PatternSize,
    /// Edge length of one board square. Translations are reported in this unit.
    pub square_size: f64,
    /// Minimum number of images with a complete detection.
    pub min_valid_views: usize,
    /// Levenberg–Marquardt iteration cap.
    pub max_iterations: usize,
    /// Relative cost decrease below which refinement stops.
    pub convergence_epsilon: f64,
}

impl Default for CheckerboardParams {
    fn default() -> Self {
        Self {
            pattern: PatternSize::default(),
            square_size: 1.0,
            min_valid_views: 10,
            max_iterations: 50,
            convergence_epsilon: 1e-10,
        }
    }
}

/// Camera orientation estimator settings.
///
/// The estimator looks for the band of black keys: image rows crossed by
/// many narrow dark runs of similar width.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OrientationParams {
    /// Minimum height of the black-key band, in pixels.
    pub min_band_rows: usize,
    /// Minimum number of black keys a band row must cross.
    pub min_black_keys: usize,
    /// Accepted fraction of dark pixels between the first and last black key.
    pub dark_fraction_range: (f64, f64),
    /// A gap between neighbouring black keys larger than this multiple of the
    /// median gap separates two groups (the E–F and B–C positions).
    pub group_gap_ratio: f64,
    /// Dark runs narrower than this are key separation lines, not black keys.
    pub min_key_width_px: usize,
}

impl Default for OrientationParams {
    fn default() -> Self {
        Self {
            min_band_rows: 5,
            min_black_keys: 20,
            dark_fraction_range: (0.2, 0.7),
            group_gap_ratio: 1.25,
            min_key_width_px: 3,
        }
    }
}
