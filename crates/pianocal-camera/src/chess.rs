//! Checkerboard detection on real images using ChESS corner responses.
//!
//! The strongest `cols * rows` ChESS corners are taken as board candidates,
//! the board outline is read off their extreme points and every grid
//! position is matched to the nearest candidate through the outline
//! homography.

use crate::{CornerDetectionError, CornerDetector, PatternSize};
use chess_corners::{find_chess_corners_image, ChessConfig, CornerDescriptor};
use nalgebra::Point2;
use pianocal_core::{estimate_homography, homography_from_4pt, Homography};

/// Default ChESS settings for printed calibration boards.
pub fn default_chess_config() -> ChessConfig {
    let mut cfg = ChessConfig::single_scale();
    cfg.params.threshold_rel = 0.2;
    cfg.params.nms_radius = 2;
    cfg
}

/// Checkerboard detector backed by `chess-corners`.
pub struct ChessGridDetector {
    pub config: ChessConfig,
    /// Largest accepted distance between a predicted grid position and its
    /// corner, as a fraction of the local grid spacing.
    pub match_radius: f64,
}

impl Default for ChessGridDetector {
    fn default() -> Self {
        Self {
            config: default_chess_config(),
            match_radius: 0.35,
        }
    }
}

impl CornerDetector for ChessGridDetector {
    type Image = ::image::GrayImage;

    fn detect(
        &self,
        image: &Self::Image,
        pattern: PatternSize,
    ) -> Result<Vec<Point2<f64>>, CornerDetectionError> {
        let mut raw: Vec<CornerDescriptor> = find_chess_corners_image(image, &self.config);
        log::debug!("chess: {} raw corners", raw.len());
        let expected = pattern.corner_count();
        if raw.is_empty() {
            return Err(CornerDetectionError::NotFound);
        }
        if raw.len() < expected {
            return Err(CornerDetectionError::IncompleteGrid {
                expected,
                found: raw.len(),
            });
        }
        raw.sort_by(|a, b| b.response.total_cmp(&a.response));
        let candidates: Vec<Point2<f64>> = raw
            .iter()
            .map(|c| Point2::new(c.x as f64, c.y as f64))
            .collect();
        match_grid(&candidates, pattern, self.match_radius)
    }
}

/// Extreme points of a roughly axis-aligned board: TL, TR, BR, BL.
fn outline(points: &[Point2<f64>]) -> Option<[Point2<f64>; 4]> {
    let by = |f: &dyn Fn(&Point2<f64>) -> f64| {
        points
            .iter()
            .copied()
            .max_by(|a, b| f(a).total_cmp(&f(b)))
    };
    Some([
        by(&|p| -(p.x + p.y))?,
        by(&|p| p.x - p.y)?,
        by(&|p| p.x + p.y)?,
        by(&|p| p.y - p.x)?,
    ])
}

fn match_grid(
    candidates: &[Point2<f64>],
    pattern: PatternSize,
    match_radius: f64,
) -> Result<Vec<Point2<f64>>, CornerDetectionError> {
    let expected = pattern.corner_count();
    let strongest = &candidates[..expected];
    let [tl, tr, br, bl] = outline(strongest).ok_or(CornerDetectionError::NotFound)?;

    // The longer image side carries the larger corner count.
    let horizontal = (tr - tl).norm() + (br - bl).norm();
    let vertical = (bl - tl).norm() + (br - tr).norm();
    let (cols, rows) = (pattern.cols as f64 - 1.0, pattern.rows as f64 - 1.0);
    let quad = if (horizontal >= vertical) == (cols >= rows) {
        [tl, tr, br, bl]
    } else {
        [tr, br, bl, tl]
    };
    let grid = [
        Point2::new(0.0, 0.0),
        Point2::new(cols, 0.0),
        Point2::new(cols, rows),
        Point2::new(0.0, rows),
    ];
    let coarse = homography_from_4pt(&grid, &quad).ok_or(CornerDetectionError::DegenerateView)?;

    let first = assign(candidates, pattern, &coarse, match_radius)?;
    let grid_points: Vec<Point2<f64>> = (0..pattern.rows)
        .flat_map(|r| (0..pattern.cols).map(move |c| Point2::new(c as f64, r as f64)))
        .collect();
    let fine = estimate_homography(&grid_points, &first).ok_or(CornerDetectionError::DegenerateView)?;
    assign(candidates, pattern, &fine, match_radius)
}

fn assign(
    candidates: &[Point2<f64>],
    pattern: PatternSize,
    h: &Homography,
    match_radius: f64,
) -> Result<Vec<Point2<f64>>, CornerDetectionError> {
    let expected = pattern.corner_count();
    let mut out = Vec::with_capacity(expected);
    for r in 0..pattern.rows {
        for c in 0..pattern.cols {
            let g = Point2::new(c as f64, r as f64);
            let predicted = h.try_apply(g).ok_or(CornerDetectionError::DegenerateView)?;
            let spacing = h
                .try_apply(Point2::new(g.x + 1.0, g.y))
                .map(|q| (q - predicted).norm())
                .ok_or(CornerDetectionError::DegenerateView)?;
            let nearest = candidates
                .iter()
                .copied()
                .min_by(|a, b| (*a - predicted).norm().total_cmp(&(*b - predicted).norm()));
            match nearest {
                Some(p) if (p - predicted).norm() <= match_radius * spacing => out.push(p),
                _ => {}
            }
        }
    }
    if out.len() != expected {
        return Err(CornerDetectionError::IncompleteGrid {
            expected,
            found: out.len(),
        });
    }
    Ok(out)
}
