//! Per-image checkerboard corner detections.

use crate::{CornerDetectionError, PatternSize};
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

/// Source of checkerboard inner corners for one image.
///
/// Implementations must return the corners of a complete `pattern` in
/// row-major order (columns varying fastest) or an error explaining why the
/// board is unusable. Detection runs on several images in parallel.
pub trait CornerDetector: Sync {
    type Image: Sync;

    fn detect(
        &self,
        image: &Self::Image,
        pattern: PatternSize,
    ) -> Result<Vec<Point2<f64>>, CornerDetectionError>;
}

/// Corners of one calibration image, as produced by a detector or loaded
/// from a corner file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ViewDetection {
    pub name: String,
    pub corners: Result<Vec<Point2<f64>>, CornerDetectionError>,
}

impl ViewDetection {
    pub fn found(name: impl Into<String>, corners: Vec<Point2<f64>>) -> Self {
        Self {
            name: name.into(),
            corners: Ok(corners),
        }
    }

    pub fn failed(name: impl Into<String>, error: CornerDetectionError) -> Self {
        Self {
            name: name.into(),
            corners: Err(error),
        }
    }
}

/// Check that a detection covers the full pattern with finite coordinates.
pub fn validate_corners(
    corners: &[Point2<f64>],
    pattern: PatternSize,
) -> Result<(), CornerDetectionError> {
    let expected = pattern.corner_count();
    if corners.is_empty() {
        return Err(CornerDetectionError::NotFound);
    }
    if corners.len() != expected {
        return Err(CornerDetectionError::IncompleteGrid {
            expected,
            found: corners.len(),
        });
    }
    if corners.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
        return Err(CornerDetectionError::NonFinite);
    }
    Ok(())
}

/// Run `detector` over every image, keeping input order.
pub fn detect_all<D: CornerDetector>(
    detector: &D,
    images: &[(String, D::Image)],
    pattern: PatternSize,
) -> Vec<ViewDetection> {
    let run = |(name, image): &(String, D::Image)| {
        let corners = detector
            .detect(image, pattern)
            .and_then(|c| validate_corners(&c, pattern).map(|_| c));
        if let Err(e) = &corners {
            log::debug!("{name}: {e}");
        }
        ViewDetection {
            name: name.clone(),
            corners,
        }
    };

    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;
        images.par_iter().map(run).collect()
    }
    #[cfg(not(feature = "rayon"))]
    {
        images.iter().map(run).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_grid_reports_counts() {
        let pattern = PatternSize::new(3, 2);
        let pts = vec![Point2::new(0.0, 0.0); 5];
        assert_eq!(
            validate_corners(&pts, pattern),
            Err(CornerDetectionError::IncompleteGrid {
                expected: 6,
                found: 5
            })
        );
        assert_eq!(
            validate_corners(&[], pattern),
            Err(CornerDetectionError::NotFound)
        );
    }

    #[test]
    fn non_finite_corners_are_rejected() {
        let pattern = PatternSize::new(1, 2);
        let pts = vec![Point2::new(0.0, 0.0), Point2::new(f64::NAN, 1.0)];
        assert_eq!(
            validate_corners(&pts, pattern),
            Err(CornerDetectionError::NonFinite)
        );
    }
}
