//! Keyboard coordinate frame.
//!
//! Keyspace is the unit square spanned by the marked corners: `x = 0` at the
//! left end of A0, `x = 1` at the right end of C8, `y = 0` along the back
//! edge (top corners) and `y = 1` along the key fronts (bottom corners).
//! The black keys occupy `y <= black_key_length / 145`.

use crate::corners::check_simple_quad;
use crate::{FrameError, KeyboardCorners};
use nalgebra::Point2;
use pianocal_core::{homography_from_4pt, piano, pose_from_homography, CameraIntrinsics, Homography, Pose};
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Pixel coordinates a frame expects: straight from the camera, or with lens
/// distortion removed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelSpace {
    #[default]
    Raw,
    Undistorted,
}

// Points this close outside the key bed still count as on it.
const EDGE_TOLERANCE: f64 = 1e-9;

/// Keyspace corners in `[top-left, top-right, bottom-left, bottom-right]` order.
fn unit_square() -> [Point2<f64>; 4] {
    [
        Point2::new(0.0, 0.0),
        Point2::new(1.0, 0.0),
        Point2::new(0.0, 1.0),
        Point2::new(1.0, 1.0),
    ]
}

/// Clamp a keyspace point onto the unit square, `None` when it lies outside.
fn on_key_bed(k: Point2<f64>) -> Option<Point2<f64>> {
    let range = -EDGE_TOLERANCE..=1.0 + EDGE_TOLERANCE;
    (range.contains(&k.x) && range.contains(&k.y))
        .then(|| Point2::new(k.x.clamp(0.0, 1.0), k.y.clamp(0.0, 1.0)))
}

#[derive(Clone, Debug)]
pub struct KeyboardFrame {
    corners: KeyboardCorners,
    pixel_space: PixelSpace,
    to_keyspace: Homography,
    to_pixel: Homography,
    boundaries: Vec<f64>,
    front_boundaries: Vec<f64>,
}

impl KeyboardFrame {
    /// Build the frame from marked corners.
    ///
    /// With `intrinsics`, the corners are undistorted first and the frame
    /// works in [`PixelSpace::Undistorted`]; without, it maps raw pixels.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "info", skip(corners, intrinsics), fields(undistort = intrinsics.is_some()))
    )]
    pub fn build(
        corners: &KeyboardCorners,
        intrinsics: Option<&CameraIntrinsics>,
    ) -> Result<Self, FrameError> {
        corners.validate()?;

        let (pixel_space, pts) = match intrinsics {
            Some(k) => (
                PixelSpace::Undistorted,
                corners.points().map(|p| k.undistort_pixel(p)),
            ),
            None => (PixelSpace::Raw, corners.points()),
        };
        if pixel_space == PixelSpace::Undistorted {
            let [tl, tr, bl, br] = pts;
            check_simple_quad(&[tl, tr, br, bl])?;
        }

        let to_keyspace = homography_from_4pt(&pts, &unit_square())
            .ok_or_else(|| FrameError::degenerate("no homography through the corners"))?;
        let to_pixel = to_keyspace
            .inverse()
            .ok_or_else(|| FrameError::degenerate("keyboard homography is singular"))?;

        log::debug!(
            "keyboard frame in {:?} pixels, black-key depth {:.3}",
            pixel_space,
            corners.black_key_length / piano::WHITE_KEY_LENGTH
        );
        Ok(Self {
            corners: *corners,
            pixel_space,
            to_keyspace,
            to_pixel,
            boundaries: piano::back_boundaries().to_vec(),
            front_boundaries: piano::front_boundaries().to_vec(),
        })
    }

    pub fn corners(&self) -> &KeyboardCorners {
        &self.corners
    }

    pub fn pixel_space(&self) -> PixelSpace {
        self.pixel_space
    }

    pub fn black_key_length(&self) -> f64 {
        self.corners.black_key_length
    }

    /// Keyspace `y` where the black keys end.
    pub fn black_depth(&self) -> f64 {
        self.corners.black_key_length / piano::WHITE_KEY_LENGTH
    }

    /// The 89 key boundaries in keyspace `x`; key `i` spans
    /// `[boundaries[i], boundaries[i + 1])`.
    pub fn boundaries(&self) -> &[f64] {
        &self.boundaries
    }

    /// The 53 white-key front edges in keyspace `x`.
    pub fn front_boundaries(&self) -> &[f64] {
        &self.front_boundaries
    }

    /// Pixel → keyspace homography.
    pub fn homography(&self) -> &Homography {
        &self.to_keyspace
    }

    /// Keyspace → pixel homography.
    pub fn inverse_homography(&self) -> &Homography {
        &self.to_pixel
    }

    /// Map a pixel (in this frame's pixel space) to keyspace.
    pub fn to_keyspace(&self, pixel: Point2<f64>) -> Option<Point2<f64>> {
        self.to_keyspace.try_apply(pixel)
    }

    pub fn to_pixel(&self, keyspace: Point2<f64>) -> Option<Point2<f64>> {
        self.to_pixel.try_apply(keyspace)
    }

    /// Key under a keyspace point using the back-row partition only.
    pub fn key_at_keyspace(&self, k: Point2<f64>) -> Option<usize> {
        let k = on_key_bed(k)?;
        let upper = self.boundaries.partition_point(|&b| b <= k.x);
        Some(upper.saturating_sub(1).min(piano::KEY_COUNT - 1))
    }

    /// Key index under a pixel, `None` off the key bed.
    pub fn key_index_at(&self, pixel: Point2<f64>) -> Option<usize> {
        self.key_at_keyspace(self.to_keyspace(pixel)?)
    }

    /// Like [`KeyboardFrame::key_index_at`] but aware of key depth: in front
    /// of the black keys only white keys exist, so the point resolves against
    /// the 52 front edges.
    pub fn key_under(&self, pixel: Point2<f64>) -> Option<usize> {
        let k = on_key_bed(self.to_keyspace(pixel)?)?;
        if k.y <= self.black_depth() {
            return self.key_at_keyspace(k);
        }
        let upper = self.front_boundaries.partition_point(|&b| b <= k.x);
        let ordinal = upper.saturating_sub(1).min(piano::WHITE_KEY_COUNT - 1);
        piano::white_key_index(ordinal)
    }

    /// Outline of key `index` in keyspace.
    pub fn key_outline(&self, index: usize) -> Option<Vec<Point2<f64>>> {
        let mm = piano::key_outline_mm(index, self.corners.black_key_length)?;
        Some(
            mm.into_iter()
                .map(|p| Point2::new(p.x / piano::KEYBOARD_WIDTH, p.y / piano::WHITE_KEY_LENGTH))
                .collect(),
        )
    }

    /// Outline of key `index` in pixels of this frame's pixel space.
    pub fn key_outline_pixels(&self, index: usize) -> Option<Vec<Point2<f64>>> {
        self.key_outline(index)?
            .into_iter()
            .map(|k| self.to_pixel(k))
            .collect()
    }

    /// Camera pose relative to the keyboard plane, in millimetres.
    ///
    /// Keyboard frame: origin at the back-left corner, `x` along the keys
    /// towards C8, `y` towards the key fronts, `z` into the keyboard.
    pub fn camera_pose(&self, intrinsics: &CameraIntrinsics) -> Option<Pose> {
        let undistorted = match self.pixel_space {
            PixelSpace::Raw => self.corners.points().map(|p| intrinsics.undistort_pixel(p)),
            PixelSpace::Undistorted => unit_square().map(|k| self.to_pixel.apply(k)),
        };
        let (w, h) = (piano::KEYBOARD_WIDTH, piano::WHITE_KEY_LENGTH);
        let plane = [
            Point2::new(0.0, 0.0),
            Point2::new(w, 0.0),
            Point2::new(0.0, h),
            Point2::new(w, h),
        ];
        let hom = homography_from_4pt(&plane, &undistorted)?;
        pose_from_homography(intrinsics, &hom)
    }
}
