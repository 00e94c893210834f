//! Pinhole camera with Brown–Conrady lens distortion.
//!
//! Pipeline: `pixel = K * distort(normalized)` where `normalized = (X/Z, Y/Z)`.

use nalgebra::{Matrix3, Point2, Point3};
use serde::{Deserialize, Serialize};

/// Brown–Conrady distortion coefficients in OpenCV order `[k1, k2, p1, p2, k3]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

impl Distortion {
    pub const COUNT: usize = 5;

    pub fn none() -> Self {
        Self::default()
    }

    pub fn to_coeffs(&self) -> [f64; 5] {
        [self.k1, self.k2, self.p1, self.p2, self.k3]
    }

    /// Build from an OpenCV-style coefficient list. Missing trailing
    /// coefficients are zero; extra coefficients (rational model) are ignored.
    pub fn from_coeffs(coeffs: &[f64]) -> Self {
        let c = |i: usize| coeffs.get(i).copied().unwrap_or(0.0);
        Self {
            k1: c(0),
            k2: c(1),
            p1: c(2),
            p2: c(3),
            k3: c(4),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.to_coeffs().iter().all(|c| *c == 0.0)
    }

    /// Apply distortion to a normalized image point.
    #[inline]
    pub fn distort(&self, p: Point2<f64>) -> Point2<f64> {
        let (x, y) = (p.x, p.y);
        let r2 = x * x + y * y;
        let radial = 1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3));
        let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        Point2::new(x * radial + dx, y * radial + dy)
    }

    /// Invert [`Distortion::distort`] by fixed-point iteration.
    pub fn undistort(&self, distorted: Point2<f64>, iterations: usize) -> Point2<f64> {
        if self.is_zero() {
            return distorted;
        }
        let mut p = distorted;
        for _ in 0..iterations {
            let (x, y) = (p.x, p.y);
            let r2 = x * x + y * y;
            let radial = 1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3));
            let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
            let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
            if radial.abs() < 1e-12 {
                break;
            }
            let next = Point2::new((distorted.x - dx) / radial, (distorted.y - dy) / radial);
            let step = (next - p).norm();
            p = next;
            if step < 1e-14 {
                break;
            }
        }
        p
    }
}

/// Camera intrinsics: focal lengths, principal point, skew and lens distortion.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    #[serde(default)]
    pub skew: f64,
    #[serde(default)]
    pub distortion: Distortion,
}

impl CameraIntrinsics {
    const UNDISTORT_ITERS: usize = 20;

    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            skew: 0.0,
            distortion: Distortion::none(),
        }
    }

    pub fn with_distortion(mut self, distortion: Distortion) -> Self {
        self.distortion = distortion;
        self
    }

    /// The 3×3 camera matrix `K`.
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, self.skew, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    /// Build from a camera matrix, e.g. a persisted `intrinsic_matrix`.
    pub fn from_matrix(k: &Matrix3<f64>, distortion: Distortion) -> Self {
        let s = if k[(2, 2)].abs() > 1e-12 { k[(2, 2)] } else { 1.0 };
        Self {
            fx: k[(0, 0)] / s,
            fy: k[(1, 1)] / s,
            cx: k[(0, 2)] / s,
            cy: k[(1, 2)] / s,
            skew: k[(0, 1)] / s,
            distortion,
        }
    }

    pub fn is_finite(&self) -> bool {
        [self.fx, self.fy, self.cx, self.cy, self.skew]
            .iter()
            .chain(self.distortion.to_coeffs().iter())
            .all(|v| v.is_finite())
    }

    #[inline]
    pub fn normalized_to_pixel(&self, n: Point2<f64>) -> Point2<f64> {
        Point2::new(
            self.fx * n.x + self.skew * n.y + self.cx,
            self.fy * n.y + self.cy,
        )
    }

    #[inline]
    pub fn pixel_to_normalized(&self, p: Point2<f64>) -> Point2<f64> {
        let y = (p.y - self.cy) / self.fy;
        let x = (p.x - self.cx - self.skew * y) / self.fx;
        Point2::new(x, y)
    }

    /// Project a camera-frame point to distorted pixels. `None` behind the camera.
    pub fn project(&self, pc: &Point3<f64>) -> Option<Point2<f64>> {
        if pc.z <= 1e-12 {
            return None;
        }
        let n = Point2::new(pc.x / pc.z, pc.y / pc.z);
        Some(self.normalized_to_pixel(self.distortion.distort(n)))
    }

    /// Project a camera-frame point ignoring lens distortion.
    pub fn project_undistorted(&self, pc: &Point3<f64>) -> Option<Point2<f64>> {
        if pc.z <= 1e-12 {
            return None;
        }
        Some(self.normalized_to_pixel(Point2::new(pc.x / pc.z, pc.y / pc.z)))
    }

    /// Remove lens distortion from a pixel, returning the ideal pinhole pixel.
    pub fn undistort_pixel(&self, p: Point2<f64>) -> Point2<f64> {
        let n = self.pixel_to_normalized(p);
        let u = self.distortion.undistort(n, Self::UNDISTORT_ITERS);
        self.normalized_to_pixel(u)
    }

    /// Inverse of [`CameraIntrinsics::undistort_pixel`].
    pub fn distort_pixel(&self, p: Point2<f64>) -> Point2<f64> {
        let n = self.pixel_to_normalized(p);
        self.normalized_to_pixel(self.distortion.distort(n))
    }
}
