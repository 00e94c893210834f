use crate::{CameraIntrinsics, Homography};
use nalgebra::{Matrix3, Point3, Rotation3, Vector3};
use serde::{Deserialize, Serialize};

/// Rigid transform taking plane/world coordinates into the camera frame:
/// `p_cam = rotation * p_world + translation`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub rotation: Rotation3<f64>,
    pub translation: Vector3<f64>,
}

impl Pose {
    pub fn new(rotation: Rotation3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    pub fn identity() -> Self {
        Self::new(Rotation3::identity(), Vector3::zeros())
    }

    /// Rodrigues (axis * angle) form of the rotation.
    pub fn rvec(&self) -> Vector3<f64> {
        self.rotation.scaled_axis()
    }

    pub fn from_rvec_tvec(rvec: Vector3<f64>, tvec: Vector3<f64>) -> Self {
        Self::new(Rotation3::from_scaled_axis(rvec), tvec)
    }

    #[inline]
    pub fn transform(&self, p: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.rotation * p.coords + self.translation)
    }

    /// Camera centre expressed in world coordinates.
    pub fn camera_center(&self) -> Point3<f64> {
        Point3::from(-(self.rotation.inverse() * self.translation))
    }
}

/// Recover the pose of a plane (`Z = 0`) from its plane→pixel homography.
///
/// `h` must map plane coordinates to *undistorted* pixels of `intrinsics`.
/// The returned rotation is the closest proper rotation to `[r1 r2 r1×r2]`
/// and the plane is placed in front of the camera.
pub fn pose_from_homography(intrinsics: &CameraIntrinsics, h: &Homography) -> Option<Pose> {
    let k_inv = intrinsics.matrix().try_inverse()?;
    let m = k_inv * h.h;
    let r1_raw = m.column(0).into_owned();
    let r2_raw = m.column(1).into_owned();
    let t_raw = m.column(2).into_owned();

    let norm = (r1_raw.norm() + r2_raw.norm()) * 0.5;
    if norm < 1e-18 {
        return None;
    }
    let mut scale = 1.0 / norm;
    if t_raw.z * scale < 0.0 {
        scale = -scale;
    }

    let r1 = r1_raw * scale;
    let r2 = r2_raw * scale;
    let r3 = r1.cross(&r2);
    let approx = Matrix3::from_columns(&[r1, r2, r3]);

    let svd = approx.svd(true, true);
    let u = svd.u?;
    let vt = svd.v_t?;
    let mut r = u * vt;
    if r.determinant() < 0.0 {
        r = -r;
    }

    let translation = t_raw * scale;
    if !translation.iter().all(|v| v.is_finite()) {
        return None;
    }
    Some(Pose::new(
        Rotation3::from_matrix_unchecked(r),
        translation,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Point2;

    #[test]
    fn recovers_plane_pose() {
        let cam = CameraIntrinsics::new(800.0, 800.0, 320.0, 240.0);
        let truth = Pose::from_rvec_tvec(Vector3::new(0.2, -0.1, 0.05), Vector3::new(-50.0, 20.0, 600.0));

        let plane: Vec<Point2<f64>> = [(0.0, 0.0), (200.0, 0.0), (200.0, 150.0), (0.0, 150.0)]
            .iter()
            .map(|&(x, y)| Point2::new(x, y))
            .collect();
        let pixels: Vec<Point2<f64>> = plane
            .iter()
            .map(|p| {
                cam.project(&truth.transform(&Point3::new(p.x, p.y, 0.0)))
                    .expect("in front")
            })
            .collect();

        let h = crate::estimate_homography(&plane, &pixels).expect("homography");
        let pose = pose_from_homography(&cam, &h).expect("pose");

        assert_relative_eq!(pose.translation, truth.translation, epsilon = 1e-6);
        assert_relative_eq!(pose.rvec(), truth.rvec(), epsilon = 1e-7);
    }
}
