//! Zhang-style planar calibration: closed-form intrinsics from per-view
//! homographies, then joint Levenberg–Marquardt refinement of the camera
//! matrix, five distortion coefficients and every view pose.

use crate::detection::{detect_all, validate_corners, CornerDetector, ViewDetection};
use crate::{CalibrateError, CheckerboardParams, CornerDetectionError};
use nalgebra::{DMatrix, DVector, Matrix3, Point2, Point3, Rotation3, Vector3};
use pianocal_core::{
    estimate_homography, pose_from_homography, CameraIntrinsics, Distortion, Homography, Pose,
};
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

const INTRINSIC_PARAMS: usize = 9;
const VIEW_PARAMS: usize = 6;
const MAX_DAMPING_STEPS: usize = 12;
// Residual used for points that project behind the camera.
const BEHIND_CAMERA_RESIDUAL: f64 = 1e6;

/// Refined pose and fit quality of one calibration image.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ViewCalibration {
    pub name: String,
    pub pose: Pose,
    pub rms_error: f64,
}

/// An image left out of the joint solve.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SkippedView {
    pub name: String,
    pub reason: CornerDetectionError,
}

/// Which images contributed to a calibration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CalibrationSummary {
    pub used: Vec<String>,
    pub skipped: Vec<SkippedView>,
}

/// Result of a successful checkerboard calibration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CameraCalibration {
    pub intrinsics: CameraIntrinsics,
    /// RMS reprojection error over all used corners, in pixels.
    pub rms_error: f64,
    pub views: Vec<ViewCalibration>,
    pub summary: CalibrationSummary,
    pub iterations: usize,
}

/// Detect corners in every image and calibrate from the complete detections.
///
/// Images whose board is missing or partially visible are skipped and listed
/// in [`CameraCalibration::summary`]. Detection may run in parallel; results
/// are consumed in input order so the outcome does not depend on scheduling.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "info", skip(detector, images, params), fields(images = images.len()))
)]
pub fn calibrate<D: CornerDetector>(
    detector: &D,
    images: &[(String, D::Image)],
    params: &CheckerboardParams,
) -> Result<CameraCalibration, CalibrateError> {
    let detections = detect_all(detector, images, params.pattern);
    calibrate_from_detections(&detections, params)
}

struct UsableView {
    name: String,
    corners: Vec<Point2<f64>>,
    homography: Homography,
}

/// Calibrate from per-image corner detections.
pub fn calibrate_from_detections(
    detections: &[ViewDetection],
    params: &CheckerboardParams,
) -> Result<CameraCalibration, CalibrateError> {
    validate_params(params)?;

    let object = params.pattern.object_points(params.square_size);
    let object_xy: Vec<Point2<f64>> = object.iter().map(|p| Point2::new(p.x, p.y)).collect();

    let mut summary = CalibrationSummary::default();
    let mut usable = Vec::new();
    for det in detections {
        let outcome = det.corners.as_ref().map_err(Clone::clone).and_then(|c| {
            validate_corners(c, params.pattern)?;
            let h = estimate_homography(&object_xy, c).ok_or(CornerDetectionError::DegenerateView)?;
            Ok((c.clone(), h))
        });
        match outcome {
            Ok((corners, homography)) => {
                summary.used.push(det.name.clone());
                usable.push(UsableView {
                    name: det.name.clone(),
                    corners,
                    homography,
                });
            }
            Err(reason) => {
                log::warn!("skipping {}: {}", det.name, reason);
                summary.skipped.push(SkippedView {
                    name: det.name.clone(),
                    reason,
                });
            }
        }
    }

    let required = params.min_valid_views.max(3);
    if usable.len() < required {
        return Err(CalibrateError::InsufficientCalibrationData {
            found: usable.len(),
            required,
        });
    }
    log::info!(
        "calibrating from {} views ({} skipped)",
        usable.len(),
        summary.skipped.len()
    );

    let initial = initial_intrinsics(&usable)?;
    log::debug!(
        "closed-form intrinsics fx={:.2} fy={:.2} cx={:.2} cy={:.2}",
        initial.fx,
        initial.fy,
        initial.cx,
        initial.cy
    );
    let poses = usable
        .iter()
        .map(|v| pose_from_homography(&initial, &v.homography))
        .collect::<Option<Vec<_>>>()
        .ok_or(CalibrateError::InitializationFailed("plane pose from homography"))?;

    let problem = Problem {
        object,
        views: usable.iter().map(|v| v.corners.clone()).collect(),
    };
    let (solution, iterations) = refine(&problem, &initial, &poses, params);
    let (intrinsics, poses) = problem.unpack(&solution);
    if !intrinsics.is_finite() {
        return Err(CalibrateError::NonFiniteResult);
    }

    let residuals = problem.residuals(&solution);
    let per_view = 2 * problem.object.len();
    let views: Vec<ViewCalibration> = usable
        .iter()
        .zip(poses)
        .enumerate()
        .map(|(i, (v, pose))| ViewCalibration {
            name: v.name.clone(),
            pose,
            rms_error: rms(&residuals.as_slice()[i * per_view..(i + 1) * per_view]),
        })
        .collect();
    let rms_error = rms(residuals.as_slice());
    log::info!("calibration rms reprojection error {rms_error:.4} px after {iterations} iterations");

    Ok(CameraCalibration {
        intrinsics,
        rms_error,
        views,
        summary,
        iterations,
    })
}

fn validate_params(params: &CheckerboardParams) -> Result<(), CalibrateError> {
    if params.pattern.cols < 2 || params.pattern.rows < 2 {
        return Err(CalibrateError::InvalidParams(format!(
            "pattern {}x{} needs at least 2x2 inner corners",
            params.pattern.cols, params.pattern.rows
        )));
    }
    if !(params.square_size.is_finite() && params.square_size > 0.0) {
        return Err(CalibrateError::InvalidParams(format!(
            "square size must be positive, got {}",
            params.square_size
        )));
    }
    Ok(())
}

/// RMS over point residual pairs `[dx, dy, dx, dy, ...]`.
fn rms(residuals: &[f64]) -> f64 {
    let points = residuals.len() / 2;
    if points == 0 {
        return 0.0;
    }
    (residuals.iter().map(|r| r * r).sum::<f64>() / points as f64).sqrt()
}

fn v_ij(h: &Matrix3<f64>, i: usize, j: usize) -> [f64; 6] {
    [
        h[(0, i)] * h[(0, j)],
        h[(0, i)] * h[(1, j)] + h[(1, i)] * h[(0, j)],
        h[(1, i)] * h[(1, j)],
        h[(2, i)] * h[(0, j)] + h[(0, i)] * h[(2, j)],
        h[(2, i)] * h[(1, j)] + h[(1, i)] * h[(2, j)],
        h[(2, i)] * h[(2, j)],
    ]
}

/// Closed-form camera matrix from the image of the absolute conic.
///
/// Pixels are first mapped to a centred, unit-scale frame so the linear
/// system is well conditioned; the result is mapped back afterwards.
fn initial_intrinsics(views: &[UsableView]) -> Result<CameraIntrinsics, CalibrateError> {
    let all = views.iter().flat_map(|v| v.corners.iter());
    let count = views.iter().map(|v| v.corners.len()).sum::<usize>() as f64;
    let (sx, sy) = all.fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    let (mx, my) = (sx / count, sy / count);
    let spread = views
        .iter()
        .flat_map(|v| v.corners.iter())
        .map(|p| (p.x - mx).abs().max((p.y - my).abs()))
        .fold(0.0_f64, f64::max)
        .max(1.0);
    let norm = Matrix3::new(
        1.0 / spread, 0.0, -mx / spread, //
        0.0, 1.0 / spread, -my / spread, //
        0.0, 0.0, 1.0,
    );

    let mut v = DMatrix::<f64>::zeros(2 * views.len(), 6);
    for (i, view) in views.iter().enumerate() {
        let h = norm * view.homography.h;
        let v12 = v_ij(&h, 0, 1);
        let v11 = v_ij(&h, 0, 0);
        let v22 = v_ij(&h, 1, 1);
        for j in 0..6 {
            v[(2 * i, j)] = v12[j];
            v[(2 * i + 1, j)] = v11[j] - v22[j];
        }
    }

    let svd = v.svd(false, true);
    let vt = svd
        .v_t
        .ok_or(CalibrateError::InitializationFailed("svd of conic constraints"))?;
    let (min_idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .ok_or(CalibrateError::InitializationFailed("empty constraint system"))?;
    let b = vt.row(min_idx);
    // Null-space sign is arbitrary; B must be positive definite.
    let sign = if b[0] < 0.0 { -1.0 } else { 1.0 };
    let (b11, b12, b22, b13, b23, b33) = (
        sign * b[0],
        sign * b[1],
        sign * b[2],
        sign * b[3],
        sign * b[4],
        sign * b[5],
    );

    let denom = b11 * b22 - b12 * b12;
    if denom.abs() < 1e-300 || b11.abs() < 1e-300 {
        return Err(CalibrateError::InitializationFailed("degenerate conic"));
    }
    let v0 = (b12 * b13 - b11 * b23) / denom;
    let lambda = b33 - (b13 * b13 + v0 * (b12 * b13 - b11 * b23)) / b11;
    if lambda <= 0.0 || denom <= 0.0 {
        return Err(CalibrateError::InitializationFailed(
            "views lack the angular diversity to fix the focal length",
        ));
    }
    let alpha = (lambda / b11).sqrt();
    let beta = (lambda * b11 / denom).sqrt();
    let gamma = -b12 * alpha * alpha * beta / lambda;
    let u0 = gamma * v0 / beta - b13 * alpha * alpha / lambda;

    // Skew is fixed at zero.
    let kn = Matrix3::new(alpha, 0.0, u0, 0.0, beta, v0, 0.0, 0.0, 1.0);
    let norm_inv = norm
        .try_inverse()
        .ok_or(CalibrateError::InitializationFailed("pixel normalization"))?;
    let k = norm_inv * kn;
    let intrinsics = CameraIntrinsics::from_matrix(&k, Distortion::none());
    if !intrinsics.is_finite() {
        return Err(CalibrateError::InitializationFailed("non-finite closed form"));
    }
    Ok(intrinsics)
}

/// Reprojection problem: one board, many views.
struct Problem {
    object: Vec<Point3<f64>>,
    views: Vec<Vec<Point2<f64>>>,
}

impl Problem {
    fn param_count(&self) -> usize {
        INTRINSIC_PARAMS + VIEW_PARAMS * self.views.len()
    }

    fn residual_count(&self) -> usize {
        2 * self.object.len() * self.views.len()
    }

    fn pack(&self, intrinsics: &CameraIntrinsics, poses: &[Pose]) -> DVector<f64> {
        let mut p = DVector::zeros(self.param_count());
        let d = intrinsics.distortion.to_coeffs();
        let head = [
            intrinsics.fx,
            intrinsics.fy,
            intrinsics.cx,
            intrinsics.cy,
            d[0],
            d[1],
            d[2],
            d[3],
            d[4],
        ];
        p.rows_mut(0, INTRINSIC_PARAMS).copy_from_slice(&head);
        for (i, pose) in poses.iter().enumerate() {
            let base = INTRINSIC_PARAMS + VIEW_PARAMS * i;
            let r = pose.rvec();
            let t = pose.translation;
            p.rows_mut(base, VIEW_PARAMS)
                .copy_from_slice(&[r.x, r.y, r.z, t.x, t.y, t.z]);
        }
        p
    }

    fn intrinsics(p: &DVector<f64>) -> CameraIntrinsics {
        CameraIntrinsics::new(p[0], p[1], p[2], p[3])
            .with_distortion(Distortion::from_coeffs(&p.as_slice()[4..INTRINSIC_PARAMS]))
    }

    fn view_pose(p: &DVector<f64>, view: usize) -> (Vector3<f64>, Vector3<f64>) {
        let b = INTRINSIC_PARAMS + VIEW_PARAMS * view;
        (
            Vector3::new(p[b], p[b + 1], p[b + 2]),
            Vector3::new(p[b + 3], p[b + 4], p[b + 5]),
        )
    }

    fn unpack(&self, p: &DVector<f64>) -> (CameraIntrinsics, Vec<Pose>) {
        let poses = (0..self.views.len())
            .map(|i| {
                let (r, t) = Self::view_pose(p, i);
                Pose::from_rvec_tvec(r, t)
            })
            .collect();
        (Self::intrinsics(p), poses)
    }

    fn view_residuals(
        &self,
        intrinsics: &CameraIntrinsics,
        rvec: &Vector3<f64>,
        tvec: &Vector3<f64>,
        view: usize,
        out: &mut [f64],
    ) {
        let rot = Rotation3::from_scaled_axis(*rvec);
        for (k, (obj, img)) in self.object.iter().zip(&self.views[view]).enumerate() {
            let pc = Point3::from(rot * obj.coords + tvec);
            match intrinsics.project(&pc) {
                Some(px) => {
                    out[2 * k] = px.x - img.x;
                    out[2 * k + 1] = px.y - img.y;
                }
                None => {
                    out[2 * k] = BEHIND_CAMERA_RESIDUAL;
                    out[2 * k + 1] = BEHIND_CAMERA_RESIDUAL;
                }
            }
        }
    }

    fn residuals(&self, p: &DVector<f64>) -> DVector<f64> {
        let intrinsics = Self::intrinsics(p);
        let per_view = 2 * self.object.len();
        let mut r = DVector::zeros(self.residual_count());
        for v in 0..self.views.len() {
            let (rv, tv) = Self::view_pose(p, v);
            self.view_residuals(
                &intrinsics,
                &rv,
                &tv,
                v,
                &mut r.as_mut_slice()[v * per_view..(v + 1) * per_view],
            );
        }
        r
    }

    /// Central-difference Jacobian. View parameters only touch their own
    /// residual block, so those columns are evaluated per view.
    fn jacobian(&self, p: &DVector<f64>) -> DMatrix<f64> {
        let m = self.residual_count();
        let per_view = 2 * self.object.len();
        let mut j = DMatrix::zeros(m, self.param_count());

        for c in 0..INTRINSIC_PARAMS {
            let h = step(p[c]);
            let mut plus = p.clone();
            plus[c] += h;
            let mut minus = p.clone();
            minus[c] -= h;
            let d = (self.residuals(&plus) - self.residuals(&minus)) / (2.0 * h);
            j.set_column(c, &d);
        }

        let intrinsics = Self::intrinsics(p);
        let mut plus = vec![0.0; per_view];
        let mut minus = vec![0.0; per_view];
        for v in 0..self.views.len() {
            let (rv, tv) = Self::view_pose(p, v);
            let mut pose = [rv.x, rv.y, rv.z, tv.x, tv.y, tv.z];
            for k in 0..VIEW_PARAMS {
                let h = step(pose[k]);
                let orig = pose[k];

                pose[k] = orig + h;
                let (r, t) = split_pose(&pose);
                self.view_residuals(&intrinsics, &r, &t, v, &mut plus);
                pose[k] = orig - h;
                let (r, t) = split_pose(&pose);
                self.view_residuals(&intrinsics, &r, &t, v, &mut minus);
                pose[k] = orig;

                let col = INTRINSIC_PARAMS + VIEW_PARAMS * v + k;
                for row in 0..per_view {
                    j[(v * per_view + row, col)] = (plus[row] - minus[row]) / (2.0 * h);
                }
            }
        }
        j
    }
}

#[inline]
fn step(x: f64) -> f64 {
    1e-6 * x.abs().max(1.0)
}

fn split_pose(pose: &[f64; VIEW_PARAMS]) -> (Vector3<f64>, Vector3<f64>) {
    (
        Vector3::new(pose[0], pose[1], pose[2]),
        Vector3::new(pose[3], pose[4], pose[5]),
    )
}

/// Levenberg–Marquardt with Marquardt (diagonal) damping. Deterministic: no
/// random restarts, fixed damping schedule.
fn refine(
    problem: &Problem,
    intrinsics: &CameraIntrinsics,
    poses: &[Pose],
    params: &CheckerboardParams,
) -> (DVector<f64>, usize) {
    let n = problem.param_count();
    let mut p = problem.pack(intrinsics, poses);
    let mut cost = problem.residuals(&p).norm_squared();
    let mut lambda = 1e-3;
    let mut iterations = 0;

    while iterations < params.max_iterations {
        iterations += 1;
        let r = problem.residuals(&p);
        let j = problem.jacobian(&p);
        let jt = j.transpose();
        let jtj = &jt * &j;
        let rhs = -(&jt * &r);

        let mut accepted = None;
        for _ in 0..MAX_DAMPING_STEPS {
            let mut a = jtj.clone();
            for k in 0..n {
                a[(k, k)] += lambda * jtj[(k, k)].max(1e-12);
            }
            let Some(chol) = a.cholesky() else {
                lambda *= 10.0;
                continue;
            };
            let candidate = &p + chol.solve(&rhs);
            let candidate_cost = problem.residuals(&candidate).norm_squared();
            if candidate_cost.is_finite() && candidate_cost < cost {
                accepted = Some((candidate, candidate_cost));
                lambda = (lambda * 0.3).max(1e-12);
                break;
            }
            lambda *= 10.0;
        }

        let Some((candidate, candidate_cost)) = accepted else {
            log::debug!("lm: no decrease at iteration {iterations}, cost {cost:.3e}");
            break;
        };
        let relative = (cost - candidate_cost) / cost.max(f64::MIN_POSITIVE);
        p = candidate;
        cost = candidate_cost;
        log::trace!("lm: iteration {iterations} cost {cost:.6e} lambda {lambda:.1e}");
        if relative < params.convergence_epsilon {
            break;
        }
    }
    (p, iterations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PatternSize;
    use approx::assert_relative_eq;

    fn truth() -> CameraIntrinsics {
        CameraIntrinsics::new(1000.0, 990.0, 640.0, 360.0)
    }

    fn view_pose(i: usize) -> Pose {
        let f = i as f64;
        Pose::from_rvec_tvec(
            Vector3::new(0.35 * (0.9 * f).sin(), 0.35 * (1.3 * f + 0.4).cos(), 0.1 * (0.7 * f).sin()),
            Vector3::new(-110.0 + 30.0 * (0.9 * f).sin(), -80.0 + 20.0 * (1.1 * f).cos(), 550.0 + 15.0 * f),
        )
    }

    fn project_board(cam: &CameraIntrinsics, pose: &Pose, params: &CheckerboardParams) -> Vec<Point2<f64>> {
        params
            .pattern
            .object_points(params.square_size)
            .iter()
            .map(|p| cam.project(&pose.transform(p)).expect("board in front of camera"))
            .collect()
    }

    fn board_params() -> CheckerboardParams {
        CheckerboardParams {
            pattern: PatternSize::new(10, 7),
            square_size: 25.0,
            ..CheckerboardParams::default()
        }
    }

    fn synthetic_views(cam: &CameraIntrinsics, count: usize, params: &CheckerboardParams) -> Vec<ViewDetection> {
        (0..count)
            .map(|i| ViewDetection::found(format!("view_{i:02}"), project_board(cam, &view_pose(i), params)))
            .collect()
    }

    #[test]
    fn recovers_intrinsics_from_noise_free_views() {
        let params = board_params();
        let cam = truth();
        let result = calibrate_from_detections(&synthetic_views(&cam, 12, &params), &params)
            .expect("calibration");

        assert_relative_eq!(result.intrinsics.fx, cam.fx, max_relative = 1e-5);
        assert_relative_eq!(result.intrinsics.fy, cam.fy, max_relative = 1e-5);
        assert_relative_eq!(result.intrinsics.cx, cam.cx, epsilon = 1e-2);
        assert_relative_eq!(result.intrinsics.cy, cam.cy, epsilon = 1e-2);
        assert!(result.rms_error < 1e-4, "rms {}", result.rms_error);
        assert_relative_eq!(
            result.views[3].pose.translation,
            view_pose(3).translation,
            epsilon = 1e-2
        );
    }

    #[test]
    fn estimates_mild_radial_distortion() {
        let params = board_params();
        let cam = truth().with_distortion(Distortion {
            k1: -0.05,
            k2: 0.01,
            ..Distortion::none()
        });
        let result = calibrate_from_detections(&synthetic_views(&cam, 12, &params), &params)
            .expect("calibration");

        assert_relative_eq!(result.intrinsics.fx, cam.fx, max_relative = 1e-2);
        assert!((result.intrinsics.distortion.k1 - cam.distortion.k1).abs() < 0.02);
        assert!(result.rms_error < 0.05, "rms {}", result.rms_error);
    }

    #[test]
    fn out_of_frame_images_are_skipped_not_fatal() {
        let params = board_params();
        let mut detections = synthetic_views(&truth(), 12, &params);
        detections.push(ViewDetection::failed("empty_a", CornerDetectionError::NotFound));
        detections.push(ViewDetection::failed("empty_b", CornerDetectionError::NotFound));
        detections.push(ViewDetection::found(
            "cropped",
            vec![Point2::new(10.0, 10.0); 40],
        ));

        let result = calibrate_from_detections(&detections, &params).expect("calibration");
        assert_eq!(result.summary.used.len(), 12);
        assert_eq!(result.summary.skipped.len(), 3);
        assert_eq!(
            result.summary.skipped[2].reason,
            CornerDetectionError::IncompleteGrid {
                expected: 70,
                found: 40
            }
        );
    }

    #[test]
    fn too_few_usable_images_fail() {
        let params = board_params();
        let mut detections = synthetic_views(&truth(), 5, &params);
        detections.push(ViewDetection::failed("blurred", CornerDetectionError::NotFound));

        match calibrate_from_detections(&detections, &params) {
            Err(CalibrateError::InsufficientCalibrationData { found, required }) => {
                assert_eq!(found, 5);
                assert_eq!(required, 10);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn repeated_runs_are_identical() {
        let params = board_params();
        let detections = synthetic_views(&truth(), 10, &params);
        let a = calibrate_from_detections(&detections, &params).expect("first");
        let b = calibrate_from_detections(&detections, &params).expect("second");
        assert_eq!(a.intrinsics, b.intrinsics);
        assert_eq!(a.iterations, b.iterations);
    }

    struct ListedCorners;

    impl CornerDetector for ListedCorners {
        type Image = Option<Vec<Point2<f64>>>;

        fn detect(
            &self,
            image: &Self::Image,
            _pattern: PatternSize,
        ) -> Result<Vec<Point2<f64>>, CornerDetectionError> {
            image.clone().ok_or(CornerDetectionError::NotFound)
        }
    }

    #[test]
    fn detector_driven_calibration_keeps_image_order() {
        let params = board_params();
        let cam = truth();
        let mut images: Vec<(String, Option<Vec<Point2<f64>>>)> = (0..12)
            .map(|i| (format!("img_{i:02}"), Some(project_board(&cam, &view_pose(i), &params))))
            .collect();
        images.insert(4, ("lens_cap".to_string(), None));

        let result = calibrate(&ListedCorners, &images, &params).expect("calibration");
        assert_eq!(result.summary.skipped[0].name, "lens_cap");
        assert_eq!(result.views[4].name, "img_04");
        assert_eq!(result.views.len(), 12);
    }
}
