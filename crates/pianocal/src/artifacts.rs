//! Persisted calibration artifacts and the store that publishes them.
//!
//! Canonical layout under a store root:
//!
//! ```text
//! calibration/checkerboard/camera_params.json
//! calibration/camera_orientation.json
//! calibration/keyboard/keyboard_geometry.json
//! ```
//!
//! Writers stage a complete, synced file beside its canonical path under a
//! unique name and promote it with a rename. Readers only ever open canonical
//! paths, so they see either the previous artifact or the new one. A staged
//! file that is never promoted is removed when it is dropped.

use nalgebra::{Matrix3, Point2};
use pianocal_camera::{CameraCalibration, OrientationMetadata};
use pianocal_core::{CameraIntrinsics, Distortion};
use pianocal_keyboard::{FrameError, KeyboardCorners, KeyboardFrame, PixelSpace};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const BOUNDARY_TOLERANCE: f64 = 1e-9;

#[derive(thiserror::Error, Debug)]
pub enum ArtifactError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("no {kind} artifact at {}", path.display())]
    Missing { kind: ArtifactKind, path: PathBuf },
    #[error("invalid {kind} artifact: {reason}")]
    Invalid { kind: ArtifactKind, reason: String },
    #[error(
        "camera parameters are stale: measured at lens setting {recorded:?}, camera is now at {current:?}"
    )]
    CalibrationStale { recorded: String, current: String },
}

impl ArtifactError {
    fn invalid(kind: ArtifactKind, reason: impl Into<String>) -> Self {
        Self::Invalid {
            kind,
            reason: reason.into(),
        }
    }
}

/// The calibration artifacts a store knows about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    CameraParams,
    Orientation,
    Keyboard,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 3] = [Self::CameraParams, Self::Orientation, Self::Keyboard];

    /// Path relative to the store root.
    pub fn relative_path(self) -> &'static str {
        match self {
            Self::CameraParams => "calibration/checkerboard/camera_params.json",
            Self::Orientation => "calibration/camera_orientation.json",
            Self::Keyboard => "calibration/keyboard/keyboard_geometry.json",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CameraParams => f.write_str("camera parameters"),
            Self::Orientation => f.write_str("camera orientation"),
            Self::Keyboard => f.write_str("keyboard geometry"),
        }
    }
}

/// A record that lives at a fixed place in an [`ArtifactStore`].
pub trait Artifact: Serialize + DeserializeOwned {
    const KIND: ArtifactKind;

    /// Structural checks run before staging and after loading.
    fn check(&self) -> Result<(), ArtifactError> {
        Ok(())
    }
}

impl Artifact for OrientationMetadata {
    const KIND: ArtifactKind = ArtifactKind::Orientation;
}

/// Camera intrinsics as persisted after checkerboard calibration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraParamsRecord {
    pub intrinsic_matrix: [[f64; 3]; 3],
    /// OpenCV order `[k1, k2, p1, p2, k3]`.
    pub distortion_coeffs: Vec<f64>,
    /// Operator label for the focus/zoom setting the camera was calibrated at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lens_setting: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rms_error: Option<f64>,
}

impl CameraParamsRecord {
    pub fn from_intrinsics(intrinsics: &CameraIntrinsics) -> Self {
        let k = intrinsics.matrix();
        Self {
            intrinsic_matrix: [
                [k[(0, 0)], k[(0, 1)], k[(0, 2)]],
                [k[(1, 0)], k[(1, 1)], k[(1, 2)]],
                [k[(2, 0)], k[(2, 1)], k[(2, 2)]],
            ],
            distortion_coeffs: intrinsics.distortion.to_coeffs().to_vec(),
            lens_setting: None,
            rms_error: None,
        }
    }

    pub fn from_calibration(calibration: &CameraCalibration) -> Self {
        Self {
            rms_error: Some(calibration.rms_error),
            ..Self::from_intrinsics(&calibration.intrinsics)
        }
    }

    pub fn with_lens_setting(mut self, lens_setting: impl Into<String>) -> Self {
        self.lens_setting = Some(lens_setting.into());
        self
    }

    pub fn intrinsics(&self) -> Result<CameraIntrinsics, ArtifactError> {
        self.check()?;
        Ok(self.intrinsics_unchecked())
    }

    fn intrinsics_unchecked(&self) -> CameraIntrinsics {
        let k = Matrix3::from_fn(|r, c| self.intrinsic_matrix[r][c]);
        CameraIntrinsics::from_matrix(&k, Distortion::from_coeffs(&self.distortion_coeffs))
    }

    /// Compare the recorded lens setting against the camera's current one.
    ///
    /// Intrinsics stay valid only for the focus/zoom they were measured at.
    /// A record without a lens setting cannot be checked and passes with a
    /// warning.
    pub fn check_lens_setting(&self, current: &str) -> Result<(), ArtifactError> {
        match &self.lens_setting {
            Some(recorded) if recorded != current => Err(ArtifactError::CalibrationStale {
                recorded: recorded.clone(),
                current: current.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                log::warn!(
                    "camera parameters carry no lens setting; cannot confirm they match {current:?}"
                );
                Ok(())
            }
        }
    }
}

impl Artifact for CameraParamsRecord {
    const KIND: ArtifactKind = ArtifactKind::CameraParams;

    fn check(&self) -> Result<(), ArtifactError> {
        let m = &self.intrinsic_matrix;
        if m.iter()
            .flatten()
            .chain(self.distortion_coeffs.iter())
            .any(|v| !v.is_finite())
        {
            return Err(ArtifactError::invalid(Self::KIND, "non-finite value"));
        }
        if m[1][0] != 0.0 || m[2][0] != 0.0 || m[2][1] != 0.0 || m[2][2] == 0.0 {
            return Err(ArtifactError::invalid(
                Self::KIND,
                "intrinsic matrix is not upper triangular",
            ));
        }
        let k = self.intrinsics_unchecked();
        if k.fx <= 0.0 || k.fy <= 0.0 {
            return Err(ArtifactError::invalid(
                Self::KIND,
                "focal lengths must be positive",
            ));
        }
        if self.distortion_coeffs.iter().skip(Distortion::COUNT).any(|c| *c != 0.0) {
            log::warn!(
                "ignoring {} distortion coefficients beyond [k1, k2, p1, p2, k3]",
                self.distortion_coeffs.len() - Distortion::COUNT
            );
        }
        Ok(())
    }
}

/// Marked keyboard geometry as persisted after corner marking.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyboardRecord {
    /// `[top-left, top-right, bottom-left, bottom-right]` pixel corners.
    pub corners: [[f64; 2]; 4],
    pub black_key_length: f64,
    /// The 89 keyspace-x edges of the 88 keys, A0 to C8.
    pub key_boundaries: Vec<f64>,
    /// Pixel space the corners were marked in. Older records without the
    /// field are raw.
    #[serde(default)]
    pub pixel_space: PixelSpace,
}

impl KeyboardRecord {
    pub fn from_frame(frame: &KeyboardFrame) -> Self {
        let corners = frame.corners();
        Self {
            corners: corners.points().map(|p| [p.x, p.y]),
            black_key_length: corners.black_key_length,
            key_boundaries: frame.boundaries().to_vec(),
            pixel_space: frame.pixel_space(),
        }
    }

    pub fn keyboard_corners(&self) -> Result<KeyboardCorners, ArtifactError> {
        let points = self.corners.map(|[x, y]| Point2::new(x, y));
        Ok(KeyboardCorners::from_array(points, self.black_key_length)?)
    }

    /// Rebuild the keyboard frame.
    ///
    /// A frame marked on undistorted pixels needs the same intrinsics again;
    /// rebuilding it without them would silently mix pixel spaces.
    pub fn to_frame(
        &self,
        intrinsics: Option<&CameraIntrinsics>,
    ) -> Result<KeyboardFrame, ArtifactError> {
        let corners = self.keyboard_corners()?;
        let frame = match (self.pixel_space, intrinsics) {
            (PixelSpace::Raw, _) => KeyboardFrame::build(&corners, None)?,
            (PixelSpace::Undistorted, Some(k)) => KeyboardFrame::build(&corners, Some(k))?,
            (PixelSpace::Undistorted, None) => {
                return Err(ArtifactError::invalid(
                    Self::KIND,
                    "corners were marked on undistorted pixels but no camera parameters are available",
                ))
            }
        };
        let rebuilt = frame.boundaries();
        let matches = rebuilt.len() == self.key_boundaries.len()
            && rebuilt
                .iter()
                .zip(&self.key_boundaries)
                .all(|(a, b)| (a - b).abs() <= BOUNDARY_TOLERANCE);
        if !matches {
            return Err(ArtifactError::invalid(
                Self::KIND,
                "stored key boundaries differ from the standard key layout",
            ));
        }
        Ok(frame)
    }
}

impl Artifact for KeyboardRecord {
    const KIND: ArtifactKind = ArtifactKind::Keyboard;

    fn check(&self) -> Result<(), ArtifactError> {
        let b = &self.key_boundaries;
        if b.len() != pianocal_core::piano::KEY_COUNT + 1 {
            return Err(ArtifactError::invalid(
                Self::KIND,
                format!("expected 89 key boundaries, found {}", b.len()),
            ));
        }
        if b.windows(2)
            .any(|w| w[0].partial_cmp(&w[1]) != Some(std::cmp::Ordering::Less))
        {
            return Err(ArtifactError::invalid(
                Self::KIND,
                "key boundaries are not strictly increasing",
            ));
        }
        if b[0].abs() > BOUNDARY_TOLERANCE || (b[b.len() - 1] - 1.0).abs() > BOUNDARY_TOLERANCE {
            return Err(ArtifactError::invalid(
                Self::KIND,
                "key boundaries must span keyspace x from 0 to 1",
            ));
        }
        self.keyboard_corners()?;
        Ok(())
    }
}

/// Load a JSON file.
pub fn read_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, ArtifactError> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Write `value` to disk as pretty JSON.
pub fn write_json<T: Serialize + ?Sized>(
    path: impl AsRef<Path>,
    value: &T,
) -> Result<(), ArtifactError> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json)?;
    Ok(())
}

/// Directory of published calibration artifacts.
#[derive(Clone, Debug)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Canonical path of `kind`.
    pub fn path(&self, kind: ArtifactKind) -> PathBuf {
        self.root.join(kind.relative_path())
    }

    pub fn contains(&self, kind: ArtifactKind) -> bool {
        self.path(kind).is_file()
    }

    /// Write `artifact` to a fresh staging file. The published artifact is
    /// untouched until [`StagedArtifact::promote`].
    pub fn stage<A: Artifact>(&self, artifact: &A) -> Result<StagedArtifact, ArtifactError> {
        artifact.check()?;
        let target = self.path(A::KIND);
        let dir = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&dir)?;

        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut file = tempfile::Builder::new()
            .prefix(&format!(".{file_name}."))
            .suffix(".staged")
            .tempfile_in(&dir)?;
        serde_json::to_writer_pretty(&mut file, artifact)?;
        file.flush()?;
        file.as_file().sync_all()?;
        log::debug!("staged {} at {}", A::KIND, file.path().display());
        Ok(StagedArtifact {
            kind: A::KIND,
            file,
            target,
        })
    }

    /// Stage and immediately promote `artifact`.
    pub fn publish<A: Artifact>(&self, artifact: &A) -> Result<PathBuf, ArtifactError> {
        self.stage(artifact)?.promote()
    }

    pub fn load<A: Artifact>(&self) -> Result<A, ArtifactError> {
        let path = self.path(A::KIND);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ArtifactError::Missing {
                    kind: A::KIND,
                    path,
                })
            }
            Err(e) => return Err(e.into()),
        };
        let artifact: A = serde_json::from_str(&raw)?;
        artifact.check()?;
        Ok(artifact)
    }

    /// Like [`ArtifactStore::load`], with `None` for an artifact that was
    /// never published.
    pub fn load_optional<A: Artifact>(&self) -> Result<Option<A>, ArtifactError> {
        match self.load() {
            Ok(artifact) => Ok(Some(artifact)),
            Err(ArtifactError::Missing { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// A fully written artifact waiting to be promoted to its canonical path.
#[derive(Debug)]
#[must_use = "a staged artifact is deleted unless promoted"]
pub struct StagedArtifact {
    kind: ArtifactKind,
    file: NamedTempFile,
    target: PathBuf,
}

impl StagedArtifact {
    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    /// Where the staged file currently lives.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Replace the published artifact with the staged one in a single rename.
    /// On failure the staged file is removed and the published one is kept.
    pub fn promote(self) -> Result<PathBuf, ArtifactError> {
        self.file
            .persist(&self.target)
            .map_err(|e| ArtifactError::Io(e.error))?;
        sync_parent(&self.target);
        log::info!("published {} to {}", self.kind, self.target.display());
        Ok(self.target)
    }

    pub fn discard(self) -> Result<(), ArtifactError> {
        self.file.close()?;
        Ok(())
    }
}

/// Flush the directory entry of a promoted file.
#[cfg(unix)]
fn sync_parent(path: &Path) {
    if let Some(dir) = path.parent().and_then(|d| fs::File::open(d).ok()) {
        if let Err(e) = dir.sync_all() {
            log::warn!("could not sync {}: {e}", path.display());
        }
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use pianocal_camera::{HandSidedness, QuarterTurn};

    fn camera() -> CameraIntrinsics {
        CameraIntrinsics::new(1200.0, 1180.0, 960.0, 540.0).with_distortion(Distortion {
            k1: -0.08,
            k2: 0.01,
            ..Distortion::default()
        })
    }

    fn keyboard_record(intrinsics: Option<&CameraIntrinsics>) -> KeyboardRecord {
        let corners = KeyboardCorners::new(
            Point2::new(100.0, 400.0),
            Point2::new(1800.0, 410.0),
            Point2::new(90.0, 640.0),
            Point2::new(1815.0, 655.0),
            95.0,
        )
        .expect("valid corners");
        let frame = KeyboardFrame::build(&corners, intrinsics).expect("frame");
        KeyboardRecord::from_frame(&frame)
    }

    #[test]
    fn camera_params_round_trip_through_the_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let record = CameraParamsRecord::from_intrinsics(&camera()).with_lens_setting("35mm f/4");

        let path = store.publish(&record).expect("publish");
        assert!(path.ends_with("calibration/checkerboard/camera_params.json"));

        let loaded: CameraParamsRecord = store.load().expect("load");
        assert_eq!(loaded, record);
        assert_eq!(loaded.intrinsics().expect("intrinsics"), camera());
    }

    #[test]
    fn camera_params_use_the_documented_field_names() {
        let json = serde_json::to_value(CameraParamsRecord::from_intrinsics(&camera()))
            .expect("serialize");
        assert_eq!(json["intrinsic_matrix"][0][0], 1200.0);
        assert_eq!(json["intrinsic_matrix"][2][2], 1.0);
        assert_eq!(json["distortion_coeffs"].as_array().map(Vec::len), Some(5));
        assert!(json.get("lens_setting").is_none());
    }

    #[test]
    fn staged_artifact_is_invisible_until_promoted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let old = OrientationMetadata::identity();
        store.publish(&old).expect("publish");

        let new = OrientationMetadata {
            keyboard_top: false,
            hand_sidedness: HandSidedness::Mirrored,
            correction_rotation_deg: QuarterTurn::Deg180,
        };
        let staged = store.stage(&new).expect("stage");
        assert!(staged.path().is_file());
        assert_eq!(store.load::<OrientationMetadata>().expect("load"), old);

        staged.promote().expect("promote");
        assert_eq!(store.load::<OrientationMetadata>().expect("load"), new);
    }

    #[test]
    fn discarded_stage_leaves_published_artifact() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let record = keyboard_record(None);
        store.publish(&record).expect("publish");

        let mut edited = record.clone();
        edited.black_key_length = 120.0;
        let staged = store.stage(&edited).expect("stage");
        let staged_path = staged.path().to_path_buf();
        staged.discard().expect("discard");

        assert!(!staged_path.exists());
        assert_eq!(store.load::<KeyboardRecord>().expect("load"), record);
    }

    #[test]
    fn failed_promotion_leaves_no_staging_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let target = store.path(ArtifactKind::Orientation);
        fs::create_dir_all(target.join("blocker")).expect("mkdir");

        assert!(store.publish(&OrientationMetadata::identity()).is_err());
        let parent = target.parent().expect("parent");
        let entries: Vec<_> = fs::read_dir(parent)
            .expect("read dir")
            .map(|e| e.expect("entry").file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("camera_orientation.json")]);
        assert!(target.is_dir());
    }

    #[test]
    fn dropped_stage_is_cleaned_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let staged = store.stage(&OrientationMetadata::identity()).expect("stage");
        let staged_path = staged.path().to_path_buf();
        assert!(staged_path.is_file());
        assert!(staged_path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(".camera_orientation.json.") && n.ends_with(".staged")));

        drop(staged);
        assert!(!staged_path.exists());
        assert!(!store.contains(ArtifactKind::Orientation));
    }

    #[test]
    fn missing_artifacts_are_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        assert!(matches!(
            store.load::<CameraParamsRecord>(),
            Err(ArtifactError::Missing {
                kind: ArtifactKind::CameraParams,
                ..
            })
        ));
        assert!(store
            .load_optional::<KeyboardRecord>()
            .expect("load")
            .is_none());
        assert!(!store.contains(ArtifactKind::Keyboard));
    }

    #[test]
    fn lens_setting_change_marks_calibration_stale() {
        let record = CameraParamsRecord::from_intrinsics(&camera()).with_lens_setting("wide");
        assert!(record.check_lens_setting("wide").is_ok());
        let err = record.check_lens_setting("tele").expect_err("stale");
        assert!(matches!(
            err,
            ArtifactError::CalibrationStale { ref recorded, ref current }
                if recorded == "wide" && current == "tele"
        ));
        assert!(CameraParamsRecord::from_intrinsics(&camera())
            .check_lens_setting("tele")
            .is_ok());
    }

    #[test]
    fn implausible_camera_matrix_is_rejected() {
        let mut record = CameraParamsRecord::from_intrinsics(&camera());
        record.intrinsic_matrix[0][0] = -5.0;
        assert!(matches!(
            record.intrinsics(),
            Err(ArtifactError::Invalid { .. })
        ));
        record.intrinsic_matrix[0][0] = f64::NAN;
        assert!(record.check().is_err());
    }

    #[test]
    fn keyboard_record_rebuilds_its_frame() {
        let record = keyboard_record(None);
        assert_eq!(record.key_boundaries.len(), 89);
        let frame = record.to_frame(None).expect("frame");
        assert_eq!(frame.pixel_space(), PixelSpace::Raw);
        assert_eq!(KeyboardRecord::from_frame(&frame), record);
    }

    #[test]
    fn undistorted_keyboard_needs_intrinsics() {
        let cam = camera();
        let record = keyboard_record(Some(&cam));
        assert_eq!(record.pixel_space, PixelSpace::Undistorted);
        assert!(matches!(
            record.to_frame(None),
            Err(ArtifactError::Invalid {
                kind: ArtifactKind::Keyboard,
                ..
            })
        ));
        let frame = record.to_frame(Some(&cam)).expect("frame");
        assert_eq!(frame.pixel_space(), PixelSpace::Undistorted);
    }

    #[test]
    fn tampered_boundaries_are_rejected() {
        let mut record = keyboard_record(None);
        record.key_boundaries.pop();
        assert!(record.check().is_err());

        let mut record = keyboard_record(None);
        record.key_boundaries[40] += 1e-3;
        assert!(record.check().is_ok());
        assert!(matches!(
            record.to_frame(None),
            Err(ArtifactError::Invalid { .. })
        ));
    }

    #[test]
    fn keyboard_record_without_pixel_space_is_raw() {
        let record = keyboard_record(None);
        let mut json = serde_json::to_value(&record).expect("serialize");
        json.as_object_mut()
            .expect("object")
            .remove("pixel_space");
        let back: KeyboardRecord = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back.pixel_space, PixelSpace::Raw);
    }
}
