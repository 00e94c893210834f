//! Input files produced by external collaborators.

use crate::{read_json, ArtifactError};
use nalgebra::Point2;
use pianocal_camera::{CornerDetectionError, ViewDetection};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Checkerboard corners found in one calibration image.
///
/// `corners` lists the inner corners row by row; an empty list means the
/// detector did not find the board.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CornerFile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub corners: Vec<[f64; 2]>,
}

impl CornerFile {
    pub fn into_detection(self, fallback_name: &str) -> ViewDetection {
        let name = self.name.unwrap_or_else(|| fallback_name.to_string());
        if self.corners.is_empty() {
            return ViewDetection::failed(name, CornerDetectionError::NotFound);
        }
        let corners = self
            .corners
            .into_iter()
            .map(|[x, y]| Point2::new(x, y))
            .collect();
        ViewDetection::found(name, corners)
    }
}

/// Read one corner file per calibration image, named after the file stem
/// unless the file names itself.
pub fn load_corner_files<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<ViewDetection>, ArtifactError> {
    paths
        .iter()
        .map(|path| {
            let path = path.as_ref();
            let file: CornerFile = read_json(path)?;
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            Ok(file.into_detection(&stem))
        })
        .collect()
}
