//! JSON run configuration shared by the CLI subcommands.

use crate::{ArtifactError, ArtifactStore};
use pianocal_camera::{CheckerboardParams, OrientationParams};
use pianocal_fusion::{AttributionParams, FusionParams};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

fn default_calibration_root() -> PathBuf {
    PathBuf::from(".")
}

/// Settings for one recording setup. Every field is optional in the file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunConfig {
    /// Directory holding the `calibration/` artifact tree.
    #[serde(default = "default_calibration_root")]
    pub calibration_root: PathBuf,
    /// Current focus/zoom label of the camera, checked against the one the
    /// camera parameters were measured at.
    #[serde(default)]
    pub lens_setting: Option<String>,
    #[serde(default)]
    pub checkerboard: CheckerboardParams,
    #[serde(default)]
    pub orientation: OrientationParams,
    #[serde(default)]
    pub fusion: FusionParams,
    #[serde(default)]
    pub attribution: AttributionParams,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            calibration_root: default_calibration_root(),
            lens_setting: None,
            checkerboard: CheckerboardParams::default(),
            orientation: OrientationParams::default(),
            fusion: FusionParams::default(),
            attribution: AttributionParams::default(),
        }
    }
}

impl RunConfig {
    /// Load a JSON config from disk.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, ArtifactError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write this config to disk as pretty JSON.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), ArtifactError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn store(&self) -> ArtifactStore {
        ArtifactStore::new(&self.calibration_root)
    }
}
