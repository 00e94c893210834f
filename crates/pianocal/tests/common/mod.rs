#![allow(dead_code)]

use nalgebra::{Point2, Vector3};
use pianocal::camera::{CheckerboardParams, PatternSize, ViewDetection};
use pianocal::core::{CameraIntrinsics, Distortion, Pose};
use std::fs;
use std::path::{Path, PathBuf};

pub const SQUARE_SIZE: f64 = 25.0;

pub fn camera() -> CameraIntrinsics {
    CameraIntrinsics::new(1000.0, 990.0, 640.0, 360.0).with_distortion(Distortion {
        k1: -0.05,
        k2: 0.01,
        ..Distortion::default()
    })
}

pub fn board_params() -> CheckerboardParams {
    CheckerboardParams {
        pattern: PatternSize::new(10, 7),
        square_size: SQUARE_SIZE,
        ..CheckerboardParams::default()
    }
}

fn view_pose(i: usize) -> Pose {
    let f = i as f64;
    Pose::from_rvec_tvec(
        Vector3::new(
            0.35 * (0.9 * f).sin(),
            0.35 * (1.3 * f + 0.4).cos(),
            0.1 * (0.7 * f).sin(),
        ),
        Vector3::new(
            -110.0 + 30.0 * (0.9 * f).sin(),
            -80.0 + 20.0 * (1.1 * f).cos(),
            550.0 + 15.0 * f,
        ),
    )
}

/// Board corners of view `i` as seen by `cam`, row-major.
pub fn project_board(cam: &CameraIntrinsics, i: usize) -> Vec<Point2<f64>> {
    let params = board_params();
    let pose = view_pose(i);
    params
        .pattern
        .object_points(params.square_size)
        .iter()
        .map(|p| {
            cam.project(&pose.transform(p))
                .expect("board in front of camera")
        })
        .collect()
}

pub fn synthetic_detections(cam: &CameraIntrinsics, count: usize) -> Vec<ViewDetection> {
    (0..count)
        .map(|i| ViewDetection::found(format!("view_{i:02}"), project_board(cam, i)))
        .collect()
}

/// Write `valid` corner files plus `out_of_frame` files without a board.
pub fn write_corner_files(dir: &Path, valid: usize, out_of_frame: usize) -> Vec<PathBuf> {
    let cam = camera();
    let mut paths = Vec::new();
    for i in 0..valid {
        let corners: Vec<[f64; 2]> = project_board(&cam, i)
            .iter()
            .map(|p| [p.x, p.y])
            .collect();
        let path = dir.join(format!("board_{i:02}.json"));
        let json = serde_json::json!({ "corners": corners });
        fs::write(&path, json.to_string()).expect("write corners");
        paths.push(path);
    }
    for i in 0..out_of_frame {
        let path = dir.join(format!("empty_{i:02}.json"));
        fs::write(&path, r#"{ "corners": [] }"#).expect("write corners");
        paths.push(path);
    }
    paths
}

/// Landmarks at t = 1, 2, 3 over a keyboard marked at `(10,10)-(110,60)`.
pub fn landmarks_json() -> serde_json::Value {
    serde_json::json!([
        { "timestamp": 1.0, "landmark_id": 8, "point": [60.0, 30.0] },
        { "timestamp": 2.0, "landmark_id": 8, "point": [10.5, 30.0] },
        { "timestamp": 3.0, "landmark_id": 8, "point": [200.0, 30.0] }
    ])
}

pub fn midi_json() -> serde_json::Value {
    serde_json::json!([
        { "timestamp": 1.0, "pitch": 60, "velocity": 100 },
        { "timestamp": 3.0, "pitch": 60, "velocity": 0 },
        { "timestamp": 3.0, "pitch": 64, "velocity": 80 }
    ])
}
