mod common;

use approx::assert_relative_eq;
use nalgebra::{Point2, Point3};
use pianocal::camera::{CornerDetectionError, ViewDetection};
use pianocal::fusion::{FusionError, LandmarkPoint, LandmarkSample, MidiEvent};
use pianocal::keyboard::{KeyboardCorners, PixelSpace};
use pianocal::{
    pipeline, ArtifactError, ArtifactKind, ArtifactStore, CameraParamsRecord, FusionParams,
    KeyboardRecord, PianocalError,
};

fn marked_corners() -> KeyboardCorners {
    KeyboardCorners::new(
        Point2::new(300.0, 300.0),
        Point2::new(1000.0, 310.0),
        Point2::new(290.0, 420.0),
        Point2::new(1010.0, 432.0),
        100.0,
    )
    .expect("corners")
}

fn calibrated_store(lens: Option<&str>) -> (tempfile::TempDir, ArtifactStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ArtifactStore::new(dir.path());
    let mut detections = common::synthetic_detections(&common::camera(), 12);
    for name in ["out_of_frame_a", "out_of_frame_b", "out_of_frame_c"] {
        detections.push(ViewDetection::failed(name, CornerDetectionError::NotFound));
    }
    let calibration =
        pipeline::calibrate_camera(&store, &detections, &common::board_params(), lens)
            .expect("calibration");
    assert_eq!(calibration.summary.used.len(), 12);
    assert_eq!(calibration.summary.skipped.len(), 3);
    (dir, store)
}

#[test]
fn full_session_maps_raw_landmarks_through_undistortion() {
    let (_dir, store) = calibrated_store(None);
    let truth = common::camera();

    let k = pipeline::load_camera(&store, None)
        .expect("load")
        .expect("published");
    assert_relative_eq!(k.fx, truth.fx, max_relative = 1e-2);
    assert_relative_eq!(k.cy, truth.cy, max_relative = 1e-2);

    let frame = pipeline::build_keyboard(&store, &marked_corners(), true).expect("keyboard");
    assert_eq!(frame.pixel_space(), PixelSpace::Undistorted);
    let record: KeyboardRecord = store.load().expect("keyboard record");
    assert_eq!(record.pixel_space, PixelSpace::Undistorted);
    assert_eq!(record.key_boundaries.len(), 89);

    // A camera-space point on the ray through the middle of the key bed.
    let centre = frame.to_pixel(Point2::new(0.5, 0.5)).expect("finite");
    let n = k.pixel_to_normalized(centre);
    let ray_point = Point3::new(n.x * 900.0, n.y * 900.0, 900.0);

    let landmarks = [
        LandmarkSample {
            timestamp: 0.0,
            landmark_id: 4,
            point: LandmarkPoint::Pixel(marked_corners().top_left),
        },
        LandmarkSample {
            timestamp: 0.0,
            landmark_id: 8,
            point: LandmarkPoint::Camera(ray_point),
        },
    ];
    let midi = [MidiEvent {
        timestamp: 0.01,
        pitch: 21,
        velocity: 64,
    }];
    let fused = pipeline::fuse_session(&store, &landmarks, &midi, &FusionParams::default(), None)
        .expect("fuse");

    assert_eq!(fused.len(), 2);
    assert_relative_eq!(fused[0].keyspace_x, 0.0, epsilon = 1e-6);
    assert_relative_eq!(fused[0].keyspace_y, 0.0, epsilon = 1e-6);
    assert_eq!(fused[0].key_index, Some(0));
    assert_relative_eq!(fused[1].keyspace_x, 0.5, epsilon = 1e-6);
    assert_relative_eq!(fused[1].keyspace_y, 0.5, epsilon = 1e-6);
    for sample in &fused {
        assert_eq!(sample.active_notes.get(&21), Some(&64));
    }
}

#[test]
fn changed_lens_setting_blocks_fusion() {
    let (_dir, store) = calibrated_store(Some("35mm"));
    pipeline::build_keyboard(&store, &marked_corners(), true).expect("keyboard");

    let err = pipeline::fuse_session(&store, &[], &[], &FusionParams::default(), Some("50mm"))
        .expect_err("stale");
    assert!(matches!(
        err,
        PianocalError::Artifact(ArtifactError::CalibrationStale { .. })
    ));
    assert!(
        pipeline::fuse_session(&store, &[], &[], &FusionParams::default(), Some("35mm")).is_ok()
    );
}

#[test]
fn raw_keyboard_ignores_later_calibration() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ArtifactStore::new(dir.path());
    let frame = pipeline::build_keyboard(&store, &marked_corners(), false).expect("keyboard");
    assert_eq!(frame.pixel_space(), PixelSpace::Raw);

    store
        .publish(&CameraParamsRecord::from_intrinsics(&common::camera()))
        .expect("publish camera");
    let (rebuilt, intrinsics) = pipeline::load_keyboard(&store, None).expect("rebuild");
    assert!(intrinsics.is_some());
    assert_eq!(rebuilt.pixel_space(), PixelSpace::Raw);
    assert_eq!(rebuilt.boundaries(), frame.boundaries());

    let p = Point2::new(640.0, 380.0);
    assert_eq!(rebuilt.to_keyspace(p), frame.to_keyspace(p));
}

#[test]
fn non_monotonic_capture_aborts_fusion_without_touching_artifacts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ArtifactStore::new(dir.path());
    pipeline::build_keyboard(&store, &marked_corners(), false).expect("keyboard");
    let before = std::fs::read(store.path(ArtifactKind::Keyboard)).expect("read");

    let landmarks = [2.0, 1.0].map(|t| LandmarkSample {
        timestamp: t,
        landmark_id: 0,
        point: LandmarkPoint::Pixel(Point2::new(500.0, 350.0)),
    });
    let err = pipeline::fuse_session(&store, &landmarks, &[], &FusionParams::default(), None)
        .expect_err("decreasing timestamps");
    assert!(matches!(
        err,
        PianocalError::Fusion(FusionError::NonMonotonicTimestamp { index: 1, .. })
    ));
    assert_eq!(
        std::fs::read(store.path(ArtifactKind::Keyboard)).expect("read"),
        before
    );
}
