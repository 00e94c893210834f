//! `pianocal`: run the calibration steps of a recording setup and fuse
//! recordings into a keyboard-space timeline.

use clap::{Args, Parser, Subcommand};
use nalgebra::Point2;
use pianocal::camera::{CheckerboardParams, PatternSize};
use pianocal::core::piano;
use pianocal::fusion::{LandmarkSample, MidiEvent};
use pianocal::keyboard::{FrameError, KeyboardCorners};
use pianocal::{
    load_corner_files, pipeline, read_json, write_json, ArtifactError, ArtifactKind,
    CameraParamsRecord, PianocalError, RunConfig,
};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Pianocal(#[from] PianocalError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Usage(&'static str),
}

type CliResult = Result<(), CliError>;

#[derive(Parser, Debug)]
#[command(
    name = "pianocal",
    version,
    about = "Piano keyboard calibration and hand/MIDI fusion"
)]
struct Cli {
    /// JSON run configuration.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the `calibration/` artifacts (overrides the config).
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Current focus/zoom label of the camera (overrides the config).
    #[arg(long, global = true)]
    lens_setting: Option<String>,

    /// More log output: -v for debug, -vv for trace.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit JSON log lines.
    #[cfg(feature = "tracing")]
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Calibrate the camera from checkerboard detections.
    Calibrate(CalibrateArgs),
    /// Check how the camera is mounted from one photo of the keyboard.
    #[cfg(feature = "image")]
    Orientation(OrientationArgs),
    /// Build the keyboard frame from four marked corners.
    Keyboard(KeyboardArgs),
    /// Report the key under a pixel.
    Locate(LocateArgs),
    /// Fuse landmark and MIDI streams into a keyboard-space timeline.
    Fuse(FuseArgs),
    /// Check the camera parameters against the camera's current lens setting.
    CheckLens {
        /// Current focus/zoom label.
        setting: String,
    },
    /// Write a configuration file with every default spelled out.
    InitConfig {
        path: PathBuf,
    },
}

#[derive(Args, Debug)]
struct CalibrateArgs {
    /// Corner JSON files, one per calibration image.
    #[cfg_attr(feature = "chess", arg(long, num_args = 1.., required_unless_present = "images"))]
    #[cfg_attr(not(feature = "chess"), arg(long, num_args = 1.., required = true))]
    corners: Vec<PathBuf>,

    /// Calibration photos, searched with the ChESS grid detector.
    #[cfg(feature = "chess")]
    #[arg(long, num_args = 1.., conflicts_with = "corners")]
    images: Vec<PathBuf>,

    /// Inner corners per board row.
    #[arg(long)]
    cols: Option<usize>,

    /// Inner corners per board column.
    #[arg(long)]
    rows: Option<usize>,

    /// Board square edge length.
    #[arg(long)]
    square_size: Option<f64>,

    /// Minimum number of usable images.
    #[arg(long)]
    min_views: Option<usize>,

    /// Write the full report (per-image poses and errors, skipped images).
    #[arg(long)]
    report: Option<PathBuf>,
}

#[cfg(feature = "image")]
#[derive(Args, Debug)]
struct OrientationArgs {
    /// Photo of the keyboard taken with the recording camera.
    image: PathBuf,

    /// Publish an identity correction when the keyboard cannot be found.
    #[arg(long)]
    accept_identity: bool,

    /// Also write the corrected photo.
    #[arg(long)]
    corrected_out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct KeyboardArgs {
    /// Corner pixels as `x,y`: top-left, top-right, bottom-left, bottom-right.
    #[arg(long, num_args = 4, required = true, value_parser = parse_point, allow_hyphen_values = true)]
    corners: Vec<Point2<f64>>,

    /// Corners are clicks in any order.
    #[arg(long)]
    unordered: bool,

    /// Black-key length in millimetres.
    #[arg(long, default_value_t = piano::DEFAULT_BLACK_KEY_LENGTH)]
    black_key_length: f64,

    /// Mark on undistorted pixels using the published camera parameters.
    #[arg(long)]
    undistort: bool,
}

#[derive(Args, Debug)]
struct LocateArgs {
    /// Pixel as `x,y`.
    #[arg(value_parser = parse_point, allow_hyphen_values = true)]
    pixel: Point2<f64>,
}

#[derive(Args, Debug)]
struct FuseArgs {
    /// JSON array of landmark samples.
    #[arg(long)]
    landmarks: PathBuf,

    /// JSON array of MIDI events.
    #[arg(long)]
    midi: PathBuf,

    /// Output timeline; printed to stdout when omitted.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Landmark/MIDI pairing tolerance in seconds.
    #[arg(long)]
    tolerance: Option<f64>,

    /// Also write which landmarks play each sounding note.
    #[arg(long)]
    notes: Option<PathBuf>,
}

fn parse_point(s: &str) -> Result<Point2<f64>, String> {
    let (x, y) = s
        .split_once(',')
        .ok_or_else(|| format!("expected `x,y`, got {s:?}"))?;
    let parse = |v: &str| {
        v.trim()
            .parse::<f64>()
            .map_err(|e| format!("invalid coordinate {v:?}: {e}"))
    };
    Ok(Point2::new(parse(x)?, parse(y)?))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(cli: &Cli) {
    #[cfg(feature = "tracing")]
    {
        let _ = tracing_log::LogTracer::init();
        pianocal::core::init_tracing(cli.json_logs);
        if cli.verbose > 0 {
            log::debug!("tracing output is filtered by RUST_LOG; -v has no further effect");
        }
    }
    #[cfg(not(feature = "tracing"))]
    {
        let level = match cli.verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        };
        let _ = pianocal::core::init_with_level(level);
    }
}

fn load_config(cli: &Cli) -> Result<RunConfig, ArtifactError> {
    let mut cfg = match &cli.config {
        Some(path) => RunConfig::load_json(path)?,
        None => RunConfig::default(),
    };
    if let Some(root) = &cli.root {
        cfg.calibration_root = root.clone();
    }
    if let Some(lens) = &cli.lens_setting {
        cfg.lens_setting = Some(lens.clone());
    }
    Ok(cfg)
}

fn run(cli: Cli) -> CliResult {
    let cfg = load_config(&cli)?;
    match cli.command {
        Command::Calibrate(args) => calibrate(&cfg, args),
        #[cfg(feature = "image")]
        Command::Orientation(args) => orientation(&cfg, args),
        Command::Keyboard(args) => keyboard(&cfg, args),
        Command::Locate(args) => locate(&cfg, args),
        Command::Fuse(args) => fuse(&cfg, args),
        Command::CheckLens { setting } => {
            let record = cfg.store().load::<CameraParamsRecord>()?;
            record.check_lens_setting(&setting)?;
            println!("camera parameters are valid for lens setting {setting:?}");
            Ok(())
        }
        Command::InitConfig { path } => {
            RunConfig::default().write_json(&path)?;
            println!("wrote {}", path.display());
            Ok(())
        }
    }
}

fn checkerboard_params(cfg: &RunConfig, args: &CalibrateArgs) -> CheckerboardParams {
    let mut params = cfg.checkerboard.clone();
    params.pattern = PatternSize::new(
        args.cols.unwrap_or(params.pattern.cols),
        args.rows.unwrap_or(params.pattern.rows),
    );
    if let Some(square) = args.square_size {
        params.square_size = square;
    }
    if let Some(min) = args.min_views {
        params.min_valid_views = min;
    }
    params
}

fn calibrate(cfg: &RunConfig, args: CalibrateArgs) -> CliResult {
    let store = cfg.store();
    let params = checkerboard_params(cfg, &args);
    let lens = cfg.lens_setting.as_deref();

    #[cfg(feature = "chess")]
    let calibration = if args.images.is_empty() {
        let detections = load_corner_files(&args.corners)?;
        pipeline::calibrate_camera(&store, &detections, &params, lens)?
    } else {
        let mut images = Vec::with_capacity(args.images.len());
        for path in &args.images {
            let raw = pianocal::io::load_gray(path)?;
            let corrected = pipeline::normalize_frame(&store, &raw.view())?;
            images.push((path.display().to_string(), pianocal::io::to_luma(&corrected)?));
        }
        pipeline::calibrate_camera_images(&store, &images, &params, lens)?
    };
    #[cfg(not(feature = "chess"))]
    let calibration = {
        let detections = load_corner_files(&args.corners)?;
        pipeline::calibrate_camera(&store, &detections, &params, lens)?
    };

    for skipped in &calibration.summary.skipped {
        println!("skipped {}: {}", skipped.name, skipped.reason);
    }
    let k = &calibration.intrinsics;
    println!(
        "calibrated from {} images ({} skipped): fx={:.3} fy={:.3} cx={:.3} cy={:.3}, rms {:.4} px",
        calibration.summary.used.len(),
        calibration.summary.skipped.len(),
        k.fx,
        k.fy,
        k.cx,
        k.cy,
        calibration.rms_error
    );
    println!(
        "wrote {}",
        store.path(ArtifactKind::CameraParams).display()
    );
    if let Some(report) = &args.report {
        write_json(report, &calibration)?;
    }
    Ok(())
}

#[cfg(feature = "image")]
fn orientation(cfg: &RunConfig, args: OrientationArgs) -> CliResult {
    let store = cfg.store();
    let raw = pianocal::io::load_gray(&args.image)?;
    let metadata =
        pipeline::record_orientation(&store, &raw.view(), &cfg.orientation, args.accept_identity)?;
    println!("{}", serde_json::to_string_pretty(&metadata)?);

    if let Some(out) = &args.corrected_out {
        let corrected = pianocal::camera::apply_correction(&raw.view(), metadata.correction());
        pianocal::io::save_gray(out, &corrected)?;
        log::info!("wrote corrected frame to {}", out.display());
    }
    Ok(())
}

fn keyboard(cfg: &RunConfig, args: KeyboardArgs) -> CliResult {
    let store = cfg.store();
    let points: [Point2<f64>; 4] = args
        .corners
        .as_slice()
        .try_into()
        .map_err(|_| CliError::Usage("exactly four corners are required"))?;
    let corners = if args.unordered {
        KeyboardCorners::from_unordered(points, args.black_key_length)?
    } else {
        KeyboardCorners::from_array(points, args.black_key_length)?
    };

    let frame = pipeline::build_keyboard(&store, &corners, args.undistort)?;
    if let Some(k) = pipeline::load_camera(&store, cfg.lens_setting.as_deref())? {
        if let Some(pose) = frame.camera_pose(&k) {
            let c = pose.camera_center();
            log::info!(
                "camera centre in keyboard millimetres: ({:.1}, {:.1}, {:.1})",
                c.x,
                c.y,
                c.z
            );
        }
    }
    println!(
        "keyboard frame on {:?} pixels, black-key depth {:.3}; wrote {}",
        frame.pixel_space(),
        frame.black_depth(),
        store.path(ArtifactKind::Keyboard).display()
    );
    Ok(())
}

fn locate(cfg: &RunConfig, args: LocateArgs) -> CliResult {
    let (frame, intrinsics) = pipeline::load_keyboard(&cfg.store(), cfg.lens_setting.as_deref())?;
    let pixel = match intrinsics {
        Some(k) if frame.pixel_space() == pianocal::keyboard::PixelSpace::Undistorted => {
            k.undistort_pixel(args.pixel)
        }
        _ => args.pixel,
    };
    let keyspace = frame.to_keyspace(pixel);
    let key_index = frame.key_index_at(pixel);
    let key_under = frame.key_under(pixel);
    let report = serde_json::json!({
        "pixel": [args.pixel.x, args.pixel.y],
        "keyspace": keyspace.map(|k| [k.x, k.y]),
        "key_index": key_index,
        "key_under": key_under,
        "key_name": key_under.and_then(piano::pitch_of_key).map(piano::pitch_name),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn fuse(cfg: &RunConfig, args: FuseArgs) -> CliResult {
    let landmarks: Vec<LandmarkSample> = read_json(&args.landmarks)?;
    let midi: Vec<MidiEvent> = read_json(&args.midi)?;
    let mut params = cfg.fusion.clone();
    if let Some(tolerance) = args.tolerance {
        params.tolerance = tolerance;
    }

    let store = cfg.store();
    let timeline = pipeline::fuse_session(
        &store,
        &landmarks,
        &midi,
        &params,
        cfg.lens_setting.as_deref(),
    )?;
    if let Some(notes) = &args.notes {
        let attributions = pipeline::attribute_session(&store, &timeline, &cfg.attribution)?;
        write_json(notes, &attributions)?;
        println!(
            "wrote {} note attributions to {}",
            attributions.len(),
            notes.display()
        );
    }
    match &args.out {
        Some(out) => {
            write_json(out, &timeline)?;
            println!("wrote {} fused samples to {}", timeline.len(), out.display());
        }
        None => println!("{}", serde_json::to_string_pretty(&timeline)?),
    }
    Ok(())
}
