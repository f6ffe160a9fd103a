use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use clap::Parser;
use eyre::WrapErr;
use tracing::{error, info};

use facegate::display::ThroughputSink;
use facegate::ffmpeg_source::FfmpegStreamOpener;
use facegate::onnx::{OnnxFaceDetector, OnnxLandmarkDetector};
use facegate::orchestrator::{self, DisplaySinkFactory, EngineSet};
use facegate::recognition::RecognitionClient;
use facegate::{engines::CameraSource, logging};
use facegate_config_data::{parse_config_file, RecognitionConfig};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct FacegateCliArgs {
    /// Path to the pipeline configuration file.
    #[arg(default_value = "facegate.toml")]
    config_file: std::path::PathBuf,
}

fn main() -> std::process::ExitCode {
    dotenv::dotenv().ok();

    if let Err(e) = logging::init(Some("application.log")) {
        eprintln!("failed to initialize logging: {e:#}");
        return std::process::ExitCode::FAILURE;
    }

    let args = FacegateCliArgs::parse();
    match run(args) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

fn run(args: FacegateCliArgs) -> eyre::Result<()> {
    let cfg = parse_config_file(&args.config_file)
        .wrap_err_with(|| format!("reading config {}", args.config_file.display()))?;
    let recognition_cfg = RecognitionConfig::from_env()?;

    let client = Arc::new(RecognitionClient::connect(&recognition_cfg)?);
    let cameras = client.get_active_cameras(&cfg.cameras.prefix)?;
    eyre::ensure!(
        !cameras.is_empty(),
        "no active cameras match prefix {:?}",
        cfg.cameras.prefix
    );
    info!("{} cameras to capture:", cameras.len());
    for camera in &cameras {
        info!("  - {} (id {})", camera.name, camera.id);
    }

    let detector = Arc::new(OnnxFaceDetector::new(&cfg.detection.model_path)?);
    let landmarks = Arc::new(OnnxLandmarkDetector::new(
        &cfg.landmarks.model_path,
        cfg.landmarks.confidence_threshold,
    )?);
    let engines = EngineSet {
        detector,
        landmarks,
        opener: Arc::new(FfmpegStreamOpener::default()),
        sink: client,
    };

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            info!("interrupt received, shutting down");
            stop.store(true, Ordering::Relaxed);
        })
        .wrap_err("installing signal handler")?;
    }

    let display: Option<DisplaySinkFactory> = cfg
        .display
        .enabled
        .then(|| -> DisplaySinkFactory { Box::new(|_camera| Box::new(ThroughputSink::default())) });

    orchestrator::run_pipeline(&cfg, cameras, engines, stop, display)
}
