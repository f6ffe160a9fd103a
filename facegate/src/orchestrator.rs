//! Pipeline orchestration: owns the queues, the stop flags, and the
//! worker pools, and performs the staged graceful drain at shutdown.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use eyre::{Result, WrapErr};
use tracing::{info, warn};

use facegate_config_data::FacegateConfig;
use facegate_types::CameraInfo;

use crate::capture;
use crate::detect::{self, DetectionWorker, DetectionWorkerConfig};
use crate::dispatch::{self, DispatchStats};
use crate::display::{self, DisplaySink};
use crate::engines::{DetectParams, EventSink, FaceDetector, LandmarkDetector, StreamOpener};
use crate::trackman::{self, TrackManagerConfig, TrackStore};
use crate::PipelineQueues;

/// The concrete collaborators the pipeline runs against.
pub struct EngineSet {
    pub detector: Arc<dyn FaceDetector>,
    pub landmarks: Arc<dyn LandmarkDetector>,
    pub opener: Arc<dyn StreamOpener>,
    pub sink: Arc<dyn EventSink>,
}

/// Builds one display sink per camera when the display is enabled.
pub type DisplaySinkFactory = Box<dyn Fn(&CameraInfo) -> Box<dyn DisplaySink> + Send>;

/// Run the whole pipeline until `stop` is raised, then drain and join
/// everything. Blocks the calling thread for the lifetime of the pipeline.
pub fn run_pipeline(
    cfg: &FacegateConfig,
    cameras: Vec<CameraInfo>,
    engines: EngineSet,
    stop: Arc<AtomicBool>,
    display_sinks: Option<DisplaySinkFactory>,
) -> Result<()> {
    let cameras: Vec<Arc<CameraInfo>> = cameras.into_iter().map(Arc::new).collect();
    let queues = PipelineQueues::new(&cfg.queues);
    let cpu_count = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(8);
    let workers = cfg.workers.resolved(cpu_count);

    let params = DetectParams {
        confidence_threshold: cfg.detection.confidence_threshold,
        iou_threshold: cfg.detection.iou_threshold,
        inference_size: cfg.processing.inference_size,
    };
    info!("warming up the detection model");
    detect::warm_up(engines.detector.as_ref(), &params).wrap_err("detector warm-up failed")?;

    let store = Arc::new(TrackStore::new(
        TrackManagerConfig::from_config(&cfg.tracking, &cfg.movement),
        queues.uploads.clone(),
    ));

    // Dispatchers drain past the main stop flag; their own flag is raised
    // only after the track managers have flushed into the uploads queue.
    let dispatch_stop = Arc::new(AtomicBool::new(false));

    // Spawn pools in dependency order, consumers first.
    let mut dispatchers: Vec<(String, JoinHandle<DispatchStats>)> = Vec::new();
    for worker_id in 0..workers.dispatch {
        let name = format!("dispatch-{worker_id}");
        let uploads = queues.uploads.clone();
        let sink = engines.sink.clone();
        let stop = dispatch_stop.clone();
        let timeout = workers.queue_timeout;
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || dispatch::run_dispatch_worker(worker_id, uploads, sink, timeout, stop))
            .wrap_err("spawning dispatcher")?;
        dispatchers.push((name, handle));
    }

    let mut track_workers = Vec::new();
    for worker_id in 0..workers.track {
        let name = format!("trackman-{worker_id}");
        let store = store.clone();
        let events = queues.events.clone();
        let stop = stop.clone();
        let timeout = workers.queue_timeout;
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || trackman::run_track_worker(worker_id, store, events, timeout, stop))
            .wrap_err("spawning track manager")?;
        track_workers.push((name, handle));
    }

    let display_enabled = cfg.display.enabled && display_sinks.is_some();
    let rings = if display_enabled {
        display::build_rings(&cameras)
    } else {
        Default::default()
    };

    let batch_size = if engines.detector.is_accelerated() {
        cfg.processing.accel_batch_size
    } else {
        cfg.processing.cpu_batch_size
    };
    let mut detectors = Vec::new();
    for worker_id in 0..workers.detection {
        let name = format!("detect-{worker_id}");
        let worker = DetectionWorker {
            worker_id,
            frames: queues.frames.clone(),
            events: queues.events.clone(),
            detector: engines.detector.clone(),
            landmarks: engines.landmarks.clone(),
            config: DetectionWorkerConfig {
                batch_size,
                queue_timeout: workers.queue_timeout,
                params,
                min_bbox_width: cfg.filter.min_bbox_width,
                min_confidence: cfg.filter.min_confidence,
            },
            display: rings.clone(),
        };
        let stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker.run(&stop))
            .wrap_err("spawning detection worker")?;
        detectors.push((name, handle));
    }

    let mut captures = Vec::new();
    for camera in &cameras {
        let name = format!("capture-{}", camera.name);
        let camera = camera.clone();
        let opener = engines.opener.clone();
        let frames = queues.frames.clone();
        let settings = cfg.cameras.clone();
        let stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || capture::run_capture(camera, opener, frames, settings, stop))
            .wrap_err("spawning capture task")?;
        captures.push((name, handle));
    }

    let mut display_workers = Vec::new();
    if let Some(factory) = display_sinks.filter(|_| display_enabled) {
        for camera in &cameras {
            let name = format!("display-{}", camera.name);
            let sink = factory(camera);
            let camera = camera.clone();
            let rings = rings.clone();
            let stop = stop.clone();
            let fps_limit = cfg.display.fps_limit;
            let window = (cfg.display.window_width, cfg.display.window_height);
            let handle = std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    display::run_display_worker(camera, rings, sink, window, fps_limit, stop)
                })
                .wrap_err("spawning display task")?;
            display_workers.push((name, handle));
        }
    }

    info!(
        "pipeline running: {} cameras, {} detection / {} track / {} dispatch workers{}",
        cameras.len(),
        workers.detection,
        workers.track,
        workers.dispatch,
        if display_enabled {
            format!(", {} display tasks", display_workers.len())
        } else {
            String::new()
        }
    );

    // Park until the stop flag (signal handler or embedding caller).
    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
    }

    // Staged drain: producers first, then each stage in flow order, so
    // every in-flight item gets its chance to reach the sink.
    info!("stop requested, draining pipeline");
    let deadline = Instant::now() + Duration::from_secs_f64(cfg.drain_timeout_secs);

    join_with_deadline(captures, deadline);
    join_with_deadline(detectors, deadline);
    join_with_deadline(track_workers, deadline);

    // Track workers are gone; flush whatever trajectories remain.
    store.finalize_all();
    dispatch_stop.store(true, Ordering::Relaxed);
    let stats = join_with_deadline(dispatchers, deadline);
    join_with_deadline(display_workers, deadline);

    report_leftovers(&queues);

    let totals = stats
        .into_iter()
        .fold(DispatchStats::default(), |acc, s| acc + s);
    info!(
        "shutdown complete: {} uploads succeeded, {} failed",
        totals.success, totals.failure
    );
    Ok(())
}

/// Join each handle, giving the whole group until `deadline`. A thread
/// that does not finish in time is logged and left detached; it cannot
/// keep the process alive.
fn join_with_deadline<T>(handles: Vec<(String, JoinHandle<T>)>, deadline: Instant) -> Vec<T> {
    let mut results = Vec::new();
    for (name, handle) in handles {
        while !handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        if handle.is_finished() {
            match handle.join() {
                Ok(value) => results.push(value),
                Err(_) => warn!("worker thread {name} panicked"),
            }
        } else {
            warn!("worker thread {name} did not exit before the drain deadline");
        }
    }
    results
}

/// Log and release anything still sitting in a queue after the drain.
fn report_leftovers(queues: &PipelineQueues) {
    for (name, len) in [
        ("frames", queues.frames.len()),
        ("events", queues.events.len()),
        ("uploads", queues.uploads.len()),
    ] {
        if len > 0 {
            warn!("queue {name} still holds {len} items after drain, releasing them");
        }
    }
    while queues.frames.try_get().is_some() {}
    while queues.events.try_get().is_some() {}
    while queues.uploads.try_get().is_some() {}
}
