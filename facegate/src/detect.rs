//! Detection worker pool: frames in, face events out.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use tracing::{debug, info, warn};

use bounded_queue::BoundedQueue;
use face_matching::face_quality;
use facegate_types::{FaceDetection, FaceEvent, Frame, Landmarks};

use crate::display::DisplayRings;
use crate::engines::{DetectParams, FaceDetector, LandmarkDetector};

#[derive(Clone)]
pub struct DetectionWorkerConfig {
    pub batch_size: usize,
    pub queue_timeout: Duration,
    pub params: DetectParams,
    pub min_bbox_width: i32,
    pub min_confidence: f32,
}

pub struct DetectionWorker {
    pub worker_id: usize,
    pub frames: BoundedQueue<Frame>,
    pub events: BoundedQueue<FaceEvent>,
    pub detector: Arc<dyn FaceDetector>,
    pub landmarks: Arc<dyn LandmarkDetector>,
    pub config: DetectionWorkerConfig,
    /// Per-camera display rings; empty when the display is disabled.
    pub display: DisplayRings,
}

/// Run one inference on a black frame so any lazy backend initialization
/// happens before the worker pool starts pulling real frames.
pub fn warm_up(detector: &dyn FaceDetector, params: &DetectParams) -> eyre::Result<()> {
    let side = params.inference_size;
    let camera = Arc::new(facegate_types::CameraInfo {
        id: facegate_types::CameraId(0),
        name: "warmup".into(),
        stream_url: String::new(),
        token: String::new(),
    });
    let dummy = Frame::new(
        0,
        camera,
        chrono::Local::now(),
        side,
        side,
        vec![0u8; side as usize * side as usize * 3],
    );
    let _ = detector.detect(&[dummy], params)?;
    Ok(())
}

impl DetectionWorker {
    /// Worker loop. After the stop flag is raised the worker keeps pulling
    /// until the frames queue is empty, so in-flight frames drain.
    pub fn run(&self, stop: &AtomicBool) {
        info!(
            "detection worker {} started (batch size {})",
            self.worker_id, self.config.batch_size
        );
        loop {
            if stop.load(Ordering::Relaxed) && self.frames.is_empty() {
                break;
            }
            let batch = self
                .frames
                .get_batch(self.config.batch_size, self.config.queue_timeout);
            if batch.is_empty() {
                continue;
            }
            debug!(
                "worker {}: pulled {} frames (queue depth {})",
                self.worker_id,
                batch.len(),
                self.frames.len()
            );
            let detections = match self.detector.detect(&batch, &self.config.params) {
                Ok(d) => d,
                Err(e) => {
                    warn!(
                        "worker {}: detector failed on batch of {}: {e:#}",
                        self.worker_id,
                        batch.len()
                    );
                    continue;
                }
            };
            for (frame, frame_detections) in batch.into_iter().zip(detections) {
                self.process_frame(frame, frame_detections);
            }
            // The batch vector is gone here; each frame buffer now lives
            // exactly as long as the events that reference it.
        }
        info!("detection worker {} finished", self.worker_id);
    }

    /// Turn one frame's raw detections into events and offer them to the
    /// events queue.
    pub fn process_frame(&self, frame: Frame, detections: Vec<FaceDetection>) {
        let surviving: Vec<FaceDetection> = detections
            .into_iter()
            .filter(|d| {
                let bbox = d.bbox.clamped(frame.width, frame.height);
                !bbox.is_degenerate()
                    && bbox.width() >= self.config.min_bbox_width
                    && d.confidence >= self.config.min_confidence
            })
            .collect();

        if surviving.is_empty() {
            self.push_display(&frame, &[]);
            return;
        }

        // One landmark call for all of this frame's crops.
        let crops: Vec<_> = surviving.iter().map(|d| frame.crop(&d.bbox)).collect();
        let landmark_sets = match self.landmarks.detect(&crops) {
            Ok(sets) => sets,
            Err(e) => {
                warn!(
                    "worker {}: landmark model failed on {} crops: {e:#}",
                    self.worker_id,
                    crops.len()
                );
                vec![Landmarks::empty(); surviving.len()]
            }
        };

        let mut queued = Vec::new();
        for (detection, crop_landmarks) in surviving.into_iter().zip(landmark_sets) {
            let bbox = detection.bbox.clamped(frame.width, frame.height);
            // Landmark coordinates arrive crop-local; shift into the frame.
            let landmarks = Landmarks::new(
                crop_landmarks
                    .points()
                    .iter()
                    .map(|(x, y)| (x + bbox.x1 as f32, y + bbox.y1 as f32))
                    .collect(),
            );
            let quality = face_quality(
                &bbox,
                detection.confidence,
                frame.width,
                frame.height,
                &landmarks,
            );
            let event = FaceEvent::new(
                frame.clone(),
                bbox,
                detection.confidence,
                landmarks,
                quality,
            );
            let display_entry = (event.bbox, event.quality);
            if !self.events.try_put(event) {
                warn!(
                    "worker {}: event queue full, dropping detection on frame {}",
                    self.worker_id, frame.frame_no
                );
            } else {
                queued.push(display_entry);
            }
        }

        self.push_display(&frame, &queued);
    }

    fn push_display(&self, frame: &Frame, boxes: &[(facegate_types::Bbox, f32)]) {
        if let Some(ring) = self.display.get(&frame.camera_id()) {
            ring.push_nowait(crate::display::AnnotatedFrame {
                frame: frame.clone(),
                boxes: boxes.to_vec(),
            });
        }
    }
}
