//! The facegate pipeline: capture, detect, track, dispatch.
//!
//! Data flows one way through three bounded queues:
//!
//! ```text
//! cameras -> frames -> detectors -> events -> track manager -> uploads -> dispatcher
//! ```
//!
//! Frames carry reference-counted immutable pixel buffers, so an event can
//! sit in a track's best-event slot and in a downstream queue at the same
//! time without copying; the buffer is freed when the last stage drops its
//! clone.

use bounded_queue::BoundedQueue;
use facegate_config_data::QueueConfig;
use facegate_types::{FaceEvent, Frame};

pub mod capture;
pub mod detect;
pub mod dispatch;
pub mod display;
pub mod engines;
pub mod ffmpeg_source;
pub mod logging;
pub mod onnx;
pub mod orchestrator;
pub mod recognition;
pub mod trackman;

/// The three inter-stage queues. Cloning shares the underlying channels.
#[derive(Clone)]
pub struct PipelineQueues {
    pub frames: BoundedQueue<Frame>,
    pub events: BoundedQueue<FaceEvent>,
    pub uploads: BoundedQueue<FaceEvent>,
}

impl PipelineQueues {
    pub fn new(cfg: &QueueConfig) -> Self {
        Self {
            frames: BoundedQueue::new(cfg.frames),
            events: BoundedQueue::new(cfg.events),
            uploads: BoundedQueue::new(cfg.uploads),
        }
    }

    pub fn all_empty(&self) -> bool {
        self.frames.is_empty() && self.events.is_empty() && self.uploads.is_empty()
    }
}
