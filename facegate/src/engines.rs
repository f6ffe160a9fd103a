//! Seams to the external collaborators: inference engines, video sources,
//! the camera directory, and the upload sink.
//!
//! The pipeline only ever talks to these traits; concrete backends live in
//! [`crate::onnx`], [`crate::ffmpeg_source`] and [`crate::recognition`],
//! and tests substitute their own.

use eyre::Result;

use facegate_types::{CameraId, CameraInfo, FaceCrop, FaceDetection, Landmarks};

/// Inference parameters forwarded to the detector on every call.
#[derive(Debug, Clone, Copy)]
pub struct DetectParams {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    /// Square resolution frames are resized to for inference.
    pub inference_size: u32,
}

/// A loaded face-detection model, shared read-only across the detection
/// worker pool. Implementations must be safe to invoke concurrently (or
/// serialize internally).
pub trait FaceDetector: Send + Sync {
    /// One list of detections per input frame, same order as `frames`.
    fn detect(
        &self,
        frames: &[facegate_types::Frame],
        params: &DetectParams,
    ) -> Result<Vec<Vec<FaceDetection>>>;

    /// Whether inference runs on an accelerator; drives batch sizing.
    fn is_accelerated(&self) -> bool {
        false
    }
}

/// A loaded facial-landmark model. One call handles all crops of a frame.
pub trait LandmarkDetector: Send + Sync {
    /// One (possibly empty) landmark set per crop, in crop-local pixel
    /// coordinates.
    fn detect(&self, crops: &[FaceCrop]) -> Result<Vec<Landmarks>>;
}

/// One decoded image as delivered by a video backend.
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGB24.
    pub data: Vec<u8>,
}

/// An open live video stream. Owned by exactly one capture task.
pub trait VideoStream: Send {
    /// Block until the next frame. Any error is treated as a disconnect by
    /// the capture task.
    fn read_frame(&mut self) -> Result<RawImage>;
}

/// Factory opening a [`VideoStream`] for a camera URL.
pub trait StreamOpener: Send + Sync {
    fn open(&self, url: &str) -> Result<Box<dyn VideoStream>>;
}

/// The camera directory of the recognition service.
pub trait CameraSource: Send + Sync {
    /// Active cameras whose name starts with `prefix`.
    fn get_active_cameras(&self, prefix: &str) -> Result<Vec<CameraInfo>>;
}

/// What the recognition service returned for an accepted face event.
#[derive(Debug, Clone, Copy)]
pub struct FaceEventReceipt {
    pub id: i64,
    pub matches_count: u64,
}

/// The downstream face-event endpoint of the recognition service.
pub trait EventSink: Send + Sync {
    /// Upload one JPEG-encoded frame with its face ROI.
    ///
    /// `roi` is `[left, top, right, bottom]` in frame pixels; `timestamp`
    /// is ISO 8601 with timezone offset.
    fn add_face_event(
        &self,
        token: &str,
        jpeg: &[u8],
        camera: CameraId,
        timestamp: &str,
        roi: [i32; 4],
        mf_selector: &str,
    ) -> Result<FaceEventReceipt>;
}
