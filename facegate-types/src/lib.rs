//! Core entity types shared by all stages of the facegate pipeline.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Numeric camera identifier as reported by the recognition service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CameraId(pub i64);

impl std::fmt::Display for CameraId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Descriptor of one network camera. Immutable for the process lifetime and
/// shared as `Arc<CameraInfo>` between the frames derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraInfo {
    pub id: CameraId,
    pub name: String,
    /// Live stream URL used by the capture task.
    pub stream_url: String,
    /// Per-camera auth token sent with every upload for this camera.
    pub token: String,
}

/// Axis-aligned bounding box in pixel coordinates, `(x1, y1)` top-left
/// inclusive, `(x2, y2)` bottom-right exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bbox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl Bbox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    #[inline]
    pub fn width(&self) -> i32 {
        (self.x2 - self.x1).max(0)
    }

    #[inline]
    pub fn height(&self) -> i32 {
        (self.y2 - self.y1).max(0)
    }

    #[inline]
    pub fn area(&self) -> i64 {
        self.width() as i64 * self.height() as i64
    }

    /// A box with zero width or height encloses no pixels.
    #[inline]
    pub fn is_degenerate(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    #[inline]
    pub fn center(&self) -> (f64, f64) {
        (
            (self.x1 + self.x2) as f64 / 2.0,
            (self.y1 + self.y2) as f64 / 2.0,
        )
    }

    /// Clamp to the given frame geometry.
    pub fn clamped(&self, width: u32, height: u32) -> Bbox {
        Bbox {
            x1: self.x1.clamp(0, width as i32),
            y1: self.y1.clamp(0, height as i32),
            x2: self.x2.clamp(0, width as i32),
            y2: self.y2.clamp(0, height as i32),
        }
    }
}

impl std::fmt::Display for Bbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})-({},{})", self.x1, self.y1, self.x2, self.y2)
    }
}

/// Facial landmark points in full-frame pixel coordinates. May be empty when
/// the landmark model found nothing in a face crop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Landmarks(Vec<(f32, f32)>);

impl Landmarks {
    pub fn new(points: Vec<(f32, f32)>) -> Self {
        Self(points)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn points(&self) -> &[(f32, f32)] {
        &self.0
    }

    /// How many points fall inside `bbox`.
    pub fn count_inside(&self, bbox: &Bbox) -> usize {
        self.0
            .iter()
            .filter(|(x, y)| {
                *x >= bbox.x1 as f32
                    && *x < bbox.x2 as f32
                    && *y >= bbox.y1 as f32
                    && *y < bbox.y2 as f32
            })
            .count()
    }
}

/// One decoded image from one camera at one wall-clock instant.
///
/// The RGB24 pixel buffer is reference-counted and immutable after
/// construction: cloning a `Frame` bumps the refcount, and the buffer is
/// freed when the last stage holding a clone drops it. Anything that wants
/// to draw on a frame must copy the buffer out first.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic per-camera frame counter.
    pub frame_no: u64,
    pub camera: Arc<CameraInfo>,
    /// Wall-clock capture time, local timezone.
    pub stamp: DateTime<Local>,
    pub width: u32,
    pub height: u32,
    pixels: Arc<Vec<u8>>,
}

impl Frame {
    /// `pixels` must be a tightly packed RGB24 buffer of `width * height * 3`
    /// bytes.
    pub fn new(
        frame_no: u64,
        camera: Arc<CameraInfo>,
        stamp: DateTime<Local>,
        width: u32,
        height: u32,
        pixels: Vec<u8>,
    ) -> Self {
        debug_assert_eq!(pixels.len(), width as usize * height as usize * 3);
        Self {
            frame_no,
            camera,
            stamp,
            width,
            height,
            pixels: Arc::new(pixels),
        }
    }

    #[inline]
    pub fn camera_id(&self) -> CameraId {
        self.camera.id
    }

    #[inline]
    pub fn camera_name(&self) -> &str {
        &self.camera.name
    }

    #[inline]
    pub fn camera_token(&self) -> &str {
        &self.camera.token
    }

    #[inline]
    pub fn pixel_data(&self) -> &[u8] {
        &self.pixels
    }

    #[inline]
    pub fn diagonal(&self) -> f64 {
        ((self.width as f64).powi(2) + (self.height as f64).powi(2)).sqrt()
    }

    /// Deep-copy the region under `bbox` (clamped to the frame) into an
    /// owned crop.
    pub fn crop(&self, bbox: &Bbox) -> FaceCrop {
        let b = bbox.clamped(self.width, self.height);
        let (w, h) = (b.width() as usize, b.height() as usize);
        let mut data = Vec::with_capacity(w * h * 3);
        let stride = self.width as usize * 3;
        for row in b.y1 as usize..(b.y1 as usize + h) {
            let start = row * stride + b.x1 as usize * 3;
            data.extend_from_slice(&self.pixels[start..start + w * 3]);
        }
        FaceCrop {
            width: w as u32,
            height: h as u32,
            data,
        }
    }
}

/// Owned RGB24 copy of a face region, handed to the landmark model.
#[derive(Debug, Clone)]
pub struct FaceCrop {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Raw detector output for one face, before landmark extraction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceDetection {
    pub bbox: Bbox,
    pub confidence: f32,
}

/// One detected face in one frame, enriched with landmarks and a quality
/// score. Cloning is cheap: the underlying frame buffer is shared.
#[derive(Debug, Clone)]
pub struct FaceEvent {
    /// Globally unique, monotonically increasing across all workers.
    pub event_no: u64,
    pub frame: Frame,
    pub bbox: Bbox,
    pub confidence: f32,
    pub landmarks: Landmarks,
    /// Face quality in [0, 1], computed once at construction.
    pub quality: f32,
}

impl FaceEvent {
    pub fn new(
        frame: Frame,
        bbox: Bbox,
        confidence: f32,
        landmarks: Landmarks,
        quality: f32,
    ) -> Self {
        Self {
            event_no: next_event_no(),
            frame,
            bbox,
            confidence,
            landmarks,
            quality,
        }
    }

    #[inline]
    pub fn camera_id(&self) -> CameraId {
        self.frame.camera_id()
    }

    #[inline]
    pub fn camera_name(&self) -> &str {
        self.frame.camera_name()
    }

    #[inline]
    pub fn camera_token(&self) -> &str {
        self.frame.camera_token()
    }
}

static EVENT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Next value of the process-wide event counter.
pub fn next_event_no() -> u64 {
    EVENT_COUNTER.fetch_add(1, Ordering::Relaxed) + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_camera() -> Arc<CameraInfo> {
        Arc::new(CameraInfo {
            id: CameraId(7),
            name: "lobby".into(),
            stream_url: "rtsp://example/1".into(),
            token: "tok".into(),
        })
    }

    #[test]
    fn bbox_geometry() {
        let b = Bbox::new(10, 20, 110, 220);
        assert_eq!(b.width(), 100);
        assert_eq!(b.height(), 200);
        assert_eq!(b.area(), 20_000);
        assert_eq!(b.center(), (60.0, 120.0));
        assert!(!b.is_degenerate());
        assert!(Bbox::new(5, 5, 5, 50).is_degenerate());
        // Inverted coordinates clamp to zero extent.
        assert!(Bbox::new(50, 50, 10, 10).is_degenerate());
    }

    #[test]
    fn landmarks_inside_bbox() {
        let lm = Landmarks::new(vec![(15.0, 15.0), (50.0, 50.0), (200.0, 15.0)]);
        let b = Bbox::new(10, 10, 100, 100);
        assert_eq!(lm.count_inside(&b), 2);
        assert_eq!(Landmarks::empty().count_inside(&b), 0);
    }

    #[test]
    fn frame_clone_shares_pixels() {
        let frame = Frame::new(
            1,
            test_camera(),
            Local::now(),
            4,
            2,
            vec![0u8; 4 * 2 * 3],
        );
        let clone = frame.clone();
        assert!(std::ptr::eq(
            frame.pixel_data().as_ptr(),
            clone.pixel_data().as_ptr()
        ));
    }

    #[test]
    fn crop_extracts_region() {
        // 4x2 frame, pixel value encodes x coordinate.
        let mut pixels = Vec::new();
        for y in 0..2u8 {
            for x in 0..4u8 {
                pixels.extend_from_slice(&[x, y, 0]);
            }
        }
        let frame = Frame::new(1, test_camera(), Local::now(), 4, 2, pixels);
        let crop = frame.crop(&Bbox::new(1, 0, 3, 2));
        assert_eq!((crop.width, crop.height), (2, 2));
        assert_eq!(crop.data, vec![1, 0, 0, 2, 0, 0, 1, 1, 0, 2, 1, 0]);
    }

    #[test]
    fn crop_clamps_to_frame() {
        let frame = Frame::new(1, test_camera(), Local::now(), 4, 2, vec![9u8; 24]);
        let crop = frame.crop(&Bbox::new(-5, -5, 100, 100));
        assert_eq!((crop.width, crop.height), (4, 2));
    }

    #[test]
    fn event_numbers_increase() {
        let a = next_event_no();
        let b = next_event_no();
        assert!(b > a);
    }
}
