//! Optional display side-channel.
//!
//! Detection workers push annotated snapshots into a small per-camera ring
//! buffer with a non-blocking put; one display thread per camera drains
//! its ring, draws the boxes into a copy of the pixel buffer, and hands
//! the result to a [`DisplaySink`]. Nothing on this path can slow the
//! pipeline down: the ring drops its oldest entry on overflow and the
//! shared frame buffers are never written.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use facegate_types::{Bbox, CameraId, CameraInfo, Frame};

pub const RING_CAPACITY: usize = 5;

/// A frame plus the boxes (with quality) of the events queued from it.
#[derive(Clone)]
pub struct AnnotatedFrame {
    pub frame: Frame,
    pub boxes: Vec<(Bbox, f32)>,
}

/// Fixed-capacity drop-oldest buffer between one camera's detection
/// workers and its display thread.
pub struct DisplayRing {
    buffer: Mutex<VecDeque<AnnotatedFrame>>,
    capacity: usize,
}

impl DisplayRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Never blocks; a full ring discards its oldest entry.
    pub fn push_nowait(&self, item: AnnotatedFrame) {
        let mut buffer = self.buffer.lock();
        if buffer.len() == self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(item);
    }

    pub fn pop_nowait(&self) -> Option<AnnotatedFrame> {
        self.buffer.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }
}

/// All rings, keyed by camera. Empty when the display is disabled.
pub type DisplayRings = Arc<HashMap<CameraId, DisplayRing>>;

pub fn build_rings(cameras: &[Arc<CameraInfo>]) -> DisplayRings {
    Arc::new(
        cameras
            .iter()
            .map(|c| (c.id, DisplayRing::new(RING_CAPACITY)))
            .collect(),
    )
}

/// A fully rendered display frame: owned pixels with boxes burned in.
pub struct RenderedFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    pub face_count: usize,
}

/// Where rendered frames go. The actual windowing/streaming backend lives
/// outside the pipeline; the built-in [`ThroughputSink`] just reports.
pub trait DisplaySink: Send {
    fn show(&mut self, camera: &CameraInfo, rendered: &RenderedFrame) -> eyre::Result<()>;
}

/// Default sink: logs per-camera display throughput once per second.
#[derive(Default)]
pub struct ThroughputSink {
    window_start: Option<Instant>,
    frames: u32,
    faces: u32,
}

impl DisplaySink for ThroughputSink {
    fn show(&mut self, camera: &CameraInfo, rendered: &RenderedFrame) -> eyre::Result<()> {
        let start = *self.window_start.get_or_insert_with(Instant::now);
        self.frames += 1;
        self.faces += rendered.face_count as u32;
        let elapsed = start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            info!(
                "display {}: {:.1} fps, {} faces shown",
                camera.name,
                self.frames as f64 / elapsed.as_secs_f64(),
                self.faces
            );
            self.window_start = Some(Instant::now());
            self.frames = 0;
            self.faces = 0;
        }
        Ok(())
    }
}

/// Copy the frame's pixels and draw box outlines, colored by quality band
/// (green above 0.7, yellow above 0.4, red below).
pub fn annotate(annotated: &AnnotatedFrame) -> RenderedFrame {
    let frame = &annotated.frame;
    let mut data = frame.pixel_data().to_vec();
    for (bbox, quality) in &annotated.boxes {
        let color = if *quality >= 0.7 {
            [0u8, 255, 0]
        } else if *quality >= 0.4 {
            [255, 255, 0]
        } else {
            [255, 0, 0]
        };
        draw_rect(
            &mut data,
            frame.width,
            frame.height,
            &bbox.clamped(frame.width, frame.height),
            color,
            2,
        );
    }
    RenderedFrame {
        width: frame.width,
        height: frame.height,
        data,
        face_count: annotated.boxes.len(),
    }
}

fn draw_rect(data: &mut [u8], width: u32, height: u32, bbox: &Bbox, color: [u8; 3], thickness: i32) {
    let mut put = |x: i32, y: i32| {
        if x >= 0 && y >= 0 && (x as u32) < width && (y as u32) < height {
            let offset = (y as usize * width as usize + x as usize) * 3;
            data[offset..offset + 3].copy_from_slice(&color);
        }
    };
    for t in 0..thickness {
        for x in bbox.x1..bbox.x2 {
            put(x, bbox.y1 + t);
            put(x, bbox.y2 - 1 - t);
        }
        for y in bbox.y1..bbox.y2 {
            put(bbox.x1 + t, y);
            put(bbox.x2 - 1 - t, y);
        }
    }
}

/// Downscale a rendered frame to fit inside `max_width` x `max_height`,
/// preserving aspect ratio. Frames that already fit pass through.
pub fn scale_to_fit(rendered: RenderedFrame, max_width: u32, max_height: u32) -> RenderedFrame {
    if rendered.width <= max_width && rendered.height <= max_height {
        return rendered;
    }
    let ratio = (max_width as f64 / rendered.width as f64)
        .min(max_height as f64 / rendered.height as f64);
    let new_w = ((rendered.width as f64 * ratio) as u32).max(1);
    let new_h = ((rendered.height as f64 * ratio) as u32).max(1);
    let Some(img) = image::RgbImage::from_raw(rendered.width, rendered.height, rendered.data)
    else {
        // Inconsistent buffer; nothing sensible to show.
        return RenderedFrame {
            width: 0,
            height: 0,
            data: Vec::new(),
            face_count: 0,
        };
    };
    let resized = image::imageops::resize(&img, new_w, new_h, image::imageops::FilterType::Triangle);
    RenderedFrame {
        width: new_w,
        height: new_h,
        data: resized.into_raw(),
        face_count: rendered.face_count,
    }
}

/// One camera's display loop: drain, render, scale, pace to the FPS limit.
pub fn run_display_worker(
    camera: Arc<CameraInfo>,
    rings: DisplayRings,
    mut sink: Box<dyn DisplaySink>,
    window: (u32, u32),
    fps_limit: u32,
    stop: Arc<AtomicBool>,
) {
    let Some(ring) = rings.get(&camera.id) else {
        warn!("no display ring for camera {}, display task ending", camera.name);
        return;
    };
    info!("display task started for camera {}", camera.name);
    let frame_budget = Duration::from_secs_f64(1.0 / fps_limit.max(1) as f64);
    while !stop.load(Ordering::Relaxed) {
        match ring.pop_nowait() {
            Some(annotated) => {
                let rendered = scale_to_fit(annotate(&annotated), window.0, window.1);
                if let Err(e) = sink.show(&camera, &rendered) {
                    debug!("display sink for {} failed: {e:#}", camera.name);
                }
                std::thread::sleep(frame_budget);
            }
            None => std::thread::sleep(Duration::from_millis(10)),
        }
    }
    info!("display task finished for camera {}", camera.name);
}
