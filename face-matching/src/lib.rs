//! Pure association and scoring math for face tracks.
//!
//! Everything here is deterministic and side-effect free: the track manager
//! calls these functions under its lock, so they must never block.

use facegate_types::{Bbox, Landmarks};

/// Relative bbox area at which the size term of the quality score
/// saturates. Faces rarely exceed a few percent of a surveillance frame.
const QUALITY_AREA_SATURATION: f64 = 0.05;

/// Landmark count at which the landmark term saturates (a standard
/// five-point face model).
const QUALITY_LANDMARK_SATURATION: usize = 5;

/// Intersection over *mean* area of the two boxes.
///
/// This deviates from the textbook union denominator: dividing by the mean
/// area keeps the score high when a face bbox shrinks or grows between
/// frames, which the union variant would punish. Returns 0.0 when either
/// box has zero area or the boxes do not overlap.
pub fn iou_mean_area(a: &Bbox, b: &Bbox) -> f64 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);
    if x2 < x1 || y2 < y1 {
        return 0.0;
    }
    let inter = (x2 - x1) as f64 * (y2 - y1) as f64;
    let area_a = a.area() as f64;
    let area_b = b.area() as f64;
    if area_a == 0.0 || area_b == 0.0 {
        return 0.0;
    }
    inter / ((area_a + area_b) / 2.0)
}

/// Euclidean distance between bbox centers, in pixels.
pub fn centroid_distance(a: &Bbox, b: &Bbox) -> f64 {
    let (ax, ay) = a.center();
    let (bx, by) = b.center();
    ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
}

/// IoU acceptance threshold, adapted to frame resolution: the larger the
/// frame, the smaller the relative overlap a moving face retains between
/// consecutive detections.
pub fn adaptive_iou_threshold(frame_width: u32, frame_height: u32) -> f64 {
    match frame_width.max(frame_height) {
        0..=640 => 0.20,
        641..=1280 => 0.15,
        1281..=1920 => 0.12,
        _ => 0.10,
    }
}

/// Maximum centroid distance for the fallback match: `fraction` of the
/// frame diagonal, in pixels.
pub fn distance_threshold(frame_width: u32, frame_height: u32, fraction: f64) -> f64 {
    let diagonal = ((frame_width as f64).powi(2) + (frame_height as f64).powi(2)).sqrt();
    diagonal * fraction
}

/// Scalar face quality in [0, 1].
///
/// Weighted sum of detection confidence (0.5), bbox area relative to the
/// frame saturating at [`QUALITY_AREA_SATURATION`] (0.3), and the fraction
/// of landmark points found inside the bbox (0.2). Degenerate boxes and
/// empty frames score 0.
pub fn face_quality(
    bbox: &Bbox,
    confidence: f32,
    frame_width: u32,
    frame_height: u32,
    landmarks: &Landmarks,
) -> f32 {
    if bbox.is_degenerate() || frame_width == 0 || frame_height == 0 {
        return 0.0;
    }
    let frame_area = frame_width as f64 * frame_height as f64;
    let area_ratio = bbox.area() as f64 / frame_area;
    let size_term = (area_ratio / QUALITY_AREA_SATURATION).min(1.0);
    let landmark_term =
        (landmarks.count_inside(bbox) as f64 / QUALITY_LANDMARK_SATURATION as f64).min(1.0);
    let q = 0.5 * confidence.clamp(0.0, 1.0) as f64 + 0.3 * size_term + 0.2 * landmark_term;
    q.clamp(0.0, 1.0) as f32
}
