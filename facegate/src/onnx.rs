//! ONNX Runtime backends for the detection and landmark traits.
//!
//! One session per model, shared by the whole worker pool behind a mutex:
//! `Session::run` needs `&mut self`, and ONNX Runtime parallelizes inside
//! a single run through its own thread pools.

use std::path::Path;
use std::sync::Mutex;

use eyre::{eyre, Result, WrapErr};
use ndarray::Array4;
use ort::{session::Session, value::Value};
use tracing::debug;

use facegate_types::{Bbox, FaceCrop, FaceDetection, Frame, Landmarks};

use crate::engines::{DetectParams, FaceDetector, LandmarkDetector};

/// Square input resolution for the landmark model.
const LANDMARK_INPUT_SIZE: u32 = 256;

pub struct OnnxFaceDetector {
    session: Mutex<Session>,
    accelerated: bool,
}

impl OnnxFaceDetector {
    pub fn new(model_path: &Path) -> Result<Self> {
        let session = Session::builder()?
            .commit_from_file(model_path)
            .wrap_err_with(|| format!("failed to load detection model {}", model_path.display()))?;
        Ok(Self {
            session: Mutex::new(session),
            // CPU execution provider; accelerator EPs would flip this to
            // request the larger batch size.
            accelerated: false,
        })
    }
}

impl FaceDetector for OnnxFaceDetector {
    fn detect(&self, frames: &[Frame], params: &DetectParams) -> Result<Vec<Vec<FaceDetection>>> {
        if frames.is_empty() {
            return Ok(Vec::new());
        }
        let size = params.inference_size;
        let input = preprocess_rgb_batch(
            frames
                .iter()
                .map(|f| (f.width, f.height, f.pixel_data()))
                .collect::<Vec<_>>()
                .as_slice(),
            size,
        )?;

        let input_value = Value::from_array(input)?;
        let mut session = self
            .session
            .lock()
            .map_err(|_| eyre!("detection session mutex poisoned"))?;
        let outputs = session.run(ort::inputs![input_value])?;
        let (shape, data) = outputs["output0"].try_extract_tensor::<f32>()?;
        let dims: Vec<usize> = shape.iter().map(|d| *d as usize).collect();
        if dims.len() != 3 || dims[0] != frames.len() {
            return Err(eyre!("unexpected detector output shape {dims:?}"));
        }

        let mut per_frame = Vec::with_capacity(frames.len());
        for (idx, frame) in frames.iter().enumerate() {
            let scale_x = frame.width as f32 / size as f32;
            let scale_y = frame.height as f32 / size as f32;
            let raw = decode_yolo_boxes(
                data,
                &dims,
                idx,
                params.confidence_threshold,
                scale_x,
                scale_y,
            );
            let kept = non_max_suppression(raw, params.iou_threshold);
            debug!(
                "frame {} of camera {}: {} faces",
                frame.frame_no,
                frame.camera_id(),
                kept.len()
            );
            per_frame.push(kept);
        }
        Ok(per_frame)
    }

    fn is_accelerated(&self) -> bool {
        self.accelerated
    }
}

pub struct OnnxLandmarkDetector {
    session: Mutex<Session>,
    confidence_threshold: f32,
}

impl OnnxLandmarkDetector {
    pub fn new(model_path: &Path, confidence_threshold: f32) -> Result<Self> {
        let session = Session::builder()?
            .commit_from_file(model_path)
            .wrap_err_with(|| format!("failed to load landmark model {}", model_path.display()))?;
        Ok(Self {
            session: Mutex::new(session),
            confidence_threshold,
        })
    }
}

impl LandmarkDetector for OnnxLandmarkDetector {
    fn detect(&self, crops: &[FaceCrop]) -> Result<Vec<Landmarks>> {
        if crops.is_empty() {
            return Ok(Vec::new());
        }
        let size = LANDMARK_INPUT_SIZE;
        let input = preprocess_rgb_batch(
            crops
                .iter()
                .map(|c| (c.width, c.height, c.data.as_slice()))
                .collect::<Vec<_>>()
                .as_slice(),
            size,
        )?;

        let input_value = Value::from_array(input)?;
        let mut session = self
            .session
            .lock()
            .map_err(|_| eyre!("landmark session mutex poisoned"))?;
        let outputs = session.run(ort::inputs![input_value])?;
        let (shape, data) = outputs["output0"].try_extract_tensor::<f32>()?;
        let dims: Vec<usize> = shape.iter().map(|d| *d as usize).collect();
        if dims.len() != 3 || dims[0] != crops.len() {
            return Err(eyre!("unexpected landmark output shape {dims:?}"));
        }

        let mut result = Vec::with_capacity(crops.len());
        for (idx, crop) in crops.iter().enumerate() {
            let scale_x = crop.width as f32 / size as f32;
            let scale_y = crop.height as f32 / size as f32;
            result.push(decode_keypoints(
                data,
                &dims,
                idx,
                self.confidence_threshold,
                scale_x,
                scale_y,
            ));
        }
        Ok(result)
    }
}

/// Resize each RGB24 image to `size`x`size` and normalize into an NCHW
/// float batch.
fn preprocess_rgb_batch(images: &[(u32, u32, &[u8])], size: u32) -> Result<Array4<f32>> {
    let mut batch = Array4::<f32>::zeros((images.len(), 3, size as usize, size as usize));
    for (idx, (width, height, data)) in images.iter().enumerate() {
        let img = image::RgbImage::from_raw(*width, *height, data.to_vec())
            .ok_or_else(|| eyre!("pixel buffer does not match {width}x{height}"))?;
        let resized =
            image::imageops::resize(&img, size, size, image::imageops::FilterType::Triangle);
        for (x, y, pixel) in resized.enumerate_pixels() {
            batch[[idx, 0, y as usize, x as usize]] = pixel[0] as f32 / 255.0;
            batch[[idx, 1, y as usize, x as usize]] = pixel[1] as f32 / 255.0;
            batch[[idx, 2, y as usize, x as usize]] = pixel[2] as f32 / 255.0;
        }
    }
    Ok(batch)
}

/// Decode one frame's slice of a YOLO-style `[N, C, B]` output where the
/// first five channels are center-x, center-y, width, height, confidence
/// in model-input space.
fn decode_yolo_boxes(
    data: &[f32],
    dims: &[usize],
    batch_idx: usize,
    confidence_threshold: f32,
    scale_x: f32,
    scale_y: f32,
) -> Vec<FaceDetection> {
    let (channels, boxes) = (dims[1], dims[2]);
    if channels < 5 {
        return Vec::new();
    }
    let base = batch_idx * channels * boxes;
    let mut detections = Vec::new();
    for b in 0..boxes {
        let confidence = data[base + 4 * boxes + b];
        if confidence < confidence_threshold {
            continue;
        }
        let cx = data[base + b];
        let cy = data[base + boxes + b];
        let w = data[base + 2 * boxes + b];
        let h = data[base + 3 * boxes + b];
        let bbox = Bbox::new(
            ((cx - w / 2.0) * scale_x).round() as i32,
            ((cy - h / 2.0) * scale_y).round() as i32,
            ((cx + w / 2.0) * scale_x).round() as i32,
            ((cy + h / 2.0) * scale_y).round() as i32,
        );
        detections.push(FaceDetection { bbox, confidence });
    }
    detections
}

/// Greedy NMS over union-IoU, highest confidence first.
fn non_max_suppression(mut detections: Vec<FaceDetection>, iou_threshold: f32) -> Vec<FaceDetection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut kept: Vec<FaceDetection> = Vec::new();
    for det in detections {
        if kept
            .iter()
            .all(|k| iou_union(&k.bbox, &det.bbox) <= iou_threshold as f64)
        {
            kept.push(det);
        }
    }
    kept
}

fn iou_union(a: &Bbox, b: &Bbox) -> f64 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);
    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }
    let inter = (x2 - x1) as f64 * (y2 - y1) as f64;
    let union = a.area() as f64 + b.area() as f64 - inter;
    if union <= 0.0 {
        return 0.0;
    }
    inter / union
}

/// Decode the keypoints of the most confident box in one crop's slice of a
/// pose-style `[N, 4 + 1 + 3K, B]` output.
fn decode_keypoints(
    data: &[f32],
    dims: &[usize],
    batch_idx: usize,
    confidence_threshold: f32,
    scale_x: f32,
    scale_y: f32,
) -> Landmarks {
    let (channels, boxes) = (dims[1], dims[2]);
    if channels < 8 || (channels - 5) % 3 != 0 {
        return Landmarks::empty();
    }
    let keypoint_count = (channels - 5) / 3;
    let base = batch_idx * channels * boxes;

    let mut best: Option<(usize, f32)> = None;
    for b in 0..boxes {
        let confidence = data[base + 4 * boxes + b];
        if confidence >= confidence_threshold
            && best.map(|(_, c)| confidence > c).unwrap_or(true)
        {
            best = Some((b, confidence));
        }
    }
    let Some((b, _)) = best else {
        return Landmarks::empty();
    };

    let points = (0..keypoint_count)
        .map(|k| {
            let x = data[base + (5 + 3 * k) * boxes + b];
            let y = data[base + (5 + 3 * k + 1) * boxes + b];
            (x * scale_x, y * scale_y)
        })
        .collect();
    Landmarks::new(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_filters_by_confidence_and_scales() {
        // C=5, B=2: box 0 at (100,100) 40x40 conf 0.9, box 1 conf 0.1.
        let dims = [1usize, 5, 2];
        let data = [
            100.0, 300.0, // cx
            100.0, 300.0, // cy
            40.0, 40.0, // w
            40.0, 40.0, // h
            0.9, 0.1, // conf
        ];
        let dets = decode_yolo_boxes(&data, &dims, 0, 0.5, 2.0, 1.0);
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].bbox, Bbox::new(160, 80, 240, 120));
        assert_eq!(dets[0].confidence, 0.9);
    }

    #[test]
    fn nms_suppresses_heavy_overlap_keeps_distinct() {
        let dets = vec![
            FaceDetection {
                bbox: Bbox::new(0, 0, 100, 100),
                confidence: 0.9,
            },
            FaceDetection {
                bbox: Bbox::new(5, 5, 105, 105),
                confidence: 0.8,
            },
            FaceDetection {
                bbox: Bbox::new(300, 300, 400, 400),
                confidence: 0.7,
            },
        ];
        let kept = non_max_suppression(dets, 0.5);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].bbox, Bbox::new(300, 300, 400, 400));
    }

    #[test]
    fn keypoints_come_from_best_box_and_scale() {
        // C = 4+1+3 (one keypoint), B = 2; box 1 wins on confidence.
        let dims = [1usize, 8, 2];
        let data = [
            0.0, 0.0, // cx
            0.0, 0.0, // cy
            10.0, 10.0, // w
            10.0, 10.0, // h
            0.3, 0.8, // conf
            10.0, 20.0, // kpt x
            12.0, 24.0, // kpt y
            1.0, 1.0, // kpt conf
        ];
        let lm = decode_keypoints(&data, &dims, 0, 0.5, 0.5, 2.0);
        assert_eq!(lm.points(), &[(10.0, 48.0)]);
    }

    #[test]
    fn no_confident_box_means_no_landmarks() {
        let dims = [1usize, 8, 1];
        let data = [0.0, 0.0, 10.0, 10.0, 0.2, 10.0, 12.0, 1.0];
        assert!(decode_keypoints(&data, &dims, 0, 0.5, 1.0, 1.0).is_empty());
    }

    #[test]
    fn preprocess_shapes_and_normalizes() {
        let img = vec![255u8; 4 * 4 * 3];
        let batch = preprocess_rgb_batch(&[(4, 4, img.as_slice())], 2).unwrap();
        assert_eq!(batch.shape(), &[1, 3, 2, 2]);
        assert!((batch[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
    }
}
