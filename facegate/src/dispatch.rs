//! Dispatcher pool: JPEG-encode finalized best events and upload them to
//! the recognition service.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use chrono::SecondsFormat;
use eyre::{eyre, Result, WrapErr};
use tracing::{error, info, warn};

use bounded_queue::BoundedQueue;
use facegate_types::{FaceEvent, Frame};

use crate::engines::{EventSink, FaceEventReceipt};

/// Per-worker upload counters, aggregated by the orchestrator at shutdown.
#[derive(Debug, Default, Clone, Copy)]
pub struct DispatchStats {
    pub success: u64,
    pub failure: u64,
}

impl std::ops::Add for DispatchStats {
    type Output = DispatchStats;
    fn add(self, rhs: DispatchStats) -> DispatchStats {
        DispatchStats {
            success: self.success + rhs.success,
            failure: self.failure + rhs.failure,
        }
    }
}

/// Dispatcher worker loop. Keeps draining after `stop` until the uploads
/// queue is empty; `stop` here is the dispatcher-stage flag, raised by the
/// orchestrator only after the track managers have flushed.
pub fn run_dispatch_worker(
    worker_id: usize,
    uploads: BoundedQueue<FaceEvent>,
    sink: Arc<dyn EventSink>,
    queue_timeout: Duration,
    stop: Arc<AtomicBool>,
) -> DispatchStats {
    info!("dispatcher {} started", worker_id);
    let mut stats = DispatchStats::default();
    loop {
        if stop.load(Ordering::Relaxed) && uploads.is_empty() {
            break;
        }
        let Some(event) = uploads.get(queue_timeout) else {
            continue;
        };
        match send_event(sink.as_ref(), &event) {
            Ok(receipt) => {
                stats.success += 1;
                info!(
                    "event {} uploaded: camera {}, quality {:.4}, remote id {}, {} matches",
                    event.event_no,
                    event.camera_name(),
                    event.quality,
                    receipt.id,
                    receipt.matches_count
                );
            }
            Err(e) => {
                stats.failure += 1;
                warn!(
                    "event {} dropped: upload failed: {e:#}",
                    event.event_no
                );
            }
        }
        // Dropping the event here releases its frame buffer regardless of
        // the upload outcome.
        drop(event);
    }
    info!(
        "dispatcher {} finished: {} uploaded, {} failed",
        worker_id, stats.success, stats.failure
    );
    stats
}

/// Validate, encode, and upload one event. No retries: a failed upload is
/// logged and the event is gone.
fn send_event(sink: &dyn EventSink, event: &FaceEvent) -> Result<FaceEventReceipt> {
    // A hole here means an upstream stage gave away its frame reference.
    if event.camera_token().is_empty() {
        error!(
            "event {} is missing its camera token, dropping",
            event.event_no
        );
        return Err(eyre!("incomplete event: empty camera token"));
    }
    if event.frame.pixel_data().is_empty() {
        error!("event {} has an empty frame buffer, dropping", event.event_no);
        return Err(eyre!("incomplete event: empty frame"));
    }
    if event.bbox.is_degenerate() {
        error!("event {} has a degenerate bbox, dropping", event.event_no);
        return Err(eyre!("incomplete event: degenerate bbox"));
    }

    let jpeg = encode_jpeg(&event.frame).wrap_err("JPEG encoding failed")?;
    let timestamp = event
        .frame
        .stamp
        .to_rfc3339_opts(SecondsFormat::Millis, false);
    let roi = [
        event.bbox.x1,
        event.bbox.y1,
        event.bbox.x2,
        event.bbox.y2,
    ];
    sink.add_face_event(
        event.camera_token(),
        &jpeg,
        event.camera_id(),
        &timestamp,
        roi,
        "biggest",
    )
}

/// Encode a frame's RGB24 buffer as JPEG.
pub fn encode_jpeg(frame: &Frame) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 90);
    encoder.encode(
        frame.pixel_data(),
        frame.width,
        frame.height,
        image::ExtendedColorType::Rgb8,
    )?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use facegate_types::{Bbox, CameraId, CameraInfo, Landmarks};
    use parking_lot::Mutex;

    struct RecordingSink {
        calls: Mutex<Vec<(String, CameraId, String, [i32; 4])>>,
        fail: bool,
    }

    impl RecordingSink {
        fn new(fail: bool) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail,
            }
        }
    }

    impl EventSink for RecordingSink {
        fn add_face_event(
            &self,
            token: &str,
            jpeg: &[u8],
            camera: CameraId,
            timestamp: &str,
            roi: [i32; 4],
            _mf_selector: &str,
        ) -> Result<FaceEventReceipt> {
            assert!(jpeg.starts_with(&[0xFF, 0xD8]), "payload is not a JPEG");
            self.calls
                .lock()
                .push((token.to_string(), camera, timestamp.to_string(), roi));
            if self.fail {
                Err(eyre!("HTTP 500"))
            } else {
                Ok(FaceEventReceipt {
                    id: 42,
                    matches_count: 1,
                })
            }
        }
    }

    fn event(token: &str) -> FaceEvent {
        let camera = Arc::new(CameraInfo {
            id: CameraId(3),
            name: "cam3".into(),
            stream_url: String::new(),
            token: token.into(),
        });
        let frame = Frame::new(
            1,
            camera,
            chrono::Local::now(),
            64,
            48,
            vec![100u8; 64 * 48 * 3],
        );
        FaceEvent::new(frame, Bbox::new(10, 10, 40, 40), 0.9, Landmarks::empty(), 0.9)
    }

    fn run_one(sink: Arc<RecordingSink>, ev: FaceEvent) -> DispatchStats {
        let uploads = BoundedQueue::new(4);
        uploads.try_put(ev);
        let stop = Arc::new(AtomicBool::new(true));
        run_dispatch_worker(
            0,
            uploads,
            sink,
            Duration::from_millis(10),
            stop,
        )
    }

    #[test]
    fn successful_upload_counts_and_sends_roi() {
        let sink = Arc::new(RecordingSink::new(false));
        let stats = run_one(sink.clone(), event("tok"));
        assert_eq!(stats.success, 1);
        assert_eq!(stats.failure, 0);
        let calls = sink.calls.lock();
        assert_eq!(calls.len(), 1);
        let (token, camera, timestamp, roi) = &calls[0];
        assert_eq!(token, "tok");
        assert_eq!(*camera, CameraId(3));
        assert_eq!(*roi, [10, 10, 40, 40]);
        // ISO 8601 with an offset.
        assert!(timestamp.contains('T'));
        assert!(timestamp.contains('+') || timestamp.contains('-'));
    }

    #[test]
    fn failed_upload_counts_once_and_never_retries() {
        let sink = Arc::new(RecordingSink::new(true));
        let stats = run_one(sink.clone(), event("tok"));
        assert_eq!(stats.success, 0);
        assert_eq!(stats.failure, 1);
        assert_eq!(sink.calls.lock().len(), 1);
    }

    #[test]
    fn incomplete_event_dropped_before_the_sink() {
        let sink = Arc::new(RecordingSink::new(false));
        let stats = run_one(sink.clone(), event(""));
        assert_eq!(stats.failure, 1);
        assert!(sink.calls.lock().is_empty());
    }

    #[test]
    fn jpeg_encoding_produces_a_jpeg() {
        let ev = event("tok");
        let jpeg = encode_jpeg(&ev.frame).unwrap();
        assert!(jpeg.starts_with(&[0xFF, 0xD8]));
        assert!(jpeg.len() > 100);
    }

    #[test]
    fn worker_drains_queue_after_stop() {
        let sink = Arc::new(RecordingSink::new(false));
        let uploads = BoundedQueue::new(8);
        for _ in 0..3 {
            uploads.try_put(event("tok"));
        }
        let stop = Arc::new(AtomicBool::new(true));
        let stats = run_dispatch_worker(
            0,
            uploads.clone(),
            sink,
            Duration::from_millis(10),
            stop,
        );
        assert_eq!(stats.success, 3);
        assert!(uploads.is_empty());
    }
}
