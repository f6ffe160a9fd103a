//! Per-camera capture tasks.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use tracing::{debug, info, warn};

use bounded_queue::BoundedQueue;
use facegate_config_data::CameraSettings;
use facegate_types::{CameraInfo, Frame};

use crate::engines::StreamOpener;

/// Run one camera's capture loop until the stop flag is raised or the
/// reconnect budget is exhausted. Exhausting retries terminates only this
/// task; the rest of the pipeline keeps running.
pub fn run_capture(
    camera: Arc<CameraInfo>,
    opener: Arc<dyn StreamOpener>,
    frames: BoundedQueue<Frame>,
    settings: CameraSettings,
    stop: Arc<AtomicBool>,
) {
    info!("starting capture for camera {} ({})", camera.name, camera.id);

    let mut frame_counter: u64 = 0;
    let mut retries = 0;
    while !stop.load(Ordering::Relaxed) && retries < settings.max_retries {
        match opener.open(&camera.stream_url) {
            Ok(mut stream) => {
                info!("camera {}: stream opened", camera.name);
                capture_loop(&camera, stream.as_mut(), &frames, &mut frame_counter, &stop);
                // Stream handle released here.
            }
            Err(e) => {
                warn!("camera {}: failed to open stream: {e:#}", camera.name);
            }
        }

        if stop.load(Ordering::Relaxed) {
            break;
        }
        retries += 1;
        if retries < settings.max_retries {
            info!(
                "camera {}: reconnecting in {} s (attempt {}/{})",
                camera.name, settings.reconnect_delay_secs, retries, settings.max_retries
            );
            sleep_checking_stop(
                Duration::from_secs(settings.reconnect_delay_secs),
                &stop,
            );
        } else {
            warn!(
                "camera {}: retry budget exhausted, capture task ending",
                camera.name
            );
        }
    }

    info!("capture finished for camera {}", camera.name);
}

fn capture_loop(
    camera: &Arc<CameraInfo>,
    stream: &mut dyn crate::engines::VideoStream,
    frames: &BoundedQueue<Frame>,
    frame_counter: &mut u64,
    stop: &AtomicBool,
) {
    while !stop.load(Ordering::Relaxed) {
        let image = match stream.read_frame() {
            Ok(image) if !image.data.is_empty() => image,
            Ok(_) => {
                warn!("camera {}: empty frame, treating as disconnect", camera.name);
                return;
            }
            Err(e) => {
                warn!("camera {}: stream read failed: {e:#}", camera.name);
                return;
            }
        };

        *frame_counter += 1;
        let frame = Frame::new(
            *frame_counter,
            camera.clone(),
            chrono::Local::now(),
            image.width,
            image.height,
            image.data,
        );

        if !frames.try_put(frame) {
            warn!(
                "camera {}: frame queue full, dropping frame {}",
                camera.name, frame_counter
            );
        } else {
            debug!(
                "camera {}: frame {} queued (queue depth {})",
                camera.name,
                frame_counter,
                frames.len()
            );
        }
    }
}

fn sleep_checking_stop(total: Duration, stop: &AtomicBool) {
    let step = Duration::from_millis(100);
    let mut remaining = total;
    while remaining > Duration::ZERO && !stop.load(Ordering::Relaxed) {
        let chunk = remaining.min(step);
        std::thread::sleep(chunk);
        remaining -= chunk;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::{RawImage, VideoStream};
    use eyre::eyre;

    /// Yields a fixed number of solid frames, then fails every read.
    struct ScriptedStream {
        remaining: usize,
    }

    impl VideoStream for ScriptedStream {
        fn read_frame(&mut self) -> eyre::Result<RawImage> {
            if self.remaining == 0 {
                return Err(eyre!("connection reset"));
            }
            self.remaining -= 1;
            Ok(RawImage {
                width: 4,
                height: 4,
                data: vec![128; 4 * 4 * 3],
            })
        }
    }

    struct ScriptedOpener {
        frames_per_connect: usize,
    }

    impl StreamOpener for ScriptedOpener {
        fn open(&self, _url: &str) -> eyre::Result<Box<dyn VideoStream>> {
            Ok(Box::new(ScriptedStream {
                remaining: self.frames_per_connect,
            }))
        }
    }

    fn test_camera() -> Arc<CameraInfo> {
        Arc::new(CameraInfo {
            id: facegate_types::CameraId(1),
            name: "test".into(),
            stream_url: "rtsp://example/1".into(),
            token: "tok".into(),
        })
    }

    #[test]
    fn capture_ends_after_retry_budget() {
        let frames = BoundedQueue::new(32);
        let stop = Arc::new(AtomicBool::new(false));
        let settings = CameraSettings {
            prefix: String::new(),
            reconnect_delay_secs: 0,
            max_retries: 2,
        };
        run_capture(
            test_camera(),
            Arc::new(ScriptedOpener {
                frames_per_connect: 3,
            }),
            frames.clone(),
            settings,
            stop,
        );
        // Two connections, three frames each, then the task gives up.
        assert_eq!(frames.len(), 6);
    }

    #[test]
    fn frame_numbers_are_monotonic_across_reconnects() {
        let frames = BoundedQueue::new(32);
        let stop = Arc::new(AtomicBool::new(false));
        let settings = CameraSettings {
            prefix: String::new(),
            reconnect_delay_secs: 0,
            max_retries: 2,
        };
        run_capture(
            test_camera(),
            Arc::new(ScriptedOpener {
                frames_per_connect: 2,
            }),
            frames.clone(),
            settings,
            stop,
        );
        let numbers: Vec<u64> = std::iter::from_fn(|| frames.try_get())
            .map(|f| f.frame_no)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
    }

    #[test]
    fn overflow_drops_frames_without_blocking() {
        let frames = BoundedQueue::new(2);
        let stop = Arc::new(AtomicBool::new(false));
        let settings = CameraSettings {
            prefix: String::new(),
            reconnect_delay_secs: 0,
            max_retries: 1,
        };
        run_capture(
            test_camera(),
            Arc::new(ScriptedOpener {
                frames_per_connect: 5,
            }),
            frames.clone(),
            settings,
            stop,
        );
        assert_eq!(frames.len(), 2);
    }
}
