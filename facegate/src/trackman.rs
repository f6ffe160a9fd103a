//! Track management: associate face events into per-camera trajectories
//! and forward the single best event of every trajectory that moved.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use bounded_queue::BoundedQueue;
use face_matching::{adaptive_iou_threshold, centroid_distance, distance_threshold, iou_mean_area};
use facegate_config_data::{MovementConfig, TrackingConfig};
use facegate_types::{CameraId, FaceEvent};

/// How often the idle sweep closes inactive tracks when no events arrive.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct TrackManagerConfig {
    pub max_frames: usize,
    pub inactivity: Duration,
    pub match_distance_fraction: f64,
    pub min_movement_px: f64,
    pub min_movement_fraction: f64,
}

impl TrackManagerConfig {
    pub fn from_config(tracking: &TrackingConfig, movement: &MovementConfig) -> Self {
        Self {
            max_frames: tracking.max_frames,
            inactivity: Duration::from_secs_f64(tracking.inactivity_secs),
            match_distance_fraction: tracking.match_distance_fraction,
            min_movement_px: movement.min_movement_px,
            min_movement_fraction: movement.min_movement_fraction,
        }
    }
}

/// One trajectory of a face on one camera.
#[derive(Debug)]
pub struct Track {
    pub id: u64,
    pub camera_id: CameraId,
    pub first_event: FaceEvent,
    pub last_event: FaceEvent,
    /// Event with the strictly greatest quality seen so far; ties keep the
    /// most recent holder.
    pub best_event: FaceEvent,
    pub event_count: usize,
    pub movement_count: usize,
    pub last_update: Instant,
}

impl Track {
    fn new(id: u64, event: FaceEvent) -> Self {
        Self {
            id,
            camera_id: event.camera_id(),
            first_event: event.clone(),
            last_event: event.clone(),
            best_event: event,
            event_count: 1,
            movement_count: 0,
            last_update: Instant::now(),
        }
    }

    fn is_active(&self, inactivity: Duration) -> bool {
        self.last_update.elapsed() <= inactivity
    }

    fn append(&mut self, event: FaceEvent, cfg: &TrackManagerConfig) {
        let displacement = centroid_distance(&self.last_event.bbox, &event.bbox);
        let diagonal = event.frame.diagonal();
        if displacement >= cfg.min_movement_px
            || displacement >= cfg.min_movement_fraction * diagonal
        {
            self.movement_count += 1;
        }
        if event.quality > self.best_event.quality {
            self.best_event = event.clone();
        }
        self.last_event = event;
        self.event_count += 1;
        self.last_update = Instant::now();
    }
}

/// What became of a finalized track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOutcome {
    /// Best event offered to the uploads queue (even if the offer was then
    /// dropped because the queue was full).
    Emitted,
    /// Never moved; nothing forwarded.
    Discarded,
}

/// Shared state of the track-manager pool: per-camera active tracks behind
/// a single mutex, held only while one event is processed. No I/O happens
/// under the lock; the uploads offer is a non-blocking channel push.
pub struct TrackStore {
    tracks: Mutex<HashMap<CameraId, Vec<Track>>>,
    next_track_id: AtomicU64,
    uploads: BoundedQueue<FaceEvent>,
    cfg: TrackManagerConfig,
}

impl TrackStore {
    pub fn new(cfg: TrackManagerConfig, uploads: BoundedQueue<FaceEvent>) -> Self {
        Self {
            tracks: Mutex::new(HashMap::new()),
            next_track_id: AtomicU64::new(0),
            uploads,
            cfg,
        }
    }

    /// Associate one event: sweep this camera's expired tracks, then match
    /// by IoU first, centroid distance second, else open a new track.
    pub fn process_event(&self, event: FaceEvent) {
        let camera_id = event.camera_id();
        let (frame_w, frame_h) = (event.frame.width, event.frame.height);
        let iou_limit = adaptive_iou_threshold(frame_w, frame_h);
        let distance_limit =
            distance_threshold(frame_w, frame_h, self.cfg.match_distance_fraction);

        let mut tracks = self.tracks.lock();
        let camera_tracks = tracks.entry(camera_id).or_default();

        // Lazy inactivity check on every event arrival.
        self.sweep_camera(camera_tracks);

        let mut best_iou = 0.0;
        let mut by_iou: Option<usize> = None;
        let mut best_distance = f64::INFINITY;
        let mut by_distance: Option<usize> = None;
        for (idx, track) in camera_tracks.iter().enumerate() {
            let iou = iou_mean_area(&event.bbox, &track.last_event.bbox);
            let distance = centroid_distance(&event.bbox, &track.last_event.bbox);
            if iou >= iou_limit && iou > best_iou {
                best_iou = iou;
                by_iou = Some(idx);
            } else if distance <= distance_limit && distance < best_distance {
                best_distance = distance;
                by_distance = Some(idx);
            }
        }

        match by_iou.or(by_distance) {
            Some(idx) => {
                let track = &mut camera_tracks[idx];
                if by_iou.is_some() {
                    debug!(
                        "event {} joins track {} by IoU {:.3}",
                        event.event_no, track.id, best_iou
                    );
                } else {
                    debug!(
                        "event {} joins track {} by distance {:.1} px",
                        event.event_no, track.id, best_distance
                    );
                }
                track.append(event, &self.cfg);
                if track.event_count >= self.cfg.max_frames {
                    let track = camera_tracks.remove(idx);
                    self.finalize(track);
                }
            }
            None => {
                let id = self.next_track_id.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(
                    "event {} opens track {} on camera {}",
                    event.event_no, id, camera_id
                );
                camera_tracks.push(Track::new(id, event));
            }
        }
    }

    /// Close tracks that have been inactive for longer than the threshold,
    /// on every camera. Called from the worker timer when the events queue
    /// is idle.
    pub fn sweep(&self) {
        let mut tracks = self.tracks.lock();
        for camera_tracks in tracks.values_mut() {
            self.sweep_camera(camera_tracks);
        }
        tracks.retain(|_, v| !v.is_empty());
    }

    fn sweep_camera(&self, camera_tracks: &mut Vec<Track>) {
        let mut idx = 0;
        while idx < camera_tracks.len() {
            if camera_tracks[idx].is_active(self.cfg.inactivity) {
                idx += 1;
            } else {
                let track = camera_tracks.remove(idx);
                debug!(
                    "track {} inactive for more than {:?}, finalizing",
                    track.id, self.cfg.inactivity
                );
                self.finalize(track);
            }
        }
    }

    /// Finalize every remaining track. Called once at shutdown, after the
    /// track workers have drained the events queue.
    pub fn finalize_all(&self) {
        let all: Vec<Track> = {
            let mut tracks = self.tracks.lock();
            tracks.drain().flat_map(|(_, v)| v).collect()
        };
        if all.is_empty() {
            return;
        }
        info!("finalizing {} remaining tracks", all.len());
        for track in all {
            self.finalize(track);
        }
    }

    /// Emit-or-discard. The track's entire state is released on return;
    /// an emitted event survives through its own frame reference.
    fn finalize(&self, track: Track) -> TrackOutcome {
        if track.movement_count == 0 {
            debug!(
                "track {} discarded: no movement over {} events",
                track.id, track.event_count
            );
            return TrackOutcome::Discarded;
        }
        let best = track.best_event.clone();
        let quality = best.quality;
        if !self.uploads.try_put(best) {
            warn!(
                "uploads queue full, dropping best event of track {} (queue depth {})",
                track.id,
                self.uploads.len()
            );
        } else {
            info!(
                "track {} finalized: {} events, {} with movement, best quality {:.4}",
                track.id, track.event_count, track.movement_count, quality
            );
        }
        TrackOutcome::Emitted
    }

    pub fn active_track_count(&self) -> usize {
        self.tracks.lock().values().map(Vec::len).sum()
    }
}

/// Track-manager worker loop. Drains the events queue after the stop flag
/// is raised, then exits; the orchestrator finalizes leftovers once the
/// whole pool has joined.
pub fn run_track_worker(
    worker_id: usize,
    store: Arc<TrackStore>,
    events: BoundedQueue<FaceEvent>,
    queue_timeout: Duration,
    stop: Arc<AtomicBool>,
) {
    info!("track manager {} started", worker_id);
    let mut last_sweep = Instant::now();
    loop {
        if stop.load(Ordering::Relaxed) && events.is_empty() {
            break;
        }
        match events.get(queue_timeout) {
            Some(event) => store.process_event(event),
            None => {
                if last_sweep.elapsed() >= SWEEP_INTERVAL {
                    store.sweep();
                    last_sweep = Instant::now();
                }
            }
        }
    }
    info!("track manager {} finished", worker_id);
}
