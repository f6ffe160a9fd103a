//! Typed configuration for the facegate pipeline.
//!
//! Pipeline tuning lives in a TOML file; recognition-service credentials
//! come exclusively from the environment so they stay out of config files
//! checked into deployments.

use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("TOML deserialization error: {source}")]
    TomlDe {
        #[from]
        source: toml::de::Error,
    },
    #[error("required environment variable {0} is not set")]
    MissingEnvVar(&'static str),
}

type Result<T> = std::result::Result<T, Error>;

fn default_detection_model_path() -> std::path::PathBuf {
    "models/face-detect.onnx".into()
}

fn default_landmark_model_path() -> std::path::PathBuf {
    "models/face-landmarks.onnx".into()
}

fn default_confidence_threshold() -> f32 {
    0.5
}

fn default_detection_iou() -> f32 {
    0.75
}

fn default_landmark_iou() -> f32 {
    0.45
}

fn default_max_frames() -> usize {
    500
}

fn default_inactivity_secs() -> f64 {
    15.0
}

fn default_match_distance_fraction() -> f64 {
    0.07
}

fn default_min_movement_px() -> f64 {
    50.0
}

fn default_min_movement_fraction() -> f64 {
    0.1
}

fn default_min_bbox_width() -> i32 {
    30
}

fn default_frames_capacity() -> usize {
    100
}

fn default_events_capacity() -> usize {
    1000
}

fn default_uploads_capacity() -> usize {
    100
}

fn default_queue_timeout_msec() -> u64 {
    500
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_cpu_batch_size() -> usize {
    1
}

fn default_accel_batch_size() -> usize {
    32
}

fn default_inference_size() -> u32 {
    640
}

fn default_window_width() -> u32 {
    1280
}

fn default_window_height() -> u32 {
    720
}

fn default_fps_limit() -> u32 {
    30
}

fn default_drain_timeout_secs() -> f64 {
    10.0
}

/// Detection (and landmark) model parameters. Paths relative to the config
/// file are fixed up by [`parse_config_file`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetectionModelConfig {
    #[serde(default = "default_detection_model_path")]
    pub model_path: std::path::PathBuf,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_detection_iou")]
    pub iou_threshold: f32,
}

impl Default for DetectionModelConfig {
    fn default() -> Self {
        Self {
            model_path: default_detection_model_path(),
            confidence_threshold: default_confidence_threshold(),
            iou_threshold: default_detection_iou(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LandmarkModelConfig {
    #[serde(default = "default_landmark_model_path")]
    pub model_path: std::path::PathBuf,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_landmark_iou")]
    pub iou_threshold: f32,
}

impl Default for LandmarkModelConfig {
    fn default() -> Self {
        Self {
            model_path: default_landmark_model_path(),
            confidence_threshold: default_confidence_threshold(),
            iou_threshold: default_landmark_iou(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackingConfig {
    /// Event count at which a track is force-finalized.
    #[serde(default = "default_max_frames")]
    pub max_frames: usize,
    /// Seconds without events before a track is closed.
    #[serde(default = "default_inactivity_secs")]
    pub inactivity_secs: f64,
    /// Fraction of the frame diagonal used as the centroid-distance
    /// fallback threshold when matching events to tracks.
    #[serde(default = "default_match_distance_fraction")]
    pub match_distance_fraction: f64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            max_frames: default_max_frames(),
            inactivity_secs: default_inactivity_secs(),
            match_distance_fraction: default_match_distance_fraction(),
        }
    }
}

/// Movement thresholds deciding whether a track ever "moved". Either
/// criterion alone is sufficient for an event to count as movement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MovementConfig {
    #[serde(default = "default_min_movement_px")]
    pub min_movement_px: f64,
    /// Fraction of the frame diagonal.
    #[serde(default = "default_min_movement_fraction")]
    pub min_movement_fraction: f64,
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            min_movement_px: default_min_movement_px(),
            min_movement_fraction: default_min_movement_fraction(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    #[serde(default = "default_min_bbox_width")]
    pub min_bbox_width: i32,
    #[serde(default = "default_confidence_threshold")]
    pub min_confidence: f32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_bbox_width: default_min_bbox_width(),
            min_confidence: default_confidence_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    #[serde(default = "default_frames_capacity")]
    pub frames: usize,
    #[serde(default = "default_events_capacity")]
    pub events: usize,
    #[serde(default = "default_uploads_capacity")]
    pub uploads: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            frames: default_frames_capacity(),
            events: default_events_capacity(),
            uploads: default_uploads_capacity(),
        }
    }
}

/// Worker pool sizes. Zero means auto-size from the CPU count at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WorkersConfig {
    pub detection: usize,
    pub track: usize,
    pub dispatch: usize,
    #[serde(default = "default_queue_timeout_msec")]
    pub queue_timeout_msec: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            detection: 0,
            track: 0,
            dispatch: 0,
            queue_timeout_msec: default_queue_timeout_msec(),
        }
    }
}

impl WorkersConfig {
    /// Replace zero pool sizes with CPU-derived defaults: detection gets a
    /// worker per core, the lighter pools half that, all floored at 4.
    pub fn resolved(&self, cpu_count: usize) -> ResolvedWorkers {
        let light = (cpu_count / 2).max(4);
        ResolvedWorkers {
            detection: if self.detection == 0 {
                cpu_count.max(4)
            } else {
                self.detection
            },
            track: if self.track == 0 { light } else { self.track },
            dispatch: if self.dispatch == 0 {
                light
            } else {
                self.dispatch
            },
            queue_timeout: std::time::Duration::from_millis(self.queue_timeout_msec),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedWorkers {
    pub detection: usize,
    pub track: usize,
    pub dispatch: usize,
    pub queue_timeout: std::time::Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CameraSettings {
    /// Only cameras whose name starts with this prefix are captured.
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessingConfig {
    #[serde(default = "default_cpu_batch_size")]
    pub cpu_batch_size: usize,
    #[serde(default = "default_accel_batch_size")]
    pub accel_batch_size: usize,
    /// Square inference resolution the detector resizes frames to.
    #[serde(default = "default_inference_size")]
    pub inference_size: u32,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            cpu_batch_size: default_cpu_batch_size(),
            accel_batch_size: default_accel_batch_size(),
            inference_size: default_inference_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DisplayConfig {
    pub enabled: bool,
    #[serde(default = "default_window_width")]
    pub window_width: u32,
    #[serde(default = "default_window_height")]
    pub window_height: u32,
    #[serde(default = "default_fps_limit")]
    pub fps_limit: u32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_width: default_window_width(),
            window_height: default_window_height(),
            fps_limit: default_fps_limit(),
        }
    }
}

/// The complete pipeline configuration as read from `facegate.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FacegateConfig {
    pub detection: DetectionModelConfig,
    pub landmarks: LandmarkModelConfig,
    pub tracking: TrackingConfig,
    pub movement: MovementConfig,
    pub filter: FilterConfig,
    pub queues: QueueConfig,
    pub workers: WorkersConfig,
    pub cameras: CameraSettings,
    pub processing: ProcessingConfig,
    pub display: DisplayConfig,
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: f64,
}

impl Default for FacegateConfig {
    fn default() -> Self {
        Self {
            detection: DetectionModelConfig::default(),
            landmarks: LandmarkModelConfig::default(),
            tracking: TrackingConfig::default(),
            movement: MovementConfig::default(),
            filter: FilterConfig::default(),
            queues: QueueConfig::default(),
            workers: WorkersConfig::default(),
            cameras: CameraSettings::default(),
            processing: ProcessingConfig::default(),
            display: DisplayConfig::default(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

impl FacegateConfig {
    /// Make model paths that are relative refer to the config file's
    /// directory rather than the process working directory.
    fn fixup_relative_paths(&mut self, config_path: &std::path::Path) {
        let dirname = config_path.parent().unwrap_or(std::path::Path::new("."));
        for path in [
            &mut self.detection.model_path,
            &mut self.landmarks.model_path,
        ] {
            if path.is_relative() {
                *path = dirname.join(&path);
            }
        }
    }
}

/// Recognition-service credentials, environment-only.
#[derive(Debug, Clone)]
pub struct RecognitionConfig {
    pub api_url: String,
    pub user: String,
    pub password: String,
    pub tenant_uuid: String,
    /// Accept self-signed TLS certificates on the service endpoint.
    pub accept_invalid_certs: bool,
}

fn required_env(name: &'static str) -> Result<String> {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::MissingEnvVar(name)),
    }
}

impl RecognitionConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            api_url: required_env("FACEGATE_API_URL")?,
            user: required_env("FACEGATE_API_USER")?,
            password: required_env("FACEGATE_API_PASSWORD")?,
            tenant_uuid: required_env("FACEGATE_TENANT_UUID")?,
            accept_invalid_certs: std::env::var("FACEGATE_ACCEPT_INVALID_CERTS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }
}

/// Parse the TOML config file at `path`, applying per-field defaults for
/// anything omitted.
pub fn parse_config_file<P: AsRef<std::path::Path>>(path: P) -> Result<FacegateConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)?;
    let mut cfg: FacegateConfig = toml::from_str(&contents)?;
    cfg.fixup_relative_paths(path);
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_yields_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"").unwrap();
        let cfg = parse_config_file(f.path()).unwrap();
        assert_eq!(cfg.tracking.max_frames, 500);
        assert_eq!(cfg.queues.events, 1000);
        assert_eq!(cfg.filter.min_bbox_width, 30);
        assert_eq!(cfg.drain_timeout_secs, 10.0);
        assert!(!cfg.display.enabled);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(
            br#"
[tracking]
max_frames = 2

[cameras]
prefix = "LOBBY"
"#,
        )
        .unwrap();
        let cfg = parse_config_file(f.path()).unwrap();
        assert_eq!(cfg.tracking.max_frames, 2);
        assert_eq!(cfg.tracking.inactivity_secs, 15.0);
        assert_eq!(cfg.cameras.prefix, "LOBBY");
        assert_eq!(cfg.cameras.max_retries, 3);
    }

    #[test]
    fn unknown_field_is_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"[tracking]\nmax_framez = 2\n").unwrap();
        assert!(parse_config_file(f.path()).is_err());
    }

    #[test]
    fn relative_model_paths_follow_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facegate.toml");
        std::fs::write(&path, "[detection]\nmodel_path = \"det.onnx\"\n").unwrap();
        let cfg = parse_config_file(&path).unwrap();
        assert_eq!(cfg.detection.model_path, dir.path().join("det.onnx"));
    }

    #[test]
    fn worker_auto_sizing() {
        let w = WorkersConfig::default();
        let r = w.resolved(16);
        assert_eq!(r.detection, 16);
        assert_eq!(r.track, 8);
        assert_eq!(r.dispatch, 8);
        // Small machines are floored at 4.
        let r = w.resolved(2);
        assert_eq!(r.detection, 4);
        assert_eq!(r.track, 4);
        // Explicit sizes win.
        let w = WorkersConfig {
            detection: 2,
            track: 1,
            dispatch: 1,
            queue_timeout_msec: 100,
        };
        let r = w.resolved(16);
        assert_eq!((r.detection, r.track, r.dispatch), (2, 1, 1));
    }
}
