//! Blocking HTTP client for the face-recognition service.
//!
//! One pooled client is shared by every dispatcher worker; connections are
//! kept alive between uploads. Authentication is a session token obtained
//! at startup plus per-camera tokens attached to each upload.

use serde::Deserialize;
use tracing::{debug, info};

use facegate_config_data::RecognitionConfig;
use facegate_types::{CameraId, CameraInfo};

use crate::engines::{CameraSource, EventSink, FaceEventReceipt};

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
const POOL_MAX_IDLE_PER_HOST: usize = 10;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("HTTP error: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },
    #[error("request to {endpoint} failed with status {status}")]
    RequestFailed {
        endpoint: &'static str,
        status: reqwest::StatusCode,
    },
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Deserialize)]
struct CameraRecord {
    id: i64,
    name: String,
    url: String,
    #[serde(default)]
    token: String,
    #[serde(default = "default_active")]
    active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Deserialize)]
struct CameraListResponse {
    results: Vec<CameraRecord>,
}

#[derive(Deserialize)]
struct Matches {
    #[serde(default)]
    count: u64,
}

#[derive(Deserialize)]
struct AddFaceEventResponse {
    id: i64,
    #[serde(default)]
    matches: Option<Matches>,
}

pub struct RecognitionClient {
    base_url: String,
    http: reqwest::blocking::Client,
    session_token: String,
}

impl RecognitionClient {
    /// Authenticate against the service and return a client ready for
    /// camera listing and uploads.
    pub fn connect(cfg: &RecognitionConfig) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .danger_accept_invalid_certs(cfg.accept_invalid_certs)
            .build()?;

        let base_url = cfg.api_url.trim_end_matches('/').to_string();
        let response = http
            .post(format!("{base_url}/auth/login/"))
            .json(&serde_json::json!({
                "login": cfg.user,
                "password": cfg.password,
                "uuid": cfg.tenant_uuid,
            }))
            .send()?;
        if !response.status().is_success() {
            return Err(Error::RequestFailed {
                endpoint: "auth/login/",
                status: response.status(),
            });
        }
        let login: LoginResponse = response.json()?;
        info!("authenticated with recognition service at {base_url}");

        Ok(Self {
            base_url,
            http,
            session_token: login.token,
        })
    }
}

fn filter_cameras(records: Vec<CameraRecord>, prefix: &str) -> Vec<CameraInfo> {
    records
        .into_iter()
        .filter(|r| r.active && r.name.starts_with(prefix))
        .map(|r| CameraInfo {
            id: CameraId(r.id),
            name: r.name,
            stream_url: r.url,
            token: r.token,
        })
        .collect()
}

impl CameraSource for RecognitionClient {
    fn get_active_cameras(&self, prefix: &str) -> eyre::Result<Vec<CameraInfo>> {
        let response = self
            .http
            .get(format!("{}/cameras/", self.base_url))
            .header("Authorization", format!("Token {}", self.session_token))
            .send()
            .map_err(Error::from)?;
        if !response.status().is_success() {
            return Err(Error::RequestFailed {
                endpoint: "cameras/",
                status: response.status(),
            }
            .into());
        }
        let list: CameraListResponse = response.json().map_err(Error::from)?;
        let cameras = filter_cameras(list.results, prefix);
        debug!("{} active cameras match prefix {prefix:?}", cameras.len());
        Ok(cameras)
    }
}

impl EventSink for RecognitionClient {
    fn add_face_event(
        &self,
        token: &str,
        jpeg: &[u8],
        camera: CameraId,
        timestamp: &str,
        roi: [i32; 4],
        mf_selector: &str,
    ) -> eyre::Result<FaceEventReceipt> {
        let part = reqwest::blocking::multipart::Part::bytes(jpeg.to_vec())
            .file_name("fullframe.jpg")
            .mime_str("image/jpeg")
            .map_err(Error::from)?;
        let form = reqwest::blocking::multipart::Form::new()
            .part("fullframe", part)
            .text("camera", camera.to_string())
            .text("timestamp", timestamp.to_string())
            .text("mf_selector", mf_selector.to_string())
            .text("roi", format_roi(&roi));

        let response = self
            .http
            .post(format!("{}/events/create_from_image/", self.base_url))
            .header("Authorization", format!("Token {token}"))
            .multipart(form)
            .send()
            .map_err(Error::from)?;
        if !response.status().is_success() {
            return Err(Error::RequestFailed {
                endpoint: "events/create_from_image/",
                status: response.status(),
            }
            .into());
        }
        let body: AddFaceEventResponse = response.json().map_err(Error::from)?;
        Ok(FaceEventReceipt {
            id: body.id,
            matches_count: body.matches.map(|m| m.count).unwrap_or(0),
        })
    }
}

fn format_roi(roi: &[i32; 4]) -> String {
    format!("[{},{},{},{}]", roi[0], roi[1], roi[2], roi[3])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64, name: &str, active: bool) -> CameraRecord {
        CameraRecord {
            id,
            name: name.to_string(),
            url: format!("rtsp://host/{id}"),
            token: format!("tok{id}"),
            active,
        }
    }

    #[test]
    fn prefix_filtering_keeps_only_matching_active_cameras() {
        let cameras = filter_cameras(
            vec![
                record(1, "LOBBY-north", true),
                record(2, "LOBBY-south", false),
                record(3, "PARKING-east", true),
            ],
            "LOBBY",
        );
        assert_eq!(cameras.len(), 1);
        assert_eq!(cameras[0].id, CameraId(1));
        assert_eq!(cameras[0].token, "tok1");
    }

    #[test]
    fn empty_prefix_matches_everything_active() {
        let cameras = filter_cameras(
            vec![record(1, "A", true), record(2, "B", true), record(3, "C", false)],
            "",
        );
        assert_eq!(cameras.len(), 2);
    }

    #[test]
    fn roi_is_bracketed_csv() {
        assert_eq!(format_roi(&[10, 20, 110, 220]), "[10,20,110,220]");
    }

    #[test]
    fn camera_record_tolerates_missing_optional_fields() {
        let r: CameraRecord =
            serde_json::from_str(r#"{"id": 5, "name": "X", "url": "rtsp://h/5"}"#).unwrap();
        assert!(r.active);
        assert_eq!(r.token, "");
    }
}
