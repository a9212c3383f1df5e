use std::{path::Path, time::Duration};

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::{Gallery, NotifyError};
use crate::{config::ConfigBackend, events::FireReport, recorder::FinishedClip};

const MAX_REASON_CHARS: usize = 200;
const VIDEO_MIME: &str = "video/x-msvideo";

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct Recipient {
    pub phone: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct AlertGroup {
    pub jid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct AlertGroups {
    #[serde(default)]
    pub groups: Vec<AlertGroup>,
    #[serde(default)]
    pub fire_alert_enabled: bool,
}

impl AlertGroups {
    /// Groups that should receive fire alerts
    pub fn active(&self) -> Vec<&AlertGroup> {
        if !self.fire_alert_enabled {
            return Vec::new();
        }
        self.groups.iter().filter(|g| g.enabled).collect()
    }
}

#[derive(Debug, Deserialize)]
struct RecipientsResponse {
    #[serde(default)]
    recipients: Vec<Recipient>,
}

fn enabled_default() -> bool {
    true
}

/// Client for the local dashboard backend that stores snapshots, clips and contact lists
pub struct BackendClient {
    client: reqwest::Client,
    base_url: String,
    video_timeout: Duration,
}

impl BackendClient {
    pub fn new(cfg: &ConfigBackend) -> Result<BackendClient, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(NotifyError::Http)?;
        Ok(BackendClient {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            video_timeout: Duration::from_secs(cfg.video_timeout_secs),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Uploads a recorded clip. Returns the file name the backend stored it under.
    pub async fn upload_video(&self, clip: &FinishedClip) -> Result<String, NotifyError> {
        let bytes = tokio::fs::read(&clip.path).await?;
        let form = Form::new()
            .part(
                "video",
                Part::bytes(bytes)
                    .file_name(video_file_name(clip))
                    .mime_str(VIDEO_MIME)
                    .map_err(NotifyError::Http)?,
            )
            .text("cameraIp", clip.camera_ip.clone().unwrap_or_else(|| "unknown".into()))
            .text("startTime", clip.started_at.timestamp_millis().to_string())
            .text("duration", clip.duration.as_secs().to_string());
        let res = self
            .client
            .post(self.url("/api/video/upload"))
            .timeout(self.video_timeout)
            .multipart(form)
            .send()
            .await
            .map_err(NotifyError::Http)?;
        let status = res.status().as_u16();
        if status != 200 {
            let body = res.text().await.unwrap_or_default();
            return Err(NotifyError::Status(status, body));
        }
        let body: Value = res.json().await.map_err(NotifyError::Http)?;
        parse_upload_response(&body)
    }
}

#[async_trait]
impl Gallery for BackendClient {
    /// Stores an annotated snapshot in the detection gallery
    async fn upload_detection(
        &self,
        report: &FireReport,
        snapshot: Vec<u8>,
    ) -> Result<Option<String>, NotifyError> {
        let mut form = Form::new().part(
            "snapshot",
            Part::bytes(snapshot)
                .file_name("fire_detection.jpg")
                .mime_str("image/jpeg")
                .map_err(NotifyError::Http)?,
        );
        for (name, value) in detection_form_fields(report) {
            form = form.text(name, value);
        }
        let res = self
            .client
            .post(self.url("/api/fire-detection"))
            .multipart(form)
            .send()
            .await
            .map_err(NotifyError::Http)?;
        let status = res.status().as_u16();
        if status != 200 && status != 201 {
            let body = res.text().await.unwrap_or_default();
            return Err(NotifyError::Status(status, body));
        }
        let body: Value = res.json().await.map_err(NotifyError::Http)?;
        let id = body.pointer("/detection/id").and_then(|id| match id {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
        debug!(id=?id, "Detection stored in gallery");
        Ok(id)
    }

    /// Enabled WhatsApp recipients
    async fn recipients(&self) -> Result<Vec<Recipient>, NotifyError> {
        let res = self
            .client
            .get(self.url("/api/recipients"))
            .send()
            .await
            .map_err(NotifyError::Http)?;
        if !res.status().is_success() {
            return Err(NotifyError::Status(res.status().as_u16(), String::new()));
        }
        let body: RecipientsResponse = res.json().await.map_err(NotifyError::Http)?;
        Ok(body.recipients.into_iter().filter(|r| r.enabled).collect())
    }

    /// Falls back to a local file when the backend cannot be reached
    async fn alert_groups(&self, fallback: Option<&Path>) -> Result<AlertGroups, NotifyError> {
        let fetched = async {
            let res = self
                .client
                .get(self.url("/api/alert-groups"))
                .send()
                .await
                .map_err(NotifyError::Http)?;
            if !res.status().is_success() {
                return Err(NotifyError::Status(res.status().as_u16(), String::new()));
            }
            res.json::<AlertGroups>().await.map_err(NotifyError::Http)
        }
        .await;
        match (fetched, fallback) {
            (Ok(groups), _) => Ok(groups),
            (Err(e), Some(path)) => {
                warn!(error=%e, file=%path.display(), "Alert groups unavailable from backend, using local file");
                load_groups_file(path).await
            }
            (Err(e), None) => Err(e),
        }
    }
}

/// Name of the uploaded video part. The backend picks the container from the extension.
fn video_file_name(clip: &FinishedClip) -> String {
    clip.path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "recording.avi".into())
}

pub async fn load_groups_file(path: &Path) -> Result<AlertGroups, NotifyError> {
    let text = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&text)?)
}

/// Text fields sent alongside a gallery snapshot
pub fn detection_form_fields(report: &FireReport) -> Vec<(&'static str, String)> {
    let [x1, y1, x2, y2] = report.bbox.as_pixels();
    let v = &report.verification;
    vec![
        ("confidence", format!("{:.4}", report.confidence)),
        ("bbox", format!("[{},{},{},{}]", x1, y1, x2, y2)),
        (
            "cameraIp",
            report
                .camera
                .address
                .clone()
                .unwrap_or_else(|| "unknown".into()),
        ),
        ("cameraId", report.camera.id.clone()),
        ("yoloModel", report.model.clone()),
        (
            "geminiScore",
            v.score.map(|s| format!("{:.2}", s)).unwrap_or_default(),
        ),
        (
            "geminiReason",
            v.reason
                .as_deref()
                .unwrap_or("")
                .chars()
                .take(MAX_REASON_CHARS)
                .collect(),
        ),
        ("geminiVerified", v.verified.to_string()),
    ]
}

fn parse_upload_response(body: &Value) -> Result<String, NotifyError> {
    if body.get("success").and_then(Value::as_bool) != Some(true) {
        let message = body
            .get("error")
            .or_else(|| body.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("upload not accepted");
        return Err(NotifyError::Rejected(message.to_string()));
    }
    Ok(body
        .pointer("/file/filename")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string())
}

#[cfg(test)]
mod test {
    use chrono::{TimeZone, Utc};
    use indoc::indoc;
    use serde_json::json;

    use std::{path::Path, time::Duration};

    use super::{
        detection_form_fields, load_groups_file, parse_upload_response, video_file_name, AlertGroups,
        VIDEO_MIME,
    };
    use crate::{
        detect::BoundingBox,
        events::{CameraInfo, FireReport, VerificationSummary},
        recorder::{clip_file_name, FinishedClip},
    };

    fn report() -> FireReport {
        FireReport {
            camera: CameraInfo {
                id: "A1B2C3".into(),
                address: Some("192.168.1.40".into()),
            },
            detected_at: Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap(),
            model: "fire.onnx".into(),
            class_name: "fire".into(),
            confidence: 0.8731,
            bbox: BoundingBox::new(10.2, 20.7, 110.0, 140.4),
            area: 11940.0,
            color: None,
            verification: VerificationSummary {
                verified: true,
                score: Some(0.9),
                reason: Some("r".repeat(300)),
                fallback: false,
            },
        }
    }

    #[test]
    fn test_form_fields() {
        let fields = detection_form_fields(&report());
        let get = |k: &str| fields.iter().find(|(n, _)| *n == k).unwrap().1.clone();
        assert_eq!(get("confidence"), "0.8731");
        assert_eq!(get("bbox"), "[10,21,110,140]");
        assert_eq!(get("cameraIp"), "192.168.1.40");
        assert_eq!(get("cameraId"), "A1B2C3");
        assert_eq!(get("geminiScore"), "0.90");
        assert_eq!(get("geminiReason").len(), 200);
        assert_eq!(get("geminiVerified"), "true");
    }

    #[test]
    fn test_video_part_accepted_by_backend() {
        // Extensions the video upload route lets through
        const ACCEPTED: [&str; 5] = ["mp4", "avi", "mkv", "mov", "webm"];
        let started_at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let clip = FinishedClip {
            path: Path::new("recordings").join(clip_file_name(started_at)),
            camera_ip: None,
            started_at,
            duration: Duration::from_secs(30),
            frames: 300,
            bytes: 1_500_000,
        };
        let name = video_file_name(&clip);
        assert_eq!(name, "fire_detection_20240309_140507.avi");
        let ext = Path::new(&name).extension().unwrap().to_str().unwrap();
        assert!(ACCEPTED.contains(&ext));
        assert_eq!(VIDEO_MIME, "video/x-msvideo");

        let bare = FinishedClip {
            path: Path::new("/").to_path_buf(),
            ..clip
        };
        assert!(video_file_name(&bare).ends_with(".avi"));
    }

    #[test]
    fn test_upload_response() {
        let ok = json!({"success": true, "file": {"filename": "esp32cam_1_clip.avi", "size": 10, "path": "/v/esp32cam_1_clip.avi"}});
        assert_eq!(parse_upload_response(&ok).unwrap(), "esp32cam_1_clip.avi");
        let rejected = json!({"success": false, "error": "disk full"});
        assert_eq!(
            parse_upload_response(&rejected).unwrap_err().to_string(),
            "Request rejected: disk full"
        );
    }

    #[test]
    fn test_active_groups() {
        let groups: AlertGroups = serde_json::from_str(indoc! {r#"
            {
                "fireAlertEnabled": true,
                "groups": [
                    {"jid": "1203630@g.us", "name": "Lab", "enabled": true},
                    {"jid": "1203631@g.us", "name": "Old", "enabled": false}
                ]
            }
        "#})
        .unwrap();
        let active: Vec<&str> = groups.active().iter().map(|g| g.jid.as_str()).collect();
        assert_eq!(active, vec!["1203630@g.us"]);

        let off = AlertGroups {
            fire_alert_enabled: false,
            ..groups
        };
        assert!(off.active().is_empty());
    }

    #[tokio::test]
    async fn test_groups_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("groups.json");
        std::fs::write(
            &path,
            r#"{"fireAlertEnabled": true, "groups": [{"jid": "99@g.us"}]}"#,
        )
        .unwrap();
        let groups = load_groups_file(&path).await.unwrap();
        assert_eq!(groups.active().len(), 1);
        assert!(groups.groups[0].enabled);
        assert!(load_groups_file(&dir.path().join("missing.json")).await.is_err());
    }
}
