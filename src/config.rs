use std::{path::Path, path::PathBuf, time::Duration};

use figment::{providers::Format, Figment};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::warn;

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub system: ConfigSystem,
    pub mqtt: ConfigMqtt,
    #[serde(default)]
    pub camera: ConfigCamera,
    pub detection: ConfigDetection,
    #[serde(default)]
    pub verification: ConfigVerification,
    #[serde(default)]
    pub alerts: ConfigAlerts,
    #[serde(default)]
    pub recording: ConfigRecording,
    #[serde(default)]
    pub backend: ConfigBackend,
    #[serde(default)]
    pub whatsapp: ConfigWhatsapp,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct ConfigSystem {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ConfigSystem {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Pretty
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct ConfigMqtt {
    pub address: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_client_prefix")]
    pub client_prefix: String,
    #[serde(default)]
    pub topics: MqttTopicsConfig,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttTopicsConfig {
    /// Retained discovery broadcast from the camera firmware
    pub announce: String,
    pub event: String,
    pub alert: String,
    pub status: String,
    pub log: String,
    pub stats: String,
}

impl Default for MqttTopicsConfig {
    fn default() -> Self {
        Self {
            announce: "lab/zaks/esp32cam/ip".into(),
            event: "lab/zaks/event".into(),
            alert: "lab/zaks/alert".into(),
            status: "lab/zaks/fire/status".into(),
            log: "lab/zaks/log".into(),
            stats: "lab/zaks/fire/stats".into(),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CameraMode {
    /// Continuous MJPEG stream
    Stream,
    /// Poll single JPEG captures
    Snapshot,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConfigCamera {
    pub mode: CameraMode,
    /// Fixed stream URL. Disables MQTT discovery.
    pub stream_url: Option<String>,
    /// Fixed capture URL for snapshot mode. Disables MQTT discovery.
    pub capture_url: Option<String>,
    /// Fixed camera IP. Stream and capture URLs are derived from it.
    pub camera_ip: Option<String>,
    /// Tunnel capture URL tried between the public and the local address
    pub tunnel_capture_url: Option<String>,
    pub prefer_public_ip: bool,
    pub heartbeat_timeout_secs: u64,
    pub heartbeat_check_secs: u64,
    /// Exit if no camera is discovered within this time. Waits forever when unset.
    pub discovery_timeout_secs: Option<u64>,
    pub snapshot_interval_secs: u64,
    pub max_snapshot_failures: u32,
    pub connect_retries: u32,
    pub reconnect_limit: u32,
    pub reconnect_pause_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for ConfigCamera {
    fn default() -> Self {
        Self {
            mode: CameraMode::Stream,
            stream_url: None,
            capture_url: None,
            camera_ip: None,
            tunnel_capture_url: None,
            prefer_public_ip: true,
            heartbeat_timeout_secs: 120,
            heartbeat_check_secs: 30,
            discovery_timeout_secs: None,
            snapshot_interval_secs: 5,
            max_snapshot_failures: 5,
            connect_retries: 5,
            reconnect_limit: 10,
            reconnect_pause_secs: 30,
            request_timeout_secs: 15,
        }
    }
}

impl ConfigCamera {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
    pub fn heartbeat_check(&self) -> Duration {
        Duration::from_secs(self.heartbeat_check_secs)
    }
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }
    pub fn reconnect_pause(&self) -> Duration {
        Duration::from_secs(self.reconnect_pause_secs)
    }
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
    /// Whether the camera is configured by hand rather than discovered over MQTT
    pub fn is_manual(&self) -> bool {
        self.stream_url.is_some() || self.capture_url.is_some() || self.camera_ip.is_some()
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct ConfigDetection {
    pub model_path: PathBuf,
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default = "default_class_names")]
    pub class_names: Vec<String>,
    #[serde(default = "default_confidence")]
    pub confidence_threshold: f32,
    #[serde(default = "default_iou")]
    pub iou_threshold: f32,
    #[serde(default = "default_min_area")]
    pub min_area: u32,
    #[serde(default = "default_every_n")]
    pub process_every_n_frames: u32,
    #[serde(default)]
    pub color: ConfigColor,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConfigColor {
    pub enabled: bool,
    pub min_fire_ratio: f32,
    pub max_white_ratio: f32,
    pub min_saturation: f32,
}

impl Default for ConfigColor {
    fn default() -> Self {
        Self {
            enabled: true,
            min_fire_ratio: 0.15,
            max_white_ratio: 0.60,
            min_saturation: 50.0,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConfigVerification {
    pub enabled: bool,
    pub api_key: String,
    pub model: String,
    pub api_base: String,
    pub score_threshold: f32,
    pub cooldown_ms: u64,
    pub fallback_confidence: f32,
    pub timeout_secs: u64,
    pub max_image_side: u32,
    pub jpeg_quality: u8,
    /// Send only the detected region instead of the whole frame
    pub crop_to_detection: bool,
    pub queue_depth: usize,
}

impl Default for ConfigVerification {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: String::new(),
            model: "gemini-2.5-flash-lite".into(),
            api_base: "https://generativelanguage.googleapis.com/v1beta".into(),
            score_threshold: 0.50,
            cooldown_ms: 800,
            fallback_confidence: 0.80,
            timeout_secs: 15,
            max_image_side: 400,
            jpeg_quality: 75,
            crop_to_detection: false,
            queue_depth: 2,
        }
    }
}

impl ConfigVerification {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConfigAlerts {
    pub cooldown_secs: u64,
    /// Reported as `source` in every published event
    pub source: String,
}

impl Default for ConfigAlerts {
    fn default() -> Self {
        Self {
            cooldown_secs: 5,
            source: "fire_sink".into(),
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConfigRecording {
    pub enabled: bool,
    pub directory: PathBuf,
    pub duration_secs: u64,
    pub cooldown_secs: u64,
    pub upload: bool,
}

impl Default for ConfigRecording {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: PathBuf::from("recordings"),
            duration_secs: 30,
            cooldown_secs: 60,
            upload: true,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConfigBackend {
    pub enabled: bool,
    pub base_url: String,
    pub upload_cooldown_secs: u64,
    pub timeout_secs: u64,
    pub video_timeout_secs: u64,
}

impl Default for ConfigBackend {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://localhost:8080".into(),
            upload_cooldown_secs: 10,
            timeout_secs: 10,
            video_timeout_secs: 120,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConfigWhatsapp {
    pub enabled: bool,
    pub gowa_url: String,
    /// Sent verbatim as the Authorization header
    pub authorization: Option<String>,
    pub cooldown_secs: u64,
    /// Local copy of the alert groups, used when the backend is unreachable
    pub groups_fallback_file: Option<PathBuf>,
    pub send_delay_ms: u64,
    pub location: String,
    pub dashboard_url: Option<String>,
}

impl Default for ConfigWhatsapp {
    fn default() -> Self {
        Self {
            enabled: true,
            gowa_url: "http://localhost:3000".into(),
            authorization: None,
            cooldown_secs: 60,
            groups_fallback_file: None,
            send_delay_ms: 500,
            location: "ESP32-CAM".into(),
            dashboard_url: None,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_client_prefix() -> String {
    "fire_sink".into()
}
fn default_input_size() -> u32 {
    640
}
fn default_class_names() -> Vec<String> {
    vec!["fire".into()]
}
fn default_confidence() -> f32 {
    0.35
}
fn default_iou() -> f32 {
    0.45
}
fn default_min_area() -> u32 {
    200
}
fn default_every_n() -> u32 {
    1
}

/// Values given on the command line. These win over the file and the environment.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub stream_url: Option<String>,
    pub camera_ip: Option<String>,
    pub model: Option<PathBuf>,
    pub confidence: Option<f32>,
    pub no_verification: bool,
    pub no_recording: bool,
    pub no_whatsapp: bool,
    pub debug: bool,
}

impl Config {
    pub fn apply_overrides(&mut self, overrides: &CliOverrides) {
        if let Some(url) = &overrides.stream_url {
            self.camera.stream_url = Some(url.clone());
            self.camera.mode = CameraMode::Stream;
        }
        if let Some(ip) = &overrides.camera_ip {
            self.camera.camera_ip = Some(ip.clone());
        }
        if let Some(model) = &overrides.model {
            self.detection.model_path = model.clone();
        }
        if let Some(conf) = overrides.confidence {
            self.detection.confidence_threshold = conf;
        }
        if overrides.no_verification {
            self.verification.enabled = false;
        }
        if overrides.no_recording {
            self.recording.enabled = false;
        }
        if overrides.no_whatsapp {
            self.whatsapp.enabled = false;
        }
        if overrides.debug {
            self.system.log_level = "debug".into();
        }
    }

    /// Checks value ranges. Verification without an API key is downgraded rather than rejected.
    pub fn validate(&mut self) -> Result<(), String> {
        let unit = |name: &str, v: f32| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(format!("{} must be between 0 and 1, got {}", name, v))
            }
        };
        unit("detection.confidence_threshold", self.detection.confidence_threshold)?;
        unit("detection.iou_threshold", self.detection.iou_threshold)?;
        unit("detection.color.min_fire_ratio", self.detection.color.min_fire_ratio)?;
        unit("detection.color.max_white_ratio", self.detection.color.max_white_ratio)?;
        unit("verification.score_threshold", self.verification.score_threshold)?;
        unit(
            "verification.fallback_confidence",
            self.verification.fallback_confidence,
        )?;

        if self.detection.input_size == 0 || self.detection.input_size % 32 != 0 {
            return Err(format!(
                "detection.input_size must be a positive multiple of 32, got {}",
                self.detection.input_size
            ));
        }
        if self.detection.class_names.is_empty() {
            return Err("detection.class_names must not be empty".into());
        }
        if self.detection.process_every_n_frames == 0 {
            return Err("detection.process_every_n_frames must be at least 1".into());
        }
        if self.camera.heartbeat_timeout_secs == 0 || self.camera.heartbeat_check_secs == 0 {
            return Err("camera heartbeat durations must be greater than zero".into());
        }
        if self.recording.enabled && self.recording.duration_secs == 0 {
            return Err("recording.duration_secs must be greater than zero".into());
        }
        if self.verification.queue_depth == 0 {
            return Err("verification.queue_depth must be at least 1".into());
        }
        if self.verification.enabled && self.verification.api_key.trim().is_empty() {
            warn!("Verification enabled but no API key configured. Running detector-only.");
            self.verification.enabled = false;
        }
        Ok(())
    }
}

pub fn load_config(path: impl AsRef<Path>) -> Result<Config, String> {
    let cfg: Config = Figment::new()
        .merge(figment::providers::Env::prefixed("FIRESINK_").split("__"))
        .merge(figment::providers::Toml::file(path))
        .extract()
        .map_err(|e| e.to_string())?;
    Ok(cfg)
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use indoc::indoc;

    use super::{load_config, CameraMode, CliOverrides, LogFormat};

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    const MINIMAL: &str = indoc! {r#"
        [mqtt]
        address = "broker.local"

        [detection]
        model_path = "models/fire.onnx"
    "#};

    #[test]
    fn test_minimal_defaults() {
        let file = write_config(MINIMAL);
        let cfg = load_config(file.path()).unwrap();
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.mqtt.topics.announce, "lab/zaks/esp32cam/ip");
        assert_eq!(cfg.camera.mode, CameraMode::Stream);
        assert_eq!(cfg.camera.heartbeat_timeout_secs, 120);
        assert_eq!(cfg.detection.confidence_threshold, 0.35);
        assert_eq!(cfg.detection.min_area, 200);
        assert_eq!(cfg.detection.class_names, vec!["fire".to_string()]);
        assert!(cfg.detection.color.enabled);
        assert_eq!(cfg.verification.model, "gemini-2.5-flash-lite");
        assert_eq!(cfg.verification.queue_depth, 2);
        assert_eq!(cfg.alerts.cooldown_secs, 5);
        assert_eq!(cfg.recording.duration_secs, 30);
        assert_eq!(cfg.whatsapp.cooldown_secs, 60);
        assert_eq!(cfg.system.log_format, LogFormat::Pretty);
        assert!(!cfg.camera.is_manual());
    }

    #[test]
    fn test_sections_override_defaults() {
        let file = write_config(indoc! {r#"
            [system]
            log_level = "debug"
            log_format = "json"

            [mqtt]
            address = "broker.local"
            port = 8883

            [mqtt.topics]
            alert = "site/alert"

            [camera]
            mode = "snapshot"
            camera_ip = "10.0.0.7"

            [detection]
            model_path = "fire.onnx"
            class_names = ["fire", "smoke"]

            [detection.color]
            min_saturation = 70.0
        "#});
        let cfg = load_config(file.path()).unwrap();
        assert_eq!(cfg.system.log_format, LogFormat::Json);
        assert_eq!(cfg.mqtt.port, 8883);
        assert_eq!(cfg.mqtt.topics.alert, "site/alert");
        assert_eq!(cfg.mqtt.topics.event, "lab/zaks/event");
        assert_eq!(cfg.camera.mode, CameraMode::Snapshot);
        assert!(cfg.camera.is_manual());
        assert_eq!(cfg.detection.class_names.len(), 2);
        assert_eq!(cfg.detection.color.min_saturation, 70.0);
        assert_eq!(cfg.detection.color.max_white_ratio, 0.60);
    }

    #[test]
    fn test_sample_config_matches_defaults() {
        let sample_path = concat!(env!("CARGO_MANIFEST_DIR"), "/sample_config.toml");
        let mut sample = load_config(sample_path).unwrap();
        let mut minimal = load_config(write_config(MINIMAL).path()).unwrap();
        assert_eq!(sample, minimal);
        // No API key in either, so both fall back to detector-only
        sample.validate().unwrap();
        minimal.validate().unwrap();
        assert!(!sample.verification.enabled);
    }

    #[test]
    fn test_missing_required_section() {
        let file = write_config("[mqtt]\naddress = \"x\"\n");
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_overrides() {
        let file = write_config(MINIMAL);
        let mut cfg = load_config(file.path()).unwrap();
        cfg.camera.mode = CameraMode::Snapshot;
        cfg.apply_overrides(&CliOverrides {
            stream_url: Some("http://10.0.0.2:81/stream".into()),
            confidence: Some(0.5),
            no_whatsapp: true,
            debug: true,
            ..Default::default()
        });
        assert_eq!(cfg.camera.mode, CameraMode::Stream);
        assert_eq!(
            cfg.camera.stream_url.as_deref(),
            Some("http://10.0.0.2:81/stream")
        );
        assert_eq!(cfg.detection.confidence_threshold, 0.5);
        assert!(!cfg.whatsapp.enabled);
        assert!(cfg.recording.enabled);
        assert_eq!(cfg.system.log_level, "debug");
    }

    #[test]
    fn test_validate() {
        let file = write_config(MINIMAL);
        let mut cfg = load_config(file.path()).unwrap();

        // No API key: verification is switched off rather than failing
        cfg.validate().unwrap();
        assert!(!cfg.verification.enabled);

        cfg.detection.confidence_threshold = 1.5;
        assert!(cfg.validate().is_err());
        cfg.detection.confidence_threshold = 0.35;

        cfg.detection.input_size = 600;
        assert!(cfg.validate().unwrap_err().contains("multiple of 32"));
        cfg.detection.input_size = 640;

        cfg.verification.enabled = true;
        cfg.verification.api_key = "key".into();
        cfg.validate().unwrap();
        assert!(cfg.verification.enabled);
    }
}
