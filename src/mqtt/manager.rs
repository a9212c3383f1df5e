use crate::{
    camera::{CameraAnnouncement, CameraEvent, Presence},
    config::MqttTopicsConfig,
    events::{CameraInfo, FireReport, PipelineEvent, ServiceStatus},
    pipeline::StatsSnapshot,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
struct StatusState {
    status: ServiceStatus,
    message: String,
    camera_online: bool,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct Manager {
    topics: MqttTopics,
    /// Reported as `source` in published events
    source: String,
    status: StatusState,
    stats: Option<StatsSnapshot>,
}

impl Manager {
    pub fn new(topics: MqttTopics, source: String) -> Manager {
        Manager {
            topics,
            source,
            status: StatusState {
                status: ServiceStatus::Starting,
                message: "Starting up".into(),
                camera_online: false,
            },
            stats: None,
        }
    }
    /// Last will: the retained status flips to offline when the service disappears
    pub fn mqtt_lwt(&self) -> MqttMessage {
        MqttMessage::new(
            self.topics.get_status(),
            MqttQoS::AtLeastOnce,
            true,
            json!({
                "camera_online": false,
                "message": "Connection lost",
                "status": ServiceStatus::Offline,
            }),
        )
    }
    /// Topics the service listens on for camera discovery and heartbeats
    pub fn subscriptions(&self) -> Vec<String> {
        vec![self.topics.get_announce(), self.topics.get_event()]
    }
    /// Call this when an MQTT connection is established. Republishes the current status and the latest stats.
    pub fn mqtt_connection_established(&self, now: DateTime<Utc>) -> Vec<MqttMessage> {
        let mut messages = vec![self.message_status(now)];
        if let Some(stats) = &self.stats {
            messages.push(self.message_stats(stats, now));
        }
        messages
    }
    pub fn next_event(&mut self, event: PipelineEvent, now: DateTime<Utc>) -> Vec<MqttMessage> {
        match event {
            PipelineEvent::Status {
                status,
                message,
                camera_online,
            } => {
                self.status = StatusState {
                    status,
                    message,
                    camera_online,
                };
                vec![self.message_status(now)]
            }
            PipelineEvent::DetectionStarted { camera } => {
                vec![self.message_camera_event("detection_started", &camera, None, now)]
            }
            PipelineEvent::DetectionStopped { camera, reason } => {
                vec![self.message_camera_event("detection_stopped", &camera, Some(&reason), now)]
            }
            PipelineEvent::Alert(report) => {
                let payload = self.alert_payload(&report);
                vec![
                    MqttMessage::new(
                        self.topics.get_alert(),
                        MqttQoS::AtLeastOnce,
                        false,
                        payload.clone(),
                    ),
                    MqttMessage::new(self.topics.get_event(), MqttQoS::AtLeastOnce, false, payload),
                ]
            }
            PipelineEvent::Stats(stats) => {
                let message = self.message_stats(&stats, now);
                self.stats = Some(stats);
                vec![message]
            }
            PipelineEvent::Log {
                category,
                level,
                message,
            } => vec![MqttMessage::new(
                self.topics.get_log(),
                MqttQoS::AtMostOnce,
                false,
                json!({
                    "category": category,
                    "level": level,
                    "message": message,
                    "source": self.source,
                    "timestamp": now.timestamp_millis(),
                    "type": "log",
                }),
            )],
        }
    }
    /// Turns a message on a subscribed topic into a camera presence update
    pub fn incoming(&self, topic: &str, payload: &[u8]) -> Option<Presence> {
        if topic == self.topics.get_announce() {
            match CameraAnnouncement::parse(payload) {
                Ok(ann) => Some(Presence::Announced(ann)),
                Err(e) => {
                    warn!(topic, error=%e, "Ignoring invalid camera announcement");
                    None
                }
            }
        } else if topic == self.topics.get_event() {
            match CameraEvent::parse(payload) {
                Ok(CameraEvent::Other(name)) => {
                    debug!(event=%name, "Ignoring event");
                    None
                }
                Ok(event) => Some(Presence::Event(event)),
                Err(e) => {
                    debug!(topic, error=%e, "Ignoring unparseable event");
                    None
                }
            }
        } else {
            debug!(topic, "Message on unexpected topic");
            None
        }
    }
    fn message_status(&self, now: DateTime<Utc>) -> MqttMessage {
        MqttMessage::new(
            self.topics.get_status(),
            MqttQoS::AtLeastOnce,
            true,
            json!({
                "camera_online": self.status.camera_online,
                "message": self.status.message,
                "status": self.status.status,
                "timestamp": now.timestamp_millis(),
            }),
        )
    }
    fn message_stats(&self, stats: &StatsSnapshot, now: DateTime<Utc>) -> MqttMessage {
        let mut payload = json!(stats);
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("timestamp".into(), now.timestamp_millis().into());
        }
        MqttMessage::new(self.topics.get_stats(), MqttQoS::AtMostOnce, true, payload)
    }
    fn message_camera_event(
        &self,
        event: &str,
        camera: &CameraInfo,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> MqttMessage {
        let mut payload = json!({
            "camera_id": camera.id,
            "camera_ip": camera.address,
            "event": event,
            "source": self.source,
            "timestamp": now.timestamp_millis(),
        });
        if let (Some(reason), Some(obj)) = (reason, payload.as_object_mut()) {
            obj.insert("reason".into(), reason.into());
        }
        MqttMessage::new(self.topics.get_event(), MqttQoS::AtLeastOnce, false, payload)
    }
    fn alert_payload(&self, report: &FireReport) -> serde_json::Value {
        let v = &report.verification;
        json!({
            "area": report.area.round() as u64,
            "bbox": report.bbox.as_pixels(),
            "camera_id": report.camera.id,
            "camera_ip": report.camera.address,
            "event": "fire_detected",
            "fallback": v.fallback,
            "gemini_reason": v.reason,
            "gemini_score": v.score.map(round3),
            "gemini_verified": v.verified,
            "source": self.source,
            "timestamp": report.detected_at.timestamp_millis(),
            "yolo_confidence": round3(report.confidence),
        })
    }
}

fn round3(v: f32) -> f64 {
    (v as f64 * 1000.0).round() / 1000.0
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct MqttTopics {
    announce: String,
    event: String,
    alert: String,
    status: String,
    log: String,
    stats: String,
}

impl MqttTopics {
    pub fn new(cfg: &MqttTopicsConfig) -> Self {
        Self {
            announce: cfg.announce.clone(),
            event: cfg.event.clone(),
            alert: cfg.alert.clone(),
            status: cfg.status.clone(),
            log: cfg.log.clone(),
            stats: cfg.stats.clone(),
        }
    }
    pub(self) fn get_announce(&self) -> String {
        self.announce.clone()
    }
    pub(self) fn get_event(&self) -> String {
        self.event.clone()
    }
    pub(self) fn get_alert(&self) -> String {
        self.alert.clone()
    }
    pub(self) fn get_status(&self) -> String {
        self.status.clone()
    }
    pub(self) fn get_log(&self) -> String {
        self.log.clone()
    }
    pub(self) fn get_stats(&self) -> String {
        self.stats.clone()
    }
}
impl Default for MqttTopics {
    fn default() -> Self {
        Self::new(&MqttTopicsConfig::default())
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub qos: MqttQoS,
    pub retain: bool,
    pub payload: MqttPayload,
}

impl MqttMessage {
    pub fn new(topic: String, qos: MqttQoS, retain: bool, payload: impl Into<MqttPayload>) -> Self {
        Self {
            topic,
            qos,
            retain,
            payload: payload.into(),
        }
    }
}
impl From<MqttMessage> for rumqttc::LastWill {
    fn from(m: MqttMessage) -> Self {
        rumqttc::LastWill::new(m.topic, m.payload.render(), m.qos.into(), m.retain)
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[allow(clippy::enum_variant_names)]
pub enum MqttQoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
}
impl From<MqttQoS> for rumqttc::QoS {
    fn from(q: MqttQoS) -> Self {
        use rumqttc::QoS;
        match q {
            MqttQoS::AtMostOnce => QoS::AtMostOnce,
            MqttQoS::AtLeastOnce => QoS::AtLeastOnce,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub enum MqttPayload {
    Json(serde_json::Value),
}

impl MqttPayload {
    pub fn render(self) -> Vec<u8> {
        match self {
            MqttPayload::Json(j) => j.to_string().into(),
        }
    }
    #[cfg(test)]
    fn json(&self) -> &serde_json::Value {
        match self {
            MqttPayload::Json(j) => j,
        }
    }
}

impl From<serde_json::Value> for MqttPayload {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

#[cfg(test)]
mod test {
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    use super::{Manager, MqttQoS, MqttTopics};
    use crate::{
        camera::{CameraEvent, Presence},
        detect::BoundingBox,
        events::{CameraInfo, FireReport, LogLevel, PipelineEvent, ServiceStatus, VerificationSummary},
        pipeline::StatsSnapshot,
    };

    fn manager() -> Manager {
        Manager::new(MqttTopics::default(), "fire_sink".into())
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap()
    }

    fn camera() -> CameraInfo {
        CameraInfo {
            id: "A1B2C3".into(),
            address: Some("192.168.1.40".into()),
        }
    }

    #[test]
    fn test_lwt() {
        insta::assert_json_snapshot!(manager().mqtt_lwt(), @r###"
        {
          "topic": "lab/zaks/fire/status",
          "qos": "AtLeastOnce",
          "retain": true,
          "payload": {
            "Json": {
              "camera_online": false,
              "message": "Connection lost",
              "status": "offline"
            }
          }
        }
        "###);
    }

    #[test]
    fn test_connection_republishes_state() {
        let mut manager = manager();
        let initial = manager.mqtt_connection_established(now());
        assert_eq!(initial.len(), 1);
        assert_eq!(initial[0].payload.json()["status"], "starting");

        manager.next_event(
            PipelineEvent::Status {
                status: ServiceStatus::Detecting,
                message: "Detecting on camera A1B2C3".into(),
                camera_online: true,
            },
            now(),
        );
        manager.next_event(PipelineEvent::Stats(StatsSnapshot::default()), now());

        let messages = manager.mqtt_connection_established(now());
        assert_eq!(messages.len(), 2);
        assert_eq!(
            messages[0].payload.json(),
            &json!({
                "camera_online": true,
                "message": "Detecting on camera A1B2C3",
                "status": "detecting",
                "timestamp": 1709993107000i64,
            })
        );
        assert!(messages[0].retain);
        assert_eq!(messages[1].topic, "lab/zaks/fire/stats");
        assert_eq!(messages[1].payload.json()["frames_processed"], 0);
        assert_eq!(messages[1].payload.json()["timestamp"], 1709993107000i64);
    }

    #[test]
    fn test_alert_to_both_topics() {
        let mut manager = manager();
        let report = FireReport {
            camera: camera(),
            detected_at: now(),
            model: "fire.onnx".into(),
            class_name: "fire".into(),
            confidence: 0.87314,
            bbox: BoundingBox::new(10.2, 20.7, 110.0, 140.4),
            area: 11940.4,
            color: None,
            verification: VerificationSummary {
                verified: true,
                score: Some(0.9),
                reason: Some("open flames".into()),
                fallback: false,
            },
        };
        let messages = manager.next_event(PipelineEvent::Alert(report), now());
        let topics: Vec<&str> = messages.iter().map(|m| m.topic.as_str()).collect();
        assert_eq!(topics, vec!["lab/zaks/alert", "lab/zaks/event"]);
        assert_eq!(messages[0].qos, MqttQoS::AtLeastOnce);
        assert!(!messages[0].retain);
        assert_eq!(
            messages[0].payload.json(),
            &json!({
                "area": 11940,
                "bbox": [10, 21, 110, 140],
                "camera_id": "A1B2C3",
                "camera_ip": "192.168.1.40",
                "event": "fire_detected",
                "fallback": false,
                "gemini_reason": "open flames",
                "gemini_score": 0.9,
                "gemini_verified": true,
                "source": "fire_sink",
                "timestamp": 1709993107000i64,
                "yolo_confidence": 0.873,
            })
        );
        assert_eq!(messages[0].payload, messages[1].payload);
    }

    #[test]
    fn test_session_and_log_events() {
        let mut manager = manager();
        let stopped = manager.next_event(
            PipelineEvent::DetectionStopped {
                camera: camera(),
                reason: "heartbeat timeout".into(),
            },
            now(),
        );
        assert_eq!(stopped[0].topic, "lab/zaks/event");
        assert_eq!(stopped[0].payload.json()["event"], "detection_stopped");
        assert_eq!(stopped[0].payload.json()["reason"], "heartbeat timeout");

        let started = manager.next_event(PipelineEvent::DetectionStarted { camera: camera() }, now());
        assert!(started[0].payload.json().get("reason").is_none());

        let log = manager.next_event(
            PipelineEvent::Log {
                category: "alert".into(),
                level: LogLevel::Warning,
                message: "Fire detected".into(),
            },
            now(),
        );
        assert_eq!(
            log[0].payload.json(),
            &json!({
                "category": "alert",
                "level": "warning",
                "message": "Fire detected",
                "source": "fire_sink",
                "timestamp": 1709993107000i64,
                "type": "log",
            })
        );
    }

    #[test]
    fn test_incoming() {
        let manager = manager();
        match manager.incoming("lab/zaks/esp32cam/ip", br#"{"id": "A1B2C3", "ip": "192.168.1.40"}"#) {
            Some(Presence::Announced(ann)) => assert_eq!(ann.address(), Some("192.168.1.40")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            manager.incoming("lab/zaks/event", br#"{"event": "heartbeat", "rssi": -60, "uptime": 42}"#),
            Some(Presence::Event(CameraEvent::Heartbeat { rssi: -60, uptime: 42 }))
        );
        // Our own alerts come back on the shared event topic
        assert_eq!(
            manager.incoming("lab/zaks/event", br#"{"event": "fire_detected"}"#),
            None
        );
        assert_eq!(manager.incoming("lab/zaks/esp32cam/ip", b"not json"), None);
        assert_eq!(manager.incoming("other/topic", b"{}"), None);
    }

    #[test]
    fn test_payload_render() {
        let mq = manager().mqtt_lwt().payload;
        insta::assert_snapshot!(String::from_utf8(mq.render()).unwrap(), @r###"{"camera_online":false,"message":"Connection lost","status":"offline"}"###);
    }
}
