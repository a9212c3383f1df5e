use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::{
    detect::{BoundingBox, ColorStats},
    pipeline::StatsSnapshot,
};

/// Overall service state as published on the retained status topic
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ServiceStatus {
    Starting,
    WaitingForCamera,
    Detecting,
    CameraOffline,
    Offline,
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Default)]
pub struct CameraInfo {
    pub id: String,
    pub address: Option<String>,
}

/// How the decision to alert was reached
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone, Default)]
pub struct VerificationSummary {
    pub verified: bool,
    pub score: Option<f32>,
    pub reason: Option<String>,
    /// Alerted on detector confidence alone because verification was unavailable
    pub fallback: bool,
}

/// Everything known about a confirmed fire
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct FireReport {
    pub camera: CameraInfo,
    pub detected_at: DateTime<Utc>,
    pub model: String,
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub area: f32,
    pub color: Option<ColorStats>,
    pub verification: VerificationSummary,
}

/// A confirmed fire ready to be sent out
#[derive(Debug, Clone)]
pub struct ConfirmedFire {
    pub report: FireReport,
    /// Annotated frame, JPEG encoded
    pub snapshot: Vec<u8>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub enum PipelineEvent {
    Status {
        status: ServiceStatus,
        message: String,
        camera_online: bool,
    },
    DetectionStarted {
        camera: CameraInfo,
    },
    DetectionStopped {
        camera: CameraInfo,
        reason: String,
    },
    Alert(FireReport),
    Stats(StatsSnapshot),
    Log {
        category: String,
        level: LogLevel,
        message: String,
    },
}
