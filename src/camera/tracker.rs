use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use super::{CameraAnnouncement, CameraEvent};
use crate::{
    config::{CameraMode, ConfigCamera},
    events::{CameraInfo, ServiceStatus},
};

/// Where and how a detection session reads frames
#[derive(Debug, PartialEq, Clone)]
pub struct CameraTarget {
    pub camera: CameraInfo,
    pub mode: CameraMode,
    pub stream_url: Option<String>,
    /// Tried in order until one answers
    pub capture_urls: Vec<String>,
    pub manual: bool,
}

impl CameraTarget {
    /// Returns `None` if the announcement has no usable address for the configured mode
    pub fn from_announcement(ann: &CameraAnnouncement, cfg: &ConfigCamera) -> Option<CameraTarget> {
        let target = CameraTarget {
            camera: CameraInfo {
                id: ann.id.clone(),
                address: ann.address().map(str::to_string),
            },
            mode: cfg.mode,
            stream_url: ann.stream_url(),
            capture_urls: ann.capture_urls(cfg.tunnel_capture_url.as_deref(), cfg.prefer_public_ip),
            manual: false,
        };
        target.is_usable().then(|| target)
    }

    pub fn manual(cfg: &ConfigCamera) -> Option<CameraTarget> {
        if !cfg.is_manual() {
            return None;
        }
        let ip = cfg.camera_ip.clone();
        let stream_url = cfg
            .stream_url
            .clone()
            .or_else(|| ip.as_ref().map(|ip| format!("http://{}:81/stream", ip)));
        let mut capture_urls = Vec::new();
        if let Some(url) = &cfg.capture_url {
            capture_urls.push(url.clone());
        }
        if let Some(url) = &cfg.tunnel_capture_url {
            capture_urls.push(url.clone());
        }
        if let Some(ip) = &ip {
            capture_urls.push(format!("http://{}:81/capture", ip));
        }
        let address = ip.or_else(|| {
            stream_url
                .as_deref()
                .or(cfg.capture_url.as_deref())
                .and_then(host_of)
        });
        let target = CameraTarget {
            camera: CameraInfo {
                id: "manual".into(),
                address,
            },
            mode: cfg.mode,
            stream_url,
            capture_urls,
            manual: true,
        };
        target.is_usable().then(|| target)
    }

    fn is_usable(&self) -> bool {
        match self.mode {
            CameraMode::Stream => self.stream_url.is_some(),
            CameraMode::Snapshot => !self.capture_urls.is_empty(),
        }
    }

    fn same_endpoint(&self, other: &CameraTarget) -> bool {
        self.stream_url == other.stream_url && self.capture_urls == other.capture_urls
    }
}

fn host_of(url: &str) -> Option<String> {
    let rest = url.split("://").nth(1)?;
    let host = rest.split('/').next()?;
    let host = host.split(':').next()?;
    (!host.is_empty()).then(|| host.to_string())
}

#[derive(Debug, PartialEq, Clone)]
pub enum Presence {
    Announced(CameraAnnouncement),
    Event(CameraEvent),
}

#[derive(Debug, PartialEq, Clone)]
pub enum TrackerState {
    /// No camera known yet
    Waiting,
    Online {
        target: CameraTarget,
        session: u64,
    },
    Offline {
        target: CameraTarget,
        reason: String,
    },
}

#[derive(Debug, PartialEq, Clone)]
pub enum TrackerAction {
    StartSession { target: CameraTarget, session: u64 },
    StopSession { session: u64, reason: String },
    /// Call [`CameraTracker::retry`] after the delay
    RetryAfter(Duration),
    Status {
        status: ServiceStatus,
        message: String,
        camera_online: bool,
    },
}

/// Camera lifecycle state machine.
///
/// Fed with discovery messages, camera events, timer ticks and session exits. Decides when a
/// detection session should be started or stopped.
#[derive(Debug)]
pub struct CameraTracker {
    cfg: ConfigCamera,
    state: TrackerState,
    selected: Option<String>,
    known: BTreeMap<String, CameraAnnouncement>,
    last_heartbeat: Option<Instant>,
    next_session: u64,
}

impl CameraTracker {
    pub fn new(cfg: ConfigCamera) -> CameraTracker {
        CameraTracker {
            cfg,
            state: TrackerState::Waiting,
            selected: None,
            known: BTreeMap::new(),
            last_heartbeat: None,
            next_session: 1,
        }
    }

    pub fn state(&self) -> &TrackerState {
        &self.state
    }

    pub fn is_online(&self) -> bool {
        matches!(self.state, TrackerState::Online { .. })
    }

    pub fn known_cameras(&self) -> impl Iterator<Item = &CameraAnnouncement> {
        self.known.values()
    }

    /// Initial actions. A manually configured camera starts right away.
    pub fn start(&mut self, now: Instant) -> Vec<TrackerAction> {
        if self.cfg.is_manual() {
            return match CameraTarget::manual(&self.cfg) {
                Some(target) => {
                    info!(camera=?target.camera.address, "Using manually configured camera");
                    self.go_online(target, now)
                }
                None => {
                    warn!(mode=%self.cfg.mode, "Manual camera settings have no usable URL for this mode");
                    vec![status(
                        ServiceStatus::WaitingForCamera,
                        "Manual camera has no usable URL",
                        false,
                    )]
                }
            };
        }
        vec![status(
            ServiceStatus::WaitingForCamera,
            "Waiting for camera discovery",
            false,
        )]
    }

    pub fn on_presence(&mut self, presence: Presence, now: Instant) -> Vec<TrackerAction> {
        match presence {
            Presence::Announced(ann) => self.on_announcement(ann, now),
            Presence::Event(CameraEvent::Online { .. }) | Presence::Event(CameraEvent::Heartbeat { .. }) => {
                if self.selected.is_none() {
                    return Vec::new();
                }
                self.last_heartbeat = Some(now);
                let target = match &self.state {
                    TrackerState::Offline { target, .. } if !target.manual => target.clone(),
                    _ => return Vec::new(),
                };
                info!(camera=%target.camera.id, "Camera is back online");
                self.go_online(target, now)
            }
            Presence::Event(CameraEvent::Other(name)) => {
                debug!(event=%name, "Ignoring camera event");
                Vec::new()
            }
        }
    }

    fn on_announcement(&mut self, ann: CameraAnnouncement, now: Instant) -> Vec<TrackerAction> {
        let id = ann.id.clone();
        self.known.insert(id.clone(), ann.clone());
        if self.cfg.is_manual() {
            debug!(camera=%id, "Camera announced while a manual camera is configured");
            return Vec::new();
        }
        if let Some(selected) = &self.selected {
            if *selected != id {
                debug!(camera=%id, selected=%selected, "Recorded announcement from another camera");
                return Vec::new();
            }
        }
        let target = match CameraTarget::from_announcement(&ann, &self.cfg) {
            Some(t) => t,
            None => {
                warn!(camera=%id, "Camera announced without a usable address");
                return Vec::new();
            }
        };
        self.selected = Some(id.clone());
        self.last_heartbeat = Some(now);

        match &self.state {
            TrackerState::Online { target: current, session } => {
                if current.same_endpoint(&target) {
                    return Vec::new();
                }
                info!(camera=%id, "Camera address changed, restarting detection");
                let mut actions = vec![TrackerAction::StopSession {
                    session: *session,
                    reason: "camera address changed".into(),
                }];
                actions.append(&mut self.go_online(target, now));
                actions
            }
            _ => {
                info!(camera=%id, address=?target.camera.address, "Camera discovered");
                self.go_online(target, now)
            }
        }
    }

    /// Periodic heartbeat check
    pub fn tick(&mut self, now: Instant) -> Vec<TrackerAction> {
        let (target, session) = match &self.state {
            TrackerState::Online { target, session } if !target.manual => {
                (target.clone(), *session)
            }
            _ => return Vec::new(),
        };
        let expired = self
            .last_heartbeat
            .map(|t| now.saturating_duration_since(t) > self.cfg.heartbeat_timeout())
            .unwrap_or(true);
        if !expired {
            return Vec::new();
        }
        warn!(camera=%target.camera.id, timeout=?self.cfg.heartbeat_timeout(), "Camera heartbeat lost");
        self.last_heartbeat = None;
        self.state = TrackerState::Offline {
            target,
            reason: "heartbeat timeout".into(),
        };
        vec![
            TrackerAction::StopSession {
                session,
                reason: "heartbeat timeout".into(),
            },
            status(ServiceStatus::CameraOffline, "Camera heartbeat lost", false),
        ]
    }

    /// A session task finished on its own. Stale sessions are ignored.
    pub fn session_ended(&mut self, session: u64, reason: &str) -> Vec<TrackerAction> {
        let target = match &self.state {
            TrackerState::Online { target, session: current } if *current == session => {
                target.clone()
            }
            _ => return Vec::new(),
        };
        let manual = target.manual;
        self.state = TrackerState::Offline {
            target,
            reason: reason.to_string(),
        };
        let mut actions = vec![status(
            ServiceStatus::CameraOffline,
            &format!("Camera session ended: {}", reason),
            false,
        )];
        if manual {
            actions.push(TrackerAction::RetryAfter(self.cfg.reconnect_pause()));
        }
        actions
    }

    /// Restarts a manual camera after [`TrackerAction::RetryAfter`]
    pub fn retry(&mut self, now: Instant) -> Vec<TrackerAction> {
        match &self.state {
            TrackerState::Offline { target, .. } if target.manual => {
                let target = target.clone();
                self.go_online(target, now)
            }
            _ => Vec::new(),
        }
    }

    /// Session to stop on shutdown
    pub fn shutdown(&mut self) -> Option<u64> {
        match std::mem::replace(&mut self.state, TrackerState::Waiting) {
            TrackerState::Online { session, .. } => Some(session),
            _ => None,
        }
    }

    fn go_online(&mut self, target: CameraTarget, now: Instant) -> Vec<TrackerAction> {
        let session = self.next_session;
        self.next_session += 1;
        self.last_heartbeat = Some(now);
        let message = format!(
            "Detecting on camera {} ({})",
            target.camera.id,
            target.camera.address.as_deref().unwrap_or("unknown address")
        );
        self.state = TrackerState::Online {
            target: target.clone(),
            session,
        };
        vec![
            TrackerAction::StartSession { target, session },
            status(ServiceStatus::Detecting, &message, true),
        ]
    }
}

fn status(status: ServiceStatus, message: &str, camera_online: bool) -> TrackerAction {
    TrackerAction::Status {
        status,
        message: message.to_string(),
        camera_online,
    }
}
