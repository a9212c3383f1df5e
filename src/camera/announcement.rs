use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What the camera firmware publishes (retained) whenever it joins the network
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct CameraAnnouncement {
    pub id: String,
    pub ip: Option<String>,
    pub stream_url: Option<String>,
    pub snapshot_url: Option<String>,
    pub public_ip: Option<String>,
    pub local_ip: Option<String>,
    pub ssid: String,
    pub rssi: i64,
    pub uptime: u64,
}

fn string_field(v: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| v.get(*k))
        .find_map(|f| match f {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

/// `host:port` for a URL, adding `default_port` when the host carries none
fn authority(host: &str, default_port: u16) -> String {
    if host.parse::<SocketAddr>().is_ok() {
        return host.to_string();
    }
    if let Ok(IpAddr::V6(ip)) = host.parse::<IpAddr>() {
        return format!("[{}]:{}", ip, default_port);
    }
    if host.starts_with('[') && host.ends_with(']') {
        return format!("{}:{}", host, default_port);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.is_empty() && !name.contains(':') && port.parse::<u16>().is_ok() => {
            host.to_string()
        }
        _ => format!("{}:{}", host, default_port),
    }
}

impl CameraAnnouncement {
    pub fn parse(payload: &[u8]) -> Result<CameraAnnouncement, AnnouncementError> {
        let v: Value = serde_json::from_slice(payload)?;
        if !v.is_object() {
            return Err(AnnouncementError::NotAnObject);
        }
        Ok(CameraAnnouncement {
            id: string_field(&v, &["id", "chipId"]).unwrap_or_else(|| "unknown".into()),
            ip: string_field(&v, &["ip"]),
            stream_url: string_field(&v, &["stream_url", "streamUrl"]),
            snapshot_url: string_field(&v, &["snapshot_url", "snapshotUrl"]),
            public_ip: string_field(&v, &["public_ip", "publicIp"]),
            local_ip: string_field(&v, &["local_ip", "localIp"]),
            ssid: string_field(&v, &["ssid"]).unwrap_or_else(|| "N/A".into()),
            rssi: v.get("rssi").and_then(Value::as_i64).unwrap_or(0),
            uptime: v.get("uptime").and_then(Value::as_u64).unwrap_or(0),
        })
    }

    /// The address used for display and reporting
    pub fn address(&self) -> Option<&str> {
        self.ip
            .as_deref()
            .or(self.local_ip.as_deref())
            .or(self.public_ip.as_deref())
    }

    pub fn stream_url(&self) -> Option<String> {
        if let Some(url) = &self.stream_url {
            return Some(url.clone());
        }
        self.ip
            .as_deref()
            .or(self.local_ip.as_deref())
            .map(|ip| format!("http://{}/stream", authority(ip, 81)))
    }

    /// Capture endpoints in the order they should be tried
    pub fn capture_urls(&self, tunnel: Option<&str>, prefer_public: bool) -> Vec<String> {
        let mut urls = Vec::new();
        if prefer_public {
            if let Some(public) = &self.public_ip {
                urls.push(format!("http://{}/capture", authority(public, 8081)));
            }
        }
        if let Some(tunnel) = tunnel {
            urls.push(tunnel.to_string());
        }
        if let Some(local) = self.local_ip.as_deref().or(self.ip.as_deref()) {
            urls.push(format!("http://{}/capture", authority(local, 81)));
        }
        if let Some(snapshot) = &self.snapshot_url {
            urls.push(snapshot.clone());
        }
        let mut seen = std::collections::HashSet::new();
        urls.retain(|u| seen.insert(u.clone()));
        urls
    }
}

/// Messages the camera sends on the shared event topic
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub enum CameraEvent {
    Online { rssi: i64, uptime: u64 },
    Heartbeat { rssi: i64, uptime: u64 },
    Other(String),
}

impl CameraEvent {
    pub fn parse(payload: &[u8]) -> Result<CameraEvent, AnnouncementError> {
        let v: Value = serde_json::from_slice(payload)?;
        let name = v
            .get("event")
            .and_then(Value::as_str)
            .ok_or(AnnouncementError::NotAnObject)?;
        let rssi = v.get("rssi").and_then(Value::as_i64).unwrap_or(0);
        let uptime = v.get("uptime").and_then(Value::as_u64).unwrap_or(0);
        Ok(match name {
            "esp32cam_online" => CameraEvent::Online { rssi, uptime },
            "heartbeat" => CameraEvent::Heartbeat { rssi, uptime },
            other => CameraEvent::Other(other.to_string()),
        })
    }
}

quick_error! {
    #[derive(Debug)]
    pub enum AnnouncementError {
        Json(error: serde_json::Error) {
            display("Camera message is not valid JSON: {}", error)
            source(error)
            from()
        }
        NotAnObject {
            display("Camera message has an unexpected structure")
        }
    }
}
