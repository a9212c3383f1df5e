use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::{Messenger, NotifyError};
use crate::config::ConfigWhatsapp;

/// Reply envelope used by every gateway endpoint
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone, Default)]
pub struct GowaReply {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub results: serde_json::Value,
}

impl GowaReply {
    pub fn is_success(&self) -> bool {
        self.code == "SUCCESS"
    }
}

/// Client for a go-whatsapp-web-multidevice gateway
pub struct GowaClient {
    client: reqwest::Client,
    base_url: String,
    authorization: Option<String>,
}

impl GowaClient {
    pub fn new(cfg: &ConfigWhatsapp) -> Result<GowaClient, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(NotifyError::Http)?;
        Ok(GowaClient {
            client,
            base_url: cfg.gowa_url.trim_end_matches('/').to_string(),
            authorization: cfg.authorization.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.authorization {
            Some(auth) => builder.header(reqwest::header::AUTHORIZATION, auth),
            None => builder,
        }
    }

    async fn send(&self, path: &str, body: serde_json::Value) -> Result<(), NotifyError> {
        let res = self
            .request(reqwest::Method::POST, path)
            .json(&body)
            .send()
            .await
            .map_err(NotifyError::Http)?;
        let status = res.status().as_u16();
        let reply: GowaReply = res.json().await.unwrap_or_default();
        check_reply(status, &reply)
    }

    /// Names of the devices logged into the gateway. Empty means WhatsApp is not connected.
    pub async fn devices(&self) -> Result<Vec<String>, NotifyError> {
        let res = self
            .request(reqwest::Method::GET, "/app/devices")
            .send()
            .await
            .map_err(NotifyError::Http)?;
        let status = res.status().as_u16();
        let reply: GowaReply = res.json().await.map_err(NotifyError::Http)?;
        check_reply(status, &reply)?;
        Ok(device_names(&reply))
    }

    /// Logs whether the gateway is logged in. Used once at startup.
    pub async fn log_health(&self) {
        match self.devices().await {
            Ok(devices) if !devices.is_empty() => info!(devices=?devices, "WhatsApp gateway connected"),
            Ok(_) => warn!("WhatsApp gateway reachable but no device is logged in"),
            Err(e) => warn!(error=%e, "WhatsApp gateway unreachable"),
        }
    }
}

#[async_trait]
impl Messenger for GowaClient {
    async fn send_image(&self, to: &str, jpeg: &[u8], caption: &str) -> Result<(), NotifyError> {
        self.send(
            "/send/image",
            json!({
                "phone": to,
                "image": base64::engine::general_purpose::STANDARD.encode(jpeg),
                "caption": caption,
            }),
        )
        .await
    }

    async fn send_message(&self, to: &str, text: &str) -> Result<(), NotifyError> {
        self.send("/send/message", json!({ "phone": to, "message": text }))
            .await
    }
}

fn check_reply(status: u16, reply: &GowaReply) -> Result<(), NotifyError> {
    if status == 200 && reply.is_success() {
        debug!(message=%reply.message, "Gateway accepted request");
        Ok(())
    } else if status != 200 {
        Err(NotifyError::Status(status, reply.message.clone()))
    } else {
        Err(NotifyError::Rejected(if reply.message.is_empty() {
            reply.code.clone()
        } else {
            reply.message.clone()
        }))
    }
}

fn device_names(reply: &GowaReply) -> Vec<String> {
    reply
        .results
        .as_array()
        .map(|devices| {
            devices
                .iter()
                .map(|d| {
                    d.get("name")
                        .or_else(|| d.get("device"))
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("unknown")
                        .to_string()
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Normalises a phone number for the gateway: digits only, no leading `+`.
/// Group JIDs are passed through untouched.
pub fn format_phone(raw: &str) -> String {
    if raw.contains('@') {
        return raw.trim().to_string();
    }
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::{check_reply, device_names, format_phone, GowaReply};

    #[test]
    fn test_format_phone() {
        assert_eq!(format_phone("+62 812-3456-7890"), "6281234567890");
        assert_eq!(format_phone("120363025246125486@g.us"), "120363025246125486@g.us");
    }

    #[test]
    fn test_check_reply() {
        let ok: GowaReply = serde_json::from_value(json!({"code": "SUCCESS", "message": "Success"})).unwrap();
        assert!(check_reply(200, &ok).is_ok());

        let failed: GowaReply =
            serde_json::from_value(json!({"code": "INVALID_JID", "message": "invalid phone"})).unwrap();
        assert_eq!(
            check_reply(200, &failed).unwrap_err().to_string(),
            "Request rejected: invalid phone"
        );
        assert!(check_reply(500, &GowaReply::default()).is_err());
    }

    #[test]
    fn test_device_names() {
        let reply: GowaReply = serde_json::from_value(json!({
            "code": "SUCCESS",
            "results": [{"name": "Lab phone", "device": "628123@s.whatsapp.net"}]
        }))
        .unwrap();
        assert_eq!(device_names(&reply), vec!["Lab phone".to_string()]);
        assert!(device_names(&GowaReply::default()).is_empty());
    }
}
