use std::path::Path;

use async_trait::async_trait;

use crate::events::FireReport;

mod backend;
mod dispatcher;
mod gowa;
mod message;

pub use backend::{AlertGroups, BackendClient, Recipient};
pub use dispatcher::Dispatcher;
pub use gowa::{format_phone, GowaClient};
pub use message::format_whatsapp_alert;

/// Stores alert snapshots and knows who should be told about them
#[async_trait]
pub trait Gallery: Send + Sync {
    /// Returns the stored id, if the gallery reports one
    async fn upload_detection(
        &self,
        report: &FireReport,
        snapshot: Vec<u8>,
    ) -> Result<Option<String>, NotifyError>;
    async fn recipients(&self) -> Result<Vec<Recipient>, NotifyError>;
    async fn alert_groups(&self, fallback: Option<&Path>) -> Result<AlertGroups, NotifyError>;
}

/// Delivers WhatsApp messages to a phone number or group JID
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_image(&self, to: &str, jpeg: &[u8], caption: &str) -> Result<(), NotifyError>;
    async fn send_message(&self, to: &str, text: &str) -> Result<(), NotifyError>;
}

quick_error! {
    #[derive(Debug)]
    pub enum NotifyError {
        Http(error: reqwest::Error) {
            display("HTTP request failed: {}", error)
            source(error)
        }
        Status(status: u16, body: String) {
            display("Unexpected HTTP status {}: {}", status, body)
        }
        Rejected(message: String) {
            display("Request rejected: {}", message)
        }
        Io(error: std::io::Error) {
            display("File error: {}", error)
            source(error)
            from()
        }
        Json(error: serde_json::Error) {
            display("Invalid JSON: {}", error)
            source(error)
            from()
        }
    }
}
