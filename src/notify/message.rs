use std::fmt::Display;

use chrono::TimeZone;

use crate::{config::ConfigWhatsapp, events::FireReport};

/// Caption sent with the alert photo
pub fn format_whatsapp_alert<Tz>(report: &FireReport, cfg: &ConfigWhatsapp, tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let when = report.detected_at.with_timezone(tz);
    let v = &report.verification;
    let verification = if v.verified {
        format!(
            "✅ AI verified ({:.0}%): {}",
            v.score.unwrap_or(0.0) * 100.0,
            v.reason.as_deref().unwrap_or("-")
        )
    } else if v.fallback {
        format!(
            "⚠️ Not AI verified ({}), high detector confidence",
            v.reason.as_deref().unwrap_or("unavailable")
        )
    } else {
        "ℹ️ Detector only".to_string()
    };

    let mut lines = vec![
        "🔥 *FIRE DETECTED* 🔥".to_string(),
        String::new(),
        format!("📍 Location: {}", cfg.location),
        format!("🕐 Time: {}", when.format("%Y-%m-%d %H:%M:%S")),
        format!(
            "📷 Camera: {} ({})",
            report.camera.id,
            report.camera.address.as_deref().unwrap_or("unknown")
        ),
        format!("🎯 Confidence: {:.1}%", report.confidence * 100.0),
        verification,
    ];
    if let Some(url) = &cfg.dashboard_url {
        lines.push(String::new());
        lines.push(format!("🔗 Dashboard: {}", url));
    }
    lines.push(String::new());
    lines.push("Please check the location immediately.".into());
    lines.join("\n")
}
