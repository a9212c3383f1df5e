use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{Verdict, Verifier, VerifyError};
use crate::config::ConfigVerification;

const MAX_REASON_CHARS: usize = 150;
const TEMPERATURE: f64 = 0.3;
const MAX_OUTPUT_TOKENS: u32 = 500;

/// Result of the startup request used to find out whether verification can be used at all
#[derive(Debug, PartialEq, Clone)]
pub enum Availability {
    Available,
    InvalidKey,
    QuotaExceeded,
    Unavailable(String),
}

/// Asks a Gemini vision model whether a frame really shows fire
pub struct GeminiVerifier {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    threshold: f32,
}

impl GeminiVerifier {
    pub fn new(cfg: &ConfigVerification) -> Result<GeminiVerifier, VerifyError> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout())
            .build()
            .map_err(VerifyError::Client)?;
        Ok(GeminiVerifier {
            client,
            endpoint: format!(
                "{}/models/{}:generateContent",
                cfg.api_base.trim_end_matches('/'),
                cfg.model
            ),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            threshold: cfg.score_threshold,
        })
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, reqwest::Error> {
        self.client
            .post(&self.endpoint)
            .header("X-goog-api-key", &self.api_key)
            .json(body)
            .send()
            .await
    }

    pub async fn check_availability(&self) -> Availability {
        let body = request_body("Hello", None);
        let outcome = match self.post(&body).await {
            Ok(res) => match res.status().as_u16() {
                200 => Availability::Available,
                403 => Availability::InvalidKey,
                429 => Availability::QuotaExceeded,
                other => Availability::Unavailable(format!("HTTP {}", other)),
            },
            Err(e) => Availability::Unavailable(e.to_string()),
        };
        match &outcome {
            Availability::Available => info!(model=%self.model, "Gemini verification available"),
            other => warn!(model=%self.model, outcome=?other, "Gemini verification unavailable"),
        }
        outcome
    }
}

#[async_trait]
impl Verifier for GeminiVerifier {
    fn name(&self) -> &str {
        &self.model
    }

    async fn verify(&self, jpeg: &[u8], detector_confidence: f32) -> Verdict {
        let body = request_body(&prompt(detector_confidence), Some(jpeg));
        let res = match self.post(&body).await {
            Ok(res) => res,
            Err(e) if e.is_timeout() => {
                return Verdict::Failed {
                    reason: "request timed out".into(),
                }
            }
            Err(e) => {
                return Verdict::Failed {
                    reason: format!("request failed: {}", e),
                }
            }
        };
        match res.status().as_u16() {
            200 => {}
            429 => return Verdict::QuotaExceeded,
            other => {
                return Verdict::Failed {
                    reason: format!("HTTP {}", other),
                }
            }
        }
        match res.json::<Value>().await {
            Ok(v) => {
                let verdict = parse_gemini_response(&v, self.threshold);
                debug!(?verdict, "Gemini verdict");
                verdict
            }
            Err(e) => Verdict::Failed {
                reason: format!("invalid response body: {}", e),
            },
        }
    }
}

fn prompt(detector_confidence: f32) -> String {
    format!(
        "A fire detector flagged this camera frame with {:.0}% confidence. \
         Decide whether it shows real fire or flames. Lamps, sunsets, reflections, \
         orange or red objects and screens are not fire. \
         Answer only with JSON: {{\"is_fire\": true or false, \"score\": number from 0.0 to 1.0, \
         \"reason\": \"short explanation\"}}",
        detector_confidence * 100.0
    )
}

fn request_body(text: &str, jpeg: Option<&[u8]>) -> Value {
    let mut parts = vec![json!({ "text": text })];
    if let Some(jpeg) = jpeg {
        parts.push(json!({
            "inline_data": {
                "data": base64::engine::general_purpose::STANDARD.encode(jpeg),
                "mime_type": "image/jpeg",
            }
        }));
    }
    json!({
        "contents": [{ "parts": parts }],
        "generationConfig": {
            "maxOutputTokens": MAX_OUTPUT_TOKENS,
            "temperature": TEMPERATURE,
        }
    })
}

/// Pulls the JSON object out of the model text, which may be wrapped in a markdown fence
fn extract_json(text: &str) -> Option<&str> {
    let text = text.trim();
    for fence in ["```json", "```"] {
        if let Some(start) = text.find(fence) {
            let rest = &text[start + fence.len()..];
            if let Some(end) = rest.find("```") {
                return Some(rest[..end].trim());
            }
        }
    }
    // First flat object
    let mut search = 0;
    while let Some(open) = text[search..].find('{').map(|i| i + search) {
        let after = &text[open + 1..];
        match after.find(|c| c == '{' || c == '}') {
            Some(i) if after.as_bytes()[i] == b'}' => return Some(&text[open..open + 1 + i + 1]),
            Some(i) => search = open + 1 + i,
            None => break,
        }
    }
    None
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn failed(reason: &str) -> Verdict {
    Verdict::Failed {
        reason: reason.to_string(),
    }
}

/// Interprets a `generateContent` response body
pub fn parse_gemini_response(body: &Value, threshold: f32) -> Verdict {
    let candidate = match body
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
    {
        Some(c) => c,
        None => return failed("no candidates in response"),
    };
    match candidate.get("finishReason").and_then(Value::as_str) {
        Some("SAFETY") => return failed("blocked by safety filter"),
        Some("MAX_TOKENS") => return failed("response truncated"),
        _ => {}
    }
    let text = match candidate
        .pointer("/content/parts/0/text")
        .and_then(Value::as_str)
    {
        Some(t) => t,
        None => return failed("no text in response"),
    };
    let parsed: Value = match extract_json(text).and_then(|j| serde_json::from_str(j).ok()) {
        Some(v) => v,
        None => return failed("response was not JSON"),
    };

    let is_fire = match parsed.get("is_fire") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    };
    let mut score = parsed
        .get("score")
        .or_else(|| parsed.get("confidence"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0) as f32;
    // Some answers come back as a percentage
    if score > 1.0 && score <= 100.0 {
        score /= 100.0;
    }
    let score = score.clamp(0.0, 1.0);
    let reason = parsed
        .get("reason")
        .or_else(|| parsed.get("description"))
        .and_then(Value::as_str)
        .map(|r| truncate_chars(r, MAX_REASON_CHARS))
        .unwrap_or_default();

    if is_fire && score >= threshold {
        Verdict::Verified { score, reason }
    } else {
        Verdict::Rejected { score, reason }
    }
}
