//! Maps provider HTTP failures onto the gateway failure taxonomy.
//!
//! Handles the common error envelopes:
//! - Standard:  `{"error": {"message": "...", "type": "..."}}`
//! - Ollama:    `{"error": "..."}`
//! - Flat:      `{"message": "..."}`

use novelize_core::GatewayError;
use serde_json::Value;

/// Markers providers put in throttling responses regardless of status code
const THROTTLE_MARKERS: [&str; 4] = [
    "too many requests",
    "throttl",
    "rate limit",
    "rate_limit",
];

/// Classify a non-success HTTP response
pub fn classify_status(status: u16, body: &str) -> GatewayError {
    let message = error_message(body).unwrap_or_else(|| format!("HTTP {status}: {body}"));
    let lowered = body.to_lowercase();

    if status == 429 || status == 529 || THROTTLE_MARKERS.iter().any(|m| lowered.contains(m)) {
        GatewayError::Throttled(message)
    } else if matches!(status, 408 | 409) || status >= 500 {
        GatewayError::Transient(message)
    } else {
        GatewayError::Fatal(message)
    }
}

/// Classify a failure that happened before a response arrived
pub fn classify_transport(err: &reqwest::Error) -> GatewayError {
    if err.is_builder() {
        GatewayError::Fatal(format!("Invalid request: {err}"))
    } else {
        GatewayError::Transient(format!("Request failed: {err}"))
    }
}

fn error_message(body: &str) -> Option<String> {
    let json: Value = serde_json::from_str(body).ok()?;

    if let Some(msg) = json["error"]["message"].as_str() {
        return Some(match json["error"]["type"].as_str() {
            Some(kind) => format!("{kind}: {msg}"),
            None => msg.to_string(),
        });
    }

    json["error"]
        .as_str()
        .or_else(|| json["message"].as_str())
        .map(String::from)
}
