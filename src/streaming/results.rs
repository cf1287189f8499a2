//! Decoding of analysis results pushed by the service

use serde::Serialize;
use serde_json::Value;

/// Last successfully decoded analysis values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BreathMetrics {
    pub breath_count: u64,
    pub noise_detected: bool,
}

/// Inbound payload could not be decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    MalformedPayload(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::MalformedPayload(e) => write!(f, "Malformed result payload: {}", e),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Decode one inbound text message.
///
/// Only non-JSON or non-object payloads fail. Missing or odd fields fall
/// back to zero / false.
pub fn decode(text: &str) -> Result<BreathMetrics, DecodeError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| DecodeError::MalformedPayload(e.to_string()))?;

    let object = value
        .as_object()
        .ok_or_else(|| DecodeError::MalformedPayload("expected a JSON object".to_string()))?;

    Ok(BreathMetrics {
        breath_count: object.get("breath_count").map(count_of).unwrap_or(0),
        noise_detected: object.get("Noise").map(noise_of).unwrap_or(false),
    })
}

fn count_of(value: &Value) -> u64 {
    if let Some(n) = value.as_u64() {
        return n;
    }
    match value.as_f64() {
        // `as` saturates and truncates toward zero
        Some(f) if f > 0.0 => f as u64,
        _ => 0,
    }
}

fn noise_of(value: &Value) -> bool {
    value
        .as_array()
        .and_then(|flags| flags.first())
        .map(is_truthy)
        .unwrap_or(false)
}

/// JavaScript truthiness: `false`, `0`, `""` and `null` are falsy.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Keeps the last good metrics across malformed messages.
#[derive(Debug, Default)]
pub struct ResultsReceiver {
    latest: BreathMetrics,
}

impl ResultsReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an inbound message. Returns the new metrics, or `None` when the
    /// payload was malformed and the previous values were kept.
    pub fn receive(&mut self, text: &str) -> Option<BreathMetrics> {
        match decode(text) {
            Ok(metrics) => {
                log::trace!(
                    "Results: breath_count={} noise={}",
                    metrics.breath_count,
                    metrics.noise_detected
                );
                self.latest = metrics;
                Some(metrics)
            }
            Err(e) => {
                log::debug!("Results: ignoring payload: {}", e);
                None
            }
        }
    }

    pub fn latest(&self) -> BreathMetrics {
        self.latest
    }

    pub fn reset(&mut self) {
        self.latest = BreathMetrics::default();
    }
}
