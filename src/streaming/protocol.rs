//! Session handshake sent to the breath analysis service
//!
//! # Protocol Overview
//!
//! 1. Connect to `ws://host:port`
//! 2. Send one JSON text message describing the session (uid + analysis tuning)
//! 3. Stream binary little-endian PCM16 frames, one per capture block
//! 4. Receive JSON text results: `{"breath_count": N, "Noise": [flag, ...]}`
//!
//! The service never acknowledges the handshake; the first binary frame may
//! follow it immediately.

use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

/// Default analysis service endpoint
pub const DEFAULT_SERVER_URL: &str = "ws://kb.optalpha.com:8765";

/// Prefix of every session uid
pub const UID_PREFIX: &str = "guest_user_";

/// Last uid timestamp handed out in this process
static LAST_UID_MILLIS: AtomicI64 = AtomicI64::new(0);

/// Tunable constants forwarded to the remote analysis.
///
/// Values are opaque to the client and never validated. Field names (upper
/// case keys and the `thresold` spelling included) are the wire contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisTuning {
    pub rate: u32,
    pub chunk_size: u32,
    pub no_of_chunks: u32,
    pub frame_length: u32,
    pub hop_length: u32,
    pub n_mels: u32,
    pub n2: u32,
    pub n1: u32,
    pub bump_threshold: f64,
    #[serde(rename = "WINDOW_DURATION")]
    pub window_duration: f64,
    #[serde(rename = "MIN_FREQ")]
    pub min_freq: f64,
    #[serde(rename = "MAX_FREQ")]
    pub max_freq: f64,
    #[serde(rename = "CONFIRMATION_THRESHOLD")]
    pub confirmation_threshold: u32,
    pub wave_amplitude_thresold: f64,
}

impl Default for AnalysisTuning {
    fn default() -> Self {
        Self {
            rate: 16000,
            chunk_size: 4096,
            no_of_chunks: 3,
            frame_length: 512,
            hop_length: 64,
            n_mels: 128,
            n2: 30,
            n1: 10,
            bump_threshold: 0.15,
            window_duration: 4.0,
            min_freq: 0.4,
            max_freq: 2.5,
            confirmation_threshold: 4,
            wave_amplitude_thresold: 3.0,
        }
    }
}

/// Per-session handshake payload. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionParameters {
    uid: String,
    user_name: String,
    #[serde(flatten)]
    tuning: AnalysisTuning,
}

impl SessionParameters {
    /// Build parameters with a fresh process-unique uid.
    pub fn new(user_name: impl Into<String>, tuning: AnalysisTuning) -> Self {
        Self {
            uid: format!("{}{}", UID_PREFIX, next_uid_millis()),
            user_name: user_name.into(),
            tuning,
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn tuning(&self) -> &AnalysisTuning {
        &self.tuning
    }

    /// Serialize as the handshake text message.
    pub fn to_handshake(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Current unix millis, bumped past the last value handed out.
fn next_uid_millis() -> i64 {
    let now = chrono::Utc::now().timestamp_millis();
    let mut last = LAST_UID_MILLIS.load(Ordering::SeqCst);
    loop {
        let next = now.max(last + 1);
        match LAST_UID_MILLIS.compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_handshake_contains_all_fields() {
        let params = SessionParameters::new("Guest", AnalysisTuning::default());
        let json: Value = serde_json::from_str(&params.to_handshake().unwrap()).unwrap();

        assert_eq!(json["uid"], params.uid());
        assert_eq!(json["user_name"], "Guest");
        assert_eq!(json["rate"], 16000);
        assert_eq!(json["chunk_size"], 4096);
        assert_eq!(json["no_of_chunks"], 3);
        assert_eq!(json["frame_length"], 512);
        assert_eq!(json["hop_length"], 64);
        assert_eq!(json["n_mels"], 128);
        assert_eq!(json["n2"], 30);
        assert_eq!(json["n1"], 10);
        assert_eq!(json["bump_threshold"], 0.15);
        assert_eq!(json["WINDOW_DURATION"], 4.0);
        assert_eq!(json["MIN_FREQ"], 0.4);
        assert_eq!(json["MAX_FREQ"], 2.5);
        assert_eq!(json["CONFIRMATION_THRESHOLD"], 4);
        assert_eq!(json["wave_amplitude_thresold"], 3.0);
        assert_eq!(json.as_object().unwrap().len(), 16);
    }

    #[test]
    fn test_uid_format() {
        let params = SessionParameters::new("Guest", AnalysisTuning::default());
        let millis = params.uid().strip_prefix(UID_PREFIX).unwrap();
        assert!(millis.parse::<i64>().unwrap() > 0);
    }

    #[test]
    fn test_uids_are_unique_within_a_millisecond() {
        let uids: Vec<String> = (0..50)
            .map(|_| SessionParameters::new("Guest", AnalysisTuning::default()))
            .map(|p| p.uid().to_string())
            .collect();

        let mut deduped = uids.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), uids.len());
    }

    #[test]
    fn test_tuning_partial_deserialize_uses_defaults() {
        let tuning: AnalysisTuning =
            serde_json::from_str(r#"{"n_mels": 64, "MAX_FREQ": 3.0}"#).unwrap();
        assert_eq!(tuning.n_mels, 64);
        assert_eq!(tuning.max_freq, 3.0);
        assert_eq!(tuning.rate, 16000);
        assert_eq!(tuning.wave_amplitude_thresold, 3.0);
    }
}
