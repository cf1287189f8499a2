//! Session metrics for breath-stream
//!
//! Counts frames and results per streaming session and keeps a short history
//! of finished sessions and errors for diagnostics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Maximum number of finished sessions to retain in history
const MAX_SESSION_HISTORY: usize = 20;

/// Maximum number of errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

/// Frame and result counters for one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Blocks that reached the session loop
    pub frames_captured: u64,
    /// Blocks handed to an open transport
    pub frames_sent: u64,
    /// Blocks discarded because the session was not streaming
    pub frames_discarded: u64,
    /// Blocks dropped on a full hand-off (audio thread or socket writer)
    pub frames_dropped: u64,
    pub bytes_sent: u64,
    pub results_received: u64,
    pub malformed_results: u64,
}

/// A finished session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    /// Handshake uid, when the session got that far
    pub session_uid: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub stats: SessionStats,
    /// Error that ended the session, if any
    pub error_message: Option<String>,
}

/// Record of an error that occurred during operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    /// Category of error ("capture", "transport")
    pub error_type: String,
    pub message: String,
    pub session_id: Option<String>,
}

/// Everything the front end can show about past sessions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsReport {
    pub total_sessions: u64,
    /// Newest first
    pub history: Vec<SessionSummary>,
    /// Newest first
    pub errors: Vec<ErrorRecord>,
}

struct SessionInProgress {
    session_id: Uuid,
    session_uid: Option<String>,
    started_at: Instant,
    started_at_utc: DateTime<Utc>,
    stats: SessionStats,
    error_message: Option<String>,
}

/// Collects counters for the active session and a history of past ones
pub struct MetricsCollector {
    /// History of finished sessions (newest first)
    history: VecDeque<SessionSummary>,
    /// History of errors (newest first)
    errors: VecDeque<ErrorRecord>,
    current: Option<SessionInProgress>,
    /// Bumped by the audio thread when the loop hand-off is full
    overflow: Arc<AtomicU64>,
    total_sessions: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(MAX_SESSION_HISTORY),
            errors: VecDeque::with_capacity(MAX_ERROR_HISTORY),
            current: None,
            overflow: Arc::new(AtomicU64::new(0)),
            total_sessions: 0,
        }
    }

    /// Start tracking a session. An unfinished previous session is closed out.
    pub fn start_session(&mut self, session_id: Uuid) {
        if self.current.is_some() {
            log::warn!(
                "Metrics: closing unfinished session before starting {}",
                session_id
            );
            self.finish_session();
        }

        log::debug!("Metrics: starting session {}", session_id);
        self.overflow.store(0, Ordering::SeqCst);
        self.current = Some(SessionInProgress {
            session_id,
            session_uid: None,
            started_at: Instant::now(),
            started_at_utc: Utc::now(),
            stats: SessionStats::default(),
            error_message: None,
        });
        self.total_sessions += 1;
    }

    pub fn set_session_uid(&mut self, uid: &str) {
        if let Some(ref mut session) = self.current {
            session.session_uid = Some(uid.to_string());
        }
    }

    /// Counter shared with the audio thread for hand-off overflow.
    pub fn overflow_counter(&self) -> Arc<AtomicU64> {
        self.overflow.clone()
    }

    pub fn frame_captured(&mut self) {
        self.with_stats(|s| s.frames_captured += 1);
    }

    pub fn frame_sent(&mut self, bytes: usize) {
        self.with_stats(|s| {
            s.frames_sent += 1;
            s.bytes_sent += bytes as u64;
        });
    }

    pub fn frame_discarded(&mut self) {
        self.with_stats(|s| s.frames_discarded += 1);
    }

    pub fn frame_dropped(&mut self) {
        self.with_stats(|s| s.frames_dropped += 1);
    }

    pub fn result_received(&mut self, malformed: bool) {
        self.with_stats(|s| {
            if malformed {
                s.malformed_results += 1;
            } else {
                s.results_received += 1;
            }
        });
    }

    /// Record an error; it is also attached to the active session.
    pub fn record_error(&mut self, error_type: &str, message: &str) {
        let session_id = self.current.as_mut().map(|session| {
            session.error_message = Some(message.to_string());
            session.session_id.to_string()
        });

        let error = ErrorRecord {
            timestamp: Utc::now(),
            error_type: error_type.to_string(),
            message: message.to_string(),
            session_id,
        };

        log::debug!("Metrics: recording error - {:?}", error);

        self.errors.push_front(error);
        while self.errors.len() > MAX_ERROR_HISTORY {
            self.errors.pop_back();
        }
    }

    /// Counters of the active session, overflow drops included.
    pub fn current_stats(&self) -> Option<SessionStats> {
        self.current.as_ref().map(|session| {
            let mut stats = session.stats;
            stats.frames_dropped += self.overflow.load(Ordering::SeqCst);
            stats
        })
    }

    /// Close out the active session and return its summary.
    pub fn finish_session(&mut self) -> Option<SessionSummary> {
        let stats = self.current_stats()?;
        let session = self.current.take()?;

        let summary = SessionSummary {
            session_id: session.session_id.to_string(),
            session_uid: session.session_uid,
            started_at: session.started_at_utc,
            duration_ms: session.started_at.elapsed().as_millis() as u64,
            stats,
            error_message: session.error_message,
        };

        log::info!(
            "Metrics: session {} finished after {}ms - captured {}, sent {} ({} bytes), discarded {}, dropped {}, results {} (+{} malformed)",
            summary.session_id,
            summary.duration_ms,
            stats.frames_captured,
            stats.frames_sent,
            stats.bytes_sent,
            stats.frames_discarded,
            stats.frames_dropped,
            stats.results_received,
            stats.malformed_results
        );

        self.history.push_front(summary.clone());
        while self.history.len() > MAX_SESSION_HISTORY {
            self.history.pop_back();
        }

        Some(summary)
    }

    /// Most recently finished session
    pub fn last_summary(&self) -> Option<&SessionSummary> {
        self.history.front()
    }

    pub fn total_sessions(&self) -> u64 {
        self.total_sessions
    }

    /// Finished sessions (newest first)
    pub fn get_history(&self) -> Vec<SessionSummary> {
        self.history.iter().cloned().collect()
    }

    /// Errors (newest first)
    pub fn get_errors(&self) -> Vec<ErrorRecord> {
        self.errors.iter().cloned().collect()
    }

    /// Snapshot of the history and error log for display.
    pub fn report(&self) -> MetricsReport {
        MetricsReport {
            total_sessions: self.total_sessions(),
            history: self.get_history(),
            errors: self.get_errors(),
        }
    }

    fn with_stats(&mut self, update: impl FnOnce(&mut SessionStats)) {
        if let Some(ref mut session) = self.current {
            update(&mut session.stats);
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
