//! State machine for breath-stream sessions
//!
//! This module implements the session lifecycle using a single-writer pattern.
//! All state transitions go through the `reduce()` function, which returns
//! a new state and a list of effects to execute. Resources (capture handle,
//! transport) live in the controller; the reducer only decides when they are
//! acquired and released.

use serde::Serialize;
use uuid::Uuid;

use crate::audio::{AudioFrame, CaptureError};
use crate::streaming::TransportError;

/// Message surfaced to the user on any transport failure; details go to the log.
pub const TRANSPORT_ERROR_MESSAGE: &str = "WebSocket error";

/// Coarse connection phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Streaming,
    Disconnected,
    Error,
}

/// Status indicator shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DisplayStatus {
    Ready,
    Connecting,
    Connected,
    Recording,
    Disconnected,
    Stopped,
    Error,
}

impl DisplayStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisplayStatus::Ready => "Ready",
            DisplayStatus::Connecting => "Connecting",
            DisplayStatus::Connected => "Connected",
            DisplayStatus::Recording => "Recording",
            DisplayStatus::Disconnected => "Disconnected",
            DisplayStatus::Stopped => "Stopped",
            DisplayStatus::Error => "Error",
        }
    }
}

/// Internal state of the session workflow.
/// This is the authoritative state - all transitions go through the reducer.
#[derive(Debug, Clone, PartialEq)]
pub enum State {
    /// Nothing held. `failure` is set after a capture acquisition failed.
    Idle {
        failure: Option<String>,
    },
    /// Microphone being opened
    Acquiring {
        session_id: Uuid,
    },
    /// Capture held, transport connecting
    Connecting {
        session_id: Uuid,
    },
    Streaming {
        session_id: Uuid,
        frames_sent: u64,
    },
    /// Remote closed; capture still held until stop
    Disconnected {
        session_id: Uuid,
        reason: Option<String>,
    },
    /// Transport or capture failed; capture still held until stop
    Error {
        session_id: Uuid,
        message: String,
    },
    /// Teardown in progress
    Stopping {
        session_id: Uuid,
    },
    /// Torn down; holds nothing
    Stopped,
}

impl Default for State {
    fn default() -> Self {
        State::Idle { failure: None }
    }
}

impl State {
    /// Id of the session that owns resources in this state.
    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            State::Idle { .. } | State::Stopped => None,
            State::Acquiring { session_id }
            | State::Connecting { session_id }
            | State::Streaming { session_id, .. }
            | State::Disconnected { session_id, .. }
            | State::Error { session_id, .. }
            | State::Stopping { session_id } => Some(*session_id),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            State::Idle { .. } => "Idle",
            State::Acquiring { .. } => "Acquiring",
            State::Connecting { .. } => "Connecting",
            State::Streaming { .. } => "Streaming",
            State::Disconnected { .. } => "Disconnected",
            State::Error { .. } => "Error",
            State::Stopping { .. } => "Stopping",
            State::Stopped => "Stopped",
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        match self {
            State::Idle { .. } | State::Acquiring { .. } => ConnectionState::Idle,
            State::Connecting { .. } => ConnectionState::Connecting,
            State::Streaming { .. } => ConnectionState::Streaming,
            State::Disconnected { .. } | State::Stopping { .. } | State::Stopped => {
                ConnectionState::Disconnected
            }
            State::Error { .. } => ConnectionState::Error,
        }
    }

    pub fn display_status(&self) -> DisplayStatus {
        match self {
            State::Idle { failure: None } => DisplayStatus::Ready,
            State::Idle { failure: Some(_) } => DisplayStatus::Error,
            State::Acquiring { .. } | State::Connecting { .. } => DisplayStatus::Connecting,
            State::Streaming { frames_sent: 0, .. } => DisplayStatus::Connected,
            State::Streaming { .. } => DisplayStatus::Recording,
            State::Disconnected { .. } => DisplayStatus::Disconnected,
            State::Error { .. } => DisplayStatus::Error,
            State::Stopping { .. } | State::Stopped => DisplayStatus::Stopped,
        }
    }

    /// User-visible error text, if any.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            State::Idle { failure } => failure.as_deref(),
            State::Error { message, .. } => Some(message),
            _ => None,
        }
    }

    /// Whether a session is in progress (Start would be rejected).
    pub fn is_active(&self) -> bool {
        self.session_id().is_some()
    }
}

/// Events that can trigger state transitions.
/// These are sent from the console, the audio thread and the transport task.
#[derive(Debug, Clone)]
pub enum Event {
    /// User requested a new session
    Start,
    /// User requested teardown
    Stop,
    /// Application exit requested (stop, then leave the loop)
    Exit,

    // Capture events
    CaptureAcquired {
        id: Uuid,
    },
    CaptureFailed {
        id: Uuid,
        err: CaptureError,
    },
    /// Running capture stream failed
    CaptureLost {
        id: Uuid,
        err: CaptureError,
    },
    FrameReady {
        id: Uuid,
        frame: AudioFrame,
    },

    // Transport events
    TransportOpened {
        id: Uuid,
    },
    TransportMessage {
        id: Uuid,
        text: String,
    },
    TransportClosed {
        id: Uuid,
        reason: Option<String>,
    },
    TransportFailed {
        id: Uuid,
        err: TransportError,
    },

    TeardownComplete {
        id: Uuid,
    },
}

/// Effects to be executed after a state transition.
#[derive(Debug, Clone)]
pub enum Effect {
    AcquireCapture {
        id: Uuid,
    },
    OpenTransport {
        id: Uuid,
    },
    SendFrame {
        id: Uuid,
        frame: AudioFrame,
    },
    /// Frame arrived outside Streaming; count it and drop it
    DiscardFrame {
        id: Uuid,
    },
    ApplyResults {
        id: Uuid,
        text: String,
    },
    /// Drop the transport reference; capture stays held
    ReleaseTransport {
        id: Uuid,
    },
    /// Release everything in reverse acquisition order
    Teardown {
        id: Uuid,
    },
    /// Signal to publish a UI snapshot
    EmitUi,
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore events with stale session IDs
/// - Frames outside Streaming are discarded, never sent
/// - Stop is valid everywhere and idempotent
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    let current_id = state.session_id();
    let is_current = |eid: Uuid| current_id == Some(eid);

    match (state, event) {
        // -----------------
        // Start
        // -----------------
        (Idle { .. } | Stopped, Start) => {
            let id = Uuid::new_v4();
            (
                Acquiring { session_id: id },
                vec![AcquireCapture { id }, EmitUi],
            )
        }
        (_, Start) => {
            log::warn!("Start ignored in state {}", state.name());
            (state.clone(), vec![])
        }

        // -----------------
        // Stop / Exit
        // -----------------
        (Idle { .. }, Stop | Exit) => (Stopped, vec![EmitUi]),
        (Stopped | Stopping { .. }, Stop | Exit) => (state.clone(), vec![]),
        (
            Acquiring { session_id }
            | Connecting { session_id }
            | Streaming { session_id, .. }
            | Disconnected { session_id, .. }
            | Error { session_id, .. },
            Stop | Exit,
        ) => (
            Stopping {
                session_id: *session_id,
            },
            vec![Teardown { id: *session_id }, EmitUi],
        ),

        // -----------------
        // Acquiring
        // -----------------
        (Acquiring { session_id }, CaptureAcquired { id }) if *session_id == id => (
            Connecting { session_id: id },
            vec![OpenTransport { id }, EmitUi],
        ),
        (Acquiring { session_id }, CaptureFailed { id, err }) if *session_id == id => (
            Idle {
                failure: Some(err.to_string()),
            },
            vec![EmitUi],
        ),

        // -----------------
        // Connecting
        // -----------------
        (Connecting { session_id }, TransportOpened { id }) if *session_id == id => (
            Streaming {
                session_id: id,
                frames_sent: 0,
            },
            vec![EmitUi],
        ),
        (
            Connecting { session_id } | Streaming { session_id, .. },
            TransportClosed { id, reason },
        ) if *session_id == id => (
            Disconnected {
                session_id: id,
                reason,
            },
            vec![ReleaseTransport { id }, EmitUi],
        ),
        (
            Connecting { session_id } | Streaming { session_id, .. },
            TransportFailed { id, err },
        ) if *session_id == id => {
            log::error!("Session {}: transport failed: {}", id, err);
            (
                Error {
                    session_id: id,
                    message: TRANSPORT_ERROR_MESSAGE.to_string(),
                },
                vec![ReleaseTransport { id }, EmitUi],
            )
        }

        // -----------------
        // Streaming
        // -----------------
        (
            Streaming {
                session_id,
                frames_sent,
            },
            FrameReady { id, frame },
        ) if *session_id == id => {
            let mut effects = vec![SendFrame { id, frame }];
            // First frame flips the indicator from Connected to Recording
            if *frames_sent == 0 {
                effects.push(EmitUi);
            }
            (
                Streaming {
                    session_id: id,
                    frames_sent: frames_sent + 1,
                },
                effects,
            )
        }
        (_, FrameReady { id, .. }) if is_current(id) => (state.clone(), vec![DiscardFrame { id }]),

        // Results only count while the connection is live; not during teardown
        (Connecting { session_id } | Streaming { session_id, .. }, TransportMessage { id, text })
            if *session_id == id =>
        {
            (state.clone(), vec![ApplyResults { id, text }, EmitUi])
        }

        // -----------------
        // Capture failure while running
        // -----------------
        (
            Acquiring { session_id }
            | Connecting { session_id }
            | Streaming { session_id, .. }
            | Disconnected { session_id, .. },
            CaptureLost { id, err },
        ) if *session_id == id => (
            Error {
                session_id: id,
                message: err.to_string(),
            },
            vec![ReleaseTransport { id }, EmitUi],
        ),

        // -----------------
        // Stopping
        // -----------------
        (Stopping { session_id }, TeardownComplete { id }) if *session_id == id => {
            (Stopped, vec![EmitUi])
        }

        // -----------------
        // Stale or unhandled: no transition
        // -----------------
        _ => (state.clone(), vec![]),
    }
}
