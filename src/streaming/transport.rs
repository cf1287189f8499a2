//! WebSocket transport to the analysis service
//!
//! # Connection Flow
//!
//! 1. `open()` - validate the URL and spawn the connection task
//! 2. The task connects, sends the handshake text once, then reports `Opened`
//! 3. `send()` - hand a binary frame to the task (only while open)
//! 4. `next_event()` - inbound text messages, close and failure notifications
//! 5. `close()` / `shutdown()` - send a close frame and stop the task
//!
//! There is no retry: a failed or closed connection stays closed.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, handshake::client::Request, Message},
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::TransportError;
use crate::audio::EncodedFrame;

/// Frames buffered between `send()` and the socket writer
const FRAME_QUEUE_DEPTH: usize = 4;

/// Capacity of the inbound event channel
const EVENT_QUEUE_DEPTH: usize = 100;

/// How long `shutdown()` waits for the close handshake
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Notifications from the connection task.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Connected and handshake sent
    Opened,
    /// Inbound text payload
    Message(String),
    /// Remote closed the connection (`"code reason"` when provided)
    Closed(Option<String>),
    Failed(TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Open,
    Closed,
}

/// Result of handing a frame to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Accepted,
    /// Transport not open; frame discarded
    DiscardedNotOpen,
    /// Writer hand-off full; frame discarded
    DroppedBackpressure,
}

/// One WebSocket connection. Never reconnects.
pub struct SocketTransport {
    session_id: Uuid,
    state: TransportState,
    frames_tx: mpsc::Sender<Vec<u8>>,
    events_rx: mpsc::Receiver<TransportEvent>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    closed: bool,
}

impl SocketTransport {
    /// Start connecting to `url`. The handshake is sent by the connection
    /// task before `Opened` is reported.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(session_id: Uuid, url: &str, handshake: String) -> Result<Self, TransportError> {
        let request = build_request(url)?;

        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let cancel = CancellationToken::new();

        log::info!("Transport: connecting to {} (session {})", url, session_id);

        let task = tokio::spawn(run_connection(
            request,
            handshake,
            frames_rx,
            events_tx,
            cancel.clone(),
        ));

        Ok(Self {
            session_id,
            state: TransportState::Connecting,
            frames_tx,
            events_rx,
            cancel,
            task: Some(task),
            closed: false,
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == TransportState::Open
    }

    /// Queue one binary frame. Never blocks and never retries.
    pub fn send(&mut self, frame: &EncodedFrame) -> SendOutcome {
        if self.state != TransportState::Open {
            return SendOutcome::DiscardedNotOpen;
        }

        match self.frames_tx.try_send(frame.to_le_bytes()) {
            Ok(()) => SendOutcome::Accepted,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::debug!("Transport: writer busy, dropping frame");
                SendOutcome::DroppedBackpressure
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.state = TransportState::Closed;
                SendOutcome::DiscardedNotOpen
            }
        }
    }

    /// Next notification from the connection task.
    /// Returns `None` once the task has exited and all events were drained.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        let event = self.events_rx.recv().await?;
        match &event {
            TransportEvent::Opened => {
                if self.state == TransportState::Connecting {
                    self.state = TransportState::Open;
                }
            }
            TransportEvent::Closed(_) | TransportEvent::Failed(_) => {
                self.state = TransportState::Closed;
            }
            TransportEvent::Message(_) => {}
        }
        Some(event)
    }

    /// Stop the connection. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.state = TransportState::Closed;
        self.cancel.cancel();
        self.events_rx.close();
        log::info!("Transport: closed (session {})", self.session_id);
    }

    /// Close and wait briefly for the close frame to go out.
    pub async fn shutdown(mut self) {
        self.close();
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, task).await.is_err() {
                log::warn!("Transport: close handshake timed out");
            }
        }
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.close();
        // Dropping the handle detaches; the task sees the cancelled token
        self.task.take();
    }
}

fn build_request(url: &str) -> Result<Request, TransportError> {
    let request = url
        .into_client_request()
        .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", url, e)))?;

    match request.uri().scheme_str() {
        Some("ws") | Some("wss") => Ok(request),
        other => Err(TransportError::InvalidUrl(format!(
            "{}: unsupported scheme {:?}",
            url, other
        ))),
    }
}

async fn run_connection(
    request: Request,
    handshake: String,
    mut frames_rx: mpsc::Receiver<Vec<u8>>,
    events_tx: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
) {
    let connected = tokio::select! {
        _ = cancel.cancelled() => {
            log::debug!("Transport: cancelled while connecting");
            return;
        }
        result = connect_async(request) => result,
    };

    let ws_stream = match connected {
        Ok((ws_stream, _response)) => ws_stream,
        Err(e) => {
            log::error!("Transport: connection failed: {}", e);
            let _ = events_tx
                .send(TransportEvent::Failed(TransportError::ConnectionFailed(
                    e.to_string(),
                )))
                .await;
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();

    if let Err(e) = write.send(Message::Text(handshake)).await {
        log::error!("Transport: failed to send handshake: {}", e);
        let _ = events_tx
            .send(TransportEvent::Failed(TransportError::SendFailed(
                e.to_string(),
            )))
            .await;
        return;
    }
    log::info!("Transport: connected, handshake sent");

    if events_tx.send(TransportEvent::Opened).await.is_err() {
        let _ = write.close().await;
        return;
    }

    let mut frames_sent: u64 = 0;

    loop {
        tokio::select! {
            // Frames accepted by send() go out before the close frame
            biased;

            frame = frames_rx.recv() => match frame {
                Some(bytes) => {
                    if let Err(e) = write.send(Message::Binary(bytes)).await {
                        log::error!("Transport: send failed: {}", e);
                        let _ = events_tx
                            .send(TransportEvent::Failed(TransportError::SendFailed(e.to_string())))
                            .await;
                        break;
                    }
                    frames_sent += 1;
                    log::trace!("Transport: frame {} written", frames_sent);
                }
                None => {
                    let _ = write.close().await;
                    break;
                }
            },

            _ = cancel.cancelled() => {
                if let Err(e) = write.close().await {
                    log::debug!("Transport: error sending close frame: {}", e);
                }
                break;
            }

            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if events_tx.send(TransportEvent::Message(text)).await.is_err() {
                        log::debug!("Transport: event receiver gone");
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| format!("{} {}", u16::from(f.code), f.reason));
                    log::info!("Transport: closed by server ({:?})", reason);
                    let _ = events_tx.send(TransportEvent::Closed(reason)).await;
                    break;
                }
                Some(Ok(_)) => {} // Ignore ping/pong/binary
                Some(Err(e)) => {
                    log::warn!("Transport: WebSocket error: {}", e);
                    let _ = events_tx
                        .send(TransportEvent::Failed(TransportError::ProtocolError(e.to_string())))
                        .await;
                    break;
                }
                None => {
                    log::info!("Transport: stream ended");
                    let _ = events_tx.send(TransportEvent::Closed(None)).await;
                    break;
                }
            },
        }
    }

    log::debug!("Transport: connection task exiting after {} frames", frames_sent);
}
