//! Session controller: the single consumer of session events
//!
//! Owns the state, the live resources (capture handle, transport, session
//! parameters) and the metrics. Every event, whether from the console, the
//! audio thread or the transport task, goes through `reduce()` here, and the
//! resulting effects run inline on the loop. Opening the microphone is the
//! one effect that runs off the loop: its result comes back on a separate
//! channel so that Stop is handled while the device is still opening.
//!
//! # Teardown order
//!
//! ```text
//! capture.release()  (graph → source → hardware context → tracks)
//!        │
//!        ▼
//! transport.shutdown()  →  drop session parameters  →  metrics summary
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::audio::{
    encode, CaptureBackend, CaptureConstraints, CaptureError, CaptureHandle, FaultCallback,
    FrameCallback,
};
use crate::metrics::{MetricsCollector, MetricsReport, SessionStats};
use crate::settings::AppSettings;
use crate::state_machine::{reduce, ConnectionState, DisplayStatus, Effect, Event, State};
use crate::streaming::{
    AnalysisTuning, ResultsReceiver, SendOutcome, SessionParameters, SocketTransport,
    TransportError, TransportEvent,
};

/// Capacity of the session event channel
const EVENT_QUEUE_DEPTH: usize = 64;

/// Outcome of an off-loop capture acquisition.
struct Acquisition {
    id: Uuid,
    result: Result<Box<dyn CaptureHandle>, CaptureError>,
}

/// What a session needs to know up front.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub server_url: String,
    pub user_name: String,
    pub tuning: AnalysisTuning,
    pub constraints: CaptureConstraints,
}

impl From<&AppSettings> for ControllerConfig {
    fn from(settings: &AppSettings) -> Self {
        Self {
            server_url: settings.server_url.clone(),
            user_name: settings.user_name.clone(),
            tuning: settings.analysis.clone(),
            constraints: CaptureConstraints {
                block_size: settings.block_size,
                device_name: settings.input_device.clone(),
                ..CaptureConstraints::default()
            },
        }
    }
}

/// Sends user commands to a running controller.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<Event>,
    report_rx: watch::Receiver<MetricsReport>,
}

impl ControllerHandle {
    /// Session history and error log as of the last finished session or error.
    pub fn metrics_report(&self) -> MetricsReport {
        self.report_rx.borrow().clone()
    }

    pub async fn send(&self, event: Event) -> Result<(), mpsc::error::SendError<Event>> {
        self.tx.send(event).await
    }

    pub async fn start(&self) -> Result<(), mpsc::error::SendError<Event>> {
        self.send(Event::Start).await
    }

    pub async fn stop(&self) -> Result<(), mpsc::error::SendError<Event>> {
        self.send(Event::Stop).await
    }

    /// Stop, then end the controller loop.
    pub async fn exit(&self) -> Result<(), mpsc::error::SendError<Event>> {
        self.send(Event::Exit).await
    }
}

/// What the front end displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UiSnapshot {
    pub status: DisplayStatus,
    pub connection: ConnectionState,
    pub breath_count: u64,
    pub noise_detected: bool,
    pub error: Option<String>,
    pub session_uid: Option<String>,
    /// A session holds resources; Start would be rejected
    pub active: bool,
    pub stats: Option<SessionStats>,
}

impl Default for UiSnapshot {
    fn default() -> Self {
        let state = State::default();
        Self {
            status: state.display_status(),
            connection: state.connection_state(),
            breath_count: 0,
            noise_detected: false,
            error: None,
            session_uid: None,
            active: false,
            stats: None,
        }
    }
}

/// Resources held by the current session, in acquisition order.
#[derive(Default)]
struct SessionResources {
    params: Option<SessionParameters>,
    capture: Option<Box<dyn CaptureHandle>>,
    transport: Option<SocketTransport>,
}

pub struct StreamSessionController {
    config: ControllerConfig,
    backend: Arc<dyn CaptureBackend>,
    tx: mpsc::Sender<Event>,
    rx: mpsc::Receiver<Event>,
    state: State,
    resources: SessionResources,
    acquired_tx: mpsc::Sender<Acquisition>,
    acquired_rx: mpsc::Receiver<Acquisition>,
    results: ResultsReceiver,
    metrics: MetricsCollector,
    ui_tx: watch::Sender<UiSnapshot>,
    report_tx: watch::Sender<MetricsReport>,
}

impl StreamSessionController {
    pub fn new(
        config: ControllerConfig,
        backend: Arc<dyn CaptureBackend>,
    ) -> (Self, ControllerHandle, watch::Receiver<UiSnapshot>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (ui_tx, ui_rx) = watch::channel(UiSnapshot::default());
        let (report_tx, report_rx) = watch::channel(MetricsReport::default());
        let (acquired_tx, acquired_rx) = mpsc::channel(4);

        let controller = Self {
            config,
            backend,
            tx: tx.clone(),
            rx,
            state: State::default(),
            resources: SessionResources::default(),
            acquired_tx,
            acquired_rx,
            results: ResultsReceiver::new(),
            metrics: MetricsCollector::new(),
            ui_tx,
            report_tx,
        };

        (controller, ControllerHandle { tx, report_rx }, ui_rx)
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Run until `Exit` has been processed.
    pub async fn run(mut self) {
        self.publish_ui();
        log::info!("Session loop started");

        loop {
            let event = tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => event,
                    None => Event::Exit,
                },
                Some(acquisition) = self.acquired_rx.recv() => self.claim_capture(acquisition).await,
                event = next_transport_event(self.resources.transport.as_mut()) => event,
            };

            let exit = matches!(event, Event::Exit);
            self.dispatch(event).await;

            // Handle Exit at the edge, after teardown ran
            if exit {
                log::info!("Exit requested, shutting down session loop");
                break;
            }
        }

        log::info!("Session loop ended");
    }

    /// Reduce one event and run its effects, plus any follow-up events they produce.
    pub async fn dispatch(&mut self, event: Event) {
        let mut queue = VecDeque::from([event]);

        while let Some(event) = queue.pop_front() {
            match &event {
                Event::FrameReady { .. } => log::trace!("Received event: {:?}", event),
                _ => log::debug!("Received event: {:?}", event),
            }
            self.observe(&event);

            let (next, effects) = reduce(&self.state, event);

            if std::mem::discriminant(&self.state) != std::mem::discriminant(&next) {
                log::info!("State transition: {} -> {}", self.state.name(), next.name());
            }
            self.state = next;

            for effect in effects {
                if let Some(follow_up) = self.execute(effect).await {
                    queue.push_back(follow_up);
                }
            }
        }
    }

    /// Record failures of the current session before the reducer sees them.
    fn observe(&mut self, event: &Event) {
        let current = self.state.session_id();
        match event {
            Event::TransportFailed { id, err } if Some(*id) == current => {
                self.metrics.record_error("transport", &err.to_string());
                self.publish_report();
            }
            Event::CaptureLost { id, err } if Some(*id) == current => {
                self.metrics.record_error("capture", &err.to_string());
                self.publish_report();
            }
            Event::TransportClosed { id, reason } if Some(*id) == current => {
                log::info!("Session {}: server closed the connection ({:?})", id, reason);
            }
            _ => {}
        }
    }

    async fn execute(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::AcquireCapture { id } => {
                self.acquire_capture(id);
                None
            }
            Effect::OpenTransport { id } => self.open_transport(id),
            Effect::SendFrame { frame, .. } => {
                self.metrics.frame_captured();
                let encoded = encode(&frame);
                let outcome = match self.resources.transport.as_mut() {
                    Some(transport) => transport.send(&encoded),
                    None => SendOutcome::DiscardedNotOpen,
                };
                match outcome {
                    SendOutcome::Accepted => self.metrics.frame_sent(encoded.len() * 2),
                    SendOutcome::DroppedBackpressure => self.metrics.frame_dropped(),
                    SendOutcome::DiscardedNotOpen => self.metrics.frame_discarded(),
                }
                None
            }
            Effect::DiscardFrame { id } => {
                log::trace!("Session {}: discarding frame outside streaming", id);
                self.metrics.frame_captured();
                self.metrics.frame_discarded();
                None
            }
            Effect::ApplyResults { text, .. } => {
                let decoded = self.results.receive(&text);
                self.metrics.result_received(decoded.is_none());
                None
            }
            Effect::ReleaseTransport { id } => {
                if let Some(transport) = self.resources.transport.take() {
                    log::debug!("Session {}: releasing transport", id);
                    transport.shutdown().await;
                }
                None
            }
            Effect::Teardown { id } => {
                self.release_resources().await;
                Some(Event::TeardownComplete { id })
            }
            Effect::EmitUi => {
                self.publish_ui();
                None
            }
        }
    }

    /// Open the microphone off the loop. The result arrives through
    /// `acquired_rx` and is claimed by `claim_capture`.
    fn acquire_capture(&mut self, id: Uuid) {
        let params = SessionParameters::new(self.config.user_name.clone(), self.config.tuning.clone());
        let block_size = self.config.constraints.block_size;
        if params.tuning().chunk_size as usize != block_size {
            log::warn!(
                "Handshake chunk_size {} differs from capture block size {}",
                params.tuning().chunk_size,
                block_size
            );
        }

        log::info!("Session {}: starting as {}", id, params.uid());
        self.metrics.start_session(id);
        self.metrics.set_session_uid(params.uid());
        self.results.reset();
        self.resources.params = Some(params);

        let on_frame = frame_sender(self.tx.clone(), id, self.metrics.overflow_counter());
        let on_fault = fault_sender(self.tx.clone(), id);
        let backend = self.backend.clone();
        let constraints = self.config.constraints.clone();
        let done_tx = self.acquired_tx.clone();

        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || {
                backend.acquire(&constraints, on_frame, on_fault)
            })
            .await
            .unwrap_or_else(|e| {
                Err(CaptureError::DeviceUnavailable(format!(
                    "Capture setup aborted: {}",
                    e
                )))
            });

            // Controller gone: nobody will release this handle
            if let Err(mpsc::error::SendError(unclaimed)) =
                done_tx.send(Acquisition { id, result }).await
            {
                if let Ok(capture) = unclaimed.result {
                    log::debug!("Session {}: controller gone, releasing capture", id);
                    release_capture(capture).await;
                }
            }
        });
    }

    /// Take ownership of a finished acquisition. A handle for a session that
    /// is no longer acquiring (stopped or replaced) is released right away.
    async fn claim_capture(&mut self, acquisition: Acquisition) -> Event {
        let Acquisition { id, result } = acquisition;
        let current = matches!(self.state, State::Acquiring { session_id } if session_id == id);

        match result {
            Ok(capture) if current => {
                self.resources.capture = Some(capture);
                Event::CaptureAcquired { id }
            }
            Ok(capture) => {
                log::info!("Session {}: capture opened after stop, releasing", id);
                release_capture(capture).await;
                Event::CaptureAcquired { id }
            }
            Err(err) => {
                if current {
                    log::error!("Session {}: capture failed: {}", id, err);
                    self.metrics.record_error("capture", &err.to_string());
                    self.metrics.finish_session();
                    self.resources.params = None;
                    self.publish_report();
                } else {
                    log::debug!("Session {}: late capture failure ignored: {}", id, err);
                }
                Event::CaptureFailed { id, err }
            }
        }
    }

    fn open_transport(&mut self, id: Uuid) -> Option<Event> {
        let handshake = match self.resources.params.as_ref().map(|p| p.to_handshake()) {
            Some(Ok(handshake)) => handshake,
            Some(Err(e)) => {
                return Some(Event::TransportFailed {
                    id,
                    err: TransportError::ProtocolError(format!("Encode handshake: {}", e)),
                })
            }
            None => {
                return Some(Event::TransportFailed {
                    id,
                    err: TransportError::ProtocolError("No session parameters".to_string()),
                })
            }
        };

        match SocketTransport::open(id, &self.config.server_url, handshake) {
            Ok(transport) => {
                self.resources.transport = Some(transport);
                None
            }
            Err(err) => Some(Event::TransportFailed { id, err }),
        }
    }

    /// Release in reverse acquisition order. Safe to call with nothing held.
    async fn release_resources(&mut self) {
        if let Some(capture) = self.resources.capture.take() {
            release_capture(capture).await;
        }
        if let Some(transport) = self.resources.transport.take() {
            transport.shutdown().await;
        }
        self.resources.params = None;
        if self.metrics.finish_session().is_some() {
            self.publish_report();
        }
    }

    fn snapshot(&self) -> UiSnapshot {
        let metrics = self.results.latest();
        UiSnapshot {
            status: self.state.display_status(),
            connection: self.state.connection_state(),
            breath_count: metrics.breath_count,
            noise_detected: metrics.noise_detected,
            error: self.state.error_message().map(str::to_string),
            session_uid: self.resources.params.as_ref().map(|p| p.uid().to_string()),
            active: self.state.is_active(),
            stats: self
                .metrics
                .current_stats()
                .or_else(|| self.metrics.last_summary().map(|s| s.stats)),
        }
    }

    fn publish_report(&self) {
        self.report_tx.send_replace(self.metrics.report());
    }

    fn publish_ui(&self) {
        let snapshot = self.snapshot();
        log::debug!("Emitting UI state: {}", snapshot.status.as_str());
        self.ui_tx.send_replace(snapshot);
    }
}

impl Drop for StreamSessionController {
    fn drop(&mut self) {
        if let Some(mut capture) = self.resources.capture.take() {
            log::warn!("Controller dropped with capture held, releasing");
            capture.release();
        }
        if let Some(mut transport) = self.resources.transport.take() {
            transport.close();
        }
    }
}

/// Release on the blocking pool; joining the audio thread must not stall the loop.
async fn release_capture(mut capture: Box<dyn CaptureHandle>) {
    if let Err(e) = tokio::task::spawn_blocking(move || capture.release()).await {
        log::error!("Capture release task failed: {}", e);
    }
}

/// Wait for the next transport notification. Pending forever without a transport.
async fn next_transport_event(transport: Option<&mut SocketTransport>) -> Event {
    let Some(transport) = transport else {
        return std::future::pending().await;
    };

    let id = transport.session_id();
    match transport.next_event().await {
        Some(TransportEvent::Opened) => Event::TransportOpened { id },
        Some(TransportEvent::Message(text)) => Event::TransportMessage { id, text },
        Some(TransportEvent::Closed(reason)) => Event::TransportClosed { id, reason },
        Some(TransportEvent::Failed(err)) => Event::TransportFailed { id, err },
        None => std::future::pending().await,
    }
}

/// Frame callback for the audio thread. Never blocks; overflow is counted.
fn frame_sender(tx: mpsc::Sender<Event>, id: Uuid, overflow: Arc<AtomicU64>) -> FrameCallback {
    Box::new(move |frame| match tx.try_send(Event::FrameReady { id, frame }) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            overflow.fetch_add(1, Ordering::Relaxed);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    })
}

fn fault_sender(tx: mpsc::Sender<Event>, id: Uuid) -> FaultCallback {
    Box::new(move |err| {
        if tx.try_send(Event::CaptureLost { id, err }).is_err() {
            log::warn!("Session {}: could not report capture fault", id);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FailingBackend {
        attempts: AtomicUsize,
    }

    impl CaptureBackend for FailingBackend {
        fn acquire(
            &self,
            _constraints: &CaptureConstraints,
            _on_frame: FrameCallback,
            _on_fault: FaultCallback,
        ) -> Result<Box<dyn CaptureHandle>, CaptureError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(CaptureError::PermissionDenied("user said no".to_string()))
        }
    }

    struct CountingHandle {
        released: Arc<AtomicUsize>,
    }

    impl CaptureHandle for CountingHandle {
        fn release(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }

        fn is_released(&self) -> bool {
            self.released.load(Ordering::SeqCst) > 0
        }
    }

    struct WorkingBackend {
        released: Arc<AtomicUsize>,
    }

    impl CaptureBackend for WorkingBackend {
        fn acquire(
            &self,
            _constraints: &CaptureConstraints,
            _on_frame: FrameCallback,
            _on_fault: FaultCallback,
        ) -> Result<Box<dyn CaptureHandle>, CaptureError> {
            Ok(Box::new(CountingHandle {
                released: self.released.clone(),
            }))
        }
    }

    async fn settle_acquisition(controller: &mut StreamSessionController) {
        let acquisition = controller.acquired_rx.recv().await.unwrap();
        let event = controller.claim_capture(acquisition).await;
        controller.dispatch(event).await;
    }

    fn config() -> ControllerConfig {
        ControllerConfig::from(&AppSettings::default())
    }

    #[test]
    fn test_config_from_settings() {
        let mut settings = AppSettings::default();
        settings.block_size = 2048;
        settings.input_device = Some("USB Mic".to_string());

        let config = ControllerConfig::from(&settings);
        assert_eq!(config.constraints.block_size, 2048);
        assert_eq!(config.constraints.sample_rate, 16000);
        assert_eq!(config.constraints.device_name.as_deref(), Some("USB Mic"));
        assert_eq!(config.server_url, "ws://kb.optalpha.com:8765");
    }

    #[tokio::test]
    async fn test_capture_failure_never_opens_transport() {
        let backend = Arc::new(FailingBackend {
            attempts: AtomicUsize::new(0),
        });
        let (mut controller, _handle, ui_rx) = StreamSessionController::new(config(), backend.clone());

        controller.dispatch(Event::Start).await;
        assert!(matches!(controller.state(), State::Acquiring { .. }));
        settle_acquisition(&mut controller).await;

        assert!(matches!(controller.state(), State::Idle { failure: Some(_) }));
        assert!(controller.resources.transport.is_none());
        assert!(controller.resources.capture.is_none());
        assert_eq!(backend.attempts.load(Ordering::SeqCst), 1);

        let snapshot = ui_rx.borrow().clone();
        assert_eq!(snapshot.status, DisplayStatus::Error);
        assert!(snapshot.error.unwrap().contains("user said no"));
        assert!(!snapshot.active);
    }

    #[tokio::test]
    async fn test_capture_failure_reaches_report() {
        let backend = Arc::new(FailingBackend {
            attempts: AtomicUsize::new(0),
        });
        let (mut controller, handle, _ui_rx) = StreamSessionController::new(config(), backend);

        controller.dispatch(Event::Start).await;
        settle_acquisition(&mut controller).await;

        let report = handle.metrics_report();
        assert_eq!(report.total_sessions, 1);
        assert_eq!(report.history.len(), 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].error_type, "capture");
    }

    #[tokio::test]
    async fn test_stop_during_acquisition_releases_late_capture() {
        let released = Arc::new(AtomicUsize::new(0));
        let backend = Arc::new(WorkingBackend {
            released: released.clone(),
        });
        let (mut controller, _handle, _ui_rx) = StreamSessionController::new(config(), backend);

        controller.dispatch(Event::Start).await;
        controller.dispatch(Event::Stop).await;
        assert_eq!(controller.state(), &State::Stopped);

        settle_acquisition(&mut controller).await;

        assert_eq!(controller.state(), &State::Stopped);
        assert!(controller.resources.capture.is_none());
        assert!(controller.resources.transport.is_none());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_without_session() {
        let backend = Arc::new(FailingBackend {
            attempts: AtomicUsize::new(0),
        });
        let (mut controller, _handle, ui_rx) = StreamSessionController::new(config(), backend);

        controller.dispatch(Event::Stop).await;
        controller.dispatch(Event::Stop).await;

        assert_eq!(controller.state(), &State::Stopped);
        assert_eq!(ui_rx.borrow().status, DisplayStatus::Stopped);
    }

    #[tokio::test]
    async fn test_frame_sender_counts_overflow() {
        let (tx, _rx) = mpsc::channel(1);
        let overflow = Arc::new(AtomicU64::new(0));
        let mut on_frame = frame_sender(tx, Uuid::new_v4(), overflow.clone());

        on_frame(crate::audio::AudioFrame::new(vec![0.0; 4]));
        on_frame(crate::audio::AudioFrame::new(vec![0.0; 4]));
        on_frame(crate::audio::AudioFrame::new(vec![0.0; 4]));

        assert_eq!(overflow.load(Ordering::SeqCst), 2);
    }
}
