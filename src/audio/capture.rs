//! Microphone capture using CPAL
//!
//! `AudioCaptureEngine` opens the input device on a dedicated audio thread
//! (CPAL streams are not `Send` on every host) and runs a small processing
//! graph inside the CPAL callback: sample-format conversion → down-mix →
//! decimation → fixed-size blocks. Completed blocks are handed to the frame
//! callback on the audio thread's schedule.
//!
//! # Release order
//!
//! ```text
//! processing graph ──▶ capture source ──▶ hardware context ──▶ media tracks
//!   (stop forwarding)    (pause stream)     (drop stream)        (drop device)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BufferSize, Device, FromSample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
    SupportedBufferSize, SupportedStreamConfig, SupportedStreamConfigRange,
};

use super::convert::{downmix_to_mono, Decimator};
use super::frame::{AudioFrame, BlockAssembler};

/// Highest decimation factor the processing graph will apply.
const MAX_DECIMATION: u32 = 6;

/// Errors that can occur while acquiring or running the microphone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    PermissionDenied(String),
    DeviceUnavailable(String),
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::PermissionDenied(e) => write!(f, "Microphone access denied: {}", e),
            CaptureError::DeviceUnavailable(e) => write!(f, "Microphone unavailable: {}", e),
        }
    }
}

impl std::error::Error for CaptureError {}

/// What the remote analysis expects from the microphone.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConstraints {
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per emitted frame
    pub block_size: usize,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    /// Input device name; `None` selects the host default
    pub device_name: Option<String>,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            block_size: 4096,
            echo_cancellation: false,
            noise_suppression: false,
            device_name: None,
        }
    }
}

/// Invoked once per completed block, on the audio thread.
pub type FrameCallback = Box<dyn FnMut(AudioFrame) + Send + 'static>;

/// Invoked when the running stream fails (device unplugged, revoked access).
pub type FaultCallback = Box<dyn FnMut(CaptureError) + Send + 'static>;

/// Live capture resources owned by a session.
pub trait CaptureHandle: Send {
    /// Tear down the capture graph. Calls after the first are no-ops.
    fn release(&mut self);

    fn is_released(&self) -> bool;
}

/// Opens capture sessions.
/// A failed `acquire` must not leave any device handle open.
pub trait CaptureBackend: Send + Sync + 'static {
    fn acquire(
        &self,
        constraints: &CaptureConstraints,
        on_frame: FrameCallback,
        on_fault: FaultCallback,
    ) -> Result<Box<dyn CaptureHandle>, CaptureError>;
}

/// Summary of an input device for `--list-devices`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputDeviceInfo {
    pub name: String,
    pub is_default: bool,
}

/// List the input devices of the default host.
pub fn list_input_devices() -> Result<Vec<InputDeviceInfo>, CaptureError> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let devices = host
        .input_devices()
        .map_err(|e| classify_error(e.to_string()))?;

    Ok(devices
        .map(|device| {
            let name = device.name().unwrap_or_else(|_| "Unknown Device".to_string());
            let is_default = default_name.as_deref() == Some(name.as_str());
            InputDeviceInfo { name, is_default }
        })
        .collect())
}

/// Commands sent from the handle to the audio thread.
enum AudioCommand {
    Release,
}

/// Microphone capture backed by the default CPAL host.
#[derive(Debug, Default, Clone, Copy)]
pub struct AudioCaptureEngine;

impl AudioCaptureEngine {
    pub fn new() -> Self {
        Self
    }
}

impl CaptureBackend for AudioCaptureEngine {
    fn acquire(
        &self,
        constraints: &CaptureConstraints,
        on_frame: FrameCallback,
        on_fault: FaultCallback,
    ) -> Result<Box<dyn CaptureHandle>, CaptureError> {
        if constraints.echo_cancellation || constraints.noise_suppression {
            log::warn!("Capture: CPAL delivers the raw signal, echo cancellation/noise suppression requests are ignored");
        }

        let graph_connected = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), CaptureError>>(1);
        let (control_tx, control_rx) = std_mpsc::channel::<AudioCommand>();

        let thread = std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn({
                let constraints = constraints.clone();
                let graph_connected = graph_connected.clone();
                move || {
                    run_audio_thread(
                        constraints,
                        on_frame,
                        on_fault,
                        graph_connected,
                        ready_tx,
                        control_rx,
                    )
                }
            })
            .map_err(|e| {
                CaptureError::DeviceUnavailable(format!("Failed to spawn audio thread: {}", e))
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(CpalCapture {
                graph_connected,
                control_tx: Some(control_tx),
                thread: Some(thread),
                released: false,
            })),
            Ok(Err(e)) => {
                // The thread has already dropped whatever it opened
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(CaptureError::DeviceUnavailable(
                    "Audio thread exited during setup".to_string(),
                ))
            }
        }
    }
}

/// Handle to a running CPAL capture.
/// Dropping it releases the capture.
pub struct CpalCapture {
    graph_connected: Arc<AtomicBool>,
    control_tx: Option<std_mpsc::Sender<AudioCommand>>,
    thread: Option<JoinHandle<()>>,
    released: bool,
}

impl CaptureHandle for CpalCapture {
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        self.graph_connected.store(false, Ordering::SeqCst);
        log::debug!("Capture: processing graph disconnected");

        if let Some(tx) = self.control_tx.take() {
            let _ = tx.send(AudioCommand::Release);
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Capture: audio thread panicked during release");
            }
        }

        log::info!("Capture: released");
    }

    fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.release();
    }
}

fn run_audio_thread(
    constraints: CaptureConstraints,
    on_frame: FrameCallback,
    on_fault: FaultCallback,
    graph_connected: Arc<AtomicBool>,
    ready_tx: std_mpsc::SyncSender<Result<(), CaptureError>>,
    control_rx: std_mpsc::Receiver<AudioCommand>,
) {
    let (device, stream) = match open_input(&constraints, on_frame, on_fault, graph_connected) {
        Ok(opened) => opened,
        Err(e) => {
            log::error!("Capture: failed to open input: {}", e);
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        log::error!("Capture: failed to start stream: {}", e);
        let _ = ready_tx.send(Err(classify_error(format!(
            "Failed to start stream: {}",
            e
        ))));
        return;
    }

    log::info!("Capture: stream started");
    let _ = ready_tx.send(Ok(()));

    // Park until released; a dropped sender also counts as release
    let _ = control_rx.recv();

    if let Err(e) = stream.pause() {
        log::warn!("Capture: failed to pause input stream: {}", e);
    }
    log::debug!("Capture: capture source stopped");

    drop(stream);
    log::debug!("Capture: hardware context closed");

    drop(device);
    log::debug!("Capture: media tracks released");
}

fn open_input(
    constraints: &CaptureConstraints,
    on_frame: FrameCallback,
    on_fault: FaultCallback,
    graph_connected: Arc<AtomicBool>,
) -> Result<(Device, Stream), CaptureError> {
    let host = cpal::default_host();
    let device = select_device(&host, constraints.device_name.as_deref())?;
    log::info!("Capture: using input device {:?}", device.name());

    let supported = negotiate_config(&device, constraints)?;
    let sample_format = supported.sample_format();
    let config = stream_config(&supported, constraints.block_size);

    log::info!(
        "Capture: device config {} Hz, {} channel(s), {:?}, buffer {:?} → {} Hz mono, {} sample blocks",
        config.sample_rate.0,
        config.channels,
        sample_format,
        config.buffer_size,
        constraints.sample_rate,
        constraints.block_size
    );

    let graph = ProcessingGraph::new(
        config.channels,
        config.sample_rate.0,
        constraints.sample_rate,
        constraints.block_size,
        on_frame,
        graph_connected.clone(),
    )?;

    let stream = match sample_format {
        SampleFormat::I16 => {
            build_stream::<i16>(&device, &config, graph, on_fault, graph_connected)
        }
        SampleFormat::U16 => {
            build_stream::<u16>(&device, &config, graph, on_fault, graph_connected)
        }
        SampleFormat::F32 => {
            build_stream::<f32>(&device, &config, graph, on_fault, graph_connected)
        }
        other => Err(CaptureError::DeviceUnavailable(format!(
            "Unsupported sample format {:?}",
            other
        ))),
    }?;

    Ok((device, stream))
}

fn select_device(host: &cpal::Host, name: Option<&str>) -> Result<Device, CaptureError> {
    match name {
        None => host.default_input_device().ok_or_else(|| {
            CaptureError::DeviceUnavailable("No audio input device found".to_string())
        }),
        Some(wanted) => host
            .input_devices()
            .map_err(|e| classify_error(e.to_string()))?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| {
                CaptureError::DeviceUnavailable(format!("Input device {:?} not found", wanted))
            }),
    }
}

fn is_supported_format(format: SampleFormat) -> bool {
    matches!(
        format,
        SampleFormat::I16 | SampleFormat::U16 | SampleFormat::F32
    )
}

fn format_rank(format: SampleFormat) -> u8 {
    match format {
        SampleFormat::F32 => 0,
        SampleFormat::I16 => 1,
        _ => 2,
    }
}

/// Pick a device configuration at the target rate, or failing that at an
/// integer multiple of it that the graph can decimate.
fn negotiate_config(
    device: &Device,
    constraints: &CaptureConstraints,
) -> Result<SupportedStreamConfig, CaptureError> {
    let ranges: Vec<SupportedStreamConfigRange> = match device.supported_input_configs() {
        Ok(configs) => configs
            .filter(|r| is_supported_format(r.sample_format()))
            .collect(),
        Err(e) => {
            log::warn!("Capture: could not enumerate input configs: {}", e);
            Vec::new()
        }
    };

    if let Some(chosen) = choose_config(&ranges, constraints) {
        return Ok(chosen);
    }

    // Some hosts cannot enumerate; the default config may still be usable
    let default = device
        .default_input_config()
        .map_err(|e| classify_error(e.to_string()))?;
    let rate = default.sample_rate().0;
    if is_supported_format(default.sample_format())
        && decimation_factor(rate, constraints.sample_rate).is_some()
    {
        return Ok(default);
    }

    Err(CaptureError::DeviceUnavailable(format!(
        "Input device cannot capture at {} Hz (default {} Hz)",
        constraints.sample_rate, rate
    )))
}

fn choose_config(
    ranges: &[SupportedStreamConfigRange],
    constraints: &CaptureConstraints,
) -> Option<SupportedStreamConfig> {
    let target = constraints.sample_rate;
    let covers = |r: &SupportedStreamConfigRange, rate: u32| {
        r.min_sample_rate().0 <= rate && rate <= r.max_sample_rate().0
    };
    let preference = |r: &&SupportedStreamConfigRange| {
        (
            r.channels() != constraints.channels,
            r.channels(),
            format_rank(r.sample_format()),
        )
    };

    if let Some(exact) = ranges.iter().filter(|r| covers(*r, target)).min_by_key(preference) {
        return Some(exact.clone().with_sample_rate(SampleRate(target)));
    }

    (2..=MAX_DECIMATION).find_map(|factor| {
        let rate = target * factor;
        ranges
            .iter()
            .filter(|r| covers(*r, rate))
            .min_by_key(preference)
            .map(|r| r.clone().with_sample_rate(SampleRate(rate)))
    })
}

fn decimation_factor(source_rate: u32, target_rate: u32) -> Option<u32> {
    if target_rate == 0 || source_rate % target_rate != 0 {
        return None;
    }
    let factor = source_rate / target_rate;
    (1..=MAX_DECIMATION).contains(&factor).then_some(factor)
}

/// Request the block size as the hardware buffer when the device allows it.
fn stream_config(supported: &SupportedStreamConfig, block_size: usize) -> StreamConfig {
    let mut config = supported.config();
    let frames = block_size as u32;
    config.buffer_size = match supported.buffer_size() {
        SupportedBufferSize::Range { min, max } if (*min..=*max).contains(&frames) => {
            BufferSize::Fixed(frames)
        }
        _ => BufferSize::Default,
    };
    config
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut graph: ProcessingGraph,
    mut on_fault: FaultCallback,
    graph_connected: Arc<AtomicBool>,
) -> Result<Stream, CaptureError>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| graph.process(data),
            move |err: cpal::StreamError| {
                log::error!("Capture: audio stream error: {}", err);
                if graph_connected.load(Ordering::SeqCst) {
                    on_fault(classify_error(err.to_string()));
                }
            },
            None,
        )
        .map_err(|e| classify_error(e.to_string()))
}

/// Map backend error text onto the two user-facing failure kinds.
fn classify_error(message: String) -> CaptureError {
    let lower = message.to_lowercase();
    let denied = ["permission", "denied", "not permitted", "not authorized", "unauthorized"]
        .iter()
        .any(|needle| lower.contains(needle));

    if denied {
        CaptureError::PermissionDenied(message)
    } else {
        CaptureError::DeviceUnavailable(message)
    }
}

/// Runs inside the CPAL data callback.
struct ProcessingGraph {
    channels: u16,
    decimator: Decimator,
    assembler: BlockAssembler,
    on_frame: FrameCallback,
    connected: Arc<AtomicBool>,
    scratch: Vec<f32>,
}

impl ProcessingGraph {
    fn new(
        channels: u16,
        source_rate: u32,
        target_rate: u32,
        block_size: usize,
        on_frame: FrameCallback,
        connected: Arc<AtomicBool>,
    ) -> Result<Self, CaptureError> {
        let decimator = Decimator::new(source_rate, target_rate).ok_or_else(|| {
            CaptureError::DeviceUnavailable(format!(
                "Cannot convert {} Hz input to {} Hz",
                source_rate, target_rate
            ))
        })?;

        Ok(Self {
            channels,
            decimator,
            assembler: BlockAssembler::new(block_size),
            on_frame,
            connected,
            scratch: Vec::with_capacity(block_size * channels.max(1) as usize),
        })
    }

    fn process<T>(&mut self, data: &[T])
    where
        T: Copy,
        f32: FromSample<T>,
    {
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }

        self.scratch.clear();
        self.scratch
            .extend(data.iter().map(|&s| <f32 as FromSample<T>>::from_sample_(s)));

        let mono = downmix_to_mono(&self.scratch, self.channels);
        let resampled = self.decimator.process(&mono);

        let on_frame = &mut self.on_frame;
        self.assembler.push(&resampled, |frame| on_frame(frame));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collecting_graph(
        channels: u16,
        source_rate: u32,
        block_size: usize,
    ) -> (ProcessingGraph, Arc<Mutex<Vec<AudioFrame>>>, Arc<AtomicBool>) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();
        let connected = Arc::new(AtomicBool::new(true));
        let graph = ProcessingGraph::new(
            channels,
            source_rate,
            16000,
            block_size,
            Box::new(move |frame| sink.lock().unwrap().push(frame)),
            connected.clone(),
        )
        .unwrap();
        (graph, frames, connected)
    }

    #[test]
    fn test_default_constraints() {
        let c = CaptureConstraints::default();
        assert_eq!(c.sample_rate, 16000);
        assert_eq!(c.channels, 1);
        assert_eq!(c.block_size, 4096);
        assert!(!c.echo_cancellation);
        assert!(!c.noise_suppression);
    }

    #[test]
    fn test_classify_error() {
        assert!(matches!(
            classify_error("Permission denied (os error 13)".to_string()),
            CaptureError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_error("The requested device is no longer available".to_string()),
            CaptureError::DeviceUnavailable(_)
        ));
    }

    #[test]
    fn test_decimation_factor() {
        assert_eq!(decimation_factor(16000, 16000), Some(1));
        assert_eq!(decimation_factor(48000, 16000), Some(3));
        assert_eq!(decimation_factor(44100, 16000), None);
        assert_eq!(decimation_factor(192000, 16000), None);
        assert_eq!(decimation_factor(48000, 0), None);
    }

    #[test]
    fn graph_converts_i16_stereo_48k_into_mono_blocks() {
        let (mut graph, frames, _) = collecting_graph(2, 48000, 4);

        // 12 stereo frames at 48kHz → 4 mono samples at 16kHz
        let data: Vec<i16> = std::iter::repeat([i16::MAX, i16::MAX]).take(12).flatten().collect();
        graph.process(&data);

        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 4);
        assert!(frames[0].samples().iter().all(|&s| (s - 1.0).abs() < 1e-3));
    }

    #[test]
    fn graph_keeps_16k_across_odd_callback_sizes() {
        let (mut graph, frames, _) = collecting_graph(1, 48000, 1000);

        // 1024 is not a multiple of 3; leftovers must carry over
        let callbacks = 141;
        for _ in 0..callbacks {
            graph.process(&vec![0.25f32; 1024]);
        }

        let produced = frames.lock().unwrap().len() * 1000 + graph.assembler.pending_len();
        assert_eq!(produced, callbacks * 1024 / 3);
    }

    #[test]
    fn graph_rejects_non_integer_ratio() {
        let result = ProcessingGraph::new(
            1,
            44100,
            16000,
            4096,
            Box::new(|_| {}),
            Arc::new(AtomicBool::new(true)),
        );
        assert!(matches!(result, Err(CaptureError::DeviceUnavailable(_))));
    }

    #[test]
    fn disconnected_graph_forwards_nothing() {
        let (mut graph, frames, connected) = collecting_graph(1, 16000, 2);

        graph.process(&[0.5f32, 0.5]);
        connected.store(false, Ordering::SeqCst);
        graph.process(&[0.5f32, 0.5, 0.5, 0.5]);

        assert_eq!(frames.lock().unwrap().len(), 1);
    }

    #[test]
    #[ignore] // Requires a microphone
    fn test_acquire_and_release_default_device() {
        let engine = AudioCaptureEngine::new();
        let mut handle = engine
            .acquire(
                &CaptureConstraints::default(),
                Box::new(|_| {}),
                Box::new(|_| {}),
            )
            .expect("acquire failed");
        assert!(!handle.is_released());
        handle.release();
        handle.release();
        assert!(handle.is_released());
    }
}
