pub mod audio;
pub mod console;
pub mod controller;
pub mod metrics;
pub mod settings;
pub mod state_machine;
pub mod streaming;

use std::sync::Arc;

use audio::{AudioCaptureEngine, CaptureBackend};
use controller::{ControllerConfig, StreamSessionController};
use settings::AppSettings;

pub struct RunOptions {
    pub settings: AppSettings,
    /// Send Start as soon as the loop is up
    pub autostart: bool,
    /// Print snapshots as JSON lines
    pub json: bool,
}

/// Run the console front end against the microphone.
pub async fn run(options: RunOptions) -> Result<(), Box<dyn std::error::Error>> {
    run_with_backend(options, Arc::new(AudioCaptureEngine::new())).await
}

pub async fn run_with_backend(
    options: RunOptions,
    backend: Arc<dyn CaptureBackend>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = ControllerConfig::from(&options.settings);
    let (controller, handle, ui_rx) = StreamSessionController::new(config, backend);

    let controller_task = tokio::spawn(controller.run());
    log::info!("Session controller started");

    if options.autostart {
        handle.start().await?;
    }

    console::run_console(handle.clone(), ui_rx, options.json).await;

    // Unmount: stop whatever is running, then leave the loop
    if handle.exit().await.is_err() {
        log::debug!("Session controller already stopped");
    }
    controller_task.await?;

    log::info!("Shutdown complete");
    Ok(())
}
