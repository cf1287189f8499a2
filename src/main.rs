use std::path::PathBuf;

use breath_stream::audio::list_input_devices;
use breath_stream::settings::{default_settings_path, load_settings, save_settings};
use breath_stream::RunOptions;
use clap::Parser;

/// Stream microphone audio to a breath analysis server and show the results
#[derive(Parser, Debug)]
#[command(name = "breath-stream", version, about)]
struct Cli {
    /// WebSocket URL of the analysis server (e.g. ws://host:8765)
    #[arg(long)]
    server: Option<String>,

    /// User name sent in the handshake
    #[arg(long)]
    user: Option<String>,

    /// Input device name (see --list-devices)
    #[arg(long)]
    device: Option<String>,

    /// Settings file (default: <config dir>/breath-stream/settings.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// List input devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Start streaming immediately
    #[arg(long)]
    autostart: bool,

    /// Print status updates as JSON lines
    #[arg(long)]
    json: bool,

    /// Persist the effective settings (including overrides) before running
    #[arg(long)]
    save_settings: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    if cli.list_devices {
        for device in list_input_devices()? {
            let marker = if device.is_default { " (default)" } else { "" };
            println!("{}{}", device.name, marker);
        }
        return Ok(());
    }

    // Both rustls providers may be compiled in; pick one for wss://
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        log::debug!("rustls crypto provider already installed");
    }

    let settings_path = match cli.config {
        Some(path) => path,
        None => default_settings_path()?,
    };
    let mut settings = load_settings(&settings_path);
    settings.apply_env_overrides();
    settings.apply_overrides(cli.server, cli.user);
    if let Some(device) = cli.device {
        settings.input_device = Some(device);
    }

    if cli.save_settings {
        save_settings(&settings_path, &settings)?;
    }

    log::info!(
        "breath-stream v{} - server {}, user {}",
        env!("CARGO_PKG_VERSION"),
        settings.server_url,
        settings.user_name
    );

    breath_stream::run(RunOptions {
        settings,
        autostart: cli.autostart,
        json: cli.json,
    })
    .await
}
