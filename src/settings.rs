use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::streaming::{AnalysisTuning, DEFAULT_SERVER_URL};

const SETTINGS_DIR_NAME: &str = "breath-stream";
const SETTINGS_FILE_NAME: &str = "settings.json";

/// Environment override for `server_url`
pub const SERVER_URL_ENV: &str = "BREATH_STREAM_SERVER_URL";
/// Environment override for `user_name`
pub const USER_NAME_ENV: &str = "BREATH_STREAM_USER";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// WebSocket endpoint of the breath analysis service.
    pub server_url: String,

    /// Display name sent in the handshake.
    pub user_name: String,

    /// Input device name. `None` uses the system default microphone.
    pub input_device: Option<String>,

    /// Samples per outbound frame.
    pub block_size: usize,

    /// Constants forwarded to the analysis service in the handshake.
    pub analysis: AnalysisTuning,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            user_name: "Guest".to_string(),
            input_device: None,
            block_size: 4096,
            analysis: AnalysisTuning::default(),
        }
    }
}

impl AppSettings {
    /// Apply command line / environment overrides. Empty values are ignored.
    pub fn apply_overrides(&mut self, server_url: Option<String>, user_name: Option<String>) {
        if let Some(url) = server_url.filter(|u| !u.trim().is_empty()) {
            self.server_url = url;
        }
        if let Some(name) = user_name.filter(|n| !n.trim().is_empty()) {
            self.user_name = name;
        }
    }

    /// Apply `BREATH_STREAM_SERVER_URL` / `BREATH_STREAM_USER`.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(
            std::env::var(SERVER_URL_ENV).ok(),
            std::env::var(USER_NAME_ENV).ok(),
        );
    }
}

#[derive(Debug)]
pub enum SettingsError {
    /// No config directory on this platform
    NoConfigDir,
    Io(String),
    Serialize(String),
}

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingsError::NoConfigDir => write!(f, "Could not determine config directory"),
            SettingsError::Io(e) => write!(f, "Settings I/O error: {}", e),
            SettingsError::Serialize(e) => write!(f, "Serialize settings: {}", e),
        }
    }
}

impl std::error::Error for SettingsError {}

/// `<config dir>/breath-stream/settings.json`
pub fn default_settings_path() -> Result<PathBuf, SettingsError> {
    let dir = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
    Ok(dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Load settings, falling back to defaults when the file is missing or unreadable.
pub fn load_settings(path: &Path) -> AppSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AppSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AppSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            SettingsError::Io(format!("Failed to create config directory {:?}: {}", parent, e))
        })?;
    }

    let contents = serde_json::to_string_pretty(settings)
        .map_err(|e| SettingsError::Serialize(e.to_string()))?;

    // Write to a temp file in the same directory, then rename over the target.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| SettingsError::Io(format!("Write temp settings {:?}: {}", tmp_path, e)))?;

    // Windows rename fails if the destination exists
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(SettingsError::Io(format!(
                    "Remove existing settings file {:?}: {}",
                    path, e
                )));
            }
        }
    }

    std::fs::rename(&tmp_path, path).map_err(|e| {
        SettingsError::Io(format!(
            "Rename temp settings {:?} to {:?}: {}",
            tmp_path, path, e
        ))
    })?;

    log::info!("Settings: saved to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(&dir.path().join("settings.json"));
        assert_eq!(settings, AppSettings::default());
        assert_eq!(settings.server_url, "ws://kb.optalpha.com:8765");
    }

    #[test]
    fn test_corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_settings(&path), AppSettings::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"user_name": "Asha", "analysis": {"n1": 12}}"#).unwrap();

        let settings = load_settings(&path);
        assert_eq!(settings.user_name, "Asha");
        assert_eq!(settings.analysis.n1, 12);
        assert_eq!(settings.analysis.n2, 30);
        assert_eq!(settings.block_size, 4096);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut settings = AppSettings::default();
        settings.server_url = "ws://localhost:9000".to_string();
        settings.input_device = Some("USB Mic".to_string());
        save_settings(&path, &settings).unwrap();

        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(load_settings(&path), settings);
    }

    #[test]
    fn test_overrides_ignore_empty_values() {
        let mut settings = AppSettings::default();
        settings.apply_overrides(Some("ws://10.0.0.2:8765".to_string()), Some("  ".to_string()));
        assert_eq!(settings.server_url, "ws://10.0.0.2:8765");
        assert_eq!(settings.user_name, "Guest");
    }
}
