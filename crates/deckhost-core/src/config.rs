//! Host settings.
//!
//! Settings live in `settings.toml` under the platform config directory:
//!
//! ```text
//! ~/.config/deckhost/
//! └── settings.toml     # created with defaults if missing
//! ```
//!
//! Runtime state (store documents and installed apps) lives under
//! `data_dir`, which defaults to the platform data directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// What `send_to_one` does when the target client is not connected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingTargetPolicy {
    /// Deliver to every connected client instead.
    #[default]
    Broadcast,
    /// Drop the message.
    Drop,
}

/// Runtime settings for the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    pub address: String,
    pub port: u16,

    /// Root for store documents and installed apps.
    pub data_dir: PathBuf,

    /// Window during which duplicate app messages are dropped.
    pub throttle_window_ms: u64,

    /// How often stale throttle entries are swept.
    pub throttle_sweep_ms: u64,

    /// Upper bound on a single app hook call.
    pub hook_timeout_ms: u64,

    pub missing_target_policy: MissingTargetPolicy,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 8891,
            data_dir: default_data_dir(),
            throttle_window_ms: 100,
            throttle_sweep_ms: 1000,
            hook_timeout_ms: 5000,
            missing_target_policy: MissingTargetPolicy::Broadcast,
        }
    }
}

impl HostSettings {
    /// Settings rooted at `data_dir`, everything else default.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Load settings from `path`, writing defaults if the file is missing.
    ///
    /// A malformed file is an error rather than a silent reset.
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let settings = Self::default();
            settings.save(path)?;
            tracing::info!("Wrote default settings to {:?}", path);
            return Ok(settings);
        }

        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Write settings to `path`.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |e: std::io::Error| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        std::fs::write(path, text).map_err(io_err)
    }

    /// `host:port` for the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Root of the JSON store.
    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }

    /// Directory holding one subdirectory per installed app.
    pub fn apps_dir(&self) -> PathBuf {
        self.data_dir.join("apps")
    }

    pub fn throttle_window(&self) -> Duration {
        Duration::from_millis(self.throttle_window_ms)
    }

    pub fn throttle_sweep(&self) -> Duration {
        Duration::from_millis(self.throttle_sweep_ms.max(1))
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_millis(self.hook_timeout_ms)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join("deckhost"))
        .unwrap_or_else(|| PathBuf::from(".deckhost"))
}

/// Get the config directory path.
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("deckhost"))
}

/// Get the path to settings.toml.
pub fn settings_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("settings.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = HostSettings::with_data_dir("/tmp/dh");
        assert_eq!(settings.port, 8891);
        assert_eq!(settings.throttle_window(), Duration::from_millis(100));
        assert_eq!(settings.missing_target_policy, MissingTargetPolicy::Broadcast);
        assert_eq!(settings.store_dir(), PathBuf::from("/tmp/dh/store"));
        assert_eq!(settings.apps_dir(), PathBuf::from("/tmp/dh/apps"));
    }

    #[test]
    fn test_load_or_init_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.toml");

        let settings = HostSettings::load_or_init(&path).unwrap();
        assert!(path.exists());
        assert_eq!(settings, HostSettings::load_or_init(&path).unwrap());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "port = 9000\nmissing_target_policy = \"drop\"\n").unwrap();

        let settings = HostSettings::load_or_init(&path).unwrap();
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.missing_target_policy, MissingTargetPolicy::Drop);
        assert_eq!(settings.throttle_window_ms, 100);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "port = \"not a number\"").unwrap();

        assert!(matches!(
            HostSettings::load_or_init(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
