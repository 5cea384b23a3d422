//! Installed app types.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Entry script used when a manifest does not name one.
pub const DEFAULT_ENTRYPOINT: &str = "main.lua";

/// Manifest shipped inside every app package as `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppManifest {
    pub id: String,
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Capability flags, e.g. `audiosource` or `screensaver`.
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Permissions the app asks the host for.
    #[serde(default)]
    pub permissions: Vec<String>,

    /// Lua entry script, relative to the app directory.
    #[serde(default = "default_entrypoint")]
    pub entrypoint: String,
}

fn default_entrypoint() -> String {
    DEFAULT_ENTRYPOINT.to_string()
}

impl AppManifest {
    /// Create a minimal manifest.
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            label: None,
            description: None,
            capabilities: Vec::new(),
            permissions: Vec::new(),
            entrypoint: default_entrypoint(),
        }
    }

    /// The id doubles as a directory name and a store key segment, so it has
    /// to be a single safe path component.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::new("manifest id is empty"));
        }
        if self.id == "server" {
            return Err(ValidationError::new("manifest id 'server' is reserved"));
        }
        if self.id.starts_with('.')
            || !self
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(ValidationError::new(format!(
                "manifest id '{}' is not a valid app name",
                self.id
            )));
        }
        if self.entrypoint.is_empty() || self.entrypoint.contains("..") {
            return Err(ValidationError::new(format!(
                "manifest entrypoint '{}' is invalid",
                self.entrypoint
            )));
        }
        Ok(())
    }
}

/// Registry entry for an installed app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDescriptor {
    pub name: String,
    pub manifest: AppManifest,
    pub enabled: bool,
    pub running: bool,

    /// Display hint, kept equal to the app's position in the registry order.
    #[serde(rename = "prefIndex")]
    pub pref_index: usize,

    /// Developer apps live outside the managed apps directory.
    #[serde(default)]
    pub developer: bool,

    /// Directory holding the app's code.
    pub path: PathBuf,
}

impl AppDescriptor {
    /// A freshly installed app: disabled and not running.
    pub fn installed(manifest: AppManifest, path: PathBuf) -> Self {
        Self {
            name: manifest.id.clone(),
            manifest,
            enabled: false,
            running: false,
            pref_index: 0,
            developer: false,
            path,
        }
    }

    /// Path of the entry script.
    pub fn entrypoint(&self) -> PathBuf {
        self.path.join(&self.manifest.entrypoint)
    }
}
