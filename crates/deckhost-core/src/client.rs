//! Connected device types.

use serde::{Deserialize, Serialize};

/// A device or browser known to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    /// Stable identity, kept across reconnects.
    #[serde(rename = "connectionId")]
    pub connection_id: String,

    pub ip: String,

    /// First-seen time in milliseconds since the Unix epoch.
    pub timestamp: i64,

    #[serde(default)]
    pub device_type: Option<String>,

    pub connected: bool,

    /// Identity the device reported in its manifest, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Client {
    /// A new, connected client with no manifest yet.
    pub fn new(connection_id: impl Into<String>, ip: impl Into<String>, timestamp: i64) -> Self {
        Self {
            connection_id: connection_id.into(),
            ip: ip.into(),
            timestamp,
            device_type: None,
            connected: true,
            uuid: None,
            client_name: None,
            version: None,
            description: None,
        }
    }

    /// Overwrite display metadata from a manifest.
    pub fn apply_manifest(&mut self, manifest: &ClientManifest) {
        if manifest.client_name.is_some() {
            self.client_name = manifest.client_name.clone();
        }
        if manifest.version.is_some() {
            self.version = manifest.version.clone();
        }
        if manifest.description.is_some() {
            self.description = manifest.description.clone();
        }
        if manifest.device_type.is_some() {
            self.device_type = manifest.device_type.clone();
        }
    }
}

/// Identity payload a client sends in a `manifest` message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientManifest {
    #[serde(default)]
    pub uuid: Option<String>,

    #[serde(default, alias = "name")]
    pub client_name: Option<String>,

    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub device_type: Option<String>,
}
