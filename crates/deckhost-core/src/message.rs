//! Wire message format shared by clients, the router and apps.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved `app` value for host-level traffic.
pub const SERVER_APP: &str = "server";

/// `{app, type, request?, payload?}` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub app: String,

    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,

    /// Target client for app-originated messages.
    #[serde(
        default,
        rename = "clientId",
        skip_serializing_if = "Option::is_none"
    )]
    pub client_id: Option<String>,
}

impl Message {
    pub fn new(app: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            kind: kind.into(),
            request: None,
            payload: Value::Null,
            client_id: None,
        }
    }

    pub fn with_request(mut self, request: impl Into<String>) -> Self {
        self.request = Some(request.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Parse a raw frame.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn is_server(&self) -> bool {
        self.app == SERVER_APP
    }

    /// `app|type|request`, the unit of throttling.
    pub fn throttle_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.app,
            self.kind,
            self.request.as_deref().unwrap_or("")
        )
    }
}
