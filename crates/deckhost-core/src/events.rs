//! Event system for deckhost.
//!
//! Uses an enum-based event bus with `tokio::sync::broadcast` for
//! simple pub/sub between the registry, the mapping engine and the router.

use serde_json::Value;
use tokio::sync::broadcast;

/// All events in the host.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    /// An app was installed, removed, reordered or changed state.
    RegistryChanged,
    /// Profiles, catalogs or the selected profile changed.
    MappingChanged,
    /// A client connected.
    ClientConnected { client_id: String },
    /// A client went away.
    ClientDisconnected { client_id: String },
    /// Human-readable message from a client.
    Announcement { from: String, payload: Value },
}

impl HostEvent {
    /// Name under which apps can subscribe to this event, if they can.
    pub fn system_name(&self) -> Option<&'static str> {
        match self {
            HostEvent::ClientConnected { .. } => Some("client_connected"),
            HostEvent::ClientDisconnected { .. } => Some("client_disconnected"),
            HostEvent::MappingChanged => Some("mapping_changed"),
            HostEvent::RegistryChanged | HostEvent::Announcement { .. } => None,
        }
    }

    /// Payload handed to app subscribers.
    pub fn system_payload(&self) -> Value {
        match self {
            HostEvent::ClientConnected { client_id }
            | HostEvent::ClientDisconnected { client_id } => {
                serde_json::json!({ "clientId": client_id })
            }
            _ => Value::Null,
        }
    }
}

/// Simple event bus using tokio broadcast channels.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<HostEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers. No subscribers is fine.
    pub fn publish(&self, event: HostEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
