//! Message routing between clients, apps and the host.
//!
//! Inbound pipeline for one frame:
//!
//! 1. Parse. Unparseable frames are logged and dropped.
//! 2. `app == "server"`: decode a [`ServerCommand`] and handle it here.
//! 3. Any other app: drop duplicates inside the throttle window, then queue
//!    the message for the app's `receive` hook.
//!
//! Routing failures never reach the sending client; they are logged at
//! `debug` (throttled) or `warn` (everything else).
//!
//! Each app has its own delivery lane: messages to one app arrive in order,
//! and a hook that hangs only delays its own app. The transport never waits
//! on app code. A lane task exits once its queue is empty.
//!
//! Connections are keyed by their socket address, which never changes for
//! the life of a transport. Each one is bound to a client id, which can
//! change when a manifest reclaims a stored identity.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use deckhost_core::{
    Action, Client, ClientManifest, EventBus, EventMode, HostEvent, Message, MissingTargetPolicy,
    RoutingError, SERVER_SOURCE,
};
use deckhost_mappings::ButtonMappingEngine;
use deckhost_plugin_api::{AppOutbound, OutboundReceiver, PluginRegistry};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::clients::ClientTable;
use crate::throttle::Throttle;

/// `app` used for host-to-client traffic.
pub const CLIENT_APP: &str = "client";

/// Frames queued for one transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Text(String),
    /// Close the transport.
    Close,
}

pub type OutgoingSender = mpsc::UnboundedSender<Outgoing>;
pub type OutgoingReceiver = mpsc::UnboundedReceiver<Outgoing>;

struct Connection {
    client_id: String,
    tx: OutgoingSender,
}

struct Lane {
    id: u64,
    tx: mpsc::UnboundedSender<Message>,
}

type Lanes = Arc<Mutex<HashMap<String, Lane>>>;

// =============================================================================
// Server commands
// =============================================================================

#[derive(Debug, Deserialize)]
struct OrderPayload {
    app: String,
    index: i64,
}

#[derive(Debug, Deserialize)]
struct InputPayload {
    key: String,
    mode: EventMode,
}

/// Everything a client can ask of the `server` namespace.
#[derive(Debug)]
enum ServerCommand {
    /// Resend the registry snapshot and mappings to the requester.
    Get,
    /// Move one app in the display order.
    SetOrder { app: String, index: i64 },
    Heartbeat,
    Ping,
    Pong,
    Manifest(ClientManifest),
    /// Human-readable text for observers.
    Announcement(Value),
    /// Replace an app's persisted data.
    Preferences { app: String, data: Value },
    Action(Action),
    Input { key: String, mode: EventMode },
}

impl ServerCommand {
    fn parse(message: &Message) -> Result<Self, RoutingError> {
        fn payload<T: serde::de::DeserializeOwned>(message: &Message) -> Result<T, RoutingError> {
            serde_json::from_value(message.payload.clone()).map_err(|e| RoutingError::BadPayload {
                command: message.kind.clone(),
                message: e.to_string(),
            })
        }

        match (message.kind.as_str(), message.request.as_deref()) {
            ("get", _) => Ok(ServerCommand::Get),
            ("set", Some("update_pref_index")) | ("update_pref_index", _) => {
                let OrderPayload { app, index } = payload(message)?;
                Ok(ServerCommand::SetOrder { app, index })
            }
            ("heartbeat", _) => Ok(ServerCommand::Heartbeat),
            ("ping", _) => Ok(ServerCommand::Ping),
            ("pong", _) => Ok(ServerCommand::Pong),
            ("manifest", _) => Ok(ServerCommand::Manifest(payload(message)?)),
            ("message", _) => Ok(ServerCommand::Announcement(message.payload.clone())),
            ("preferences", Some(app)) => Ok(ServerCommand::Preferences {
                app: app.to_string(),
                data: message.payload.clone(),
            }),
            ("preferences", None) => Err(RoutingError::BadPayload {
                command: message.kind.clone(),
                message: "request must name the app".to_string(),
            }),
            ("action", _) => Ok(ServerCommand::Action(payload(message)?)),
            ("input", _) => {
                let InputPayload { key, mode } = payload(message)?;
                Ok(ServerCommand::Input { key, mode })
            }
            (kind, request) => Err(RoutingError::UnknownCommand(match request {
                Some(request) => format!("{}/{}", kind, request),
                None => kind.to_string(),
            })),
        }
    }
}

fn to_payload<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        tracing::error!("Failed to encode payload: {}", e);
        Value::Null
    })
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// =============================================================================
// Router
// =============================================================================

pub struct MessageRouter {
    registry: Arc<PluginRegistry>,
    mappings: Arc<ButtonMappingEngine>,
    events: EventBus,
    throttle: Throttle,
    clients: ClientTable,
    connections: RwLock<HashMap<SocketAddr, Connection>>,
    policy: MissingTargetPolicy,
    lanes: Lanes,
    next_lane: AtomicU64,
    deliveries: TaskTracker,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<PluginRegistry>,
        mappings: Arc<ButtonMappingEngine>,
        events: EventBus,
        throttle_window: Duration,
        policy: MissingTargetPolicy,
    ) -> Self {
        Self {
            registry,
            mappings,
            events,
            throttle: Throttle::new(throttle_window),
            clients: ClientTable::new(),
            connections: RwLock::new(HashMap::new()),
            policy,
            lanes: Arc::new(Mutex::new(HashMap::new())),
            next_lane: AtomicU64::new(0),
            deliveries: TaskTracker::new(),
        }
    }

    // =========================================================================
    // Connections
    // =========================================================================

    /// Register a transport and push the initial state to it. Returns the
    /// client id the connection is bound to.
    pub async fn connect(&self, addr: SocketAddr, tx: OutgoingSender) -> String {
        let client = self
            .clients
            .connect(&addr.to_string(), &addr.ip().to_string(), now_ms());
        let client_id = client.connection_id;

        self.connections.write().insert(
            addr,
            Connection {
                client_id: client_id.clone(),
                tx,
            },
        );
        self.events.publish(HostEvent::ClientConnected {
            client_id: client_id.clone(),
        });

        self.send_state(&client_id).await;
        self.send_to_one(
            &client_id,
            &Message::new(CLIENT_APP, "get").with_request("manifest"),
        );
        client_id
    }

    /// The transport at `addr` closed.
    pub fn disconnect(&self, addr: SocketAddr) {
        let Some(connection) = self.connections.write().remove(&addr) else {
            return;
        };
        self.clients.disconnect(&connection.client_id);
        self.events.publish(HostEvent::ClientDisconnected {
            client_id: connection.client_id,
        });
    }

    fn client_id(&self, addr: SocketAddr) -> Option<String> {
        self.connections
            .read()
            .get(&addr)
            .map(|c| c.client_id.clone())
    }

    /// Clients with an open transport.
    pub fn clients(&self) -> Vec<Client> {
        self.clients.connected()
    }

    /// Every client the host remembers, connected or not.
    pub fn known_clients(&self) -> Vec<Client> {
        self.clients.all()
    }

    /// Close a client's transport and forget it.
    pub fn disconnect_client(&self, client_id: &str) -> Result<(), RoutingError> {
        let connection = {
            let mut connections = self.connections.write();
            let addr = connections
                .iter()
                .find(|(_, c)| c.client_id == client_id)
                .map(|(addr, _)| *addr);
            addr.and_then(|addr| connections.remove(&addr))
        };
        let evicted = self.clients.evict(client_id);

        match (connection, evicted) {
            (None, None) => Err(RoutingError::ClientNotFound(client_id.to_string())),
            (connection, _) => {
                if let Some(connection) = connection {
                    let _ = connection.tx.send(Outgoing::Close);
                    self.events.publish(HostEvent::ClientDisconnected {
                        client_id: client_id.to_string(),
                    });
                }
                tracing::info!("Client '{}' evicted", client_id);
                Ok(())
            }
        }
    }

    /// Close every transport. Records are kept for reconciliation.
    pub fn close_all(&self) {
        let connections: Vec<Connection> =
            self.connections.write().drain().map(|(_, c)| c).collect();
        for connection in connections {
            let _ = connection.tx.send(Outgoing::Close);
            self.clients.disconnect(&connection.client_id);
        }
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Send to every open transport. Returns how many accepted the frame.
    pub fn send_to_all(&self, message: &Message) -> usize {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Failed to encode message: {}", e);
                return 0;
            }
        };
        self.connections
            .read()
            .values()
            .filter(|c| c.tx.send(Outgoing::Text(text.clone())).is_ok())
            .count()
    }

    /// Send to one client. A missing target follows the
    /// [`MissingTargetPolicy`].
    pub fn send_to_one(&self, client_id: &str, message: &Message) -> bool {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Failed to encode message: {}", e);
                return false;
            }
        };
        let delivered = {
            let connections = self.connections.read();
            connections
                .values()
                .find(|c| c.client_id == client_id)
                .is_some_and(|c| c.tx.send(Outgoing::Text(text)).is_ok())
        };
        if delivered {
            return true;
        }

        match self.policy {
            MissingTargetPolicy::Broadcast => {
                tracing::debug!("Client '{}' not found, broadcasting instead", client_id);
                self.send_to_all(message) > 0
            }
            MissingTargetPolicy::Drop => {
                tracing::debug!("Client '{}' not found, dropping message", client_id);
                false
            }
        }
    }

    fn config_message(&self) -> Message {
        Message::new(CLIENT_APP, "config").with_payload(to_payload(&self.registry.snapshot()))
    }

    /// The active profile with the action catalog attached.
    async fn mappings_message(&self) -> Message {
        let profile = self.mappings.active_profile().await;
        let actions = to_payload(&self.mappings.get_actions().await);

        let payload = match to_payload(&profile) {
            Value::Object(mut map) => {
                map.insert("actions".to_string(), actions);
                Value::Object(map)
            }
            _ => serde_json::json!({ "actions": actions }),
        };
        Message::new(CLIENT_APP, "button_mappings").with_payload(payload)
    }

    async fn send_state(&self, client_id: &str) {
        self.send_to_one(client_id, &self.config_message());
        self.send_to_one(client_id, &self.mappings_message().await);
    }

    /// Deliver traffic an app produced.
    pub async fn handle_outbound(&self, outbound: AppOutbound) {
        match outbound {
            AppOutbound::Send { app, mut message } => match message.client_id.take() {
                Some(client_id) => {
                    tracing::debug!("App '{}' -> client '{}': {}", app, client_id, message.kind);
                    self.send_to_one(&client_id, &message);
                }
                None => {
                    tracing::debug!("App '{}' -> all clients: {}", app, message.kind);
                    self.send_to_all(&message);
                }
            },
            AppOutbound::SaveData { app, data } => {
                if let Err(e) = self.registry.set_app_data(&app, &data).await {
                    tracing::warn!("Failed to save data for '{}': {}", app, e);
                }
            }
        }
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Handle one text frame from the transport at `addr`.
    pub async fn handle_text(&self, addr: SocketAddr, raw: &str) {
        let Some(client_id) = self.client_id(addr) else {
            tracing::debug!("Frame from unregistered transport {}", addr);
            return;
        };
        match self.dispatch(addr, &client_id, raw).await {
            Ok(()) => {}
            Err(e @ RoutingError::Throttled(_)) => tracing::debug!("{}", e),
            Err(e) => tracing::warn!("Dropped message from '{}': {}", client_id, e),
        }
    }

    async fn dispatch(
        &self,
        addr: SocketAddr,
        client_id: &str,
        raw: &str,
    ) -> Result<(), RoutingError> {
        let mut message =
            Message::parse(raw).map_err(|e| RoutingError::Unparseable(e.to_string()))?;

        if message.is_server() {
            let command = ServerCommand::parse(&message)?;
            return self.handle_server(addr, client_id, command).await;
        }
        if message.app.is_empty() {
            return Err(RoutingError::UnknownApp(String::new()));
        }

        let key = message.throttle_key();
        if !self.throttle.check_and_set(&key, Instant::now()) {
            return Err(RoutingError::Throttled(key));
        }

        message.app = message.app.to_lowercase();
        message.client_id = Some(client_id.to_string());
        self.registry.can_receive(&message.app)?;
        self.deliver(message);
        Ok(())
    }

    async fn handle_server(
        &self,
        addr: SocketAddr,
        client_id: &str,
        command: ServerCommand,
    ) -> Result<(), RoutingError> {
        tracing::debug!("Server command from '{}': {:?}", client_id, command);
        match command {
            ServerCommand::Get => self.send_state(client_id).await,
            ServerCommand::SetOrder { app, index } => {
                self.registry
                    .set_item_order(&app, index)
                    .await
                    .map_err(|e| RoutingError::BadPayload {
                        command: "set".to_string(),
                        message: e.to_string(),
                    })?;
            }
            ServerCommand::Heartbeat => {
                let reply = Message::new(CLIENT_APP, "heartbeat")
                    .with_payload(Value::String(chrono::Utc::now().to_rfc3339()));
                self.send_to_one(client_id, &reply);
            }
            ServerCommand::Ping => {
                let reply = Message::new(CLIENT_APP, "pong")
                    .with_payload(Value::String(chrono::Utc::now().to_rfc3339()));
                self.send_to_one(client_id, &reply);
            }
            ServerCommand::Pong => tracing::debug!("Pong from '{}'", client_id),
            ServerCommand::Manifest(manifest) => {
                let result = self.clients.reconcile(client_id, &manifest)?;
                if result.id != client_id {
                    if let Some(connection) = self.connections.write().get_mut(&addr) {
                        connection.client_id = result.id.clone();
                    }
                    tracing::info!("Connection {} is now client '{}'", addr, result.id);
                }
            }
            ServerCommand::Announcement(payload) => {
                self.events.publish(HostEvent::Announcement {
                    from: client_id.to_string(),
                    payload,
                });
            }
            ServerCommand::Preferences { app, data } => {
                self.registry
                    .set_app_data(&app, &data)
                    .await
                    .map_err(|e| RoutingError::BadPayload {
                        command: "preferences".to_string(),
                        message: e.to_string(),
                    })?;
            }
            ServerCommand::Action(action) => self.run_action(&action).await?,
            ServerCommand::Input { key, mode } => self.trigger_key(&key, mode).await?,
        }
        Ok(())
    }

    // =========================================================================
    // Delivery lanes
    // =========================================================================

    /// Queue `message` on its app's lane, starting the lane if it is idle.
    fn deliver(&self, message: Message) {
        let mut lanes = self.lanes.lock();
        let message = match lanes.get(&message.app) {
            Some(lane) => match lane.tx.send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };

        let app = message.app.clone();
        let id = self.next_lane.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(message);
        lanes.insert(app.clone(), Lane { id, tx });
        self.deliveries.spawn(run_lane(
            self.registry.clone(),
            self.lanes.clone(),
            app,
            id,
            rx,
        ));
    }

    /// Wait until every queued message has been handed to its app.
    pub async fn drain_deliveries(&self) {
        self.deliveries.close();
        self.deliveries.wait().await;
        self.deliveries.reopen();
    }

    // =========================================================================
    // Actions
    // =========================================================================

    /// Deliver an action to the app that owns it as `{type: "action"}`.
    /// Disabled actions and host-owned actions are skipped.
    pub async fn run_action(&self, action: &Action) -> Result<(), RoutingError> {
        if !action.enabled {
            tracing::debug!("Action '{}' is disabled", action.id);
            return Ok(());
        }
        if action.source == SERVER_SOURCE {
            tracing::debug!("Action '{}' belongs to the host", action.id);
            return Ok(());
        }
        let message = Message::new(&action.source, "action").with_payload(to_payload(action));
        self.registry.can_receive(&message.app)?;
        self.deliver(message);
        Ok(())
    }

    /// Resolve `key`/`mode` through the active profile and run the result.
    pub async fn trigger_key(&self, key: &str, mode: EventMode) -> Result<(), RoutingError> {
        match self.mappings.resolve(key, mode).await {
            Some(action) => self.run_action(&action).await,
            None => {
                tracing::debug!("No action bound to {} {:?}", key, mode);
                Ok(())
            }
        }
    }

    // =========================================================================
    // Background loops
    // =========================================================================

    /// React to a host event: refresh clients and notify apps.
    pub async fn handle_event(&self, event: HostEvent) {
        match &event {
            HostEvent::RegistryChanged => {
                self.send_to_all(&self.config_message());
            }
            HostEvent::MappingChanged => {
                let message = self.mappings_message().await;
                self.send_to_all(&message);
            }
            HostEvent::Announcement { from, payload } => {
                tracing::info!(client = %from, "{}", payload);
            }
            HostEvent::ClientConnected { .. } | HostEvent::ClientDisconnected { .. } => {}
        }
        self.registry.dispatch_event(&event).await;
    }

    pub async fn run_events(
        self: Arc<Self>,
        mut events: broadcast::Receiver<HostEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Router skipped {} host events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        tracing::debug!("Event loop stopped");
    }

    pub async fn run_outbound(self: Arc<Self>, mut outbound: OutboundReceiver, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                item = outbound.recv() => match item {
                    Some(item) => self.handle_outbound(item).await,
                    None => break,
                },
            }
        }
        tracing::debug!("Outbound loop stopped");
    }

    /// Periodically drop stale throttle entries.
    pub async fn run_sweeper(self: Arc<Self>, period: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let removed = self.throttle.sweep(Instant::now());
                    if removed > 0 {
                        tracing::trace!("Swept {} throttle entries", removed);
                    }
                }
            }
        }
    }
}

/// Feed one app's queue to its `receive` hook, one message at a time.
async fn run_lane(
    registry: Arc<PluginRegistry>,
    lanes: Lanes,
    app: String,
    id: u64,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    loop {
        let message = match rx.try_recv() {
            Ok(message) => message,
            Err(_) => {
                // Senders queue under this lock, so an empty queue here stays
                // empty until the lane is gone.
                let mut lanes = lanes.lock();
                match rx.try_recv() {
                    Ok(message) => message,
                    Err(_) => {
                        if lanes.get(&app).is_some_and(|lane| lane.id == id) {
                            lanes.remove(&app);
                        }
                        return;
                    }
                }
            }
        };
        if let Err(e) = registry.send_to_app(message).await {
            tracing::warn!("Dropped message for '{}': {}", app, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{drain, Fixture, ECHO_APP};
    use deckhost_core::{EventMode, Key};
    use serde_json::json;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn frame(value: Value) -> String {
        value.to_string()
    }

    #[tokio::test]
    async fn test_connect_pushes_initial_state() {
        let f = Fixture::new(MissingTargetPolicy::Broadcast).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let id = f.router.connect(addr("10.0.0.5:4000"), tx).await;

        assert_eq!(id, "10.0.0.5:4000");
        let sent = drain(&mut rx);
        let kinds: Vec<&str> = sent.iter().map(|m| m.kind.as_str()).collect();
        assert_eq!(kinds, vec!["config", "button_mappings", "get"]);
        assert_eq!(sent[0].payload[0]["name"], ECHO_APP);
        assert!(sent[1].payload["mapping"].is_object());
        assert!(sent[1].payload["actions"].is_array());
        assert_eq!(sent[2].request.as_deref(), Some("manifest"));
        assert_eq!(f.router.clients().len(), 1);
    }

    #[tokio::test]
    async fn test_get_replies_to_requester_only() {
        let f = Fixture::new(MissingTargetPolicy::Broadcast).await;
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        f.router.connect(addr("10.0.0.5:4000"), tx_a).await;
        f.router.connect(addr("10.0.0.6:4000"), tx_b).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        f.router
            .handle_text(addr("10.0.0.5:4000"), &frame(json!({"app": "server", "type": "get"})))
            .await;

        let kinds: Vec<String> = drain(&mut rx_a).into_iter().map(|m| m.kind).collect();
        assert_eq!(kinds, vec!["config", "button_mappings"]);
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_and_ping() {
        let f = Fixture::new(MissingTargetPolicy::Broadcast).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let a = addr("10.0.0.5:4000");
        f.router.connect(a, tx).await;
        drain(&mut rx);

        f.router
            .handle_text(a, &frame(json!({"app": "server", "type": "heartbeat"})))
            .await;
        f.router
            .handle_text(a, &frame(json!({"app": "server", "type": "ping"})))
            .await;

        let sent = drain(&mut rx);
        assert_eq!(sent[0].kind, "heartbeat");
        assert_eq!(sent[0].app, CLIENT_APP);
        let stamp = sent[0].payload.as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
        assert_eq!(sent[1].kind, "pong");
    }

    #[tokio::test]
    async fn test_app_message_reaches_app_and_reply_targets_sender() {
        let mut f = Fixture::new(MissingTargetPolicy::Broadcast).await;
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = addr("10.0.0.5:4000");
        f.router.connect(a, tx_a).await;
        f.router.connect(addr("10.0.0.6:4000"), tx_b).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        f.router
            .handle_text(
                a,
                &frame(json!({"app": "ECHO", "type": "hello", "payload": {"n": 1}})),
            )
            .await;
        f.router.drain_deliveries().await;
        let outbound = f.outbound.try_recv().unwrap();
        f.router.handle_outbound(outbound).await;

        let replies = drain(&mut rx_a);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].app, ECHO_APP);
        assert_eq!(replies[0].kind, "echo");
        assert_eq!(replies[0].request.as_deref(), Some("hello"));
        assert_eq!(replies[0].payload, json!({"n": 1}));
        assert_eq!(replies[0].client_id, None);
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_app_messages_are_throttled() {
        let mut f = Fixture::new(MissingTargetPolicy::Broadcast).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = addr("10.0.0.5:4000");
        f.router.connect(a, tx).await;
        let get_song = frame(json!({"app": "echo", "type": "get", "request": "song"}));

        f.router.handle_text(a, &get_song).await;
        f.router.handle_text(a, &get_song).await;
        f.router
            .handle_text(a, &frame(json!({"app": "echo", "type": "get", "request": "playlist"})))
            .await;
        f.router.drain_deliveries().await;

        let mut forwarded = Vec::new();
        while let Ok(AppOutbound::Send { message, .. }) = f.outbound.try_recv() {
            forwarded.push(message.kind);
        }
        assert_eq!(forwarded, vec!["echo", "echo"]);
    }

    #[tokio::test]
    async fn test_bad_frames_are_dropped_quietly() {
        let mut f = Fixture::new(MissingTargetPolicy::Broadcast).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let a = addr("10.0.0.5:4000");
        f.router.connect(a, tx).await;
        drain(&mut rx);

        for raw in [
            "not json".to_string(),
            frame(json!({"app": "ghost", "type": "get"})),
            frame(json!({"app": "server", "type": "teleport"})),
            frame(json!({"app": "server", "type": "input", "payload": {"key": "Tray4"}})),
        ] {
            f.router.handle_text(a, &raw).await;
        }
        f.router
            .handle_text(addr("10.9.9.9:1"), &frame(json!({"app": "server", "type": "get"})))
            .await;

        f.router.drain_deliveries().await;
        assert!(drain(&mut rx).is_empty());
        assert!(f.outbound.try_recv().is_err());
    }

    #[test]
    fn test_server_command_parse() {
        let set = Message::new("server", "set")
            .with_request("update_pref_index")
            .with_payload(json!({"app": "weather", "index": 2}));
        assert!(matches!(
            ServerCommand::parse(&set),
            Ok(ServerCommand::SetOrder { index: 2, .. })
        ));

        let before_start = Message::new("server", "update_pref_index")
            .with_payload(json!({"app": "weather", "index": -1}));
        assert!(matches!(
            ServerCommand::parse(&before_start),
            Ok(ServerCommand::SetOrder { index: -1, .. })
        ));

        let unknown = Message::new("server", "set").with_request("add_app");
        assert!(matches!(
            ServerCommand::parse(&unknown),
            Err(RoutingError::UnknownCommand(c)) if c == "set/add_app"
        ));

        let prefs = Message::new("server", "preferences");
        assert!(matches!(
            ServerCommand::parse(&prefs),
            Err(RoutingError::BadPayload { .. })
        ));
    }

    #[tokio::test]
    async fn test_set_updates_order() {
        let f = Fixture::new(MissingTargetPolicy::Broadcast).await;
        f.install_dev("clock", "return {}").await;
        assert_eq!(f.registry.order(), vec![ECHO_APP, "clock"]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = addr("10.0.0.5:4000");
        f.router.connect(a, tx).await;

        f.router
            .handle_text(
                a,
                &frame(json!({
                    "app": "server",
                    "type": "set",
                    "request": "update_pref_index",
                    "payload": {"app": "clock", "index": 0}
                })),
            )
            .await;

        assert_eq!(f.registry.order(), vec!["clock", ECHO_APP]);

        f.router
            .handle_text(
                a,
                &frame(json!({
                    "app": "server",
                    "type": "set",
                    "request": "update_pref_index",
                    "payload": {"app": "echo", "index": -3}
                })),
            )
            .await;

        assert_eq!(f.registry.order(), vec![ECHO_APP, "clock"]);
        assert_eq!(f.registry.get(ECHO_APP).unwrap().pref_index, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_hung_app_does_not_hold_up_other_apps() {
        let mut f = Fixture::new(MissingTargetPolicy::Broadcast).await;
        f.install_dev(
            "busy",
            r#"
            return {
                receive = function()
                    local t = os.clock()
                    while os.clock() - t < 2 do end
                end,
            }
            "#,
        )
        .await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = addr("10.0.0.5:4000");
        f.router.connect(a, tx).await;

        let started = Instant::now();
        f.router
            .handle_text(a, &frame(json!({"app": "busy", "type": "work"})))
            .await;
        f.router
            .handle_text(a, &frame(json!({"app": "echo", "type": "hello"})))
            .await;
        assert!(started.elapsed() < Duration::from_millis(500));

        let reply = tokio::time::timeout(Duration::from_secs(1), f.outbound.recv())
            .await
            .expect("echo answered while busy was still working")
            .unwrap();
        let AppOutbound::Send { message, .. } = reply else {
            panic!("expected a send from echo");
        };
        assert_eq!(message.request.as_deref(), Some("hello"));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_manifest_rebinds_connection() {
        let f = Fixture::new(MissingTargetPolicy::Drop).await;
        let manifest = frame(json!({
            "app": "server",
            "type": "manifest",
            "payload": {"uuid": "dev-1", "name": "kitchen", "version": "1.0.0"}
        }));

        let (tx, _rx) = mpsc::unbounded_channel();
        let first = addr("10.0.0.5:4000");
        f.router.connect(first, tx).await;
        f.router.handle_text(first, &manifest).await;
        let original = f.router.known_clients()[0].clone();
        assert_eq!(original.connection_id, "dev-1");
        f.router.disconnect(first);
        assert!(f.router.clients().is_empty());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let second = addr("10.0.0.9:5123");
        f.router.connect(second, tx).await;
        f.router.handle_text(second, &manifest).await;
        drain(&mut rx);

        let clients = f.router.clients();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].connection_id, "dev-1");
        assert_eq!(clients[0].timestamp, original.timestamp);
        assert_eq!(clients[0].client_name.as_deref(), Some("kitchen"));

        assert!(f.router.send_to_one("dev-1", &Message::new(CLIENT_APP, "time")));
        assert_eq!(drain(&mut rx)[0].kind, "time");
    }

    #[tokio::test]
    async fn test_missing_target_policy() {
        let broadcast = Fixture::new(MissingTargetPolicy::Broadcast).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        broadcast.router.connect(addr("10.0.0.5:4000"), tx).await;
        drain(&mut rx);

        assert!(broadcast.router.send_to_one("ghost", &Message::new(CLIENT_APP, "x")));
        assert_eq!(drain(&mut rx).len(), 1);

        let dropping = Fixture::new(MissingTargetPolicy::Drop).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        dropping.router.connect(addr("10.0.0.5:4000"), tx).await;
        drain(&mut rx);

        assert!(!dropping.router.send_to_one("ghost", &Message::new(CLIENT_APP, "x")));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_preferences_store_app_data() {
        let f = Fixture::new(MissingTargetPolicy::Broadcast).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = addr("10.0.0.5:4000");
        f.router.connect(a, tx).await;

        f.router
            .handle_text(
                a,
                &frame(json!({
                    "app": "server",
                    "type": "preferences",
                    "request": "echo",
                    "payload": {"volume": 7}
                })),
            )
            .await;

        assert_eq!(f.registry.app_data(ECHO_APP).await, json!({"volume": 7}));
    }

    #[tokio::test]
    async fn test_input_triggers_bound_action() {
        let mut f = Fixture::new(MissingTargetPolicy::Broadcast).await;
        f.mappings
            .add_button(Action::new("skip", ECHO_APP), "Tray4", EventMode::PressShort, None)
            .await
            .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = addr("10.0.0.5:4000");
        f.router.connect(a, tx).await;

        f.router
            .handle_text(
                a,
                &frame(json!({
                    "app": "server",
                    "type": "input",
                    "payload": {"key": "Tray4", "mode": "PressShort"}
                })),
            )
            .await;
        f.router.drain_deliveries().await;

        let Ok(AppOutbound::Send { message, .. }) = f.outbound.try_recv() else {
            panic!("expected the app to answer");
        };
        assert_eq!(message.request.as_deref(), Some("action"));
        assert_eq!(message.payload["id"], "skip");
    }

    #[tokio::test]
    async fn test_run_action_skips_disabled_and_host_actions() {
        let mut f = Fixture::new(MissingTargetPolicy::Broadcast).await;

        f.router.run_action(&Action::new("skip", SERVER_SOURCE)).await.unwrap();
        let mut disabled = Action::new("skip", ECHO_APP);
        disabled.enabled = false;
        f.router.run_action(&disabled).await.unwrap();
        f.router.drain_deliveries().await;
        assert!(f.outbound.try_recv().is_err());

        let result = f.router.run_action(&Action::new("skip", "ghost")).await;
        assert!(matches!(result, Err(RoutingError::UnknownApp(_))));
    }

    #[tokio::test]
    async fn test_mapping_change_rebroadcasts() {
        let f = Fixture::new(MissingTargetPolicy::Broadcast).await;
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        f.router.connect(addr("10.0.0.5:4000"), tx_a).await;
        f.router.connect(addr("10.0.0.6:4000"), tx_b).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        f.mappings
            .add_key(Key::new("Tray4", ECHO_APP, vec![EventMode::PressShort]))
            .await
            .unwrap();
        f.router.handle_event(HostEvent::MappingChanged).await;

        for rx in [&mut rx_a, &mut rx_b] {
            let sent = drain(rx);
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].kind, "button_mappings");
        }
    }

    #[tokio::test]
    async fn test_disconnect_client_closes_transport() {
        let f = Fixture::new(MissingTargetPolicy::Broadcast).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = f.router.connect(addr("10.0.0.5:4000"), tx).await;
        drain(&mut rx);
        let mut events = f.events.subscribe();

        f.router.disconnect_client(&id).unwrap();

        assert_eq!(rx.try_recv().unwrap(), Outgoing::Close);
        assert!(f.router.known_clients().is_empty());
        assert_eq!(
            events.recv().await.unwrap(),
            HostEvent::ClientDisconnected { client_id: id.clone() }
        );
        assert!(matches!(
            f.router.disconnect_client(&id),
            Err(RoutingError::ClientNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_announcement_is_published() {
        let f = Fixture::new(MissingTargetPolicy::Broadcast).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = addr("10.0.0.5:4000");
        let id = f.router.connect(a, tx).await;
        let mut events = f.events.subscribe();

        f.router
            .handle_text(a, &frame(json!({"app": "server", "type": "message", "payload": "hi"})))
            .await;

        assert_eq!(
            events.recv().await.unwrap(),
            HostEvent::Announcement {
                from: id,
                payload: json!("hi")
            }
        );
    }
}
