//! Router fixture backed by real Lua apps.

use std::sync::Arc;
use std::time::Duration;

use deckhost_core::{ConfigStore, EventBus, Message, MissingTargetPolicy};
use deckhost_mappings::ButtonMappingEngine;
use deckhost_plugin_api::{
    HttpFetcher, LuaModuleLoader, OutboundReceiver, PackageSource, PluginLoader, PluginRegistry,
};
use tempfile::TempDir;
use tokio::sync::mpsc;

use crate::router::{MessageRouter, Outgoing, OutgoingReceiver};

pub const ECHO_APP: &str = "echo";

/// Replies to every message with `{type: "echo", request: <original type>}`
/// addressed to the sender.
const ECHO_SOURCE: &str = r#"
local ctx
return {
    start = function(c) ctx = c end,
    receive = function(msg)
        ctx.send({
            type = "echo",
            request = msg.type,
            payload = msg.payload,
            clientId = msg.clientId,
        })
    end,
}
"#;

pub struct Fixture {
    pub router: Arc<MessageRouter>,
    pub registry: Arc<PluginRegistry>,
    pub mappings: Arc<ButtonMappingEngine>,
    pub events: EventBus,
    pub outbound: OutboundReceiver,
    dir: TempDir,
}

impl Fixture {
    /// A router with the echo app installed and running.
    pub async fn new(policy: MissingTargetPolicy) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("store"));
        let events = EventBus::new();
        let mappings = Arc::new(ButtonMappingEngine::new(store.clone(), events.clone()));
        let (outbound_tx, outbound) = mpsc::unbounded_channel();

        let loader = Arc::new(PluginLoader::new(
            dir.path().join("apps"),
            store.clone(),
            mappings.clone(),
            Arc::new(LuaModuleLoader::new(Duration::from_secs(5))),
            Arc::new(HttpFetcher::new()),
            outbound_tx,
        ));
        let registry = Arc::new(PluginRegistry::new(
            loader,
            store,
            events.clone(),
            Duration::from_secs(5),
        ));
        let router = Arc::new(MessageRouter::new(
            registry.clone(),
            mappings.clone(),
            events.clone(),
            Duration::from_secs(10),
            policy,
        ));

        let fixture = Self {
            router,
            registry,
            mappings,
            events,
            outbound,
            dir,
        };
        fixture.install_dev(ECHO_APP, ECHO_SOURCE).await;
        fixture
    }

    /// Register `source` as a developer app and start it.
    pub async fn install_dev(&self, name: &str, source: &str) {
        let app_dir = self.dir.path().join("dev").join(name);
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(
            app_dir.join("manifest.json"),
            serde_json::json!({ "id": name, "version": "1.0.0" }).to_string(),
        )
        .unwrap();
        std::fs::write(app_dir.join("main.lua"), source).unwrap();

        self.registry
            .install(PackageSource::Developer(app_dir))
            .await
            .unwrap();
        self.registry.run(name).await.unwrap();
    }
}

/// Every text frame queued so far, decoded. Close frames are skipped.
pub fn drain(rx: &mut OutgoingReceiver) -> Vec<Message> {
    let mut messages = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        if let Outgoing::Text(text) = frame {
            messages.push(Message::parse(&text).unwrap());
        }
    }
    messages
}
