//! Composition root.
//!
//! Wiring order matters: the mapping engine and store exist before the
//! loader (purge needs both), the registry before the router, and the
//! router's event subscription before any app runs.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use deckhost_core::{ConfigStore, EventBus, HostError, HostResult, HostSettings};
use deckhost_mappings::ButtonMappingEngine;
use deckhost_plugin_api::{
    HttpFetcher, LuaModuleLoader, ModuleLoader, OutboundReceiver, PackageFetcher, PluginLoader,
    PluginRegistry,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::router::MessageRouter;
use crate::server::RouterServer;

pub struct Host {
    settings: HostSettings,
    store: ConfigStore,
    events: EventBus,
    mappings: Arc<ButtonMappingEngine>,
    registry: Arc<PluginRegistry>,
    router: Arc<MessageRouter>,
    server: RouterServer,
    outbound: Mutex<Option<OutboundReceiver>>,
}

impl Host {
    /// A host running Lua apps and downloading packages over HTTP.
    pub async fn new(settings: HostSettings) -> Self {
        let modules = Arc::new(LuaModuleLoader::new(settings.hook_timeout()));
        Self::new_with(settings, modules, Arc::new(HttpFetcher::new())).await
    }

    pub async fn new_with(
        settings: HostSettings,
        modules: Arc<dyn ModuleLoader>,
        fetcher: Arc<dyn PackageFetcher>,
    ) -> Self {
        // Step 1: Shared state
        let store = ConfigStore::new(settings.store_dir());
        let events = EventBus::new();
        let mappings = Arc::new(ButtonMappingEngine::new(store.clone(), events.clone()));

        // Step 2: App runtime
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let loader = Arc::new(PluginLoader::new(
            settings.apps_dir(),
            store.clone(),
            mappings.clone(),
            modules,
            fetcher,
            outbound_tx,
        ));
        let registry = Arc::new(PluginRegistry::new(
            loader,
            store.clone(),
            events.clone(),
            settings.hook_timeout(),
        ));
        registry.load().await;

        // Step 3: Routing and transport
        let router = Arc::new(MessageRouter::new(
            registry.clone(),
            mappings.clone(),
            events.clone(),
            settings.throttle_window(),
            settings.missing_target_policy,
        ));
        let server = RouterServer::new(router.clone(), settings.bind_addr());

        tracing::debug!("Host wired with data dir {}", settings.data_dir.display());
        Self {
            settings,
            store,
            events,
            mappings,
            registry,
            router,
            server,
            outbound: Mutex::new(Some(outbound_rx)),
        }
    }

    pub fn settings(&self) -> &HostSettings {
        &self.settings
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn mappings(&self) -> &Arc<ButtonMappingEngine> {
        &self.mappings
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// Address clients connect to, while serving.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr().await
    }

    /// Run enabled apps and serve clients until `shutdown` resolves.
    ///
    /// A host serves once; its app outbound channel is consumed.
    pub async fn serve(&self, shutdown: impl Future<Output = ()>) -> HostResult<()> {
        let outbound = self
            .outbound
            .lock()
            .take()
            .ok_or_else(|| HostError::Internal("host is already serving".to_string()))?;

        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        tasks.spawn(
            self.router
                .clone()
                .run_events(self.events.subscribe(), cancel.clone()),
        );
        tasks.spawn(self.router.clone().run_outbound(outbound, cancel.clone()));
        tasks.spawn(
            self.router
                .clone()
                .run_sweeper(self.settings.throttle_sweep(), cancel.clone()),
        );

        self.registry.run_enabled().await;

        let result = match self.server.start().await {
            Ok(addr) => {
                tracing::info!("deckhost ready on {}", addr);
                shutdown.await;
                tracing::info!("Shutting down");
                self.server.stop().await;
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to bind {}: {}", self.settings.bind_addr(), e);
                Err(HostError::Io(e))
            }
        };

        self.router.drain_deliveries().await;
        for name in self.registry.running() {
            if let Err(e) = self.registry.stop(&name).await {
                tracing::warn!("Failed to stop '{}': {}", name, e);
            }
        }

        cancel.cancel();
        tasks.close();
        tasks.wait().await;
        result
    }
}
