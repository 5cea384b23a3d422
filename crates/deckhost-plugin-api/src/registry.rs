//! The authoritative table of installed apps.
//!
//! Lifecycle per app:
//!
//! ```text
//! install -> Installed -> enable -> Enabled -> run -> Running
//!                                              stop -> Stopped
//!                                           disable -> Disabled
//!                                             purge -> (gone)
//! ```
//!
//! Operations on one app are serialized by a per-name async lock; different
//! apps proceed concurrently. Every transition persists the registry and
//! publishes [`HostEvent::RegistryChanged`]. A failed persist is logged and the
//! in-memory state stays authoritative.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use deckhost_core::{
    AppDescriptor, ConfigStore, EventBus, HostEvent, LifecycleError, LoadError, Message,
    RoutingError, RuntimeError, ValidationError,
};
use futures::future::{join_all, BoxFuture};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::loader::{PackageSource, PluginLoader};
use crate::module::{AppModule, HookSet};

/// Store key of the registry document.
pub const REGISTRY_KEY: &str = "registry";

/// Persisted form of the registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryDocument {
    /// Descriptors in display order.
    pub apps: Vec<AppDescriptor>,
    pub order: Vec<String>,
}

#[derive(Debug, Default)]
struct RegistryState {
    apps: HashMap<String, AppDescriptor>,
    /// Always a permutation of `apps`' keys.
    order: Vec<String>,
}

impl RegistryState {
    /// Rebuild state from a stored document, repairing the order into a
    /// permutation and clearing stale running flags.
    fn from_document(doc: RegistryDocument) -> Self {
        let apps: HashMap<String, AppDescriptor> = doc
            .apps
            .into_iter()
            .map(|mut app| {
                app.running = false;
                (app.name.clone(), app)
            })
            .collect();

        let mut seen = HashSet::new();
        let mut order: Vec<String> = doc
            .order
            .into_iter()
            .filter(|name| apps.contains_key(name) && seen.insert(name.clone()))
            .collect();

        let mut missing: Vec<&AppDescriptor> =
            apps.values().filter(|app| !seen.contains(&app.name)).collect();
        missing.sort_by(|a, b| a.pref_index.cmp(&b.pref_index).then(a.name.cmp(&b.name)));
        if !missing.is_empty() {
            tracing::warn!("Registry order was missing {} app(s); appending", missing.len());
        }
        order.extend(missing.into_iter().map(|app| app.name.clone()));

        let mut state = Self { apps, order };
        state.reindex();
        state
    }

    fn reindex(&mut self) {
        for (index, name) in self.order.iter().enumerate() {
            if let Some(app) = self.apps.get_mut(name) {
                app.pref_index = index;
            }
        }
    }

    fn ordered(&self) -> Vec<AppDescriptor> {
        self.order
            .iter()
            .filter_map(|name| self.apps.get(name).cloned())
            .collect()
    }

    fn document(&self) -> RegistryDocument {
        RegistryDocument {
            apps: self.ordered(),
            order: self.order.clone(),
        }
    }
}

/// Installed apps, their lifecycle, and their display order.
pub struct PluginRegistry {
    state: RwLock<RegistryState>,
    loader: Arc<PluginLoader>,
    store: ConfigStore,
    events: EventBus,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    write_lock: tokio::sync::Mutex<()>,
    hook_timeout: Duration,
}

impl PluginRegistry {
    pub fn new(
        loader: Arc<PluginLoader>,
        store: ConfigStore,
        events: EventBus,
        hook_timeout: Duration,
    ) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            loader,
            store,
            events,
            locks: Mutex::new(HashMap::new()),
            write_lock: tokio::sync::Mutex::new(()),
            hook_timeout,
        }
    }

    pub fn loader(&self) -> &Arc<PluginLoader> {
        &self.loader
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().entry(name.to_string()).or_default().clone()
    }

    /// Forget the lock of an app that is gone. Kept while anyone else waits
    /// on it.
    fn release_lock(&self, name: &str, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock();
        let idle = locks
            .get(name)
            .is_some_and(|held| Arc::ptr_eq(held, lock) && Arc::strong_count(lock) == 2);
        if idle {
            locks.remove(name);
        }
    }

    /// Write the registry and tell subscribers.
    async fn persist(&self) {
        {
            let _writer = self.write_lock.lock().await;
            let doc = self.state.read().document();
            if let Err(e) = self.store.write(REGISTRY_KEY, &doc).await {
                tracing::error!("Failed to persist registry: {}", e);
            }
        }
        self.events.publish(HostEvent::RegistryChanged);
    }

    fn update<F>(&self, name: &str, f: F) -> Result<AppDescriptor, LifecycleError>
    where
        F: FnOnce(&mut AppDescriptor),
    {
        let mut state = self.state.write();
        let app = state
            .apps
            .get_mut(name)
            .ok_or_else(|| LifecycleError::NotFound(name.to_string()))?;
        f(app);
        Ok(app.clone())
    }

    async fn call_hook(
        &self,
        app: &str,
        hook: &'static str,
        call: BoxFuture<'static, Result<(), RuntimeError>>,
    ) -> Result<(), LifecycleError> {
        match tokio::time::timeout(self.hook_timeout, call).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(LifecycleError::Hook {
                app: app.to_string(),
                hook,
                message: e.to_string(),
            }),
            Err(_) => {
                tracing::warn!(
                    "App '{}' {} hook timed out after {:?}; continuing",
                    app,
                    hook,
                    self.hook_timeout
                );
                Ok(())
            }
        }
    }

    // =========================================================================
    // Startup
    // =========================================================================

    /// Load the registry from the store.
    pub async fn load(&self) {
        let doc: RegistryDocument = self
            .store
            .read_or_init(REGISTRY_KEY, RegistryDocument::default)
            .await;
        let state = RegistryState::from_document(doc);
        tracing::info!("Registry loaded with {} app(s)", state.apps.len());
        *self.state.write() = state;
        self.persist().await;
    }

    /// Run every enabled app. Failures are logged.
    pub async fn run_enabled(&self) {
        let enabled: Vec<String> = {
            let state = self.state.read();
            state
                .order
                .iter()
                .filter(|name| state.apps.get(*name).is_some_and(|app| app.enabled))
                .cloned()
                .collect()
        };
        for name in enabled {
            if let Err(e) = self.run(&name).await {
                tracing::warn!("Failed to start '{}': {}", name, e);
            }
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Install or reinstall an app. A reinstall disables the running
    /// instance first and keeps its place in the order.
    pub async fn install(&self, source: PackageSource) -> Result<AppDescriptor, LifecycleError> {
        let staged = self.loader.stage(source).await?;
        let name = staged.manifest.id.clone();

        let lock = self.lock_for(&name);
        let _guard = lock.lock().await;

        let previous = self.get(&name);
        if previous.is_some() {
            tracing::info!("Reinstalling '{}'", name);
            self.disable_locked(&name).await;
        }

        let app = self.loader.commit(staged).await?;
        if let Some(previous) = previous.filter(|p| p.path != app.path) {
            if let Err(e) = self.loader.remove_files(&previous).await {
                tracing::warn!("Failed to remove old files of '{}': {}", name, e);
            }
        }
        let app = {
            let mut state = self.state.write();
            if !state.order.contains(&name) {
                state.order.push(name.clone());
            }
            state.apps.insert(name.clone(), app);
            state.reindex();
            state.apps.get(&name).cloned()
        }
        .ok_or_else(|| LifecycleError::NotFound(name.clone()))?;

        self.persist().await;
        tracing::info!("App '{}' {} installed", name, app.manifest.version);
        Ok(app)
    }

    pub async fn enable(&self, name: &str) -> Result<(), LifecycleError> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        self.update(name, |app| app.enabled = true)?;
        self.persist().await;
        tracing::info!("App '{}' enabled", name);
        Ok(())
    }

    /// Load if needed and call `start`. Enables the app if it was not.
    ///
    /// A load failure leaves the app enabled but not running.
    pub async fn run(&self, name: &str) -> Result<(), LifecycleError> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        let app = self.update(name, |app| app.enabled = true)?;
        if app.running {
            tracing::debug!("App '{}' already running", name);
            return Ok(());
        }

        if !self.loader.is_loaded(name) {
            if let Err(e) = self.loader.load(&app).await {
                tracing::error!("Failed to load '{}': {}", name, e);
                self.persist().await;
                return Err(e.into());
            }
        }
        let module = self
            .loader
            .module(name)
            .ok_or_else(|| LoadError::NotInstalled(name.to_string()))?;

        let data = self.app_data(name).await;
        if let Err(e) = self.call_hook(name, "start", module.start(data)).await {
            tracing::error!("{}", e);
            self.loader.unload(name);
            self.persist().await;
            return Err(e);
        }

        self.update(name, |app| app.running = true)?;
        self.persist().await;
        tracing::info!("App '{}' running", name);
        Ok(())
    }

    /// Call `stop` and mark the app stopped. Its code stays loaded.
    pub async fn stop(&self, name: &str) -> Result<(), LifecycleError> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;
        self.stop_locked(name).await
    }

    async fn stop_locked(&self, name: &str) -> Result<(), LifecycleError> {
        let app = self.update(name, |_| {})?;
        if !app.running {
            return Ok(());
        }

        if let Some(module) = self.loader.module(name) {
            if let Err(e) = self.call_hook(name, "stop", module.stop()).await {
                tracing::warn!("{}", e);
            }
        }

        self.update(name, |app| app.running = false)?;
        self.persist().await;
        tracing::info!("App '{}' stopped", name);
        Ok(())
    }

    /// Stop, call `purge`, unload and mark disabled. Unknown or already
    /// disabled apps are left alone.
    pub async fn disable(&self, name: &str) -> Result<(), LifecycleError> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;
        self.disable_locked(name).await;
        Ok(())
    }

    async fn disable_locked(&self, name: &str) {
        let Some(app) = self.get(name) else {
            tracing::debug!("Disable of '{}': not installed", name);
            return;
        };
        if !app.enabled && !app.running && !self.loader.is_loaded(name) {
            tracing::debug!("App '{}' already disabled", name);
            return;
        }

        if let Err(e) = self.stop_locked(name).await {
            tracing::warn!("Stopping '{}' during disable: {}", name, e);
        }
        if let Some(module) = self.loader.module(name) {
            if module.hooks().contains(HookSet::PURGE) {
                if let Err(e) = self.call_hook(name, "purge", module.purge()).await {
                    tracing::warn!("{}", e);
                }
            }
        }
        self.loader.unload(name);

        if self
            .update(name, |app| {
                app.enabled = false;
                app.running = false;
            })
            .is_ok()
        {
            self.persist().await;
        }
        tracing::info!("App '{}' disabled", name);
    }

    /// Disable the app, delete everything it owns and forget it. Purging an
    /// unknown app does nothing.
    pub async fn purge(&self, name: &str) -> Result<(), LifecycleError> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        let Some(app) = self.get(name) else {
            tracing::debug!("Purge of '{}': not installed", name);
            self.release_lock(name, &lock);
            return Ok(());
        };

        self.disable_locked(name).await;
        let result = self.loader.purge_files(&app).await;

        {
            let mut state = self.state.write();
            state.apps.remove(name);
            state.order.retain(|n| n != name);
            state.reindex();
        }
        self.persist().await;
        self.release_lock(name, &lock);

        match &result {
            Ok(()) => tracing::info!("App '{}' purged", name),
            Err(e) => tracing::warn!("{}", e),
        }
        result
    }

    // =========================================================================
    // Order
    // =========================================================================

    /// Replace the order. It must be a permutation of the installed apps.
    pub async fn reorder(&self, order: Vec<String>) -> Result<(), LifecycleError> {
        {
            let mut state = self.state.write();
            let unique: HashSet<&String> = order.iter().collect();
            let valid = unique.len() == order.len()
                && order.len() == state.apps.len()
                && order.iter().all(|name| state.apps.contains_key(name));
            if !valid {
                return Err(ValidationError::new(format!(
                    "order {:?} is not a permutation of installed apps",
                    order
                ))
                .into());
            }
            state.order = order;
            state.reindex();
        }
        self.persist().await;
        Ok(())
    }

    /// Move one app to `index`, clamped to the bounds of the order.
    pub async fn set_item_order(&self, name: &str, index: i64) -> Result<(), LifecycleError> {
        {
            let mut state = self.state.write();
            let current = state
                .order
                .iter()
                .position(|n| n == name)
                .ok_or_else(|| LifecycleError::NotFound(name.to_string()))?;
            let moved = state.order.remove(current);
            let index = match usize::try_from(index) {
                Ok(index) => index.min(state.order.len()),
                Err(_) if index < 0 => 0,
                Err(_) => state.order.len(),
            };
            state.order.insert(index, moved);
            state.reindex();
        }
        self.persist().await;
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// All apps in display order.
    pub fn snapshot(&self) -> Vec<AppDescriptor> {
        self.state.read().ordered()
    }

    pub fn get(&self, name: &str) -> Option<AppDescriptor> {
        self.state.read().apps.get(name).cloned()
    }

    pub fn order(&self) -> Vec<String> {
        self.state.read().order.clone()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.read().apps.contains_key(name)
    }

    pub fn running(&self) -> Vec<String> {
        let state = self.state.read();
        state
            .order
            .iter()
            .filter(|name| state.apps.get(*name).is_some_and(|app| app.running))
            .cloned()
            .collect()
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    /// Hand a message to a running app's `receive` hook.
    ///
    /// Failures inside the hook are logged; only delivery problems are
    /// returned.
    pub async fn send_to_app(&self, message: Message) -> Result<(), RoutingError> {
        let name = message.app.clone();
        let module = self.receiver(&name)?;
        if let Err(e) = self.call_hook(&name, "receive", module.receive(message)).await {
            tracing::warn!("{}", e);
        }
        Ok(())
    }

    /// Check that `name` would accept a message right now.
    pub fn can_receive(&self, name: &str) -> Result<(), RoutingError> {
        self.receiver(name).map(|_| ())
    }

    fn receiver(&self, name: &str) -> Result<Arc<dyn AppModule>, RoutingError> {
        let app = self
            .get(name)
            .ok_or_else(|| RoutingError::UnknownApp(name.to_string()))?;
        if !app.running {
            return Err(RoutingError::NotRunning(name.to_string()));
        }
        let module = self
            .loader
            .module(name)
            .ok_or_else(|| RoutingError::NotRunning(name.to_string()))?;
        if !module.hooks().contains(HookSet::RECEIVE) {
            return Err(RoutingError::HookMissing {
                app: name.to_string(),
                hook: "receive",
            });
        }
        Ok(module)
    }

    /// Deliver a host event to every running app that can receive it. Apps
    /// are called concurrently so one slow handler does not hold up the rest.
    pub async fn dispatch_event(&self, event: &HostEvent) {
        let Some(event_name) = event.system_name() else {
            return;
        };
        let payload = event.system_payload();

        let calls = self.running().into_iter().filter_map(|name| {
            let module = self.loader.module(&name)?;
            let call = module.emit(event_name, payload.clone());
            Some(async move {
                if let Err(e) = self.call_hook(&name, "event", call).await {
                    tracing::warn!("{}", e);
                }
            })
        });
        join_all(calls).await;
    }

    // =========================================================================
    // App data
    // =========================================================================

    /// The app's persisted data, `null` if it has none.
    pub async fn app_data(&self, name: &str) -> Value {
        match self.store.read_opt(&format!("data/{}", name)).await {
            Ok(Some(value)) => value,
            Ok(None) => Value::Null,
            Err(e) => {
                tracing::warn!("Failed to read data for '{}': {}", name, e);
                Value::Null
            }
        }
    }

    pub async fn set_app_data(&self, name: &str, data: &Value) -> Result<(), LifecycleError> {
        if !self.contains(name) {
            return Err(LifecycleError::NotFound(name.to_string()));
        }
        self.store.write(&format!("data/{}", name), data).await?;
        tracing::debug!("Saved data for '{}'", name);
        Ok(())
    }
}
