//! The seam between the registry and app code.
//!
//! An [`AppModule`] is one loaded generation of an app. A [`ModuleLoader`]
//! turns an installed app into a module. Both return futures, so callers can
//! bound them with timeouts and tests can swap in mocks.

use std::sync::Arc;

use bitflags::bitflags;
use deckhost_core::{AppDescriptor, LoadError, Message, RuntimeError};
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;

bitflags! {
    /// Lifecycle hooks an app exports. Any subset may be present.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HookSet: u8 {
        const START = 1 << 0;
        const STOP = 1 << 1;
        const PURGE = 1 << 2;
        const RECEIVE = 1 << 3;
    }
}

impl HookSet {
    /// Parse exported hook names, ignoring unknown ones.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        names
            .iter()
            .fold(HookSet::empty(), |set, name| match name.as_ref() {
                "start" => set | HookSet::START,
                "stop" => set | HookSet::STOP,
                "purge" => set | HookSet::PURGE,
                "receive" => set | HookSet::RECEIVE,
                _ => set,
            })
    }
}

/// Traffic an app pushes back to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum AppOutbound {
    /// Deliver a message to one client (`message.client_id`) or all of them.
    Send { app: String, message: Message },
    /// Replace the app's persisted data.
    SaveData { app: String, data: Value },
}

pub type OutboundSender = mpsc::UnboundedSender<AppOutbound>;
pub type OutboundReceiver = mpsc::UnboundedReceiver<AppOutbound>;

/// One loaded generation of an app's code.
pub trait AppModule: Send + Sync {
    fn name(&self) -> &str;

    /// Hooks the module exported when it was loaded.
    fn hooks(&self) -> HookSet;

    /// Call `start` with the app's persisted data.
    fn start(&self, data: Value) -> BoxFuture<'static, Result<(), RuntimeError>>;

    fn stop(&self) -> BoxFuture<'static, Result<(), RuntimeError>>;

    fn purge(&self) -> BoxFuture<'static, Result<(), RuntimeError>>;

    fn receive(&self, message: Message) -> BoxFuture<'static, Result<(), RuntimeError>>;

    /// Deliver a host event to the app's subscribers for `event`.
    fn emit(&self, event: &str, payload: Value) -> BoxFuture<'static, Result<(), RuntimeError>>;
}

/// Turns an installed app into a running module.
pub trait ModuleLoader: Send + Sync {
    fn load(
        &self,
        app: &AppDescriptor,
        outbound: OutboundSender,
    ) -> BoxFuture<'static, Result<Arc<dyn AppModule>, LoadError>>;
}

// =============================================================================
// Mock Modules for Testing
// =============================================================================

#[cfg(test)]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;

    /// Records every hook call as `"<app>:<hook>"`.
    pub type CallLog = Arc<Mutex<Vec<String>>>;

    pub struct MockModule {
        name: String,
        hooks: HookSet,
        calls: CallLog,
        stop_delay: Duration,
        emit_delay: Duration,
        fail_start: bool,
    }

    impl AppModule for MockModule {
        fn name(&self) -> &str {
            &self.name
        }

        fn hooks(&self) -> HookSet {
            self.hooks
        }

        fn start(&self, data: Value) -> BoxFuture<'static, Result<(), RuntimeError>> {
            self.calls.lock().push(format!("{}:start:{}", self.name, data));
            let fail = self.fail_start;
            Box::pin(async move {
                if fail {
                    Err(RuntimeError::Lua("start exploded".to_string()))
                } else {
                    Ok(())
                }
            })
        }

        fn stop(&self) -> BoxFuture<'static, Result<(), RuntimeError>> {
            self.calls.lock().push(format!("{}:stop", self.name));
            let delay = self.stop_delay;
            Box::pin(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(())
            })
        }

        fn purge(&self) -> BoxFuture<'static, Result<(), RuntimeError>> {
            self.calls.lock().push(format!("{}:purge", self.name));
            Box::pin(async move { Ok(()) })
        }

        fn receive(&self, message: Message) -> BoxFuture<'static, Result<(), RuntimeError>> {
            self.calls
                .lock()
                .push(format!("{}:receive:{}", self.name, message.kind));
            Box::pin(async move { Ok(()) })
        }

        fn emit(&self, event: &str, _payload: Value) -> BoxFuture<'static, Result<(), RuntimeError>> {
            self.calls.lock().push(format!("{}:emit:{}", self.name, event));
            let delay = self.emit_delay;
            Box::pin(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(())
            })
        }
    }

    /// Mock loader handing out [`MockModule`]s.
    pub struct MockLoader {
        pub calls: CallLog,
        pub hooks: HookSet,
        pub stop_delay: Duration,
        pub fail_load: Arc<Mutex<bool>>,
        pub fail_start: bool,
        pub loads: Arc<Mutex<usize>>,
        pub emit_delays: HashMap<String, Duration>,
    }

    impl MockLoader {
        pub fn new() -> Self {
            Self {
                calls: Arc::new(Mutex::new(Vec::new())),
                hooks: HookSet::all(),
                stop_delay: Duration::ZERO,
                fail_load: Arc::new(Mutex::new(false)),
                fail_start: false,
                loads: Arc::new(Mutex::new(0)),
                emit_delays: HashMap::new(),
            }
        }

        pub fn with_hooks(mut self, hooks: HookSet) -> Self {
            self.hooks = hooks;
            self
        }

        pub fn with_stop_delay(mut self, delay: Duration) -> Self {
            self.stop_delay = delay;
            self
        }

        /// Make `app`'s event handler hang for `delay`.
        pub fn with_slow_emit(mut self, app: &str, delay: Duration) -> Self {
            self.emit_delays.insert(app.to_string(), delay);
            self
        }

        pub fn with_failing_start(mut self) -> Self {
            self.fail_start = true;
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    impl Default for MockLoader {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ModuleLoader for MockLoader {
        fn load(
            &self,
            app: &AppDescriptor,
            _outbound: OutboundSender,
        ) -> BoxFuture<'static, Result<Arc<dyn AppModule>, LoadError>> {
            let fail = *self.fail_load.lock();
            *self.loads.lock() += 1;
            let module = MockModule {
                name: app.name.clone(),
                hooks: self.hooks,
                calls: self.calls.clone(),
                stop_delay: self.stop_delay,
                emit_delay: self
                    .emit_delays
                    .get(&app.name)
                    .copied()
                    .unwrap_or(Duration::ZERO),
                fail_start: self.fail_start,
            };
            let name = app.name.clone();

            Box::pin(async move {
                if fail {
                    return Err(LoadError::Execution {
                        app: name,
                        message: "syntax error".to_string(),
                    });
                }
                Ok(Arc::new(module) as Arc<dyn AppModule>)
            })
        }
    }
}
