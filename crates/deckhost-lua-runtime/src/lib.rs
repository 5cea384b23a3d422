//! Persistent Lua runtime with thread-safe async access.
//!
//! Every loaded app gets its own `mlua::Lua` state living on a dedicated OS
//! thread. Callers reach it through a channel, so a slow or stuck app only
//! blocks its own thread.

use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use deckhost_core::RuntimeError;
use mlua::Lua;
use tokio::sync::oneshot;

type LuaFn = Box<dyn FnOnce(&Lua) -> Result<serde_json::Value, String> + Send>;

/// Request types for the Lua runtime thread.
pub enum LuaRequest {
    /// Execute arbitrary code on the Lua thread.
    WithLua {
        func: LuaFn,
        resp: oneshot::Sender<Result<serde_json::Value, String>>,
    },
    Shutdown,
}

/// Lua state owned by a dedicated OS thread.
///
/// Dropping the runtime asks the thread to exit once it finishes whatever it
/// is running.
pub struct LuaRuntime {
    name: String,
    tx: mpsc::Sender<LuaRequest>,
    _handle: JoinHandle<()>,
}

impl LuaRuntime {
    /// Spawn a runtime thread named after `name`. MUST use a std thread, NOT
    /// tokio::spawn.
    pub fn new(name: impl Into<String>, lua: Lua) -> Result<Self, RuntimeError> {
        let name = name.into();
        let (tx, rx) = mpsc::channel();
        let thread_name = format!("lua-{}", name);
        let log_name = name.clone();

        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                tracing::debug!("Lua runtime thread for '{}' started", log_name);

                while let Ok(request) = rx.recv() {
                    match request {
                        LuaRequest::WithLua { func, resp } => {
                            let result = func(&lua);
                            let _ = resp.send(result);
                        }
                        LuaRequest::Shutdown => break,
                    }
                }

                tracing::debug!("Lua runtime thread for '{}' stopped", log_name);
            })
            .map_err(|e| RuntimeError::Lua(format!("failed to spawn runtime thread: {}", e)))?;

        Ok(Self {
            name,
            tx,
            _handle: handle,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute arbitrary code on the Lua thread.
    ///
    /// The closure's result crosses the thread boundary as JSON.
    pub async fn with_lua<F, T>(&self, f: F) -> Result<T, RuntimeError>
    where
        F: FnOnce(&Lua) -> Result<T, String> + Send + 'static,
        T: serde::de::DeserializeOwned + serde::Serialize + 'static,
    {
        let (resp_tx, resp_rx) = oneshot::channel();

        let boxed_fn: LuaFn = Box::new(move |lua| {
            let result = f(lua)?;
            serde_json::to_value(result).map_err(|e| e.to_string())
        });

        self.tx
            .send(LuaRequest::WithLua {
                func: boxed_fn,
                resp: resp_tx,
            })
            .map_err(|_| RuntimeError::Unavailable)?;

        let json_result = resp_rx
            .await
            .map_err(|_| RuntimeError::Unavailable)?
            .map_err(RuntimeError::Lua)?;
        serde_json::from_value(json_result).map_err(|e| RuntimeError::Lua(e.to_string()))
    }

    /// Execute with timeout wrapper.
    ///
    /// On timeout the closure may still be running on the Lua thread; the
    /// caller only stops waiting for it.
    pub async fn with_lua_timeout<F, T>(&self, timeout: Duration, f: F) -> Result<T, RuntimeError>
    where
        F: FnOnce(&Lua) -> Result<T, String> + Send + 'static,
        T: serde::de::DeserializeOwned + serde::Serialize + 'static,
    {
        match tokio::time::timeout(timeout, self.with_lua(f)).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Timeout { duration: timeout }),
        }
    }

    /// Shutdown the Lua runtime thread.
    pub fn shutdown(&self) {
        let _ = self.tx.send(LuaRequest::Shutdown);
    }
}

impl Drop for LuaRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for LuaRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LuaRuntime").field("name", &self.name).finish()
    }
}
