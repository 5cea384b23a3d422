//! Lua implementation of the module seam.
//!
//! An app's entry script returns a table of hooks:
//!
//! ```lua
//! local app = {}
//!
//! function app.start(ctx)
//!   ctx.events.on("client_connected", function(ev) ctx.log("hello " .. ev.clientId) end)
//!   ctx.send({ type = "forecast", payload = ctx.data })
//! end
//!
//! function app.receive(msg) end
//! function app.stop() end
//! function app.purge() end
//!
//! return app
//! ```
//!
//! The `ctx` table handed to `start` carries:
//! - `ctx.app` - the app's name
//! - `ctx.data` - the app's persisted data
//! - `ctx.send(msg)` - send `{type, request?, payload?, clientId?}` to clients
//! - `ctx.save(tbl)` - replace the persisted data
//! - `ctx.log(text)` - write to the host log
//! - `ctx.events.on(name, fn)` - subscribe to host events

mod convert;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use deckhost_core::{AppDescriptor, LoadError, Message, RuntimeError};
use deckhost_lua_runtime::LuaRuntime;
use futures::future::BoxFuture;
use mlua::{Function, Lua, Result as LuaResult, Table, Value};
use serde_json::Value as Json;

use crate::module::{AppModule, AppOutbound, HookSet, ModuleLoader, OutboundSender};

pub use convert::{json_to_lua, lua_to_json, message_from_app};

const HOOK_NAMES: [&str; 4] = ["start", "stop", "purge", "receive"];
const CTX_KEY: &str = "deckhost:ctx";
const LISTENERS_KEY: &str = "deckhost:listeners";

fn hook_key(hook: &str) -> String {
    format!("deckhost:hook:{}", hook)
}

/// A Lua function kept in the state's named registry.
struct LuaFunctionRef {
    key: String,
}

impl LuaFunctionRef {
    fn store(lua: &Lua, func: Function, key: String) -> LuaResult<Self> {
        lua.set_named_registry_value(&key, func)?;
        Ok(Self { key })
    }

    fn call<A: mlua::IntoLuaMulti>(&self, lua: &Lua, args: A) -> LuaResult<()> {
        let func: Function = lua.named_registry_value(&self.key)?;
        func.call::<()>(args)
    }
}

/// Add the app directory to Lua's package.path so `require()` finds the
/// app's own modules.
fn setup_package_path(lua: &Lua, dir: &Path) -> LuaResult<()> {
    let package: Table = lua.globals().get("package")?;
    let current_path: String = package.get("path")?;

    let dir = dir.to_string_lossy();
    package.set("path", format!("{}/?.lua;{}/?/init.lua;{}", dir, dir, current_path))?;
    Ok(())
}

/// Build the `ctx` table and stash it in the registry.
fn install_context(lua: &Lua, app: &str, outbound: OutboundSender) -> LuaResult<()> {
    let ctx = lua.create_table()?;
    ctx.set("app", app)?;

    // ctx.send(msg)
    {
        let app = app.to_string();
        let outbound = outbound.clone();
        let send_fn = lua.create_function(move |lua, msg: Value| {
            let json = lua_to_json(lua, msg)?;
            let message = message_from_app(&app, json).map_err(mlua::Error::RuntimeError)?;
            if outbound
                .send(AppOutbound::Send {
                    app: app.clone(),
                    message,
                })
                .is_err()
            {
                tracing::debug!("App '{}' sent a message after host shutdown", app);
            }
            Ok(())
        })?;
        ctx.set("send", send_fn)?;
    }

    // ctx.save(tbl)
    {
        let app = app.to_string();
        let save_fn = lua.create_function(move |lua, data: Value| {
            let data = lua_to_json(lua, data)?;
            let _ = outbound.send(AppOutbound::SaveData {
                app: app.clone(),
                data,
            });
            Ok(())
        })?;
        ctx.set("save", save_fn)?;
    }

    // ctx.log(text)
    {
        let app = app.to_string();
        let log_fn = lua.create_function(move |_, text: String| {
            tracing::info!(app = %app, "{}", text);
            Ok(())
        })?;
        ctx.set("log", log_fn)?;
    }

    // ctx.events.on(name, fn)
    let listeners = lua.create_table()?;
    lua.set_named_registry_value(LISTENERS_KEY, listeners)?;

    let events = lua.create_table()?;
    let on_fn = lua.create_function(|lua, (name, func): (String, Function)| {
        let listeners: Table = lua.named_registry_value(LISTENERS_KEY)?;
        let list = match listeners.get::<Option<Table>>(name.as_str())? {
            Some(list) => list,
            None => {
                let list = lua.create_table()?;
                listeners.set(name.as_str(), list.clone())?;
                list
            }
        };
        list.push(func)
    })?;
    events.set("on", on_fn)?;
    ctx.set("events", events)?;

    lua.set_named_registry_value(CTX_KEY, ctx)
}

/// Prepare a fresh state and run the entry script. Returns exported hook
/// names.
fn init_app(
    lua: &Lua,
    app: &AppDescriptor,
    code: &str,
    outbound: OutboundSender,
) -> LuaResult<Vec<String>> {
    setup_package_path(lua, &app.path)?;
    install_context(lua, &app.name, outbound)?;

    let exports: Value = lua
        .load(code)
        .set_name(app.entrypoint().to_string_lossy().to_string())
        .eval()?;

    let table = match exports {
        Value::Table(table) => table,
        Value::Nil => return Ok(Vec::new()),
        other => {
            return Err(mlua::Error::RuntimeError(format!(
                "entry script must return a table of hooks, got {}",
                other.type_name()
            )))
        }
    };

    let mut exported = Vec::new();
    for hook in HOOK_NAMES {
        if let Some(func) = table.get::<Option<Function>>(hook)? {
            LuaFunctionRef::store(lua, func, hook_key(hook))?;
            exported.push(hook.to_string());
        }
    }
    Ok(exported)
}

// =============================================================================
// Loader
// =============================================================================

/// Loads apps by running their Lua entry script on a dedicated runtime.
pub struct LuaModuleLoader {
    timeout: Duration,
}

impl LuaModuleLoader {
    /// `timeout` bounds the entry script's top-level execution.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ModuleLoader for LuaModuleLoader {
    fn load(
        &self,
        app: &AppDescriptor,
        outbound: OutboundSender,
    ) -> BoxFuture<'static, Result<Arc<dyn AppModule>, LoadError>> {
        let app = app.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            let entry = app.entrypoint();
            let code = match tokio::fs::read_to_string(&entry).await {
                Ok(code) => code,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(LoadError::MissingEntrypoint(entry))
                }
                Err(e) => {
                    return Err(LoadError::Execution {
                        app: app.name.clone(),
                        message: e.to_string(),
                    })
                }
            };

            let runtime = LuaRuntime::new(app.name.clone(), Lua::new())?;
            let name = app.name.clone();

            let exported: Vec<String> = runtime
                .with_lua_timeout(timeout, move |lua| {
                    init_app(lua, &app, &code, outbound).map_err(|e| e.to_string())
                })
                .await
                .map_err(|e| match e {
                    RuntimeError::Lua(message) => LoadError::Execution {
                        app: name.clone(),
                        message,
                    },
                    other => LoadError::Runtime(other),
                })?;

            let hooks = HookSet::from_names(&exported);
            tracing::info!("Loaded app '{}' exporting {:?}", name, exported);

            Ok(Arc::new(LuaModule {
                name,
                hooks,
                runtime: Arc::new(runtime),
            }) as Arc<dyn AppModule>)
        })
    }
}

// =============================================================================
// Module
// =============================================================================

/// A loaded Lua app. Dropping it shuts its runtime thread down.
pub struct LuaModule {
    name: String,
    hooks: HookSet,
    runtime: Arc<LuaRuntime>,
}

impl LuaModule {
    fn call_hook(
        &self,
        hook: &'static str,
        flag: HookSet,
        arg: Option<Json>,
    ) -> BoxFuture<'static, Result<(), RuntimeError>> {
        if !self.hooks.contains(flag) {
            return Box::pin(async { Ok(()) });
        }
        let runtime = self.runtime.clone();

        Box::pin(async move {
            runtime
                .with_lua(move |lua| {
                    let func = LuaFunctionRef {
                        key: hook_key(hook),
                    };
                    let result = match arg {
                        Some(arg) => json_to_lua(lua, &arg).and_then(|v| func.call(lua, v)),
                        None => func.call(lua, ()),
                    };
                    result.map_err(|e| e.to_string())
                })
                .await
        })
    }
}

impl AppModule for LuaModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn hooks(&self) -> HookSet {
        self.hooks
    }

    fn start(&self, data: Json) -> BoxFuture<'static, Result<(), RuntimeError>> {
        if !self.hooks.contains(HookSet::START) {
            return Box::pin(async { Ok(()) });
        }
        let runtime = self.runtime.clone();

        Box::pin(async move {
            runtime
                .with_lua(move |lua| {
                    let start = || -> LuaResult<()> {
                        let ctx: Table = lua.named_registry_value(CTX_KEY)?;
                        ctx.set("data", json_to_lua(lua, &data)?)?;
                        LuaFunctionRef {
                            key: hook_key("start"),
                        }
                        .call(lua, ctx)
                    };
                    start().map_err(|e| e.to_string())
                })
                .await
        })
    }

    fn stop(&self) -> BoxFuture<'static, Result<(), RuntimeError>> {
        self.call_hook("stop", HookSet::STOP, None)
    }

    fn purge(&self) -> BoxFuture<'static, Result<(), RuntimeError>> {
        self.call_hook("purge", HookSet::PURGE, None)
    }

    fn receive(&self, message: Message) -> BoxFuture<'static, Result<(), RuntimeError>> {
        match serde_json::to_value(&message) {
            Ok(json) => self.call_hook("receive", HookSet::RECEIVE, Some(json)),
            Err(e) => Box::pin(async move { Err(RuntimeError::Lua(e.to_string())) }),
        }
    }

    fn emit(&self, event: &str, payload: Json) -> BoxFuture<'static, Result<(), RuntimeError>> {
        let runtime = self.runtime.clone();
        let event = event.to_string();
        let app = self.name.clone();

        Box::pin(async move {
            runtime
                .with_lua(move |lua| {
                    let deliver = || -> LuaResult<()> {
                        let listeners: Table = lua.named_registry_value(LISTENERS_KEY)?;
                        let Some(list) = listeners.get::<Option<Table>>(event.as_str())? else {
                            return Ok(());
                        };
                        let arg = json_to_lua(lua, &payload)?;
                        for func in list.sequence_values::<Function>() {
                            if let Err(e) = func?.call::<()>(arg.clone()) {
                                tracing::warn!("App '{}' handler for '{}' failed: {}", app, event, e);
                            }
                        }
                        Ok(())
                    };
                    deliver().map_err(|e| e.to_string())
                })
                .await
        })
    }
}
