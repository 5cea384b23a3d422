//! App runtime for deckhost.
//!
//! - [`PluginLoader`] installs packages and keeps the table of loaded modules
//! - [`PluginRegistry`] owns installed apps and drives their lifecycle
//! - [`lua`] runs app code and exposes the host API to it
//!
//! The [`ModuleLoader`] and [`PackageFetcher`] traits are the seams tests use
//! to stand in for Lua and the network.

pub mod fetch;
pub mod handle;
pub mod loader;
pub mod lua;
pub mod module;
pub mod registry;

pub use fetch::{HttpFetcher, PackageFetcher};
pub use handle::{ModuleHandle, ModuleTable};
pub use loader::{PackageSource, PluginLoader, StagedPackage, MANIFEST_FILE};
pub use lua::LuaModuleLoader;
pub use module::{
    AppModule, AppOutbound, HookSet, ModuleLoader, OutboundReceiver, OutboundSender,
};
pub use registry::{PluginRegistry, RegistryDocument, REGISTRY_KEY};
