//! Error types for deckhost.
//!
//! Each concern has its own `thiserror` enum. [`HostError`] wraps them all
//! for the administrative surface and serializes as `{kind, message}`.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Lua runtime errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Lua script error.
    #[error("Lua error: {0}")]
    Lua(String),

    /// Lua runtime timeout.
    #[error("Lua runtime timeout after {duration:?}")]
    Timeout { duration: Duration },

    /// The runtime thread is gone.
    #[error("Lua runtime unavailable")]
    Unavailable,
}

impl From<mlua::Error> for RuntimeError {
    fn from(e: mlua::Error) -> Self {
        RuntimeError::Lua(e.to_string())
    }
}

/// Settings file errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No config directory found.
    #[error("Config directory not found")]
    NoConfigDir,

    #[error("IO error in {path:?}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("Parse error in {path:?}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// `ConfigStore` errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store key not found: {0}")]
    NotFound(String),

    #[error("Invalid store key: {0}")]
    InvalidKey(String),

    #[error("Store IO error for '{key}': {message}")]
    Io { key: String, message: String },

    #[error("Store document '{key}' is malformed: {message}")]
    Parse { key: String, message: String },
}

/// A write or request was structurally invalid. In-memory state is untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Validation failed: {0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Installing a package failed. The registry is left untouched.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("download failed: {0}")]
    Network(String),

    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("invalid manifest: {0}")]
    Manifest(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl InstallError {
    /// Human-readable reason for the failure.
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

/// Loading an app's module failed.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("App '{0}' is not installed")]
    NotInstalled(String),

    #[error("Entry script missing: {0:?}")]
    MissingEntrypoint(PathBuf),

    #[error("App '{app}' failed to load: {message}")]
    Execution { app: String, message: String },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Button mapping errors.
#[derive(Debug, Error)]
pub enum MappingError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Profile '{0}' is protected")]
    Protected(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-message routing failures. Logged and dropped, never sent to clients.
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("Unparseable message: {0}")]
    Unparseable(String),

    #[error("Unknown app: {0}")]
    UnknownApp(String),

    #[error("App '{0}' is not running")]
    NotRunning(String),

    #[error("App '{app}' has no {hook} hook")]
    HookMissing { app: String, hook: &'static str },

    #[error("Throttled: {0}")]
    Throttled(String),

    #[error("Unknown server command: {0}")]
    UnknownCommand(String),

    #[error("Bad payload for '{command}': {message}")]
    BadPayload { command: String, message: String },

    #[error("Client not found: {0}")]
    ClientNotFound(String),
}

/// A manifest uuid is already claimed by a different live connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("uuid '{uuid}' is already in use by live client '{holder}'")]
pub struct ReconciliationAmbiguity {
    pub uuid: String,
    pub holder: String,
}

/// App lifecycle errors.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("App not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("App '{app}' {hook} hook failed: {message}")]
    Hook {
        app: String,
        hook: &'static str,
        message: String,
    },

    #[error("Purging '{app}' left errors: {}", .errors.join("; "))]
    Purge { app: String, errors: Vec<String> },
}

/// Umbrella error for administrative operations.
#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HostError {
    fn kind(&self) -> &'static str {
        match self {
            HostError::Lifecycle(e) => match e {
                LifecycleError::NotFound(_) => "AppNotFound",
                LifecycleError::Install(_) => "InstallError",
                LifecycleError::Load(_) => "LoadError",
                LifecycleError::Validation(_) => "ValidationError",
                LifecycleError::Store(_) => "StoreError",
                LifecycleError::Hook { .. } => "HookError",
                LifecycleError::Purge { .. } => "PurgeError",
            },
            HostError::Mapping(e) => match e {
                MappingError::Validation(_) => "ValidationError",
                MappingError::NotFound(_) => "NotFoundError",
                MappingError::Protected(_) => "ProtectedError",
                MappingError::AlreadyExists(_) => "AlreadyExists",
                MappingError::Store(_) => "StoreError",
            },
            HostError::Routing(_) => "RoutingError",
            HostError::Config(_) => "ConfigError",
            HostError::Store(_) => "StoreError",
            HostError::Io(_) => "IoError",
            HostError::Internal(_) => "Internal",
        }
    }
}

/// Serialized as a tagged object for structured handling by callers:
///
/// ```json
/// { "kind": "ProtectedError", "message": "Profile 'default' is protected" }
/// ```
impl Serialize for HostError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("HostError", 2)?;
        state.serialize_field("kind", self.kind())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

/// Result type alias using HostError.
pub type HostResult<T> = Result<T, HostError>;
