//! Core types for the deckhost companion host.
//!
//! This crate contains the shared pieces used across all deckhost crates:
//! - App descriptors and manifests
//! - Clients and the wire message format
//! - Mapping types (actions, keys, profiles)
//! - Settings and well-known paths
//! - The JSON `ConfigStore`
//! - The host `EventBus`
//! - Error types

mod app;
mod client;
mod config;
mod error;
mod events;
mod mapping;
mod message;
mod store;

pub use app::{AppDescriptor, AppManifest, DEFAULT_ENTRYPOINT};
pub use client::{Client, ClientManifest};
pub use config::{config_dir, settings_path, HostSettings, MissingTargetPolicy};
pub use error::{
    ConfigError, HostError, HostResult, InstallError, LifecycleError, LoadError, MappingError,
    ReconciliationAmbiguity, RoutingError, RuntimeError, StoreError, ValidationError,
};
pub use events::{EventBus, HostEvent};
pub use mapping::{
    Action, ButtonMapping, EventMode, Key, MappingStructure, Profile, ProfilePatch,
    ProfileSummary, DEFAULT_PROFILE, MAPPING_VERSION, SERVER_SOURCE,
};
pub use message::{Message, SERVER_APP};
pub use store::ConfigStore;
