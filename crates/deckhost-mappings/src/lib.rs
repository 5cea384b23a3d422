//! Profile-based button mapping for deckhost.
//!
//! [`ButtonMappingEngine`] turns `(key, mode)` input events into [`Action`]s
//! through the selected profile, and keeps the action and key catalogs in
//! step with installed apps.
//!
//! [`Action`]: deckhost_core::Action

pub mod defaults;
mod engine;
pub mod validate;

pub use engine::{ButtonMappingEngine, MAPPINGS_KEY};
