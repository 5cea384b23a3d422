//! The button mapping engine.
//!
//! Owns the mapping document: profiles, the global action and key catalogs,
//! and the selected profile. The document is loaded lazily, re-validated
//! before use, and rewritten wholesale after every mutation.
//!
//! Mutations run against a clone of the cached document. The clone replaces
//! the cache only once the mutation succeeded and the result validated, so a
//! rejected write leaves the engine unchanged.

use std::path::Path;

use deckhost_core::{
    Action, ButtonMapping, ConfigStore, EventBus, EventMode, HostEvent, Key, MappingError,
    MappingStructure, Profile, ProfilePatch, ProfileSummary, StoreError, ValidationError,
    DEFAULT_PROFILE, MAPPING_VERSION,
};
use tokio::sync::Mutex;

use crate::defaults::default_structure;
use crate::validate::{validate_action, validate_key, validate_profile, validate_structure};

/// Store key of the mapping document.
pub const MAPPINGS_KEY: &str = "mappings";

pub struct ButtonMappingEngine {
    store: ConfigStore,
    events: EventBus,
    cache: Mutex<Option<MappingStructure>>,
}

/// The selected profile, or `default` if the selection is dangling.
fn active(structure: &MappingStructure) -> Option<&Profile> {
    structure
        .profiles
        .get(&structure.selected_profile)
        .or_else(|| structure.profiles.get(DEFAULT_PROFILE))
}

fn profile_mut<'a>(
    structure: &'a mut MappingStructure,
    name: &str,
) -> Result<&'a mut Profile, MappingError> {
    structure
        .profiles
        .get_mut(name)
        .ok_or_else(|| MappingError::NotFound(format!("profile '{}'", name)))
}

impl ButtonMappingEngine {
    pub fn new(store: ConfigStore, events: EventBus) -> Self {
        Self {
            store,
            events,
            cache: Mutex::new(None),
        }
    }

    // =========================================================================
    // Loading and persistence
    // =========================================================================

    async fn load_from_store(&self) -> MappingStructure {
        let structure: MappingStructure = self
            .store
            .read_or_init(MAPPINGS_KEY, default_structure)
            .await;

        match validate_structure(&structure) {
            Ok(()) => structure,
            Err(e) => {
                tracing::warn!("Stored mappings are invalid ({}), restoring defaults", e);
                let defaults = default_structure();
                self.persist(&defaults).await;
                defaults
            }
        }
    }

    async fn ensure_loaded<'a>(
        &self,
        slot: &'a mut Option<MappingStructure>,
    ) -> &'a mut MappingStructure {
        let valid = slot
            .as_ref()
            .is_some_and(|s| validate_structure(s).is_ok());
        if !valid {
            *slot = Some(self.load_from_store().await);
        }
        slot.get_or_insert_with(default_structure)
    }

    /// Persistence failures are logged; memory stays authoritative.
    async fn persist(&self, structure: &MappingStructure) {
        if let Err(e) = self.store.write(MAPPINGS_KEY, structure).await {
            tracing::error!("Failed to save mappings: {}", e);
        }
    }

    async fn read<R>(&self, f: impl FnOnce(&MappingStructure) -> R) -> R {
        let mut guard = self.cache.lock().await;
        let structure = self.ensure_loaded(&mut guard).await;
        f(structure)
    }

    async fn mutate<R>(
        &self,
        f: impl FnOnce(&mut MappingStructure) -> Result<R, MappingError>,
    ) -> Result<R, MappingError> {
        let mut guard = self.cache.lock().await;
        let current = self.ensure_loaded(&mut guard).await;

        let mut next = current.clone();
        let result = f(&mut next)?;
        validate_structure(&next)?;

        self.persist(&next).await;
        *current = next;
        drop(guard);

        self.events.publish(HostEvent::MappingChanged);
        Ok(result)
    }

    /// A copy of the whole document.
    pub async fn snapshot(&self) -> MappingStructure {
        self.read(|s| s.clone()).await
    }

    // =========================================================================
    // Buttons
    // =========================================================================

    /// Bind `action` to `key`/`mode` in `profile` (default: `default`).
    ///
    /// Keys do not have to be in the key catalog.
    pub async fn add_button(
        &self,
        action: Action,
        key: &str,
        mode: EventMode,
        profile: Option<&str>,
    ) -> Result<(), MappingError> {
        validate_action(&action)?;
        if key.trim().is_empty() {
            return Err(ValidationError::new("key id is empty").into());
        }
        let profile = profile.unwrap_or(DEFAULT_PROFILE);

        self.mutate(|s| {
            let target = s.profiles.get_mut(profile).ok_or_else(|| {
                ValidationError::new(format!("profile '{}' does not exist", profile))
            })?;
            target
                .mapping
                .entry(key.to_string())
                .or_default()
                .insert(mode, action);
            Ok(())
        })
        .await?;

        tracing::debug!("Bound {}/{:?} in profile '{}'", key, mode, profile);
        Ok(())
    }

    /// Remove one binding, or every binding of `key` when `mode` is `None`.
    pub async fn remove_button(
        &self,
        key: &str,
        mode: Option<EventMode>,
        profile: Option<&str>,
    ) -> Result<(), MappingError> {
        let profile = profile.unwrap_or(DEFAULT_PROFILE);

        self.mutate(|s| {
            let target = profile_mut(s, profile)?;
            let not_found = || MappingError::NotFound(format!("key '{}' in '{}'", key, profile));

            match mode {
                None => {
                    target.mapping.remove(key).ok_or_else(not_found)?;
                }
                Some(mode) => {
                    let modes = target.mapping.get_mut(key).ok_or_else(not_found)?;
                    modes.remove(&mode).ok_or_else(|| {
                        MappingError::NotFound(format!("mode {:?} on key '{}'", mode, key))
                    })?;
                    if modes.is_empty() {
                        target.mapping.remove(key);
                    }
                }
            }
            Ok(())
        })
        .await
    }

    /// The selected profile's mapping, falling back to `default`.
    pub async fn get_mapping(&self) -> ButtonMapping {
        self.read(|s| active(s).map(|p| p.mapping.clone()).unwrap_or_default())
            .await
    }

    /// The action bound to `key`/`mode` in the active mapping.
    pub async fn resolve(&self, key: &str, mode: EventMode) -> Option<Action> {
        self.read(|s| {
            active(s)
                .and_then(|p| p.mapping.get(key))
                .and_then(|modes| modes.get(&mode))
                .cloned()
        })
        .await
    }

    // =========================================================================
    // Profiles
    // =========================================================================

    /// Create `name` as an independent copy of `base` (default: `default`).
    pub async fn add_profile(&self, name: &str, base: Option<&str>) -> Result<Profile, MappingError> {
        if name.trim().is_empty() {
            return Err(ValidationError::new("profile name is empty").into());
        }
        let base = base.unwrap_or(DEFAULT_PROFILE);

        let profile = self
            .mutate(|s| {
                if s.profiles.contains_key(name) {
                    return Err(MappingError::AlreadyExists(format!("profile '{}'", name)));
                }
                let mut profile = s
                    .profiles
                    .get(base)
                    .ok_or_else(|| MappingError::NotFound(format!("base profile '{}'", base)))?
                    .clone();
                profile.id = name.to_string();
                profile.name = name.to_string();
                profile.extends = Some(base.to_string());
                profile.version = MAPPING_VERSION.to_string();

                s.profiles.insert(name.to_string(), profile.clone());
                Ok(profile)
            })
            .await?;

        tracing::info!("Added profile '{}' from '{}'", name, base);
        Ok(profile)
    }

    /// Remove a profile. `default` is protected. A removed selection reverts
    /// to `default`.
    pub async fn remove_profile(&self, name: &str) -> Result<(), MappingError> {
        if name == DEFAULT_PROFILE {
            return Err(MappingError::Protected(name.to_string()));
        }

        self.mutate(|s| {
            s.profiles
                .remove(name)
                .ok_or_else(|| MappingError::NotFound(format!("profile '{}'", name)))?;
            if s.selected_profile == name {
                s.selected_profile = DEFAULT_PROFILE.to_string();
            }
            Ok(())
        })
        .await?;

        tracing::info!("Removed profile '{}'", name);
        Ok(())
    }

    /// Apply `patch` to a profile. Mapping entries merge key by key and mode
    /// by mode.
    pub async fn update_profile(
        &self,
        name: &str,
        patch: ProfilePatch,
    ) -> Result<Profile, MappingError> {
        self.mutate(|s| {
            let target = profile_mut(s, name)?;
            if let Some(display) = patch.name {
                target.name = display;
            }
            if let Some(description) = patch.description {
                target.description = Some(description);
            }
            if let Some(app) = patch.trigger_app {
                target.trigger_app = Some(app);
            }
            if let Some(mapping) = patch.mapping {
                for (key, modes) in mapping {
                    target.mapping.entry(key).or_default().extend(modes);
                }
            }
            Ok(target.clone())
        })
        .await
    }

    pub async fn get_profiles(&self) -> Vec<ProfileSummary> {
        self.read(|s| s.profiles.values().map(Profile::summary).collect())
            .await
    }

    pub async fn get_profile(&self, name: &str) -> Option<Profile> {
        self.read(|s| s.profiles.get(name).cloned()).await
    }

    /// The effective selection: the stored one if it still exists, else
    /// `default`.
    pub async fn selected_profile(&self) -> String {
        self.read(|s| {
            active(s)
                .map(|p| p.id.clone())
                .unwrap_or_else(|| DEFAULT_PROFILE.to_string())
        })
        .await
    }

    /// The selected profile in full.
    pub async fn active_profile(&self) -> Option<Profile> {
        self.read(|s| active(s).cloned()).await
    }

    pub async fn select_profile(&self, name: &str) -> Result<(), MappingError> {
        self.mutate(|s| {
            if !s.profiles.contains_key(name) {
                return Err(MappingError::NotFound(format!("profile '{}'", name)));
            }
            s.selected_profile = name.to_string();
            Ok(())
        })
        .await?;

        tracing::info!("Selected profile '{}'", name);
        Ok(())
    }

    /// Write one profile to `path` as JSON.
    pub async fn export_profile(&self, name: &str, path: &Path) -> Result<(), MappingError> {
        let profile = self
            .get_profile(name)
            .await
            .ok_or_else(|| MappingError::NotFound(format!("profile '{}'", name)))?;

        let bytes = serde_json::to_vec_pretty(&profile).map_err(|e| StoreError::Parse {
            key: path.display().to_string(),
            message: e.to_string(),
        })?;
        tokio::fs::write(path, bytes).await.map_err(|e| StoreError::Io {
            key: path.display().to_string(),
            message: e.to_string(),
        })?;
        Ok(())
    }

    /// Load a profile from `path`, optionally renaming it. An existing profile
    /// with the same id is replaced.
    pub async fn import_profile(
        &self,
        path: &Path,
        name: Option<&str>,
    ) -> Result<Profile, MappingError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| StoreError::Io {
            key: path.display().to_string(),
            message: e.to_string(),
        })?;
        let mut profile: Profile = serde_json::from_slice(&bytes).map_err(|e| StoreError::Parse {
            key: path.display().to_string(),
            message: e.to_string(),
        })?;
        if let Some(name) = name {
            profile.id = name.to_string();
            profile.name = name.to_string();
        }
        validate_profile(&profile)?;

        self.mutate(|s| {
            s.profiles.insert(profile.id.clone(), profile.clone());
            Ok(profile)
        })
        .await
    }

    // =========================================================================
    // Action catalog
    // =========================================================================

    /// Insert an action, replacing any catalog entry with the same id.
    pub async fn add_action(&self, action: Action) -> Result<(), MappingError> {
        validate_action(&action)?;
        self.mutate(|s| {
            match s.actions.iter_mut().find(|a| a.id == action.id) {
                Some(existing) => *existing = action,
                None => s.actions.push(action),
            }
            Ok(())
        })
        .await
    }

    /// Delete an action from the catalog and disable its bound copies.
    pub async fn remove_action(&self, id: &str) -> Result<(), MappingError> {
        self.mutate(|s| {
            let before = s.actions.len();
            s.actions.retain(|a| a.id != id);
            if s.actions.len() == before {
                return Err(MappingError::NotFound(format!("action '{}'", id)));
            }
            for profile in s.profiles.values_mut() {
                for bound in profile.bound_actions_mut().filter(|a| a.id == id) {
                    bound.enabled = false;
                }
            }
            Ok(())
        })
        .await
    }

    pub async fn get_action(&self, id: &str) -> Option<Action> {
        self.read(|s| s.actions.iter().find(|a| a.id == id).cloned())
            .await
    }

    pub async fn get_actions(&self) -> Vec<Action> {
        self.read(|s| s.actions.clone()).await
    }

    pub async fn action_exists(&self, id: &str) -> bool {
        self.read(|s| s.actions.iter().any(|a| a.id == id)).await
    }

    /// Set the icon of an action in the catalog and on every bound copy.
    pub async fn update_icon(&self, action_id: &str, icon: Option<String>) -> Result<(), MappingError> {
        self.mutate(|s| {
            let mut found = false;
            for action in s.actions.iter_mut().filter(|a| a.id == action_id) {
                action.icon = icon.clone();
                found = true;
            }
            for profile in s.profiles.values_mut() {
                for bound in profile.bound_actions_mut().filter(|a| a.id == action_id) {
                    bound.icon = icon.clone();
                    found = true;
                }
            }
            if !found {
                return Err(MappingError::NotFound(format!("action '{}'", action_id)));
            }
            Ok(())
        })
        .await
    }

    // =========================================================================
    // Key catalog
    // =========================================================================

    /// Insert a key, replacing any entry with the same id.
    pub async fn add_key(&self, key: Key) -> Result<(), MappingError> {
        validate_key(&key)?;
        self.mutate(|s| {
            match s.keys.iter_mut().find(|k| k.id == key.id) {
                Some(existing) => *existing = key,
                None => s.keys.push(key),
            }
            Ok(())
        })
        .await
    }

    pub async fn remove_key(&self, id: &str) -> Result<(), MappingError> {
        self.mutate(|s| {
            let before = s.keys.len();
            s.keys.retain(|k| k.id != id);
            if s.keys.len() == before {
                return Err(MappingError::NotFound(format!("key '{}'", id)));
            }
            Ok(())
        })
        .await
    }

    pub async fn get_keys(&self) -> Vec<Key> {
        self.read(|s| s.keys.clone()).await
    }

    pub async fn key_exists(&self, id: &str) -> bool {
        self.read(|s| s.keys.iter().any(|k| k.id == id)).await
    }

    // =========================================================================
    // Sources
    // =========================================================================

    /// Disable every bound action from `source` and delete its catalog
    /// actions and keys. Bound records stay visible, disabled.
    pub async fn remove_source(&self, source: &str) -> Result<(), MappingError> {
        self.mutate(|s| {
            for profile in s.profiles.values_mut() {
                for bound in profile.bound_actions_mut().filter(|a| a.source == source) {
                    bound.enabled = false;
                }
            }
            s.actions.retain(|a| a.source != source);
            s.keys.retain(|k| k.source != source);
            Ok(())
        })
        .await?;

        tracing::info!("Disabled mappings from source '{}'", source);
        Ok(())
    }

    /// Re-enable bound actions, catalog actions and keys from `source`.
    ///
    /// Catalog entries deleted by `remove_source` are not restored; the app
    /// has to register them again.
    pub async fn add_source(&self, source: &str) -> Result<(), MappingError> {
        self.mutate(|s| {
            for profile in s.profiles.values_mut() {
                for bound in profile.bound_actions_mut().filter(|a| a.source == source) {
                    bound.enabled = true;
                }
            }
            for action in s.actions.iter_mut().filter(|a| a.source == source) {
                action.enabled = true;
            }
            for key in s.keys.iter_mut().filter(|k| k.source == source) {
                key.enabled = true;
            }
            Ok(())
        })
        .await?;

        tracing::info!("Enabled mappings from source '{}'", source);
        Ok(())
    }

    /// Delete everything from `source`: bound actions in every profile and
    /// catalog entries. Used when an app is purged.
    pub async fn purge_source(&self, source: &str) -> Result<(), MappingError> {
        self.mutate(|s| {
            for profile in s.profiles.values_mut() {
                for modes in profile.mapping.values_mut() {
                    modes.retain(|_, bound| bound.source != source);
                }
                profile.mapping.retain(|_, modes| !modes.is_empty());
            }
            s.actions.retain(|a| a.source != source);
            s.keys.retain(|k| k.source != source);
            Ok(())
        })
        .await?;

        tracing::info!("Purged mappings from source '{}'", source);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deckhost_core::SERVER_SOURCE;
    use tempfile::TempDir;

    fn engine() -> (TempDir, ButtonMappingEngine) {
        let dir = tempfile::tempdir().unwrap();
        let engine = ButtonMappingEngine::new(ConfigStore::new(dir.path()), EventBus::new());
        (dir, engine)
    }

    /// An engine with a `weather` app that registered one action and one
    /// key, bound in both `default` and `car`.
    async fn engine_with_weather() -> (TempDir, ButtonMappingEngine) {
        let (dir, engine) = engine();
        engine.add_action(Action::new("forecast", "weather")).await.unwrap();
        engine
            .add_key(Key::new("WeatherKnob", "weather", vec![EventMode::ScrollUp]))
            .await
            .unwrap();
        engine
            .add_button(Action::new("forecast", "weather"), "Pad1", EventMode::PressLong, None)
            .await
            .unwrap();
        engine.add_profile("car", None).await.unwrap();
        (dir, engine)
    }

    #[tokio::test]
    async fn test_add_button_then_get_mapping() {
        let (_dir, engine) = engine();

        engine
            .add_button(
                Action::new("skip", SERVER_SOURCE),
                "Tray4",
                EventMode::PressShort,
                Some(DEFAULT_PROFILE),
            )
            .await
            .unwrap();

        let mapping = engine.get_mapping().await;
        assert_eq!(mapping["Tray4"][&EventMode::PressShort].id, "skip");
    }

    #[tokio::test]
    async fn test_add_button_rejects_invalid_input() {
        let (_dir, engine) = engine();

        let missing_source = engine
            .add_button(Action::new("skip", ""), "Tray4", EventMode::PressShort, None)
            .await;
        assert!(matches!(missing_source, Err(MappingError::Validation(_))));

        let missing_profile = engine
            .add_button(
                Action::new("skip", SERVER_SOURCE),
                "Tray4",
                EventMode::PressShort,
                Some("nope"),
            )
            .await;
        assert!(matches!(missing_profile, Err(MappingError::Validation(_))));
        assert!(!engine.get_mapping().await.contains_key("Tray4"));
    }

    #[tokio::test]
    async fn test_remove_button() {
        let (_dir, engine) = engine();

        engine
            .remove_button("Scroll", Some(EventMode::ScrollUp), None)
            .await
            .unwrap();
        let mapping = engine.get_mapping().await;
        assert!(!mapping["Scroll"].contains_key(&EventMode::ScrollUp));
        assert!(mapping["Scroll"].contains_key(&EventMode::ScrollDown));

        engine.remove_button("Scroll", None, None).await.unwrap();
        assert!(!engine.get_mapping().await.contains_key("Scroll"));

        let again = engine.remove_button("Scroll", None, None).await;
        assert!(matches!(again, Err(MappingError::NotFound(_))));

        let missing_mode = engine
            .remove_button("Enter", Some(EventMode::SwipeUp), None)
            .await;
        assert!(matches!(missing_mode, Err(MappingError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_add_profile_is_a_deep_clone() {
        let (_dir, engine) = engine();

        engine.add_profile("car", Some(DEFAULT_PROFILE)).await.unwrap();
        let before = engine.get_profile("car").await.unwrap().mapping;

        engine
            .add_button(Action::new("skip", SERVER_SOURCE), "Pad1", EventMode::KeyDown, None)
            .await
            .unwrap();
        engine
            .remove_button("Scroll", None, Some(DEFAULT_PROFILE))
            .await
            .unwrap();

        let car = engine.get_profile("car").await.unwrap();
        assert_eq!(car.mapping, before);
        assert_eq!(car.extends.as_deref(), Some(DEFAULT_PROFILE));
        assert_ne!(engine.get_profile(DEFAULT_PROFILE).await.unwrap().mapping, before);
    }

    #[tokio::test]
    async fn test_add_profile_conflicts() {
        let (_dir, engine) = engine();

        engine.add_profile("car", None).await.unwrap();
        assert!(matches!(
            engine.add_profile("car", None).await,
            Err(MappingError::AlreadyExists(_))
        ));
        assert!(matches!(
            engine.add_profile("desk", Some("missing")).await,
            Err(MappingError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_default_profile_is_protected() {
        let (_dir, engine) = engine();
        engine.add_profile("car", None).await.unwrap();
        let before = engine.get_profiles().await;

        let result = engine.remove_profile(DEFAULT_PROFILE).await;
        assert!(matches!(result, Err(MappingError::Protected(_))));
        assert_eq!(engine.get_profiles().await, before);
    }

    #[tokio::test]
    async fn test_removing_selected_profile_reverts_to_default() {
        let (_dir, engine) = engine();
        engine.add_profile("car", None).await.unwrap();
        engine.select_profile("car").await.unwrap();
        assert_eq!(engine.selected_profile().await, "car");

        engine.remove_profile("car").await.unwrap();
        assert_eq!(engine.selected_profile().await, DEFAULT_PROFILE);
    }

    #[tokio::test]
    async fn test_select_unknown_profile_fails() {
        let (_dir, engine) = engine();
        assert!(matches!(
            engine.select_profile("ghost").await,
            Err(MappingError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_get_mapping_follows_selection() {
        let (_dir, engine) = engine();
        engine.add_profile("car", None).await.unwrap();
        engine
            .add_button(Action::new("skip", SERVER_SOURCE), "Tray1", EventMode::KeyDown, Some("car"))
            .await
            .unwrap();

        assert!(!engine.get_mapping().await.contains_key("Tray1"));
        engine.select_profile("car").await.unwrap();
        assert!(engine.get_mapping().await.contains_key("Tray1"));
        assert_eq!(
            engine.resolve("Tray1", EventMode::KeyDown).await.map(|a| a.id),
            Some("skip".to_string())
        );
    }

    #[tokio::test]
    async fn test_remove_source_disables_bound_and_deletes_catalog() {
        let (_dir, engine) = engine_with_weather().await;

        engine.remove_source("weather").await.unwrap();

        for name in [DEFAULT_PROFILE, "car"] {
            let profile = engine.get_profile(name).await.unwrap();
            let bound = &profile.mapping["Pad1"][&EventMode::PressLong];
            assert_eq!(bound.source, "weather");
            assert!(!bound.enabled);
        }
        assert!(engine.get_actions().await.iter().all(|a| a.source != "weather"));
        assert!(engine.get_keys().await.iter().all(|k| k.source != "weather"));
    }

    #[tokio::test]
    async fn test_add_source_does_not_restore_deleted_catalog_entries() {
        let (_dir, engine) = engine_with_weather().await;

        engine.remove_source("weather").await.unwrap();
        engine.add_source("weather").await.unwrap();

        let bound = engine
            .resolve("Pad1", EventMode::PressLong)
            .await
            .unwrap();
        assert!(bound.enabled);
        assert!(!engine.action_exists("forecast").await);
        assert!(!engine.key_exists("WeatherKnob").await);
    }

    #[tokio::test]
    async fn test_purge_source_deletes_bindings() {
        let (_dir, engine) = engine_with_weather().await;

        engine.purge_source("weather").await.unwrap();

        for name in [DEFAULT_PROFILE, "car"] {
            let profile = engine.get_profile(name).await.unwrap();
            assert!(!profile.mapping["Pad1"].contains_key(&EventMode::PressLong));
            assert!(profile.mapping["Pad1"].contains_key(&EventMode::KeyDown));
        }
        assert!(!engine.action_exists("forecast").await);
    }

    #[tokio::test]
    async fn test_remove_action_disables_bound_copies() {
        let (_dir, engine) = engine();

        engine.remove_action("volUp").await.unwrap();

        assert!(engine.get_action("volUp").await.is_none());
        let bound = engine.resolve("Pad1", EventMode::KeyDown).await.unwrap();
        assert_eq!(bound.id, "volUp");
        assert!(!bound.enabled);

        assert!(matches!(
            engine.remove_action("volUp").await,
            Err(MappingError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_add_action_replaces_by_id() {
        let (_dir, engine) = engine();
        let before = engine.get_actions().await.len();

        engine
            .add_action(Action::new("skip", SERVER_SOURCE).with_name("Next"))
            .await
            .unwrap();

        assert_eq!(engine.get_actions().await.len(), before);
        assert_eq!(
            engine.get_action("skip").await.unwrap().name.as_deref(),
            Some("Next")
        );
    }

    #[tokio::test]
    async fn test_key_catalog() {
        let (_dir, engine) = engine();

        engine
            .add_key(Key::new("Tray4", "spotify", vec![EventMode::PressShort]))
            .await
            .unwrap();
        assert!(engine.key_exists("Tray4").await);

        engine.remove_key("Tray4").await.unwrap();
        assert!(!engine.key_exists("Tray4").await);
        assert!(matches!(
            engine.remove_key("Tray4").await,
            Err(MappingError::NotFound(_))
        ));
        assert!(matches!(
            engine.add_key(Key::new("", "spotify", vec![])).await,
            Err(MappingError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_update_icon_reaches_bound_copies() {
        let (_dir, engine) = engine();

        engine
            .update_icon("play", Some("pause".to_string()))
            .await
            .unwrap();

        assert_eq!(engine.get_action("play").await.unwrap().icon.as_deref(), Some("pause"));
        let bound = engine.resolve("Enter", EventMode::KeyDown).await.unwrap();
        assert_eq!(bound.icon.as_deref(), Some("pause"));

        assert!(engine.update_icon("nope", None).await.is_err());
    }

    #[tokio::test]
    async fn test_update_profile_merges_mapping() {
        let (_dir, engine) = engine();
        engine.add_profile("car", None).await.unwrap();

        let mut mapping = ButtonMapping::new();
        mapping
            .entry("Scroll".to_string())
            .or_default()
            .insert(EventMode::ScrollUp, Action::new("skip", SERVER_SOURCE));

        let updated = engine
            .update_profile(
                "car",
                ProfilePatch {
                    description: Some("driving".to_string()),
                    mapping: Some(mapping),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.description.as_deref(), Some("driving"));
        assert_eq!(updated.mapping["Scroll"][&EventMode::ScrollUp].id, "skip");
        assert_eq!(updated.mapping["Scroll"][&EventMode::ScrollDown].id, "volDown");
    }

    #[tokio::test]
    async fn test_mappings_persist_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());

        let first = ButtonMappingEngine::new(store.clone(), EventBus::new());
        first.add_profile("car", None).await.unwrap();
        first.select_profile("car").await.unwrap();

        let second = ButtonMappingEngine::new(store, EventBus::new());
        assert_eq!(second.selected_profile().await, "car");
    }

    #[tokio::test]
    async fn test_version_mismatch_restores_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());

        let mut stale = default_structure();
        stale.version = "0.5.0".to_string();
        stale.profiles.insert("old".to_string(), Profile::new("old"));
        store.write(MAPPINGS_KEY, &stale).await.unwrap();

        let engine = ButtonMappingEngine::new(store.clone(), EventBus::new());
        assert!(engine.get_profile("old").await.is_none());

        let on_disk: MappingStructure = store.read(MAPPINGS_KEY).await.unwrap();
        assert_eq!(on_disk, default_structure());
    }

    #[tokio::test]
    async fn test_export_import_profile() {
        let (dir, engine) = engine();
        engine.add_profile("car", None).await.unwrap();
        let path = dir.path().join("car.json");

        engine.export_profile("car", &path).await.unwrap();
        let imported = engine.import_profile(&path, Some("car-copy")).await.unwrap();

        assert_eq!(imported.id, "car-copy");
        assert_eq!(
            engine.get_profile("car-copy").await.unwrap().mapping,
            engine.get_profile("car").await.unwrap().mapping
        );
    }

    #[tokio::test]
    async fn test_mutations_publish_events() {
        let dir = tempfile::tempdir().unwrap();
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let engine = ButtonMappingEngine::new(ConfigStore::new(dir.path()), events);

        engine.add_profile("car", None).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), HostEvent::MappingChanged);

        let _ = engine.remove_profile(DEFAULT_PROFILE).await;
        assert!(rx.try_recv().is_err());
    }
}
