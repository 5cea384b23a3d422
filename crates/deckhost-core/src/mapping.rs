//! Button mapping types.
//!
//! A profile maps a key id and an [`EventMode`] to a bound [`Action`]. Bound
//! actions are copies: the global catalog can change without touching them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The protected fallback profile.
pub const DEFAULT_PROFILE: &str = "default";

/// Source used by actions and keys the host itself provides.
pub const SERVER_SOURCE: &str = "server";

/// Version stamped on the mapping document. A stored document with any other
/// version is replaced by the built-in defaults.
pub const MAPPING_VERSION: &str = "0.9.0";

/// How a key was actuated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventMode {
    KeyUp,
    KeyDown,
    ScrollUp,
    ScrollDown,
    ScrollLeft,
    ScrollRight,
    SwipeUp,
    SwipeDown,
    SwipeLeft,
    SwipeRight,
    PressShort,
    PressLong,
}

fn enabled_by_default() -> bool {
    true
}

/// An operation a key can trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub id: String,

    /// App name, or `server`.
    pub source: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub value_options: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

impl Action {
    pub fn new(id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            name: None,
            description: None,
            value: None,
            value_options: Vec::new(),
            icon: None,
            version: None,
            enabled: true,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }
}

/// A physical or virtual input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub id: String,
    pub source: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub modes: Vec<EventMode>,

    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

impl Key {
    pub fn new(id: impl Into<String>, source: impl Into<String>, modes: Vec<EventMode>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            description: None,
            modes,
            enabled: true,
        }
    }
}

/// Key id → mode → bound action.
pub type ButtonMapping = BTreeMap<String, BTreeMap<EventMode, Action>>;

/// A named, complete mapping table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// App whose activation should select this profile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_app: Option<String>,

    /// Profile this one was cloned from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,

    #[serde(default)]
    pub mapping: ButtonMapping,
}

impl Profile {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            version: MAPPING_VERSION.to_string(),
            description: None,
            trigger_app: None,
            extends: None,
            mapping: ButtonMapping::new(),
        }
    }

    pub fn summary(&self) -> ProfileSummary {
        ProfileSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
            description: self.description.clone(),
            trigger_app: self.trigger_app.clone(),
        }
    }

    /// Every bound action, mutably.
    pub fn bound_actions_mut(&mut self) -> impl Iterator<Item = &mut Action> {
        self.mapping.values_mut().flat_map(|modes| modes.values_mut())
    }
}

/// A profile without its mapping table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub id: String,
    pub name: String,
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_app: Option<String>,
}

/// Partial update applied by `update_profile`. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilePatch {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub trigger_app: Option<String>,

    /// Bindings merged over the existing mapping, key by key and mode by mode.
    #[serde(default)]
    pub mapping: Option<ButtonMapping>,
}

/// The whole persisted mapping document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingStructure {
    pub version: String,
    pub selected_profile: String,
    pub profiles: BTreeMap<String, Profile>,
    pub actions: Vec<Action>,
    pub keys: Vec<Key>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_enabled_by_default() {
        let action: Action = serde_json::from_value(json!({"id": "skip", "source": "server"})).unwrap();
        assert!(action.enabled);
        assert_eq!(action, Action::new("skip", "server"));
    }

    #[test]
    fn test_mapping_uses_mode_names_as_keys() {
        let mut profile = Profile::new("default");
        profile
            .mapping
            .entry("Tray4".to_string())
            .or_default()
            .insert(EventMode::PressShort, Action::new("skip", "server"));

        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json["mapping"]["Tray4"]["PressShort"]["id"], "skip");

        let back: Profile = serde_json::from_value(json).unwrap();
        assert_eq!(back, profile);
    }

    #[test]
    fn test_bound_actions_mut_visits_every_mode() {
        let mut profile = Profile::new("p");
        let key = profile.mapping.entry("Scroll".to_string()).or_default();
        key.insert(EventMode::ScrollUp, Action::new("volUp", "server"));
        key.insert(EventMode::ScrollDown, Action::new("volDown", "server"));

        for action in profile.bound_actions_mut() {
            action.enabled = false;
        }
        assert!(profile.mapping["Scroll"].values().all(|a| !a.enabled));
    }
}
