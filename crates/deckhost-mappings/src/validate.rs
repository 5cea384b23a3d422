//! Structural validation of mapping documents.

use deckhost_core::{
    Action, Key, MappingStructure, Profile, ValidationError, DEFAULT_PROFILE, MAPPING_VERSION,
};

pub fn validate_action(action: &Action) -> Result<(), ValidationError> {
    if action.id.trim().is_empty() {
        return Err(ValidationError::new("action is missing an id"));
    }
    if action.source.trim().is_empty() {
        return Err(ValidationError::new(format!(
            "action '{}' is missing a source",
            action.id
        )));
    }
    Ok(())
}

pub fn validate_key(key: &Key) -> Result<(), ValidationError> {
    if key.id.trim().is_empty() {
        return Err(ValidationError::new("key is missing an id"));
    }
    if key.source.trim().is_empty() {
        return Err(ValidationError::new(format!(
            "key '{}' is missing a source",
            key.id
        )));
    }
    Ok(())
}

pub fn validate_profile(profile: &Profile) -> Result<(), ValidationError> {
    if profile.id.trim().is_empty() {
        return Err(ValidationError::new("profile is missing an id"));
    }
    for (key, modes) in &profile.mapping {
        if key.trim().is_empty() {
            return Err(ValidationError::new(format!(
                "profile '{}' binds an empty key id",
                profile.id
            )));
        }
        for action in modes.values() {
            validate_action(action).map_err(|e| {
                ValidationError::new(format!("profile '{}', key '{}': {}", profile.id, key, e.0))
            })?;
        }
    }
    Ok(())
}

/// Checks a whole document. An unknown `selected_profile` is not an error;
/// readers fall back to `default`.
pub fn validate_structure(structure: &MappingStructure) -> Result<(), ValidationError> {
    if structure.version != MAPPING_VERSION {
        return Err(ValidationError::new(format!(
            "mapping version '{}' does not match '{}'",
            structure.version, MAPPING_VERSION
        )));
    }
    if !structure.profiles.contains_key(DEFAULT_PROFILE) {
        return Err(ValidationError::new("mapping has no default profile"));
    }
    for (id, profile) in &structure.profiles {
        if id != &profile.id {
            return Err(ValidationError::new(format!(
                "profile stored under '{}' has id '{}'",
                id, profile.id
            )));
        }
        validate_profile(profile)?;
    }
    for action in &structure.actions {
        validate_action(action)?;
    }
    for key in &structure.keys {
        validate_key(key)?;
    }
    Ok(())
}
