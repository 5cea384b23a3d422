//! Versioned handles for loaded app modules.
//!
//! Every load installs a module under a fresh generation. Unloading bumps the
//! generation and drops the module, so a handle taken before the unload
//! resolves to nothing instead of reaching stale code. Handles cannot be
//! forged: their constructor is private to this module.

use std::collections::HashMap;

// =============================================================================
// Opaque Handle
// =============================================================================

/// Opaque handle to one loaded generation of an app's module.
///
/// Can only be created by [`ModuleTable::insert`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleHandle {
    name: String,
    generation: u64,
}

impl ModuleHandle {
    fn new(name: &str, generation: u64) -> Self {
        Self {
            name: name.to_string(),
            generation,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

// =============================================================================
// Module Table
// =============================================================================

/// At most one live module per app name, each stamped with a generation.
#[derive(Debug)]
pub struct ModuleTable<T> {
    items: HashMap<String, (u64, T)>,
    generation: u64,
}

impl<T> Default for ModuleTable<T> {
    fn default() -> Self {
        Self {
            items: HashMap::new(),
            generation: 0,
        }
    }
}

impl<T> ModuleTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `item` under a new generation, returning the replaced module.
    pub fn insert(&mut self, name: &str, item: T) -> (ModuleHandle, Option<T>) {
        self.generation += 1;
        let previous = self
            .items
            .insert(name.to_string(), (self.generation, item))
            .map(|(_, old)| old);
        (ModuleHandle::new(name, self.generation), previous)
    }

    /// Resolve a handle. Stale generations resolve to `None`.
    pub fn get(&self, handle: &ModuleHandle) -> Option<&T> {
        self.items
            .get(&handle.name)
            .filter(|(generation, _)| *generation == handle.generation)
            .map(|(_, item)| item)
    }

    /// The live module for `name`, if any.
    pub fn current(&self, name: &str) -> Option<(ModuleHandle, &T)> {
        self.items
            .get(name)
            .map(|(generation, item)| (ModuleHandle::new(name, *generation), item))
    }

    /// Drop the live module for `name` and invalidate its handles.
    pub fn remove(&mut self, name: &str) -> Option<T> {
        let removed = self.items.remove(name).map(|(_, item)| item);
        if removed.is_some() {
            self.generation += 1;
        }
        removed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.items.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.items.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}
