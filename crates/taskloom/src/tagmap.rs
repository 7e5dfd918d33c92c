// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Mutex;

/// A small string-keyed map of opaque values, guarded by its own lock.
///
/// [`crate::task::Task`], [`crate::manager::TaskManager`] and
/// [`crate::depman::TaskDepManager`] each embed one of these so callers can
/// stash arbitrary bookkeeping (a name, a correlation id, a UI widget
/// handle) alongside the object without the object itself knowing the
/// value's type.
#[derive(Default)]
pub struct TagMap {
    entries: Mutex<HashMap<String, Box<dyn Any + Send>>>,
}

impl TagMap {
    /// An empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `value` under `key`, returning whatever was previously there.
    pub fn set<T: Any + Send>(&self, key: impl Into<String>, value: T) -> Option<Box<dyn Any + Send>> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), Box::new(value))
    }

    /// Removes and returns the value under `key`, if any.
    pub fn remove(&self, key: &str) -> Option<Box<dyn Any + Send>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).remove(key)
    }

    /// Returns a clone of the value under `key` if present and of type `T`.
    pub fn get<T: Any + Send + Clone>(&self, key: &str) -> Option<T> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).contains_key(key)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether the map has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_remove_round_trip() {
        let map = TagMap::new();
        assert!(map.is_empty());

        map.set("name", "widget".to_string());
        assert_eq!(map.get::<String>("name"), Some("widget".to_string()));
        assert!(map.contains("name"));

        let removed = map.remove("name");
        assert!(removed.is_some());
        assert!(!map.contains("name"));
    }

    #[test]
    fn get_wrong_type_returns_none() {
        let map = TagMap::new();
        map.set("count", 42i32);
        assert_eq!(map.get::<String>("count"), None);
        assert_eq!(map.get::<i32>("count"), Some(42));
    }
}
