//! Volatile in-memory storage backend
//!
//! Backs hosted deployments and tests. Embedded targets implement
//! [`StorageBackend`] over their non-volatile medium instead.

use heapless::LinearMap;

use crate::storage::{
    is_valid_storage_string, StorageBackend, StorageString, MAX_KEY_VALUE_PAIRS,
};

#[derive(Default)]
pub struct MemoryBackend {
    entries: LinearMap<StorageString, StorageString, MAX_KEY_VALUE_PAIRS>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            entries: LinearMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> StorageString {
        let Ok(key) = StorageString::try_from(key) else {
            return StorageString::new();
        };
        self.entries.get(&key).cloned().unwrap_or_default()
    }

    fn set(&mut self, key: &str, value: &str) {
        if !is_valid_storage_string(key) || !is_valid_storage_string(value) {
            return;
        }
        let Ok(key) = StorageString::try_from(key) else {
            return;
        };
        if value.is_empty() {
            self.entries.remove(&key);
            return;
        }
        let Ok(value) = StorageString::try_from(value) else {
            return;
        };
        // A full map drops the write; the caller's read-back check reports it.
        let _ = self.entries.insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let mut backend = MemoryBackend::new();
        assert_eq!(backend.get("cluster_size").as_str(), "");

        backend.set("cluster_size", "3");
        assert_eq!(backend.get("cluster_size").as_str(), "3");

        backend.set("cluster_size", "5");
        assert_eq!(backend.get("cluster_size").as_str(), "5");

        backend.set("cluster_size", "");
        assert_eq!(backend.get("cluster_size").as_str(), "");
        assert!(backend.is_empty());
    }

    #[test]
    fn test_invalid_strings_ignored() {
        let mut backend = MemoryBackend::new();
        backend.set("bad key", "1");
        assert!(backend.is_empty());
    }
}
