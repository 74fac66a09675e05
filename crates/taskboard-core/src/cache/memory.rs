use std::collections::HashMap;

use parking_lot::Mutex;

use super::{PersistentCache, RawEntry};
use crate::error::SyncError;

/// Process-local cache. Contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, RawEntry>>,
}

impl MemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl PersistentCache for MemoryCache {
    fn get_raw(&self, key: &str) -> Result<Option<RawEntry>, SyncError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set_raw(&self, key: &str, entry: RawEntry) -> Result<(), SyncError> {
        self.entries.lock().insert(key.to_string(), entry);
        Ok(())
    }

    fn evict(&self, key: &str) -> Result<bool, SyncError> {
        Ok(self.entries.lock().remove(key).is_some())
    }

    fn keys(&self) -> Result<Vec<String>, SyncError> {
        let mut keys: Vec<String> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}
