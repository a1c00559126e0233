use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mwca_core::error::{CaError, Result};

use crate::application::ports::{Versioned, VersionedStore};

/// 进程内存储：DashMap 分片锁保证单键写入的原子性
pub struct MemoryStore<V> {
    entries: DashMap<String, Versioned<V>>,
}

impl<V> MemoryStore<V> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V> Default for MemoryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

fn conflict(key: &str) -> CaError {
    CaError::Conflict {
        key: key.to_string(),
    }
}

#[async_trait]
impl<V> VersionedStore<V> for MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<Versioned<V>>> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    async fn create(&self, key: &str, value: V) -> Result<u64> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(_) => Err(conflict(key)),
            Entry::Vacant(slot) => {
                slot.insert(Versioned { value, revision: 1 });
                Ok(1)
            }
        }
    }

    async fn update(&self, key: &str, value: V, expected_revision: u64) -> Result<u64> {
        let mut entry = self.entries.get_mut(key).ok_or_else(|| conflict(key))?;
        if entry.revision != expected_revision {
            return Err(conflict(key));
        }
        entry.revision += 1;
        entry.value = value;
        Ok(entry.revision)
    }

    async fn delete(&self, key: &str, expected_revision: u64) -> Result<()> {
        self.entries
            .remove_if(key, |_, v| v.revision == expected_revision)
            .map(|_| ())
            .ok_or_else(|| conflict(key))
    }

    async fn list(&self) -> Result<Vec<(String, Versioned<V>)>> {
        Ok(self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect())
    }
}
