/*
    storage.rs - Key/value storage contract and an in-memory backend

    Keys are ordered string sequences, e.g. ["doc1", "update", "alice:3"].
    `load_range(prefix)` returns every entry whose key starts with `prefix`, in
    key order.
*/

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use super::errors::StorageError;

pub type StorageKey = Vec<String>;

pub fn key(parts: &[&str]) -> StorageKey {
    parts.iter().map(|p| p.to_string()).collect()
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn load(&self, key: &[String]) -> Result<Option<Vec<u8>>, StorageError>;

    async fn save(&self, key: StorageKey, data: Vec<u8>) -> Result<(), StorageError>;

    async fn load_range(&self, prefix: &[String]) -> Result<Vec<(StorageKey, Vec<u8>)>, StorageError>;

    async fn remove_range(&self, prefix: &[String]) -> Result<(), StorageError>;
}

/// Ordered in-memory backend
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<StorageKey, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load(&self, key: &[String]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn save(&self, key: StorageKey, data: Vec<u8>) -> Result<(), StorageError> {
        self.entries.write().await.insert(key, data);
        Ok(())
    }

    async fn load_range(&self, prefix: &[String]) -> Result<Vec<(StorageKey, Vec<u8>)>, StorageError> {
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, data)| (key.clone(), data.clone()))
            .collect())
    }

    async fn remove_range(&self, prefix: &[String]) -> Result<(), StorageError> {
        self.entries
            .write()
            .await
            .retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }
}
