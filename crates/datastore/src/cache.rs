use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::entity::Entity;
use crate::error::{StoreError, StoreResult};
use crate::key::Key;

/// Write-through mirror of entities by key.
///
/// There is no expiry or eviction: entries live until `delete` or `reset`.
/// The cache is advisory, so a miss always falls back to the backend.
#[derive(Default)]
pub struct EntityCache {
    data: RwLock<HashMap<Key, Box<dyn Entity>>>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a copy of `entity` under `key`, replacing any previous entry.
    pub async fn set(&self, key: &Key, entity: &dyn Entity) {
        let copy = entity.duplicate();
        self.data.write().await.insert(key.clone(), copy);
    }

    /// Copies the cached entity into `dst`, or fails with `CacheMiss`.
    pub async fn get(&self, key: &Key, dst: &mut dyn Entity) -> StoreResult<()> {
        let data = self.data.read().await;
        match data.get(key) {
            Some(entity) => entity.copy_to(dst),
            None => Err(StoreError::CacheMiss(key.clone())),
        }
    }

    /// Returns a copy of the cached entity, or fails with `CacheMiss`.
    pub async fn get_entity(&self, key: &Key) -> StoreResult<Box<dyn Entity>> {
        let data = self.data.read().await;
        data.get(key).map(|e| e.duplicate()).ok_or_else(|| StoreError::CacheMiss(key.clone()))
    }

    pub async fn delete(&self, key: &Key) {
        self.data.write().await.remove(key);
    }

    /// Clears every entry.
    pub async fn reset(&self) {
        self.data.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}
