//! The `Store` trait and its construction entry points.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::cloud::{CloudStore, RestClient, RetryPolicy};
use crate::entity::Entity;
use crate::error::{StoreError, StoreResult};
use crate::file::FileStore;
use crate::key::{Key, MAX_KEYS};
use crate::query::Query;

/// Mutation applied by `Store::update`. It may run more than once when the
/// backend retries a transaction, so it must be safe to re-invoke.
pub type UpdateFn<'a> = &'a (dyn Fn(&mut dyn Entity) + Send + Sync);

/// The datastore interface every backend implements.
#[async_trait]
pub trait Store: Send + Sync {
    /// ID key for `kind`.
    fn id_key(&self, kind: &str, id: i64) -> Key;

    /// Name key for `kind`.
    fn name_key(&self, kind: &str, name: &str) -> Key;

    /// Key to be resolved by the next successful `put` or `create`.
    fn incomplete_key(&self, kind: &str) -> Key;

    /// New query over `kind`. `key_parts` names the dot-separated parts of
    /// key names; only the file backend uses them.
    fn new_query(&self, kind: &str, keys_only: bool, key_parts: &[&str]) -> Box<dyn Query>;

    /// Reads the entity stored under `key` into `dst`.
    async fn get(&self, key: &Key, dst: &mut dyn Entity) -> StoreResult<()>;

    /// Runs `query`, returning the matched keys. Unless the query is keys
    /// only, the matched entities are appended to `dst` in key order.
    async fn get_all(
        &self,
        query: &dyn Query,
        dst: &mut Vec<Box<dyn Entity>>,
    ) -> StoreResult<Vec<Key>>;

    /// Stores `src` only if nothing is stored under `key` yet, failing with
    /// `EntityExists` otherwise. Returns the resolved key.
    async fn create(&self, key: &Key, src: &dyn Entity) -> StoreResult<Key>;

    /// Stores `src` under `key` unconditionally. Returns the resolved key.
    async fn put(&self, key: &Key, src: &dyn Entity) -> StoreResult<Key>;

    /// Atomically reads `key` into `dst`, applies `f` and writes it back.
    async fn update(&self, key: &Key, f: UpdateFn<'_>, dst: &mut dyn Entity) -> StoreResult<()>;

    async fn delete(&self, key: &Key) -> StoreResult<()>;

    async fn delete_multi(&self, keys: &[Key]) -> StoreResult<()>;
}

/// Storage backend selected at start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Cloud,
    File,
}

impl FromStr for Backend {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cloud" => Ok(Backend::Cloud),
            "file" => Ok(Backend::File),
            other => Err(StoreError::UnknownBackend(other.to_string())),
        }
    }
}

/// Opens a store. `backend` is `"cloud"` or `"file"`; `id` is the project
/// id (optionally `project/database`) or the file store's directory name;
/// `location` is a credentials source for the cloud or a base directory for
/// files.
pub async fn new_store(backend: &str, id: &str, location: &str) -> StoreResult<Arc<dyn Store>> {
    let cfg = configs::StoreConfig {
        backend: backend.to_string(),
        id: id.to_string(),
        location: location.to_string(),
        ..Default::default()
    };
    open_store(&cfg).await
}

/// Opens the store described by `cfg`, applying its retry and transport
/// settings.
pub async fn open_store(cfg: &configs::StoreConfig) -> StoreResult<Arc<dyn Store>> {
    let store: Arc<dyn Store> = match cfg.backend.parse::<Backend>()? {
        Backend::File => Arc::new(FileStore::new(&cfg.id, &cfg.location)?),
        Backend::Cloud => {
            let client = RestClient::connect(&cfg.id, &cfg.location, &cfg.cloud).await?;
            Arc::new(CloudStore::with_client(client, RetryPolicy::from_config(&cfg.retry)))
        }
    };
    info!(backend = %cfg.backend, id = %cfg.id, "datastore opened");
    Ok(store)
}

/// Deletes `keys` in batches of at most [`MAX_KEYS`] and returns how many
/// were deleted. A failure part-way reports the count deleted so far.
pub async fn delete_multi(store: &dyn Store, keys: &[Key]) -> StoreResult<usize> {
    let mut deleted = 0;
    for chunk in keys.chunks(MAX_KEYS) {
        if let Err(e) = store.delete_multi(chunk).await {
            warn!(deleted, error = %e, "batch delete failed");
            return Err(StoreError::PartialDelete {
                deleted,
                source: Box::new(e),
            });
        }
        deleted += chunk.len();
    }
    Ok(deleted)
}

/// Runs `query` and returns its keys alongside the entities as `T`.
pub async fn get_all_as<T: Entity>(
    store: &dyn Store,
    query: &dyn Query,
) -> StoreResult<(Vec<Key>, Vec<T>)> {
    let mut found = Vec::new();
    let keys = store.get_all(query, &mut found).await?;
    let entities = found.into_iter().map(|e| e.downcast::<T>()).collect::<StoreResult<Vec<T>>>()?;
    Ok((keys, entities))
}
