//! File-backed store.
//!
//! Each entity is one file named after its key under `<dir>/<id>/<kind>/`,
//! holding exactly the entity's encoding. Queries are executed in-process:
//! see [`FileQuery`] for filtering on the parts of a key name.
//!
//! `create` and `update` are serialised by a per-store mutex. Plain reads,
//! `put` and deletes are not, so a scan may observe a partially written
//! file.

mod query;

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub use query::FileQuery;
use query::by_id_then_name;

use crate::entity::Entity;
use crate::error::{StoreError, StoreResult};
use crate::key::Key;
use crate::query::{FieldFilter, Query};
use crate::registry::new_entity;
use crate::store::{Store, UpdateFn};
use crate::value::compare;

pub struct FileStore {
    mu: Mutex<()>,
    id: String,
    dir: PathBuf,
}

impl FileStore {
    /// Opens the store rooted at `<dir>/<id>`, creating it if needed. An
    /// empty `dir` means the current directory.
    pub fn new(id: &str, dir: &str) -> StoreResult<Self> {
        let dir = if dir.is_empty() { "." } else { dir };
        let store = Self {
            mu: Mutex::new(()),
            id: id.to_string(),
            dir: PathBuf::from(dir),
        };
        let root = store.root();
        std::fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, e))?;
        debug!(root = %root.display(), "file store ready");
        Ok(store)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// `<dir>/<id>`.
    pub fn root(&self) -> PathBuf {
        self.dir.join(&self.id)
    }

    fn kind_dir(&self, kind: &str) -> PathBuf {
        self.root().join(kind)
    }

    fn path(&self, key: &Key) -> PathBuf {
        self.kind_dir(&key.kind).join(&key.name)
    }

    fn ensure_kind_dir(&self, kind: &str) {
        let dir = self.kind_dir(kind);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), error = %e, "failed to create kind directory");
        }
    }

    /// Resolves an incomplete key to a fresh ID key.
    fn resolve(&self, key: &Key) -> Key {
        if key.is_incomplete() {
            self.incomplete_key(&key.kind)
        } else {
            key.clone()
        }
    }

    async fn read(&self, key: &Key) -> StoreResult<Vec<u8>> {
        let path = self.path(key);
        fs::read(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => StoreError::NoSuchEntity,
            _ => StoreError::io(path, e),
        })
    }

    async fn write(&self, key: &Key, bytes: &[u8]) -> StoreResult<()> {
        let dir = self.kind_dir(&key.kind);
        fs::create_dir_all(&dir).await.map_err(|e| StoreError::io(&dir, e))?;
        let path = dir.join(&key.name);
        fs::write(&path, bytes).await.map_err(|e| StoreError::io(path, e))
    }

    async fn remove(&self, key: &Key) -> StoreResult<()> {
        let path = self.path(key);
        fs::remove_file(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => StoreError::NoSuchEntity,
            _ => StoreError::io(path, e),
        })
    }

    async fn load(&self, key: &Key) -> StoreResult<Box<dyn Entity>> {
        let mut entity = new_entity(&key.kind)?;
        let bytes = self.read(key).await?;
        entity.decode(&bytes)?;
        Ok(entity)
    }

    /// Keys for every regular file of `kind`, sorted by name. A missing kind
    /// directory is created and yields no keys.
    async fn list(&self, kind: &str) -> StoreResult<Vec<Key>> {
        let dir = self.kind_dir(kind);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.ensure_kind_dir(kind);
                return Ok(Vec::new());
            }
            Err(e) => return Err(StoreError::io(dir, e)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| StoreError::io(&dir, e))? {
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                keys.push(Key::from_file_name(kind, name));
            }
        }
        keys.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(keys)
    }
}

fn matches_fields(entity: &dyn Entity, filters: &[FieldFilter]) -> bool {
    filters
        .iter()
        .all(|f| entity.field(&f.field).is_some_and(|v| compare(&v, f.operator, &f.value)))
}

fn exists(path: &Path) -> bool {
    path.try_exists().unwrap_or(false)
}

#[async_trait]
impl Store for FileStore {
    fn id_key(&self, kind: &str, id: i64) -> Key {
        self.ensure_kind_dir(kind);
        Key::with_id(kind, id)
    }

    fn name_key(&self, kind: &str, name: &str) -> Key {
        self.ensure_kind_dir(kind);
        Key::with_name(kind, name)
    }

    /// Picks random ids until one has no file. Another writer may still
    /// claim the name before it is used.
    fn incomplete_key(&self, kind: &str) -> Key {
        loop {
            let id = rand::random::<i64>() & i64::MAX;
            if id == 0 {
                continue;
            }
            let key = Key::with_id(kind, id);
            if !exists(&self.path(&key)) {
                return key;
            }
        }
    }

    fn new_query(&self, kind: &str, keys_only: bool, key_parts: &[&str]) -> Box<dyn Query> {
        Box::new(FileQuery::new(kind, keys_only, key_parts))
    }

    async fn get(&self, key: &Key, dst: &mut dyn Entity) -> StoreResult<()> {
        let bytes = self.read(key).await?;
        dst.decode(&bytes)
    }

    async fn get_all(
        &self,
        query: &dyn Query,
        dst: &mut Vec<Box<dyn Entity>>,
    ) -> StoreResult<Vec<Key>> {
        let q = query.as_any().downcast_ref::<FileQuery>().ok_or(StoreError::WrongQueryType)?;

        let mut keys: Vec<Key> = self
            .list(&q.kind)
            .await?
            .into_iter()
            .filter(|k| q.matches_name(&k.name))
            .collect();
        if q.ordered {
            keys.sort_by(by_id_then_name);
        }

        // Without field filters the page is known from the names alone.
        let by_field = q.has_field_filters();
        if !by_field {
            keys = keys.into_iter().skip(q.offset).take(q.limit).collect();
            if q.keys_only {
                return Ok(keys);
            }
        }

        let mut skip = if by_field { q.offset } else { 0 };
        let mut found = Vec::new();
        for key in keys {
            if found.len() >= q.limit {
                break;
            }
            let mut entity = match self.load(&key).await {
                Ok(entity) => entity,
                Err(StoreError::NoSuchEntity) => {
                    debug!(%key, "entity vanished during query");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if !matches_fields(entity.as_ref(), &q.field_filters) {
                continue;
            }
            if skip > 0 {
                skip -= 1;
                continue;
            }
            if !q.keys_only {
                entity.set_key(&key);
                dst.push(entity);
            }
            found.push(key);
        }
        debug!(kind = %q.kind, matched = found.len(), "file query done");
        Ok(found)
    }

    async fn create(&self, key: &Key, src: &dyn Entity) -> StoreResult<Key> {
        let _guard = self.mu.lock().await;
        let key = self.resolve(key);
        if exists(&self.path(&key)) {
            return Err(StoreError::EntityExists);
        }
        self.write(&key, &src.encode()).await?;
        Ok(key)
    }

    async fn put(&self, key: &Key, src: &dyn Entity) -> StoreResult<Key> {
        let key = self.resolve(key);
        self.write(&key, &src.encode()).await?;
        Ok(key)
    }

    async fn update(&self, key: &Key, f: UpdateFn<'_>, dst: &mut dyn Entity) -> StoreResult<()> {
        let _guard = self.mu.lock().await;
        self.get(key, &mut *dst).await?;
        f(&mut *dst);
        self.write(key, &dst.encode()).await
    }

    async fn delete(&self, key: &Key) -> StoreResult<()> {
        self.remove(key).await
    }

    async fn delete_multi(&self, keys: &[Key]) -> StoreResult<()> {
        for key in keys {
            self.remove(key).await?;
        }
        Ok(())
    }
}
