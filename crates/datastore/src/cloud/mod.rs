//! Cloud-backed store.
//!
//! [`CloudStore`] maps the `Store` contract onto a transactional document
//! database reached through a [`CloudClient`]: [`RestClient`] speaks the
//! Google Cloud Datastore v1 REST API, [`MemoryClient`] keeps everything in
//! process.

mod auth;
mod client;
mod memory;
mod query;
mod rest;
mod retry;

use async_trait::async_trait;
use tracing::debug;

pub use auth::{Credentials, ServiceAccountKey, TokenSource};
pub use client::{
    from_document, to_document, CloudClient, Document, Mutation, TransactionId, RAW_PROPERTY,
};
pub use memory::MemoryClient;
pub use query::{CloudQuery, Direction};
pub use rest::RestClient;
pub use retry::{retry_with_policy, RetryPolicy};

use crate::entity::Entity;
use crate::error::{StoreError, StoreResult};
use crate::key::Key;
use crate::query::Query;
use crate::registry::{cache_for_kind, new_entity};
use crate::store::{Store, UpdateFn};

pub struct CloudStore<C> {
    client: C,
    retry: RetryPolicy,
}

impl<C: CloudClient> CloudStore<C> {
    pub fn with_client(client: C, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Rolls back after a failed attempt. The transaction may already be
    /// gone, so failures are only logged.
    async fn abandon(&self, tx: &TransactionId) {
        if let Err(e) = self.client.rollback(tx).await {
            debug!(error = %e, "rollback failed");
        }
    }

    async fn try_create(&self, key: &Key, doc: &Document) -> StoreResult<Key> {
        if key.is_incomplete() {
            let insert = Mutation::Insert(key.clone(), doc.clone());
            let keys = self.client.commit(None, vec![insert]).await?;
            return Ok(first_key(keys, key));
        }

        let tx = self.client.begin_transaction().await?;
        let result = async {
            if self.client.lookup(key, Some(&tx)).await?.is_some() {
                return Err(StoreError::EntityExists);
            }
            self.client.commit(Some(&tx), vec![Mutation::Insert(key.clone(), doc.clone())]).await
        }
        .await;
        match result {
            Ok(keys) => Ok(first_key(keys, key)),
            Err(e) => {
                self.abandon(&tx).await;
                Err(e)
            }
        }
    }

    async fn try_update(
        &self,
        key: &Key,
        f: UpdateFn<'_>,
        proto: &dyn Entity,
    ) -> StoreResult<Box<dyn Entity>> {
        let tx = self.client.begin_transaction().await?;
        let result = async {
            let doc = self.client.lookup(key, Some(&tx)).await?.ok_or(StoreError::NoSuchEntity)?;
            let mut entity = proto.duplicate();
            from_document(doc, entity.as_mut())?;
            f(entity.as_mut());
            let doc = to_document(entity.as_ref())?;
            self.client.commit(Some(&tx), vec![Mutation::Upsert(key.clone(), doc)]).await?;
            Ok::<_, StoreError>(entity)
        }
        .await;
        if result.is_err() {
            self.abandon(&tx).await;
        }
        result
    }

    async fn invalidate(&self, keys: &[Key]) {
        for key in keys {
            if let Some(cache) = cache_for_kind(&key.kind) {
                cache.delete(key).await;
            }
        }
    }
}

/// The committed key, which differs from the requested one when an id was
/// allocated.
fn first_key(keys: Vec<Key>, requested: &Key) -> Key {
    keys.into_iter().next().unwrap_or_else(|| requested.clone())
}

async fn refresh_cache(key: &Key, src: &dyn Entity) {
    if let Some(cache) = src.cache() {
        cache.set(key, src).await;
    }
}

#[async_trait]
impl<C: CloudClient> Store for CloudStore<C> {
    fn id_key(&self, kind: &str, id: i64) -> Key {
        Key::with_id(kind, id)
    }

    fn name_key(&self, kind: &str, name: &str) -> Key {
        Key::with_name(kind, name)
    }

    fn incomplete_key(&self, kind: &str) -> Key {
        Key::incomplete(kind)
    }

    /// Key parts are a file backend concept and are ignored here.
    fn new_query(&self, kind: &str, keys_only: bool, _key_parts: &[&str]) -> Box<dyn Query> {
        Box::new(CloudQuery::new(kind, keys_only))
    }

    /// Serves from the entity's cache when it holds the key. A miss reads
    /// the database without filling the cache.
    async fn get(&self, key: &Key, dst: &mut dyn Entity) -> StoreResult<()> {
        if let Some(cache) = dst.cache() {
            if cache.get(key, &mut *dst).await.is_ok() {
                debug!(%key, "cache hit");
                return Ok(());
            }
        }
        let doc = self.client.lookup(key, None).await?.ok_or(StoreError::NoSuchEntity)?;
        from_document(doc, dst)
    }

    async fn get_all(
        &self,
        query: &dyn Query,
        dst: &mut Vec<Box<dyn Entity>>,
    ) -> StoreResult<Vec<Key>> {
        let q = query.as_any().downcast_ref::<CloudQuery>().ok_or(StoreError::WrongQueryType)?;
        let results = self.client.run_query(q).await?;

        let mut keys = Vec::with_capacity(results.len());
        for (key, doc) in results {
            if !q.keys_only() {
                let doc = doc.ok_or_else(|| {
                    StoreError::decoding(format!("{key} returned without properties"))
                })?;
                let mut entity = new_entity(q.kind())?;
                from_document(doc, entity.as_mut())?;
                entity.set_key(&key);
                dst.push(entity);
            }
            keys.push(key);
        }
        debug!(kind = %q.kind(), matched = keys.len(), "cloud query done");
        Ok(keys)
    }

    async fn create(&self, key: &Key, src: &dyn Entity) -> StoreResult<Key> {
        let doc = to_document(src)?;
        let key = retry_with_policy(&self.retry, || self.try_create(key, &doc)).await?;
        refresh_cache(&key, src).await;
        Ok(key)
    }

    async fn put(&self, key: &Key, src: &dyn Entity) -> StoreResult<Key> {
        let doc = to_document(src)?;
        let keys = self.client.commit(None, vec![Mutation::Upsert(key.clone(), doc)]).await?;
        let key = first_key(keys, key);
        refresh_cache(&key, src).await;
        Ok(key)
    }

    /// `f` runs once per transaction attempt, each time on a fresh read.
    async fn update(&self, key: &Key, f: UpdateFn<'_>, dst: &mut dyn Entity) -> StoreResult<()> {
        let proto: &dyn Entity = &*dst;
        let updated = retry_with_policy(&self.retry, || self.try_update(key, f, proto)).await?;
        updated.copy_to(&mut *dst)?;
        refresh_cache(key, updated.as_ref()).await;
        Ok(())
    }

    async fn delete(&self, key: &Key) -> StoreResult<()> {
        self.client.commit(None, vec![Mutation::Delete(key.clone())]).await?;
        self.invalidate(std::slice::from_ref(key)).await;
        Ok(())
    }

    async fn delete_multi(&self, keys: &[Key]) -> StoreResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mutations = keys.iter().cloned().map(Mutation::Delete).collect();
        self.client.commit(None, mutations).await?;
        self.invalidate(keys).await;
        Ok(())
    }
}
