//! A small datastore abstraction with two interchangeable backends.
//!
//! Callers work against [`Store`], [`Query`] and [`Entity`] and pick the
//! backend once at start-up:
//!
//! - `cloud`: Google Cloud Datastore, with transactional `create`/`update`.
//! - `file`: one file per entity on local disk, for development, tests and
//!   offline use.
//!
//! ```no_run
//! # async fn demo() -> datastore::StoreResult<()> {
//! let store = datastore::new_store("file", "openfish", "./store").await?;
//! let key = store.name_key("Note", "hello");
//! let note = datastore::RawEntity { bytes: b"world".to_vec() };
//! store.put(&key, &note).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Entity kinds that generic paths (`get_all`, cache invalidation) must
//! construct by name are registered with [`register_entity`] before the
//! store is shared.

pub mod cache;
pub mod cloud;
pub mod entity;
pub mod error;
pub mod file;
pub mod key;
pub mod query;
pub mod registry;
pub mod store;
pub mod value;

pub use cache::EntityCache;
pub use cloud::{CloudStore, MemoryClient, RestClient, RetryPolicy};
pub use entity::{decode_json, encode_json, Entity, EntityCopy, RawEntity};
pub use error::{StoreError, StoreResult};
pub use file::{FileQuery, FileStore};
pub use key::{id_key, split_id_key, Key, EPOCH_END, EPOCH_START, MAX_BLOB, MAX_KEYS, SUB_TIME_BITS};
pub use query::{FieldFilter, Query};
pub use registry::{cache_for_kind, new_entity, register_entity};
pub use store::{delete_multi, get_all_as, new_store, open_store, Backend, Store, UpdateFn};
pub use value::{Operator, Value};
