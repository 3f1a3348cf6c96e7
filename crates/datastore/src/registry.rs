//! Process-wide table of entity constructors keyed by kind.
//!
//! Generic paths such as `get_all` only know a kind name at runtime; the
//! registry turns that name into a fresh entity to decode into. Register
//! every kind during start-up, before the store is used concurrently.

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tracing::debug;

use crate::cache::EntityCache;
use crate::entity::Entity;
use crate::error::{StoreError, StoreResult};

/// Builds a zero-valued entity.
pub type Constructor = fn() -> Box<dyn Entity>;

static REGISTRY: Lazy<DashMap<String, Constructor>> = Lazy::new(DashMap::new);

/// Registers (or replaces) the constructor for `kind`.
pub fn register_entity(kind: &str, construct: Constructor) {
    if REGISTRY.insert(kind.to_string(), construct).is_some() {
        debug!(%kind, "entity constructor replaced");
    }
}

/// Instantiates a new entity of `kind`, or fails with `InvalidType`.
pub fn new_entity(kind: &str) -> StoreResult<Box<dyn Entity>> {
    let construct = REGISTRY
        .get(kind)
        .map(|c| *c.value())
        .ok_or_else(|| StoreError::InvalidType(kind.to_string()))?;
    Ok(construct())
}

/// Cache used by entities of `kind`, or `None` when the kind is unknown or
/// uncached.
pub fn cache_for_kind(kind: &str) -> Option<Arc<EntityCache>> {
    new_entity(kind).ok()?.cache()
}

pub fn is_registered(kind: &str) -> bool {
    REGISTRY.contains_key(kind)
}
