#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use datastore::{decode_json, encode_json, Entity, EntityCache, Key, StoreResult};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Fresh temp directory for a file store; remove it when done.
pub fn temp_dir() -> PathBuf {
    std::env::temp_dir().join(format!("datastore_it_{}", uuid::Uuid::new_v4()))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NameValue {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value")]
    pub value: String,
}

impl Entity for NameValue {
    fn encode(&self) -> Vec<u8> {
        encode_json(self)
    }

    fn decode(&mut self, bytes: &[u8]) -> StoreResult<()> {
        decode_json(self, bytes)
    }
}

pub fn new_name_value() -> Box<dyn Entity> {
    Box::new(NameValue::default())
}

/// A widget remembers the key it was loaded from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Widget {
    #[serde(rename = "Label")]
    pub label: String,
    #[serde(rename = "Weight")]
    pub weight: i64,
    #[serde(skip)]
    pub key: Option<Key>,
}

impl Entity for Widget {
    fn encode(&self) -> Vec<u8> {
        encode_json(self)
    }

    fn decode(&mut self, bytes: &[u8]) -> StoreResult<()> {
        decode_json(self, bytes)
    }

    fn set_key(&mut self, key: &Key) {
        self.key = Some(key.clone());
    }
}

pub fn new_widget() -> Box<dyn Entity> {
    Box::new(Widget::default())
}

static COUNTER_CACHE: Lazy<Arc<EntityCache>> = Lazy::new(|| Arc::new(EntityCache::new()));

/// Cached entity used to exercise read-through and invalidation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Counter {
    pub n: i64,
}

impl Entity for Counter {
    fn encode(&self) -> Vec<u8> {
        encode_json(self)
    }

    fn decode(&mut self, bytes: &[u8]) -> StoreResult<()> {
        decode_json(self, bytes)
    }

    fn cache(&self) -> Option<Arc<EntityCache>> {
        Some(COUNTER_CACHE.clone())
    }
}

pub fn new_counter() -> Box<dyn Entity> {
    Box::new(Counter::default())
}

pub fn counter_cache() -> Arc<EntityCache> {
    COUNTER_CACHE.clone()
}

/// Increments a `Counter`; other entity types are left alone.
pub fn increment(e: &mut dyn Entity) {
    if let Some(c) = e.downcast_mut::<Counter>() {
        c.n += 1;
    }
}
