//! The entity contract every stored record obeys.

use std::any::Any;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::EntityCache;
use crate::error::{StoreError, StoreResult};
use crate::key::Key;
use crate::value::Value;

/// A stored record.
///
/// Copying comes from [`EntityCopy`], which is implemented for every
/// `Clone` entity, so implementors only supply the codec and, optionally,
/// a cache, field lookup and key population.
pub trait Entity: EntityCopy + Send + Sync + 'static {
    /// Serializes the entity. For the file backend these bytes are the file.
    fn encode(&self) -> Vec<u8>;

    /// Replaces the entity's contents with the decoded bytes.
    fn decode(&mut self, bytes: &[u8]) -> StoreResult<()>;

    /// Cache this entity participates in, if any.
    fn cache(&self) -> Option<Arc<EntityCache>> {
        None
    }

    /// Named field as a comparable value, used by field filters the backend
    /// evaluates in-process. The default reads the field from the entity's
    /// JSON encoding and returns `None` for non-JSON encodings.
    fn field(&self, name: &str) -> Option<Value> {
        let doc: serde_json::Value = serde_json::from_slice(&self.encode()).ok()?;
        doc.get(name).map(Value::from_json)
    }

    /// Receives the entity's key after a query. No-op unless the entity
    /// keeps its key.
    fn set_key(&mut self, _key: &Key) {}
}

/// Type-erased copy and downcast support, blanket-implemented for every
/// `Clone` entity.
pub trait EntityCopy {
    /// Copies into `dst`, failing with `WrongType` if `dst` is another type.
    fn copy_to(&self, dst: &mut dyn Entity) -> StoreResult<()>;
    /// A boxed deep copy.
    fn duplicate(&self) -> Box<dyn Entity>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Entity + Clone> EntityCopy for T {
    fn copy_to(&self, dst: &mut dyn Entity) -> StoreResult<()> {
        let dst = dst.as_any_mut().downcast_mut::<T>().ok_or(StoreError::WrongType)?;
        dst.clone_from(self);
        Ok(())
    }

    fn duplicate(&self) -> Box<dyn Entity> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

impl dyn Entity {
    pub fn downcast_ref<T: Entity>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Entity>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }

    /// Unboxes into the concrete type or fails with `WrongType`.
    pub fn downcast<T: Entity>(self: Box<Self>) -> StoreResult<T> {
        self.into_any().downcast::<T>().map(|b| *b).map_err(|_| StoreError::WrongType)
    }
}

/// JSON encoding for entities that use it, the usual choice.
pub fn encode_json<T: Serialize>(entity: &T) -> Vec<u8> {
    serde_json::to_vec(entity).unwrap_or_default()
}

/// JSON decoding counterpart of [`encode_json`].
pub fn decode_json<T: DeserializeOwned>(entity: &mut T, bytes: &[u8]) -> StoreResult<()> {
    *entity = serde_json::from_slice(bytes).map_err(StoreError::decoding)?;
    Ok(())
}

/// Opaque bytes, for tooling that handles records of any kind without
/// registering them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEntity {
    pub bytes: Vec<u8>,
}

impl Entity for RawEntity {
    fn encode(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    fn decode(&mut self, bytes: &[u8]) -> StoreResult<()> {
        self.bytes = bytes.to_vec();
        Ok(())
    }
}
