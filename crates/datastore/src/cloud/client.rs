use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{Map, Value as Json};

use super::query::CloudQuery;
use crate::entity::Entity;
use crate::error::{StoreError, StoreResult};
use crate::key::{Key, MAX_BLOB};

/// An entity as the cloud database sees it: a map of named properties.
pub type Document = Map<String, Json>;

/// Property holding the base64 bytes of an entity whose encoding is not a
/// JSON object.
pub const RAW_PROPERTY: &str = "_raw";

/// Handle of an open transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId(pub String);

#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Fails with `EntityExists` if the key is taken. Incomplete keys are
    /// allocated an id.
    Insert(Key, Document),
    Upsert(Key, Document),
    Delete(Key),
}

impl Mutation {
    pub fn key(&self) -> &Key {
        match self {
            Mutation::Insert(k, _) | Mutation::Upsert(k, _) | Mutation::Delete(k) => k,
        }
    }
}

/// Wire-level operations of a transactional document database.
///
/// Reads made with a transaction join its read set; `commit` fails with
/// `TransactionConflict` if any of them changed in the meantime.
#[async_trait]
pub trait CloudClient: Send + Sync {
    async fn lookup(&self, key: &Key, tx: Option<&TransactionId>) -> StoreResult<Option<Document>>;

    /// Runs a query; documents are `None` for keys-only queries.
    async fn run_query(&self, query: &CloudQuery) -> StoreResult<Vec<(Key, Option<Document>)>>;

    async fn begin_transaction(&self) -> StoreResult<TransactionId>;

    /// Applies `mutations` atomically, within `tx` when given. Returns the
    /// resolved key of each mutation, in order.
    async fn commit(
        &self,
        tx: Option<&TransactionId>,
        mutations: Vec<Mutation>,
    ) -> StoreResult<Vec<Key>>;

    async fn rollback(&self, tx: &TransactionId) -> StoreResult<()>;
}

/// Converts an entity to a document. JSON object encodings map property by
/// property; anything else is kept whole under [`RAW_PROPERTY`].
pub fn to_document(entity: &dyn Entity) -> StoreResult<Document> {
    let bytes = entity.encode();
    if bytes.len() > MAX_BLOB {
        return Err(StoreError::EntityTooLarge { size: bytes.len() });
    }
    match serde_json::from_slice::<Json>(&bytes) {
        Ok(Json::Object(doc)) => Ok(doc),
        _ => {
            let mut doc = Document::new();
            doc.insert(RAW_PROPERTY.to_string(), Json::String(STANDARD.encode(&bytes)));
            Ok(doc)
        }
    }
}

/// Decodes a document into `dst`, inverting [`to_document`].
pub fn from_document(doc: Document, dst: &mut dyn Entity) -> StoreResult<()> {
    if doc.len() == 1 {
        if let Some(Json::String(raw)) = doc.get(RAW_PROPERTY) {
            let bytes = STANDARD.decode(raw).map_err(StoreError::decoding)?;
            return dst.decode(&bytes);
        }
    }
    let bytes = serde_json::to_vec(&Json::Object(doc)).map_err(StoreError::decoding)?;
    dst.decode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::RawEntity;

    #[test]
    fn json_objects_become_properties() {
        let src = RawEntity { bytes: br#"{"Name":"reef","Depth":12}"#.to_vec() };
        let doc = to_document(&src).unwrap();
        assert_eq!(doc.get("Depth"), Some(&Json::from(12)));
        assert!(!doc.contains_key(RAW_PROPERTY));
    }

    #[test]
    fn opaque_bytes_survive_as_raw() {
        let src = RawEntity {
            bytes: vec![0, 159, 146, 150],
        };
        let doc = to_document(&src).unwrap();
        assert!(doc.contains_key(RAW_PROPERTY));
        let mut dst = RawEntity::default();
        from_document(doc, &mut dst).unwrap();
        assert_eq!(dst, src);
    }

    #[test]
    fn oversized_entities_are_rejected() {
        let src = RawEntity {
            bytes: vec![b'x'; MAX_BLOB + 1],
        };
        assert!(matches!(
            to_document(&src),
            Err(StoreError::EntityTooLarge { size }) if size == MAX_BLOB + 1
        ));
    }
}
