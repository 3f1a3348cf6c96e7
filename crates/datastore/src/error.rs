use std::path::PathBuf;

use thiserror::Error;

use crate::key::Key;

/// Errors returned by every store backend.
///
/// Query construction errors (`InvalidFilter` .. `OperatorMissing`) are
/// returned straight from `Query::filter`/`Query::filter_field`, never
/// deferred to `get_all`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no such entity")]
    NoSuchEntity,
    #[error("entity exists")]
    EntityExists,
    #[error("wrong type")]
    WrongType,
    #[error("invalid entity type: {0}")]
    InvalidType(String),
    #[error("cache miss: {0}")]
    CacheMiss(Key),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    #[error("invalid field: {0}")]
    InvalidField(String),
    #[error("invalid operator: {0}")]
    InvalidOperator(String),
    #[error("invalid value for {0}")]
    InvalidValue(String),
    #[error("operator missing: {0}")]
    OperatorMissing(String),
    #[error("query does not belong to this store")]
    WrongQueryType,

    #[error("decoding error: {0}")]
    Decoding(String),
    #[error("entity too large: {size} bytes")]
    EntityTooLarge { size: usize },

    #[error("invalid datastore id: {0}")]
    InvalidStoreId(String),
    #[error("unexpected store kind: {0}")]
    UnknownBackend(String),

    #[error("transaction conflict")]
    TransactionConflict,
    #[error("deleted {deleted} entities before failing: {source}")]
    PartialDelete {
        deleted: usize,
        #[source]
        source: Box<StoreError>,
    },

    #[error("credentials error: {0}")]
    Credentials(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn decoding(message: impl ToString) -> Self {
        Self::Decoding(message.to_string())
    }

    pub fn transport(message: impl ToString) -> Self {
        Self::Transport(message.to_string())
    }

    /// True for errors a transaction may clear by running again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::TransactionConflict)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NoSuchEntity)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
