use std::time::Duration;

use common::storage::StorageError;
use mq::MqError;
use sea_orm::DbErr;
use thiserror::Error;

/// Errors produced by the storage engine.
#[derive(Debug, Error)]
pub enum DepotError {
    #[error("database error: {0}")]
    Db(#[from] DbErr),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("broker error: {0}")]
    Mq(#[from] MqError),

    #[error("not found: {0}")]
    NotFound(String),

    /// Another active entry with the same name exists in the folder.
    #[error("name already taken: {0}")]
    NameConflict(String),

    /// A concurrent insert for the same hash committed first.
    #[error("content hash already registered: {0}")]
    DuplicateHash(String),

    /// The pool entry is being purged and cannot be linked.
    #[error("content {0} is being purged")]
    ContentUnavailable(String),

    #[error("transcode failed: {0}")]
    Transcode(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl DepotError {
    /// Whether running the same operation again may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Db(_) | Self::Mq(_) | Self::Io(_) | Self::Timeout(_) => true,
            Self::ContentUnavailable(_) => true,
            Self::Storage(e) => e.is_transient(),
            _ => false,
        }
    }
}

pub type DepotResult<T> = Result<T, DepotError>;
