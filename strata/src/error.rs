use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the engine can surface, one variant per kind.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("database file has been corrupted")]
    CorruptedFile,

    #[error("no available pages")]
    OutOfPages,

    #[error("pin count for page {0} is below zero")]
    PinUnderflow(i64),

    #[error("pages are still pinned on close")]
    PagesStillPinned,

    #[error("invalid page number {0}")]
    InvalidPageNum(i64),

    #[error("cannot insert duplicate key {0}")]
    DuplicateKey(i64),

    #[error("no entry with key {0} was found")]
    NotFound(i64),

    #[error("start key must be smaller than end key")]
    InvalidRange,

    #[error("no such transaction")]
    NoTransaction,

    #[error("transaction already in progress")]
    TransactionInProgress,

    #[error("cannot upgrade a read lock to a write lock")]
    CannotUpgrade,

    #[error("invalid unlock request")]
    InvalidUnlock,

    #[error("deadlock detected")]
    Deadlock,

    #[error("could not parse log record: {0}")]
    ParseLog(String),

    #[error("table {0} not found")]
    TableNotFound(String),

    #[error("table {0} already exists")]
    TableExists(String),

    #[error("table name must be alphanumeric")]
    InvalidTableName,
}
