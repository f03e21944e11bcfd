//! Error types for the Conduit state store.
//!
//! Unreadable rows are not an error: they are logged and skipped, so the
//! loops keep running on whatever state is still intact.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open state database: {0}")]
    Open(String),

    /// The file exists but is not a usable database.
    #[error("state database is corrupted: {0}")]
    Corrupted(String),

    #[error("state transaction failed: {0}")]
    Transaction(String),

    #[error("state table unavailable: {0}")]
    Table(String),

    #[error("state read failed: {0}")]
    Read(String),

    #[error("state write failed: {0}")]
    Write(String),

    #[error("failed to encode state row: {0}")]
    Serialize(String),
}
