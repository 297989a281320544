//! Error taxonomy for the ingestion pipeline.
//!
//! Store errors carry their own retry classification; everything the caller
//! should never see (cache misses, cache corruption, backpressure stalls) is
//! absorbed by the component that hits it.

use thiserror::Error;

/// SQLite result codes that clear up on their own when retried.
const SQLITE_BUSY: &str = "5";
const SQLITE_LOCKED: &str = "6";

/// Failures reported by a [`crate::storage::GraphStore`].
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Network blip, lock timeout, pool exhaustion. Safe to retry.
    #[error("Transient store error: {0}")]
    Transient(String),

    /// Authorization failure, constraint violation, unknown backend error.
    #[error("Permanent store error: {0}")]
    Permanent(String),

    /// The record itself can never be written.
    #[error("Malformed record: {0}")]
    Malformed(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        let msg = err.to_string();
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => Self::Transient(msg),
            sqlx::Error::Database(db) => match db.code().as_deref() {
                Some(SQLITE_BUSY) | Some(SQLITE_LOCKED) => Self::Transient(msg),
                _ => Self::Permanent(msg),
            },
            _ => Self::Permanent(msg),
        }
    }
}

/// Parse cache backing-store failures. Reads never surface these: a failed
/// lookup degrades to a miss.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the opaque parser collaborator.
#[derive(Error, Debug, Clone)]
pub enum ParseError {
    #[error("Unsupported input {path}: {reason}")]
    Unsupported { path: String, reason: String },

    #[error("Failed to parse {path}: {reason}")]
    Invalid { path: String, reason: String },
}

/// Submission failures of the worker pool. Backpressure is a stall, not an error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Worker pool is not accepting work (state: {0})")]
    NotRunning(&'static str),

    #[error("Worker pool already started")]
    AlreadyStarted,
}

/// Terminal outcome of a bulk write that made no progress at all.
#[derive(Error, Debug)]
pub enum WriteError {
    /// Every degradation level was exhausted and not a single record was written.
    /// Carries the error from the first top-level sub-batch attempt.
    #[error("Bulk write made no progress ({failed} records dead-lettered): {source}")]
    Exhausted {
        failed: usize,
        #[source]
        source: StoreError,
    },
}

/// Crate-level error for the CLI and service wiring.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Parser error: {0}")]
    Parser(#[from] ParseError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Write error: {0}")]
    Write(#[from] WriteError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_timeout_is_transient() {
        let err = StoreError::from(sqlx::Error::PoolTimedOut);
        assert!(err.is_transient());
    }

    #[test]
    fn test_row_not_found_is_permanent() {
        let err = StoreError::from(sqlx::Error::RowNotFound);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_malformed_is_not_transient() {
        assert!(!StoreError::Malformed("empty id".into()).is_transient());
    }
}
