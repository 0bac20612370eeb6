//! Error types for engine operations.

use bytes::Bytes;
use std::io;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Optimistic validation failed at commit: a key in the read set was
    /// modified by another transaction after it was read.
    #[error("write conflict on key {key:?}")]
    Conflict {
        /// The first key that failed validation.
        key: Bytes,
    },

    /// A pessimistic lock could not be acquired within the configured timeout.
    #[error("lock timeout on key {key:?}")]
    LockTimeout {
        /// The key whose lock was contended.
        key: Bytes,
    },

    /// Stored data failed checksum verification.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    Corruption {
        /// Checksum recorded when the value was written.
        expected: u32,
        /// Checksum computed from the stored bytes.
        actual: u32,
    },

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A savepoint operation was requested with an empty savepoint stack.
    #[error("no savepoint to roll back to")]
    NoSavepoint,

    /// The transaction has already been committed or rolled back.
    #[error("transaction is closed: {context}")]
    TxClosed {
        /// The operation that was attempted.
        context: &'static str,
    },
}

impl EngineError {
    /// Creates a conflict error for a key.
    pub fn conflict(key: impl Into<Bytes>) -> Self {
        Self::Conflict { key: key.into() }
    }

    /// Creates a lock timeout error for a key.
    pub fn lock_timeout(key: impl Into<Bytes>) -> Self {
        Self::LockTimeout { key: key.into() }
    }

    /// Creates a closed-transaction error.
    pub fn tx_closed(context: &'static str) -> Self {
        Self::TxClosed { context }
    }
}
