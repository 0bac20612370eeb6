//! Status reporting: errors and their caller-visible status records.
//!
//! Every fallible operation on a transaction handle returns a [`TxResult`];
//! the error side carries a stable [`StatusKind`] plus a human-readable
//! message, and nothing in this crate panics across the engine boundary.
//! Callers that want a flat status record (for example at an FFI seam)
//! convert any outcome with [`Status::from_result`].

use thiserror::Error;

/// Result type for transaction operations.
pub type TxResult<T> = Result<T, TxError>;

/// The stable classification of an operation's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusKind {
    /// The operation succeeded.
    Ok,
    /// A read found no value for the key.
    NotFound,
    /// Optimistic validation failed at commit.
    Conflict,
    /// A pessimistic lock could not be acquired in time.
    Busy,
    /// Stored data failed checksum or format validation.
    Corruption,
    /// An I/O error was surfaced by the engine.
    IoError,
    /// The operation was invoked outside its valid state; a programming
    /// error, not a recoverable condition.
    InvalidState,
}

/// Errors produced by transaction handle operations.
#[derive(Debug, Error)]
pub enum TxError {
    /// The underlying engine reported a failure.
    #[error(transparent)]
    Engine(#[from] tandem_engine::EngineError),

    /// The handle was used outside its valid state-machine state.
    #[error("invalid transaction state: {message}")]
    InvalidState {
        /// What was attempted and why it is invalid.
        message: String,
    },
}

impl TxError {
    /// Creates an invalid-state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// The stable status kind for this error.
    ///
    /// Engine outcomes map verbatim: conflict stays a conflict, a lock
    /// timeout is `Busy`, checksum failures are `Corruption`. Savepoint
    /// misuse and transaction reuse are contract violations, so they
    /// surface as `InvalidState`.
    #[must_use]
    pub fn kind(&self) -> StatusKind {
        use tandem_engine::EngineError;
        match self {
            Self::Engine(EngineError::Conflict { .. }) => StatusKind::Conflict,
            Self::Engine(EngineError::LockTimeout { .. }) => StatusKind::Busy,
            Self::Engine(EngineError::Corruption { .. }) => StatusKind::Corruption,
            Self::Engine(EngineError::Io(_)) => StatusKind::IoError,
            Self::Engine(EngineError::NoSavepoint | EngineError::TxClosed { .. })
            | Self::InvalidState { .. } => StatusKind::InvalidState,
        }
    }
}

/// A caller-visible status record: stable kind plus message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    /// The outcome classification.
    pub kind: StatusKind,
    /// Human-readable detail; empty for `Ok`.
    pub message: String,
}

impl Status {
    /// The success status.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            kind: StatusKind::Ok,
            message: String::new(),
        }
    }

    /// A not-found status for a key with no value.
    #[must_use]
    pub fn not_found() -> Self {
        Self {
            kind: StatusKind::NotFound,
            message: "key not found".to_owned(),
        }
    }

    /// Whether this status is `Ok`.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.kind == StatusKind::Ok
    }

    /// Converts any operation outcome into a status record.
    ///
    /// Successful reads that found nothing are not representable here;
    /// use [`Status::from_read`] for `get`-shaped results.
    #[must_use]
    pub fn from_result<T>(result: &TxResult<T>) -> Self {
        match result {
            Ok(_) => Self::ok(),
            Err(err) => Self::from(err),
        }
    }

    /// Converts a read outcome, reporting an absent key as `NotFound`
    /// rather than conflating it with an empty value.
    #[must_use]
    pub fn from_read<T>(result: &TxResult<Option<T>>) -> Self {
        match result {
            Ok(Some(_)) => Self::ok(),
            Ok(None) => Self::not_found(),
            Err(err) => Self::from(err),
        }
    }
}

impl From<&TxError> for Status {
    fn from(err: &TxError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            StatusKind::Ok => write!(f, "OK"),
            kind => write!(f, "{:?}: {}", kind, self.message),
        }
    }
}
