//! Error types for the branch-side engine.

use branchsync_protocol::ChangeKey;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("network error: {message}")]
    Network {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Checksum mismatch; the batch is rejected and retried as a unit.
    #[error("integrity failure: expected checksum {expected}, got {actual}")]
    Integrity {
        /// Checksum declared by the sender.
        expected: String,
        /// Checksum recomputed by the receiver.
        actual: String,
    },

    /// Authentication rejected; surfaced to the operator, not retried.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Invalid message or unexpected response shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An entity adapter failed.
    #[error("adapter error for '{entity_type}': {message}")]
    Adapter {
        /// Entity type of the failing adapter.
        entity_type: String,
        /// Error message.
        message: String,
    },

    /// No adapter registered for the entity type.
    #[error("no adapter registered for entity type '{0}'")]
    UnknownEntityType(String),

    /// The entity has a manual-resolution ticket pending and is excluded
    /// from automatic sync.
    #[error("unresolved conflict for {key}")]
    ConflictUnresolved {
        /// Affected entity.
        key: ChangeKey,
    },

    /// Retry budget exhausted for a pending change.
    #[error("permanent failure for {key} after {retries} retries")]
    PermanentFailure {
        /// Affected entity.
        key: ChangeKey,
        /// Retries attempted.
        retries: u32,
    },

    /// A session is already running for this branch.
    #[error("sync already in progress")]
    SyncInProgress,

    /// The session was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// A network call exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// Not connected to the authority.
    #[error("not connected to server")]
    NotConnected,

    /// Canonicalization or checksum computation failed.
    #[error("codec error: {0}")]
    Codec(#[from] branchsync_protocol::CodecError),

    /// Resolution policy rejected at installation.
    #[error("policy error: {0}")]
    Policy(#[from] branchsync_protocol::PolicyError),
}

impl SyncError {
    /// Creates a retryable network error.
    pub fn network_retryable(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable network error.
    pub fn network_fatal(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates an adapter error.
    pub fn adapter(entity_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Adapter {
            entity_type: entity_type.into(),
            message: message.into(),
        }
    }

    /// Returns true if this error can be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            // Integrity failures retry the whole batch as a unit.
            SyncError::Integrity { .. } => true,
            _ => false,
        }
    }
}
