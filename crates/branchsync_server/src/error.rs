//! Error types for the sync authority.

use thiserror::Error;

/// Result type for authority operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync authority.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Token rejected.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Declared and recomputed batch checksums disagree.
    #[error("checksum mismatch: declared {expected}, recomputed {actual}")]
    ChecksumMismatch {
        /// Checksum declared by the sender.
        expected: String,
        /// Checksum recomputed by the authority.
        actual: String,
    },

    /// A version-checked write found an unexpected version.
    #[error("version conflict on {entity_type}/{entity_id}: expected {expected:?}, found {actual:?}")]
    VersionConflict {
        /// Entity type.
        entity_type: String,
        /// Entity identifier.
        entity_id: String,
        /// Version the writer expected.
        expected: Option<u64>,
        /// Version actually stored.
        actual: Option<u64>,
    },

    /// The branch is unknown to the authority.
    #[error("unknown branch: {0}")]
    UnknownBranch(String),

    /// Internal authority error.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_)
                | ServerError::AuthenticationFailed(_)
                | ServerError::ChecksumMismatch { .. }
                | ServerError::VersionConflict { .. }
                | ServerError::UnknownBranch(_)
        )
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        matches!(self, ServerError::Internal(_) | ServerError::Io(_))
    }

    /// The HTTP status code this error maps to on the wire.
    pub fn http_status(&self) -> u16 {
        match self {
            ServerError::InvalidRequest(_) => 400,
            ServerError::AuthenticationFailed(_) => 401,
            ServerError::UnknownBranch(_) => 404,
            ServerError::VersionConflict { .. } => 409,
            ServerError::ChecksumMismatch { .. } => 422,
            ServerError::Internal(_) | ServerError::Io(_) => 500,
        }
    }

    /// JSON error body for the wire, matching the engine's expectations.
    pub fn error_body(&self) -> serde_json::Value {
        match self {
            ServerError::ChecksumMismatch { expected, actual } => serde_json::json!({
                "error": self.to_string(),
                "expected": expected,
                "actual": actual,
            }),
            _ => serde_json::json!({ "error": self.to_string() }),
        }
    }
}
