//! Error types for Archivum
//!
//! The variants mirror the failure taxonomy the coordination engine reasons
//! about: transient I/O is retried, capacity exhaustion propagates, checksum
//! mismatches abort finalization, stale directory data degrades service, saga
//! step timeouts trigger compensation.

use crate::types::{FileId, NodeId, StorageMode};
use thiserror::Error;

/// Common result type for Archivum operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Archivum
#[derive(Debug, Error)]
pub enum Error {
    // Retry with backoff
    #[error("transient I/O error: {0}")]
    TransientIo(#[from] std::io::Error),

    #[error("capacity directory unavailable: {0}")]
    DirectoryUnavailable(String),

    // Placement
    #[error("no eligible {mode} node with {size} bytes free")]
    CapacityExhausted { mode: StorageMode, size: u64 },

    // Integrity
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    // Degraded directory sourcing
    #[error("stale directory data served from {tier}")]
    StaleDirectoryData { tier: String },

    // Saga execution
    #[error("saga step '{step}' timed out after {timeout_ms} ms")]
    SagaStepTimeout { step: String, timeout_ms: u64 },

    // Concurrency
    #[error("lock contention on {resource}")]
    LockContention { resource: String },

    #[error("orphan data detected: file {file_id} on node {node_id}")]
    OrphanDataDetected { file_id: FileId, node_id: NodeId },

    // Lookups
    #[error("attribute record not found: {0}")]
    RecordNotFound(FileId),

    #[error("storage node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("saga not found: {0}")]
    SagaNotFound(String),

    // State and input
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation cancelled")]
    Cancelled,

    // Infrastructure
    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a catalog error
    pub fn catalog(msg: impl Into<String>) -> Self {
        Self::Catalog(msg.into())
    }

    /// Create a lock contention error
    pub fn lock_contention(resource: impl Into<String>) -> Self {
        Self::LockContention {
            resource: resource.into(),
        }
    }

    /// Check if this error should be retried with backoff
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientIo(_) | Self::DirectoryUnavailable(_) | Self::LockContention { .. }
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::RecordNotFound(_) | Self::NodeNotFound(_) | Self::SagaNotFound(_)
        )
    }

    /// Check if placement failed for lack of capacity
    #[must_use]
    pub const fn is_capacity_exhausted(&self) -> bool {
        matches!(self, Self::CapacityExhausted { .. })
    }

    /// Short machine-readable code, used in saga status reports and events
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::TransientIo(_) => "TransientIOError",
            Self::DirectoryUnavailable(_) => "DirectoryUnavailable",
            Self::CapacityExhausted { .. } => "CapacityExhausted",
            Self::ChecksumMismatch { .. } => "ChecksumMismatch",
            Self::StaleDirectoryData { .. } => "StaleDirectoryData",
            Self::SagaStepTimeout { .. } => "SagaStepTimeout",
            Self::LockContention { .. } => "LockContention",
            Self::OrphanDataDetected { .. } => "OrphanDataDetected",
            Self::RecordNotFound(_) => "RecordNotFound",
            Self::NodeNotFound(_) => "NodeNotFound",
            Self::SagaNotFound(_) => "SagaNotFound",
            Self::InvalidState(_) => "InvalidState",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::Cancelled => "Cancelled",
            Self::Catalog(_) => "CatalogError",
            Self::Serialization(_) => "SerializationError",
            Self::Configuration(_) => "ConfigurationError",
            Self::Internal(_) => "InternalError",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        let io = std::io::Error::new(std::io::ErrorKind::Interrupted, "eintr");
        assert!(Error::TransientIo(io).is_retryable());
        assert!(Error::DirectoryUnavailable("down".into()).is_retryable());
        assert!(!Error::CapacityExhausted {
            mode: StorageMode::TemporaryCrud,
            size: 1
        }
        .is_retryable());
        assert!(!Error::ChecksumMismatch {
            expected: "a".into(),
            actual: "b".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_error_not_found() {
        assert!(Error::RecordNotFound(FileId::new()).is_not_found());
        assert!(Error::NodeNotFound(NodeId::new("n")).is_not_found());
        assert!(!Error::Cancelled.is_not_found());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            Error::SagaStepTimeout {
                step: "transfer_bytes".into(),
                timeout_ms: 10
            }
            .code(),
            "SagaStepTimeout"
        );
        assert_eq!(Error::lock_contention("file").code(), "LockContention");
    }
}
