//! Error types for the sync engine.

use fieldsync_protocol::{ProtocolError, ValidationError};
use fieldsync_store::StoreError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// Errors fall into three classes, which decide what happens to a pending
/// operation that raised them:
///
/// - validation ([`SyncError::is_validation`]): permanent for the payload's
///   current form; the operation is parked for manual correction
/// - transient ([`SyncError::is_retryable`]): retried with backoff
/// - structural ([`SyncError::is_structural`]): something has to be fixed,
///   such as missing authorization; still retried on the same schedule
#[derive(Error, Debug)]
pub enum SyncError {
    /// The payload failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Local store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A stored record could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Network or remote store error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the failure is expected to clear by itself.
        retryable: bool,
    },

    /// Authorization could not be established.
    #[error("authorization required: {0}")]
    Unauthorized(String),

    /// A binary upload failed.
    #[error("upload failed: {0}")]
    Upload(String),

    /// Not connected to the remote store.
    #[error("not connected to remote store")]
    NotConnected,

    /// No pending operation with that id.
    #[error("pending operation not found: {0}")]
    NotFound(String),

    /// The manager has shut down.
    #[error("sync manager is shut down")]
    Shutdown,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if the payload itself is at fault.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SyncError::Validation(_) | SyncError::Protocol(ProtocolError::Validation(_))
        )
    }

    /// Returns true if the failure is expected to clear without intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Upload(_) | SyncError::NotConnected | SyncError::Store(_) => true,
            _ => false,
        }
    }

    /// Returns true if something outside the payload has to be fixed.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            SyncError::Unauthorized(_) | SyncError::Transport { retryable: false, .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classes() {
        let validation = SyncError::from(ValidationError::missing("client", "jobs/1"));
        assert!(validation.is_validation());
        assert!(!validation.is_retryable());

        assert!(SyncError::transport_retryable("connection reset").is_retryable());
        assert!(!SyncError::transport_fatal("bad certificate").is_retryable());
        assert!(SyncError::transport_fatal("bad certificate").is_structural());
        assert!(SyncError::Upload("interrupted".into()).is_retryable());

        let auth = SyncError::Unauthorized("session expired".into());
        assert!(auth.is_structural());
        assert!(!auth.is_validation());
    }

    #[test]
    fn error_display() {
        let err = SyncError::Unauthorized("session expired".into());
        assert_eq!(err.to_string(), "authorization required: session expired");

        let err = SyncError::from(ValidationError::missing("client", "jobs/1"));
        assert_eq!(err.to_string(), "jobs/1: required field `client` is missing");

        assert_eq!(
            SyncError::NotConnected.to_string(),
            "not connected to remote store"
        );
    }
}
