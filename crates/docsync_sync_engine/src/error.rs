//! Error types for the sync engine.

use docsync_core::CoreError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// Errors are `Clone` because one failure is reported to several observers:
/// replication events, the orchestrator status and the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The document does not exist on the replica.
    #[error("document not found: {id}")]
    NotFound {
        /// Document id.
        id: String,
    },

    /// The replica rejected a write with a stale revision.
    #[error("revision conflict on {id}")]
    Conflict {
        /// Document id.
        id: String,
    },

    /// The remote is unreachable or the transport failed.
    #[error("network error: {message}")]
    Network {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The remote rejected the credentials.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The remote refused one document.
    #[error("write to {id} forbidden: {reason}")]
    Forbidden {
        /// Document id.
        id: String,
        /// Reason given by the remote.
        reason: String,
    },

    /// Sync is misconfigured, e.g. enabled without a remote.
    #[error("configuration error: {0}")]
    Config(String),

    /// The local store failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// The remote answered with something unexpected.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A bounded operation ran out of time.
    #[error("operation timed out")]
    Timeout,

    /// The operation was cancelled.
    #[error("sync cancelled")]
    Cancelled,
}

/// Coarse classification of a [`SyncError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// [`SyncError::NotFound`]
    NotFound,
    /// [`SyncError::Conflict`]
    Conflict,
    /// [`SyncError::Network`]
    Network,
    /// [`SyncError::Auth`]
    Auth,
    /// [`SyncError::Forbidden`]
    Forbidden,
    /// [`SyncError::Config`]
    Config,
    /// [`SyncError::Storage`]
    Storage,
    /// [`SyncError::Protocol`]
    Protocol,
    /// [`SyncError::Timeout`]
    Timeout,
    /// [`SyncError::Cancelled`]
    Cancelled,
}

impl SyncError {
    /// Creates a retryable network error.
    pub fn network(message: impl Into<String>) -> Self {
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

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Returns the error's classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Network { .. } => ErrorKind::Network,
            Self::Auth(_) => ErrorKind::Auth,
            Self::Forbidden { .. } => ErrorKind::Forbidden,
            Self::Config(_) => ErrorKind::Config,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Timeout => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Returns true if replication should back off and try again.
    ///
    /// Credentials can be fixed on the remote side while we wait, so auth
    /// failures are retried like transport failures.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { retryable, .. } => *retryable,
            Self::Timeout | Self::Auth(_) | Self::Protocol(_) => true,
            _ => false,
        }
    }

    /// True for revision conflicts.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound { id } => Self::NotFound { id },
            CoreError::Conflict { id, .. } => Self::Conflict { id },
            other => Self::Storage(other.to_string()),
        }
    }
}
