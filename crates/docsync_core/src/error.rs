//! Error types for the document store.

use crate::document::Revision;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

fn show_rev(rev: &Option<Revision>) -> String {
    rev.as_ref()
        .map_or_else(|| "<none>".to_string(), |r| r.to_string())
}

/// Errors raised by the document store.
#[derive(Debug, Error)]
pub enum CoreError {
    /// No live document has this id.
    #[error("document not found: {id}")]
    NotFound {
        /// Requested id.
        id: String,
    },

    /// The presented revision is not the document's current revision.
    #[error(
        "revision conflict on {id}: current {}, presented {}",
        show_rev(.expected),
        show_rev(.actual)
    )]
    Conflict {
        /// Document id.
        id: String,
        /// Revision the store holds (`None` when the id is free).
        expected: Option<Revision>,
        /// Revision the caller presented.
        actual: Option<Revision>,
    },

    /// The document failed validation before reaching the journal.
    #[error("invalid document: {message}")]
    InvalidDocument {
        /// What was wrong.
        message: String,
    },

    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] docsync_storage::StorageError),

    /// I/O error outside the backend (directory, lock, rename).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A journal record could not be encoded or decoded.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// The journal is structurally damaged.
    #[error("journal corruption at offset {offset}: {message}")]
    JournalCorruption {
        /// Offset of the damaged frame.
        offset: u64,
        /// Description of the damage.
        message: String,
    },

    /// Checksum mismatch in a journal frame that is not the last one.
    #[error("checksum mismatch at offset {offset}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Offset of the frame.
        offset: u64,
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// Another process holds the store directory.
    #[error("store locked: another process has exclusive access")]
    DatabaseLocked,

    /// The store has been closed.
    #[error("store is closed")]
    DatabaseClosed,

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Why the operation was refused.
        message: String,
    },
}

impl CoreError {
    /// Creates a not-found error.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Creates a conflict error.
    pub fn conflict(
        id: impl Into<String>,
        expected: Option<Revision>,
        actual: Option<Revision>,
    ) -> Self {
        Self::Conflict {
            id: id.into(),
            expected,
            actual,
        }
    }

    /// Creates an invalid document error.
    pub fn invalid_document(message: impl Into<String>) -> Self {
        Self::InvalidDocument {
            message: message.into(),
        }
    }

    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// True for revision conflicts.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// True when the document does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_display_names_both_revisions() {
        let err = CoreError::conflict(
            "n1",
            Some(Revision::from("2-aaaa")),
            Some(Revision::from("1-bbbb")),
        );
        let msg = err.to_string();
        assert!(msg.contains("n1"));
        assert!(msg.contains("2-aaaa"));
        assert!(msg.contains("1-bbbb"));
        assert!(err.is_conflict());
        assert!(!err.is_not_found());
    }

    #[test]
    fn conflict_on_free_id() {
        let err = CoreError::conflict("n1", None, Some(Revision::from("1-x")));
        assert!(err.to_string().contains("<none>"));
    }
}
