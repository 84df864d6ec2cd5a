//! Error types for the sync layer.

use quire_core::OtError;
use thiserror::Error;

use crate::protocol::{DocumentId, RejectReason, Revision};
use crate::storage::StoreError;

/// Result type for server-side sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors returned by [`crate::SyncServer`] and [`crate::DocumentProcessor`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Malformed or out-of-bounds operation. Never persisted.
    #[error("invalid operation: {0}")]
    InvalidOperation(#[from] OtError),

    /// The client fell too far behind; fetch the missing range and retry.
    #[error("revision conflict: server is at revision {current_revision}")]
    RevisionConflict { current_revision: Revision },

    /// The client claims a revision the server never produced.
    #[error("unknown base revision {base_revision}, server is at {current_revision}")]
    UnknownRevision {
        base_revision: Revision,
        current_revision: Revision,
    },

    /// The document is being handed off to another node.
    #[error("document {document_id} is locked for hand-off")]
    DocumentLocked { document_id: DocumentId },

    /// Durable storage failed; the operation was not committed.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl SyncError {
    /// Whether the client may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::RevisionConflict { .. }
                | SyncError::DocumentLocked { .. }
                | SyncError::Storage(_)
        )
    }

    /// Wire form sent back in a reject message.
    pub fn reject_reason(&self) -> RejectReason {
        match self {
            SyncError::InvalidOperation(e) => RejectReason::InvalidOperation(e.to_string()),
            SyncError::RevisionConflict { current_revision } => RejectReason::RevisionConflict {
                current_revision: *current_revision,
            },
            SyncError::UnknownRevision {
                current_revision, ..
            } => RejectReason::UnknownRevision {
                current_revision: *current_revision,
            },
            SyncError::DocumentLocked { .. } => RejectReason::DocumentLocked,
            SyncError::Storage(e) => RejectReason::Storage(e.to_string()),
        }
    }
}

/// Errors raised by the client state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// An acknowledgement arrived while nothing was in flight.
    #[error("acknowledgement for revision {revision} with no pending operation")]
    UnexpectedAck { revision: Revision },

    /// A local or remote operation does not fit the local document.
    #[error("invalid operation: {0}")]
    InvalidOperation(#[from] OtError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_retryable_classification() {
        assert!(SyncError::RevisionConflict { current_revision: 4 }.is_retryable());
        assert!(SyncError::DocumentLocked { document_id: Uuid::nil() }.is_retryable());
        assert!(SyncError::Storage(StoreError::Unavailable("down".into())).is_retryable());
        assert!(!SyncError::InvalidOperation(OtError::EmptyComponent { index: 0 }).is_retryable());
    }

    #[test]
    fn test_reject_reason_mapping() {
        let err = SyncError::RevisionConflict { current_revision: 40 };
        assert_eq!(
            err.reject_reason(),
            RejectReason::RevisionConflict { current_revision: 40 }
        );
        assert_eq!(err.to_string(), "revision conflict: server is at revision 40");
    }

    #[test]
    fn test_from_ot_error() {
        let err: SyncError = OtError::LengthMismatch { base_len: 9, doc_len: 3 }.into();
        assert!(matches!(err, SyncError::InvalidOperation(_)));
    }
}
