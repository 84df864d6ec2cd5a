//! Binary protocol between clients and the sync server.
//!
//! Wire format (bincode-encoded `SyncMessage`):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────────┐
//! │ variant  │ doc_id    │ client   │ revision │ operation    │
//! │ varint   │ 16 bytes  │ 16 bytes │ varint   │ variable     │
//! └──────────┴───────────┴──────────┴──────────┴──────────────┘
//! ```
//!
//! Inbound: `Operation`, `FetchRange`. Outbound: `Ack`, `Remote`, `Reject`,
//! `Range`. Framing and reconnection belong to the transport and are not
//! modelled here.
//!
//! Performance target: encode < 1µs for a typical single-keystroke operation.

use quire_core::Operation;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::storage::LogEntry;

pub type DocumentId = Uuid;
pub type ClientId = Uuid;
/// Per-document version counter; 0 is the empty document.
pub type Revision = u64;

/// A client submitting an edit made against `base_revision`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationMessage {
    pub document_id: DocumentId,
    pub client_id: ClientId,
    pub base_revision: Revision,
    pub operation: Operation,
}

/// Acknowledgement to the submitting client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckMessage {
    pub document_id: DocumentId,
    pub revision: Revision,
    /// The operation as committed, after transformation
    pub operation: Operation,
}

/// A committed operation fanned out to every other subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteOperationMessage {
    pub document_id: DocumentId,
    pub revision: Revision,
    pub operation: Operation,
    pub origin_client_id: ClientId,
}

/// Why a submission was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    InvalidOperation(String),
    RevisionConflict { current_revision: Revision },
    UnknownRevision { current_revision: Revision },
    DocumentLocked,
    Storage(String),
}

/// Refusal sent to the submitting client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectMessage {
    pub document_id: DocumentId,
    pub client_id: ClientId,
    pub reason: RejectReason,
}

/// Catch-up request for committed revisions `from..=to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRangeMessage {
    pub document_id: DocumentId,
    pub client_id: ClientId,
    pub from: Revision,
    pub to: Revision,
}

/// Catch-up response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeMessage {
    pub document_id: DocumentId,
    pub entries: Vec<LogEntry>,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    Operation(OperationMessage),
    Ack(AckMessage),
    Remote(RemoteOperationMessage),
    Reject(RejectMessage),
    FetchRange(FetchRangeMessage),
    Range(RangeMessage),
}

impl SyncMessage {
    /// Create an operation submission.
    pub fn operation(
        document_id: DocumentId,
        client_id: ClientId,
        base_revision: Revision,
        operation: Operation,
    ) -> Self {
        SyncMessage::Operation(OperationMessage {
            document_id,
            client_id,
            base_revision,
            operation,
        })
    }

    /// Create an acknowledgement.
    pub fn ack(document_id: DocumentId, revision: Revision, operation: Operation) -> Self {
        SyncMessage::Ack(AckMessage {
            document_id,
            revision,
            operation,
        })
    }

    /// Create a remote operation broadcast.
    pub fn remote(
        document_id: DocumentId,
        revision: Revision,
        operation: Operation,
        origin_client_id: ClientId,
    ) -> Self {
        SyncMessage::Remote(RemoteOperationMessage {
            document_id,
            revision,
            operation,
            origin_client_id,
        })
    }

    /// Create a rejection.
    pub fn reject(document_id: DocumentId, client_id: ClientId, reason: RejectReason) -> Self {
        SyncMessage::Reject(RejectMessage {
            document_id,
            client_id,
            reason,
        })
    }

    /// Document the message concerns.
    pub fn document_id(&self) -> DocumentId {
        match self {
            SyncMessage::Operation(m) => m.document_id,
            SyncMessage::Ack(m) => m.document_id,
            SyncMessage::Remote(m) => m.document_id,
            SyncMessage::Reject(m) => m.document_id,
            SyncMessage::FetchRange(m) => m.document_id,
            SyncMessage::Range(m) => m.document_id,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    ///
    /// Operations are structurally validated here; length checks against
    /// the document happen in the processor.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _): (SyncMessage, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::EntryMetadata;

    #[test]
    fn test_operation_message_roundtrip() {
        let doc = Uuid::new_v4();
        let client = Uuid::new_v4();
        let op = Operation::new().retain(3).insert("abc").delete(1);
        let msg = SyncMessage::operation(doc, client, 7, op);

        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.document_id(), doc);
    }

    #[test]
    fn test_reject_carries_current_revision() {
        let msg = SyncMessage::reject(
            Uuid::new_v4(),
            Uuid::new_v4(),
            RejectReason::RevisionConflict { current_revision: 40 },
        );
        match SyncMessage::decode(&msg.encode().unwrap()).unwrap() {
            SyncMessage::Reject(r) => {
                assert_eq!(r.reason, RejectReason::RevisionConflict { current_revision: 40 })
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_range_message_roundtrip() {
        let doc = Uuid::new_v4();
        let entry = LogEntry {
            revision: 1,
            operation: Operation::new().insert("x"),
            metadata: EntryMetadata::new(Uuid::new_v4()),
            compactable: false,
        };
        let msg = SyncMessage::Range(RangeMessage {
            document_id: doc,
            entries: vec![entry],
        });
        assert_eq!(SyncMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result = SyncMessage::decode(&[0xFF, 0xFF, 0xFF]);
        assert!(matches!(result, Err(ProtocolError::Deserialization(_))));
    }

    #[test]
    fn test_typical_keystroke_is_small() {
        let msg = SyncMessage::operation(
            Uuid::new_v4(),
            Uuid::new_v4(),
            1200,
            Operation::new().retain(500).insert("a"),
        );
        assert!(msg.encode().unwrap().len() < 64);
    }
}
