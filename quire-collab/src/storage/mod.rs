//! Durable storage for committed operations and snapshots.
//!
//! Architecture:
//! ```text
//! ┌──────────────────┐  append (before ack)  ┌──────────────────────┐
//! │ DocumentProcessor│ ────────────────────► │ OperationLog         │
//! │                  │  range (catch-up)     │ doc:rev → LogEntry   │
//! └────────┬─────────┘ ◄──────────────────── └──────────┬───────────┘
//!          │ rebuild                                    │ replay
//!          ▼                                            ▼
//! ┌──────────────────┐   put / latest        ┌──────────────────────┐
//! │ Document @ head  │ ◄──────────────────── │ SnapshotStore        │
//! └──────────────────┘                       │ doc:rev → Snapshot   │
//!                                            └──────────────────────┘
//! ```
//!
//! Both traits are synchronous: adapters are called while the per-document
//! lock is held and an append must be durable before the call returns.
//! Implementations: [`memory::MemoryStore`] and, with the `rocksdb` feature,
//! [`rocks::RocksStore`].
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 3

pub mod memory;
#[cfg(feature = "rocksdb")]
pub mod rocks;

use std::time::SystemTime;

use quire_core::{Document, Operation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{ClientId, DocumentId, Revision};

pub use memory::MemoryStore;
#[cfg(feature = "rocksdb")]
pub use rocks::{RocksStore, StoreConfig};

/// Who committed an entry, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub client_id: ClientId,
    /// Milliseconds since the Unix epoch
    pub committed_at: u64,
}

impl EntryMetadata {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            committed_at: now_millis(),
        }
    }
}

/// One committed operation. `revision` is the revision the operation produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub revision: Revision,
    pub operation: Operation,
    pub metadata: EntryMetadata,
    /// Covered by a snapshot and eligible for physical removal
    pub compactable: bool,
}

/// Full materialized document at a revision. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub document_id: DocumentId,
    pub revision: Revision,
    pub content: Document,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
}

impl Snapshot {
    pub fn new(document_id: DocumentId, revision: Revision, content: Document) -> Self {
        Self {
            document_id,
            revision,
            content,
            created_at: now_millis(),
        }
    }
}

/// Append-only, per-document operation log.
pub trait OperationLog: Send + Sync {
    /// Durably record the operation that produced `revision`.
    ///
    /// `revision` must be exactly one past the current head.
    fn append(
        &self,
        document_id: DocumentId,
        revision: Revision,
        operation: &Operation,
        metadata: EntryMetadata,
    ) -> Result<(), StoreError>;

    /// Entries with `from <= revision <= to`, in revision order.
    fn range(
        &self,
        document_id: DocumentId,
        from: Revision,
        to: Revision,
    ) -> Result<Vec<LogEntry>, StoreError>;

    /// Highest committed revision (0 when nothing was ever appended).
    fn head_revision(&self, document_id: DocumentId) -> Result<Revision, StoreError>;

    /// Flag entries `<= up_to` as compactable. Returns how many changed.
    fn mark_compactable(&self, document_id: DocumentId, up_to: Revision)
        -> Result<u64, StoreError>;

    /// Every document with at least one entry.
    fn documents(&self) -> Result<Vec<DocumentId>, StoreError>;
}

/// Snapshot storage. Older snapshots are superseded, never deleted.
pub trait SnapshotStore: Send + Sync {
    /// Stored snapshots are immutable: a snapshot at or below the latest
    /// stored revision is ignored.
    fn put_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError>;

    fn get_latest_snapshot(&self, document_id: DocumentId) -> Result<Option<Snapshot>, StoreError>;

    /// All snapshots of a document, oldest first.
    fn snapshots(&self, document_id: DocumentId) -> Result<Vec<Snapshot>, StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("checksum mismatch for document {document_id} at revision {revision}")]
    ChecksumMismatch {
        document_id: DocumentId,
        revision: Revision,
    },

    #[error("revision gap for document {document_id}: expected {expected}, got {got}")]
    RevisionGap {
        document_id: DocumentId,
        expected: Revision,
        got: Revision,
    },

    #[error("log for document {document_id} is missing revisions {from}..={to}")]
    MissingRange {
        document_id: DocumentId,
        from: Revision,
        to: Revision,
    },

    #[error("replay of document {document_id} failed at revision {revision}: {reason}")]
    Replay {
        document_id: DocumentId,
        revision: Revision,
        reason: String,
    },

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Apply `entries` in order on top of `base`.
pub fn replay(
    document_id: DocumentId,
    base: Document,
    entries: &[LogEntry],
) -> Result<Document, StoreError> {
    entries.iter().try_fold(base, |doc, entry| {
        doc.apply(&entry.operation).map_err(|e| StoreError::Replay {
            document_id,
            revision: entry.revision,
            reason: e.to_string(),
        })
    })
}

/// Confirm `entries` hold exactly `from..=to` with no holes.
pub(crate) fn ensure_contiguous(
    document_id: DocumentId,
    entries: &[LogEntry],
    from: Revision,
    to: Revision,
) -> Result<(), StoreError> {
    if from > to {
        return Ok(());
    }
    for (offset, entry) in entries.iter().enumerate() {
        let expected = from + offset as u64;
        if entry.revision != expected {
            return Err(StoreError::MissingRange {
                document_id,
                from: expected,
                to,
            });
        }
    }
    let covered = entries.len() as u64;
    if covered < to - from + 1 {
        return Err(StoreError::MissingRange {
            document_id,
            from: from + covered,
            to,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn entry(revision: Revision) -> LogEntry {
        LogEntry {
            revision,
            operation: Operation::new().insert("x"),
            metadata: EntryMetadata::new(Uuid::nil()),
            compactable: false,
        }
    }

    #[test]
    fn test_ensure_contiguous_accepts_full_range() {
        let doc = Uuid::new_v4();
        let entries = vec![entry(3), entry(4), entry(5)];
        assert!(ensure_contiguous(doc, &entries, 3, 5).is_ok());
        assert!(ensure_contiguous(doc, &[], 6, 5).is_ok());
    }

    #[test]
    fn test_ensure_contiguous_reports_hole() {
        let doc = Uuid::new_v4();
        let entries = vec![entry(3), entry(5)];
        assert_eq!(
            ensure_contiguous(doc, &entries, 3, 5),
            Err(StoreError::MissingRange { document_id: doc, from: 4, to: 5 })
        );
    }

    #[test]
    fn test_ensure_contiguous_reports_short_tail() {
        let doc = Uuid::new_v4();
        let entries = vec![entry(1), entry(2)];
        assert_eq!(
            ensure_contiguous(doc, &entries, 1, 4),
            Err(StoreError::MissingRange { document_id: doc, from: 3, to: 4 })
        );
    }

    #[test]
    fn test_replay_applies_in_order() {
        let doc = Uuid::new_v4();
        let mut first = entry(1);
        first.operation = Operation::new().insert("ab");
        let mut second = entry(2);
        second.operation = Operation::new().retain(1).insert("X");
        let content = replay(doc, Document::new(), &[first, second]).unwrap();
        assert_eq!(content.text(), "aXb");
    }

    #[test]
    fn test_replay_reports_bad_entry() {
        let doc = Uuid::new_v4();
        let mut bad = entry(7);
        bad.operation = Operation::new().delete(3);
        assert!(matches!(
            replay(doc, Document::from_text("a"), &[bad]),
            Err(StoreError::Replay { revision: 7, .. })
        ));
    }

    #[test]
    fn test_metadata_timestamp_is_set() {
        let meta = EntryMetadata::new(Uuid::new_v4());
        assert!(meta.committed_at > 0);
    }
}
