//! In-memory storage adapter.
//!
//! Backs tests, the demo binary and single-process deployments that accept
//! losing state on restart.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use quire_core::Operation;

use super::{EntryMetadata, LogEntry, OperationLog, Snapshot, SnapshotStore, StoreError};
use crate::protocol::{DocumentId, Revision};

/// Operation log and snapshot store held in process memory.
#[derive(Default)]
pub struct MemoryStore {
    logs: RwLock<HashMap<DocumentId, BTreeMap<Revision, LogEntry>>>,
    snapshots: RwLock<HashMap<DocumentId, Vec<Snapshot>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total entries across all documents.
    pub fn entry_count(&self) -> usize {
        self.logs.read().values().map(BTreeMap::len).sum()
    }
}

impl OperationLog for MemoryStore {
    fn append(
        &self,
        document_id: DocumentId,
        revision: Revision,
        operation: &Operation,
        metadata: EntryMetadata,
    ) -> Result<(), StoreError> {
        let mut logs = self.logs.write();
        let log = logs.entry(document_id).or_default();
        let expected = log.keys().next_back().map_or(1, |head| head + 1);
        if revision != expected {
            return Err(StoreError::RevisionGap {
                document_id,
                expected,
                got: revision,
            });
        }
        log.insert(
            revision,
            LogEntry {
                revision,
                operation: operation.clone(),
                metadata,
                compactable: false,
            },
        );
        Ok(())
    }

    fn range(
        &self,
        document_id: DocumentId,
        from: Revision,
        to: Revision,
    ) -> Result<Vec<LogEntry>, StoreError> {
        if from > to {
            return Ok(Vec::new());
        }
        let logs = self.logs.read();
        Ok(logs
            .get(&document_id)
            .map(|log| log.range(from..=to).map(|(_, e)| e.clone()).collect())
            .unwrap_or_default())
    }

    fn head_revision(&self, document_id: DocumentId) -> Result<Revision, StoreError> {
        let logs = self.logs.read();
        Ok(logs
            .get(&document_id)
            .and_then(|log| log.keys().next_back().copied())
            .unwrap_or(0))
    }

    fn mark_compactable(
        &self,
        document_id: DocumentId,
        up_to: Revision,
    ) -> Result<u64, StoreError> {
        let mut logs = self.logs.write();
        let mut marked = 0;
        if let Some(log) = logs.get_mut(&document_id) {
            for entry in log.range_mut(..=up_to).map(|(_, e)| e) {
                if !entry.compactable {
                    entry.compactable = true;
                    marked += 1;
                }
            }
        }
        Ok(marked)
    }

    fn documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        Ok(self.logs.read().keys().copied().collect())
    }
}

impl SnapshotStore for MemoryStore {
    fn put_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let mut snapshots = self.snapshots.write();
        let history = snapshots.entry(snapshot.document_id).or_default();
        if history.last().is_some_and(|s| s.revision >= snapshot.revision) {
            return Ok(());
        }
        history.push(snapshot.clone());
        Ok(())
    }

    fn get_latest_snapshot(&self, document_id: DocumentId) -> Result<Option<Snapshot>, StoreError> {
        Ok(self
            .snapshots
            .read()
            .get(&document_id)
            .and_then(|history| history.last().cloned()))
    }

    fn snapshots(&self, document_id: DocumentId) -> Result<Vec<Snapshot>, StoreError> {
        Ok(self
            .snapshots
            .read()
            .get(&document_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_core::Document;
    use uuid::Uuid;

    fn append_n(store: &MemoryStore, doc: DocumentId, n: u64) {
        for rev in 1..=n {
            store
                .append(doc, rev, &Operation::new().insert("a"), EntryMetadata::new(Uuid::nil()))
                .unwrap();
        }
    }

    #[test]
    fn test_append_and_range_inclusive() {
        let store = MemoryStore::new();
        let doc = Uuid::new_v4();
        append_n(&store, doc, 5);

        let entries = store.range(doc, 2, 4).unwrap();
        let revisions: Vec<_> = entries.iter().map(|e| e.revision).collect();
        assert_eq!(revisions, vec![2, 3, 4]);
        assert_eq!(store.head_revision(doc).unwrap(), 5);
        assert_eq!(store.entry_count(), 5);
    }

    #[test]
    fn test_append_rejects_gap() {
        let store = MemoryStore::new();
        let doc = Uuid::new_v4();
        append_n(&store, doc, 2);
        let err = store
            .append(doc, 4, &Operation::new().insert("x"), EntryMetadata::new(Uuid::nil()))
            .unwrap_err();
        assert_eq!(err, StoreError::RevisionGap { document_id: doc, expected: 3, got: 4 });
        assert_eq!(store.head_revision(doc).unwrap(), 2);
    }

    #[test]
    fn test_range_of_unknown_document_is_empty() {
        let store = MemoryStore::new();
        assert!(store.range(Uuid::new_v4(), 1, 10).unwrap().is_empty());
        assert_eq!(store.head_revision(Uuid::new_v4()).unwrap(), 0);
        assert!(store.range(Uuid::new_v4(), 5, 1).unwrap().is_empty());
    }

    #[test]
    fn test_mark_compactable_keeps_entries() {
        let store = MemoryStore::new();
        let doc = Uuid::new_v4();
        append_n(&store, doc, 5);

        assert_eq!(store.mark_compactable(doc, 3).unwrap(), 3);
        assert_eq!(store.mark_compactable(doc, 3).unwrap(), 0);

        let entries = store.range(doc, 1, 5).unwrap();
        assert_eq!(entries.len(), 5);
        assert!(entries[..3].iter().all(|e| e.compactable));
        assert!(entries[3..].iter().all(|e| !e.compactable));
    }

    #[test]
    fn test_snapshot_history() {
        let store = MemoryStore::new();
        let doc = Uuid::new_v4();
        assert!(store.get_latest_snapshot(doc).unwrap().is_none());

        store.put_snapshot(&Snapshot::new(doc, 10, Document::from_text("ten"))).unwrap();
        store.put_snapshot(&Snapshot::new(doc, 20, Document::from_text("twenty"))).unwrap();

        let latest = store.get_latest_snapshot(doc).unwrap().unwrap();
        assert_eq!(latest.revision, 20);
        assert_eq!(latest.content.text(), "twenty");
        assert_eq!(store.snapshots(doc).unwrap().len(), 2);
    }

    #[test]
    fn test_snapshot_at_stored_revision_is_kept_once() {
        let store = MemoryStore::new();
        let doc = Uuid::new_v4();
        store.put_snapshot(&Snapshot::new(doc, 4, Document::from_text("first"))).unwrap();
        store.put_snapshot(&Snapshot::new(doc, 4, Document::from_text("second"))).unwrap();
        store.put_snapshot(&Snapshot::new(doc, 2, Document::from_text("older"))).unwrap();

        let history = store.snapshots(doc).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content.text(), "first");
    }

    #[test]
    fn test_documents_lists_logged_ids() {
        let store = MemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        append_n(&store, a, 1);
        append_n(&store, b, 1);
        let mut docs = store.documents().unwrap();
        docs.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(docs, expected);
    }
}
