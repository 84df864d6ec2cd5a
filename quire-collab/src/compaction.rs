//! Background snapshotting and log compaction.
//!
//! ```text
//!   latest snapshot @ S        log entries S+1 ..= head
//!  ┌──────────────────┐      ┌─────┬─────┬─────┬─────┬─────┐
//!  │ Document         │  ──► │ S+1 │ S+2 │ ... │ ... │head │  replay
//!  └──────────────────┘      └─────┴─────┴─────┴─────┴─────┘
//!                                          │
//!                 new snapshot @ head ◄────┘
//!                 entries <= head - retain  → compactable
//! ```
//!
//! Runs purely against storage, so it never takes a document lock. Entries
//! are only marked; physical removal is left to the storage backend.
//!
//! Performance target: snapshot of a 10k-operation document < 50ms

use std::sync::Arc;
use std::time::Duration;

use quire_core::Document;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::protocol::{DocumentId, Revision};
use crate::storage::{
    ensure_contiguous, now_millis, replay, OperationLog, Snapshot, SnapshotStore, StoreError,
};

/// Compaction tuning.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Snapshot once this many operations accumulated since the last one
    pub threshold: u64,
    /// Snapshot when the last one is older than this and anything changed
    pub interval: Duration,
    /// Most recent entries never marked compactable
    pub retain: u64,
    /// How often the background task sweeps all documents
    pub sweep_interval: Duration,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            threshold: 1000,
            interval: Duration::from_secs(60 * 60),
            retain: 100,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl CompactionConfig {
    pub fn for_testing() -> Self {
        Self {
            threshold: 10,
            interval: Duration::from_secs(60 * 60),
            retain: 3,
            sweep_interval: Duration::from_millis(10),
        }
    }
}

/// Outcome of compacting one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionReport {
    pub document_id: DocumentId,
    pub snapshot_revision: Revision,
    /// Entries newly marked compactable
    pub marked: u64,
}

pub struct CompactionWorker {
    config: CompactionConfig,
    log: Arc<dyn OperationLog>,
    snapshots: Arc<dyn SnapshotStore>,
}

impl CompactionWorker {
    pub fn new(
        config: CompactionConfig,
        log: Arc<dyn OperationLog>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            config,
            log,
            snapshots,
        }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Whether `document_id` is due for a new snapshot.
    pub fn should_compact(&self, document_id: DocumentId) -> Result<bool, StoreError> {
        let head = self.log.head_revision(document_id)?;
        let latest = self.snapshots.get_latest_snapshot(document_id)?;
        let since = latest.as_ref().map_or(0, |s| s.revision);

        if head <= since {
            return Ok(false);
        }
        if head - since >= self.config.threshold {
            return Ok(true);
        }
        // Without a snapshot, age is measured from the first entry
        let last_snapshot_at = match latest {
            Some(snapshot) => snapshot.created_at,
            None => self
                .log
                .range(document_id, 1, 1)?
                .first()
                .map_or(now_millis(), |e| e.metadata.committed_at),
        };
        let age_ms = now_millis().saturating_sub(last_snapshot_at);
        Ok(age_ms >= self.config.interval.as_millis() as u64)
    }

    /// Write a snapshot at head and mark everything but the newest
    /// `retain` entries compactable.
    ///
    /// Returns `None` when the latest snapshot is already at head.
    pub fn compact_document(
        &self,
        document_id: DocumentId,
    ) -> Result<Option<CompactionReport>, StoreError> {
        let head = self.log.head_revision(document_id)?;
        let (base_revision, base) = match self.snapshots.get_latest_snapshot(document_id)? {
            Some(snapshot) => (snapshot.revision, snapshot.content),
            None => (0, Document::new()),
        };
        if base_revision >= head {
            return Ok(None);
        }

        let tail = self.log.range(document_id, base_revision + 1, head)?;
        ensure_contiguous(document_id, &tail, base_revision + 1, head)?;
        let content = replay(document_id, base, &tail)?;

        self.snapshots
            .put_snapshot(&Snapshot::new(document_id, head, content))?;

        let marked = match head.checked_sub(self.config.retain) {
            Some(up_to) if up_to > 0 => self.log.mark_compactable(document_id, up_to)?,
            _ => 0,
        };

        log::info!(
            "Compacted document {document_id}: snapshot at {head}, {marked} entries marked"
        );
        Ok(Some(CompactionReport {
            document_id,
            snapshot_revision: head,
            marked,
        }))
    }

    /// Sweep every document in the log once. Failures are logged and skipped.
    pub fn run_once(&self) -> Vec<CompactionReport> {
        let documents = match self.log.documents() {
            Ok(documents) => documents,
            Err(e) => {
                log::error!("Compaction sweep could not list documents: {e}");
                return Vec::new();
            }
        };

        let mut reports = Vec::new();
        for document_id in documents {
            let result = self
                .should_compact(document_id)
                .and_then(|due| {
                    if due {
                        self.compact_document(document_id)
                    } else {
                        Ok(None)
                    }
                });
            match result {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {}
                Err(e) => log::error!("Compaction of document {document_id} failed: {e}"),
            }
        }
        reports
    }

    /// Run [`CompactionWorker::run_once`] every `sweep_interval` until
    /// `shutdown` flips to true or its sender is dropped.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.sweep_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let worker = self.clone();
                        match tokio::task::spawn_blocking(move || worker.run_once()).await {
                            Ok(reports) if !reports.is_empty() => {
                                log::debug!("Compaction sweep wrote {} snapshots", reports.len());
                            }
                            Ok(_) => {}
                            Err(e) => log::error!("Compaction sweep panicked: {e}"),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            log::info!("Compaction worker stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{EntryMetadata, MemoryStore};
    use quire_core::Operation;
    use uuid::Uuid;

    fn store_with(doc: DocumentId, ops: usize) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for rev in 1..=ops as u64 {
            store
                .append(doc, rev, &Operation::new().insert("a"), EntryMetadata::new(Uuid::nil()))
                .unwrap();
        }
        store
    }

    fn worker(store: &Arc<MemoryStore>) -> CompactionWorker {
        CompactionWorker::new(CompactionConfig::for_testing(), store.clone(), store.clone())
    }

    #[test]
    fn test_config_default() {
        let config = CompactionConfig::default();
        assert_eq!(config.threshold, 1000);
        assert_eq!(config.retain, 100);
        assert_eq!(config.interval, Duration::from_secs(3600));
    }

    #[test]
    fn test_threshold_triggers() {
        let doc = Uuid::new_v4();
        let store = store_with(doc, 9);
        let worker = worker(&store);
        assert!(!worker.should_compact(doc).unwrap());

        store
            .append(doc, 10, &Operation::new().insert("a"), EntryMetadata::new(Uuid::nil()))
            .unwrap();
        assert!(worker.should_compact(doc).unwrap());
    }

    #[test]
    fn test_interval_triggers_only_with_new_ops() {
        let doc = Uuid::new_v4();
        let store = store_with(doc, 2);
        let mut config = CompactionConfig::for_testing();
        config.interval = Duration::ZERO;
        let worker = CompactionWorker::new(config, store.clone(), store.clone());

        assert!(worker.should_compact(doc).unwrap());
        worker.compact_document(doc).unwrap();
        assert!(!worker.should_compact(doc).unwrap());
    }

    #[test]
    fn test_compact_writes_snapshot_and_marks() {
        let doc = Uuid::new_v4();
        let store = store_with(doc, 12);
        let worker = worker(&store);

        let report = worker.compact_document(doc).unwrap().unwrap();
        assert_eq!(report.snapshot_revision, 12);
        assert_eq!(report.marked, 9);

        let snapshot = store.get_latest_snapshot(doc).unwrap().unwrap();
        assert_eq!(snapshot.content.text(), "a".repeat(12));

        let entries = store.range(doc, 1, 12).unwrap();
        assert!(entries[..9].iter().all(|e| e.compactable));
        assert!(entries[9..].iter().all(|e| !e.compactable));
        assert!(worker.compact_document(doc).unwrap().is_none());
    }

    #[test]
    fn test_compaction_builds_on_previous_snapshot() {
        let doc = Uuid::new_v4();
        let store = store_with(doc, 12);
        let worker = worker(&store);
        worker.compact_document(doc).unwrap();

        for rev in 13..=15 {
            store
                .append(doc, rev, &Operation::new().insert("b"), EntryMetadata::new(Uuid::nil()))
                .unwrap();
        }
        worker.compact_document(doc).unwrap();
        let snapshot = store.get_latest_snapshot(doc).unwrap().unwrap();
        assert_eq!(snapshot.revision, 15);
        assert_eq!(snapshot.content.text(), format!("bbb{}", "a".repeat(12)));
        assert_eq!(store.snapshots(doc).unwrap().len(), 2);
    }

    #[test]
    fn test_run_once_sweeps_due_documents() {
        let busy = Uuid::new_v4();
        let quiet = Uuid::new_v4();
        let store = store_with(busy, 10);
        store
            .append(quiet, 1, &Operation::new().insert("q"), EntryMetadata::new(Uuid::nil()))
            .unwrap();

        let reports = worker(&store).run_once();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].document_id, busy);
    }

    #[tokio::test]
    async fn test_spawned_worker_stops_on_shutdown() {
        let doc = Uuid::new_v4();
        let store = store_with(doc, 10);
        let worker = Arc::new(worker(&store));
        let (tx, rx) = watch::channel(false);
        let handle = worker.spawn(rx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.get_latest_snapshot(doc).unwrap().is_some());

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
