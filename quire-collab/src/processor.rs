//! Per-document sequencing engine.
//!
//! ```text
//!  (client, base_rev, op)
//!          │
//!          ▼
//!   validate ──► lag check ──► transform against (base_rev, head] ──► apply
//!                                                                      │
//!                    ┌──────────────── append to OperationLog ◄────────┘
//!                    ▼
//!            revision += 1 ──► broadcast to other subscribers ──► ack
//! ```
//!
//! A processor is owned by exactly one lock in the server registry, so
//! everything here is synchronous: once a request holds the lock the
//! commit runs to completion without yielding.
//!
//! Reference: Nichols et al. — High-Latency, Low-Bandwidth Windowing in the
//! Jupiter Collaboration System (server-ordered OT)

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use quire_core::{transform, Document, OtError, Operation, Priority};

use crate::broadcast::{BroadcastGroup, Subscription};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{ClientId, DocumentId, RemoteOperationMessage, Revision};
use crate::storage::{
    ensure_contiguous, replay, EntryMetadata, LogEntry, OperationLog, Snapshot, SnapshotStore,
    StoreError,
};

/// Where a loaded document is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Serving requests
    Active,
    /// Idle and selected for unloading; any request moves it back to `Active`
    Evicting,
    /// Being released to another node; requests fail with `DocumentLocked`
    HandingOff,
    /// Dropped from the registry; holders must look the document up again
    Unloaded,
}

/// Knobs for a single processor, derived from the server config.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub max_revision_lag: u64,
    pub broadcast_capacity: usize,
    /// Most recent log entries kept in memory for transforms and catch-up
    pub history_cache: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_revision_lag: 100,
            broadcast_capacity: 256,
            history_cache: 256,
        }
    }
}

/// In-memory state of one document.
#[derive(Debug)]
pub struct DocumentState {
    pub document_id: DocumentId,
    pub revision: Revision,
    pub content: Document,
    pub connected_clients: HashSet<ClientId>,
    pub lifecycle: Lifecycle,
    pub last_activity: Instant,
    pub last_snapshot_revision: Revision,
}

/// Sequencing authority for one document.
pub struct DocumentProcessor {
    state: DocumentState,
    history: VecDeque<LogEntry>,
    log: Arc<dyn OperationLog>,
    snapshots: Arc<dyn SnapshotStore>,
    broadcast: BroadcastGroup,
    config: ProcessorConfig,
}

impl DocumentProcessor {
    /// Rebuild a document from its latest snapshot plus the log tail.
    pub fn load(
        document_id: DocumentId,
        log: Arc<dyn OperationLog>,
        snapshots: Arc<dyn SnapshotStore>,
        config: ProcessorConfig,
    ) -> Result<Self, StoreError> {
        let (base_revision, base) = match snapshots.get_latest_snapshot(document_id)? {
            Some(snapshot) => (snapshot.revision, snapshot.content),
            None => (0, Document::new()),
        };

        let head = log.head_revision(document_id)?;
        if head < base_revision {
            return Err(StoreError::MissingRange {
                document_id,
                from: head + 1,
                to: base_revision,
            });
        }

        let tail = log.range(document_id, base_revision + 1, head)?;
        ensure_contiguous(document_id, &tail, base_revision + 1, head)?;
        let content = replay(document_id, base, &tail)?;

        let skip = tail.len().saturating_sub(config.history_cache);
        let history: VecDeque<LogEntry> = tail.into_iter().skip(skip).collect();

        log::info!(
            "Loaded document {document_id} at revision {head} (snapshot {base_revision}, replayed {})",
            head - base_revision
        );

        Ok(Self {
            state: DocumentState {
                document_id,
                revision: head,
                content,
                connected_clients: HashSet::new(),
                lifecycle: Lifecycle::Active,
                last_activity: Instant::now(),
                last_snapshot_revision: base_revision,
            },
            history,
            log,
            snapshots,
            broadcast: BroadcastGroup::new(config.broadcast_capacity),
            config,
        })
    }

    /// Sequence one client operation.
    ///
    /// On success the operation has been durably appended, the revision
    /// advanced and the transformed operation broadcast. On any error the
    /// document is left exactly as it was.
    pub fn process_operation(
        &mut self,
        client_id: ClientId,
        base_revision: Revision,
        operation: Operation,
    ) -> SyncResult<(Revision, Operation)> {
        self.touch()?;
        let document_id = self.state.document_id;
        let current = self.state.revision;

        if let Err(e) = operation.validate() {
            log::warn!("Rejected malformed operation from {client_id} on {document_id}: {e}");
            return Err(e.into());
        }
        if base_revision > current {
            return Err(SyncError::UnknownRevision {
                base_revision,
                current_revision: current,
            });
        }
        if current - base_revision > self.config.max_revision_lag {
            log::debug!(
                "Client {client_id} is {} revisions behind on {document_id}",
                current - base_revision
            );
            return Err(SyncError::RevisionConflict {
                current_revision: current,
            });
        }

        let intervening = self.entries_between(base_revision + 1, current)?;
        let base_len = intervening
            .iter()
            .try_fold(self.state.content.len(), |len, entry| {
                len.checked_add_signed(entry.operation.len_delta().checked_neg()?)
            })
            .unwrap_or(usize::MAX);
        if operation.base_len() > base_len {
            let e = OtError::LengthMismatch {
                base_len: operation.base_len(),
                doc_len: base_len,
            };
            log::warn!("Rejected operation from {client_id} on {document_id}: {e}");
            return Err(e.into());
        }

        let mut transformed = operation;
        for entry in &intervening {
            transformed = transform(&transformed, &entry.operation, Priority::Right).0;
        }

        let content = match self.state.content.apply(&transformed) {
            Ok(content) => content,
            Err(e) => {
                log::warn!("Rejected operation from {client_id} on {document_id}: {e}");
                return Err(e.into());
            }
        };

        let revision = current + 1;
        let metadata = EntryMetadata::new(client_id);
        if let Err(e) = self.log.append(document_id, revision, &transformed, metadata.clone()) {
            log::error!("Failed to append revision {revision} of {document_id}: {e}");
            return Err(e.into());
        }

        self.state.revision = revision;
        self.state.content = content;
        self.remember(LogEntry {
            revision,
            operation: transformed.clone(),
            metadata,
            compactable: false,
        });

        self.broadcast.broadcast(RemoteOperationMessage {
            document_id,
            revision,
            operation: transformed.clone(),
            origin_client_id: client_id,
        });

        log::trace!("Committed revision {revision} of {document_id} from {client_id}");
        Ok((revision, transformed))
    }

    /// Committed entries `from..=to`, served from memory when possible.
    pub fn entries_between(&self, from: Revision, to: Revision) -> Result<Vec<LogEntry>, StoreError> {
        if from > to {
            return Ok(Vec::new());
        }
        let document_id = self.state.document_id;
        if let Some(oldest) = self.history.front() {
            if oldest.revision <= from {
                let start = (from - oldest.revision) as usize;
                let count = (to - from + 1) as usize;
                return Ok(self.history.iter().skip(start).take(count).cloned().collect());
            }
        }
        let entries = self.log.range(document_id, from, to)?;
        ensure_contiguous(document_id, &entries, from, to)?;
        Ok(entries)
    }

    pub fn subscribe(&mut self, client_id: ClientId) -> SyncResult<Subscription> {
        self.touch()?;
        self.state.connected_clients.insert(client_id);
        log::debug!("Client {client_id} subscribed to {}", self.state.document_id);
        Ok(self.broadcast.subscribe(self.state.document_id, client_id))
    }

    pub fn unsubscribe(&mut self, client_id: ClientId) {
        if self.state.connected_clients.remove(&client_id) {
            self.state.last_activity = Instant::now();
            log::debug!("Client {client_id} left {}", self.state.document_id);
        }
    }

    /// Write a snapshot at the current revision unless one already exists.
    pub fn snapshot(&mut self) -> Result<Option<Snapshot>, StoreError> {
        if self.state.revision == self.state.last_snapshot_revision {
            return Ok(None);
        }
        let stored = self
            .snapshots
            .get_latest_snapshot(self.state.document_id)?
            .map(|s| s.revision);
        if stored.is_some_and(|revision| revision >= self.state.revision) {
            self.state.last_snapshot_revision = self.state.revision;
            return Ok(None);
        }
        let snapshot = Snapshot::new(
            self.state.document_id,
            self.state.revision,
            self.state.content.clone(),
        );
        self.snapshots.put_snapshot(&snapshot)?;
        self.state.last_snapshot_revision = snapshot.revision;
        log::info!(
            "Snapshot of {} written at revision {}",
            snapshot.document_id,
            snapshot.revision
        );
        Ok(Some(snapshot))
    }

    /// Idle for at least `timeout` with nobody connected.
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        self.state.lifecycle == Lifecycle::Active
            && self.state.connected_clients.is_empty()
            && now.saturating_duration_since(self.state.last_activity) >= timeout
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lifecycle
    }

    pub(crate) fn set_lifecycle(&mut self, lifecycle: Lifecycle) {
        self.state.lifecycle = lifecycle;
    }

    pub fn state(&self) -> &DocumentState {
        &self.state
    }

    pub fn revision(&self) -> Revision {
        self.state.revision
    }

    pub fn content(&self) -> &Document {
        &self.state.content
    }

    pub fn broadcast(&self) -> &BroadcastGroup {
        &self.broadcast
    }

    /// Record a request: cancels a pending eviction, refuses during hand-off.
    pub(crate) fn touch(&mut self) -> SyncResult<()> {
        match self.state.lifecycle {
            Lifecycle::HandingOff => {
                return Err(SyncError::DocumentLocked {
                    document_id: self.state.document_id,
                })
            }
            Lifecycle::Evicting => {
                log::debug!("Eviction of {} cancelled by request", self.state.document_id);
                self.state.lifecycle = Lifecycle::Active;
            }
            Lifecycle::Active | Lifecycle::Unloaded => {}
        }
        self.state.last_activity = Instant::now();
        Ok(())
    }

    fn remember(&mut self, entry: LogEntry) {
        if self.config.history_cache == 0 {
            return;
        }
        if self.history.len() == self.config.history_cache {
            self.history.pop_front();
        }
        self.history.push_back(entry);
    }
}
