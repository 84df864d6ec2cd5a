//! Sync server: a keyed registry of document processors.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── Slot(doc 1) ── Mutex<DocumentProcessor>
//!             ├── SyncServer ───────┤                        │
//! Client B ──┘   RwLock<HashMap>    └── Slot(doc 2) ...      ├── OperationLog
//!                                                            ├── SnapshotStore
//!                                                            └── BroadcastGroup
//!                                                                   │
//!                                                       ┌───────────┼───────────┐
//!                                                       ▼           ▼           ▼
//!                                                   Client A    Client B    Client C
//! ```
//!
//! Each document is serialized by its own mutex; different documents run in
//! parallel. Lifecycle:
//! ```text
//!  Unloaded ──first request──► Active ──idle sweep──► Evicting ──► Unloaded
//!                                ▲                       │
//!                                └────── any request ────┘
//!  Active ──hand_off──► HandingOff ──► released
//! ```
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapters 5 & 9

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex as SyncMutex;
use quire_core::{Document, Operation};
use tokio::sync::{watch, Mutex, OwnedMappedMutexGuard, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;

use crate::broadcast::Subscription;
use crate::error::{SyncError, SyncResult};
use crate::processor::{DocumentProcessor, Lifecycle, ProcessorConfig};
use crate::protocol::{ClientId, DocumentId, RangeMessage, Revision, SyncMessage};
use crate::storage::{LogEntry, MemoryStore, OperationLog, Snapshot, SnapshotStore};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Oldest base revision accepted, counted back from the head
    pub max_revision_lag: u64,
    /// Inactivity before an unattended document is unloaded
    pub idle_timeout: Duration,
    /// Broadcast channel capacity per document
    pub broadcast_capacity: usize,
    /// Recent log entries kept in memory per document
    pub history_cache: usize,
    /// Write a snapshot before unloading a document
    pub snapshot_on_evict: bool,
    /// Rejected operations tolerated per client before it is flagged
    pub max_invalid_operations: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_revision_lag: 100,
            idle_timeout: Duration::from_secs(5 * 60),
            broadcast_capacity: 256,
            history_cache: 256,
            snapshot_on_evict: true,
            max_invalid_operations: 5,
        }
    }
}

impl ServerConfig {
    /// Small buffers and an immediate idle timeout.
    pub fn for_testing() -> Self {
        Self {
            max_revision_lag: 10,
            idle_timeout: Duration::ZERO,
            broadcast_capacity: 16,
            history_cache: 8,
            snapshot_on_evict: true,
            max_invalid_operations: 3,
        }
    }

    fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            max_revision_lag: self.max_revision_lag,
            broadcast_capacity: self.broadcast_capacity,
            history_cache: self.history_cache,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub loaded_documents: usize,
    pub operations_committed: u64,
    pub operations_rejected: u64,
    pub revision_conflicts: u64,
    pub documents_loaded: u64,
    pub documents_evicted: u64,
    pub snapshots_written: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    operations_committed: AtomicU64,
    operations_rejected: AtomicU64,
    revision_conflicts: AtomicU64,
    documents_loaded: AtomicU64,
    documents_evicted: AtomicU64,
    snapshots_written: AtomicU64,
}

/// Registry entry. Empty until the first request loads the document.
type Slot = Arc<Mutex<Option<DocumentProcessor>>>;
type ProcessorGuard = OwnedMappedMutexGuard<Option<DocumentProcessor>, DocumentProcessor>;

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    log: Arc<dyn OperationLog>,
    snapshots: Arc<dyn SnapshotStore>,
    documents: RwLock<HashMap<DocumentId, Slot>>,
    offenders: SyncMutex<HashMap<ClientId, u32>>,
    stats: AtomicServerStats,
}

impl SyncServer {
    pub fn new(
        config: ServerConfig,
        log: Arc<dyn OperationLog>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            config,
            log,
            snapshots,
            documents: RwLock::new(HashMap::new()),
            offenders: SyncMutex::new(HashMap::new()),
            stats: AtomicServerStats::default(),
        }
    }

    /// Server backed by a fresh [`MemoryStore`].
    pub fn in_memory(config: ServerConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::new(config, store.clone(), store)
    }

    /// Sequence an operation; see [`DocumentProcessor::process_operation`].
    ///
    /// The only suspension point is waiting for the document lock. Once it
    /// is held the commit completes even if the caller goes away.
    pub async fn process_operation(
        &self,
        document_id: DocumentId,
        client_id: ClientId,
        base_revision: Revision,
        operation: Operation,
    ) -> SyncResult<(Revision, Operation)> {
        let mut processor = self.acquire(document_id).await?;
        let result = processor.process_operation(client_id, base_revision, operation);
        drop(processor);

        match &result {
            Ok(_) => {
                self.stats.operations_committed.fetch_add(1, Ordering::Relaxed);
            }
            Err(SyncError::InvalidOperation(_)) => {
                self.stats.operations_rejected.fetch_add(1, Ordering::Relaxed);
                self.record_offence(client_id);
            }
            Err(SyncError::RevisionConflict { .. }) => {
                self.stats.revision_conflicts.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {}
        }
        result
    }

    /// Subscribe `client_id` to remote operations on a document.
    pub async fn subscribe(
        &self,
        document_id: DocumentId,
        client_id: ClientId,
    ) -> SyncResult<Subscription> {
        let mut processor = self.acquire(document_id).await?;
        processor.subscribe(client_id)
    }

    /// Mark `client_id` disconnected. No-op for unloaded documents.
    pub async fn unsubscribe(&self, document_id: DocumentId, client_id: ClientId) {
        let Some(slot) = self.documents.read().await.get(&document_id).cloned() else {
            return;
        };
        let mut guard = slot.lock().await;
        if let Some(processor) = guard.as_mut() {
            processor.unsubscribe(client_id);
        }
    }

    /// Committed entries `from..=to` for client catch-up.
    pub async fn fetch_range(
        &self,
        document_id: DocumentId,
        from: Revision,
        to: Revision,
    ) -> SyncResult<Vec<LogEntry>> {
        let mut processor = self.acquire(document_id).await?;
        processor.touch()?;
        let current = processor.revision();
        if to > current {
            return Err(SyncError::UnknownRevision {
                base_revision: to,
                current_revision: current,
            });
        }
        Ok(processor.entries_between(from.max(1), to)?)
    }

    /// Current revision and content.
    pub async fn document(&self, document_id: DocumentId) -> SyncResult<(Revision, Document)> {
        let mut processor = self.acquire(document_id).await?;
        processor.touch()?;
        Ok((processor.revision(), processor.content().clone()))
    }

    /// Answer an inbound wire message. Returns `None` for outbound-only kinds.
    pub async fn handle(&self, msg: SyncMessage) -> Option<SyncMessage> {
        match msg {
            SyncMessage::Operation(m) => Some(
                match self
                    .process_operation(m.document_id, m.client_id, m.base_revision, m.operation)
                    .await
                {
                    Ok((revision, op)) => SyncMessage::ack(m.document_id, revision, op),
                    Err(e) => SyncMessage::reject(m.document_id, m.client_id, e.reject_reason()),
                },
            ),
            SyncMessage::FetchRange(m) => Some(
                match self.fetch_range(m.document_id, m.from, m.to).await {
                    Ok(entries) => SyncMessage::Range(RangeMessage {
                        document_id: m.document_id,
                        entries,
                    }),
                    Err(e) => SyncMessage::reject(m.document_id, m.client_id, e.reject_reason()),
                },
            ),
            other => {
                log::debug!("Ignoring outbound message kind for {}", other.document_id());
                None
            }
        }
    }

    /// Unload documents idle past the timeout. Returns how many were unloaded.
    ///
    /// Candidates are marked `Evicting` and snapshotted without holding the
    /// registry lock; a request arriving in between moves them back to
    /// `Active` and they are skipped when the registry lock is taken.
    pub async fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let slots: Vec<(DocumentId, Slot)> = self
            .documents
            .read()
            .await
            .iter()
            .map(|(id, slot)| (*id, slot.clone()))
            .collect();

        let mut candidates = Vec::new();
        for (document_id, slot) in slots {
            let Ok(mut guard) = slot.clone().try_lock_owned() else {
                continue;
            };
            let Some(processor) = guard.as_mut() else {
                continue;
            };
            if !processor.is_idle(now, self.config.idle_timeout) {
                continue;
            }
            processor.set_lifecycle(Lifecycle::Evicting);
            if self.config.snapshot_on_evict {
                match processor.snapshot() {
                    Ok(Some(_)) => {
                        self.stats.snapshots_written.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(None) => {}
                    Err(e) => log::warn!("Snapshot before evicting {document_id} failed: {e}"),
                }
            }
            candidates.push((document_id, slot));
        }

        if candidates.is_empty() {
            return 0;
        }

        let mut documents = self.documents.write().await;
        let mut evicted = 0;
        for (document_id, slot) in candidates {
            let Ok(mut guard) = slot.try_lock() else {
                continue;
            };
            let Some(processor) = guard.as_mut() else {
                continue;
            };
            if processor.lifecycle() != Lifecycle::Evicting {
                continue;
            }
            processor.set_lifecycle(Lifecycle::Unloaded);
            documents.remove(&document_id);
            evicted += 1;
            log::info!("Document {document_id} unloaded after inactivity");
        }

        self.stats
            .documents_evicted
            .fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    /// Release a document so another node can take ownership.
    ///
    /// Writes a final snapshot and drops the processor. Requests already
    /// waiting on the document fail with `DocumentLocked`; its subscriptions
    /// close.
    pub async fn hand_off(&self, document_id: DocumentId) -> SyncResult<Snapshot> {
        let mut processor = self.acquire(document_id).await?;
        processor.set_lifecycle(Lifecycle::HandingOff);

        let snapshot = match processor.snapshot() {
            Ok(Some(snapshot)) => {
                self.stats.snapshots_written.fetch_add(1, Ordering::Relaxed);
                snapshot
            }
            // Already snapshotted at this revision
            Ok(None) => Snapshot::new(
                document_id,
                processor.revision(),
                processor.content().clone(),
            ),
            Err(e) => {
                processor.set_lifecycle(Lifecycle::Active);
                return Err(e.into());
            }
        };

        self.documents.write().await.remove(&document_id);
        log::info!(
            "Document {document_id} handed off at revision {}",
            snapshot.revision
        );
        Ok(snapshot)
    }

    /// Whether `client_id` exceeded the tolerated number of invalid operations.
    pub fn repeat_offender(&self, client_id: ClientId) -> bool {
        self.offenders
            .lock()
            .get(&client_id)
            .is_some_and(|count| *count > self.config.max_invalid_operations)
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            loaded_documents: self.documents.read().await.len(),
            operations_committed: self.stats.operations_committed.load(Ordering::Relaxed),
            operations_rejected: self.stats.operations_rejected.load(Ordering::Relaxed),
            revision_conflicts: self.stats.revision_conflicts.load(Ordering::Relaxed),
            documents_loaded: self.stats.documents_loaded.load(Ordering::Relaxed),
            documents_evicted: self.stats.documents_evicted.load(Ordering::Relaxed),
            snapshots_written: self.stats.snapshots_written.load(Ordering::Relaxed),
        }
    }

    pub async fn is_loaded(&self, document_id: DocumentId) -> bool {
        self.documents.read().await.contains_key(&document_id)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Run [`SyncServer::evict_idle`] every `period` until `shutdown` flips.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = self.evict_idle().await;
                        if evicted > 0 {
                            log::debug!("Idle sweep unloaded {evicted} documents");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            log::info!("Idle sweeper stopped");
                            break;
                        }
                    }
                }
            }
        })
    }

    // ─── Registry ─────────────────────────────────────────────────────

    /// Lock a document's processor, loading it if needed.
    async fn acquire(&self, document_id: DocumentId) -> SyncResult<ProcessorGuard> {
        loop {
            let slot = self.get_or_create(document_id).await;
            let mut guard = slot.lock_owned().await;

            if guard.is_none() {
                let processor = DocumentProcessor::load(
                    document_id,
                    self.log.clone(),
                    self.snapshots.clone(),
                    self.config.processor_config(),
                )?;
                *guard = Some(processor);
                self.stats.documents_loaded.fetch_add(1, Ordering::Relaxed);
            }

            let Ok(mut processor) = OwnedMutexGuard::try_map(guard, Option::as_mut) else {
                continue;
            };
            match processor.lifecycle() {
                // Removed from the registry while we waited: look it up again.
                Lifecycle::Unloaded => continue,
                Lifecycle::HandingOff => return Err(SyncError::DocumentLocked { document_id }),
                Lifecycle::Evicting => {
                    processor.touch()?;
                    return Ok(processor);
                }
                Lifecycle::Active => return Ok(processor),
            }
        }
    }

    async fn get_or_create(&self, document_id: DocumentId) -> Slot {
        // Fast path: read lock
        {
            let documents = self.documents.read().await;
            if let Some(slot) = documents.get(&document_id) {
                return slot.clone();
            }
        }

        let mut documents = self.documents.write().await;
        // Double-check after acquiring write lock
        documents
            .entry(document_id)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    fn record_offence(&self, client_id: ClientId) {
        let mut offenders = self.offenders.lock();
        let count = offenders.entry(client_id).or_insert(0);
        *count += 1;
        if *count == self.config.max_invalid_operations + 1 {
            log::warn!("Client {client_id} flagged after {count} invalid operations");
        }
    }
}
