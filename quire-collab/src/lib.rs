//! # quire-collab — Server-ordered document synchronization
//!
//! A central server assigns every document a single total order of
//! operations. Clients edit optimistically, keep one operation in flight and
//! transform everything the server sends them against their own unconfirmed
//! edits.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  OperationMessage   ┌──────────────────────┐
//! │ SyncClient  │ ──────────────────► │ SyncServer           │
//! │ (per user)  │ ◄────────────────── │  registry by doc id  │
//! └─────────────┘  Ack / Remote       └──────────┬───────────┘
//!                                                │ one lock per document
//!                                                ▼
//!                                     ┌──────────────────────┐
//!                                     │ DocumentProcessor    │
//!                                     │ transform → append → │
//!                                     │ commit → broadcast   │
//!                                     └───┬──────────────┬───┘
//!                                         │              │
//!                                         ▼              ▼
//!                               ┌───────────────┐ ┌───────────────┐
//!                               │ OperationLog  │ │ BroadcastGroup│
//!                               │ SnapshotStore │ │ (fan-out)     │
//!                               └───────▲───────┘ └───────────────┘
//!                                       │
//!                               ┌───────┴───────┐
//!                               │CompactionWorker│
//!                               └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Wire messages (bincode-encoded `SyncMessage`)
//! - [`processor`] — Per-document sequencer and its lifecycle
//! - [`server`] — Registry of processors, eviction and hand-off
//! - [`client`] — Client state machine with one in-flight operation
//! - [`broadcast`] — Per-document fan-out with lag detection
//! - [`storage`] — Operation log and snapshot traits, memory and RocksDB adapters
//! - [`compaction`] — Background snapshotting
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | process_operation, warm document | <100µs |
//! | Broadcast 1K msgs × 100 peers | <10ms |
//! | Reload from snapshot + 100-entry tail | <5ms |

pub mod broadcast;
pub mod client;
pub mod compaction;
pub mod error;
pub mod processor;
pub mod protocol;
pub mod server;
pub mod storage;

pub use broadcast::{BroadcastGroup, BroadcastStats, Subscription, SubscriptionError};
pub use client::{ClientEffects, ClientSyncState, OutboundOperation, RollbackNotice, SyncClient};
pub use compaction::{CompactionConfig, CompactionReport, CompactionWorker};
pub use error::{ClientError, SyncError, SyncResult};
pub use processor::{DocumentProcessor, DocumentState, Lifecycle, ProcessorConfig};
pub use protocol::{
    AckMessage, ClientId, DocumentId, FetchRangeMessage, OperationMessage, ProtocolError,
    RangeMessage, RejectMessage, RejectReason, RemoteOperationMessage, Revision, SyncMessage,
};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{
    EntryMetadata, LogEntry, MemoryStore, OperationLog, Snapshot, SnapshotStore, StoreError,
};
#[cfg(feature = "rocksdb")]
pub use storage::rocks::{DocumentMetadata, RocksStore, StoreConfig};
