//! Fan-out of committed operations to a document's subscribers.
//!
//! One tokio broadcast channel per document. Each subscriber holds an
//! independent receiver buffering up to `capacity` messages; a subscriber
//! that falls further behind is told how many it missed and must catch up
//! through `fetch_range`.
//!
//! Performance target: 1,000 operations to 100 subscribers < 10ms
//! Reference: Patterson & Hennessy, Section 6.4 — Interconnection Networks

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;

use crate::protocol::{ClientId, DocumentId, RemoteOperationMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_lagged: u64,
    pub receivers: usize,
}

/// Lock-free counters shared between the group and its subscriptions.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_lagged: AtomicU64,
}

/// Broadcast channel for a single document.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<RemoteOperationMessage>>,
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` is how many messages a slow subscriber may fall behind
    /// before it starts missing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Subscribe on behalf of `client_id`; its own operations are filtered out.
    pub fn subscribe(&self, document_id: DocumentId, client_id: ClientId) -> Subscription {
        Subscription {
            document_id,
            client_id,
            receiver: self.sender.subscribe(),
            atomic_stats: self.atomic_stats.clone(),
        }
    }

    /// Send to every receiver. Never blocks; returns the receiver count.
    pub fn broadcast(&self, msg: RemoteOperationMessage) -> usize {
        let count = self.sender.send(Arc::new(msg)).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_lagged: self.atomic_stats.messages_lagged.load(Ordering::Relaxed),
            receivers: self.sender.receiver_count(),
        }
    }
}

/// Why a subscription could not yield the next operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    /// The subscriber fell behind and `missed` operations were dropped.
    #[error("subscriber lagged and missed {missed} operations")]
    Lagged { missed: u64 },
    /// The document was unloaded or handed off.
    #[error("document channel closed")]
    Closed,
}

/// A client's feed of remote operations for one document.
pub struct Subscription {
    document_id: DocumentId,
    client_id: ClientId,
    receiver: broadcast::Receiver<Arc<RemoteOperationMessage>>,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl Subscription {
    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Next operation committed by another client.
    pub async fn recv(&mut self) -> Result<Arc<RemoteOperationMessage>, SubscriptionError> {
        loop {
            match self.receiver.recv().await {
                Ok(msg) if msg.origin_client_id == self.client_id => continue,
                Ok(msg) => return Ok(msg),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    return Err(self.lagged(missed));
                }
                Err(broadcast::error::RecvError::Closed) => return Err(SubscriptionError::Closed),
            }
        }
    }

    /// Non-blocking variant of [`Subscription::recv`]; `Ok(None)` when idle.
    pub fn try_recv(&mut self) -> Result<Option<Arc<RemoteOperationMessage>>, SubscriptionError> {
        loop {
            match self.receiver.try_recv() {
                Ok(msg) if msg.origin_client_id == self.client_id => continue,
                Ok(msg) => return Ok(Some(msg)),
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    return Err(self.lagged(missed));
                }
                Err(broadcast::error::TryRecvError::Closed) => {
                    return Err(SubscriptionError::Closed)
                }
            }
        }
    }

    fn lagged(&self, missed: u64) -> SubscriptionError {
        log::warn!(
            "Client {} lagged by {missed} operations on document {}",
            self.client_id,
            self.document_id
        );
        self.atomic_stats
            .messages_lagged
            .fetch_add(missed, Ordering::Relaxed);
        SubscriptionError::Lagged { missed }
    }
}
