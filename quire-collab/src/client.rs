//! Client-side synchronization state machine.
//!
//! ```text
//!                 local edit                    local edit
//!  Synchronized ─────────────► AwaitingAck ─────────────► AwaitingWithBuffer
//!       ▲          (send)          │   ▲                        │  ▲   │
//!       │                          │   │       ack (send buffer)│  │   │ local edit
//!       └────────── ack ───────────┘   └────────────────────────┘  └───┘ (compose)
//! ```
//!
//! At most one operation is in flight. Edits made meanwhile compose into a
//! single buffer, so any number of keystrokes while waiting become one
//! transmission. Remote operations are transformed against the in-flight
//! and buffered edits before being applied locally; the local document is
//! always the server-confirmed content followed by pending then buffer.
//!
//! Server events carry revisions and are applied strictly in order.
//! Duplicates are dropped and early arrivals wait in a reorder buffer.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::collections::BTreeMap;

use quire_core::{compose, invert, transform, Document, Operation, Priority};

use crate::error::ClientError;
use crate::protocol::{ClientId, DocumentId, Revision, SyncMessage};

/// The three states of a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientSyncState {
    Synchronized {
        server_revision: Revision,
    },
    AwaitingAck {
        server_revision: Revision,
        pending: Operation,
    },
    AwaitingWithBuffer {
        server_revision: Revision,
        pending: Operation,
        buffer: Operation,
    },
}

impl ClientSyncState {
    pub fn server_revision(&self) -> Revision {
        match self {
            ClientSyncState::Synchronized { server_revision }
            | ClientSyncState::AwaitingAck {
                server_revision, ..
            }
            | ClientSyncState::AwaitingWithBuffer {
                server_revision, ..
            } => *server_revision,
        }
    }

    pub fn pending(&self) -> Option<&Operation> {
        match self {
            ClientSyncState::Synchronized { .. } => None,
            ClientSyncState::AwaitingAck { pending, .. }
            | ClientSyncState::AwaitingWithBuffer { pending, .. } => Some(pending),
        }
    }

    pub fn buffer(&self) -> Option<&Operation> {
        match self {
            ClientSyncState::AwaitingWithBuffer { buffer, .. } => Some(buffer),
            _ => None,
        }
    }
}

/// An operation the caller must send to the server.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundOperation {
    pub base_revision: Revision,
    pub operation: Operation,
}

/// What the caller has to do after feeding an event in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientEffects {
    /// Transformed remote operations to apply to the editor, in order
    pub apply: Vec<Operation>,
    /// Operation to transmit, if any
    pub send: Option<OutboundOperation>,
}

/// Shown to the user when unacknowledged edits are discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackNotice {
    pub document_id: DocumentId,
    /// Revision the document was restored to
    pub revision: Revision,
    /// Number of discarded operations (pending and buffer)
    pub discarded: usize,
}

/// A server event waiting for earlier revisions to arrive.
#[derive(Debug, Clone)]
enum ServerEvent {
    Remote(Operation),
    Ack,
}

/// One client's view of one document.
pub struct SyncClient {
    document_id: DocumentId,
    client_id: ClientId,
    state: ClientSyncState,
    /// Local content shown in the editor
    document: Document,
    /// Server-confirmed content at `state.server_revision()`
    confirmed: Document,
    reorder: BTreeMap<Revision, ServerEvent>,
}

impl SyncClient {
    /// Start from an empty document at revision 0.
    pub fn new(document_id: DocumentId, client_id: ClientId) -> Self {
        Self::with_document(document_id, client_id, 0, Document::new())
    }

    /// Start from content fetched from the server at `revision`.
    pub fn with_document(
        document_id: DocumentId,
        client_id: ClientId,
        revision: Revision,
        document: Document,
    ) -> Self {
        Self {
            document_id,
            client_id,
            state: ClientSyncState::Synchronized {
                server_revision: revision,
            },
            confirmed: document.clone(),
            document,
            reorder: BTreeMap::new(),
        }
    }

    /// Apply an edit made in the local editor.
    pub fn on_local_edit(&mut self, op: Operation) -> Result<ClientEffects, ClientError> {
        let document = self.document.apply(&op)?;
        self.document = document;

        let mut effects = ClientEffects::default();
        self.state = match std::mem::replace(
            &mut self.state,
            ClientSyncState::Synchronized { server_revision: 0 },
        ) {
            ClientSyncState::Synchronized { server_revision } => {
                effects.send = Some(OutboundOperation {
                    base_revision: server_revision,
                    operation: op.clone(),
                });
                ClientSyncState::AwaitingAck {
                    server_revision,
                    pending: op,
                }
            }
            ClientSyncState::AwaitingAck {
                server_revision,
                pending,
            } => ClientSyncState::AwaitingWithBuffer {
                server_revision,
                pending,
                buffer: op,
            },
            ClientSyncState::AwaitingWithBuffer {
                server_revision,
                pending,
                buffer,
            } => ClientSyncState::AwaitingWithBuffer {
                server_revision,
                pending,
                buffer: compose(&buffer, &op),
            },
        };
        Ok(effects)
    }

    /// The server committed our in-flight operation as `revision`.
    pub fn on_server_ack(&mut self, revision: Revision) -> Result<ClientEffects, ClientError> {
        self.on_server_event(revision, ServerEvent::Ack)
    }

    /// Another client's operation was committed as `revision`.
    pub fn on_remote_operation(
        &mut self,
        revision: Revision,
        op: Operation,
    ) -> Result<ClientEffects, ClientError> {
        self.on_server_event(revision, ServerEvent::Remote(op))
    }

    /// The server refused our operation as too stale.
    ///
    /// Returns the inclusive range to fetch. Feed the fetched entries
    /// through [`SyncClient::on_remote_operation`], then call
    /// [`SyncClient::retransmit`].
    pub fn on_revision_conflict(&self, current_revision: Revision) -> (Revision, Revision) {
        (self.state.server_revision() + 1, current_revision)
    }

    /// The in-flight operation rebased on the latest known revision.
    pub fn retransmit(&self) -> Option<OutboundOperation> {
        self.state.pending().map(|pending| OutboundOperation {
            base_revision: self.state.server_revision(),
            operation: pending.clone(),
        })
    }

    /// Revisions that must be fetched before held events can be applied.
    pub fn missing_range(&self) -> Option<(Revision, Revision)> {
        let first_held = *self.reorder.keys().next()?;
        Some((self.state.server_revision() + 1, first_held - 1))
    }

    /// Discard unacknowledged edits and return to the confirmed content.
    ///
    /// Returns the operation that undoes the discarded edits in the editor.
    /// Meant for edits the server refused; an ack arriving afterwards for a
    /// discarded operation is reported as unexpected.
    pub fn rollback(&mut self) -> Result<Option<(Operation, RollbackNotice)>, ClientError> {
        let (discarded, unconfirmed) = match &self.state {
            ClientSyncState::Synchronized { .. } => return Ok(None),
            ClientSyncState::AwaitingAck { pending, .. } => (1, pending.clone()),
            ClientSyncState::AwaitingWithBuffer {
                pending, buffer, ..
            } => (2, compose(pending, buffer)),
        };
        let inverse = invert(&unconfirmed, &self.confirmed)?;
        let revision = self.state.server_revision();

        self.document = self.confirmed.clone();
        self.state = ClientSyncState::Synchronized {
            server_revision: revision,
        };
        log::warn!(
            "Client {} rolled back {discarded} unacknowledged operation(s) on {}",
            self.client_id,
            self.document_id
        );

        Ok(Some((
            inverse,
            RollbackNotice {
                document_id: self.document_id,
                revision,
                discarded,
            },
        )))
    }

    /// Wire message for an outbound operation.
    pub fn message(&self, outbound: &OutboundOperation) -> SyncMessage {
        SyncMessage::operation(
            self.document_id,
            self.client_id,
            outbound.base_revision,
            outbound.operation.clone(),
        )
    }

    pub fn state(&self) -> &ClientSyncState {
        &self.state
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn confirmed(&self) -> &Document {
        &self.confirmed
    }

    pub fn server_revision(&self) -> Revision {
        self.state.server_revision()
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    // ─── Ordering ─────────────────────────────────────────────────────

    fn on_server_event(
        &mut self,
        revision: Revision,
        event: ServerEvent,
    ) -> Result<ClientEffects, ClientError> {
        let mut effects = ClientEffects::default();
        let expected = self.state.server_revision() + 1;

        if revision < expected {
            log::debug!("Ignoring duplicate revision {revision} on {}", self.document_id);
            return Ok(effects);
        }
        if revision > expected {
            log::debug!(
                "Holding revision {revision} on {} until {expected} arrives",
                self.document_id
            );
            self.reorder.entry(revision).or_insert(event);
            return Ok(effects);
        }

        self.apply_event(revision, event, &mut effects)?;
        while let Some(next) = self.reorder.remove(&(self.state.server_revision() + 1)) {
            let revision = self.state.server_revision() + 1;
            self.apply_event(revision, next, &mut effects)?;
        }
        Ok(effects)
    }

    fn apply_event(
        &mut self,
        revision: Revision,
        event: ServerEvent,
        effects: &mut ClientEffects,
    ) -> Result<(), ClientError> {
        match event {
            ServerEvent::Ack => {
                if let Some(send) = self.apply_ack(revision)? {
                    effects.send = Some(send);
                }
            }
            ServerEvent::Remote(op) => effects.apply.push(self.apply_remote(revision, op)?),
        }
        Ok(())
    }

    fn apply_ack(&mut self, revision: Revision) -> Result<Option<OutboundOperation>, ClientError> {
        let (confirmed, state, send) = match &self.state {
            ClientSyncState::Synchronized { .. } => {
                return Err(ClientError::UnexpectedAck { revision })
            }
            ClientSyncState::AwaitingAck { pending, .. } => (
                self.confirmed.apply(pending)?,
                ClientSyncState::Synchronized {
                    server_revision: revision,
                },
                None,
            ),
            ClientSyncState::AwaitingWithBuffer {
                pending, buffer, ..
            } => (
                self.confirmed.apply(pending)?,
                ClientSyncState::AwaitingAck {
                    server_revision: revision,
                    pending: buffer.clone(),
                },
                Some(OutboundOperation {
                    base_revision: revision,
                    operation: buffer.clone(),
                }),
            ),
        };
        self.confirmed = confirmed;
        self.state = state;
        Ok(send)
    }

    fn apply_remote(&mut self, revision: Revision, op: Operation) -> Result<Operation, ClientError> {
        let confirmed = self.confirmed.apply(&op)?;
        let (local, state) = match &self.state {
            ClientSyncState::Synchronized { .. } => (
                op,
                ClientSyncState::Synchronized {
                    server_revision: revision,
                },
            ),
            ClientSyncState::AwaitingAck { pending, .. } => {
                let (op, pending) = transform(&op, pending, Priority::Left);
                (
                    op,
                    ClientSyncState::AwaitingAck {
                        server_revision: revision,
                        pending,
                    },
                )
            }
            ClientSyncState::AwaitingWithBuffer {
                pending, buffer, ..
            } => {
                let (op, pending) = transform(&op, pending, Priority::Left);
                let (op, buffer) = transform(&op, buffer, Priority::Left);
                (
                    op,
                    ClientSyncState::AwaitingWithBuffer {
                        server_revision: revision,
                        pending,
                        buffer,
                    },
                )
            }
        };
        let document = self.document.apply(&local)?;

        self.confirmed = confirmed;
        self.document = document;
        self.state = state;
        Ok(local)
    }
}
