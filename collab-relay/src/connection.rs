//! Connection handles and the per-document connection set.
//!
//! A [`ConnectionHandle`] is the relay's view of one transport: a bounded
//! outbound queue drained by the socket task. Sending never blocks; a closed
//! transport or a full queue is reported to the caller, who logs it.
//!
//! [`ConnectionSet`] additionally records which awareness participants each
//! connection introduced ("owned ids"), so they can be tombstoned when the
//! connection goes away.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::awareness::ParticipantId;
use crate::error::{RelayError, Result};

/// Encoded frame shared between all recipients of a broadcast.
pub type OutboundFrame = Arc<Vec<u8>>;

/// Identity of one transport connection. Reconnecting yields a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sending half of a connection's outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<OutboundFrame>,
    kicked: Arc<Notify>,
}

impl ConnectionHandle {
    /// Create a handle and the receiver the transport task drains.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: ConnectionId::new(),
            outbound,
            kicked: Arc::new(Notify::new()),
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether the transport side is still draining frames.
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Ask the transport task to close this connection.
    ///
    /// Used when the peer fell too far behind to be caught up in place; the
    /// client resyncs from scratch once it reconnects.
    pub fn disconnect(&self) {
        self.kicked.notify_one();
    }

    /// Resolves once [`disconnect`](Self::disconnect) has been called on any
    /// clone of this handle.
    pub async fn disconnected(&self) {
        self.kicked.notified().await;
    }

    /// Queue a frame without waiting.
    pub fn send(&self, frame: OutboundFrame) -> Result<()> {
        if !self.is_open() {
            return Err(RelayError::ConnectionClosed);
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RelayError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => RelayError::ConnectionClosed,
        })
    }
}

#[derive(Debug)]
struct ConnectionEntry {
    handle: ConnectionHandle,
    owned: HashSet<ParticipantId>,
}

/// Open connections addressing one document, with their owned awareness ids.
///
/// Each participant id is owned by at most one connection: claiming an id
/// moves it away from its previous owner.
#[derive(Debug, Default)]
pub struct ConnectionSet {
    entries: HashMap<ConnectionId, ConnectionEntry>,
    owners: HashMap<ParticipantId, ConnectionId>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection with an empty owned set.
    pub fn insert(&mut self, handle: ConnectionHandle) {
        self.entries.insert(
            handle.id(),
            ConnectionEntry {
                handle,
                owned: HashSet::new(),
            },
        );
    }

    /// Drop a connection, returning the ids it still owned.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Vec<ParticipantId>> {
        let entry = self.entries.remove(&id)?;
        let mut owned: Vec<ParticipantId> = entry.owned.into_iter().collect();
        owned.sort_unstable();
        for participant in &owned {
            self.owners.remove(participant);
        }
        Some(owned)
    }

    /// Make `owner` the owner of `ids`, taking them from any other connection.
    pub fn claim(&mut self, owner: ConnectionId, ids: impl IntoIterator<Item = ParticipantId>) {
        if !self.entries.contains_key(&owner) {
            return;
        }
        for participant in ids {
            if let Some(previous) = self.owners.insert(participant, owner) {
                if previous != owner {
                    if let Some(entry) = self.entries.get_mut(&previous) {
                        entry.owned.remove(&participant);
                    }
                }
            }
            if let Some(entry) = self.entries.get_mut(&owner) {
                entry.owned.insert(participant);
            }
        }
    }

    /// Forget ownership of `ids` (they were tombstoned).
    pub fn release(&mut self, ids: impl IntoIterator<Item = ParticipantId>) {
        for participant in ids {
            if let Some(owner) = self.owners.remove(&participant) {
                if let Some(entry) = self.entries.get_mut(&owner) {
                    entry.owned.remove(&participant);
                }
            }
        }
    }

    /// Ids currently owned by `id`, sorted.
    pub fn owned(&self, id: ConnectionId) -> Option<Vec<ParticipantId>> {
        self.entries.get(&id).map(|entry| {
            let mut owned: Vec<ParticipantId> = entry.owned.iter().copied().collect();
            owned.sort_unstable();
            owned
        })
    }

    pub fn owner_of(&self, participant: ParticipantId) -> Option<ConnectionId> {
        self.owners.get(&participant).copied()
    }

    pub fn get(&self, id: ConnectionId) -> Option<&ConnectionHandle> {
        self.entries.get(&id).map(|entry| &entry.handle)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn handles(&self) -> impl Iterator<Item = &ConnectionHandle> {
        self.entries.values().map(|entry| &entry.handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
