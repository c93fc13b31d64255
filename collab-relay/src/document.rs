//! Shared document: one replica, one presence table and the connections
//! addressing them, behind a per-document guard.
//!
//! ```text
//!            SharedDocument (name)
//!                   │
//!            Mutex<DocumentState>   ◄── the only way in
//!                   │
//!     ┌─────────────┼──────────────┬──────────────┐
//!     ▼             ▼              ▼              ▼
//!  replica     awareness      connections     broadcaster
//!  (yrs)       (LWW table)    (owned ids)     (fan-out)
//! ```
//!
//! Every mutation and the broadcast it triggers runs while the guard is
//! held, so peers never observe a partially merged state and broadcasts
//! leave in merge order. Different documents have different guards.
//! Nothing awaits while the guard is held: sends only enqueue.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, MutexGuard};

use crate::awareness::{AwarenessChange, AwarenessTable, ParticipantId};
use crate::broadcast::{BroadcastStats, Broadcaster};
use crate::connection::{ConnectionHandle, ConnectionId, ConnectionSet};
use crate::error::{RelayError, Result};
use crate::protocol::Frame;
use crate::replica::{ReplicaEngine, YrsReplica};

/// A named document shared by every connection that addresses it.
pub struct SharedDocument {
    name: String,
    state: Mutex<DocumentState>,
    broadcaster: Arc<Broadcaster>,
}

impl SharedDocument {
    /// Create a document backed by an empty `yrs` replica.
    pub fn new(name: impl Into<String>, gc: bool) -> Self {
        Self::with_replica(name, Box::new(YrsReplica::new(gc)))
    }

    pub fn with_replica(name: impl Into<String>, replica: Box<dyn ReplicaEngine>) -> Self {
        let name = name.into();
        let broadcaster = Arc::new(Broadcaster::new());
        let state = DocumentState {
            name: name.clone(),
            replica,
            awareness: AwarenessTable::new(),
            connections: ConnectionSet::new(),
            broadcaster: broadcaster.clone(),
            idle_since: Some(Instant::now()),
        };
        Self {
            name,
            state: Mutex::new(state),
            broadcaster,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enter the document's critical section. Released when the guard drops.
    pub async fn lock(&self) -> MutexGuard<'_, DocumentState> {
        self.state.lock().await
    }

    /// Enter the critical section only if nobody else holds it.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, DocumentState>> {
        self.state.try_lock().ok()
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.broadcaster.stats()
    }
}

/// Mutable state of a [`SharedDocument`], reachable only through its guard.
pub struct DocumentState {
    name: String,
    replica: Box<dyn ReplicaEngine>,
    awareness: AwarenessTable,
    connections: ConnectionSet,
    broadcaster: Arc<Broadcaster>,
    idle_since: Option<Instant>,
}

impl DocumentState {
    /// Register a connection with no owned awareness ids.
    pub fn add_connection(&mut self, handle: ConnectionHandle) {
        self.connections.insert(handle);
        self.idle_since = None;
    }

    /// Unregister a connection, tombstone the awareness ids it still owns
    /// and broadcast the removal to the remaining connections.
    pub fn remove_connection(&mut self, id: ConnectionId) -> AwarenessChange {
        let Some(owned) = self.connections.remove(id) else {
            return AwarenessChange::default();
        };
        if self.connections.is_empty() {
            self.idle_since = Some(Instant::now());
        }
        self.remove_states(&owned, Some(id))
    }

    /// Encoded state vector of the local replica.
    pub fn state_summary(&self) -> Vec<u8> {
        self.replica.state_summary()
    }

    /// Updates the holder of `remote_summary` is missing.
    pub fn diff(&self, remote_summary: &[u8]) -> Result<Vec<u8>> {
        self.replica.diff(remote_summary)
    }

    /// Merge an update and forward what was integrated to everyone but
    /// `origin`. Returns whether the replica changed.
    pub fn apply_update(&mut self, update: &[u8], origin: Option<ConnectionId>) -> Result<bool> {
        let Some(integrated) = self.replica.apply_update(update)? else {
            return Ok(false);
        };
        let frame = Arc::new(Frame::Update(integrated).encode());
        let report = self.broadcaster.fanout(&self.connections, frame, origin);
        log::debug!("Doc {}: update forwarded to {} peers", self.name, report.delivered);
        for id in report.lagging {
            self.disconnect_lagging(id);
        }
        Ok(true)
    }

    /// Drop a connection that missed a sync frame.
    ///
    /// A replica that skipped an update cannot converge from later updates
    /// alone, so the transport is told to close and the client resyncs with
    /// SyncStep1 when it reconnects. Its awareness ids are tombstoned as on
    /// any other disconnect.
    pub fn disconnect_lagging(&mut self, id: ConnectionId) -> AwarenessChange {
        let Some(conn) = self.connections.get(id) else {
            return AwarenessChange::default();
        };
        conn.disconnect();
        log::warn!("Doc {}: connection {id} fell behind, disconnecting", self.name);
        self.remove_connection(id)
    }

    /// Merge an awareness update arriving on `origin`.
    ///
    /// Accepted ids become owned by `origin`; removed ids lose their owner.
    /// The changed rows are forwarded to everyone but `origin`.
    pub fn apply_awareness_delta(
        &mut self,
        update: &[u8],
        origin: ConnectionId,
    ) -> Result<AwarenessChange> {
        let change = self.awareness.apply_update(update)?;
        if change.is_empty() {
            return Ok(change);
        }

        // One batch may carry an id more than once, so ownership follows
        // each id's final row rather than the order of the change lists.
        let changed = change.all();
        let (live, dead): (Vec<_>, Vec<_>) = changed
            .iter()
            .copied()
            .partition(|&id| self.awareness.get(id).is_some_and(|entry| entry.is_live()));
        self.connections.release(dead);
        self.connections.claim(origin, live);

        let payload = self.awareness.encode_update(&changed);
        let frame = Arc::new(Frame::Awareness(payload).encode());
        self.broadcaster.fanout(&self.connections, frame, Some(origin));
        log::trace!(
            "Doc {}: awareness +{} ~{} -{}",
            self.name,
            change.added.len(),
            change.updated.len(),
            change.removed.len()
        );
        Ok(change)
    }

    /// Tombstone `ids` and broadcast the removal to everyone but `origin`.
    pub fn remove_states(
        &mut self,
        ids: &[ParticipantId],
        origin: Option<ConnectionId>,
    ) -> AwarenessChange {
        let change = self.awareness.remove_states(ids);
        if change.is_empty() {
            return change;
        }

        self.connections.release(change.removed.iter().copied());
        let payload = self.awareness.encode_update(&change.removed);
        let frame = Arc::new(Frame::Awareness(payload).encode());
        self.broadcaster.fanout(&self.connections, frame, origin);
        log::debug!("Doc {}: removed awareness {:?}", self.name, change.removed);
        change
    }

    /// Awareness frame holding every live entry.
    pub fn awareness_snapshot(&self) -> Frame {
        Frame::Awareness(self.awareness.snapshot())
    }

    /// Queue a frame for one connection of this document.
    pub fn send_to(&self, id: ConnectionId, frame: &Frame) -> Result<()> {
        let conn = self.connections.get(id).ok_or(RelayError::ConnectionClosed)?;
        conn.send(Arc::new(frame.encode()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn awareness(&self) -> &AwarenessTable {
        &self.awareness
    }

    pub fn connections(&self) -> &ConnectionSet {
        &self.connections
    }

    /// When the last connection left, or `None` while connections are open.
    pub fn idle_since(&self) -> Option<Instant> {
        self.idle_since
    }
}
