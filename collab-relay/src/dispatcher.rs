//! Per-connection protocol dispatcher.
//!
//! Lifecycle: [`Dispatcher::open`] registers the connection and sends the
//! bootstrap (SyncStep1 + awareness snapshot), [`Dispatcher::handle`] is
//! called for every inbound frame, [`Dispatcher::close`] runs the cleanup.
//! There is no reconnect state: a reconnecting client gets a new
//! connection and a new dispatcher.
//!
//! | Frame          | Action                        | Reply                    |
//! |----------------|-------------------------------|--------------------------|
//! | SyncStep1      | diff against remote summary   | SyncStep2 to sender      |
//! | SyncStep2      | merge into replica            | none (broadcast)         |
//! | Update         | merge into replica            | none (broadcast)         |
//! | Awareness      | merge into presence table     | none (broadcast)         |
//! | QueryAwareness | none                          | snapshot to sender       |
//! | Auth           | [`AuthHook`]                  | none, never enforced     |
//! | unknown        | logged                        | none                     |

use std::sync::Arc;

use crate::awareness::AwarenessChange;
use crate::connection::{ConnectionHandle, ConnectionId};
use crate::document::SharedDocument;
use crate::error::{RelayError, Result};
use crate::protocol::{AuthMessage, Frame};

/// Receives auth frames. The relay keeps processing the connection's
/// traffic whatever the hook does with them.
pub trait AuthHook: Send + Sync {
    /// The peer reported that it was denied access.
    fn permission_denied(&self, document: &str, connection: ConnectionId, reason: &str);
}

/// Default hook: records the would-be denial in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlyAuth;

impl AuthHook for LogOnlyAuth {
    fn permission_denied(&self, document: &str, connection: ConnectionId, reason: &str) {
        log::warn!("Permission denied for {connection} on doc {document}: {reason}");
    }
}

/// What a dispatched frame did, for callers that care (mostly tests).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// A reply was queued for the sender.
    Replied,
    /// The replica merged the update; `changed` is false for duplicates.
    Merged { changed: bool },
    Awareness(AwarenessChange),
    Auth,
    Ignored,
}

/// Binds one connection to one shared document.
pub struct Dispatcher {
    document: Arc<SharedDocument>,
    conn: ConnectionHandle,
    auth: Arc<dyn AuthHook>,
}

impl Dispatcher {
    /// Register `conn` with `document` and send it the bootstrap frames.
    pub async fn open(
        document: Arc<SharedDocument>,
        conn: ConnectionHandle,
        auth: Arc<dyn AuthHook>,
    ) -> Self {
        {
            let mut state = document.lock().await;
            state.add_connection(conn.clone());

            let step1 = Frame::SyncStep1(state.state_summary());
            let snapshot = state.awareness_snapshot();
            for frame in [step1, snapshot] {
                if let Err(e) = state.send_to(conn.id(), &frame) {
                    log::warn!("Bootstrap {} to {} failed: {e}", frame.kind(), conn.id());
                }
            }
            log::info!(
                "Connection {} joined doc {} ({} open)",
                conn.id(),
                document.name(),
                state.connections().len()
            );
        }

        Self {
            document,
            conn,
            auth,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.conn.id()
    }

    pub fn document(&self) -> &Arc<SharedDocument> {
        &self.document
    }

    /// Dispatch one inbound frame, logging instead of failing.
    ///
    /// Malformed frames are dropped before anything is merged; the
    /// connection stays open either way.
    pub async fn handle(&self, bytes: &[u8]) -> Option<Dispatched> {
        match self.dispatch(bytes).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                log::warn!(
                    "Dropping frame from {} on doc {}: {e}",
                    self.conn.id(),
                    self.document.name()
                );
                None
            }
        }
    }

    /// Decode and apply one inbound frame.
    pub async fn dispatch(&self, bytes: &[u8]) -> Result<Dispatched> {
        let frame = Frame::decode(bytes)?;
        log::debug!(
            "Doc {}: {} frame from {} ({} bytes)",
            self.document.name(),
            frame.kind(),
            self.conn.id(),
            bytes.len()
        );

        let origin = self.conn.id();
        let mut state = self.document.lock().await;

        let outcome = match frame {
            Frame::SyncStep1(remote_summary) => {
                let diff = state.diff(&remote_summary)?;
                if let Err(e) = state.send_to(origin, &Frame::SyncStep2(diff)) {
                    // Without the reply the client never catches up
                    if matches!(e, RelayError::Backpressure) {
                        state.disconnect_lagging(origin);
                    }
                    return Err(e);
                }
                Dispatched::Replied
            }
            Frame::SyncStep2(update) | Frame::Update(update) => {
                let changed = state.apply_update(&update, Some(origin))?;
                Dispatched::Merged { changed }
            }
            Frame::Awareness(update) => {
                Dispatched::Awareness(state.apply_awareness_delta(&update, origin)?)
            }
            Frame::QueryAwareness => {
                state.send_to(origin, &state.awareness_snapshot())?;
                Dispatched::Replied
            }
            Frame::Auth(AuthMessage::PermissionDenied { reason }) => {
                self.auth
                    .permission_denied(self.document.name(), origin, &reason);
                Dispatched::Auth
            }
            Frame::Auth(AuthMessage::Other(auth_type)) => {
                log::debug!("Ignoring auth message type {auth_type} from {origin}");
                Dispatched::Auth
            }
            Frame::Unknown(tag) => {
                log::warn!("Received unknown message type {tag} from {origin}");
                Dispatched::Ignored
            }
        };
        Ok(outcome)
    }

    /// Unregister the connection and tombstone the awareness ids it owns.
    pub async fn close(self) -> AwarenessChange {
        let mut state = self.document.lock().await;
        let change = state.remove_connection(self.conn.id());
        log::info!(
            "Connection {} left doc {} ({} open, {} presence removed)",
            self.conn.id(),
            self.document.name(),
            state.connections().len(),
            change.removed.len()
        );
        change
    }
}
