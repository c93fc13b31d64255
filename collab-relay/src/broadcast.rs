//! Fan-out of one encoded frame to every other connection on a document.
//!
//! Delivery is best-effort per recipient: a closed transport or a full
//! outbound queue is counted and logged, and the remaining recipients are
//! still served. Callers hold the document guard while fanning out, so
//! frames leave in the order their merges were applied.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::connection::{ConnectionId, ConnectionSet, OutboundFrame};
use crate::error::RelayError;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
}

/// Outcome of one [`Broadcaster::fanout`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fanout {
    /// Recipients the frame was queued for.
    pub delivered: usize,
    /// Recipients whose outbound queue was full.
    pub lagging: Vec<ConnectionId>,
}

/// Per-document broadcaster. Counters are atomics so they can be read
/// without taking the document guard.
#[derive(Debug, Default)]
pub struct Broadcaster {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `frame` on every connection in `connections` except `origin`.
    ///
    /// Recipients with a full queue miss the frame and are reported back in
    /// [`Fanout::lagging`]; what to do about them is up to the caller.
    pub fn fanout(
        &self,
        connections: &ConnectionSet,
        frame: OutboundFrame,
        origin: Option<ConnectionId>,
    ) -> Fanout {
        let mut report = Fanout::default();
        for conn in connections.handles() {
            if Some(conn.id()) == origin {
                continue;
            }
            match conn.send(frame.clone()) {
                Ok(()) => {
                    report.delivered += 1;
                    self.messages_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(RelayError::ConnectionClosed) => {
                    self.messages_dropped.fetch_add(1, Ordering::Relaxed);
                    log::debug!("Skipping closed connection {}", conn.id());
                }
                Err(RelayError::Backpressure) => {
                    self.messages_dropped.fetch_add(1, Ordering::Relaxed);
                    report.lagging.push(conn.id());
                    log::warn!("Outbound queue of connection {} is full", conn.id());
                }
                Err(e) => {
                    self.messages_dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Dropped broadcast to connection {}: {e}", conn.id());
                }
            }
        }
        report
    }

    /// Lock-free snapshot of the counters.
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionHandle;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fanout_skips_origin() {
        let mut set = ConnectionSet::new();
        let (alice, mut rx_alice) = ConnectionHandle::new(8);
        let (bob, mut rx_bob) = ConnectionHandle::new(8);
        let (carol, mut rx_carol) = ConnectionHandle::new(8);
        set.insert(alice.clone());
        set.insert(bob);
        set.insert(carol);

        let broadcaster = Broadcaster::new();
        let report = broadcaster.fanout(&set, Arc::new(vec![1, 2, 3]), Some(alice.id()));

        assert_eq!(report.delivered, 2);
        assert!(report.lagging.is_empty());
        assert_eq!(*rx_bob.recv().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(*rx_carol.recv().await.unwrap(), vec![1, 2, 3]);
        assert!(rx_alice.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fanout_without_origin_reaches_everyone() {
        let mut set = ConnectionSet::new();
        let (alice, mut rx_alice) = ConnectionHandle::new(8);
        set.insert(alice);

        let broadcaster = Broadcaster::new();
        assert_eq!(broadcaster.fanout(&set, Arc::new(vec![7]), None).delivered, 1);
        assert_eq!(*rx_alice.recv().await.unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn test_failed_recipient_does_not_block_others() {
        let mut set = ConnectionSet::new();
        let (closing, rx_closing) = ConnectionHandle::new(8);
        let (full, _rx_full) = ConnectionHandle::new(1);
        let (healthy, mut rx_healthy) = ConnectionHandle::new(8);
        full.send(Arc::new(vec![0])).unwrap();
        let full_id = full.id();
        drop(rx_closing);
        set.insert(closing);
        set.insert(full);
        set.insert(healthy);

        let broadcaster = Broadcaster::new();
        let report = broadcaster.fanout(&set, Arc::new(vec![9]), None);

        assert_eq!(report.delivered, 1);
        assert_eq!(report.lagging, vec![full_id]);
        assert_eq!(*rx_healthy.recv().await.unwrap(), vec![9]);
        let stats = broadcaster.stats();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_dropped, 2);
    }

    #[test]
    fn test_empty_set() {
        let broadcaster = Broadcaster::new();
        assert_eq!(broadcaster.fanout(&ConnectionSet::new(), Arc::new(vec![1]), None), Fanout::default());
        assert_eq!(broadcaster.stats(), BroadcastStats::default());
    }
}
