//! Per-document fan-out.
//!
//! Maps each document to the set of subscribed connections and delivers
//! transformed ops, cursor updates, and presence events to everyone but
//! an optional excluded sender. Every connection funnels all of its
//! traffic — direct replies and room broadcasts alike — through a single
//! ordered channel, so delivery to one connection preserves send order.
//! Across connections there is no ordering guarantee.
//!
//! A subscriber whose outbound queue is full has the frame dropped (and
//! counted); lagging clients reconcile through catch-up on reconnect
//! rather than by stalling the room.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::protocol::ServerMessage;

/// Sending half of a connection's ordered outbound queue.
pub type Outbound = mpsc::Sender<Arc<ServerMessage>>;

/// Router statistics. Atomics, so the broadcast hot path never takes a
/// lock for accounting.
#[derive(Debug, Default)]
struct AtomicRouterStats {
    messages_routed: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Snapshot of router health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub messages_routed: u64,
    pub messages_dropped: u64,
    pub active_rooms: usize,
}

/// Document rooms: `doc_id -> (conn_id -> outbound sender)`.
pub struct RoomRouter {
    rooms: RwLock<HashMap<Uuid, HashMap<Uuid, Outbound>>>,
    stats: AtomicRouterStats,
}

impl Default for RoomRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRouter {
    pub fn new() -> Self {
        Self { rooms: RwLock::new(HashMap::new()), stats: AtomicRouterStats::default() }
    }

    /// Add a connection to a document's room. Idempotent; re-subscribing
    /// replaces the stored sender.
    pub async fn subscribe(&self, doc_id: Uuid, conn_id: Uuid, outbound: Outbound) {
        let mut rooms = self.rooms.write().await;
        rooms.entry(doc_id).or_default().insert(conn_id, outbound);
        log::debug!("conn {conn_id} subscribed to doc {doc_id}");
    }

    /// Remove a connection from a document's room. Idempotent. Empty
    /// rooms are dropped.
    pub async fn unsubscribe(&self, doc_id: Uuid, conn_id: Uuid) {
        let mut rooms = self.rooms.write().await;
        if let Some(subscribers) = rooms.get_mut(&doc_id) {
            subscribers.remove(&conn_id);
            if subscribers.is_empty() {
                rooms.remove(&doc_id);
                log::debug!("room {doc_id} removed (empty)");
            }
        }
    }

    /// Remove a connection from every room it joined, returning the doc
    /// ids it was subscribed to (the disconnect path broadcasts
    /// `user-left` per room).
    pub async fn unsubscribe_all(&self, conn_id: Uuid) -> Vec<Uuid> {
        let mut rooms = self.rooms.write().await;
        let mut left = Vec::new();
        rooms.retain(|doc_id, subscribers| {
            if subscribers.remove(&conn_id).is_some() {
                left.push(*doc_id);
            }
            !subscribers.is_empty()
        });
        left
    }

    /// Deliver a message to every subscriber of `doc_id` except `except`.
    /// Returns the number of queues the message was placed on.
    pub async fn broadcast(
        &self,
        doc_id: Uuid,
        msg: Arc<ServerMessage>,
        except: Option<Uuid>,
    ) -> usize {
        let rooms = self.rooms.read().await;
        let Some(subscribers) = rooms.get(&doc_id) else {
            return 0;
        };

        let mut delivered = 0;
        for (conn_id, outbound) in subscribers {
            if Some(*conn_id) == except {
                continue;
            }
            match outbound.try_send(msg.clone()) {
                Ok(()) => {
                    delivered += 1;
                    self.stats.messages_routed.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!("dropping frame for lagging conn {conn_id} in doc {doc_id}");
                }
            }
        }
        delivered
    }

    /// Whether a connection is subscribed to a document.
    pub async fn is_subscribed(&self, doc_id: Uuid, conn_id: Uuid) -> bool {
        self.rooms
            .read()
            .await
            .get(&doc_id)
            .is_some_and(|s| s.contains_key(&conn_id))
    }

    /// Number of subscribers in a document's room.
    pub async fn subscriber_count(&self, doc_id: Uuid) -> usize {
        self.rooms.read().await.get(&doc_id).map(HashMap::len).unwrap_or(0)
    }

    /// Number of rooms with at least one subscriber.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Lock-free stats snapshot (room count aside).
    pub async fn stats(&self) -> RouterStats {
        RouterStats {
            messages_routed: self.stats.messages_routed.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_rooms: self.room_count().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (Outbound, mpsc::Receiver<Arc<ServerMessage>>) {
        mpsc::channel(16)
    }

    fn ack(version: u64) -> Arc<ServerMessage> {
        Arc::new(ServerMessage::OpAck { version })
    }

    #[tokio::test]
    async fn test_subscribe_unsubscribe() {
        let router = RoomRouter::new();
        let doc = Uuid::new_v4();
        let conn = Uuid::new_v4();
        let (tx, _rx) = channel();

        router.subscribe(doc, conn, tx).await;
        assert!(router.is_subscribed(doc, conn).await);
        assert_eq!(router.room_count().await, 1);

        router.unsubscribe(doc, conn).await;
        assert!(!router.is_subscribed(doc, conn).await);
        assert_eq!(router.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_subscribe_idempotent() {
        let router = RoomRouter::new();
        let doc = Uuid::new_v4();
        let conn = Uuid::new_v4();
        let (tx, _rx) = channel();

        router.subscribe(doc, conn, tx.clone()).await;
        router.subscribe(doc, conn, tx).await;
        assert_eq!(router.subscriber_count(doc).await, 1);

        // Unsubscribing twice is also fine.
        router.unsubscribe(doc, conn).await;
        router.unsubscribe(doc, conn).await;
        assert_eq!(router.subscriber_count(doc).await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let router = RoomRouter::new();
        let doc = Uuid::new_v4();
        let sender = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let (sender_tx, mut sender_rx) = channel();
        let (peer_tx, mut peer_rx) = channel();

        router.subscribe(doc, sender, sender_tx).await;
        router.subscribe(doc, peer, peer_tx).await;

        let delivered = router.broadcast(doc, ack(1), Some(sender)).await;
        assert_eq!(delivered, 1);

        assert!(peer_rx.try_recv().is_ok());
        assert!(sender_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_without_exclusion_reaches_all() {
        let router = RoomRouter::new();
        let doc = Uuid::new_v4();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let conn = Uuid::new_v4();
            let (tx, rx) = channel();
            router.subscribe(doc, conn, tx).await;
            receivers.push(rx);
        }

        let delivered = router.broadcast(doc, ack(2), None).await;
        assert_eq!(delivered, 3);
        for rx in &mut receivers {
            assert!(rx.try_recv().is_ok());
        }
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let router = RoomRouter::new();
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();
        let (tx_a, mut rx_a) = channel();
        let (tx_b, mut rx_b) = channel();

        router.subscribe(doc_a, Uuid::new_v4(), tx_a).await;
        router.subscribe(doc_b, Uuid::new_v4(), tx_b).await;

        router.broadcast(doc_a, ack(1), None).await;
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_delivery_preserves_send_order() {
        let router = RoomRouter::new();
        let doc = Uuid::new_v4();
        let conn = Uuid::new_v4();
        let (tx, mut rx) = channel();
        router.subscribe(doc, conn, tx).await;

        for version in 1..=5 {
            router.broadcast(doc, ack(version), None).await;
        }
        for version in 1..=5 {
            match rx.recv().await.unwrap().as_ref() {
                ServerMessage::OpAck { version: v } => assert_eq!(*v, version),
                other => panic!("unexpected message {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_all_reports_rooms() {
        let router = RoomRouter::new();
        let conn = Uuid::new_v4();
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();
        let (tx, _rx) = channel();

        router.subscribe(doc_a, conn, tx.clone()).await;
        router.subscribe(doc_b, conn, tx.clone()).await;

        let mut left = router.unsubscribe_all(conn).await;
        left.sort();
        let mut expected = vec![doc_a, doc_b];
        expected.sort();
        assert_eq!(left, expected);
        assert_eq!(router.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_counts() {
        let router = RoomRouter::new();
        let doc = Uuid::new_v4();
        let conn = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(1);
        router.subscribe(doc, conn, tx).await;

        router.broadcast(doc, ack(1), None).await;
        let delivered = router.broadcast(doc, ack(2), None).await;
        assert_eq!(delivered, 0);

        let stats = router.stats().await;
        assert_eq!(stats.messages_routed, 1);
        assert_eq!(stats.messages_dropped, 1);
    }
}
