//! Per-connection collaboration state machine.
//!
//! One `CollabSession` wraps one authenticated duplex connection. It owns
//! the connection's room memberships and drives the write path:
//!
//! ```text
//! join-doc ──► authorize ──► subscribe ──► doc-snapshot | catchup-ops
//! send-op  ──► lock ──► DocumentService::apply_operation
//!                │               │
//!                │         ok: op-ack to sender, receive-op to room
//!                │         err: op-error to sender only
//!                └── always released if held
//! cursor-update ──► remote-cursor to room (no persistence, no OT)
//! leave-doc / disconnect ──► unsubscribe + user-left per room
//! ```
//!
//! The ack is enqueued on the sender's ordered outbound channel while the
//! document lock is still held, so a peer's later commit cannot overtake
//! it: `op-ack(v)` always precedes any `receive-op(v' > v)` on the
//! sending connection. The sender never receives its own op back — the
//! router excludes it from the broadcast.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::SendTimeoutError;
use uuid::Uuid;

use crate::delta::Delta;
use crate::lock::{acquire_with_deadline, doc_lock_key, LockService, ACQUIRE_DEADLINE, LOCK_TTL};
use crate::protocol::{ClientMessage, CursorRange, ServerMessage, VersionedOp};
use crate::room::{Outbound, RoomRouter};
use crate::service::{DocumentService, ServiceError};

/// Session state for one connection.
pub struct CollabSession {
    conn_id: Uuid,
    user_id: String,
    service: Arc<DocumentService>,
    router: Arc<RoomRouter>,
    locks: Arc<dyn LockService>,
    outbound: Outbound,
    joined: HashSet<Uuid>,
}

impl CollabSession {
    pub fn new(
        user_id: impl Into<String>,
        service: Arc<DocumentService>,
        router: Arc<RoomRouter>,
        locks: Arc<dyn LockService>,
        outbound: Outbound,
    ) -> Self {
        Self {
            conn_id: Uuid::new_v4(),
            user_id: user_id.into(),
            service,
            router,
            locks,
            outbound,
            joined: HashSet::new(),
        }
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Dispatch one inbound frame.
    pub async fn handle_message(&mut self, msg: ClientMessage) {
        match msg {
            ClientMessage::JoinDoc { doc_id, from_version } => {
                self.handle_join(doc_id, from_version).await;
            }
            ClientMessage::SendOp { doc_id, delta, base_version } => {
                self.handle_send_op(doc_id, delta, base_version).await;
            }
            ClientMessage::CursorUpdate { doc_id, range } => {
                self.handle_cursor(doc_id, range).await;
            }
            ClientMessage::LeaveDoc { doc_id } => {
                self.handle_leave(doc_id).await;
            }
        }
    }

    /// Connection closed: leave every room.
    pub async fn handle_disconnect(&mut self) {
        let rooms = self.router.unsubscribe_all(self.conn_id).await;
        for doc_id in rooms {
            self.router
                .broadcast(
                    doc_id,
                    Arc::new(ServerMessage::UserLeft { user_id: self.user_id.clone() }),
                    Some(self.conn_id),
                )
                .await;
        }
        self.joined.clear();
        log::info!("conn {} ({}) disconnected", self.conn_id, self.user_id);
    }

    async fn handle_join(&mut self, doc_id: Uuid, from_version: Option<u64>) {
        let doc = match self.service.load_document(doc_id).await {
            Ok(doc) => doc,
            Err(ServiceError::NotFound(_)) => {
                self.send(ServerMessage::Error { message: format!("document {doc_id} not found") })
                    .await;
                return;
            }
            Err(e) => {
                self.send(ServerMessage::Error { message: e.to_string() }).await;
                return;
            }
        };

        if !doc.can_edit(&self.user_id) {
            log::warn!("user {} denied access to doc {doc_id}", self.user_id);
            self.send(ServerMessage::Error { message: "unauthorized".into() }).await;
            return;
        }

        self.router
            .subscribe(doc_id, self.conn_id, self.outbound.clone())
            .await;
        self.joined.insert(doc_id);
        log::info!("user {} joined doc {doc_id} at version {}", self.user_id, doc.version);

        match from_version {
            Some(from) if from < doc.version => {
                let entries = match self.service.ops_since(doc_id, from).await {
                    Ok(entries) => entries,
                    Err(e) => {
                        self.send(ServerMessage::Error { message: e.to_string() }).await;
                        return;
                    }
                };
                let ops = entries
                    .into_iter()
                    .map(|e| VersionedOp { delta: e.delta, version: e.version })
                    .collect();
                self.send(ServerMessage::CatchupOps { ops, current_version: doc.version })
                    .await;
            }
            _ => {
                self.send(ServerMessage::DocSnapshot { content: doc.content, version: doc.version })
                    .await;
            }
        }
    }

    async fn handle_send_op(&mut self, doc_id: Uuid, delta: Delta, base_version: u64) {
        let key = doc_lock_key(doc_id);
        let owner = Uuid::new_v4().to_string();
        let held =
            acquire_with_deadline(self.locks.as_ref(), &key, &owner, LOCK_TTL, ACQUIRE_DEADLINE)
                .await;

        let result = self
            .service
            .apply_operation(doc_id, &delta, base_version, &self.user_id, self.conn_id)
            .await;

        match result {
            Ok(applied) => {
                // Ack first, while the lock still serializes the room: no
                // peer commit can enqueue ahead of it.
                self.send(ServerMessage::OpAck { version: applied.version }).await;
                self.router
                    .broadcast(
                        doc_id,
                        Arc::new(ServerMessage::ReceiveOp {
                            delta: applied.delta,
                            version: applied.version,
                            user_id: self.user_id.clone(),
                        }),
                        Some(self.conn_id),
                    )
                    .await;
            }
            Err(e) => {
                log::warn!("op from {} on doc {doc_id} failed: {e}", self.user_id);
                self.send(ServerMessage::OpError { message: e.to_string(), base_version }).await;
            }
        }

        if held {
            self.locks.release(&key, &owner).await;
        }
    }

    async fn handle_cursor(&self, doc_id: Uuid, range: Option<CursorRange>) {
        if !self.joined.contains(&doc_id) {
            log::debug!("cursor update for unjoined doc {doc_id} ignored");
            return;
        }
        self.router
            .broadcast(
                doc_id,
                Arc::new(ServerMessage::RemoteCursor { user_id: self.user_id.clone(), range }),
                Some(self.conn_id),
            )
            .await;
    }

    async fn handle_leave(&mut self, doc_id: Uuid) {
        if !self.joined.remove(&doc_id) {
            return;
        }
        self.router.unsubscribe(doc_id, self.conn_id).await;
        self.router
            .broadcast(
                doc_id,
                Arc::new(ServerMessage::UserLeft { user_id: self.user_id.clone() }),
                Some(self.conn_id),
            )
            .await;
        log::info!("user {} left doc {doc_id}", self.user_id);
    }

    /// Enqueue a direct reply on this connection's ordered queue.
    ///
    /// Bounded wait: the queue is drained by the same loop that invoked
    /// this handler, so blocking here forever on a jammed queue would
    /// deadlock the connection. Past the grace period the frame is
    /// dropped like any lagging-consumer frame and the client reconciles
    /// through catch-up.
    async fn send(&self, msg: ServerMessage) {
        match self
            .outbound
            .send_timeout(Arc::new(msg), Duration::from_secs(2))
            .await
        {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => {
                log::warn!("outbound queue jammed for conn {}; frame dropped", self.conn_id);
            }
            Err(SendTimeoutError::Closed(_)) => {
                log::debug!("outbound channel closed for conn {}", self.conn_id);
            }
        }
    }
}
