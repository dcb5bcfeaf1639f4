//! Client-side collaboration core.
//!
//! [`ClientDocument`] is the buffering state machine: three cells
//! (`known_version`, `in_flight`, `pending`) plus the server-confirmed
//! content. At most one op is ever on the wire; edits made while it is
//! outstanding compose into the pending buffer and are flushed on ack.
//! An edit is NEVER sent while another op is in flight — that is what
//! keeps server-side catch-up transformation sound.
//!
//! ```text
//! local edit ──► in_flight empty? ──yes──► send-op(delta, known_version)
//!                      │no
//!                      ▼
//!               pending = pending ∘ edit
//!
//! op-ack(v) ──► known_version = v; promote pending to in_flight, send
//! receive-op ──► transform through in_flight ∘ pending, update both
//! op-error  ──► drop optimistic state, rejoin at known_version
//! ```
//!
//! Internally the confirmed content is kept separate from the optimistic
//! cells; the rendered view is their composition. The two bookkeeping
//! styles are equivalent by the transform diamond, and keeping the
//! confirmed state explicit makes the op-error reset exact: dropping the
//! cells IS discarding the unacknowledged edits.
//!
//! [`CollabClient`] wraps the state machine in a WebSocket connection:
//! a writer task draining an outbound queue, a reader task feeding the
//! state machine and emitting [`ClientEvent`]s to the application.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::delta::Delta;
use crate::ot;
use crate::protocol::{
    ClientMessage, CursorRange, ProtocolError, ServerMessage, VersionedOp,
};

/// The client-side buffering state machine for one document view.
#[derive(Debug, Clone)]
pub struct ClientDocument {
    doc_id: Uuid,
    /// Server-confirmed content at `known_version`.
    confirmed: Delta,
    /// Last server-confirmed version.
    known_version: u64,
    /// The delta sent but not yet acknowledged. Applies to `confirmed`.
    in_flight: Option<Delta>,
    /// Local edits made while `in_flight` is outstanding, composed into
    /// one delta. Applies after `in_flight`. Never present without it.
    pending: Option<Delta>,
}

impl ClientDocument {
    pub fn new(doc_id: Uuid) -> Self {
        Self {
            doc_id,
            confirmed: Delta::new(),
            known_version: 0,
            in_flight: None,
            pending: None,
        }
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn known_version(&self) -> u64 {
        self.known_version
    }

    pub fn in_flight(&self) -> Option<&Delta> {
        self.in_flight.as_ref()
    }

    pub fn pending(&self) -> Option<&Delta> {
        self.pending.as_ref()
    }

    pub fn has_unacknowledged(&self) -> bool {
        self.in_flight.is_some() || self.pending.is_some()
    }

    /// What the editor renders: confirmed state plus optimistic edits.
    pub fn view(&self) -> Delta {
        let mut view = self.confirmed.clone();
        if let Some(in_flight) = &self.in_flight {
            view = ot::compose(&view, in_flight);
        }
        if let Some(pending) = &self.pending {
            view = ot::compose(&view, pending);
        }
        view
    }

    /// Rendered text (view as a string).
    pub fn text(&self) -> String {
        self.view().text()
    }

    /// A user-originated edit, already applied in the editor. Returns the
    /// frame to send, or `None` while another op is in flight.
    pub fn local_edit(&mut self, delta: Delta) -> Option<ClientMessage> {
        if delta.is_empty() {
            return None;
        }
        match &self.in_flight {
            None => {
                debug_assert!(self.pending.is_none());
                self.in_flight = Some(delta.clone());
                Some(ClientMessage::SendOp {
                    doc_id: self.doc_id,
                    delta,
                    base_version: self.known_version,
                })
            }
            Some(_) => {
                self.pending = Some(match self.pending.take() {
                    None => delta,
                    Some(pending) => ot::compose(&pending, &delta),
                });
                None
            }
        }
    }

    /// The server committed our in-flight op at `version`. Promotes the
    /// pending buffer to in-flight, returning the next frame to send.
    /// Re-delivery of the same ack is a no-op.
    ///
    /// An ack that skips past `known_version + 1` means a peer's op was
    /// never delivered — the committed form of our op was transformed
    /// through something we did not see, so the only sound move is a
    /// catch-up resync.
    pub fn ack(&mut self, version: u64) -> Option<ClientMessage> {
        if self.in_flight.is_some() && version > self.known_version + 1 {
            log::warn!(
                "ack gap: committed at v{version} but known is v{}; resyncing",
                self.known_version
            );
            return Some(self.reset_and_rejoin());
        }
        if let Some(in_flight) = self.in_flight.take() {
            self.confirmed = ot::compose(&self.confirmed, &in_flight);
        }
        self.known_version = self.known_version.max(version);
        let next = self.pending.take()?;
        self.in_flight = Some(next.clone());
        Some(ClientMessage::SendOp {
            doc_id: self.doc_id,
            delta: next,
            base_version: self.known_version,
        })
    }

    /// A committed op from another connection. Transforms the optimistic
    /// cells and folds the remote op into the confirmed state.
    ///
    /// Stale re-deliveries (`version <= known_version`) are dropped. A
    /// version gap means frames were lost; the caller gets a rejoin frame
    /// to reconcile through catch-up.
    pub fn remote_op(&mut self, delta: &Delta, version: u64) -> Option<ClientMessage> {
        if version <= self.known_version {
            log::debug!("ignoring stale remote op v{version} (known {})", self.known_version);
            return None;
        }
        if version != self.known_version + 1 {
            log::warn!(
                "remote op gap: got v{version}, expected v{}; resyncing",
                self.known_version + 1
            );
            return Some(self.reset_and_rejoin());
        }

        self.fold_remote(delta);
        self.known_version = version;
        None
    }

    /// Fold one committed remote delta into the confirmed state and
    /// rebase the optimistic cells past it.
    ///
    /// The committed op wins positional ties everywhere — the same
    /// convention the server's catch-up fold uses, which is what makes
    /// both sides converge. The pending buffer applies after the
    /// in-flight op, so it is rebased against the remote op as
    /// transformed past in-flight, not against the raw remote op.
    fn fold_remote(&mut self, delta: &Delta) {
        // The committed delta applies to the server state at version - 1,
        // which is exactly our confirmed state.
        self.confirmed = ot::compose(&self.confirmed, delta);
        if let Some(in_flight) = self.in_flight.take() {
            let remote_after_in_flight = ot::transform(&in_flight, delta, false);
            self.in_flight = Some(ot::transform(delta, &in_flight, true));
            if let Some(pending) = self.pending.take() {
                self.pending = Some(ot::transform(&remote_after_in_flight, &pending, true));
            }
        }
    }

    /// Authoritative snapshot: replace the view, discard optimistic state.
    pub fn apply_snapshot(&mut self, content: Delta, version: u64) {
        self.confirmed = content;
        self.known_version = version;
        self.in_flight = None;
        self.pending = None;
    }

    /// Catch-up replay: missed ops in ascending version order. Each is
    /// treated as a remote op, transforming any optimistic locals.
    pub fn apply_catchup(&mut self, ops: &[VersionedOp], current_version: u64) {
        for op in ops {
            // Replay is contiguous from our known version; a gap inside
            // the replay itself cannot be reconciled any further, so trust
            // the server's ordering here.
            if op.version <= self.known_version {
                continue;
            }
            self.fold_remote(&op.delta);
            self.known_version = op.version;
        }
        self.known_version = self.known_version.max(current_version);
    }

    /// The server rejected our op: drop all optimistic state and rejoin
    /// for reconciliation. Unacknowledged edits are discarded.
    pub fn op_error(&mut self) -> ClientMessage {
        self.reset_and_rejoin()
    }

    fn reset_and_rejoin(&mut self) -> ClientMessage {
        self.in_flight = None;
        self.pending = None;
        ClientMessage::JoinDoc {
            doc_id: self.doc_id,
            from_version: Some(self.known_version),
        }
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events surfaced to the embedding application.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    /// Snapshot or catch-up applied; the view is authoritative again.
    Synced { version: u64 },
    /// A peer's op was folded into the view.
    RemoteEdit { user_id: String, version: u64 },
    /// Our own op committed.
    Acked { version: u64 },
    /// Our op was rejected; a rejoin is already on the wire.
    OpRejected { message: String },
    RemoteCursor { user_id: String, range: Option<CursorRange> },
    UserLeft { user_id: String },
    /// Terminal error from the server (bad join, auth, bad frame).
    ServerError { message: String },
}

/// WebSocket client for one document.
pub struct CollabClient {
    doc: Arc<Mutex<ClientDocument>>,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: Option<mpsc::Sender<String>>,
    event_tx: mpsc::Sender<ClientEvent>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    server_url: String,
    token: String,
}

impl CollabClient {
    /// Create a client for `doc_id`, authenticating with `token`.
    pub fn new(doc_id: Uuid, server_url: impl Into<String>, token: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            doc: Arc::new(Mutex::new(ClientDocument::new(doc_id))),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
            server_url: server_url.into(),
            token: token.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Shared handle to the document state machine.
    pub fn document(&self) -> Arc<Mutex<ClientDocument>> {
        self.doc.clone()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Connect, join the document, and spawn the reader/writer tasks.
    ///
    /// On reconnect the join carries `known_version`, so the server
    /// replays only the missed ops.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let mut request = self
            .server_url
            .as_str()
            .into_client_request()
            .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
        let bearer = format!("Bearer {}", self.token)
            .parse()
            .map_err(|_| ProtocolError::MalformedFrame("invalid token".into()))?;
        request.headers_mut().insert("Authorization", bearer);

        let (ws_stream, _) = tokio_tungstenite::connect_async(request).await.map_err(|e| {
            log::warn!("connect to {} failed: {e}", self.server_url);
            ProtocolError::ConnectionClosed
        })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx.clone());

        // Writer task: drain the outbound queue onto the socket.
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_writer.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
        });

        // Join (or rejoin) the document.
        let join = {
            let doc = self.doc.lock().await;
            let from_version =
                if doc.known_version() > 0 { Some(doc.known_version()) } else { None };
            ClientMessage::JoinDoc { doc_id: doc.doc_id(), from_version }
        };
        out_tx
            .send(join.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;

        // Reader task: feed the state machine, emit events.
        let doc = self.doc.clone();
        let state = self.state.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(inbound) = ws_reader.next().await {
                match inbound {
                    Ok(Message::Text(text)) => {
                        let msg = match ServerMessage::decode(text.as_str()) {
                            Ok(msg) => msg,
                            Err(e) => {
                                log::warn!("undecodable server frame: {e}");
                                continue;
                            }
                        };
                        Self::handle_server_message(msg, &doc, &out_tx, &event_tx).await;
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    async fn handle_server_message(
        msg: ServerMessage,
        doc: &Arc<Mutex<ClientDocument>>,
        out_tx: &mpsc::Sender<String>,
        event_tx: &mpsc::Sender<ClientEvent>,
    ) {
        let mut send_frame = None;
        let event = {
            let mut doc = doc.lock().await;
            match msg {
                ServerMessage::DocSnapshot { content, version } => {
                    doc.apply_snapshot(content, version);
                    Some(ClientEvent::Synced { version })
                }
                ServerMessage::CatchupOps { ops, current_version } => {
                    doc.apply_catchup(&ops, current_version);
                    Some(ClientEvent::Synced { version: current_version })
                }
                ServerMessage::ReceiveOp { delta, version, user_id } => {
                    send_frame = doc.remote_op(&delta, version);
                    Some(ClientEvent::RemoteEdit { user_id, version })
                }
                ServerMessage::OpAck { version } => {
                    send_frame = doc.ack(version);
                    Some(ClientEvent::Acked { version })
                }
                ServerMessage::OpError { message, .. } => {
                    send_frame = Some(doc.op_error());
                    Some(ClientEvent::OpRejected { message })
                }
                ServerMessage::RemoteCursor { user_id, range } => {
                    Some(ClientEvent::RemoteCursor { user_id, range })
                }
                ServerMessage::UserLeft { user_id } => {
                    Some(ClientEvent::UserLeft { user_id })
                }
                ServerMessage::Error { message } => {
                    Some(ClientEvent::ServerError { message })
                }
            }
        };

        if let Some(frame) = send_frame {
            match frame.encode() {
                Ok(encoded) => {
                    let _ = out_tx.send(encoded).await;
                }
                Err(e) => log::error!("failed to encode outbound frame: {e}"),
            }
        }
        if let Some(event) = event {
            let _ = event_tx.send(event).await;
        }
    }

    /// Submit a local edit. Buffered automatically while an op is in
    /// flight.
    pub async fn edit(&self, delta: Delta) -> Result<(), ProtocolError> {
        let frame = {
            let mut doc = self.doc.lock().await;
            doc.local_edit(delta)
        };
        if let Some(frame) = frame {
            self.send(frame).await?;
        }
        Ok(())
    }

    /// Share the local cursor. Dropped silently when disconnected —
    /// cursor updates are hints.
    pub async fn send_cursor(&self, range: Option<CursorRange>) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Ok(());
        }
        let doc_id = self.doc.lock().await.doc_id();
        self.send(ClientMessage::CursorUpdate { doc_id, range }).await
    }

    /// Leave the document room.
    pub async fn leave(&self) -> Result<(), ProtocolError> {
        let doc_id = self.doc.lock().await.doc_id();
        self.send(ClientMessage::LeaveDoc { doc_id }).await
    }

    async fn send(&self, msg: ClientMessage) -> Result<(), ProtocolError> {
        let Some(tx) = &self.outgoing_tx else {
            return Err(ProtocolError::ConnectionClosed);
        };
        tx.send(msg.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }
}
