//! JSON wire protocol for document synchronization.
//!
//! Every frame is a JSON object tagged by event name:
//! ```text
//! {"event":"send-op","docId":"...","delta":[{"insert":"Hello"}],"baseVersion":0}
//! {"event":"op-ack","version":1}
//! {"event":"receive-op","delta":[{"retain":1},{"insert":"B"}],"version":2,"userId":"bob"}
//! ```
//!
//! Client→server events: `join-doc`, `send-op`, `cursor-update`,
//! `leave-doc`. Server→client events: `doc-snapshot`, `catchup-ops`,
//! `receive-op`, `op-ack`, `op-error`, `remote-cursor`, `user-left`,
//! `error`. Frames travel as WebSocket text messages; anything that fails
//! to decode is a [`ProtocolError`] and never reaches the OT engine.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::delta::Delta;

/// A cursor or selection within a document, in cursor units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRange {
    pub index: u64,
    pub length: u64,
}

impl CursorRange {
    pub fn caret(index: u64) -> Self {
        CursorRange { index, length: 0 }
    }

    pub fn selection(index: u64, length: u64) -> Self {
        CursorRange { index, length }
    }

    pub fn is_caret(&self) -> bool {
        self.length == 0
    }
}

/// One replayed log entry inside a `catchup-ops` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedOp {
    pub delta: Delta,
    pub version: u64,
}

/// Messages a client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Join a document room, optionally asking for a catch-up replay from
    /// a previously known version.
    JoinDoc {
        doc_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_version: Option<u64>,
    },
    /// Submit a local edit composed against `base_version`.
    SendOp {
        doc_id: Uuid,
        delta: Delta,
        base_version: u64,
    },
    /// Move the local cursor; `None` clears it.
    CursorUpdate {
        doc_id: Uuid,
        range: Option<CursorRange>,
    },
    /// Leave a document room.
    LeaveDoc { doc_id: Uuid },
}

/// Messages the server sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Full document state on join.
    DocSnapshot { content: Delta, version: u64 },
    /// Missed operations replayed in ascending version order.
    CatchupOps {
        ops: Vec<VersionedOp>,
        current_version: u64,
    },
    /// A committed operation from another connection, already transformed
    /// into the delta that was composed into the snapshot.
    ReceiveOp {
        delta: Delta,
        version: u64,
        user_id: String,
    },
    /// The sender's own op committed at `version`.
    OpAck { version: u64 },
    /// The sender's op failed; sent to the originating connection only.
    OpError { message: String, base_version: u64 },
    /// Another collaborator's cursor moved. A hint, unordered relative to
    /// ops.
    RemoteCursor {
        user_id: String,
        range: Option<CursorRange>,
    },
    /// A collaborator left the room or disconnected.
    UserLeft { user_id: String },
    /// Terminal error outside the send-op path (bad join, bad frame, auth).
    Error { message: String },
}

impl ClientMessage {
    /// Serialize to the JSON wire form.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a frame, normalizing any delta it carries.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let msg: ClientMessage = serde_json::from_str(text)
            .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
        Ok(match msg {
            ClientMessage::SendOp { doc_id, delta, base_version } => ClientMessage::SendOp {
                doc_id,
                delta: delta.normalize(),
                base_version,
            },
            other => other,
        })
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
    }
}

/// Wire-level failures.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    /// Frame is not valid JSON, carries an unknown event, or a field of
    /// the wrong shape (malformed delta, non-integer version, ...).
    MalformedFrame(String),
    /// Outbound frame failed to serialize.
    Serialization(String),
    /// Binary frame where a text frame was expected.
    UnexpectedBinary,
    /// The underlying connection failed or closed mid-exchange.
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedFrame(e) => write!(f, "malformed frame: {e}"),
            Self::Serialization(e) => write!(f, "serialization error: {e}"),
            Self::UnexpectedBinary => write!(f, "unexpected binary frame"),
            Self::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
