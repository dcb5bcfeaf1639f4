//! # scribe-collab — Real-time collaborative rich-text editing
//!
//! Many clients edit the same document at once over WebSockets; every
//! client converges to the same content regardless of network
//! interleaving. Convergence comes from operational transformation over
//! rich-text deltas, serialized per document by a distributed lock with an
//! optimistic version gate as the correctness backstop.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐      WebSocket       ┌───────────────┐
//! │ CollabClient │ ◄──────────────────► │ CollabServer  │
//! │ (per user)   │     JSON frames      │ (central)     │
//! └──────┬───────┘                      └──────┬────────┘
//!        │                                     │
//!        ▼                                     ▼
//! ┌──────────────┐                      ┌───────────────┐
//! │ClientDocument│                      │ CollabSession │ (per conn)
//! │ three cells: │                      └──────┬────────┘
//! │ knownVersion │              ┌──────────────┼──────────────┐
//! │ inFlight     │              ▼              ▼              ▼
//! │ pending      │        ┌──────────┐  ┌────────────┐  ┌──────────┐
//! └──────────────┘        │RoomRouter│  │ Document   │  │  Lock    │
//!                         │ (fan-out)│  │ Service    │  │ Service  │
//!                         └──────────┘  └─────┬──────┘  └──────────┘
//!                                             ▼
//!                                     DocumentStore
//!                                  (snapshot + op log,
//!                                    version gate)
//! ```
//!
//! ## Modules
//!
//! - [`delta`] — the rich-text delta data model (retain/insert/delete)
//! - [`ot`] — transform / compose / invert and the catch-up fold
//! - [`protocol`] — JSON wire messages tagged by event name
//! - [`store`] — snapshot + append-only op log, memory and RocksDB backends
//! - [`lock`] — per-document distributed mutex with owner tokens and TTL
//! - [`service`] — the version-gated write path with bounded retry
//! - [`room`] — per-document subscriber registry and fan-out
//! - [`session`] — per-connection state machine
//! - [`server`] — WebSocket accept loop and handshake auth
//! - [`auth`] — bearer-token validation seam
//! - [`client`] — pending-op buffering core and WebSocket client
//! - [`presence`] — remote cursor registry
//!
//! ## Guarantees
//!
//! | Property | Mechanism |
//! |----------|-----------|
//! | Convergence | OT diamond property + total commit order per doc |
//! | Intent preservation | committed op wins insert ties |
//! | Per-connection ordering | one FIFO outbound queue per connection |
//! | Ack before later peer ops | ack enqueued while the doc lock is held |
//! | Liveness under lock loss | version gate; lock is only an optimization |

pub mod auth;
pub mod client;
pub mod delta;
pub mod lock;
pub mod ot;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod server;
pub mod service;
pub mod session;
pub mod store;

// Re-exports for convenience
pub use auth::{StaticTokenValidator, TokenValidator};
pub use client::{ClientDocument, ClientEvent, CollabClient, ConnectionState};
pub use delta::{Attributes, Delta, DeltaOp, InsertContent};
pub use lock::{LockService, MemoryLockService};
pub use ot::{compose, invert, transform, transform_multiple};
pub use presence::{CursorRegistry, RemoteCursor};
pub use protocol::{ClientMessage, CursorRange, ProtocolError, ServerMessage, VersionedOp};
pub use room::{RoomRouter, RouterStats};
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use service::{AppliedOperation, DocumentService, ServiceError};
pub use session::CollabSession;
pub use store::{
    AppendOutcome, CommitOutcome, DocumentStore, MemoryStore, OperationEntry, RocksConfig,
    RocksStore, StoreError, StoredDocument,
};
