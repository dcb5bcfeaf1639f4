//! Persistent state for collaborative documents.
//!
//! Two logical collections:
//! - `documents` — one snapshot per document: the full content delta plus
//!   the current version and metadata.
//! - `operations` — an append-only log keyed by `(doc_id, version)`,
//!   holding the transformed delta that was actually applied at each
//!   version.
//!
//! The store's one concurrency primitive is the version gate:
//! [`DocumentStore::commit`] mutates the snapshot only when the stored
//! version still equals the caller's expectation, and mutates nothing
//! otherwise. Every writer goes through it, so the log's max version and
//! the snapshot version stay equal after each successful commit pair, and
//! folding the log from the empty delta reproduces the snapshot.
//!
//! Backends:
//! - [`MemoryStore`] — in-memory maps; the test fake and the default for
//!   in-memory servers.
//! - [`RocksStore`] — RocksDB column families with LZ4-compressed values.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5
//! (leader-based replication logs), Chapter 7 (compare-and-set)

pub mod memory;
pub mod rocks;

use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::delta::Delta;

pub use memory::MemoryStore;
pub use rocks::{RocksConfig, RocksStore};

/// Seconds since the Unix epoch.
pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Milliseconds since the Unix epoch.
pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A document snapshot with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredDocument {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub title: String,
    /// Insert-only delta; its cursor position equals the total length.
    pub content: Delta,
    /// Monotone, advanced by exactly one per committed op.
    pub version: u64,
    pub created_by: String,
    pub collaborators: Vec<String>,
    /// Epoch seconds.
    pub created_at: u64,
    pub updated_at: u64,
}

impl StoredDocument {
    /// A fresh document: version 0, empty content.
    pub fn new(id: Uuid, title: impl Into<String>, created_by: impl Into<String>) -> Self {
        let now = epoch_secs();
        StoredDocument {
            id,
            title: title.into(),
            content: Delta::new(),
            version: 0,
            created_by: created_by.into(),
            collaborators: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_collaborators(mut self, collaborators: Vec<String>) -> Self {
        self.collaborators = collaborators;
        self
    }

    /// Owner-or-collaborator check applied at join time.
    pub fn can_edit(&self, user_id: &str) -> bool {
        self.created_by == user_id || self.collaborators.iter().any(|c| c == user_id)
    }
}

/// One committed operation. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationEntry {
    pub doc_id: Uuid,
    /// The document version AFTER this op applied; the first committed op
    /// has version 1.
    pub version: u64,
    /// The transformed delta actually composed into the snapshot, not the
    /// client's pre-transform submission.
    pub delta: Delta,
    pub user_id: String,
    pub conn_id: Uuid,
    /// Epoch milliseconds.
    pub timestamp: u64,
}

/// Result of a version-gated commit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The gate passed; snapshot and version were updated.
    Committed,
    /// Another writer advanced the version first; nothing was mutated.
    Conflict,
}

/// Result of a log append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// An entry with this `(doc_id, version)` already exists; state is
    /// unchanged.
    Duplicate,
}

/// Storage failures. Version conflicts and log duplicates are outcomes,
/// not errors — they drive the caller's retry and idempotency paths.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(Uuid),
    #[error("document already exists: {0}")]
    AlreadyExists(Uuid),
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("compression error: {0}")]
    Compression(String),
}

/// Snapshot-and-log storage behind the write path.
///
/// Injected as `Arc<dyn DocumentStore>` so tests substitute
/// [`MemoryStore`].
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Birth a document (version 0, content as given). Fails on an
    /// existing id.
    async fn create(&self, doc: StoredDocument) -> Result<(), StoreError>;

    /// Current snapshot and version.
    async fn load(&self, doc_id: Uuid) -> Result<StoredDocument, StoreError>;

    /// Log entries with `version > from_version`, ascending.
    async fn ops_since(
        &self,
        doc_id: Uuid,
        from_version: u64,
    ) -> Result<Vec<OperationEntry>, StoreError>;

    /// Conditionally update the snapshot: only when the stored version
    /// equals `expected_version`. `new_version` must be
    /// `expected_version + 1`.
    async fn commit(
        &self,
        doc_id: Uuid,
        expected_version: u64,
        new_content: &Delta,
        new_version: u64,
    ) -> Result<CommitOutcome, StoreError>;

    /// Append-only log write; duplicates on `(doc_id, version)` are
    /// rejected without mutation.
    async fn append_log(&self, entry: OperationEntry) -> Result<AppendOutcome, StoreError>;
}
