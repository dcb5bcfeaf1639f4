//! The write path: transform, compose, commit.
//!
//! One call per inbound client op:
//! ```text
//! load ──► catch-up transform ──► compose ──► commit (version gate)
//!   ▲                                             │
//!   │                     Conflict                │ Committed
//!   └─────────────────────────────────────────────┤
//!                                                 ▼
//!                                            append to log
//! ```
//! A `Conflict` from the gate means another writer won the race; the loop
//! restarts from `load` and the op is transformed through whatever was
//! committed in the meantime. The loop is bounded: exhausting the retry
//! budget surfaces [`ServiceError::TooMuchContention`].
//!
//! The tie-break in the catch-up fold preserves intent: a client's
//! insertion lands after any concurrent insertion already committed at
//! the same position.

use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::delta::Delta;
use crate::ot;
use crate::store::{
    epoch_millis, AppendOutcome, CommitOutcome, DocumentStore, OperationEntry, StoreError,
    StoredDocument,
};

/// Commit attempts before giving up under contention.
pub const MAX_RETRIES: u32 = 5;

/// Write-path failures surfaced to the session layer.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("document not found: {0}")]
    NotFound(Uuid),
    /// The client claims a version the server has not reached: the client
    /// is corrupt or replaying. Not retriable; the client must resync.
    #[error("client version {client} is ahead of server version {server}")]
    VersionAhead { client: u64, server: u64 },
    #[error("commit contention persisted across {attempts} attempts")]
    TooMuchContention { attempts: u32 },
    /// The delta does not fit the document it claims to edit.
    #[error("malformed operation: base length {op} exceeds document length {doc}")]
    MalformedOperation { op: u64, doc: u64 },
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => ServiceError::NotFound(id),
            other => ServiceError::Store(other),
        }
    }
}

/// A successfully applied operation.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedOperation {
    /// The delta actually composed into the snapshot — this, not the
    /// client's submission, is what peers receive.
    pub delta: Delta,
    /// The document version after the commit.
    pub version: u64,
}

/// Orchestrates the per-document write path over an injected store.
pub struct DocumentService {
    store: Arc<dyn DocumentStore>,
    max_retries: u32,
}

impl DocumentService {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store, max_retries: MAX_RETRIES }
    }

    /// Override the retry budget (tests exercise the exhaustion path).
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Create a document at version 0 with empty content.
    pub async fn create_document(
        &self,
        title: impl Into<String>,
        created_by: impl Into<String>,
        collaborators: Vec<String>,
    ) -> Result<StoredDocument, ServiceError> {
        let doc = StoredDocument::new(Uuid::new_v4(), title, created_by)
            .with_collaborators(collaborators);
        self.store.create(doc.clone()).await?;
        log::info!("created document {} ({})", doc.id, doc.title);
        Ok(doc)
    }

    /// Current snapshot, for join replies.
    pub async fn load_document(&self, doc_id: Uuid) -> Result<StoredDocument, ServiceError> {
        Ok(self.store.load(doc_id).await?)
    }

    /// Log entries after `from_version`, for catch-up replies.
    pub async fn ops_since(
        &self,
        doc_id: Uuid,
        from_version: u64,
    ) -> Result<Vec<OperationEntry>, ServiceError> {
        Ok(self.store.ops_since(doc_id, from_version).await?)
    }

    /// Apply one client op composed against `client_version`.
    pub async fn apply_operation(
        &self,
        doc_id: Uuid,
        client_delta: &Delta,
        client_version: u64,
        user_id: &str,
        conn_id: Uuid,
    ) -> Result<AppliedOperation, ServiceError> {
        for attempt in 1..=self.max_retries {
            let doc = self.store.load(doc_id).await?;
            let current_version = doc.version;

            if client_version > current_version {
                return Err(ServiceError::VersionAhead {
                    client: client_version,
                    server: current_version,
                });
            }

            let transformed = if client_version < current_version {
                let missed = self.store.ops_since(doc_id, client_version).await?;
                log::debug!(
                    "transforming op for doc {doc_id} through {} missed ops ({} -> {})",
                    missed.len(),
                    client_version,
                    current_version
                );
                let committed: Vec<Delta> = missed.into_iter().map(|e| e.delta).collect();
                ot::transform_multiple(client_delta, &committed)
            } else {
                client_delta.clone()
            };

            // A well-formed delta based at the client's version never
            // spans past the content it was transformed onto; one that
            // does would compose retains into the snapshot and corrupt
            // the insert-only invariant.
            if transformed.base_length() > doc.content.length() {
                return Err(ServiceError::MalformedOperation {
                    op: transformed.base_length(),
                    doc: doc.content.length(),
                });
            }

            let new_content = ot::compose(&doc.content, &transformed);
            debug_assert!(ot::is_document(&new_content));
            let new_version = current_version + 1;

            match self
                .store
                .commit(doc_id, current_version, &new_content, new_version)
                .await?
            {
                CommitOutcome::Conflict => {
                    // Another writer advanced the version; reload and
                    // transform through whatever it committed.
                    log::debug!(
                        "commit conflict on doc {doc_id} at version {current_version} (attempt {attempt})"
                    );
                    continue;
                }
                CommitOutcome::Committed => {
                    let entry = OperationEntry {
                        doc_id,
                        version: new_version,
                        delta: transformed.clone(),
                        user_id: user_id.to_string(),
                        conn_id,
                        timestamp: epoch_millis(),
                    };
                    if self.store.append_log(entry).await? == AppendOutcome::Duplicate {
                        // Idempotent retry path: the entry is already
                        // durable, the commit stands.
                        log::warn!(
                            "duplicate log entry for doc {doc_id} version {new_version}; treating as success"
                        );
                    }
                    return Ok(AppliedOperation { delta: transformed, version: new_version });
                }
            }
        }

        log::warn!(
            "giving up on doc {doc_id} after {} contended commit attempts",
            self.max_retries
        );
        Err(ServiceError::TooMuchContention { attempts: self.max_retries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn service_with_doc() -> (DocumentService, Uuid) {
        let service = DocumentService::new(Arc::new(MemoryStore::new()));
        let doc = service
            .create_document("Notes", "alice", vec!["bob".into()])
            .await
            .unwrap();
        (service, doc.id)
    }

    #[tokio::test]
    async fn test_single_writer_commits_first_attempt() {
        let (service, doc_id) = service_with_doc().await;

        let applied = service
            .apply_operation(doc_id, &Delta::new().insert("Hello"), 0, "alice", Uuid::new_v4())
            .await
            .unwrap();

        assert_eq!(applied.version, 1);
        assert_eq!(applied.delta, Delta::new().insert("Hello"));

        let doc = service.load_document(doc_id).await.unwrap();
        assert_eq!(doc.version, 1);
        assert_eq!(doc.content, Delta::new().insert("Hello"));
    }

    #[tokio::test]
    async fn test_stale_op_transformed_through_missed_ops() {
        let (service, doc_id) = service_with_doc().await;
        let conn = Uuid::new_v4();

        // A commits first at base 0.
        service
            .apply_operation(doc_id, &Delta::new().insert("A"), 0, "alice", conn)
            .await
            .unwrap();

        // B also composed against base 0; its insert must land after A's.
        let applied = service
            .apply_operation(doc_id, &Delta::new().insert("B"), 0, "bob", conn)
            .await
            .unwrap();

        assert_eq!(applied.version, 2);
        assert_eq!(applied.delta, Delta::new().retain(1).insert("B"));

        let doc = service.load_document(doc_id).await.unwrap();
        assert_eq!(doc.content, Delta::new().insert("AB"));
    }

    #[tokio::test]
    async fn test_version_ahead_is_terminal() {
        let (service, doc_id) = service_with_doc().await;

        let err = service
            .apply_operation(doc_id, &Delta::new().insert("x"), 7, "alice", Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::VersionAhead { client: 7, server: 0 }));
    }

    #[tokio::test]
    async fn test_oversized_delta_rejected() {
        let (service, doc_id) = service_with_doc().await;

        // Claims to retain 10 units of an empty document.
        let err = service
            .apply_operation(
                doc_id,
                &Delta::new().retain(10).insert("x"),
                0,
                "alice",
                Uuid::new_v4(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::MalformedOperation { op: 10, doc: 0 }));
    }

    #[tokio::test]
    async fn test_missing_document() {
        let service = DocumentService::new(Arc::new(MemoryStore::new()));
        let err = service
            .apply_operation(Uuid::new_v4(), &Delta::new().insert("x"), 0, "alice", Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_log_fold_reproduces_snapshot() {
        let (service, doc_id) = service_with_doc().await;
        let conn = Uuid::new_v4();

        let edits = [
            (Delta::new().insert("Hello"), 0),
            (Delta::new().retain(5).insert(" world"), 1),
            (Delta::new().delete(1).insert("J"), 1), // stale base, transformed
            (Delta::new().retain(6).delete(5).insert("there"), 3),
        ];
        for (delta, base) in edits {
            service
                .apply_operation(doc_id, &delta, base, "alice", conn)
                .await
                .unwrap();
        }

        let doc = service.load_document(doc_id).await.unwrap();
        let log = service.ops_since(doc_id, 0).await.unwrap();

        assert_eq!(doc.version, log.len() as u64);
        let versions: Vec<u64> = log.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2, 3, 4]);

        let folded = log
            .iter()
            .fold(Delta::new(), |acc, e| ot::compose(&acc, &e.delta));
        assert_eq!(folded, doc.content);
    }

    /// Store wrapper that forces the first `n` commits to conflict.
    struct ConflictingStore {
        inner: MemoryStore,
        conflicts_left: AtomicU32,
    }

    impl ConflictingStore {
        fn new(conflicts: u32) -> Self {
            Self { inner: MemoryStore::new(), conflicts_left: AtomicU32::new(conflicts) }
        }
    }

    #[async_trait]
    impl DocumentStore for ConflictingStore {
        async fn create(&self, doc: StoredDocument) -> Result<(), StoreError> {
            self.inner.create(doc).await
        }

        async fn load(&self, doc_id: Uuid) -> Result<StoredDocument, StoreError> {
            self.inner.load(doc_id).await
        }

        async fn ops_since(
            &self,
            doc_id: Uuid,
            from_version: u64,
        ) -> Result<Vec<OperationEntry>, StoreError> {
            self.inner.ops_since(doc_id, from_version).await
        }

        async fn commit(
            &self,
            doc_id: Uuid,
            expected_version: u64,
            new_content: &Delta,
            new_version: u64,
        ) -> Result<CommitOutcome, StoreError> {
            let left = self.conflicts_left.load(Ordering::SeqCst);
            if left > 0 {
                self.conflicts_left.store(left - 1, Ordering::SeqCst);
                return Ok(CommitOutcome::Conflict);
            }
            self.inner.commit(doc_id, expected_version, new_content, new_version).await
        }

        async fn append_log(&self, entry: OperationEntry) -> Result<AppendOutcome, StoreError> {
            self.inner.append_log(entry).await
        }
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion() {
        let store = Arc::new(ConflictingStore::new(MAX_RETRIES));
        let service = DocumentService::new(store);
        let doc = service.create_document("Contended", "alice", vec![]).await.unwrap();

        let err = service
            .apply_operation(doc.id, &Delta::new().insert("x"), 0, "alice", Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::TooMuchContention { attempts: MAX_RETRIES }));
    }

    #[tokio::test]
    async fn test_retry_succeeds_within_budget() {
        let store = Arc::new(ConflictingStore::new(MAX_RETRIES - 1));
        let service = DocumentService::new(store);
        let doc = service.create_document("Contended", "alice", vec![]).await.unwrap();

        let applied = service
            .apply_operation(doc.id, &Delta::new().insert("x"), 0, "alice", Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(applied.version, 1);
    }

    /// Store wrapper whose log already contains every version (idempotent
    /// retry path: append reports Duplicate).
    struct DuplicatingStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl DocumentStore for DuplicatingStore {
        async fn create(&self, doc: StoredDocument) -> Result<(), StoreError> {
            self.inner.create(doc).await
        }

        async fn load(&self, doc_id: Uuid) -> Result<StoredDocument, StoreError> {
            self.inner.load(doc_id).await
        }

        async fn ops_since(
            &self,
            doc_id: Uuid,
            from_version: u64,
        ) -> Result<Vec<OperationEntry>, StoreError> {
            self.inner.ops_since(doc_id, from_version).await
        }

        async fn commit(
            &self,
            doc_id: Uuid,
            expected_version: u64,
            new_content: &Delta,
            new_version: u64,
        ) -> Result<CommitOutcome, StoreError> {
            self.inner.commit(doc_id, expected_version, new_content, new_version).await
        }

        async fn append_log(&self, _entry: OperationEntry) -> Result<AppendOutcome, StoreError> {
            Ok(AppendOutcome::Duplicate)
        }
    }

    #[tokio::test]
    async fn test_duplicate_append_treated_as_success() {
        let store = Arc::new(DuplicatingStore { inner: MemoryStore::new() });
        let service = DocumentService::new(store);
        let doc = service.create_document("Dup", "alice", vec![]).await.unwrap();

        let applied = service
            .apply_operation(doc.id, &Delta::new().insert("x"), 0, "alice", Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(applied.version, 1);
    }
}
