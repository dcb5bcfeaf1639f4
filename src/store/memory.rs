//! In-memory document store.
//!
//! The reference implementation of the version gate and the test fake for
//! everything above the storage layer. All state lives in two maps behind
//! `tokio::sync::RwLock`; the gate is a compare under the write lock.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::delta::Delta;

use super::{
    epoch_secs, AppendOutcome, CommitOutcome, DocumentStore, OperationEntry, StoreError,
    StoredDocument,
};

/// Non-durable snapshot + log storage.
#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<HashMap<Uuid, StoredDocument>>,
    log: RwLock<HashMap<Uuid, BTreeMap<u64, OperationEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of log entries for a document (test helper).
    pub async fn log_len(&self, doc_id: Uuid) -> usize {
        self.log
            .read()
            .await
            .get(&doc_id)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    pub async fn document_count(&self) -> usize {
        self.docs.read().await.len()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create(&self, doc: StoredDocument) -> Result<(), StoreError> {
        let mut docs = self.docs.write().await;
        if docs.contains_key(&doc.id) {
            return Err(StoreError::AlreadyExists(doc.id));
        }
        docs.insert(doc.id, doc);
        Ok(())
    }

    async fn load(&self, doc_id: Uuid) -> Result<StoredDocument, StoreError> {
        self.docs
            .read()
            .await
            .get(&doc_id)
            .cloned()
            .ok_or(StoreError::NotFound(doc_id))
    }

    async fn ops_since(
        &self,
        doc_id: Uuid,
        from_version: u64,
    ) -> Result<Vec<OperationEntry>, StoreError> {
        let log = self.log.read().await;
        let Some(entries) = log.get(&doc_id) else {
            return Ok(Vec::new());
        };
        Ok(entries
            .range(from_version + 1..)
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn commit(
        &self,
        doc_id: Uuid,
        expected_version: u64,
        new_content: &Delta,
        new_version: u64,
    ) -> Result<CommitOutcome, StoreError> {
        debug_assert_eq!(new_version, expected_version + 1);
        let mut docs = self.docs.write().await;
        let doc = docs.get_mut(&doc_id).ok_or(StoreError::NotFound(doc_id))?;
        if doc.version != expected_version {
            return Ok(CommitOutcome::Conflict);
        }
        doc.content = new_content.clone();
        doc.version = new_version;
        doc.updated_at = epoch_secs();
        Ok(CommitOutcome::Committed)
    }

    async fn append_log(&self, entry: OperationEntry) -> Result<AppendOutcome, StoreError> {
        let mut log = self.log.write().await;
        let entries = log.entry(entry.doc_id).or_default();
        if entries.contains_key(&entry.version) {
            return Ok(AppendOutcome::Duplicate);
        }
        entries.insert(entry.version, entry);
        Ok(AppendOutcome::Appended)
    }
}
