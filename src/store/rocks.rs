//! RocksDB-backed document store.
//!
//! Column families:
//! - `documents`  — full snapshots, keyed by doc id (LZ4-compressed JSON)
//! - `operations` — the op log, keyed `doc_id (16 bytes) ++ version (8
//!   bytes big-endian)` so a forward iterator yields one document's ops in
//!   version order (LZ4-compressed JSON)
//!
//! The database is opened single-threaded; concurrency comes from tokio.
//! Reads go straight to RocksDB; the two write paths (`commit`,
//! `append_log`) serialize their read-compare-write sequences through one
//! internal mutex so the version gate and the duplicate check stay atomic
//! under concurrent sessions.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::delta::Delta;

use super::{
    epoch_secs, AppendOutcome, CommitOutcome, DocumentStore, OperationEntry, StoreError,
    StoredDocument,
};

const CF_DOCUMENTS: &str = "documents";
const CF_OPERATIONS: &str = "operations";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_OPERATIONS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: f64,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("scribe_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10.0,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl RocksConfig {
    /// Config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10.0,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Durable snapshot + log storage over RocksDB.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: RocksConfig,
    /// Serializes commit/append read-compare-write sequences.
    write_gate: Mutex<()>,
}

impl RocksStore {
    /// Open the store at the configured path, creating the database and
    /// column families as needed.
    pub fn open(config: RocksConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self { db, config, write_gate: Mutex::new(()) })
    }

    fn cf_options(name: &str, config: &RocksConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS => {
                // One snapshot per doc, point lookups only.
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_OPERATIONS => {
                // Many small appends, prefix-scanned by doc id.
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// `doc_id (16 bytes) ++ version (8 bytes big-endian)`.
    fn op_key(doc_id: Uuid, version: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(doc_id.as_bytes());
        key.extend_from_slice(&version.to_be_bytes());
        key
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
        let json =
            serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&json))
    }

    fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
        let json = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn load_doc(&self, doc_id: Uuid) -> Result<StoredDocument, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self
            .db
            .get_cf(cf, doc_id.as_bytes())
            .map_err(|e| StoreError::Database(e.to_string()))?
        {
            Some(bytes) => Self::decode(&bytes),
            None => Err(StoreError::NotFound(doc_id)),
        }
    }

    fn put_doc(&self, doc: &StoredDocument) -> Result<(), StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .put_cf_opt(cf, doc.id.as_bytes(), Self::encode(doc)?, &write_opts)
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

#[async_trait]
impl DocumentStore for RocksStore {
    async fn create(&self, doc: StoredDocument) -> Result<(), StoreError> {
        let _gate = self.write_gate.lock().await;
        if self.load_doc(doc.id).is_ok() {
            return Err(StoreError::AlreadyExists(doc.id));
        }
        self.put_doc(&doc)
    }

    async fn load(&self, doc_id: Uuid) -> Result<StoredDocument, StoreError> {
        self.load_doc(doc_id)
    }

    async fn ops_since(
        &self,
        doc_id: Uuid,
        from_version: u64,
    ) -> Result<Vec<OperationEntry>, StoreError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let start_key = Self::op_key(doc_id, from_version + 1);

        let mut ops = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start_key, rocksdb::Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if key.len() < 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            ops.push(Self::decode(&value)?);
        }
        Ok(ops)
    }

    async fn commit(
        &self,
        doc_id: Uuid,
        expected_version: u64,
        new_content: &Delta,
        new_version: u64,
    ) -> Result<CommitOutcome, StoreError> {
        debug_assert_eq!(new_version, expected_version + 1);
        let _gate = self.write_gate.lock().await;

        let mut doc = self.load_doc(doc_id)?;
        if doc.version != expected_version {
            return Ok(CommitOutcome::Conflict);
        }
        doc.content = new_content.clone();
        doc.version = new_version;
        doc.updated_at = epoch_secs();
        self.put_doc(&doc)?;
        Ok(CommitOutcome::Committed)
    }

    async fn append_log(&self, entry: OperationEntry) -> Result<AppendOutcome, StoreError> {
        let _gate = self.write_gate.lock().await;

        let cf = self.cf(CF_OPERATIONS)?;
        let key = Self::op_key(entry.doc_id, entry.version);
        if self
            .db
            .get_cf(cf, &key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .is_some()
        {
            return Ok(AppendOutcome::Duplicate);
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(cf, &key, Self::encode(&entry)?);
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .write_opt(batch, &write_opts)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(AppendOutcome::Appended)
    }
}
