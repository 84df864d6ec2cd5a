//! RocksDB-backed operation log and snapshot store.
//!
//! Column families:
//! - `oplog`     — Log entries, keyed by `doc_id:revision` (LZ4 + bincode)
//! - `snapshots` — Document snapshots, keyed by `doc_id:revision` (LZ4 + bincode)
//! - `metadata`  — Per-document head revision and counters (bincode)
//!
//! Every log and snapshot value is framed with an FNV-1a checksum over the
//! key and the compressed payload, verified on read:
//! ```text
//! ┌────────────┬──────────────────────────────┐
//! │ checksum   │ lz4(bincode(value))          │
//! │ 4 bytes LE │ variable                     │
//! └────────────┴──────────────────────────────┘
//! ```
//!
//! Performance targets:
//! - Append (small op, fsync off): <50μs
//! - Range of 100 entries: <1ms
//! - Open (10k docs): <100ms
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use quire_core::Operation;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use super::{now_millis, EntryMetadata, LogEntry, OperationLog, Snapshot, SnapshotStore, StoreError};
use crate::protocol::{DocumentId, Revision};

const CF_OPLOG: &str = "oplog";
const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_OPLOG, CF_SNAPSHOTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every append (default: true, an acknowledged op must survive a crash)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quire_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-document bookkeeping kept in the `metadata` column family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub document_id: DocumentId,
    pub head_revision: Revision,
    pub latest_snapshot: Option<Revision>,
    pub snapshot_count: u64,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(document_id: DocumentId) -> Self {
        let now = now_millis();
        Self {
            document_id,
            head_revision: 0,
            latest_snapshot: None,
            snapshot_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// RocksDB-backed implementation of both storage traits.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes the head check with the append batch
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened operation store at {}", config.path.display());
        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_OPLOG => {
                // Values are already LZ4 framed
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_SNAPSHOTS => {
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Load a document's metadata, if it has any.
    pub fn metadata(&self, document_id: DocumentId) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, document_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode_plain(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    /// Decode every framed value under `document_id` in `cf_name` with
    /// `from <= revision <= to`.
    fn scan<T: DeserializeOwned>(
        &self,
        cf_name: &str,
        document_id: DocumentId,
        from: Revision,
        to: Revision,
    ) -> Result<Vec<(Revision, T)>, StoreError> {
        let cf = self.cf(cf_name)?;
        let start_key = revision_key(document_id, from);
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start_key, Direction::Forward));

        let mut out = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if key.len() != 24 || &key[..16] != document_id.as_bytes() {
                break;
            }
            let revision = key_revision(&key);
            if revision > to {
                break;
            }
            out.push((revision, decode_framed(document_id, revision, &key, &value)?));
        }
        Ok(out)
    }
}

impl OperationLog for RocksStore {
    fn append(
        &self,
        document_id: DocumentId,
        revision: Revision,
        operation: &Operation,
        metadata: EntryMetadata,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();

        let mut meta = self
            .metadata(document_id)?
            .unwrap_or_else(|| DocumentMetadata::new(document_id));
        let expected = meta.head_revision + 1;
        if revision != expected {
            return Err(StoreError::RevisionGap {
                document_id,
                expected,
                got: revision,
            });
        }

        let entry = LogEntry {
            revision,
            operation: operation.clone(),
            metadata,
            compactable: false,
        };
        let key = revision_key(document_id, revision);
        let value = encode_framed(&key, &entry)?;

        meta.head_revision = revision;
        meta.updated_at = now_millis();

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_OPLOG)?, &key, &value);
        batch.put_cf(self.cf(CF_METADATA)?, document_id.as_bytes(), encode_plain(&meta)?);
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn range(
        &self,
        document_id: DocumentId,
        from: Revision,
        to: Revision,
    ) -> Result<Vec<LogEntry>, StoreError> {
        if from > to {
            return Ok(Vec::new());
        }
        Ok(self
            .scan::<LogEntry>(CF_OPLOG, document_id, from, to)?
            .into_iter()
            .map(|(_, entry)| entry)
            .collect())
    }

    fn head_revision(&self, document_id: DocumentId) -> Result<Revision, StoreError> {
        Ok(self.metadata(document_id)?.map_or(0, |m| m.head_revision))
    }

    fn mark_compactable(
        &self,
        document_id: DocumentId,
        up_to: Revision,
    ) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock();
        let cf = self.cf(CF_OPLOG)?;

        let mut batch = WriteBatch::default();
        let mut marked = 0;
        for (revision, mut entry) in self.scan::<LogEntry>(CF_OPLOG, document_id, 0, up_to)? {
            if entry.compactable {
                continue;
            }
            entry.compactable = true;
            let key = revision_key(document_id, revision);
            batch.put_cf(cf, &key, encode_framed(&key, &entry)?);
            marked += 1;
        }

        if marked > 0 {
            self.db.write_opt(batch, &self.write_options())?;
        }
        Ok(marked)
    }

    fn documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            let meta: DocumentMetadata = decode_plain(&value)?;
            if key.len() == 16 && meta.head_revision > 0 {
                ids.push(meta.document_id);
            }
        }
        Ok(ids)
    }
}

impl SnapshotStore for RocksStore {
    fn put_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();

        let mut meta = self
            .metadata(snapshot.document_id)?
            .unwrap_or_else(|| DocumentMetadata::new(snapshot.document_id));
        if meta.latest_snapshot.is_some_and(|latest| latest >= snapshot.revision) {
            return Ok(());
        }
        meta.latest_snapshot = Some(snapshot.revision);
        meta.snapshot_count += 1;
        meta.updated_at = now_millis();

        let key = revision_key(snapshot.document_id, snapshot.revision);
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_SNAPSHOTS)?, &key, encode_framed(&key, snapshot)?);
        batch.put_cf(
            self.cf(CF_METADATA)?,
            snapshot.document_id.as_bytes(),
            encode_plain(&meta)?,
        );
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn get_latest_snapshot(&self, document_id: DocumentId) -> Result<Option<Snapshot>, StoreError> {
        let Some(revision) = self.metadata(document_id)?.and_then(|m| m.latest_snapshot) else {
            return Ok(None);
        };
        let key = revision_key(document_id, revision);
        match self.db.get_cf(self.cf(CF_SNAPSHOTS)?, &key)? {
            Some(value) => Ok(Some(decode_framed(document_id, revision, &key, &value)?)),
            None => Ok(None),
        }
    }

    fn snapshots(&self, document_id: DocumentId) -> Result<Vec<Snapshot>, StoreError> {
        Ok(self
            .scan::<Snapshot>(CF_SNAPSHOTS, document_id, 0, Revision::MAX)?
            .into_iter()
            .map(|(_, snapshot)| snapshot)
            .collect())
    }
}

// ─── Encoding ─────────────────────────────────────────────────────────

/// Key: doc_id (16 bytes) + revision (8 bytes big-endian).
fn revision_key(document_id: Uuid, revision: Revision) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(document_id.as_bytes());
    key.extend_from_slice(&revision.to_be_bytes());
    key
}

fn key_revision(key: &[u8]) -> Revision {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&key[16..24]);
    u64::from_be_bytes(buf)
}

fn encode_plain<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_plain<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

fn encode_framed<T: Serialize>(key: &[u8], value: &T) -> Result<Vec<u8>, StoreError> {
    let compressed = lz4_flex::compress_prepend_size(&encode_plain(value)?);
    let mut framed = Vec::with_capacity(4 + compressed.len());
    framed.extend_from_slice(&checksum(key, &compressed).to_le_bytes());
    framed.extend_from_slice(&compressed);
    Ok(framed)
}

fn decode_framed<T: DeserializeOwned>(
    document_id: DocumentId,
    revision: Revision,
    key: &[u8],
    framed: &[u8],
) -> Result<T, StoreError> {
    if framed.len() < 4 {
        return Err(StoreError::ChecksumMismatch { document_id, revision });
    }
    let (stored, compressed) = framed.split_at(4);
    let mut buf = [0u8; 4];
    buf.copy_from_slice(stored);
    if u32::from_le_bytes(buf) != checksum(key, compressed) {
        return Err(StoreError::ChecksumMismatch { document_id, revision });
    }
    let bytes = lz4_flex::decompress_size_prepended(compressed)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    decode_plain(&bytes)
}

/// FNV-1a over the key and payload.
fn checksum(key: &[u8], payload: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5; // FNV offset basis
    for byte in key.iter().chain(payload) {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x0100_0193); // FNV prime
    }
    hash
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
