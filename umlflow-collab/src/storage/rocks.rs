//! RocksDB-backed shared snapshot store.
//!
//! Column families:
//! - `tokens`    — Share entries keyed by token (bincode, LZ4 compressed)
//! - `directory` — Global token index so any client instance can discover
//!                 entries without the issuing client being online
//! - `backups`   — Timestamped diagram copies, keyed by diagram_id + ts

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use umlflow_core::DiagramData;

/// Column family names.
const CF_TOKENS: &str = "tokens";
const CF_DIRECTORY: &str = "directory";
const CF_BACKUPS: &str = "backups";

const COLUMN_FAMILIES: &[&str] = &[CF_TOKENS, CF_DIRECTORY, CF_BACKUPS];

/// Key under which the global token directory lives.
const DIRECTORY_KEY: &[u8] = b"all-tokens";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct SharedStoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 32MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 128)
    pub max_open_files: i32,
    /// Backups retained per diagram (default: 10)
    pub backups_per_diagram: usize,
}

impl Default for SharedStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("umlflow_shared"),
            block_cache_size: 32 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 128,
            backups_per_diagram: 10,
        }
    }
}

impl SharedStoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            backups_per_diagram: 3,
        }
    }
}

/// A shared diagram snapshot keyed by its token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareEntry {
    /// The token this entry is keyed by (uppercase, fixed length)
    pub token: String,
    /// Diagram the token resolves to
    pub diagram_id: String,
    /// Whole-document snapshot
    pub diagram_data: DiagramData,
    /// Issue timestamp, seconds since epoch
    pub shared_at: u64,
    /// Cleared when the issuer revokes the share
    pub is_active: bool,
    /// Last snapshot write, milliseconds since epoch
    pub last_updated: u64,
}

impl ShareEntry {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let raw = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let (entry, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(entry)
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Token has no entry
    NotFound(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(token) => write!(f, "No entry for token: {token}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed shared store.
///
/// Durable home for share entries and the global token directory,
/// so a second client instance can resolve a token issued by the first.
pub struct SharedStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: SharedStoreConfig,
}

impl SharedStore {
    /// Open the shared store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: SharedStoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    fn cf_options(config: &SharedStoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4'd before write
        opts.set_compression_type(DBCompressionType::None);
        opts
    }

    // ─── Share entries ────────────────────────────────────────────────

    /// Write a share entry and index it in the global directory.
    ///
    /// The write is a whole-value overwrite; concurrent writers to the
    /// same token clobber each other.
    pub fn put_entry(&self, entry: &ShareEntry) -> Result<(), StoreError> {
        let cf_tokens = self.cf(CF_TOKENS)?;
        let cf_dir = self.cf(CF_DIRECTORY)?;

        let mut directory = self.list_tokens()?;
        if !directory.iter().any(|t| t == &entry.token) {
            directory.push(entry.token.clone());
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_tokens, entry.token.as_bytes(), &entry.encode()?);
        batch.put_cf(&cf_dir, DIRECTORY_KEY, &Self::encode_directory(&directory)?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Load a share entry by token.
    pub fn get_entry(&self, token: &str) -> Result<ShareEntry, StoreError> {
        let cf = self.cf(CF_TOKENS)?;
        match self.db.get_cf(&cf, token.as_bytes())? {
            Some(bytes) => ShareEntry::decode(&bytes),
            None => Err(StoreError::NotFound(token.to_string())),
        }
    }

    /// Whether an entry exists for the token.
    pub fn contains(&self, token: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_TOKENS)?;
        Ok(self.db.get_cf(&cf, token.as_bytes())?.is_some())
    }

    /// Remove a share entry and de-index it.
    pub fn remove_entry(&self, token: &str) -> Result<(), StoreError> {
        let cf_tokens = self.cf(CF_TOKENS)?;
        let cf_dir = self.cf(CF_DIRECTORY)?;

        let directory: Vec<String> = self
            .list_tokens()?
            .into_iter()
            .filter(|t| t != token)
            .collect();

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_tokens, token.as_bytes());
        batch.put_cf(&cf_dir, DIRECTORY_KEY, &Self::encode_directory(&directory)?);
        self.db.write(batch)?;
        Ok(())
    }

    /// All tokens in the global directory.
    pub fn list_tokens(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_DIRECTORY)?;
        match self.db.get_cf(&cf, DIRECTORY_KEY)? {
            Some(bytes) => {
                let (tokens, _) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
                Ok(tokens)
            }
            None => Ok(Vec::new()),
        }
    }

    // ─── Backups ──────────────────────────────────────────────────────

    /// Save a timestamped backup of a diagram, pruning old copies.
    ///
    /// Key format: `<diagram_id bytes>:<ts_millis:8 bytes big-endian>`.
    pub fn save_backup(
        &self,
        diagram_id: &str,
        data: &DiagramData,
        ts_millis: u64,
    ) -> Result<(), StoreError> {
        let cf = self.cf(CF_BACKUPS)?;

        let raw = serde_json::to_vec(data)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&raw);

        self.db
            .put_cf(&cf, Self::backup_key(diagram_id, ts_millis), &compressed)?;
        self.prune_backups(diagram_id)?;
        Ok(())
    }

    /// Load the most recent backup for a diagram, if any.
    pub fn latest_backup(&self, diagram_id: &str) -> Result<Option<(u64, DiagramData)>, StoreError> {
        Ok(self.backups(diagram_id)?.into_iter().last().map(|(ts, _, data)| (ts, data)))
    }

    /// Count backups stored for a diagram.
    pub fn backup_count(&self, diagram_id: &str) -> Result<usize, StoreError> {
        Ok(self.backups(diagram_id)?.len())
    }

    /// All backups for a diagram in timestamp order: (ts, key, data).
    fn backups(&self, diagram_id: &str) -> Result<Vec<(u64, Vec<u8>, DiagramData)>, StoreError> {
        let cf = self.cf(CF_BACKUPS)?;
        let prefix = Self::backup_prefix(diagram_id);

        let mut out = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            if key.len() < prefix.len() + 8 {
                continue;
            }
            let mut ts_buf = [0u8; 8];
            ts_buf.copy_from_slice(&key[prefix.len()..prefix.len() + 8]);
            let ts = u64::from_be_bytes(ts_buf);

            let raw = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::CompressionError(e.to_string()))?;
            let data: DiagramData = serde_json::from_slice(&raw)
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            out.push((ts, key.to_vec(), data));
        }
        Ok(out)
    }

    /// Drop oldest backups past the retention limit.
    fn prune_backups(&self, diagram_id: &str) -> Result<(), StoreError> {
        let backups = self.backups(diagram_id)?;
        let keep = self.config.backups_per_diagram;
        if backups.len() <= keep {
            return Ok(());
        }

        let cf = self.cf(CF_BACKUPS)?;
        let mut batch = WriteBatch::default();
        for (_, key, _) in &backups[..backups.len() - keep] {
            batch.delete_cf(&cf, key);
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn encode_directory(tokens: &[String]) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(tokens, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn backup_prefix(diagram_id: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(diagram_id.len() + 1);
        prefix.extend_from_slice(diagram_id.as_bytes());
        prefix.push(b':');
        prefix
    }

    fn backup_key(diagram_id: &str, ts_millis: u64) -> Vec<u8> {
        let mut key = Self::backup_prefix(diagram_id);
        key.extend_from_slice(&ts_millis.to_be_bytes());
        key
    }
}
