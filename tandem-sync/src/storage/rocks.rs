//! RocksDB-backed change log.
//!
//! Column families:
//! - `changes`: bincode-encoded changes, LZ4 compressed, keyed by `<uri>\0<seq:u64 BE>`
//! - `heads`:   highest sequence per document, keyed by `<uri>`
//!
//! Big-endian sequence numbers keep each document's changes contiguous and
//! ordered, so `read_range` is a single forward scan.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use super::{ChangeStore, StoreError};
use crate::change::{Change, DocumentUri};

const CF_CHANGES: &str = "changes";
const CF_HEADS: &str = "heads";

const COLUMN_FAMILIES: &[&str] = &[CF_CHANGES, CF_HEADS];

/// Store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every append (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tandem_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, given directory.
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

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durable change log.
pub struct RocksChangeStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksChangeStore {
    /// Open (or create) the store at the configured path.
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

        log::info!("Opened change store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_CHANGES => {
                // Values are already LZ4 compressed
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_HEADS => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    /// `<uri>\0`
    fn key_prefix(document_uri: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(document_uri.len() + 1);
        prefix.extend_from_slice(document_uri.as_bytes());
        prefix.push(0);
        prefix
    }

    /// `<uri>\0<seq:u64 BE>`
    fn change_key(document_uri: &str, sequence: u64) -> Vec<u8> {
        let mut key = Self::key_prefix(document_uri);
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }

    fn encode_change(change: &Change) -> Result<Vec<u8>, StoreError> {
        let bytes = bincode::serde::encode_to_vec(change, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&bytes))
    }

    fn decode_change(value: &[u8]) -> Result<Change, StoreError> {
        let bytes = lz4_flex::decompress_size_prepended(value)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let (change, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(change)
    }
}

impl ChangeStore for RocksChangeStore {
    fn append(&self, document_uri: &str, change: &Change) -> Result<u64, StoreError> {
        let cf_changes = self.cf(CF_CHANGES)?;
        let cf_heads = self.cf(CF_HEADS)?;

        let sequence = self.head(document_uri)? + 1;
        let value = Self::encode_change(change)?;

        // Change and head move together
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_changes, Self::change_key(document_uri, sequence), &value);
        batch.put_cf(&cf_heads, document_uri.as_bytes(), sequence.to_be_bytes());

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(sequence)
    }

    fn read_range(
        &self,
        document_uri: &str,
        from: u64,
        to: u64,
    ) -> Result<Vec<Change>, StoreError> {
        let from = from.max(1);
        if from > to {
            return Ok(Vec::new());
        }

        let cf = self.cf(CF_CHANGES)?;
        let prefix = Self::key_prefix(document_uri);
        let start_key = Self::change_key(document_uri, from);

        let mut changes = Vec::new();
        let mut expected = from;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start_key, Direction::Forward));

        for item in iter {
            let (key, value) = item?;

            // Past this document's key range
            if key.len() != prefix.len() + 8 || !key.starts_with(&prefix) {
                break;
            }

            let mut seq_buf = [0u8; 8];
            seq_buf.copy_from_slice(&key[prefix.len()..]);
            let sequence = u64::from_be_bytes(seq_buf);
            if sequence > to {
                break;
            }
            if sequence != expected {
                return Err(StoreError::Corrupt {
                    document_uri: document_uri.to_string(),
                    sequence: expected,
                });
            }

            changes.push(Self::decode_change(&value)?);
            expected += 1;
        }

        Ok(changes)
    }

    fn head(&self, document_uri: &str) -> Result<u64, StoreError> {
        let cf = self.cf(CF_HEADS)?;
        match self.db.get_cf(&cf, document_uri.as_bytes())? {
            Some(bytes) => {
                let buf: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    StoreError::Corrupt {
                        document_uri: document_uri.to_string(),
                        sequence: 0,
                    }
                })?;
                Ok(u64::from_be_bytes(buf))
            }
            None => Ok(0),
        }
    }

    fn documents(&self) -> Result<Vec<DocumentUri>, StoreError> {
        let cf = self.cf(CF_HEADS)?;
        let mut uris = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let uri = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            uris.push(uri);
        }
        Ok(uris)
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
