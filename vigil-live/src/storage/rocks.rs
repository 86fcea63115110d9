//! RocksDB handle shared by the alert repository and the profile store.
//!
//! Column families:
//! - `alerts`: alert records keyed by `(timestamp, id)` (order-preserving)
//! - `alert_ids`: id → `alerts` key, for point lookups
//! - `users`: profile records keyed by id
//! - `meta`: id sequences
//!
//! Sequences are written in the same `WriteBatch` as the record they number,
//! so a recovered sequence is never behind the data.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub(crate) const CF_ALERTS: &str = "alerts";
pub(crate) const CF_ALERT_IDS: &str = "alert_ids";
pub(crate) const CF_USERS: &str = "users";
pub(crate) const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_ALERTS, CF_ALERT_IDS, CF_USERS, CF_META];

/// Database configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 32MB)
    pub block_cache_size: usize,
    /// fsync on every write batch
    pub sync_writes: bool,
    /// Max open files for RocksDB
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("vigil_data"),
            block_cache_size: 32 * 1024 * 1024,
            sync_writes: true,
            max_open_files: 256,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>, sync_writes: bool) -> Self {
        Self {
            path: path.into(),
            sync_writes,
            ..Self::default()
        }
    }

    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// Record store errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(String),
    #[error("record not found: {0}")]
    NotFound(u64),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("missing column family: {0}")]
    MissingColumnFamily(&'static str),
}

impl From<rocksdb::Error> for RepositoryError {
    fn from(e: rocksdb::Error) -> Self {
        RepositoryError::Database(e.to_string())
    }
}

/// Opened database with the vigil column families.
pub struct Database {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl Database {
    /// Open (creating if missing) the database at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, RepositoryError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened record store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, cache: &Cache) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_compression_type(DBCompressionType::Lz4);

        match name {
            CF_ALERTS => {
                // Append-mostly, scanned newest-first
                opts.set_max_write_buffer_number(4);
            }
            CF_META => {
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub(crate) fn db(&self) -> &DBWithThreadMode<SingleThreaded> {
        &self.db
    }

    pub(crate) fn cf(&self, name: &'static str) -> Result<&ColumnFamily, RepositoryError> {
        self.db
            .cf_handle(name)
            .ok_or(RepositoryError::MissingColumnFamily(name))
    }

    /// Apply a batch atomically, honoring `sync_writes`.
    pub(crate) fn write(&self, batch: WriteBatch) -> Result<(), RepositoryError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Read a persisted sequence (next id to hand out). Starts at 1.
    pub(crate) fn load_sequence(&self, key: &str) -> Result<u64, RepositoryError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(cf, key.as_bytes())? {
            Some(bytes) if bytes.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                Ok(u64::from_be_bytes(buf))
            }
            Some(_) => Err(RepositoryError::Deserialization(format!(
                "corrupt sequence {key}"
            ))),
            None => Ok(1),
        }
    }

    /// Stage a sequence update into `batch`.
    pub(crate) fn put_sequence(
        &self,
        batch: &mut WriteBatch,
        key: &str,
        next: u64,
    ) -> Result<(), RepositoryError> {
        let cf = self.cf(CF_META)?;
        batch.put_cf(cf, key.as_bytes(), next.to_be_bytes());
        Ok(())
    }
}

pub(crate) fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>, RepositoryError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| RepositoryError::Serialization(e.to_string()))
}

pub(crate) fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RepositoryError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| RepositoryError::Deserialization(e.to_string()))?;
    Ok(value)
}
