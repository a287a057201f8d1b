//! RocksDB-backed local store.
//!
//! Column families:
//! - `actions`   — pending offline actions (raw JSON, no compression)
//! - `snapshots` — cached board/user snapshots (LZ4 compressed)
//!
//! Every write is a single `put_cf`; the queue and the cache are each one
//! record, so a write either lands whole or not at all.

use rocksdb::{
    ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, Options, SingleThreaded,
    WriteOptions,
};
use std::path::PathBuf;

use super::{LocalStore, Namespace, StorageError};

const CF_ACTIONS: &str = "actions";
const CF_SNAPSHOTS: &str = "snapshots";

const COLUMN_FAMILIES: &[&str] = &[CF_ACTIONS, CF_SNAPSHOTS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// fsync every write. Pending actions are small and rare, so this is on
    /// by default.
    pub sync_writes: bool,
    /// Max open files for RocksDB
    pub max_open_files: i32,
    /// Write buffer size per column family
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("taskboard_offline"),
            sync_writes: true,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Config for testing (no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync_writes: false,
            max_open_files: 16,
            write_buffer_size: 1024 * 1024, // 1MB
        }
    }
}

/// RocksDB local store.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StorageError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(2);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened offline store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        // Snapshot values are compressed before they reach RocksDB.
        opts.set_compression_type(DBCompressionType::None);
        if name == CF_SNAPSHOTS {
            opts.optimize_for_point_lookup(8);
        }
        opts
    }

    fn cf(&self, ns: Namespace) -> Result<&rocksdb::ColumnFamily, StorageError> {
        let name = match ns {
            Namespace::Actions => CF_ACTIONS,
            Namespace::Snapshots => CF_SNAPSHOTS,
        };
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::Database(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    pub fn path(&self) -> &std::path::Path {
        &self.config.path
    }
}

impl LocalStore for RocksStore {
    fn load(&self, ns: Namespace, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let cf = self.cf(ns)?;
        let Some(raw) = self.db.get_cf(cf, key.as_bytes())? else {
            return Ok(None);
        };
        match ns {
            Namespace::Actions => Ok(Some(raw)),
            Namespace::Snapshots => lz4_flex::decompress_size_prepended(&raw)
                .map(Some)
                .map_err(|e| StorageError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    fn save(&self, ns: Namespace, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let cf = self.cf(ns)?;
        let opts = self.write_options();
        match ns {
            Namespace::Actions => self.db.put_cf_opt(cf, key.as_bytes(), value, &opts)?,
            Namespace::Snapshots => {
                let compressed = lz4_flex::compress_prepend_size(value);
                self.db.put_cf_opt(cf, key.as_bytes(), compressed, &opts)?
            }
        }
        Ok(())
    }

    fn remove(&self, ns: Namespace, key: &str) -> Result<(), StorageError> {
        let cf = self.cf(ns)?;
        self.db.delete_cf_opt(cf, key.as_bytes(), &self.write_options())?;
        Ok(())
    }
}
