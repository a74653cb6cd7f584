//! RocksDB-backed device storage.
//!
//! Column families:
//! - `state`    — replicated room list (LZ4 compressed JSON)
//! - `identity` — the device id (LZ4 compressed)
//!
//! Implements [`eatwheel_core::Storage`], so a [`Replica`](eatwheel_core::Replica)
//! and the coordinator can share one handle.

use std::path::{Path, PathBuf};

use eatwheel_core::{Storage, StoreError, PEER_ID_KEY};
use log::{debug, info};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Options, SingleThreaded, WriteOptions,
};

const CF_STATE: &str = "state";
const CF_IDENTITY: &str = "identity";

const COLUMN_FAMILIES: &[&str] = &[CF_STATE, CF_IDENTITY];

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 16MB)
    pub block_cache_size: usize,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("eatwheel_data"),
            block_cache_size: 16 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 256,
        }
    }
}

impl StoreConfig {
    /// Small caches at `path`.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

fn db_err(e: rocksdb::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

pub struct RocksStorage {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStorage {
    /// Open (or create) the database at `config.path`.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)
            .map_err(db_err)?;
        info!("Opened store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        opts.set_block_based_table_factory(&block_opts);
        // Values are already LZ4 framed.
        opts.set_compression_type(DBCompressionType::None);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("missing column family {name}")))
    }

    fn family_for(key: &str) -> &'static str {
        if key == PEER_ID_KEY {
            CF_IDENTITY
        } else {
            CF_STATE
        }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        for name in COLUMN_FAMILIES {
            self.db.flush_cf(self.cf(name)?).map_err(db_err)?;
        }
        Ok(())
    }
}

impl Storage for RocksStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(Self::family_for(key))?;
        match self.db.get_cf(cf, key.as_bytes()).map_err(db_err)? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf(Self::family_for(key))?;
        let compressed = lz4_flex::compress_prepend_size(value);
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .put_cf_opt(cf, key.as_bytes(), &compressed, &write_opts)
            .map_err(db_err)?;
        debug!("Stored {key} ({} -> {} bytes)", value.len(), compressed.len());
        Ok(())
    }
}
