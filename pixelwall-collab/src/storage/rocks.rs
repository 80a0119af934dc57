//! RocksDB-backed canvas store.
//!
//! Column families:
//! - `identities` — Identity records (keyed by the 16 UUID bytes)
//! - `cells`      — Current cell per position (keyed by `Position::to_key`, row-major)
//! - `feed`       — Change records (keyed by sequence, 8 bytes big-endian)
//! - `metadata`   — Grid shape and creation time, checked on open
//!
//! Values are bincode-encoded. A placement touches three column families
//! and is written as one `WriteBatch`, so a crash never leaves a cell
//! without its feed record or its identity's new deadline.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use pixelwall_core::{
    CanvasStore, Cell, ChangeRecord, IdentityRecord, PlacementCommit, StoreError, Timestamp,
    GRID_HEIGHT, GRID_WIDTH, PALETTE_SIZE,
};

/// Column family names.
const CF_IDENTITIES: &str = "identities";
const CF_CELLS: &str = "cells";
const CF_FEED: &str = "feed";
const CF_METADATA: &str = "metadata";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_IDENTITIES, CF_CELLS, CF_FEED, CF_METADATA];

const METADATA_KEY: &[u8] = b"store";
const SCHEMA_VERSION: u32 = 1;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes, shared by all column families (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write batch (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("pixelwall_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
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

/// Written once when the database is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMetadata {
    pub schema_version: u32,
    pub grid_width: u16,
    pub grid_height: u16,
    pub palette_size: u8,
    pub created_at: Timestamp,
}

impl StoreMetadata {
    fn current() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            grid_width: GRID_WIDTH,
            grid_height: GRID_HEIGHT,
            palette_size: PALETTE_SIZE,
            created_at: Timestamp::now(),
        }
    }

    /// Same layout as this build, ignoring creation time.
    fn is_compatible(&self) -> bool {
        let current = Self::current();
        self.schema_version == current.schema_version
            && self.grid_width == current.grid_width
            && self.grid_height == current.grid_height
            && self.palette_size == current.palette_size
    }
}

/// RocksDB-backed [`CanvasStore`].
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode; writes are ordered by the engine)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    metadata: StoreMetadata,
}

impl RocksStore {
    /// Open the store at the configured path.
    ///
    /// Creates the database and column families if they don't exist. An
    /// existing database written for a different grid shape is refused.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(64 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )
        .map_err(db_error)?;

        let metadata = Self::load_or_init_metadata(&db, &config)?;
        log::info!(
            "Opened canvas store at {} ({}x{}, created {})",
            config.path.display(),
            metadata.grid_width,
            metadata.grid_height,
            metadata.created_at
        );

        Ok(Self { db, config, metadata })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_IDENTITIES => {
                // Point lookups by id, rewritten on every placement
                opts.set_max_write_buffer_number(4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_CELLS => {
                // At most GRID_WIDTH * GRID_HEIGHT keys, overwritten in place
                opts.set_max_write_buffer_number(4);
            }
            CF_FEED => {
                // Append-only, trimmed from the front, scanned on recovery
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::None);
            }
            CF_METADATA => {
                opts.set_max_write_buffer_number(2);
            }
            _ => {}
        }

        opts
    }

    fn load_or_init_metadata(
        db: &DBWithThreadMode<SingleThreaded>,
        config: &StoreConfig,
    ) -> Result<StoreMetadata, StoreError> {
        let cf = db
            .cf_handle(CF_METADATA)
            .ok_or_else(|| missing_cf(CF_METADATA))?;

        if let Some(bytes) = db.get_cf(cf, METADATA_KEY).map_err(db_error)? {
            let existing: StoreMetadata = decode(&bytes)?;
            if !existing.is_compatible() {
                return Err(StoreError::Database(format!(
                    "store at {} was created for a {}x{} grid with {} colors (schema {})",
                    config.path.display(),
                    existing.grid_width,
                    existing.grid_height,
                    existing.palette_size,
                    existing.schema_version
                )));
            }
            return Ok(existing);
        }

        let metadata = StoreMetadata::current();
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(config.sync_writes);
        db.put_cf_opt(cf, METADATA_KEY, encode(&metadata)?, &write_opts)
            .map_err(db_error)?;
        Ok(metadata)
    }

    /// Metadata recorded when the database was created.
    pub fn metadata(&self) -> &StoreMetadata {
        &self.metadata
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Number of persisted feed records.
    pub fn feed_len(&self) -> Result<usize, StoreError> {
        let cf = self.cf(CF_FEED)?;
        let mut count = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item.map_err(db_error)?;
            count += 1;
        }
        Ok(count)
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db.cf_handle(name).ok_or_else(|| missing_cf(name))
    }

    /// Decode every value in a column family, in key order.
    fn load_all<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>, StoreError> {
        let cf = self.cf(name)?;
        let mut values = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item.map_err(db_error)?;
            values.push(decode(&value)?);
        }
        Ok(values)
    }
}

impl CanvasStore for RocksStore {
    fn insert_identity(&self, record: &IdentityRecord) -> Result<(), StoreError> {
        let cf = self.cf(CF_IDENTITIES)?;
        self.db
            .put_cf_opt(cf, record.id.as_bytes(), encode(record)?, &self.write_options())
            .map_err(db_error)
    }

    fn commit_placement(&self, commit: &PlacementCommit) -> Result<(), StoreError> {
        let cf_identities = self.cf(CF_IDENTITIES)?;
        let cf_cells = self.cf(CF_CELLS)?;
        let cf_feed = self.cf(CF_FEED)?;

        let cell = commit.cell();
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_identities, commit.identity.id.as_bytes(), encode(&commit.identity)?);
        batch.put_cf(cf_cells, cell.position.to_key(), encode(&cell)?);
        batch.put_cf(cf_feed, commit.record.sequence.to_be_bytes(), encode(&commit.record)?);

        self.db.write_opt(batch, &self.write_options()).map_err(db_error)
    }

    fn trim_feed(&self, up_to: u64) -> Result<u64, StoreError> {
        let cf = self.cf(CF_FEED)?;

        let mut count = 0u64;
        let mut batch = WriteBatch::default();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item.map_err(db_error)?;
            let Some(sequence) = sequence_from_key(&key) else {
                continue;
            };
            if sequence > up_to {
                break;
            }
            batch.delete_cf(cf, &key);
            count += 1;
        }

        if count > 0 {
            self.db.write_opt(batch, &self.write_options()).map_err(db_error)?;
        }
        Ok(count)
    }

    fn load_identities(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        self.load_all(CF_IDENTITIES)
    }

    fn load_cells(&self) -> Result<Vec<Cell>, StoreError> {
        self.load_all(CF_CELLS)
    }

    fn load_feed(&self) -> Result<Vec<ChangeRecord>, StoreError> {
        self.load_all(CF_FEED)
    }

    fn flush(&self) -> Result<(), StoreError> {
        for name in COLUMN_FAMILIES {
            let cf = self.cf(name)?;
            self.db.flush_cf(cf).map_err(db_error)?;
        }
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

fn sequence_from_key(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

fn missing_cf(name: &str) -> StoreError {
    StoreError::Database(format!("column family '{name}' not found"))
}

/// Classify a RocksDB error so the engine knows whether to retry.
fn db_error(e: rocksdb::Error) -> StoreError {
    use rocksdb::ErrorKind;
    match e.kind() {
        ErrorKind::Busy | ErrorKind::TryAgain | ErrorKind::TimedOut | ErrorKind::Incomplete => {
            StoreError::Unavailable(e.to_string())
        }
        ErrorKind::IOError => StoreError::Io(e.to_string()),
        _ => StoreError::Database(e.to_string()),
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixelwall_core::{Color, IdentityId, Position};
    use tempfile::tempdir;

    fn commit(sequence: u64, x: i64, y: i64, color: i64) -> PlacementCommit {
        PlacementCommit {
            identity: IdentityRecord {
                id: IdentityId::generate(),
                next_allowed_at: Some(Timestamp::from_millis(sequence as i64 * 1_000 + 5_000)),
            },
            record: ChangeRecord {
                sequence,
                position: Position::new(x, y).unwrap(),
                color: Color::new(color).unwrap(),
                placed_at: Timestamp::from_millis(sequence as i64 * 1_000),
            },
        }
    }

    #[test]
    fn test_store_open_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
        assert!(store.path().exists());
        assert_eq!(store.metadata().grid_width, GRID_WIDTH);
        assert!(store.load_cells().unwrap().is_empty());
    }

    #[test]
    fn test_metadata_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let created = {
            let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
            store.metadata().clone()
        };
        let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
        assert_eq!(store.metadata(), &created);
    }

    #[test]
    fn test_identity_insert_load() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();

        let record = IdentityRecord {
            id: IdentityId::generate(),
            next_allowed_at: None,
        };
        store.insert_identity(&record).unwrap();
        assert_eq!(store.load_identities().unwrap(), vec![record]);
    }

    #[test]
    fn test_commit_writes_all_column_families() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();

        let c = commit(1, 5, 6, 2);
        store.commit_placement(&c).unwrap();

        assert_eq!(store.load_identities().unwrap(), vec![c.identity]);
        assert_eq!(store.load_cells().unwrap(), vec![c.cell()]);
        assert_eq!(store.load_feed().unwrap(), vec![c.record]);
    }

    #[test]
    fn test_cells_upsert_and_row_major_order() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();

        store.commit_placement(&commit(1, 3, 9, 1)).unwrap();
        store.commit_placement(&commit(2, 700, 2, 1)).unwrap();
        store.commit_placement(&commit(3, 3, 9, 7)).unwrap();

        let cells = store.load_cells().unwrap();
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[0].position, Position::new(700, 2).unwrap());
        assert_eq!(cells[1].position, Position::new(3, 9).unwrap());
        assert_eq!(cells[1].color.value(), 7);
    }

    #[test]
    fn test_feed_order_and_trim() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();

        for seq in 1..=300u64 {
            store.commit_placement(&commit(seq, (seq % 1024) as i64, 0, 1)).unwrap();
        }
        let feed = store.load_feed().unwrap();
        assert_eq!(feed.len(), 300);
        assert!(feed.windows(2).all(|w| w[0].sequence < w[1].sequence));

        assert_eq!(store.trim_feed(256).unwrap(), 256);
        assert_eq!(store.feed_len().unwrap(), 44);
        assert_eq!(store.load_feed().unwrap()[0].sequence, 257);
        assert_eq!(store.trim_feed(256).unwrap(), 0);
    }

    #[test]
    fn test_flush() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        store.commit_placement(&commit(1, 0, 0, 0)).unwrap();
        store.flush().unwrap();
    }

    #[test]
    fn test_sequence_from_key() {
        assert_eq!(sequence_from_key(&42u64.to_be_bytes()), Some(42));
        assert_eq!(sequence_from_key(&[1, 2, 3]), None);
    }

    #[test]
    fn test_config_defaults() {
        let config = StoreConfig::default();
        assert!(config.sync_writes);
        assert_eq!(config.bloom_filter_bits, 10);
        let testing = StoreConfig::for_testing("/tmp/x");
        assert!(!testing.sync_writes);
        assert_eq!(testing.path, PathBuf::from("/tmp/x"));
    }
}
