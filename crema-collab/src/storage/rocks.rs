//! RocksDB-backed domain log.
//!
//! Column families:
//! - `domains`: domain headers (info + initial content), LZ4 compressed
//! - `actions`: posted actions, keyed by `domain_id:post_id`
//! - `completed`: markers for actions that finished applying
//!
//! Only actions present in both `actions` and `completed` are replayed on
//! restart; a crash between posting and completing loses that one action.
//!

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Column family names.
const CF_DOMAINS: &str = "domains";
const CF_ACTIONS: &str = "actions";
const CF_COMPLETED: &str = "completed";

const COLUMN_FAMILIES: &[&str] = &[CF_DOMAINS, CF_ACTIONS, CF_COMPLETED];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("crema_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, caller-provided directory).
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

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Domain not found
    NotFound(Uuid),
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
            StoreError::NotFound(id) => write!(f, "Domain not found in store: {id}"),
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

/// RocksDB-backed store for domain headers and their action logs.
pub struct DomainStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl DomainStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
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
        )?;

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
            CF_DOMAINS => {
                // Values are already LZ4 compressed
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_ACTIONS | CF_COMPLETED => {
                // Prefix-scanned by domain id
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => {}
        }

        opts
    }

    // ─── Domain headers ───────────────────────────────────────────────

    /// Save (or replace) a domain header.
    pub fn save_domain(&self, domain_id: Uuid, header: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf(CF_DOMAINS)?;
        let compressed = lz4_flex::compress_prepend_size(header);
        self.db.put_cf_opt(&cf, domain_id.as_bytes(), &compressed, &self.write_options())?;
        Ok(())
    }

    pub fn load_domain(&self, domain_id: Uuid) -> Result<Vec<u8>, StoreError> {
        let cf = self.cf(CF_DOMAINS)?;
        match self.db.get_cf(&cf, domain_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map_err(|e| StoreError::CompressionError(e.to_string())),
            None => Err(StoreError::NotFound(domain_id)),
        }
    }

    pub fn domain_exists(&self, domain_id: Uuid) -> Result<bool, StoreError> {
        let cf = self.cf(CF_DOMAINS)?;
        Ok(self.db.get_cf(&cf, domain_id.as_bytes())?.is_some())
    }

    /// List every stored domain id.
    pub fn list_domains(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_DOMAINS)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            ids.push(Self::uuid_from(&key)?);
        }
        Ok(ids)
    }

    // ─── Actions ──────────────────────────────────────────────────────

    /// Record an action that is about to be applied.
    pub fn post_action(&self, domain_id: Uuid, post_id: u64, action: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf(CF_ACTIONS)?;
        let compressed = lz4_flex::compress_prepend_size(action);
        self.db.put_cf_opt(
            &cf,
            Self::action_key(domain_id, post_id),
            &compressed,
            &self.write_options(),
        )?;
        Ok(())
    }

    /// Mark a posted action as applied.
    pub fn complete_action(&self, domain_id: Uuid, post_id: u64) -> Result<(), StoreError> {
        let cf = self.cf(CF_COMPLETED)?;
        self.db.put_cf_opt(
            &cf,
            Self::action_key(domain_id, post_id),
            b"",
            &self.write_options(),
        )?;
        Ok(())
    }

    /// Load every completed action of a domain in post order.
    pub fn load_completed_actions(&self, domain_id: Uuid) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let cf_actions = self.cf(CF_ACTIONS)?;
        let cf_completed = self.cf(CF_COMPLETED)?;

        let mut actions = Vec::new();
        for item in self.scan(cf_completed, domain_id) {
            let (key, _) = item?;
            if !Self::belongs_to(&key, domain_id) {
                break;
            }
            let post_id = Self::post_id_from(&key);
            let Some(compressed) = self.db.get_cf(&cf_actions, &key)? else {
                log::warn!("Completed action {} of domain {} was never posted", post_id, domain_id);
                continue;
            };
            let action = lz4_flex::decompress_size_prepended(&compressed)
                .map_err(|e| StoreError::CompressionError(e.to_string()))?;
            actions.push((post_id, action));
        }
        Ok(actions)
    }

    /// Highest post id recorded for a domain, completed or not.
    pub fn last_post_id(&self, domain_id: Uuid) -> Result<Option<u64>, StoreError> {
        let cf = self.cf(CF_ACTIONS)?;
        let mut last = None;
        for item in self.scan(cf, domain_id) {
            let (key, _) = item?;
            if !Self::belongs_to(&key, domain_id) {
                break;
            }
            last = Some(Self::post_id_from(&key));
        }
        Ok(last)
    }

    /// Delete a domain header and its whole action log.
    pub fn delete_domain(&self, domain_id: Uuid) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_DOMAINS)?, domain_id.as_bytes());
        for name in [CF_ACTIONS, CF_COMPLETED] {
            let cf = self.cf(name)?;
            for item in self.scan(cf, domain_id) {
                let (key, _) = item?;
                if !Self::belongs_to(&key, domain_id) {
                    break;
                }
                batch.delete_cf(cf, &key);
            }
        }
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
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
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn scan<'a>(
        &'a self,
        cf: &'a rocksdb::ColumnFamily,
        domain_id: Uuid,
    ) -> rocksdb::DBIteratorWithThreadMode<'a, DBWithThreadMode<SingleThreaded>> {
        let start = Self::action_key(domain_id, 0);
        self.db.iterator_cf(
            cf,
            IteratorMode::From(&start, rocksdb::Direction::Forward),
        )
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    /// Build an action key: domain_id (16 bytes) + post_id (8 bytes big-endian).
    fn action_key(domain_id: Uuid, post_id: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(domain_id.as_bytes());
        key.extend_from_slice(&post_id.to_be_bytes());
        key
    }

    fn belongs_to(key: &[u8], domain_id: Uuid) -> bool {
        key.len() == 24 && &key[..16] == domain_id.as_bytes()
    }

    fn post_id_from(key: &[u8]) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&key[16..24]);
        u64::from_be_bytes(buf)
    }

    fn uuid_from(key: &[u8]) -> Result<Uuid, StoreError> {
        Uuid::from_slice(key).map_err(|_| StoreError::DeserializationError("Invalid UUID key".into()))
    }
}
