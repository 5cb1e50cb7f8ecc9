pub mod hash_store;
pub mod override_store;

use std::path::{Path, PathBuf};
use thiserror::Error;

pub use hash_store::{HashCacheEntry, HashStore, MemoryHashStore, SledHashStore};
pub use override_store::{MemoryOverrideStore, OverrideStore, SqliteOverrideStore};

pub const DATABASE_FILE: &str = "galleryhash.db";
pub const HASH_CACHE_DIR: &str = "hash-cache";

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Cache store error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Locations of the two persistent stores inside a data directory.
#[derive(Debug, Clone)]
pub struct DatabasePaths {
    pub overrides: PathBuf,
    pub hash_cache: PathBuf,
}

impl DatabasePaths {
    pub fn in_dir(data_dir: &Path) -> Self {
        Self {
            overrides: data_dir.join(DATABASE_FILE),
            hash_cache: data_dir.join(HASH_CACHE_DIR),
        }
    }
}

/// Opens the SQLite override store and the sled hash store under `data_dir`.
pub fn open_stores(
    data_dir: &Path,
) -> Result<(SqliteOverrideStore, SledHashStore), DatabaseError> {
    std::fs::create_dir_all(data_dir)?;
    let paths = DatabasePaths::in_dir(data_dir);
    let overrides = SqliteOverrideStore::open(&paths.overrides)?;
    let hashes = SledHashStore::open(&paths.hash_cache)?;
    log::debug!(
        "Opened stores: overrides={}, hash cache={}",
        paths.overrides.display(),
        paths.hash_cache.display()
    );
    Ok((overrides, hashes))
}
