use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::Db;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::DatabaseError;
use crate::core::fingerprint::Fingerprint;
use crate::core::lock;

/// Persisted fingerprint of one file for one hash version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashCacheEntry {
    /// `FileIdentity::key()` of the hashed file.
    pub identity: String,
    pub path: PathBuf,
    pub hash_version: String,
    pub bits: Fingerprint,
    pub computed_at: DateTime<Utc>,
}

impl HashCacheEntry {
    pub fn store_key(&self) -> String {
        store_key(&self.identity, &self.hash_version)
    }
}

pub fn store_key(identity: &str, hash_version: &str) -> String {
    format!("{}|{}", identity, hash_version)
}

/// Persistent `(identity, hash version) -> fingerprint` map.
pub trait HashStore: Send + Sync {
    fn get(
        &self,
        identity: &str,
        hash_version: &str,
    ) -> Result<Option<HashCacheEntry>, DatabaseError>;

    /// Inserts or replaces the entry under its key.
    fn put(&self, entry: &HashCacheEntry) -> Result<(), DatabaseError>;

    /// Removes every entry `keep` rejects, returning how many were removed.
    fn retain(&self, keep: &dyn Fn(&HashCacheEntry) -> bool) -> Result<usize, DatabaseError>;

    fn len(&self) -> Result<usize, DatabaseError>;

    fn is_empty(&self) -> Result<bool, DatabaseError> {
        Ok(self.len()? == 0)
    }

    fn flush(&self) -> Result<(), DatabaseError> {
        Ok(())
    }
}

pub struct SledHashStore {
    db: Db,
}

impl SledHashStore {
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    /// Store backed by a sled database that is deleted on drop.
    pub fn temporary() -> Result<Self, DatabaseError> {
        Ok(Self {
            db: sled::Config::new().temporary(true).open()?,
        })
    }

    fn decode(key: &[u8], value: &[u8]) -> Option<HashCacheEntry> {
        match serde_json::from_slice::<HashCacheEntry>(value) {
            Ok(entry) => Some(entry),
            Err(e) => {
                log::warn!(
                    "Dropping unreadable hash cache entry {}: {}",
                    String::from_utf8_lossy(key),
                    e
                );
                None
            }
        }
    }
}

impl HashStore for SledHashStore {
    fn get(
        &self,
        identity: &str,
        hash_version: &str,
    ) -> Result<Option<HashCacheEntry>, DatabaseError> {
        let key = store_key(identity, hash_version);
        Ok(self
            .db
            .get(key.as_bytes())?
            .and_then(|value| Self::decode(key.as_bytes(), &value)))
    }

    fn put(&self, entry: &HashCacheEntry) -> Result<(), DatabaseError> {
        let value = serde_json::to_vec(entry)?;
        self.db.insert(entry.store_key().as_bytes(), value)?;
        Ok(())
    }

    fn retain(&self, keep: &dyn Fn(&HashCacheEntry) -> bool) -> Result<usize, DatabaseError> {
        let mut doomed = Vec::new();
        for item in self.db.iter() {
            let (key, value) = item?;
            let keep_it = Self::decode(&key, &value).is_some_and(|entry| keep(&entry));
            if !keep_it {
                doomed.push(key);
            }
        }
        for key in &doomed {
            self.db.remove(key)?;
        }
        Ok(doomed.len())
    }

    fn len(&self) -> Result<usize, DatabaseError> {
        Ok(self.db.len())
    }

    fn flush(&self) -> Result<(), DatabaseError> {
        self.db.flush()?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryHashStore {
    entries: Mutex<HashMap<String, HashCacheEntry>>,
}

impl MemoryHashStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HashStore for MemoryHashStore {
    fn get(
        &self,
        identity: &str,
        hash_version: &str,
    ) -> Result<Option<HashCacheEntry>, DatabaseError> {
        Ok(lock(&self.entries)
            .get(&store_key(identity, hash_version))
            .cloned())
    }

    fn put(&self, entry: &HashCacheEntry) -> Result<(), DatabaseError> {
        lock(&self.entries).insert(entry.store_key(), entry.clone());
        Ok(())
    }

    fn retain(&self, keep: &dyn Fn(&HashCacheEntry) -> bool) -> Result<usize, DatabaseError> {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|_, entry| keep(entry));
        Ok(before - entries.len())
    }

    fn len(&self) -> Result<usize, DatabaseError> {
        Ok(lock(&self.entries).len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(identity: &str, version: &str, byte: u8) -> HashCacheEntry {
        HashCacheEntry {
            identity: identity.to_string(),
            path: PathBuf::from(format!("/album/{}.jpg", identity)),
            hash_version: version.to_string(),
            bits: Fingerprint::from_bytes(64, vec![byte; 8]).unwrap(),
            computed_at: Utc::now(),
        }
    }

    fn exercise(store: &dyn HashStore) {
        assert!(store.is_empty().unwrap());
        store.put(&entry("a", "v1", 1)).unwrap();
        store.put(&entry("b", "v1", 2)).unwrap();
        store.put(&entry("a", "v2", 3)).unwrap();
        assert_eq!(store.len().unwrap(), 3);

        let hit = store.get("a", "v1").unwrap().unwrap();
        assert_eq!(hit.bits.as_bytes(), &[1u8; 8]);
        assert_eq!(store.get("a", "v2").unwrap().unwrap().bits.as_bytes(), &[3u8; 8]);
        assert!(store.get("c", "v1").unwrap().is_none());

        // Upsert replaces in place.
        store.put(&entry("a", "v1", 9)).unwrap();
        assert_eq!(store.len().unwrap(), 3);
        assert_eq!(store.get("a", "v1").unwrap().unwrap().bits.as_bytes(), &[9u8; 8]);

        let removed = store.retain(&|e| e.hash_version == "v2").unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.len().unwrap(), 1);
        assert!(store.get("a", "v1").unwrap().is_none());
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryHashStore::new());
    }

    #[test]
    fn test_sled_store() {
        exercise(&SledHashStore::temporary().unwrap());
    }

    #[test]
    fn test_sled_store_persists_across_reopen() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("cache");
        {
            let store = SledHashStore::open(&path).unwrap();
            store.put(&entry("a", "v1", 7)).unwrap();
            store.flush().unwrap();
        }
        let store = SledHashStore::open(&path).unwrap();
        assert_eq!(store.get("a", "v1").unwrap().unwrap().bits.as_bytes(), &[7u8; 8]);
    }

    #[test]
    fn test_unreadable_entries_read_as_absent_and_are_pruned() {
        let store = SledHashStore::temporary().unwrap();
        store.db.insert(store_key("x", "v1").as_bytes(), &b"garbage"[..]).unwrap();
        assert!(store.get("x", "v1").unwrap().is_none());
        assert_eq!(store.retain(&|_| true).unwrap(), 1);
        assert_eq!(store.len().unwrap(), 0);
    }
}
