use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::{mpsc, OnceCell, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;

use crate::core::bitmap::BitmapProvider;
use crate::core::fingerprint::{FileIdentity, Fingerprint, IdentityError};
use crate::core::hash::{compute_hash, HashError};
use crate::core::lock;
use crate::core::media::MediaEntry;
use crate::database::hash_store::{store_key, HashCacheEntry, HashStore};
use crate::database::DatabaseError;
use crate::settings::{AdvancedSettings, HashConfig};

#[derive(Debug, Error)]
pub enum HashJobError {
    #[error("No bitmap available for {path}")]
    NoBitmap { path: String },

    #[error("Hash error: {0}")]
    Hash(#[from] HashError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Worker pool closed")]
    PoolClosed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashProgress {
    pub files_processed: usize,
    pub total_files: usize,
    pub current_file: String,
    pub failed: usize,
}

type Slot = Arc<OnceCell<Option<Fingerprint>>>;

struct FailedHash {
    path: PathBuf,
    thumbnail_revision: Option<SystemTime>,
}

/// Persistent fingerprint cache with per-key single-flight and a bounded worker pool.
pub struct HashCache {
    store: Arc<dyn HashStore>,
    workers: Arc<Semaphore>,
    retry_on_thumb_change: bool,
    in_flight: Mutex<HashMap<String, Slot>>,
    failures: Mutex<HashMap<String, FailedHash>>,
}

impl HashCache {
    pub fn new(store: Arc<dyn HashStore>, workers: usize, retry_on_thumb_change: bool) -> Self {
        Self {
            store,
            workers: Arc::new(Semaphore::new(workers.clamp(1, 32))),
            retry_on_thumb_change,
            in_flight: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_settings(store: Arc<dyn HashStore>, settings: &AdvancedSettings) -> Self {
        Self::new(
            store,
            settings.preload.hash_workers.resolved(),
            settings.preload.hash_retry_on_thumb_change,
        )
    }

    pub fn store(&self) -> &Arc<dyn HashStore> {
        &self.store
    }

    async fn acquire_worker(&self) -> Result<OwnedSemaphorePermit, HashJobError> {
        self.workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| HashJobError::PoolClosed)
    }

    /// Resolves the file identity on a pool worker, then defers to [`Self::get_or_compute`].
    pub async fn fingerprint(
        &self,
        media: &MediaEntry,
        provider: &BitmapProvider,
        config: &HashConfig,
    ) -> Option<Fingerprint> {
        let identity = match self.resolve_identity(&media.path, config).await {
            Ok(identity) => identity,
            Err(e) => {
                log::warn!("Skipping {}: {}", media.path.display(), e);
                return None;
            }
        };
        self.get_or_compute(&identity, media, provider, config).await
    }

    async fn resolve_identity(
        &self,
        path: &Path,
        config: &HashConfig,
    ) -> Result<FileIdentity, HashJobError> {
        let _permit = self.acquire_worker().await?;
        let path = path.to_path_buf();
        let mode = config.identity;
        let identity =
            tokio::task::spawn_blocking(move || FileIdentity::resolve(&path, mode)).await??;
        Ok(identity)
    }

    /// Cached fingerprint for `(identity, hash version)`, computing and persisting it on a miss.
    ///
    /// Concurrent callers for the same key share one computation. `None` means no bitmap
    /// could be hashed; the failure is remembered until the thumbnail changes.
    pub async fn get_or_compute(
        &self,
        identity: &FileIdentity,
        media: &MediaEntry,
        provider: &BitmapProvider,
        config: &HashConfig,
    ) -> Option<Fingerprint> {
        let identity_key = identity.key();
        if let Some(bits) = self.lookup(&identity_key, config) {
            return Some(bits);
        }

        let key = store_key(&identity_key, &config.hash_version);
        if self.suppressed_by_failure(&key, media, provider) {
            return None;
        }

        let slot = lock(&self.in_flight)
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let result = slot
            .get_or_init(|| self.compute(identity, &identity_key, &key, media, provider, config))
            .await
            .clone();

        let mut in_flight = lock(&self.in_flight);
        if in_flight.get(&key).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
            in_flight.remove(&key);
        }
        result
    }

    fn lookup(&self, identity_key: &str, config: &HashConfig) -> Option<Fingerprint> {
        match self.store.get(identity_key, &config.hash_version) {
            Ok(Some(entry)) if entry.bits.bit_len() == config.bits => Some(entry.bits),
            Ok(_) => None,
            Err(e) => {
                log::warn!("Hash cache read failed for {}: {}", identity_key, e);
                None
            }
        }
    }

    fn suppressed_by_failure(
        &self,
        key: &str,
        media: &MediaEntry,
        provider: &BitmapProvider,
    ) -> bool {
        let mut failures = lock(&self.failures);
        let Some(failed) = failures.get(key) else {
            return false;
        };
        if !self.retry_on_thumb_change {
            return true;
        }
        if provider.thumbnail_revision(media) == failed.thumbnail_revision {
            return true;
        }
        log::debug!("Thumbnail changed, retrying {}", media.path.display());
        failures.remove(key);
        false
    }

    async fn compute(
        &self,
        identity: &FileIdentity,
        identity_key: &str,
        key: &str,
        media: &MediaEntry,
        provider: &BitmapProvider,
        config: &HashConfig,
    ) -> Option<Fingerprint> {
        // A caller that just finished may have persisted the entry after our first lookup.
        if let Some(bits) = self.lookup(identity_key, config) {
            return Some(bits);
        }
        match self.hash_on_worker(media, provider, config).await {
            Ok(bits) => {
                log::debug!("Hashed {}", media.path.display());
                let entry = HashCacheEntry {
                    identity: identity_key.to_string(),
                    path: identity.path.clone(),
                    hash_version: config.hash_version.clone(),
                    bits: bits.clone(),
                    computed_at: Utc::now(),
                };
                if let Err(e) = self.store.put(&entry) {
                    log::warn!("Hash cache write failed for {}: {}", media.path.display(), e);
                }
                Some(bits)
            }
            Err(e) => {
                log::warn!("Failed to hash {}: {}", media.path.display(), e);
                let failed = FailedHash {
                    path: media.path.clone(),
                    thumbnail_revision: provider.thumbnail_revision(media),
                };
                let mut failures = lock(&self.failures);
                failures.retain(|_, other| other.path != failed.path);
                failures.insert(key.to_string(), failed);
                None
            }
        }
    }

    async fn hash_on_worker(
        &self,
        media: &MediaEntry,
        provider: &BitmapProvider,
        config: &HashConfig,
    ) -> Result<Fingerprint, HashJobError> {
        let _permit = self.acquire_worker().await?;

        let media = media.clone();
        let provider = provider.clone();
        let config = config.clone();
        tokio::task::spawn_blocking(move || -> Result<Fingerprint, HashJobError> {
            let (bitmap, _) = provider
                .load(&media, config.use_thumbnails_first)
                .ok_or_else(|| HashJobError::NoBitmap {
                    path: media.path.display().to_string(),
                })?;
            Ok(compute_hash(&bitmap, &config)?)
        })
        .await?
    }

    /// Fingerprints of `medias` in input order, computed concurrently.
    pub async fn fingerprint_album(
        self: &Arc<Self>,
        medias: &[MediaEntry],
        provider: &BitmapProvider,
        config: &HashConfig,
        progress: Option<mpsc::UnboundedSender<HashProgress>>,
    ) -> Vec<Option<Fingerprint>> {
        let total_files = medias.len();
        let mut results: Vec<Option<Fingerprint>> = vec![None; total_files];
        let mut tasks = JoinSet::new();

        for (index, media) in medias.iter().cloned().enumerate() {
            let cache = Arc::clone(self);
            let provider = provider.clone();
            let config = config.clone();
            tasks.spawn(async move {
                let bits = cache.fingerprint(&media, &provider, &config).await;
                (index, media.name, bits)
            });
        }

        let mut files_processed = 0;
        let mut failed = 0;
        while let Some(joined) = tasks.join_next().await {
            let (index, name, bits) = match joined {
                Ok(done) => done,
                Err(e) => {
                    log::warn!("Hash task failed: {}", e);
                    continue;
                }
            };
            files_processed += 1;
            if bits.is_none() {
                failed += 1;
            }
            results[index] = bits;
            if let Some(sender) = &progress {
                let _ = sender.send(HashProgress {
                    files_processed,
                    total_files,
                    current_file: name,
                    failed,
                });
            }
        }
        results
    }

    /// Drops entries of other hash versions, and entries under `scope` whose identity is not
    /// in `live_keys`. Without a scope every entry must be live to survive.
    pub fn prune(
        &self,
        scope: Option<&Path>,
        live_keys: &HashSet<String>,
        hash_version: &str,
    ) -> Result<usize, DatabaseError> {
        let removed = self.store.retain(&|entry| {
            let in_scope = scope.map_or(true, |root| entry.path.starts_with(root));
            entry.hash_version == hash_version && (!in_scope || live_keys.contains(&entry.identity))
        })?;
        lock(&self.failures).clear();
        if removed > 0 {
            log::info!("Pruned {} hash cache entries", removed);
        }
        Ok(removed)
    }

    /// Forgets failures of files in `album` that are no longer among `listed`.
    pub fn forget_failures(&self, album: &Path, listed: &[MediaEntry]) -> usize {
        let live: HashSet<&Path> = listed.iter().map(|media| media.path.as_path()).collect();
        let mut failures = lock(&self.failures);
        let before = failures.len();
        failures.retain(|_, failed| {
            failed.path.parent() != Some(album) || live.contains(failed.path.as_path())
        });
        before - failures.len()
    }

    pub fn len(&self) -> Result<usize, DatabaseError> {
        self.store.len()
    }

    pub fn is_empty(&self) -> Result<bool, DatabaseError> {
        self.store.is_empty()
    }

    pub fn failure_count(&self) -> usize {
        lock(&self.failures).len()
    }
}
