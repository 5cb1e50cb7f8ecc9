use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

use crate::core::bitmap::BitmapProvider;
use crate::core::cluster::{cluster, NamedFingerprint, NonDuplicateOverride};
use crate::core::{lock, rebase_path};
use crate::database::{open_stores, DatabaseError};
use crate::services::album_cache::{
    AlbumDuplicateCache, AlbumDuplicateResult, DuplicateStatus, SkipReason,
};
use crate::services::hash_cache::{HashCache, HashProgress};
use crate::services::media_source::{FsMediaSource, MediaSource};
use crate::services::registry::{NonDuplicateRegistry, RegistryError};
use crate::settings::{HashConfig, SettingsStore};

/// What the UI shows for the active album.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateIndicators {
    pub available: bool,
    pub loading: bool,
}

/// Wires listing, hashing, overrides and clustering into per-album duplicate requests.
pub struct DuplicatesService {
    settings: SettingsStore,
    media: Arc<dyn MediaSource>,
    hashes: Arc<HashCache>,
    registry: NonDuplicateRegistry,
    albums: AlbumDuplicateCache,
    provider: Option<BitmapProvider>,
    active_album: Mutex<Option<PathBuf>>,
    indicators: watch::Sender<DuplicateIndicators>,
    progress_sender: Option<mpsc::UnboundedSender<HashProgress>>,
}

impl DuplicatesService {
    pub fn new(
        settings: SettingsStore,
        media: Arc<dyn MediaSource>,
        hashes: Arc<HashCache>,
        registry: NonDuplicateRegistry,
    ) -> Self {
        let (indicators, _) = watch::channel(DuplicateIndicators::default());
        Self {
            settings,
            media,
            hashes,
            registry,
            albums: AlbumDuplicateCache::new(),
            provider: None,
            active_album: Mutex::new(None),
            indicators,
            progress_sender: None,
        }
    }

    /// Settings, overrides and the hash cache from `data_dir`, media from the file system.
    pub fn open(data_dir: &Path) -> Result<Self, DatabaseError> {
        let settings = SettingsStore::load(data_dir);
        let (overrides, hash_store) = open_stores(data_dir)?;
        let hashes = Arc::new(HashCache::from_settings(
            Arc::new(hash_store),
            &settings.get(),
        ));
        Ok(Self::new(
            settings,
            Arc::new(FsMediaSource::new()),
            hashes,
            NonDuplicateRegistry::new(Arc::new(overrides)),
        ))
    }

    /// Replaces the file-system thumbnail/original chain.
    pub fn with_bitmap_provider(mut self, provider: BitmapProvider) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_progress_sender(mut self, sender: mpsc::UnboundedSender<HashProgress>) -> Self {
        self.progress_sender = Some(sender);
        self
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn registry(&self) -> &NonDuplicateRegistry {
        &self.registry
    }

    pub fn hash_cache(&self) -> &Arc<HashCache> {
        &self.hashes
    }

    pub fn album_cache(&self) -> &AlbumDuplicateCache {
        &self.albums
    }

    pub fn media_source(&self) -> &Arc<dyn MediaSource> {
        &self.media
    }

    fn provider_for(&self, config: &HashConfig) -> BitmapProvider {
        self.provider
            .clone()
            .unwrap_or_else(|| BitmapProvider::filesystem(&config.thumb_dir))
    }

    pub fn subscribe(&self) -> watch::Receiver<DuplicateIndicators> {
        self.indicators.subscribe()
    }

    pub fn indicators(&self) -> DuplicateIndicators {
        *self.indicators.borrow()
    }

    fn is_active(&self, album: &Path) -> bool {
        lock(&self.active_album).as_deref() == Some(album)
    }

    pub fn active_album(&self) -> Option<PathBuf> {
        lock(&self.active_album).clone()
    }

    /// Switches the album the indicators describe. They reflect its cached result, if any.
    pub fn set_active_album(&self, album: Option<PathBuf>) {
        let available = album
            .as_deref()
            .and_then(|path| self.albums.peek(path))
            .is_some_and(|result| result.has_duplicates());
        *lock(&self.active_album) = album;
        self.indicators.send_replace(DuplicateIndicators {
            available,
            loading: false,
        });
    }

    /// Duplicate groups of `album`, computed at most once per invalidation.
    ///
    /// Results are always cached; the indicators only follow the album that is still active
    /// when the computation completes.
    pub async fn request_duplicates(&self, album: &Path, force: bool) -> DuplicateStatus {
        let config = self.settings.hash_config();
        if self.is_active(album) && !self.albums.batch_active() {
            self.indicators.send_modify(|state| state.loading = true);
        }

        let status = self
            .albums
            .get_or_compute(album, force, &config.settings_key(), || {
                self.compute(album, &config)
            })
            .await;

        if self.is_active(album) {
            self.indicators.send_replace(DuplicateIndicators {
                available: status.has_duplicates(),
                loading: false,
            });
        }
        status
    }

    async fn compute(&self, album: &Path, config: &HashConfig) -> DuplicateStatus {
        let media_source = Arc::clone(&self.media);
        let album_path = album.to_path_buf();
        let listing =
            tokio::task::spawn_blocking(move || media_source.list_media(&album_path)).await;
        let medias = match listing {
            Ok(Ok(medias)) => medias,
            Ok(Err(e)) => {
                log::warn!("Cannot list {}: {}", album.display(), e);
                return DuplicateStatus::not_computed(SkipReason::AlbumUnavailable);
            }
            Err(e) => {
                log::warn!("Listing task for {} failed: {}", album.display(), e);
                return DuplicateStatus::not_computed(SkipReason::AlbumUnavailable);
            }
        };

        self.hashes.forget_failures(album, &medias);

        let cap = config.max_files_per_album;
        if cap > 0 && medias.len() > cap as usize {
            log::info!(
                "Skipping duplicates for {}: {} files exceeds cap of {}",
                album.display(),
                medias.len(),
                cap
            );
            return DuplicateStatus::not_computed(SkipReason::TooManyFiles {
                count: medias.len(),
                cap,
            });
        }

        let provider = self.provider_for(config);
        let fingerprints = self
            .hashes
            .fingerprint_album(&medias, &provider, config, self.progress_sender.clone())
            .await;

        let named: Vec<NamedFingerprint> = medias
            .iter()
            .zip(fingerprints)
            .filter_map(|(media, bits)| bits.map(|bits| NamedFingerprint::new(&media.name, bits)))
            .collect();
        let overrides = self.registry.overrides(album).unwrap_or_else(|e| {
            log::warn!("Ignoring overrides of {}: {}", album.display(), e);
            Vec::new()
        });

        let hashed = named.len();
        let threshold = config.effective_threshold;
        let groups = match tokio::task::spawn_blocking(move || {
            cluster(&named, threshold, &overrides)
        })
        .await
        {
            Ok(groups) => groups,
            Err(e) => {
                log::warn!("Clustering {} failed: {}", album.display(), e);
                return DuplicateStatus::not_computed(SkipReason::AlbumUnavailable);
            }
        };

        log::info!(
            "Found {} duplicate groups in {} ({} of {} files hashed)",
            groups.len(),
            album.display(),
            hashed,
            medias.len()
        );
        DuplicateStatus::Computed(AlbumDuplicateResult::new(
            album.to_path_buf(),
            groups,
            medias.len(),
            config.settings_key(),
        ))
    }

    /// Persists the override, drops the matching group from the cached result and
    /// invalidates the album.
    pub fn mark_non_duplicate(
        &self,
        album: &Path,
        members: &[String],
    ) -> Result<bool, RegistryError> {
        let inserted = self.registry.mark_non_duplicate(album, members)?;
        let set: BTreeSet<String> = members.iter().cloned().collect();
        self.albums.remove_group(album, &set);
        if self.is_active(album) {
            let available = self
                .albums
                .peek(album)
                .is_some_and(|result| result.has_duplicates());
            self.indicators.send_modify(|state| state.available = available);
        }
        Ok(inserted)
    }

    pub fn unmark_non_duplicate(
        &self,
        album: &Path,
        members: &[String],
    ) -> Result<bool, RegistryError> {
        let removed = self.registry.unmark_non_duplicate(album, members)?;
        if removed {
            self.albums.mark_stale(album);
        }
        Ok(removed)
    }

    pub fn overrides(&self, album: &Path) -> Result<Vec<NonDuplicateOverride>, RegistryError> {
        self.registry.overrides(album)
    }

    pub fn begin_batch(&self) {
        self.albums.begin_batch();
    }

    /// Ends one batch level. When the outermost batch ends the active album is refreshed once.
    pub async fn end_batch(&self) -> Option<DuplicateStatus> {
        let invalidated = self.albums.end_batch();
        if !invalidated.is_empty() {
            log::debug!("Batch ended, {} albums invalidated", invalidated.len());
        }
        if self.albums.batch_active() {
            return None;
        }
        let active = self.active_album()?;
        Some(self.request_duplicates(&active, false).await)
    }

    pub fn notify_media_count(&self, album: &Path, count: usize) -> bool {
        self.albums.notify_media_count(album, count)
    }

    /// Moves cached results and overrides of `old` and its descendants under `new`.
    pub fn rename_album(&self, old: &Path, new: &Path) -> Result<(), RegistryError> {
        self.albums.rename_album(old, new);
        self.registry.move_album(old, new)?;
        let mut active = lock(&self.active_album);
        if let Some(moved) = active.as_deref().and_then(|path| rebase_path(path, old, new)) {
            *active = Some(moved);
        }
        Ok(())
    }

    /// Drops cached results and overrides of albums that no longer exist. `valid` lists
    /// every album that does.
    pub fn retain_albums(&self, valid: &[PathBuf]) -> usize {
        let valid: HashSet<PathBuf> = valid.iter().cloned().collect();
        match self.registry.albums() {
            Ok(albums) => {
                for album in albums.iter().filter(|album| !valid.contains(*album)) {
                    if let Err(e) = self.registry.clear_album(album) {
                        log::warn!("Failed to clear overrides of {}: {}", album.display(), e);
                    }
                }
            }
            Err(e) => log::warn!("Failed to list albums with overrides: {}", e),
        }
        self.albums.retain_albums(&valid)
    }

    /// Forgets every override of `album` along with its cached result. Returns the number
    /// of overrides removed.
    pub fn reset_duplicates(&self, album: &Path) -> Result<usize, RegistryError> {
        let cleared = self.registry.clear_album(album)?;
        self.albums.forget_album(album);
        if self.is_active(album) {
            self.indicators.send_replace(DuplicateIndicators::default());
        }
        log::info!(
            "Reset duplicates of {} ({} overrides removed)",
            album.display(),
            cleared
        );
        Ok(cleared)
    }

    pub fn forget_album(&self, album: &Path) -> bool {
        self.albums.forget_album(album)
    }
}
