use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

use crate::core::cluster::DuplicateGroup;
use crate::core::{lock, rebase_path};

/// Clustering output for one album at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlbumDuplicateResult {
    pub album_path: PathBuf,
    pub groups: Vec<DuplicateGroup>,
    pub computed_at_media_count: usize,
    /// `HashConfig::settings_key()` the groups were computed under.
    pub settings_key: String,
    pub computed_at: DateTime<Utc>,
}

impl AlbumDuplicateResult {
    pub fn new(
        album_path: PathBuf,
        groups: Vec<DuplicateGroup>,
        media_count: usize,
        settings_key: String,
    ) -> Self {
        Self {
            album_path,
            groups,
            computed_at_media_count: media_count,
            settings_key,
            computed_at: Utc::now(),
        }
    }

    pub fn has_duplicates(&self) -> bool {
        !self.groups.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SkipReason {
    TooManyFiles { count: usize, cap: u32 },
    AlbumUnavailable,
    BatchInProgress,
}

/// Outcome of a duplicate request. `Computed` with no groups means the album has no duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum DuplicateStatus {
    NotComputed { reason: SkipReason },
    Computed(AlbumDuplicateResult),
}

impl DuplicateStatus {
    pub fn not_computed(reason: SkipReason) -> Self {
        DuplicateStatus::NotComputed { reason }
    }

    pub fn result(&self) -> Option<&AlbumDuplicateResult> {
        match self {
            DuplicateStatus::Computed(result) => Some(result),
            DuplicateStatus::NotComputed { .. } => None,
        }
    }

    pub fn groups(&self) -> &[DuplicateGroup] {
        self.result().map_or(&[], |r| r.groups.as_slice())
    }

    pub fn is_computed(&self) -> bool {
        self.result().is_some()
    }

    pub fn has_duplicates(&self) -> bool {
        !self.groups().is_empty()
    }
}

struct CachedAlbum {
    result: AlbumDuplicateResult,
    stale: bool,
}

#[derive(Default)]
struct Inner {
    albums: HashMap<PathBuf, CachedAlbum>,
    // Bumped on every invalidation; a computation that started under an older
    // epoch stores its result as already stale.
    epochs: HashMap<PathBuf, u64>,
    batch_depth: usize,
    pending_counts: HashMap<PathBuf, usize>,
    // Albums renamed away while being computed, with the epoch of the rename.
    renamed: HashMap<PathBuf, u64>,
}

impl Inner {
    fn epoch(&self, path: &Path) -> u64 {
        self.epochs.get(path).copied().unwrap_or(0)
    }

    fn invalidate(&mut self, path: &Path) {
        *self.epochs.entry(path.to_path_buf()).or_insert(0) += 1;
        if let Some(cached) = self.albums.get_mut(path) {
            cached.stale = true;
        }
    }

    /// `computing` tells whether a computation for `path` is running. Without a cached
    /// result its listing may predate the new count, so it is invalidated too.
    fn apply_media_count(&mut self, path: &Path, count: usize, computing: bool) -> bool {
        let grew = match self.albums.get(path) {
            Some(cached) => count > cached.result.computed_at_media_count,
            None => computing,
        };
        if grew {
            self.invalidate(path);
        }
        grew
    }
}

type Slot = Arc<OnceCell<DuplicateStatus>>;

/// Session cache of per-album duplicate results with single-flight computation.
#[derive(Default)]
pub struct AlbumDuplicateCache {
    inner: Mutex<Inner>,
    in_flight: Mutex<HashMap<PathBuf, Slot>>,
}

impl AlbumDuplicateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached result for `path`, or the result of `compute`.
    ///
    /// A fresh result is reused unless `force` is set, the album was invalidated, or it was
    /// computed under another `settings_key`. Concurrent requests for one album share a single
    /// `compute`. While a batch is active nothing is computed.
    pub async fn get_or_compute<F, Fut>(
        &self,
        path: &Path,
        force: bool,
        settings_key: &str,
        compute: F,
    ) -> DuplicateStatus
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DuplicateStatus>,
    {
        let started_epoch = {
            let inner = lock(&self.inner);
            let cached = inner.albums.get(path);
            if inner.batch_depth > 0 {
                return cached.map_or(
                    DuplicateStatus::not_computed(SkipReason::BatchInProgress),
                    |c| DuplicateStatus::Computed(c.result.clone()),
                );
            }
            if let Some(cached) = cached {
                if !force && !cached.stale && cached.result.settings_key == settings_key {
                    return DuplicateStatus::Computed(cached.result.clone());
                }
            }
            inner.epoch(path)
        };

        let slot = lock(&self.in_flight)
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let status = slot
            .get_or_init(|| async {
                let status = compute().await;
                self.store(path, &status, started_epoch);
                status
            })
            .await
            .clone();

        let mut in_flight = lock(&self.in_flight);
        if in_flight
            .get(path)
            .is_some_and(|current| Arc::ptr_eq(current, &slot))
        {
            in_flight.remove(path);
        }
        status
    }

    fn store(&self, path: &Path, status: &DuplicateStatus, started_epoch: u64) {
        let mut inner = lock(&self.inner);
        if let Some(renamed_at) = inner.renamed.remove(path) {
            if started_epoch < renamed_at {
                log::debug!("Dropping result for renamed album {}", path.display());
                return;
            }
        }
        match status {
            DuplicateStatus::Computed(result) => {
                let stale = inner.epoch(path) != started_epoch;
                inner.albums.insert(
                    path.to_path_buf(),
                    CachedAlbum {
                        result: result.clone(),
                        stale,
                    },
                );
            }
            DuplicateStatus::NotComputed { reason } => {
                if !matches!(reason, SkipReason::BatchInProgress) {
                    inner.albums.remove(path);
                }
            }
        }
    }

    pub fn peek(&self, path: &Path) -> Option<AlbumDuplicateResult> {
        lock(&self.inner)
            .albums
            .get(path)
            .map(|cached| cached.result.clone())
    }

    pub fn is_stale(&self, path: &Path) -> bool {
        lock(&self.inner)
            .albums
            .get(path)
            .is_some_and(|cached| cached.stale)
    }

    pub fn is_computing(&self, path: &Path) -> bool {
        lock(&self.in_flight).contains_key(path)
    }

    /// The next access recomputes.
    pub fn mark_stale(&self, path: &Path) {
        lock(&self.inner).invalidate(path);
    }

    /// Records the album's current file count. A count above the one the result was computed
    /// at marks it stale, or is deferred to [`Self::end_batch`] while a batch is active.
    /// Returns whether the album was marked stale now.
    pub fn notify_media_count(&self, path: &Path, count: usize) -> bool {
        let mut inner = lock(&self.inner);
        if inner.batch_depth > 0 {
            inner.pending_counts.insert(path.to_path_buf(), count);
            return false;
        }
        let computing = lock(&self.in_flight).contains_key(path);
        inner.apply_media_count(path, count, computing)
    }

    /// Drops groups made entirely of `members` from the cached result and marks the album stale.
    pub fn remove_group(&self, path: &Path, members: &BTreeSet<String>) -> bool {
        let mut inner = lock(&self.inner);
        let removed = match inner.albums.get_mut(path) {
            Some(cached) => {
                let before = cached.result.groups.len();
                cached
                    .result
                    .groups
                    .retain(|group| !group.members.iter().all(|m| members.contains(m)));
                cached.result.groups.len() < before
            }
            None => false,
        };
        inner.invalidate(path);
        removed
    }

    pub fn begin_batch(&self) {
        lock(&self.inner).batch_depth += 1;
    }

    /// Closes one batch level. When the outermost batch ends, deferred media counts are
    /// applied and the albums they invalidated are returned.
    pub fn end_batch(&self) -> Vec<PathBuf> {
        let mut inner = lock(&self.inner);
        inner.batch_depth = inner.batch_depth.saturating_sub(1);
        if inner.batch_depth > 0 {
            return Vec::new();
        }
        let pending: Vec<(PathBuf, usize)> = inner.pending_counts.drain().collect();
        let computing = self.computing_paths();
        let mut invalidated: Vec<PathBuf> = pending
            .into_iter()
            .filter(|(path, count)| {
                inner.apply_media_count(path, *count, computing.contains(path))
            })
            .map(|(path, _)| path)
            .collect();
        invalidated.sort();
        invalidated
    }

    pub fn batch_active(&self) -> bool {
        lock(&self.inner).batch_depth > 0
    }

    fn computing_paths(&self) -> HashSet<PathBuf> {
        lock(&self.in_flight).keys().cloned().collect()
    }

    /// Re-keys results of `old` and every album below it under `new`. Computations still
    /// running for the old paths finish without storing anything.
    pub fn rename_album(&self, old: &Path, new: &Path) -> usize {
        let mut inner = lock(&self.inner);
        for path in self.computing_paths() {
            if rebase_path(&path, old, new).is_some() {
                inner.invalidate(&path);
                let renamed_at = inner.epoch(&path);
                inner.renamed.insert(path, renamed_at);
            }
        }
        let mut moves: Vec<(PathBuf, PathBuf)> = inner
            .albums
            .keys()
            .filter_map(|path| rebase_path(path, old, new).map(|target| (path.clone(), target)))
            .collect();
        moves.sort_by_key(|(from, _)| Reverse(from.components().count()));
        for (from, to) in &moves {
            if let Some(mut cached) = inner.albums.remove(from) {
                cached.result.album_path = to.clone();
                inner.albums.insert(to.clone(), cached);
            }
            if let Some(count) = inner.pending_counts.remove(from) {
                inner.pending_counts.insert(to.clone(), count);
            }
            inner.invalidate(from);
        }
        moves.len()
    }

    /// Drops results for albums not in `valid`. Returns how many were dropped.
    pub fn retain_albums(&self, valid: &HashSet<PathBuf>) -> usize {
        let mut inner = lock(&self.inner);
        let before = inner.albums.len();
        inner.albums.retain(|path, _| valid.contains(path));
        inner.pending_counts.retain(|path, _| valid.contains(path));
        let computing = self.computing_paths();
        inner
            .epochs
            .retain(|path, _| valid.contains(path) || computing.contains(path));
        inner.renamed.retain(|path, _| computing.contains(path));
        before - inner.albums.len()
    }

    pub fn forget_album(&self, path: &Path) -> bool {
        let mut inner = lock(&self.inner);
        inner.pending_counts.remove(path);
        let removed = inner.albums.remove(path).is_some();
        if lock(&self.in_flight).contains_key(path) {
            inner.invalidate(path);
        } else {
            inner.epochs.remove(path);
        }
        removed
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).albums.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn group(members: &[&str]) -> DuplicateGroup {
        DuplicateGroup {
            members: members.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn computed(path: &Path, groups: Vec<DuplicateGroup>, count: usize) -> DuplicateStatus {
        DuplicateStatus::Computed(AlbumDuplicateResult::new(
            path.to_path_buf(),
            groups,
            count,
            "k1".to_string(),
        ))
    }

    async fn request(
        cache: &AlbumDuplicateCache,
        path: &Path,
        force: bool,
        calls: &AtomicUsize,
    ) -> DuplicateStatus {
        cache
            .get_or_compute(path, force, "k1", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                computed(path, vec![group(&["a", "b"])], 3)
            })
            .await
    }

    #[tokio::test]
    async fn test_result_is_cached_until_forced() {
        let cache = AlbumDuplicateCache::new();
        let calls = AtomicUsize::new(0);
        let path = Path::new("/album");

        let first = request(&cache, path, false, &calls).await;
        let second = request(&cache, path, false, &calls).await;
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        request(&cache, path, true, &calls).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_settings_drift_recomputes() {
        let cache = AlbumDuplicateCache::new();
        let calls = AtomicUsize::new(0);
        let path = Path::new("/album");
        request(&cache, path, false, &calls).await;

        cache
            .get_or_compute(path, false, "k2", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                computed(path, Vec::new(), 3)
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_share_one_computation() {
        let cache = Arc::new(AlbumDuplicateCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..6 {
            let cache = cache.clone();
            let calls = calls.clone();
            tasks.spawn(async move {
                let path = Path::new("/album");
                cache
                    .get_or_compute(path, false, "k1", || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        computed(path, Vec::new(), 0)
                    })
                    .await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            assert!(joined.unwrap().is_computed());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!cache.is_computing(Path::new("/album")));
    }

    #[tokio::test]
    async fn test_media_count_increase_marks_stale() {
        let cache = AlbumDuplicateCache::new();
        let calls = AtomicUsize::new(0);
        let path = Path::new("/album");
        request(&cache, path, false, &calls).await;

        assert!(!cache.notify_media_count(path, 3));
        assert!(!cache.notify_media_count(path, 2));
        assert!(!cache.is_stale(path));
        assert!(cache.notify_media_count(path, 4));
        assert!(cache.is_stale(path));

        request(&cache, path, false, &calls).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!cache.is_stale(path));
    }

    #[tokio::test]
    async fn test_batch_gates_computation_and_defers_staleness() {
        let cache = AlbumDuplicateCache::new();
        let calls = AtomicUsize::new(0);
        let cached = Path::new("/cached");
        let fresh = Path::new("/fresh");
        request(&cache, cached, false, &calls).await;

        cache.begin_batch();
        cache.begin_batch();
        assert!(cache.batch_active());
        assert!(request(&cache, cached, true, &calls).await.is_computed());
        assert_eq!(
            request(&cache, fresh, false, &calls).await,
            DuplicateStatus::not_computed(SkipReason::BatchInProgress)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(!cache.notify_media_count(cached, 10));
        assert!(!cache.is_stale(cached));
        assert!(cache.end_batch().is_empty());
        assert!(!cache.is_stale(cached));
        assert_eq!(cache.end_batch(), vec![cached.to_path_buf()]);
        assert!(cache.is_stale(cached));
        assert!(!cache.batch_active());
    }

    #[tokio::test]
    async fn test_invalidation_during_computation_keeps_result_stale() {
        let cache = AlbumDuplicateCache::new();
        let path = Path::new("/album");
        let status = cache
            .get_or_compute(path, false, "k1", || async {
                cache.mark_stale(path);
                computed(path, Vec::new(), 1)
            })
            .await;
        assert!(status.is_computed());
        assert!(cache.is_stale(path));
    }

    #[tokio::test]
    async fn test_count_increase_during_first_computation_keeps_result_stale() {
        let cache = AlbumDuplicateCache::new();
        let calls = AtomicUsize::new(0);
        let path = Path::new("/album");
        let status = cache
            .get_or_compute(path, false, "k1", || async {
                assert!(cache.notify_media_count(path, 3));
                computed(path, Vec::new(), 2)
            })
            .await;
        assert!(status.is_computed());
        assert!(cache.is_stale(path));

        request(&cache, path, false, &calls).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!cache.is_stale(path));
    }

    #[tokio::test]
    async fn test_count_without_result_or_computation_is_ignored() {
        let cache = AlbumDuplicateCache::new();
        assert!(!cache.notify_media_count(Path::new("/album"), 3));
        assert!(lock(&cache.inner).epochs.is_empty());
    }

    #[tokio::test]
    async fn test_rename_during_computation_leaves_no_entry_under_old_path() {
        let cache = AlbumDuplicateCache::new();
        let calls = AtomicUsize::new(0);
        let old = Path::new("/p/trip");
        let new = Path::new("/q/trip");
        let status = cache
            .get_or_compute(old, false, "k1", || async {
                cache.rename_album(old, new);
                computed(old, vec![group(&["a", "b"])], 2)
            })
            .await;
        assert!(status.is_computed());
        assert!(cache.peek(old).is_none());
        assert!(cache.is_empty());

        request(&cache, new, false, &calls).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.peek(new).unwrap().album_path, new.to_path_buf());

        // A later computation for a re-created album at the old path is kept.
        request(&cache, old, false, &calls).await;
        assert!(cache.peek(old).is_some());
    }

    #[tokio::test]
    async fn test_retain_and_forget_drop_epochs() {
        let cache = AlbumDuplicateCache::new();
        let calls = AtomicUsize::new(0);
        for path in ["/a", "/b", "/c"] {
            request(&cache, Path::new(path), false, &calls).await;
            cache.mark_stale(Path::new(path));
        }
        assert_eq!(lock(&cache.inner).epochs.len(), 3);

        let valid: HashSet<PathBuf> = [PathBuf::from("/a"), PathBuf::from("/b")]
            .into_iter()
            .collect();
        assert_eq!(cache.retain_albums(&valid), 1);
        assert!(cache.forget_album(Path::new("/b")));

        let inner = lock(&cache.inner);
        assert_eq!(inner.epochs.keys().collect::<Vec<_>>(), vec![&PathBuf::from("/a")]);
    }

    #[tokio::test]
    async fn test_remove_group_is_optimistic() {
        let cache = AlbumDuplicateCache::new();
        let path = Path::new("/album");
        cache
            .get_or_compute(path, false, "k1", || async {
                computed(path, vec![group(&["a", "b"]), group(&["c", "d", "e"])], 5)
            })
            .await;

        let set: BTreeSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        assert!(cache.remove_group(path, &set));
        let result = cache.peek(path).unwrap();
        assert_eq!(result.groups, vec![group(&["c", "d", "e"])]);
        assert!(cache.is_stale(path));
    }

    #[tokio::test]
    async fn test_not_computed_drops_previous_result() {
        let cache = AlbumDuplicateCache::new();
        let calls = AtomicUsize::new(0);
        let path = Path::new("/album");
        request(&cache, path, false, &calls).await;

        let status = cache
            .get_or_compute(path, true, "k1", || async {
                DuplicateStatus::not_computed(SkipReason::AlbumUnavailable)
            })
            .await;
        assert!(!status.is_computed());
        assert!(cache.peek(path).is_none());
    }

    #[tokio::test]
    async fn test_rename_retain_and_forget() {
        let cache = AlbumDuplicateCache::new();
        let calls = AtomicUsize::new(0);
        for path in ["/p/trip", "/p/trip/day1", "/p/other"] {
            request(&cache, Path::new(path), false, &calls).await;
        }

        assert_eq!(cache.rename_album(Path::new("/p/trip"), Path::new("/q/trip")), 2);
        assert!(cache.peek(Path::new("/p/trip")).is_none());
        let moved = cache.peek(Path::new("/q/trip/day1")).unwrap();
        assert_eq!(moved.album_path, PathBuf::from("/q/trip/day1"));

        let valid: HashSet<PathBuf> = [PathBuf::from("/q/trip"), PathBuf::from("/q/trip/day1")]
            .into_iter()
            .collect();
        assert_eq!(cache.retain_albums(&valid), 1);
        assert!(cache.forget_album(Path::new("/q/trip")));
        assert!(!cache.forget_album(Path::new("/q/trip")));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_status_serializes_with_tags() {
        let status = DuplicateStatus::not_computed(SkipReason::TooManyFiles {
            count: 500,
            cap: 100,
        });
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "notComputed");
        assert_eq!(json["reason"]["kind"], "tooManyFiles");
        assert_eq!(json["reason"]["count"], 500);
    }
}
