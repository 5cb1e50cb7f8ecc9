// Pure building blocks of duplicate detection:
// - fingerprints and file identities
// - the hash engine (bitmap -> fingerprint)
// - bitmap sources (thumbnail first, original as fallback)
// - clustering fingerprints into duplicate groups
// - media entries and their packed metadata

pub mod bitmap;
pub mod cluster;
pub mod fingerprint;
pub mod hash;
pub mod media;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// `path` moved from under `old` to under `new`, or `None` when `path` is not `old` or a
/// descendant.
pub fn rebase_path(path: &Path, old: &Path, new: &Path) -> Option<PathBuf> {
    let rest = path.strip_prefix(old).ok()?;
    if rest.as_os_str().is_empty() {
        Some(new.to_path_buf())
    } else {
        Some(new.join(rest))
    }
}
