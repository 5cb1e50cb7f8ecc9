use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::core::cluster::NonDuplicateOverride;
use crate::database::override_store::OverrideStore;
use crate::database::DatabaseError;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("An override needs at least two distinct files, got {count}")]
    TooFewMembers { count: usize },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Per-album sets of files the user declared are not duplicates.
#[derive(Clone)]
pub struct NonDuplicateRegistry {
    store: Arc<dyn OverrideStore>,
}

impl NonDuplicateRegistry {
    pub fn new(store: Arc<dyn OverrideStore>) -> Self {
        Self { store }
    }

    fn build(album: &Path, members: &[String]) -> Result<NonDuplicateOverride, RegistryError> {
        NonDuplicateOverride::new(album, members.iter().cloned()).ok_or_else(|| {
            RegistryError::TooFewMembers {
                count: members
                    .iter()
                    .collect::<std::collections::BTreeSet<_>>()
                    .len(),
            }
        })
    }

    /// Records the set. Marking the same set twice is a no-op; returns whether it was new.
    pub fn mark_non_duplicate(
        &self,
        album: &Path,
        members: &[String],
    ) -> Result<bool, RegistryError> {
        let entry = Self::build(album, members)?;
        let inserted = self.store.insert(&entry)?;
        if inserted {
            log::info!(
                "Marked {} files in {} as not duplicates",
                entry.members.len(),
                album.display()
            );
        }
        Ok(inserted)
    }

    /// Forgets the set. Returns whether it was stored.
    pub fn unmark_non_duplicate(
        &self,
        album: &Path,
        members: &[String],
    ) -> Result<bool, RegistryError> {
        let entry = Self::build(album, members)?;
        let removed = self.store.remove(&entry)?;
        if removed {
            log::info!("Restored override of {} files in {}", entry.members.len(), album.display());
        }
        Ok(removed)
    }

    pub fn overrides(&self, album: &Path) -> Result<Vec<NonDuplicateOverride>, RegistryError> {
        Ok(self.store.load(album)?)
    }

    pub fn albums(&self) -> Result<Vec<PathBuf>, RegistryError> {
        Ok(self.store.albums()?)
    }

    /// Re-keys the overrides of `old` and its descendants under `new`.
    pub fn move_album(&self, old: &Path, new: &Path) -> Result<usize, RegistryError> {
        Ok(self.store.rename_album(old, new)?)
    }

    pub fn clear_album(&self, album: &Path) -> Result<usize, RegistryError> {
        Ok(self.store.clear_album(album)?)
    }
}
