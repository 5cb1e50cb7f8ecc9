use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use walkdir::WalkDir;

use crate::core::media::{MediaEntry, MediaKind, MediaMeta};

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Album not found: {path}")]
    NotFound { path: String },

    #[error("Not a directory: {path}")]
    NotADirectory { path: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

/// Lists the media files of one album.
pub trait MediaSource: Send + Sync {
    fn list_media(&self, album: &Path) -> Result<Vec<MediaEntry>, MediaError>;
}

/// Lists an album directory non-recursively. Subdirectories, the thumbnail
/// directory among them, are never entered.
pub struct FsMediaSource {
    read_dimensions: bool,
}

impl Default for FsMediaSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FsMediaSource {
    pub fn new() -> Self {
        Self {
            read_dimensions: true,
        }
    }

    /// Skip reading image headers for width and height.
    pub fn without_dimensions(mut self) -> Self {
        self.read_dimensions = false;
        self
    }

    fn unix_seconds(time: std::io::Result<SystemTime>) -> Option<u64> {
        time.ok()?
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|d| d.as_secs())
    }

    fn meta_for(&self, path: &Path, kind: MediaKind, fs_meta: &std::fs::Metadata) -> MediaMeta {
        let added = Self::unix_seconds(fs_meta.created())
            .or_else(|| Self::unix_seconds(fs_meta.modified()));
        let dimensions = if self.read_dimensions && kind == MediaKind::Image {
            image::image_dimensions(path).ok()
        } else {
            None
        };
        MediaMeta {
            added,
            shoot: None,
            width: dimensions.map(|(w, _)| w),
            height: dimensions.map(|(_, h)| h),
            is_image: kind == MediaKind::Image,
            is_video: kind == MediaKind::Video,
        }
    }
}

impl MediaSource for FsMediaSource {
    fn list_media(&self, album: &Path) -> Result<Vec<MediaEntry>, MediaError> {
        if !album.exists() {
            return Err(MediaError::NotFound {
                path: album.display().to_string(),
            });
        }
        if !album.is_dir() {
            return Err(MediaError::NotADirectory {
                path: album.display().to_string(),
            });
        }

        let mut entries = Vec::new();
        for item in WalkDir::new(album).min_depth(1).max_depth(1) {
            let item = match item {
                Ok(item) => item,
                Err(e) => {
                    log::warn!("Skipping unreadable entry in {}: {}", album.display(), e);
                    continue;
                }
            };
            if !item.file_type().is_file() {
                continue;
            }
            let name = item.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let Some(kind) = MediaKind::from_path(item.path()) else {
                continue;
            };
            let fs_meta = item.metadata()?;
            entries.push(MediaEntry {
                meta: self.meta_for(item.path(), kind, &fs_meta),
                path: item.path().to_path_buf(),
                name,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}
