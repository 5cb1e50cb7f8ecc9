use image::DynamicImage;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;

use crate::core::media::{MediaEntry, MediaKind};

#[derive(Debug, Error)]
pub enum BitmapError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Invalid path: {path}")]
    InvalidPath { path: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Thumbnail,
    Original,
}

/// One way of turning a media entry into a decoded bitmap.
///
/// `Ok(None)` means the source has nothing for this entry (no thumbnail yet, a video
/// without a decodable frame); `Err` means it had something and failed to decode it.
pub trait BitmapSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    fn load(&self, media: &MediaEntry) -> Result<Option<DynamicImage>, BitmapError>;

    /// Changes whenever the bytes this source would decode change.
    fn revision(&self, _media: &MediaEntry) -> Option<SystemTime> {
        None
    }
}

/// Reads `<album>/<dir_name>/<file name>.webp` written by the thumbnail pipeline.
pub struct ThumbnailSource {
    dir_name: String,
}

impl ThumbnailSource {
    pub fn new(dir_name: impl Into<String>) -> Self {
        Self {
            dir_name: dir_name.into(),
        }
    }

    pub fn thumbnail_path(&self, media: &MediaEntry) -> Result<PathBuf, BitmapError> {
        let album = media.album_path().ok_or_else(|| BitmapError::InvalidPath {
            path: media.path.display().to_string(),
        })?;
        Ok(album
            .join(&self.dir_name)
            .join(format!("{}.webp", media.name)))
    }
}

impl BitmapSource for ThumbnailSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Thumbnail
    }

    fn load(&self, media: &MediaEntry) -> Result<Option<DynamicImage>, BitmapError> {
        let path = self.thumbnail_path(media)?;
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(image::open(&path)?))
    }

    fn revision(&self, media: &MediaEntry) -> Option<SystemTime> {
        let path = self.thumbnail_path(media).ok()?;
        fs::metadata(path).and_then(|m| m.modified()).ok()
    }
}

/// Decodes the original file. Videos need a generated frame, so they yield nothing here.
#[derive(Default)]
pub struct OriginalSource;

impl OriginalSource {
    pub fn new() -> Self {
        Self
    }
}

impl BitmapSource for OriginalSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Original
    }

    fn load(&self, media: &MediaEntry) -> Result<Option<DynamicImage>, BitmapError> {
        if media.kind() != Some(MediaKind::Image) {
            return Ok(None);
        }
        if !media.path.is_file() {
            return Ok(None);
        }
        Ok(Some(image::open(&media.path)?))
    }
}

/// Thumbnail-first fallback chain over two independently replaceable sources.
#[derive(Clone)]
pub struct BitmapProvider {
    thumbnail: Arc<dyn BitmapSource>,
    original: Arc<dyn BitmapSource>,
}

impl BitmapProvider {
    pub fn new(thumbnail: Arc<dyn BitmapSource>, original: Arc<dyn BitmapSource>) -> Self {
        Self {
            thumbnail,
            original,
        }
    }

    /// Thumbnails under `thumb_dir` inside each album, originals decoded from disk.
    pub fn filesystem(thumb_dir: &str) -> Self {
        Self::new(
            Arc::new(ThumbnailSource::new(thumb_dir)),
            Arc::new(OriginalSource::new()),
        )
    }

    fn chain(&self, use_thumbnails_first: bool) -> Vec<&Arc<dyn BitmapSource>> {
        if use_thumbnails_first {
            vec![&self.thumbnail, &self.original]
        } else {
            vec![&self.original]
        }
    }

    /// First bitmap any source in the chain produces. Failures fall through to the next source.
    pub fn load(
        &self,
        media: &MediaEntry,
        use_thumbnails_first: bool,
    ) -> Option<(DynamicImage, SourceKind)> {
        for source in self.chain(use_thumbnails_first) {
            match source.load(media) {
                Ok(Some(bitmap)) => return Some((bitmap, source.kind())),
                Ok(None) => {}
                Err(e) => log::warn!(
                    "{:?} bitmap failed for {}: {}",
                    source.kind(),
                    media.path.display(),
                    e
                ),
            }
        }
        None
    }

    /// Revision of the thumbnail, used to decide whether a failed hash deserves a retry.
    pub fn thumbnail_revision(&self, media: &MediaEntry) -> Option<SystemTime> {
        self.thumbnail.revision(media)
    }
}
