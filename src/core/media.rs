use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::path::{Path, PathBuf};

pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "tiff", "tif", "webp", "avif", "heic",
];
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "mkv", "webm", "avi", "m4v"];

const TIMESTAMP_BITS: u32 = 40;
const DIMENSION_BITS: u32 = 20;
const SHOOT_SHIFT: u32 = 40;
const WIDTH_SHIFT: u32 = 80;
const HEIGHT_SHIFT: u32 = 100;
const IS_IMAGE_BIT: u32 = 120;
const IS_VIDEO_BIT: u32 = 121;
const HAS_ADDED_BIT: u32 = 122;
const HAS_SHOOT_BIT: u32 = 123;
const HAS_WIDTH_BIT: u32 = 124;
const HAS_HEIGHT_BIT: u32 = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaKind::Image)
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaKind::Video)
        } else {
            None
        }
    }
}

/// Per-file metadata supplied by the listing. Timestamps are unix seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaMeta {
    pub added: Option<u64>,
    pub shoot: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub is_image: bool,
    pub is_video: bool,
}

impl MediaMeta {
    /// Packs into the 126-bit layout used at the storage boundary.
    /// Values wider than their field are truncated to the field width.
    pub fn pack(&self) -> u128 {
        let ts_mask = (1u128 << TIMESTAMP_BITS) - 1;
        let dim_mask = (1u128 << DIMENSION_BITS) - 1;
        let mut packed = 0u128;
        if let Some(added) = self.added {
            packed |= added as u128 & ts_mask;
            packed |= 1u128 << HAS_ADDED_BIT;
        }
        if let Some(shoot) = self.shoot {
            packed |= (shoot as u128 & ts_mask) << SHOOT_SHIFT;
            packed |= 1u128 << HAS_SHOOT_BIT;
        }
        if let Some(width) = self.width {
            packed |= (width as u128 & dim_mask) << WIDTH_SHIFT;
            packed |= 1u128 << HAS_WIDTH_BIT;
        }
        if let Some(height) = self.height {
            packed |= (height as u128 & dim_mask) << HEIGHT_SHIFT;
            packed |= 1u128 << HAS_HEIGHT_BIT;
        }
        if self.is_image {
            packed |= 1u128 << IS_IMAGE_BIT;
        }
        if self.is_video {
            packed |= 1u128 << IS_VIDEO_BIT;
        }
        packed
    }

    pub fn unpack(packed: u128) -> Self {
        let ts_mask = (1u128 << TIMESTAMP_BITS) - 1;
        let dim_mask = (1u128 << DIMENSION_BITS) - 1;
        let flag = |bit: u32| packed & (1u128 << bit) != 0;
        Self {
            added: flag(HAS_ADDED_BIT).then(|| (packed & ts_mask) as u64),
            shoot: flag(HAS_SHOOT_BIT).then(|| ((packed >> SHOOT_SHIFT) & ts_mask) as u64),
            width: flag(HAS_WIDTH_BIT).then(|| ((packed >> WIDTH_SHIFT) & dim_mask) as u32),
            height: flag(HAS_HEIGHT_BIT).then(|| ((packed >> HEIGHT_SHIFT) & dim_mask) as u32),
            is_image: flag(IS_IMAGE_BIT),
            is_video: flag(IS_VIDEO_BIT),
        }
    }
}

/// Serialized as the packed integer in decimal, since JSON numbers cannot carry 126 bits.
impl Serialize for MediaMeta {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.pack().to_string())
    }
}

impl<'de> Deserialize<'de> for MediaMeta {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse::<u128>()
            .map(MediaMeta::unpack)
            .map_err(|e| de::Error::custom(format!("invalid packed meta {:?}: {}", text, e)))
    }
}

/// One file of an album as reported by the media listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaEntry {
    pub name: String,
    pub path: PathBuf,
    pub meta: MediaMeta,
}

impl MediaEntry {
    pub fn album_path(&self) -> Option<&Path> {
        self.path.parent()
    }

    pub fn kind(&self) -> Option<MediaKind> {
        if self.meta.is_video {
            Some(MediaKind::Video)
        } else if self.meta.is_image {
            Some(MediaKind::Image)
        } else {
            MediaKind::from_path(&self.path)
        }
    }
}
