use image::imageops::FilterType;
use image_hasher::HashAlg;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;

pub const SETTINGS_FILE: &str = "settings.json";
const HASH_SCHEMA_VERSION: &str = "1";
const APP_DIR_NAME: &str = "galleryhash";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Could not determine a data directory")]
    NoDataDir,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashSize {
    #[serde(rename = "8x8")]
    S8x8,
    #[default]
    #[serde(rename = "16x16")]
    S16x16,
    #[serde(rename = "32x32")]
    S32x32,
}

impl HashSize {
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            HashSize::S8x8 => (8, 8),
            HashSize::S16x16 => (16, 16),
            HashSize::S32x32 => (32, 32),
        }
    }

    pub fn bits(self) -> u32 {
        let (w, h) = self.dimensions();
        w * h
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Blockhash,
    Phash,
    Dhash,
}

impl HashAlgorithm {
    pub fn to_hash_alg(self) -> HashAlg {
        match self {
            HashAlgorithm::Blockhash => HashAlg::Blockhash,
            HashAlgorithm::Phash => HashAlg::Median,
            HashAlgorithm::Dhash => HashAlg::Gradient,
        }
    }

    /// Whether the bitmap goes through a DCT before thresholding.
    pub fn uses_dct(self) -> bool {
        matches!(self, HashAlgorithm::Phash)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeFilter {
    #[default]
    Nearest,
    Triangle,
    Catmullrom,
    Lanczos3,
}

impl ResizeFilter {
    pub fn to_filter_type(self) -> FilterType {
        match self {
            ResizeFilter::Nearest => FilterType::Nearest,
            ResizeFilter::Triangle => FilterType::Triangle,
            ResizeFilter::Catmullrom => FilterType::CatmullRom,
            ResizeFilter::Lanczos3 => FilterType::Lanczos3,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityMode {
    /// Path, size and modification time.
    #[default]
    Metadata,
    /// Digest of the file content.
    Content,
}

/// Worker count: a number or `"auto"`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerSetting {
    Auto(String),
    Count(u8),
}

impl Default for WorkerSetting {
    fn default() -> Self {
        WorkerSetting::Count(4)
    }
}

impl WorkerSetting {
    fn normalize(self) -> Self {
        match self {
            WorkerSetting::Auto(s) => match s.trim().parse::<u8>() {
                Ok(n) => WorkerSetting::Count(n.clamp(1, 32)),
                Err(_) => WorkerSetting::Auto("auto".to_string()),
            },
            WorkerSetting::Count(n) => WorkerSetting::Count(n.clamp(1, 32)),
        }
    }

    pub fn resolved(&self) -> usize {
        match self {
            WorkerSetting::Count(n) => (*n).clamp(1, 32) as usize,
            WorkerSetting::Auto(_) => num_cpus::get().clamp(1, 32),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DuplicatesSettings {
    /// Hamming threshold calibrated against a 256-bit hash.
    pub threshold: u32,
    pub hash_size: HashSize,
    pub hash_alg: HashAlgorithm,
    pub resize_filter: ResizeFilter,
    pub use_thumbnails_first: bool,
    /// 0 disables the cap.
    pub max_files_per_album: u32,
    pub identity: IdentityMode,
}

impl Default for DuplicatesSettings {
    fn default() -> Self {
        Self {
            threshold: 32,
            hash_size: HashSize::default(),
            hash_alg: HashAlgorithm::default(),
            resize_filter: ResizeFilter::default(),
            use_thumbnails_first: true,
            max_files_per_album: 0,
            identity: IdentityMode::default(),
        }
    }
}

impl DuplicatesSettings {
    fn clamp(self) -> Self {
        Self {
            threshold: self.threshold.min(128),
            max_files_per_album: self.max_files_per_album.min(20_000),
            ..self
        }
    }

    pub fn effective_threshold(&self) -> u32 {
        crate::core::cluster::effective_threshold(self.threshold, self.hash_size.bits())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThumbnailSettings {
    pub max_dim: u32,
    pub image_webp_quality: u8,
    pub video_seek_seconds: f32,
    /// Directory inside each album where the thumbnail pipeline writes `<name>.webp`.
    pub dir_name: String,
}

impl Default for ThumbnailSettings {
    fn default() -> Self {
        Self {
            max_dim: 450,
            image_webp_quality: 75,
            video_seek_seconds: 1.0,
            dir_name: ".room237-thumb".to_string(),
        }
    }
}

impl ThumbnailSettings {
    fn clamp(self) -> Self {
        let dir_name = if self.dir_name.trim().is_empty() {
            ThumbnailSettings::default().dir_name
        } else {
            self.dir_name
        };
        Self {
            max_dim: self.max_dim.clamp(128, 2048),
            image_webp_quality: self.image_webp_quality.clamp(30, 95),
            video_seek_seconds: self.video_seek_seconds.clamp(0.0, 30.0),
            dir_name,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PreloadSettings {
    pub hash_workers: WorkerSetting,
    pub hash_retry_on_thumb_change: bool,
}

impl Default for PreloadSettings {
    fn default() -> Self {
        Self {
            hash_workers: WorkerSetting::default(),
            hash_retry_on_thumb_change: true,
        }
    }
}

impl PreloadSettings {
    fn clamp(self) -> Self {
        Self {
            hash_workers: self.hash_workers.normalize(),
            ..self
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvancedSettings {
    #[serde(default)]
    pub duplicates: DuplicatesSettings,
    #[serde(default)]
    pub thumbnails: ThumbnailSettings,
    #[serde(default)]
    pub preload: PreloadSettings,
}

impl AdvancedSettings {
    pub fn clamp(self) -> Self {
        Self {
            duplicates: self.duplicates.clamp(),
            thumbnails: self.thumbnails.clamp(),
            preload: self.preload.clamp(),
        }
    }

    /// Version of the thumbnails the external pipeline produces for these settings.
    pub fn thumb_version(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "dim:{}|q:{}|seek:{:.3}",
            self.thumbnails.max_dim,
            self.thumbnails.image_webp_quality,
            self.thumbnails.video_seek_seconds
        ));
        format!("{:x}", hasher.finalize())[..16].to_string()
    }

    pub fn hash_config(&self) -> HashConfig {
        let dup = &self.duplicates;
        let size = dup.hash_size.dimensions();
        let thumb_version = if dup.use_thumbnails_first {
            self.thumb_version()
        } else {
            String::new()
        };
        let mut hasher = Sha256::new();
        hasher.update(HASH_SCHEMA_VERSION.as_bytes());
        hasher.update(
            format!(
                "alg:{:?}|size:{}x{}|filter:{:?}|thumb_first:{}|thumb_version:{}",
                dup.hash_alg,
                size.0,
                size.1,
                dup.resize_filter,
                dup.use_thumbnails_first,
                thumb_version
            )
            .as_bytes(),
        );

        HashConfig {
            size,
            bits: dup.hash_size.bits(),
            alg: dup.hash_alg,
            resize_filter: dup.resize_filter,
            use_thumbnails_first: dup.use_thumbnails_first,
            identity: dup.identity,
            hash_version: format!("{:x}", hasher.finalize()),
            user_threshold: dup.threshold,
            effective_threshold: dup.effective_threshold(),
            max_files_per_album: dup.max_files_per_album,
            thumb_dir: self.thumbnails.dir_name.clone(),
        }
    }
}

/// Everything the duplicate pipeline needs, derived from [`AdvancedSettings`].
#[derive(Clone, Debug, PartialEq)]
pub struct HashConfig {
    pub size: (u32, u32),
    pub bits: u32,
    pub alg: HashAlgorithm,
    pub resize_filter: ResizeFilter,
    pub use_thumbnails_first: bool,
    pub identity: IdentityMode,
    pub hash_version: String,
    pub user_threshold: u32,
    pub effective_threshold: u32,
    pub max_files_per_album: u32,
    pub thumb_dir: String,
}

impl HashConfig {
    /// Key of everything that changes clustering output for the same files.
    pub fn settings_key(&self) -> String {
        format!(
            "{}|t:{}|cap:{}",
            self.hash_version, self.effective_threshold, self.max_files_per_album
        )
    }
}

impl Default for HashConfig {
    fn default() -> Self {
        AdvancedSettings::default().hash_config()
    }
}

/// Settings persisted as JSON, shared behind a lock.
#[derive(Clone, Debug)]
pub struct SettingsStore {
    path: Option<PathBuf>,
    inner: Arc<RwLock<AdvancedSettings>>,
}

impl SettingsStore {
    /// Load from `<dir>/settings.json`. A missing or unreadable file yields defaults.
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(SETTINGS_FILE);
        let settings = fs::read_to_string(&path)
            .ok()
            .and_then(|txt| match serde_json::from_str::<AdvancedSettings>(&txt) {
                Ok(settings) => Some(settings),
                Err(e) => {
                    log::warn!("Ignoring malformed settings {}: {}", path.display(), e);
                    None
                }
            })
            .unwrap_or_default()
            .clamp();
        Self {
            path: Some(path),
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    /// Settings that never touch the disk.
    pub fn in_memory(settings: AdvancedSettings) -> Self {
        Self {
            path: None,
            inner: Arc::new(RwLock::new(settings.clamp())),
        }
    }

    pub fn get(&self) -> AdvancedSettings {
        self.inner
            .read()
            .map(|g| g.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn hash_config(&self) -> HashConfig {
        self.get().hash_config()
    }

    pub fn update(&self, next: AdvancedSettings) -> Result<AdvancedSettings, SettingsError> {
        let validated = next.clamp();
        {
            let mut guard = self
                .inner
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *guard = validated.clone();
        }
        self.persist(&validated)?;
        Ok(validated)
    }

    pub fn reset(&self) -> Result<AdvancedSettings, SettingsError> {
        self.update(AdvancedSettings::default())
    }

    fn persist(&self, settings: &AdvancedSettings) -> Result<(), SettingsError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(settings)?)?;
        Ok(())
    }
}

/// `<platform data dir>/galleryhash`, created if missing.
pub fn default_data_dir() -> Result<PathBuf, SettingsError> {
    let dir = dirs::data_dir()
        .ok_or(SettingsError::NoDataDir)?
        .join(APP_DIR_NAME);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}
