pub mod core;
pub mod database;
pub mod services;
pub mod settings;

pub use crate::core::cluster::{cluster, effective_threshold, DuplicateGroup, NonDuplicateOverride};
pub use crate::core::fingerprint::{FileIdentity, Fingerprint};
pub use crate::core::hash::{compute_hash, HashError};
pub use services::album_cache::{AlbumDuplicateResult, DuplicateStatus, SkipReason};
pub use services::duplicates::{DuplicateIndicators, DuplicatesService};
pub use settings::{AdvancedSettings, HashConfig, SettingsStore};
