pub mod album_cache;
pub mod duplicates;
pub mod hash_cache;
pub mod media_source;
pub mod registry;

pub use album_cache::AlbumDuplicateCache;
pub use duplicates::DuplicatesService;
pub use hash_cache::HashCache;
pub use media_source::{FsMediaSource, MediaSource};
pub use registry::NonDuplicateRegistry;
