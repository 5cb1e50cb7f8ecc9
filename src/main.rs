use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use walkdir::WalkDir;

use galleryhash::core::fingerprint::FileIdentity;
use galleryhash::database::{open_stores, HashStore, OverrideStore};
use galleryhash::services::hash_cache::{HashCache, HashProgress};
use galleryhash::services::media_source::{FsMediaSource, MediaSource};
use galleryhash::settings::{
    default_data_dir, HashAlgorithm, HashSize, ResizeFilter, SettingsStore, WorkerSetting,
};
use galleryhash::{DuplicateStatus, DuplicatesService, SkipReason};

#[derive(Parser, Debug)]
#[command(
    name = "galleryhash",
    version,
    about = "Perceptual duplicate detection for photo albums"
)]
struct Cli {
    /// Directory holding settings, overrides and the hash cache
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Duplicate workflows
    Duplicates {
        #[command(subcommand)]
        command: Dups,
    },

    /// Inspect album contents
    Media {
        #[command(subcommand)]
        command: MediaCmd,
    },

    /// Hash cache maintenance
    Cache {
        #[command(subcommand)]
        command: CacheCmd,
    },

    /// Show or change advanced settings
    Settings {
        #[command(subcommand)]
        command: SettingsCmd,
    },
}

#[derive(Subcommand, Debug)]
enum Dups {
    /// Find and list duplicate groups of an album
    Scan {
        #[arg(short, long, value_name = "DIR")]
        album: PathBuf,
        /// Ignore the cached result
        #[arg(long)]
        force: bool,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Mark files as not duplicates of each other
    Dismiss {
        #[arg(short, long, value_name = "DIR")]
        album: PathBuf,
        #[arg(required = true, num_args = 2..)]
        names: Vec<String>,
    },

    /// Undo a dismissal
    Restore {
        #[arg(short, long, value_name = "DIR")]
        album: PathBuf,
        #[arg(required = true, num_args = 2..)]
        names: Vec<String>,
    },

    /// List dismissed sets of an album
    Overrides {
        #[arg(short, long, value_name = "DIR")]
        album: PathBuf,
    },

    /// Forget every dismissal of an album
    Reset {
        /// May name an album that no longer exists
        #[arg(short, long, value_name = "DIR")]
        album: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum MediaCmd {
    /// List the media files of an album
    List {
        #[arg(short, long, value_name = "DIR")]
        album: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
enum CacheCmd {
    /// Show cache sizes
    Stats,

    /// Remove entries for vanished files and old settings
    Prune {
        /// Albums below this directory are checked for vanished files
        #[arg(short, long, value_name = "DIR")]
        root: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum SettingsCmd {
    Show,
    Reset,
    Set {
        /// Hamming threshold calibrated for a 256-bit hash (0-128)
        #[arg(long)]
        threshold: Option<u32>,
        /// 8x8, 16x16 or 32x32
        #[arg(long, value_parser = parse_setting::<HashSize>)]
        hash_size: Option<HashSize>,
        /// blockhash, phash or dhash
        #[arg(long, value_parser = parse_setting::<HashAlgorithm>)]
        alg: Option<HashAlgorithm>,
        /// nearest, triangle, catmullrom or lanczos3
        #[arg(long, value_parser = parse_setting::<ResizeFilter>)]
        filter: Option<ResizeFilter>,
        #[arg(long)]
        thumbnails_first: Option<bool>,
        /// 0 disables the cap
        #[arg(long)]
        max_files: Option<u32>,
        /// Number of hash workers or "auto"
        #[arg(long)]
        workers: Option<String>,
    },
}

/// Parses a settings enum from the same spelling the settings file uses.
fn parse_setting<T: DeserializeOwned>(value: &str) -> Result<T, String> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| format!("unsupported value '{}'", value))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let data_dir = match cli.data_dir {
        Some(dir) => {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create data directory {:?}", dir))?;
            dir
        }
        None => default_data_dir().context("Could not determine a data directory")?,
    };

    match cli.command {
        Commands::Duplicates { command } => run_duplicates(&data_dir, command).await?,
        Commands::Media { command } => match command {
            MediaCmd::List { album, json } => list_media(&album, json)?,
        },
        Commands::Cache { command } => match command {
            CacheCmd::Stats => cache_stats(&data_dir)?,
            CacheCmd::Prune { root } => prune_cache(&data_dir, &root)?,
        },
        Commands::Settings { command } => run_settings(&data_dir, command)?,
    }

    Ok(())
}

fn album_path(album: &Path) -> Result<PathBuf> {
    fs::canonicalize(album).with_context(|| format!("Album {:?} is not accessible", album))
}

async fn run_duplicates(data_dir: &Path, command: Dups) -> Result<()> {
    let (progress_tx, progress_rx) = mpsc::unbounded_channel::<HashProgress>();
    let service = DuplicatesService::open(data_dir)
        .context("Failed to open the data directory")?
        .with_progress_sender(progress_tx);

    match command {
        Dups::Scan { album, force, json } => {
            let album = album_path(&album)?;
            if !json {
                println!("▶ Looking for duplicates in: {}", album.display());
            }
            let bar = progress_bar(json)?;
            let progress_forwarder = tokio::spawn(forward_progress(progress_rx, bar.clone()));

            let start = Instant::now();
            let status = service.request_duplicates(&album, force).await;
            progress_forwarder.abort();
            bar.finish_and_clear();

            if let Err(e) = service.hash_cache().store().flush() {
                log::warn!("Failed to flush hash cache: {}", e);
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
                println!("⏱ took {:.2?}", start.elapsed());
            }
        }

        Dups::Dismiss { album, names } => {
            let album = album_path(&album)?;
            let inserted = service
                .mark_non_duplicate(&album, &names)
                .context("Failed to record dismissal")?;
            if inserted {
                println!("✅ {} marked as not duplicates", names.join(", "));
            } else {
                println!("Already dismissed: {}", names.join(", "));
            }
        }

        Dups::Restore { album, names } => {
            let album = album_path(&album)?;
            let removed = service
                .unmark_non_duplicate(&album, &names)
                .context("Failed to restore dismissal")?;
            if removed {
                println!("🔄 Restored {}", names.join(", "));
            } else {
                println!("No dismissal stored for {}", names.join(", "));
            }
        }

        Dups::Reset { album } => {
            let album = fs::canonicalize(&album).unwrap_or(album);
            let cleared = service
                .reset_duplicates(&album)
                .context("Failed to reset duplicates")?;
            println!("🧹 Removed {} dismissal(s) from {}", cleared, album.display());
        }

        Dups::Overrides { album } => {
            let album = album_path(&album)?;
            let overrides = service.overrides(&album).context("Failed to load overrides")?;
            if overrides.is_empty() {
                println!("No dismissed sets in {}", album.display());
            }
            for (i, entry) in overrides.iter().enumerate() {
                let members: Vec<&str> = entry.members.iter().map(String::as_str).collect();
                println!("[{}] {}", i, members.join(", "));
            }
        }
    }

    Ok(())
}

fn progress_bar(hidden: bool) -> Result<ProgressBar> {
    if hidden {
        return Ok(ProgressBar::hidden());
    }
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("=> "),
    );
    bar.enable_steady_tick(Duration::from_millis(100));
    Ok(bar)
}

async fn forward_progress(mut rx: mpsc::UnboundedReceiver<HashProgress>, bar: ProgressBar) {
    while let Some(progress) = rx.recv().await {
        bar.set_length(progress.total_files as u64);
        bar.set_position(progress.files_processed as u64);
        bar.set_message(progress.current_file);
    }
}

fn print_status(status: &DuplicateStatus) {
    match status {
        DuplicateStatus::NotComputed { reason } => match reason {
            SkipReason::TooManyFiles { count, cap } => println!(
                "⚠️  Skipped: {} files exceeds the limit of {} per album",
                count, cap
            ),
            SkipReason::AlbumUnavailable => println!("⚠️  Album could not be read"),
            SkipReason::BatchInProgress => println!("⚠️  A batch operation is in progress"),
        },
        DuplicateStatus::Computed(result) if result.groups.is_empty() => {
            println!("No duplicates found among {} files.", result.computed_at_media_count);
        }
        DuplicateStatus::Computed(result) => {
            println!("Found {} duplicate group(s):", result.groups.len());
            for (i, group) in result.groups.iter().enumerate() {
                println!(" Group {}:", i + 1);
                for name in &group.members {
                    println!("   ▶ {}", name);
                }
            }
        }
    }
}

fn list_media(album: &Path, json: bool) -> Result<()> {
    let album = album_path(album)?;
    let entries = FsMediaSource::new()
        .list_media(&album)
        .with_context(|| format!("Failed to list {:?}", album))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    for entry in &entries {
        let kind = if entry.meta.is_video { "video" } else { "image" };
        let size = match (entry.meta.width, entry.meta.height) {
            (Some(w), Some(h)) => format!("{}x{}", w, h),
            _ => "-".to_string(),
        };
        println!("{:<6} {:>11}  {}", kind, size, entry.name);
    }
    println!("{} media file(s)", entries.len());
    Ok(())
}

fn cache_stats(data_dir: &Path) -> Result<()> {
    let settings = SettingsStore::load(data_dir);
    let (overrides, hashes) = open_stores(data_dir).context("Failed to open stores")?;
    let config = settings.hash_config();
    println!("Data directory:      {}", data_dir.display());
    println!("Hash version:        {}", &config.hash_version[..16]);
    println!("Cached fingerprints: {}", hashes.len()?);
    println!("Albums with dismissals: {}", overrides.albums()?.len());
    Ok(())
}

/// Every directory below `root`, `root` included, skipping hidden ones.
fn album_dirs(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0 || !entry.file_name().to_string_lossy().starts_with('.')
        })
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_dir())
        .map(|entry| entry.into_path())
        .collect()
}

fn prune_cache(data_dir: &Path, root: &Path) -> Result<()> {
    let root = album_path(root)?;
    let settings = SettingsStore::load(data_dir);
    let config = settings.hash_config();
    let (_, store) = open_stores(data_dir).context("Failed to open stores")?;
    let cache = HashCache::from_settings(Arc::new(store), &settings.get());

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
    spinner.set_message("Collecting live files…");
    spinner.enable_steady_tick(Duration::from_millis(100));

    let source = FsMediaSource::new().without_dimensions();
    let medias: Vec<PathBuf> = album_dirs(&root)
        .iter()
        .filter_map(|dir| source.list_media(dir).ok())
        .flatten()
        .map(|entry| entry.path)
        .collect();
    let live: HashSet<String> = medias
        .par_iter()
        .filter_map(|path| FileIdentity::resolve(path, config.identity).ok())
        .map(|identity| identity.key())
        .collect();
    spinner.finish_with_message(format!("{} live files", live.len()));

    let removed = cache.prune(Some(root.as_path()), &live, &config.hash_version)?;
    cache.store().flush()?;
    println!("🧹 Removed {} stale fingerprint(s)", removed);
    Ok(())
}

fn run_settings(data_dir: &Path, command: SettingsCmd) -> Result<()> {
    let store = SettingsStore::load(data_dir);
    let settings = match command {
        SettingsCmd::Show => store.get(),
        SettingsCmd::Reset => store.reset().context("Failed to reset settings")?,
        SettingsCmd::Set {
            threshold,
            hash_size,
            alg,
            filter,
            thumbnails_first,
            max_files,
            workers,
        } => {
            let mut next = store.get();
            if let Some(threshold) = threshold {
                next.duplicates.threshold = threshold;
            }
            if let Some(hash_size) = hash_size {
                next.duplicates.hash_size = hash_size;
            }
            if let Some(alg) = alg {
                next.duplicates.hash_alg = alg;
            }
            if let Some(filter) = filter {
                next.duplicates.resize_filter = filter;
            }
            if let Some(thumbnails_first) = thumbnails_first {
                next.duplicates.use_thumbnails_first = thumbnails_first;
            }
            if let Some(max_files) = max_files {
                next.duplicates.max_files_per_album = max_files;
            }
            if let Some(workers) = workers {
                next.preload.hash_workers = match workers.parse::<u8>() {
                    Ok(n) => WorkerSetting::Count(n),
                    Err(_) => WorkerSetting::Auto(workers),
                };
            }
            store.update(next).context("Failed to save settings")?
        }
    };

    println!("{}", serde_json::to_string_pretty(&settings)?);
    let config = settings.hash_config();
    println!(
        "effective threshold: {} of {} bits",
        config.effective_threshold, config.bits
    );
    Ok(())
}
