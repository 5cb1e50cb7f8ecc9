use image::{ImageBuffer, ImageFormat, Rgb, RgbImage};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::task::JoinSet;

use galleryhash::database::HashStore;
use galleryhash::{DuplicateStatus, DuplicatesService, SettingsStore, SkipReason};

fn gradient(invert: bool) -> RgbImage {
    ImageBuffer::from_fn(64, 64, |x, _| {
        let v = (x * 4) as u8;
        Rgb(if invert { [255 - v; 3] } else { [v; 3] })
    })
}

fn write_album(dir: &Path, files: &[(&str, bool)]) {
    fs::create_dir_all(dir).unwrap();
    for (name, invert) in files {
        gradient(*invert).save(dir.join(name)).unwrap();
    }
}

fn names(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_scan_groups_identical_images() {
    let data_dir = TempDir::new().unwrap();
    let album_dir = TempDir::new().unwrap();
    write_album(
        album_dir.path(),
        &[("a.png", false), ("b.png", false), ("c.png", true)],
    );

    let service = DuplicatesService::open(data_dir.path()).unwrap();
    let status = service.request_duplicates(album_dir.path(), false).await;

    let result = status.result().expect("album should be computed");
    assert_eq!(result.computed_at_media_count, 3);
    assert_eq!(result.groups.len(), 1);
    assert_eq!(result.groups[0].members, vec!["a.png", "b.png"]);
    assert_eq!(service.hash_cache().len().unwrap(), 3);
}

#[tokio::test]
async fn test_dismissed_group_stays_gone_after_refresh() {
    let data_dir = TempDir::new().unwrap();
    let album_dir = TempDir::new().unwrap();
    write_album(
        album_dir.path(),
        &[("a.png", false), ("b.png", false), ("c.png", true)],
    );
    let album = album_dir.path();

    let service = DuplicatesService::open(data_dir.path()).unwrap();
    assert!(service.request_duplicates(album, false).await.has_duplicates());

    service
        .mark_non_duplicate(album, &names(&["a.png", "b.png"]))
        .unwrap();
    let refreshed = service.request_duplicates(album, true).await;
    assert!(refreshed.is_computed());
    assert!(refreshed.groups().is_empty());

    service
        .unmark_non_duplicate(album, &names(&["b.png", "a.png"]))
        .unwrap();
    let restored = service.request_duplicates(album, false).await;
    assert_eq!(restored.groups().len(), 1);
}

#[tokio::test]
async fn test_empty_album_has_no_groups() {
    let data_dir = TempDir::new().unwrap();
    let album_dir = TempDir::new().unwrap();
    fs::write(album_dir.path().join("notes.txt"), b"not media").unwrap();

    let service = DuplicatesService::open(data_dir.path()).unwrap();
    let status = service.request_duplicates(album_dir.path(), false).await;
    assert!(status.is_computed());
    assert!(status.groups().is_empty());
    assert_eq!(status.result().unwrap().computed_at_media_count, 0);
}

#[tokio::test]
async fn test_cap_from_settings_file_skips_album() {
    let data_dir = TempDir::new().unwrap();
    let album_dir = TempDir::new().unwrap();
    write_album(
        album_dir.path(),
        &[("a.png", false), ("b.png", false), ("c.png", true)],
    );

    let store = SettingsStore::load(data_dir.path());
    let mut settings = store.get();
    settings.duplicates.max_files_per_album = 2;
    store.update(settings).unwrap();

    let service = DuplicatesService::open(data_dir.path()).unwrap();
    let status = service.request_duplicates(album_dir.path(), false).await;
    assert_eq!(
        status,
        DuplicateStatus::not_computed(SkipReason::TooManyFiles { count: 3, cap: 2 })
    );
    assert!(service.hash_cache().is_empty().unwrap());
}

#[tokio::test]
async fn test_thumbnail_is_preferred_over_original() {
    let data_dir = TempDir::new().unwrap();
    let album_dir = TempDir::new().unwrap();
    write_album(
        album_dir.path(),
        &[("a.png", false), ("b.png", false), ("c.png", true)],
    );
    let thumbs = album_dir.path().join(".room237-thumb");
    fs::create_dir_all(&thumbs).unwrap();
    gradient(false)
        .save_with_format(thumbs.join("c.png.webp"), ImageFormat::WebP)
        .unwrap();

    let service = DuplicatesService::open(data_dir.path()).unwrap();
    let status = service.request_duplicates(album_dir.path(), false).await;
    assert_eq!(status.groups().len(), 1);
    assert_eq!(status.groups()[0].members, vec!["a.png", "b.png", "c.png"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_share_one_computation() {
    let data_dir = TempDir::new().unwrap();
    let album_dir = TempDir::new().unwrap();
    let files: Vec<(String, bool)> = (0..12)
        .map(|i| (format!("{:02}.png", i), i % 3 == 0))
        .collect();
    let refs: Vec<(&str, bool)> = files.iter().map(|(n, inv)| (n.as_str(), *inv)).collect();
    write_album(album_dir.path(), &refs);

    let service = Arc::new(DuplicatesService::open(data_dir.path()).unwrap());
    let album = album_dir.path().to_path_buf();

    let mut tasks = JoinSet::new();
    for _ in 0..6 {
        let service = Arc::clone(&service);
        let album = album.clone();
        tasks.spawn(async move { service.request_duplicates(&album, false).await });
    }

    let mut results = Vec::new();
    while let Some(status) = tasks.join_next().await {
        results.push(status.unwrap());
    }

    let first = results[0].result().unwrap().clone();
    assert_eq!(first.groups.len(), 2);
    for status in &results {
        assert_eq!(status.result().unwrap().computed_at, first.computed_at);
    }
    assert_eq!(service.hash_cache().len().unwrap(), 12);
}

#[tokio::test]
async fn test_hashes_and_overrides_survive_reopen() {
    let data_dir = TempDir::new().unwrap();
    let album_dir = TempDir::new().unwrap();
    write_album(
        album_dir.path(),
        &[("a.png", false), ("b.png", false), ("c.png", true)],
    );
    let album = album_dir.path();

    {
        let service = DuplicatesService::open(data_dir.path()).unwrap();
        service.request_duplicates(album, false).await;
        service
            .mark_non_duplicate(album, &names(&["a.png", "b.png"]))
            .unwrap();
        service.hash_cache().store().flush().unwrap();
    }

    let service = DuplicatesService::open(data_dir.path()).unwrap();
    assert_eq!(service.hash_cache().len().unwrap(), 3);
    assert_eq!(service.overrides(album).unwrap().len(), 1);

    let status = service.request_duplicates(album, false).await;
    assert!(status.is_computed());
    assert!(status.groups().is_empty());
    assert_eq!(service.hash_cache().len().unwrap(), 3);
}
