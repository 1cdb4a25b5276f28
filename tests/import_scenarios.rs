//! Map bundle import integration tests.
//!
//! Builds synthetic ZIP bundles in memory and drives the importer against
//! in-memory and on-disk stores.
//!
//! Run with: `cargo test --test import_scenarios`

use std::io::{Cursor, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tempfile::TempDir;
use trailcache::{
    FileListItem, ImportConfig, MapBounds, MapHints, MapImporter, MemoryArchiveSource,
    StoreConfig, TileCacheError, TileSource, TileStore, TilingScheme,
};
use zip::write::SimpleFileOptions;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// PNG signature followed by `seed` filler bytes.
fn png(seed: u8, len: usize) -> Vec<u8> {
    let mut data = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    data.extend(std::iter::repeat_n(seed, len));
    data
}

/// Helper: ZIP archive holding `entries` (a trailing `/` adds a directory).
fn build_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    for (name, data) in entries {
        if name.ends_with('/') {
            writer.add_directory(*name, options).expect("add directory");
        } else {
            writer.start_file(*name, options).expect("start file");
            writer.write_all(data).expect("write entry");
        }
    }
    writer.finish().expect("finish archive").into_inner()
}

fn sha256(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

fn setup(archives: &[(&str, Vec<u8>)]) -> (Arc<TileStore>, MapImporter<MemoryArchiveSource>) {
    init_logging();
    let store = Arc::new(TileStore::in_memory());
    let source = MemoryArchiveSource::new();
    for (map_id, archive) in archives {
        source.insert(*map_id, archive.clone());
    }
    let importer = MapImporter::new(Arc::clone(&store), source);
    (store, importer)
}

// ============================================================================
// Test: Archive Download
// ============================================================================

#[tokio::test]
async fn test_archive_with_prefix_and_readme() {
    let a = png(1, 40);
    let b = png(2, 60);
    let archive = build_archive(&[
        ("m1/", b""),
        ("5/3/2.png", &a),
        ("m1/5/3/3.png", &b),
        ("readme.txt", b"hello"),
    ]);
    let (store, importer) = setup(&[("m1", archive)]);

    let summary = importer.download_map("m1", None).await.unwrap();
    assert_eq!(summary.imported, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.errors, 0);
    assert_eq!(summary.total_candidates, 3);
    assert!(!summary.already_cached);

    let tile = store.get_tile("m1", 5, 3, 2).await.unwrap().unwrap();
    assert_eq!(tile.data, a);
    assert_eq!(tile.content_type, "image/png");
    assert!(store.get_tile("m1", 5, 3, 3).await.unwrap().is_some());

    let meta = store.get_map_metadata("m1").await.unwrap().unwrap();
    assert_eq!(meta.size_bytes, (a.len() + b.len()) as u64);
    assert_eq!((meta.min_zoom, meta.max_zoom), (5, 5));
    assert!(!meta.pinned);
    assert!(meta.used_by_routes.is_empty());
    assert_eq!(meta.last_accessed_at, Some(meta.downloaded_at));
}

#[tokio::test]
async fn test_second_download_is_a_noop() {
    let archive = build_archive(&[("10/1/1.png", &png(7, 10))]);
    let (store, importer) = setup(&[("m", archive)]);

    let first = importer.download_map("m", None).await.unwrap();
    let before = store.get_map_metadata("m").await.unwrap().unwrap();
    let second = importer.download_map("m", None).await.unwrap();

    assert_eq!(importer.source().fetch_count(), 1);
    assert!(!first.already_cached);
    assert!(second.already_cached);
    assert_eq!(second.size_bytes, before.size_bytes);
    assert!(second.status_message().contains("already available offline"));

    let after = store.get_map_metadata("m").await.unwrap().unwrap();
    assert_eq!(after.downloaded_at, before.downloaded_at);
    assert!(after.recency() >= before.recency());
    assert_eq!(store.count_tiles_for_map("m").await.unwrap(), 1);
}

#[tokio::test]
async fn test_concurrent_downloads_fetch_once() {
    let archive = build_archive(&[("12/5/5.png", &png(1, 10)), ("12/5/6.png", &png(2, 10))]);
    let (store, importer) = setup(&[("m", archive)]);

    let (a, b) = tokio::join!(
        importer.download_map("m", None),
        importer.download_map("m", None)
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(importer.source().fetch_count(), 1);
    assert!(a.already_cached != b.already_cached);
    assert_eq!(store.count_tiles_for_map("m").await.unwrap(), 2);
}

#[tokio::test]
async fn test_hints_fill_metadata() {
    let archive = build_archive(&[("14/100/200.png", &png(1, 10)), ("15/201/401.png", &png(2, 10))]);
    let (store, importer) = setup(&[("m", archive)]);
    let bounds = MapBounds {
        south: 48.0,
        west: 17.0,
        north: 48.5,
        east: 17.5,
    };
    let hints = MapHints {
        name: Some("Forest sprint".to_string()),
        min_zoom: Some(13),
        bounds: Some(bounds),
        tiling_scheme: Some(TilingScheme::Tms),
        tile_size: Some(512),
        ..MapHints::default()
    };

    importer.download_map("m", Some(hints)).await.unwrap();

    let meta = store.get_map_metadata("m").await.unwrap().unwrap();
    assert_eq!(meta.name.as_deref(), Some("Forest sprint"));
    assert_eq!((meta.min_zoom, meta.max_zoom), (13, 15));
    assert_eq!(meta.bounds, Some(bounds));
    assert!(meta.is_tms());
    assert_eq!(meta.tile_size, Some(512));
}

#[tokio::test]
async fn test_missing_or_corrupt_archive_fails() {
    let (store, importer) = setup(&[("broken", b"definitely not a zip".to_vec())]);

    let err = importer.download_map("absent", None).await.unwrap_err();
    assert!(matches!(err, TileCacheError::ArchiveFetchFailed { ref map_id, .. } if map_id == "absent"));

    let err = importer.download_map("broken", None).await.unwrap_err();
    assert!(matches!(err, TileCacheError::ArchiveFetchFailed { .. }));

    assert!(store.get_map_metadata("absent").await.unwrap().is_none());
    assert!(store.get_map_metadata("broken").await.unwrap().is_none());
    assert!(!importer.progress("broken").unwrap().snapshot().active);
    assert!(importer.progress("never-imported").is_none());
}

#[tokio::test]
async fn test_duplicate_entries_count_stored_bytes_once() {
    let first = png(1, 40);
    let second = png(2, 90);
    let archive = build_archive(&[("5/3/2.png", &first), ("m1/5/3/2.png", &second)]);
    let (store, importer) = setup(&[("m1", archive)]);

    let summary = importer.download_map("m1", None).await.unwrap();
    assert_eq!(store.count_tiles_for_map("m1").await.unwrap(), 1);

    let stored = store.get_tile("m1", 5, 3, 2).await.unwrap().unwrap();
    let meta = store.get_map_metadata("m1").await.unwrap().unwrap();
    assert_eq!(meta.size_bytes, stored.data.len() as u64);
    assert_eq!(meta.size_bytes, store.get_map_size_bytes("m1").await.unwrap());
    assert_eq!(summary.size_bytes, meta.size_bytes);
}

#[tokio::test]
async fn test_parallel_maps_keep_separate_progress() {
    let archive_for = |seed: u8| {
        let tiles: Vec<(String, Vec<u8>)> = (0..50u32)
            .map(|i| (format!("15/{}/{}.png", 17_000 + i % 10, 11_000 + i / 10), png(seed, 12)))
            .collect();
        let entries: Vec<(&str, &[u8])> = tiles
            .iter()
            .map(|(name, data)| (name.as_str(), data.as_slice()))
            .collect();
        build_archive(&entries)
    };

    init_logging();
    let store = Arc::new(TileStore::in_memory());
    let source = MemoryArchiveSource::new();
    source.insert("a", archive_for(1));
    source.insert("b", archive_for(2));
    let config = ImportConfig {
        batch_size: 5,
        ..ImportConfig::default()
    };
    let importer = MapImporter::with_config(Arc::clone(&store), source, config);

    let (a, b) = tokio::join!(importer.download_map("a", None), importer.download_map("b", None));
    assert_eq!(a.unwrap().imported, 50);
    assert_eq!(b.unwrap().imported, 50);

    for map_id in ["a", "b"] {
        let progress = importer.progress(map_id).unwrap().snapshot();
        assert_eq!((progress.total, progress.imported), (50, 50), "map {}", map_id);
        assert!(!progress.active);
        assert_eq!(store.count_tiles_for_map(map_id).await.unwrap(), 50);
    }
}

#[tokio::test]
async fn test_empty_archive_records_empty_map() {
    let archive = build_archive(&[("notes/readme.md", b"# empty")]);
    let (store, importer) = setup(&[("m", archive)]);

    let summary = importer.download_map("m", None).await.unwrap();
    assert_eq!(summary.imported, 0);
    assert_eq!(summary.skipped, 1);

    let meta = store.get_map_metadata("m").await.unwrap().unwrap();
    assert_eq!(meta.size_bytes, 0);
    assert!(!store.has_tiles_for_map("m").await.unwrap());
}

#[tokio::test]
async fn test_small_batches_import_everything() {
    let tiles: Vec<(String, Vec<u8>)> = (0..50u32)
        .map(|i| (format!("16/{}/{}.png", 35_000 + i % 10, 22_000 + i / 10), png(i as u8, 16)))
        .collect();
    let entries: Vec<(&str, &[u8])> = tiles
        .iter()
        .map(|(name, data)| (name.as_str(), data.as_slice()))
        .collect();
    let archive = build_archive(&entries);

    init_logging();
    let store = Arc::new(TileStore::in_memory());
    let source = MemoryArchiveSource::new();
    source.insert("m", archive);
    let config = ImportConfig {
        batch_size: 7,
        ..ImportConfig::default()
    };
    let importer = MapImporter::with_config(Arc::clone(&store), source, config);

    let summary = importer.download_map("m", None).await.unwrap();
    assert_eq!(summary.imported, 50);
    assert_eq!(store.count_tiles_for_map("m").await.unwrap(), 50);

    let progress = importer.progress("m").unwrap().snapshot();
    assert_eq!(progress.imported, 50);
    assert_eq!(progress.total, 50);
    assert!(!progress.active);
}

// ============================================================================
// Test: File List Import
// ============================================================================

#[tokio::test]
async fn test_file_list_counts_read_errors() {
    let (store, importer) = setup(&[]);
    let items = vec![
        FileListItem::from_bytes("maps/forest/12/10/20.png", png(1, 10)),
        FileListItem::from_bytes("maps/forest/12/10/21.jpg", vec![0xFF, 0xD8, 0xFF, 0xE0, 1, 2]),
        FileListItem::from_bytes("maps/forest/info.json", b"{}".to_vec()),
        FileListItem::new(
            vec!["12".to_string(), "11".to_string(), "20.png".to_string()],
            || async { Err(std::io::Error::other("permission denied")) },
        ),
    ];

    let summary = importer
        .import_from_file_list("forest", items, None)
        .await
        .unwrap();
    assert_eq!(summary.total_candidates, 4);
    assert_eq!(summary.imported, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.errors, 1);
    assert!(summary.status_message().contains("1 errors"));

    let jpg = store.get_tile("forest", 12, 10, 21).await.unwrap().unwrap();
    assert_eq!(jpg.content_type, "image/jpeg");
    assert!(store.get_tile("forest", 12, 11, 20).await.unwrap().is_none());

    let meta = store.get_map_metadata("forest").await.unwrap().unwrap();
    assert_eq!(meta.size_bytes, store.get_map_size_bytes("forest").await.unwrap());
    assert_eq!((meta.min_zoom, meta.max_zoom), (12, 12));
}

#[tokio::test]
async fn test_directory_import_roundtrips_payloads() {
    init_logging();
    let tmp = TempDir::new().expect("failed to create temp dir");
    let root = tmp.path().join("tiles");
    let mut expected = Vec::new();
    for (z, x, y) in [(13u8, 4500u32, 2800u32), (13, 4501, 2800), (14, 9001, 5601)] {
        let dir = root.join(z.to_string()).join(x.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        let data = png(z ^ (x as u8), 64);
        std::fs::write(dir.join(format!("{}.png", y)), &data).unwrap();
        expected.push(((z, x, y), sha256(&data)));
    }
    std::fs::write(root.join("metadata.json"), b"{}").unwrap();

    let store = Arc::new(TileStore::new(StoreConfig::with_path(tmp.path().join("cache.db"))));
    let importer = MapImporter::new(Arc::clone(&store), MemoryArchiveSource::new());

    let items = FileListItem::from_directory(&root).unwrap();
    assert_eq!(items.len(), 4);
    let summary = importer.import_from_file_list("local", items, None).await.unwrap();
    assert_eq!(summary.imported, 3);
    assert_eq!(summary.skipped, 1);

    for ((z, x, y), digest) in expected {
        let tile = store.get_tile("local", z, x, y).await.unwrap().unwrap();
        assert_eq!(sha256(&tile.data), digest);
    }
}

#[tokio::test]
async fn test_file_list_keeps_pin_and_routes() {
    let (store, importer) = setup(&[]);
    importer
        .import_from_file_list("m", vec![FileListItem::from_bytes("8/1/1.png", png(1, 4))], None)
        .await
        .unwrap();
    store
        .modify_map_metadata("m", |meta| {
            meta.pinned = true;
            meta.used_by_routes.insert("r1".to_string());
        })
        .await
        .unwrap();

    importer
        .import_from_file_list("m", vec![FileListItem::from_bytes("8/1/2.png", png(2, 4))], None)
        .await
        .unwrap();

    let meta = store.get_map_metadata("m").await.unwrap().unwrap();
    assert!(meta.pinned);
    assert!(meta.used_by_routes.contains("r1"));
    assert_eq!(store.count_tiles_for_map("m").await.unwrap(), 2);
}

// ============================================================================
// Test: Store Consistency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batches_become_visible_atomically() {
    init_logging();
    let store = Arc::new(TileStore::in_memory());
    store.open_or_upgrade().await.unwrap();

    let writer = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            for batch in 0..10u32 {
                let tiles = (0..100u32)
                    .map(|i| {
                        trailcache::TileData::new(
                            trailcache::TileCoord::new(16, batch, i),
                            png(batch as u8, 8),
                            "image/png",
                        )
                    })
                    .collect();
                store.put_tiles("m", tiles).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    let mut observed = Vec::new();
    while !writer.is_finished() {
        observed.push(store.count_tiles_for_map("m").await.unwrap());
        tokio::task::yield_now().await;
    }
    writer.await.unwrap();
    observed.push(store.count_tiles_for_map("m").await.unwrap());

    assert!(observed.iter().all(|count| count % 100 == 0), "{:?}", observed);
    assert_eq!(observed.last(), Some(&1000));
}

#[tokio::test]
async fn test_delete_removes_everything() {
    let archive = build_archive(&[("9/1/1.png", &png(1, 8)), ("9/1/2.png", &png(2, 8))]);
    let (store, importer) = setup(&[("m", archive)]);
    importer.download_map("m", None).await.unwrap();

    let source = TileSource::for_map(Arc::clone(&store), "m").await.unwrap();
    assert!(source.resolve_tile(9, 1, 1).await.is_ok());

    assert_eq!(store.delete_map_with_metadata("m").await.unwrap(), 2);
    source.invalidate();

    assert!(!store.has_tiles_for_map("m").await.unwrap());
    assert!(store.get_map_metadata("m").await.unwrap().is_none());
    let err = source.resolve_tile(9, 1, 1).await.unwrap_err();
    assert!(err.is_tile_not_found());
    assert_eq!(source.url_registry().live_count(), 0);

    // A fresh download is possible again
    let summary = importer.download_map("m", None).await.unwrap();
    assert_eq!(summary.imported, 2);
    assert_eq!(importer.source().fetch_count(), 2);
}

#[tokio::test]
async fn test_delete_map_without_tiles() {
    let archive = build_archive(&[("notes/readme.md", b"# empty")]);
    let (store, importer) = setup(&[("m", archive)]);
    importer.download_map("m", None).await.unwrap();
    assert!(store.get_map_metadata("m").await.unwrap().is_some());

    assert_eq!(store.delete_map_with_metadata("m").await.unwrap(), 0);

    assert!(!store.has_tiles_for_map("m").await.unwrap());
    assert!(store.get_map_metadata("m").await.unwrap().is_none());
    assert!(store.get_map_metadata_list().await.unwrap().is_empty());
}
