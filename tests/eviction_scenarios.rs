//! Storage eviction integration tests.
//!
//! Run with: `cargo test --test eviction_scenarios`

use std::sync::Arc;

use trailcache::{
    FixedQuota, MapMetadata, StorageManager, StoragePolicy, TileCoord, TileData, TileStore,
    WarningLevel,
};

const MB: u64 = 1024 * 1024;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn map(id: &str, size_bytes: u64, last_accessed_at: i64, pinned: bool) -> MapMetadata {
    let mut meta = MapMetadata::new(id, 10, 16);
    meta.size_bytes = size_bytes;
    meta.downloaded_at = last_accessed_at;
    meta.last_accessed_at = Some(last_accessed_at);
    meta.pinned = pinned;
    meta
}

/// Helper: store with the given maps (plus one tile each) and a fixed quota.
async fn setup(maps: Vec<MapMetadata>, usage: u64, quota: u64) -> (Arc<TileStore>, Arc<FixedQuota>) {
    init_logging();
    let probe = Arc::new(FixedQuota::new(usage, quota));
    let store = Arc::new(TileStore::in_memory().with_quota_probe(probe.clone()));
    for meta in maps {
        let tile = TileData::new(TileCoord::new(10, 1, 1), vec![1, 2, 3], "image/png");
        store.put_tiles(&meta.id, vec![tile]).await.unwrap();
        store.save_map_metadata(meta).await.unwrap();
    }
    (store, probe)
}

// ============================================================================
// Test: 95% Usage Scenario
// ============================================================================

#[tokio::test]
async fn test_cleanup_at_95_percent() {
    let maps = vec![
        map("small", 10 * MB, 1_000, false),
        map("medium", 20 * MB, 2_000, false),
        map("large", 30 * MB, 3_000, false),
        map("event", 50 * MB, 500, true),
    ];
    let (store, _probe) = setup(maps, 95 * MB, 100 * MB).await;
    let manager = StorageManager::new(Arc::clone(&store));

    assert_eq!(manager.get_storage_warning_level().await, WarningLevel::Critical);

    let removed = manager.perform_auto_cleanup().await.unwrap();
    assert_eq!(removed, vec!["small", "medium", "large"]);

    let remaining = store.get_map_metadata_list().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, "event");
    assert!(store.has_tiles_for_map("event").await.unwrap());
    assert!(!store.has_tiles_for_map("small").await.unwrap());
}

#[tokio::test]
async fn test_cleanup_stops_once_target_reachable() {
    // Oldest first: 30MB then 20MB frees 50MB >= 35MB needed
    let maps = vec![
        map("a", 30 * MB, 100, false),
        map("b", 20 * MB, 200, false),
        map("c", 10 * MB, 300, false),
    ];
    let (store, _probe) = setup(maps, 95 * MB, 100 * MB).await;
    let manager = StorageManager::new(Arc::clone(&store));

    let removed = manager.perform_auto_cleanup().await.unwrap();
    assert_eq!(removed, vec!["a", "b"]);
    assert!(store.get_map_metadata("c").await.unwrap().is_some());
}

#[tokio::test]
async fn test_removal_never_exceeds_what_is_needed() {
    let sizes = [7u64, 3, 12, 5, 9, 1, 20];
    let maps: Vec<MapMetadata> = sizes
        .iter()
        .enumerate()
        .map(|(i, size)| map(&format!("m{}", i), size * MB, 1_000 - i as i64 * 10, false))
        .collect();
    let (store, _probe) = setup(maps, 90 * MB, 100 * MB).await;
    let manager = StorageManager::new(Arc::clone(&store));

    let needed = 30 * MB;
    let suggested = manager.suggest_maps_to_remove(needed).await.unwrap();
    let freed: u64 = suggested.iter().map(|m| m.size_bytes).sum();
    assert!(freed >= needed);

    let without_last: u64 = suggested[..suggested.len() - 1].iter().map(|m| m.size_bytes).sum();
    assert!(without_last < needed);

    let recency: Vec<i64> = suggested.iter().map(|m| m.recency()).collect();
    assert!(recency.windows(2).all(|w| w[0] <= w[1]));
}

// ============================================================================
// Test: Pinning
// ============================================================================

#[tokio::test]
async fn test_pinned_maps_are_never_suggested() {
    let maps = vec![
        map("stale-pinned", 40 * MB, 1, true),
        map("fresh", 10 * MB, 9_000, false),
    ];
    let (store, _probe) = setup(maps, 99 * MB, 100 * MB).await;
    let manager = StorageManager::new(Arc::clone(&store));

    let suggested = manager.suggest_maps_to_remove(u64::MAX).await.unwrap();
    let ids: Vec<&str> = suggested.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["fresh"]);

    manager.pin_map("fresh").await.unwrap();
    assert!(manager.suggest_maps_to_remove(MB).await.unwrap().is_empty());
    assert!(manager.perform_auto_cleanup().await.unwrap().is_empty());
    assert_eq!(store.get_map_metadata_list().await.unwrap().len(), 2);
}

// ============================================================================
// Test: Triggers
// ============================================================================

#[tokio::test]
async fn test_cleanup_if_critical_follows_level() {
    let maps = vec![map("old", 40 * MB, 1, false), map("new", 30 * MB, 2, false)];
    let (store, probe) = setup(maps, 80 * MB, 100 * MB).await;
    let manager = StorageManager::new(Arc::clone(&store));

    assert_eq!(manager.get_storage_warning_level().await, WarningLevel::Warning);
    assert!(manager.cleanup_if_critical().await.unwrap().is_empty());

    probe.set_usage(92 * MB);
    assert_eq!(manager.cleanup_if_critical().await.unwrap(), vec!["old"]);
}

#[tokio::test]
async fn test_custom_policy_thresholds() {
    let maps = vec![map("a", 10 * MB, 1, false), map("b", 10 * MB, 2, false)];
    let (store, _probe) = setup(maps, 55 * MB, 100 * MB).await;
    let policy = StoragePolicy {
        warning_percent: 40.0,
        critical_percent: 50.0,
        cleanup_target_percent: 50.0,
    };
    let manager = StorageManager::with_policy(Arc::clone(&store), policy);

    assert_eq!(manager.get_storage_warning_level().await, WarningLevel::Critical);
    assert_eq!(manager.perform_auto_cleanup().await.unwrap(), vec!["a"]);
}

#[tokio::test]
async fn test_touch_changes_eviction_order() {
    let maps = vec![map("first", 10 * MB, 1, false), map("second", 10 * MB, 2, false)];
    let (store, _probe) = setup(maps, 0, 100 * MB).await;
    let manager = StorageManager::new(Arc::clone(&store));

    assert!(store.touch_map("first").await.unwrap());
    let suggested = manager.suggest_maps_to_remove(MB).await.unwrap();
    assert_eq!(suggested[0].id, "second");
}
