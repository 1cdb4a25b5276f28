//! Quota-aware storage management.
//!
//! Watches the storage estimate and evicts least-recently-used maps when
//! usage crosses the configured thresholds. Pinned maps are never chosen.

use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::StoragePolicy;
use crate::error::Result;
use crate::store::TileStore;
use crate::types::{MapMetadata, StorageEstimate};

const BYTE_UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Estimate plus the number of stored maps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageInfo {
    #[serde(flatten)]
    pub estimate: StorageEstimate,
    pub map_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningLevel {
    Ok,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapSortKey {
    /// Largest first
    Size,
    /// Display name, case-insensitive
    Name,
    /// Most recently downloaded first
    Date,
}

/// Human-readable byte count with up to `decimals` fraction digits;
/// trailing zeros are dropped ("1.5 KB", "1 MB").
pub fn format_bytes(bytes: u64, decimals: usize) -> String {
    if bytes == 0 {
        return "0 B".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < BYTE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let mut number = format!("{:.*}", decimals, value);
    if number.contains('.') {
        number = number.trim_end_matches('0').trim_end_matches('.').to_string();
    }
    format!("{} {}", number, BYTE_UNITS[unit])
}

/// Pick unpinned maps, least recently used first, until their combined
/// size covers `bytes_needed`. Ties keep their input order.
fn pick_eviction_candidates(maps: Vec<MapMetadata>, bytes_needed: u64) -> Vec<MapMetadata> {
    if bytes_needed == 0 {
        return Vec::new();
    }
    let mut candidates: Vec<MapMetadata> = maps.into_iter().filter(|m| !m.pinned).collect();
    candidates.sort_by_key(MapMetadata::recency);

    let mut freed = 0u64;
    let mut picked = Vec::new();
    for map in candidates {
        if freed >= bytes_needed {
            break;
        }
        freed += map.size_bytes;
        picked.push(map);
    }
    picked
}

/// Eviction policy over a shared [`TileStore`].
pub struct StorageManager {
    store: Arc<TileStore>,
    policy: StoragePolicy,
}

impl StorageManager {
    pub fn new(store: Arc<TileStore>) -> Self {
        Self::with_policy(store, StoragePolicy::default())
    }

    pub fn with_policy(store: Arc<TileStore>, policy: StoragePolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &StoragePolicy {
        &self.policy
    }

    pub async fn get_storage_info(&self) -> Result<StorageInfo> {
        let estimate = self.store.get_storage_estimate().await;
        let map_count = self.store.get_map_metadata_list().await?.len();
        Ok(StorageInfo {
            estimate,
            map_count,
        })
    }

    pub fn warning_level_for(&self, percentage: f64) -> WarningLevel {
        if percentage >= self.policy.critical_percent {
            WarningLevel::Critical
        } else if percentage >= self.policy.warning_percent {
            WarningLevel::Warning
        } else {
            WarningLevel::Ok
        }
    }

    pub async fn get_storage_warning_level(&self) -> WarningLevel {
        let estimate = self.store.get_storage_estimate().await;
        self.warning_level_for(estimate.percentage)
    }

    /// Unpinned maps to delete, oldest access first, until at least
    /// `bytes_needed` would be freed. May free less when not enough
    /// unpinned data exists.
    pub async fn suggest_maps_to_remove(&self, bytes_needed: u64) -> Result<Vec<MapMetadata>> {
        let maps = self.store.get_map_metadata_list().await?;
        Ok(pick_eviction_candidates(maps, bytes_needed))
    }

    /// Delete suggested maps until usage drops to the cleanup target.
    /// Returns the ids actually removed; individual failures are logged and
    /// skipped.
    pub async fn perform_auto_cleanup(&self) -> Result<Vec<String>> {
        let estimate = self.store.get_storage_estimate().await;
        if estimate.quota == 0 || estimate.percentage <= self.policy.cleanup_target_percent {
            return Ok(Vec::new());
        }

        let target = (estimate.quota as f64 * self.policy.cleanup_target_percent / 100.0) as u64;
        let bytes_needed = estimate.usage.saturating_sub(target);
        let suggestions = self.suggest_maps_to_remove(bytes_needed).await?;
        info!(
            "[StorageManager] Usage {:.1}%, freeing {} across {} maps",
            estimate.percentage,
            format_bytes(bytes_needed, 1),
            suggestions.len()
        );

        let mut removed = Vec::with_capacity(suggestions.len());
        for map in suggestions {
            match self.store.delete_map_with_metadata(&map.id).await {
                Ok(_) => {
                    info!(
                        "[StorageManager] Removed map {} ({})",
                        map.display_name(),
                        format_bytes(map.size_bytes, 1)
                    );
                    removed.push(map.id);
                }
                Err(e) => warn!("[StorageManager] Failed to remove map {}: {}", map.id, e),
            }
        }
        Ok(removed)
    }

    /// Auto-cleanup, but only once usage is critical.
    pub async fn cleanup_if_critical(&self) -> Result<Vec<String>> {
        if self.get_storage_warning_level().await != WarningLevel::Critical {
            return Ok(Vec::new());
        }
        self.perform_auto_cleanup().await
    }

    pub async fn get_maps_sorted_by(&self, key: MapSortKey) -> Result<Vec<MapMetadata>> {
        let mut maps = self.store.get_map_metadata_list().await?;
        match key {
            MapSortKey::Size => maps.sort_by(|a, b| b.size_bytes.cmp(&a.size_bytes)),
            MapSortKey::Name => {
                maps.sort_by_cached_key(|m| m.display_name().to_lowercase());
            }
            MapSortKey::Date => maps.sort_by(|a, b| b.downloaded_at.cmp(&a.downloaded_at)),
        }
        Ok(maps)
    }

    pub async fn pin_map(&self, map_id: &str) -> Result<bool> {
        self.store
            .modify_map_metadata(map_id, |meta| meta.pinned = true)
            .await
    }

    pub async fn unpin_map(&self, map_id: &str) -> Result<bool> {
        self.store
            .modify_map_metadata(map_id, |meta| meta.pinned = false)
            .await
    }

    /// Record that `route_id` needs this map offline.
    pub async fn add_route_usage(&self, map_id: &str, route_id: &str) -> Result<bool> {
        let route_id = route_id.to_string();
        self.store
            .modify_map_metadata(map_id, move |meta| {
                meta.used_by_routes.insert(route_id);
            })
            .await
    }

    pub async fn remove_route_usage(&self, map_id: &str, route_id: &str) -> Result<bool> {
        let route_id = route_id.to_string();
        self.store
            .modify_map_metadata(map_id, move |meta| {
                meta.used_by_routes.remove(&route_id);
            })
            .await
    }
}
