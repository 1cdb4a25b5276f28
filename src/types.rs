//! Persisted record types.
//!
//! These are the four entity types owned by the store (tiles, map metadata,
//! participant session, GPS track points) plus the small value types the
//! store hands back to its consumers.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::tiles::TileCoord;

/// Current wall-clock time as Unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// Tiles
// ============================================================================

/// Tile payload as handed to `put_tiles`; the owning map id is supplied
/// separately for the whole batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileData {
    pub coord: TileCoord,
    pub data: Vec<u8>,
    pub content_type: String,
}

impl TileData {
    pub fn new(coord: TileCoord, data: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            coord,
            data,
            content_type: content_type.into(),
        }
    }
}

/// One stored raster tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileRecord {
    pub map_id: String,
    pub coord: TileCoord,
    pub data: Vec<u8>,
    pub content_type: String,
}

impl TileRecord {
    /// Storage key in the `mapId/z/x/y` form.
    pub fn key(&self) -> String {
        self.coord.storage_key(&self.map_id)
    }
}

// ============================================================================
// Map Metadata
// ============================================================================

/// Row addressing of a tile set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TilingScheme {
    /// Row 0 at the top (slippy map / Google)
    Xyz,
    /// Row 0 at the bottom
    Tms,
}

/// Geographic bounding box in WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MapBounds {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

impl MapBounds {
    /// South below north and west below east, all finite.
    pub fn is_valid(&self) -> bool {
        [self.south, self.west, self.north, self.east]
            .iter()
            .all(|v| v.is_finite())
            && self.south < self.north
            && self.west < self.east
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.south + self.north) / 2.0,
            (self.west + self.east) / 2.0,
        )
    }
}

/// One downloaded map / tile set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapMetadata {
    pub id: String,
    pub name: Option<String>,
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub bounds: Option<MapBounds>,
    pub tiling_scheme: Option<TilingScheme>,
    /// Tile edge length in pixels
    pub tile_size: Option<u32>,
    pub size_bytes: u64,
    /// Unix ms
    pub downloaded_at: i64,
    /// Unix ms, bumped on every access
    pub last_accessed_at: Option<i64>,
    /// Protected from automatic eviction
    pub pinned: bool,
    /// Routes currently referencing this map
    pub used_by_routes: BTreeSet<String>,
}

impl MapMetadata {
    /// Fresh metadata for a map downloaded right now.
    pub fn new(id: impl Into<String>, min_zoom: u8, max_zoom: u8) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            name: None,
            min_zoom: min_zoom.min(max_zoom),
            max_zoom: max_zoom.max(min_zoom),
            bounds: None,
            tiling_scheme: None,
            tile_size: None,
            size_bytes: 0,
            downloaded_at: now,
            last_accessed_at: Some(now),
            pinned: false,
            used_by_routes: BTreeSet::new(),
        }
    }

    /// Timestamp used for LRU ranking.
    pub fn recency(&self) -> i64 {
        self.last_accessed_at.unwrap_or(self.downloaded_at)
    }

    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn is_tms(&self) -> bool {
        self.tiling_scheme == Some(TilingScheme::Tms)
    }
}

/// Partial update for `update_map_metadata`; only `Some` fields are merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MapMetadataPatch {
    pub name: Option<String>,
    pub min_zoom: Option<u8>,
    pub max_zoom: Option<u8>,
    pub bounds: Option<MapBounds>,
    pub tiling_scheme: Option<TilingScheme>,
    pub tile_size: Option<u32>,
    pub size_bytes: Option<u64>,
    pub downloaded_at: Option<i64>,
    pub last_accessed_at: Option<i64>,
    pub pinned: Option<bool>,
    pub used_by_routes: Option<BTreeSet<String>>,
}

impl MapMetadataPatch {
    pub fn pinned(pinned: bool) -> Self {
        Self {
            pinned: Some(pinned),
            ..Self::default()
        }
    }

    pub fn accessed_at(timestamp: i64) -> Self {
        Self {
            last_accessed_at: Some(timestamp),
            ..Self::default()
        }
    }

    pub fn apply(self, meta: &mut MapMetadata) {
        if let Some(name) = self.name {
            meta.name = Some(name);
        }
        if let Some(min_zoom) = self.min_zoom {
            meta.min_zoom = min_zoom;
        }
        if let Some(max_zoom) = self.max_zoom {
            meta.max_zoom = max_zoom;
        }
        if let Some(bounds) = self.bounds {
            meta.bounds = Some(bounds);
        }
        if let Some(scheme) = self.tiling_scheme {
            meta.tiling_scheme = Some(scheme);
        }
        if let Some(tile_size) = self.tile_size {
            meta.tile_size = Some(tile_size);
        }
        if let Some(size_bytes) = self.size_bytes {
            meta.size_bytes = size_bytes;
        }
        if let Some(downloaded_at) = self.downloaded_at {
            meta.downloaded_at = downloaded_at;
        }
        if let Some(accessed) = self.last_accessed_at {
            meta.last_accessed_at = Some(accessed);
        }
        if let Some(pinned) = self.pinned {
            meta.pinned = pinned;
        }
        if let Some(routes) = self.used_by_routes {
            meta.used_by_routes = routes;
        }
        if meta.min_zoom > meta.max_zoom {
            std::mem::swap(&mut meta.min_zoom, &mut meta.max_zoom);
        }
    }
}

// ============================================================================
// Participant Session
// ============================================================================

/// A mutation request the backend has not acknowledged yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
    pub id: String,
    pub method: String,
    pub endpoint: String,
    /// JSON request body, if any
    pub body: Option<String>,
    /// Unix ms
    pub created_at: i64,
}

/// Enough state to resume a participant's run after a reload or crash.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSession {
    pub run_id: String,
    pub category_id: String,
    pub competition_id: String,
    pub participant_id: String,
    pub participant_name: Option<String>,
    pub run_active: bool,
    pub finished: bool,
    /// Unix ms
    pub start_time: Option<i64>,
    /// Elapsed time as shown to the participant, e.g. "01:23:45"
    pub elapsed_display: String,
    pub checkpoint_count: u32,
    pub pending_requests: Vec<PendingRequest>,
}

// ============================================================================
// GPS Track Points
// ============================================================================

/// One location sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpsTrackPoint {
    /// Unix ms, unique key
    pub timestamp: i64,
    pub latitude: f64,
    pub longitude: f64,
    /// Accuracy radius in meters
    pub accuracy: f64,
    pub uploaded: bool,
}

impl GpsTrackPoint {
    pub fn new(timestamp: i64, latitude: f64, longitude: f64, accuracy: f64) -> Self {
        Self {
            timestamp,
            latitude,
            longitude,
            accuracy,
            uploaded: false,
        }
    }
}

// ============================================================================
// Storage Estimate
// ============================================================================

/// Quota usage as reported by the platform (bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageEstimate {
    pub usage: u64,
    pub quota: u64,
    /// 0-100
    pub percentage: f64,
    pub available: u64,
}

impl StorageEstimate {
    pub fn from_usage(usage: u64, quota: u64) -> Self {
        let percentage = if quota > 0 {
            usage as f64 / quota as f64 * 100.0
        } else {
            0.0
        };
        Self {
            usage,
            quota,
            percentage,
            available: quota.saturating_sub(usage),
        }
    }

    /// All-zero sentinel for platforms without quota introspection.
    pub fn unavailable() -> Self {
        Self::default()
    }
}
