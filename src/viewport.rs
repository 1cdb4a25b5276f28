//! Map widget configuration derived from stored map metadata.

use serde::{Deserialize, Serialize};

use crate::tiles::{self, DEFAULT_TILE_SIZE, TileCoord};
use crate::types::{MapBounds, MapMetadata, TilingScheme};

/// Pan/zoom limits and tile layout for displaying one offline map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewportConfig {
    pub map_id: String,
    pub min_zoom: u8,
    pub max_zoom: u8,
    /// Panning is restricted to these bounds when known
    pub max_bounds: Option<MapBounds>,
    /// (lat, lng)
    pub center: Option<(f64, f64)>,
    pub tiling_scheme: TilingScheme,
    pub tile_size: u32,
}

/// Inclusive XYZ tile ranges at one zoom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileRange {
    pub zoom: u8,
    pub min_x: u32,
    pub max_x: u32,
    pub min_y: u32,
    pub max_y: u32,
}

impl TileRange {
    pub fn count(&self) -> u64 {
        (self.max_x - self.min_x + 1) as u64 * (self.max_y - self.min_y + 1) as u64
    }

    pub fn contains(&self, coord: TileCoord) -> bool {
        coord.z == self.zoom
            && (self.min_x..=self.max_x).contains(&coord.x)
            && (self.min_y..=self.max_y).contains(&coord.y)
    }

    /// Row-major iteration over every tile in the range.
    pub fn coords(&self) -> impl Iterator<Item = TileCoord> + '_ {
        (self.min_y..=self.max_y)
            .flat_map(move |y| (self.min_x..=self.max_x).map(move |x| TileCoord::new(self.zoom, x, y)))
    }
}

impl ViewportConfig {
    pub fn from_metadata(meta: &MapMetadata) -> Self {
        let max_bounds = meta.bounds.filter(MapBounds::is_valid);
        Self {
            map_id: meta.id.clone(),
            min_zoom: meta.min_zoom.min(meta.max_zoom),
            max_zoom: meta.max_zoom.max(meta.min_zoom),
            max_bounds,
            center: max_bounds.map(|b| b.center()),
            tiling_scheme: meta.tiling_scheme.unwrap_or(TilingScheme::Xyz),
            tile_size: meta.tile_size.unwrap_or(DEFAULT_TILE_SIZE),
        }
    }

    pub fn clamp_zoom(&self, zoom: u8) -> u8 {
        zoom.clamp(self.min_zoom, self.max_zoom)
    }

    /// Tiles covering `max_bounds` at `zoom` (clamped to the map's range).
    /// `None` when the bounds are unknown.
    pub fn tile_range(&self, zoom: u8) -> Option<TileRange> {
        let bounds = self.max_bounds?;
        let zoom = self.clamp_zoom(zoom);
        let north_west = tiles::tile_for_point(bounds.north, bounds.west, zoom);
        let south_east = tiles::tile_for_point(bounds.south, bounds.east, zoom);
        Some(TileRange {
            zoom,
            min_x: north_west.x.min(south_east.x),
            max_x: north_west.x.max(south_east.x),
            min_y: north_west.y.min(south_east.y),
            max_y: north_west.y.max(south_east.y),
        })
    }
}
