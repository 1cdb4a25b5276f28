//! Tile addressing shared by the store, importer, tile source and viewport.
//!
//! Covers storage keys, TMS/XYZ row flipping, Web-Mercator tile math and
//! the `z/x/y.ext` path convention used inside map bundles.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::types::MapBounds;

/// Tile size in pixels when the map metadata does not say otherwise
pub const DEFAULT_TILE_SIZE: u32 = 256;

/// File extensions accepted as tiles inside a bundle archive
pub const TILE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "webp"];

/// Address of one tile in the zoom pyramid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileCoord {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    pub const fn new(z: u8, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    /// Key used in the `tiles` table: `mapId/z/x/y`.
    pub fn storage_key(&self, map_id: &str) -> String {
        format!("{}/{}/{}/{}", map_id, self.z, self.x, self.y)
    }

    /// Number of tiles along one axis at this zoom, `None` past zoom 31.
    pub fn axis_len(&self) -> Option<u32> {
        1u32.checked_shl(self.z as u32)
    }

    /// Whether x and y lie inside the grid for this zoom.
    pub fn in_grid(&self) -> bool {
        self.axis_len()
            .is_some_and(|n| self.x < n && self.y < n)
    }

    /// Convert between XYZ and TMS row numbering (the operation is its own
    /// inverse). `None` when the row is outside the grid.
    pub fn flip_y(&self) -> Option<Self> {
        let n = self.axis_len()?;
        let y = n.checked_sub(1)?.checked_sub(self.y)?;
        Some(Self { y, ..*self })
    }
}

impl std::fmt::Display for TileCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

// ============================================================================
// Web Mercator Math
// ============================================================================

/// Convert longitude to tile X coordinate at given zoom
#[inline]
pub fn lon_to_tile_x(lon: f64, zoom: u8) -> f64 {
    let n = 2.0_f64.powi(zoom as i32);
    (lon + 180.0) / 360.0 * n
}

/// Convert latitude to tile Y coordinate at given zoom
#[inline]
pub fn lat_to_tile_y(lat: f64, zoom: u8) -> f64 {
    let n = 2.0_f64.powi(zoom as i32);
    let lat_rad = lat.to_radians();
    (1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) / 2.0 * n
}

/// Convert tile X coordinate to longitude
#[inline]
pub fn tile_x_to_lon(x: f64, zoom: u8) -> f64 {
    let n = 2.0_f64.powi(zoom as i32);
    x / n * 360.0 - 180.0
}

/// Convert tile Y coordinate to latitude
#[inline]
pub fn tile_y_to_lat(y: f64, zoom: u8) -> f64 {
    let n = 2.0_f64.powi(zoom as i32);
    let lat_rad = (PI * (1.0 - 2.0 * y / n)).sinh().atan();
    lat_rad.to_degrees()
}

/// WGS84 bounds of an XYZ tile
pub fn tile_bounds(coord: TileCoord) -> MapBounds {
    MapBounds {
        west: tile_x_to_lon(coord.x as f64, coord.z),
        east: tile_x_to_lon((coord.x + 1) as f64, coord.z),
        north: tile_y_to_lat(coord.y as f64, coord.z), // Y grows southwards
        south: tile_y_to_lat((coord.y + 1) as f64, coord.z),
    }
}

/// Tile containing a WGS84 point at the given zoom, clamped to the grid.
pub fn tile_for_point(lat: f64, lon: f64, zoom: u8) -> TileCoord {
    let max_index = (2.0_f64.powi(zoom as i32) - 1.0).max(0.0);
    let x = lon_to_tile_x(lon, zoom).floor().clamp(0.0, max_index);
    let y = lat_to_tile_y(lat, zoom).floor().clamp(0.0, max_index);
    TileCoord::new(zoom, x as u32, y as u32)
}

// ============================================================================
// Bundle Paths
// ============================================================================

fn split_segments(path: &str) -> Vec<&str> {
    path.split(['/', '\\'])
        .filter(|segment| !segment.is_empty())
        .collect()
}

/// Parse `z`, `x` and `y.ext` segments. The extension is stripped from the
/// row before parsing; any non-integer segment rejects the whole entry.
fn parse_zxy(z: &str, x: &str, y_file: &str) -> Option<(TileCoord, Option<String>)> {
    let (y, ext) = match y_file.rsplit_once('.') {
        Some((stem, ext)) => (stem, Some(ext.to_ascii_lowercase())),
        None => (y_file, None),
    };

    let z: u8 = z.parse().ok()?;
    let x: u32 = x.parse().ok()?;
    let y: u32 = y.parse().ok()?;

    Some((TileCoord::new(z, x, y), ext))
}

/// Parse a bundle archive entry of the form `[<mapId>/]<z>/<x>/<y>.<ext>`.
///
/// The map id prefix is stripped when present; after that exactly three
/// segments must remain and the extension must be an image type from
/// [`TILE_EXTENSIONS`]. Returns the coordinate and lowercased extension.
pub fn parse_archive_path(path: &str, map_id: &str) -> Option<(TileCoord, String)> {
    let mut segments = split_segments(path);
    if segments.len() == 4 && segments[0] == map_id {
        segments.remove(0);
    }
    let [z, x, y_file] = segments.as_slice() else {
        return None;
    };

    let (coord, ext) = parse_zxy(z, x, y_file)?;
    let ext = ext.filter(|ext| TILE_EXTENSIONS.contains(&ext.as_str()))?;
    Some((coord, ext))
}

/// Parse a directory-import path. Only the last three segments are
/// interpreted; the extension (if any) is stripped and returned.
pub fn parse_tile_segments<S: AsRef<str>>(segments: &[S]) -> Option<(TileCoord, Option<String>)> {
    let [.., z, x, y_file] = segments else {
        return None;
    };
    parse_zxy(z.as_ref(), x.as_ref(), y_file.as_ref())
}

/// MIME type of a tile payload: sniffed from the bytes, falling back to the
/// file extension.
pub fn content_type_for(ext: Option<&str>, bytes: &[u8]) -> String {
    if let Ok(format) = image::guess_format(bytes) {
        return format.to_mime_type().to_string();
    }
    match ext.map(|e| e.to_ascii_lowercase()).as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
    .to_string()
}
