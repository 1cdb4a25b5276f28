//! Tile and map metadata operations.

use std::collections::BTreeSet;

use log::{debug, info};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::TileStore;
use crate::error::{Result, TileCacheError};
use crate::tiles::TileCoord;
use crate::types::{
    MapBounds, MapMetadata, MapMetadataPatch, TileData, TileRecord, TilingScheme, now_millis,
};

const MAP_COLUMNS: &str = "id, name, min_zoom, max_zoom, bounds_south, bounds_west, bounds_north,
    bounds_east, tiling_scheme, tile_size, size_bytes, downloaded_at, last_accessed_at, pinned,
    used_by_routes";

fn scheme_to_sql(scheme: Option<TilingScheme>) -> Option<&'static str> {
    scheme.map(|s| match s {
        TilingScheme::Xyz => "xyz",
        TilingScheme::Tms => "tms",
    })
}

fn scheme_from_sql(value: Option<String>) -> Option<TilingScheme> {
    match value.as_deref() {
        Some("tms") => Some(TilingScheme::Tms),
        Some("xyz") => Some(TilingScheme::Xyz),
        _ => None,
    }
}

fn map_from_row(row: &Row<'_>) -> rusqlite::Result<MapMetadata> {
    let bounds = match (
        row.get::<_, Option<f64>>(4)?,
        row.get::<_, Option<f64>>(5)?,
        row.get::<_, Option<f64>>(6)?,
        row.get::<_, Option<f64>>(7)?,
    ) {
        (Some(south), Some(west), Some(north), Some(east)) => Some(MapBounds {
            south,
            west,
            north,
            east,
        }),
        _ => None,
    };

    let routes_json: String = row.get(14)?;
    let used_by_routes: BTreeSet<String> = serde_json::from_str(&routes_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(14, Type::Text, Box::new(e)))?;

    Ok(MapMetadata {
        id: row.get(0)?,
        name: row.get(1)?,
        min_zoom: row.get(2)?,
        max_zoom: row.get(3)?,
        bounds,
        tiling_scheme: scheme_from_sql(row.get(8)?),
        tile_size: row.get(9)?,
        size_bytes: row.get::<_, i64>(10)?.max(0) as u64,
        downloaded_at: row.get(11)?,
        last_accessed_at: row.get(12)?,
        pinned: row.get(13)?,
        used_by_routes,
    })
}

fn load_map(conn: &Connection, map_id: &str) -> Result<Option<MapMetadata>> {
    let sql = format!("SELECT {} FROM maps WHERE id = ?1", MAP_COLUMNS);
    let meta = conn
        .query_row(&sql, params![map_id], map_from_row)
        .optional()?;
    Ok(meta)
}

fn write_map(conn: &Connection, meta: &MapMetadata) -> Result<()> {
    let routes_json =
        serde_json::to_string(&meta.used_by_routes).map_err(TileCacheError::serialization)?;
    let bounds = meta.bounds;
    conn.execute(
        "INSERT OR REPLACE INTO maps (id, name, min_zoom, max_zoom, bounds_south, bounds_west,
            bounds_north, bounds_east, tiling_scheme, tile_size, size_bytes, downloaded_at,
            last_accessed_at, pinned, used_by_routes)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            meta.id,
            meta.name,
            meta.min_zoom,
            meta.max_zoom,
            bounds.map(|b| b.south),
            bounds.map(|b| b.west),
            bounds.map(|b| b.north),
            bounds.map(|b| b.east),
            scheme_to_sql(meta.tiling_scheme),
            meta.tile_size,
            meta.size_bytes as i64,
            meta.downloaded_at,
            meta.last_accessed_at,
            meta.pinned,
            routes_json,
        ],
    )?;
    Ok(())
}

impl TileStore {
    // ========================================================================
    // Tiles
    // ========================================================================

    /// Write a batch of tiles in one transaction. Existing tiles with the
    /// same key are replaced. Returns the number of tiles written.
    pub async fn put_tiles(&self, map_id: &str, tiles: Vec<TileData>) -> Result<usize> {
        if tiles.is_empty() {
            return Ok(0);
        }
        let map_id = map_id.to_string();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR REPLACE INTO tiles (key, map_id, z, x, y, data, content_type)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for tile in &tiles {
                    stmt.execute(params![
                        tile.coord.storage_key(&map_id),
                        map_id,
                        tile.coord.z,
                        tile.coord.x,
                        tile.coord.y,
                        tile.data,
                        tile.content_type,
                    ])?;
                }
            }
            tx.commit()?;
            debug!("[TileStore] Stored {} tiles for map {}", tiles.len(), map_id);
            Ok(tiles.len())
        })
        .await
    }

    /// Point lookup; `None` when the tile is not stored.
    pub async fn get_tile(&self, map_id: &str, z: u8, x: u32, y: u32) -> Result<Option<TileRecord>> {
        let map_id = map_id.to_string();
        let coord = TileCoord::new(z, x, y);

        self.with_conn(move |conn| {
            let tile = conn
                .query_row(
                    "SELECT data, content_type FROM tiles WHERE key = ?1",
                    params![coord.storage_key(&map_id)],
                    |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()?;

            Ok(tile.map(|(data, content_type)| TileRecord {
                map_id,
                coord,
                data,
                content_type,
            }))
        })
        .await
    }

    /// Whether any tile is stored for the map. Probes the map id index
    /// without reading payloads.
    pub async fn has_tiles_for_map(&self, map_id: &str) -> Result<bool> {
        let map_id = map_id.to_string();
        self.with_conn(move |conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM tiles WHERE map_id = ?1)",
                params![map_id],
                |row| row.get(0),
            )?;
            Ok(exists)
        })
        .await
    }

    pub async fn count_tiles_for_map(&self, map_id: &str) -> Result<u64> {
        let map_id = map_id.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM tiles WHERE map_id = ?1",
                params![map_id],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
    }

    /// Sum of payload sizes stored for the map.
    pub async fn get_map_size_bytes(&self, map_id: &str) -> Result<u64> {
        let map_id = map_id.to_string();
        self.with_conn(move |conn| {
            let size: i64 = conn.query_row(
                "SELECT COALESCE(SUM(LENGTH(data)), 0) FROM tiles WHERE map_id = ?1",
                params![map_id],
                |row| row.get(0),
            )?;
            Ok(size.max(0) as u64)
        })
        .await
    }

    /// Delete every tile of the map. Metadata is left alone.
    pub async fn clear_map(&self, map_id: &str) -> Result<usize> {
        let map_id = map_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let deleted = tx.execute("DELETE FROM tiles WHERE map_id = ?1", params![map_id])?;
            tx.commit()?;
            info!("[TileStore] Cleared {} tiles for map {}", deleted, map_id);
            Ok(deleted)
        })
        .await
    }

    /// Delete all tiles and all map metadata together (logout).
    pub async fn clear_all_maps(&self) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM tiles", [])?;
            tx.execute("DELETE FROM maps", [])?;
            tx.commit()?;
            info!("[TileStore] Cleared all maps");
            Ok(())
        })
        .await
    }

    // ========================================================================
    // Map Metadata
    // ========================================================================

    pub async fn save_map_metadata(&self, meta: MapMetadata) -> Result<()> {
        self.with_conn(move |conn| write_map(conn, &meta)).await
    }

    pub async fn get_map_metadata(&self, map_id: &str) -> Result<Option<MapMetadata>> {
        let map_id = map_id.to_string();
        self.with_conn(move |conn| load_map(conn, &map_id)).await
    }

    /// All maps, ordered by id.
    pub async fn get_map_metadata_list(&self) -> Result<Vec<MapMetadata>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM maps ORDER BY id", MAP_COLUMNS);
            let mut stmt = conn.prepare(&sql)?;
            let maps = stmt
                .query_map([], map_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(maps)
        })
        .await
    }

    /// Merge `patch` into the stored metadata. Returns `false` (and changes
    /// nothing) when the map does not exist.
    pub async fn update_map_metadata(&self, map_id: &str, patch: MapMetadataPatch) -> Result<bool> {
        self.modify_map_metadata(map_id, move |meta| patch.apply(meta))
            .await
    }

    /// Read-modify-write of one map's metadata in a single transaction.
    /// Returns `false` for unknown maps.
    pub async fn modify_map_metadata<F>(&self, map_id: &str, f: F) -> Result<bool>
    where
        F: FnOnce(&mut MapMetadata) + Send + 'static,
    {
        let map_id = map_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let Some(mut meta) = load_map(&tx, &map_id)? else {
                debug!("[TileStore] Metadata update for unknown map {} ignored", map_id);
                return Ok(false);
            };
            f(&mut meta);
            write_map(&tx, &meta)?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    /// Delete the map's tiles and its metadata in one transaction. The
    /// metadata row goes even when there are no tiles.
    pub async fn delete_map_with_metadata(&self, map_id: &str) -> Result<usize> {
        let map_id = map_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let tiles = tx.execute("DELETE FROM tiles WHERE map_id = ?1", params![map_id])?;
            tx.execute("DELETE FROM maps WHERE id = ?1", params![map_id])?;
            tx.commit()?;
            info!(
                "[TileStore] Deleted map {} with {} tiles",
                map_id, tiles
            );
            Ok(tiles)
        })
        .await
    }

    /// Set `last_accessed_at` to now. Returns `false` for unknown maps.
    pub async fn touch_map(&self, map_id: &str) -> Result<bool> {
        let map_id = map_id.to_string();
        let now = now_millis();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE maps SET last_accessed_at = ?1 WHERE id = ?2",
                params![now, map_id],
            )?;
            Ok(changed > 0)
        })
        .await
    }
}
