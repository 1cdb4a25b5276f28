//! Schema migrations.
//!
//! The schema version lives in `PRAGMA user_version`. Steps are applied in
//! order from the stored version to [`SCHEMA_VERSION`]; each step only
//! touches the tables it names. Step 4 is the one breaking change: the GPS
//! track table is dropped and recreated, so GPS rows from databases below
//! [`GPS_BREAKING_VERSION`] are discarded while tiles and maps survive.

use log::{info, warn};
use rusqlite::{Connection, params};
use rusqlite_migration::{M, Migrations};

use crate::error::Result;

/// Latest schema version
pub const SCHEMA_VERSION: i64 = 5;

/// GPS rows stored below this version are discarded on upgrade
pub const GPS_BREAKING_VERSION: i64 = 4;

/// v1: tiles keyed by `mapId/z/x/y` plus per-map metadata
const V1_TILES_AND_MAPS: &str = r#"
    CREATE TABLE IF NOT EXISTS tiles (
        key TEXT PRIMARY KEY,
        map_id TEXT NOT NULL,
        z INTEGER NOT NULL,
        x INTEGER NOT NULL,
        y INTEGER NOT NULL,
        data BLOB NOT NULL,
        content_type TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_tiles_map_id ON tiles(map_id);

    CREATE TABLE IF NOT EXISTS maps (
        id TEXT PRIMARY KEY,
        name TEXT,
        min_zoom INTEGER NOT NULL,
        max_zoom INTEGER NOT NULL,
        bounds_south REAL,
        bounds_west REAL,
        bounds_north REAL,
        bounds_east REAL,
        size_bytes INTEGER NOT NULL DEFAULT 0,
        downloaded_at INTEGER NOT NULL,
        last_accessed_at INTEGER,
        pinned INTEGER NOT NULL DEFAULT 0,
        used_by_routes TEXT NOT NULL DEFAULT '[]'
    );
"#;

/// v2: participant session snapshot (single row, id = 1)
const V2_SESSION: &str = r#"
    CREATE TABLE IF NOT EXISTS session (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        data BLOB NOT NULL,
        updated_at INTEGER NOT NULL
    );
"#;

/// v3: first GPS track table (no upload tracking)
const V3_GPS_LEGACY: &str = r#"
    CREATE TABLE IF NOT EXISTS gps_tracks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp INTEGER NOT NULL,
        lat REAL NOT NULL,
        lng REAL NOT NULL
    );
"#;

/// v4: GPS points keyed by timestamp with an upload flag
const V4_GPS_TRACKS: &str = r#"
    DROP TABLE IF EXISTS gps_tracks;
    CREATE TABLE gps_tracks (
        timestamp INTEGER PRIMARY KEY,
        latitude REAL NOT NULL,
        longitude REAL NOT NULL,
        accuracy REAL NOT NULL,
        uploaded INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_gps_tracks_uploaded ON gps_tracks(uploaded);
"#;

/// v5: tiling scheme and tile size on maps
const V5_MAP_TILING: &str = r#"
    ALTER TABLE maps ADD COLUMN tiling_scheme TEXT;
    ALTER TABLE maps ADD COLUMN tile_size INTEGER;
"#;

/// Current shape of every required table, used to recreate a table that
/// went missing while the version number says it should exist.
const REQUIRED_TABLES: [(&str, &str); 4] = [
    (
        "tiles",
        r#"
        CREATE TABLE IF NOT EXISTS tiles (
            key TEXT PRIMARY KEY,
            map_id TEXT NOT NULL,
            z INTEGER NOT NULL,
            x INTEGER NOT NULL,
            y INTEGER NOT NULL,
            data BLOB NOT NULL,
            content_type TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tiles_map_id ON tiles(map_id);
        "#,
    ),
    (
        "maps",
        r#"
        CREATE TABLE IF NOT EXISTS maps (
            id TEXT PRIMARY KEY,
            name TEXT,
            min_zoom INTEGER NOT NULL,
            max_zoom INTEGER NOT NULL,
            bounds_south REAL,
            bounds_west REAL,
            bounds_north REAL,
            bounds_east REAL,
            size_bytes INTEGER NOT NULL DEFAULT 0,
            downloaded_at INTEGER NOT NULL,
            last_accessed_at INTEGER,
            pinned INTEGER NOT NULL DEFAULT 0,
            used_by_routes TEXT NOT NULL DEFAULT '[]',
            tiling_scheme TEXT,
            tile_size INTEGER
        );
        "#,
    ),
    ("session", V2_SESSION),
    (
        "gps_tracks",
        r#"
        CREATE TABLE IF NOT EXISTS gps_tracks (
            timestamp INTEGER PRIMARY KEY,
            latitude REAL NOT NULL,
            longitude REAL NOT NULL,
            accuracy REAL NOT NULL,
            uploaded INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_gps_tracks_uploaded ON gps_tracks(uploaded);
        "#,
    ),
];

/// Tables an intermediate version already has, with the DDL of the step that
/// introduced them. Used before upgrading so a later step never alters a
/// table that is gone.
const HISTORICAL_TABLES: [(&str, i64, &str); 3] = [
    ("tiles", 1, V1_TILES_AND_MAPS),
    ("maps", 1, V1_TILES_AND_MAPS),
    ("session", 2, V2_SESSION),
];

/// Ordered migration steps; step `n` (1-based) produces schema version `n`.
pub(crate) fn steps() -> Vec<M<'static>> {
    vec![
        M::up(V1_TILES_AND_MAPS),
        M::up(V2_SESSION),
        M::up(V3_GPS_LEGACY),
        M::up(V4_GPS_TRACKS),
        M::up(V5_MAP_TILING),
    ]
}

pub fn migrations() -> Migrations<'static> {
    Migrations::new(steps())
}

/// Stored schema version (0 for a fresh database).
pub fn stored_version(conn: &Connection) -> Result<i64> {
    let version = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Recreate any required table that is missing. Returns the names created.
fn repair_missing_tables(conn: &Connection) -> Result<Vec<&'static str>> {
    let mut repaired = Vec::new();
    for (name, ddl) in REQUIRED_TABLES {
        if !table_exists(conn, name)? {
            warn!("[Migrations] Table '{}' missing at current version, recreating", name);
            conn.execute_batch(ddl)?;
            repaired.push(name);
        }
    }
    Ok(repaired)
}

/// Recreate tables that `version` should already contain, in the shape they
/// had at that version, so the remaining steps apply on top of them.
fn repair_before_upgrade(conn: &Connection, version: i64) -> Result<Vec<&'static str>> {
    let mut repaired = Vec::new();
    for (name, since, ddl) in HISTORICAL_TABLES {
        if version >= since && !table_exists(conn, name)? {
            warn!("[Migrations] Table '{}' missing at v{}, recreating before upgrade", name, version);
            conn.execute_batch(ddl)?;
            repaired.push(name);
        }
    }
    Ok(repaired)
}

/// Bring the database to [`SCHEMA_VERSION`]. Returns the version found
/// before upgrading.
pub fn apply(conn: &mut Connection) -> Result<i64> {
    let before = stored_version(conn)?;

    if before < SCHEMA_VERSION {
        info!(
            "[Migrations] Upgrading schema from v{} to v{}",
            before, SCHEMA_VERSION
        );
        if before > 0 && before < GPS_BREAKING_VERSION {
            info!("[Migrations] GPS track table predates v{}, its rows will be discarded", GPS_BREAKING_VERSION);
        }
        if before > 0 {
            repair_before_upgrade(conn, before)?;
        }
        migrations().to_latest(conn)?;
    }

    repair_missing_tables(conn)?;

    Ok(before)
}
