//! GPS track point cache.

use rusqlite::{Row, params};

use super::TileStore;
use crate::error::Result;
use crate::types::GpsTrackPoint;

fn point_from_row(row: &Row<'_>) -> rusqlite::Result<GpsTrackPoint> {
    Ok(GpsTrackPoint {
        timestamp: row.get(0)?,
        latitude: row.get(1)?,
        longitude: row.get(2)?,
        accuracy: row.get(3)?,
        uploaded: row.get(4)?,
    })
}

impl TileStore {
    /// Insert a sample; a sample with the same timestamp is replaced.
    pub async fn save_gps_point(&self, point: GpsTrackPoint) -> Result<()> {
        self.save_gps_points(vec![point]).await.map(|_| ())
    }

    /// Insert several samples in one transaction.
    pub async fn save_gps_points(&self, points: Vec<GpsTrackPoint>) -> Result<usize> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR REPLACE INTO gps_tracks (timestamp, latitude, longitude, accuracy, uploaded)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for p in &points {
                    stmt.execute(params![p.timestamp, p.latitude, p.longitude, p.accuracy, p.uploaded])?;
                }
            }
            tx.commit()?;
            Ok(points.len())
        })
        .await
    }

    /// All samples, oldest first.
    pub async fn get_all_gps_points(&self) -> Result<Vec<GpsTrackPoint>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT timestamp, latitude, longitude, accuracy, uploaded
                 FROM gps_tracks ORDER BY timestamp",
            )?;
            let points = stmt
                .query_map([], point_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(points)
        })
        .await
    }

    /// Samples not yet acknowledged by the backend, oldest first.
    pub async fn get_pending_gps_points(&self) -> Result<Vec<GpsTrackPoint>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT timestamp, latitude, longitude, accuracy, uploaded
                 FROM gps_tracks WHERE uploaded = 0 ORDER BY timestamp",
            )?;
            let points = stmt
                .query_map([], point_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(points)
        })
        .await
    }

    /// Flip the upload flag after a successful batch upload. Returns the
    /// number of samples changed.
    pub async fn mark_gps_points_as_uploaded(&self, timestamps: Vec<i64>) -> Result<usize> {
        if timestamps.is_empty() {
            return Ok(0);
        }
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut changed = 0;
            {
                let mut stmt = tx.prepare_cached(
                    "UPDATE gps_tracks SET uploaded = 1 WHERE timestamp = ?1 AND uploaded = 0",
                )?;
                for ts in &timestamps {
                    changed += stmt.execute(params![ts])?;
                }
            }
            tx.commit()?;
            Ok(changed)
        })
        .await
    }

    /// Drop the local cache. Server-side data is unaffected.
    pub async fn clear_all_gps_points(&self) -> Result<usize> {
        self.with_conn(|conn| Ok(conn.execute("DELETE FROM gps_tracks", [])?))
            .await
    }

    pub async fn count_all_gps_points(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM gps_tracks", [], |row| row.get(0))?;
            Ok(count as u64)
        })
        .await
    }
}
