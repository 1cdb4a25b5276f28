//! # Tile Store
//!
//! SQLite-backed persistent store for the offline map cache. Four tables:
//!
//! - `tiles`: raster tile blobs keyed by `mapId/z/x/y`, indexed by map id
//! - `maps`: one metadata row per downloaded map
//! - `session`: the participant session snapshot (single row)
//! - `gps_tracks`: GPS samples keyed by timestamp, indexed by upload flag
//!
//! The API is async. rusqlite is synchronous, so each operation runs its
//! SQL on the blocking pool against one connection guarded by a mutex.
//! Multi-row writes use one transaction per call, which makes a batch
//! visible to readers all at once or not at all.
//!
//! The database is opened lazily on first use. All concurrent first users
//! await the same initialisation, so migrations run exactly once.

mod gps;
mod session;
mod tiles;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, warn};
use rusqlite::Connection;
use tokio::sync::OnceCell;

use crate::config::StoreConfig;
use crate::error::{Result, TileCacheError};
use crate::migrations;
use crate::types::StorageEstimate;

// ============================================================================
// Quota Probe
// ============================================================================

/// Raw usage/quota pair in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaReading {
    pub usage: u64,
    pub quota: u64,
}

/// Platform storage-quota introspection. `None` means the platform cannot
/// tell, which degrades to an all-zero estimate.
pub trait QuotaProbe: Send + Sync {
    fn probe(&self) -> Option<QuotaReading>;
}

/// Quota probe with values set by the host (or by tests).
#[derive(Debug, Default)]
pub struct FixedQuota {
    usage: AtomicU64,
    quota: AtomicU64,
}

impl FixedQuota {
    pub fn new(usage: u64, quota: u64) -> Self {
        Self {
            usage: AtomicU64::new(usage),
            quota: AtomicU64::new(quota),
        }
    }

    pub fn set_usage(&self, usage: u64) {
        self.usage.store(usage, Ordering::Relaxed);
    }
}

impl QuotaProbe for FixedQuota {
    fn probe(&self) -> Option<QuotaReading> {
        Some(QuotaReading {
            usage: self.usage.load(Ordering::Relaxed),
            quota: self.quota.load(Ordering::Relaxed),
        })
    }
}

// ============================================================================
// Store
// ============================================================================

/// Persistent tile/metadata/session/GPS store.
///
/// Construct once in the composition root and share as `Arc<TileStore>`.
pub struct TileStore {
    config: StoreConfig,
    conn: OnceCell<Arc<Mutex<Connection>>>,
    quota_probe: Option<Arc<dyn QuotaProbe>>,
}

impl TileStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            conn: OnceCell::new(),
            quota_probe: None,
        }
    }

    /// In-memory store (for testing).
    pub fn in_memory() -> Self {
        Self::new(StoreConfig::in_memory())
    }

    /// Install a platform quota probe for `get_storage_estimate`.
    pub fn with_quota_probe(mut self, probe: Arc<dyn QuotaProbe>) -> Self {
        self.quota_probe = Some(probe);
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Open the database and bring its schema up to date.
    ///
    /// Idempotent: later calls return immediately, concurrent calls wait
    /// for the first one.
    pub async fn open_or_upgrade(&self) -> Result<()> {
        self.connection().await.map(|_| ())
    }

    async fn connection(&self) -> Result<Arc<Mutex<Connection>>> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let config = self.config.clone();
                let conn = tokio::task::spawn_blocking(move || open_database(&config)).await??;
                Ok::<_, TileCacheError>(Arc::new(Mutex::new(conn)))
            })
            .await?;
        Ok(Arc::clone(conn))
    }

    /// Run `f` against the connection on the blocking pool.
    pub(crate) async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.connection().await?;
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| TileCacheError::LockPoisoned)?;
            f(&mut guard)
        })
        .await?
    }

    /// Schema version recorded in the database.
    pub async fn schema_version(&self) -> Result<i64> {
        self.with_conn(|conn| migrations::stored_version(conn)).await
    }

    /// Storage usage and quota.
    ///
    /// Uses the installed [`QuotaProbe`]; without one, measures the
    /// database against `StoreConfig::quota_bytes`; without either, returns
    /// the all-zero estimate. Never fails.
    pub async fn get_storage_estimate(&self) -> StorageEstimate {
        if let Some(probe) = &self.quota_probe {
            return match probe.probe() {
                Some(reading) => StorageEstimate::from_usage(reading.usage, reading.quota),
                None => StorageEstimate::unavailable(),
            };
        }

        let Some(quota) = self.config.quota_bytes else {
            return StorageEstimate::unavailable();
        };

        match self.with_conn(|conn| database_size(conn)).await {
            Ok(usage) => StorageEstimate::from_usage(usage, quota),
            Err(e) => {
                warn!("[TileStore] Storage estimate unavailable: {}", e);
                StorageEstimate::unavailable()
            }
        }
    }
}

/// Bytes held by live pages (free pages are not counted).
fn database_size(conn: &Connection) -> Result<u64> {
    let page_count: i64 = conn.pragma_query_value(None, "page_count", |row| row.get(0))?;
    let freelist: i64 = conn.pragma_query_value(None, "freelist_count", |row| row.get(0))?;
    let page_size: i64 = conn.pragma_query_value(None, "page_size", |row| row.get(0))?;
    Ok((page_count - freelist).max(0) as u64 * page_size.max(0) as u64)
}

fn open_database(config: &StoreConfig) -> Result<Connection> {
    let path = config.db_path.display().to_string();

    let mut conn = if config.is_in_memory() {
        Connection::open_in_memory()
    } else {
        Connection::open(&config.db_path)
    }
    .map_err(|e| TileCacheError::unavailable(format!("Cannot open {}: {}", path, e)))?;

    // Fails here for unreadable or non-database files
    conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| {
        row.get::<_, i64>(0)
    })
    .map_err(|e| TileCacheError::unavailable(format!("Cannot read {}: {}", path, e)))?;

    if !config.is_in_memory() {
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
    }
    conn.busy_timeout(Duration::from_secs(5))?;

    let before = migrations::apply(&mut conn)?;
    info!(
        "[TileStore] Opened {} (schema v{} -> v{})",
        path,
        before,
        migrations::SCHEMA_VERSION
    );

    Ok(conn)
}
