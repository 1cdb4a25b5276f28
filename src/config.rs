//! Runtime configuration.
//!
//! Every section has sensible defaults, so an embedding app only needs to
//! supply the values it cares about (usually just the database path).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TileCacheError};

/// Path understood as "keep the database in memory"
pub const IN_MEMORY_PATH: &str = ":memory:";

/// Persistent store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    /// SQLite database file, or `:memory:`
    pub db_path: PathBuf,
    /// Storage ceiling to report when no platform quota probe is installed
    pub quota_bytes: Option<u64>,
    /// Recently resolved tiles kept in memory per tile source
    pub tile_cache_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("tile-cache.db"),
            quota_bytes: None,
            tile_cache_capacity: 256,
        }
    }
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self {
            db_path: PathBuf::from(IN_MEMORY_PATH),
            ..Self::default()
        }
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: path.into(),
            ..Self::default()
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.db_path.as_os_str() == IN_MEMORY_PATH
    }
}

/// Bundle import settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImportConfig {
    /// Tiles per `put_tiles` transaction
    pub batch_size: usize,
    /// Concurrent file reads during a file-list import
    pub read_concurrency: usize,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            read_concurrency: 8,
        }
    }
}

/// Quota thresholds, as percentages of the quota.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoragePolicy {
    pub warning_percent: f64,
    pub critical_percent: f64,
    /// Auto-cleanup frees space until usage is at or below this
    pub cleanup_target_percent: f64,
}

impl Default for StoragePolicy {
    fn default() -> Self {
        Self {
            warning_percent: 70.0,
            critical_percent: 90.0,
            cleanup_target_percent: 60.0,
        }
    }
}

/// Remote archive endpoint settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpConfig {
    pub base_url: String,
    /// Path appended to `base_url`; `{map_id}` is substituted
    pub archive_path: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            archive_path: "/api/maps/{map_id}/tiles.zip".to_string(),
            timeout_secs: 120,
            max_retries: 3,
        }
    }
}

impl HttpConfig {
    pub fn archive_url(&self, map_id: &str) -> String {
        format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            self.archive_path.replace("{map_id}", map_id)
        )
    }
}

/// All sections together, as loaded from a JSON settings file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TileCacheConfig {
    pub store: StoreConfig,
    pub import: ImportConfig,
    pub storage: StoragePolicy,
    pub http: HttpConfig,
}

impl TileCacheConfig {
    /// Parse and validate a JSON document; missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| TileCacheError::Config {
            message: format!("Invalid config JSON: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |message: &str| {
            Err(TileCacheError::Config {
                message: message.to_string(),
            })
        };

        if self.import.batch_size == 0 {
            return fail("import.batchSize must be at least 1");
        }
        if self.import.read_concurrency == 0 {
            return fail("import.readConcurrency must be at least 1");
        }
        let policy = &self.storage;
        let in_range = |p: f64| (0.0..=100.0).contains(&p);
        if !in_range(policy.warning_percent)
            || !in_range(policy.critical_percent)
            || !in_range(policy.cleanup_target_percent)
        {
            return fail("storage thresholds must be between 0 and 100");
        }
        if policy.warning_percent > policy.critical_percent {
            return fail("storage.warningPercent must not exceed criticalPercent");
        }
        if !self.http.archive_path.contains("{map_id}") {
            return fail("http.archivePath must contain {map_id}");
        }
        Ok(())
    }
}
