//! Unified error handling for the tile cache.
//!
//! Data absence (missing tile, missing metadata) is never an error at the
//! store layer; those surface as `Option`/empty results. The variants here
//! cover structural failures that callers must see.

use thiserror::Error;

/// Unified error type for tile cache operations.
#[derive(Debug, Error)]
pub enum TileCacheError {
    /// The database could not be opened (bad path, permission, corrupt file)
    #[error("Storage unavailable: {message}")]
    StorageUnavailable { message: String },

    /// SQL-level failure inside an operation or transaction
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A schema migration step failed
    #[error("Schema migration failed: {0}")]
    Migration(#[from] rusqlite_migration::Error),

    /// Point lookup miss, reported by the tile source to the widget
    #[error("Tile {map_id}/{z}/{x}/{y} not found")]
    TileNotFound {
        map_id: String,
        z: u8,
        x: u32,
        y: u32,
    },

    /// Network or decompression failure while importing a whole-map bundle
    #[error("Failed to fetch archive for map '{map_id}': {message}")]
    ArchiveFetchFailed { map_id: String, message: String },

    /// Encoding/decoding of a stored blob or JSON column failed
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Invalid configuration values
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A blocking store job panicked or was cancelled
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// The connection mutex was poisoned by a panicking job
    #[error("Store connection lock poisoned")]
    LockPoisoned,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TileCacheError {
    pub(crate) fn unavailable(message: impl Into<String>) -> Self {
        TileCacheError::StorageUnavailable {
            message: message.into(),
        }
    }

    pub(crate) fn serialization(err: impl std::fmt::Display) -> Self {
        TileCacheError::Serialization {
            message: err.to_string(),
        }
    }

    pub(crate) fn archive(map_id: &str, err: impl std::fmt::Display) -> Self {
        TileCacheError::ArchiveFetchFailed {
            map_id: map_id.to_string(),
            message: err.to_string(),
        }
    }

    /// Whether this is the recoverable missing-tile condition.
    pub fn is_tile_not_found(&self) -> bool {
        matches!(self, TileCacheError::TileNotFound { .. })
    }
}

/// Result type alias for tile cache operations.
pub type Result<T> = std::result::Result<T, TileCacheError>;
