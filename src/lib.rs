//! # Trailcache
//!
//! Offline raster map cache for orienteering and trail apps.
//!
//! This library provides:
//! - A persistent tile / map metadata / session / GPS store (SQLite)
//! - A tile source that feeds a map widget from the store
//! - Whole-map bundle import from ZIP archives or local file trees
//! - Quota-aware LRU eviction with pinning
//!
//! ## Features
//!
//! - **`http`** - Download map archives from the backend (default)
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use trailcache::{MapImporter, MemoryArchiveSource, StoreConfig, TileSource, TileStore};
//!
//! # async fn run(archive: Vec<u8>) -> trailcache::Result<()> {
//! let store = Arc::new(TileStore::new(StoreConfig::with_path("tiles.db")));
//! store.open_or_upgrade().await?;
//!
//! let archives = MemoryArchiveSource::new();
//! archives.insert("sprint-2024", archive);
//! let importer = MapImporter::new(Arc::clone(&store), archives);
//! let summary = importer.download_map("sprint-2024", None).await?;
//! println!("{}", summary.status_message());
//!
//! let source = TileSource::for_map(Arc::clone(&store), "sprint-2024").await?;
//! let image = source.resolve_tile(15, 18_000, 11_000).await?;
//! println!("tile at {}", image.url());
//! # Ok(())
//! # }
//! ```

// Unified error handling
pub mod error;
pub use error::{Result, TileCacheError};

// Settings loaded from JSON
pub mod config;
pub use config::{HttpConfig, ImportConfig, StoragePolicy, StoreConfig, TileCacheConfig};

// Shared data model
pub mod types;
pub use types::{
    GpsTrackPoint, MapBounds, MapMetadata, MapMetadataPatch, ParticipantSession, PendingRequest,
    StorageEstimate, TileData, TileRecord, TilingScheme,
};

// Tile addressing and Web Mercator math
pub mod tiles;
pub use tiles::TileCoord;

// Versioned schema
pub mod migrations;

// Persistent store
pub mod store;
pub use store::{FixedQuota, QuotaProbe, QuotaReading, TileStore};

// Widget-facing tile source
pub mod source;
pub use source::{
    BlobUrlRegistry, ImageLoader, ObjectUrl, TileImage, TilePlaceholder, TileSource, TileState,
};

// Bundle import
pub mod importer;
pub use importer::{
    ArchiveSource, FileListItem, ImportCounts, ImportProgress, ImportSummary, MapHints,
    MapImporter, MemoryArchiveSource,
};

// Remote archive download
#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "http")]
pub use http::HttpArchiveSource;

// Quota-aware eviction
pub mod storage;
pub use storage::{MapSortKey, StorageInfo, StorageManager, WarningLevel, format_bytes};

// Widget viewport limits
pub mod viewport;
pub use viewport::{TileRange, ViewportConfig};
