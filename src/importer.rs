//! Map bundle import.
//!
//! Populates the store with a whole map's tiles, either from a ZIP archive
//! fetched by map id (see [`ArchiveSource`]) or from a list of files picked
//! locally. Both paths:
//! - parse `z/x/y.ext` addressing and skip anything else,
//! - write tiles in batches of `ImportConfig::batch_size`, yielding to the
//!   scheduler between batches,
//! - record map metadata once all batches are written.
//!
//! Downloads are idempotent per map id: once any tile exists, the archive is
//! never fetched again (only `last_accessed_at` is bumped). Imports of the
//! same map id within one process are serialized.

use std::collections::HashMap;
use std::future::Future;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;
use zip::ZipArchive;

use crate::config::ImportConfig;
use crate::error::{Result, TileCacheError};
use crate::store::TileStore;
use crate::tiles::{self, TileCoord};
use crate::types::{MapBounds, MapMetadata, TileData, TilingScheme};

// ============================================================================
// Archive Sources
// ============================================================================

/// Where map archives come from.
pub trait ArchiveSource: Send + Sync {
    /// Fetch the complete ZIP archive for `map_id`. Failures should be
    /// reported as [`TileCacheError::ArchiveFetchFailed`].
    fn fetch_archive(&self, map_id: &str) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

/// Archives held in memory (bundled maps, tests).
#[derive(Debug, Default)]
pub struct MemoryArchiveSource {
    archives: Mutex<HashMap<String, Vec<u8>>>,
    fetches: AtomicUsize,
}

impl MemoryArchiveSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, map_id: impl Into<String>, archive: Vec<u8>) {
        if let Ok(mut archives) = self.archives.lock() {
            archives.insert(map_id.into(), archive);
        }
    }

    /// Number of `fetch_archive` calls so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }
}

impl ArchiveSource for MemoryArchiveSource {
    async fn fetch_archive(&self, map_id: &str) -> Result<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        self.archives
            .lock()
            .map_err(|_| TileCacheError::LockPoisoned)?
            .get(map_id)
            .cloned()
            .ok_or_else(|| TileCacheError::archive(map_id, "no archive for this map"))
    }
}

// ============================================================================
// File Lists
// ============================================================================

type ReadFn = Box<dyn FnOnce() -> BoxFuture<'static, std::io::Result<Vec<u8>>> + Send>;

/// One file of a locally picked tile tree: its path segments plus a lazy
/// reader for the content.
pub struct FileListItem {
    segments: Vec<String>,
    read: ReadFn,
}

impl std::fmt::Debug for FileListItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileListItem")
            .field("segments", &self.segments)
            .finish_non_exhaustive()
    }
}

impl FileListItem {
    pub fn new<F, Fut>(segments: Vec<String>, read: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::io::Result<Vec<u8>>> + Send + 'static,
    {
        Self {
            segments,
            read: Box::new(move || read().boxed()),
        }
    }

    /// Item whose content is already in memory.
    pub fn from_bytes(path: &str, data: Vec<u8>) -> Self {
        let segments = path.split('/').map(str::to_string).collect();
        Self::new(segments, move || async move { Ok(data) })
    }

    /// Item read from disk when imported.
    pub fn from_path(segments: Vec<String>, path: PathBuf) -> Self {
        Self::new(segments, move || tokio::fs::read(path))
    }

    /// Enumerate every file below `root`. Segments are relative to `root`.
    pub fn from_directory(root: &Path) -> Result<Vec<Self>> {
        let mut items = Vec::new();
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            let segments = relative
                .iter()
                .map(|part| part.to_string_lossy().to_string())
                .collect();
            items.push(Self::from_path(segments, entry.path().to_path_buf()));
        }
        Ok(items)
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    fn display_path(&self) -> String {
        self.segments.join("/")
    }
}

// ============================================================================
// Progress & Results
// ============================================================================

/// Live counters for one map's import. Single writer (the import holding
/// that map's lock), any number of readers.
#[derive(Debug, Default)]
pub struct ImportProgress {
    total: AtomicU32,
    imported: AtomicU32,
    skipped: AtomicU32,
    errors: AtomicU32,
    active: AtomicBool,
}

/// Point-in-time copy of [`ImportProgress`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportCounts {
    pub total: u32,
    pub imported: u32,
    pub skipped: u32,
    pub errors: u32,
    pub active: bool,
}

impl ImportProgress {
    fn start(&self, total: u32) {
        self.total.store(total, Ordering::Relaxed);
        self.imported.store(0, Ordering::Relaxed);
        self.skipped.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.active.store(true, Ordering::Relaxed);
    }

    fn finish(&self) {
        self.active.store(false, Ordering::Relaxed);
    }

    fn add_total(&self, n: u32) {
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    fn add_imported(&self, n: usize) {
        self.imported.fetch_add(n as u32, Ordering::Relaxed);
    }

    fn add_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    fn add_errors(&self, n: usize) {
        self.errors.fetch_add(n as u32, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ImportCounts {
        ImportCounts {
            total: self.total.load(Ordering::Relaxed),
            imported: self.imported.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of one import call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub map_id: String,
    /// Files seen (archive entries or list items), directories excluded
    pub total_candidates: u32,
    pub imported: u32,
    /// Entries whose path is not a tile address
    pub skipped: u32,
    /// Entries that could not be read or written
    pub errors: u32,
    pub size_bytes: u64,
    /// The map was already stored; nothing was fetched
    pub already_cached: bool,
}

impl ImportSummary {
    /// User-facing status line.
    pub fn status_message(&self) -> String {
        if self.already_cached {
            return format!("Map {} is already available offline", self.map_id);
        }
        format!(
            "Imported {} of {} tiles for map {} ({} skipped, {} errors)",
            self.imported, self.total_candidates, self.map_id, self.skipped, self.errors
        )
    }
}

/// Caller-supplied metadata for the map being imported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MapHints {
    pub name: Option<String>,
    pub min_zoom: Option<u8>,
    pub max_zoom: Option<u8>,
    pub bounds: Option<MapBounds>,
    pub tiling_scheme: Option<TilingScheme>,
    pub tile_size: Option<u32>,
}

/// Zoom range and deepest-level tile extent seen during an import.
#[derive(Debug, Default)]
struct TileExtent {
    min_zoom: Option<u8>,
    max_zoom: Option<u8>,
    /// (min_x, max_x, min_y, max_y) at `max_zoom`
    span: Option<(u32, u32, u32, u32)>,
}

impl TileExtent {
    fn include(&mut self, coord: TileCoord) {
        self.min_zoom = Some(self.min_zoom.map_or(coord.z, |z| z.min(coord.z)));
        match self.max_zoom {
            Some(z) if z > coord.z => {}
            Some(z) if z == coord.z => {
                if let Some((x0, x1, y0, y1)) = self.span {
                    self.span = Some((
                        x0.min(coord.x),
                        x1.max(coord.x),
                        y0.min(coord.y),
                        y1.max(coord.y),
                    ));
                }
            }
            _ => {
                self.max_zoom = Some(coord.z);
                self.span = Some((coord.x, coord.x, coord.y, coord.y));
            }
        }
    }

    /// Geographic bounds covered at the deepest zoom.
    fn bounds(&self, tms: bool) -> Option<MapBounds> {
        let z = self.max_zoom?;
        let (x0, x1, mut y0, mut y1) = self.span?;
        if tms {
            let flip = |y| TileCoord::new(z, 0, y).flip_y().map(|c| c.y);
            (y0, y1) = (flip(y1)?, flip(y0)?);
        }
        let top_left = tiles::tile_bounds(TileCoord::new(z, x0, y0));
        let bottom_right = tiles::tile_bounds(TileCoord::new(z, x1, y1));
        let bounds = MapBounds {
            south: bottom_right.south,
            west: top_left.west,
            north: top_left.north,
            east: bottom_right.east,
        };
        bounds.is_valid().then_some(bounds)
    }
}

fn build_metadata(map_id: &str, hints: &MapHints, extent: &TileExtent, size_bytes: u64) -> MapMetadata {
    let tms = hints.tiling_scheme == Some(TilingScheme::Tms);
    let mut meta = MapMetadata::new(
        map_id,
        hints.min_zoom.or(extent.min_zoom).unwrap_or(0),
        hints.max_zoom.or(extent.max_zoom).unwrap_or(0),
    );
    meta.name = hints.name.clone();
    meta.bounds = hints
        .bounds
        .filter(MapBounds::is_valid)
        .or_else(|| extent.bounds(tms));
    meta.tiling_scheme = hints.tiling_scheme;
    meta.tile_size = hints.tile_size;
    meta.size_bytes = size_bytes;
    meta
}

/// Upper bound on the buffer reserved up front for one archive entry.
const MAX_ENTRY_CAPACITY_HINT: u64 = 1 << 20;

/// Capacity to reserve for an entry whose header declares `declared` bytes.
fn capacity_hint(declared: u64) -> usize {
    declared.min(MAX_ENTRY_CAPACITY_HINT) as usize
}

enum FileOutcome {
    Tile(TileData),
    Skipped(String),
    ReadFailed(String, std::io::Error),
}

// ============================================================================
// Importer
// ============================================================================

/// Imports map bundles into a [`TileStore`].
pub struct MapImporter<S> {
    store: Arc<TileStore>,
    source: S,
    config: ImportConfig,
    progress: Mutex<HashMap<String, Arc<ImportProgress>>>,
    map_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl<S: ArchiveSource> MapImporter<S> {
    pub fn new(store: Arc<TileStore>, source: S) -> Self {
        Self::with_config(store, source, ImportConfig::default())
    }

    pub fn with_config(store: Arc<TileStore>, source: S, config: ImportConfig) -> Self {
        Self {
            store,
            source,
            config,
            progress: Mutex::new(HashMap::new()),
            map_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Counters of the import running for `map_id`, or of its last one.
    /// `None` if this importer never imported the map.
    pub fn progress(&self, map_id: &str) -> Option<Arc<ImportProgress>> {
        let progress = self.progress.lock().ok()?;
        progress.get(map_id).cloned()
    }

    fn progress_for(&self, map_id: &str) -> Result<Arc<ImportProgress>> {
        let mut progress = self.progress.lock().map_err(|_| TileCacheError::LockPoisoned)?;
        Ok(Arc::clone(progress.entry(map_id.to_string()).or_default()))
    }

    fn map_lock(&self, map_id: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self.map_locks.lock().map_err(|_| TileCacheError::LockPoisoned)?;
        Ok(Arc::clone(locks.entry(map_id.to_string()).or_default()))
    }

    fn batch_size(&self) -> usize {
        self.config.batch_size.max(1)
    }

    /// Download and store the archive for `map_id` unless the map is
    /// already stored.
    ///
    /// Fetch and decompression failures abort with
    /// [`TileCacheError::ArchiveFetchFailed`]; batches written before the
    /// failure stay in the store.
    pub async fn download_map(&self, map_id: &str, hints: Option<MapHints>) -> Result<ImportSummary> {
        let lock = self.map_lock(map_id)?;
        let _guard = lock.lock().await;

        if self.store.has_tiles_for_map(map_id).await? {
            self.store.touch_map(map_id).await?;
            let size_bytes = self
                .store
                .get_map_metadata(map_id)
                .await?
                .map_or(0, |meta| meta.size_bytes);
            info!("[MapImporter] Map {} already downloaded, skipping", map_id);
            return Ok(ImportSummary {
                map_id: map_id.to_string(),
                size_bytes,
                already_cached: true,
                ..ImportSummary::default()
            });
        }

        let progress = self.progress_for(map_id)?;
        progress.start(0);
        let result = self
            .download_archive(map_id, hints.unwrap_or_default(), &progress)
            .await;
        progress.finish();

        match &result {
            Ok(summary) => info!("[MapImporter] {}", summary.status_message()),
            Err(e) => warn!("[MapImporter] Download of map {} failed: {}", map_id, e),
        }
        result
    }

    async fn download_archive(
        &self,
        map_id: &str,
        hints: MapHints,
        progress: &ImportProgress,
    ) -> Result<ImportSummary> {
        let bytes = self.source.fetch_archive(map_id).await.map_err(|e| match e {
            e @ TileCacheError::ArchiveFetchFailed { .. } => e,
            other => TileCacheError::archive(map_id, other),
        })?;
        debug!(
            "[MapImporter] Fetched {} KB archive for map {}",
            bytes.len() / 1024,
            map_id
        );

        let mut archive =
            ZipArchive::new(Cursor::new(bytes)).map_err(|e| TileCacheError::archive(map_id, e))?;

        let mut summary = ImportSummary {
            map_id: map_id.to_string(),
            ..ImportSummary::default()
        };
        let mut extent = TileExtent::default();
        let mut batch: Vec<TileData> = Vec::with_capacity(self.batch_size());

        for index in 0..archive.len() {
            let tile = {
                let mut entry = archive
                    .by_index(index)
                    .map_err(|e| TileCacheError::archive(map_id, e))?;
                if entry.is_dir() {
                    continue;
                }
                summary.total_candidates += 1;
                progress.add_total(1);

                let Some((coord, ext)) = tiles::parse_archive_path(entry.name(), map_id) else {
                    debug!("[MapImporter] Skipping non-tile entry {}", entry.name());
                    summary.skipped += 1;
                    progress.add_skipped();
                    continue;
                };

                let mut data = Vec::with_capacity(capacity_hint(entry.size()));
                entry
                    .read_to_end(&mut data)
                    .map_err(|e| TileCacheError::archive(map_id, e))?;
                let content_type = tiles::content_type_for(Some(ext.as_str()), &data);
                TileData::new(coord, data, content_type)
            };

            extent.include(tile.coord);
            batch.push(tile);

            if batch.len() >= self.batch_size() {
                summary.imported += self.flush(map_id, &mut batch, progress).await? as u32;
                tokio::task::yield_now().await;
            }
        }
        summary.imported += self.flush(map_id, &mut batch, progress).await? as u32;
        // Entries that resolve to the same key overwrite each other
        summary.size_bytes = self.store.get_map_size_bytes(map_id).await?;

        if summary.imported == 0 {
            warn!("[MapImporter] Archive for map {} contained no tiles", map_id);
        }

        let meta = build_metadata(map_id, &hints, &extent, summary.size_bytes);
        self.store.save_map_metadata(meta).await?;

        Ok(summary)
    }

    /// Write and empty the pending batch; store errors are fatal here.
    async fn flush(
        &self,
        map_id: &str,
        batch: &mut Vec<TileData>,
        progress: &ImportProgress,
    ) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let tiles = std::mem::take(batch);
        let written = self.store.put_tiles(map_id, tiles).await?;
        progress.add_imported(written);
        Ok(written)
    }

    /// Import a locally picked tile tree.
    ///
    /// Only the last three path segments address a tile. Unparseable paths
    /// are skipped; unreadable files and failed batch writes are counted as
    /// errors and the import carries on.
    pub async fn import_from_file_list(
        &self,
        map_id: &str,
        items: Vec<FileListItem>,
        hints: Option<MapHints>,
    ) -> Result<ImportSummary> {
        let lock = self.map_lock(map_id)?;
        let _guard = lock.lock().await;

        let hints = hints.unwrap_or_default();
        let mut summary = ImportSummary {
            map_id: map_id.to_string(),
            total_candidates: items.len() as u32,
            ..ImportSummary::default()
        };
        let progress = self.progress_for(map_id)?;
        progress.start(summary.total_candidates);
        info!(
            "[MapImporter] Importing {} files for map {}",
            items.len(),
            map_id
        );

        let mut outcomes = stream::iter(items)
            .map(|item| async move {
                let path = item.display_path();
                let Some((coord, ext)) = tiles::parse_tile_segments(&item.segments[..]) else {
                    return FileOutcome::Skipped(path);
                };
                match (item.read)().await {
                    Ok(data) => {
                        let content_type = tiles::content_type_for(ext.as_deref(), &data);
                        FileOutcome::Tile(TileData::new(coord, data, content_type))
                    }
                    Err(e) => FileOutcome::ReadFailed(path, e),
                }
            })
            .buffered(self.config.read_concurrency.max(1));

        let mut extent = TileExtent::default();
        let mut batch: Vec<TileData> = Vec::with_capacity(self.batch_size());

        while let Some(outcome) = outcomes.next().await {
            match outcome {
                FileOutcome::Tile(tile) => {
                    extent.include(tile.coord);
                    batch.push(tile);
                }
                FileOutcome::Skipped(path) => {
                    debug!("[MapImporter] Skipping non-tile file {}", path);
                    summary.skipped += 1;
                    progress.add_skipped();
                }
                FileOutcome::ReadFailed(path, e) => {
                    warn!("[MapImporter] Failed to read {}: {}", path, e);
                    summary.errors += 1;
                    progress.add_errors(1);
                }
            }

            if batch.len() >= self.batch_size() {
                self.flush_counted(map_id, &mut batch, &mut summary, &progress)
                    .await;
                tokio::task::yield_now().await;
            }
        }
        self.flush_counted(map_id, &mut batch, &mut summary, &progress)
            .await;

        if summary.imported > 0 {
            summary.size_bytes = self.store.get_map_size_bytes(map_id).await?;
            let mut meta = build_metadata(map_id, &hints, &extent, summary.size_bytes);
            if let Some(existing) = self.store.get_map_metadata(map_id).await? {
                meta.pinned = existing.pinned;
                meta.used_by_routes = existing.used_by_routes;
                meta.name = meta.name.or(existing.name);
            }
            self.store.save_map_metadata(meta).await?;
        }

        progress.finish();
        info!("[MapImporter] {}", summary.status_message());
        Ok(summary)
    }

    /// Write the pending batch, counting a failed write as errors.
    async fn flush_counted(
        &self,
        map_id: &str,
        batch: &mut Vec<TileData>,
        summary: &mut ImportSummary,
        progress: &ImportProgress,
    ) {
        let pending = batch.len();
        match self.flush(map_id, batch, progress).await {
            Ok(written) => summary.imported += written as u32,
            Err(e) => {
                warn!(
                    "[MapImporter] Failed to write {} tiles for map {}: {}",
                    pending, map_id, e
                );
                summary.errors += pending as u32;
                progress.add_errors(pending);
            }
        }
    }
}
