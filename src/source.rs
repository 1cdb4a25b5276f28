//! Tile source for raster map widgets.
//!
//! The widget asks for tiles by XYZ coordinate. The source looks them up in
//! the [`TileStore`], wraps the payload in a transient [`ObjectUrl`] and
//! hands it to the widget's [`ImageLoader`]. The URL is revoked as soon as
//! the image is dropped, which happens right after the loader reports
//! loaded or errored, so rapid pan/zoom does not leak handles.
//!
//! Widget contract is two-phase: [`TileSource::create_placeholder`] returns
//! immediately, [`TileSource::populate`] fills the placeholder later.
//!
//! The source never writes to the store.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;
use lru::LruCache;

use crate::error::{Result, TileCacheError};
use crate::store::TileStore;
use crate::tiles::TileCoord;

// ============================================================================
// Object URLs
// ============================================================================

/// Decoded-on-demand tile payload.
#[derive(Debug, PartialEq, Eq)]
pub struct TileBlob {
    pub data: Vec<u8>,
    pub content_type: String,
}

/// Transient handle through which a widget reads a tile payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectUrl(String);

impl ObjectUrl {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ObjectUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Issues and revokes object URLs.
#[derive(Debug, Default)]
pub struct BlobUrlRegistry {
    next_id: AtomicU64,
    live: Mutex<HashMap<ObjectUrl, Arc<TileBlob>>>,
}

impl BlobUrlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, blob: Arc<TileBlob>) -> ObjectUrl {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let url = ObjectUrl(format!("blob:tile/{}", id));
        if let Ok(mut live) = self.live.lock() {
            live.insert(url.clone(), blob);
        }
        url
    }

    /// Payload behind a live URL.
    pub fn resolve(&self, url: &ObjectUrl) -> Option<Arc<TileBlob>> {
        self.live.lock().ok()?.get(url).cloned()
    }

    /// Returns `false` if the URL was already revoked.
    pub fn revoke(&self, url: &ObjectUrl) -> bool {
        self.live
            .lock()
            .map(|mut live| live.remove(url).is_some())
            .unwrap_or(false)
    }

    /// Number of URLs not yet revoked.
    pub fn live_count(&self) -> usize {
        self.live.lock().map(|live| live.len()).unwrap_or(0)
    }
}

/// A resolved tile. Its URL stays valid until the image is dropped.
#[derive(Debug)]
pub struct TileImage {
    coord: TileCoord,
    url: ObjectUrl,
    blob: Arc<TileBlob>,
    registry: Arc<BlobUrlRegistry>,
}

impl TileImage {
    pub fn coord(&self) -> TileCoord {
        self.coord
    }

    pub fn url(&self) -> &ObjectUrl {
        &self.url
    }

    pub fn data(&self) -> &[u8] {
        &self.blob.data
    }

    pub fn content_type(&self) -> &str {
        &self.blob.content_type
    }
}

impl Drop for TileImage {
    fn drop(&mut self) {
        self.registry.revoke(&self.url);
    }
}

// ============================================================================
// Widget Contract
// ============================================================================

/// The widget side: decodes/displays an image, reporting success or an
/// error message.
pub trait ImageLoader: Send + Sync {
    fn load(&self, image: &TileImage) -> impl Future<Output = std::result::Result<(), String>> + Send;
}

/// Lifecycle of a placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileState {
    Pending,
    Loaded { content_type: String, size: usize },
    /// Not in the store; the widget applies its own placeholder policy
    Missing,
    Failed(String),
}

/// Handle returned to the widget before the tile is available.
#[derive(Debug, Clone)]
pub struct TilePlaceholder {
    coord: TileCoord,
    state: Arc<Mutex<TileState>>,
}

impl TilePlaceholder {
    pub fn coord(&self) -> TileCoord {
        self.coord
    }

    pub fn state(&self) -> TileState {
        self.state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| TileState::Failed("placeholder lock poisoned".to_string()))
    }

    fn set_state(&self, state: TileState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }
}

// ============================================================================
// Tile Source
// ============================================================================

/// Serves one map's tiles from the store.
pub struct TileSource {
    store: Arc<TileStore>,
    map_id: String,
    min_zoom: u8,
    max_zoom: u8,
    tms: bool,
    urls: Arc<BlobUrlRegistry>,
    cache: Option<Mutex<LruCache<TileCoord, Arc<TileBlob>>>>,
}

impl TileSource {
    /// Build a source for `map_id`, reading zoom range and tiling scheme
    /// from its metadata. Without metadata every zoom is served as XYZ.
    pub async fn for_map(store: Arc<TileStore>, map_id: &str) -> Result<Self> {
        let meta = store.get_map_metadata(map_id).await?;
        let (min_zoom, max_zoom, tms) = match &meta {
            Some(meta) => (meta.min_zoom, meta.max_zoom, meta.is_tms()),
            None => (0, u8::MAX, false),
        };
        let cache = NonZeroUsize::new(store.config().tile_cache_capacity)
            .map(|cap| Mutex::new(LruCache::new(cap)));

        Ok(Self {
            store,
            map_id: map_id.to_string(),
            min_zoom,
            max_zoom,
            tms,
            urls: Arc::new(BlobUrlRegistry::new()),
            cache,
        })
    }

    /// Share a URL registry across several sources.
    pub fn with_url_registry(mut self, urls: Arc<BlobUrlRegistry>) -> Self {
        self.urls = urls;
        self
    }

    pub fn url_registry(&self) -> &Arc<BlobUrlRegistry> {
        &self.urls
    }

    pub fn map_id(&self) -> &str {
        &self.map_id
    }

    fn not_found(&self, coord: TileCoord) -> TileCacheError {
        TileCacheError::TileNotFound {
            map_id: self.map_id.clone(),
            z: coord.z,
            x: coord.x,
            y: coord.y,
        }
    }

    fn cached(&self, coord: &TileCoord) -> Option<Arc<TileBlob>> {
        let cache = self.cache.as_ref()?;
        cache.lock().ok()?.get(coord).cloned()
    }

    /// Forget cached payloads, e.g. after the map was deleted or re-imported.
    pub fn invalidate(&self) {
        if let Some(Ok(mut cache)) = self.cache.as_ref().map(|c| c.lock()) {
            cache.clear();
        }
    }

    fn remember(&self, coord: TileCoord, blob: Arc<TileBlob>) {
        if let Some(Ok(mut cache)) = self.cache.as_ref().map(|c| c.lock()) {
            cache.put(coord, blob);
        }
    }

    /// Resolve an XYZ tile to an image with a live object URL.
    ///
    /// A miss is reported as [`TileCacheError::TileNotFound`].
    pub async fn resolve_tile(&self, z: u8, x: u32, y: u32) -> Result<TileImage> {
        let requested = TileCoord::new(z, x, y);
        if z < self.min_zoom || z > self.max_zoom {
            return Err(self.not_found(requested));
        }
        let stored = if self.tms {
            requested.flip_y().ok_or_else(|| self.not_found(requested))?
        } else {
            requested
        };

        let blob = match self.cached(&stored) {
            Some(blob) => blob,
            None => {
                let record = self
                    .store
                    .get_tile(&self.map_id, stored.z, stored.x, stored.y)
                    .await?
                    .ok_or_else(|| self.not_found(requested))?;
                let blob = Arc::new(TileBlob {
                    data: record.data,
                    content_type: record.content_type,
                });
                self.remember(stored, Arc::clone(&blob));
                blob
            }
        };

        let url = self.urls.create(Arc::clone(&blob));
        Ok(TileImage {
            coord: requested,
            url,
            blob,
            registry: Arc::clone(&self.urls),
        })
    }

    /// Phase one: an immediately usable placeholder.
    pub fn create_placeholder(&self, coord: TileCoord) -> TilePlaceholder {
        TilePlaceholder {
            coord,
            state: Arc::new(Mutex::new(TileState::Pending)),
        }
    }

    /// Phase two: resolve the tile, let the loader decode it, revoke the
    /// URL and record the outcome on the placeholder.
    pub async fn populate<L: ImageLoader>(&self, placeholder: &TilePlaceholder, loader: &L) -> TileState {
        let coord = placeholder.coord();
        let state = match self.resolve_tile(coord.z, coord.x, coord.y).await {
            Ok(image) => {
                let result = loader.load(&image).await;
                let state = match result {
                    Ok(()) => TileState::Loaded {
                        content_type: image.content_type().to_string(),
                        size: image.data().len(),
                    },
                    Err(message) => TileState::Failed(message),
                };
                drop(image);
                state
            }
            Err(e) if e.is_tile_not_found() => {
                debug!("[TileSource] Missing tile {}/{}", self.map_id, coord);
                TileState::Missing
            }
            Err(e) => TileState::Failed(e.to_string()),
        };

        placeholder.set_state(state.clone());
        state
    }
}
