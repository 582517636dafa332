//! The render cache in front of a document [`Renderer`].
//!
//! [`RenderCacheCoordinator::render`] serves bitmaps from the in-memory caches and renders them
//! on a miss. Concurrent requests for the same [`CacheKey`] are coalesced into a single render.
//! While the [`FallbackController`] is active, the coordinator shrinks its budgets and mirrors
//! freshly rendered bitmaps to disk.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};

use futures::channel::oneshot;
use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, TryFutureExt};
use sentry::{Hub, SentryFutureExt};
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::caching::{
    ByteBudgetLruCache, CacheKey, DirectoryBudget, DiskMirror, FallbackController, ListenerId,
    MEMORY_PRESSURE, PurgeResult, RENDER_OOM,
};
use crate::config::{CacheConfigs, EvictionPolicy};
use crate::types::{Bitmap, ErrorCategory};
use crate::utils::defer::defer;
use crate::utils::sync::lock;

/// The ways a render can fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    /// The renderer ran out of memory.
    #[error("out of memory")]
    OutOfMemory,
    /// The render did not finish in time.
    #[error("render timed out after {}", humantime::format_duration(*.0))]
    Timeout(Duration),
    /// The document could not be decoded.
    #[error("corrupted document: {0}")]
    Corrupted(String),
    /// The session was closed before or while rendering.
    #[error("document session is closed")]
    SessionClosed,
    /// The session was replaced by a newer one.
    #[error("document session was superseded")]
    SessionSuperseded,
    /// The render was abandoned before it produced a result.
    #[error("render was interrupted")]
    Interrupted,
}

impl RenderError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::OutOfMemory => ErrorCategory::OutOfMemory,
            Self::Corrupted(_) => ErrorCategory::CorruptedDocument,
            Self::Timeout(_) => ErrorCategory::Unavailable,
            Self::SessionClosed | Self::SessionSuperseded | Self::Interrupted => {
                ErrorCategory::Internal
            }
        }
    }
}

/// Turns a [`CacheKey`] into a bitmap.
///
/// The bitmap encoding is opaque, only its byte size matters to the caches.
pub trait Renderer: Send + Sync + 'static {
    fn render<'a>(&'a self, key: &'a CacheKey) -> BoxFuture<'a, Result<Bitmap, RenderError>>;
}

type RenderResult = Result<Bitmap, RenderError>;
type RenderChannel = Shared<oneshot::Receiver<RenderResult>>;

/// Page and tile bitmap caches with single-flight rendering and degraded mode.
///
/// Cheap to clone, all clones share their caches.
#[derive(Clone)]
pub struct RenderCacheCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RenderCacheCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderCacheCoordinator")
            .field("pages", &self.inner.pages)
            .field("tiles", &self.inner.tiles)
            .field("in_flight", &lock(&self.inner.in_flight).len())
            .field("disk", &self.inner.disk)
            .finish()
    }
}

struct Inner {
    renderer: Arc<dyn Renderer>,
    pages: ByteBudgetLruCache<CacheKey, Bitmap>,
    tiles: ByteBudgetLruCache<CacheKey, Bitmap>,
    config: CacheConfigs,
    fallback: Arc<FallbackController>,
    disk: Option<DiskMirror>,
    in_flight: Mutex<HashMap<CacheKey, RenderChannel>>,
    render_limit: Arc<Semaphore>,
    listeners: Mutex<Vec<ListenerId>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for id in lock(&self.listeners).drain(..) {
            self.fallback.remove_listener(id);
        }
    }
}

impl RenderCacheCoordinator {
    pub fn new(
        renderer: Arc<dyn Renderer>,
        config: &CacheConfigs,
        fallback: Arc<FallbackController>,
    ) -> Self {
        Self::build(renderer, config, fallback, None)
    }

    /// Creates a coordinator which mirrors bitmaps into `dir` while degraded.
    ///
    /// If the mirror cannot be set up, the coordinator works without it and the sticky
    /// [`DISK_INIT`](crate::caching::DISK_INIT) fallback reason is activated.
    pub fn with_disk_mirror(
        renderer: Arc<dyn Renderer>,
        config: &CacheConfigs,
        fallback: Arc<FallbackController>,
        dir: PathBuf,
        tmp_dir: PathBuf,
    ) -> Self {
        let disk = match DiskMirror::open(dir.clone(), tmp_dir) {
            Ok(disk) => Some(disk),
            Err(e) => {
                sentry::with_scope(
                    |scope| scope.set_extra("path", dir.display().to_string().into()),
                    || {
                        tracing::error!(
                            error = &e as &dyn std::error::Error,
                            "Failed to initialize render cache directory"
                        )
                    },
                );
                fallback.activate(crate::caching::DISK_INIT);
                None
            }
        };
        Self::build(renderer, config, fallback, disk)
    }

    fn build(
        renderer: Arc<dyn Renderer>,
        config: &CacheConfigs,
        fallback: Arc<FallbackController>,
        disk: Option<DiskMirror>,
    ) -> Self {
        let inner = Arc::new(Inner {
            renderer,
            pages: ByteBudgetLruCache::new("pages", config.page_capacity),
            tiles: ByteBudgetLruCache::new("tiles", config.tile_capacity),
            config: config.clone(),
            fallback: fallback.clone(),
            disk,
            in_flight: Mutex::new(HashMap::new()),
            render_limit: Arc::new(Semaphore::new(config.max_concurrent_renders.max(1))),
            listeners: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&inner);
        let activated = fallback.on_activated(budget_listener(weak.clone(), true));
        let deactivated = fallback.on_deactivated(budget_listener(weak, false));
        lock(&inner.listeners).extend([activated, deactivated]);

        // The fallback might have been active before we started listening.
        inner.apply_budgets(fallback.is_active());

        Self { inner }
    }

    /// Returns the bitmap for `key`, rendering it if it is not cached.
    ///
    /// Concurrent calls for the same key share a single render. Dropping the returned future
    /// abandons only this caller, the render continues for everyone else.
    pub async fn render(&self, key: CacheKey) -> Result<Bitmap, RenderError> {
        let cache = self.inner.cache_for(&key);
        if self.inner.caching_enabled() {
            if let Some(bitmap) = cache.get(&key) {
                metric!(counter("caches.memory.hit") += 1, "cache" => cache.name());
                return Ok(bitmap);
            }
            metric!(counter("caches.memory.miss") += 1, "cache" => cache.name());
        }

        self.spawn_render(key).await
    }

    /// Spawns the render as a separate task, deduplicating concurrent requests for `key`.
    ///
    /// NOTE: This function itself is *not* `async`, because it should eagerly spawn the render
    /// even if the result is never awaited.
    fn spawn_render(&self, key: CacheKey) -> BoxFuture<'static, RenderResult> {
        let channel = {
            let mut in_flight = lock(&self.inner.in_flight);
            if let Some(channel) = in_flight.get(&key) {
                metric!(counter("caches.channel.hit") += 1);
                channel.clone()
            } else {
                // A render that just finished has already inserted its bitmap and unregistered
                // itself, so look again while holding the in-flight lock.
                if self.inner.caching_enabled()
                    && let Some(bitmap) = self.inner.cache_for(&key).get(&key)
                {
                    return Box::pin(async move { Ok(bitmap) });
                }
                let channel = self.create_channel(key);
                in_flight.insert(key, channel.clone());
                channel
            }
        };

        let future = channel.unwrap_or_else(|_cancelled_error| Err(RenderError::Interrupted));
        Box::pin(future)
    }

    fn create_channel(&self, key: CacheKey) -> RenderChannel {
        let (sender, receiver) = oneshot::channel();

        let inner = self.inner.clone();
        let remove_token = defer({
            let inner = Arc::downgrade(&self.inner);
            move || {
                if let Some(inner) = inner.upgrade() {
                    lock(&inner.in_flight).remove(&key);
                }
            }
        });

        let render = async move {
            let result = inner.compute(key).await;
            // Unregister before sending. Callers either get a channel that will receive data,
            // or they find the bitmap in the cache.
            drop(remove_token);
            sender.send(result).ok();
        }
        .bind_hub(Hub::new_from_top(Hub::current()));

        tokio::spawn(render);

        receiver.shared()
    }

    /// Signals that memory pressure is gone, also clearing the out-of-memory reason.
    pub fn memory_pressure_relieved(&self) {
        self.inner.fallback.deactivate(MEMORY_PRESSURE);
        self.inner.fallback.deactivate(RENDER_OOM);
    }

    /// Drops all bitmaps from the in-memory caches.
    pub fn evict_all(&self) {
        self.inner.pages.evict_all();
        self.inner.tiles.evict_all();
    }

    /// The total size of all bitmaps held in memory.
    pub fn size_bytes(&self) -> u64 {
        self.inner.pages.size_bytes() + self.inner.tiles.size_bytes()
    }

    pub fn page_cache(&self) -> &ByteBudgetLruCache<CacheKey, Bitmap> {
        &self.inner.pages
    }

    pub fn tile_cache(&self) -> &ByteBudgetLruCache<CacheKey, Bitmap> {
        &self.inner.tiles
    }

    pub fn disk_mirror(&self) -> Option<&DiskMirror> {
        self.inner.disk.as_ref()
    }

    /// Purges the disk mirror according to the configured limits.
    pub async fn purge_disk(&self, now: SystemTime) -> PurgeResult {
        let Some(disk) = &self.inner.disk else {
            return PurgeResult::default();
        };
        let dir = disk.dir().to_path_buf();
        let budget = DirectoryBudget::from(self.inner.config.disk);
        tokio::task::spawn_blocking(move || budget.purge(&dir, now))
            .await
            .unwrap_or_else(|e| {
                tracing::error!(error = &e as &dyn std::error::Error, "Disk purge panicked");
                PurgeResult {
                    failures: 1,
                    ..Default::default()
                }
            })
    }
}

fn budget_listener(inner: Weak<Inner>, degraded: bool) -> impl Fn(&str) + Send + Sync + 'static {
    move |_reason| {
        if let Some(inner) = inner.upgrade() {
            inner.apply_budgets(degraded);
        }
    }
}

impl Inner {
    fn cache_for(&self, key: &CacheKey) -> &ByteBudgetLruCache<CacheKey, Bitmap> {
        if key.target().is_tile() {
            &self.tiles
        } else {
            &self.pages
        }
    }

    fn caching_enabled(&self) -> bool {
        self.config.eviction_policy != EvictionPolicy::Disabled
    }

    fn apply_budgets(&self, degraded: bool) {
        let scale = |capacity: u64| {
            if degraded {
                (capacity as f64 * self.config.degraded_fraction.clamp(0.0, 1.0)) as u64
            } else {
                capacity
            }
        };
        self.pages.set_max_bytes(scale(self.config.page_capacity));
        self.tiles.set_max_bytes(scale(self.config.tile_capacity));
        tracing::debug!(degraded, "Applied render cache budgets");
    }

    async fn compute(&self, key: CacheKey) -> RenderResult {
        let degraded = self.fallback.is_active();

        if degraded && let Some(bitmap) = self.load_from_disk(&key).await {
            self.insert(key, &bitmap);
            return Ok(bitmap);
        }

        let result = self.run_renderer(&key).await;
        match &result {
            Ok(bitmap) => {
                self.insert(key, bitmap);
                // Checked again, the render may have taken a while.
                if self.fallback.is_active() {
                    self.mirror_to_disk(key, bitmap.clone());
                }
            }
            Err(RenderError::OutOfMemory) => {
                tracing::warn!(%key, "Render ran out of memory");
                self.fallback.activate(RENDER_OOM);
            }
            Err(e) => {
                tracing::debug!(%key, error = e as &dyn std::error::Error, "Render failed");
            }
        }
        result
    }

    async fn run_renderer(&self, key: &CacheKey) -> RenderResult {
        let _permit = self
            .render_limit
            .acquire()
            .await
            .map_err(|_| RenderError::Interrupted)?;

        let timeout = self.config.render_timeout;
        let start = std::time::Instant::now();
        let result = match tokio::time::timeout(timeout, self.renderer.render(key)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(RenderError::Timeout(timeout)),
        };
        metric!(
            timer("render.duration") = start.elapsed(),
            "success" => if result.is_ok() { "true" } else { "false" },
        );
        result
    }

    fn insert(&self, key: CacheKey, bitmap: &Bitmap) {
        if !self.caching_enabled() {
            return;
        }
        if let Err(rejected) = self.cache_for(&key).put(key, bitmap.clone()) {
            tracing::debug!(%key, %rejected, "Bitmap not cached");
        }
    }

    async fn load_from_disk(&self, key: &CacheKey) -> Option<Bitmap> {
        let disk = self.disk.as_ref()?;
        match disk.load(key).await {
            Ok(Some(bitmap)) => {
                metric!(counter("caches.disk.hit") += 1, "cache" => self.cache_for(key).name());
                Some(bitmap)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(%key, error = &e as &dyn std::error::Error, "Failed to read mirrored bitmap");
                if let Err(e) = disk.remove(key).await {
                    tracing::debug!(error = &e as &dyn std::error::Error, "Failed to remove mirrored bitmap");
                }
                None
            }
        }
    }

    fn mirror_to_disk(&self, key: CacheKey, bitmap: Bitmap) {
        let Some(disk) = self.disk.clone() else {
            return;
        };
        let store = async move {
            if let Err(e) = disk.store(&key, &bitmap).await {
                sentry::with_scope(
                    |scope| scope.set_extra("path", disk.path_for(&key).display().to_string().into()),
                    || tracing::error!(error = &e as &dyn std::error::Error, "Failed to mirror bitmap to disk"),
                );
            }
        }
        .bind_hub(Hub::new_from_top(Hub::current()));
        tokio::spawn(store);
    }
}
