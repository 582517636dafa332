use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use pagekeeper_service::caching::{CacheKey, MEMORY_PRESSURE, RENDER_OOM};
use pagekeeper_service::render::{RenderError, Renderer};
use pagekeeper_service::session::{DocumentLoader, OpenError, SessionManager};
use pagekeeper_service::types::{Bitmap, TileCoord};

use crate::setup_services;

/// Renders solid bitmaps with one byte per pixel, slowly, and counts its renders.
#[derive(Default)]
struct SlowRenderer {
    renders: AtomicUsize,
}

impl Renderer for SlowRenderer {
    fn render<'a>(&'a self, key: &'a CacheKey) -> BoxFuture<'a, Result<Bitmap, RenderError>> {
        async move {
            self.renders.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            let size = (key.width() * key.height()) as usize;
            Ok(Bitmap::new(key.width(), key.height(), vec![7; size]))
        }
        .boxed()
    }
}

struct SharedLoader(Arc<SlowRenderer>);

impl DocumentLoader for SharedLoader {
    fn load<'a>(&'a self, _path: &'a Path) -> BoxFuture<'a, Result<Arc<dyn Renderer>, OpenError>> {
        let renderer: Arc<dyn Renderer> = self.0.clone();
        async move { Ok(renderer) }.boxed()
    }
}

async fn wait_for(path: &Path) {
    for _ in 0..200 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("`{}` was never written", path.display());
}

#[tokio::test]
async fn test_concurrent_requests_share_a_render() {
    let (services, _telemetry, cache_dir) = setup_services(|_| {});
    let document = cache_dir.path().join("document.pdf");
    std::fs::write(&document, b"%PDF").unwrap();
    let renderer = Arc::new(SlowRenderer::default());
    let sessions = SessionManager::new(
        Arc::new(SharedLoader(renderer.clone())),
        services.telemetry.clone(),
    );
    let session = sessions.open(&document).await.unwrap();
    let render_cache = services.render_cache(&session);

    let page = CacheKey::page(3, 10, 10, 1.0);
    let tile = TileCoord {
        page: 3,
        column: 1,
        row: 2,
    };
    let tile = CacheKey::tile(tile, 10, 10, 2.0);
    let results = join_all((0..8).map(|i| {
        let key = if i % 2 == 0 { page } else { tile };
        render_cache.render(key)
    }))
    .await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(renderer.renders.load(Ordering::SeqCst), 2);
    assert_eq!(render_cache.page_cache().len(), 1);
    assert_eq!(render_cache.tile_cache().len(), 1);
    assert_eq!(render_cache.size_bytes(), 200);

    // closing the session fails later renders fast, cached bitmaps are still served
    sessions.close().await;
    assert!(render_cache.render(page).await.is_ok());
    let other = CacheKey::page(4, 10, 10, 1.0);
    assert_eq!(
        render_cache.render(other).await,
        Err(RenderError::SessionClosed)
    );
}

#[tokio::test]
async fn test_memory_pressure_mirrors_to_disk() {
    let (services, telemetry, cache_dir) = setup_services(|config| {
        config.caches.page_capacity = 1000;
        config.caches.degraded_fraction = 0.5;
    });
    let document = cache_dir.path().join("document.pdf");
    std::fs::write(&document, b"%PDF").unwrap();
    let renderer = Arc::new(SlowRenderer::default());
    let sessions = SessionManager::new(
        Arc::new(SharedLoader(renderer.clone())),
        services.telemetry.clone(),
    );
    let session = sessions.open(&document).await.unwrap();
    let render_cache = services.render_cache(&session);

    services.fallback.activate(MEMORY_PRESSURE);
    assert_eq!(render_cache.page_cache().max_bytes(), 500);

    let key = CacheKey::page(0, 10, 10, 1.0);
    render_cache.render(key).await.unwrap();
    let mirror = render_cache.disk_mirror().unwrap();
    wait_for(&mirror.path_for(&key)).await;

    // a degraded cache miss is served from disk instead of rendering again
    render_cache.evict_all();
    let bitmap = render_cache.render(key).await.unwrap();
    assert_eq!(bitmap.pixels().as_ref(), &[7; 100][..]);
    assert_eq!(renderer.renders.load(Ordering::SeqCst), 1);

    services.fallback.activate(RENDER_OOM);
    render_cache.memory_pressure_relieved();
    assert!(!services.fallback.is_active());
    assert_eq!(render_cache.page_cache().max_bytes(), 1000);
    assert_eq!(
        telemetry.messages_in("fallback"),
        [
            "fallback_mode:degraded:memory_pressure",
            "fallback_mode:restored:render_oom",
        ]
    );
}
