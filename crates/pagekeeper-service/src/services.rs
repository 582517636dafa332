//! Wiring of all services from a [`Config`].

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::caching::{Caches, FallbackController};
use crate::config::Config;
use crate::download::ResilientDownloader;
use crate::render::{RenderCacheCoordinator, Renderer};
use crate::session::DocumentSession;
use crate::telemetry::SharedTelemetry;

/// The mode name reported by the render cache fallback controller.
pub const RENDER_CACHE_MODE: &str = "degraded";

/// Every long-lived service, constructed once at startup and passed around explicitly.
#[derive(Debug, Clone)]
pub struct SharedServices {
    pub config: Arc<Config>,
    pub telemetry: SharedTelemetry,
    pub fallback: Arc<FallbackController>,
    pub downloader: ResilientDownloader,
    pub caches: Caches,
}

impl SharedServices {
    pub fn new(config: Config, telemetry: SharedTelemetry) -> Result<Self> {
        let fallback = Arc::new(FallbackController::new(RENDER_CACHE_MODE, telemetry.clone()));
        let downloader = ResilientDownloader::with_default_engines(&config.downloads, telemetry.clone())
            .context("failed to create downloader")?;
        let caches = Caches::from_config(&config);

        Ok(Self {
            config: Arc::new(config),
            telemetry,
            fallback,
            downloader,
            caches,
        })
    }

    /// Creates the render cache for an opened document.
    ///
    /// With a cache directory configured, bitmaps are mirrored into a directory specific to the
    /// document, so sessions of different documents never share mirrored bitmaps.
    pub fn render_cache(&self, session: &Arc<DocumentSession>) -> RenderCacheCoordinator {
        let renderer: Arc<dyn Renderer> = session.clone();
        let caches = &self.config.caches;
        let fallback = self.fallback.clone();

        match (self.caches.renders.path(), self.config.cache_dir("tmp")) {
            (Some(renders), Some(tmp)) => RenderCacheCoordinator::with_disk_mirror(
                renderer,
                caches,
                fallback,
                renders.join(session.fingerprint()),
                tmp,
            ),
            _ => RenderCacheCoordinator::new(renderer, caches, fallback),
        }
    }
}
