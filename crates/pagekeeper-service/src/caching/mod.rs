//! # Pagekeeper Caching infrastructure
//!
//! Rendering a page is expensive, so every rendered bitmap is kept around for as long as the
//! memory budget allows. This module contains the building blocks of that: the in-memory caches,
//! the degraded mode switch, the disk mirror and the purger keeping disk usage in check.
//!
//! ## Cache Layers
//!
//! - An in-memory layer of two [`ByteBudgetLruCache`]s, one for whole pages and one for tiles.
//!   Each one has a fixed byte budget and evicts least recently used bitmaps to stay within it.
//! - A [`DiskMirror`] which only comes into play in degraded mode. Bitmaps rendered while degraded
//!   are additionally written to disk, so that a bitmap that was pushed out of the shrunken
//!   in-memory cache can be read back instead of being rendered again.
//!
//! ## Degraded mode
//!
//! The [`FallbackController`] tracks the reasons for which degraded mode is active. The external
//! memory pressure signal, out-of-memory renders and a failure to set up the disk mirror each
//! contribute their own reason. As long as any reason is active, the in-memory budgets are
//! reduced to a fraction of their configured size.
//!
//! ### Metrics
//!
//! Each of those is tagged with a `cache` field:
//!
//! - `caches.memory.hit` / `caches.memory.miss`: In-memory lookups.
//! - `caches.channel.hit`: Requests that joined a render already in flight.
//! - `caches.disk.hit`: Requests served by the disk mirror.
//! - `caches.evictions`: Entries evicted to make room.
//! - `caches.rejected`: Entries too large to be cached at all.
//! - `caches.size.*`: Statistics of the last cleanup run.
//!
//! ### Configuration
//!
//! The in-memory layer is configured by [`Config::caches`](crate::config::Config::caches). The
//! disk mirror and [`cleanup`] are gated by the `cache_dir` option, without it degraded mode only
//! shrinks the in-memory budgets.

mod cache_key;
mod cleanup;
mod disk;
mod fallback;
mod lru;

pub use cache_key::{CacheKey, RenderTarget};
pub use cleanup::{
    CacheDir, Caches, DirectoryBudget, PurgeResult, cleanup, purge_directory,
};
pub use disk::DiskMirror;
pub use fallback::{DISK_INIT, FallbackController, ListenerId, MEMORY_PRESSURE, RENDER_OOM};
pub use lru::{ByteBudgetLruCache, CacheRejected, CacheWeight};
