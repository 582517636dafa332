//! Document acquisition and render caching for Pagekeeper.
//!
//! The crate is split into a handful of independent services:
//!
//! - [`caching`] holds the byte-budgeted in-memory bitmap caches, the degraded-mode
//!   [`FallbackController`](caching::FallbackController), the disk mirror and the directory purger.
//! - [`render`] composes those into the single-flight [`RenderCacheCoordinator`](render::RenderCacheCoordinator).
//! - [`download`] fetches remote documents through interchangeable engines with retries,
//!   backoff and a circuit breaker.
//! - [`session`] owns the lifecycle of the currently opened document.
//!
//! [`services::SharedServices`] wires all of them together from a [`config::Config`].

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod download;
pub mod logging;
pub mod render;
pub mod services;
pub mod session;
pub mod telemetry;
pub mod types;
pub mod utils;
