use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "pagekeeper".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Which entries the in-memory bitmap caches keep.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Keep the most recently used entries within the byte budget.
    #[default]
    Lru,
    /// Do not cache anything, every request renders.
    Disabled,
}

/// Size and age limits of an on-disk cache directory.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct DiskCacheConfig {
    /// Maximum duration since a file was last modified or read.
    ///
    /// `None` disables the age limit.
    #[serde(with = "humantime_serde")]
    pub max_unused_for: Option<Duration>,

    /// Maximum total size of all files in the directory.
    pub max_bytes: u64,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            max_unused_for: Some(Duration::from_secs(3600 * 24 * 7)),
            max_bytes: 512 * 1024 * 1024,
        }
    }
}

/// Configuration of the in-memory bitmap caches and the render pipeline.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfigs {
    /// Byte budget of the whole-page bitmap cache.
    pub page_capacity: u64,
    /// Byte budget of the tile bitmap cache.
    pub tile_capacity: u64,
    pub eviction_policy: EvictionPolicy,
    /// Multiplier applied to both budgets while degraded mode is active.
    pub degraded_fraction: f64,
    /// The maximum number of renders running at the same time.
    pub max_concurrent_renders: usize,
    /// The time a single render may take before it is abandoned.
    #[serde(with = "humantime_serde")]
    pub render_timeout: Duration,
    /// Limits of the on-disk cache directories.
    pub disk: DiskCacheConfig,
}

impl Default for CacheConfigs {
    fn default() -> Self {
        Self {
            page_capacity: 64 * 1024 * 1024,
            tile_capacity: 128 * 1024 * 1024,
            eviction_policy: EvictionPolicy::Lru,
            degraded_fraction: 0.25,
            max_concurrent_renders: 2,
            render_timeout: Duration::from_secs(30),
            disk: DiskCacheConfig::default(),
        }
    }
}

/// Thresholds of the download circuit breaker.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failed downloads after which the breaker opens.
    pub failure_threshold: usize,
    /// Consecutive downloads failing on timeouts after which the breaker opens.
    pub timeout_threshold: usize,
    /// After this long, an open breaker lets a single probe download through.
    ///
    /// `None` means the breaker stays open until it is reset explicitly.
    #[serde(with = "humantime_serde")]
    pub half_open_after: Option<Duration>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_threshold: 3,
            half_open_after: None,
        }
    }
}

/// Retry, timeout and concurrency limits for downloads.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DownloadConfig {
    /// The maximum number of attempts per download, including the first one.
    pub max_attempts: u32,
    /// The time a single attempt may take.
    #[serde(with = "humantime_serde")]
    pub attempt_timeout: Duration,
    /// The timeout for establishing a connection in an HTTP download.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// The delay before the first retry, doubled for every further retry.
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
    /// The maximum delay between two attempts.
    #[serde(with = "humantime_serde")]
    pub backoff_cap: Duration,
    /// The maximum number of downloads running at the same time.
    pub max_concurrent_downloads: usize,
    /// Files larger than this are only downloaded when explicitly allowed.
    pub large_file_threshold: u64,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            attempt_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
            max_concurrent_downloads: 4,
            large_file_threshold: 200 * 1024 * 1024,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which directory to use when caching. Default is not to cache.
    pub cache_dir: Option<PathBuf>,

    /// Configuration of the logging system.
    pub logging: Logging,

    /// Configuration of the metrics system.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Bitmap cache budgets and render limits.
    pub caches: CacheConfigs,

    /// Retry and circuit breaker settings of the downloader.
    pub downloads: DownloadConfig,
}

impl Config {
    /// Return a cache directory `dir`, it is joined with the configured base cache directory.
    ///
    /// If there is no base cache directory configured this means no caching should happen
    /// and this returns None.
    pub fn cache_dir<P>(&self, dir: P) -> Option<PathBuf>
    where
        P: AsRef<Path>,
    {
        self.cache_dir.as_ref().map(|base| base.join(dir))
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: None,
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            caches: CacheConfigs::default(),
            downloads: DownloadConfig::default(),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
