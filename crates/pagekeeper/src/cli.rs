//! Exposes the command line application.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use pagekeeper_service::caching;
use pagekeeper_service::config::Config;
use pagekeeper_service::download::{FetchEvent, FetchStage};
use pagekeeper_service::metrics;
use pagekeeper_service::services::SharedServices;
use pagekeeper_service::telemetry::SentryTelemetry;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::logging;

/// The exit code of a fetch that was interrupted with Ctrl-C.
pub const EXIT_CANCELLED: i32 = 130;

/// Pagekeeper commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Clean local caches.
    Cleanup {
        /// Report what would be removed without removing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Fetch a single document.
    Fetch {
        /// The location of the document, a `file://`, `http://` or `https://` URL.
        url: Url,

        /// Where to write the document.
        output: PathBuf,

        /// Allow documents above the configured size limit.
        #[arg(long)]
        allow_large_file: bool,
    },
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(name = "pagekeeper", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long = "config", short = 'c', global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application, returning the process exit code.
pub fn execute() -> Result<i32> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: We are still single-threaded, the runtime is only started below.
    unsafe { logging::init_logging(&config) };
    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )
        .context("failed to configure statsd")?;
    }

    match cli.command {
        Command::Cleanup { dry_run } => {
            caching::cleanup(config, dry_run).context("failed to clean up caches")?;
            Ok(0)
        }
        Command::Fetch {
            url,
            output,
            allow_large_file,
        } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .thread_name("pagekeeper")
                .build()
                .context("failed to create runtime")?;
            runtime.block_on(fetch(config, url, output, allow_large_file))
        }
    }
}

async fn fetch(config: Config, url: Url, output: PathBuf, allow_large_file: bool) -> Result<i32> {
    let services = SharedServices::new(config, Arc::new(SentryTelemetry))?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted, cancelling download");
                cancel.cancel();
            }
        }
    });

    let mut events = services
        .downloader
        .fetch(url.clone(), output, allow_large_file, cancel);
    let mut last_percent = None;
    while let Some(event) = events.next().await {
        match event {
            FetchEvent::Progress {
                stage: FetchStage::Downloading,
                fraction: Some(fraction),
            } => {
                let percent = (fraction * 100.0) as u32;
                if last_percent != Some(percent) {
                    last_percent = Some(percent);
                    tracing::debug!(percent, "Downloading");
                }
            }
            FetchEvent::Progress { stage, .. } => tracing::debug!(?stage, "Fetching `{url}`"),
            FetchEvent::Success(path) => {
                println!("{}", path.display());
                return Ok(0);
            }
            FetchEvent::Failure(error) => {
                let category = error.category();
                return Err(anyhow::Error::new(error)
                    .context(category.message())
                    .context(format!("failed to fetch `{url}`")));
            }
        }
    }

    eprintln!("Download of `{url}` was cancelled");
    Ok(EXIT_CANCELLED)
}
