//! Service which fetches remote documents through interchangeable engines.
//!
//! A [`ResilientDownloader`] picks the engines supporting a URL in priority order and runs
//! attempts against them, each bounded by a timeout and separated by an exponential backoff.
//! A shared [`CircuitBreaker`] stops all downloads after a run of failed ones.
//!
//! Every fetch is exposed as a lazy stream of [`FetchEvent`]s that ends in exactly one
//! [`FetchEvent::Success`] or [`FetchEvent::Failure`], or ends early without either if the fetch
//! was cancelled.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use sentry::SentryFutureExt;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::DownloadConfig;
use crate::telemetry::SharedTelemetry;
use crate::utils::defer::defer;

mod circuit_breaker;
mod fetch_error;
mod filesystem;
mod http;
mod stream;

pub use circuit_breaker::{Admission, CircuitBreaker, CircuitState};
pub use fetch_error::FetchError;
pub use filesystem::FilesystemEngine;
pub use http::HttpEngine;
pub use stream::{EventSender, EventStream};

/// The phase a fetch is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStage {
    /// An attempt is being set up.
    Connecting,
    /// Content is being transferred.
    Downloading,
    /// Waiting before the next attempt.
    Backoff,
}

/// An event of a fetch, see [`ResilientDownloader::fetch`].
#[derive(Debug, Clone, PartialEq)]
pub enum FetchEvent {
    /// The fetch made progress. `fraction` is between `0` and `1` if the total size is known.
    Progress {
        stage: FetchStage,
        fraction: Option<f32>,
    },
    /// The document was written to the given location.
    Success(PathBuf),
    /// The fetch failed for good.
    Failure(FetchError),
}

impl FetchEvent {
    pub fn progress(stage: FetchStage, fraction: Option<f32>) -> Self {
        Self::Progress { stage, fraction }
    }

    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }
}

/// What a single engine is asked to download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: Url,
    /// The file the document is written to.
    pub destination: PathBuf,
    /// Allows documents above the configured size threshold.
    pub allow_large_file: bool,
}

/// A way of downloading documents, like the local filesystem or HTTP.
pub trait DownloadEngine: Send + Sync + 'static {
    /// A short name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Whether this engine can download `url` at all.
    fn supports(&self, url: &Url) -> bool;

    /// Runs a single download attempt.
    ///
    /// The stream should end with a [`FetchEvent::Success`] or [`FetchEvent::Failure`].
    fn download(&self, request: &DownloadRequest) -> BoxStream<'static, FetchEvent>;
}

/// Bookkeeping for a single attempt, only used for logs and metrics.
#[derive(Debug, Clone, Copy)]
pub struct DownloadAttempt {
    pub engine_name: &'static str,
    pub attempt_number: u32,
    pub started_at: Instant,
}

/// The final result of a fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Success(PathBuf),
    Failure(FetchError),
    /// The fetch was cancelled before it produced a result.
    Cancelled,
}

/// The delay before attempt `attempt + 1`, given that `attempt` just failed.
///
/// `base * 2^(attempt - 1)`, capped at `cap`.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(cap, |delay| delay.min(cap))
}

/// The stream of events of a single fetch.
///
/// The fetch only runs while this stream is polled. Once the cancellation token is triggered,
/// the stream ends right away and the running attempt is dropped along with its concurrency
/// permit.
pub struct FetchStream {
    events: EventStream,
    cancel: CancellationToken,
    done: bool,
}

impl FetchStream {
    /// Drives the fetch to completion, discarding progress events.
    pub async fn outcome(mut self) -> FetchOutcome {
        while let Some(event) = self.next().await {
            match event {
                FetchEvent::Progress { .. } => {}
                FetchEvent::Success(path) => return FetchOutcome::Success(path),
                FetchEvent::Failure(error) => return FetchOutcome::Failure(error),
            }
        }
        FetchOutcome::Cancelled
    }
}

impl std::fmt::Debug for FetchStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchStream")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("done", &self.done)
            .finish()
    }
}

impl Stream for FetchStream {
    type Item = FetchEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        if self.cancel.is_cancelled() {
            self.done = true;
            self.events.abort();
            return Poll::Ready(None);
        }
        let event = self.events.poll_next_unpin(cx);
        match &event {
            Poll::Ready(None) | Poll::Ready(Some(FetchEvent::Success(_) | FetchEvent::Failure(_))) => {
                self.done = true;
                self.events.abort();
            }
            _ => {}
        }
        event
    }
}

/// Fetches documents with retries, backoff and a circuit breaker.
///
/// Cheap to clone, all clones share the same circuit breaker and concurrency limit.
#[derive(Clone)]
pub struct ResilientDownloader {
    inner: Arc<DownloaderInner>,
}

struct DownloaderInner {
    engines: Vec<Arc<dyn DownloadEngine>>,
    config: DownloadConfig,
    breaker: CircuitBreaker,
    download_limit: Semaphore,
    telemetry: SharedTelemetry,
}

impl std::fmt::Debug for ResilientDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let engines: Vec<_> = self.inner.engines.iter().map(|e| e.name()).collect();
        f.debug_struct("ResilientDownloader")
            .field("engines", &engines)
            .field("breaker", &self.inner.breaker)
            .finish()
    }
}

enum AttemptsOutcome {
    Done(Result<PathBuf, FetchError>),
    Cancelled,
}

impl ResilientDownloader {
    /// Creates a downloader trying `engines` in the given priority order.
    pub fn new(
        engines: Vec<Arc<dyn DownloadEngine>>,
        config: &DownloadConfig,
        telemetry: SharedTelemetry,
    ) -> Self {
        Self {
            inner: Arc::new(DownloaderInner {
                engines,
                config: config.clone(),
                breaker: CircuitBreaker::new(config.circuit_breaker, telemetry.clone()),
                download_limit: Semaphore::new(config.max_concurrent_downloads.max(1)),
                telemetry,
            }),
        }
    }

    /// Creates a downloader with the filesystem and HTTP engines.
    pub fn with_default_engines(
        config: &DownloadConfig,
        telemetry: SharedTelemetry,
    ) -> Result<Self, FetchError> {
        let engines: Vec<Arc<dyn DownloadEngine>> = vec![
            Arc::new(FilesystemEngine::new(config.large_file_threshold)),
            Arc::new(HttpEngine::new(config)?),
        ];
        Ok(Self::new(engines, config, telemetry))
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    /// Fetches `url` into `destination`.
    ///
    /// Nothing happens before the returned stream is polled. Triggering `cancel` ends the stream
    /// without a terminal event.
    pub fn fetch(
        &self,
        url: Url,
        destination: PathBuf,
        allow_large_file: bool,
        cancel: CancellationToken,
    ) -> FetchStream {
        let request = DownloadRequest {
            url,
            destination,
            allow_large_file,
        };
        let inner = self.inner.clone();
        let events = EventStream::new({
            let cancel = cancel.clone();
            move |events| {
                async move { inner.run(request, cancel, events).await }
                    .bind_hub(sentry::Hub::new_from_top(sentry::Hub::current()))
            }
        });

        FetchStream {
            events,
            cancel,
            done: false,
        }
    }
}

impl DownloaderInner {
    async fn run(&self, request: DownloadRequest, cancel: CancellationToken, events: EventSender) {
        let admission = match self.breaker.admit() {
            Ok(admission) => admission,
            Err(error) => {
                metric!(counter("service.download.blocked") += 1);
                tracing::debug!(url = %request.url, %error, "Download blocked");
                events.send(FetchEvent::Failure(error));
                return;
            }
        };

        // Hands a half-open admission back if this future is dropped or returns without a result.
        let abandoned = defer(|| self.breaker.record_abandoned(admission));

        let engines: Vec<_> = self
            .engines
            .iter()
            .filter(|engine| engine.supports(&request.url))
            .cloned()
            .collect();
        if engines.is_empty() {
            let error = FetchError::NoEngine(request.url.to_string());
            events.send(FetchEvent::Failure(error));
            return;
        }

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            permit = self.download_limit.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    events.send(FetchEvent::Failure(FetchError::Internal("download service shut down".into())));
                    return;
                }
            },
        };

        let start = Instant::now();
        let outcome = self.run_attempts(&engines, &request, &cancel, &events).await;
        match outcome {
            AttemptsOutcome::Done(Ok(path)) => {
                metric!(timer("service.download.duration") = start.elapsed(), "status" => "success");
                abandoned.cancel();
                self.breaker.record_success(admission);
                events.send(FetchEvent::Success(path));
            }
            AttemptsOutcome::Done(Err(error)) => {
                metric!(timer("service.download.duration") = start.elapsed(), "status" => error.kind());
                metric!(counter("service.download.failure") += 1, "error" => error.kind());
                tracing::debug!(
                    url = %request.url,
                    error = &error as &dyn std::error::Error,
                    "Failed to download document"
                );
                abandoned.cancel();
                self.breaker.record_failure(admission, &error);
                events.send(FetchEvent::Failure(error));
            }
            AttemptsOutcome::Cancelled => {
                tracing::debug!(url = %request.url, "Download cancelled");
            }
        }
    }

    /// Runs attempts until one succeeds, fails terminally, or the attempts are used up.
    ///
    /// Attempts rotate through `engines`, one attempt per engine before starting over.
    async fn run_attempts(
        &self,
        engines: &[Arc<dyn DownloadEngine>],
        request: &DownloadRequest,
        cancel: &CancellationToken,
        events: &EventSender,
    ) -> AttemptsOutcome {
        let max_attempts = self.config.max_attempts.max(1);
        let attempt_timeout = self.config.attempt_timeout;
        let mut last_error = None;

        for attempt_number in 1..=max_attempts {
            let engine = &engines[(attempt_number as usize - 1) % engines.len()];
            let attempt = DownloadAttempt {
                engine_name: engine.name(),
                attempt_number,
                started_at: Instant::now(),
            };
            metric!(counter("service.download.attempt") += 1, "engine" => attempt.engine_name);
            if attempt_number > 1 {
                self.telemetry.breadcrumb(
                    "download",
                    format!("download:retry:{}:{attempt_number}", attempt.engine_name),
                );
            }
            events.send(FetchEvent::progress(FetchStage::Connecting, None));

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return AttemptsOutcome::Cancelled,
                result = tokio::time::timeout(attempt_timeout, run_attempt(engine.as_ref(), request, events)) => {
                    result.unwrap_or(Err(FetchError::Timeout(attempt_timeout)))
                }
            };

            let error = match result {
                Ok(path) => {
                    tracing::debug!(
                        engine = attempt.engine_name,
                        attempt = attempt.attempt_number,
                        elapsed = ?attempt.started_at.elapsed(),
                        "Download attempt succeeded"
                    );
                    return AttemptsOutcome::Done(Ok(path));
                }
                Err(error) if error.is_retryable() => error,
                Err(error) => return AttemptsOutcome::Done(Err(error)),
            };

            tracing::info!(
                engine = attempt.engine_name,
                attempt = attempt.attempt_number,
                elapsed = ?attempt.started_at.elapsed(),
                %error,
                "Download attempt failed"
            );
            last_error = Some(error);

            if attempt_number < max_attempts {
                let delay = backoff_delay(
                    self.config.backoff_base,
                    self.config.backoff_cap,
                    attempt_number,
                );
                events.send(FetchEvent::progress(FetchStage::Backoff, None));
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return AttemptsOutcome::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        let last = last_error.unwrap_or_else(|| FetchError::Internal("no attempt was made".into()));
        AttemptsOutcome::Done(Err(FetchError::NetworkRetryExhausted {
            attempts: max_attempts,
            last: Box::new(last),
        }))
    }
}

/// Runs one engine attempt, forwarding its progress events.
async fn run_attempt(
    engine: &dyn DownloadEngine,
    request: &DownloadRequest,
    events: &EventSender,
) -> Result<PathBuf, FetchError> {
    let mut stream = engine.download(request);
    while let Some(event) = stream.next().await {
        match event {
            FetchEvent::Progress { .. } => events.send(event),
            FetchEvent::Success(path) => return Ok(path),
            FetchEvent::Failure(error) => return Err(error),
        }
    }
    Err(FetchError::Network(format!(
        "{} download ended without a result",
        engine.name()
    )))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::stream;

    use crate::config::CircuitBreakerConfig;
    use crate::telemetry::RecordingTelemetry;

    use super::*;

    /// An engine that replays a fixed list of attempt results.
    struct MockEngine {
        name: &'static str,
        results: Mutex<Vec<Result<(), FetchError>>>,
        calls: AtomicUsize,
    }

    impl MockEngine {
        fn new(name: &'static str, results: Vec<Result<(), FetchError>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                results: Mutex::new(results),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(name: &'static str, error: FetchError) -> Arc<Self> {
            Self::new(name, vec![Err(error); 16])
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl DownloadEngine for MockEngine {
        fn name(&self) -> &'static str {
            self.name
        }

        fn supports(&self, url: &Url) -> bool {
            url.scheme() == "mock"
        }

        fn download(&self, request: &DownloadRequest) -> BoxStream<'static, FetchEvent> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock().unwrap();
            let result = if results.is_empty() {
                Ok(())
            } else {
                results.remove(0)
            };
            let terminal = match result {
                Ok(()) => FetchEvent::Success(request.destination.clone()),
                Err(error) => FetchEvent::Failure(error),
            };
            stream::iter([
                FetchEvent::progress(FetchStage::Downloading, Some(0.5)),
                terminal,
            ])
            .boxed()
        }
    }

    /// An engine whose attempts never finish.
    struct HangingEngine;

    impl DownloadEngine for HangingEngine {
        fn name(&self) -> &'static str {
            "hanging"
        }

        fn supports(&self, _url: &Url) -> bool {
            true
        }

        fn download(&self, _request: &DownloadRequest) -> BoxStream<'static, FetchEvent> {
            stream::pending().boxed()
        }
    }

    /// An engine that replays a fixed list of attempts, where `None` never finishes.
    ///
    /// Succeeds once the list is used up.
    struct ScriptedEngine {
        steps: Mutex<Vec<Option<Result<(), FetchError>>>>,
        calls: AtomicUsize,
    }

    impl ScriptedEngine {
        fn new(steps: Vec<Option<Result<(), FetchError>>>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl DownloadEngine for ScriptedEngine {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn supports(&self, _url: &Url) -> bool {
            true
        }

        fn download(&self, request: &DownloadRequest) -> BoxStream<'static, FetchEvent> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut steps = self.steps.lock().unwrap();
            let step = if steps.is_empty() {
                Some(Ok(()))
            } else {
                steps.remove(0)
            };
            match step {
                Some(Ok(())) => stream::iter([FetchEvent::Success(request.destination.clone())]).boxed(),
                Some(Err(error)) => stream::iter([FetchEvent::Failure(error)]).boxed(),
                None => stream::pending().boxed(),
            }
        }
    }

    fn half_open_downloader(engine: Arc<ScriptedEngine>) -> (Arc<RecordingTelemetry>, ResilientDownloader) {
        let config = DownloadConfig {
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 1,
                timeout_threshold: 1,
                half_open_after: Some(Duration::from_secs(30)),
            },
            ..config()
        };
        let telemetry = RecordingTelemetry::new();
        let downloader = ResilientDownloader::new(vec![engine], &config, telemetry.clone());
        (telemetry, downloader)
    }

    fn config() -> DownloadConfig {
        DownloadConfig {
            max_attempts: 4,
            attempt_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(1),
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(1),
            max_concurrent_downloads: 2,
            large_file_threshold: 1024,
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 2,
                timeout_threshold: 2,
                half_open_after: None,
            },
        }
    }

    fn downloader(engines: Vec<Arc<dyn DownloadEngine>>) -> (Arc<RecordingTelemetry>, ResilientDownloader) {
        let telemetry = RecordingTelemetry::new();
        let downloader = ResilientDownloader::new(engines, &config(), telemetry.clone());
        (telemetry, downloader)
    }

    fn fetch(downloader: &ResilientDownloader) -> FetchStream {
        let url = Url::parse("mock://origin/document.pdf").unwrap();
        downloader.fetch(url, PathBuf::from("/tmp/document.pdf"), false, CancellationToken::new())
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_exhausted() {
        let engine = MockEngine::failing("mock", FetchError::Network("connection reset".into()));
        let (telemetry, downloader) = downloader(vec![engine.clone()]);

        let outcome = fetch(&downloader).outcome().await;

        assert_eq!(engine.calls(), 4);
        let FetchOutcome::Failure(FetchError::NetworkRetryExhausted { attempts, last }) = outcome else {
            panic!("unexpected outcome: {outcome:?}");
        };
        assert_eq!(attempts, 4);
        assert_eq!(*last, FetchError::Network("connection reset".into()));
        assert_eq!(
            telemetry.messages_in("download"),
            vec![
                "download:retry:mock:2".to_owned(),
                "download:retry:mock:3".to_owned(),
                "download:retry:mock:4".to_owned(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_errors_are_not_retried() {
        let engine = MockEngine::failing("mock", FetchError::Corrupted("empty file".into()));
        let (_, downloader) = downloader(vec![engine.clone()]);

        let outcome = fetch(&downloader).outcome().await;

        assert_eq!(engine.calls(), 1);
        assert_eq!(
            outcome,
            FetchOutcome::Failure(FetchError::Corrupted("empty file".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn falls_over_to_the_next_engine() {
        let first = MockEngine::failing("first", FetchError::Timeout(Duration::from_secs(10)));
        let second = MockEngine::new("second", vec![Ok(())]);
        let (telemetry, downloader) = downloader(vec![first.clone(), second.clone()]);

        let events: Vec<_> = fetch(&downloader).collect().await;

        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 1);
        assert_eq!(
            events.last(),
            Some(&FetchEvent::Success(PathBuf::from("/tmp/document.pdf")))
        );
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert_eq!(
            telemetry.messages_in("download"),
            vec!["download:retry:second:2".to_owned()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_time_out() {
        let (_, downloader) = downloader(vec![Arc::new(HangingEngine)]);
        let url = Url::parse("https://example.com/slow.pdf").unwrap();

        let outcome = downloader
            .fetch(url, PathBuf::from("/tmp/slow.pdf"), false, CancellationToken::new())
            .outcome()
            .await;

        let FetchOutcome::Failure(error) = outcome else {
            panic!("unexpected outcome: {outcome:?}");
        };
        assert!(error.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_the_stream_silently() {
        let (_, downloader) = downloader(vec![Arc::new(HangingEngine)]);
        let url = Url::parse("https://example.com/slow.pdf").unwrap();
        let cancel = CancellationToken::new();

        let mut stream = downloader.fetch(url, PathBuf::from("/tmp/slow.pdf"), false, cancel.clone());
        assert_eq!(
            stream.next().await,
            Some(FetchEvent::progress(FetchStage::Connecting, None))
        );

        cancel.cancel();
        assert_eq!(stream.next().await, None);
        assert_eq!(stream.outcome().await, FetchOutcome::Cancelled);
        assert_eq!(downloader.circuit_breaker().consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_blocks_downloads() {
        let engine = MockEngine::failing("mock", FetchError::Unsafe("login page".into()));
        let (_, downloader) = downloader(vec![engine.clone()]);

        for _ in 0..2 {
            fetch(&downloader).outcome().await;
        }
        assert_eq!(downloader.circuit_breaker().state(), CircuitState::Open);

        let outcome = fetch(&downloader).outcome().await;
        assert!(matches!(
            outcome,
            FetchOutcome::Failure(FetchError::CircuitOpen { .. })
        ));
        assert_eq!(engine.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_breaker_recovers_through_fetch() {
        let corrupted = || FetchError::Corrupted("empty file".into());
        let engine = ScriptedEngine::new(vec![Some(Err(corrupted())), Some(Err(corrupted()))]);
        let (telemetry, downloader) = half_open_downloader(engine.clone());

        assert_eq!(
            fetch(&downloader).outcome().await,
            FetchOutcome::Failure(corrupted())
        );
        assert_eq!(downloader.circuit_breaker().state(), CircuitState::Open);
        let blocked = fetch(&downloader).outcome().await;
        assert!(matches!(blocked, FetchOutcome::Failure(FetchError::CircuitOpen { .. })));
        assert_eq!(engine.calls(), 1);

        // a failing half-open attempt opens the breaker again
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(
            fetch(&downloader).outcome().await,
            FetchOutcome::Failure(corrupted())
        );
        assert_eq!(engine.calls(), 2);
        let FetchOutcome::Failure(FetchError::CircuitOpen { reason }) = fetch(&downloader).outcome().await
        else {
            panic!("expected the breaker to be open");
        };
        assert!(reason.starts_with("probe download failed"), "{reason}");

        // a succeeding one closes it
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(
            fetch(&downloader).outcome().await,
            FetchOutcome::Success(PathBuf::from("/tmp/document.pdf"))
        );
        assert_eq!(engine.calls(), 3);
        assert_eq!(downloader.circuit_breaker().state(), CircuitState::Closed);
        assert_eq!(downloader.circuit_breaker().consecutive_failures(), 0);
        assert_eq!(
            telemetry.messages_in("download"),
            vec![
                "download:circuit_open:consecutive_failures".to_owned(),
                "download:circuit_open:probe_failed".to_owned(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_half_open_attempt_frees_the_slot() {
        let engine = ScriptedEngine::new(vec![
            Some(Err(FetchError::Corrupted("empty file".into()))),
            None,
        ]);
        let (_, downloader) = half_open_downloader(engine.clone());
        fetch(&downloader).outcome().await;
        assert_eq!(downloader.circuit_breaker().state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(31)).await;
        let cancel = CancellationToken::new();
        let url = Url::parse("mock://origin/document.pdf").unwrap();
        let mut attempt = downloader.fetch(url, PathBuf::from("/tmp/document.pdf"), false, cancel.clone());
        assert_eq!(
            attempt.next().await,
            Some(FetchEvent::progress(FetchStage::Connecting, None))
        );
        assert_eq!(engine.calls(), 2);

        cancel.cancel();
        assert_eq!(attempt.next().await, None);

        // the next call is let through right away, without dropping the cancelled stream first
        assert_eq!(
            fetch(&downloader).outcome().await,
            FetchOutcome::Success(PathBuf::from("/tmp/document.pdf"))
        );
        assert_eq!(engine.calls(), 3);
        assert_eq!(downloader.circuit_breaker().state(), CircuitState::Closed);
        drop(attempt);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_half_open_attempt_frees_the_slot() {
        let engine = ScriptedEngine::new(vec![
            Some(Err(FetchError::Corrupted("empty file".into()))),
            None,
        ]);
        let (_, downloader) = half_open_downloader(engine.clone());
        fetch(&downloader).outcome().await;

        tokio::time::advance(Duration::from_secs(31)).await;
        let mut attempt = fetch(&downloader);
        attempt.next().await;
        drop(attempt);

        assert!(matches!(
            fetch(&downloader).outcome().await,
            FetchOutcome::Success(_)
        ));
        assert_eq!(engine.calls(), 3);
    }

    #[tokio::test]
    async fn unsupported_urls_fail() {
        let (_, downloader) = downloader(vec![MockEngine::new("mock", vec![])]);
        let url = Url::parse("ftp://example.com/document.pdf").unwrap();

        let outcome = downloader
            .fetch(url, PathBuf::from("/tmp/document.pdf"), false, CancellationToken::new())
            .outcome()
            .await;

        assert!(matches!(outcome, FetchOutcome::Failure(FetchError::NoEngine(_))));
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let base = Duration::from_millis(500);
        let cap = Duration::from_secs(3);
        let delays: Vec<_> = (1..=5).map(|a| backoff_delay(base, cap, a)).collect();
        assert_eq!(
            delays,
            [
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3),
                Duration::from_secs(3),
            ]
        );
        assert_eq!(backoff_delay(base, cap, 200), cap);
    }
}
