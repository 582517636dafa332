use std::sync::Mutex;

use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::telemetry::SharedTelemetry;
use crate::utils::sync::lock;

use super::FetchError;

/// Whether downloads are currently let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
}

/// How a call was let through the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The breaker is closed.
    Normal,
    /// The breaker is open, but lets this single call probe the origin.
    Probe,
}

#[derive(Debug)]
struct BreakerState {
    consecutive_failures: usize,
    consecutive_timeouts: usize,
    /// Set while the breaker is open.
    opened: Option<Opened>,
    probe_in_flight: bool,
}

#[derive(Debug, Clone)]
struct Opened {
    at: Instant,
    reason: String,
}

/// Stops all downloads after a run of failed downloads.
///
/// The breaker counts whole downloads, not individual attempts. It opens once
/// `failure_threshold` downloads in a row failed terminally, or `timeout_threshold` downloads in
/// a row gave up because their attempts timed out. Failures that say nothing about the origin's
/// health, like a missing document, neither count nor reset the streak.
///
/// An open breaker stays open until [`reset`](Self::reset) is called. If `half_open_after` is
/// configured, it additionally lets a single probe download through once that much time has
/// passed, and closes again if the probe succeeds.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    telemetry: SharedTelemetry,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, telemetry: SharedTelemetry) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState {
                consecutive_failures: 0,
                consecutive_timeouts: 0,
                opened: None,
                probe_in_flight: false,
            }),
            telemetry,
        }
    }

    pub fn state(&self) -> CircuitState {
        match lock(&self.state).opened {
            Some(_) => CircuitState::Open,
            None => CircuitState::Closed,
        }
    }

    /// The number of downloads in a row that failed terminally.
    pub fn consecutive_failures(&self) -> usize {
        lock(&self.state).consecutive_failures
    }

    /// Checks whether a new download may start.
    ///
    /// Returns [`FetchError::CircuitOpen`] if it may not.
    pub fn admit(&self) -> Result<Admission, FetchError> {
        let mut state = lock(&self.state);
        let Some(opened) = state.opened.clone() else {
            return Ok(Admission::Normal);
        };

        if let Some(half_open_after) = self.config.half_open_after
            && !state.probe_in_flight
            && opened.at.elapsed() >= half_open_after
        {
            state.probe_in_flight = true;
            tracing::info!("Letting a probe download through the open circuit breaker");
            return Ok(Admission::Probe);
        }

        Err(FetchError::CircuitOpen {
            reason: opened.reason,
        })
    }

    /// Records a successful download, closing the breaker.
    pub fn record_success(&self, _admission: Admission) {
        let mut state = lock(&self.state);
        state.consecutive_failures = 0;
        state.consecutive_timeouts = 0;
        state.probe_in_flight = false;
        if state.opened.take().is_some() {
            tracing::info!("Closing circuit breaker after a successful download");
        }
    }

    /// Records a terminal download failure.
    pub fn record_failure(&self, admission: Admission, error: &FetchError) {
        let counts = matches!(
            error,
            FetchError::Corrupted(_)
                | FetchError::Unsafe(_)
                | FetchError::NetworkRetryExhausted { .. }
        );

        let mut state = lock(&self.state);
        if admission == Admission::Probe {
            state.probe_in_flight = false;
        }
        if !counts {
            return;
        }

        state.consecutive_failures += 1;
        if error.is_timeout() {
            state.consecutive_timeouts += 1;
        } else {
            state.consecutive_timeouts = 0;
        }

        if admission == Admission::Probe {
            let reason = format!("probe download failed: {error}");
            self.open(&mut state, "probe_failed", reason);
        } else if state.opened.is_none() {
            if state.consecutive_timeouts >= self.config.timeout_threshold.max(1) {
                let reason = format!(
                    "{} consecutive downloads timed out, last error: {error}",
                    state.consecutive_timeouts
                );
                self.open(&mut state, "consecutive_timeouts", reason);
            } else if state.consecutive_failures >= self.config.failure_threshold.max(1) {
                let reason = format!(
                    "{} consecutive downloads failed, last error: {error}",
                    state.consecutive_failures
                );
                self.open(&mut state, "consecutive_failures", reason);
            }
        }
    }

    /// Records a download that ended without a result, e.g. because it was cancelled.
    pub fn record_abandoned(&self, admission: Admission) {
        if admission == Admission::Probe {
            lock(&self.state).probe_in_flight = false;
        }
    }

    /// Closes the breaker and forgets all failures.
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        state.consecutive_failures = 0;
        state.consecutive_timeouts = 0;
        state.probe_in_flight = false;
        if state.opened.take().is_some() {
            tracing::info!("Circuit breaker was reset");
        }
    }

    fn open(&self, state: &mut BreakerState, code: &str, reason: String) {
        tracing::warn!(%reason, "Opening download circuit breaker");
        metric!(counter("service.download.circuit_open") += 1, "reason" => code);
        self.telemetry
            .breadcrumb("download", format!("download:circuit_open:{code}"));
        state.opened = Some(Opened {
            at: Instant::now(),
            reason,
        });
    }
}
