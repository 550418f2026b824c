//! Exponential-backoff retry and a three-state circuit breaker.
//!
//! Every database probe in this crate runs as
//! `retry_with_backoff(|| breaker.execute(op), profile)`: the retry profile
//! decides which failures are transient, and the breaker stops hammering a
//! target that keeps failing.

use crate::error::{DiagnosticError, error_chain_message};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Predicate deciding whether a failure is worth another attempt
pub type RetryPredicate = Arc<dyn Fn(&(dyn Error + 'static)) -> bool + Send + Sync>;

/// Transient failures of a connection attempt.
///
/// The lower-case text of every error in the source chain is matched against
/// each signature.
pub const DATABASE_CONNECTION_SIGNATURES: &[&str] = &[
    "econnrefused",
    "enotfound",
    "etimedout",
    "econnreset",
    "connection terminated",
    "server closed the connection",
    "timeout expired",
    "database is starting up",
    "too many connections",
    "connection limit exceeded",
    "connection refused",
    "connection reset",
    "connection timeout",
    "timed out",
];

/// Transient failures of a query on an established connection
pub const QUERY_SIGNATURES: &[&str] = &[
    "connection terminated",
    "server closed the connection",
    "timeout expired",
    "connection reset",
    "broken pipe",
];

/// Generic transient failures used by the default profile
pub const DEFAULT_SIGNATURES: &[&str] = &[
    "econnrefused",
    "enotfound",
    "etimedout",
    "econnreset",
    "epipe",
    "connection terminated",
    "server closed the connection",
    "timeout expired",
];

/// Retry parameters.
///
/// # Example
/// ```rust
/// use cubecheck_core::retry::RetryOptions;
/// use std::time::Duration;
///
/// let options = RetryOptions::database_connection().with_max_attempts(5);
/// assert_eq!(options.max_attempts, 5);
/// assert_eq!(options.initial_delay, Duration::from_secs(2));
/// ```
#[derive(Clone)]
pub struct RetryOptions {
    /// Upper bound on invocations of the operation (at least one is made)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Cap applied before jitter
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
    /// Extra random delay as a fraction of the capped delay, in `[0, 1]`
    pub jitter_factor: f64,
    /// `None` retries every failure
    pub is_retryable: Option<RetryPredicate>,
}

impl std::fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter_factor", &self.jitter_factor)
            .field("is_retryable", &self.is_retryable.is_some())
            .finish()
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            is_retryable: Some(retry_on(DEFAULT_SIGNATURES)),
        }
    }
}

/// Builds a predicate matching any of `signatures` in the error chain.
pub fn retry_on(signatures: &'static [&'static str]) -> RetryPredicate {
    Arc::new(move |error: &(dyn Error + 'static)| {
        let message = error_chain_message(error).to_lowercase();
        signatures.iter().any(|s| message.contains(s))
    })
}

impl RetryOptions {
    /// Profile for opening connections: 3 attempts starting at 2s.
    pub fn database_connection() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
            is_retryable: Some(retry_on(DATABASE_CONNECTION_SIGNATURES)),
        }
    }

    /// Profile for catalog queries: 2 attempts starting at 500ms, retrying
    /// only mid-query connection loss.
    pub fn query() -> Self {
        Self {
            max_attempts: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            is_retryable: Some(retry_on(QUERY_SIGNATURES)),
        }
    }

    /// Builder method to set the attempt limit.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Builder method to set the initial and maximum delays.
    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }

    /// Builder method to set jitter.
    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    /// Builder method to replace the retry predicate.
    pub fn with_predicate(mut self, predicate: RetryPredicate) -> Self {
        self.is_retryable = Some(predicate);
        self
    }

    /// Delay after failed attempt `attempt` (1-based), given a random sample
    /// in `[0, 1)`.
    ///
    /// `floor(min(initial * multiplier^(attempt-1), max) * (1 + jitter * random))`
    pub fn delay_for_attempt(&self, attempt: u32, random: f64) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let initial_ms = self.initial_delay.as_secs_f64() * 1000.0;
        let max_ms = self.max_delay.as_secs_f64() * 1000.0;

        let exponential = initial_ms * self.backoff_multiplier.powi(exponent);
        let capped = exponential.min(max_ms);
        let jitter = capped * self.jitter_factor.clamp(0.0, 1.0) * random.clamp(0.0, 1.0);

        Duration::from_millis((capped + jitter).floor().max(0.0) as u64)
    }

    fn should_retry(&self, error: &(dyn Error + 'static)) -> bool {
        self.is_retryable
            .as_ref()
            .is_none_or(|predicate| predicate(error))
    }
}

/// Outcome of [`retry_with_backoff`].
#[derive(Debug)]
pub struct RetryResult<T, E = DiagnosticError> {
    /// Final value, or the error of the last attempt
    pub outcome: Result<T, E>,
    /// Invocations made, never more than `max_attempts`
    pub attempts: u32,
    /// Wall time including sleeps
    pub total_time: Duration,
}

impl<T, E> RetryResult<T, E> {
    /// Whether the last attempt succeeded
    pub fn success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Discards the attempt accounting
    pub fn into_result(self) -> Result<T, E> {
        self.outcome
    }
}

/// Runs `operation` until it succeeds, returns a non-retryable error, or
/// `max_attempts` is reached.
///
/// No sleep follows the final attempt. Total suspension is bounded by
/// `max_attempts * max_delay * (1 + jitter_factor)`.
pub async fn retry_with_backoff<T, E, F, Fut>(mut operation: F, options: &RetryOptions) -> RetryResult<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Error + 'static,
{
    let start = Instant::now();
    let max_attempts = options.max_attempts.max(1);
    let mut attempt: u32 = 0;

    loop {
        attempt = attempt.saturating_add(1);
        debug!(attempt, max_attempts, "Attempting operation");

        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(attempts = attempt, "Operation succeeded after retries");
                }
                return RetryResult {
                    outcome: Ok(value),
                    attempts: attempt,
                    total_time: start.elapsed(),
                };
            }
            Err(err) => {
                warn!(attempt, max_attempts, error = %err, "Operation failed");

                let retryable = options.should_retry(&err);
                if !retryable {
                    info!(error = %err, "Error is not retryable, stopping attempts");
                }

                if !retryable || attempt >= max_attempts {
                    error!(
                        attempts = attempt,
                        total_time_ms = start.elapsed().as_millis(),
                        error = %err,
                        "Operation failed after retries"
                    );
                    return RetryResult {
                        outcome: Err(err),
                        attempts: attempt,
                        total_time: start.elapsed(),
                    };
                }

                let delay = options.delay_for_attempt(attempt, rand::random::<f64>());
                debug!(attempt, delay_ms = delay.as_millis(), "Waiting before next attempt");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls are rejected without being attempted
    Open,
    /// One probe call is allowed through
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
}

/// Three-state circuit breaker guarding one logical connection target.
///
/// Failures are counted consecutively: any success resets the count. After
/// `failure_threshold` failures the breaker opens and rejects calls with
/// [`DiagnosticError::CircuitOpen`] until `recovery_timeout` has passed since
/// the last failure. It then admits exactly one probe; the probe's outcome
/// closes or re-opens the breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerState>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(60))
    }
}

impl CircuitBreaker {
    /// Creates a closed breaker. A threshold of zero is treated as one.
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                last_failure: None,
                probe_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state, without applying any pending recovery transition
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Consecutive failures recorded so far
    pub fn failure_count(&self) -> u32 {
        self.lock().failures
    }

    /// Time since the most recent failure, if any
    pub fn since_last_failure(&self) -> Option<Duration> {
        self.lock().last_failure.map(|t| t.elapsed())
    }

    /// Decides whether a call may proceed, moving open to half-open once the
    /// recovery timeout has elapsed.
    fn admit(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let recovered = inner
                    .last_failure
                    .is_none_or(|t| t.elapsed() >= self.recovery_timeout);
                if recovered {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!("Circuit breaker transitioning to half-open state");
                }
                recovered
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!("Circuit breaker reset to closed state");
        }
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.probe_in_flight = false;
    }

    /// Records a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failures = inner.failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.probe_in_flight = false;

        let reopen = inner.state == CircuitState::HalfOpen;
        if reopen || (inner.state == CircuitState::Closed && inner.failures >= self.failure_threshold) {
            inner.state = CircuitState::Open;
            warn!(
                failures = inner.failures,
                threshold = self.failure_threshold,
                "Circuit breaker opened due to repeated failures"
            );
        }
    }

    /// Gives up a probe slot whose call ended without an outcome.
    ///
    /// A half-open breaker returns to open with the previous failure time, so
    /// the next call after the recovery timeout is admitted as a new probe.
    fn abandon_probe(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen && inner.probe_in_flight {
            inner.probe_in_flight = false;
            inner.state = CircuitState::Open;
            debug!("Circuit breaker probe abandoned before completion");
        }
    }

    /// Forces the breaker back to closed.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.last_failure = None;
        inner.probe_in_flight = false;
    }

    /// Runs `operation` if the breaker admits it.
    ///
    /// # Errors
    /// Returns [`DiagnosticError::CircuitOpen`] without invoking `operation`
    /// while the breaker is open, otherwise the operation's own error.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> crate::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = crate::Result<T>>,
    {
        if !self.admit() {
            return Err(DiagnosticError::CircuitOpen);
        }

        let mut guard = ProbeGuard {
            breaker: self,
            settled: false,
        };
        let outcome = operation().await;
        guard.settled = true;

        match outcome {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }
}

/// Releases a half-open probe slot when an admitted call is dropped before
/// it reports an outcome.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.abandon_probe();
        }
    }
}
