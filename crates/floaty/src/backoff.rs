//! Exponential back-off with jitter and a permanent-error marker.

use common::Error;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::debug;

/// Exponential back-off policy.
///
/// Successive calls to [`next_backoff`](ExponentialBackOff::next_backoff)
/// return growing, jittered intervals capped at `max_interval`. Once
/// `max_elapsed_time` has passed since creation (or the last
/// [`reset`](ExponentialBackOff::reset)) the policy signals exhaustion by
/// returning `None`. A zero `max_elapsed_time` means unbounded.
#[derive(Debug, Clone)]
pub struct ExponentialBackOff {
    pub initial_interval: Duration,
    pub randomization_factor: f64,
    pub multiplier: f64,
    pub max_interval: Duration,
    pub max_elapsed_time: Duration,

    current_interval: Duration,
    start: Instant,
}

impl Default for ExponentialBackOff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

impl ExponentialBackOff {
    /// Create a policy starting at `initial_interval` with the conventional
    /// growth parameters (factor 0.5, multiplier 1.5, 60 s cap, unbounded).
    pub fn new(initial_interval: Duration) -> Self {
        Self {
            initial_interval,
            randomization_factor: 0.5,
            multiplier: 1.5,
            max_interval: Duration::from_secs(60),
            max_elapsed_time: Duration::ZERO,
            current_interval: initial_interval,
            start: Instant::now(),
        }
    }

    /// Restart the policy from its initial interval.
    pub fn reset(&mut self) {
        self.current_interval = self.initial_interval;
        self.start = Instant::now();
    }

    /// Next delay to sleep, or `None` when the policy has given up.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if !self.max_elapsed_time.is_zero() && self.start.elapsed() >= self.max_elapsed_time {
            return None;
        }

        let sample = jitter(self.current_interval, self.randomization_factor);

        let next = self.current_interval.mul_f64(self.multiplier);
        self.current_interval = next.min(self.max_interval);

        Some(sample)
    }
}

/// Sample a duration uniformly from `interval` ± `factor`.
pub fn jitter(interval: Duration, factor: f64) -> Duration {
    if factor <= 0.0 || interval.is_zero() {
        return interval;
    }

    let delta = interval.mul_f64(factor);
    let low = interval - delta;
    let high = interval + delta;
    rand::thread_rng().gen_range(low..=high)
}

/// Back-off policy as configured in the YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct BackOffConfig {
    #[serde(with = "humantime_serde")]
    pub initial_interval: Duration,

    pub multiplier: f64,

    #[serde(with = "humantime_serde")]
    pub max_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub max_elapsed_time: Duration,
}

impl Default for BackOffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            multiplier: 1.1,
            max_interval: Duration::from_secs(10),
            max_elapsed_time: Duration::ZERO,
        }
    }
}

impl BackOffConfig {
    /// Build a fresh back-off policy from this configuration.
    pub fn build(&self) -> ExponentialBackOff {
        let mut bo = ExponentialBackOff::new(self.initial_interval);
        bo.multiplier = self.multiplier;
        bo.max_interval = self.max_interval;
        bo.max_elapsed_time = self.max_elapsed_time;
        bo.reset();
        bo
    }
}

/// An error classified for retry purposes.
///
/// Permanent errors mark conditions where retrying cannot help (invalid
/// credentials, HTTP 4xx responses); retry helpers stop immediately and
/// surface the inner error.
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error(transparent)]
    Transient(Error),

    #[error(transparent)]
    Permanent(Error),
}

impl RetryError {
    pub fn transient(err: impl Into<Error>) -> Self {
        RetryError::Transient(err.into())
    }

    pub fn permanent(err: impl Into<Error>) -> Self {
        RetryError::Permanent(err.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, RetryError::Permanent(_))
    }

    pub fn into_inner(self) -> Error {
        match self {
            RetryError::Transient(err) | RetryError::Permanent(err) => err,
        }
    }
}

/// Run `op` until it succeeds, fails permanently or the back-off gives up.
pub async fn retry<T, F, Fut>(mut backoff: ExponentialBackOff, mut op: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RetryError>>,
{
    backoff.reset();

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(RetryError::Permanent(err)) => return Err(err),
            Err(RetryError::Transient(err)) => match backoff.next_backoff() {
                Some(delay) => {
                    debug!(error = %err, delay_ms = delay.as_millis() as u64, "Retrying");
                    tokio::time::sleep(delay).await;
                }
                None => return Err(err),
            },
        }
    }
}

/// Retry policy for cloud metadata endpoints.
pub fn metadata_backoff(max_elapsed_time: Duration) -> ExponentialBackOff {
    let mut bo = ExponentialBackOff::new(Duration::from_millis(100));
    bo.max_interval = Duration::from_secs(1);
    bo.max_elapsed_time = max_elapsed_time;
    bo.reset();
    bo
}
