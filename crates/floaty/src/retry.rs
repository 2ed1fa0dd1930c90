//! Steady-cadence operation loop with retry back-off on failure.

use crate::backoff::{jitter, ExponentialBackOff, RetryError};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Randomisation factor applied to the steady cadence.
const CADENCE_JITTER: f64 = 0.1;

/// Call `op` repeatedly until the scope is cancelled.
///
/// While `op` keeps succeeding it runs once per `delay` (jittered). On a
/// transient failure the loop switches to `retry_backoff` spacing until the
/// operation succeeds again or the back-off gives up; a permanent failure
/// abandons retries immediately and the loop resumes the steady cadence at
/// the next tick. Cancellation is honoured both between calls and while a
/// call is in flight.
pub async fn loop_with_retries<F, Fut>(
    scope: CancellationToken,
    delay: Duration,
    mut retry_backoff: ExponentialBackOff,
    mut op: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), RetryError>>,
{
    let mut pending = false;

    loop {
        let result = tokio::select! {
            result = op() => result,
            _ = scope.cancelled() => return,
        };

        match result {
            Ok(()) => pending = false,
            Err(RetryError::Permanent(err)) => {
                debug!(error = %err, "Giving up on retries due to permanent error");
                pending = false;
            }
            Err(RetryError::Transient(err)) => {
                debug!(error = %err, "Operation failed");
                if !pending {
                    pending = true;
                    retry_backoff.reset();
                }
            }
        }

        let mut timer_duration = jitter(delay, CADENCE_JITTER);

        if pending {
            match retry_backoff.next_backoff() {
                Some(next) => timer_duration = next,
                None => {
                    debug!("Giving up on retries");
                    pending = false;
                }
            }
        }

        debug!(sleep_ms = timer_duration.as_millis() as u64, "Sleeping");

        tokio::select! {
            _ = scope.cancelled() => return,
            _ = sleep(timer_duration) => {}
        }
    }
}
