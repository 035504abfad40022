use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::OrchestratorError;

/// Strategy for computing delay between retry attempts.
#[derive(Debug, Clone)]
pub enum RetryStrategy {
    /// Exponential backoff doubling (or whatever `multiplier` says) per
    /// attempt, clamped to `max`.
    Exponential {
        base: Duration,
        max: Duration,
        multiplier: f64,
        /// Equal jitter: keep half the computed backoff and randomize the
        /// other half, so a burst of callers that failed together does not
        /// retry in lockstep.
        jitter: bool,
    },
    /// Constant delay between every retry attempt.
    Constant { delay: Duration },
}

impl RetryStrategy {
    /// Compute the delay for the given zero-based `attempt` number.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Self::Exponential {
                base,
                max,
                multiplier,
                jitter,
            } => {
                // Clamp the exponent so the powi cannot blow past f64
                // range for absurd attempt counts.
                let exponent = attempt.min(32);
                #[allow(clippy::cast_possible_wrap)]
                let backoff = base.as_secs_f64() * multiplier.powi(exponent as i32);
                let capped = backoff.min(max.as_secs_f64());
                let delayed = if *jitter {
                    let half = capped / 2.0;
                    half + rand::thread_rng().gen_range(0.0..=half)
                } else {
                    capped
                };
                Duration::from_secs_f64(delayed)
            }
            Self::Constant { delay } => *delay,
        }
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_millis(250),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Run `op` up to `1 + max_retries` times, sleeping per `strategy` between
/// attempts, retrying only errors for which
/// [`OrchestratorError::is_retryable`] holds. The overall deadline is the
/// caller's responsibility (wrap the whole call in `tokio::time::timeout`).
pub async fn with_retries<T, F, Fut>(
    op_name: &str,
    max_retries: u32,
    strategy: &RetryStrategy,
    mut op: F,
) -> Result<T, OrchestratorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, OrchestratorError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_retries => {
                let delay = strategy.delay_for(attempt);
                warn!(
                    op = op_name,
                    attempt,
                    error = %err,
                    delay_ms = %delay.as_millis(),
                    "retryable orchestrator error, will retry"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
