// Bounded retry with jittered exponential backoff for external calls.
//
// Only wrap reads and idempotent lookups in this. Persistence writes are
// never retried because a timed-out write may still have landed.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::{Rng, RngCore};

use crate::metrics;

/// Attempts before a transient failure is surfaced.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Same attempt budget with no sleeping between attempts.
    pub const fn immediate() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, Duration::from_millis(500))
    }
}

/// "Equal jitter": the delay lands in [backoff/2, backoff].
pub fn jittered_backoff(rng: &mut impl RngCore, backoff: Duration) -> Duration {
    let backoff_ms = backoff.as_millis() as u64;
    if backoff_ms <= 1 {
        return backoff;
    }

    let half_ms = backoff_ms / 2;
    let jitter_ms = rng.gen_range(0..=half_ms);
    Duration::from_millis(half_ms.saturating_add(jitter_ms))
}

/// Run `op` until it succeeds, fails permanently, or the attempt budget runs out.
///
/// `label` names the collaborator in logs and in the retry counter.
pub async fn retry_transient<T, E, F, Fut>(
    label: &str,
    policy: RetryPolicy,
    is_transient: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut backoff = policy.base_delay;
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && is_transient(&e) => {
                tracing::warn!(target_call = label, attempt, "Transient failure, retrying: {e}");
                metrics::EXTERNAL_RETRIES_TOTAL
                    .with_label_values(&[label])
                    .inc();

                let delay = jittered_backoff(&mut rand::thread_rng(), backoff);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                backoff = backoff.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => {
                if attempt > 1 {
                    tracing::error!(target_call = label, attempt, "Giving up: {e}");
                }
                return Err(e);
            }
        }
    }
}
