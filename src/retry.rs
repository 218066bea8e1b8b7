use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Returned by the retry policy after a failed attempt: sleep for `delay`,
/// then make attempt number `attempt + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryDecision {
    /// 1-based count of consecutive failures.
    pub attempt: u32,
    pub delay: Duration,
}

/// Fixed-backoff, unbounded retry policy for workload launches.
///
/// Never gives up; consecutive failures are counted for logging only.
pub struct RetryPolicy {
    delay: Duration,
    current_attempt: u32,
}

impl RetryPolicy {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            current_attempt: 0,
        }
    }

    /// Record a failed attempt.
    pub fn on_failure(&mut self) -> RetryDecision {
        self.current_attempt = self.current_attempt.saturating_add(1);
        RetryDecision {
            attempt: self.current_attempt,
            delay: self.delay,
        }
    }

    /// Reset after a success.
    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    /// Current attempt count (0 = no failures yet).
    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }
}

/// Run `attempt` until it succeeds, sleeping the policy delay between tries.
///
/// Returns `None` only if `cancel` fires first.
pub async fn retry_until_ok<T, E, F>(
    policy: &mut RetryPolicy,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Option<T>
where
    F: FnMut() -> Result<T, E>,
    E: std::fmt::Display,
{
    loop {
        if cancel.is_cancelled() {
            return None;
        }
        match attempt() {
            Ok(value) => {
                if policy.current_attempt() > 0 {
                    warn!(
                        failed_attempts = policy.current_attempt(),
                        "succeeded after retrying"
                    );
                }
                policy.reset();
                return Some(value);
            }
            Err(e) => {
                let RetryDecision { attempt, delay } = policy.on_failure();
                error!(
                    error = %e,
                    attempt,
                    delay_secs = delay.as_secs_f64(),
                    "attempt failed, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
