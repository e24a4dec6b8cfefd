//! Bounded retry with doubling backoff for chain calls.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;
use vtn_chain::ChainResult;

/// How often and how patiently to retry a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, where `attempt` is 1-based.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails permanently, or the attempt budget is
/// spent. Returns the last result and the number of attempts made.
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> (ChainResult<T>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ChainResult<T>>,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return (Ok(value), attempt),
            Err(err) if err.is_transient() && attempt < max => {
                let delay = policy.delay_after(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "Retrying chain call");
                sleep(delay).await;
            }
            Err(err) => return (Err(err), attempt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use vtn_chain::ChainError;

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(500));
        assert_eq!(policy.delay_after(2), Duration::from_secs(1));
        assert_eq!(policy.delay_after(3), Duration::from_secs(2));
        assert_eq!(policy.delay_after(4), Duration::from_secs(3));
        assert_eq!(policy.delay_after(40), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let calls = AtomicU32::new(0);
        let (result, attempts) = retry_transient(&RetryPolicy::default(), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ChainError::Rpc("flaky".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let (result, attempts) = retry_transient(&RetryPolicy::default(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ChainError::Rejected("bad origin".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhausted() {
        let (result, attempts) = retry_transient(&RetryPolicy::default(), || async {
            Err::<(), _>(ChainError::Timeout(Duration::from_secs(1)))
        })
        .await;
        assert!(matches!(result, Err(ChainError::Timeout(_))));
        assert_eq!(attempts, 3);
    }
}
