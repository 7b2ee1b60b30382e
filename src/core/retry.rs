use crate::utils::error::GenerationError;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

pub const MAX_ATTEMPTS_LIMIT: u32 = 10;

/// How often a backoff sleep looks at the cancel flag.
const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Bounded exponential backoff for transient generation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay after failed `attempt` (1-based). A `Retry-After` hint wins when longer.
    pub fn delay_for(&self, attempt: u32, err: &GenerationError) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let backoff = self.base_delay.saturating_mul(factor);
        let delay = match err {
            GenerationError::RateLimited {
                retry_after: Some(hint),
            } => backoff.max(*hint),
            _ => backoff,
        };
        delay.min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails permanently, or attempts run out.
    /// `op` receives the 1-based attempt number. Once `cancel` is set no
    /// further attempt starts and the last error is returned.
    pub async fn run<T, F, Fut>(&self, cancel: &AtomicBool, mut op: F) -> Result<T, GenerationError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, GenerationError>>,
    {
        let max_attempts = self.max_attempts.clamp(1, MAX_ATTEMPTS_LIMIT);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    if cancel.load(Ordering::SeqCst) {
                        tracing::warn!(attempt, code = err.reason_code(), "🛑 abort requested, not retrying");
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt, &err);
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        code = err.reason_code(),
                        "⏳ transient LLM error, retrying"
                    );
                    if !sleep_unless_cancelled(delay, cancel).await {
                        tracing::warn!(attempt, code = err.reason_code(), "🛑 abort requested during backoff");
                        return Err(err);
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Sleeps for `delay` in short slices. Returns `false` when `cancel` was set.
async fn sleep_unless_cancelled(delay: Duration, cancel: &AtomicBool) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if cancel.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        tokio::time::sleep((deadline - now).min(CANCEL_POLL)).await;
    }
}

/// Keeps at least `min_interval` between consecutive requests.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    last: Option<Instant>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub async fn wait(&mut self) {
        if let Some(last) = self.last {
            let ready_at = last + self.min_interval;
            if ready_at > Instant::now() {
                tracing::debug!(
                    wait_ms = (ready_at - Instant::now()).as_millis() as u64,
                    "pacing request"
                );
                tokio::time::sleep_until(ready_at).await;
            }
        }
        self.last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    static NOT_CANCELLED: AtomicBool = AtomicBool::new(false);

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        };
        let err = GenerationError::Timeout;

        assert_eq!(policy.delay_for(1, &err), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2, &err), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3, &err), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4, &err), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40, &err), Duration::from_secs(5));
    }

    #[test]
    fn test_retry_after_hint_is_respected_but_capped() {
        let policy = RetryPolicy::default();

        let hinted = GenerationError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(policy.delay_for(1, &hinted), Duration::from_secs(7));

        let huge = GenerationError::RateLimited {
            retry_after: Some(Duration::from_secs(600)),
        };
        assert_eq!(policy.delay_for(1, &huge), policy.max_delay);
    }

    #[tokio::test]
    async fn test_run_retries_transient_errors() {
        let calls = &AtomicU32::new(0);

        let result = fast_policy(3)
            .run(&NOT_CANCELLED, move |_| async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(GenerationError::RateLimited { retry_after: None })
                } else {
                    Ok("done")
                }
            })
            .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_gives_up_after_max_attempts() {
        let calls = &AtomicU32::new(0);

        let result: Result<(), _> = fast_policy(2)
            .run(&NOT_CANCELLED, move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GenerationError::Timeout)
            })
            .await;

        assert_eq!(result, Err(GenerationError::Timeout));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_run_does_not_retry_permanent_errors() {
        let calls = &AtomicU32::new(0);

        let result: Result<(), _> = fast_policy(5)
            .run(&NOT_CANCELLED, move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GenerationError::ServerError {
                    status: Some(500),
                    message: "boom".to_string(),
                })
            })
            .await;

        assert!(matches!(result, Err(GenerationError::ServerError { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_flag_stops_retrying() {
        let calls = &AtomicU32::new(0);
        let cancel = &AtomicBool::new(false);

        let result: Result<(), _> = fast_policy(5)
            .run(cancel, move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                // 第一次請求進行中收到中斷
                cancel.store(true, Ordering::SeqCst);
                Err(GenerationError::Timeout)
            })
            .await;

        assert_eq!(result, Err(GenerationError::Timeout));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff_sleep() {
        let cancel = std::sync::Arc::new(AtomicBool::new(false));
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
        };
        let flag = std::sync::Arc::clone(&cancel);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
        });

        let start = Instant::now();
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = policy
            .run(&cancel, move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GenerationError::RateLimited { retry_after: None })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_pacer_spaces_requests() {
        let mut pacer = RequestPacer::new(Duration::from_millis(50));
        let start = Instant::now();

        pacer.wait().await;
        pacer.wait().await;

        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_pacer_first_request_is_immediate() {
        let mut pacer = RequestPacer::new(Duration::from_secs(60));
        let start = Instant::now();

        pacer.wait().await;

        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
