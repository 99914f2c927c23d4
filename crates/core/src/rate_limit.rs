use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::config::RateLimitSettings;
use crate::{Error, Result};

/// Upper bound for the exponential fallback used when no retry-after is given.
const MAX_FALLBACK_DELAY: Duration = Duration::from_secs(15 * 60);

/// A throttling response from the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSignal {
    pub status: u16,
    pub retry_after: Option<Duration>,
}

impl RateLimitSignal {
    pub fn from_error(err: &Error) -> Option<Self> {
        match err {
            Error::RateLimited {
                status,
                retry_after,
            } => Some(Self {
                status: *status,
                retry_after: *retry_after,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterState {
    pub request_count: u32,
    pub retry_count: u32,
    pub last_reset: Instant,
}

/// Paces calls that share one remote quota window and recovers from throttling.
pub struct RateLimiter {
    settings: RateLimitSettings,
    state: Mutex<RateLimiterState>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(RateLimiterState {
                request_count: 0,
                retry_count: 0,
                last_reset: Instant::now(),
            }),
        }
    }

    pub fn settings(&self) -> &RateLimitSettings {
        &self.settings
    }

    pub fn state(&self) -> RateLimiterState {
        *self.lock()
    }

    /// Waits before issuing a request; the wait grows with every request past
    /// the burst allowance of the current batch.
    pub async fn before_request(&self) {
        let (count, delay) = {
            let mut st = self.lock();
            st.request_count = st.request_count.saturating_add(1);
            (st.request_count, self.burst_delay(st.request_count))
        };
        if !delay.is_zero() {
            debug!(
                event = "rate_limit.pace",
                request_count = count,
                delay_ms = delay.as_millis() as u64,
                "rate_limit.pace"
            );
            sleep(delay).await;
        }
    }

    /// Sleeps for the signalled retry-after (or the fallback backoff) so the
    /// caller can retry the same operation. Fails once the retry budget is spent.
    pub async fn handle_rate_limit_signal(&self, signal: &RateLimitSignal) -> Result<()> {
        let (attempt, delay) = {
            let mut st = self.lock();
            if st.retry_count >= self.settings.max_retries {
                return Err(Error::RateLimitExhausted {
                    attempts: st.retry_count,
                });
            }
            st.retry_count += 1;
            let delay = signal
                .retry_after
                .unwrap_or_else(|| self.fallback_delay(st.retry_count));
            (st.retry_count, delay)
        };

        warn!(
            event = "rate_limit.throttled",
            status = signal.status,
            attempt,
            max_retries = self.settings.max_retries,
            delay_ms = delay.as_millis() as u64,
            "rate_limit.throttled"
        );
        sleep(delay).await;
        Ok(())
    }

    /// Runs `op` behind [`before_request`](Self::before_request), retrying it
    /// on throttling responses until the retry budget runs out.
    pub async fn call<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            self.before_request().await;
            match op().await {
                Err(err) => match RateLimitSignal::from_error(&err) {
                    Some(signal) => self.handle_rate_limit_signal(&signal).await?,
                    None => return Err(err),
                },
                ok => return ok,
            }
        }
    }

    pub fn reset_burst_counter(&self) {
        let mut st = self.lock();
        st.request_count = 0;
        st.last_reset = Instant::now();
    }

    pub fn reset_retry_counter(&self) {
        self.lock().retry_count = 0;
    }

    pub fn burst_delay(&self, request_count: u32) -> Duration {
        let over = request_count.saturating_sub(self.settings.burst_size);
        if over == 0 {
            return Duration::ZERO;
        }
        let delay = self.settings.burst_step_ms.saturating_mul(u64::from(over));
        Duration::from_millis(delay.min(self.settings.max_burst_delay_ms))
    }

    /// Delay for retry `attempt` (1-based) when the remote gave no retry-after.
    pub fn fallback_delay(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.settings.default_retry_after_ms);
        ExponentialBuilder::default()
            .with_min_delay(base)
            .with_max_delay(MAX_FALLBACK_DELAY)
            .with_factor(2.0)
            .with_max_times(attempt as usize)
            .build()
            .nth(attempt.saturating_sub(1) as usize)
            .unwrap_or(MAX_FALLBACK_DELAY)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RateLimiterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn settings() -> RateLimitSettings {
        RateLimitSettings {
            burst_size: 3,
            burst_step_ms: 100,
            max_burst_delay_ms: 1000,
            max_retries: 2,
            default_retry_after_ms: 1000,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn requests_past_burst_are_delayed() {
        let limiter = RateLimiter::new(settings());

        let started = Instant::now();
        limiter.before_request().await;
        let first = started.elapsed();

        for _ in 0..3 {
            limiter.before_request().await;
        }
        let before_last = Instant::now();
        limiter.before_request().await;
        let last = before_last.elapsed();

        assert_eq!(first, Duration::ZERO);
        assert!(last >= Duration::from_millis(200), "last={last:?}");
        assert_eq!(limiter.state().request_count, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_burst_counter_restores_allowance() {
        let limiter = RateLimiter::new(settings());
        for _ in 0..6 {
            limiter.before_request().await;
        }
        limiter.reset_burst_counter();

        let started = Instant::now();
        limiter.before_request().await;
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[test]
    fn burst_delay_is_capped() {
        let limiter = RateLimiter::new(settings());
        assert_eq!(limiter.burst_delay(3), Duration::ZERO);
        assert_eq!(limiter.burst_delay(4), Duration::from_millis(100));
        assert_eq!(limiter.burst_delay(50), Duration::from_millis(1000));
    }

    #[test]
    fn fallback_delay_doubles() {
        let limiter = RateLimiter::new(settings());
        assert_eq!(limiter.fallback_delay(1), Duration::from_secs(1));
        assert_eq!(limiter.fallback_delay(2), Duration::from_secs(2));
        assert_eq!(limiter.fallback_delay(3), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn signal_waits_for_retry_after() {
        let limiter = RateLimiter::new(settings());
        let started = Instant::now();
        limiter
            .handle_rate_limit_signal(&RateLimitSignal {
                status: 429,
                retry_after: Some(Duration::from_secs(2)),
            })
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn call_gives_up_after_max_retries() {
        let limiter = RateLimiter::new(settings());
        let calls = AtomicU32::new(0);
        let res: Result<()> = limiter
            .call(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(Error::RateLimited {
                        status: 429,
                        retry_after: None,
                    })
                }
            })
            .await;

        assert!(matches!(res, Err(Error::RateLimitExhausted { attempts: 2 })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn call_passes_through_other_errors() {
        let limiter = RateLimiter::new(settings());
        let res: Result<()> = limiter
            .call(|| async {
                Err(Error::RemoteApi {
                    status: 500,
                    message: "boom".to_string(),
                })
            })
            .await;
        assert!(matches!(res, Err(Error::RemoteApi { status: 500, .. })));
        assert_eq!(limiter.state().retry_count, 0);
    }
}
