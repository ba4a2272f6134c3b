use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::errors::{AppError, AppResult};

const MIN_WAIT: Duration = Duration::from_millis(1);
const MIN_QPS: f64 = 0.001;

/// Token bucket shared by every provider call. Waiters queue on the inner
/// async mutex, so admission is FIFO even if several tasks share the limiter.
pub struct RateLimiter {
    refill_interval: Duration,
    capacity: u32,
    state: AsyncMutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// `qps` may be fractional (0.5 means one call every two seconds).
    /// Non-finite or non-positive rates fall back to one call per second.
    pub fn new(qps: f64, burst: u32) -> Self {
        let capacity = burst.max(1);
        Self {
            refill_interval: Self::interval(qps),
            capacity,
            state: AsyncMutex::new(BucketState {
                tokens: f64::from(capacity),
                last_refill: Instant::now(),
            }),
        }
    }

    fn interval(qps: f64) -> Duration {
        let safe_qps = if qps.is_finite() && qps > 0.0 {
            qps.max(MIN_QPS)
        } else {
            1.0
        };
        Duration::from_secs_f64(1.0 / safe_qps)
    }

    pub fn refill_interval(&self) -> Duration {
        self.refill_interval
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Waits until a token is available and consumes it. Returns
    /// `RateLimitCancelled` without consuming anything if `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> AppResult<()> {
        if cancel.is_cancelled() {
            return Err(AppError::RateLimitCancelled);
        }

        let mut state = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AppError::RateLimitCancelled),
            guard = self.state.lock() => guard,
        };

        loop {
            self.refill(&mut state);
            if state.tokens >= 1.0 {
                state.tokens -= 1.0;
                trace!(target: "rate_limiter", remaining = state.tokens, "token granted");
                return Ok(());
            }

            let wait = self
                .refill_interval
                .mul_f64(1.0 - state.tokens)
                .max(MIN_WAIT);
            debug!(target: "rate_limiter", wait_ms = wait.as_millis() as u64, "waiting for token");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AppError::RateLimitCancelled),
                _ = sleep(wait) => {}
            }
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill);
        let earned = elapsed.as_secs_f64() / self.refill_interval.as_secs_f64();
        state.tokens = (state.tokens + earned).min(f64::from(self.capacity));
        state.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    async fn admission_times(limiter: &RateLimiter, count: usize) -> Vec<Duration> {
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let mut times = Vec::with_capacity(count);
        for _ in 0..count {
            limiter.acquire(&cancel).await.unwrap();
            times.push(start.elapsed());
        }
        times
    }

    #[tokio::test(start_paused = true)]
    async fn single_token_bucket_spaces_calls() {
        let limiter = RateLimiter::new(2.0, 1);
        let times = admission_times(&limiter, 5).await;

        assert_eq!(times[0], Duration::ZERO);
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(500));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_is_admitted_before_first_gap() {
        let limiter = RateLimiter::new(4.0, 3);
        let times = admission_times(&limiter, 8).await;

        assert!(times[..3].iter().all(|t| *t == Duration::ZERO));
        assert!(times[3] >= Duration::from_millis(250));
        for pair in times[3..].windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(250));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn idle_time_refills_up_to_capacity_only() {
        let limiter = RateLimiter::new(10.0, 2);
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();
        limiter.acquire(&cancel).await.unwrap();

        sleep(Duration::from_secs(5)).await;

        let start = Instant::now();
        limiter.acquire(&cancel).await.unwrap();
        limiter.acquire(&cancel).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
        limiter.acquire(&cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_token_is_rejected_up_front() {
        let limiter = RateLimiter::new(1.0, 1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = limiter.acquire(&cancel).await;
        assert!(matches!(result, Err(AppError::RateLimitCancelled)));

        // No token was consumed, so a fresh caller gets in immediately.
        let start = Instant::now();
        limiter.acquire(&CancellationToken::new()).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_wait() {
        let limiter = Arc::new(RateLimiter::new(1.0, 1));
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();

        let waiter = {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(&cancel).await })
        };
        sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(AppError::RateLimitCancelled)));
    }

    #[test]
    fn clamps_zero_settings() {
        let limiter = RateLimiter::new(0.0, 0);
        assert_eq!(limiter.capacity(), 1);
        assert_eq!(limiter.refill_interval(), Duration::from_secs(1));

        let nonsense = RateLimiter::new(f64::NAN, 1);
        assert_eq!(nonsense.refill_interval(), Duration::from_secs(1));
        let negative = RateLimiter::new(-3.0, 1);
        assert_eq!(negative.refill_interval(), Duration::from_secs(1));
    }

    #[test]
    fn tiny_rates_are_floored() {
        let limiter = RateLimiter::new(1e-12, 1);
        assert_eq!(limiter.refill_interval(), Duration::from_secs(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn fractional_rate_spaces_calls_beyond_one_second() {
        let limiter = RateLimiter::new(0.5, 1);
        assert_eq!(limiter.refill_interval(), Duration::from_secs(2));

        let times = admission_times(&limiter, 3).await;
        assert_eq!(times[0], Duration::ZERO);
        assert!(times[1] >= Duration::from_secs(2));
        assert!(times[2] - times[1] >= Duration::from_secs(2));
    }
}
