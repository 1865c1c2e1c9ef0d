//! Per-source request spacing.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// One request per `interval`, no bursting.
    pub fn min_interval(interval: Duration) -> Self {
        Self {
            capacity: 1,
            refill_every: interval,
        }
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    config: TokenBucketConfig,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    refilled_at: Instant,
}

impl SimpleTokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        let config = TokenBucketConfig {
            capacity: config.capacity.max(1),
            ..config
        };
        Self {
            state: Mutex::new(BucketState {
                tokens: config.capacity,
                refilled_at: Instant::now(),
            }),
            config,
        }
    }

    /// Waits until a token is available and consumes it. A zero refill period
    /// never waits.
    pub async fn take(&self) {
        let period = self.config.refill_every;
        if period.is_zero() {
            return;
        }
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let since = state.refilled_at.elapsed();
                let earned = since.as_nanos() / period.as_nanos();
                if earned > 0 {
                    let earned = u32::try_from(earned).unwrap_or(u32::MAX);
                    state.tokens = state.tokens.saturating_add(earned).min(self.config.capacity);
                    state.refilled_at = Instant::now();
                }
                if state.tokens > 0 {
                    state.tokens -= 1;
                    return;
                }
                period.saturating_sub(since)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn min_interval_bucket_spaces_requests() {
        let bucket = SimpleTokenBucket::new(TokenBucketConfig::min_interval(Duration::from_secs(1)));
        let started = Instant::now();
        bucket.take().await;
        assert!(started.elapsed() < Duration::from_millis(10));
        bucket.take().await;
        assert!(started.elapsed() >= Duration::from_secs(1));
        bucket.take().await;
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_never_waits() {
        let bucket = SimpleTokenBucket::new(TokenBucketConfig::min_interval(Duration::ZERO));
        let started = Instant::now();
        for _ in 0..5 {
            bucket.take().await;
        }
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
