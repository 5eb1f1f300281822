// src/limiter.rs

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// A token bucket capping the combined byte rate of every fetch in a session.
#[derive(Clone, Debug)]
pub struct SpeedLimiter {
    state: Arc<Mutex<TokenBucket>>,
}

#[derive(Debug)]
struct TokenBucket {
    /// Burst size in bytes. Equal to one second at the configured rate.
    capacity: u64,
    tokens: u64,
    /// Bytes per second. 0 disables limiting.
    rate: u64,
    last_refill: Instant,
}

impl SpeedLimiter {
    /// A rate of 0 means unlimited.
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        let capacity = capacity_for(rate_bytes_per_sec);
        Self {
            state: Arc::new(Mutex::new(TokenBucket {
                capacity,
                tokens: capacity,
                rate: rate_bytes_per_sec,
                last_refill: Instant::now(),
            })),
        }
    }

    pub async fn set_rate(&self, rate_bytes_per_sec: u64) {
        let mut bucket = self.state.lock().await;
        bucket.rate = rate_bytes_per_sec;
        bucket.capacity = capacity_for(rate_bytes_per_sec);
        bucket.tokens = bucket.capacity;
        bucket.last_refill = Instant::now();
    }

    pub async fn rate(&self) -> u64 {
        self.state.lock().await.rate
    }

    /// Wait until `amount` bytes may pass.
    ///
    /// Requests larger than the burst size are taken in burst-sized steps.
    pub async fn take(&self, amount: u64) {
        let mut remaining = amount;
        while remaining > 0 {
            let mut bucket = self.state.lock().await;
            bucket.refill();

            if bucket.rate == 0 {
                return;
            }

            let step = remaining.min(bucket.capacity);
            if bucket.tokens >= step {
                bucket.tokens -= step;
                remaining -= step;
                continue;
            }

            let missing = step - bucket.tokens;
            let wait = Duration::from_secs_f64(missing as f64 / bucket.rate as f64);
            // Never hold the lock across the sleep.
            drop(bucket);
            tokio::time::sleep(wait).await;
        }
    }
}

impl TokenBucket {
    fn refill(&mut self) {
        if self.rate == 0 {
            self.tokens = self.capacity;
            return;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        let earned = (elapsed.as_secs_f64() * self.rate as f64) as u64;
        if earned > 0 {
            self.tokens = self.tokens.saturating_add(earned).min(self.capacity);
            self.last_refill = now;
        }
    }
}

fn capacity_for(rate: u64) -> u64 {
    if rate == 0 {
        u64::MAX
    } else {
        rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn unlimited_never_waits() {
        let limiter = SpeedLimiter::new(0);
        let start = Instant::now();
        limiter.take(u64::MAX / 2).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn limited_rate_paces_bytes() {
        let limiter = SpeedLimiter::new(1000);
        let start = Instant::now();
        // First second is the initial burst, then two more seconds of refill.
        limiter.take(3000).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1900), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(2200), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn rate_can_be_lifted() {
        let limiter = SpeedLimiter::new(10);
        limiter.set_rate(0).await;
        assert_eq!(limiter.rate().await, 0);
        let start = Instant::now();
        limiter.take(1_000_000).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
