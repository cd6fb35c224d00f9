//! Token-bucket rate limiter (spec §4.1, C1).
//!
//! A single bandwidth cap knob, set once per segment handle (e.g.
//! `curl::easy::Easy2::max_recv_speed`, see `downloader/multi/run.rs`'s
//! `CurlOptions::max_recv_speed`) isn't enough here: throttling must compose
//! across many concurrent segment tasks and be swappable mid-flight (spec
//! §4.5 `setTaskSpeedLimit`), so this is grounded instead on the general
//! mutex-protected-state-plus-suspend idiom (`control::JobControl`'s
//! `RwLock`-guarded map) applied to a textbook token bucket.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Default burst size (spec §4.1): one typical TCP read passes without
/// suspension.
pub const DEFAULT_BURST_SIZE: u64 = 65536;

struct BucketState {
    tokens: f64,
    rate: u64,
    burst_size: u64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed_ms = now.saturating_duration_since(self.last_refill).as_millis() as f64;
        self.last_refill = now;
        if self.rate == 0 {
            return;
        }
        let new_tokens = elapsed_ms * self.rate as f64 / 1000.0;
        self.tokens = (self.tokens + new_tokens).min(self.burst_size as f64);
    }
}

/// A token bucket limiter for one task or one global pool (spec §4.1).
#[derive(Clone)]
pub struct TokenBucketLimiter {
    state: Arc<Mutex<BucketState>>,
}

impl TokenBucketLimiter {
    pub fn new(rate_bytes_per_sec: u64, burst_size: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(BucketState {
                tokens: burst_size as f64,
                rate: rate_bytes_per_sec,
                burst_size,
                last_refill: Instant::now(),
            })),
        }
    }

    /// Suspends the caller until `bytes` tokens have been charged. A no-op
    /// for `bytes == 0` (spec §4.1).
    pub async fn acquire(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let mut remaining = bytes;
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                state.refill();
                let take = state.tokens.min(remaining as f64);
                state.tokens -= take;
                remaining -= take as u64;
                if remaining == 0 {
                    None
                } else {
                    let needed = remaining.min(state.burst_size);
                    let rate = state.rate.max(1);
                    let wait_ms = ((needed as f64 / rate as f64) * 1000.0).max(1.0);
                    Some(Duration::from_millis(wait_ms as u64))
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }

    /// Atomic; takes effect on the next refill (spec §4.1).
    pub async fn update_rate(&self, new_rate: u64) {
        let mut state = self.state.lock().await;
        state.refill();
        state.rate = new_rate;
    }
}

/// A rate limiter that either throttles (`TokenBucket`) or never suspends
/// (`Unlimited`) (spec §4.1).
#[derive(Clone)]
pub enum SpeedLimiter {
    Unlimited,
    TokenBucket(TokenBucketLimiter),
}

impl SpeedLimiter {
    pub async fn acquire(&self, bytes: u64) {
        match self {
            SpeedLimiter::Unlimited => {}
            SpeedLimiter::TokenBucket(b) => b.acquire(bytes).await,
        }
    }
}

/// Wraps a mutable `SpeedLimiter` delegate so a task's effective limiter can
/// be replaced live (unlimited &harr; token bucket, or a plain rate change)
/// without rebinding the segment downloaders that hold a clone of this
/// wrapper (spec §4.1 rationale; spec §4.5 `setTaskSpeedLimit`).
#[derive(Clone)]
pub struct DelegatingSpeedLimiter {
    inner: Arc<Mutex<SpeedLimiter>>,
}

impl DelegatingSpeedLimiter {
    pub fn new(initial: SpeedLimiter) -> Self {
        Self {
            inner: Arc::new(Mutex::new(initial)),
        }
    }

    pub async fn acquire(&self, bytes: u64) {
        // Snapshot the delegate so `acquire`'s potentially long suspension
        // doesn't hold the lock (a concurrent `replace` during the wait is
        // fine; the next `acquire` call observes it).
        let delegate = self.inner.lock().await.clone();
        delegate.acquire(bytes).await;
    }

    pub async fn replace(&self, new_delegate: SpeedLimiter) {
        *self.inner.lock().await = new_delegate;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn acquire_under_burst_does_not_suspend() {
        let limiter = TokenBucketLimiter::new(1000, 65536);
        let start = Instant::now();
        limiter.acquire(1000).await;
        assert_eq!(Instant::now(), start, "should not have needed to wait");
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_beyond_burst_waits_for_refill() {
        let limiter = TokenBucketLimiter::new(1000, 100);
        limiter.acquire(100).await; // drain the bucket
        let before = Instant::now();
        limiter.acquire(100).await; // needs another 100 tokens at 1000B/s -> 100ms
        assert!(Instant::now() >= before + Duration::from_millis(90));
    }

    #[tokio::test]
    async fn acquire_zero_is_noop() {
        let limiter = TokenBucketLimiter::new(1, 1);
        limiter.acquire(0).await;
    }

    #[tokio::test]
    async fn unlimited_never_suspends() {
        let limiter = SpeedLimiter::Unlimited;
        limiter.acquire(u64::MAX / 2).await;
    }

    #[tokio::test(start_paused = true)]
    async fn delegating_limiter_swaps_live() {
        let delegate = DelegatingSpeedLimiter::new(SpeedLimiter::Unlimited);
        delegate.acquire(10_000_000).await; // unlimited: instant

        delegate
            .replace(SpeedLimiter::TokenBucket(TokenBucketLimiter::new(
                1000, 100,
            )))
            .await;
        delegate.acquire(100).await; // drains the fresh bucket
        let before = Instant::now();
        delegate.acquire(100).await;
        assert!(Instant::now() >= before + Duration::from_millis(90));
    }

    #[tokio::test(start_paused = true)]
    async fn fairness_over_window_bounds_total_bytes() {
        // Property 9: over a window of length T >= burst/rate, bytes acquired
        // never exceed rate*T + burst.
        let rate = 1000u64;
        let burst = 500u64;
        let limiter = TokenBucketLimiter::new(rate, burst);
        let window = Duration::from_secs(5);

        let mut acquired = 0u64;
        let deadline = Instant::now() + window;
        loop {
            limiter.acquire(200).await;
            acquired += 200;
            if Instant::now() >= deadline {
                break;
            }
        }
        let bound = rate * window.as_secs() + burst;
        assert!(acquired <= bound + 200, "{acquired} should be <= {bound}");
    }
}
