//! Per-source rate limiting.
//!
//! A token bucket with configurable sustained rate and burst. A call may
//! cooperatively wait for a slot up to `acquire_timeout`, after which it
//! fails rather than blocking indefinitely. The limiter and the circuit
//! breaker are independent, composable gates: a call must pass both
//! before any I/O occurs.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use folio_core::{defaults, Error, Result};

/// Configuration for one source's rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Sustained request rate.
    pub requests_per_sec: f64,
    /// Bucket capacity: how many requests may burst back-to-back.
    pub burst: u32,
    /// How long `acquire` may cooperatively wait for a slot.
    pub acquire_timeout: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_sec: defaults::RATE_LIMIT_REQUESTS_PER_SEC,
            burst: defaults::RATE_LIMIT_BURST,
            acquire_timeout: Duration::from_secs(defaults::RATE_LIMIT_ACQUIRE_TIMEOUT_SECS),
        }
    }
}

impl RateLimitConfig {
    pub fn with_requests_per_sec(mut self, rate: f64) -> Self {
        self.requests_per_sec = rate.max(0.001);
        self
    }

    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = burst.max(1);
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket rate limiter for one external source.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a limiter with a full bucket.
    pub fn new(config: RateLimitConfig) -> Self {
        let bucket = Bucket {
            tokens: f64::from(config.burst),
            last_refill: Instant::now(),
        };
        Self {
            config,
            bucket: Mutex::new(bucket),
        }
    }

    /// Take one slot, waiting cooperatively until one is available or
    /// the acquire timeout would be exceeded.
    pub async fn acquire(&self) -> Result<()> {
        let deadline = Instant::now() + self.config.acquire_timeout;

        loop {
            let wait = {
                let mut bucket = self
                    .bucket
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                self.refill(&mut bucket);

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }

                let deficit = 1.0 - bucket.tokens;
                Duration::from_secs_f64(deficit / self.config.requests_per_sec)
            };

            let wake = Instant::now() + wait;
            if wake > deadline {
                debug!(
                    subsystem = "pipeline",
                    component = "limiter",
                    wait_ms = wait.as_millis() as u64,
                    "no rate-limit slot within the acquire timeout"
                );
                return Err(Error::RateLimited(format!(
                    "no slot within {}s",
                    self.config.acquire_timeout.as_secs()
                )));
            }
            tokio::time::sleep_until(wake).await;
        }
    }

    /// Tokens currently available (diagnostics).
    pub fn available(&self) -> f64 {
        let mut bucket = self
            .bucket
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        self.refill(&mut bucket);
        bucket.tokens
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.config.requests_per_sec)
            .min(f64::from(self.config.burst));
        bucket.last_refill = now;
    }
}
