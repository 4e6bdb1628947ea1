//! Per-origin token buckets.
//!
//! Tokens refill continuously at `requests_per_minute / 60` per second up to
//! the bucket capacity (`burst`). Each bucket also keeps a 60-second log of
//! grants so an origin never sees more than `requests_per_minute` requests in
//! any rolling minute, whatever the burst setting.
//!
//! `acquire` holds the bucket's async mutex while it sleeps, so grants on one
//! origin are serialised while other origins proceed independently.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RateLimitConfig;

const WINDOW: Duration = Duration::from_secs(60);

/// Float slack so a bucket that was slept on for exactly the computed wait
/// is not short by a rounding error.
const EPSILON: f64 = 1e-9;

/// Token bucket for a single origin.
#[derive(Debug)]
pub struct RateLimitBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
    window_limit: usize,
    window: VecDeque<Instant>,
    last_used: Instant,
}

impl RateLimitBucket {
    /// A full bucket.
    pub fn new(requests_per_minute: u32, burst: u32, now: Instant) -> Self {
        let rpm = requests_per_minute.max(1);
        let capacity = burst.clamp(1, rpm) as f64;
        Self {
            capacity,
            refill_per_sec: rpm as f64 / 60.0,
            tokens: capacity,
            last_refill: now,
            window_limit: rpm as usize,
            window: VecDeque::new(),
            last_used: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take a token, or report how long until one can be taken.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        self.last_used = now;
        while let Some(&oldest) = self.window.front() {
            if now.saturating_duration_since(oldest) >= WINDOW {
                self.window.pop_front();
            } else {
                break;
            }
        }

        let token_wait = if self.tokens + EPSILON >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_sec)
        };
        let window_wait = match self.window.front() {
            Some(&oldest) if self.window.len() >= self.window_limit => {
                (oldest + WINDOW).saturating_duration_since(now)
            }
            _ => Duration::ZERO,
        };

        let wait = token_wait.max(window_wait);
        if wait.is_zero() {
            self.tokens = (self.tokens - 1.0).max(0.0);
            self.window.push_back(now);
            Ok(())
        } else {
            Err(wait)
        }
    }

    /// Current token count (without refilling).
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

/// Lazily-created buckets keyed by origin.
pub struct RateLimiter {
    buckets: DashMap<String, Arc<Mutex<RateLimitBucket>>>,
    requests_per_minute: u32,
    burst: u32,
    grants: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            requests_per_minute: config.requests_per_minute.max(1),
            burst: config.burst,
            grants: AtomicU64::new(0),
        }
    }

    fn bucket(&self, origin: &str) -> Arc<Mutex<RateLimitBucket>> {
        self.buckets
            .entry(origin.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(RateLimitBucket::new(
                    self.requests_per_minute,
                    self.burst,
                    Instant::now(),
                )))
            })
            .clone()
    }

    /// Wait until `origin` has a token, then take it.
    pub async fn acquire(&self, origin: &str) {
        let bucket = self.bucket(origin);
        let mut guard = bucket.lock().await;
        loop {
            match guard.try_acquire(Instant::now()) {
                Ok(()) => {
                    self.grants.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(wait) => {
                    tracing::debug!(
                        "rate limiting: waiting {:.2}s for {origin}",
                        wait.as_secs_f64()
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Total tokens granted across all origins.
    pub fn grants(&self) -> u64 {
        self.grants.load(Ordering::Relaxed)
    }

    /// Number of origins with a live bucket.
    pub fn tracked_origins(&self) -> usize {
        self.buckets.len()
    }

    /// Tokens currently in the bucket for `origin`, if it exists and is idle.
    pub fn available_tokens(&self, origin: &str) -> Option<f64> {
        let bucket = self.buckets.get(origin)?.clone();
        let tokens = bucket.try_lock().ok().map(|b| b.tokens());
        tokens
    }

    /// Drop buckets that are idle and unused for at least `max_idle`
    /// (never less than the rolling window).
    pub fn evict_stale(&self, max_idle: Duration) -> usize {
        let max_idle = max_idle.max(WINDOW);
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            if Arc::strong_count(bucket) > 1 {
                return true;
            }
            match bucket.try_lock() {
                Ok(b) => now.saturating_duration_since(b.last_used) < max_idle,
                Err(_) => true,
            }
        });
        let removed = before - self.buckets.len();
        if removed > 0 {
            tracing::debug!("evicted {removed} stale rate-limit bucket(s)");
        }
        removed
    }
}

/// Spawn a loop that evicts stale buckets every `max_idle` until cancelled.
pub fn spawn_evictor(
    limiter: Arc<RateLimiter>,
    max_idle: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(max_idle.max(WINDOW));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    limiter.evict_stale(max_idle);
                }
            }
        }
    })
}
