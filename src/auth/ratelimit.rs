//! Per-IP token bucket rate limiting for the API layer.
//!
//! Time is passed in explicitly so the arithmetic can be tested without
//! sleeping; the `*_now` wrappers read the clock.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use crate::constants::VISITOR_CLEANUP_INTERVAL;
use crate::constants::VISITOR_IDLE_TIMEOUT;

/// Tokens available after refilling at `rate` per second for `elapsed`,
/// capped at `burst`.
#[inline]
pub fn replenish(tokens: f64, elapsed: Duration, rate: f64, burst: u32) -> f64 {
    (tokens + elapsed.as_secs_f64() * rate).min(f64::from(burst))
}

struct Visitor {
    tokens: f64,
    last_seen: Instant,
}

pub struct RateLimiter {
    rate: f64,
    burst: u32,
    idle_timeout: Duration,
    visitors: Mutex<HashMap<IpAddr, Visitor>>,
}

impl RateLimiter {
    /// `rate` tokens per second, at most `burst` saved up.
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            rate,
            burst,
            idle_timeout: VISITOR_IDLE_TIMEOUT,
            visitors: Mutex::new(HashMap::new()),
        }
    }

    /// Takes one token for `ip`. New visitors start with a full bucket.
    pub fn allow_at(&self, ip: IpAddr, now: Instant) -> bool {
        let mut visitors = self.visitors.lock();
        let visitor = visitors.entry(ip).or_insert(Visitor {
            tokens: f64::from(self.burst),
            last_seen: now,
        });
        visitor.tokens = replenish(
            visitor.tokens,
            now.saturating_duration_since(visitor.last_seen),
            self.rate,
            self.burst,
        );
        visitor.last_seen = now;
        if visitor.tokens >= 1.0 {
            visitor.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn allow(&self, ip: IpAddr) -> bool {
        self.allow_at(ip, Instant::now())
    }

    /// Forgets visitors idle for longer than the idle timeout.
    pub fn cleanup_at(&self, now: Instant) -> usize {
        let mut visitors = self.visitors.lock();
        let before = visitors.len();
        visitors.retain(|_, v| now.saturating_duration_since(v.last_seen) <= self.idle_timeout);
        before - visitors.len()
    }

    pub fn visitors(&self) -> usize {
        self.visitors.lock().len()
    }
}

/// Sweeps idle visitors once a minute until cancelled.
pub async fn run_cleanup_loop(limiter: Arc<RateLimiter>, cancel: CancellationToken) {
    let mut ticker = interval(VISITOR_CLEANUP_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("rate limiter cleanup shutting down");
                break;
            }
            _ = ticker.tick() => {
                let removed = limiter.cleanup_at(Instant::now());
                if removed > 0 {
                    debug!(removed, "dropped idle visitors");
                }
            }
        }
    }
}
