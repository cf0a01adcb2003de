//! Sliding-window rate limiting
//!
//! Tracks request timestamps per key (host, or `client_ip/host`). A key that
//! fills its window enters a cooldown during which every request is limited
//! without being recorded.

use crate::config::RateLimitConfig;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Reason attached to every limited decision
pub const RATE_LIMIT_REASON: &str = "rate limit exceeded";

/// Outcome of [`RateLimiter::check_and_record`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    /// The request must be refused
    pub limited: bool,
    /// Why, when limited
    pub reason: Option<&'static str>,
    /// When the block lifts, when limited
    pub reset_at: Option<Instant>,
    /// Requests left in the current window
    pub remaining: usize,
}

impl RateDecision {
    fn allowed(remaining: usize) -> Self {
        Self {
            limited: false,
            reason: None,
            reset_at: None,
            remaining,
        }
    }

    fn limited(until: Instant) -> Self {
        Self {
            limited: true,
            reason: Some(RATE_LIMIT_REASON),
            reset_at: Some(until),
            remaining: 0,
        }
    }

    /// Time left on the block, measured from `now`
    pub fn retry_after(&self, now: Instant) -> Option<Duration> {
        self.reset_at.map(|at| at.saturating_duration_since(now))
    }
}

#[derive(Debug)]
struct RateWindow {
    timestamps: VecDeque<Instant>,
    blocked_until: Option<Instant>,
    last_seen: Instant,
}

impl RateWindow {
    fn new(now: Instant) -> Self {
        Self {
            timestamps: VecDeque::new(),
            blocked_until: None,
            last_seen: now,
        }
    }

    fn is_blocked(&self, now: Instant) -> bool {
        self.blocked_until.is_some_and(|until| until > now)
    }
}

/// Per-key sliding-window limiter
pub struct RateLimiter {
    windows: DashMap<String, RateWindow>,
    max_requests: usize,
    window: Duration,
    block_duration: Duration,
}

impl RateLimiter {
    /// Create a limiter
    pub fn new(max_requests: usize, window: Duration, block_duration: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            max_requests,
            window,
            block_duration,
        }
    }

    /// Create from configuration
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            config.max_requests,
            Duration::from_millis(config.window_ms),
            Duration::from_millis(config.block_duration_ms),
        )
    }

    /// Check a request against the window and record it if allowed
    pub fn check_and_record(&self, key: &str) -> RateDecision {
        self.check_and_record_at(key, Instant::now())
    }

    /// Same as [`check_and_record`](Self::check_and_record) at a fixed instant
    pub fn check_and_record_at(&self, key: &str, now: Instant) -> RateDecision {
        let mut window = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| RateWindow::new(now));
        window.last_seen = now;

        if let Some(until) = window.blocked_until {
            if until > now {
                return RateDecision::limited(until);
            }
            window.blocked_until = None;
        }

        if let Some(cutoff) = now.checked_sub(self.window) {
            while window.timestamps.front().is_some_and(|&t| t <= cutoff) {
                window.timestamps.pop_front();
            }
        }

        if window.timestamps.len() >= self.max_requests {
            let until = now + self.block_duration;
            window.blocked_until = Some(until);
            warn!(
                key,
                requests = window.timestamps.len(),
                block_ms = self.block_duration.as_millis() as u64,
                "Rate limit exceeded, blocking key"
            );
            return RateDecision::limited(until);
        }

        window.timestamps.push_back(now);
        RateDecision::allowed(self.max_requests - window.timestamps.len())
    }

    /// Clear window and block state for `key` and its per-client variants
    pub fn reset(&self, key: &str) {
        let suffix = format!("/{key}");
        self.windows
            .retain(|k, _| k != key && !k.ends_with(&suffix));
    }

    /// Whether `key` is currently blocked
    pub fn is_blocked(&self, key: &str) -> bool {
        let now = Instant::now();
        self.windows
            .get(key)
            .is_some_and(|w| w.is_blocked(now))
    }

    /// Drop keys that are not blocked and idle for more than twice the window
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.windows.len();
        let idle_limit = self.window * 2;
        self.windows.retain(|_, w| {
            w.is_blocked(now) || now.saturating_duration_since(w.last_seen) <= idle_limit
        });
        before.saturating_sub(self.windows.len())
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Whether no keys are tracked
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Periodic sweep until shutdown
    pub fn spawn_gc_task(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = self.sweep(Instant::now());
                        if removed > 0 {
                            debug!(removed, remaining = self.len(), "Swept idle rate windows");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}
