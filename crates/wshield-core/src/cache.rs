//! Short-lived verdict cache
//!
//! Maps a request key (normalized URL or `host:port`) to its last verdict.
//! Capacity is bounded with oldest-first eviction; the whole cache is
//! dropped whenever the lists change.

use crate::config::CacheConfig;
use crate::verdict::Verdict;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone)]
struct CacheEntry {
    verdict: Verdict,
    expires_at: Instant,
    seq: u64,
}

/// Bounded TTL cache of verdicts
pub struct VerdictCache {
    entries: DashMap<String, CacheEntry>,
    /// Insertion order as (key, seq); stale pairs are skipped on eviction
    order: Mutex<VecDeque<(String, u64)>>,
    seq: AtomicU64,
    ttl: Duration,
    max_entries: usize,
}

impl VerdictCache {
    /// Create a cache
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            seq: AtomicU64::new(0),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Create from configuration
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(Duration::from_secs(config.ttl_secs), config.max_entries)
    }

    /// Unexpired verdict for `key`
    pub fn get(&self, key: &str) -> Option<Verdict> {
        self.get_at(key, Instant::now())
    }

    /// Lookup at a fixed instant
    pub fn get_at(&self, key: &str, now: Instant) -> Option<Verdict> {
        let entry = self.entries.get(key)?;
        if entry.expires_at > now {
            return Some(entry.verdict.clone());
        }
        drop(entry);
        self.entries.remove_if(key, |_, e| e.expires_at <= now);
        None
    }

    /// Store a verdict with the default TTL
    pub fn insert(&self, key: &str, verdict: Verdict) {
        self.insert_at(key, verdict, self.ttl, Instant::now());
    }

    /// Store a verdict whose lifetime is capped at `ttl`
    pub fn insert_with_ttl(&self, key: &str, verdict: Verdict, ttl: Duration) {
        self.insert_at(key, verdict, ttl.min(self.ttl), Instant::now());
    }

    /// Store at a fixed instant
    pub fn insert_at(&self, key: &str, verdict: Verdict, ttl: Duration, now: Instant) {
        if ttl.is_zero() {
            return;
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                verdict,
                expires_at: now + ttl,
                seq,
            },
        );

        let mut order = self.order.lock();
        order.push_back((key.to_string(), seq));
        while self.entries.len() > self.max_entries {
            let Some((old_key, old_seq)) = order.pop_front() else {
                break;
            };
            self.entries.remove_if(&old_key, |_, e| e.seq == old_seq);
        }
    }

    /// Drop one entry
    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Drop every entry
    pub fn clear(&self) {
        let mut order = self.order.lock();
        self.entries.clear();
        order.clear();
    }

    /// Remove expired entries, returning how many were dropped
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);

        let mut order = self.order.lock();
        order.retain(|(k, seq)| self.entries.get(k).is_some_and(|e| e.seq == *seq));
        before.saturating_sub(self.entries.len())
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Periodic expiry sweep until shutdown
    pub fn spawn_sweep_task(
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
                            debug!(removed, remaining = self.len(), "Swept expired verdicts");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}
