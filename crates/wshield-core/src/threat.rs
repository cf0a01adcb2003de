//! Threat intelligence feed
//!
//! Exact malicious URLs and malicious domains, refreshed periodically from
//! configured feeds. Evaluation only consults URLs: blocking a whole domain
//! on a single bad URL would take down multi-tenant hosts.

use crate::config::{SourceConfig, ThreatConfig};
use crate::error::Result;
use crate::filter::{DomainEntry, GuardedSet};
use crate::lists::{normalize_url, ListFetcher, ListFormat};
use arc_swap::ArcSwap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Kind reported for URL hits
pub const KIND_MALWARE_URL: &str = "malware_url";

/// Result of a URL lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreatMatch {
    /// The URL is known-malicious
    pub threat: bool,
    /// Threat category
    pub kind: Option<String>,
    /// Feed that reported it
    pub source: Option<String>,
}

impl ThreatMatch {
    /// No match
    pub fn clean() -> Self {
        Self::default()
    }
}

/// Threat intelligence lookups used by the filter engine
pub trait ThreatFeed: Send + Sync {
    /// Look up one exact URL
    fn check_url(&self, url: &str) -> ThreatMatch;

    /// Whether a domain (or one of its parents) is known-malicious
    fn is_threat_domain(&self, domain: &str) -> bool;
}

/// A feed that never matches
#[derive(Debug, Clone, Copy, Default)]
pub struct NoThreatFeed;

impl ThreatFeed for NoThreatFeed {
    fn check_url(&self, _url: &str) -> ThreatMatch {
        ThreatMatch::clean()
    }

    fn is_threat_domain(&self, _domain: &str) -> bool {
        false
    }
}

/// Notified after the feed contents are swapped
pub trait FeedChangeListener: Send + Sync {
    fn on_feed_changed(&self);
}

#[derive(Debug, Default)]
struct ThreatSets {
    /// Normalized URL -> source id
    urls: HashMap<String, String>,
    domains: GuardedSet,
}

/// In-memory feed refreshed through a [`ListFetcher`]
pub struct MemoryThreatFeed {
    config: ThreatConfig,
    fetcher: Arc<dyn ListFetcher>,
    sets: ArcSwap<ThreatSets>,
    /// Last good parsed items per source id
    source_items: RwLock<HashMap<String, Vec<String>>>,
    listeners: RwLock<Vec<Arc<dyn FeedChangeListener>>>,
}

impl MemoryThreatFeed {
    /// Create an empty feed
    pub fn new(config: ThreatConfig, fetcher: Arc<dyn ListFetcher>) -> Self {
        Self {
            config,
            fetcher,
            sets: ArcSwap::from_pointee(ThreatSets::default()),
            source_items: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener called after every swap
    pub fn subscribe(&self, listener: Arc<dyn FeedChangeListener>) {
        self.listeners.write().push(listener);
    }

    fn swap(&self, sets: ThreatSets) {
        self.sets.store(Arc::new(sets));
        let listeners: Vec<_> = self.listeners.read().clone();
        for listener in &listeners {
            listener.on_feed_changed();
        }
    }

    /// Replace the feed contents directly
    ///
    /// `urls` yields `(url, source)` pairs.
    pub fn replace<U, D>(&self, urls: U, domains: D) -> Result<()>
    where
        U: IntoIterator<Item = (String, String)>,
        D: IntoIterator<Item = String>,
    {
        let urls = urls
            .into_iter()
            .map(|(url, source)| (normalize_url(&url), source))
            .collect();
        let entries: Vec<DomainEntry> = domains
            .into_iter()
            .filter_map(|d| DomainEntry::parse(&d, "threat").ok())
            .collect();
        self.swap(ThreatSets {
            urls,
            domains: GuardedSet::build(&entries, 0.01)?,
        });
        Ok(())
    }

    /// Number of URLs and domains held
    pub fn counts(&self) -> (usize, usize) {
        let sets = self.sets.load();
        (sets.urls.len(), sets.domains.len())
    }

    /// Download all enabled feed sources and swap in the result
    ///
    /// A failing source keeps contributing its last good copy. Returns the
    /// number of sources downloaded successfully.
    pub async fn refresh(&self) -> Result<usize> {
        let mut sources: Vec<&SourceConfig> =
            self.config.sources.iter().filter(|s| s.enabled).collect();
        sources.sort_by_key(|s| s.priority);

        let mut updated = 0;
        for source in &sources {
            match self.fetcher.fetch(&source.location).await {
                Ok(text) => {
                    let items = source.format.parse_document(&text);
                    debug!(source = %source.id, entries = items.len(), "Threat feed downloaded");
                    self.source_items.write().insert(source.id.clone(), items);
                    updated += 1;
                }
                Err(e) => {
                    warn!(source = %source.id, error = %e, "Threat feed failed, keeping previous data");
                }
            }
        }

        if updated == 0 {
            return Ok(0);
        }

        let mut urls = HashMap::new();
        let mut entries = Vec::new();
        {
            let items = self.source_items.read();
            for source in &sources {
                let Some(lines) = items.get(&source.id) else {
                    continue;
                };
                if source.format == ListFormat::Urls {
                    for url in lines {
                        urls.insert(url.clone(), source.id.clone());
                    }
                } else {
                    entries.extend(
                        lines
                            .iter()
                            .filter_map(|l| DomainEntry::parse(l, &source.id).ok()),
                    );
                }
            }
        }

        let domains = GuardedSet::build(&entries, 0.01)?;
        info!(urls = urls.len(), domains = domains.len(), "Threat feed refreshed");
        self.swap(ThreatSets { urls, domains });
        Ok(updated)
    }

    /// Periodic refresh until shutdown
    pub fn spawn_refresh_task(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        run_immediately: bool,
    ) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.refresh_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            if !run_immediately {
                ticker.tick().await;
            }
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.refresh().await {
                            warn!(error = %e, "Scheduled threat refresh failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

impl ThreatFeed for MemoryThreatFeed {
    fn check_url(&self, url: &str) -> ThreatMatch {
        let sets = self.sets.load();
        match sets.urls.get(&normalize_url(url)) {
            Some(source) => ThreatMatch {
                threat: true,
                kind: Some(KIND_MALWARE_URL.to_string()),
                source: Some(source.clone()),
            },
            None => ThreatMatch::clean(),
        }
    }

    fn is_threat_domain(&self, domain: &str) -> bool {
        self.sets.load().domains.matches(domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lists::{ListKind, MockListFetcher};
    use crate::Error;

    fn feed_source(id: &str, format: ListFormat) -> SourceConfig {
        SourceConfig {
            id: id.to_string(),
            location: format!("mem://{id}"),
            list: ListKind::Blocklist,
            format,
            priority: 1,
            enabled: true,
        }
    }

    #[test]
    fn test_replace_and_lookup() {
        let feed = MemoryThreatFeed::new(ThreatConfig::default(), Arc::new(MockListFetcher::new()));
        feed.replace(
            [("https://Drive.test/evil.exe".to_string(), "urlhaus".to_string())],
            ["phish.test".to_string()],
        )
        .unwrap();

        let hit = feed.check_url("https://drive.test:443/evil.exe");
        assert!(hit.threat);
        assert_eq!(hit.source.as_deref(), Some("urlhaus"));
        assert_eq!(hit.kind.as_deref(), Some(KIND_MALWARE_URL));

        // Only the exact URL, never the whole host
        assert!(!feed.check_url("https://drive.test/report.pdf").threat);

        assert!(feed.is_threat_domain("login.phish.test"));
        assert!(!feed.is_threat_domain("drive.test"));
    }

    #[tokio::test]
    async fn test_refresh_keeps_last_good_on_failure() {
        let mut fetcher = MockListFetcher::new();
        let mut calls = 0;
        fetcher.expect_fetch().returning(move |loc| {
            calls += 1;
            match (loc, calls) {
                ("mem://urls", 1) => Ok("http://bad.test/x\n".to_string()),
                ("mem://domains", 2) => Ok("0.0.0.0 c2.test\n".to_string()),
                _ => Err(Error::fetch(loc, "timeout")),
            }
        });

        let config = ThreatConfig {
            sources: vec![
                feed_source("urls", ListFormat::Urls),
                feed_source("domains", ListFormat::Hosts),
            ],
            ..ThreatConfig::default()
        };
        let feed = MemoryThreatFeed::new(config, Arc::new(fetcher));

        assert_eq!(feed.refresh().await.unwrap(), 2);
        assert!(feed.check_url("http://bad.test/x").threat);
        assert!(feed.is_threat_domain("c2.test"));

        // Both fail now, contents unchanged
        assert_eq!(feed.refresh().await.unwrap(), 0);
        assert_eq!(feed.counts(), (1, 1));
    }

    #[test]
    fn test_no_threat_feed() {
        assert!(!NoThreatFeed.check_url("http://x.test/").threat);
        assert!(!NoThreatFeed.is_threat_domain("x.test"));
    }
}
