//! Blocklist and whitelist storage
//!
//! The [`ListStore`] owns the published [`ListSnapshot`], refreshes it from
//! configured sources and notifies listeners after every publish. Readers
//! load the snapshot once per evaluation and never lock.

mod fetch;
mod format;
mod persist;

#[cfg(test)]
pub use fetch::MockListFetcher;
#[cfg(feature = "http")]
pub use fetch::HttpFetcher;
pub use fetch::{FileFetcher, ListFetcher, SourceFetcher};
pub use format::{normalize_url, ListFormat, ListKind};
pub use persist::{FilePersistence, ListPersistence, MemoryPersistence, SourceMeta, SourceStatus};

use crate::config::{ListsConfig, SourceConfig};
use crate::error::Result;
use crate::filter::{DomainEntry, GuardedSet};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Source id used for patterns from the config file
const INLINE_SOURCE: &str = "config";
/// Source id used for user-managed entries
const CUSTOM_SOURCE: &str = "custom";
/// Source id used when seeding from a previously persisted merged list
const PERSISTED_SOURCE: &str = "persisted";

/// One published version of every list
#[derive(Debug)]
pub struct ListSnapshot {
    /// Monotonic publish counter
    pub version: u64,
    /// Blocked domains
    pub blocklist: GuardedSet,
    /// Domains that bypass every other rule
    pub whitelist: GuardedSet,
    /// Exact malicious URLs (normalized)
    pub malicious_urls: HashSet<String>,
    /// When this version was published
    pub published_at: DateTime<Utc>,
    /// At least one source was served from its cached copy
    pub degraded: bool,
}

impl ListSnapshot {
    /// Version 0: nothing loaded yet
    pub fn empty() -> Self {
        Self {
            version: 0,
            blocklist: GuardedSet::empty(),
            whitelist: GuardedSet::empty(),
            malicious_urls: HashSet::new(),
            published_at: Utc::now(),
            degraded: false,
        }
    }

    /// The set for a list kind
    pub fn list(&self, kind: ListKind) -> &GuardedSet {
        match kind {
            ListKind::Blocklist => &self.blocklist,
            ListKind::Whitelist => &self.whitelist,
        }
    }
}

/// Notified synchronously after a new snapshot is published
pub trait ListChangeListener: Send + Sync {
    /// Called once per publish, after the pointer swap
    fn on_list_changed(&self, snapshot: &ListSnapshot);
}

/// What a refresh did
#[derive(Debug, Clone, Default)]
pub struct RefreshReport {
    /// Version published, `None` if the previous one was kept
    pub version: Option<u64>,
    /// Sources downloaded and parsed
    pub succeeded: Vec<String>,
    /// Sources that failed but still contribute their cached copy
    pub degraded: Vec<String>,
    /// Sources that failed with nothing cached
    pub skipped: Vec<String>,
    /// No source succeeded; the previous snapshot stays
    pub all_failed: bool,
}

/// Owns and publishes list snapshots
pub struct ListStore {
    config: ListsConfig,
    fetcher: Arc<dyn ListFetcher>,
    persistence: Arc<dyn ListPersistence>,
    current: ArcSwap<ListSnapshot>,
    next_version: AtomicU64,
    /// Last good parsed items per source id
    source_items: RwLock<HashMap<String, Vec<String>>>,
    /// User-managed normalized patterns
    custom: RwLock<HashMap<ListKind, Vec<String>>>,
    meta: RwLock<HashMap<String, SourceMeta>>,
    listeners: RwLock<Vec<Arc<dyn ListChangeListener>>>,
    /// Serializes build-and-publish
    publish_lock: Mutex<()>,
}

impl ListStore {
    /// Create a store holding the empty snapshot
    pub fn new(
        config: ListsConfig,
        fetcher: Arc<dyn ListFetcher>,
        persistence: Arc<dyn ListPersistence>,
    ) -> Self {
        Self {
            config,
            fetcher,
            persistence,
            current: ArcSwap::from_pointee(ListSnapshot::empty()),
            next_version: AtomicU64::new(1),
            source_items: RwLock::new(HashMap::new()),
            custom: RwLock::new(HashMap::new()),
            meta: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            publish_lock: Mutex::new(()),
        }
    }

    /// Current snapshot; hold it for the whole evaluation
    pub fn snapshot(&self) -> Arc<ListSnapshot> {
        self.current.load_full()
    }

    /// Register a change listener
    pub fn subscribe(&self, listener: Arc<dyn ListChangeListener>) {
        self.listeners.write().push(listener);
    }

    /// Load persisted state and publish a first snapshot without network access
    pub fn init(&self) -> Result<u64> {
        let meta = self.persistence.load_metadata().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to load list metadata, starting fresh");
            HashMap::new()
        });
        *self.meta.write() = meta;

        {
            let mut custom = self.custom.write();
            for kind in [ListKind::Blocklist, ListKind::Whitelist] {
                let entries = self.persistence.load_custom(kind).unwrap_or_else(|e| {
                    warn!(list = %kind, error = %e, "Failed to load custom entries");
                    Vec::new()
                });
                custom.insert(kind, entries);
            }
        }

        let mut cached = 0;
        {
            let mut items = self.source_items.write();
            for source in self.config.sources.iter().filter(|s| s.enabled) {
                match self.persistence.load_source(&source.id) {
                    Ok(Some(lines)) => {
                        debug!(source = %source.id, entries = lines.len(), "Loaded cached source");
                        items.insert(source.id.clone(), lines);
                        cached += 1;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(source = %source.id, error = %e, "Failed to read source cache"),
                }
            }
        }

        if cached == 0 {
            self.seed_from_merged();
        }

        let snapshot = self.publish(false)?;
        info!(
            version = snapshot.version,
            cached_sources = cached,
            blocklist = snapshot.blocklist.len(),
            whitelist = snapshot.whitelist.len(),
            "List store initialized"
        );
        Ok(snapshot.version)
    }

    /// Key under which part of the merged export is seeded into `source_items`
    fn seed_key(list: impl std::fmt::Display) -> String {
        format!("{PERSISTED_SOURCE}-{list}")
    }

    /// No per-source caches exist: fall back to the last merged export
    ///
    /// Custom and inline patterns are re-added from their own stores, so they
    /// are left out of the seed; otherwise a later removal would not stick.
    fn seed_from_merged(&self) {
        let mut seeded = 0;
        let custom = self.custom.read();
        let mut items = self.source_items.write();
        for kind in [ListKind::Blocklist, ListKind::Whitelist] {
            let inline = match kind {
                ListKind::Blocklist => &self.config.blocklist,
                ListKind::Whitelist => &self.config.whitelist,
            };
            let own: HashSet<String> = custom
                .get(&kind)
                .into_iter()
                .flatten()
                .cloned()
                .chain(
                    inline
                        .iter()
                        .filter_map(|p| DomainEntry::parse(p, INLINE_SOURCE).ok())
                        .map(|e| e.pattern),
                )
                .collect();
            if let Ok(lines) = self.persistence.load_list(kind) {
                let lines: Vec<String> =
                    lines.into_iter().filter(|l| !own.contains(l)).collect();
                if !lines.is_empty() {
                    seeded += lines.len();
                    items.insert(Self::seed_key(kind), lines);
                }
            }
        }
        if let Ok(urls) = self.persistence.load_urls() {
            if !urls.is_empty() {
                seeded += urls.len();
                items.insert(Self::seed_key("urls"), urls);
            }
        }
        if seeded > 0 {
            debug!(entries = seeded, "Seeded lists from persisted merged export");
        }
    }

    /// Download every enabled source and publish the union
    pub async fn refresh(&self) -> Result<RefreshReport> {
        self.refresh_until(None).await
    }

    async fn refresh_until(&self, mut shutdown: Option<watch::Receiver<bool>>) -> Result<RefreshReport> {
        let mut sources: Vec<SourceConfig> = self
            .config
            .sources
            .iter()
            .filter(|s| s.enabled)
            .cloned()
            .collect();
        sources.sort_by_key(|s| s.priority);

        let mut report = RefreshReport::default();
        if sources.is_empty() {
            debug!("No list sources configured, nothing to refresh");
            return Ok(report);
        }

        let delay = Duration::from_millis(self.config.source_delay_ms);
        for (index, source) in sources.iter().enumerate() {
            if index > 0 && !delay.is_zero() {
                let stopped = match shutdown.as_mut() {
                    Some(rx) => tokio::select! {
                        () = tokio::time::sleep(delay) => false,
                        _ = rx.changed() => true,
                    },
                    None => {
                        tokio::time::sleep(delay).await;
                        false
                    }
                };
                if stopped {
                    info!("Shutdown requested, abandoning list refresh");
                    return Ok(report);
                }
            }

            self.refresh_source(source, &mut report).await;
        }

        self.save_metadata();

        if report.succeeded.is_empty() {
            report.all_failed = true;
            warn!(
                degraded = report.degraded.len(),
                skipped = report.skipped.len(),
                "Every list source failed, keeping previous snapshot"
            );
            return Ok(report);
        }

        self.drop_seed();
        self.reload_custom();
        let snapshot = self.publish(!report.degraded.is_empty())?;
        report.version = Some(snapshot.version);
        info!(
            version = snapshot.version,
            succeeded = report.succeeded.len(),
            degraded = report.degraded.len(),
            skipped = report.skipped.len(),
            "List refresh complete"
        );
        Ok(report)
    }

    /// Fresh source data supersedes the merged export seeded at startup
    fn drop_seed(&self) {
        let mut items = self.source_items.write();
        let mut dropped = 0;
        for key in [
            Self::seed_key(ListKind::Blocklist),
            Self::seed_key(ListKind::Whitelist),
            Self::seed_key("urls"),
        ] {
            if items.remove(&key).is_some() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!(dropped, "Dropped persisted seed after refresh");
        }
    }

    /// Pick up custom entries edited by another process
    fn reload_custom(&self) {
        let mut custom = self.custom.write();
        for kind in [ListKind::Blocklist, ListKind::Whitelist] {
            match self.persistence.load_custom(kind) {
                Ok(entries) => {
                    custom.insert(kind, entries);
                }
                Err(e) => warn!(list = %kind, error = %e, "Failed to reload custom entries"),
            }
        }
    }

    async fn refresh_source(&self, source: &SourceConfig, report: &mut RefreshReport) {
        let fetched = self
            .fetcher
            .fetch(&source.location)
            .await
            .map(|text| source.format.parse_document(&text))
            .and_then(|items| {
                if items.is_empty() {
                    Err(crate::Error::fetch(&source.id, "no entries parsed"))
                } else {
                    Ok(items)
                }
            });

        match fetched {
            Ok(items) => {
                if let Err(e) = self.persistence.save_source(&source.id, &items) {
                    warn!(source = %source.id, error = %e, "Failed to cache source");
                }
                info!(source = %source.id, entries = items.len(), "List source updated");
                self.meta.write().insert(
                    source.id.clone(),
                    SourceMeta {
                        last_update: Some(Utc::now()),
                        domain_count: items.len(),
                        status: SourceStatus::Success,
                        last_error: None,
                    },
                );
                self.source_items.write().insert(source.id.clone(), items);
                report.succeeded.push(source.id.clone());
            }
            Err(e) => {
                let cached = self
                    .source_items
                    .read()
                    .get(&source.id)
                    .map_or(0, Vec::len);
                let mut meta = self.meta.write();
                let entry = meta.entry(source.id.clone()).or_default();
                entry.last_error = Some(e.to_string());

                if cached > 0 {
                    warn!(source = %source.id, error = %e, cached, "List source failed, serving cached copy");
                    entry.status = SourceStatus::Cache;
                    entry.domain_count = cached;
                    report.degraded.push(source.id.clone());
                } else {
                    warn!(source = %source.id, error = %e, "List source failed with no cache, skipping");
                    entry.status = SourceStatus::Error;
                    entry.domain_count = 0;
                    report.skipped.push(source.id.clone());
                }
            }
        }
    }

    /// Add a user-managed entry; `Ok(false)` if it was already present
    pub fn add_custom(&self, kind: ListKind, raw: &str) -> Result<bool> {
        let entry = DomainEntry::parse(raw, CUSTOM_SOURCE)?;
        {
            let mut custom = self.custom.write();
            let current = custom.get(&kind).map(Vec::as_slice).unwrap_or_default();
            if current.contains(&entry.pattern) {
                return Ok(false);
            }
            // Only a saved list goes live
            let mut list = current.to_vec();
            list.push(entry.pattern.clone());
            self.persistence.save_custom(kind, &list)?;
            custom.insert(kind, list);
        }
        info!(list = %kind, pattern = %entry.pattern, "Custom entry added");
        self.publish(self.current.load().degraded)?;
        Ok(true)
    }

    /// Remove a user-managed entry; `Ok(false)` if it was not present
    pub fn remove_custom(&self, kind: ListKind, raw: &str) -> Result<bool> {
        let entry = DomainEntry::parse(raw, CUSTOM_SOURCE)?;
        {
            let mut custom = self.custom.write();
            let current = custom.get(&kind).map(Vec::as_slice).unwrap_or_default();
            if !current.contains(&entry.pattern) {
                return Ok(false);
            }
            let list: Vec<String> = current
                .iter()
                .filter(|p| **p != entry.pattern)
                .cloned()
                .collect();
            self.persistence.save_custom(kind, &list)?;
            custom.insert(kind, list);
        }
        info!(list = %kind, pattern = %entry.pattern, "Custom entry removed");
        self.publish(self.current.load().degraded)?;
        Ok(true)
    }

    /// User-managed entries of one list
    pub fn custom_entries(&self, kind: ListKind) -> Vec<String> {
        self.custom.read().get(&kind).cloned().unwrap_or_default()
    }

    /// Every configured source with its last known state
    pub fn source_status(&self) -> Vec<(SourceConfig, SourceMeta)> {
        let meta = self.meta.read();
        self.config
            .sources
            .iter()
            .map(|s| (s.clone(), meta.get(&s.id).cloned().unwrap_or_default()))
            .collect()
    }

    /// Periodic background refresh until shutdown
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
                        if let Err(e) = self.refresh_until(Some(shutdown.clone())).await {
                            warn!(error = %e, "Scheduled list refresh failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        debug!("List refresh task stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Rebuild from cached source items, custom and inline entries, then publish
    fn publish(&self, degraded: bool) -> Result<Arc<ListSnapshot>> {
        let snapshot = {
            let _guard = self.publish_lock.lock();
            let snapshot = Arc::new(self.build_snapshot(degraded)?);
            self.current.store(Arc::clone(&snapshot));
            snapshot
        };

        self.persist_merged(&snapshot);

        let listeners: Vec<_> = self.listeners.read().clone();
        for listener in &listeners {
            listener.on_list_changed(&snapshot);
        }
        Ok(snapshot)
    }

    fn build_snapshot(&self, degraded: bool) -> Result<ListSnapshot> {
        let mut block: Vec<DomainEntry> = Vec::new();
        let mut allow: Vec<DomainEntry> = Vec::new();
        let mut urls: HashSet<String> = HashSet::new();
        let mut rejected = 0usize;

        let mut push = |kind: ListKind, raw: &str, source_id: &str| {
            match DomainEntry::parse(raw, source_id) {
                Ok(entry) => match kind {
                    ListKind::Blocklist => block.push(entry),
                    ListKind::Whitelist => allow.push(entry),
                },
                Err(_) => rejected += 1,
            }
        };

        let items = self.source_items.read();
        for source in self.config.sources.iter().filter(|s| s.enabled) {
            let Some(lines) = items.get(&source.id) else {
                continue;
            };
            if source.format == ListFormat::Urls {
                if source.list == ListKind::Blocklist {
                    urls.extend(lines.iter().cloned());
                }
                continue;
            }
            for line in lines {
                push(source.list, line, &source.id);
            }
        }

        for kind in [ListKind::Blocklist, ListKind::Whitelist] {
            if let Some(lines) = items.get(&format!("{PERSISTED_SOURCE}-{kind}")) {
                for line in lines {
                    push(kind, line, PERSISTED_SOURCE);
                }
            }
        }
        if let Some(lines) = items.get(&format!("{PERSISTED_SOURCE}-urls")) {
            urls.extend(lines.iter().cloned());
        }
        drop(items);

        for pattern in &self.config.blocklist {
            push(ListKind::Blocklist, pattern, INLINE_SOURCE);
        }
        for pattern in &self.config.whitelist {
            push(ListKind::Whitelist, pattern, INLINE_SOURCE);
        }

        for (kind, patterns) in self.custom.read().iter() {
            for pattern in patterns {
                push(*kind, pattern, CUSTOM_SOURCE);
            }
        }

        if rejected > 0 {
            debug!(rejected, "Skipped invalid list entries");
        }

        let fp_rate = self.config.bloom_fp_rate;
        Ok(ListSnapshot {
            version: self.next_version.fetch_add(1, Ordering::SeqCst),
            blocklist: GuardedSet::build(&block, fp_rate)?,
            whitelist: GuardedSet::build(&allow, fp_rate)?,
            malicious_urls: urls,
            published_at: Utc::now(),
            degraded,
        })
    }

    fn persist_merged(&self, snapshot: &ListSnapshot) {
        for kind in [ListKind::Blocklist, ListKind::Whitelist] {
            let patterns = snapshot.list(kind).set().patterns();
            if let Err(e) = self.persistence.save_list(kind, &patterns) {
                warn!(list = %kind, error = %e, "Failed to persist merged list");
            }
        }
        let mut urls: Vec<String> = snapshot.malicious_urls.iter().cloned().collect();
        urls.sort();
        if let Err(e) = self.persistence.save_urls(&urls) {
            warn!(error = %e, "Failed to persist malicious URLs");
        }
    }

    fn save_metadata(&self) {
        let meta = self.meta.read().clone();
        if let Err(e) = self.persistence.save_metadata(&meta) {
            warn!(error = %e, "Failed to persist list metadata");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::AtomicUsize;

    fn source(id: &str, list: ListKind, format: ListFormat, priority: u8) -> SourceConfig {
        SourceConfig {
            id: id.to_string(),
            location: format!("mem://{id}"),
            list,
            format,
            priority,
            enabled: true,
        }
    }

    fn config(sources: Vec<SourceConfig>) -> ListsConfig {
        ListsConfig {
            source_delay_ms: 0,
            sources,
            ..ListsConfig::default()
        }
    }

    struct CountingListener(AtomicUsize);

    impl ListChangeListener for CountingListener {
        fn on_list_changed(&self, _snapshot: &ListSnapshot) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_refresh_publishes_union() {
        let mut fetcher = MockListFetcher::new();
        fetcher.expect_fetch().returning(|loc| match loc {
            "mem://hosts" => Ok("0.0.0.0 ads.test\n0.0.0.0 tracker.test\n".to_string()),
            "mem://allow" => Ok("*.cdn.test\n".to_string()),
            "mem://urls" => Ok("https://drive.test/evil.exe\n".to_string()),
            other => Err(Error::fetch(other, "unexpected")),
        });

        let store = ListStore::new(
            config(vec![
                source("hosts", ListKind::Blocklist, ListFormat::Hosts, 1),
                source("allow", ListKind::Whitelist, ListFormat::Simple, 2),
                source("urls", ListKind::Blocklist, ListFormat::Urls, 3),
            ]),
            Arc::new(fetcher),
            Arc::new(MemoryPersistence::new()),
        );

        let report = store.refresh().await.unwrap();
        assert_eq!(report.succeeded.len(), 3);
        assert!(!report.all_failed);

        let snap = store.snapshot();
        assert_eq!(Some(snap.version), report.version);
        assert!(snap.blocklist.matches("sub.ads.test"));
        assert!(snap.whitelist.matches("img.cdn.test"));
        assert!(snap.malicious_urls.contains("https://drive.test/evil.exe"));
        assert!(!snap.blocklist.matches("drive.test"));
    }

    #[tokio::test]
    async fn test_failed_source_serves_cache() {
        let persistence = Arc::new(MemoryPersistence::new());
        persistence
            .save_source("hosts", &["cached.test".to_string()])
            .unwrap();

        let mut fetcher = MockListFetcher::new();
        fetcher.expect_fetch().returning(|loc| match loc {
            "mem://hosts" => Err(Error::fetch("hosts", "HTTP 503")),
            _ => Ok("fresh.test\n".to_string()),
        });

        let store = ListStore::new(
            config(vec![
                source("hosts", ListKind::Blocklist, ListFormat::Simple, 1),
                source("extra", ListKind::Blocklist, ListFormat::Simple, 2),
            ]),
            Arc::new(fetcher),
            persistence,
        );
        store.init().unwrap();

        let report = store.refresh().await.unwrap();
        assert_eq!(report.degraded, vec!["hosts".to_string()]);
        assert_eq!(report.succeeded, vec!["extra".to_string()]);

        let snap = store.snapshot();
        assert!(snap.degraded);
        assert!(snap.blocklist.matches("cached.test"));
        assert!(snap.blocklist.matches("fresh.test"));

        let status = store.source_status();
        assert_eq!(status[0].1.status, SourceStatus::Cache);
        assert_eq!(status[1].1.status, SourceStatus::Success);
    }

    #[tokio::test]
    async fn test_total_failure_keeps_previous_snapshot() {
        let mut fetcher = MockListFetcher::new();
        fetcher
            .expect_fetch()
            .returning(|loc| Err(Error::fetch(loc, "connection refused")));

        let lists = ListsConfig {
            blocklist: vec!["inline.test".to_string()],
            ..config(vec![source("hosts", ListKind::Blocklist, ListFormat::Hosts, 1)])
        };
        let store = ListStore::new(lists, Arc::new(fetcher), Arc::new(MemoryPersistence::new()));
        let version = store.init().unwrap();

        let report = store.refresh().await.unwrap();
        assert!(report.all_failed);
        assert_eq!(report.skipped, vec!["hosts".to_string()]);
        assert_eq!(report.version, None);

        let snap = store.snapshot();
        assert_eq!(snap.version, version);
        assert!(snap.blocklist.matches("inline.test"));
    }

    #[tokio::test]
    async fn test_sources_fetched_in_priority_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&order);

        let mut fetcher = MockListFetcher::new();
        fetcher.expect_fetch().returning(move |loc| {
            seen.lock().push(loc.to_string());
            Ok("x.test\n".to_string())
        });

        let store = ListStore::new(
            config(vec![
                source("late", ListKind::Blocklist, ListFormat::Simple, 9),
                source("early", ListKind::Blocklist, ListFormat::Simple, 1),
            ]),
            Arc::new(fetcher),
            Arc::new(MemoryPersistence::new()),
        );
        store.refresh().await.unwrap();

        assert_eq!(*order.lock(), vec!["mem://early", "mem://late"]);
    }

    #[test]
    fn test_custom_entries_republish_and_notify() {
        let store = ListStore::new(
            config(Vec::new()),
            Arc::new(MockListFetcher::new()),
            Arc::new(MemoryPersistence::new()),
        );
        let listener = Arc::new(CountingListener(AtomicUsize::new(0)));
        store.subscribe(listener.clone());

        let before = store.snapshot().version;
        assert!(store.add_custom(ListKind::Blocklist, "WWW.Bad.test").unwrap());
        assert!(!store.add_custom(ListKind::Blocklist, "bad.test").unwrap());

        let snap = store.snapshot();
        assert!(snap.version > before);
        assert!(snap.blocklist.matches("bad.test"));
        assert_eq!(store.custom_entries(ListKind::Blocklist), vec!["bad.test"]);

        assert!(store.remove_custom(ListKind::Blocklist, "bad.test").unwrap());
        assert!(!store.snapshot().blocklist.matches("bad.test"));
        assert_eq!(listener.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_custom_entry_validation() {
        let store = ListStore::new(
            config(Vec::new()),
            Arc::new(MockListFetcher::new()),
            Arc::new(MemoryPersistence::new()),
        );
        let err = store.add_custom(ListKind::Whitelist, "not valid").unwrap_err();
        assert!(matches!(err, Error::InvalidPattern { .. }));
        assert!(store.custom_entries(ListKind::Whitelist).is_empty());
    }

    #[test]
    fn test_init_seeds_from_merged_export() {
        let persistence = Arc::new(MemoryPersistence::new());
        persistence
            .save_list(ListKind::Blocklist, &["old.test".to_string()])
            .unwrap();
        persistence
            .save_urls(&["http://old.test/x".to_string()])
            .unwrap();

        let store = ListStore::new(
            config(vec![source("hosts", ListKind::Blocklist, ListFormat::Hosts, 1)]),
            Arc::new(MockListFetcher::new()),
            persistence,
        );
        store.init().unwrap();

        let snap = store.snapshot();
        assert!(snap.blocklist.matches("old.test"));
        assert!(snap.malicious_urls.contains("http://old.test/x"));
    }

    #[test]
    fn test_failed_custom_save_leaves_list_unchanged() {
        struct ReadOnlyCustom(MemoryPersistence);

        impl ListPersistence for ReadOnlyCustom {
            fn load_list(&self, kind: ListKind) -> Result<Vec<String>> {
                self.0.load_list(kind)
            }
            fn save_list(&self, kind: ListKind, entries: &[String]) -> Result<()> {
                self.0.save_list(kind, entries)
            }
            fn load_urls(&self) -> Result<Vec<String>> {
                self.0.load_urls()
            }
            fn save_urls(&self, urls: &[String]) -> Result<()> {
                self.0.save_urls(urls)
            }
            fn load_source(&self, id: &str) -> Result<Option<Vec<String>>> {
                self.0.load_source(id)
            }
            fn save_source(&self, id: &str, items: &[String]) -> Result<()> {
                self.0.save_source(id, items)
            }
            fn load_custom(&self, kind: ListKind) -> Result<Vec<String>> {
                self.0.load_custom(kind)
            }
            fn save_custom(&self, _kind: ListKind, _entries: &[String]) -> Result<()> {
                Err(Error::persistence("custom", "read-only"))
            }
            fn load_metadata(&self) -> Result<HashMap<String, SourceMeta>> {
                self.0.load_metadata()
            }
            fn save_metadata(&self, meta: &HashMap<String, SourceMeta>) -> Result<()> {
                self.0.save_metadata(meta)
            }
        }

        let inner = MemoryPersistence::new();
        inner
            .save_custom(ListKind::Blocklist, &["kept.test".to_string()])
            .unwrap();
        let store = ListStore::new(
            config(vec![]),
            Arc::new(MockListFetcher::new()),
            Arc::new(ReadOnlyCustom(inner)),
        );
        store.init().unwrap();

        assert!(store.add_custom(ListKind::Blocklist, "new.test").is_err());
        assert!(store.remove_custom(ListKind::Blocklist, "kept.test").is_err());
        assert_eq!(store.custom_entries(ListKind::Blocklist), vec!["kept.test"]);

        // A later publish must not leak the rejected edits
        let snap = store.publish(false).unwrap();
        assert!(!snap.blocklist.matches("new.test"));
        assert!(snap.blocklist.matches("kept.test"));
    }

    #[tokio::test]
    async fn test_refresh_drops_persisted_seed() {
        let persistence = Arc::new(MemoryPersistence::new());
        persistence
            .save_list(ListKind::Blocklist, &["delisted.test".to_string()])
            .unwrap();

        let mut fetcher = MockListFetcher::new();
        fetcher
            .expect_fetch()
            .returning(|_| Ok("0.0.0.0 fresh.test\n".to_string()));

        let store = ListStore::new(
            config(vec![source("hosts", ListKind::Blocklist, ListFormat::Hosts, 1)]),
            Arc::new(fetcher),
            Arc::clone(&persistence) as Arc<dyn ListPersistence>,
        );
        store.init().unwrap();
        assert!(store.snapshot().blocklist.matches("delisted.test"));

        let report = store.refresh().await.unwrap();
        assert_eq!(report.succeeded, vec!["hosts"]);
        let snap = store.snapshot();
        assert!(snap.blocklist.matches("fresh.test"));
        assert!(!snap.blocklist.matches("delisted.test"));
        assert!(!persistence
            .load_list(ListKind::Blocklist)
            .unwrap()
            .contains(&"delisted.test".to_string()));
    }

    #[tokio::test]
    async fn test_refresh_picks_up_custom_edits_from_disk() {
        let persistence = Arc::new(MemoryPersistence::new());
        let mut fetcher = MockListFetcher::new();
        fetcher
            .expect_fetch()
            .returning(|_| Ok("ads.test\n".to_string()));
        let running = ListStore::new(
            config(vec![source("hosts", ListKind::Blocklist, ListFormat::Simple, 1)]),
            Arc::new(fetcher),
            Arc::clone(&persistence) as Arc<dyn ListPersistence>,
        );
        running.init().unwrap();

        // Another process edits the same data directory
        let editor = ListStore::new(
            config(vec![]),
            Arc::new(MockListFetcher::new()),
            Arc::clone(&persistence) as Arc<dyn ListPersistence>,
        );
        editor.init().unwrap();
        editor.add_custom(ListKind::Blocklist, "edited.test").unwrap();
        assert!(!running.snapshot().blocklist.matches("edited.test"));

        running.refresh().await.unwrap();
        assert!(running.snapshot().blocklist.matches("edited.test"));
        assert_eq!(running.custom_entries(ListKind::Blocklist), vec!["edited.test"]);
    }

    #[test]
    fn test_removed_custom_entry_not_revived_from_export() {
        let persistence = Arc::new(MemoryPersistence::new());
        let first = ListStore::new(
            config(vec![]),
            Arc::new(MockListFetcher::new()),
            Arc::clone(&persistence) as Arc<dyn ListPersistence>,
        );
        first.init().unwrap();
        first.add_custom(ListKind::Blocklist, "temp.test").unwrap();

        let second = ListStore::new(
            config(vec![]),
            Arc::new(MockListFetcher::new()),
            Arc::clone(&persistence) as Arc<dyn ListPersistence>,
        );
        second.init().unwrap();
        assert!(second.snapshot().blocklist.matches("temp.test"));

        assert!(second.remove_custom(ListKind::Blocklist, "temp.test").unwrap());
        assert!(!second.snapshot().blocklist.matches("temp.test"));
    }
}
