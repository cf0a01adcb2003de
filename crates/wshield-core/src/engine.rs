//! The decision pipeline
//!
//! Short-circuits on the first decisive rule:
//!
//! 1. verdict cache
//! 2. whitelist (wins over everything below)
//! 3. rate limit
//! 4. threat intelligence, exact URL only
//! 5. security policy: direct IP, non-standard port, HTTPS-only
//! 6. malicious URL list
//! 7. domain blocklist
//! 8. allow

use crate::cache::VerdictCache;
use crate::config::{Config, RateLimitConfig, SecurityConfig};
use crate::error::{Error, Result};
use crate::filter::{is_ip_literal, normalize_host};
use crate::lists::{normalize_url, ListChangeListener, ListKind, ListSnapshot, ListStore};
use crate::ratelimit::RateLimiter;
use crate::threat::{FeedChangeListener, ThreatFeed};
use crate::verdict::{BlockReason, Verdict};
use serde::Serialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument};

/// Request scheme as seen by the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Plaintext forward
    Http,
    /// CONNECT tunnel
    Https,
}

impl Protocol {
    /// Default port of the scheme
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Http => 80,
            Protocol::Https => 443,
        }
    }

    /// URL scheme
    pub fn scheme(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.scheme())
    }
}

/// One request to classify
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRequest {
    /// Full URL (for tunnels: `https://host[:port]/`)
    pub full_url: String,
    /// Target host, without port
    pub host: String,
    /// Target port
    pub port: u16,
    /// Scheme
    pub protocol: Protocol,
    /// Requesting client, used for per-client rate limiting
    pub client_ip: Option<IpAddr>,
}

impl FilterRequest {
    /// Plaintext HTTP request for `url`
    pub fn http(url: &str, host: &str, port: u16) -> Self {
        Self {
            full_url: normalize_url(url),
            host: normalize_host(host),
            port,
            protocol: Protocol::Http,
            client_ip: None,
        }
    }

    /// CONNECT tunnel to `host:port`
    pub fn connect(host: &str, port: u16) -> Self {
        let host = normalize_host(host);
        let authority = if host.contains(':') {
            format!("[{host}]")
        } else {
            host.clone()
        };
        Self {
            full_url: normalize_url(&format!("https://{authority}:{port}/")),
            host,
            port,
            protocol: Protocol::Https,
            client_ip: None,
        }
    }

    /// Parse an absolute `http(s)://` URL
    pub fn from_url(url: &str) -> Result<Self> {
        let trimmed = url.trim();
        let (scheme, rest) = trimmed
            .split_once("://")
            .ok_or_else(|| Error::invalid_pattern(url, "missing scheme"))?;
        let protocol = match scheme.to_ascii_lowercase().as_str() {
            "http" => Protocol::Http,
            "https" => Protocol::Https,
            other => {
                return Err(Error::invalid_pattern(
                    url,
                    format!("unsupported scheme '{other}'"),
                ))
            }
        };

        let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
        let authority = authority.rsplit('@').next().unwrap_or(authority);
        let (host, port) = split_authority(authority, protocol.default_port())
            .ok_or_else(|| Error::invalid_pattern(url, "invalid host or port"))?;

        Ok(Self {
            full_url: normalize_url(trimmed),
            host: normalize_host(&host),
            port,
            protocol,
            client_ip: None,
        })
    }

    /// Attach the requesting client
    pub fn with_client(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }
}

/// Split `host[:port]` / `[v6]:port`
pub fn split_authority(authority: &str, default_port: u16) -> Option<(String, u16)> {
    if authority.is_empty() {
        return None;
    }
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None if tail.is_empty() => default_port,
            None => return None,
        };
        return Some((host.to_string(), port));
    }
    match authority.rsplit_once(':') {
        // A bare IPv6 literal has several colons and no port
        Some((host, _)) if host.contains(':') => Some((authority.to_string(), default_port)),
        Some((host, port)) => {
            let port: u16 = port.parse().ok()?;
            (!host.is_empty() && port != 0).then(|| (host.to_string(), port))
        }
        None => Some((authority.to_string(), default_port)),
    }
}

/// Cumulative evaluation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Evaluations performed
    pub evaluated: u64,
    /// Verdicts that blocked
    pub blocked: u64,
    /// Verdicts that allowed
    pub allowed: u64,
    /// Verdicts served from the cache
    pub cache_hits: u64,
}

#[derive(Debug, Default)]
struct Counters {
    evaluated: AtomicU64,
    blocked: AtomicU64,
    allowed: AtomicU64,
    cache_hits: AtomicU64,
}

/// Ordered allow/block pipeline
pub struct FilterEngine {
    lists: Arc<ListStore>,
    limiter: Arc<RateLimiter>,
    threat: Arc<dyn ThreatFeed>,
    cache: Arc<VerdictCache>,
    security: SecurityConfig,
    rate_limit: RateLimitConfig,
    cache_enabled: bool,
    threat_enabled: bool,
    counters: Counters,
}

impl FilterEngine {
    /// Compose the pipeline from its parts
    pub fn new(
        config: &Config,
        lists: Arc<ListStore>,
        limiter: Arc<RateLimiter>,
        threat: Arc<dyn ThreatFeed>,
        cache: Arc<VerdictCache>,
    ) -> Self {
        Self {
            lists,
            limiter,
            threat,
            cache,
            security: config.security.clone(),
            rate_limit: config.rate_limit.clone(),
            cache_enabled: config.cache.enabled,
            threat_enabled: config.threat.enabled,
            counters: Counters::default(),
        }
    }

    /// Subscribe the engine to its list store so changes clear the cache
    pub fn attach(self: &Arc<Self>) {
        self.lists.subscribe(Arc::clone(self) as Arc<dyn ListChangeListener>);
    }

    /// The list store this engine reads
    pub fn lists(&self) -> &Arc<ListStore> {
        &self.lists
    }

    /// The verdict cache
    pub fn cache(&self) -> &Arc<VerdictCache> {
        &self.cache
    }

    /// Classify one request
    #[instrument(level = "debug", skip(self, request), fields(host = %request.host, port = request.port))]
    pub fn evaluate(&self, request: &FilterRequest) -> Verdict {
        self.counters.evaluated.fetch_add(1, Ordering::Relaxed);
        let key = self.cache_key(request);

        // One snapshot for the whole evaluation
        let snapshot = self.lists.snapshot();

        let verdict = match self.cached(&key, request, &snapshot) {
            Some(verdict) => verdict,
            None => self.compute(&key, request, &snapshot),
        };

        if verdict.blocked {
            self.counters.blocked.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.allowed.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            blocked = verdict.blocked,
            cached = verdict.cached,
            reason = verdict.reason_text().as_deref().unwrap_or(""),
            "Request evaluated"
        );
        verdict
    }

    /// Cached verdict, still charging the rate limiter for allowed hits
    fn cached(&self, key: &str, request: &FilterRequest, snapshot: &ListSnapshot) -> Option<Verdict> {
        if !self.cache_enabled {
            return None;
        }
        let mut verdict = self.cache.get(key)?;
        self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);

        if !verdict.blocked && self.rate_limit.enabled && !snapshot.whitelist.matches(&request.host) {
            if let Some(limited) = self.check_rate(key, request) {
                return Some(limited);
            }
        }

        verdict.cached = true;
        Some(verdict)
    }

    fn compute(&self, key: &str, request: &FilterRequest, snapshot: &ListSnapshot) -> Verdict {
        let host = request.host.as_str();

        if snapshot.whitelist.matches(host) {
            return self.remember(key, snapshot, Verdict::allow());
        }

        if self.rate_limit.enabled {
            if let Some(limited) = self.check_rate(key, request) {
                return limited;
            }
        }

        if self.threat_enabled {
            let hit = self.threat.check_url(&request.full_url);
            if hit.threat {
                let reason = BlockReason::ThreatUrl {
                    kind: hit.kind.unwrap_or_else(|| "threat".to_string()),
                    source: hit.source.unwrap_or_else(|| "unknown".to_string()),
                };
                return self.remember(key, snapshot, Verdict::block(reason));
            }
        }

        if let Some(reason) = self.policy_violation(request) {
            return self.remember(key, snapshot, Verdict::block(reason));
        }

        if snapshot.malicious_urls.contains(&request.full_url) {
            return self.remember(key, snapshot, Verdict::block(BlockReason::MaliciousUrl));
        }

        if snapshot.blocklist.matches(host) {
            return self.remember(key, snapshot, Verdict::block(BlockReason::BlockedDomain));
        }

        self.remember(key, snapshot, Verdict::allow())
    }

    /// Records the request; on a limit the verdict is cached no longer than the block
    fn check_rate(&self, key: &str, request: &FilterRequest) -> Option<Verdict> {
        let rate_key = match (self.rate_limit.per_client, request.client_ip) {
            (true, Some(ip)) => format!("{ip}/{}", request.host),
            _ => request.host.clone(),
        };

        let decision = self.limiter.check_and_record(&rate_key);
        if !decision.limited {
            return None;
        }

        let verdict = Verdict::block(BlockReason::RateLimited);
        if self.cache_enabled {
            if let Some(remaining) = decision.retry_after(Instant::now()) {
                self.cache.insert_with_ttl(key, verdict.clone(), remaining);
            }
        }
        Some(verdict)
    }

    fn policy_violation(&self, request: &FilterRequest) -> Option<BlockReason> {
        if self.security.block_direct_ips && is_ip_literal(&request.host) {
            return Some(BlockReason::DirectIp);
        }
        if self.security.block_non_standard_ports && !self.security.is_port_allowed(request.port) {
            return Some(BlockReason::NonStandardPort(request.port));
        }
        if self.security.force_https && request.protocol == Protocol::Http {
            return Some(BlockReason::InsecureHttp);
        }
        None
    }

    /// Cache a verdict unless the lists it was computed from were replaced
    fn remember(&self, key: &str, snapshot: &ListSnapshot, verdict: Verdict) -> Verdict {
        if self.cache_enabled {
            self.cache.insert(key, verdict.clone());
            // A swap may have cleared the cache before the insert landed
            if self.lists.snapshot().version != snapshot.version {
                self.cache.remove(key);
            }
        }
        verdict
    }

    fn cache_key(&self, request: &FilterRequest) -> String {
        let base = match request.protocol {
            Protocol::Http => request.full_url.clone(),
            Protocol::Https => format!("{}:{}", request.host, request.port),
        };
        match (self.rate_limit.per_client, request.client_ip) {
            (true, Some(ip)) => format!("{ip}|{base}"),
            _ => base,
        }
    }

    /// Add a custom whitelist entry and lift any rate block on it
    pub fn whitelist_domain(&self, pattern: &str) -> Result<bool> {
        let added = self.lists.add_custom(ListKind::Whitelist, pattern)?;
        let host = normalize_host(pattern);
        self.limiter.reset(host.strip_prefix("*.").unwrap_or(&host));
        self.clear_verdict_cache();
        Ok(added)
    }

    /// Add a custom blocklist entry
    pub fn blocklist_domain(&self, pattern: &str) -> Result<bool> {
        let added = self.lists.add_custom(ListKind::Blocklist, pattern)?;
        self.clear_verdict_cache();
        Ok(added)
    }

    /// Remove a custom entry from either list
    pub fn remove_domain(&self, kind: ListKind, pattern: &str) -> Result<bool> {
        let removed = self.lists.remove_custom(kind, pattern)?;
        self.clear_verdict_cache();
        Ok(removed)
    }

    /// Drop every cached verdict
    pub fn clear_verdict_cache(&self) {
        self.cache.clear();
    }

    /// Counter snapshot
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            evaluated: self.counters.evaluated.load(Ordering::Relaxed),
            blocked: self.counters.blocked.load(Ordering::Relaxed),
            allowed: self.counters.allowed.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
        }
    }
}

impl ListChangeListener for FilterEngine {
    fn on_list_changed(&self, snapshot: &ListSnapshot) {
        debug!(version = snapshot.version, "Lists changed, clearing verdict cache");
        self.clear_verdict_cache();
    }
}

impl FeedChangeListener for FilterEngine {
    fn on_feed_changed(&self) {
        debug!("Threat feed changed, clearing verdict cache");
        self.clear_verdict_cache();
    }
}
