//! Domain set implementation
//!
//! Immutable membership structure for exact domains, `*.` wildcards and
//! CIDR ranges. A new set is built on every list refresh and never mutated
//! after construction.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use std::collections::HashSet;
use std::net::IpAddr;

/// Maximum length of a textual domain name
const MAX_DOMAIN_LEN: usize = 253;

/// How a list entry is matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// Exact host match (plus `www.` toggling and parent walk)
    Exact,
    /// `*.base` - matches `base` and every subdomain of it
    Wildcard,
    /// `network/prefix` range for IP literal hosts
    Cidr,
}

/// One validated list entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainEntry {
    /// Normalized pattern text
    pub pattern: String,
    /// Match kind
    pub kind: EntryKind,
    /// Source list this entry came from
    pub source_id: String,
    /// When the entry was loaded
    pub added_at: DateTime<Utc>,
}

impl DomainEntry {
    /// Parse and validate a raw list line into an entry
    ///
    /// Supports:
    /// - Exact domains: "example.com" (a leading "www." is stripped)
    /// - Wildcard: "*.example.com"
    /// - CIDR: "10.0.0.0/8", "fd00::/8"
    pub fn parse(raw: &str, source_id: &str) -> Result<Self> {
        let trimmed = raw.trim();

        if trimmed.is_empty() {
            return Err(Error::invalid_pattern(raw, "empty pattern"));
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(Error::invalid_pattern(raw, "pattern contains whitespace"));
        }

        let (pattern, kind) = if trimmed.contains('/') {
            trimmed
                .parse::<IpNet>()
                .map_err(|e| Error::invalid_pattern(raw, format!("invalid CIDR: {e}")))?;
            (trimmed.to_string(), EntryKind::Cidr)
        } else {
            let lowered = trimmed.to_ascii_lowercase();
            let lowered = lowered.strip_suffix('.').unwrap_or(&lowered);

            if let Some(base) = lowered.strip_prefix("*.") {
                validate_hostname(raw, base)?;
                (lowered.to_string(), EntryKind::Wildcard)
            } else {
                let host = strip_www(lowered);
                if host.parse::<IpAddr>().is_err() {
                    validate_hostname(raw, host)?;
                }
                (host.to_string(), EntryKind::Exact)
            }
        };

        Ok(Self {
            pattern,
            kind,
            source_id: source_id.to_string(),
            added_at: Utc::now(),
        })
    }
}

/// Immutable snapshot of exact, wildcard and CIDR entries
#[derive(Debug, Clone, Default)]
pub struct DomainSet {
    /// Exact hostnames
    exact: HashSet<String>,
    /// Wildcard bases (stored without the "*." prefix)
    wildcards: HashSet<String>,
    /// CIDR ranges
    cidrs: Vec<IpNet>,
}

impl DomainSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from validated entries
    pub fn from_entries<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = &'a DomainEntry>,
    {
        let mut set = Self::new();
        for entry in entries {
            set.insert(entry);
        }
        set
    }

    /// Validate and classify a raw pattern
    pub fn parse_entry(raw: &str, source_id: &str) -> Result<DomainEntry> {
        DomainEntry::parse(raw, source_id)
    }

    /// Check whether a normalized pattern is stored verbatim
    pub fn contains_pattern(&self, pattern: &str) -> bool {
        if let Some(base) = pattern.strip_prefix("*.") {
            return self.wildcards.contains(base);
        }
        if pattern.contains('/') {
            return pattern
                .parse::<IpNet>()
                .map(|net| self.cidrs.contains(&net))
                .unwrap_or(false);
        }
        self.exact.contains(pattern)
    }

    fn insert(&mut self, entry: &DomainEntry) {
        match entry.kind {
            EntryKind::Exact => {
                self.exact.insert(entry.pattern.clone());
            }
            EntryKind::Wildcard => {
                if let Some(base) = entry.pattern.strip_prefix("*.") {
                    self.wildcards.insert(base.to_string());
                }
            }
            EntryKind::Cidr => {
                if let Ok(net) = entry.pattern.parse::<IpNet>() {
                    if !self.cidrs.contains(&net) {
                        self.cidrs.push(net);
                    }
                }
            }
        }
    }

    /// Check if a hostname or IP literal matches any entry
    ///
    /// Order, first hit wins: exact, exact with/without "www.", wildcard,
    /// parent-domain walk, CIDR containment for IP literals.
    pub fn matches(&self, host: &str) -> bool {
        let host = normalize_host(host);
        if host.is_empty() {
            return false;
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            return self.exact.contains(&host) || self.matches_ip(ip);
        }

        if self.exact.contains(&host) {
            return true;
        }

        let toggled = toggle_www(&host);
        if self.exact.contains(&toggled) {
            return true;
        }

        if self.wildcards.contains(&host) {
            return true;
        }

        // Parent walk: "a.b.c.d" -> "b.c.d" -> "c.d" -> "d"
        // Exact entries never match the bare final label.
        let mut current = host.as_str();
        while let Some(pos) = current.find('.') {
            current = &current[pos + 1..];
            if self.wildcards.contains(current) {
                return true;
            }
            if current.contains('.') && self.exact.contains(current) {
                return true;
            }
        }

        false
    }

    /// CIDR containment test
    pub fn matches_ip(&self, ip: IpAddr) -> bool {
        self.cidrs.iter().any(|net| net.contains(&ip))
    }

    /// Keys a bloom filter must be checked with to rule out a non-CIDR match
    ///
    /// A host matches through exact/wildcard entries only if one of these
    /// keys is an exact pattern or a wildcard base.
    pub(crate) fn lookup_keys(host: &str) -> Vec<String> {
        let host = normalize_host(host);
        let mut keys = Vec::with_capacity(4);
        if host.is_empty() {
            return keys;
        }

        keys.push(toggle_www(&host));
        let mut current = host.as_str();
        while let Some(pos) = current.find('.') {
            current = &current[pos + 1..];
            keys.push(current.to_string());
        }
        keys.push(host);
        keys
    }

    /// Items the paired bloom filter must contain
    pub(crate) fn bloom_items(&self) -> impl Iterator<Item = &str> {
        self.exact
            .iter()
            .chain(self.wildcards.iter())
            .map(String::as_str)
    }

    /// Whether the set holds any CIDR entries
    pub fn has_cidrs(&self) -> bool {
        !self.cidrs.is_empty()
    }

    /// Total number of entries
    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcards.len() + self.cidrs.len()
    }

    /// Check if set is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of exact plus wildcard entries (bloom sizing input)
    pub fn name_count(&self) -> usize {
        self.exact.len() + self.wildcards.len()
    }

    /// Get all patterns as a sorted vector
    pub fn patterns(&self) -> Vec<String> {
        let mut result: Vec<String> = self.exact.iter().cloned().collect();
        result.extend(self.wildcards.iter().map(|d| format!("*.{d}")));
        result.extend(self.cidrs.iter().map(ToString::to_string));
        result.sort();
        result
    }
}

/// Normalize a request host for lookups
///
/// Lower-cases, trims, drops a trailing dot and IPv6 brackets.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    let host = host.strip_suffix('.').unwrap_or(host);
    host.to_ascii_lowercase()
}

/// Whether a host string is an IPv4/IPv6 literal
pub fn is_ip_literal(host: &str) -> bool {
    normalize_host(host).parse::<IpAddr>().is_ok()
}

fn toggle_www(host: &str) -> String {
    match host.strip_prefix("www.") {
        Some(bare) => bare.to_string(),
        None => format!("www.{host}"),
    }
}

/// Strip "www." unless that would leave a single label ("www.com" stays)
fn strip_www(host: &str) -> &str {
    match host.strip_prefix("www.") {
        Some(bare) if bare.contains('.') => bare,
        _ => host,
    }
}

fn validate_hostname(raw: &str, host: &str) -> Result<()> {
    if host.is_empty() {
        return Err(Error::invalid_pattern(raw, "empty host"));
    }
    if host.len() > MAX_DOMAIN_LEN {
        return Err(Error::invalid_pattern(raw, "host longer than 253 characters"));
    }
    for label in host.split('.') {
        if label.is_empty() {
            return Err(Error::invalid_pattern(raw, "empty label"));
        }
        if label.len() > 63 {
            return Err(Error::invalid_pattern(raw, "label longer than 63 characters"));
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::invalid_pattern(raw, "invalid character in host"));
        }
    }
    Ok(())
}
