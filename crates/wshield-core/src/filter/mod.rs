//! Domain matching primitives for whitelist/blocklist evaluation
//!
//! The filter supports:
//! - Exact domain matching, with and without a leading `www.`
//! - Wildcard matching (*.example.com)
//! - Parent matching (example.com matches sub.example.com)
//! - CIDR ranges for literal IP hosts
//! - A bloom pre-filter that rejects most non-members without touching the set

mod bloom;
mod domain_set;

pub use bloom::BloomFilter;
pub use domain_set::{is_ip_literal, normalize_host, DomainEntry, DomainSet, EntryKind};

use crate::error::Result;

/// A domain set paired with the bloom filter built from it
#[derive(Debug, Clone)]
pub struct GuardedSet {
    set: DomainSet,
    bloom: BloomFilter,
}

impl GuardedSet {
    /// Build the set and its bloom filter together
    pub fn build(entries: &[DomainEntry], fp_rate: f64) -> Result<Self> {
        let set = DomainSet::from_entries(entries);
        let bloom = BloomFilter::for_domain_set(&set, fp_rate)?;
        Ok(Self { set, bloom })
    }

    /// Empty set with a minimal filter
    pub fn empty() -> Self {
        Self {
            set: DomainSet::new(),
            bloom: BloomFilter::empty(),
        }
    }

    /// Bloom pre-check, then the authoritative match
    pub fn matches(&self, host: &str) -> bool {
        self.bloom.might_match_host(host) && self.set.matches(host)
    }

    /// The authoritative set
    pub fn set(&self) -> &DomainSet {
        &self.set
    }

    /// The paired bloom filter
    pub fn bloom(&self) -> &BloomFilter {
        &self.bloom
    }

    /// Entry count
    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// Whether the set has no entries
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

impl Default for GuardedSet {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guarded_matches_agree_with_set() {
        let entries: Vec<DomainEntry> = ["malware.test", "*.ads.test", "10.0.0.0/8"]
            .iter()
            .map(|p| DomainEntry::parse(p, "t").unwrap())
            .collect();
        let guarded = GuardedSet::build(&entries, 0.01).unwrap();

        for host in [
            "malware.test",
            "www.malware.test",
            "cdn.ads.test",
            "ads.test",
            "10.2.3.4",
            "clean.test",
            "11.0.0.1",
        ] {
            assert_eq!(guarded.matches(host), guarded.set().matches(host), "{host}");
        }
    }

    #[test]
    fn test_empty_matches_nothing() {
        let guarded = GuardedSet::empty();
        assert!(guarded.is_empty());
        assert!(!guarded.matches("example.com"));
    }
}
