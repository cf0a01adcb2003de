//! Integration tests for domain matching and the bloom pre-filter

use proptest::prelude::*;
use wshield_core::filter::{BloomFilter, DomainEntry, DomainSet, GuardedSet};

fn entries(patterns: &[&str]) -> Vec<DomainEntry> {
    patterns
        .iter()
        .map(|p| DomainEntry::parse(p, "test").unwrap())
        .collect()
}

// ============ Hierarchy ============

#[test]
fn test_parent_hierarchy_blocklist() {
    let set = GuardedSet::build(&entries(&["example.com"]), 0.01).unwrap();

    assert!(set.matches("example.com"));
    assert!(set.matches("sub.example.com"));
    assert!(set.matches("a.b.example.com"));
    assert!(!set.matches("notexample.com"));
    assert!(!set.matches("example.com.evil.test"));
}

#[test]
fn test_cidr_whitelist() {
    let set = GuardedSet::build(&entries(&["192.168.0.0/16"]), 0.01).unwrap();

    assert!(set.matches("192.168.1.1"));
    assert!(!set.matches("10.0.0.1"));
}

#[test]
fn test_wildcard_and_exact_mix() {
    let set = GuardedSet::build(&entries(&["*.safe.test", "other.test"]), 0.01).unwrap();

    assert!(set.matches("safe.test"));
    assert!(set.matches("x.y.safe.test"));
    assert!(set.matches("www.other.test"));
    assert!(!set.matches("unsafe.test"));
}

// ============ Bloom ============

#[test]
fn test_bloom_rejects_most_outsiders() {
    let patterns: Vec<String> = (0..2000).map(|i| format!("blocked{i}.test")).collect();
    let list: Vec<DomainEntry> = patterns
        .iter()
        .map(|p| DomainEntry::parse(p, "t").unwrap())
        .collect();
    let set = DomainSet::from_entries(&list);
    let bloom = BloomFilter::for_domain_set(&set, 0.01).unwrap();

    let passed = (0..2000)
        .filter(|i| bloom.might_match_host(&format!("host{i}.example")))
        .count();
    // Each host checks several keys, so allow a few times the base rate
    assert!(passed < 200, "pre-filter let through {passed} of 2000");
}

proptest! {
    #[test]
    fn prop_every_member_passes_bloom(labels in proptest::collection::vec("[a-z][a-z0-9-]{0,10}[a-z0-9]", 1..50)) {
        let list: Vec<DomainEntry> = labels
            .iter()
            .map(|l| DomainEntry::parse(&format!("{l}.test"), "p").unwrap())
            .collect();
        let set = DomainSet::from_entries(&list);
        let bloom = BloomFilter::for_domain_set(&set, 0.01).unwrap();

        for entry in &list {
            prop_assert!(bloom.might_contain(&entry.pattern));
            prop_assert!(bloom.might_match_host(&entry.pattern));
        }
    }

    #[test]
    fn prop_subdomains_match_parent(
        base in "[a-z]{3,10}\\.(com|net|org)",
        subs in proptest::collection::vec("[a-z0-9]{1,8}", 1..4),
    ) {
        let set = GuardedSet::build(&[DomainEntry::parse(&base, "p").unwrap()], 0.01).unwrap();
        let host = format!("{}.{base}", subs.join("."));

        prop_assert!(set.matches(&host));
        let lookalike = format!("x{base}");
        prop_assert!(!set.matches(&lookalike));
    }

    #[test]
    fn prop_guarded_agrees_with_set(host in "[a-z]{1,6}(\\.[a-z]{1,6}){0,3}") {
        let list = entries(&["ab.cd", "*.ef", "gh.ij.kl", "10.0.0.0/8"]);
        let guarded = GuardedSet::build(&list, 0.01).unwrap();
        prop_assert_eq!(guarded.matches(&host), guarded.set().matches(&host));
    }
}
