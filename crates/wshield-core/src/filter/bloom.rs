//! Bloom pre-filter
//!
//! Fast negative layer in front of a [`DomainSet`]. A miss is definitive, a
//! hit must always be confirmed against the set.

use super::domain_set::{is_ip_literal, DomainSet};
use crate::error::{Error, Result};
use sha2::{Digest, Sha256};

/// Upper bound on hash functions
const MAX_HASHES: u32 = 20;

/// Bit-vector bloom filter with SHA-256 derived positions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_hashes: u32,
    size: u64,
}

impl BloomFilter {
    /// Size a filter for `expected_items` at false-positive rate `fp_rate`
    ///
    /// `m = ceil(-n ln p / ln^2 2)`, `k = ceil(m/n ln 2)` clamped to 1..=20.
    pub fn with_rate(expected_items: usize, fp_rate: f64) -> Result<Self> {
        if !(fp_rate > 0.0 && fp_rate < 1.0) {
            return Err(Error::config_value(
                "lists.bloom_fp_rate",
                format!("{fp_rate} is outside (0, 1)"),
            ));
        }

        let n = expected_items.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let m = (-(n * fp_rate.ln()) / (ln2 * ln2)).ceil().max(1.0);
        let k = ((m / n) * ln2).ceil().clamp(1.0, MAX_HASHES as f64);

        let size = m as u64;
        Ok(Self {
            bits: vec![0; words_for(size)],
            num_hashes: k as u32,
            size,
        })
    }

    /// Single-word filter with nothing set
    pub fn empty() -> Self {
        Self {
            bits: vec![0],
            num_hashes: 1,
            size: 64,
        }
    }

    /// Rebuild a filter from exported parts
    pub fn from_parts(bits: Vec<u64>, num_hashes: u32, size: u64) -> Result<Self> {
        let expected = words_for(size);
        if size == 0 || bits.len() != expected {
            return Err(Error::BloomMismatch {
                expected,
                actual: bits.len(),
            });
        }
        if num_hashes == 0 || num_hashes > MAX_HASHES {
            return Err(Error::config_value(
                "bloom.num_hashes",
                format!("{num_hashes} is outside 1..={MAX_HASHES}"),
            ));
        }
        Ok(Self {
            bits,
            num_hashes,
            size,
        })
    }

    /// Build the filter paired with a domain set
    pub fn for_domain_set(set: &DomainSet, fp_rate: f64) -> Result<Self> {
        let mut bloom = Self::with_rate(set.name_count(), fp_rate)?;
        for item in set.bloom_items() {
            bloom.add(item);
        }
        Ok(bloom)
    }

    /// Insert an item
    pub fn add(&mut self, item: &str) {
        for i in 0..self.num_hashes {
            let bit = self.position(item, i);
            self.bits[(bit / 64) as usize] |= 1 << (bit % 64);
        }
    }

    /// False only if the item was definitely never added
    pub fn might_contain(&self, item: &str) -> bool {
        (0..self.num_hashes).all(|i| {
            let bit = self.position(item, i);
            self.bits[(bit / 64) as usize] & (1 << (bit % 64)) != 0
        })
    }

    /// Whether a host could match the paired set through names
    ///
    /// IP literals always pass so CIDR entries get checked.
    pub fn might_match_host(&self, host: &str) -> bool {
        if is_ip_literal(host) {
            return true;
        }
        DomainSet::lookup_keys(host)
            .iter()
            .any(|key| self.might_contain(key))
    }

    /// Raw bit words
    pub fn bits(&self) -> &[u64] {
        &self.bits
    }

    /// Hash function count
    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Bit count
    pub fn size(&self) -> u64 {
        self.size
    }

    fn position(&self, item: &str, index: u32) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(item.as_bytes());
        hasher.update(index.to_le_bytes());
        let digest = hasher.finalize();

        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(head) % self.size
    }
}

fn words_for(bits: u64) -> usize {
    bits.div_ceil(64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::domain_set::DomainEntry;
    use proptest::prelude::*;

    #[test]
    fn test_sizing() {
        let bloom = BloomFilter::with_rate(1000, 0.01).unwrap();
        // m = ceil(1000 * 4.605 / 0.4805) = 9586, k = ceil(9.586 * 0.693) = 7
        assert_eq!(bloom.size(), 9586);
        assert_eq!(bloom.num_hashes(), 7);
    }

    #[test]
    fn test_hash_count_clamped() {
        let bloom = BloomFilter::with_rate(1, 1e-12).unwrap();
        assert_eq!(bloom.num_hashes(), 20);
    }

    #[test]
    fn test_invalid_rate() {
        assert!(BloomFilter::with_rate(10, 0.0).is_err());
        assert!(BloomFilter::with_rate(10, 1.0).is_err());
        assert!(BloomFilter::with_rate(10, f64::NAN).is_err());
    }

    #[test]
    fn test_one_digest_per_hash_index() {
        let bloom = BloomFilter::with_rate(1000, 0.01).unwrap();
        for index in 0..bloom.num_hashes() {
            let mut input = b"example.com".to_vec();
            input.extend_from_slice(&index.to_le_bytes());
            let digest = Sha256::digest(&input);
            let mut head = [0u8; 8];
            head.copy_from_slice(&digest[..8]);
            let expected = u64::from_be_bytes(head) % bloom.size();
            assert_eq!(bloom.position("example.com", index), expected, "index {index}");
        }
    }

    #[test]
    fn test_add_and_query() {
        let mut bloom = BloomFilter::with_rate(100, 0.01).unwrap();
        bloom.add("example.com");

        assert!(bloom.might_contain("example.com"));
    }

    #[test]
    fn test_false_positive_rate_bounded() {
        let mut bloom = BloomFilter::with_rate(1000, 0.01).unwrap();
        for i in 0..1000 {
            bloom.add(&format!("member{i}.test"));
        }
        let hits = (0..10_000)
            .filter(|i| bloom.might_contain(&format!("other{i}.example")))
            .count();
        // 1% target, allow generous headroom
        assert!(hits < 300, "too many false positives: {hits}");
    }

    #[test]
    fn test_from_parts_mismatch() {
        let bloom = BloomFilter::with_rate(100, 0.01).unwrap();
        let mut bits = bloom.bits().to_vec();
        bits.pop();

        let err = BloomFilter::from_parts(bits, bloom.num_hashes(), bloom.size()).unwrap_err();
        assert!(matches!(err, Error::BloomMismatch { .. }));
    }

    #[test]
    fn test_from_parts_roundtrip() {
        let mut bloom = BloomFilter::with_rate(100, 0.01).unwrap();
        bloom.add("tracker.io");

        let copy =
            BloomFilter::from_parts(bloom.bits().to_vec(), bloom.num_hashes(), bloom.size())
                .unwrap();
        assert!(copy.might_contain("tracker.io"));
    }

    #[test]
    fn test_host_lookup_through_parents() {
        let entries = vec![
            DomainEntry::parse("ooklaserver.net", "t").unwrap(),
            DomainEntry::parse("*.ads.test", "t").unwrap(),
        ];
        let set = DomainSet::from_entries(&entries);
        let bloom = BloomFilter::for_domain_set(&set, 0.01).unwrap();

        assert!(bloom.might_match_host("sub.prod.ooklaserver.net"));
        assert!(bloom.might_match_host("www.ooklaserver.net"));
        assert!(bloom.might_match_host("x.ads.test"));
        assert!(bloom.might_match_host("10.1.2.3"));
    }

    proptest! {
        #[test]
        fn prop_no_false_negatives(items in proptest::collection::hash_set("[a-z0-9]{1,12}\\.[a-z]{2,6}", 1..200)) {
            let mut bloom = BloomFilter::with_rate(items.len(), 0.01).unwrap();
            for item in &items {
                bloom.add(item);
            }
            for item in &items {
                prop_assert!(bloom.might_contain(item));
            }
        }
    }
}
