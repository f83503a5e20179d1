//! URL deduplication: an exact set for scheduling decisions plus a shared
//! probabilistic filter workers consult as a link-existence hint.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// Exact known-URL set. Scheduler-owned; the source of truth for dedup.
#[derive(Debug, Default)]
pub struct KnownUrls {
    set: HashSet<String>,
}

impl KnownUrls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a normalized URL; returns false if it was already known.
    pub fn insert(&mut self, normalized: &str) -> bool {
        self.set.insert(normalized.to_string())
    }

    pub fn contains(&self, normalized: &str) -> bool {
        self.set.contains(normalized)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

/// Append-only Bloom filter over normalized URLs, shared with workers.
///
/// Bits are set with atomic single-word OR and read with atomic loads, so
/// workers may query concurrently while the scheduler inserts. False
/// positives are acceptable: the filter only hints that a link target will
/// exist on disk, it never gates scheduling.
pub struct LinkFilter {
    words: Vec<AtomicU64>,
    bits: usize,
}

const PROBES: u64 = 3;
const SEED_A: u64 = 0x517c_c1b7_2722_0a95;
const SEED_B: u64 = 0x9e37_79b1_85eb_ca87;

impl LinkFilter {
    /// Create a filter with at least `bits` addressable bits.
    pub fn new(bits: usize) -> Self {
        let words = bits.div_ceil(64).max(1);
        Self {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
            bits: words * 64,
        }
    }

    pub fn insert(&self, normalized: &str) {
        let (h1, h2) = self.hash_pair(normalized.as_bytes());
        for i in 0..PROBES {
            let idx = (h1.wrapping_add(i.wrapping_mul(h2)) % self.bits as u64) as usize;
            let mask = 1u64 << (idx % 64);
            self.words[idx / 64].fetch_or(mask, Ordering::Relaxed);
        }
    }

    pub fn contains(&self, normalized: &str) -> bool {
        let (h1, h2) = self.hash_pair(normalized.as_bytes());
        for i in 0..PROBES {
            let idx = (h1.wrapping_add(i.wrapping_mul(h2)) % self.bits as u64) as usize;
            let mask = 1u64 << (idx % 64);
            if self.words[idx / 64].load(Ordering::Relaxed) & mask == 0 {
                return false;
            }
        }
        true
    }

    fn hash_pair(&self, data: &[u8]) -> (u64, u64) {
        (mix_hash(data, SEED_A), mix_hash(data, SEED_B) | 1)
    }
}

fn mix_hash(data: &[u8], seed: u64) -> u64 {
    let mut hash = seed ^ data.len() as u64;
    for &byte in data {
        hash ^= (byte as u64).wrapping_mul(0x1000_0000_01b3);
        hash = hash.rotate_left(13).wrapping_mul(0xff51_afd7_ed55_8ccd);
    }
    hash ^ (hash >> 33)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_known_urls_insert_once() {
        let mut known = KnownUrls::new();
        assert!(known.insert("https://x.test/a"));
        assert!(!known.insert("https://x.test/a"));
        assert!(known.contains("https://x.test/a"));
        assert!(!known.contains("https://x.test/b"));
        assert_eq!(known.len(), 1);
    }

    #[test]
    fn test_filter_membership() {
        let filter = LinkFilter::new(1 << 12);
        filter.insert("https://x.test/a");
        assert!(filter.contains("https://x.test/a"));
    }

    #[test]
    fn test_filter_mostly_rejects_unknown() {
        let filter = LinkFilter::new(1 << 16);
        for i in 0..100 {
            filter.insert(&format!("https://x.test/page/{i}"));
        }
        let false_positives = (0..1000)
            .filter(|i| filter.contains(&format!("https://y.test/other/{i}")))
            .count();
        // With 300 bits set out of 65k the FP rate is far below 1%.
        assert!(false_positives < 20, "false positives: {false_positives}");
    }

    #[test]
    fn test_filter_is_append_only_across_threads() {
        let filter = Arc::new(LinkFilter::new(1 << 14));
        let mut handles = Vec::new();
        for t in 0..4 {
            let filter = Arc::clone(&filter);
            handles.push(std::thread::spawn(move || {
                for i in 0..250 {
                    filter.insert(&format!("https://x.test/{t}/{i}"));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        for t in 0..4 {
            for i in 0..250 {
                assert!(filter.contains(&format!("https://x.test/{t}/{i}")));
            }
        }
    }
}
