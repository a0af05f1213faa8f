//! Fixed-size probabilistic set membership filter (spec §4.1, C1).
//!
//! Sizes its bit array and hash-function count from a target capacity and
//! false-positive rate, then uses double hashing over a 256-bit content
//! hash to derive each of its `k` bit positions — one real hash, not `k`
//! independent ones.

use crate::types::Hash256;
use serde::{Deserialize, Serialize};

/// A fixed-size Bloom filter sized for `capacity` elements at a target
/// false-positive rate `fp_rate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: Vec<u64>,
    m: usize,
    k: u32,
    capacity: usize,
    set_bits: usize,
}

const WORD_BITS: usize = 64;

impl BloomFilter {
    /// Create a new filter sized for `capacity` elements at `fp_rate`
    /// false-positive probability.
    ///
    /// `m = ceil(-n * ln(p) / (ln 2)^2)`, clamped to `m >= 64`.
    /// `k = ceil(m/n * ln 2)`, clamped to `1 <= k <= 10`.
    pub fn new(capacity: usize, fp_rate: f64) -> Self {
        let n = capacity.max(1) as f64;
        let p = fp_rate.clamp(f64::MIN_POSITIVE, 0.999999);
        let ln2_sq = std::f64::consts::LN_2 * std::f64::consts::LN_2;
        let m_raw = (-n * p.ln() / ln2_sq).ceil() as usize;
        let m = m_raw.max(64);
        let k_raw = ((m as f64 / n) * std::f64::consts::LN_2).ceil() as u32;
        let k = k_raw.clamp(1, 10);

        let words = m.div_ceil(WORD_BITS);
        Self {
            bits: vec![0u64; words],
            m,
            k,
            capacity,
            set_bits: 0,
        }
    }

    fn positions(&self, hash: Hash256) -> impl Iterator<Item = usize> + '_ {
        let (h1, h2) = hash.as_words();
        let (h1, h2) = (h1 as u64, h2 as u64);
        let m = self.m as u64;
        (0..self.k).map(move |i| ((h1.wrapping_add(i as u64 * h2)) % m) as usize)
    }

    fn hash_of(data: &[u8]) -> Hash256 {
        Hash256::of(data)
    }

    pub fn add(&mut self, data: &[u8]) {
        let hash = Self::hash_of(data);
        for pos in self.positions(hash).collect::<Vec<_>>() {
            let word = pos / WORD_BITS;
            let bit = pos % WORD_BITS;
            let mask = 1u64 << bit;
            if self.bits[word] & mask == 0 {
                self.bits[word] |= mask;
                self.set_bits += 1;
            }
        }
    }

    pub fn contains(&self, data: &[u8]) -> bool {
        let hash = Self::hash_of(data);
        self.positions(hash).all(|pos| {
            let word = pos / WORD_BITS;
            let bit = pos % WORD_BITS;
            self.bits[word] & (1u64 << bit) != 0
        })
    }

    pub fn clear(&mut self) {
        for word in self.bits.iter_mut() {
            *word = 0;
        }
        self.set_bits = 0;
    }

    /// Swamidass-Baldi estimator of the number of distinct elements added.
    pub fn approx_count(&self) -> f64 {
        if self.set_bits == 0 {
            return 0.0;
        }
        let m = self.m as f64;
        let k = self.k as f64;
        let x = self.set_bits as f64;
        if x >= m {
            return f64::INFINITY;
        }
        -(m / k) * (1.0 - x / m).ln()
    }

    pub fn fill_ratio(&self) -> f64 {
        if self.m == 0 {
            return 0.0;
        }
        self.set_bits as f64 / self.m as f64
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn m(&self) -> usize {
        self.m
    }

    pub fn k(&self) -> u32 {
        self.k
    }

    /// Binary marshalling for transport (spec §4.1).
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> crate::error::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Overlap estimator between two filters (spec §4.6), adopted verbatim
    /// from the reference source per spec §9 Open Question 1: it
    /// under-approximates overlap for highly-filled filters, but is kept
    /// for cross-compatibility.
    pub fn estimate_overlap(&self, other: &BloomFilter) -> f64 {
        let size_ratio = if self.capacity == 0 || other.capacity == 0 {
            0.0
        } else {
            self.capacity.min(other.capacity) as f64 / self.capacity.max(other.capacity) as f64
        };
        self.fill_ratio() * other.fill_ratio() * size_ratio
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_contains_is_always_true() {
        let mut f = BloomFilter::new(1000, 0.01);
        f.add(b"hello");
        assert!(f.contains(b"hello"));
    }

    #[test]
    fn absent_element_usually_reports_false() {
        let mut f = BloomFilter::new(1000, 0.01);
        for i in 0..500 {
            f.add(format!("present-{i}").as_bytes());
        }
        let false_positives = (0..1000)
            .filter(|i| f.contains(format!("absent-{i}").as_bytes()))
            .count();
        // fp rate configured at 1%; allow generous margin for a small sample.
        assert!(false_positives < 50, "false positives: {false_positives}");
    }

    #[test]
    fn m_is_clamped_to_at_least_64() {
        let f = BloomFilter::new(1, 0.5);
        assert!(f.m() >= 64);
    }

    #[test]
    fn k_is_clamped_between_1_and_10() {
        let f = BloomFilter::new(100_000, 0.0000001);
        assert!(f.k() >= 1 && f.k() <= 10);
    }

    #[test]
    fn clear_resets_membership() {
        let mut f = BloomFilter::new(100, 0.01);
        f.add(b"x");
        f.clear();
        assert_eq!(f.fill_ratio(), 0.0);
    }

    #[test]
    fn marshalling_round_trips() {
        let mut f = BloomFilter::new(100, 0.01);
        f.add(b"round-trip");
        let bytes = f.to_bytes();
        let decoded = BloomFilter::from_bytes(&bytes).unwrap();
        assert!(decoded.contains(b"round-trip"));
    }

    #[test]
    fn approx_count_tracks_additions_roughly() {
        let mut f = BloomFilter::new(1000, 0.01);
        for i in 0..200 {
            f.add(format!("item-{i}").as_bytes());
        }
        let count = f.approx_count();
        assert!((count - 200.0).abs() < 40.0, "approx_count: {count}");
    }
}
