//! Bloom filter backing the PII pre-filter.
//!
//! Answers "definitely no" or "probably yes" for marker membership with a
//! tunable false-positive rate. No false negatives, so a negative lets the
//! firewall skip the PII regex stage entirely.

/// FNV-1a 64-bit hash.
fn fnv1a(data: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for &b in data {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

/// Second independent hash (DJB2 variant) for double hashing.
fn djb2(data: &[u8]) -> u64 {
    let mut h: u64 = 5381;
    for &b in data {
        h = h.wrapping_shl(5).wrapping_add(h).wrapping_add(b as u64);
    }
    h
}

/// Standard single-bit Bloom filter using double hashing:
/// `h(i) = (h1 + i*h2) mod m`.
#[derive(Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: usize,
    num_hashes: u32,
}

impl BloomFilter {
    /// Size the filter for `capacity` items at the given false-positive
    /// rate (e.g. 0.01 for 1%).
    pub fn with_capacity(capacity: usize, fp_rate: f64) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        assert!(fp_rate > 0.0 && fp_rate < 1.0, "fp_rate must be in (0, 1)");

        let ln2 = std::f64::consts::LN_2;
        let num_bits = ((-(capacity as f64) * fp_rate.ln()) / (ln2 * ln2)).ceil() as usize;
        let num_bits = num_bits.max(64);
        let num_hashes = ((num_bits as f64 / capacity as f64) * ln2).round().max(1.0) as u32;

        Self {
            bits: vec![0u64; num_bits.div_ceil(64)],
            num_bits,
            num_hashes,
        }
    }

    pub fn insert(&mut self, data: &[u8]) {
        let (h1, h2) = (fnv1a(data), djb2(data));
        for i in 0..self.num_hashes {
            let idx = (h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits as u64) as usize;
            self.bits[idx / 64] |= 1u64 << (idx % 64);
        }
    }

    /// `false` means definitely absent; `true` means probably present.
    pub fn contains(&self, data: &[u8]) -> bool {
        let (h1, h2) = (fnv1a(data), djb2(data));
        (0..self.num_hashes).all(|i| {
            let idx = (h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits as u64) as usize;
            (self.bits[idx / 64] >> (idx % 64)) & 1 == 1
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_false_negatives() {
        let mut bf = BloomFilter::with_capacity(100, 0.01);
        let items: Vec<String> = (0..100).map(|i| format!("marker-{i}")).collect();
        for item in &items {
            bf.insert(item.as_bytes());
        }
        for item in &items {
            assert!(bf.contains(item.as_bytes()), "lost {item}");
        }
    }

    #[test]
    fn test_definitely_absent() {
        let mut bf = BloomFilter::with_capacity(16, 0.001);
        bf.insert(b"ssn:");
        bf.insert(b"bearer");
        assert!(!bf.contains(b"completely-unrelated-token-xyz"));
    }

    #[test]
    fn test_false_positive_rate_bounded() {
        let mut bf = BloomFilter::with_capacity(1000, 0.01);
        for i in 0..1000 {
            bf.insert(format!("in-{i}").as_bytes());
        }
        let fp = (0..10_000)
            .filter(|i| bf.contains(format!("out-{i}").as_bytes()))
            .count();
        // 1% target; allow generous slack.
        assert!(fp < 500, "false positive count {fp} out of 10000");
    }
}
