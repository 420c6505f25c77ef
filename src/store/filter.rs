//! Bloom filter over stored keys.
//!
//! Answers "definitely not stored" without touching the database. False
//! positives fall through to a real lookup.

use std::hash::BuildHasher;

use ahash::RandomState;

/// Fixed seeds so a filter built in one process matches in another
const SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

const MIN_KEYS: usize = 1024;

pub struct MembershipFilter {
    words: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
    capacity: usize,
    inserted: usize,
    state: RandomState,
}

impl MembershipFilter {
    /// Size for `expected_keys` at `bits_per_key` (10 bits gives ~1% false positives)
    pub fn new(expected_keys: usize, bits_per_key: u32) -> Self {
        let capacity = expected_keys.max(MIN_KEYS);
        let bits_per_key = bits_per_key.max(1);
        let num_bits = (capacity as u64 * bits_per_key as u64).div_ceil(64) * 64;
        let num_hashes = ((bits_per_key as f64 * std::f64::consts::LN_2).round() as u32).clamp(1, 16);

        Self {
            words: vec![0; (num_bits / 64) as usize],
            num_bits,
            num_hashes,
            capacity,
            inserted: 0,
            state: RandomState::with_seeds(SEEDS[0], SEEDS[1], SEEDS[2], SEEDS[3]),
        }
    }

    fn bit_indices(&self, key: &[u8]) -> impl Iterator<Item = u64> + use<> {
        let hash = self.state.hash_one(key);
        let h1 = hash & 0xffff_ffff;
        let h2 = (hash >> 32) | 1;
        let num_bits = self.num_bits;
        (0..self.num_hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % num_bits)
    }

    pub fn insert(&mut self, key: &[u8]) {
        for bit in self.bit_indices(key) {
            self.words[(bit / 64) as usize] |= 1 << (bit % 64);
        }
        self.inserted += 1;
    }

    /// False means the key was never inserted
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.bit_indices(key)
            .all(|bit| self.words[(bit / 64) as usize] & (1 << (bit % 64)) != 0)
    }

    /// Inserted well past the sized capacity; false positives climb from here
    pub fn is_saturated(&self) -> bool {
        self.inserted > self.capacity * 2
    }

    pub fn len(&self) -> usize {
        self.inserted
    }

    pub fn is_empty(&self) -> bool {
        self.inserted == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_false_negatives() {
        let mut filter = MembershipFilter::new(5000, 10);
        for i in 0..5000u64 {
            filter.insert(&i.to_be_bytes());
        }
        for i in 0..5000u64 {
            assert!(filter.may_contain(&i.to_be_bytes()));
        }
    }

    #[test]
    fn test_false_positive_rate() {
        let mut filter = MembershipFilter::new(5000, 10);
        for i in 0..5000u64 {
            filter.insert(&i.to_be_bytes());
        }
        let false_positives = (1_000_000..1_010_000u64)
            .filter(|i| filter.may_contain(&i.to_be_bytes()))
            .count();
        // ~1% expected; allow generous slack
        assert!(false_positives < 500, "{} false positives", false_positives);
    }

    #[test]
    fn test_empty_filter_rejects() {
        let filter = MembershipFilter::new(0, 10);
        assert!(filter.is_empty());
        assert!(!filter.may_contain(b"anything"));
    }

    #[test]
    fn test_saturation() {
        let mut filter = MembershipFilter::new(0, 4);
        for i in 0..(MIN_KEYS * 2 + 1) as u64 {
            filter.insert(&i.to_le_bytes());
        }
        assert!(filter.is_saturated());
    }
}
