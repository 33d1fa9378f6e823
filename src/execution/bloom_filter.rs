/// Value filter (Bloom filter) for global-uniqueness proofs
///
/// During validation every value (or sub-field) seen in a group that spans at
/// least two attributes is inserted. In later layers a column value that the
/// filter does not contain was unique in every earlier group, so any
/// combination containing it can match nothing and is skipped by the
/// aggregator.
use bitvec::prelude::{bitvec, BitVec, Lsb0};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Filter shared between the validator (writer) and aggregation jobs (readers)
pub type SharedFilter = Arc<Mutex<BloomFilter>>;

/// Bloom filter over value strings
///
/// Answers "definitely absent" or "possibly present"; there are no false
/// negatives, so a skip decided on absence is always sound.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: BitVec<u8, Lsb0>,
    num_hashes: usize,
    num_bits: usize,
    num_inserted: usize,
}

impl BloomFilter {
    /// # Arguments
    /// * `num_bits` - Number of bits in the filter (should be ~10x expected elements)
    /// * `num_hashes` - Number of hash functions
    pub fn new(num_bits: usize, num_hashes: usize) -> Self {
        let num_bits = num_bits.max(1);
        Self {
            bits: bitvec![u8, Lsb0; 0; num_bits],
            num_hashes: num_hashes.max(1),
            num_bits,
            num_inserted: 0,
        }
    }

    /// 10 bits per expected element and 3 hash functions
    pub fn with_expected_size(expected_elements: usize) -> Self {
        let num_bits = expected_elements.saturating_mul(10).max(1000);
        Self::new(num_bits, 3)
    }

    pub fn shared(expected_elements: usize) -> SharedFilter {
        Arc::new(Mutex::new(Self::with_expected_size(expected_elements)))
    }

    pub fn insert(&mut self, value: &str) {
        for i in 0..self.num_hashes {
            let bit_idx = self.hash(value, i);
            self.bits.set(bit_idx, true);
        }
        self.num_inserted += 1;
    }

    pub fn insert_batch<'a>(&mut self, values: impl IntoIterator<Item = &'a str>) {
        for value in values {
            self.insert(value);
        }
    }

    /// - `true` if value might be in the filter (could be false positive)
    /// - `false` if value is definitely not in the filter
    pub fn might_contain(&self, value: &str) -> bool {
        (0..self.num_hashes).all(|i| self.bits[self.hash(value, i)])
    }

    fn hash(&self, value: &str, hash_idx: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        (hash_idx as u64).hash(&mut hasher);
        (hasher.finish() % self.num_bits as u64) as usize
    }

    /// Reset to the empty filter, keeping the size
    pub fn clear(&mut self) {
        self.bits.fill(false);
        self.num_inserted = 0;
    }

    pub fn num_inserted(&self) -> usize {
        self.num_inserted
    }

    pub fn bits_set(&self) -> usize {
        self.bits.count_ones()
    }

    /// Formula: (1 - e^(-k*n/m))^k
    pub fn false_positive_rate(&self) -> f64 {
        if self.num_inserted == 0 {
            return 0.0;
        }
        let k = self.num_hashes as f64;
        let n = self.num_inserted as f64;
        let m = self.num_bits as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inserted_values_are_always_contained() {
        let mut filter = BloomFilter::with_expected_size(100);
        let values: Vec<String> = (0..100).map(|i| format!("value-{}", i)).collect();
        filter.insert_batch(values.iter().map(|v| v.as_str()));
        assert!(values.iter().all(|v| filter.might_contain(v)));
        assert_eq!(filter.num_inserted(), 100);
    }

    #[test]
    fn test_empty_filter_contains_nothing() {
        let filter = BloomFilter::with_expected_size(10);
        assert!(!filter.might_contain("anything"));
        assert_eq!(filter.false_positive_rate(), 0.0);
    }

    #[test]
    fn test_clear_resets_bits() {
        let mut filter = BloomFilter::new(64, 2);
        filter.insert("x");
        assert!(filter.bits_set() > 0);
        filter.clear();
        assert_eq!(filter.bits_set(), 0);
        assert!(!filter.might_contain("x"));
    }

    #[test]
    fn test_shared_handle_sees_inserts() {
        let shared = BloomFilter::shared(10);
        shared.lock().insert("k");
        assert!(shared.lock().might_contain("k"));
    }
}
