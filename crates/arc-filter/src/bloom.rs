//! Fixed-size Bloom filter.
//!
//! ## Parameters
//!
//! - [`BLOOM_SIZE`] = 32 KiB (262,144 bits)
//! - [`NUM_PROBES`] = 2
//! - Probes: the digest `BLAKE3::derive_key("arc v0 filter-probe", data)`
//!   read as little-endian words at offsets 0 and 8, modulo the bit count
//!
//! Membership is reported when **any** probe bit is set. This over-reports
//! compared with an all-bits test, which only raises the false positive rate;
//! an added entry is never missed.

use arc_crypto::blake3::{self, contexts};

use crate::{DuplicateFilter, FilterError, Result};

/// Default bit array size in bytes.
pub const BLOOM_SIZE: usize = 32 * 1024;

/// Number of probe positions per entry.
pub const NUM_PROBES: usize = 2;

/// A fixed-size Bloom filter over message bytes.
pub struct BloomFilter {
    bit_array: Vec<u8>,
    count: usize,
}

impl BloomFilter {
    /// Create an empty filter of the default size.
    pub fn new() -> Self {
        Self {
            bit_array: vec![0u8; BLOOM_SIZE],
            count: 0,
        }
    }

    /// Create an empty filter of `size_bytes` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::InvalidSize`] for a zero size.
    pub fn with_size(size_bytes: usize) -> Result<Self> {
        if size_bytes == 0 {
            return Err(FilterError::InvalidSize(size_bytes));
        }
        Ok(Self {
            bit_array: vec![0u8; size_bytes],
            count: 0,
        })
    }

    /// Number of entries added since the last clear.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Reset every bit.
    pub fn clear(&mut self) {
        self.bit_array.fill(0);
        self.count = 0;
    }

    /// Fraction of bits currently set.
    pub fn fill_ratio(&self) -> f64 {
        let set: u32 = self.bit_array.iter().map(|b| b.count_ones()).sum();
        f64::from(set) / (self.bit_array.len() * 8) as f64
    }

    fn probe_positions(&self, data: &[u8]) -> [usize; NUM_PROBES] {
        let digest = blake3::derive_key(contexts::FILTER_PROBE, data);
        let bits = (self.bit_array.len() * 8) as u64;
        let mut positions = [0usize; NUM_PROBES];
        for (i, pos) in positions.iter_mut().enumerate() {
            *pos = (blake3::digest_word(&digest, i * 8) % bits) as usize;
        }
        positions
    }

    fn bit_is_set(&self, pos: usize) -> bool {
        (self.bit_array[pos / 8] >> (pos % 8)) & 1 == 1
    }
}

impl DuplicateFilter for BloomFilter {
    fn add(&mut self, data: &[u8]) {
        for pos in self.probe_positions(data) {
            self.bit_array[pos / 8] |= 1 << (pos % 8);
        }
        self.count += 1;
    }

    fn contains(&self, data: &[u8]) -> bool {
        self.probe_positions(data)
            .iter()
            .any(|&pos| self.bit_is_set(pos))
    }
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self::new()
    }
}
