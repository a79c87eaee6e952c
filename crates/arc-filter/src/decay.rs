//! Decaying duplicate filter.
//!
//! Each entry is a 64-bit key derived from the message bytes. After
//! `decay_after` insertions the whole set is dropped, bounding memory at the
//! cost of re-accepting content that is older than one decay window.

use std::collections::HashSet;

use arc_crypto::blake3::{self, contexts};
use tracing::debug;

use crate::{DuplicateFilter, FilterError, Result};

/// Default number of insertions between decays.
pub const DEFAULT_DECAY_AFTER: usize = 8192;

pub struct DecayingFilter {
    seen: HashSet<u64>,
    inserted: usize,
    decay_after: usize,
    decays: u64,
}

impl DecayingFilter {
    /// Create a filter that resets after `decay_after` insertions.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::ZeroDecayThreshold`] when `decay_after` is zero.
    pub fn new(decay_after: usize) -> Result<Self> {
        if decay_after == 0 {
            return Err(FilterError::ZeroDecayThreshold);
        }
        Ok(Self {
            seen: HashSet::with_capacity(decay_after.min(DEFAULT_DECAY_AFTER)),
            inserted: 0,
            decay_after,
            decays: 0,
        })
    }

    /// Forget everything.
    pub fn decay(&mut self) {
        debug!(
            entries = self.seen.len(),
            decays = self.decays + 1,
            "duplicate filter decayed"
        );
        self.seen.clear();
        self.inserted = 0;
        self.decays += 1;
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// How many times the filter has been reset.
    pub fn decays(&self) -> u64 {
        self.decays
    }

    fn key(data: &[u8]) -> u64 {
        let digest = blake3::derive_key(contexts::FILTER_KEY, data);
        blake3::digest_word(&digest, 0)
    }
}

impl DuplicateFilter for DecayingFilter {
    fn add(&mut self, data: &[u8]) {
        // Reset before inserting so the newest entry always survives.
        if self.inserted >= self.decay_after {
            self.decay();
        }
        if self.seen.insert(Self::key(data)) {
            self.inserted += 1;
        }
    }

    fn contains(&self, data: &[u8]) -> bool {
        self.seen.contains(&Self::key(data))
    }
}

impl Default for DecayingFilter {
    fn default() -> Self {
        Self {
            seen: HashSet::new(),
            inserted: 0,
            decay_after: DEFAULT_DECAY_AFTER,
            decays: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_then_contains() {
        let mut filter = DecayingFilter::default();
        assert!(!filter.contains(b"m1"));
        filter.add(b"m1");
        assert!(filter.contains(b"m1"));
        assert!(!filter.contains(b"m2"));
        assert_eq!(filter.len(), 1);
    }

    #[test]
    fn test_duplicate_add_does_not_count() {
        let mut filter = DecayingFilter::new(2).expect("filter");
        filter.add(b"a");
        filter.add(b"a");
        filter.add(b"a");
        assert_eq!(filter.decays(), 0);
        filter.add(b"b");
        assert_eq!(filter.decays(), 0);
        assert!(filter.contains(b"a"));
        assert!(filter.contains(b"b"));
    }

    #[test]
    fn test_decays_after_threshold() {
        let mut filter = DecayingFilter::new(3).expect("filter");
        filter.add(b"a");
        filter.add(b"b");
        filter.add(b"c");
        assert_eq!(filter.len(), 3);

        // The fourth insertion starts a new window.
        filter.add(b"d");
        assert_eq!(filter.decays(), 1);
        assert!(filter.contains(b"d"));
        assert!(!filter.contains(b"a"));
        assert_eq!(filter.len(), 1);
    }

    #[test]
    fn test_manual_decay() {
        let mut filter = DecayingFilter::default();
        filter.add(b"x");
        filter.decay();
        assert!(filter.is_empty());
        assert!(!filter.contains(b"x"));
        assert!(filter.check_and_add(b"x"));
    }

    #[test]
    fn test_zero_threshold_rejected() {
        assert!(matches!(
            DecayingFilter::new(0),
            Err(FilterError::ZeroDecayThreshold)
        ));
    }
}
