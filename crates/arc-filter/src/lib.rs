//! # arc-filter
//!
//! Duplicate suppression for flood broadcast.
//!
//! Flooding over a cyclic peer graph loops forever unless every node remembers
//! what it has already forwarded. Two set-membership structures share the
//! [`DuplicateFilter`] contract:
//!
//! - [`bloom::BloomFilter`]: fixed-size bit array, two probes per entry
//! - [`decay::DecayingFilter`]: keyed set that resets after a fixed number
//!   of insertions, so very old content can be accepted again
//!
//! [`shared::SharedFilter`] puts either behind a mutex for use from the read
//! and write tasks of one connection.

pub mod bloom;
pub mod decay;
pub mod shared;

pub use bloom::BloomFilter;
pub use decay::DecayingFilter;
pub use shared::SharedFilter;

/// Set-membership over message bytes.
///
/// False positives are allowed; an entry that was added and has not decayed
/// must always be reported as present.
pub trait DuplicateFilter {
    /// Record `data` as seen.
    fn add(&mut self, data: &[u8]);

    /// Whether `data` may have been seen.
    fn contains(&self, data: &[u8]) -> bool;

    /// Record `data`, returning `true` if it was not already present.
    fn check_and_add(&mut self, data: &[u8]) -> bool {
        if self.contains(data) {
            return false;
        }
        self.add(data);
        true
    }
}

/// Error types for filter construction.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("invalid filter size: {0}")]
    InvalidSize(usize),

    #[error("decay threshold must be non-zero")]
    ZeroDecayThreshold,
}

pub type Result<T> = std::result::Result<T, FilterError>;
