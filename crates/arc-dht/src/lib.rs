//! # arc-dht
//!
//! Kademlia routing and content storage for the arc overlay.
//!
//! This crate implements:
//! - A 256-bucket routing table keyed by XOR distance, with next-hop selection
//! - Transaction tracking and backtracking state for routed requests
//! - Splitting payloads into 2048-byte chunks plus a manifest for reassembly
//! - A capacity-bounded in-memory chunk store and the PUT/GET processors over it
//! - The peer directory seam and its flat-file implementation
//!
//! Network I/O lives in `arc-router`; everything here is synchronous state.
//!
//! ## Key Parameters
//!
//! | Parameter | Value |
//! |---|---|
//! | Buckets | 256 |
//! | Chunk size | 2048 bytes |
//! | Chunk store capacity | 1024 × 24 chunks |
//! | Max hops | 16 |
//! | Backtrack budget | 8 peers |
//! | Transaction timeout | 30 seconds |

pub mod chunking;
pub mod kademlia;
pub mod peers;
pub mod processor;
pub mod store;
pub mod transaction;

use arc_types::NodeId;

/// Number of buckets in the routing table (one per bit of the key space).
pub const NUM_BUCKETS: usize = 256;

/// Maximum content bytes in one chunk.
pub const CHUNK_SIZE: usize = 2048;

/// Default chunk store capacity, in chunks.
pub const DEFAULT_CHUNK_CAPACITY: usize = 1024 * 24;

/// Hop count at which a request is refused.
pub const DEFAULT_MAX_HOPS: i64 = 16;

/// Number of failed peers after which a transaction is exhausted.
pub const DEFAULT_MAX_BACKTRACK: usize = 8;

pub const DEFAULT_TRANSACTION_TIMEOUT_SECS: u64 = 30;

/// Largest number of chunks a manifest may list.
pub const MAX_MANIFEST_CHUNKS: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum DhtError {
    /// The chunk store has no free slots.
    #[error("chunk store full: capacity {capacity} chunks")]
    CapacityExceeded { capacity: usize },

    /// Every candidate peer failed for this target.
    #[error("lookup exhausted for {0}")]
    LookupExhausted(NodeId),

    #[error("no peers to route to")]
    NoPeers,

    #[error("transaction timed out")]
    Timeout,

    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("missing chunk {index} of {total}")]
    MissingChunk { index: usize, total: usize },

    /// Content does not hash to the value it was requested under.
    #[error("hash mismatch at chunk {index}")]
    HashMismatch { index: usize },

    #[error("manifest too large: {chunks} chunks, max {max}")]
    ManifestTooLarge { chunks: usize, max: usize },

    #[error("unknown DHT method {0:?}")]
    UnknownMethod(String),

    #[error("transaction {0} already registered")]
    DuplicateTransaction(i64),

    /// Peer directory I/O or parse failure.
    #[error("peer directory error: {0}")]
    Directory(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] arc_crypto::CryptoError),
}

/// Convenience result type for DHT operations.
pub type Result<T> = std::result::Result<T, DhtError>;
