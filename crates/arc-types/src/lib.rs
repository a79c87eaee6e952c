//! # arc-types
//!
//! Shared identity and addressing types used across the arc workspace.

pub mod network;

pub use network::{Distance, NodeId, PeerInfo, TransportKind};

/// A 32-byte BLAKE3 digest.
pub type Hash = [u8; 32];

/// Content hash of a chunk's unpadded bytes.
pub type ContentHash = [u8; 32];

/// Width of a node identifier in bytes.
pub const NODE_ID_LEN: usize = 32;

/// Width of a node identifier in bits; also the number of routing buckets.
pub const NODE_ID_BITS: usize = NODE_ID_LEN * 8;

/// Errors raised while parsing shared types from text.
#[derive(Debug, thiserror::Error)]
pub enum TypeError {
    #[error("invalid node id: {0}")]
    InvalidNodeId(String),

    #[error("unknown transport kind: {0}")]
    UnknownTransport(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(NODE_ID_LEN, 32);
        assert_eq!(NODE_ID_BITS, 256);
    }

    #[test]
    fn test_error_display() {
        let err = TypeError::UnknownTransport("carrier-pigeon".into());
        assert_eq!(err.to_string(), "unknown transport kind: carrier-pigeon");
    }
}
