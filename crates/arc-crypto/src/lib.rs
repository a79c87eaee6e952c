//! # arc-crypto
//!
//! Hashing and signature primitives for the arc overlay.
//!
//! ## Modules
//!
//! - [`blake3`]: content hashing and domain-separated key derivation
//! - [`ed25519`]: node identity keys, frame signatures, key files

pub mod blake3;
pub mod ed25519;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Ed25519 signature verification failed.
    #[error("signature verification failed")]
    SignatureVerification,

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Invalid input data.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Key file could not be read or written.
    #[error("key file error: {0}")]
    KeyFile(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
