//! BLAKE3 hashing for the arc overlay.
//!
//! Plain [`hash`] addresses content (chunks, node ids, filter digests).
//! [`derive_key`] is used wherever two uses of the same bytes must not
//! collide, with the context strings in [`contexts`].

/// Registered derive-key context strings.
pub mod contexts {
    /// Bloom filter probe derivation.
    pub const FILTER_PROBE: &str = "arc v0 filter-probe";
    /// Decaying filter key derivation.
    pub const FILTER_KEY: &str = "arc v0 filter-key";
}

/// Length of every digest produced by this module.
pub const HASH_LEN: usize = 32;

/// Compute the BLAKE3 hash of `data`.
pub fn hash(data: &[u8]) -> [u8; HASH_LEN] {
    *::blake3::hash(data).as_bytes()
}

/// Derive 32 bytes from `key_material` in the domain named by `context`.
pub fn derive_key(context: &str, key_material: &[u8]) -> [u8; HASH_LEN] {
    ::blake3::derive_key(context, key_material)
}

/// Read a little-endian `u64` out of `digest` starting at `offset`.
///
/// Returns 0 when fewer than eight bytes remain.
pub fn digest_word(digest: &[u8; HASH_LEN], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    match digest.get(offset..offset + 8) {
        Some(bytes) => {
            buf.copy_from_slice(bytes);
            u64::from_le_bytes(buf)
        }
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_hash_known_vector() {
        // BLAKE3 of the empty input.
        assert_eq!(
            hash(b""),
            hex!("af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262")
        );
    }

    #[test]
    fn test_derive_key_domain_separated() {
        let a = derive_key(contexts::FILTER_PROBE, b"message");
        let b = derive_key(contexts::FILTER_KEY, b"message");
        assert_ne!(a, b);
        assert_ne!(a, hash(b"message"));
        assert_eq!(a, derive_key(contexts::FILTER_PROBE, b"message"));
    }

    #[test]
    fn test_context_registry() {
        for ctx in [contexts::FILTER_PROBE, contexts::FILTER_KEY] {
            assert!(ctx.starts_with("arc v0 "));
        }
        assert_ne!(contexts::FILTER_PROBE, contexts::FILTER_KEY);
    }

    #[test]
    fn test_digest_word() {
        let mut digest = [0u8; HASH_LEN];
        digest[8] = 1;
        assert_eq!(digest_word(&digest, 0), 0);
        assert_eq!(digest_word(&digest, 8), 1);
        assert_eq!(digest_word(&digest, 30), 0);
    }
}
