//! Ed25519 node identity keys.
//!
//! Every node owns one long-lived keypair. The public key is announced in
//! the signed identity frame sent at the start of each link, and the node id
//! is `BLAKE3(public_key)`.

use std::path::Path;

use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::{CryptoError, Result};

/// Length of an encoded signature.
pub const SIGNATURE_LEN: usize = 64;

/// Length of an encoded public key.
pub const PUBLIC_KEY_LEN: usize = 32;

/// An Ed25519 signing key (private key).
pub struct SigningKey {
    inner: ed25519_dalek::SigningKey,
}

impl Clone for SigningKey {
    fn clone(&self) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::from_bytes(&self.inner.to_bytes()),
        }
    }
}

impl Drop for SigningKey {
    fn drop(&mut self) {
        let mut bytes = self.inner.to_bytes();
        bytes.zeroize();
    }
}

/// An Ed25519 verification key (public key).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyingKey {
    inner: ed25519_dalek::VerifyingKey,
}

/// An Ed25519 signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    inner: ed25519_dalek::Signature,
}

/// A node's identity keypair.
#[derive(Clone)]
pub struct KeyPair {
    pub signing_key: SigningKey,
    pub verifying_key: VerifyingKey,
}

impl SigningKey {
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self {
            inner: ed25519_dalek::SigningKey::generate(&mut csprng),
        }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::from_bytes(bytes),
        }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey {
            inner: self.inner.verifying_key(),
        }
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature {
            inner: self.inner.sign(message),
        }
    }
}

impl VerifyingKey {
    /// Parse a public key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidInput`] if the bytes are not a valid
    /// curve point.
    pub fn from_bytes(bytes: &[u8; PUBLIC_KEY_LEN]) -> Result<Self> {
        let inner = ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map_err(|e| CryptoError::InvalidInput(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Parse a public key from an arbitrary slice, checking its length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; PUBLIC_KEY_LEN] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: PUBLIC_KEY_LEN,
                    actual: bytes.len(),
                })?;
        Self::from_bytes(&array)
    }

    /// Parse a hex-encoded public key, as written in peer directories.
    pub fn from_hex(text: &str) -> Result<Self> {
        let bytes = hex::decode(text.trim())
            .map_err(|e| CryptoError::InvalidInput(format!("bad public key hex: {e}")))?;
        Self::from_slice(&bytes)
    }

    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.inner.to_bytes()
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        self.inner.as_bytes()
    }

    /// Verify a signature on a message.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        self.inner
            .verify(message, &signature.inner)
            .map_err(|_| CryptoError::SignatureVerification)
    }
}

impl Signature {
    pub fn from_bytes(bytes: &[u8; SIGNATURE_LEN]) -> Self {
        Self {
            inner: ed25519_dalek::Signature::from_bytes(bytes),
        }
    }

    pub fn to_bytes(&self) -> [u8; SIGNATURE_LEN] {
        self.inner.to_bytes()
    }
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate())
    }

    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(secret))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// The node id this keypair announces.
    pub fn node_id(&self) -> [u8; 32] {
        derive_node_id(&self.verifying_key)
    }

    /// Load the secret key stored (hex encoded) at `path`, or generate a new
    /// keypair and write it there when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyFile`] if the file exists but cannot be read
    /// or parsed, or if a freshly generated key cannot be written.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| CryptoError::KeyFile(format!("{}: {e}", path.display())))?;
            let mut bytes = hex::decode(text.trim())
                .map_err(|e| CryptoError::KeyFile(format!("{}: {e}", path.display())))?;
            let secret: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                CryptoError::InvalidKeyLength {
                    expected: 32,
                    actual: bytes.len(),
                }
            })?;
            bytes.zeroize();
            tracing::debug!(path = %path.display(), "loaded identity key");
            return Ok(Self::from_bytes(&secret));
        }

        let keypair = Self::generate();
        let mut encoded = hex::encode(keypair.signing_key.to_bytes());
        let written = std::fs::write(path, &encoded);
        encoded.zeroize();
        written.map_err(|e| CryptoError::KeyFile(format!("{}: {e}", path.display())))?;
        restrict_permissions(path)?;
        tracing::info!(path = %path.display(), "generated new identity key");
        Ok(keypair)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| CryptoError::KeyFile(format!("{}: {e}", path.display())))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

/// Derive a node id from a public key: `BLAKE3(public_key)`.
pub fn derive_node_id(public_key: &VerifyingKey) -> [u8; 32] {
    crate::blake3::hash(public_key.as_bytes())
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("public", &self.verifying_key())
            .finish()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("node_id", &hex::encode(self.node_id()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let kp = KeyPair::generate();
        let sig = kp.signing_key.sign(b"identity frame");
        assert!(kp.verifying_key.verify(b"identity frame", &sig).is_ok());
        assert!(kp.verifying_key.verify(b"other frame", &sig).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let kp1 = KeyPair::generate();
        let kp2 = KeyPair::generate();
        let sig = kp1.signing_key.sign(b"test");
        assert!(matches!(
            kp2.verifying_key.verify(b"test", &sig),
            Err(CryptoError::SignatureVerification)
        ));
    }

    #[test]
    fn test_signature_bytes_roundtrip() {
        let kp = KeyPair::from_bytes(&[7u8; 32]);
        let sig = kp.signing_key.sign(b"test");
        assert_eq!(Signature::from_bytes(&sig.to_bytes()), sig);
    }

    #[test]
    fn test_verifying_key_from_hex() {
        let kp = KeyPair::from_bytes(&[9u8; 32]);
        let text = hex::encode(kp.verifying_key.to_bytes());
        let parsed = VerifyingKey::from_hex(&text).expect("valid key");
        assert_eq!(parsed, kp.verifying_key);

        assert!(matches!(
            VerifyingKey::from_slice(&[1u8; 5]),
            Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 5
            })
        ));
        assert!(VerifyingKey::from_hex("zz").is_err());
    }

    #[test]
    fn test_node_id_derivation() {
        let kp = KeyPair::from_bytes(&[42u8; 32]);
        assert_eq!(kp.node_id(), derive_node_id(&kp.verifying_key));
        assert_eq!(kp.node_id(), crate::blake3::hash(kp.verifying_key.as_bytes()));
        assert_ne!(kp.node_id(), KeyPair::from_bytes(&[43u8; 32]).node_id());
    }

    #[test]
    fn test_load_or_generate_persists_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("node.key");

        let first = KeyPair::load_or_generate(&path).expect("generate");
        assert!(path.exists());
        let second = KeyPair::load_or_generate(&path).expect("load");
        assert_eq!(first.verifying_key, second.verifying_key);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.key");
        std::fs::write(&path, "not hex at all").expect("write");
        assert!(matches!(
            KeyPair::load_or_generate(&path),
            Err(CryptoError::KeyFile(_))
        ));

        std::fs::write(&path, "abcd").expect("write");
        assert!(matches!(
            KeyPair::load_or_generate(&path),
            Err(CryptoError::InvalidKeyLength { .. })
        ));
    }
}
