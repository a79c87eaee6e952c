//! Payload chunking and manifests.
//!
//! A payload is split into chunks of at most [`CHUNK_SIZE`] bytes. Each chunk
//! is content-addressed by the BLAKE3 hash of its bytes. A [`Manifest`] lists
//! the chunk hashes in order plus the total size; its root, the first chunk's
//! hash, names the whole payload.
//!
//! ## Chunk Format
//!
//! `[len: u16 BE][content: len bytes]`
//!
//! ## Manifest Format
//!
//! `[total_size: u64 BE][count: u16 BE][count × 32-byte hash]`

use arc_types::Hash;

use crate::{DhtError, Result, CHUNK_SIZE, MAX_MANIFEST_CHUNKS};

const LEN_PREFIX: usize = 2;
const MANIFEST_HEADER: usize = 8 + 2;
const HASH_LEN: usize = arc_crypto::blake3::HASH_LEN;

#[derive(Clone, PartialEq, Eq)]
pub struct Chunk {
    content: Vec<u8>,
}

impl Chunk {
    /// # Errors
    ///
    /// Returns [`DhtError::InvalidChunk`] when `content` exceeds [`CHUNK_SIZE`].
    pub fn new(content: Vec<u8>) -> Result<Self> {
        if content.len() > CHUNK_SIZE {
            return Err(DhtError::InvalidChunk(format!(
                "{} bytes exceeds chunk size {CHUNK_SIZE}",
                content.len()
            )));
        }
        Ok(Self { content })
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// BLAKE3 of the content, without the length prefix.
    pub fn hash(&self) -> Hash {
        arc_crypto::blake3::hash(&self.content)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(LEN_PREFIX + self.content.len());
        // Bounded by CHUNK_SIZE at construction.
        let len = self.content.len() as u16;
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&self.content);
        out
    }

    /// Parse a length-prefixed chunk. Trailing bytes are rejected.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (prefix, rest) = bytes
            .split_first_chunk::<LEN_PREFIX>()
            .ok_or_else(|| DhtError::InvalidChunk("missing length prefix".into()))?;
        let len = usize::from(u16::from_be_bytes(*prefix));
        if rest.len() != len {
            return Err(DhtError::InvalidChunk(format!(
                "length prefix {len} but {} content bytes",
                rest.len()
            )));
        }
        Self::new(rest.to_vec())
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("len", &self.content.len())
            .field("hash", &hex::encode(&self.hash()[..4]))
            .finish()
    }
}

/// Split `payload` into chunks. An empty payload yields one empty chunk.
pub fn split(payload: &[u8]) -> Vec<Chunk> {
    if payload.is_empty() {
        return vec![Chunk {
            content: Vec::new(),
        }];
    }
    payload
        .chunks(CHUNK_SIZE)
        .map(|c| Chunk {
            content: c.to_vec(),
        })
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Manifest {
    total_size: u64,
    chunk_hashes: Vec<Hash>,
}

impl Manifest {
    /// Describe `chunks` in order.
    ///
    /// # Errors
    ///
    /// - [`DhtError::InvalidChunk`] for an empty chunk list
    /// - [`DhtError::ManifestTooLarge`] above [`MAX_MANIFEST_CHUNKS`]
    pub fn build(chunks: &[Chunk]) -> Result<Self> {
        let total_size = chunks.iter().map(|c| c.len() as u64).sum();
        Self::from_parts(total_size, chunks.iter().map(Chunk::hash).collect())
    }

    fn from_parts(total_size: u64, chunk_hashes: Vec<Hash>) -> Result<Self> {
        if chunk_hashes.is_empty() {
            return Err(DhtError::InvalidChunk("manifest lists no chunks".into()));
        }
        if chunk_hashes.len() > MAX_MANIFEST_CHUNKS {
            return Err(DhtError::ManifestTooLarge {
                chunks: chunk_hashes.len(),
                max: MAX_MANIFEST_CHUNKS,
            });
        }
        Ok(Self {
            total_size,
            chunk_hashes,
        })
    }

    /// Hash of the first chunk.
    pub fn root(&self) -> Hash {
        self.chunk_hashes[0]
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_hashes(&self) -> &[Hash] {
        &self.chunk_hashes
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MANIFEST_HEADER + self.chunk_hashes.len() * HASH_LEN);
        out.extend_from_slice(&self.total_size.to_be_bytes());
        // Bounded by MAX_MANIFEST_CHUNKS at construction.
        out.extend_from_slice(&(self.chunk_hashes.len() as u16).to_be_bytes());
        for h in &self.chunk_hashes {
            out.extend_from_slice(h);
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (size, rest) = bytes
            .split_first_chunk::<8>()
            .ok_or_else(|| DhtError::InvalidChunk("truncated manifest".into()))?;
        let (count, rest) = rest
            .split_first_chunk::<2>()
            .ok_or_else(|| DhtError::InvalidChunk("truncated manifest".into()))?;
        let count = usize::from(u16::from_be_bytes(*count));
        if rest.len() != count * HASH_LEN {
            return Err(DhtError::InvalidChunk(format!(
                "manifest declares {count} hashes but carries {} bytes",
                rest.len()
            )));
        }
        let hashes = rest
            .chunks_exact(HASH_LEN)
            .filter_map(|h| <Hash>::try_from(h).ok())
            .collect();
        Self::from_parts(u64::from_be_bytes(*size), hashes)
    }
}

/// Rebuild the payload from `chunks`, checking each hash and the total size.
///
/// # Errors
///
/// - [`DhtError::MissingChunk`] when fewer chunks than listed are supplied
/// - [`DhtError::HashMismatch`] when a chunk does not match its listed hash
/// - [`DhtError::InvalidChunk`] for extra chunks or a size mismatch
pub fn reassemble(manifest: &Manifest, chunks: &[Chunk]) -> Result<Vec<u8>> {
    let total = manifest.chunk_hashes.len();
    if chunks.len() < total {
        return Err(DhtError::MissingChunk {
            index: chunks.len(),
            total,
        });
    }
    if chunks.len() > total {
        return Err(DhtError::InvalidChunk(format!(
            "{} chunks supplied for a manifest of {total}",
            chunks.len()
        )));
    }

    let mut out = Vec::with_capacity(usize::try_from(manifest.total_size).unwrap_or(0));
    for (index, (chunk, expected)) in chunks.iter().zip(&manifest.chunk_hashes).enumerate() {
        if chunk.hash() != *expected {
            return Err(DhtError::HashMismatch { index });
        }
        out.extend_from_slice(&chunk.content);
    }

    if out.len() as u64 != manifest.total_size {
        return Err(DhtError::InvalidChunk(format!(
            "reassembled {} bytes, manifest says {}",
            out.len(),
            manifest.total_size
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_split_5000_bytes() {
        let data = payload(5000);
        let chunks = split(&data);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 2048);
        assert_eq!(chunks[2].len(), 5000 - 2 * 2048);

        let manifest = Manifest::build(&chunks).expect("manifest");
        assert_eq!(manifest.root(), arc_crypto::blake3::hash(&data[..2048]));
        assert_eq!(manifest.total_size(), 5000);
        assert_eq!(reassemble(&manifest, &chunks).expect("reassemble"), data);
    }

    #[test]
    fn test_split_empty_and_exact() {
        let chunks = split(&[]);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_empty());
        let manifest = Manifest::build(&chunks).expect("manifest");
        assert!(reassemble(&manifest, &chunks).expect("reassemble").is_empty());

        assert_eq!(split(&payload(CHUNK_SIZE)).len(), 1);
        assert_eq!(split(&payload(CHUNK_SIZE + 1)).len(), 2);
    }

    #[test]
    fn test_chunk_bytes() {
        let chunk = Chunk::new(b"hello".to_vec()).expect("chunk");
        let bytes = chunk.to_bytes();
        assert_eq!(&bytes[..2], &[0, 5]);
        assert_eq!(Chunk::from_bytes(&bytes).expect("parse"), chunk);

        assert!(Chunk::from_bytes(&[0]).is_err());
        assert!(Chunk::from_bytes(&[0, 9, 1, 2]).is_err());
        assert!(Chunk::new(vec![0; CHUNK_SIZE + 1]).is_err());
    }

    #[test]
    fn test_manifest_bytes() {
        let chunks = split(&payload(7000));
        let manifest = Manifest::build(&chunks).expect("manifest");
        let bytes = manifest.to_bytes();
        assert_eq!(bytes.len(), 10 + 4 * 32);
        assert_eq!(Manifest::from_bytes(&bytes).expect("parse"), manifest);

        assert!(Manifest::from_bytes(&bytes[..bytes.len() - 1]).is_err());
        assert!(Manifest::from_bytes(&[0; 10]).is_err());
        assert!(Manifest::from_bytes(&[0; 4]).is_err());
    }

    #[test]
    fn test_manifest_limits() {
        assert!(matches!(
            Manifest::build(&[]),
            Err(DhtError::InvalidChunk(_))
        ));
        let too_many = split(&payload(CHUNK_SIZE * MAX_MANIFEST_CHUNKS + 1));
        assert!(matches!(
            Manifest::build(&too_many),
            Err(DhtError::ManifestTooLarge { .. })
        ));
    }

    #[test]
    fn test_reassemble_errors() {
        let chunks = split(&payload(5000));
        let manifest = Manifest::build(&chunks).expect("manifest");

        assert!(matches!(
            reassemble(&manifest, &chunks[..2]),
            Err(DhtError::MissingChunk { index: 2, total: 3 })
        ));

        let mut swapped = chunks.clone();
        swapped.swap(0, 1);
        assert!(matches!(
            reassemble(&manifest, &swapped),
            Err(DhtError::HashMismatch { index: 0 })
        ));
    }
}
