//! In-memory, capacity-bounded chunk store.
//!
//! Chunks are keyed by content hash and manifests by root hash, in separate
//! indexes. Both draw on the same slot budget; each slot accounts for
//! [`CHUNK_SIZE`] bytes of capacity.

use std::collections::HashMap;

use arc_types::Hash;
use tracing::debug;

use crate::chunking::{Chunk, Manifest};
use crate::{DhtError, Result, CHUNK_SIZE, DEFAULT_CHUNK_CAPACITY};

pub struct ChunkStore {
    capacity: usize,
    chunks: HashMap<Hash, Chunk>,
    manifests: HashMap<Hash, Manifest>,
}

impl ChunkStore {
    pub fn new(capacity_chunks: usize) -> Self {
        Self {
            capacity: capacity_chunks,
            chunks: HashMap::new(),
            manifests: HashMap::new(),
        }
    }

    fn ensure_slot(&self) -> Result<()> {
        if self.len() >= self.capacity {
            Err(DhtError::CapacityExceeded {
                capacity: self.capacity,
            })
        } else {
            Ok(())
        }
    }

    /// Store a chunk under its hash. Storing a chunk twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`DhtError::CapacityExceeded`] when no slot is free.
    pub fn store_chunk(&mut self, chunk: Chunk) -> Result<Hash> {
        let hash = chunk.hash();
        if self.chunks.contains_key(&hash) {
            debug!(hash = %hex::encode(&hash[..4]), "chunk already stored");
            return Ok(hash);
        }
        self.ensure_slot()?;
        self.chunks.insert(hash, chunk);
        Ok(hash)
    }

    pub fn get_chunk(&self, hash: &Hash) -> Option<&Chunk> {
        self.chunks.get(hash)
    }

    /// Store a manifest under its root. Storing it twice is a no-op.
    pub fn store_manifest(&mut self, manifest: Manifest) -> Result<Hash> {
        let root = manifest.root();
        if self.manifests.contains_key(&root) {
            debug!(root = %hex::encode(&root[..4]), "manifest already stored");
            return Ok(root);
        }
        self.ensure_slot()?;
        self.manifests.insert(root, manifest);
        Ok(root)
    }

    pub fn get_manifest(&self, root: &Hash) -> Option<&Manifest> {
        self.manifests.get(root)
    }

    /// Capacity in bytes.
    pub fn total_capacity(&self) -> u64 {
        self.capacity as u64 * CHUNK_SIZE as u64
    }

    /// Bytes accounted to occupied slots.
    pub fn capacity_used(&self) -> u64 {
        self.len() as u64 * CHUNK_SIZE as u64
    }

    /// Occupied slots, chunks and manifests together.
    pub fn len(&self) -> usize {
        self.chunks.len() + self.manifests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty() && self.manifests.is_empty()
    }
}

impl Default for ChunkStore {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::split;

    #[test]
    fn test_store_and_get() {
        let mut store = ChunkStore::new(4);
        let chunk = Chunk::new(b"abc".to_vec()).expect("chunk");
        let hash = store.store_chunk(chunk.clone()).expect("store");
        assert_eq!(hash, arc_crypto::blake3::hash(b"abc"));
        assert_eq!(store.get_chunk(&hash), Some(&chunk));
        assert!(store.get_chunk(&[0u8; 32]).is_none());
    }

    #[test]
    fn test_duplicate_is_noop() {
        let mut store = ChunkStore::new(1);
        let chunk = Chunk::new(b"same".to_vec()).expect("chunk");
        store.store_chunk(chunk.clone()).expect("first");
        store.store_chunk(chunk).expect("duplicate");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_capacity_exceeded() {
        let mut store = ChunkStore::new(2);
        for data in [&b"a"[..], b"b"] {
            store.store_chunk(Chunk::new(data.to_vec()).expect("chunk")).expect("store");
        }
        let err = store
            .store_chunk(Chunk::new(b"c".to_vec()).expect("chunk"))
            .expect_err("full");
        assert!(matches!(err, DhtError::CapacityExceeded { capacity: 2 }));
    }

    #[test]
    fn test_capacity_accounting() {
        let store = ChunkStore::default();
        assert_eq!(store.total_capacity(), 1024 * 24 * 2048);
        assert_eq!(store.capacity_used(), 0);

        let mut store = ChunkStore::new(8);
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 253) as u8).collect();
        let chunks = split(&data);
        let manifest = Manifest::build(&chunks).expect("manifest");
        for c in chunks {
            store.store_chunk(c).expect("store");
        }
        let root = store.store_manifest(manifest.clone()).expect("manifest");
        assert_eq!(store.len(), 4);
        assert_eq!(store.capacity_used(), 4 * 2048);
        assert_eq!(store.get_manifest(&root), Some(&manifest));
    }
}
