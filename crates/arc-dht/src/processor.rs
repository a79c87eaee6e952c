//! Local handling of DHT requests addressed to this node.
//!
//! The router decides *whether* a request is handled here; the [`Processor`]
//! decides *what* the answer is. Store requests are acknowledged with the
//! target hash, lookups either hit and reply with the record or miss.

use arc_transport::dht::{METHOD_GET, METHOD_MGET, METHOD_MPUT, METHOD_NACK, METHOD_PUT};
use arc_transport::DhtMessage;
use arc_types::{Hash, NodeId};
use tracing::debug;

use crate::chunking::{Chunk, Manifest};
use crate::store::ChunkStore;
use crate::{DhtError, Result};

#[derive(Debug)]
pub enum GetOutcome {
    Hit(DhtMessage),
    Miss,
}

/// Whether `method` asks for a record rather than storing one.
pub fn is_lookup(method: &str) -> bool {
    method == METHOD_GET || method == METHOD_MGET
}

/// Key-space position a request is routed toward.
///
/// - `PUT`: hash of the chunk content
/// - `MPUT`: the manifest root
/// - `GET`, `MGET`, `NACK`: the 32-byte hash payload
pub fn request_target(msg: &DhtMessage) -> Result<NodeId> {
    match msg.method.as_str() {
        METHOD_PUT => Ok(NodeId::from_bytes(Chunk::from_bytes(&msg.payload)?.hash())),
        METHOD_MPUT => Ok(NodeId::from_bytes(Manifest::from_bytes(&msg.payload)?.root())),
        METHOD_GET | METHOD_MGET | METHOD_NACK => hash_payload(&msg.payload).map(NodeId::from_bytes),
        other => Err(DhtError::UnknownMethod(other.to_string())),
    }
}

/// Whether a reply payload answers a request for `target`.
///
/// Lookup replies must carry a record hashing to the target; store acks must
/// echo it.
pub fn reply_matches(method: &str, target: &NodeId, payload: &[u8]) -> bool {
    match method {
        METHOD_GET => Chunk::from_bytes(payload).is_ok_and(|c| c.hash() == target.0),
        METHOD_MGET => Manifest::from_bytes(payload).is_ok_and(|m| m.root() == target.0),
        _ => payload == target.as_bytes(),
    }
}

fn hash_payload(payload: &[u8]) -> Result<Hash> {
    Hash::try_from(payload).map_err(|_| {
        DhtError::InvalidChunk(format!("expected a 32-byte hash, got {} bytes", payload.len()))
    })
}

/// Serves requests from a [`ChunkStore`].
#[derive(Default)]
pub struct Processor {
    store: ChunkStore,
}

impl Processor {
    pub fn new(store: ChunkStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ChunkStore {
        &mut self.store
    }

    /// Store the chunk in a `PUT` and build its acknowledgement.
    pub fn process_put(&mut self, request: &DhtMessage) -> Result<DhtMessage> {
        let chunk = Chunk::from_bytes(&request.payload)?;
        let hash = self.store.store_chunk(chunk)?;
        debug!(tx = request.transaction_id, hash = %hex::encode(&hash[..4]), "stored chunk");
        Ok(DhtMessage::reply_to(request, hash.to_vec()))
    }

    pub fn process_get(&self, request: &DhtMessage) -> Result<GetOutcome> {
        let hash = hash_payload(&request.payload)?;
        Ok(match self.store.get_chunk(&hash) {
            Some(chunk) => GetOutcome::Hit(DhtMessage::reply_to(request, chunk.to_bytes())),
            None => GetOutcome::Miss,
        })
    }

    /// Store the manifest in an `MPUT` and build its acknowledgement.
    pub fn process_mput(&mut self, request: &DhtMessage) -> Result<DhtMessage> {
        let manifest = Manifest::from_bytes(&request.payload)?;
        let root = self.store.store_manifest(manifest)?;
        debug!(tx = request.transaction_id, root = %hex::encode(&root[..4]), "stored manifest");
        Ok(DhtMessage::reply_to(request, root.to_vec()))
    }

    pub fn process_mget(&self, request: &DhtMessage) -> Result<GetOutcome> {
        let root = hash_payload(&request.payload)?;
        Ok(match self.store.get_manifest(&root) {
            Some(manifest) => GetOutcome::Hit(DhtMessage::reply_to(request, manifest.to_bytes())),
            None => GetOutcome::Miss,
        })
    }

    /// Answer a lookup from the local store, if the record is here.
    pub fn lookup(&self, request: &DhtMessage) -> Result<GetOutcome> {
        match request.method.as_str() {
            METHOD_GET => self.process_get(request),
            METHOD_MGET => self.process_mget(request),
            other => Err(DhtError::UnknownMethod(other.to_string())),
        }
    }

    /// Handle a request addressed to this node: stores are acked, lookup
    /// misses become a NACK.
    pub fn process(&mut self, request: &DhtMessage, target: &NodeId) -> Result<DhtMessage> {
        match request.method.as_str() {
            METHOD_PUT => self.process_put(request),
            METHOD_MPUT => self.process_mput(request),
            METHOD_GET | METHOD_MGET => Ok(match self.lookup(request)? {
                GetOutcome::Hit(reply) => reply,
                GetOutcome::Miss => DhtMessage::nack(request.transaction_id, target.as_bytes()),
            }),
            other => Err(DhtError::UnknownMethod(other.to_string())),
        }
    }
}
