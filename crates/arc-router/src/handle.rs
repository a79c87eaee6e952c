//! Cloneable client for the router task.

use arc_dht::chunking::{self, Chunk, Manifest};
use arc_transport::Message;
use arc_types::{Hash, NodeId, TransportKind};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

use crate::router::{Command, Outbound, RouterEvent, RouterInput};
use crate::{HubId, Result, RouterError};

/// Counters reported by [`RouterHandle::stats`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Identified peers in the routing table.
    pub peers: usize,
    pub hubs: usize,
    /// Identified connections across all hubs.
    pub connections: usize,
    /// In-flight DHT transactions.
    pub transactions: usize,
    /// Chunks and manifests held locally.
    pub stored: usize,
    pub capacity_used: u64,
    pub total_capacity: u64,
    pub filter_entries: usize,
    pub flooded: u64,
    pub duplicates_dropped: u64,
    pub dht_forwarded: u64,
    pub nacks_sent: u64,
}

#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::Sender<RouterInput>,
    chat: broadcast::Sender<Message>,
    local_id: NodeId,
}

impl RouterHandle {
    pub(crate) fn new(
        tx: mpsc::Sender<RouterInput>,
        chat: broadcast::Sender<Message>,
        local_id: NodeId,
    ) -> Self {
        Self { tx, chat, local_id }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.tx
            .send(RouterInput::Command(cmd))
            .await
            .map_err(|_| RouterError::Shutdown)
    }

    async fn call<T>(&self, cmd: Command, rx: oneshot::Receiver<T>) -> Result<T> {
        self.send(cmd).await?;
        rx.await.map_err(|_| RouterError::Shutdown)
    }

    pub(crate) async fn deliver(&self, event: RouterEvent) -> Result<()> {
        self.tx
            .send(RouterInput::Event(event))
            .await
            .map_err(|_| RouterError::Shutdown)
    }

    /// Register a hub, receiving its id and the queue of work addressed to it.
    pub(crate) async fn register_hub(
        &self,
        kind: TransportKind,
    ) -> Result<(HubId, mpsc::Receiver<Outbound>)> {
        let (reply, rx) = oneshot::channel();
        self.call(Command::RegisterHub { kind, reply }, rx).await
    }

    /// Flood a locally originated message to every connection.
    ///
    /// The message is recorded in the duplicate filter first, so injecting the
    /// same bytes twice sends them once.
    pub async fn inject(&self, message: Message) -> Result<()> {
        self.send(Command::Inject { message }).await
    }

    /// Chat messages received from peers.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.chat.subscribe()
    }

    /// Store a chunk locally and at the node closest to its hash.
    pub async fn put_chunk(&self, chunk: Chunk) -> Result<Hash> {
        let (reply, rx) = oneshot::channel();
        self.call(Command::PutChunk { chunk, reply }, rx).await?
    }

    pub async fn get_chunk(&self, hash: Hash) -> Result<Chunk> {
        let (reply, rx) = oneshot::channel();
        self.call(Command::GetChunk { hash, reply }, rx).await?
    }

    pub async fn put_manifest(&self, manifest: Manifest) -> Result<Hash> {
        let (reply, rx) = oneshot::channel();
        self.call(Command::PutManifest { manifest, reply }, rx).await?
    }

    pub async fn get_manifest(&self, root: Hash) -> Result<Manifest> {
        let (reply, rx) = oneshot::channel();
        self.call(Command::GetManifest { root, reply }, rx).await?
    }

    /// Split `payload` into chunks, store each one and its manifest, and
    /// return the manifest root.
    ///
    /// # Errors
    ///
    /// Fails if the payload needs more chunks than a manifest can list, or if
    /// any store fails both locally and remotely.
    pub async fn insert_data(&self, payload: &[u8]) -> Result<Hash> {
        let chunks = chunking::split(payload);
        let manifest = Manifest::build(&chunks)?;
        for chunk in chunks {
            self.put_chunk(chunk).await?;
        }
        let root = self.put_manifest(manifest).await?;
        debug!(root = %hex::encode(&root[..4]), len = payload.len(), "data inserted");
        Ok(root)
    }

    /// Fetch the manifest at `root`, every chunk it lists, and reassemble.
    pub async fn fetch(&self, root: Hash) -> Result<Vec<u8>> {
        let manifest = self.get_manifest(root).await?;
        let mut chunks = Vec::with_capacity(manifest.chunk_hashes().len());
        for hash in manifest.chunk_hashes() {
            chunks.push(self.get_chunk(*hash).await?);
        }
        Ok(chunking::reassemble(&manifest, &chunks)?)
    }

    pub async fn stats(&self) -> Result<RouterStats> {
        let (reply, rx) = oneshot::channel();
        self.call(Command::Stats { reply }, rx).await
    }

    /// Stop the router task. In-flight local requests fail with a timeout.
    pub async fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown).await
    }
}
