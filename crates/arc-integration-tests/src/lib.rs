//! Multi-node fixtures for the arc integration tests.
//!
//! Nodes run a real router and TCP-kind hub in-process and are joined with
//! in-memory links, so scenarios exercise the full read task, filter and
//! routing path without sockets.
//!
//! ```sh
//! cargo test -p arc-integration-tests
//! ```

use std::sync::Arc;
use std::time::Duration;

use arc_crypto::ed25519::KeyPair;
use arc_router::{ConnHandle, Hub, Router, RouterConfig, RouterHandle};
use arc_transport::{LinkStream, Message};
use arc_types::{NodeId, TransportKind};
use tokio::sync::broadcast;

/// Buffer of each in-memory link direction.
pub const LINK_BUFFER: usize = 256 * 1024;

/// How long scenarios wait for something that should happen.
pub const SETTLE: Duration = Duration::from_secs(5);

/// How long scenarios wait to be sure something does not happen.
pub const QUIET: Duration = Duration::from_millis(300);

pub struct TestNode {
    pub keypair: Arc<KeyPair>,
    pub id: NodeId,
    pub router: RouterHandle,
    pub hub: Hub,
}

impl TestNode {
    pub async fn spawn(config: RouterConfig) -> arc_router::Result<Self> {
        let keypair = Arc::new(KeyPair::generate());
        let id = NodeId::from_bytes(keypair.node_id());
        let (router, _router_task) = Router::spawn(id, config.clone())?;
        let (hub, _hub_task) = Hub::spawn(
            TransportKind::Tcp,
            keypair.clone(),
            format!("memory:{}", id.short()),
            router.clone(),
            &config,
        )
        .await?;
        Ok(Self {
            keypair,
            id,
            router,
            hub,
        })
    }

    pub async fn spawn_many(count: usize) -> arc_router::Result<Vec<Self>> {
        let mut nodes = Vec::with_capacity(count);
        for _ in 0..count {
            nodes.push(Self::spawn(RouterConfig::default()).await?);
        }
        Ok(nodes)
    }

    /// Identified peers, polled until it equals `expected` or [`SETTLE`]
    /// passes.
    pub async fn wait_for_peers(&self, expected: usize) -> usize {
        let deadline = tokio::time::Instant::now() + SETTLE;
        loop {
            let peers = self.router.stats().await.map(|s| s.peers).unwrap_or(0);
            if peers == expected || tokio::time::Instant::now() >= deadline {
                return peers;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Join two nodes with an in-memory link.
pub async fn link(a: &TestNode, b: &TestNode) -> arc_router::Result<(ConnHandle, ConnHandle)> {
    let (left, right) = LinkStream::memory_pair(LINK_BUFFER);
    let ca = a.hub.attach(left, Some(b.id)).await?;
    let cb = b.hub.attach(right, Some(a.id)).await?;
    Ok((ca, cb))
}

/// Next chat message within `wait`, if any.
pub async fn next_chat(rx: &mut broadcast::Receiver<Message>, wait: Duration) -> Option<Message> {
    tokio::time::timeout(wait, rx.recv()).await.ok()?.ok()
}

/// Every chat message arriving within `wait`.
pub async fn drain_chat(rx: &mut broadcast::Receiver<Message>, wait: Duration) -> Vec<Message> {
    let mut seen = Vec::new();
    while let Some(message) = next_chat(rx, wait).await {
        seen.push(message);
    }
    seen
}
