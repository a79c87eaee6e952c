//! arc: an overlay node.
//!
//! Loads `arc.toml`, starts the router and one hub per configured transport,
//! keeps links open to every configured remote and directory peer, and runs
//! a chat console on stdin until Ctrl-C.

mod config;
mod console;

use std::sync::Arc;

use anyhow::Context;
use arc_crypto::ed25519::KeyPair;
use arc_dht::peers::{DirectoryEntry, FlatFileDirectory, PeerDirectory};
use arc_router::{Hub, QuicDialer, RemoteSpec, Router, TcpDialer};
use arc_transport::quic::{QuicConfig, QuicNode};
use arc_types::{NodeId, TransportKind};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::NodeConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = NodeConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("arc={}", config.log_level).parse()?),
        )
        .init();

    let keypair = Arc::new(
        KeyPair::load_or_generate(&config.local.key_file)
            .with_context(|| format!("identity key {}", config.local.key_file.display()))?,
    );
    let local_id = NodeId::from_bytes(keypair.node_id());
    info!(node = %local_id, "arc node starting");

    let (router, router_task) = Router::spawn(local_id, config.router.clone())?;
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // TCP hub; SOCKS links share it.
    let advertise = config.local.advertise().to_string();
    let (tcp_hub, hub_task) = Hub::spawn(
        TransportKind::Tcp,
        keypair.clone(),
        advertise.clone(),
        router.clone(),
        &config.router,
    )
    .await?;
    let (bound, listener) = tcp_hub.listen_tcp(&config.local.tcp_bind).await?;
    info!(addr = %bound, "TCP listener up");
    tasks.extend([hub_task, listener]);

    let mut quic = None;
    if let Some(bind) = &config.local.quic_bind {
        let node = QuicNode::new(QuicConfig {
            bind_addr: bind.parse().with_context(|| format!("quic_bind {bind}"))?,
            ..QuicConfig::default()
        })?;
        let (hub, hub_task) = Hub::spawn(
            TransportKind::Quic,
            keypair.clone(),
            advertise.clone(),
            router.clone(),
            &config.router,
        )
        .await?;
        tasks.extend([hub_task, hub.listen_quic(node.clone())]);
        quic = Some((hub, node));
    }

    let mut remotes: Vec<RemoteSpec> = Vec::new();
    for remote in &config.remotes {
        remotes.push(remote.to_spec()?);
    }

    if let Some(path) = &config.peers_file {
        let mut directory = FlatFileDirectory::load(path)?;
        for remote in &config.remotes {
            if let Some(key) = remote.verifying_key()? {
                let entry = DirectoryEntry::new(key, remote_address(remote), remote.transport);
                directory.add_peer(entry)?;
            }
        }
        for entry in directory.all_peers() {
            if remotes.iter().any(|r| r.expected == Some(entry.info.id)) {
                continue;
            }
            match directory_remote(&entry) {
                Some(spec) => remotes.push(spec),
                None => warn!(address = %entry.info.address, "directory entry has no usable port"),
            }
        }
    }

    for remote in remotes {
        info!(remote = %remote.address(), transport = %remote.transport, "persisting link");
        let task = match (remote.transport, &quic) {
            (TransportKind::Quic, Some((hub, node))) => {
                hub.persist(remote, QuicDialer::new(node.clone()))
            }
            (TransportKind::Quic, None) => {
                warn!(remote = %remote.address(), "QUIC remote configured without quic_bind");
                continue;
            }
            _ => tcp_hub.persist(remote, TcpDialer),
        };
        tasks.push(task);
    }

    tasks.push(tokio::spawn(console::print_chat(router.clone())));
    let console = tokio::spawn(console::run(router.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Ctrl-C received, shutting down"),
        result = console => match result {
            Ok(Ok(())) => info!("console closed, shutting down"),
            Ok(Err(e)) => warn!(error = %e, "console failed"),
            Err(e) => warn!(error = %e, "console task failed"),
        },
    }

    if let Some((hub, node)) = &quic {
        let _ = hub.shutdown().await;
        node.close();
    }
    let _ = tcp_hub.shutdown().await;
    let _ = router.shutdown().await;
    let _ = router_task.await;
    for task in tasks {
        task.abort();
    }
    info!("arc node stopped");
    Ok(())
}

fn remote_address(remote: &config::RemoteConfig) -> String {
    format!("{}:{}", remote.addr, remote.port)
}

/// Dial spec for a directory peer, pinned to the key it listed.
fn directory_remote(entry: &DirectoryEntry) -> Option<RemoteSpec> {
    let (host, port) = entry.info.address.rsplit_once(':')?;
    let mut spec = RemoteSpec::new(host, port.parse().ok()?, entry.info.transport);
    spec.expected = Some(entry.info.id);
    Some(spec)
}
