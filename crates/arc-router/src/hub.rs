//! Per-transport connection hub.
//!
//! A hub is an actor owning every connection of one transport kind. Each
//! connection runs a read task and a write task; the actor keeps their write
//! queues, close signals and per-connection Bloom filters, and fans out the
//! work the router addresses to it.
//!
//! ## Connection lifecycle
//!
//! 1. `attach` queues the signed identity announcement as the first frame
//!    and starts both tasks in the `Connecting` state.
//! 2. The first control frame read is verified. Failure closes the link;
//!    success moves it to `Active` and reports the peer to the router.
//! 3. Either task failing, or the hub shutting down, closes the link. An
//!    identified link is then reported down.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_crypto::ed25519::KeyPair;
use arc_filter::{BloomFilter, DuplicateFilter, SharedFilter};
use arc_transport::frame::MAX_BODY_SIZE;
use arc_transport::link::{BoxedReader, BoxedWriter};
use arc_transport::quic::QuicNode;
use arc_transport::{IdentityAnnouncement, LinkStream, Message, MessageType};
use arc_types::{NodeId, PeerInfo, TransportKind};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RouterConfig;
use crate::dialer::{Dialer, RemoteSpec};
use crate::handle::RouterHandle;
use crate::router::{Outbound, RouterEvent};
use crate::{ConnId, HubId, Result, RouterError};

/// Pause between reconnection attempts of a persistent link.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

const COMMAND_DEPTH: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for the peer's identity announcement.
    Connecting,
    Active,
}

/// Snapshot of one connection, from [`Hub::connections`].
#[derive(Clone, Debug)]
pub struct ConnInfo {
    pub id: ConnId,
    pub state: ConnState,
    pub peer: Option<PeerInfo>,
    pub remote: String,
}

/// Returned by [`Hub::attach`]; resolves when the link closes.
#[derive(Debug)]
pub struct ConnHandle {
    pub id: ConnId,
    closed: watch::Receiver<bool>,
}

impl ConnHandle {
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Wait until the connection is closed.
    pub async fn closed(&mut self) {
        loop {
            if *self.closed.borrow_and_update() {
                return;
            }
            if self.closed.changed().await.is_err() {
                return;
            }
        }
    }
}

enum HubCommand {
    Attach {
        link: LinkStream,
        expected: Option<NodeId>,
        reply: oneshot::Sender<ConnHandle>,
    },
    Identified {
        conn: ConnId,
        peer: PeerInfo,
        reply: oneshot::Sender<bool>,
    },
    Close {
        conn: ConnId,
    },
    Connections {
        reply: oneshot::Sender<Vec<ConnInfo>>,
    },
    Shutdown,
}

struct ConnEntry {
    tx: mpsc::Sender<Message>,
    close: watch::Sender<bool>,
    filter: SharedFilter<BloomFilter>,
    state: ConnState,
    peer: Option<PeerInfo>,
    remote: String,
}

impl ConnEntry {
    fn info(&self, id: ConnId) -> ConnInfo {
        ConnInfo {
            id,
            state: self.state,
            peer: self.peer.clone(),
            remote: self.remote.clone(),
        }
    }
}

/// Cloneable handle to a running hub.
#[derive(Clone)]
pub struct Hub {
    id: HubId,
    kind: TransportKind,
    tx: mpsc::Sender<HubCommand>,
}

impl Hub {
    /// Register a hub for `kind` with the router and start its actor.
    ///
    /// `advertise` is the address carried in this node's identity
    /// announcement on every link the hub owns.
    ///
    /// # Errors
    ///
    /// Fails if the router has shut down or the announcement cannot be
    /// encoded.
    pub async fn spawn(
        kind: TransportKind,
        keypair: Arc<KeyPair>,
        advertise: impl Into<String>,
        router: RouterHandle,
        config: &RouterConfig,
    ) -> Result<(Hub, JoinHandle<()>)> {
        let announcement =
            IdentityAnnouncement::new(&keypair, advertise, kind).to_message(&keypair)?;
        let (id, outbound) = router.register_hub(kind).await?;
        let (tx, rx) = mpsc::channel(COMMAND_DEPTH);

        let actor = HubActor {
            id,
            kind,
            announcement,
            router,
            conns: HashMap::new(),
            commands: tx.downgrade(),
            reset_after: config.conn_filter_reset_after.max(1),
            outbound_depth: config.outbound_depth.max(1),
        };
        let task = tokio::spawn(actor.run(rx, outbound));
        info!(hub = %id, %kind, "hub started");
        Ok((Hub { id, kind, tx }, task))
    }

    pub fn id(&self) -> HubId {
        self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Hand a connected link to the hub.
    ///
    /// With `expected` set, the peer's announced identity must match it.
    pub async fn attach(&self, link: LinkStream, expected: Option<NodeId>) -> Result<ConnHandle> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubCommand::Attach {
                link,
                expected,
                reply,
            })
            .await
            .map_err(|_| RouterError::Shutdown)?;
        rx.await.map_err(|_| RouterError::Shutdown)
    }

    pub async fn connections(&self) -> Result<Vec<ConnInfo>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubCommand::Connections { reply })
            .await
            .map_err(|_| RouterError::Shutdown)?;
        rx.await.map_err(|_| RouterError::Shutdown)
    }

    /// Close every connection and stop the actor.
    pub async fn shutdown(&self) -> Result<()> {
        self.tx
            .send(HubCommand::Shutdown)
            .await
            .map_err(|_| RouterError::Shutdown)
    }

    /// Accept TCP links on `addr` until the hub stops.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Io`] if the listener cannot bind.
    pub async fn listen_tcp(&self, addr: &str) -> Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RouterError::Io(format!("bind {addr}: {e}")))?;
        let local = listener
            .local_addr()
            .map_err(|e| RouterError::Io(e.to_string()))?;
        info!(hub = %self.id, addr = %local, "listening for TCP links");

        let hub = self.clone();
        let task = tokio::spawn(async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "TCP accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                };
                debug!(%remote, "inbound TCP link");
                if hub
                    .attach(LinkStream::from_tcp(stream, hub.kind), None)
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        Ok((local, task))
    }

    /// Accept QUIC links from `node` until the endpoint or the hub closes.
    pub fn listen_quic(&self, node: QuicNode) -> JoinHandle<()> {
        info!(hub = %self.id, addr = %node.local_addr(), "listening for QUIC links");
        let hub = self.clone();
        tokio::spawn(async move {
            while let Some(accepted) = node.accept_link().await {
                match accepted {
                    Ok(link) => {
                        if hub.attach(link, None).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "QUIC accept failed"),
                }
            }
        })
    }

    /// Keep a link to `remote` up, redialing [`RECONNECT_DELAY`] after each
    /// failure or close. Stops when the hub does.
    pub fn persist<D: Dialer>(&self, remote: RemoteSpec, dialer: D) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            loop {
                match dialer.dial(&remote).await {
                    Ok(link) => match hub.attach(link, remote.expected).await {
                        Ok(mut conn) => {
                            info!(remote = %remote.address(), conn = %conn.id, "link established");
                            conn.closed().await;
                            info!(remote = %remote.address(), conn = %conn.id, "link lost");
                        }
                        Err(_) => break,
                    },
                    Err(e) => debug!(remote = %remote.address(), error = %e, "dial failed"),
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        })
    }
}

struct HubActor {
    id: HubId,
    kind: TransportKind,
    announcement: Message,
    router: RouterHandle,
    conns: HashMap<ConnId, ConnEntry>,
    commands: mpsc::WeakSender<HubCommand>,
    reset_after: usize,
    outbound_depth: usize,
}

impl HubActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<HubCommand>,
        mut outbound: mpsc::Receiver<Outbound>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(HubCommand::Shutdown) | None => break,
                    Some(cmd) => self.on_command(cmd).await,
                },
                out = outbound.recv() => match out {
                    Some(out) => self.on_outbound(out),
                    None => break,
                },
            }
        }

        let ids: Vec<ConnId> = self.conns.keys().copied().collect();
        for conn in ids {
            self.close(conn).await;
        }
        info!(hub = %self.id, kind = %self.kind, "hub stopped");
    }

    async fn on_command(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Attach {
                link,
                expected,
                reply,
            } => {
                if let Some(handle) = self.attach(link, expected) {
                    let _ = reply.send(handle);
                }
            }
            HubCommand::Identified { conn, peer, reply } => {
                let accepted = self.identified(conn, peer).await;
                let _ = reply.send(accepted);
            }
            HubCommand::Close { conn } => self.close(conn).await,
            HubCommand::Connections { reply } => {
                let infos = self.conns.iter().map(|(id, e)| e.info(*id)).collect();
                let _ = reply.send(infos);
            }
            HubCommand::Shutdown => {}
        }
    }

    fn attach(&mut self, link: LinkStream, expected: Option<NodeId>) -> Option<ConnHandle> {
        let commands = self.commands.upgrade()?;
        let id = ConnId::next();
        let remote = link.remote.clone();
        let (tx, rx) = mpsc::channel(self.outbound_depth);
        let (close, closed) = watch::channel(false);
        let filter = SharedFilter::new(BloomFilter::new());

        if tx.try_send(self.announcement.clone()).is_err() {
            warn!(conn = %id, "could not queue identity announcement");
        }

        let (reader, writer) = link.into_parts();
        let reading = ReadTask {
            conn: id,
            expected,
            reader,
            closed: closed.clone(),
            filter: filter.clone(),
            reset_after: self.reset_after,
            commands: commands.clone(),
            router: self.router.clone(),
        };
        tokio::spawn(reading.run());
        tokio::spawn(write_loop(id, writer, rx, closed.clone(), commands));

        debug!(hub = %self.id, conn = %id, %remote, "link attached");
        self.conns.insert(
            id,
            ConnEntry {
                tx,
                close,
                filter,
                state: ConnState::Connecting,
                peer: None,
                remote,
            },
        );
        Some(ConnHandle { id, closed })
    }

    async fn identified(&mut self, conn: ConnId, peer: PeerInfo) -> bool {
        let Some(entry) = self.conns.get_mut(&conn) else {
            return false;
        };
        entry.state = ConnState::Active;
        entry.peer = Some(peer.clone());
        info!(hub = %self.id, %conn, peer = %peer.id.short(), address = %peer.address, "peer identified");
        self.router
            .deliver(RouterEvent::PeerUp {
                conn,
                hub: self.id,
                peer,
            })
            .await
            .is_ok()
    }

    async fn close(&mut self, conn: ConnId) {
        let Some(entry) = self.conns.remove(&conn) else {
            return;
        };
        let _ = entry.close.send(true);
        debug!(hub = %self.id, %conn, remote = %entry.remote, "link closed");
        if entry.state == ConnState::Active {
            let _ = self.router.deliver(RouterEvent::PeerDown { conn }).await;
        }
    }

    fn on_outbound(&mut self, out: Outbound) {
        match out {
            Outbound::Broadcast { message, except } => {
                let bytes = match message.encode() {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(error = %e, "cannot encode broadcast");
                        return;
                    }
                };
                for (id, entry) in &self.conns {
                    if Some(*id) == except || entry.state != ConnState::Active {
                        continue;
                    }
                    if !check_conn_filter(&entry.filter, &bytes, self.reset_after) {
                        continue;
                    }
                    queue(*id, &entry.tx, message.clone());
                }
            }
            Outbound::Direct { conn, message } => match self.conns.get(&conn) {
                Some(entry) => queue(conn, &entry.tx, message),
                None => debug!(%conn, "direct message for closed link dropped"),
            },
        }
    }
}

fn queue(conn: ConnId, tx: &mpsc::Sender<Message>, message: Message) {
    if let Err(e) = tx.try_send(message) {
        warn!(%conn, error = %e, "link write queue unavailable, message dropped");
    }
}

/// Record `bytes` in a link's filter, clearing it once it is saturated.
/// `true` if the link has not seen the bytes yet.
fn check_conn_filter(filter: &SharedFilter<BloomFilter>, bytes: &[u8], reset_after: usize) -> bool {
    filter.with(|f| {
        if f.count() >= reset_after {
            f.clear();
        }
        f.check_and_add(bytes)
    })
}

struct ReadTask {
    conn: ConnId,
    expected: Option<NodeId>,
    reader: BoxedReader,
    closed: watch::Receiver<bool>,
    filter: SharedFilter<BloomFilter>,
    reset_after: usize,
    commands: mpsc::Sender<HubCommand>,
    router: RouterHandle,
}

impl ReadTask {
    async fn run(mut self) {
        let conn = self.conn;
        let mut identified = false;
        loop {
            let read = tokio::select! {
                _ = self.closed.changed() => break,
                read = Message::read_from(&mut self.reader, MAX_BODY_SIZE) => read,
            };
            let message = match read {
                Ok(m) => m,
                Err(e) if e.is_fatal() => {
                    debug!(%conn, error = %e, "link read ended");
                    break;
                }
                Err(e) => {
                    debug!(%conn, error = %e, "unreadable frame skipped");
                    continue;
                }
            };

            if message.msg_type == MessageType::Control {
                if identified {
                    continue;
                }
                match IdentityAnnouncement::verify(&message, self.expected) {
                    Ok(verified) => {
                        if !self.identify(verified.peer).await {
                            break;
                        }
                        identified = true;
                    }
                    Err(e) => {
                        warn!(%conn, error = %e, "identity rejected");
                        break;
                    }
                }
                continue;
            }

            if !identified {
                debug!(%conn, msg_type = ?message.msg_type, "frame before identity dropped");
                continue;
            }
            match message.encode() {
                Ok(bytes) if check_conn_filter(&self.filter, &bytes, self.reset_after) => {}
                Ok(_) => {
                    debug!(%conn, "frame already seen on this link");
                    continue;
                }
                Err(e) => {
                    debug!(%conn, error = %e, "frame dropped");
                    continue;
                }
            }
            if self
                .router
                .deliver(RouterEvent::Inbound { conn, message })
                .await
                .is_err()
            {
                break;
            }
        }
        let _ = self.commands.send(HubCommand::Close { conn }).await;
    }

    async fn identify(&mut self, peer: PeerInfo) -> bool {
        let (reply, rx) = oneshot::channel();
        let cmd = HubCommand::Identified {
            conn: self.conn,
            peer,
            reply,
        };
        if self.commands.send(cmd).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

async fn write_loop(
    conn: ConnId,
    mut writer: BoxedWriter,
    mut rx: mpsc::Receiver<Message>,
    mut closed: watch::Receiver<bool>,
    commands: mpsc::Sender<HubCommand>,
) {
    loop {
        let message = tokio::select! {
            _ = closed.changed() => break,
            message = rx.recv() => match message {
                Some(m) => m,
                None => break,
            },
        };
        if let Err(e) = message.write_to(&mut writer).await {
            debug!(%conn, error = %e, "link write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
    let _ = commands.send(HubCommand::Close { conn }).await;
}
