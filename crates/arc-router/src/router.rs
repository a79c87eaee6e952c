//! The router task.
//!
//! One task owns every piece of shared routing state: the global duplicate
//! filter, the Kademlia table, in-flight transactions and the chunk store.
//! Hubs and local callers reach it only through its queue, so none of that
//! state needs a lock.
//!
//! ## DHT requests
//!
//! 1. A request whose `(target, id)` is already tracked has looped: NACK.
//! 2. A request at or past `max_hops`: NACK.
//! 3. A lookup for a record held locally: reply.
//! 4. A peer (other than the sender) closer to the target than this node:
//!    track a relay transaction and forward with the hop count raised.
//! 5. Otherwise the request is addressed here: stores are acked, lookup
//!    misses are NACKed.
//!
//! A NACK from the peer a transaction waits on excludes that peer and retries
//! the next closest one until the backtrack budget runs out.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use arc_dht::chunking::{Chunk, Manifest};
use arc_dht::kademlia::{AddPeerResult, RoutingTable};
use arc_dht::processor::{self, GetOutcome, Processor};
use arc_dht::store::ChunkStore;
use arc_dht::transaction::{Backtrack, Transaction, TransactionTable};
use arc_dht::DhtError;
use arc_filter::{DecayingFilter, DuplicateFilter};
use arc_transport::dht::{METHOD_GET, METHOD_MGET, METHOD_MPUT, METHOD_PUT};
use arc_transport::{DhtMessage, Message, MessageType};
use arc_types::{Hash, NodeId, PeerInfo, TransportKind};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ExhaustedPolicy, RouterConfig};
use crate::handle::{RouterHandle, RouterStats};
use crate::{ConnId, HubId, Result, RouterError};

/// Something a hub observed.
#[derive(Debug)]
pub enum RouterEvent {
    /// A connection's identity announcement verified.
    PeerUp {
        conn: ConnId,
        hub: HubId,
        peer: PeerInfo,
    },
    /// An identified connection closed.
    PeerDown { conn: ConnId },
    /// A frame that passed the connection's filter.
    Inbound { conn: ConnId, message: Message },
}

/// Work the router hands to a hub.
#[derive(Clone, Debug)]
pub enum Outbound {
    /// Send to every active connection except `except`.
    Broadcast {
        message: Message,
        except: Option<ConnId>,
    },
    /// Send to one connection.
    Direct { conn: ConnId, message: Message },
}

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

pub(crate) enum Command {
    RegisterHub {
        kind: TransportKind,
        reply: oneshot::Sender<(HubId, mpsc::Receiver<Outbound>)>,
    },
    Inject {
        message: Message,
    },
    PutChunk {
        chunk: Chunk,
        reply: Reply<Hash>,
    },
    GetChunk {
        hash: Hash,
        reply: Reply<Chunk>,
    },
    PutManifest {
        manifest: Manifest,
        reply: Reply<Hash>,
    },
    GetManifest {
        root: Hash,
        reply: Reply<Manifest>,
    },
    Stats {
        reply: oneshot::Sender<RouterStats>,
    },
    Shutdown,
}

pub(crate) enum RouterInput {
    Event(RouterEvent),
    Command(Command),
}

/// A local caller waiting on a transaction.
enum Waiter {
    Stored {
        hash: Hash,
        stored_locally: bool,
        reply: Reply<Hash>,
    },
    Chunk(Reply<Chunk>),
    Manifest(Reply<Manifest>),
}

impl Waiter {
    /// Resolve with a verified reply payload.
    fn complete(self, payload: &[u8]) {
        match self {
            Waiter::Stored { hash, reply, .. } => {
                let _ = reply.send(Ok(hash));
            }
            Waiter::Chunk(reply) => {
                let _ = reply.send(Chunk::from_bytes(payload).map_err(RouterError::from));
            }
            Waiter::Manifest(reply) => {
                let _ = reply.send(Manifest::from_bytes(payload).map_err(RouterError::from));
            }
        }
    }

    /// Resolve with a failure. A store already kept locally still succeeds.
    fn fail(self, err: DhtError) {
        match self {
            Waiter::Stored {
                hash,
                stored_locally,
                reply,
            } => {
                let result = if stored_locally {
                    Ok(hash)
                } else {
                    Err(err.into())
                };
                let _ = reply.send(result);
            }
            Waiter::Chunk(reply) => {
                let _ = reply.send(Err(err.into()));
            }
            Waiter::Manifest(reply) => {
                let _ = reply.send(Err(err.into()));
            }
        }
    }
}

enum Origin {
    Local(Waiter),
    Relay { conn: ConnId },
}

/// Connection the router can reach an identified peer through.
#[derive(Clone, Copy)]
struct Route {
    hub: HubId,
    peer: NodeId,
}

#[derive(Default)]
struct Counters {
    flooded: u64,
    duplicates: u64,
    dht_forwarded: u64,
    nacks_sent: u64,
}

pub struct Router {
    local_id: NodeId,
    config: RouterConfig,
    filter: DecayingFilter,
    table: RoutingTable,
    txs: TransactionTable<Origin>,
    processor: Processor,
    hubs: HashMap<HubId, mpsc::Sender<Outbound>>,
    next_hub: u64,
    routes: HashMap<ConnId, Route>,
    /// Live connections per peer, newest last.
    peers: HashMap<NodeId, Vec<ConnId>>,
    chat: broadcast::Sender<Message>,
    counters: Counters,
}

impl Router {
    /// Start the router task.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Filter`] for a zero `filter_decay_after`.
    pub fn spawn(local_id: NodeId, config: RouterConfig) -> Result<(RouterHandle, JoinHandle<()>)> {
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let (chat, _) = broadcast::channel(config.queue_depth.max(1));
        let router = Router {
            local_id,
            filter: DecayingFilter::new(config.filter_decay_after)?,
            table: RoutingTable::new(local_id),
            txs: TransactionTable::new(config.max_backtrack, config.transaction_timeout()),
            processor: Processor::new(ChunkStore::new(config.chunk_capacity)),
            hubs: HashMap::new(),
            next_hub: 1,
            routes: HashMap::new(),
            peers: HashMap::new(),
            chat: chat.clone(),
            counters: Counters::default(),
            config,
        };
        let handle = RouterHandle::new(tx, chat, local_id);
        let task = tokio::spawn(router.run(rx));
        Ok((handle, task))
    }

    async fn run(mut self, mut rx: mpsc::Receiver<RouterInput>) {
        info!(node = %self.local_id.short(), "router started");
        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                input = rx.recv() => match input {
                    Some(RouterInput::Event(event)) => self.on_event(event),
                    Some(RouterInput::Command(Command::Shutdown)) | None => break,
                    Some(RouterInput::Command(cmd)) => self.on_command(cmd),
                },
                _ = sweep.tick() => self.sweep(Instant::now()),
            }
        }

        for tx in self.txs.sweep_expired(Instant::now() + self.config.transaction_timeout()) {
            if let Origin::Local(waiter) = tx.origin {
                waiter.fail(DhtError::Timeout);
            }
        }
        info!(node = %self.local_id.short(), "router stopped");
    }

    fn on_event(&mut self, event: RouterEvent) {
        match event {
            RouterEvent::PeerUp { conn, hub, peer } => self.peer_up(conn, hub, peer),
            RouterEvent::PeerDown { conn } => self.peer_down(conn),
            RouterEvent::Inbound { conn, message } => self.inbound(conn, message),
        }
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::RegisterHub { kind, reply } => {
                let id = HubId(self.next_hub);
                self.next_hub += 1;
                let (tx, rx) = mpsc::channel(self.config.queue_depth.max(1));
                self.hubs.insert(id, tx);
                info!(hub = %id, %kind, "hub registered");
                let _ = reply.send((id, rx));
            }
            Command::Inject { message } => self.inject(message),
            Command::PutChunk { chunk, reply } => self.put_chunk(chunk, reply),
            Command::GetChunk { hash, reply } => self.get_chunk(hash, reply),
            Command::PutManifest { manifest, reply } => self.put_manifest(manifest, reply),
            Command::GetManifest { root, reply } => self.get_manifest(root, reply),
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Shutdown => {}
        }
    }

    fn stats(&self) -> RouterStats {
        let store = self.processor.store();
        RouterStats {
            peers: self.table.len(),
            hubs: self.hubs.len(),
            connections: self.routes.len(),
            transactions: self.txs.len(),
            stored: store.len(),
            capacity_used: store.capacity_used(),
            total_capacity: store.total_capacity(),
            filter_entries: self.filter.len(),
            flooded: self.counters.flooded,
            duplicates_dropped: self.counters.duplicates,
            dht_forwarded: self.counters.dht_forwarded,
            nacks_sent: self.counters.nacks_sent,
        }
    }

    // ------------------------------------------------------------------
    // Peers
    // ------------------------------------------------------------------

    fn peer_up(&mut self, conn: ConnId, hub: HubId, peer: PeerInfo) {
        let id = peer.id;
        self.routes.insert(conn, Route { hub, peer: id });
        let conns = self.peers.entry(id).or_default();
        if !conns.is_empty() {
            debug!(peer = %id.short(), links = conns.len() + 1, %conn, "additional link to peer");
        }
        conns.push(conn);
        if self.table.add_peer(peer) == AddPeerResult::Inserted {
            info!(peer = %id.short(), %conn, "peer up");
        }
    }

    fn peer_down(&mut self, conn: ConnId) {
        let Some(route) = self.routes.remove(&conn) else {
            return;
        };
        let Some(conns) = self.peers.get_mut(&route.peer) else {
            return;
        };
        conns.retain(|c| *c != conn);
        if !conns.is_empty() {
            debug!(peer = %route.peer.short(), %conn, remaining = conns.len(), "link to peer closed");
            return;
        }
        self.peers.remove(&route.peer);
        self.table.del_peer(&route.peer);
        info!(peer = %route.peer.short(), %conn, "peer down");

        for id in self.txs.waiting_on(&route.peer) {
            self.backtrack(id, route.peer);
        }
    }

    // ------------------------------------------------------------------
    // Flooding
    // ------------------------------------------------------------------

    /// Record `message` in the global filter. False when already seen.
    fn admit(&mut self, message: &Message) -> bool {
        match message.encode() {
            Ok(bytes) => {
                if self.filter.check_and_add(&bytes) {
                    true
                } else {
                    self.counters.duplicates += 1;
                    false
                }
            }
            Err(e) => {
                warn!(error = %e, "dropping unencodable message");
                false
            }
        }
    }

    fn broadcast(&mut self, message: Message, except: Option<ConnId>) {
        self.counters.flooded += 1;
        for (hub, tx) in &self.hubs {
            let out = Outbound::Broadcast {
                message: message.clone(),
                except,
            };
            if let Err(e) = tx.try_send(out) {
                warn!(%hub, error = %e, "hub queue unavailable, broadcast dropped");
            }
        }
    }

    fn inject(&mut self, message: Message) {
        if !self.admit(&message) {
            debug!("injected message already seen");
            return;
        }
        self.broadcast(message, None);
    }

    fn inbound(&mut self, conn: ConnId, message: Message) {
        let Some(route) = self.routes.get(&conn).copied() else {
            debug!(%conn, "message from unidentified connection dropped");
            return;
        };
        if !self.admit(&message) {
            debug!(%conn, "duplicate message dropped");
            return;
        }
        match message.msg_type {
            MessageType::Chat => {
                let _ = self.chat.send(message.clone());
                self.broadcast(message, Some(conn));
            }
            MessageType::Dht => match DhtMessage::from_message(&message) {
                Ok(dht) if dht.is_reply => self.dht_reply(route.peer, dht),
                Ok(dht) => self.dht_request(conn, route.peer, dht),
                Err(e) => debug!(%conn, error = %e, "undecodable DHT message dropped"),
            },
            MessageType::Control => {}
        }
    }

    // ------------------------------------------------------------------
    // DHT routing
    // ------------------------------------------------------------------

    fn send_direct(&self, conn: ConnId, dht: &DhtMessage) -> bool {
        let Some(route) = self.routes.get(&conn) else {
            return false;
        };
        let Some(hub) = self.hubs.get(&route.hub) else {
            return false;
        };
        let message = match dht.to_message() {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "cannot encode DHT message");
                return false;
            }
        };
        match hub.try_send(Outbound::Direct { conn, message }) {
            Ok(()) => true,
            Err(e) => {
                warn!(%conn, error = %e, "hub queue unavailable, DHT message dropped");
                false
            }
        }
    }

    fn send_to_peer(&self, peer: &NodeId, dht: &DhtMessage) -> bool {
        match self.peers.get(peer).and_then(|conns| conns.last()).copied() {
            Some(conn) => self.send_direct(conn, dht),
            None => false,
        }
    }

    fn nack(&mut self, conn: ConnId, id: i64, target: &NodeId) {
        self.counters.nacks_sent += 1;
        self.send_direct(conn, &DhtMessage::nack(id, target.as_bytes()));
    }

    fn dht_request(&mut self, conn: ConnId, from: NodeId, dht: DhtMessage) {
        let target = match processor::request_target(&dht) {
            Ok(t) => t,
            Err(e) => {
                debug!(%conn, tx = dht.transaction_id, error = %e, "malformed DHT request dropped");
                return;
            }
        };
        let id = dht.transaction_id;

        if self.txs.has_transaction(&target, id) {
            debug!(%conn, tx = id, target = %target.short(), "request loop detected");
            return self.nack(conn, id, &target);
        }
        if self.txs.contains(id) {
            debug!(%conn, tx = id, "transaction id collision");
            return self.nack(conn, id, &target);
        }
        if dht.hop_count >= self.config.max_hops {
            debug!(%conn, tx = id, hops = dht.hop_count, "hop limit reached");
            return self.nack(conn, id, &target);
        }
        if processor::is_lookup(&dht.method) {
            match self.processor.lookup(&dht) {
                Ok(GetOutcome::Hit(reply)) => {
                    debug!(%conn, tx = id, "lookup served locally");
                    self.send_direct(conn, &reply);
                    return;
                }
                Ok(GetOutcome::Miss) => {}
                Err(e) => {
                    debug!(%conn, tx = id, error = %e, "bad lookup");
                    return self.nack(conn, id, &target);
                }
            }
        }

        let skip: HashSet<NodeId> = HashSet::from([from]);
        let closer = self
            .table
            .get_closest_excluding(&target, &skip)
            .filter(|p| self.table.is_closer_than_self(&p.id, &target));
        if closer.is_some() {
            let forwarded = dht.forwarded();
            match self
                .txs
                .register(forwarded, target, Some(from), Origin::Relay { conn })
            {
                Ok(_) => return self.dispatch(id),
                Err(e) => {
                    warn!(%conn, tx = id, error = %e, "cannot track relay");
                    return self.nack(conn, id, &target);
                }
            }
        }

        self.answer_locally(conn, &dht, &target);
    }

    fn answer_locally(&mut self, conn: ConnId, dht: &DhtMessage, target: &NodeId) {
        match self.processor.process(dht, target) {
            Ok(reply) => {
                debug!(%conn, tx = dht.transaction_id, method = %dht.method, nack = reply.is_nack(), "answered locally");
                if reply.is_nack() {
                    self.counters.nacks_sent += 1;
                }
                self.send_direct(conn, &reply);
            }
            Err(e) => {
                warn!(%conn, tx = dht.transaction_id, error = %e, "local processing failed");
                self.nack(conn, dht.transaction_id, target);
            }
        }
    }

    fn dht_reply(&mut self, from: NodeId, dht: DhtMessage) {
        let id = dht.transaction_id;
        let Some(tx) = self.txs.get(id) else {
            debug!(tx = id, "reply for unknown transaction");
            return;
        };
        if tx.in_flight.is_some_and(|p| p != from) {
            debug!(tx = id, from = %from.short(), "reply from unexpected peer");
            return;
        }

        if dht.is_nack() {
            if tx.in_flight.is_some() {
                debug!(tx = id, from = %from.short(), "NACK, backtracking");
                self.backtrack(id, from);
            }
            return;
        }

        if !processor::reply_matches(&tx.method, &tx.target, &dht.payload) {
            warn!(tx = id, from = %from.short(), "reply does not match target");
            self.backtrack(id, from);
            return;
        }

        let Some(tx) = self.txs.remove(id) else {
            return;
        };
        match tx.origin {
            Origin::Relay { conn } => {
                let reply = DhtMessage::reply_to(&tx.request, dht.payload);
                self.send_direct(conn, &reply);
            }
            Origin::Local(waiter) => {
                debug!(tx = id, method = %tx.method, elapsed = ?tx.started.elapsed(), "lookup complete");
                waiter.complete(&dht.payload);
            }
        }
    }

    fn backtrack(&mut self, id: i64, failed: NodeId) {
        match self.txs.record_failure(id, failed) {
            Some(Backtrack::Retry) => self.dispatch(id),
            Some(Backtrack::Exhausted) => self.exhaust(id),
            None => {}
        }
    }

    /// Send transaction `id` to its closest remaining candidate.
    fn dispatch(&mut self, id: i64) {
        loop {
            let Some(tx) = self.txs.get(id) else {
                return;
            };
            let Some(next) = self.table.get_closest_excluding(&tx.target, &tx.skip_set()) else {
                return self.exhaust(id);
            };
            let request = tx.request.clone();
            if self.send_to_peer(&next.id, &request) {
                self.counters.dht_forwarded += 1;
                if let Some(tx) = self.txs.get_mut(id) {
                    tx.in_flight = Some(next.id);
                }
                debug!(tx = id, next = %next.id.short(), hops = request.hop_count, "DHT request forwarded");
                return;
            }
            if self.txs.record_failure(id, next.id) != Some(Backtrack::Retry) {
                return self.exhaust(id);
            }
        }
    }

    fn exhaust(&mut self, id: i64) {
        let Some(tx) = self.txs.remove(id) else {
            return;
        };
        debug!(tx = id, tried = tx.excluded.len(), "transaction exhausted");
        let Transaction {
            method,
            target,
            upstream_peer,
            request,
            origin,
            ..
        } = tx;
        let conn = match origin {
            Origin::Local(waiter) => return waiter.fail(DhtError::LookupExhausted(target)),
            Origin::Relay { conn } => conn,
        };
        if method == METHOD_PUT || method == METHOD_MPUT {
            // Nobody closer would take it: this node is the closest reachable.
            return self.answer_locally(conn, &request, &target);
        }
        match self.config.exhausted_policy {
            ExhaustedPolicy::Nack => self.nack(conn, id, &target),
            ExhaustedPolicy::Flood => self.flood_lookup(conn, request, target, upstream_peer),
        }
    }

    /// Last resort for a relayed lookup: flood it and accept a reply from anyone.
    fn flood_lookup(
        &mut self,
        conn: ConnId,
        request: DhtMessage,
        target: NodeId,
        upstream: Option<NodeId>,
    ) {
        let id = request.transaction_id;
        let message = match request.to_message() {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "cannot encode flooded lookup");
                return self.nack(conn, id, &target);
            }
        };
        debug!(tx = id, target = %target.short(), "flooding exhausted lookup");
        match self
            .txs
            .register(request, target, upstream, Origin::Relay { conn })
        {
            Ok(_) => self.broadcast(message, Some(conn)),
            Err(e) => warn!(error = %e, "cannot track flooded lookup"),
        }
    }

    fn sweep(&mut self, now: Instant) {
        for tx in self.txs.sweep_expired(now) {
            debug!(tx = tx.id, method = %tx.method, "transaction timed out");
            match tx.origin {
                Origin::Local(waiter) => waiter.fail(DhtError::Timeout),
                Origin::Relay { conn } => self.nack(conn, tx.id, &tx.target),
            }
        }
    }

    // ------------------------------------------------------------------
    // Local operations
    // ------------------------------------------------------------------

    /// Send a locally originated request to the closest peer.
    fn start_local(&mut self, request: DhtMessage, target: NodeId, waiter: Waiter) {
        let Some(first) = self.table.get_next_hop(&target) else {
            return waiter.fail(DhtError::NoPeers);
        };
        let id = request.transaction_id;
        debug!(tx = id, method = %request.method, first = %first.id.short(), "local request started");
        match self.txs.register(request, target, None, Origin::Local(waiter)) {
            Ok(_) => self.dispatch(id),
            Err(e) => warn!(tx = id, error = %e, "cannot track local request"),
        }
    }

    fn put_chunk(&mut self, chunk: Chunk, reply: Reply<Hash>) {
        let hash = chunk.hash();
        let stored_locally = match self.processor.store_mut().store_chunk(chunk.clone()) {
            Ok(_) => true,
            Err(e) => {
                warn!(hash = %hex::encode(&hash[..4]), error = %e, "chunk not stored locally");
                false
            }
        };
        let request = DhtMessage::request(METHOD_PUT, self.txs.next_id(), chunk.to_bytes());
        let waiter = Waiter::Stored {
            hash,
            stored_locally,
            reply,
        };
        self.start_local(request, NodeId::from_bytes(hash), waiter);
    }

    fn put_manifest(&mut self, manifest: Manifest, reply: Reply<Hash>) {
        let root = manifest.root();
        let payload = manifest.to_bytes();
        let stored_locally = match self.processor.store_mut().store_manifest(manifest) {
            Ok(_) => true,
            Err(e) => {
                warn!(root = %hex::encode(&root[..4]), error = %e, "manifest not stored locally");
                false
            }
        };
        let request = DhtMessage::request(METHOD_MPUT, self.txs.next_id(), payload);
        let waiter = Waiter::Stored {
            hash: root,
            stored_locally,
            reply,
        };
        self.start_local(request, NodeId::from_bytes(root), waiter);
    }

    fn get_chunk(&mut self, hash: Hash, reply: Reply<Chunk>) {
        if let Some(chunk) = self.processor.store().get_chunk(&hash) {
            let _ = reply.send(Ok(chunk.clone()));
            return;
        }
        let request = DhtMessage::request(METHOD_GET, self.txs.next_id(), hash.to_vec());
        self.start_local(request, NodeId::from_bytes(hash), Waiter::Chunk(reply));
    }

    fn get_manifest(&mut self, root: Hash, reply: Reply<Manifest>) {
        if let Some(manifest) = self.processor.store().get_manifest(&root) {
            let _ = reply.send(Ok(manifest.clone()));
            return;
        }
        let request = DhtMessage::request(METHOD_MGET, self.txs.next_id(), root.to_vec());
        self.start_local(request, NodeId::from_bytes(root), Waiter::Manifest(reply));
    }
}
