//! In-flight DHT transactions.
//!
//! Every request this node originates or relays is tracked until a reply, an
//! exhausted backtrack or the timeout. The origin type is left to the caller:
//! the router uses it to tell local callers from upstream connections.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use arc_transport::DhtMessage;
use arc_types::NodeId;

use crate::{DhtError, Result};

/// Outcome of recording a failed peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backtrack {
    /// Budget remains; try the next candidate.
    Retry,
    /// The exclusion set reached the backtrack budget.
    Exhausted,
}

#[derive(Debug)]
pub struct Transaction<O> {
    pub id: i64,
    pub method: String,
    pub target: NodeId,
    pub started: Instant,
    pub expires: Instant,
    /// Peers that NACKed or failed for this transaction.
    pub excluded: HashSet<NodeId>,
    /// Peer the request is currently waiting on.
    pub in_flight: Option<NodeId>,
    /// Peer the request arrived from; never used as a next hop.
    pub upstream_peer: Option<NodeId>,
    /// Request as received, re-sent on each retry.
    pub request: DhtMessage,
    pub origin: O,
}

impl<O> Transaction<O> {
    /// Peers a retry must skip: the exclusion set plus the upstream peer.
    pub fn skip_set(&self) -> HashSet<NodeId> {
        let mut skip = self.excluded.clone();
        skip.extend(self.upstream_peer);
        skip
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires
    }
}

pub struct TransactionTable<O> {
    entries: HashMap<i64, Transaction<O>>,
    max_backtrack: usize,
    timeout: Duration,
}

impl<O> TransactionTable<O> {
    pub fn new(max_backtrack: usize, timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            max_backtrack: max_backtrack.max(1),
            timeout,
        }
    }

    /// Start tracking `request` toward `target`.
    ///
    /// # Errors
    ///
    /// Returns [`DhtError::DuplicateTransaction`] if the id is already tracked.
    pub fn register(
        &mut self,
        request: DhtMessage,
        target: NodeId,
        upstream_peer: Option<NodeId>,
        origin: O,
    ) -> Result<&mut Transaction<O>> {
        let id = request.transaction_id;
        match self.entries.entry(id) {
            Entry::Occupied(_) => Err(DhtError::DuplicateTransaction(id)),
            Entry::Vacant(slot) => {
                let started = Instant::now();
                Ok(slot.insert(Transaction {
                    id,
                    method: request.method.clone(),
                    target,
                    started,
                    expires: started + self.timeout,
                    excluded: HashSet::new(),
                    in_flight: None,
                    upstream_peer,
                    request,
                    origin,
                }))
            }
        }
    }

    /// Whether a transaction with this id is tracked for this target.
    pub fn has_transaction(&self, target: &NodeId, id: i64) -> bool {
        self.entries.get(&id).is_some_and(|tx| tx.target == *target)
    }

    pub fn contains(&self, id: i64) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn get(&self, id: i64) -> Option<&Transaction<O>> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: i64) -> Option<&mut Transaction<O>> {
        self.entries.get_mut(&id)
    }

    pub fn remove(&mut self, id: i64) -> Option<Transaction<O>> {
        self.entries.remove(&id)
    }

    /// Exclude `peer` from transaction `id` and report whether budget remains.
    ///
    /// Returns `None` for an unknown transaction.
    pub fn record_failure(&mut self, id: i64, peer: NodeId) -> Option<Backtrack> {
        let max = self.max_backtrack;
        let tx = self.entries.get_mut(&id)?;
        tx.excluded.insert(peer);
        if tx.in_flight == Some(peer) {
            tx.in_flight = None;
        }
        if tx.excluded.len() >= max {
            Some(Backtrack::Exhausted)
        } else {
            Some(Backtrack::Retry)
        }
    }

    /// Remove and return every transaction expired at `now`.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<Transaction<O>> {
        let expired: Vec<i64> = self
            .entries
            .values()
            .filter(|tx| tx.is_expired(now))
            .map(|tx| tx.id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect()
    }

    /// Transactions currently waiting on `peer`.
    pub fn waiting_on(&self, peer: &NodeId) -> Vec<i64> {
        self.entries
            .values()
            .filter(|tx| tx.in_flight.as_ref() == Some(peer))
            .map(|tx| tx.id)
            .collect()
    }

    /// A random id not currently in use.
    pub fn next_id(&self) -> i64 {
        loop {
            let id: i64 = rand::random();
            if !self.entries.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arc_transport::dht::METHOD_GET;

    fn node(b: u8) -> NodeId {
        NodeId::from_bytes([b; 32])
    }

    fn table(max_backtrack: usize) -> TransactionTable<&'static str> {
        TransactionTable::new(max_backtrack, Duration::from_secs(30))
    }

    #[test]
    fn test_register_and_lookup() {
        let mut txs = table(8);
        let req = DhtMessage::request(METHOD_GET, 11, vec![1; 32]);
        let tx = txs.register(req, node(1), Some(node(9)), "local").expect("register");
        tx.in_flight = Some(node(2));

        assert!(txs.has_transaction(&node(1), 11));
        assert!(!txs.has_transaction(&node(2), 11));
        assert_eq!(txs.get(11).map(|t| t.origin), Some("local"));
        assert_eq!(txs.waiting_on(&node(2)), vec![11]);
        assert!(txs.get(11).is_some_and(|t| t.skip_set().contains(&node(9))));
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut txs = table(8);
        let req = DhtMessage::request(METHOD_GET, 5, vec![]);
        txs.register(req.clone(), node(1), None, "a").expect("first");
        let err = txs.register(req, node(1), None, "b").err();
        assert!(matches!(err, Some(DhtError::DuplicateTransaction(5))));
        assert_eq!(txs.len(), 1);
    }

    #[test]
    fn test_backtrack_budget() {
        let mut txs = table(3);
        txs.register(DhtMessage::request(METHOD_GET, 1, vec![]), node(1), None, "x")
            .expect("register");

        assert_eq!(txs.record_failure(1, node(2)), Some(Backtrack::Retry));
        assert_eq!(txs.record_failure(1, node(2)), Some(Backtrack::Retry));
        assert_eq!(txs.record_failure(1, node(3)), Some(Backtrack::Retry));
        assert_eq!(txs.record_failure(1, node(4)), Some(Backtrack::Exhausted));
        assert_eq!(txs.record_failure(99, node(4)), None);
    }

    #[test]
    fn test_failure_clears_in_flight() {
        let mut txs = table(8);
        let tx = txs
            .register(DhtMessage::request(METHOD_GET, 1, vec![]), node(1), None, "x")
            .expect("register");
        tx.in_flight = Some(node(2));
        txs.record_failure(1, node(2));
        assert!(txs.get(1).is_some_and(|t| t.in_flight.is_none()));
    }

    #[test]
    fn test_sweep_expired() {
        let mut txs: TransactionTable<()> = TransactionTable::new(8, Duration::from_millis(0));
        txs.register(DhtMessage::request(METHOD_GET, 1, vec![]), node(1), None, ())
            .expect("register");
        txs.register(DhtMessage::request(METHOD_GET, 2, vec![]), node(2), None, ())
            .expect("register");

        let expired = txs.sweep_expired(Instant::now());
        assert_eq!(expired.len(), 2);
        assert!(txs.is_empty());
    }

    #[test]
    fn test_sweep_keeps_live() {
        let mut txs = table(8);
        txs.register(DhtMessage::request(METHOD_GET, 1, vec![]), node(1), None, "x")
            .expect("register");
        assert!(txs.sweep_expired(Instant::now()).is_empty());
        assert_eq!(txs.len(), 1);
    }

    #[test]
    fn test_next_id_unused() {
        let mut txs = table(8);
        for _ in 0..16 {
            let id = txs.next_id();
            assert!(!txs.contains(id));
            txs.register(DhtMessage::request(METHOD_GET, id, vec![]), node(1), None, "x")
                .expect("register");
        }
        assert_eq!(txs.len(), 16);
    }
}
