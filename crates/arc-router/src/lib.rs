//! # arc-router
//!
//! Message routing for the arc overlay.
//!
//! - [`hub`]: one actor per transport kind owning its connections, each
//!   driven by a read task and a write task
//! - [`router`]: the single task owning the global duplicate filter, the
//!   Kademlia table, in-flight transactions and the chunk store
//! - [`handle`]: the cloneable client used by hubs and local callers
//! - [`dialer`]: outbound link establishment (TCP, SOCKS4a, QUIC)
//!
//! ```text
//!  link ──read task──▶ hub ──RouterEvent──▶ router ──Outbound──▶ hub ──write task──▶ link
//! ```
//!
//! Chat frames are flooded to every connection except the one they arrived
//! on; DHT frames go to a single next hop chosen by XOR distance.

pub mod config;
pub mod dialer;
pub mod handle;
pub mod hub;
pub mod router;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub use config::{ExhaustedPolicy, RouterConfig};
pub use dialer::{Dialer, QuicDialer, RemoteSpec, TcpDialer};
pub use handle::{RouterHandle, RouterStats};
pub use hub::{ConnHandle, ConnState, Hub};
pub use router::Router;

/// Process-wide connection identifier, unique across hubs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl ConnId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Identifier the router assigns to a registered hub.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HubId(pub u64);

impl fmt::Display for HubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("transport error: {0}")]
    Transport(#[from] arc_transport::TransportError),

    #[error("DHT error: {0}")]
    Dht(#[from] arc_dht::DhtError),

    #[error("filter error: {0}")]
    Filter(#[from] arc_filter::FilterError),

    /// The router or hub task is gone.
    #[error("router has shut down")]
    Shutdown,

    #[error("I/O error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, RouterError>;
