//! Router tuning.
//!
//! Deserialized from the `[router]` table of the node configuration; every
//! field falls back to its default when absent.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What a relay does with a lookup once every candidate peer has failed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExhaustedPolicy {
    /// Send a NACK to the upstream peer.
    #[default]
    Nack,
    /// Flood the request to every other connection and wait for any reply.
    Flood,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Insertions after which the global duplicate filter resets.
    #[serde(default = "default_filter_decay_after")]
    pub filter_decay_after: usize,
    /// Entries after which a per-connection Bloom filter is cleared.
    #[serde(default = "default_conn_filter_reset_after")]
    pub conn_filter_reset_after: usize,
    #[serde(default = "default_max_backtrack")]
    pub max_backtrack: usize,
    #[serde(default = "default_max_hops")]
    pub max_hops: i64,
    #[serde(default = "default_transaction_timeout_secs")]
    pub transaction_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Depth of the router's inbound queue and of each hub's outbound queue.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Depth of each connection's write queue.
    #[serde(default = "default_outbound_depth")]
    pub outbound_depth: usize,
    #[serde(default = "default_chunk_capacity")]
    pub chunk_capacity: usize,
    #[serde(default)]
    pub exhausted_policy: ExhaustedPolicy,
}

fn default_filter_decay_after() -> usize {
    arc_filter::decay::DEFAULT_DECAY_AFTER
}

fn default_conn_filter_reset_after() -> usize {
    1024
}

fn default_max_backtrack() -> usize {
    arc_dht::DEFAULT_MAX_BACKTRACK
}

fn default_max_hops() -> i64 {
    arc_dht::DEFAULT_MAX_HOPS
}

fn default_transaction_timeout_secs() -> u64 {
    arc_dht::DEFAULT_TRANSACTION_TIMEOUT_SECS
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

fn default_queue_depth() -> usize {
    1024
}

fn default_outbound_depth() -> usize {
    256
}

fn default_chunk_capacity() -> usize {
    arc_dht::DEFAULT_CHUNK_CAPACITY
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            filter_decay_after: default_filter_decay_after(),
            conn_filter_reset_after: default_conn_filter_reset_after(),
            max_backtrack: default_max_backtrack(),
            max_hops: default_max_hops(),
            transaction_timeout_secs: default_transaction_timeout_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
            queue_depth: default_queue_depth(),
            outbound_depth: default_outbound_depth(),
            chunk_capacity: default_chunk_capacity(),
            exhausted_policy: ExhaustedPolicy::default(),
        }
    }
}

impl RouterConfig {
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}
