//! Node configuration.
//!
//! Read from `$ARC_CONFIG`, or `arc.toml` in the working directory. A missing
//! file is created with the defaults so there is something to edit.

use std::path::{Path, PathBuf};

use anyhow::Context;
use arc_crypto::ed25519::{derive_node_id, VerifyingKey};
use arc_router::dialer::ProxySpec;
use arc_router::{RemoteSpec, RouterConfig};
use arc_types::{NodeId, TransportKind};
use serde::{Deserialize, Serialize};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "ARC_CONFIG";

const DEFAULT_CONFIG_FILE: &str = "arc.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub local: LocalConfig,
    /// Peers to keep a link open to.
    #[serde(default)]
    pub remotes: Vec<RemoteConfig>,
    /// Flat-file peer directory. Every entry is dialed like a remote.
    #[serde(default)]
    pub peers_file: Option<PathBuf>,
    #[serde(default)]
    pub router: RouterConfig,
    /// Default `tracing` level for the `arc` crates; `RUST_LOG` overrides it.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalConfig {
    #[serde(default = "default_tcp_bind")]
    pub tcp_bind: String,
    /// UDP address for the QUIC endpoint. No QUIC hub when unset.
    #[serde(default)]
    pub quic_bind: Option<String>,
    /// Hex Ed25519 secret key, generated on first start.
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
    /// Address announced to peers. Defaults to `tcp_bind`.
    #[serde(default)]
    pub advertise: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub addr: String,
    pub port: u16,
    #[serde(default = "default_transport")]
    pub transport: TransportKind,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    /// Hex public key the remote must announce.
    #[serde(default)]
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub addr: String,
    pub port: u16,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tcp_bind() -> String {
    "127.0.0.1:11000".to_string()
}

fn default_key_file() -> PathBuf {
    PathBuf::from("arc.key")
}

fn default_transport() -> TransportKind {
    TransportKind::Tcp
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            tcp_bind: default_tcp_bind(),
            quic_bind: None,
            key_file: default_key_file(),
            advertise: None,
        }
    }
}

impl LocalConfig {
    pub fn advertise(&self) -> &str {
        self.advertise.as_deref().unwrap_or(&self.tcp_bind)
    }
}

impl RemoteConfig {
    /// Public key, if one is configured.
    pub fn verifying_key(&self) -> anyhow::Result<Option<VerifyingKey>> {
        self.public_key
            .as_deref()
            .map(|hex| {
                VerifyingKey::from_hex(hex)
                    .with_context(|| format!("bad public key for remote {}", self.addr))
            })
            .transpose()
    }

    pub fn to_spec(&self) -> anyhow::Result<RemoteSpec> {
        let mut spec = RemoteSpec::new(self.addr.clone(), self.port, self.transport);
        spec.proxy = self.proxy.as_ref().map(|p| ProxySpec {
            host: p.addr.clone(),
            port: p.port,
        });
        spec.expected = self
            .verifying_key()?
            .map(|key| NodeId::from_bytes(derive_node_id(&key)));
        Ok(spec)
    }
}

impl NodeConfig {
    /// Load from `$ARC_CONFIG` or `./arc.toml`.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load `path`, writing the defaults there first if it does not exist.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            let config = Self::default();
            let text = toml::to_string_pretty(&config)?;
            std::fs::write(path, text)
                .with_context(|| format!("writing default config to {}", path.display()))?;
            return Ok(config);
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    fn config_path() -> PathBuf {
        std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }
}
