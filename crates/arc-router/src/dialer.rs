//! Outbound link establishment.
//!
//! The hub's persist loop is generic over [`Dialer`], so a remote can be
//! reached directly over TCP, through a SOCKS4a proxy, or over QUIC without
//! the loop knowing which.

use std::future::Future;

use arc_transport::quic::QuicNode;
use arc_transport::{socks, LinkStream, TransportError};
use arc_types::{NodeId, TransportKind};
use tokio::net::TcpStream;

/// A SOCKS4a proxy endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxySpec {
    pub host: String,
    pub port: u16,
}

impl ProxySpec {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A remote to keep a link open to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteSpec {
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
    pub proxy: Option<ProxySpec>,
    /// Identity the remote must announce, if known in advance.
    pub expected: Option<NodeId>,
}

impl RemoteSpec {
    pub fn new(host: impl Into<String>, port: u16, transport: TransportKind) -> Self {
        Self {
            host: host.into(),
            port,
            transport,
            proxy: None,
            expected: None,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Opens a link to a remote.
pub trait Dialer: Send + Sync + 'static {
    fn dial(
        &self,
        remote: &RemoteSpec,
    ) -> impl Future<Output = Result<LinkStream, TransportError>> + Send;
}

/// Plain TCP, or SOCKS4a when the remote names a proxy.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    async fn dial(&self, remote: &RemoteSpec) -> Result<LinkStream, TransportError> {
        match &remote.proxy {
            Some(proxy) => {
                let stream = socks::connect(&proxy.address(), &remote.host, remote.port).await?;
                Ok(LinkStream::from_tcp(stream, TransportKind::Socks))
            }
            None => {
                let stream = TcpStream::connect((remote.host.as_str(), remote.port))
                    .await
                    .map_err(|e| TransportError::Connection(format!("{}: {e}", remote.address())))?;
                Ok(LinkStream::from_tcp(stream, TransportKind::Tcp))
            }
        }
    }
}

/// QUIC through a shared endpoint.
#[derive(Clone)]
pub struct QuicDialer {
    node: QuicNode,
}

impl QuicDialer {
    pub fn new(node: QuicNode) -> Self {
        Self { node }
    }
}

impl Dialer for QuicDialer {
    async fn dial(&self, remote: &RemoteSpec) -> Result<LinkStream, TransportError> {
        let addr = tokio::net::lookup_host((remote.host.as_str(), remote.port))
            .await
            .map_err(|e| TransportError::Connection(format!("{}: {e}", remote.address())))?
            .next()
            .ok_or_else(|| {
                TransportError::Connection(format!("{}: no addresses", remote.address()))
            })?;
        self.node.connect_link(addr).await
    }
}
