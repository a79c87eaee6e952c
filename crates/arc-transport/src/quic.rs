//! QUIC links.
//!
//! Each node runs one [`quinn`] endpoint acting as both client and server.
//! TLS uses a throwaway self-signed certificate and the client accepts any
//! server certificate: peer authentication is the signed identity frame
//! exchanged on the link, not TLS.
//!
//! A link is the first bidirectional stream of a connection. The dialing side
//! opens it and the accepting side takes it with `accept_bi`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::{ClientConfig, Endpoint, ServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::link::LinkStream;
use crate::TransportError;

/// ALPN protocol identifier.
pub const ALPN_ARC_V0: &[u8] = b"arc/0";

/// TLS server name presented when dialing. Certificates are not checked.
pub const SERVER_NAME: &str = "arc-node";

pub const DEFAULT_IDLE_TIMEOUT_MS: u32 = 30_000;
pub const DEFAULT_KEEP_ALIVE_MS: u64 = 10_000;
pub const DEFAULT_MAX_BI_STREAMS: u32 = 8;

#[derive(Clone, Debug)]
pub struct QuicConfig {
    pub bind_addr: SocketAddr,
    pub idle_timeout_ms: u32,
    pub max_bi_streams: u32,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            max_bi_streams: DEFAULT_MAX_BI_STREAMS,
        }
    }
}

/// A QUIC endpoint that both listens for and dials links.
#[derive(Clone)]
pub struct QuicNode {
    endpoint: Endpoint,
    local_addr: SocketAddr,
}

impl QuicNode {
    /// Bind an endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Tls`] if TLS configuration fails and
    /// [`TransportError::Io`] if the socket cannot be bound.
    pub fn new(config: QuicConfig) -> Result<Self, TransportError> {
        let server_config = build_server_config(config.idle_timeout_ms, config.max_bi_streams)?;
        let client_config = build_client_config(config.idle_timeout_ms)?;

        let mut endpoint = Endpoint::server(server_config, config.bind_addr)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        endpoint.set_default_client_config(client_config);

        let local_addr = endpoint
            .local_addr()
            .map_err(|e| TransportError::Io(e.to_string()))?;

        tracing::info!(%local_addr, "QUIC endpoint bound");

        Ok(Self {
            endpoint,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next inbound connection and take its first stream.
    ///
    /// Returns `None` once the endpoint is closed. A connection that fails
    /// during setup yields `Some(Err(_))` and the endpoint keeps accepting.
    pub async fn accept_link(&self) -> Option<Result<LinkStream, TransportError>> {
        let incoming = self.endpoint.accept().await?;
        Some(accept_incoming(incoming).await)
    }

    /// Dial `addr` and open the link stream.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connection`] if the handshake or stream open fails.
    pub async fn connect_link(&self, addr: SocketAddr) -> Result<LinkStream, TransportError> {
        let connection = self
            .endpoint
            .connect(addr, SERVER_NAME)
            .map_err(|e| TransportError::Connection(e.to_string()))?
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        tracing::debug!(remote = %addr, "QUIC link opened");
        Ok(LinkStream::from_quic(connection, send, recv))
    }

    /// Close the endpoint and every connection on it.
    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"shutdown");
    }
}

async fn accept_incoming(incoming: quinn::Incoming) -> Result<LinkStream, TransportError> {
    let connection = incoming
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))?;
    let (send, recv) = connection
        .accept_bi()
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))?;
    tracing::debug!(remote = %connection.remote_address(), "QUIC link accepted");
    Ok(LinkStream::from_quic(connection, send, recv))
}

fn generate_self_signed_cert(
) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>), TransportError> {
    let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ED25519)
        .map_err(|e| TransportError::Tls(format!("key generation failed: {e}")))?;
    let params = rcgen::CertificateParams::new(vec![SERVER_NAME.to_string()])
        .map_err(|e| TransportError::Tls(format!("cert params failed: {e}")))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TransportError::Tls(format!("self-signed cert failed: {e}")))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    Ok((cert_der, key_der))
}

fn transport_config(idle_timeout_ms: u32) -> Result<quinn::TransportConfig, TransportError> {
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        quinn::IdleTimeout::try_from(Duration::from_millis(u64::from(idle_timeout_ms)))
            .map_err(|e| TransportError::Tls(format!("idle timeout config failed: {e}")))?,
    ));
    transport.keep_alive_interval(Some(Duration::from_millis(DEFAULT_KEEP_ALIVE_MS)));
    Ok(transport)
}

fn build_server_config(
    idle_timeout_ms: u32,
    max_bi_streams: u32,
) -> Result<ServerConfig, TransportError> {
    let (cert_der, key_der) = generate_self_signed_cert()?;

    let provider = rustls::crypto::ring::default_provider();
    let mut tls_config = rustls::ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::Tls(format!("server TLS version config failed: {e}")))?
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .map_err(|e| TransportError::Tls(format!("server TLS config failed: {e}")))?;
    tls_config.alpn_protocols = vec![ALPN_ARC_V0.to_vec()];

    let mut transport = transport_config(idle_timeout_ms)?;
    transport.max_concurrent_bidi_streams(quinn::VarInt::from_u32(max_bi_streams));

    let mut server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
            .map_err(|e| TransportError::Tls(format!("QUIC server crypto config failed: {e}")))?,
    ));
    server_config.transport_config(Arc::new(transport));
    Ok(server_config)
}

fn build_client_config(idle_timeout_ms: u32) -> Result<ClientConfig, TransportError> {
    let provider = rustls::crypto::ring::default_provider();
    let mut tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::Tls(format!("client TLS version config failed: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();
    tls_config.alpn_protocols = vec![ALPN_ARC_V0.to_vec()];

    let mut client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(tls_config)
            .map_err(|e| TransportError::Tls(format!("QUIC client crypto config failed: {e}")))?,
    ));
    client_config.transport_config(Arc::new(transport_config(idle_timeout_ms)?));
    Ok(client_config)
}

/// Accepts any server certificate; identity is checked on the link itself.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Message, MAX_BODY_SIZE};

    #[test]
    fn test_self_signed_cert() {
        let (cert, key) = generate_self_signed_cert().expect("cert generation");
        assert!(!cert.is_empty());
        assert!(matches!(key, PrivateKeyDer::Pkcs8(_)));
    }

    #[test]
    fn test_configs_build() {
        assert!(build_server_config(DEFAULT_IDLE_TIMEOUT_MS, DEFAULT_MAX_BI_STREAMS).is_ok());
        assert!(build_client_config(DEFAULT_IDLE_TIMEOUT_MS).is_ok());
    }

    #[tokio::test]
    async fn test_link_over_loopback() {
        let loopback = QuicConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..QuicConfig::default()
        };
        let server = QuicNode::new(loopback.clone()).expect("server");
        let client = QuicNode::new(loopback).expect("client");
        let server_addr = server.local_addr();

        let accept = tokio::spawn(async move {
            let mut link = server
                .accept_link()
                .await
                .expect("endpoint open")
                .expect("link");
            let msg = link.read_message(MAX_BODY_SIZE).await.expect("read");
            link.write_message(&Message::chat("pong")).await.expect("write");
            (msg, server)
        });

        // The server only sees the stream once data is written on it.
        let mut link = client.connect_link(server_addr).await.expect("connect");
        link.write_message(&Message::chat("ping")).await.expect("write");
        let reply = link.read_message(MAX_BODY_SIZE).await.expect("reply");
        let (received, _server) = accept.await.expect("join");

        assert_eq!(received.body, b"ping");
        assert_eq!(reply.body, b"pong");
    }
}
