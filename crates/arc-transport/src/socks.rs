//! Minimal SOCKS4a client used for proxied (e.g. Tor) TCP links.
//!
//! Request: `04 01 <port BE:2> 00 00 00 01 00 <host> 00`. The proxy answers
//! with eight bytes; byte 1 is `0x5a` when the request was granted.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::{io_error, Result, TransportError};

pub const SOCKS_VERSION: u8 = 0x04;
pub const CMD_CONNECT: u8 = 0x01;
pub const REPLY_GRANTED: u8 = 0x5a;
pub const REPLY_LEN: usize = 8;

/// Longest hostname accepted in a request.
pub const MAX_HOST_LEN: usize = 255;

/// Build a SOCKS4a CONNECT request for `host:port`.
///
/// # Errors
///
/// Returns [`TransportError::Socks`] for an empty or over-long host or one
/// containing a NUL byte.
pub fn build_request(host: &str, port: u16) -> Result<Vec<u8>> {
    if host.is_empty() || host.len() > MAX_HOST_LEN || host.as_bytes().contains(&0) {
        return Err(TransportError::Socks(format!("invalid host {host:?}")));
    }
    let mut req = Vec::with_capacity(10 + host.len());
    req.push(SOCKS_VERSION);
    req.push(CMD_CONNECT);
    req.extend_from_slice(&port.to_be_bytes());
    // 0.0.0.1 tells the proxy to resolve the trailing hostname.
    req.extend_from_slice(&[0, 0, 0, 1]);
    req.push(0); // empty user id
    req.extend_from_slice(host.as_bytes());
    req.push(0);
    Ok(req)
}

/// Check an eight-byte proxy reply.
pub fn check_reply(reply: &[u8; REPLY_LEN]) -> Result<()> {
    if reply[1] == REPLY_GRANTED {
        Ok(())
    } else {
        Err(TransportError::Socks(format!(
            "proxy rejected request with code {:#04x}",
            reply[1]
        )))
    }
}

/// Run the SOCKS4a handshake over an already connected proxy stream.
pub async fn handshake<S>(stream: &mut S, host: &str, port: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let req = build_request(host, port)?;
    stream.write_all(&req).await.map_err(io_error)?;
    stream.flush().await.map_err(io_error)?;

    let mut reply = [0u8; REPLY_LEN];
    stream.read_exact(&mut reply).await.map_err(|e| {
        TransportError::Socks(format!("reading proxy reply failed: {e}"))
    })?;
    check_reply(&reply)
}

/// Connect to `host:port` through the SOCKS4a proxy at `proxy`.
pub async fn connect(proxy: &str, host: &str, port: u16) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(proxy)
        .await
        .map_err(|e| TransportError::Connection(format!("proxy {proxy}: {e}")))?;
    handshake(&mut stream, host, port).await?;
    tracing::debug!(proxy, host, port, "SOCKS4a tunnel established");
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_layout() {
        let req = build_request("abc.onion", 0x1234).expect("request");
        assert_eq!(&req[..9], &[0x04, 0x01, 0x12, 0x34, 0, 0, 0, 1, 0]);
        assert_eq!(&req[9..18], b"abc.onion");
        assert_eq!(req.last(), Some(&0));
        assert_eq!(req.len(), 19);
    }

    #[test]
    fn test_invalid_hosts() {
        assert!(build_request("", 80).is_err());
        assert!(build_request("a\0b", 80).is_err());
        assert!(build_request(&"x".repeat(MAX_HOST_LEN + 1), 80).is_err());
    }

    #[test]
    fn test_reply_codes() {
        assert!(check_reply(&[0, 0x5a, 0, 0, 0, 0, 0, 0]).is_ok());
        let err = check_reply(&[0, 0x5b, 0, 0, 0, 0, 0, 0]).expect_err("rejected");
        assert!(matches!(err, TransportError::Socks(_)));
    }

    #[tokio::test]
    async fn test_handshake_over_duplex() {
        let (mut client, mut proxy) = tokio::io::duplex(256);

        let server = tokio::spawn(async move {
            let mut head = [0u8; 9];
            proxy.read_exact(&mut head).await.expect("read head");
            let mut host = Vec::new();
            loop {
                let b = proxy.read_u8().await.expect("read host");
                if b == 0 {
                    break;
                }
                host.push(b);
            }
            proxy
                .write_all(&[0, REPLY_GRANTED, 0, 0, 0, 0, 0, 0])
                .await
                .expect("reply");
            (head, host)
        });

        handshake(&mut client, "peer.example", 11000)
            .await
            .expect("handshake");
        let (head, host) = server.await.expect("join");
        assert_eq!(&head[2..4], &11000u16.to_be_bytes());
        assert_eq!(host, b"peer.example");
    }

    #[tokio::test]
    async fn test_handshake_rejected() {
        let (mut client, mut proxy) = tokio::io::duplex(256);
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let _ = proxy.read(&mut buf).await;
            let _ = proxy.write_all(&[0, 0x5b, 0, 0, 0, 0, 0, 0]).await;
        });
        assert!(handshake(&mut client, "peer", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_handshake_short_reply() {
        let (mut client, mut proxy) = tokio::io::duplex(256);
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let _ = proxy.read(&mut buf).await;
            let _ = proxy.write_all(&[0, REPLY_GRANTED]).await;
        });
        assert!(handshake(&mut client, "peer", 1).await.is_err());
    }
}
