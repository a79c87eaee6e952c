//! Transport-agnostic byte links.
//!
//! Every connection, whatever carries it, ends up as a [`LinkStream`]: a boxed
//! reader and a boxed writer that the hub drives with [`Message::read_from`]
//! and [`Message::write_to`].

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use arc_types::TransportKind;
use quinn::{Connection, RecvStream, SendStream};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::frame::Message;
use crate::Result;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct LinkStream {
    pub kind: TransportKind,
    /// Remote address as dialed or accepted, for logs.
    pub remote: String,
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

impl LinkStream {
    pub fn new(
        kind: TransportKind,
        remote: impl Into<String>,
        reader: BoxedReader,
        writer: BoxedWriter,
    ) -> Self {
        Self {
            kind,
            remote: remote.into(),
            reader,
            writer,
        }
    }

    /// Wrap a connected TCP socket. `kind` is [`TransportKind::Socks`] for
    /// sockets tunnelled through a proxy.
    pub fn from_tcp(stream: TcpStream, kind: TransportKind) -> Self {
        let remote = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%remote, error = %e, "could not set TCP_NODELAY");
        }
        let (reader, writer) = stream.into_split();
        Self::new(kind, remote, Box::new(reader), Box::new(writer))
    }

    /// Wrap any duplex byte stream.
    pub fn from_io<S>(io: S, kind: TransportKind, remote: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        Self::new(kind, remote, Box::new(reader), Box::new(writer))
    }

    /// Wrap one bidirectional stream of a QUIC connection.
    pub fn from_quic(connection: Connection, send: SendStream, recv: RecvStream) -> Self {
        let remote = connection.remote_address().to_string();
        let writer = QuicWriter { send, connection };
        Self::new(TransportKind::Quic, remote, Box::new(recv), Box::new(writer))
    }

    /// Two links joined back to back in memory.
    pub fn memory_pair(capacity: usize) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(capacity);
        (
            Self::from_io(a, TransportKind::Tcp, "memory:a"),
            Self::from_io(b, TransportKind::Tcp, "memory:b"),
        )
    }

    pub async fn read_message(&mut self, max_body: usize) -> Result<Message> {
        Message::read_from(&mut self.reader, max_body).await
    }

    pub async fn write_message(&mut self, message: &Message) -> Result<()> {
        message.write_to(&mut self.writer).await
    }

    pub fn into_parts(self) -> (BoxedReader, BoxedWriter) {
        (self.reader, self.writer)
    }
}

impl fmt::Debug for LinkStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkStream")
            .field("kind", &self.kind)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

/// Send half of a QUIC link. Holds the connection handle so the link owns it.
struct QuicWriter {
    send: SendStream,
    connection: Connection,
}

impl AsyncWrite for QuicWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.send), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let result = AsyncWrite::poll_shutdown(Pin::new(&mut self.send), cx);
        if result.is_ready() {
            self.connection.close(0u32.into(), b"link closed");
        }
        result
    }
}
