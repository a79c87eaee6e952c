//! # arc-transport
//!
//! Wire format and link plumbing for the arc overlay.
//!
//! - **Frames** with a fixed 76-byte header via [`frame`]
//! - **DHT sub-messages** (CBOR map with keys `m r t h d`) via [`dht`]
//! - **Identity announcements** signed with the node key via [`identity`]
//! - **CBOR** helpers via [`cbor`]
//! - **Links**: boxed reader/writer pairs over TCP, SOCKS4a and QUIC via
//!   [`link`], [`socks`] and [`quic`]
//!
//! ## Layering
//!
//! ```text
//! DhtMessage / IdentityAnnouncement / chat line
//!     |
//!     v
//! Message (frame.rs)   -- version, type, length, timestamp, signature, body
//!     |
//!     v
//! LinkStream (link.rs) -- TCP, SOCKS4a-proxied TCP, or a QUIC bi-stream
//! ```

pub mod cbor;
pub mod dht;
pub mod frame;
pub mod identity;
pub mod link;
pub mod quic;
pub mod socks;

pub use dht::DhtMessage;
pub use frame::{Message, MessageType};
pub use identity::{IdentityAnnouncement, VerifiedIdentity};
pub use link::LinkStream;

/// Error types for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Encoding a value failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A frame body or sub-message could not be decoded.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// A required field was absent from a decoded sub-message.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// The frame header carries a version this node does not speak.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// Declared body length exceeds the configured maximum.
    #[error("frame too large: {len} bytes, max {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// The type byte is not one this node understands.
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    /// Signature or identity check failed.
    #[error("verification failed: {0}")]
    Verification(String),

    /// TLS/certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Connection setup failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// The SOCKS proxy refused or mangled the request.
    #[error("SOCKS error: {0}")]
    Socks(String),

    /// I/O error (socket, stream read/write).
    #[error("I/O error: {0}")]
    Io(String),

    /// The remote end closed the stream.
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    /// Whether the error leaves the stream unusable.
    ///
    /// Body-level decode failures only cost the one message; header-level
    /// corruption, I/O failures and failed identity checks end the connection.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            TransportError::Serialization(_)
                | TransportError::Deserialization(_)
                | TransportError::MissingField(_)
                | TransportError::UnknownMessageType(_)
        )
    }
}

/// Map an I/O error, folding EOF into [`TransportError::Closed`].
pub(crate) fn io_error(e: std::io::Error) -> TransportError {
    match e.kind() {
        std::io::ErrorKind::UnexpectedEof
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::BrokenPipe => TransportError::Closed,
        _ => TransportError::Io(e.to_string()),
    }
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
