//! Fixed-header binary frames.
//!
//! ## Wire format
//!
//! ```text
//! offset  size  field
//! 0       1     version     (PROTOCOL_VERSION)
//! 1       1     type        (MessageType)
//! 2       2     body length (big-endian)
//! 4       8     timestamp   (big-endian, ns since the Unix epoch)
//! 12      64    signature   (Ed25519, zero-filled when unsigned)
//! 76      len   body
//! ```
//!
//! The reader validates the version and the declared length before reading
//! the body, and never reads past the declared length.

use arc_crypto::ed25519::{Signature, SigningKey, VerifyingKey};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{io_error, Result, TransportError};

/// The only frame version this node speaks.
pub const PROTOCOL_VERSION: u8 = 0;

/// Width of the signature field.
pub const SIGNATURE_LEN: usize = arc_crypto::ed25519::SIGNATURE_LEN;

/// Bytes before the signature field.
const PREFIX_LEN: usize = 12;

/// Total header length.
pub const HEADER_LEN: usize = PREFIX_LEN + SIGNATURE_LEN;

/// Default cap on the body length accepted from a peer.
pub const MAX_BODY_SIZE: usize = 16 * 1024;

/// Frame type discriminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Link control; carries the identity announcement.
    Control = 0,
    /// A chat line, flooded to every peer.
    Chat = 1,
    /// A DHT sub-message, routed hop by hop.
    Dht = 3,
}

impl TryFrom<u8> for MessageType {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageType::Control),
            1 => Ok(MessageType::Chat),
            3 => Ok(MessageType::Dht),
            other => Err(TransportError::UnknownMessageType(other)),
        }
    }
}

/// One framed message.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    pub version: u8,
    pub msg_type: MessageType,
    pub timestamp: u64,
    pub signature: [u8; SIGNATURE_LEN],
    pub body: Vec<u8>,
}

/// The parsed fixed header.
#[derive(Clone, Debug, PartialEq, Eq)]
struct FrameHeader {
    version: u8,
    type_byte: u8,
    body_len: usize,
    timestamp: u64,
    signature: [u8; SIGNATURE_LEN],
}

impl FrameHeader {
    fn parse(raw: &[u8; HEADER_LEN]) -> Self {
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&raw[4..PREFIX_LEN]);
        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&raw[PREFIX_LEN..HEADER_LEN]);
        Self {
            version: raw[0],
            type_byte: raw[1],
            body_len: usize::from(u16::from_be_bytes([raw[2], raw[3]])),
            timestamp: u64::from_be_bytes(ts),
            signature,
        }
    }

    /// Checks that must pass before any body byte is read.
    fn validate(&self, max_body: usize) -> Result<()> {
        if self.version != PROTOCOL_VERSION {
            return Err(TransportError::UnsupportedVersion(self.version));
        }
        if self.body_len > max_body {
            return Err(TransportError::FrameTooLarge {
                len: self.body_len,
                max: max_body,
            });
        }
        Ok(())
    }

    fn into_message(self, body: Vec<u8>) -> Result<Message> {
        Ok(Message {
            version: self.version,
            msg_type: MessageType::try_from(self.type_byte)?,
            timestamp: self.timestamp,
            signature: self.signature,
            body,
        })
    }
}

impl Message {
    /// Build an unsigned message stamped with the current time.
    pub fn new(msg_type: MessageType, body: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            msg_type,
            timestamp: now_nanos(),
            signature: [0u8; SIGNATURE_LEN],
            body,
        }
    }

    /// A chat line.
    pub fn chat(line: &str) -> Self {
        Self::new(MessageType::Chat, line.as_bytes().to_vec())
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_signed(&self) -> bool {
        self.signature.iter().any(|b| *b != 0)
    }

    /// Header without the signature field, followed by the body.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PREFIX_LEN + self.body.len());
        out.extend_from_slice(&self.prefix());
        out.extend_from_slice(&self.body);
        out
    }

    /// Fill the signature field.
    pub fn sign(&mut self, key: &SigningKey) {
        self.signature = key.sign(&self.signable_bytes()).to_bytes();
    }

    /// Check the signature field against `key`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Verification`] for an unsigned message or a
    /// signature that does not verify.
    pub fn verify(&self, key: &VerifyingKey) -> Result<()> {
        if !self.is_signed() {
            return Err(TransportError::Verification("message is unsigned".into()));
        }
        key.verify(&self.signable_bytes(), &Signature::from_bytes(&self.signature))
            .map_err(|e| TransportError::Verification(e.to_string()))
    }

    /// Length of the encoded frame.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.body.len()
    }

    /// Encode header and body.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::FrameTooLarge`] if the body does not fit the
    /// length field or exceeds [`MAX_BODY_SIZE`].
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.body.len() > MAX_BODY_SIZE {
            return Err(TransportError::FrameTooLarge {
                len: self.body.len(),
                max: MAX_BODY_SIZE,
            });
        }
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&self.prefix());
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    /// Decode exactly one frame occupying all of `bytes`.
    ///
    /// # Errors
    ///
    /// Header errors as for [`Message::read_from`], plus
    /// [`TransportError::Deserialization`] when `bytes` is truncated or has
    /// trailing data.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let raw: &[u8; HEADER_LEN] = bytes
            .get(..HEADER_LEN)
            .and_then(|h| h.try_into().ok())
            .ok_or_else(|| {
                TransportError::Deserialization(format!(
                    "truncated header: {} of {HEADER_LEN} bytes",
                    bytes.len()
                ))
            })?;
        let header = FrameHeader::parse(raw);
        header.validate(MAX_BODY_SIZE)?;

        let body = &bytes[HEADER_LEN..];
        if body.len() != header.body_len {
            return Err(TransportError::Deserialization(format!(
                "declared body length {} but {} bytes present",
                header.body_len,
                body.len()
            )));
        }
        header.into_message(body.to_vec())
    }

    /// Read one frame from `reader`.
    ///
    /// # Errors
    ///
    /// - [`TransportError::UnsupportedVersion`] / [`TransportError::FrameTooLarge`]
    ///   before any body byte is read (fatal for the stream)
    /// - [`TransportError::UnknownMessageType`] after the body was consumed
    ///   (the stream stays aligned)
    /// - [`TransportError::Closed`] / [`TransportError::Io`] on stream failure
    pub async fn read_from<R>(reader: &mut R, max_body: usize) -> Result<Self>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut raw = [0u8; HEADER_LEN];
        reader.read_exact(&mut raw).await.map_err(io_error)?;
        let header = FrameHeader::parse(&raw);
        header.validate(max_body)?;

        let mut body = vec![0u8; header.body_len];
        reader.read_exact(&mut body).await.map_err(io_error)?;
        header.into_message(body)
    }

    /// Encode and write this frame, then flush.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let bytes = self.encode()?;
        writer.write_all(&bytes).await.map_err(io_error)?;
        writer.flush().await.map_err(io_error)
    }

    fn prefix(&self) -> [u8; PREFIX_LEN] {
        let mut out = [0u8; PREFIX_LEN];
        out[0] = self.version;
        out[1] = self.msg_type as u8;
        let len = u16::try_from(self.body.len()).unwrap_or(u16::MAX);
        out[2..4].copy_from_slice(&len.to_be_bytes());
        out[4..PREFIX_LEN].copy_from_slice(&self.timestamp.to_be_bytes());
        out
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("version", &self.version)
            .field("msg_type", &self.msg_type)
            .field("timestamp", &self.timestamp)
            .field("signed", &self.is_signed())
            .field("body_len", &self.body.len())
            .finish()
    }
}

fn now_nanos() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arc_crypto::ed25519::KeyPair;

    #[test]
    fn test_header_layout() {
        let msg = Message {
            version: PROTOCOL_VERSION,
            msg_type: MessageType::Chat,
            timestamp: 0x0102_0304_0506_0708,
            signature: [0u8; SIGNATURE_LEN],
            body: b"hi".to_vec(),
        };
        let bytes = msg.encode().expect("encode");
        assert_eq!(bytes.len(), HEADER_LEN + 2);
        assert_eq!(HEADER_LEN, 76);
        assert_eq!(bytes[0], PROTOCOL_VERSION);
        assert_eq!(bytes[1], 1);
        assert_eq!(&bytes[2..4], &[0, 2]);
        assert_eq!(&bytes[4..12], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(bytes[12..76].iter().all(|b| *b == 0));
        assert_eq!(&bytes[76..], b"hi");
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let msg = Message::chat("hello overlay");
        let decoded = Message::decode(&msg.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, msg);

        let empty = Message::new(MessageType::Dht, Vec::new());
        let decoded = Message::decode(&empty.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, empty);
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let mut bytes = Message::chat("x").encode().expect("encode");
        bytes[0] = 7;
        let err = Message::decode(&bytes).expect_err("bad version");
        assert!(matches!(err, TransportError::UnsupportedVersion(7)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_unknown_type_is_not_fatal() {
        let mut bytes = Message::chat("x").encode().expect("encode");
        bytes[1] = 0x42;
        let err = Message::decode(&bytes).expect_err("bad type");
        assert!(matches!(err, TransportError::UnknownMessageType(0x42)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_truncated_and_trailing_rejected() {
        let bytes = Message::chat("hello").encode().expect("encode");
        assert!(Message::decode(&bytes[..HEADER_LEN - 1]).is_err());
        assert!(Message::decode(&bytes[..bytes.len() - 1]).is_err());
        let mut longer = bytes.clone();
        longer.push(0);
        assert!(Message::decode(&longer).is_err());
    }

    #[test]
    fn test_oversized_body_rejected_on_encode() {
        let msg = Message::new(MessageType::Chat, vec![0u8; MAX_BODY_SIZE + 1]);
        assert!(matches!(
            msg.encode(),
            Err(TransportError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_sign_and_verify() {
        let kp = KeyPair::generate();
        let mut msg = Message::chat("signed line");
        assert!(!msg.is_signed());
        assert!(msg.verify(&kp.verifying_key).is_err());

        msg.sign(&kp.signing_key);
        assert!(msg.is_signed());
        msg.verify(&kp.verifying_key).expect("verify");

        let decoded = Message::decode(&msg.encode().expect("encode")).expect("decode");
        decoded.verify(&kp.verifying_key).expect("verify after decode");

        let mut tampered = decoded.clone();
        tampered.body.push(b'!');
        assert!(matches!(
            tampered.verify(&kp.verifying_key),
            Err(TransportError::Verification(_))
        ));
    }

    #[tokio::test]
    async fn test_read_from_stream_sequence() {
        let first = Message::chat("one");
        let second = Message::chat("two");
        let mut wire = first.encode().expect("encode");
        wire.extend(second.encode().expect("encode"));

        let mut reader = wire.as_slice();
        let a = Message::read_from(&mut reader, MAX_BODY_SIZE).await.expect("first");
        let b = Message::read_from(&mut reader, MAX_BODY_SIZE).await.expect("second");
        assert_eq!(a, first);
        assert_eq!(b, second);
        assert!(matches!(
            Message::read_from(&mut reader, MAX_BODY_SIZE).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_read_from_rejects_large_length_before_body() {
        let msg = Message::new(MessageType::Chat, vec![7u8; 100]);
        let wire = msg.encode().expect("encode");
        // Only the header is available: the limit must trip without waiting for the body.
        let mut reader = &wire[..HEADER_LEN];
        let err = Message::read_from(&mut reader, 64).await.expect_err("too large");
        assert!(matches!(err, TransportError::FrameTooLarge { len: 100, max: 64 }));
    }

    #[tokio::test]
    async fn test_unknown_type_keeps_stream_aligned() {
        let mut bad = Message::chat("skip me").encode().expect("encode");
        bad[1] = 0x99;
        let good = Message::chat("keep me");
        bad.extend(good.encode().expect("encode"));

        let mut reader = bad.as_slice();
        let err = Message::read_from(&mut reader, MAX_BODY_SIZE).await.expect_err("unknown");
        assert!(!err.is_fatal());
        let next = Message::read_from(&mut reader, MAX_BODY_SIZE).await.expect("next");
        assert_eq!(next, good);
    }

    #[tokio::test]
    async fn test_write_to_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = Message::chat("over the pipe");
        msg.write_to(&mut a).await.expect("write");
        let read = Message::read_from(&mut b, MAX_BODY_SIZE).await.expect("read");
        assert_eq!(read, msg);
    }
}
