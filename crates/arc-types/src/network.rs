//! Node identifiers, the XOR distance metric and peer records.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{TypeError, NODE_ID_LEN};

/// A flat 256-bit node identifier, `BLAKE3(public_key)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub [u8; NODE_ID_LEN]);

impl NodeId {
    pub const fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// XOR distance to `other`.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; NODE_ID_LEN];
        for (o, (a, b)) in out.iter_mut().zip(self.0.iter().zip(other.0.iter())) {
            *o = a ^ b;
        }
        Distance(out)
    }

    /// First four bytes in hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl From<[u8; NODE_ID_LEN]> for NodeId {
    fn from(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl FromStr for NodeId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|e| TypeError::InvalidNodeId(e.to_string()))?;
        let array: [u8; NODE_ID_LEN] = bytes.as_slice().try_into().map_err(|_| {
            TypeError::InvalidNodeId(format!("expected {NODE_ID_LEN} bytes, got {}", bytes.len()))
        })?;
        Ok(Self(array))
    }
}

/// XOR of two node identifiers, ordered as an unsigned big-endian integer.
///
/// Byte-array ordering is big-endian integer ordering, so the derived `Ord`
/// is the distance order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Distance(pub [u8; NODE_ID_LEN]);

impl Distance {
    pub const ZERO: Distance = Distance([0u8; NODE_ID_LEN]);

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn less_than(&self, other: &Distance) -> bool {
        self < other
    }

    /// Number of leading zero bits, or `None` for the zero distance.
    pub fn leading_zeros(&self) -> Option<usize> {
        self.0
            .iter()
            .position(|b| *b != 0)
            .map(|i| i * 8 + self.0[i].leading_zeros() as usize)
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex::encode(self.0))
    }
}

/// The transport a peer is reached over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Plain TCP.
    Tcp,
    /// TCP through a SOCKS4a proxy (for example a local Tor client).
    Socks,
    /// QUIC over UDP.
    Quic,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Socks => "socks",
            TransportKind::Quic => "quic",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportKind::Tcp),
            "socks" | "tor" => Ok(TransportKind::Socks),
            "quic" | "udp" => Ok(TransportKind::Quic),
            other => Err(TypeError::UnknownTransport(other.to_string())),
        }
    }
}

/// Everything needed to reach a peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: NodeId,
    /// Transport-specific endpoint, e.g. `host:port`.
    pub address: String,
    pub transport: TransportKind,
}

impl PeerInfo {
    pub fn new(id: NodeId, address: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            id,
            address: address.into(),
            transport,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn random_id() -> NodeId {
        let mut bytes = [0u8; NODE_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        NodeId(bytes)
    }

    #[test]
    fn test_distance_symmetric_and_identity() {
        for _ in 0..64 {
            let a = random_id();
            let b = random_id();
            assert_eq!(a.distance(&b), b.distance(&a));
            assert!(a.distance(&a).is_zero());
            if a.distance(&b).is_zero() {
                assert_eq!(a, b);
            }
        }
    }

    #[test]
    fn test_distance_zero_implies_equal() {
        let a = NodeId([0x5A; NODE_ID_LEN]);
        let mut b = a;
        assert!(a.distance(&b).is_zero());
        b.0[31] ^= 1;
        assert!(!a.distance(&b).is_zero());
    }

    #[test]
    fn test_distance_ordering_is_big_endian() {
        let mut high = [0u8; NODE_ID_LEN];
        high[0] = 0x01;
        let mut low = [0u8; NODE_ID_LEN];
        low[31] = 0xFF;
        assert!(Distance(low).less_than(&Distance(high)));
        assert!(!Distance(high).less_than(&Distance(high)));
        assert!(Distance::ZERO.less_than(&Distance(low)));
    }

    #[test]
    fn test_leading_zeros() {
        assert_eq!(Distance::ZERO.leading_zeros(), None);

        let mut d = [0u8; NODE_ID_LEN];
        d[0] = 0x80;
        assert_eq!(Distance(d).leading_zeros(), Some(0));
        d[0] = 0x01;
        assert_eq!(Distance(d).leading_zeros(), Some(7));

        let mut d2 = [0u8; NODE_ID_LEN];
        d2[1] = 0x01;
        assert_eq!(Distance(d2).leading_zeros(), Some(15));

        let mut d3 = [0u8; NODE_ID_LEN];
        d3[31] = 0x01;
        assert_eq!(Distance(d3).leading_zeros(), Some(255));
    }

    #[test]
    fn test_node_id_hex_roundtrip() {
        let id = random_id();
        let parsed: NodeId = id.to_string().parse().expect("parse");
        assert_eq!(parsed, id);
        assert!("abcd".parse::<NodeId>().is_err());
        assert!("not-hex".parse::<NodeId>().is_err());
    }

    #[test]
    fn test_transport_kind_parse() {
        assert_eq!("TCP".parse::<TransportKind>().expect("tcp"), TransportKind::Tcp);
        assert_eq!("tor".parse::<TransportKind>().expect("tor"), TransportKind::Socks);
        assert_eq!("quic".parse::<TransportKind>().expect("quic"), TransportKind::Quic);
        assert!("ethernet".parse::<TransportKind>().is_err());
        assert_eq!(TransportKind::Socks.to_string(), "socks");
    }
}
