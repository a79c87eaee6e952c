//! Signed identity announcements.
//!
//! The first frame on every link is a [`MessageType::Control`] frame whose
//! CBOR body carries the sender's public key and advertised address, signed
//! with that key. A link whose announcement fails to verify is dropped before
//! the peer reaches the routing table.

use arc_crypto::ed25519::{derive_node_id, KeyPair, VerifyingKey, PUBLIC_KEY_LEN};
use arc_types::{NodeId, PeerInfo, TransportKind};
use serde::{Deserialize, Serialize};

use crate::cbor;
use crate::frame::{Message, MessageType};
use crate::{Result, TransportError};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityAnnouncement {
    pub public_key: [u8; PUBLIC_KEY_LEN],
    /// Address other nodes should dial to reach the sender.
    pub address: String,
    pub transport: TransportKind,
}

/// A peer whose announcement carried a valid self-signature.
#[derive(Clone, Debug)]
pub struct VerifiedIdentity {
    pub peer: PeerInfo,
    pub public_key: VerifyingKey,
}

impl IdentityAnnouncement {
    pub fn new(keypair: &KeyPair, address: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            public_key: keypair.verifying_key.to_bytes(),
            address: address.into(),
            transport,
        }
    }

    /// Encode and sign as a control frame.
    pub fn to_message(&self, keypair: &KeyPair) -> Result<Message> {
        let mut message = Message::new(MessageType::Control, cbor::to_vec(self)?);
        message.sign(&keypair.signing_key);
        Ok(message)
    }

    /// Decode a control frame and check its signature against the key it carries.
    ///
    /// When `expected` is set, the derived node id must match it.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Verification`] for a non-control frame, an
    /// undecodable body, a bad key or signature, or an unexpected node id.
    pub fn verify(message: &Message, expected: Option<NodeId>) -> Result<VerifiedIdentity> {
        if message.msg_type != MessageType::Control {
            return Err(TransportError::Verification(format!(
                "expected identity frame, got {:?}",
                message.msg_type
            )));
        }
        let announcement: IdentityAnnouncement = cbor::from_slice(&message.body)
            .map_err(|e| TransportError::Verification(format!("bad identity body: {e}")))?;

        let public_key = VerifyingKey::from_bytes(&announcement.public_key)
            .map_err(|e| TransportError::Verification(e.to_string()))?;
        message.verify(&public_key)?;

        let id = NodeId::from_bytes(derive_node_id(&public_key));
        if let Some(expected) = expected {
            if expected != id {
                return Err(TransportError::Verification(format!(
                    "identity mismatch: expected {}, got {}",
                    expected.short(),
                    id.short()
                )));
            }
        }

        Ok(VerifiedIdentity {
            peer: PeerInfo::new(id, announcement.address, announcement.transport),
            public_key,
        })
    }
}
