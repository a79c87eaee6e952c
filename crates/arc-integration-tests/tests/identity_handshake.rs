//! Integration test: identity announcements gate the routing table.
//!
//! 1. A valid announcement over a raw link inserts the peer
//! 2. A tampered announcement closes the link; the peer never appears
//! 3. A node expecting a different identity drops the link

use arc_crypto::ed25519::KeyPair;
use arc_integration_tests::{link, TestNode, QUIET, SETTLE};
use arc_transport::{IdentityAnnouncement, LinkStream, MessageType};
use arc_types::{NodeId, TransportKind};

fn announcement(keypair: &KeyPair) -> arc_transport::Message {
    IdentityAnnouncement::new(keypair, "10.1.2.3:11000", TransportKind::Tcp)
        .to_message(keypair)
        .expect("announcement")
}

#[tokio::test]
async fn test_valid_announcement_accepted() {
    let node = TestNode::spawn(Default::default()).await.expect("node");
    let (left, mut raw) = LinkStream::memory_pair(64 * 1024);
    node.hub.attach(left, None).await.expect("attach");

    // The node speaks first with its own announcement.
    let hello = raw.read_message(64 * 1024).await.expect("read");
    assert_eq!(hello.msg_type, MessageType::Control);
    let verified = IdentityAnnouncement::verify(&hello, Some(node.id)).expect("verify");
    assert_eq!(verified.peer.id, node.id);

    let client = KeyPair::generate();
    raw.write_message(&announcement(&client)).await.expect("write");
    assert_eq!(node.wait_for_peers(1).await, 1);

    let conns = node.hub.connections().await.expect("connections");
    let peer = conns[0].peer.as_ref().expect("identified");
    assert_eq!(peer.id, NodeId::from_bytes(client.node_id()));
    assert_eq!(peer.address, "10.1.2.3:11000");
}

#[tokio::test]
async fn test_tampered_announcement_rejected() {
    // =========================================================
    // Step 1: Attach a raw link
    // =========================================================
    let node = TestNode::spawn(Default::default()).await.expect("node");
    let (left, mut raw) = LinkStream::memory_pair(64 * 1024);
    let mut conn = node.hub.attach(left, None).await.expect("attach");

    // =========================================================
    // Step 2: Send an announcement whose body no longer matches
    // =========================================================
    let client = KeyPair::generate();
    let mut hello = announcement(&client);
    if let Some(last) = hello.body.last_mut() {
        *last ^= 0x01;
    }
    raw.write_message(&hello).await.expect("write");

    // =========================================================
    // Step 3: Link closed, peer never inserted
    // =========================================================
    tokio::time::timeout(SETTLE, conn.closed())
        .await
        .expect("link should close");
    tokio::time::sleep(QUIET).await;
    let stats = node.router.stats().await.expect("stats");
    assert_eq!(stats.peers, 0, "tampered peer must not be inserted");
    assert!(node.hub.connections().await.expect("connections").is_empty());
}

#[tokio::test]
async fn test_identity_mismatch_rejected() {
    let nodes = TestNode::spawn_many(3).await.expect("nodes");
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);

    // A dials B but expects C.
    let (left, right) = LinkStream::memory_pair(64 * 1024);
    let mut at_a = a.hub.attach(left, Some(c.id)).await.expect("attach");
    b.hub.attach(right, None).await.expect("attach");

    tokio::time::timeout(SETTLE, at_a.closed())
        .await
        .expect("A should drop the link");
    assert_eq!(a.wait_for_peers(0).await, 0);
    // B may identify A before the link drops, but loses it once it does.
    assert_eq!(b.wait_for_peers(0).await, 0);

    // The correct pairing still works.
    link(a, c).await.expect("link");
    assert_eq!(a.wait_for_peers(1).await, 1);
}
