//! End-to-end tests for the pubsub routers: delivery, deduplication across
//! redundant paths, validation, and the gossip mesh.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use weft::messages::WireMessage;
use weft::{
    GossipSubConfig, Keypair, PeerId, PeerInfo, PubSub, PubSubConfig, Subscription, Switch,
    TopicValidator,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(15);
const SETTLE: Duration = Duration::from_millis(600);
const QUIET: Duration = Duration::from_millis(700);

fn any_addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

struct Node {
    switch: Switch,
    pubsub: PubSub,
    addr: SocketAddr,
}

async fn floodsub_node() -> Node {
    let keypair = Keypair::generate();
    let switch = Switch::new(keypair.clone());
    let pubsub = PubSub::floodsub(&switch, keypair, PubSubConfig::default());
    let addr = switch.listen(any_addr()).await.expect("listen failed");
    Node { switch, pubsub, addr }
}

async fn gossipsub_node() -> Node {
    let keypair = Keypair::generate();
    let switch = Switch::new(keypair.clone());
    let pubsub = PubSub::gossipsub(
        &switch,
        keypair,
        PubSubConfig::default(),
        GossipSubConfig::default(),
    );
    let addr = switch.listen(any_addr()).await.expect("listen failed");
    Node { switch, pubsub, addr }
}

impl Node {
    fn info(&self) -> PeerInfo {
        PeerInfo::with_addr(self.switch.local_peer().clone(), self.addr)
    }

    async fn connect(&self, other: &Node) {
        self.switch.dial(&other.info()).await.expect("dial failed");
    }

    /// Waits until the router tracks `n` peers.
    async fn await_peers(&self, n: usize) {
        let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
        loop {
            let peers = self.pubsub.peers().await.expect("router stopped");
            if peers.len() >= n {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "router never saw {n} peers (has {})",
                peers.len()
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

async fn recv_one(sub: &mut Subscription) -> weft::PubSubMessage {
    timeout(TEST_TIMEOUT, sub.recv())
        .await
        .expect("receive timed out")
        .expect("subscription closed")
}

async fn assert_quiet(sub: &mut Subscription) {
    assert!(
        timeout(QUIET, sub.recv()).await.is_err(),
        "unexpected extra delivery"
    );
}

// =============================================================================
// Test: floodsub publish A → B
// =============================================================================

#[tokio::test]
async fn floodsub_delivers_to_subscriber() {
    let node_a = floodsub_node().await;
    let node_b = floodsub_node().await;

    let mut sub_b = node_b.pubsub.subscribe("foobar").await.unwrap();
    node_b.connect(&node_a).await;
    node_a.await_peers(1).await;
    node_b.await_peers(1).await;
    tokio::time::sleep(SETTLE).await;

    let written = node_a
        .pubsub
        .publish("foobar", b"Hello!".to_vec())
        .await
        .unwrap();
    assert_eq!(written, 1);

    let msg = recv_one(&mut sub_b).await;
    assert_eq!(msg.data, b"Hello!");
    assert_eq!(msg.topic, "foobar");
    assert_eq!(&msg.from, node_a.pubsub.local_peer());

    node_a.switch.close().await;
    node_b.switch.close().await;
}

// =============================================================================
// Test: redundant paths deliver exactly once
// =============================================================================

#[tokio::test]
async fn floodsub_dedups_across_redundant_paths() {
    let node_a = floodsub_node().await;
    let node_b = floodsub_node().await;
    let node_c = floodsub_node().await;

    // Full triangle: B hears every message directly from A and forwarded
    // through C.
    let mut sub_b = node_b.pubsub.subscribe("dedup").await.unwrap();
    let mut sub_c = node_c.pubsub.subscribe("dedup").await.unwrap();
    node_b.connect(&node_a).await;
    node_c.connect(&node_a).await;
    node_c.connect(&node_b).await;
    node_a.await_peers(2).await;
    node_b.await_peers(2).await;
    node_c.await_peers(2).await;
    tokio::time::sleep(SETTLE).await;

    let written = node_a
        .pubsub
        .publish("dedup", b"once only".to_vec())
        .await
        .unwrap();
    assert_eq!(written, 2);

    let msg_b = recv_one(&mut sub_b).await;
    assert_eq!(msg_b.data, b"once only");
    let msg_c = recv_one(&mut sub_c).await;
    assert_eq!(msg_c.data, b"once only");

    // The forwarded copies must be suppressed by the dedup caches.
    assert_quiet(&mut sub_b).await;
    assert_quiet(&mut sub_c).await;

    node_a.switch.close().await;
    node_b.switch.close().await;
    node_c.switch.close().await;
}

// =============================================================================
// Test: only subscribers receive
// =============================================================================

#[tokio::test]
async fn unsubscribed_topics_stay_silent() {
    let node_a = floodsub_node().await;
    let node_b = floodsub_node().await;

    let mut sub_other = node_b.pubsub.subscribe("other").await.unwrap();
    node_b.connect(&node_a).await;
    node_a.await_peers(1).await;
    tokio::time::sleep(SETTLE).await;

    // B is not subscribed to "target": nothing is written, nothing arrives.
    let written = node_a
        .pubsub
        .publish("target", b"nobody".to_vec())
        .await
        .unwrap();
    assert_eq!(written, 0);
    assert_quiet(&mut sub_other).await;

    node_a.switch.close().await;
    node_b.switch.close().await;
}

// =============================================================================
// Test: trigger_self delivers locally
// =============================================================================

#[tokio::test]
async fn publisher_receives_its_own_message() {
    let node = floodsub_node().await;
    let mut sub = node.pubsub.subscribe("self").await.unwrap();

    node.pubsub.publish("self", b"loopback".to_vec()).await.unwrap();
    let msg = recv_one(&mut sub).await;
    assert_eq!(msg.data, b"loopback");
    assert_eq!(&msg.from, node.pubsub.local_peer());

    node.switch.close().await;
}

// =============================================================================
// Test: validators gate acceptance
// =============================================================================

struct NoSpam;

#[async_trait]
impl TopicValidator for NoSpam {
    async fn validate(&self, _from: &PeerId, message: &WireMessage) -> bool {
        message.data != b"spam"
    }
}

#[tokio::test]
async fn validators_drop_rejected_messages() {
    let node_a = floodsub_node().await;
    let node_b = floodsub_node().await;

    let mut sub_b = node_b.pubsub.subscribe("guarded").await.unwrap();
    node_b.pubsub.add_validator("guarded", Arc::new(NoSpam)).await.unwrap();
    node_b.connect(&node_a).await;
    node_a.await_peers(1).await;
    tokio::time::sleep(SETTLE).await;

    node_a.pubsub.publish("guarded", b"spam".to_vec()).await.unwrap();
    node_a.pubsub.publish("guarded", b"ham".to_vec()).await.unwrap();

    // Only the accepted message comes through.
    let msg = recv_one(&mut sub_b).await;
    assert_eq!(msg.data, b"ham");
    assert_quiet(&mut sub_b).await;

    node_a.switch.close().await;
    node_b.switch.close().await;
}

// =============================================================================
// Test: unsubscribe stops delivery
// =============================================================================

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let node_a = floodsub_node().await;
    let node_b = floodsub_node().await;

    let mut sub_b = node_b.pubsub.subscribe("transient").await.unwrap();
    node_b.connect(&node_a).await;
    node_a.await_peers(1).await;
    tokio::time::sleep(SETTLE).await;

    node_b.pubsub.unsubscribe("transient").await.unwrap();
    tokio::time::sleep(SETTLE).await;

    let written = node_a
        .pubsub
        .publish("transient", b"late".to_vec())
        .await
        .unwrap();
    assert_eq!(written, 0);

    // The subscription channel was closed by the unsubscribe.
    assert!(
        timeout(TEST_TIMEOUT, sub_b.recv())
            .await
            .expect("recv timed out")
            .is_none()
    );

    node_a.switch.close().await;
    node_b.switch.close().await;
}

// =============================================================================
// Test: gossipsub mesh delivery
// =============================================================================

#[tokio::test]
async fn gossipsub_delivers_through_the_mesh() {
    let node_a = gossipsub_node().await;
    let node_b = gossipsub_node().await;
    let node_c = gossipsub_node().await;

    let mut sub_b = node_b.pubsub.subscribe("mesh-topic").await.unwrap();
    let mut sub_c = node_c.pubsub.subscribe("mesh-topic").await.unwrap();
    node_b.connect(&node_a).await;
    node_c.connect(&node_a).await;
    node_c.connect(&node_b).await;
    node_a.await_peers(2).await;
    node_b.await_peers(2).await;
    node_c.await_peers(2).await;
    // Let subscriptions propagate and a heartbeat or two build the mesh.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let written = node_a
        .pubsub
        .publish("mesh-topic", b"over the mesh".to_vec())
        .await
        .unwrap();
    assert!(written >= 1, "publisher found no mesh or fanout peers");

    let msg_b = recv_one(&mut sub_b).await;
    assert_eq!(msg_b.data, b"over the mesh");
    let msg_c = recv_one(&mut sub_c).await;
    assert_eq!(msg_c.data, b"over the mesh");

    assert_quiet(&mut sub_b).await;
    assert_quiet(&mut sub_c).await;

    node_a.switch.close().await;
    node_b.switch.close().await;
    node_c.switch.close().await;
}
