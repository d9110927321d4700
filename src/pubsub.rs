//! # PubSub Router Core
//!
//! Routes application messages to every peer subscribed to a topic, with
//! deduplication, optional signing, and per-topic validation. The module
//! follows the actor pattern used across the crate: [`PubSub`] is a cheap
//! handle, the actor owns all state and processes commands sequentially.
//!
//! ## Per-peer plumbing
//!
//! Each known peer gets a lazily-opened send channel driven by its own task
//! (send failures or timeouts close the channel; the next send reopens it)
//! and a read loop fed by the switch's protocol dispatch. Two TTL-bounded
//! fingerprint caches per peer suppress duplicate RPCs in both directions,
//! and a router-wide seen-cache guarantees a message is delivered to local
//! handlers at most once.
//!
//! ## Receive path
//!
//! raw RPC → per-peer fingerprint dedup → decode → receive observers →
//! signature policy → concurrent validators (logical AND) → local delivery →
//! router forwarding → cache insert. A failure at any step drops the message
//! without affecting the stream.
//!
//! ## Variants
//!
//! The routing decision (who gets a published or forwarded message, what
//! control traffic means) is delegated to a [`Router`] state machine:
//! [`FloodRouter`] here, the mesh-based GossipSub router in
//! [`crate::gossipsub`].

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use lru::LruCache;
use prost::Message as _;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::identity::{Keypair, PeerId, PeerInfo, PublicKey};
use crate::messages::{ControlMessage, Rpc, SubOpts, WireMessage};
use crate::mplex::MplexChannel;
use crate::stream::{ByteStream, read_length_prefixed};
use crate::switch::{PeerEvents, ProtocolHandler, Switch};
use crate::varint::put_uvarint;

/// Protocol id of the flooding variant.
pub const FLOODSUB_PROTOCOL: &str = "/floodsub/1.0.0";

/// Hard cap on one encoded RPC.
pub const MAX_RPC_SIZE: usize = 64 * 1024;

/// Default per-send timeout; expiry recycles the send channel.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time-to-live for dedup fingerprints.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(120);

/// Bound on every fingerprint cache.
const DEDUP_CACHE_CAPACITY: usize = 8192;

/// Outbound queue per peer; full queues drop (publishing is best-effort).
const OUTBOUND_QUEUE_CAPACITY: usize = 64;

const COMMAND_CHANNEL_SIZE: usize = 256;

const SUBSCRIPTION_CHANNEL_SIZE: usize = 64;

/// Bound on topics tracked per remote peer.
const MAX_SUBSCRIPTIONS_PER_PEER: usize = 256;

/// Longest accepted topic name.
pub const MAX_TOPIC_LENGTH: usize = 256;

#[inline]
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= MAX_TOPIC_LENGTH
        && topic.chars().all(|c| c.is_ascii_graphic() || c == ' ')
}

/// SHA-256 fingerprint used for all dedup decisions.
pub(crate) fn fingerprint(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug)]
pub struct PubSubConfig {
    /// Attach the publisher's key and signature to outgoing messages.
    pub sign_messages: bool,
    /// Require and verify signatures on incoming messages; unsigned
    /// messages are dropped.
    pub verify_signatures: bool,
    /// Deliver our own publishes to local subscribers.
    pub trigger_self: bool,
    /// Per-send deadline before the send channel is recycled.
    pub send_timeout: Duration,
    /// TTL of dedup fingerprints.
    pub dedup_ttl: Duration,
    /// Largest accepted RPC.
    pub max_rpc_size: usize,
    /// Cadence of router heartbeats (ignored by routers that need none).
    pub heartbeat_interval: Duration,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            sign_messages: true,
            verify_signatures: true,
            trigger_self: true,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            dedup_ttl: DEFAULT_DEDUP_TTL,
            max_rpc_size: MAX_RPC_SIZE,
            heartbeat_interval: Duration::from_secs(1),
        }
    }
}

// ============================================================================
// Dedup cache
// ============================================================================

/// TTL-bounded fingerprint set backed by an LRU cache.
pub(crate) struct DedupCache {
    entries: LruCache<[u8; 32], Instant>,
    ttl: Duration,
}

impl DedupCache {
    pub(crate) fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: LruCache::new(
                NonZeroUsize::new(capacity).expect("cache capacity must be non-zero"),
            ),
            ttl,
        }
    }

    /// Whether `id` was inserted within the TTL. Expired entries are evicted.
    pub(crate) fn contains_fresh(&mut self, id: &[u8; 32]) -> bool {
        match self.entries.get(id) {
            Some(at) if at.elapsed() < self.ttl => true,
            Some(_) => {
                self.entries.pop(id);
                false
            }
            None => false,
        }
    }

    pub(crate) fn insert(&mut self, id: [u8; 32]) {
        self.entries.put(id, Instant::now());
    }
}

// ============================================================================
// Public surface
// ============================================================================

/// A message delivered to a local subscriber.
#[derive(Clone, Debug)]
pub struct PubSubMessage {
    pub from: PeerId,
    pub data: Vec<u8>,
    pub seqno: u64,
    pub topic: String,
}

/// Receiving end of one `subscribe` call.
pub struct Subscription {
    topic: String,
    rx: mpsc::Receiver<PubSubMessage>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next message on this subscription; `None` after unsubscribe or
    /// router shutdown.
    pub async fn recv(&mut self) -> Option<PubSubMessage> {
        self.rx.recv().await
    }
}

/// Async boolean predicate gating message acceptance for a topic.
#[async_trait]
pub trait TopicValidator: Send + Sync + 'static {
    async fn validate(&self, from: &PeerId, message: &WireMessage) -> bool;
}

/// Transform hook applied to messages entering or leaving the router.
/// Returning `None` drops the message.
pub trait MessageObserver: Send + Sync + 'static {
    fn observe(&self, message: WireMessage) -> Option<WireMessage>;
}

// ============================================================================
// Router abstraction
// ============================================================================

/// Read-only view of shared router state plus the seen-cache, handed to the
/// routing state machine on every decision.
pub(crate) struct RouterCtx<'a> {
    pub peer_topics: &'a HashMap<PeerId, HashSet<String>>,
    pub local_topics: &'a HashSet<String>,
    pub seen: &'a mut DedupCache,
}

/// The pluggable routing state machine. Pure state transitions: any RPCs a
/// hook wants sent come back as `(peer, rpc)` actions for the actor to
/// perform.
pub(crate) trait Router: Send + Sync + 'static {
    fn protocol(&self) -> &'static str;

    fn needs_heartbeat(&self) -> bool {
        false
    }

    fn on_peer_joined(&mut self, _peer: &PeerId) {}

    fn on_peer_left(&mut self, _peer: &PeerId) {}

    fn on_local_subscribe(&mut self, _ctx: &mut RouterCtx<'_>, _topic: &str) -> Vec<(PeerId, Rpc)> {
        Vec::new()
    }

    fn on_local_unsubscribe(
        &mut self,
        _ctx: &mut RouterCtx<'_>,
        _topic: &str,
    ) -> Vec<(PeerId, Rpc)> {
        Vec::new()
    }

    /// Peers a locally published message on `topic` goes to.
    fn publish_targets(&mut self, ctx: &mut RouterCtx<'_>, topic: &str) -> Vec<PeerId>;

    /// Peers an accepted remote message is forwarded to. The actor already
    /// excludes the origin and the peer it arrived from.
    fn forward_targets(
        &mut self,
        ctx: &mut RouterCtx<'_>,
        message: &WireMessage,
    ) -> Vec<PeerId>;

    fn on_control(
        &mut self,
        _ctx: &mut RouterCtx<'_>,
        _from: &PeerId,
        _control: &ControlMessage,
    ) -> Vec<(PeerId, Rpc)> {
        Vec::new()
    }

    /// An accepted message was stored under `id`.
    fn on_message_stored(&mut self, _id: &[u8; 32], _message: &WireMessage) {}

    fn on_heartbeat(&mut self, _ctx: &mut RouterCtx<'_>) -> Vec<(PeerId, Rpc)> {
        Vec::new()
    }
}

/// FloodSub: every accepted message goes to every peer subscribed to one of
/// its topics.
#[derive(Default)]
pub(crate) struct FloodRouter;

impl Router for FloodRouter {
    fn protocol(&self) -> &'static str {
        FLOODSUB_PROTOCOL
    }

    fn publish_targets(&mut self, ctx: &mut RouterCtx<'_>, topic: &str) -> Vec<PeerId> {
        ctx.peer_topics
            .iter()
            .filter(|(_, topics)| topics.contains(topic))
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    fn forward_targets(
        &mut self,
        ctx: &mut RouterCtx<'_>,
        message: &WireMessage,
    ) -> Vec<PeerId> {
        ctx.peer_topics
            .iter()
            .filter(|(_, topics)| message.topic_ids.iter().any(|t| topics.contains(t)))
            .map(|(peer, _)| peer.clone())
            .collect()
    }
}

// ============================================================================
// Handle
// ============================================================================

enum Command {
    Subscribe {
        topic: String,
        reply: oneshot::Sender<Subscription>,
    },
    Unsubscribe {
        topic: String,
    },
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: oneshot::Sender<usize>,
    },
    AddValidator {
        topic: String,
        validator: Arc<dyn TopicValidator>,
    },
    AddReceiveObserver(Arc<dyn MessageObserver>),
    AddSendObserver(Arc<dyn MessageObserver>),
    PeerJoined {
        peer: PeerId,
    },
    PeerLeft {
        peer: PeerId,
    },
    InboundRpc {
        peer: PeerId,
        raw: Vec<u8>,
        rpc: Rpc,
    },
    Topics {
        reply: oneshot::Sender<Vec<String>>,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    Quit,
}

/// Handle to a running pubsub router. Cheap to clone.
#[derive(Clone)]
pub struct PubSub {
    cmd_tx: mpsc::Sender<Command>,
    local_peer: PeerId,
}

impl PubSub {
    /// Spawns a FloodSub router on `switch`.
    pub fn floodsub(switch: &Switch, keypair: Keypair, config: PubSubConfig) -> PubSub {
        Self::spawn(switch, keypair, config, Box::new(FloodRouter))
    }

    pub(crate) fn spawn(
        switch: &Switch,
        keypair: Keypair,
        config: PubSubConfig,
        router: Box<dyn Router>,
    ) -> PubSub {
        let local_peer = keypair.peer_id();
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);

        switch.add_handler(
            router.protocol(),
            Arc::new(IncomingStreams {
                cmd_tx: cmd_tx.clone(),
                max_rpc: config.max_rpc_size,
            }),
        );
        switch.add_peer_hook(Arc::new(PeerWatcher {
            cmd_tx: cmd_tx.clone(),
        }));

        // Pick up peers that connected before the router existed.
        {
            let switch = switch.clone();
            let tx = cmd_tx.clone();
            tokio::spawn(async move {
                for peer in switch.peers().await {
                    let _ = tx.send(Command::PeerJoined { peer }).await;
                }
            });
        }

        let dedup_ttl = config.dedup_ttl;
        let actor = PubSubActor {
            keypair,
            local_peer: local_peer.clone(),
            config,
            switch: switch.clone(),
            router,
            peers: HashMap::new(),
            peer_topics: HashMap::new(),
            topics: HashMap::new(),
            local_topics: HashSet::new(),
            seen: DedupCache::new(DEDUP_CACHE_CAPACITY, dedup_ttl),
            rx_observers: Vec::new(),
            tx_observers: Vec::new(),
            seqno: rand::random(),
        };
        tokio::spawn(actor.run(cmd_rx));

        PubSub { cmd_tx, local_peer }
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    /// Adds a local subscription; the subscription RPC is propagated to
    /// every known peer.
    pub async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        if !is_valid_topic(topic) {
            bail!("invalid topic name");
        }
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Subscribe {
                topic: topic.to_string(),
                reply,
            })
            .await
            .context("pubsub router stopped")?;
        rx.await.context("pubsub router stopped")
    }

    /// Drops every local subscription for `topic` and informs all peers.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.cmd_tx
            .send(Command::Unsubscribe {
                topic: topic.to_string(),
            })
            .await
            .context("pubsub router stopped")
    }

    /// Publishes `data` on `topic`; returns how many peers were written to.
    pub async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<usize> {
        if !is_valid_topic(topic) {
            bail!("invalid topic name");
        }
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Publish {
                topic: topic.to_string(),
                data,
                reply,
            })
            .await
            .context("pubsub router stopped")?;
        rx.await.context("pubsub router stopped")
    }

    /// Registers a validator for `topic`; messages failing any validator on
    /// any of their topics are dropped.
    pub async fn add_validator(
        &self,
        topic: &str,
        validator: Arc<dyn TopicValidator>,
    ) -> Result<()> {
        self.cmd_tx
            .send(Command::AddValidator {
                topic: topic.to_string(),
                validator,
            })
            .await
            .context("pubsub router stopped")
    }

    /// Registers an observer applied to incoming messages, before
    /// validation. Observers chain in registration order.
    pub async fn add_receive_observer(&self, observer: Arc<dyn MessageObserver>) -> Result<()> {
        self.cmd_tx
            .send(Command::AddReceiveObserver(observer))
            .await
            .context("pubsub router stopped")
    }

    /// Registers an observer applied to outgoing published messages.
    pub async fn add_send_observer(&self, observer: Arc<dyn MessageObserver>) -> Result<()> {
        self.cmd_tx
            .send(Command::AddSendObserver(observer))
            .await
            .context("pubsub router stopped")
    }

    /// Topics with at least one local subscriber.
    pub async fn topics(&self) -> Result<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Topics { reply })
            .await
            .context("pubsub router stopped")?;
        rx.await.context("pubsub router stopped")
    }

    /// Peers the router currently tracks.
    pub async fn peers(&self) -> Result<Vec<PeerId>> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Peers { reply })
            .await
            .context("pubsub router stopped")?;
        rx.await.context("pubsub router stopped")
    }

    /// Stops the router.
    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// Switch integration
// ============================================================================

/// Per-channel read loop feeding inbound RPCs into the actor.
struct IncomingStreams {
    cmd_tx: mpsc::Sender<Command>,
    max_rpc: usize,
}

#[async_trait]
impl ProtocolHandler for IncomingStreams {
    async fn handle(&self, channel: MplexChannel, _protocol: String) {
        let peer = channel.remote_peer().clone();
        let mut channel = channel;
        loop {
            match read_length_prefixed(&mut channel, self.max_rpc).await {
                Ok(Some(bytes)) => {
                    let rpc = match Rpc::decode(&bytes[..]) {
                        Ok(rpc) => rpc,
                        Err(e) => {
                            debug!(%peer, error = %e, "undecodable rpc, dropping stream");
                            break;
                        }
                    };
                    let cmd = Command::InboundRpc {
                        peer: peer.clone(),
                        raw: bytes,
                        rpc,
                    };
                    if self.cmd_tx.send(cmd).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    trace!(%peer, error = %e, "pubsub stream ended");
                    break;
                }
            }
        }
        let _ = channel.close_channel().await;
    }
}

struct PeerWatcher {
    cmd_tx: mpsc::Sender<Command>,
}

#[async_trait]
impl PeerEvents for PeerWatcher {
    async fn joined(&self, peer: &PeerId) {
        let _ = self
            .cmd_tx
            .send(Command::PeerJoined { peer: peer.clone() })
            .await;
    }

    async fn left(&self, peer: &PeerId) {
        let _ = self
            .cmd_tx
            .send(Command::PeerLeft { peer: peer.clone() })
            .await;
    }
}

// ============================================================================
// Actor
// ============================================================================

struct TopicState {
    subscribers: Vec<mpsc::Sender<PubSubMessage>>,
    validators: Vec<Arc<dyn TopicValidator>>,
}

impl Default for TopicState {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
            validators: Vec::new(),
        }
    }
}

struct PeerState {
    outbound: mpsc::Sender<Vec<u8>>,
    sent_cache: DedupCache,
    recv_cache: DedupCache,
}

struct PubSubActor {
    keypair: Keypair,
    local_peer: PeerId,
    config: PubSubConfig,
    switch: Switch,
    router: Box<dyn Router>,
    peers: HashMap<PeerId, PeerState>,
    peer_topics: HashMap<PeerId, HashSet<String>>,
    topics: HashMap<String, TopicState>,
    local_topics: HashSet<String>,
    seen: DedupCache,
    rx_observers: Vec<Arc<dyn MessageObserver>>,
    tx_observers: Vec<Arc<dyn MessageObserver>>,
    seqno: u64,
}

impl PubSubActor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let use_heartbeat = self.router.needs_heartbeat();
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    None | Some(Command::Quit) => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                _ = heartbeat.tick(), if use_heartbeat => self.heartbeat(),
            }
        }
        debug!(peer = %self.local_peer, "pubsub router stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Subscribe { topic, reply } => {
                let subscription = self.subscribe(topic);
                let _ = reply.send(subscription);
            }
            Command::Unsubscribe { topic } => self.unsubscribe(&topic),
            Command::Publish { topic, data, reply } => {
                let count = self.publish(topic, data);
                let _ = reply.send(count);
            }
            Command::AddValidator { topic, validator } => {
                self.topics.entry(topic).or_default().validators.push(validator);
            }
            Command::AddReceiveObserver(observer) => self.rx_observers.push(observer),
            Command::AddSendObserver(observer) => self.tx_observers.push(observer),
            Command::PeerJoined { peer } => self.peer_joined(peer),
            Command::PeerLeft { peer } => self.peer_left(&peer),
            Command::InboundRpc { peer, raw, rpc } => self.inbound_rpc(peer, raw, rpc).await,
            Command::Topics { reply } => {
                let _ = reply.send(self.local_topics.iter().cloned().collect());
            }
            Command::Peers { reply } => {
                let _ = reply.send(self.peers.keys().cloned().collect());
            }
            Command::Quit => unreachable!("handled by the run loop"),
        }
    }

    // ------------------------------------------------------------------
    // Peer lifecycle
    // ------------------------------------------------------------------

    fn peer_joined(&mut self, peer: PeerId) {
        if self.peers.contains_key(&peer) {
            return;
        }
        debug!(%peer, "pubsub peer joined");
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        tokio::spawn(peer_send_loop(
            self.switch.clone(),
            peer.clone(),
            self.router.protocol(),
            rx,
            self.config.send_timeout,
        ));
        self.peers.insert(
            peer.clone(),
            PeerState {
                outbound: tx,
                sent_cache: DedupCache::new(DEDUP_CACHE_CAPACITY, self.config.dedup_ttl),
                recv_cache: DedupCache::new(DEDUP_CACHE_CAPACITY, self.config.dedup_ttl),
            },
        );
        self.peer_topics.insert(peer.clone(), HashSet::new());
        self.router.on_peer_joined(&peer);

        // Hello packet: announce our current subscriptions.
        if !self.local_topics.is_empty() {
            let rpc = Rpc {
                subscriptions: self
                    .local_topics
                    .iter()
                    .map(|topic| SubOpts {
                        subscribe: true,
                        topic_id: topic.clone(),
                    })
                    .collect(),
                publish: Vec::new(),
                control: None,
            };
            self.send_rpc(&peer, &rpc);
        }
    }

    fn peer_left(&mut self, peer: &PeerId) {
        if self.peers.remove(peer).is_none() {
            return;
        }
        debug!(%peer, "pubsub peer left");
        self.peer_topics.remove(peer);
        self.router.on_peer_left(peer);
    }

    // ------------------------------------------------------------------
    // Local operations
    // ------------------------------------------------------------------

    fn subscribe(&mut self, topic: String) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CHANNEL_SIZE);
        let first = !self.local_topics.contains(&topic);
        self.topics.entry(topic.clone()).or_default().subscribers.push(tx);
        self.local_topics.insert(topic.clone());

        if first {
            let rpc = Rpc {
                subscriptions: vec![SubOpts {
                    subscribe: true,
                    topic_id: topic.clone(),
                }],
                publish: Vec::new(),
                control: None,
            };
            let peers: Vec<PeerId> = self.peers.keys().cloned().collect();
            for peer in peers {
                self.send_rpc(&peer, &rpc);
            }
            let actions = {
                let mut ctx = RouterCtx {
                    peer_topics: &self.peer_topics,
                    local_topics: &self.local_topics,
                    seen: &mut self.seen,
                };
                self.router.on_local_subscribe(&mut ctx, &topic)
            };
            self.apply_actions(actions);
        }

        Subscription { topic, rx }
    }

    fn unsubscribe(&mut self, topic: &str) {
        if !self.local_topics.remove(topic) {
            return;
        }
        let drop_topic = match self.topics.get_mut(topic) {
            Some(state) => {
                state.subscribers.clear();
                state.validators.is_empty()
            }
            None => false,
        };
        if drop_topic {
            self.topics.remove(topic);
        }
        let rpc = Rpc {
            subscriptions: vec![SubOpts {
                subscribe: false,
                topic_id: topic.to_string(),
            }],
            publish: Vec::new(),
            control: None,
        };
        let peers: Vec<PeerId> = self.peers.keys().cloned().collect();
        for peer in peers {
            self.send_rpc(&peer, &rpc);
        }
        let actions = {
            let mut ctx = RouterCtx {
                peer_topics: &self.peer_topics,
                local_topics: &self.local_topics,
                seen: &mut self.seen,
            };
            self.router.on_local_unsubscribe(&mut ctx, topic)
        };
        self.apply_actions(actions);
    }

    fn publish(&mut self, topic: String, data: Vec<u8>) -> usize {
        self.seqno = self.seqno.wrapping_add(1);
        let mut message = WireMessage {
            from: self.local_peer.to_bytes(),
            data,
            seqno: self.seqno,
            topic_ids: vec![topic.clone()],
            signature: None,
            key: None,
        };
        if self.config.sign_messages {
            let signable = message.signable_encoding();
            message.signature = Some(self.keypair.sign(&signable));
            message.key = Some(self.keypair.public().to_protobuf_encoding());
        }

        let msg_id = fingerprint(&message.encode_to_vec());
        // Our own message echoed back must not be re-delivered.
        self.seen.insert(msg_id);
        self.router.on_message_stored(&msg_id, &message);

        if self.config.trigger_self && self.local_topics.contains(&topic) {
            self.deliver_local(&message);
        }

        let Some(message) = apply_observer_chain(&self.tx_observers, message) else {
            return 0;
        };

        let targets = {
            let mut ctx = RouterCtx {
                peer_topics: &self.peer_topics,
                local_topics: &self.local_topics,
                seen: &mut self.seen,
            };
            self.router.publish_targets(&mut ctx, &topic)
        };
        let rpc = Rpc {
            subscriptions: Vec::new(),
            publish: vec![message],
            control: None,
        };
        let mut count = 0;
        for peer in targets {
            if peer == self.local_peer {
                continue;
            }
            if self.send_rpc(&peer, &rpc) {
                count += 1;
            }
        }
        trace!(%topic, count, "published");
        count
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    async fn inbound_rpc(&mut self, peer: PeerId, raw: Vec<u8>, rpc: Rpc) {
        // An inbound stream can beat the peer-joined event.
        self.peer_joined(peer.clone());

        let fp = fingerprint(&raw);
        if let Some(state) = self.peers.get_mut(&peer)
            && state.recv_cache.contains_fresh(&fp)
        {
            trace!(%peer, "duplicate rpc skipped");
            return;
        }

        for sub in &rpc.subscriptions {
            let Some(topics) = self.peer_topics.get_mut(&peer) else {
                break;
            };
            if sub.subscribe {
                if topics.len() < MAX_SUBSCRIPTIONS_PER_PEER {
                    topics.insert(sub.topic_id.clone());
                }
            } else {
                topics.remove(&sub.topic_id);
            }
        }

        if let Some(control) = &rpc.control {
            let actions = {
                let mut ctx = RouterCtx {
                    peer_topics: &self.peer_topics,
                    local_topics: &self.local_topics,
                    seen: &mut self.seen,
                };
                self.router.on_control(&mut ctx, &peer, control)
            };
            self.apply_actions(actions);
        }

        for message in rpc.publish {
            self.incoming_message(&peer, message).await;
        }

        if let Some(state) = self.peers.get_mut(&peer) {
            state.recv_cache.insert(fp);
        }
    }

    async fn incoming_message(&mut self, from_peer: &PeerId, message: WireMessage) {
        let Some(message) = apply_observer_chain(&self.rx_observers, message) else {
            trace!("receive observer dropped message");
            return;
        };

        let msg_id = fingerprint(&message.encode_to_vec());
        if self.seen.contains_fresh(&msg_id) {
            trace!("already seen message skipped");
            return;
        }

        let Ok(origin) = PeerId::from_bytes(&message.from) else {
            debug!(%from_peer, "message with unparseable source dropped");
            return;
        };

        if self.config.verify_signatures {
            let (Some(signature), Some(key_bytes)) = (&message.signature, &message.key) else {
                debug!(%from_peer, "unsigned message dropped");
                return;
            };
            let Ok(key) = PublicKey::from_protobuf_encoding(key_bytes) else {
                debug!(%from_peer, "message with invalid key dropped");
                return;
            };
            if !origin.matches_public_key(&key) {
                debug!(%from_peer, "message key does not match its source, dropped");
                return;
            }
            if key.verify(&message.signable_encoding(), signature).is_err() {
                debug!(%from_peer, "message signature invalid, dropped");
                return;
            }
        }

        if !self.run_validators(&origin, &message).await {
            debug!(%from_peer, "message rejected by validators");
            return;
        }

        self.seen.insert(msg_id);
        self.router.on_message_stored(&msg_id, &message);
        self.deliver_local(&message);

        let targets = {
            let mut ctx = RouterCtx {
                peer_topics: &self.peer_topics,
                local_topics: &self.local_topics,
                seen: &mut self.seen,
            };
            self.router.forward_targets(&mut ctx, &message)
        };
        if targets.is_empty() {
            return;
        }
        let rpc = Rpc {
            subscriptions: Vec::new(),
            publish: vec![message],
            control: None,
        };
        for peer in targets {
            if peer != *from_peer && peer != origin {
                self.send_rpc(&peer, &rpc);
            }
        }
    }

    /// Runs every validator registered for any of the message's topics
    /// concurrently; acceptance is their logical AND. A panicking validator
    /// counts as rejection.
    async fn run_validators(&self, origin: &PeerId, message: &WireMessage) -> bool {
        let mut validators = Vec::new();
        for topic in &message.topic_ids {
            if let Some(state) = self.topics.get(topic) {
                validators.extend(state.validators.iter().cloned());
            }
        }
        if validators.is_empty() {
            return true;
        }
        let message = Arc::new(message.clone());
        let mut set = tokio::task::JoinSet::new();
        for validator in validators {
            let message = message.clone();
            let origin = origin.clone();
            set.spawn(async move { validator.validate(&origin, &message).await });
        }
        while let Some(result) = set.join_next().await {
            match result {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    set.abort_all();
                    return false;
                }
            }
        }
        true
    }

    fn deliver_local(&mut self, message: &WireMessage) {
        let Ok(from) = PeerId::from_bytes(&message.from) else {
            return;
        };
        for topic in &message.topic_ids {
            if !self.local_topics.contains(topic) {
                continue;
            }
            let Some(state) = self.topics.get_mut(topic) else {
                continue;
            };
            let delivery = PubSubMessage {
                from: from.clone(),
                data: message.data.clone(),
                seqno: message.seqno,
                topic: topic.clone(),
            };
            state.subscribers.retain(|tx| match tx.try_send(delivery.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(%topic, "subscriber lagging, message dropped");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    fn heartbeat(&mut self) {
        let actions = {
            let mut ctx = RouterCtx {
                peer_topics: &self.peer_topics,
                local_topics: &self.local_topics,
                seen: &mut self.seen,
            };
            self.router.on_heartbeat(&mut ctx)
        };
        self.apply_actions(actions);
    }

    fn apply_actions(&mut self, actions: Vec<(PeerId, Rpc)>) {
        for (peer, rpc) in actions {
            self.send_rpc(&peer, &rpc);
        }
    }

    /// Queues one RPC for `peer`. Message-bearing RPCs are skipped when the
    /// identical bytes were sent within the dedup TTL. Returns whether the
    /// RPC was accepted by the peer's queue.
    fn send_rpc(&mut self, peer: &PeerId, rpc: &Rpc) -> bool {
        let bytes = rpc.encode_to_vec();
        if bytes.len() > self.config.max_rpc_size {
            warn!(size = bytes.len(), "rpc exceeds size limit, not sent");
            return false;
        }
        let Some(state) = self.peers.get_mut(peer) else {
            return false;
        };
        let fp = fingerprint(&bytes);
        if !rpc.publish.is_empty() && state.sent_cache.contains_fresh(&fp) {
            trace!(%peer, "suppressed duplicate send");
            return false;
        }
        match state.outbound.try_send(bytes) {
            Ok(()) => {
                if !rpc.publish.is_empty() {
                    state.sent_cache.insert(fp);
                }
                true
            }
            Err(_) => {
                debug!(%peer, "outbound queue unavailable, rpc dropped");
                false
            }
        }
    }
}

/// Owns one peer's send channel: opens it lazily, recycles it on failure or
/// timeout, and closes it when the peer goes away.
async fn peer_send_loop(
    switch: Switch,
    peer: PeerId,
    protocol: &'static str,
    mut rx: mpsc::Receiver<Vec<u8>>,
    send_timeout: Duration,
) {
    let mut channel: Option<MplexChannel> = None;
    while let Some(bytes) = rx.recv().await {
        if channel.as_ref().is_none_or(|ch| ch.is_closed() || ch.at_eof()) {
            let info = PeerInfo::new(peer.clone());
            match switch.dial_protocol(&info, &[protocol]).await {
                Ok((ch, _)) => channel = Some(ch),
                Err(e) => {
                    debug!(%peer, error = %e, "pubsub send channel unavailable");
                    continue;
                }
            }
        }
        let Some(ch) = channel.as_ref() else { continue };

        let mut framed = Vec::with_capacity(bytes.len() + 8);
        put_uvarint(&mut framed, bytes.len() as u64);
        framed.extend_from_slice(&bytes);

        match timeout(send_timeout, ch.write_bytes(&framed)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(%peer, error = %e, "pubsub send failed, recycling channel");
                if let Some(ch) = channel.take() {
                    ch.reset().await;
                }
            }
            Err(_) => {
                debug!(%peer, "pubsub send timed out, recycling channel");
                if let Some(ch) = channel.take() {
                    ch.reset().await;
                }
            }
        }
    }
    if let Some(ch) = channel {
        let _ = ch.close_channel().await;
    }
}

fn apply_observer_chain(
    observers: &[Arc<dyn MessageObserver>],
    message: WireMessage,
) -> Option<WireMessage> {
    let mut current = message;
    for observer in observers {
        current = observer.observe(current)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerId {
        Keypair::from_secret_bytes(&[n; 32]).peer_id()
    }

    #[test]
    fn fingerprints_are_stable_and_distinct() {
        assert_eq!(fingerprint(b"abc"), fingerprint(b"abc"));
        assert_ne!(fingerprint(b"abc"), fingerprint(b"abd"));
    }

    #[test]
    fn dedup_cache_expires_entries() {
        let mut cache = DedupCache::new(16, Duration::from_millis(30));
        let id = fingerprint(b"msg");
        assert!(!cache.contains_fresh(&id));
        cache.insert(id);
        assert!(cache.contains_fresh(&id));
        std::thread::sleep(Duration::from_millis(50));
        assert!(!cache.contains_fresh(&id));
    }

    #[test]
    fn dedup_cache_is_bounded() {
        let mut cache = DedupCache::new(4, Duration::from_secs(60));
        for i in 0..10u8 {
            cache.insert(fingerprint(&[i]));
        }
        // Oldest entries were evicted by the LRU bound.
        assert!(!cache.contains_fresh(&fingerprint(&[0u8])));
        assert!(cache.contains_fresh(&fingerprint(&[9u8])));
    }

    #[test]
    fn topic_validity() {
        assert!(is_valid_topic("news"));
        assert!(is_valid_topic("a topic with spaces"));
        assert!(!is_valid_topic(""));
        assert!(!is_valid_topic(&"x".repeat(MAX_TOPIC_LENGTH + 1)));
        assert!(!is_valid_topic("bad\nnewline"));
    }

    #[test]
    fn message_signing_round_trip() {
        let keypair = Keypair::generate();
        let mut message = WireMessage {
            from: keypair.peer_id().to_bytes(),
            data: b"signed payload".to_vec(),
            seqno: 7,
            topic_ids: vec!["news".into()],
            signature: None,
            key: None,
        };
        let signable = message.signable_encoding();
        message.signature = Some(keypair.sign(&signable));
        message.key = Some(keypair.public().to_protobuf_encoding());

        let key = PublicKey::from_protobuf_encoding(message.key.as_ref().unwrap()).unwrap();
        assert!(keypair.peer_id().matches_public_key(&key));
        assert!(
            key.verify(
                &message.signable_encoding(),
                message.signature.as_ref().unwrap()
            )
            .is_ok()
        );

        // Tampering with the payload invalidates the signature.
        message.data = b"tampered".to_vec();
        assert!(
            key.verify(
                &message.signable_encoding(),
                message.signature.as_ref().unwrap()
            )
            .is_err()
        );
    }

    #[test]
    fn flood_router_targets_subscribed_peers_only() {
        let mut router = FloodRouter;
        let mut peer_topics = HashMap::new();
        peer_topics.insert(peer(1), HashSet::from(["news".to_string()]));
        peer_topics.insert(peer(2), HashSet::from(["weather".to_string()]));
        peer_topics.insert(
            peer(3),
            HashSet::from(["news".to_string(), "weather".to_string()]),
        );
        let local_topics = HashSet::new();
        let mut seen = DedupCache::new(16, Duration::from_secs(60));
        let mut ctx = RouterCtx {
            peer_topics: &peer_topics,
            local_topics: &local_topics,
            seen: &mut seen,
        };

        let mut targets = router.publish_targets(&mut ctx, "news");
        targets.sort();
        let mut expected = vec![peer(1), peer(3)];
        expected.sort();
        assert_eq!(targets, expected);

        let message = WireMessage {
            from: peer(9).to_bytes(),
            data: vec![],
            seqno: 1,
            topic_ids: vec!["weather".into()],
            signature: None,
            key: None,
        };
        let mut forwards = router.forward_targets(&mut ctx, &message);
        forwards.sort();
        let mut expected = vec![peer(2), peer(3)];
        expected.sort();
        assert_eq!(forwards, expected);
    }

    #[test]
    fn observer_chain_transforms_and_drops() {
        struct Upper;
        impl MessageObserver for Upper {
            fn observe(&self, mut message: WireMessage) -> Option<WireMessage> {
                message.data.make_ascii_uppercase();
                Some(message)
            }
        }
        struct DropEmpty;
        impl MessageObserver for DropEmpty {
            fn observe(&self, message: WireMessage) -> Option<WireMessage> {
                if message.data.is_empty() { None } else { Some(message) }
            }
        }

        let observers: Vec<Arc<dyn MessageObserver>> = vec![Arc::new(Upper), Arc::new(DropEmpty)];
        let message = WireMessage {
            from: vec![],
            data: b"hello".to_vec(),
            seqno: 0,
            topic_ids: vec![],
            signature: None,
            key: None,
        };
        let transformed = apply_observer_chain(&observers, message).unwrap();
        assert_eq!(transformed.data, b"HELLO");

        let empty = WireMessage {
            from: vec![],
            data: vec![],
            seqno: 0,
            topic_ids: vec![],
            signature: None,
            key: None,
        };
        assert!(apply_observer_chain(&observers, empty).is_none());
    }
}
