//! # GossipSub Router
//!
//! The mesh-based pubsub variant. On top of the core router contracts
//! (per-peer send channels, dedup caches, validation, signing, all shared
//! with FloodSub in [`crate::pubsub`]), GossipSub maintains:
//!
//! - a **mesh** of peers per subscribed topic, kept between `mesh_n_low` and
//!   `mesh_n_high` members by graft/prune control messages,
//! - a **fanout** set per topic we publish to without subscribing, expiring
//!   after `fanout_ttl`,
//! - a windowed **message cache** feeding IHAVE gossip and answering IWANT
//!   requests.
//!
//! A heartbeat (default every second) repairs the mesh, refreshes fanout,
//! emits gossip to non-mesh peers, and shifts the cache window.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tracing::trace;

use crate::identity::{Keypair, PeerId};
use crate::messages::{
    ControlGraft, ControlIHave, ControlIWant, ControlMessage, ControlPrune, Rpc, WireMessage,
};
use crate::pubsub::{PubSub, PubSubConfig, Router, RouterCtx};
use crate::switch::Switch;

/// Protocol id of the mesh variant.
pub const GOSSIPSUB_PROTOCOL: &str = "/meshsub/1.0.0";

/// D, the target mesh size per topic.
pub const DEFAULT_MESH_N: usize = 6;

/// D_lo, the mesh size below which the heartbeat grafts new members.
pub const DEFAULT_MESH_N_LOW: usize = 5;

/// D_hi, the mesh size above which the heartbeat prunes down to D.
pub const DEFAULT_MESH_N_HIGH: usize = 12;

/// Number of non-mesh peers gossiped to per topic per heartbeat.
pub const DEFAULT_GOSSIP_LAZY: usize = 6;

/// Cache windows kept in total / advertised in gossip.
pub const DEFAULT_HISTORY_LENGTH: usize = 5;
pub const DEFAULT_HISTORY_GOSSIP: usize = 3;

/// Lifetime of a fanout set after the last publish to its topic.
pub const DEFAULT_FANOUT_TTL: Duration = Duration::from_secs(60);

/// How long a pruned peer stays out of the mesh.
pub const DEFAULT_PRUNE_BACKOFF: Duration = Duration::from_secs(60);

/// Bound on message ids per IHAVE/IWANT exchange.
pub const DEFAULT_MAX_IHAVE_LENGTH: usize = 100;

/// Bound on full messages served per IWANT.
const MAX_IWANT_MESSAGES: usize = 32;

/// Bound on cached full messages across all windows.
const MAX_CACHED_MESSAGES: usize = 8192;

#[derive(Clone, Debug)]
pub struct GossipSubConfig {
    pub mesh_n: usize,
    pub mesh_n_low: usize,
    pub mesh_n_high: usize,
    pub gossip_lazy: usize,
    pub history_length: usize,
    pub history_gossip: usize,
    pub fanout_ttl: Duration,
    pub prune_backoff: Duration,
    pub max_ihave_length: usize,
}

impl Default for GossipSubConfig {
    fn default() -> Self {
        Self {
            mesh_n: DEFAULT_MESH_N,
            mesh_n_low: DEFAULT_MESH_N_LOW,
            mesh_n_high: DEFAULT_MESH_N_HIGH,
            gossip_lazy: DEFAULT_GOSSIP_LAZY,
            history_length: DEFAULT_HISTORY_LENGTH,
            history_gossip: DEFAULT_HISTORY_GOSSIP,
            fanout_ttl: DEFAULT_FANOUT_TTL,
            prune_backoff: DEFAULT_PRUNE_BACKOFF,
            max_ihave_length: DEFAULT_MAX_IHAVE_LENGTH,
        }
    }
}

impl PubSub {
    /// Spawns a GossipSub router on `switch`.
    pub fn gossipsub(
        switch: &Switch,
        keypair: Keypair,
        config: PubSubConfig,
        gossip: GossipSubConfig,
    ) -> PubSub {
        PubSub::spawn(switch, keypair, config, Box::new(GossipRouter::new(gossip)))
    }
}

// ============================================================================
// Message cache
// ============================================================================

/// Sliding-window cache of recently routed messages. The newest window
/// collects ids until the next heartbeat shift; gossip advertises the first
/// `history_gossip` windows; IWANT is served from all of them.
pub(crate) struct MessageCache {
    messages: HashMap<[u8; 32], WireMessage>,
    windows: VecDeque<Vec<([u8; 32], Vec<String>)>>,
    history_length: usize,
}

impl MessageCache {
    pub(crate) fn new(history_length: usize) -> Self {
        let mut windows = VecDeque::with_capacity(history_length.max(1));
        windows.push_front(Vec::new());
        Self {
            messages: HashMap::new(),
            windows,
            history_length: history_length.max(1),
        }
    }

    pub(crate) fn put(&mut self, id: [u8; 32], message: &WireMessage) {
        if self.messages.len() >= MAX_CACHED_MESSAGES {
            return;
        }
        if self.messages.insert(id, message.clone()).is_none()
            && let Some(current) = self.windows.front_mut()
        {
            current.push((id, message.topic_ids.clone()));
        }
    }

    pub(crate) fn get(&self, id: &[u8; 32]) -> Option<&WireMessage> {
        self.messages.get(id)
    }

    pub(crate) fn contains(&self, id: &[u8; 32]) -> bool {
        self.messages.contains_key(id)
    }

    /// Ids to gossip for `topic`, drawn from the newest `windows` windows.
    pub(crate) fn gossip_ids(&self, topic: &str, windows: usize) -> Vec<[u8; 32]> {
        self.windows
            .iter()
            .take(windows)
            .flatten()
            .filter(|(_, topics)| topics.iter().any(|t| t == topic))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Opens a fresh window, dropping messages that fell off the history.
    pub(crate) fn shift(&mut self) {
        self.windows.push_front(Vec::new());
        while self.windows.len() > self.history_length {
            if let Some(expired) = self.windows.pop_back() {
                for (id, _) in expired {
                    self.messages.remove(&id);
                }
            }
        }
    }
}

// ============================================================================
// Router
// ============================================================================

pub(crate) struct GossipRouter {
    config: GossipSubConfig,
    /// Full-message peers per subscribed topic.
    mesh: HashMap<String, HashSet<PeerId>>,
    /// Forwarding peers for topics we publish to but are not subscribed to.
    fanout: HashMap<String, HashSet<PeerId>>,
    fanout_last_pub: HashMap<String, Instant>,
    /// Peers recently pruned from a topic's mesh, with their re-graft time.
    backoff: HashMap<(String, PeerId), Instant>,
    mcache: MessageCache,
}

impl GossipRouter {
    pub(crate) fn new(config: GossipSubConfig) -> Self {
        let history = config.history_length;
        Self {
            config,
            mesh: HashMap::new(),
            fanout: HashMap::new(),
            fanout_last_pub: HashMap::new(),
            backoff: HashMap::new(),
            mcache: MessageCache::new(history),
        }
    }

    fn is_backed_off(&self, topic: &str, peer: &PeerId, now: Instant) -> bool {
        self.backoff
            .get(&(topic.to_string(), peer.clone()))
            .is_some_and(|until| *until > now)
    }

    /// Peers subscribed to `topic` that are not in `exclude`.
    fn subscribed_candidates(
        ctx: &RouterCtx<'_>,
        topic: &str,
        exclude: &HashSet<PeerId>,
    ) -> Vec<PeerId> {
        ctx.peer_topics
            .iter()
            .filter(|(peer, topics)| topics.contains(topic) && !exclude.contains(*peer))
            .map(|(peer, _)| peer.clone())
            .collect()
    }
}

fn control_rpc(control: ControlMessage) -> Rpc {
    Rpc {
        subscriptions: Vec::new(),
        publish: Vec::new(),
        control: Some(control),
    }
}

fn graft_rpc(topic: &str) -> Rpc {
    control_rpc(ControlMessage {
        graft: vec![ControlGraft {
            topic_id: topic.to_string(),
        }],
        ..Default::default()
    })
}

fn prune_rpc(topic: &str) -> Rpc {
    control_rpc(ControlMessage {
        prune: vec![ControlPrune {
            topic_id: topic.to_string(),
        }],
        ..Default::default()
    })
}

impl Router for GossipRouter {
    fn protocol(&self) -> &'static str {
        GOSSIPSUB_PROTOCOL
    }

    fn needs_heartbeat(&self) -> bool {
        true
    }

    fn on_peer_left(&mut self, peer: &PeerId) {
        for mesh in self.mesh.values_mut() {
            mesh.remove(peer);
        }
        for fanout in self.fanout.values_mut() {
            fanout.remove(peer);
        }
    }

    fn on_local_subscribe(&mut self, ctx: &mut RouterCtx<'_>, topic: &str) -> Vec<(PeerId, Rpc)> {
        // Fanout members become the seed of the mesh.
        let mut mesh: HashSet<PeerId> = self.fanout.remove(topic).unwrap_or_default();
        self.fanout_last_pub.remove(topic);
        mesh.retain(|peer| {
            ctx.peer_topics
                .get(peer)
                .is_some_and(|topics| topics.contains(topic))
        });

        if mesh.len() < self.config.mesh_n {
            let mut candidates = Self::subscribed_candidates(ctx, topic, &mesh);
            candidates.shuffle(&mut rand::thread_rng());
            let need = self.config.mesh_n - mesh.len();
            mesh.extend(candidates.into_iter().take(need));
        }

        let actions = mesh
            .iter()
            .map(|peer| (peer.clone(), graft_rpc(topic)))
            .collect();
        self.mesh.insert(topic.to_string(), mesh);
        actions
    }

    fn on_local_unsubscribe(
        &mut self,
        _ctx: &mut RouterCtx<'_>,
        topic: &str,
    ) -> Vec<(PeerId, Rpc)> {
        match self.mesh.remove(topic) {
            Some(mesh) => mesh
                .into_iter()
                .map(|peer| (peer, prune_rpc(topic)))
                .collect(),
            None => Vec::new(),
        }
    }

    fn publish_targets(&mut self, ctx: &mut RouterCtx<'_>, topic: &str) -> Vec<PeerId> {
        if ctx.local_topics.contains(topic) {
            let mesh = self.mesh.entry(topic.to_string()).or_default();
            if !mesh.is_empty() {
                return mesh.iter().cloned().collect();
            }
            // Freshly subscribed, no mesh yet: flood to subscribed peers so
            // the publish is not lost before the first heartbeat.
            return Self::subscribed_candidates(ctx, topic, &HashSet::new());
        }

        self.fanout_last_pub.insert(topic.to_string(), Instant::now());
        let fanout = self.fanout.entry(topic.to_string()).or_default();
        fanout.retain(|peer| {
            ctx.peer_topics
                .get(peer)
                .is_some_and(|topics| topics.contains(topic))
        });
        if fanout.len() < self.config.mesh_n {
            let mut candidates: Vec<PeerId> = ctx
                .peer_topics
                .iter()
                .filter(|(peer, topics)| topics.contains(topic) && !fanout.contains(*peer))
                .map(|(peer, _)| peer.clone())
                .collect();
            candidates.shuffle(&mut rand::thread_rng());
            let need = self.config.mesh_n - fanout.len();
            fanout.extend(candidates.into_iter().take(need));
        }
        fanout.iter().cloned().collect()
    }

    fn forward_targets(
        &mut self,
        _ctx: &mut RouterCtx<'_>,
        message: &WireMessage,
    ) -> Vec<PeerId> {
        let mut targets = HashSet::new();
        for topic in &message.topic_ids {
            if let Some(mesh) = self.mesh.get(topic) {
                targets.extend(mesh.iter().cloned());
            }
        }
        targets.into_iter().collect()
    }

    fn on_control(
        &mut self,
        ctx: &mut RouterCtx<'_>,
        from: &PeerId,
        control: &ControlMessage,
    ) -> Vec<(PeerId, Rpc)> {
        let mut actions = Vec::new();
        let now = Instant::now();

        for graft in &control.graft {
            let topic = &graft.topic_id;
            if ctx.local_topics.contains(topic) && !self.is_backed_off(topic, from, now) {
                trace!(%from, %topic, "graft accepted");
                self.mesh.entry(topic.clone()).or_default().insert(from.clone());
            } else {
                trace!(%from, %topic, "graft refused");
                actions.push((from.clone(), prune_rpc(topic)));
            }
        }

        for prune in &control.prune {
            if let Some(mesh) = self.mesh.get_mut(&prune.topic_id) {
                mesh.remove(from);
            }
            self.backoff.insert(
                (prune.topic_id.clone(), from.clone()),
                now + self.config.prune_backoff,
            );
        }

        let mut want: Vec<Vec<u8>> = Vec::new();
        for ihave in &control.ihave {
            if !ctx.local_topics.contains(&ihave.topic_id) {
                continue;
            }
            for id in &ihave.message_ids {
                if want.len() >= self.config.max_ihave_length {
                    break;
                }
                let Ok(id32) = <[u8; 32]>::try_from(&id[..]) else {
                    continue;
                };
                if !ctx.seen.contains_fresh(&id32) && !self.mcache.contains(&id32) {
                    want.push(id.clone());
                }
            }
        }
        if !want.is_empty() {
            actions.push((
                from.clone(),
                control_rpc(ControlMessage {
                    iwant: vec![ControlIWant { message_ids: want }],
                    ..Default::default()
                }),
            ));
        }

        let mut served = Vec::new();
        'iwant: for iwant in &control.iwant {
            for id in &iwant.message_ids {
                if served.len() >= MAX_IWANT_MESSAGES {
                    break 'iwant;
                }
                if let Ok(id32) = <[u8; 32]>::try_from(&id[..])
                    && let Some(message) = self.mcache.get(&id32)
                {
                    served.push(message.clone());
                }
            }
        }
        if !served.is_empty() {
            actions.push((
                from.clone(),
                Rpc {
                    subscriptions: Vec::new(),
                    publish: served,
                    control: None,
                },
            ));
        }

        actions
    }

    fn on_message_stored(&mut self, id: &[u8; 32], message: &WireMessage) {
        self.mcache.put(*id, message);
    }

    fn on_heartbeat(&mut self, ctx: &mut RouterCtx<'_>) -> Vec<(PeerId, Rpc)> {
        let mut actions = Vec::new();
        let now = Instant::now();
        let mut rng = rand::thread_rng();

        self.backoff.retain(|_, until| *until > now);

        // Mesh maintenance for every subscribed topic.
        for topic in ctx.local_topics {
            let mut mesh = self.mesh.remove(topic).unwrap_or_default();
            mesh.retain(|peer| {
                ctx.peer_topics
                    .get(peer)
                    .is_some_and(|topics| topics.contains(topic))
            });

            if mesh.len() < self.config.mesh_n_low {
                let mut candidates: Vec<PeerId> = Self::subscribed_candidates(ctx, topic, &mesh)
                    .into_iter()
                    .filter(|peer| !self.is_backed_off(topic, peer, now))
                    .collect();
                candidates.shuffle(&mut rng);
                let need = self.config.mesh_n.saturating_sub(mesh.len());
                for peer in candidates.into_iter().take(need) {
                    actions.push((peer.clone(), graft_rpc(topic)));
                    mesh.insert(peer);
                }
            } else if mesh.len() > self.config.mesh_n_high {
                let mut members: Vec<PeerId> = mesh.iter().cloned().collect();
                members.shuffle(&mut rng);
                while mesh.len() > self.config.mesh_n {
                    let Some(peer) = members.pop() else { break };
                    mesh.remove(&peer);
                    self.backoff
                        .insert((topic.clone(), peer.clone()), now + self.config.prune_backoff);
                    actions.push((peer, prune_rpc(topic)));
                }
            }
            self.mesh.insert(topic.clone(), mesh);
        }
        self.mesh.retain(|topic, _| ctx.local_topics.contains(topic));

        // Fanout expiry and refresh.
        let fanout_ttl = self.config.fanout_ttl;
        self.fanout_last_pub.retain(|_, at| at.elapsed() < fanout_ttl);
        let live: HashSet<String> = self.fanout_last_pub.keys().cloned().collect();
        self.fanout
            .retain(|topic, _| live.contains(topic) && !ctx.local_topics.contains(topic));
        for (topic, fanout) in self.fanout.iter_mut() {
            fanout.retain(|peer| {
                ctx.peer_topics
                    .get(peer)
                    .is_some_and(|topics| topics.contains(topic))
            });
        }

        // Gossip: advertise recent message ids to non-mesh peers.
        let gossip_topics: HashSet<String> = self
            .mesh
            .keys()
            .chain(self.fanout.keys())
            .cloned()
            .collect();
        for topic in &gossip_topics {
            let mut ids = self.mcache.gossip_ids(topic, self.config.history_gossip);
            if ids.is_empty() {
                continue;
            }
            ids.truncate(self.config.max_ihave_length);
            let exclude: HashSet<PeerId> = self
                .mesh
                .get(topic)
                .into_iter()
                .chain(self.fanout.get(topic))
                .flatten()
                .cloned()
                .collect();
            let mut candidates = Self::subscribed_candidates(ctx, topic, &exclude);
            candidates.shuffle(&mut rng);
            let ihave = ControlMessage {
                ihave: vec![ControlIHave {
                    topic_id: topic.clone(),
                    message_ids: ids.iter().map(|id| id.to_vec()).collect(),
                }],
                ..Default::default()
            };
            for peer in candidates.into_iter().take(self.config.gossip_lazy) {
                actions.push((peer, control_rpc(ihave.clone())));
            }
        }

        self.mcache.shift();
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::pubsub::DedupCache;

    fn peer(n: u8) -> PeerId {
        Keypair::from_secret_bytes(&[n; 32]).peer_id()
    }

    fn message(topic: &str, seqno: u64) -> WireMessage {
        WireMessage {
            from: peer(200).to_bytes(),
            data: vec![seqno as u8],
            seqno,
            topic_ids: vec![topic.to_string()],
            signature: None,
            key: None,
        }
    }

    fn id_of(n: u8) -> [u8; 32] {
        [n; 32]
    }

    struct Fixture {
        peer_topics: HashMap<PeerId, HashSet<String>>,
        local_topics: HashSet<String>,
        seen: DedupCache,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                peer_topics: HashMap::new(),
                local_topics: HashSet::new(),
                seen: DedupCache::new(64, Duration::from_secs(60)),
            }
        }

        fn subscribe_peer(&mut self, n: u8, topic: &str) -> PeerId {
            let p = peer(n);
            self.peer_topics
                .entry(p.clone())
                .or_default()
                .insert(topic.to_string());
            p
        }

        fn ctx(&mut self) -> RouterCtx<'_> {
            RouterCtx {
                peer_topics: &self.peer_topics,
                local_topics: &self.local_topics,
                seen: &mut self.seen,
            }
        }
    }

    #[test]
    fn mcache_windows_expire_on_shift() {
        let mut cache = MessageCache::new(2);
        cache.put(id_of(1), &message("news", 1));
        assert!(cache.contains(&id_of(1)));
        assert_eq!(cache.gossip_ids("news", 3), vec![id_of(1)]);

        cache.shift();
        assert!(cache.contains(&id_of(1)));
        cache.shift();
        // Two shifts with history_length 2 push the entry out.
        assert!(!cache.contains(&id_of(1)));
        assert!(cache.gossip_ids("news", 3).is_empty());
    }

    #[test]
    fn graft_from_subscribed_peer_joins_mesh() {
        let mut fixture = Fixture::new();
        fixture.local_topics.insert("news".into());
        let grafter = fixture.subscribe_peer(1, "news");

        let mut router = GossipRouter::new(GossipSubConfig::default());
        let control = ControlMessage {
            graft: vec![ControlGraft {
                topic_id: "news".into(),
            }],
            ..Default::default()
        };
        let actions = router.on_control(&mut fixture.ctx(), &grafter, &control);
        assert!(actions.is_empty());
        assert!(router.mesh["news"].contains(&grafter));
    }

    #[test]
    fn graft_for_unsubscribed_topic_is_pruned() {
        let mut fixture = Fixture::new();
        let grafter = fixture.subscribe_peer(1, "news");

        let mut router = GossipRouter::new(GossipSubConfig::default());
        let control = ControlMessage {
            graft: vec![ControlGraft {
                topic_id: "news".into(),
            }],
            ..Default::default()
        };
        let actions = router.on_control(&mut fixture.ctx(), &grafter, &control);
        assert_eq!(actions.len(), 1);
        let (target, rpc) = &actions[0];
        assert_eq!(target, &grafter);
        assert_eq!(rpc.control.as_ref().unwrap().prune[0].topic_id, "news");
    }

    #[test]
    fn prune_backs_the_peer_off() {
        let mut fixture = Fixture::new();
        fixture.local_topics.insert("news".into());
        let pruner = fixture.subscribe_peer(1, "news");

        let mut router = GossipRouter::new(GossipSubConfig::default());
        router
            .mesh
            .entry("news".into())
            .or_default()
            .insert(pruner.clone());

        let control = ControlMessage {
            prune: vec![ControlPrune {
                topic_id: "news".into(),
            }],
            ..Default::default()
        };
        router.on_control(&mut fixture.ctx(), &pruner, &control);
        assert!(!router.mesh["news"].contains(&pruner));

        // The heartbeat must not re-graft a backed-off peer.
        let actions = router.on_heartbeat(&mut fixture.ctx());
        let regrafted = actions.iter().any(|(peer, rpc)| {
            peer == &pruner
                && rpc
                    .control
                    .as_ref()
                    .is_some_and(|control| !control.graft.is_empty())
        });
        assert!(!regrafted);
        assert!(!router.mesh["news"].contains(&pruner));
    }

    #[test]
    fn heartbeat_grafts_up_to_mesh_n() {
        let mut fixture = Fixture::new();
        fixture.local_topics.insert("news".into());
        for n in 1..=10 {
            fixture.subscribe_peer(n, "news");
        }

        let mut router = GossipRouter::new(GossipSubConfig::default());
        let actions = router.on_heartbeat(&mut fixture.ctx());

        let grafts = actions
            .iter()
            .filter(|(_, rpc)| {
                rpc.control
                    .as_ref()
                    .is_some_and(|control| !control.graft.is_empty())
            })
            .count();
        assert_eq!(grafts, DEFAULT_MESH_N);
        assert_eq!(router.mesh["news"].len(), DEFAULT_MESH_N);
    }

    #[test]
    fn ihave_of_unseen_ids_triggers_iwant() {
        let mut fixture = Fixture::new();
        fixture.local_topics.insert("news".into());
        let gossiper = fixture.subscribe_peer(1, "news");

        let mut router = GossipRouter::new(GossipSubConfig::default());
        let control = ControlMessage {
            ihave: vec![ControlIHave {
                topic_id: "news".into(),
                message_ids: vec![id_of(9).to_vec()],
            }],
            ..Default::default()
        };
        let actions = router.on_control(&mut fixture.ctx(), &gossiper, &control);
        assert_eq!(actions.len(), 1);
        let iwant = &actions[0].1.control.as_ref().unwrap().iwant;
        assert_eq!(iwant[0].message_ids, vec![id_of(9).to_vec()]);

        // Once seen, the same advert is ignored.
        fixture.seen.insert(id_of(9));
        let actions = router.on_control(&mut fixture.ctx(), &gossiper, &control);
        assert!(actions.is_empty());
    }

    #[test]
    fn iwant_is_served_from_the_cache() {
        let mut fixture = Fixture::new();
        let requester = fixture.subscribe_peer(1, "news");

        let mut router = GossipRouter::new(GossipSubConfig::default());
        let msg = message("news", 4);
        router.on_message_stored(&id_of(4), &msg);

        let control = ControlMessage {
            iwant: vec![ControlIWant {
                message_ids: vec![id_of(4).to_vec(), id_of(5).to_vec()],
            }],
            ..Default::default()
        };
        let actions = router.on_control(&mut fixture.ctx(), &requester, &control);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].1.publish, vec![msg]);
    }

    #[test]
    fn publishing_to_foreign_topic_builds_fanout() {
        let mut fixture = Fixture::new();
        for n in 1..=3 {
            fixture.subscribe_peer(n, "news");
        }

        let mut router = GossipRouter::new(GossipSubConfig::default());
        let targets = router.publish_targets(&mut fixture.ctx(), "news");
        assert_eq!(targets.len(), 3);
        assert_eq!(router.fanout["news"].len(), 3);
        assert!(router.fanout_last_pub.contains_key("news"));
    }

    #[test]
    fn subscribe_promotes_fanout_to_mesh() {
        let mut fixture = Fixture::new();
        for n in 1..=3 {
            fixture.subscribe_peer(n, "news");
        }

        let mut router = GossipRouter::new(GossipSubConfig::default());
        router.publish_targets(&mut fixture.ctx(), "news");
        assert!(router.fanout.contains_key("news"));

        fixture.local_topics.insert("news".into());
        let actions = router.on_local_subscribe(&mut fixture.ctx(), "news");
        assert!(!router.fanout.contains_key("news"));
        assert_eq!(router.mesh["news"].len(), 3);
        // Every mesh member is grafted.
        assert_eq!(actions.len(), 3);
    }

    #[test]
    fn forward_targets_are_mesh_members() {
        let mut fixture = Fixture::new();
        fixture.local_topics.insert("news".into());
        let member = fixture.subscribe_peer(1, "news");
        let outsider = fixture.subscribe_peer(2, "news");

        let mut router = GossipRouter::new(GossipSubConfig::default());
        router
            .mesh
            .entry("news".into())
            .or_default()
            .insert(member.clone());

        let targets = router.forward_targets(&mut fixture.ctx(), &message("news", 1));
        assert_eq!(targets, vec![member]);
        assert!(!targets.contains(&outsider));
    }
}
