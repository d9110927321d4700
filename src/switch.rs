//! # Switch
//!
//! Single entry point for dialing and listening. The switch runs the upgrade
//! pipeline on every socket in both directions:
//!
//! 1. multistream-select picks the security protocol (`/noise`)
//! 2. the Noise handshake authenticates the remote peer
//! 3. multistream-select over the secured stream picks the muxer (`/mplex/6.7.0`)
//! 4. an [`MplexSession`] is spawned and registered under the remote peer
//!
//! Channels opened by the remote are negotiated against the registered
//! application protocols and dispatched to their handlers. The switch tracks
//! the per-peer session set, coalesces concurrent dials to the same peer,
//! and fires lifecycle hooks: connection events per session, peer events
//! exactly once per peer (first session in, last session out). Hooks run
//! outside all internal locks, so a hook may call back into the switch,
//! including `disconnect`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::connection::{Connection, Direction};
use crate::identity::{Keypair, PeerId, PeerInfo};
use crate::mplex::{MplexChannel, MplexConfig, MplexSession, MuxError};
use crate::multistream::{NegotiationError, ProtocolOffer, dialer_select, listener_negotiate};
use crate::noise::{self, NoiseError};
use crate::tracker::{self, ResourceTracker};
use crate::transport::TcpTransport;

/// Timeout for establishing the TCP connection of one dial attempt.
const DIAL_TIMEOUT: Duration = Duration::from_secs(20);

/// Timeout for negotiating the application protocol on a fresh channel.
const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity of the per-session queue of freshly opened remote channels.
const CHANNEL_SINK_CAPACITY: usize = 32;

#[derive(Debug, Error)]
pub enum SwitchError {
    /// Every address failed, or the channel negotiation after a dial failed.
    #[error("dial failed: {0}")]
    DialFailed(String),
    /// The switch was closed.
    #[error("switch is closed")]
    Closed,
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Noise(#[from] NoiseError),
    #[error(transparent)]
    Mux(#[from] MuxError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Switch tuning knobs.
#[derive(Clone, Debug, Default)]
pub struct SwitchConfig {
    pub mplex: MplexConfig,
}

/// Handler for an application protocol negotiated on a channel.
#[async_trait]
pub trait ProtocolHandler: Send + Sync + 'static {
    /// Runs the protocol on `channel`. `protocol` is the negotiated id,
    /// which may differ from the registered id when a matcher accepted it.
    async fn handle(&self, channel: MplexChannel, protocol: String);
}

/// Hook invoked for every session added to or removed from the switch.
#[async_trait]
pub trait ConnectionEvents: Send + Sync + 'static {
    async fn connected(&self, peer: &PeerId);
    async fn disconnected(&self, peer: &PeerId);
}

/// Hook invoked when a peer gains its first session or loses its last one.
#[async_trait]
pub trait PeerEvents: Send + Sync + 'static {
    async fn joined(&self, peer: &PeerId);
    async fn left(&self, peer: &PeerId);
}

type Matcher = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Clone)]
struct ProtocolEntry {
    id: String,
    matcher: Option<Matcher>,
    handler: Arc<dyn ProtocolHandler>,
}

impl ProtocolEntry {
    fn matches(&self, proposed: &str) -> bool {
        match &self.matcher {
            Some(matcher) => matcher(proposed),
            None => self.id == proposed,
        }
    }
}

type DialWaiter = oneshot::Sender<Result<MplexSession, String>>;

struct SwitchInner {
    keypair: Keypair,
    local_peer: PeerId,
    config: SwitchConfig,
    transport: TcpTransport,
    tracker: Arc<dyn ResourceTracker>,
    protocols: RwLock<Vec<ProtocolEntry>>,
    sessions: tokio::sync::Mutex<HashMap<PeerId, Vec<MplexSession>>>,
    pending_dials: tokio::sync::Mutex<HashMap<PeerId, Vec<DialWaiter>>>,
    connection_hooks: RwLock<Vec<Arc<dyn ConnectionEvents>>>,
    peer_hooks: RwLock<Vec<Arc<dyn PeerEvents>>>,
    listeners: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    listen_addrs: Mutex<Vec<SocketAddr>>,
    closed: AtomicBool,
}

/// The dial/listen surface. Cheap to clone.
#[derive(Clone)]
pub struct Switch {
    inner: Arc<SwitchInner>,
}

impl Switch {
    pub fn new(keypair: Keypair) -> Self {
        Self::with_config(keypair, SwitchConfig::default(), tracker::noop())
    }

    pub fn with_config(
        keypair: Keypair,
        config: SwitchConfig,
        tracker: Arc<dyn ResourceTracker>,
    ) -> Self {
        let local_peer = keypair.peer_id();
        Switch {
            inner: Arc::new(SwitchInner {
                keypair,
                local_peer,
                config,
                transport: TcpTransport::new(tracker.clone()),
                tracker,
                protocols: RwLock::new(Vec::new()),
                sessions: tokio::sync::Mutex::new(HashMap::new()),
                pending_dials: tokio::sync::Mutex::new(HashMap::new()),
                connection_hooks: RwLock::new(Vec::new()),
                peer_hooks: RwLock::new(Vec::new()),
                listeners: Mutex::new(Vec::new()),
                listen_addrs: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.inner.local_peer
    }

    /// Addresses of every active listener.
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.inner.listen_addrs.lock().unwrap().clone()
    }

    /// Registers a protocol handler under an exact id.
    pub fn add_handler(&self, protocol: &str, handler: Arc<dyn ProtocolHandler>) {
        self.inner.protocols.write().unwrap().push(ProtocolEntry {
            id: protocol.to_string(),
            matcher: None,
            handler,
        });
    }

    /// Registers a handler whose matcher decides which proposed ids it takes.
    pub fn add_handler_with_matcher(
        &self,
        protocol: &str,
        matcher: Matcher,
        handler: Arc<dyn ProtocolHandler>,
    ) {
        self.inner.protocols.write().unwrap().push(ProtocolEntry {
            id: protocol.to_string(),
            matcher: Some(matcher),
            handler,
        });
    }

    pub fn add_connection_hook(&self, hook: Arc<dyn ConnectionEvents>) {
        self.inner.connection_hooks.write().unwrap().push(hook);
    }

    pub fn add_peer_hook(&self, hook: Arc<dyn PeerEvents>) {
        self.inner.peer_hooks.write().unwrap().push(hook);
    }

    /// Starts listening on `addr`; returns the bound address. Accepted
    /// sockets run the inbound upgrade pipeline; a transport-level accept
    /// error ends the loop without surfacing anywhere else.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, SwitchError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SwitchError::Closed);
        }
        let listener = self.inner.transport.listen(addr).await?;
        let local = listener.local_addr();
        self.inner.listen_addrs.lock().unwrap().push(local);
        info!(%local, peer = %self.inner.local_peer, "switch listening");

        let switch = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(conn) => {
                        let switch = switch.clone();
                        tokio::spawn(async move {
                            match switch.upgrade(conn, None).await {
                                Ok(session) => switch.register_session(session).await,
                                Err(e) => debug!(error = %e, "inbound upgrade failed"),
                            }
                        });
                    }
                    Err(e) => {
                        debug!(error = %e, "listener terminated");
                        return;
                    }
                }
            }
        });
        self.inner.listeners.lock().unwrap().push(handle);
        Ok(local)
    }

    /// Returns a muxed session to `peer`, reusing a live one when possible.
    ///
    /// Concurrent dials to the same peer share one handshake: the first
    /// caller drives the dial, the rest wait for its outcome.
    pub async fn dial(&self, peer: &PeerInfo) -> Result<MplexSession, SwitchError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SwitchError::Closed);
        }
        if let Some(session) = self.existing_session(&peer.peer_id).await {
            return Ok(session);
        }

        let waiter = {
            let mut pending = self.inner.pending_dials.lock().await;
            if let Some(waiters) = pending.get_mut(&peer.peer_id) {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Some(rx)
            } else {
                pending.insert(peer.peer_id.clone(), Vec::new());
                None
            }
        };

        if let Some(rx) = waiter {
            debug!(peer = %peer.peer_id, "joining in-flight dial");
            return match rx.await {
                Ok(Ok(session)) => Ok(session),
                Ok(Err(msg)) => Err(SwitchError::DialFailed(msg)),
                Err(_) => Err(SwitchError::DialFailed("dial was abandoned".into())),
            };
        }

        let result = self.drive_dial(peer).await;
        let waiters = self
            .inner
            .pending_dials
            .lock()
            .await
            .remove(&peer.peer_id)
            .unwrap_or_default();
        for tx in waiters {
            let share = match &result {
                Ok(session) => Ok(session.clone()),
                Err(e) => Err(e.to_string()),
            };
            let _ = tx.send(share);
        }
        result
    }

    /// Dials `peer` and negotiates one of `protocols` on a fresh channel,
    /// returning the channel and the agreed id.
    pub async fn dial_protocol(
        &self,
        peer: &PeerInfo,
        protocols: &[&str],
    ) -> Result<(MplexChannel, String), SwitchError> {
        let session = self.dial(peer).await?;
        let mut channel = session
            .open_channel(protocols.first().copied().unwrap_or_default())
            .await
            .map_err(|e| SwitchError::DialFailed(e.to_string()))?;
        match timeout(NEGOTIATION_TIMEOUT, dialer_select(&mut channel, protocols)).await {
            Ok(Ok(protocol)) => Ok((channel, protocol)),
            Ok(Err(e)) => {
                channel.reset().await;
                Err(SwitchError::DialFailed(e.to_string()))
            }
            Err(_) => {
                channel.reset().await;
                Err(SwitchError::DialFailed("protocol negotiation timed out".into()))
            }
        }
    }

    /// Closes every session to `peer`, resetting all of their channels.
    pub async fn disconnect(&self, peer: &PeerId) {
        let sessions: Vec<MplexSession> = {
            let map = self.inner.sessions.lock().await;
            map.get(peer).cloned().unwrap_or_default()
        };
        for session in sessions {
            session.close().await;
        }
    }

    /// Whether at least one live session to `peer` exists.
    pub async fn is_connected(&self, peer: &PeerId) -> bool {
        self.existing_session(peer).await.is_some()
    }

    /// Peers with at least one session.
    pub async fn peers(&self) -> Vec<PeerId> {
        self.inner.sessions.lock().await.keys().cloned().collect()
    }

    /// Shuts down every listener and disconnects every peer.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let handles: Vec<_> = self.inner.listeners.lock().unwrap().drain(..).collect();
        for handle in handles {
            handle.abort();
        }
        let peers: Vec<PeerId> = {
            let map = self.inner.sessions.lock().await;
            map.keys().cloned().collect()
        };
        for peer in peers {
            self.disconnect(&peer).await;
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn existing_session(&self, peer: &PeerId) -> Option<MplexSession> {
        let map = self.inner.sessions.lock().await;
        map.get(peer)?
            .iter()
            .find(|session| !session.is_closed())
            .cloned()
    }

    async fn drive_dial(&self, peer: &PeerInfo) -> Result<MplexSession, SwitchError> {
        // A session may have appeared while we were queueing as the leader.
        if let Some(session) = self.existing_session(&peer.peer_id).await {
            return Ok(session);
        }
        if peer.addrs.is_empty() {
            return Err(SwitchError::DialFailed(format!(
                "no known addresses for {}",
                peer.peer_id
            )));
        }
        let mut last_error = String::new();
        for addr in &peer.addrs {
            match self.dial_addr(*addr, &peer.peer_id).await {
                Ok(session) => {
                    self.register_session(session.clone()).await;
                    return Ok(session);
                }
                Err(e) => {
                    debug!(%addr, error = %e, "dial attempt failed");
                    last_error = e.to_string();
                }
            }
        }
        Err(SwitchError::DialFailed(format!(
            "all {} addresses failed, last error: {last_error}",
            peer.addrs.len()
        )))
    }

    async fn dial_addr(
        &self,
        addr: SocketAddr,
        expected: &PeerId,
    ) -> Result<MplexSession, SwitchError> {
        let conn = timeout(DIAL_TIMEOUT, self.inner.transport.dial(addr))
            .await
            .map_err(|_| SwitchError::DialFailed(format!("connect to {addr} timed out")))??;
        self.upgrade(conn, Some(expected)).await
    }

    /// The upgrade pipeline: security negotiation, Noise handshake, muxer
    /// negotiation, session spawn.
    async fn upgrade(
        &self,
        mut conn: Connection,
        expected: Option<&PeerId>,
    ) -> Result<MplexSession, SwitchError> {
        let direction = conn.direction();

        match direction {
            Direction::Outbound => {
                dialer_select(&mut conn, &[noise::PROTOCOL_ID]).await?;
            }
            Direction::Inbound => {
                let offers = [ProtocolOffer::exact(noise::PROTOCOL_ID)];
                listener_negotiate(&mut conn, &offers).await?;
            }
        }

        let mut secure = match direction {
            Direction::Outbound => {
                noise::upgrade_outbound(
                    conn,
                    &self.inner.keypair,
                    expected,
                    self.inner.tracker.clone(),
                )
                .await?
            }
            Direction::Inbound => {
                noise::upgrade_inbound(conn, &self.inner.keypair, self.inner.tracker.clone())
                    .await?
            }
        };

        match direction {
            Direction::Outbound => {
                dialer_select(&mut secure, &[crate::mplex::PROTOCOL_ID]).await?;
            }
            Direction::Inbound => {
                let offers = [ProtocolOffer::exact(crate::mplex::PROTOCOL_ID)];
                listener_negotiate(&mut secure, &offers).await?;
            }
        }

        let remote = secure.remote_peer().clone();
        let (sink_tx, sink_rx) = mpsc::channel(CHANNEL_SINK_CAPACITY);
        let session = MplexSession::new(
            secure,
            self.inner.config.mplex.clone(),
            self.inner.tracker.clone(),
            sink_tx,
        );
        self.spawn_channel_dispatcher(sink_rx);
        debug!(peer = %remote, ?direction, "upgrade pipeline complete");
        Ok(session)
    }

    fn spawn_channel_dispatcher(&self, mut rx: mpsc::Receiver<MplexChannel>) {
        let switch = self.clone();
        tokio::spawn(async move {
            while let Some(channel) = rx.recv().await {
                let switch = switch.clone();
                tokio::spawn(async move {
                    switch.dispatch_channel(channel).await;
                });
            }
        });
    }

    /// Negotiates the application protocol on a remote-opened channel and
    /// hands it to the matching handler; failures close the channel.
    async fn dispatch_channel(&self, mut channel: MplexChannel) {
        let entries: Vec<ProtocolEntry> = self.inner.protocols.read().unwrap().clone();
        let negotiated = timeout(NEGOTIATION_TIMEOUT, async {
            let offers: Vec<ProtocolOffer<'_>> = entries
                .iter()
                .map(|entry| ProtocolOffer {
                    id: &entry.id,
                    matcher: entry.matcher.as_deref(),
                })
                .collect();
            listener_negotiate(&mut channel, &offers).await
        })
        .await;

        match negotiated {
            Ok(Ok(protocol)) => {
                let handler = entries
                    .iter()
                    .find(|entry| entry.matches(&protocol))
                    .map(|entry| entry.handler.clone());
                match handler {
                    Some(handler) => handler.handle(channel, protocol).await,
                    None => {
                        warn!(%protocol, "negotiated protocol has no handler");
                        channel.reset().await;
                    }
                }
            }
            Ok(Err(e)) => {
                debug!(error = %e, "channel negotiation failed");
                channel.reset().await;
            }
            Err(_) => {
                debug!("channel negotiation timed out");
                channel.reset().await;
            }
        }
    }

    async fn register_session(&self, session: MplexSession) {
        let peer = session.remote_peer().clone();
        let first = {
            let mut map = self.inner.sessions.lock().await;
            let list = map.entry(peer.clone()).or_default();
            let first = list.is_empty();
            list.push(session.clone());
            first
        };

        // Watch for the session dying, locally or remotely.
        let switch = self.clone();
        let watched = session.clone();
        let watched_peer = peer.clone();
        tokio::spawn(async move {
            watched.wait_closed().await;
            switch.unregister_session(&watched_peer, watched.token()).await;
        });

        self.fire_connected(&peer).await;
        if first {
            self.fire_joined(&peer).await;
        }
    }

    async fn unregister_session(&self, peer: &PeerId, token: usize) {
        let (removed, last) = {
            let mut map = self.inner.sessions.lock().await;
            match map.get_mut(peer) {
                Some(list) => {
                    let before = list.len();
                    list.retain(|session| session.token() != token);
                    let removed = list.len() < before;
                    let last = removed && list.is_empty();
                    if list.is_empty() {
                        map.remove(peer);
                    }
                    (removed, last)
                }
                None => (false, false),
            }
        };
        if removed {
            self.fire_disconnected(peer).await;
            if last {
                self.fire_left(peer).await;
            }
        }
    }

    async fn fire_connected(&self, peer: &PeerId) {
        let hooks: Vec<_> = self.inner.connection_hooks.read().unwrap().clone();
        for hook in hooks {
            hook.connected(peer).await;
        }
    }

    async fn fire_disconnected(&self, peer: &PeerId) {
        let hooks: Vec<_> = self.inner.connection_hooks.read().unwrap().clone();
        for hook in hooks {
            hook.disconnected(peer).await;
        }
    }

    async fn fire_joined(&self, peer: &PeerId) {
        debug!(%peer, "peer joined");
        let hooks: Vec<_> = self.inner.peer_hooks.read().unwrap().clone();
        for hook in hooks {
            hook.joined(peer).await;
        }
    }

    async fn fire_left(&self, peer: &PeerId) {
        debug!(%peer, "peer left");
        let hooks: Vec<_> = self.inner.peer_hooks.read().unwrap().clone();
        for hook in hooks {
            hook.left(peer).await;
        }
    }
}

impl std::fmt::Debug for Switch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Switch")
            .field("local_peer", &self.inner.local_peer)
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[tokio::test]
    async fn dial_without_addresses_fails() {
        let switch = Switch::new(Keypair::generate());
        let target = PeerInfo::new(Keypair::generate().peer_id());
        let err = switch.dial(&target).await.unwrap_err();
        assert!(matches!(err, SwitchError::DialFailed(_)));
    }

    #[tokio::test]
    async fn closed_switch_rejects_operations() {
        let switch = Switch::new(Keypair::generate());
        switch.close().await;
        assert!(matches!(
            switch.listen("127.0.0.1:0".parse().unwrap()).await,
            Err(SwitchError::Closed)
        ));
        let target = PeerInfo::new(Keypair::generate().peer_id());
        assert!(matches!(switch.dial(&target).await, Err(SwitchError::Closed)));
    }

    #[test]
    fn matcher_entries_match_by_predicate() {
        struct Nop;
        #[async_trait]
        impl ProtocolHandler for Nop {
            async fn handle(&self, _channel: MplexChannel, _protocol: String) {}
        }

        let entry = ProtocolEntry {
            id: "/kv/1.0.0".into(),
            matcher: Some(Arc::new(|p: &str| p.starts_with("/kv/1."))),
            handler: Arc::new(Nop),
        };
        assert!(entry.matches("/kv/1.7.2"));
        assert!(!entry.matches("/kv/2.0.0"));

        let exact = ProtocolEntry {
            id: "/kv/1.0.0".into(),
            matcher: None,
            handler: Arc::new(Nop),
        };
        assert!(exact.matches("/kv/1.0.0"));
        assert!(!exact.matches("/kv/1.0.1"));
    }
}
