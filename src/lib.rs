//! # Weft - Peer-to-Peer Connection Pipeline
//!
//! Weft turns raw TCP sockets into authenticated, encrypted, multiplexed
//! byte streams and runs publish/subscribe messaging on top:
//!
//! - **Identity**: Ed25519 keypairs; peer ids are multihashes of the public key
//! - **Noise**: XX-pattern handshake and record layer (Curve25519,
//!   ChaCha20-Poly1305, SHA-256)
//! - **Mplex**: framed sub-channels with half-close and reset semantics over
//!   one secured connection
//! - **Multistream-select**: protocol negotiation at every layer boundary
//! - **Switch**: dial/listen surface, the upgrade pipeline, peer lifecycle
//! - **PubSub**: FloodSub and GossipSub routers with dedup, signing, and
//!   validation
//!
//! ## Architecture
//!
//! Data flows bottom-up on read and top-down on write:
//!
//! ```text
//! application protocol handler
//!         │  (byte stream per logical stream)
//! multistream-select ── picks the protocol on each new channel
//!         │
//! mplex channel ── framed, flow-controlled
//!         │
//! mplex session ── demultiplexes frames, one read loop per session
//!         │
//! noise secure connection ── record-layer encryption
//!         │
//! tcp socket
//! ```
//!
//! Concurrent state lives behind the **actor pattern**: components expose a
//! cheap-to-clone handle and own their mutable state in a task fed by async
//! channels. The one polymorphic seam is the byte-stream capability set
//! ([`ByteStream`]); each pipeline layer is a concrete struct owning the
//! layer beneath it.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `identity` | Keypairs, peer ids, peer info |
//! | `connection` | Raw transport connections with direction and flags |
//! | `transport` | TCP dial/listen collaborator |
//! | `noise` | Noise XX handshake and record layer |
//! | `multistream` | `/multistream/1.0.0` negotiation |
//! | `mplex` | `/mplex/6.7.0` session and channel state machines |
//! | `switch` | Upgrade pipeline, session registry, lifecycle events |
//! | `pubsub` | Router core and FloodSub |
//! | `gossipsub` | Mesh-based GossipSub variant |
//! | `messages` | Protobuf wire types |
//! | `varint` | Unsigned varint codec |
//! | `stream` | Byte-stream capability trait and errors |
//! | `tracker` | Injected resource-leak observer |
//!
//! ## Quick Start
//!
//! ```ignore
//! let keypair = Keypair::generate();
//! let switch = Switch::new(keypair.clone());
//! switch.listen("0.0.0.0:0".parse()?).await?;
//!
//! let pubsub = PubSub::floodsub(&switch, keypair, PubSubConfig::default());
//! let mut sub = pubsub.subscribe("my-topic").await?;
//! pubsub.publish("my-topic", b"hello".to_vec()).await?;
//! while let Some(msg) = sub.recv().await {
//!     println!("got {:?}", msg.data);
//! }
//! ```

pub mod connection;
pub mod gossipsub;
pub mod identity;
pub mod messages;
pub mod mplex;
pub mod multistream;
pub mod noise;
pub mod pubsub;
pub mod stream;
pub mod switch;
pub mod tracker;
pub mod transport;
pub mod varint;

pub use connection::{Connection, Direction};
pub use gossipsub::{GOSSIPSUB_PROTOCOL, GossipSubConfig};
pub use identity::{Keypair, PeerId, PeerInfo, PublicKey};
pub use mplex::{MplexChannel, MplexConfig, MplexSession, MuxError};
pub use multistream::NegotiationError;
pub use noise::{NoiseError, SecureConnection};
pub use pubsub::{
    FLOODSUB_PROTOCOL, MessageObserver, PubSub, PubSubConfig, PubSubMessage, Subscription,
    TopicValidator,
};
pub use stream::{ByteStream, StreamError};
pub use switch::{
    ConnectionEvents, PeerEvents, ProtocolHandler, Switch, SwitchConfig, SwitchError,
};
pub use tracker::{CountingTracker, NoopTracker, Resource, ResourceTracker};
pub use transport::TcpTransport;
