//! # Wire Protocol Messages
//!
//! Protobuf message types for everything that crosses the wire above the
//! muxer: the pubsub RPC envelope with its control messages, the Noise
//! handshake identity payload, and the public-key encoding embedded in peer
//! ids.
//!
//! ## Envelope Layout
//!
//! | Type | Carried by | Framing |
//! |------|-----------|---------|
//! | [`Rpc`] | `/floodsub/1.0.0`, `/meshsub/1.0.0` | varint length prefix |
//! | [`NoiseHandshakePayload`] | Noise XX messages 2 and 3 | Noise record |
//! | [`PublicKeyProto`] | peer ids, handshake payloads | raw protobuf |
//!
//! All decoding paths are length-bounded by the caller before the bytes reach
//! prost, so a hostile peer cannot force an oversized allocation here.

use prost::Message as _;

// ============================================================================
// PubSub RPC
// ============================================================================

/// Top-level pubsub RPC: subscription changes, application messages, and an
/// optional control block, all in one envelope.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Rpc {
    #[prost(message, repeated, tag = "1")]
    pub subscriptions: Vec<SubOpts>,
    #[prost(message, repeated, tag = "2")]
    pub publish: Vec<WireMessage>,
    #[prost(message, optional, tag = "3")]
    pub control: Option<ControlMessage>,
}

/// A single subscribe/unsubscribe announcement.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubOpts {
    #[prost(bool, tag = "1")]
    pub subscribe: bool,
    #[prost(string, tag = "2")]
    pub topic_id: String,
}

/// An application message routed by the pubsub layer.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireMessage {
    /// Peer id bytes of the original publisher.
    #[prost(bytes = "vec", tag = "1")]
    pub from: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
    /// Per-publisher sequence number; (from, seqno) is unique per message.
    #[prost(uint64, tag = "3")]
    pub seqno: u64,
    #[prost(string, repeated, tag = "4")]
    pub topic_ids: Vec<String>,
    #[prost(bytes = "vec", optional, tag = "5")]
    pub signature: Option<Vec<u8>>,
    /// Protobuf-encoded public key of the publisher, present when signed.
    #[prost(bytes = "vec", optional, tag = "6")]
    pub key: Option<Vec<u8>>,
}

impl WireMessage {
    /// The byte string a publisher signs: the message's own encoding with the
    /// signature and key fields cleared.
    pub fn signable_encoding(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        unsigned.key = None;
        unsigned.encode_to_vec()
    }
}

/// GossipSub control block.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ControlMessage {
    #[prost(message, repeated, tag = "1")]
    pub ihave: Vec<ControlIHave>,
    #[prost(message, repeated, tag = "2")]
    pub iwant: Vec<ControlIWant>,
    #[prost(message, repeated, tag = "3")]
    pub graft: Vec<ControlGraft>,
    #[prost(message, repeated, tag = "4")]
    pub prune: Vec<ControlPrune>,
}

impl ControlMessage {
    pub fn is_empty(&self) -> bool {
        self.ihave.is_empty()
            && self.iwant.is_empty()
            && self.graft.is_empty()
            && self.prune.is_empty()
    }
}

/// Gossip announcement: message ids the sender holds for a topic.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ControlIHave {
    #[prost(string, tag = "1")]
    pub topic_id: String,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub message_ids: Vec<Vec<u8>>,
}

/// Request for full messages previously announced via IHAVE.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ControlIWant {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub message_ids: Vec<Vec<u8>>,
}

/// Request to join the sender's mesh for a topic.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ControlGraft {
    #[prost(string, tag = "1")]
    pub topic_id: String,
}

/// Notification that the sender removed us from its mesh for a topic.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ControlPrune {
    #[prost(string, tag = "1")]
    pub topic_id: String,
}

// ============================================================================
// Noise handshake payload
// ============================================================================

/// Identity payload exchanged inside the Noise handshake.
///
/// The signature binds the long-term identity key to the per-connection
/// static Noise key (see [`crate::noise`]).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NoiseHandshakePayload {
    #[prost(bytes = "vec", tag = "1")]
    pub identity_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub identity_sig: Vec<u8>,
}

// ============================================================================
// Public keys
// ============================================================================

/// Protobuf encoding of a public key, the preimage of every peer id.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PublicKeyProto {
    #[prost(int32, tag = "1")]
    pub key_type: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}
