//! # Identity and Peer Addressing
//!
//! This module defines the identity types used throughout Weft:
//!
//! - [`Keypair`]: Ed25519 signing keypair for the local node
//! - [`PublicKey`]: a peer's public key with its protobuf wire encoding
//! - [`PeerId`]: stable peer identifier derived from the public key
//! - [`PeerInfo`]: a peer's id plus its known addresses and protocols
//!
//! ## Identity Model
//!
//! A `PeerId` is a multihash over the protobuf encoding of the public key.
//! Keys whose encoding fits in 42 bytes (every Ed25519 key does) are embedded
//! directly with the identity hash code; larger keys would be hashed with
//! SHA2-256. Equality and hashing are by multihash bytes, so a `PeerId` is a
//! stable, self-certifying map key.
//!
//! ## Invariants
//!
//! - `PeerId::from_bytes(id.to_bytes()) == id` (round-trip preservation)
//! - A `PeerId` built from a key always satisfies `matches_public_key`
//! - Only valid Ed25519 points are accepted as public keys

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use prost::Message as _;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::messages::PublicKeyProto;

/// Multihash code for the identity (no-op) hash function.
const MULTIHASH_IDENTITY: u64 = 0x00;

/// Multihash code for SHA2-256.
const MULTIHASH_SHA2_256: u64 = 0x12;

/// Keys whose protobuf encoding is at most this long are embedded in the
/// peer id verbatim instead of being hashed.
const MAX_INLINE_KEY_LENGTH: usize = 42;

/// Key type tag used in the public-key protobuf.
pub(crate) const KEY_TYPE_ED25519: i32 = 1;

type Multihash = multihash::Multihash<64>;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("malformed public-key protobuf")]
    InvalidKeyEncoding,
    #[error("unsupported key algorithm")]
    UnsupportedAlgorithm,
    #[error("public key is not a valid Ed25519 point")]
    InvalidKey,
    #[error("bytes are not a valid peer id")]
    InvalidPeerId,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature is missing")]
    Missing,
    #[error("signature has the wrong length")]
    InvalidLength,
    #[error("public key is invalid")]
    InvalidPublicKey,
    #[error("signature verification failed")]
    VerificationFailed,
}

// ============================================================================
// Keypair
// ============================================================================

/// Ed25519 signing keypair identifying the local node.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generates a fresh keypair from the OS entropy source.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restores a keypair from its 32-byte secret.
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(secret),
        }
    }

    /// The public half of this keypair.
    pub fn public(&self) -> PublicKey {
        PublicKey::Ed25519(self.signing.verifying_key().to_bytes())
    }

    /// The peer id derived from this keypair's public key.
    pub fn peer_id(&self) -> PeerId {
        self.public().to_peer_id()
    }

    /// Signs `data`, returning the 64-byte signature.
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing.sign(data).to_bytes().to_vec()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id())
            .finish()
    }
}

// ============================================================================
// PublicKey
// ============================================================================

/// A peer's public key.
#[derive(Clone, PartialEq, Eq)]
pub enum PublicKey {
    Ed25519([u8; 32]),
}

impl PublicKey {
    /// Encodes the key into its protobuf wire form.
    pub fn to_protobuf_encoding(&self) -> Vec<u8> {
        let PublicKey::Ed25519(key) = self;
        let proto = PublicKeyProto {
            key_type: KEY_TYPE_ED25519,
            data: key.to_vec(),
        };
        proto.encode_to_vec()
    }

    /// Decodes a key from its protobuf wire form.
    pub fn from_protobuf_encoding(bytes: &[u8]) -> Result<Self, IdentityError> {
        let proto =
            PublicKeyProto::decode(bytes).map_err(|_| IdentityError::InvalidKeyEncoding)?;
        if proto.key_type != KEY_TYPE_ED25519 {
            return Err(IdentityError::UnsupportedAlgorithm);
        }
        let key: [u8; 32] = proto.data[..]
            .try_into()
            .map_err(|_| IdentityError::InvalidKey)?;
        // Reject encodings that are not valid curve points up front.
        VerifyingKey::from_bytes(&key).map_err(|_| IdentityError::InvalidKey)?;
        Ok(PublicKey::Ed25519(key))
    }

    /// Verifies `signature` over `data` under this key.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
        if signature.is_empty() {
            return Err(SignatureError::Missing);
        }
        let sig_bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| SignatureError::InvalidLength)?;
        let PublicKey::Ed25519(key) = self;
        let verifying =
            VerifyingKey::from_bytes(key).map_err(|_| SignatureError::InvalidPublicKey)?;
        verifying
            .verify_strict(data, &Signature::from_bytes(&sig_bytes))
            .map_err(|_| SignatureError::VerificationFailed)
    }

    /// The peer id derived from this key.
    pub fn to_peer_id(&self) -> PeerId {
        let encoded = self.to_protobuf_encoding();
        let multihash = if encoded.len() <= MAX_INLINE_KEY_LENGTH {
            Multihash::wrap(MULTIHASH_IDENTITY, &encoded)
        } else {
            Multihash::wrap(MULTIHASH_SHA2_256, Sha256::digest(&encoded).as_slice())
        }
        .expect("digest fits the multihash size bound");
        PeerId { multihash }
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let PublicKey::Ed25519(key) = self;
        write!(f, "Ed25519({})", hex::encode(&key[..8]))
    }
}

// ============================================================================
// PeerId
// ============================================================================

/// Stable identifier of a node, derived from its public key.
#[derive(Clone, Eq)]
pub struct PeerId {
    multihash: Multihash,
}

impl PeerId {
    /// Parses a peer id from its raw multihash bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        let multihash =
            Multihash::from_bytes(bytes).map_err(|_| IdentityError::InvalidPeerId)?;
        match multihash.code() {
            MULTIHASH_SHA2_256 => Ok(PeerId { multihash }),
            MULTIHASH_IDENTITY => {
                if multihash.digest().len() > MAX_INLINE_KEY_LENGTH {
                    return Err(IdentityError::InvalidPeerId);
                }
                PublicKey::from_protobuf_encoding(multihash.digest())
                    .map_err(|_| IdentityError::InvalidPeerId)?;
                Ok(PeerId { multihash })
            }
            _ => Err(IdentityError::InvalidPeerId),
        }
    }

    /// Raw multihash bytes of this peer id.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.multihash.to_bytes()
    }

    /// Base58 rendering, the canonical human-readable form.
    pub fn to_base58(&self) -> String {
        bs58::encode(self.multihash.to_bytes()).into_string()
    }

    /// Whether `key` is the public key this id was derived from.
    pub fn matches_public_key(&self, key: &PublicKey) -> bool {
        key.to_peer_id() == *self
    }
}

impl PartialEq for PeerId {
    fn eq(&self, other: &Self) -> bool {
        self.multihash.to_bytes() == other.multihash.to_bytes()
    }
}

impl Hash for PeerId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.multihash.to_bytes().hash(state);
    }
}

impl PartialOrd for PeerId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PeerId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.multihash.to_bytes().cmp(&other.multihash.to_bytes())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PeerId").field(&self.to_base58()).finish()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.to_base58().fmt(f)
    }
}

impl FromStr for PeerId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|_| IdentityError::InvalidPeerId)?;
        PeerId::from_bytes(&bytes)
    }
}

// ============================================================================
// PeerInfo
// ============================================================================

/// A peer's id together with its known addresses and protocols.
///
/// The local node's private key lives in the [`Keypair`] held by the switch;
/// `PeerInfo` only ever carries public material.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub addrs: Vec<SocketAddr>,
    pub protocols: Vec<String>,
}

impl PeerInfo {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            addrs: Vec::new(),
            protocols: Vec::new(),
        }
    }

    pub fn with_addr(peer_id: PeerId, addr: SocketAddr) -> Self {
        Self {
            peer_id,
            addrs: vec![addr],
            protocols: Vec::new(),
        }
    }
}
