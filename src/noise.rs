//! # Noise XX Secure Channel
//!
//! Mutually authenticates two peers and provides the encrypted record layer
//! every higher layer rides on.
//!
//! ## Handshake
//!
//! Pattern `Noise_XX_25519_ChaChaPoly_SHA256`, three messages:
//!
//! 1. initiator → responder: `e`
//! 2. responder → initiator: `e, ee, s, es` + responder identity payload
//! 3. initiator → responder: `s, se` + initiator identity payload
//!
//! The static Noise key is generated per connection; the identity payload
//! carries the long-term Ed25519 key and its signature over
//! `"noise-libp2p-static-key:" || static_public_key`, binding the two
//! together. An initiator that dialed a specific [`PeerId`] verifies the
//! derived id matches and fails the handshake with
//! [`NoiseError::PeerIdMismatch`] otherwise. The whole exchange runs under a
//! 60 second deadline.
//!
//! ## Record layer
//!
//! Each record is a 2-byte big-endian length prefix followed by ciphertext
//! with a 16-byte tag. Writes are chunked to at most 65519 plaintext bytes;
//! reads skip zero-length plaintexts. The cipher runs in stateless mode with
//! one explicit nonce counter per direction, which lets
//! [`SecureConnection::into_split`] hand independent reader and writer halves
//! to the muxer. A counter reaching 2⁶⁴−1 is fatal for the connection.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use prost::Message as _;
use snow::params::NoiseParams;
use snow::{Builder, HandshakeState, StatelessTransportState};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::connection::{BoxedReader, BoxedWriter, ConnMeta, Connection};
use crate::identity::{Keypair, PeerId, PublicKey};
use crate::messages::NoiseHandshakePayload;
use crate::stream::{ByteStream, StreamError};
use crate::tracker::{Resource, ResourceTracker};

/// Protocol id requested via multistream-select for the security upgrade.
pub const PROTOCOL_ID: &str = "/noise";

const NOISE_PARAMS: &str = "Noise_XX_25519_ChaChaPoly_SHA256";

/// Largest plaintext that fits one record (65535 minus the 16-byte tag).
pub const MAX_PLAINTEXT_LEN: usize = 65519;

const TAG_LEN: usize = 16;

/// Hard deadline for the complete three-message handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Prefix of the byte string signed by the identity key to endorse the
/// per-connection static Noise key.
const STATIC_KEY_DOMAIN: &[u8] = b"noise-libp2p-static-key:";

#[derive(Debug, Error)]
pub enum NoiseError {
    /// Malformed handshake message, short read, or bad key material.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// Authentication tag mismatch while decrypting.
    #[error("decryption failed")]
    Decrypt,
    /// A direction's nonce counter reached its final value.
    #[error("nonce counter exhausted")]
    NonceExhausted,
    /// The responder's identity does not match the dialed peer id.
    #[error("remote identity does not match the dialed peer id")]
    PeerIdMismatch,
    /// The identity payload could not be decoded or carried a bad key.
    #[error("malformed identity payload")]
    InvalidPayload,
    #[error("handshake timed out")]
    Timeout,
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("noise protocol error: {0}")]
    Snow(snow::Error),
}

impl From<snow::Error> for NoiseError {
    fn from(err: snow::Error) -> Self {
        match err {
            snow::Error::Decrypt => NoiseError::Decrypt,
            other => NoiseError::Snow(other),
        }
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// Runs the initiator side of the handshake over a fresh connection.
///
/// When `expected` is given, the responder's identity must derive to exactly
/// that peer id. The connection is closed on any failure.
pub async fn upgrade_outbound(
    mut conn: Connection,
    keypair: &Keypair,
    expected: Option<&PeerId>,
    tracker: Arc<dyn ResourceTracker>,
) -> Result<SecureConnection, NoiseError> {
    match timeout(HANDSHAKE_TIMEOUT, initiator_handshake(&mut conn, keypair, expected)).await {
        Ok(Ok((transport, remote_peer))) => {
            debug!(%remote_peer, "outbound noise handshake complete");
            Ok(SecureConnection::new(conn, transport, remote_peer, tracker))
        }
        Ok(Err(e)) => {
            let _ = conn.close().await;
            Err(e)
        }
        Err(_) => {
            let _ = conn.close().await;
            Err(NoiseError::Timeout)
        }
    }
}

/// Runs the responder side of the handshake over a fresh connection.
pub async fn upgrade_inbound(
    mut conn: Connection,
    keypair: &Keypair,
    tracker: Arc<dyn ResourceTracker>,
) -> Result<SecureConnection, NoiseError> {
    match timeout(HANDSHAKE_TIMEOUT, responder_handshake(&mut conn, keypair)).await {
        Ok(Ok((transport, remote_peer))) => {
            debug!(%remote_peer, "inbound noise handshake complete");
            Ok(SecureConnection::new(conn, transport, remote_peer, tracker))
        }
        Ok(Err(e)) => {
            let _ = conn.close().await;
            Err(e)
        }
        Err(_) => {
            let _ = conn.close().await;
            Err(NoiseError::Timeout)
        }
    }
}

async fn initiator_handshake(
    conn: &mut Connection,
    keypair: &Keypair,
    expected: Option<&PeerId>,
) -> Result<(StatelessTransportState, PeerId), NoiseError> {
    let params: NoiseParams = NOISE_PARAMS.parse().expect("valid noise pattern");
    let static_key = Builder::new(params.clone()).generate_keypair()?;
    let mut hs = Builder::new(params)
        .local_private_key(&static_key.private)
        .build_initiator()?;
    let mut buf = vec![0u8; u16::MAX as usize];

    // -> e
    let len = hs.write_message(&[], &mut buf)?;
    write_frame(conn, &buf[..len]).await?;

    // <- e, ee, s, es  (responder proves its identity here)
    let msg = read_frame(conn).await?;
    let mut payload = vec![0u8; msg.len()];
    let n = hs.read_message(&msg, &mut payload)?;
    let remote_peer = verify_identity_payload(&hs, &payload[..n])?;
    if let Some(expected) = expected
        && *expected != remote_peer
    {
        return Err(NoiseError::PeerIdMismatch);
    }

    // -> s, se  (now prove ours)
    let our_payload = build_identity_payload(keypair, &static_key.public);
    let len = hs.write_message(&our_payload, &mut buf)?;
    write_frame(conn, &buf[..len]).await?;

    Ok((hs.into_stateless_transport_mode()?, remote_peer))
}

async fn responder_handshake(
    conn: &mut Connection,
    keypair: &Keypair,
) -> Result<(StatelessTransportState, PeerId), NoiseError> {
    let params: NoiseParams = NOISE_PARAMS.parse().expect("valid noise pattern");
    let static_key = Builder::new(params.clone()).generate_keypair()?;
    let mut hs = Builder::new(params)
        .local_private_key(&static_key.private)
        .build_responder()?;
    let mut buf = vec![0u8; u16::MAX as usize];

    // <- e  (payload, if any, carries nothing of interest)
    let msg = read_frame(conn).await?;
    let mut payload = vec![0u8; msg.len().max(1)];
    hs.read_message(&msg, &mut payload)?;

    // -> e, ee, s, es
    let our_payload = build_identity_payload(keypair, &static_key.public);
    let len = hs.write_message(&our_payload, &mut buf)?;
    write_frame(conn, &buf[..len]).await?;

    // <- s, se
    let msg = read_frame(conn).await?;
    let mut payload = vec![0u8; msg.len()];
    let n = hs.read_message(&msg, &mut payload)?;
    let remote_peer = verify_identity_payload(&hs, &payload[..n])?;

    Ok((hs.into_stateless_transport_mode()?, remote_peer))
}

fn build_identity_payload(keypair: &Keypair, static_public: &[u8]) -> Vec<u8> {
    let mut to_sign = Vec::with_capacity(STATIC_KEY_DOMAIN.len() + static_public.len());
    to_sign.extend_from_slice(STATIC_KEY_DOMAIN);
    to_sign.extend_from_slice(static_public);
    NoiseHandshakePayload {
        identity_key: keypair.public().to_protobuf_encoding(),
        identity_sig: keypair.sign(&to_sign),
    }
    .encode_to_vec()
}

/// Checks the payload signature against the remote's static Noise key and
/// returns the peer id the identity key derives to.
fn verify_identity_payload(hs: &HandshakeState, payload: &[u8]) -> Result<PeerId, NoiseError> {
    let remote_static = hs
        .get_remote_static()
        .ok_or_else(|| NoiseError::Handshake("remote static key not yet received".into()))?;
    let decoded =
        NoiseHandshakePayload::decode(payload).map_err(|_| NoiseError::InvalidPayload)?;
    let identity_key = PublicKey::from_protobuf_encoding(&decoded.identity_key)
        .map_err(|_| NoiseError::InvalidPayload)?;

    let mut signed = Vec::with_capacity(STATIC_KEY_DOMAIN.len() + remote_static.len());
    signed.extend_from_slice(STATIC_KEY_DOMAIN);
    signed.extend_from_slice(remote_static);
    identity_key
        .verify(&signed, &decoded.identity_sig)
        .map_err(|e| NoiseError::Handshake(format!("identity signature rejected: {e}")))?;

    Ok(identity_key.to_peer_id())
}

async fn write_frame(conn: &mut Connection, payload: &[u8]) -> Result<(), NoiseError> {
    let mut framed = Vec::with_capacity(2 + payload.len());
    framed.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    framed.extend_from_slice(payload);
    conn.write_all(&framed).await?;
    Ok(())
}

async fn read_frame(conn: &mut Connection) -> Result<Vec<u8>, NoiseError> {
    let len_bytes = conn.read_exact(2).await?;
    let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
    if len == 0 {
        return Ok(Vec::new());
    }
    Ok(conn.read_exact(len).await?)
}

// ============================================================================
// Record layer
// ============================================================================

/// Tracker handle shared by the two halves; releases once on last drop.
struct SecGuard {
    tracker: Arc<dyn ResourceTracker>,
    released: AtomicBool,
}

impl SecGuard {
    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.tracker.closed(Resource::SecureChannel);
        }
    }
}

impl Drop for SecGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Decrypting read half of a secure connection.
pub struct SecureReader {
    io: BoxedReader,
    meta: Arc<ConnMeta>,
    cipher: Arc<StatelessTransportState>,
    nonce: u64,
    /// Decrypted-but-unconsumed plaintext, so `read_exact` and `read_once`
    /// compose across record boundaries.
    pending: VecDeque<u8>,
    guard: Arc<SecGuard>,
}

/// Encrypting write half of a secure connection.
pub struct SecureWriter {
    io: BoxedWriter,
    meta: Arc<ConnMeta>,
    cipher: Arc<StatelessTransportState>,
    nonce: u64,
    guard: Arc<SecGuard>,
}

/// A connection whose reads and writes pass through the Noise cipher pair.
pub struct SecureConnection {
    reader: SecureReader,
    writer: SecureWriter,
    remote_peer: PeerId,
}

impl std::fmt::Debug for SecureConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureConnection")
            .field("remote_peer", &self.remote_peer)
            .finish_non_exhaustive()
    }
}

impl SecureConnection {
    fn new(
        conn: Connection,
        transport: StatelessTransportState,
        remote_peer: PeerId,
        tracker: Arc<dyn ResourceTracker>,
    ) -> Self {
        tracker.opened(Resource::SecureChannel);
        let guard = Arc::new(SecGuard {
            tracker,
            released: AtomicBool::new(false),
        });
        let (io_reader, io_writer, meta) = conn.into_parts();
        let cipher = Arc::new(transport);
        SecureConnection {
            reader: SecureReader {
                io: io_reader,
                meta: meta.clone(),
                cipher: cipher.clone(),
                nonce: 0,
                pending: VecDeque::new(),
                guard: guard.clone(),
            },
            writer: SecureWriter {
                io: io_writer,
                meta,
                cipher,
                nonce: 0,
                guard,
            },
            remote_peer,
        }
    }

    /// Identity of the authenticated remote peer.
    pub fn remote_peer(&self) -> &PeerId {
        &self.remote_peer
    }

    /// Splits into independent halves for the muxer's read loop and the
    /// serialized write path.
    pub fn into_split(self) -> (SecureReader, SecureWriter) {
        (self.reader, self.writer)
    }
}

fn next_nonce(nonce: &mut u64) -> Result<u64, StreamError> {
    if *nonce == u64::MAX {
        return Err(StreamError::Crypto("nonce counter exhausted".into()));
    }
    let current = *nonce;
    *nonce += 1;
    Ok(current)
}

impl SecureReader {
    /// Reads and decrypts records until one with a non-empty plaintext
    /// arrives. `Ok(None)` on clean EOF at a record boundary.
    async fn read_record(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        loop {
            let len_bytes = match Connection::read_exact_raw(&mut self.io, &self.meta, 2).await {
                Ok(buf) => buf,
                Err(StreamError::IncompleteRead { got: 0, .. }) => return Ok(None),
                Err(e) => return Err(e),
            };
            let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
            if len == 0 {
                trace!("skipping zero-length record");
                continue;
            }
            let ciphertext = Connection::read_exact_raw(&mut self.io, &self.meta, len).await?;
            if ciphertext.len() < TAG_LEN {
                return Err(StreamError::InvalidData("record shorter than auth tag".into()));
            }
            let nonce = next_nonce(&mut self.nonce)?;
            let mut plaintext = vec![0u8; ciphertext.len()];
            let n = self
                .cipher
                .read_message(nonce, &ciphertext, &mut plaintext)
                .map_err(|e| match e {
                    snow::Error::Decrypt => {
                        StreamError::Crypto("record authentication failed".into())
                    }
                    other => StreamError::Crypto(other.to_string()),
                })?;
            if n == 0 {
                trace!("skipping empty plaintext");
                continue;
            }
            plaintext.truncate(n);
            return Ok(Some(plaintext));
        }
    }
}

#[async_trait]
impl ByteStream for SecureReader {
    async fn read_once(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        if !self.pending.is_empty() {
            return Ok(Some(self.pending.drain(..).collect()));
        }
        self.read_record().await
    }

    async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, StreamError> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            if self.pending.is_empty() {
                match self.read_record().await? {
                    Some(plain) => self.pending.extend(plain),
                    None => {
                        return Err(StreamError::IncompleteRead {
                            expected: n,
                            got: out.len(),
                        });
                    }
                }
            }
            let take = (n - out.len()).min(self.pending.len());
            out.extend(self.pending.drain(..take));
        }
        Ok(out)
    }

    async fn write_all(&mut self, _data: &[u8]) -> Result<(), StreamError> {
        Err(StreamError::WriteClosed)
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.meta.is_closed()
    }

    fn at_eof(&self) -> bool {
        self.pending.is_empty() && self.meta.at_eof()
    }
}

impl SecureWriter {
    /// Encrypts and writes `data`, chunked to the record-size bound.
    pub(crate) async fn write_records(&mut self, data: &[u8]) -> Result<(), StreamError> {
        if self.meta.is_closed() {
            return Err(StreamError::WriteClosed);
        }
        for chunk in data.chunks(MAX_PLAINTEXT_LEN) {
            let nonce = next_nonce(&mut self.nonce)?;
            let mut record = vec![0u8; 2 + chunk.len() + TAG_LEN];
            let n = self
                .cipher
                .write_message(nonce, chunk, &mut record[2..])
                .map_err(|e| StreamError::Crypto(e.to_string()))?;
            record[..2].copy_from_slice(&(n as u16).to_be_bytes());
            record.truncate(2 + n);
            self.io.write_all(&record).await?;
        }
        self.io.flush().await?;
        self.meta.touch();
        Ok(())
    }

    /// Closes the write direction of the underlying socket.
    pub(crate) async fn shutdown(&mut self) -> Result<(), StreamError> {
        if !self.meta.set_closed() {
            return Ok(());
        }
        let res = self.io.shutdown().await;
        self.guard.release();
        self.meta.release();
        res.map_err(StreamError::from)
    }
}

#[async_trait]
impl ByteStream for SecureConnection {
    async fn read_once(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        self.reader.read_once().await
    }

    async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, StreamError> {
        self.reader.read_exact(n).await
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), StreamError> {
        self.writer.write_records(data).await
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        self.writer.shutdown().await
    }

    fn is_closed(&self) -> bool {
        self.writer.meta.is_closed()
    }

    fn at_eof(&self) -> bool {
        self.reader.at_eof()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Direction;
    use crate::tracker::{self, CountingTracker};
    use std::net::SocketAddr;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn conn_pair(tracker: Arc<dyn ResourceTracker>) -> (Connection, Connection) {
        let (a, b) = tokio::io::duplex(1 << 20);
        (
            Connection::new(a, Direction::Outbound, test_addr(), tracker.clone()),
            Connection::new(b, Direction::Inbound, test_addr(), tracker),
        )
    }

    async fn secure_pair() -> (SecureConnection, SecureConnection, Keypair, Keypair) {
        let kp_a = Keypair::generate();
        let kp_b = Keypair::generate();
        let (conn_a, conn_b) = conn_pair(tracker::noop());
        let expected = kp_b.peer_id();

        let kp_a2 = kp_a.clone();
        let kp_b2 = kp_b.clone();
        let initiator = tokio::spawn(async move {
            upgrade_outbound(conn_a, &kp_a2, Some(&expected), tracker::noop()).await
        });
        let responder =
            tokio::spawn(async move { upgrade_inbound(conn_b, &kp_b2, tracker::noop()).await });

        let a = initiator.await.unwrap().expect("initiator handshake");
        let b = responder.await.unwrap().expect("responder handshake");
        (a, b, kp_a, kp_b)
    }

    #[tokio::test]
    async fn handshake_authenticates_both_sides() {
        let (a, b, kp_a, kp_b) = secure_pair().await;
        assert_eq!(*a.remote_peer(), kp_b.peer_id());
        assert_eq!(*b.remote_peer(), kp_a.peer_id());
    }

    #[tokio::test]
    async fn records_round_trip_both_directions() {
        let (mut a, mut b, _, _) = secure_pair().await;

        a.write_all(b"from the initiator").await.unwrap();
        assert_eq!(b.read_exact(18).await.unwrap(), b"from the initiator");

        b.write_all(b"from the responder").await.unwrap();
        assert_eq!(a.read_exact(18).await.unwrap(), b"from the responder");
    }

    #[tokio::test]
    async fn large_writes_are_chunked() {
        let (mut a, mut b, _, _) = secure_pair().await;

        // One byte over the single-record bound forces two records.
        let data: Vec<u8> = (0..MAX_PLAINTEXT_LEN + 1).map(|i| (i % 251) as u8).collect();
        let expected = data.clone();
        tokio::spawn(async move {
            a.write_all(&data).await.unwrap();
        });

        let first = b.read_once().await.unwrap().unwrap();
        assert_eq!(first.len(), MAX_PLAINTEXT_LEN);
        let rest = b.read_exact(1).await.unwrap();
        assert_eq!(first[..], expected[..MAX_PLAINTEXT_LEN]);
        assert_eq!(rest[0], expected[MAX_PLAINTEXT_LEN]);
    }

    #[tokio::test]
    async fn exact_boundary_fits_one_record() {
        let (mut a, mut b, _, _) = secure_pair().await;
        let data = vec![0x5a; MAX_PLAINTEXT_LEN];
        tokio::spawn(async move {
            a.write_all(&data).await.unwrap();
        });
        let chunk = b.read_once().await.unwrap().unwrap();
        assert_eq!(chunk.len(), MAX_PLAINTEXT_LEN);
    }

    #[tokio::test]
    async fn empty_plaintext_records_are_skipped() {
        let (a, mut b, _, _) = secure_pair().await;
        let (_reader, mut writer) = a.into_split();

        // Hand-craft an empty-plaintext record followed by a real one.
        let nonce = next_nonce(&mut writer.nonce).unwrap();
        let mut record = vec![0u8; 2 + TAG_LEN];
        let n = writer.cipher.write_message(nonce, &[], &mut record[2..]).unwrap();
        record[..2].copy_from_slice(&(n as u16).to_be_bytes());
        writer.io.write_all(&record).await.unwrap();
        writer.write_records(b"visible").await.unwrap();

        assert_eq!(b.read_exact(7).await.unwrap(), b"visible");
    }

    #[tokio::test]
    async fn peer_id_mismatch_fails_the_dial() {
        let kp_a = Keypair::generate();
        let kp_b = Keypair::generate();
        let wrong = Keypair::generate().peer_id();
        let (conn_a, conn_b) = conn_pair(tracker::noop());

        let initiator = tokio::spawn(async move {
            upgrade_outbound(conn_a, &kp_a, Some(&wrong), tracker::noop()).await
        });
        let responder =
            tokio::spawn(async move { upgrade_inbound(conn_b, &kp_b, tracker::noop()).await });

        let err = initiator.await.unwrap().unwrap_err();
        assert!(matches!(err, NoiseError::PeerIdMismatch));
        // The responder sees the connection die before message 3.
        assert!(responder.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn secure_channel_tracker_balances() {
        let tracker = CountingTracker::new();
        let kp_a = Keypair::generate();
        let kp_b = Keypair::generate();
        let (conn_a, conn_b) = conn_pair(tracker.clone());

        let t1 = tracker.clone();
        let initiator =
            tokio::spawn(async move { upgrade_outbound(conn_a, &kp_a, None, t1).await });
        let t2 = tracker.clone();
        let responder = tokio::spawn(async move { upgrade_inbound(conn_b, &kp_b, t2).await });

        let mut a = initiator.await.unwrap().unwrap();
        let mut b = responder.await.unwrap().unwrap();
        assert_eq!(tracker.live(Resource::SecureChannel), 2);

        a.close().await.unwrap();
        b.close().await.unwrap();
        drop(a);
        drop(b);
        assert!(tracker.balanced());
    }
}
