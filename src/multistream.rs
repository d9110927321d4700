//! # Multistream-Select
//!
//! Line-oriented protocol negotiation run at every layer boundary: once per
//! connection to pick the security protocol, once per secured connection to
//! pick the muxer, and once per channel to pick the application protocol.
//!
//! ## Wire format
//!
//! Every message is `varint(len) || utf8 || '\n'`. Both sides start by
//! sending the header `/multistream/1.0.0`. The dialer then proposes
//! protocol ids one at a time; the listener echoes an id to accept it or
//! answers `na`. A dialer may instead send `ls` to receive the full list of
//! registered ids in a single length-prefixed reply.

use thiserror::Error;
use tracing::trace;

use crate::stream::{ByteStream, StreamError, read_length_prefixed, write_length_prefixed};

/// Header id both sides send before anything else.
pub const PROTOCOL_ID: &str = "/multistream/1.0.0";

const MSG_NA: &str = "na";
const MSG_LS: &str = "ls";

/// Negotiation messages are short; anything bigger is a protocol violation.
const MAX_MESSAGE_LEN: usize = 1024;

/// How many `na` rounds a listener tolerates before giving up.
const MAX_NEGOTIATION_ROUNDS: usize = 64;

#[derive(Debug, Error)]
pub enum NegotiationError {
    /// The remote supports none of the proposed protocols.
    #[error("none of the proposed protocols is supported by the remote")]
    ProtocolNotSupported,
    /// The remote violated the negotiation protocol.
    #[error("negotiation failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// One entry a listener can negotiate: an exact id, plus an optional matcher
/// predicate for protocols with structured ids (versions, prefixes).
pub struct ProtocolOffer<'a> {
    pub id: &'a str,
    pub matcher: Option<&'a (dyn Fn(&str) -> bool + Send + Sync)>,
}

impl<'a> ProtocolOffer<'a> {
    pub fn exact(id: &'a str) -> Self {
        Self { id, matcher: None }
    }

    fn matches(&self, proposed: &str) -> bool {
        match self.matcher {
            Some(matcher) => matcher(proposed),
            None => self.id == proposed,
        }
    }
}

async fn send_message<S: ByteStream + ?Sized>(
    io: &mut S,
    msg: &str,
) -> Result<(), NegotiationError> {
    let mut line = Vec::with_capacity(msg.len() + 1);
    line.extend_from_slice(msg.as_bytes());
    line.push(b'\n');
    write_length_prefixed(io, &line).await?;
    Ok(())
}

async fn recv_message<S: ByteStream + ?Sized>(io: &mut S) -> Result<String, NegotiationError> {
    let line = read_length_prefixed(io, MAX_MESSAGE_LEN)
        .await?
        .ok_or(NegotiationError::Failed("stream ended mid-negotiation".into()))?;
    if line.last() != Some(&b'\n') {
        return Err(NegotiationError::Failed(
            "message is not newline-terminated".into(),
        ));
    }
    String::from_utf8(line[..line.len() - 1].to_vec())
        .map_err(|_| NegotiationError::Failed("message is not valid utf-8".into()))
}

async fn exchange_header<S: ByteStream + ?Sized>(io: &mut S) -> Result<(), NegotiationError> {
    send_message(io, PROTOCOL_ID).await?;
    let header = recv_message(io).await?;
    if header != PROTOCOL_ID {
        return Err(NegotiationError::Failed(format!(
            "unexpected multistream header {header:?}"
        )));
    }
    Ok(())
}

/// Dialer side: proposes `candidates` in order and returns the accepted id.
pub async fn dialer_select<S: ByteStream + ?Sized>(
    io: &mut S,
    candidates: &[&str],
) -> Result<String, NegotiationError> {
    exchange_header(io).await?;
    for candidate in candidates {
        send_message(io, candidate).await?;
        let reply = recv_message(io).await?;
        if reply == *candidate {
            trace!(protocol = candidate, "negotiated");
            return Ok(reply);
        }
        if reply == MSG_NA {
            continue;
        }
        return Err(NegotiationError::Failed(format!(
            "unexpected reply {reply:?} to proposal {candidate:?}"
        )));
    }
    Err(NegotiationError::ProtocolNotSupported)
}

/// Listener side: answers proposals until one matches an offer, and serves
/// `ls` listings along the way. Returns the accepted (proposed) id.
pub async fn listener_negotiate<S: ByteStream + ?Sized>(
    io: &mut S,
    offers: &[ProtocolOffer<'_>],
) -> Result<String, NegotiationError> {
    exchange_header(io).await?;
    for _ in 0..MAX_NEGOTIATION_ROUNDS {
        let proposed = recv_message(io).await?;
        if proposed == MSG_LS {
            let mut listing = Vec::new();
            for offer in offers {
                listing.extend_from_slice(offer.id.as_bytes());
                listing.push(b'\n');
            }
            write_length_prefixed(io, &listing).await.map_err(NegotiationError::Stream)?;
            continue;
        }
        if offers.iter().any(|offer| offer.matches(&proposed)) {
            send_message(io, &proposed).await?;
            trace!(protocol = %proposed, "negotiated");
            return Ok(proposed);
        }
        send_message(io, MSG_NA).await?;
    }
    Err(NegotiationError::Failed("too many rejected proposals".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testing::memory_pair;

    #[tokio::test]
    async fn first_candidate_accepted() {
        let (mut a, mut b) = memory_pair();
        let dialer = tokio::spawn(async move {
            dialer_select(&mut a, &["/echo/1.0.0"]).await
        });
        let listener = tokio::spawn(async move {
            let offers = [ProtocolOffer::exact("/echo/1.0.0")];
            listener_negotiate(&mut b, &offers).await
        });
        assert_eq!(dialer.await.unwrap().unwrap(), "/echo/1.0.0");
        assert_eq!(listener.await.unwrap().unwrap(), "/echo/1.0.0");
    }

    #[tokio::test]
    async fn falls_back_after_na() {
        let (mut a, mut b) = memory_pair();
        let dialer = tokio::spawn(async move {
            dialer_select(&mut a, &["/fancy/2.0.0", "/plain/1.0.0"]).await
        });
        let listener = tokio::spawn(async move {
            let offers = [ProtocolOffer::exact("/plain/1.0.0")];
            listener_negotiate(&mut b, &offers).await
        });
        assert_eq!(dialer.await.unwrap().unwrap(), "/plain/1.0.0");
        assert_eq!(listener.await.unwrap().unwrap(), "/plain/1.0.0");
    }

    #[tokio::test]
    async fn no_common_protocol() {
        let (mut a, mut b) = memory_pair();
        let dialer = tokio::spawn(async move {
            dialer_select(&mut a, &["/fancy/2.0.0"]).await
        });
        let listener = tokio::spawn(async move {
            let offers = [ProtocolOffer::exact("/plain/1.0.0")];
            listener_negotiate(&mut b, &offers).await
        });
        assert!(matches!(
            dialer.await.unwrap(),
            Err(NegotiationError::ProtocolNotSupported)
        ));
        // Listener keeps waiting for further proposals and then hits EOF.
        drop(listener);
    }

    #[tokio::test]
    async fn matcher_predicate_accepts_versions() {
        let (mut a, mut b) = memory_pair();
        let dialer = tokio::spawn(async move {
            dialer_select(&mut a, &["/kv/1.3.0"]).await
        });
        let listener = tokio::spawn(async move {
            let matcher = |proposed: &str| proposed.starts_with("/kv/1.");
            let offers = [ProtocolOffer {
                id: "/kv/1.0.0",
                matcher: Some(&matcher),
            }];
            listener_negotiate(&mut b, &offers).await
        });
        assert_eq!(dialer.await.unwrap().unwrap(), "/kv/1.3.0");
        assert_eq!(listener.await.unwrap().unwrap(), "/kv/1.3.0");
    }

    #[tokio::test]
    async fn ls_returns_the_listing() {
        let (mut a, mut b) = memory_pair();
        let listener = tokio::spawn(async move {
            let offers = [
                ProtocolOffer::exact("/echo/1.0.0"),
                ProtocolOffer::exact("/kv/1.0.0"),
            ];
            listener_negotiate(&mut b, &offers).await
        });

        exchange_header(&mut a).await.unwrap();
        send_message(&mut a, MSG_LS).await.unwrap();
        let listing = read_length_prefixed(&mut a, 4096).await.unwrap().unwrap();
        assert_eq!(listing, b"/echo/1.0.0\n/kv/1.0.0\n");

        // Finish the negotiation so the listener returns.
        send_message(&mut a, "/echo/1.0.0").await.unwrap();
        assert_eq!(recv_message(&mut a).await.unwrap(), "/echo/1.0.0");
        assert_eq!(listener.await.unwrap().unwrap(), "/echo/1.0.0");
    }

    #[tokio::test]
    async fn bad_header_is_rejected() {
        let (mut a, mut b) = memory_pair();
        let dialer = tokio::spawn(async move { dialer_select(&mut a, &["/echo/1.0.0"]).await });
        // Speak garbage instead of the multistream header.
        send_message(&mut b, "/bogus/0.0.0").await.unwrap();
        assert!(matches!(
            dialer.await.unwrap(),
            Err(NegotiationError::Failed(_))
        ));
    }
}
