//! # Byte-Stream Capability Boundary
//!
//! Every layer of the connection pipeline exposes the same small byte-stream
//! surface: read one chunk, read an exact number of bytes, write, close, and
//! query the closed/EOF flags. [`ByteStream`] is the single polymorphic
//! boundary in the crate; the layers themselves ([`crate::connection::Connection`],
//! [`crate::noise::SecureConnection`], [`crate::mplex::MplexChannel`]) are
//! concrete structs that each own the layer beneath them.
//!
//! Length-prefixed message helpers live here as well since multistream-select
//! and the pubsub RPC framing both use `varint(len) || payload`.

use async_trait::async_trait;
use thiserror::Error;

use crate::varint::{put_uvarint, read_uvarint};

/// Errors surfaced by byte-stream operations.
#[derive(Debug, Error)]
pub enum StreamError {
    /// EOF arrived before the expected number of bytes.
    #[error("stream ended after {got} of {expected} expected bytes")]
    IncompleteRead { expected: usize, got: usize },
    /// The read side of the stream is no longer usable.
    #[error("read side of the stream is closed")]
    ReadClosed,
    /// The local side already closed its write direction.
    #[error("stream is closed for writing")]
    WriteClosed,
    /// A length-prefixed message exceeded the caller's limit.
    #[error("message of {size} bytes exceeds the limit of {limit}")]
    LimitExceeded { size: usize, limit: usize },
    /// The channel was reset, discarding any buffered data.
    #[error("channel was reset")]
    Reset,
    /// The peer sent bytes that violate the framing rules.
    #[error("invalid data on stream: {0}")]
    InvalidData(String),
    /// Fatal secure-channel failure (bad auth tag, nonce exhaustion).
    #[error("secure channel failure: {0}")]
    Crypto(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// The byte-stream capability set shared by every pipeline layer.
///
/// `read_once` returns `Ok(None)` at EOF. `read_exact` fails with
/// [`StreamError::IncompleteRead`] when EOF interrupts it. Implementations
/// keep their own rebuffering state so `read_exact` and `read_once` can be
/// mixed freely.
#[async_trait]
pub trait ByteStream: Send {
    /// Reads the next available chunk of bytes, or `None` at EOF.
    async fn read_once(&mut self) -> Result<Option<Vec<u8>>, StreamError>;

    /// Reads exactly `n` bytes.
    async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, StreamError>;

    /// Writes all of `data`.
    async fn write_all(&mut self, data: &[u8]) -> Result<(), StreamError>;

    /// Closes the local write direction. Idempotent.
    async fn close(&mut self) -> Result<(), StreamError>;

    /// Whether the local side has closed the stream.
    fn is_closed(&self) -> bool;

    /// Whether the remote side has signalled EOF.
    fn at_eof(&self) -> bool;
}

/// Reads one `varint(len) || payload` message, enforcing `max` on the length.
///
/// Returns `Ok(None)` on a clean EOF at a message boundary.
pub async fn read_length_prefixed<S: ByteStream + ?Sized>(
    io: &mut S,
    max: usize,
) -> Result<Option<Vec<u8>>, StreamError> {
    let len = match read_uvarint(io).await? {
        Some(len) => len,
        None => return Ok(None),
    };
    if len > max as u64 {
        return Err(StreamError::LimitExceeded {
            size: len as usize,
            limit: max,
        });
    }
    if len == 0 {
        return Ok(Some(Vec::new()));
    }
    Ok(Some(io.read_exact(len as usize).await?))
}

/// Writes `data` as one `varint(len) || payload` message.
pub async fn write_length_prefixed<S: ByteStream + ?Sized>(
    io: &mut S,
    data: &[u8],
) -> Result<(), StreamError> {
    let mut framed = Vec::with_capacity(data.len() + crate::varint::MAX_VARINT_LEN);
    put_uvarint(&mut framed, data.len() as u64);
    framed.extend_from_slice(data);
    io.write_all(&framed).await
}

#[cfg(test)]
pub(crate) mod testing {
    //! An in-memory [`ByteStream`] used by unit tests across the crate.

    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::{ByteStream, StreamError};

    #[derive(Default)]
    struct PipeState {
        buf: VecDeque<u8>,
        closed: bool,
    }

    struct PipeShared {
        state: Mutex<PipeState>,
        readable: Notify,
    }

    /// One endpoint of an in-memory bidirectional pipe.
    pub struct MemoryStream {
        incoming: Arc<PipeShared>,
        outgoing: Arc<PipeShared>,
        local_closed: bool,
    }

    /// Builds a connected pair of in-memory streams.
    pub fn memory_pair() -> (MemoryStream, MemoryStream) {
        let a = Arc::new(PipeShared {
            state: Mutex::new(PipeState::default()),
            readable: Notify::new(),
        });
        let b = Arc::new(PipeShared {
            state: Mutex::new(PipeState::default()),
            readable: Notify::new(),
        });
        (
            MemoryStream {
                incoming: a.clone(),
                outgoing: b.clone(),
                local_closed: false,
            },
            MemoryStream {
                incoming: b,
                outgoing: a,
                local_closed: false,
            },
        )
    }

    impl MemoryStream {
        async fn read_some(&mut self, want: usize) -> Result<Option<Vec<u8>>, StreamError> {
            loop {
                {
                    let mut st = self.incoming.state.lock().unwrap();
                    if !st.buf.is_empty() {
                        let take = want.min(st.buf.len());
                        let out: Vec<u8> = st.buf.drain(..take).collect();
                        return Ok(Some(out));
                    }
                    if st.closed {
                        return Ok(None);
                    }
                }
                self.incoming.readable.notified().await;
            }
        }
    }

    impl Drop for MemoryStream {
        fn drop(&mut self) {
            self.outgoing.state.lock().unwrap().closed = true;
            self.outgoing.readable.notify_one();
            self.outgoing.readable.notify_waiters();
        }
    }

    #[async_trait]
    impl ByteStream for MemoryStream {
        async fn read_once(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
            self.read_some(usize::MAX).await
        }

        async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, StreamError> {
            let mut out = Vec::with_capacity(n);
            while out.len() < n {
                match self.read_some(n - out.len()).await? {
                    Some(chunk) => out.extend_from_slice(&chunk),
                    None => {
                        return Err(StreamError::IncompleteRead {
                            expected: n,
                            got: out.len(),
                        });
                    }
                }
            }
            Ok(out)
        }

        async fn write_all(&mut self, data: &[u8]) -> Result<(), StreamError> {
            if self.local_closed {
                return Err(StreamError::WriteClosed);
            }
            {
                let mut st = self.outgoing.state.lock().unwrap();
                if st.closed {
                    return Err(StreamError::WriteClosed);
                }
                st.buf.extend(data);
            }
            self.outgoing.readable.notify_one();
            self.outgoing.readable.notify_waiters();
            Ok(())
        }

        async fn close(&mut self) -> Result<(), StreamError> {
            self.local_closed = true;
            self.outgoing.state.lock().unwrap().closed = true;
            self.outgoing.readable.notify_one();
            self.outgoing.readable.notify_waiters();
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.local_closed
        }

        fn at_eof(&self) -> bool {
            let st = self.incoming.state.lock().unwrap();
            st.closed && st.buf.is_empty()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::memory_pair;
    use super::*;

    #[tokio::test]
    async fn length_prefixed_round_trip() {
        let (mut a, mut b) = memory_pair();
        write_length_prefixed(&mut a, b"hello world").await.unwrap();
        let msg = read_length_prefixed(&mut b, 1024).await.unwrap().unwrap();
        assert_eq!(msg, b"hello world");
    }

    #[tokio::test]
    async fn length_prefixed_rejects_oversize() {
        let (mut a, mut b) = memory_pair();
        write_length_prefixed(&mut a, &[0u8; 100]).await.unwrap();
        let err = read_length_prefixed(&mut b, 10).await.unwrap_err();
        assert!(matches!(err, StreamError::LimitExceeded { size: 100, limit: 10 }));
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let (mut a, mut b) = memory_pair();
        a.close().await.unwrap();
        assert!(read_length_prefixed(&mut b, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_message_is_incomplete() {
        let (mut a, mut b) = memory_pair();
        // Length prefix promises 10 bytes, deliver 3.
        a.write_all(&[10, 1, 2, 3]).await.unwrap();
        a.close().await.unwrap();
        let err = read_length_prefixed(&mut b, 1024).await.unwrap_err();
        assert!(matches!(err, StreamError::IncompleteRead { .. }));
    }
}
