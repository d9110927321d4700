//! # Raw Connections
//!
//! A [`Connection`] wraps one transport socket and owns it exclusively:
//! closing the connection closes the socket. It records the direction it was
//! established in, the remote endpoint as observed locally, closed/EOF flags,
//! and a last-activity timestamp, and it notifies the injected
//! [`ResourceTracker`](crate::tracker::ResourceTracker) exactly once when the
//! underlying resource is released, no matter how many times `close` is
//! called or which layer ends up owning the halves.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::stream::{ByteStream, StreamError};
use crate::tracker::{Resource, ResourceTracker};

/// Which side initiated the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Metadata shared between the read and write halves of a connection.
///
/// Held behind an `Arc` so the halves can be moved into different tasks by
/// the upper layers while the flags stay coherent. The tracker release fires
/// when the last holder drops, or earlier on explicit close.
pub(crate) struct ConnMeta {
    direction: Direction,
    observed_addr: SocketAddr,
    closed: AtomicBool,
    eof: AtomicBool,
    last_activity: Mutex<Instant>,
    tracker: Arc<dyn ResourceTracker>,
    released: AtomicBool,
}

impl ConnMeta {
    pub(crate) fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn at_eof(&self) -> bool {
        self.eof.load(Ordering::SeqCst)
    }

    pub(crate) fn set_eof(&self) {
        self.eof.store(true, Ordering::SeqCst);
    }

    /// Marks the connection closed; returns false if it already was.
    pub(crate) fn set_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.tracker.closed(Resource::Connection);
        }
    }
}

impl Drop for ConnMeta {
    fn drop(&mut self) {
        self.release();
    }
}

/// A bidirectional byte stream over one exclusively-owned transport socket.
pub struct Connection {
    reader: BoxedReader,
    writer: BoxedWriter,
    meta: Arc<ConnMeta>,
}

impl Connection {
    /// Wraps a freshly established socket.
    pub fn new<T>(
        io: T,
        direction: Direction,
        observed_addr: SocketAddr,
        tracker: Arc<dyn ResourceTracker>,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        tracker.opened(Resource::Connection);
        let (reader, writer) = tokio::io::split(io);
        Connection {
            reader: Box::new(reader),
            writer: Box::new(writer),
            meta: Arc::new(ConnMeta {
                direction,
                observed_addr,
                closed: AtomicBool::new(false),
                eof: AtomicBool::new(false),
                last_activity: Mutex::new(Instant::now()),
                tracker,
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn direction(&self) -> Direction {
        self.meta.direction
    }

    /// The remote endpoint as seen from this side.
    pub fn observed_addr(&self) -> SocketAddr {
        self.meta.observed_addr
    }

    /// Time of the most recent read or write.
    pub fn last_activity(&self) -> Instant {
        *self.meta.last_activity.lock().unwrap()
    }

    /// Splits the connection for layers that drive reads and writes from
    /// different tasks. The shared metadata keeps flags and tracking intact.
    pub(crate) fn into_parts(self) -> (BoxedReader, BoxedWriter, Arc<ConnMeta>) {
        (self.reader, self.writer, self.meta)
    }

    pub(crate) async fn read_exact_raw(
        reader: &mut BoxedReader,
        meta: &ConnMeta,
        n: usize,
    ) -> Result<Vec<u8>, StreamError> {
        let mut buf = vec![0u8; n];
        let mut got = 0;
        while got < n {
            let read = reader.read(&mut buf[got..]).await?;
            if read == 0 {
                meta.set_eof();
                return Err(StreamError::IncompleteRead { expected: n, got });
            }
            got += read;
        }
        meta.touch();
        Ok(buf)
    }
}

#[async_trait]
impl ByteStream for Connection {
    async fn read_once(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        if self.meta.is_closed() {
            return Err(StreamError::ReadClosed);
        }
        if self.meta.at_eof() {
            return Ok(None);
        }
        let mut buf = vec![0u8; 16 * 1024];
        let n = self.reader.read(&mut buf).await?;
        if n == 0 {
            self.meta.set_eof();
            return Ok(None);
        }
        buf.truncate(n);
        self.meta.touch();
        Ok(Some(buf))
    }

    async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, StreamError> {
        if self.meta.is_closed() {
            return Err(StreamError::ReadClosed);
        }
        Connection::read_exact_raw(&mut self.reader, &self.meta, n).await
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), StreamError> {
        if self.meta.is_closed() {
            return Err(StreamError::WriteClosed);
        }
        self.writer.write_all(data).await?;
        self.writer.flush().await?;
        self.meta.touch();
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        if !self.meta.set_closed() {
            return Ok(());
        }
        let res = self.writer.shutdown().await;
        self.meta.release();
        res.map_err(StreamError::from)
    }

    fn is_closed(&self) -> bool {
        self.meta.is_closed()
    }

    fn at_eof(&self) -> bool {
        self.meta.at_eof()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("direction", &self.meta.direction)
            .field("observed_addr", &self.meta.observed_addr)
            .field("closed", &self.meta.is_closed())
            .field("eof", &self.meta.at_eof())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{CountingTracker, Resource};

    fn pair(
        tracker: Arc<CountingTracker>,
    ) -> (Connection, Connection) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        (
            Connection::new(a, Direction::Outbound, addr, tracker.clone()),
            Connection::new(b, Direction::Inbound, addr, tracker),
        )
    }

    #[tokio::test]
    async fn data_round_trips() {
        let tracker = CountingTracker::new();
        let (mut a, mut b) = pair(tracker);
        a.write_all(b"ping").await.unwrap();
        let got = b.read_exact(4).await.unwrap();
        assert_eq!(got, b"ping");
    }

    #[tokio::test]
    async fn close_sets_eof_on_the_remote() {
        let tracker = CountingTracker::new();
        let (mut a, mut b) = pair(tracker);
        a.write_all(b"bye").await.unwrap();
        a.close().await.unwrap();

        assert_eq!(b.read_exact(3).await.unwrap(), b"bye");
        assert!(b.read_once().await.unwrap().is_none());
        assert!(b.at_eof());
    }

    #[tokio::test]
    async fn writes_after_close_fail() {
        let tracker = CountingTracker::new();
        let (mut a, _b) = pair(tracker);
        a.close().await.unwrap();
        assert!(matches!(
            a.write_all(b"x").await,
            Err(StreamError::WriteClosed)
        ));
        // Close is idempotent.
        a.close().await.unwrap();
    }

    #[tokio::test]
    async fn short_read_reports_incomplete() {
        let tracker = CountingTracker::new();
        let (mut a, mut b) = pair(tracker);
        a.write_all(b"ab").await.unwrap();
        a.close().await.unwrap();
        let err = b.read_exact(5).await.unwrap_err();
        assert!(matches!(
            err,
            StreamError::IncompleteRead { expected: 5, got: 2 }
        ));
    }

    #[tokio::test]
    async fn tracker_balances_after_drop() {
        let tracker = CountingTracker::new();
        {
            let (mut a, _b) = pair(tracker.clone());
            assert_eq!(tracker.live(Resource::Connection), 2);
            a.close().await.unwrap();
        }
        assert!(tracker.balanced());
        assert_eq!(tracker.total(Resource::Connection), 2);
    }
}
