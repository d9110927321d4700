//! # TCP Transport
//!
//! The transport collaborator consumed by the switch: dial one address to get
//! an outbound [`Connection`], or bind a listener yielding inbound ones. The
//! upgrade pipeline never touches sockets directly; everything above this
//! module sees only the byte-stream surface of [`Connection`].

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::connection::{Connection, Direction};
use crate::tracker::ResourceTracker;

/// Dial/listen surface over TCP.
#[derive(Clone)]
pub struct TcpTransport {
    tracker: Arc<dyn ResourceTracker>,
}

impl TcpTransport {
    pub fn new(tracker: Arc<dyn ResourceTracker>) -> Self {
        Self { tracker }
    }

    /// Opens one outbound connection to `addr`.
    pub async fn dial(&self, addr: SocketAddr) -> std::io::Result<Connection> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let observed = stream.peer_addr()?;
        debug!(%observed, "dialed");
        Ok(Connection::new(
            stream,
            Direction::Outbound,
            observed,
            self.tracker.clone(),
        ))
    }

    /// Binds a listener on `addr` (use port 0 for an ephemeral port).
    pub async fn listen(&self, addr: SocketAddr) -> std::io::Result<TcpListenerStream> {
        let inner = TcpListener::bind(addr).await?;
        let local_addr = inner.local_addr()?;
        debug!(%local_addr, "listening");
        Ok(TcpListenerStream {
            inner,
            local_addr,
            tracker: self.tracker.clone(),
        })
    }
}

/// A bound listener producing inbound connections.
pub struct TcpListenerStream {
    inner: TcpListener,
    local_addr: SocketAddr,
    tracker: Arc<dyn ResourceTracker>,
}

impl TcpListenerStream {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts the next inbound connection.
    pub async fn accept(&self) -> std::io::Result<Connection> {
        let (stream, observed) = self.inner.accept().await?;
        stream.set_nodelay(true)?;
        debug!(%observed, "accepted");
        Ok(Connection::new(
            stream,
            Direction::Inbound,
            observed,
            self.tracker.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::ByteStream;
    use crate::tracker;

    #[tokio::test]
    async fn dial_and_accept_exchange_bytes() {
        let transport = TcpTransport::new(tracker::noop());
        let listener = transport
            .listen("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr();

        let dial = transport.dial(addr);
        let (outbound, inbound) = tokio::join!(dial, listener.accept());
        let mut outbound = outbound.unwrap();
        let mut inbound = inbound.unwrap();

        assert_eq!(outbound.direction(), Direction::Outbound);
        assert_eq!(inbound.direction(), Direction::Inbound);

        outbound.write_all(b"hello").await.unwrap();
        assert_eq!(inbound.read_exact(5).await.unwrap(), b"hello");

        outbound.close().await.unwrap();
        inbound.close().await.unwrap();
    }
}
