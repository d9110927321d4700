//! Resource-leak tracking.
//!
//! Connections, secure channels, sessions, and mplex channels each notify an
//! injected [`ResourceTracker`] when they are created and released. The
//! production default is [`NoopTracker`]; tests inject a [`CountingTracker`]
//! and assert that every counter balances to zero after shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

/// The resource kinds whose lifetimes are tracked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Resource {
    /// A raw transport connection.
    Connection,
    /// A Noise-secured channel over a connection.
    SecureChannel,
    /// A muxer session.
    Session,
    /// A logical stream inside a session.
    Channel,
}

impl Resource {
    fn index(self) -> usize {
        match self {
            Resource::Connection => 0,
            Resource::SecureChannel => 1,
            Resource::Session => 2,
            Resource::Channel => 3,
        }
    }
}

/// Observer notified on every resource open and release.
///
/// Implementations must be cheap: calls happen on connection hot paths.
pub trait ResourceTracker: Send + Sync + 'static {
    fn opened(&self, resource: Resource);
    fn closed(&self, resource: Resource);
}

/// Production tracker: does nothing.
#[derive(Debug, Default)]
pub struct NoopTracker;

impl ResourceTracker for NoopTracker {
    fn opened(&self, _resource: Resource) {}
    fn closed(&self, _resource: Resource) {}
}

/// Returns the shared no-op tracker instance.
pub fn noop() -> Arc<dyn ResourceTracker> {
    Arc::new(NoopTracker)
}

/// Test tracker counting live instances per resource kind.
#[derive(Debug, Default)]
pub struct CountingTracker {
    live: [AtomicI64; 4],
    total: [AtomicI64; 4],
}

impl CountingTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of currently live instances of `resource`.
    pub fn live(&self, resource: Resource) -> i64 {
        self.live[resource.index()].load(Ordering::SeqCst)
    }

    /// Number of instances ever opened.
    pub fn total(&self, resource: Resource) -> i64 {
        self.total[resource.index()].load(Ordering::SeqCst)
    }

    /// True when every open has been matched by exactly one release.
    pub fn balanced(&self) -> bool {
        self.live.iter().all(|c| c.load(Ordering::SeqCst) == 0)
    }
}

impl ResourceTracker for CountingTracker {
    fn opened(&self, resource: Resource) {
        self.live[resource.index()].fetch_add(1, Ordering::SeqCst);
        self.total[resource.index()].fetch_add(1, Ordering::SeqCst);
    }

    fn closed(&self, resource: Resource) {
        self.live[resource.index()].fetch_sub(1, Ordering::SeqCst);
    }
}
