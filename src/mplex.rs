//! # Mplex Stream Multiplexer
//!
//! Carries any number of independent, flow-controlled byte streams over one
//! [`SecureConnection`]. One read-loop task per session demultiplexes frames
//! into per-channel buffers; writes from all channels funnel through a single
//! serialized writer so frames never interleave on the wire.
//!
//! ## Frame format
//!
//! `varint(header) || varint(length) || payload` with
//! `header = channel_id << 3 | tag`:
//!
//! | tag | meaning |
//! |-----|---------------------------|
//! | 0   | new stream (payload = name) |
//! | 1   | message from receiver     |
//! | 2   | message from initiator    |
//! | 3   | close from receiver       |
//! | 4   | close from initiator      |
//! | 5   | reset from receiver       |
//! | 6   | reset from initiator      |
//!
//! ## Channel lifecycle
//!
//! `New → Open → half-closed → Closed`, with `Reset` reachable from anywhere.
//! A channel is fully closed only once the local side closed, the remote
//! signalled EOF, and the reader drained the buffer; at that point the buffer
//! is released and the channel leaves the session table. Reset discards
//! buffered data immediately and wakes any pending reader with
//! [`StreamError::Reset`]. Channels idle past the configured timeout are
//! reset by the session's scanner.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Notify, mpsc, watch};
use tracing::{debug, trace, warn};

use crate::identity::PeerId;
use crate::noise::{SecureConnection, SecureReader, SecureWriter};
use crate::stream::{ByteStream, StreamError};
use crate::tracker::{Resource, ResourceTracker};
use crate::varint::{put_uvarint, read_uvarint};

/// Protocol id negotiated via multistream-select for this muxer.
pub const PROTOCOL_ID: &str = "/mplex/6.7.0";

/// Hard cap on a single frame's payload.
pub const MAX_FRAME_PAYLOAD: usize = 1024 * 1024;

/// Default per-channel read-buffer bound; the read loop stops draining a
/// channel whose buffer is full, which backpressures the remote over TCP.
pub const DEFAULT_CHANNEL_BUFFER: usize = 1024 * 1024;

/// Default inactivity window after which a channel resets itself.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

const IDLE_SCAN_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum MuxError {
    /// The remote violated the framing rules; fatal for the session.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    /// A frame payload exceeded [`MAX_FRAME_PAYLOAD`]; fatal for the session.
    #[error("frame payload of {size} bytes exceeds the {limit}-byte limit")]
    MaxSizeExceeded { size: usize, limit: usize },
    /// The session is closed; no further channels or writes are possible.
    #[error("session is closed")]
    SessionClosed,
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Session tuning knobs.
#[derive(Clone, Debug)]
pub struct MplexConfig {
    /// Largest accepted/emitted frame payload.
    pub max_frame_size: usize,
    /// Per-channel read buffer bound. Must be at least `max_frame_size`.
    pub max_channel_buffer: usize,
    /// Channel inactivity window before a self-reset.
    pub idle_timeout: Duration,
}

impl Default for MplexConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_PAYLOAD,
            max_channel_buffer: DEFAULT_CHANNEL_BUFFER,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

// ============================================================================
// Frames
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FrameTag {
    NewStream,
    MsgIn,
    MsgOut,
    CloseIn,
    CloseOut,
    ResetIn,
    ResetOut,
}

impl FrameTag {
    fn from_wire(tag: u64) -> Option<Self> {
        match tag {
            0 => Some(FrameTag::NewStream),
            1 => Some(FrameTag::MsgIn),
            2 => Some(FrameTag::MsgOut),
            3 => Some(FrameTag::CloseIn),
            4 => Some(FrameTag::CloseOut),
            5 => Some(FrameTag::ResetIn),
            6 => Some(FrameTag::ResetOut),
            _ => None,
        }
    }

    fn to_wire(self) -> u64 {
        match self {
            FrameTag::NewStream => 0,
            FrameTag::MsgIn => 1,
            FrameTag::MsgOut => 2,
            FrameTag::CloseIn => 3,
            FrameTag::CloseOut => 4,
            FrameTag::ResetIn => 5,
            FrameTag::ResetOut => 6,
        }
    }

    /// The message tag a writer uses, by its role on the channel.
    fn msg_for(initiator: bool) -> Self {
        if initiator { FrameTag::MsgOut } else { FrameTag::MsgIn }
    }

    fn close_for(initiator: bool) -> Self {
        if initiator { FrameTag::CloseOut } else { FrameTag::CloseIn }
    }

    fn reset_for(initiator: bool) -> Self {
        if initiator { FrameTag::ResetOut } else { FrameTag::ResetIn }
    }

    /// Whether the sender of a frame with this tag is the channel's initiator.
    fn sender_is_initiator(self) -> bool {
        matches!(self, FrameTag::MsgOut | FrameTag::CloseOut | FrameTag::ResetOut)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Frame {
    pub channel_id: u64,
    pub tag: FrameTag,
    pub data: Vec<u8>,
}

impl Frame {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 16);
        put_uvarint(&mut out, (self.channel_id << 3) | self.tag.to_wire());
        put_uvarint(&mut out, self.data.len() as u64);
        out.extend_from_slice(&self.data);
        out
    }

    /// Reads one frame; `Ok(None)` on clean EOF at a frame boundary.
    pub(crate) async fn read<S: ByteStream + ?Sized>(
        io: &mut S,
        max_payload: usize,
    ) -> Result<Option<Frame>, MuxError> {
        let header = match read_uvarint(io).await.map_err(MuxError::Stream)? {
            Some(header) => header,
            None => return Ok(None),
        };
        let tag = FrameTag::from_wire(header & 0x07)
            .ok_or_else(|| MuxError::InvalidFrame(format!("unknown tag {}", header & 0x07)))?;
        let channel_id = header >> 3;
        let len = read_uvarint(io)
            .await
            .map_err(MuxError::Stream)?
            .ok_or_else(|| MuxError::InvalidFrame("eof before frame length".into()))?;
        if len > max_payload as u64 {
            return Err(MuxError::MaxSizeExceeded {
                size: len as usize,
                limit: max_payload,
            });
        }
        let data = if len == 0 {
            Vec::new()
        } else {
            io.read_exact(len as usize).await.map_err(MuxError::Stream)?
        };
        Ok(Some(Frame { channel_id, tag, data }))
    }
}

// ============================================================================
// Channels
// ============================================================================

struct ChannelBuf {
    buf: VecDeque<Vec<u8>>,
    buffered: usize,
    closed_local: bool,
    eof_remote: bool,
    reset: bool,
    /// Set once the channel left the session table and its tracker entry
    /// was released; terminal.
    released: bool,
    last_activity: Instant,
}

impl ChannelBuf {
    fn new() -> Self {
        Self {
            buf: VecDeque::new(),
            buffered: 0,
            closed_local: false,
            eof_remote: false,
            reset: false,
            released: false,
            last_activity: Instant::now(),
        }
    }
}

struct ChannelInner {
    id: u64,
    initiator: bool,
    name: String,
    remote_peer: PeerId,
    buffer_cap: usize,
    state: Mutex<ChannelBuf>,
    readable: Notify,
    writable: Notify,
    session: Weak<SessionShared>,
    tracker: Arc<dyn ResourceTracker>,
}

impl ChannelInner {
    fn wake_readers(&self) {
        self.readable.notify_one();
        self.readable.notify_waiters();
    }

    /// Marks the channel reset without touching the wire and releases its
    /// tracker entry. Returns true if the call performed the transition; the
    /// `released` flag guarantees exactly one release per channel no matter
    /// which path gets there first.
    fn terminate(&self) -> bool {
        let newly = {
            let mut st = self.state.lock().unwrap();
            if st.released {
                false
            } else {
                st.reset = true;
                st.closed_local = true;
                st.eof_remote = true;
                st.buf.clear();
                st.buffered = 0;
                st.released = true;
                true
            }
        };
        if newly {
            self.tracker.closed(Resource::Channel);
            self.wake_readers();
            self.writable.notify_one();
            self.writable.notify_waiters();
        }
        newly
    }
}

/// Handle to one logical byte stream inside a session.
///
/// Handles are cheap to clone; reads, writes, close, and reset all take
/// `&self` and synchronize internally.
#[derive(Clone)]
pub struct MplexChannel {
    inner: Arc<ChannelInner>,
}

impl MplexChannel {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Whether the local side opened this channel.
    pub fn is_initiator(&self) -> bool {
        self.inner.initiator
    }

    /// The name carried in the `NewStream` frame.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Identity of the peer on the other end of the session.
    pub fn remote_peer(&self) -> &PeerId {
        &self.inner.remote_peer
    }

    /// Reads the next buffered chunk; `Ok(None)` once the remote closed and
    /// the buffer is drained. A reset channel reads as [`StreamError::Reset`].
    pub async fn read_chunk(&self) -> Result<Option<Vec<u8>>, StreamError> {
        loop {
            {
                let mut st = self.inner.state.lock().unwrap();
                if let Some(chunk) = st.buf.pop_front() {
                    st.buffered -= chunk.len();
                    st.last_activity = Instant::now();
                    drop(st);
                    self.inner.writable.notify_one();
                    self.maybe_release();
                    return Ok(Some(chunk));
                }
                if st.reset {
                    return Err(StreamError::Reset);
                }
                if st.eof_remote {
                    drop(st);
                    self.maybe_release();
                    return Ok(None);
                }
            }
            self.inner.readable.notified().await;
        }
    }

    /// Reads exactly `n` bytes across chunk boundaries.
    pub async fn read_bytes(&self, n: usize) -> Result<Vec<u8>, StreamError> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            let wanted = n - out.len();
            let taken = {
                let mut st = self.inner.state.lock().unwrap();
                if let Some(mut chunk) = st.buf.pop_front() {
                    st.buffered -= chunk.len();
                    st.last_activity = Instant::now();
                    if chunk.len() > wanted {
                        let rest = chunk.split_off(wanted);
                        st.buffered += rest.len();
                        st.buf.push_front(rest);
                    }
                    Some(chunk)
                } else if st.reset {
                    return Err(StreamError::Reset);
                } else if st.eof_remote {
                    return Err(StreamError::IncompleteRead {
                        expected: n,
                        got: out.len(),
                    });
                } else {
                    None
                }
            };
            match taken {
                Some(chunk) => {
                    out.extend_from_slice(&chunk);
                    self.inner.writable.notify_one();
                }
                None => self.inner.readable.notified().await,
            }
        }
        self.maybe_release();
        Ok(out)
    }

    /// Writes `data`, split into frames of at most the session's frame size.
    pub async fn write_bytes(&self, data: &[u8]) -> Result<(), StreamError> {
        let session = match self.inner.session.upgrade() {
            Some(session) => session,
            None => return Err(StreamError::WriteClosed),
        };
        let max = session.config.max_frame_size;
        let tag = FrameTag::msg_for(self.inner.initiator);
        for chunk in data.chunks(max) {
            {
                let st = self.inner.state.lock().unwrap();
                if st.reset {
                    return Err(StreamError::Reset);
                }
                if st.closed_local {
                    return Err(StreamError::WriteClosed);
                }
            }
            session
                .write_frame(Frame {
                    channel_id: self.inner.id,
                    tag,
                    data: chunk.to_vec(),
                })
                .await
                .map_err(mux_to_stream)?;
        }
        self.inner.state.lock().unwrap().last_activity = Instant::now();
        Ok(())
    }

    /// Half-closes the channel: no further local writes, reads continue until
    /// the remote's data is drained.
    pub async fn close_channel(&self) -> Result<(), StreamError> {
        {
            let mut st = self.inner.state.lock().unwrap();
            if st.reset || st.closed_local {
                return Ok(());
            }
            st.closed_local = true;
            st.last_activity = Instant::now();
        }
        self.inner.wake_readers();
        if let Some(session) = self.inner.session.upgrade() {
            session
                .write_frame(Frame {
                    channel_id: self.inner.id,
                    tag: FrameTag::close_for(self.inner.initiator),
                    data: Vec::new(),
                })
                .await
                .map_err(mux_to_stream)?;
        }
        self.maybe_release();
        Ok(())
    }

    /// Abruptly terminates the channel in both directions, discarding any
    /// buffered data. The reset frame is sent best-effort.
    pub async fn reset(&self) {
        if !self.inner.terminate() {
            return;
        }
        if let Some(session) = self.inner.session.upgrade() {
            let frame = Frame {
                channel_id: self.inner.id,
                tag: FrameTag::reset_for(self.inner.initiator),
                data: Vec::new(),
            };
            if let Err(e) = session.write_frame(frame).await {
                trace!(id = self.inner.id, error = %e, "reset frame not sent");
            }
            session.remove_channel(&self.inner);
        }
    }

    /// Pushes remote data into the buffer, waiting for space when full.
    /// Called only from the session read loop.
    async fn push_remote(&self, data: Vec<u8>) {
        loop {
            {
                let mut st = self.inner.state.lock().unwrap();
                if st.reset || st.eof_remote {
                    trace!(id = self.inner.id, "dropping data for terminated channel");
                    return;
                }
                if st.buffered + data.len() <= self.inner.buffer_cap || st.buf.is_empty() {
                    st.buffered += data.len();
                    st.buf.push_back(data);
                    st.last_activity = Instant::now();
                    drop(st);
                    self.inner.readable.notify_one();
                    self.inner.readable.notify_waiters();
                    return;
                }
            }
            self.inner.writable.notified().await;
        }
    }

    fn on_remote_close(&self) {
        {
            let mut st = self.inner.state.lock().unwrap();
            if st.reset || st.eof_remote {
                return;
            }
            st.eof_remote = true;
            st.last_activity = Instant::now();
        }
        self.inner.wake_readers();
        self.maybe_release();
    }

    fn on_remote_reset(&self) {
        if self.inner.terminate()
            && let Some(session) = self.inner.session.upgrade()
        {
            session.remove_channel(&self.inner);
        }
    }

    /// Completes closure once both directions are closed and the buffer has
    /// drained; releases the table entry and tracker count.
    fn maybe_release(&self) {
        let release = {
            let mut st = self.inner.state.lock().unwrap();
            if !st.released && st.closed_local && st.eof_remote && st.buf.is_empty() {
                st.released = true;
                true
            } else {
                false
            }
        };
        if release {
            self.inner.tracker.closed(Resource::Channel);
            self.inner.wake_readers();
            if let Some(session) = self.inner.session.upgrade() {
                session.remove_channel(&self.inner);
            }
        }
    }
}

fn mux_to_stream(err: MuxError) -> StreamError {
    match err {
        MuxError::Stream(e) => e,
        MuxError::SessionClosed => StreamError::WriteClosed,
        other => StreamError::InvalidData(other.to_string()),
    }
}

#[async_trait]
impl ByteStream for MplexChannel {
    async fn read_once(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        self.read_chunk().await
    }

    async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, StreamError> {
        self.read_bytes(n).await
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), StreamError> {
        self.write_bytes(data).await
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        self.close_channel().await
    }

    fn is_closed(&self) -> bool {
        self.inner.state.lock().unwrap().closed_local
    }

    fn at_eof(&self) -> bool {
        let st = self.inner.state.lock().unwrap();
        st.eof_remote && st.buf.is_empty()
    }
}

impl std::fmt::Debug for MplexChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.state.lock().unwrap();
        f.debug_struct("MplexChannel")
            .field("id", &self.inner.id)
            .field("initiator", &self.inner.initiator)
            .field("name", &self.inner.name)
            .field("closed_local", &st.closed_local)
            .field("eof_remote", &st.eof_remote)
            .field("reset", &st.reset)
            .finish()
    }
}

// ============================================================================
// Session
// ============================================================================

struct Tables {
    /// Channels we opened, keyed by our id counter.
    local: HashMap<u64, Arc<ChannelInner>>,
    /// Channels the remote opened, keyed by its id counter.
    remote: HashMap<u64, Arc<ChannelInner>>,
    next_id: u64,
}

struct SessionShared {
    config: MplexConfig,
    remote_peer: PeerId,
    writer: tokio::sync::Mutex<SecureWriter>,
    tables: Mutex<Tables>,
    closed_tx: watch::Sender<bool>,
    tracker: Arc<dyn ResourceTracker>,
    released: AtomicBool,
}

impl SessionShared {
    fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Serializes one frame onto the wire. The writer lock is held for one
    /// frame at a time.
    async fn write_frame(&self, frame: Frame) -> Result<(), MuxError> {
        if self.is_closed() {
            return Err(MuxError::SessionClosed);
        }
        let bytes = frame.encode();
        let mut writer = self.writer.lock().await;
        writer.write_records(&bytes).await?;
        Ok(())
    }

    /// Drops the table entry for a channel whose tracker entry was already
    /// released through its `released` flag.
    fn remove_channel(&self, inner: &Arc<ChannelInner>) {
        let mut tables = self.tables.lock().unwrap();
        let table = if inner.initiator {
            &mut tables.local
        } else {
            &mut tables.remote
        };
        if let Some(existing) = table.get(&inner.id)
            && Arc::ptr_eq(existing, inner)
        {
            table.remove(&inner.id);
        }
    }

    async fn route(
        self: &Arc<Self>,
        frame: Frame,
        sink: &mpsc::Sender<MplexChannel>,
    ) -> Result<(), MuxError> {
        let id = frame.channel_id;
        match frame.tag {
            FrameTag::NewStream => {
                let name = String::from_utf8_lossy(&frame.data).into_owned();
                let inner = Arc::new(ChannelInner {
                    id,
                    initiator: false,
                    name,
                    remote_peer: self.remote_peer.clone(),
                    buffer_cap: self.config.max_channel_buffer,
                    state: Mutex::new(ChannelBuf::new()),
                    readable: Notify::new(),
                    writable: Notify::new(),
                    session: Arc::downgrade(self),
                    tracker: self.tracker.clone(),
                });
                {
                    let mut tables = self.tables.lock().unwrap();
                    if tables.remote.contains_key(&id) {
                        return Err(MuxError::InvalidFrame(format!(
                            "duplicate NewStream for channel {id}"
                        )));
                    }
                    tables.remote.insert(id, inner.clone());
                }
                self.tracker.opened(Resource::Channel);
                trace!(id, "remote opened channel");
                let channel = MplexChannel { inner };
                if sink.send(channel.clone()).await.is_err() {
                    // Nobody is dispatching channels anymore.
                    channel.reset().await;
                }
                Ok(())
            }
            tag => {
                let sender_is_initiator = tag.sender_is_initiator();
                let channel = {
                    let tables = self.tables.lock().unwrap();
                    let table = if sender_is_initiator {
                        // Remote claims it opened the channel.
                        &tables.remote
                    } else {
                        &tables.local
                    };
                    match table.get(&id) {
                        Some(inner) => Some(MplexChannel { inner: inner.clone() }),
                        None if !sender_is_initiator && id >= tables.next_id => {
                            // The remote claims receiver role on a channel we
                            // never allocated: a direction violation, not late
                            // traffic.
                            return Err(MuxError::InvalidFrame(format!(
                                "receiver-role frame for unallocated channel {id}"
                            )));
                        }
                        None => None,
                    }
                };
                let Some(channel) = channel else {
                    // Late traffic after a reset; peers legitimately race here.
                    trace!(id, ?tag, "dropping frame for unknown channel");
                    return Ok(());
                };
                match tag {
                    FrameTag::MsgIn | FrameTag::MsgOut => channel.push_remote(frame.data).await,
                    FrameTag::CloseIn | FrameTag::CloseOut => channel.on_remote_close(),
                    FrameTag::ResetIn | FrameTag::ResetOut => channel.on_remote_reset(),
                    FrameTag::NewStream => unreachable!(),
                }
                Ok(())
            }
        }
    }

    /// Tears the session down: resets every channel, closes the writer, and
    /// releases the tracker entry. Idempotent.
    async fn close_internal(&self) {
        if self.closed_tx.send_replace(true) {
            return;
        }
        let channels: Vec<Arc<ChannelInner>> = {
            let mut tables = self.tables.lock().unwrap();
            let mut channels: Vec<Arc<ChannelInner>> =
                tables.local.drain().map(|(_, c)| c).collect();
            channels.extend(tables.remote.drain().map(|(_, c)| c));
            channels
        };
        for inner in channels {
            inner.terminate();
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        if !self.released.swap(true, Ordering::SeqCst) {
            self.tracker.closed(Resource::Session);
        }
    }
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        // Backstop for sessions dropped without an explicit close: resets
        // whatever channels remain and balances the tracker. The socket
        // itself closes when the writer half drops.
        let channels: Vec<Arc<ChannelInner>> = {
            let mut tables = self.tables.lock().unwrap();
            let mut channels: Vec<Arc<ChannelInner>> =
                tables.local.drain().map(|(_, c)| c).collect();
            channels.extend(tables.remote.drain().map(|(_, c)| c));
            channels
        };
        for inner in channels {
            inner.terminate();
        }
        if !self.released.swap(true, Ordering::SeqCst) {
            self.tracker.closed(Resource::Session);
        }
    }
}

/// Handle to one muxer session riding on one secure connection.
#[derive(Clone)]
pub struct MplexSession {
    shared: Arc<SessionShared>,
    closed_rx: watch::Receiver<bool>,
}

impl MplexSession {
    /// Wraps a secured connection, spawning the session's read loop and idle
    /// scanner. Channels opened by the remote are delivered on `channel_sink`.
    pub fn new(
        secure: SecureConnection,
        config: MplexConfig,
        tracker: Arc<dyn ResourceTracker>,
        channel_sink: mpsc::Sender<MplexChannel>,
    ) -> Self {
        let remote_peer = secure.remote_peer().clone();
        let (reader, writer) = secure.into_split();
        let (closed_tx, closed_rx) = watch::channel(false);
        tracker.opened(Resource::Session);
        let shared = Arc::new(SessionShared {
            config,
            remote_peer,
            writer: tokio::sync::Mutex::new(writer),
            tables: Mutex::new(Tables {
                local: HashMap::new(),
                remote: HashMap::new(),
                next_id: 0,
            }),
            closed_tx,
            tracker,
            released: AtomicBool::new(false),
        });

        tokio::spawn(read_loop(
            Arc::downgrade(&shared),
            reader,
            channel_sink,
            closed_rx.clone(),
            shared.config.max_frame_size,
        ));
        tokio::spawn(idle_loop(
            Arc::downgrade(&shared),
            closed_rx.clone(),
            shared.config.idle_timeout,
        ));

        MplexSession { shared, closed_rx }
    }

    pub fn remote_peer(&self) -> &PeerId {
        &self.shared.remote_peer
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Stable token for registry bookkeeping.
    pub(crate) fn token(&self) -> usize {
        Arc::as_ptr(&self.shared) as usize
    }

    /// Opens a new channel named `name`. Ids are allocated strictly
    /// increasing per session.
    pub async fn open_channel(&self, name: &str) -> Result<MplexChannel, MuxError> {
        if self.is_closed() {
            return Err(MuxError::SessionClosed);
        }
        let inner = {
            let mut tables = self.shared.tables.lock().unwrap();
            let id = tables.next_id;
            tables.next_id += 1;
            let inner = Arc::new(ChannelInner {
                id,
                initiator: true,
                name: name.to_string(),
                remote_peer: self.shared.remote_peer.clone(),
                buffer_cap: self.shared.config.max_channel_buffer,
                state: Mutex::new(ChannelBuf::new()),
                readable: Notify::new(),
                writable: Notify::new(),
                session: Arc::downgrade(&self.shared),
                tracker: self.shared.tracker.clone(),
            });
            tables.local.insert(id, inner.clone());
            inner
        };
        self.shared.tracker.opened(Resource::Channel);

        let frame = Frame {
            channel_id: inner.id,
            tag: FrameTag::NewStream,
            data: name.as_bytes().to_vec(),
        };
        if let Err(e) = self.shared.write_frame(frame).await {
            inner.terminate();
            self.shared.remove_channel(&inner);
            return Err(e);
        }
        debug!(id = inner.id, name, "opened channel");
        Ok(MplexChannel { inner })
    }

    /// Closes the session, resetting every open channel.
    pub async fn close(&self) {
        self.shared.close_internal().await;
    }

    /// Resolves once the session is closed, locally or by the remote.
    pub async fn wait_closed(&self) {
        let mut rx = self.closed_rx.clone();
        // An error means the sender is gone, which also means closed.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl std::fmt::Debug for MplexSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.shared.tables.lock().unwrap();
        f.debug_struct("MplexSession")
            .field("remote_peer", &self.shared.remote_peer)
            .field("local_channels", &tables.local.len())
            .field("remote_channels", &tables.remote.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// The session's single demultiplexing task. Holds only a weak session
/// handle between frames so a fully dropped session tears itself down.
async fn read_loop(
    weak: Weak<SessionShared>,
    mut reader: SecureReader,
    sink: mpsc::Sender<MplexChannel>,
    mut closed_rx: watch::Receiver<bool>,
    max_frame: usize,
) {
    loop {
        let frame = tokio::select! {
            res = Frame::read(&mut reader, max_frame) => res,
            _ = closed_rx.wait_for(|closed| *closed) => return,
        };
        let Some(shared) = weak.upgrade() else { return };
        match frame {
            Ok(Some(frame)) => {
                if let Err(e) = shared.route(frame, &sink).await {
                    warn!(error = %e, "fatal session error");
                    shared.close_internal().await;
                    return;
                }
            }
            Ok(None) => {
                debug!("session transport reached eof");
                shared.close_internal().await;
                return;
            }
            Err(e) => {
                debug!(error = %e, "session read failed");
                shared.close_internal().await;
                return;
            }
        }
    }
}

/// Periodically resets channels with no read or write activity.
async fn idle_loop(
    weak: Weak<SessionShared>,
    mut closed_rx: watch::Receiver<bool>,
    idle_timeout: Duration,
) {
    let mut ticker = tokio::time::interval(IDLE_SCAN_INTERVAL.min(idle_timeout));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = closed_rx.wait_for(|closed| *closed) => return,
        }
        let Some(shared) = weak.upgrade() else { return };
        let stale: Vec<Arc<ChannelInner>> = {
            let tables = shared.tables.lock().unwrap();
            tables
                .local
                .values()
                .chain(tables.remote.values())
                .filter(|inner| {
                    let st = inner.state.lock().unwrap();
                    !st.released && st.last_activity.elapsed() >= idle_timeout
                })
                .cloned()
                .collect()
        };
        for inner in stale {
            warn!(id = inner.id, "resetting idle channel");
            MplexChannel { inner }.reset().await;
        }
    }
}
