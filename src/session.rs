//! Session: owns the websocket and multiplexes streams over it.
//!
//! # Architecture
//!
//! ```text
//!   Stream handles ──write/close/window──▶ outbound queue ──▶ writer task ──▶ websocket
//!        ▲                                                                        │
//!        │ wake                                                                   │
//!   StreamShared ◀──data/close/reset/window── demux task ◀────────────────────────┘
//!        ▲
//!        └── stream table + accept backlog (one lock)
//! ```
//!
//! Only the demux task reads from the transport and only the writer task
//! writes to it. Everything else goes through the stream table or the
//! outbound queue. Lock order is table before stream.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::frame::{reset_code, Frame};
use crate::stream::{Delivery, Stream, StreamShared};

/// How long `Session::close` waits for queued frames to reach the transport.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames fed to the websocket before each flush.
const MAX_WRITE_BATCH: usize = 64;

/// A message-oriented, ordered, reliable connection, such as
/// `tokio_tungstenite::WebSocketStream`.
pub trait Transport:
    futures_util::Stream<Item = std::result::Result<Message, WsError>>
    + Sink<Message, Error = WsError>
    + Send
    + 'static
{
}

impl<T> Transport for T where
    T: futures_util::Stream<Item = std::result::Result<Message, WsError>>
        + Sink<Message, Error = WsError>
        + Send
        + 'static
{
}

/// Which end of the connection a session is.
///
/// Clients allocate odd stream ids (1, 3, 5, ...), servers even ids
/// (2, 4, 6, ...), so both ends can open streams without colliding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn first_stream_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    /// Whether `stream_id` is in the range this role allocates from.
    pub fn allocates(self, stream_id: u32) -> bool {
        match self {
            Role::Client => stream_id % 2 == 1,
            Role::Server => stream_id != 0 && stream_id % 2 == 0,
        }
    }
}

/// Why a session terminated.
#[derive(Debug, Clone)]
pub enum CloseReason {
    /// `close` was called or the session handle was dropped.
    Local,
    /// The peer closed the websocket.
    PeerClosed,
    /// Reading or writing the websocket failed. Holds an [`Error::Transport`].
    Transport(Arc<Error>),
    /// The peer sent something that could not be attributed to a stream.
    /// Holds an [`Error::MalformedFrame`].
    Protocol(Arc<Error>),
    IdleTimeout,
}

impl CloseReason {
    /// The error that tore the session down, if it failed.
    pub fn error(&self) -> Option<&Error> {
        match self {
            CloseReason::Transport(err) | CloseReason::Protocol(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local => write!(f, "closed locally"),
            CloseReason::PeerClosed => write!(f, "closed by peer"),
            CloseReason::Transport(e) | CloseReason::Protocol(e) => write!(f, "{}", e),
            CloseReason::IdleTimeout => write!(f, "idle timeout"),
        }
    }
}

struct Table {
    streams: HashMap<u32, Arc<StreamShared>>,
    /// Remote-opened streams waiting for `accept`, oldest first.
    backlog: VecDeque<Arc<StreamShared>>,
    /// `None` once the id space is used up.
    next_stream_id: Option<u32>,
    highest_remote_id: u32,
}

/// State shared by the session handle, its streams and its two tasks.
pub(crate) struct Shared {
    role: Role,
    config: Config,
    outbound: mpsc::UnboundedSender<Frame>,
    table: Mutex<Table>,
    accept_ready: Notify,
    closed: AtomicBool,
    shutdown: watch::Sender<Option<CloseReason>>,
    pings: Mutex<HashMap<u32, oneshot::Sender<()>>>,
    next_nonce: AtomicU32,
}

impl Shared {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn max_frame_payload(&self) -> u32 {
        self.config.max_frame_payload
    }

    /// Queue a frame for the writer task. Never blocks.
    pub(crate) fn send(&self, frame: Frame) {
        // The writer is gone only after teardown; late frames are dropped.
        let _ = self.outbound.send(frame);
    }

    /// Forget a stream that is fully closed or reset. Its id is never reused.
    pub(crate) fn retire(&self, stream_id: u32) {
        let mut table = self.table.lock();
        if table.streams.remove(&stream_id).is_some() {
            table.backlog.retain(|s| s.id() != stream_id);
            trace!(stream_id, "stream retired");
        }
    }

    fn lookup(&self, stream_id: u32) -> Option<Arc<StreamShared>> {
        self.table.lock().streams.get(&stream_id).cloned()
    }

    fn next_nonce(&self) -> u32 {
        self.next_nonce.fetch_add(1, Ordering::Relaxed)
    }

    /// Tear the session down. Only the first call has any effect.
    fn terminate(&self, reason: CloseReason) {
        let streams = {
            let mut table = self.table.lock();
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            table.backlog.clear();
            std::mem::take(&mut table.streams)
        };

        debug!(reason = %reason, live_streams = streams.len(), "session closing");
        for stream in streams.values() {
            stream.terminate();
        }
        self.pings.lock().clear();
        self.accept_ready.notify_waiters();
        self.shutdown.send_replace(Some(reason));
    }

    fn reset_stream(&self, stream: &StreamShared, code: u32) {
        stream.terminate();
        self.retire(stream.id());
        self.send(Frame::Reset {
            stream_id: stream.id(),
            code,
        });
    }

    fn handle_frame(&self, frame: Frame) {
        let header = frame.header();
        trace!(
            opcode = header.opcode,
            stream_id = header.stream_id,
            value = header.value,
            "frame received"
        );

        match frame {
            Frame::Open { stream_id, window } => self.on_open(stream_id, window),
            Frame::Data { stream_id, payload } => {
                let Some(stream) = self.lookup(stream_id) else {
                    debug!(stream_id, "data for unknown stream");
                    self.send(Frame::Reset {
                        stream_id,
                        code: reset_code::PROTOCOL_ERROR,
                    });
                    return;
                };
                match stream.push_data(payload) {
                    Delivery::Buffered | Delivery::Discarded(None) => {}
                    Delivery::Discarded(Some(increment)) => {
                        self.send(Frame::WindowUpdate {
                            stream_id,
                            increment,
                        });
                    }
                    Delivery::Violation { code, reason } => {
                        warn!(stream_id, code, %reason, "resetting stream");
                        self.reset_stream(&stream, code);
                    }
                }
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                let Some(stream) = self.lookup(stream_id) else {
                    trace!(stream_id, "window update for unknown stream");
                    return;
                };
                if let Err(err) = stream.add_credit(increment) {
                    warn!(stream_id, error = %err, "resetting stream");
                    self.reset_stream(&stream, reset_code::FLOW_CONTROL_ERROR);
                }
            }
            Frame::Close { stream_id } => {
                let Some(stream) = self.lookup(stream_id) else {
                    trace!(stream_id, "close for unknown stream");
                    return;
                };
                debug!(stream_id, "stream closed by peer");
                if stream.remote_close() {
                    self.retire(stream_id);
                }
            }
            Frame::Reset { stream_id, code } => {
                // Never answer a reset with a reset.
                let Some(stream) = self.lookup(stream_id) else {
                    return;
                };
                debug!(stream_id, code, "stream reset by peer");
                stream.terminate();
                self.retire(stream_id);
            }
            Frame::Ping { nonce } => self.send(Frame::Pong { nonce }),
            Frame::Pong { nonce } => {
                if let Some(waiter) = self.pings.lock().remove(&nonce) {
                    let _ = waiter.send(());
                }
            }
        }
    }

    fn on_open(&self, stream_id: u32, window: u32) {
        let mut table = self.table.lock();

        if let Some(live) = table.streams.remove(&stream_id) {
            table.backlog.retain(|s| s.id() != stream_id);
            drop(table);
            warn!(stream_id, "peer opened a live stream");
            live.terminate();
            self.send(Frame::Reset {
                stream_id,
                code: reset_code::PROTOCOL_ERROR,
            });
            return;
        }

        if stream_id == 0 || self.role.allocates(stream_id) || stream_id <= table.highest_remote_id
        {
            drop(table);
            warn!(stream_id, "peer opened a stream outside its id range");
            self.send(Frame::Reset {
                stream_id,
                code: reset_code::PROTOCOL_ERROR,
            });
            return;
        }

        table.highest_remote_id = stream_id;
        // The opener starts with credit equal to its own window, so buffer at
        // least that much. A larger local buffer is granted below.
        let buffer_size = self.config.stream_buffer_size.max(window);
        let stream = Arc::new(StreamShared::new(stream_id, buffer_size, window));
        table.streams.insert(stream_id, stream.clone());
        table.backlog.push_back(stream);

        let refused = if table.backlog.len() > self.config.accept_backlog {
            let oldest = table.backlog.pop_front();
            if let Some(oldest) = &oldest {
                table.streams.remove(&oldest.id());
            }
            oldest
        } else {
            None
        };
        drop(table);

        debug!(stream_id, window, "stream opened by peer");
        if buffer_size > window {
            self.send(Frame::WindowUpdate {
                stream_id,
                increment: buffer_size - window,
            });
        }
        if let Some(oldest) = refused {
            warn!(stream_id = oldest.id(), "accept backlog full, refusing oldest stream");
            oldest.terminate();
            self.send(Frame::Reset {
                stream_id: oldest.id(),
                code: reset_code::REFUSED_STREAM,
            });
        }
        self.accept_ready.notify_one();
    }
}

/// A multiplexing session over one websocket connection.
///
/// Cheap operations (`open`, `accept`, `ping`) take `&self`; wrap the session
/// in an `Arc` to share it between tasks. Dropping the session tears it down
/// and resets every stream it still carries.
pub struct Session {
    shared: Arc<Shared>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.shared.role)
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

impl Session {
    /// Start the initiating side of a session (odd stream ids).
    ///
    /// Spawns the demux and writer tasks, so this must run inside a tokio
    /// runtime.
    pub fn client<T: Transport>(transport: T, config: Config) -> Result<Self> {
        Self::start(transport, config, Role::Client)
    }

    /// Start the accepting side of a session (even stream ids).
    ///
    /// Spawns the demux and writer tasks, so this must run inside a tokio
    /// runtime.
    pub fn server<T: Transport>(transport: T, config: Config) -> Result<Self> {
        Self::start(transport, config, Role::Server)
    }

    fn start<T: Transport>(transport: T, config: Config, role: Role) -> Result<Self> {
        config.validate()?;

        let (sink, source) = transport.split::<Message>();
        let (outbound, queue) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(None);

        let shared = Arc::new(Shared {
            role,
            outbound,
            table: Mutex::new(Table {
                streams: HashMap::new(),
                backlog: VecDeque::new(),
                next_stream_id: Some(role.first_stream_id()),
                highest_remote_id: 0,
            }),
            accept_ready: Notify::new(),
            closed: AtomicBool::new(false),
            shutdown,
            pings: Mutex::new(HashMap::new()),
            next_nonce: AtomicU32::new(1),
            config,
        });

        // Subscribed before spawning so an early teardown is never missed.
        let reader_shutdown = shared.shutdown.subscribe();
        let writer_shutdown = shared.shutdown.subscribe();
        tokio::spawn(read_loop(shared.clone(), source, reader_shutdown));
        let writer = tokio::spawn(write_loop(shared.clone(), sink, queue, writer_shutdown));
        debug!(?role, "session started");

        Ok(Self {
            shared,
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Why the session terminated, or `None` while it is live.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.shutdown.borrow().as_ref().cloned()
    }

    /// Wait until the session terminates.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.shared.shutdown.subscribe();
        let reason = match rx.wait_for(|reason| reason.is_some()).await {
            Ok(reason) => reason.as_ref().cloned(),
            Err(_) => None,
        };
        reason.unwrap_or(CloseReason::Local)
    }

    /// Streams currently tracked, including ones waiting in the accept backlog.
    pub fn num_streams(&self) -> usize {
        self.shared.table.lock().streams.len()
    }

    /// Open a new stream. The peer is told with an OPEN frame; this does not
    /// wait for it to accept.
    pub fn open(&self) -> Result<Stream> {
        let inner = {
            let mut table = self.shared.table.lock();
            if self.shared.is_closed() {
                return Err(Error::SessionClosed);
            }
            let stream_id = table.next_stream_id.ok_or(Error::StreamIdsExhausted)?;
            table.next_stream_id = stream_id.checked_add(2);

            let window = self.shared.config.stream_buffer_size;
            let inner = Arc::new(StreamShared::new(stream_id, window, window));
            table.streams.insert(stream_id, inner.clone());
            self.shared.send(Frame::Open { stream_id, window });
            inner
        };

        debug!(stream_id = inner.id(), "stream opened");
        Ok(Stream::new(inner, self.shared.clone()))
    }

    /// Wait for the next stream opened by the peer.
    pub async fn accept(&self) -> Result<Stream> {
        loop {
            let notified = self.shared.accept_ready.notified();
            {
                let mut table = self.shared.table.lock();
                if let Some(inner) = table.backlog.pop_front() {
                    return Ok(Stream::new(inner, self.shared.clone()));
                }
                if self.shared.is_closed() {
                    return Err(Error::SessionClosed);
                }
            }
            notified.await;
        }
    }

    /// Measure a round trip to the peer.
    pub async fn ping(&self) -> Result<Duration> {
        let nonce = self.shared.next_nonce();
        let (tx, rx) = oneshot::channel();
        {
            let mut pings = self.shared.pings.lock();
            if self.shared.is_closed() {
                return Err(Error::SessionClosed);
            }
            pings.insert(nonce, tx);
        }

        let _pending = PendingPing {
            shared: &self.shared,
            nonce,
        };
        let started = Instant::now();
        self.shared.send(Frame::Ping { nonce });
        rx.await.map_err(|_| Error::SessionClosed)?;
        Ok(started.elapsed())
    }

    /// Tear the session down: reset every stream, flush queued frames and
    /// close the transport. Closing again is a no-op.
    pub async fn close(&self) -> Result<()> {
        self.shared.terminate(CloseReason::Local);

        let writer = self.writer.lock().take();
        if let Some(mut writer) = writer {
            if time::timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
                warn!("flushing outbound frames timed out");
                writer.abort();
            }
        }
        Ok(())
    }
}

/// Forgets a ping's nonce when its caller stops waiting.
struct PendingPing<'a> {
    shared: &'a Shared,
    nonce: u32,
}

impl Drop for PendingPing<'_> {
    fn drop(&mut self) {
        self.shared.pings.lock().remove(&self.nonce);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.terminate(CloseReason::Local);
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// The demux task: the only reader of the transport.
async fn read_loop<S>(
    shared: Arc<Shared>,
    mut source: S,
    mut shutdown: watch::Receiver<Option<CloseReason>>,
) where
    S: futures_util::Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    let mut liveness = shared.config.liveness_period().map(|period| {
        let mut timer = time::interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer
    });
    let mut last_seen = Instant::now();
    let mut last_ping = Instant::now();

    let reason = loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tick(&mut liveness) => {
                if let Some(idle) = shared.config.idle_timeout {
                    if last_seen.elapsed() >= idle {
                        break CloseReason::IdleTimeout;
                    }
                }
                if let Some(interval) = shared.config.keep_alive_interval {
                    if last_ping.elapsed() >= interval {
                        last_ping = Instant::now();
                        shared.send(Frame::Ping { nonce: shared.next_nonce() });
                    }
                }
            }
            message = source.next() => {
                let message = match message {
                    None => break CloseReason::PeerClosed,
                    Some(Err(err)) => break CloseReason::Transport(Arc::new(err.into())),
                    Some(Ok(message)) => message,
                };
                last_seen = Instant::now();
                match message {
                    Message::Binary(data) => match Frame::decode(data) {
                        Ok(frame) => shared.handle_frame(frame),
                        Err(err) => {
                            warn!(error = %err, "malformed frame");
                            break CloseReason::Protocol(Arc::new(err.into()));
                        }
                    },
                    Message::Close(_) => break CloseReason::PeerClosed,
                    // Websocket-level ping/pong are answered by tungstenite.
                    _ => {}
                }
            }
        }
    };
    shared.terminate(reason);
}

/// The writer task: the only writer of the transport.
async fn write_loop<W>(
    shared: Arc<Shared>,
    mut sink: W,
    mut queue: mpsc::UnboundedReceiver<Frame>,
    mut shutdown: watch::Receiver<Option<CloseReason>>,
) where
    W: Sink<Message, Error = WsError> + Unpin,
{
    loop {
        tokio::select! {
            biased;
            frame = queue.recv() => {
                let Some(frame) = frame else { break };
                if let Err(err) = write_batch(&mut sink, &mut queue, frame).await {
                    warn!(error = %err, "transport write failed");
                    shared.terminate(CloseReason::Transport(Arc::new(err.into())));
                    return;
                }
            }
            _ = shutdown.changed() => {
                let mut flushed = 0usize;
                while let Ok(frame) = queue.try_recv() {
                    if sink.feed(Message::Binary(frame.encode())).await.is_err() {
                        break;
                    }
                    flushed += 1;
                }
                let _ = sink.flush().await;
                trace!(flushed, "outbound queue flushed");
                break;
            }
        }
    }
    let _ = sink.close().await;
}

async fn write_batch<W>(
    sink: &mut W,
    queue: &mut mpsc::UnboundedReceiver<Frame>,
    first: Frame,
) -> std::result::Result<(), WsError>
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    sink.feed(Message::Binary(first.encode())).await?;
    for _ in 1..MAX_WRITE_BATCH {
        match queue.try_recv() {
            Ok(frame) => sink.feed(Message::Binary(frame.encode())).await?,
            Err(_) => break,
        }
    }
    sink.flush().await
}
