//! HTTP/2 connection state and the public [`Connection`] handle.
//!
//! Shared state lives in [`Inner`]: the stream table, settings and windows
//! behind one std mutex, and the frame writer behind one async mutex. Lock
//! order is writer, then connection state, then stream state. No std lock is
//! held across an await.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex, Notify};

use crate::error::{Error, Result};
use crate::h2::codec::{BoxedRead, BoxedWrite, FrameReader, FrameWriter};
use crate::h2::driver::ConnectionDriver;
use crate::h2::flow_control::{RecvWindow, SendWindow};
use crate::h2::frame::{ErrorCode, GoAwayFrame, PingFrame};
use crate::h2::header::{self, Header};
use crate::h2::push::{run_push_worker, PushObserver};
use crate::h2::settings::{Settings, DEFAULT_INITIAL_WINDOW_SIZE};
use crate::h2::stream::{StreamHandle, StreamShared};
use crate::h2::worker::{run_control_writer, run_keepalive, Control};
use crate::h2::Role;
use crate::timeouts::Timeouts;

/// Largest stream id (31 bits).
const MAX_STREAM_ID: u32 = 0x7fff_ffff;

/// Depth of the deferred control-frame queue.
const CONTROL_QUEUE_DEPTH: usize = 256;

/// Depth of the push-event queue.
pub(crate) const PUSH_QUEUE_DEPTH: usize = 64;

/// How many locally reset stream ids are remembered for discarding late frames.
const RECENT_RESETS: usize = 128;

/// Bound on how long teardown waits to get a GOAWAY out.
const GOAWAY_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Opaque payload of keepalive PINGs.
pub(crate) const KEEPALIVE_PAYLOAD: [u8; 8] = *b"h2mux-ka";

/// Future returned by a stream acceptor.
pub type AcceptFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Callback that receives remotely-initiated streams.
pub(crate) type Acceptor = Arc<dyn Fn(StreamHandle) -> AcceptFuture + Send + Sync>;

/// Connection-wide mutable state.
pub(crate) struct ConnState {
    /// Open streams only. Closed streams are removed and never reinstated.
    pub(crate) streams: HashMap<u32, Arc<StreamShared>>,
    pub(crate) local_settings: Settings,
    pub(crate) peer_settings: Settings,
    pub(crate) send_window: SendWindow,
    pub(crate) recv_window: RecvWindow,
    /// Next id for a locally-initiated stream (requests, or pushes on a server).
    pub(crate) next_stream_id: u32,
    /// Highest remotely-initiated (or promised) id seen so far.
    pub(crate) last_remote_id: u32,
    /// GOAWAY sent or received.
    pub(crate) shutdown: bool,
    /// Last-stream-id of a received GOAWAY.
    pub(crate) goaway_received: Option<u32>,
    /// Why the connection closed. Set exactly once.
    pub(crate) closed: Option<Error>,
    pub(crate) pings: HashMap<[u8; 8], oneshot::Sender<()>>,
    pub(crate) ping_counter: u64,
    pub(crate) keepalive_outstanding: bool,
    /// Promised streams still being received (client role).
    pub(crate) pushed: HashMap<u32, RecvWindow>,
    /// Streams we reset. Frames the peer already had in flight on them are
    /// dropped quietly.
    pub(crate) recent_resets: RecentIds,
}

impl ConnState {
    /// Streams we initiated that are still open.
    pub(crate) fn local_stream_count(&self, role: Role) -> usize {
        self.streams.keys().filter(|id| role.is_local(**id)).count()
    }

    pub(crate) fn closed_error(&self) -> Option<Error> {
        self.closed
            .as_ref()
            .map(|reason| Error::connection_closed(reason.to_string()))
    }
}

/// Bounded set of stream ids; the oldest id is evicted first.
#[derive(Debug)]
pub(crate) struct RecentIds {
    ids: VecDeque<u32>,
    capacity: usize,
}

impl RecentIds {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            ids: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn insert(&mut self, id: u32) {
        if self.capacity == 0 || self.contains(id) {
            return;
        }
        if self.ids.len() == self.capacity {
            self.ids.pop_front();
        }
        self.ids.push_back(id);
    }

    pub(crate) fn contains(&self, id: u32) -> bool {
        self.ids.contains(&id)
    }
}

/// Shared core of a connection.
pub(crate) struct Inner {
    pub(crate) role: Role,
    pub(crate) state: Mutex<ConnState>,
    pub(crate) writer: Arc<AsyncMutex<FrameWriter<BoxedWrite>>>,
    pub(crate) control: mpsc::Sender<Control>,
    /// Woken when a locally-initiated stream slot may have become free.
    pub(crate) capacity: Notify,
    pub(crate) close_tx: watch::Sender<bool>,
    pub(crate) timeouts: Timeouts,
}

/// What a locally-initiated stream starts with.
#[derive(Clone, Copy)]
pub(crate) enum Opening<'a> {
    Request {
        headers: &'a [Header],
        end_stream: bool,
    },
    Push {
        associated: u32,
        request: &'a [Header],
        response: &'a [Header],
    },
}

impl Inner {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().expect("connection state mutex poisoned")
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.close_tx.borrow()
    }

    /// Queue a deferred control frame. No-op once the connection is closed.
    pub(crate) async fn enqueue(&self, control: Control) {
        if self.is_closed() {
            return;
        }
        if self.control.send(control).await.is_err() {
            tracing::debug!("control writer gone, dropping frame");
        }
    }

    /// Non-async variant for drop paths.
    pub(crate) fn try_enqueue(&self, control: Control) {
        if self.is_closed() {
            return;
        }
        match self.control.try_send(control) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(control)) => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let tx = self.control.clone();
                    handle.spawn(async move {
                        let _ = tx.send(control).await;
                    });
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Write one serialized frame immediately.
    pub(crate) async fn write_frame(&self, frame: BytesMut) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.buffer(frame)?;
        writer.flush().await
    }

    /// Remove a stream from the table and wake anyone waiting for a slot.
    pub(crate) fn release_slot(&self, conn: &mut ConnState, stream_id: u32) {
        if conn.streams.remove(&stream_id).is_some() {
            tracing::debug!("stream {} removed ({} open)", stream_id, conn.streams.len());
            self.capacity.notify_waiters();
        }
    }

    /// Mark the connection closed and reset every stream.
    ///
    /// Returns false if it was already closed.
    pub(crate) fn close_streams(&self, error: Error, stream_code: ErrorCode) -> bool {
        let streams = {
            let mut conn = self.lock_state();
            if conn.closed.is_some() {
                return false;
            }
            tracing::debug!("connection closing: {}", error);
            conn.closed = Some(error);
            conn.shutdown = true;
            // Dropping the senders fails every pending ping.
            conn.pings.clear();
            conn.pushed.clear();
            conn.streams.drain().map(|(_, s)| s).collect::<Vec<_>>()
        };

        for stream in streams {
            stream
                .lock()
                .set_reset(stream_code, crate::error::Initiator::Local);
            stream.wake();
        }
        self.close_tx.send_replace(true);
        self.capacity.notify_waiters();
        true
    }

    /// Close the connection: reset streams, send GOAWAY best-effort, shut the
    /// transport down.
    pub(crate) async fn terminate(&self, error: Error, goaway: ErrorCode, stream_code: ErrorCode) {
        let last_stream_id = self.lock_state().last_remote_id;
        if !self.close_streams(error, stream_code) {
            return;
        }

        let sent = tokio::time::timeout(GOAWAY_FLUSH_TIMEOUT, async {
            let mut writer = self.writer.lock().await;
            writer.buffer(GoAwayFrame::new(last_stream_id, goaway).serialize())?;
            writer.shutdown().await
        })
        .await;
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("GOAWAY on teardown failed: {}", e),
            Err(_) => tracing::debug!("GOAWAY on teardown timed out"),
        }
    }

    /// Allocate a locally-initiated stream and put its opening frames on the wire.
    ///
    /// Waits while the peer's MAX_CONCURRENT_STREAMS is reached.
    pub(crate) async fn open_local(&self, opening: Opening<'_>) -> Result<Arc<StreamShared>> {
        loop {
            let notified = self.capacity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut writer = self.writer.lock().await;
                let allocated = {
                    let mut conn = self.lock_state();
                    if let Some(err) = conn.closed_error() {
                        return Err(err);
                    }
                    if conn.shutdown {
                        return Err(Error::Shutdown);
                    }
                    if matches!(opening, Opening::Push { .. }) && !conn.peer_settings.enable_push(true)
                    {
                        return Err(Error::protocol(
                            ErrorCode::RefusedStream,
                            "peer disabled server push",
                        ));
                    }

                    let limit = conn.peer_settings.max_concurrent_streams(u32::MAX) as usize;
                    if conn.local_stream_count(self.role) >= limit {
                        tracing::trace!("stream limit {} reached, waiting", limit);
                        None
                    } else {
                        let id = conn.next_stream_id;
                        if id > MAX_STREAM_ID {
                            return Err(Error::connection_closed("stream ids exhausted"));
                        }
                        conn.next_stream_id += 2;

                        let shared = StreamShared::new(
                            id,
                            conn.local_settings.initial_window_size(),
                            conn.peer_settings.initial_window_size(),
                            &self.timeouts,
                        );
                        {
                            let mut st = shared.lock();
                            match opening {
                                Opening::Request { end_stream, .. } => st.send_finished = end_stream,
                                // We never receive on a stream we push.
                                Opening::Push { .. } => st.recv_finished = true,
                            }
                        }
                        conn.streams.insert(id, shared.clone());
                        Some(shared)
                    }
                };

                if let Some(shared) = allocated {
                    let id = shared.id;
                    let encoded = match opening {
                        Opening::Request {
                            headers,
                            end_stream,
                        } => writer.buffer_headers(id, headers, end_stream),
                        Opening::Push {
                            associated,
                            request,
                            response,
                        } => writer
                            .buffer_push_promise(associated, id, request)
                            .and_then(|_| writer.buffer_headers(id, response, false)),
                    };
                    if let Err(e) = encoded {
                        let mut conn = self.lock_state();
                        self.release_slot(&mut conn, id);
                        return Err(e);
                    }
                    writer.flush().await?;
                    tracing::debug!("opened stream {}", id);
                    return Ok(shared);
                }
            }

            notified.await;
        }
    }
}

/// A running HTTP/2 connection.
///
/// Cheap to clone; every clone refers to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Wire up shared state and spawn the background tasks.
    pub(crate) fn start(
        role: Role,
        local_settings: Settings,
        timeouts: Timeouts,
        reader: FrameReader<BoxedRead>,
        writer: FrameWriter<BoxedWrite>,
        acceptor: Acceptor,
        push_observer: Option<Box<dyn PushObserver>>,
    ) -> Self {
        let local_window = local_settings
            .initial_window_size()
            .max(DEFAULT_INITIAL_WINDOW_SIZE);
        let state = ConnState {
            streams: HashMap::new(),
            local_settings,
            peer_settings: Settings::new(),
            send_window: SendWindow::new(DEFAULT_INITIAL_WINDOW_SIZE),
            recv_window: RecvWindow::new(local_window),
            next_stream_id: match role {
                Role::Client => 1,
                Role::Server => 2,
            },
            last_remote_id: 0,
            shutdown: false,
            goaway_received: None,
            closed: None,
            pings: HashMap::new(),
            ping_counter: 0,
            keepalive_outstanding: false,
            pushed: HashMap::new(),
            recent_resets: RecentIds::with_capacity(RECENT_RESETS),
        };

        let writer = Arc::new(AsyncMutex::new(writer));
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);
        let (close_tx, close_rx) = watch::channel(false);
        let keepalive = timeouts.keepalive;

        let inner = Arc::new(Inner {
            role,
            state: Mutex::new(state),
            writer: writer.clone(),
            control: control_tx,
            capacity: Notify::new(),
            close_tx,
            timeouts,
        });

        tokio::spawn(run_control_writer(writer, control_rx, close_rx.clone()));

        let push_tx = push_observer.map(|observer| {
            let (tx, rx) = mpsc::channel(PUSH_QUEUE_DEPTH);
            tokio::spawn(run_push_worker(inner.clone(), observer, rx));
            tx
        });

        if let Some(interval) = keepalive {
            tokio::spawn(run_keepalive(Arc::downgrade(&inner), interval, close_rx));
        }

        let driver = ConnectionDriver::new(inner.clone(), reader, acceptor, push_tx);
        tokio::spawn(driver.drive());

        tracing::debug!("{:?} connection started", role);
        Self { inner }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Open a new stream by sending its request headers.
    ///
    /// With `has_body == false` the HEADERS frame carries END_STREAM and the
    /// write side is closed immediately. Waits while the peer's
    /// MAX_CONCURRENT_STREAMS is reached; fails once the connection is shut
    /// down or closed.
    pub async fn open_stream(&self, headers: Vec<Header>, has_body: bool) -> Result<StreamHandle> {
        if self.inner.role == Role::Server {
            return Err(Error::protocol(
                ErrorCode::ProtocolError,
                "servers open streams only through push_stream",
            ));
        }
        header::validate_block(&headers)?;
        let shared = self
            .inner
            .open_local(Opening::Request {
                headers: &headers,
                end_stream: !has_body,
            })
            .await?;
        Ok(StreamHandle::new(self.inner.clone(), shared))
    }

    /// Send a PING and wait for its ACK. Returns the round-trip time.
    ///
    /// If no ACK arrives within the ping timeout the connection is closed and
    /// [`Error::PingTimeout`] is returned.
    pub async fn ping(&self) -> Result<Duration> {
        let (tx, rx) = oneshot::channel();
        let payload = {
            let mut conn = self.inner.lock_state();
            if let Some(err) = conn.closed_error() {
                return Err(err);
            }
            conn.ping_counter += 1;
            let payload = conn.ping_counter.to_be_bytes();
            conn.pings.insert(payload, tx);
            payload
        };

        let start = Instant::now();
        if let Err(e) = self
            .inner
            .write_frame(PingFrame::new(payload).serialize())
            .await
        {
            self.inner.lock_state().pings.remove(&payload);
            return Err(e);
        }

        let acked = match self.inner.timeouts.ping {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(acked) => acked,
                Err(_) => {
                    tracing::warn!("PING not acknowledged within {:?}, closing", limit);
                    self.inner
                        .terminate(Error::PingTimeout(limit), ErrorCode::NoError, ErrorCode::Cancel)
                        .await;
                    return Err(Error::PingTimeout(limit));
                }
            },
            None => rx.await,
        };

        match acked {
            Ok(()) => Ok(start.elapsed()),
            Err(_) => Err(self
                .inner
                .lock_state()
                .closed_error()
                .unwrap_or_else(|| Error::connection_closed("ping abandoned"))),
        }
    }

    /// Flush anything buffered in the writer.
    pub async fn flush(&self) -> Result<()> {
        self.inner.writer.lock().await.flush().await
    }

    /// Start a graceful shutdown: send GOAWAY with the last accepted stream id.
    ///
    /// Streams already in flight keep running; no new streams are opened or
    /// accepted.
    pub async fn shutdown(&self, code: ErrorCode) -> Result<()> {
        let last_stream_id = {
            let mut conn = self.inner.lock_state();
            if let Some(err) = conn.closed_error() {
                return Err(err);
            }
            conn.shutdown = true;
            conn.last_remote_id
        };
        self.inner.capacity.notify_waiters();
        tracing::debug!("sending GOAWAY last_stream_id={} code={:?}", last_stream_id, code);
        self.inner
            .write_frame(GoAwayFrame::new(last_stream_id, code).serialize())
            .await
    }

    /// Close immediately: GOAWAY, reset every stream, close the transport.
    pub async fn close(&self) {
        self.inner
            .terminate(
                Error::connection_closed("closed locally"),
                ErrorCode::NoError,
                ErrorCode::Cancel,
            )
            .await;
    }

    /// Wait until the connection has closed. Returns the reason.
    pub async fn closed(&self) -> Error {
        let mut rx = self.inner.close_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
        self.inner
            .lock_state()
            .closed
            .clone()
            .unwrap_or_else(|| Error::connection_closed("closed"))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// True once GOAWAY was sent or received, or the connection closed.
    pub fn is_shutdown(&self) -> bool {
        self.inner.lock_state().shutdown
    }

    /// Number of streams currently in the stream table.
    pub fn open_stream_count(&self) -> usize {
        self.inner.lock_state().streams.len()
    }

    /// Settings the peer has advertised so far.
    pub fn peer_settings(&self) -> Settings {
        self.inner.lock_state().peer_settings.clone()
    }

    /// Settings we advertised.
    pub fn local_settings(&self) -> Settings {
        self.inner.lock_state().local_settings.clone()
    }

    /// Last-stream-id of a GOAWAY received from the peer, if any.
    pub fn goaway_received(&self) -> Option<u32> {
        self.inner.lock_state().goaway_received
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let conn = self.inner.lock_state();
        f.debug_struct("Connection")
            .field("role", &self.inner.role)
            .field("streams", &conn.streams.len())
            .field("shutdown", &conn.shutdown)
            .field("closed", &conn.closed.is_some())
            .finish()
    }
}
