//! Per-stream state and the [`StreamHandle`] callers use to drive it.
//!
//! The driver fills a stream's header queue and receive buffer; the handle
//! drains them and pushes outbound bytes through the connection's writer.
//! Every state change wakes the stream's [`Notify`].

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::error::{Error, Initiator, Result};
use crate::h2::connection::{Inner, Opening};
use crate::h2::flow_control::{RecvWindow, SendWindow};
use crate::h2::frame::{DataFrame, ErrorCode, RstStreamFrame, DEFAULT_MAX_FRAME_SIZE};
use crate::h2::header::{self, Header};
use crate::h2::worker::Control;
use crate::h2::Role;
use crate::timeouts::Timeouts;

/// Buffered outbound bytes that trigger emission without an explicit flush.
const FLUSH_THRESHOLD: usize = DEFAULT_MAX_FRAME_SIZE as usize;

/// Receives header blocks (response headers, trailers) as they arrive.
pub type HeadersListener = Box<dyn FnMut(Vec<Header>) + Send>;

/// Mutable part of a stream.
pub(crate) struct StreamState {
    /// Header blocks not yet taken, oldest first.
    pub(crate) headers: VecDeque<Vec<Header>>,
    pub(crate) listener: Option<HeadersListener>,
    pub(crate) recv_buf: BytesMut,
    pub(crate) recv_window: RecvWindow,
    pub(crate) send_window: SendWindow,
    pub(crate) send_buf: BytesMut,
    /// Peer sent END_STREAM.
    pub(crate) recv_finished: bool,
    /// We sent END_STREAM.
    pub(crate) send_finished: bool,
    pub(crate) reset: Option<(ErrorCode, Initiator)>,
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) write_timeout: Option<Duration>,
}

impl StreamState {
    pub(crate) fn is_closed(&self) -> bool {
        self.reset.is_some() || (self.recv_finished && self.send_finished)
    }

    fn reset_error(&self, stream_id: u32) -> Option<Error> {
        self.reset.map(|(code, initiator)| Error::StreamReset {
            stream_id,
            code,
            initiator,
        })
    }

    /// Record a reset. Returns the count of received-but-unread bytes, which
    /// are discarded and must be acknowledged at the connection level.
    pub(crate) fn set_reset(&mut self, code: ErrorCode, initiator: Initiator) -> u32 {
        if self.reset.is_none() {
            self.reset = Some((code, initiator));
        }
        self.send_buf.clear();
        let unread = self.recv_buf.len() as u32;
        self.recv_buf.clear();
        unread
    }
}

/// A stream as stored in the connection's table.
pub(crate) struct StreamShared {
    pub(crate) id: u32,
    state: Mutex<StreamState>,
    notify: Notify,
}

impl StreamShared {
    pub(crate) fn new(id: u32, recv_window: u32, send_window: u32, timeouts: &Timeouts) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(StreamState {
                headers: VecDeque::new(),
                listener: None,
                recv_buf: BytesMut::new(),
                recv_window: RecvWindow::new(recv_window),
                send_window: SendWindow::new(send_window),
                send_buf: BytesMut::new(),
                recv_finished: false,
                send_finished: false,
                reset: None,
                read_timeout: timeouts.stream_read,
                write_timeout: timeouts.stream_write,
            }),
            notify: Notify::new(),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().expect("stream state mutex poisoned")
    }

    /// Wake every task waiting on this stream.
    pub(crate) fn wake(&self) {
        self.notify.notify_waiters();
    }
}

enum Emit {
    Frame(DataFrame),
    Done,
    Wait,
}

enum ReadStep {
    Data(Bytes),
    Deliver(Vec<Vec<Header>>, HeadersListener),
    Wait(Option<Duration>),
}

/// Handle to one stream of a [`Connection`](crate::h2::Connection).
///
/// Dropping a handle whose stream is still open resets it with CANCEL.
pub struct StreamHandle {
    inner: Arc<Inner>,
    shared: Arc<StreamShared>,
}

impl StreamHandle {
    pub(crate) fn new(inner: Arc<Inner>, shared: Arc<StreamShared>) -> Self {
        Self { inner, shared }
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// The reset code, once the stream has been reset by either side.
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.shared.lock().reset.map(|(code, _)| code)
    }

    /// True once both directions are finished or the stream was reset.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().is_closed()
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.shared.lock().read_timeout = timeout;
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) {
        self.shared.lock().write_timeout = timeout;
    }

    /// Deliver header blocks to `listener` instead of queueing them for
    /// [`take_headers`](Self::take_headers). Queued blocks are handed over on
    /// the next read, ahead of any body bytes.
    pub fn set_headers_listener<F>(&self, listener: F)
    where
        F: FnMut(Vec<Header>) + Send + 'static,
    {
        self.shared.lock().listener = Some(Box::new(listener));
    }

    /// Wait for a stream wakeup, bounded by `limit`.
    ///
    /// On expiry the stream is reset with CANCEL.
    async fn wait(&self, notified: Pin<&mut Notified<'_>>, limit: Option<Duration>) -> Result<()> {
        match limit {
            Some(limit) => {
                if tokio::time::timeout(limit, notified).await.is_err() {
                    tracing::debug!("stream {} timed out after {:?}", self.id(), limit);
                    self.reset(ErrorCode::Cancel).await?;
                    return Err(Error::Timeout(limit));
                }
                Ok(())
            }
            None => {
                notified.await;
                Ok(())
            }
        }
    }

    /// Pop the next header block, waiting until one arrives.
    ///
    /// Fails with [`Error::StreamClosed`] if the peer finished the stream
    /// without sending (more) headers.
    pub async fn take_headers(&self) -> Result<Vec<Header>> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let timeout = {
                let mut st = self.shared.lock();
                if let Some(err) = st.reset_error(self.id()) {
                    return Err(err);
                }
                if let Some(headers) = st.headers.pop_front() {
                    return Ok(headers);
                }
                if st.recv_finished {
                    return Err(Error::StreamClosed(self.id()));
                }
                st.read_timeout
            };
            self.wait(notified, timeout).await?;
        }
    }

    /// Read up to `max` body bytes.
    ///
    /// Returns `Ok(None)` once the peer has finished the stream and every
    /// byte was read. A reset is reported immediately, even if unread bytes
    /// were buffered. A `max` of zero returns an empty chunk without waiting.
    pub async fn read(&self, max: usize) -> Result<Option<Bytes>> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let step = {
                let mut st = self.shared.lock();
                if let Some(err) = st.reset_error(self.id()) {
                    return Err(err);
                }
                if max == 0 {
                    return Ok(Some(Bytes::new()));
                }
                if st.listener.is_some() && !st.headers.is_empty() {
                    let pending: Vec<_> = st.headers.drain(..).collect();
                    match st.listener.take() {
                        Some(listener) => ReadStep::Deliver(pending, listener),
                        None => ReadStep::Wait(st.read_timeout),
                    }
                } else if !st.recv_buf.is_empty() {
                    let n = st.recv_buf.len().min(max);
                    ReadStep::Data(st.recv_buf.split_to(n).freeze())
                } else if st.recv_finished {
                    return Ok(None);
                } else {
                    ReadStep::Wait(st.read_timeout)
                }
            };

            match step {
                ReadStep::Data(data) => {
                    self.consumed(data.len() as u32).await;
                    return Ok(Some(data));
                }
                ReadStep::Deliver(pending, mut listener) => {
                    // Run the listener without holding the stream lock.
                    for block in pending {
                        listener(block);
                    }
                    let mut st = self.shared.lock();
                    if st.listener.is_none() {
                        st.listener = Some(listener);
                    }
                }
                ReadStep::Wait(timeout) => self.wait(notified, timeout).await?,
            }
        }
    }

    /// Read the rest of the body.
    pub async fn read_to_end(&self) -> Result<Bytes> {
        let mut body = BytesMut::new();
        while let Some(chunk) = self.read(usize::MAX).await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }

    /// Account for bytes handed to the application and send WINDOW_UPDATEs
    /// once half a window has been consumed.
    async fn consumed(&self, n: u32) {
        let (conn_increment, stream_increment) = {
            let mut conn = self.inner.lock_state();
            let conn_increment = conn.recv_window.consume(n);
            let mut st = self.shared.lock();
            // No point granting credit on a stream the peer has finished.
            let stream_increment = if st.recv_finished {
                None
            } else {
                st.recv_window.consume(n)
            };
            (conn_increment, stream_increment)
        };

        if let Some(increment) = conn_increment {
            self.inner
                .enqueue(Control::WindowUpdate {
                    stream_id: 0,
                    increment,
                })
                .await;
        }
        if let Some(increment) = stream_increment {
            self.inner
                .enqueue(Control::WindowUpdate {
                    stream_id: self.id(),
                    increment,
                })
                .await;
        }
    }

    /// Buffer body bytes. Full frames are sent once enough is buffered.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let should_send = {
            let mut st = self.shared.lock();
            if let Some(err) = st.reset_error(self.id()) {
                return Err(err);
            }
            if st.send_finished {
                return Err(Error::StreamClosed(self.id()));
            }
            st.send_buf.extend_from_slice(data);
            st.send_buf.len() >= FLUSH_THRESHOLD
        };
        if should_send {
            self.send_buffered(false, false).await?;
        }
        Ok(())
    }

    /// Send everything buffered.
    pub async fn flush(&self) -> Result<()> {
        self.send_buffered(true, false).await
    }

    /// Send everything buffered and finish the write side with END_STREAM.
    ///
    /// With nothing buffered this sends one empty DATA frame.
    pub async fn close_write(&self) -> Result<()> {
        self.send_buffered(true, true).await
    }

    /// Send a header block on this stream: response headers, informational
    /// headers or trailers.
    pub async fn write_headers(&self, headers: Vec<Header>, end_stream: bool) -> Result<()> {
        header::validate_block(&headers)?;
        self.flush().await?;

        let mut writer = self.inner.writer.lock().await;
        {
            let mut conn = self.inner.lock_state();
            let mut st = self.shared.lock();
            if let Some(err) = st.reset_error(self.id()) {
                return Err(err);
            }
            if st.send_finished {
                return Err(Error::StreamClosed(self.id()));
            }
            if end_stream {
                st.send_finished = true;
                if st.recv_finished {
                    drop(st);
                    self.inner.release_slot(&mut conn, self.id());
                }
            }
        }
        writer.buffer_headers(self.id(), &headers, end_stream)?;
        writer.flush().await
    }

    /// Reset the stream with `code` and close it locally.
    pub async fn reset(&self, code: ErrorCode) -> Result<()> {
        let increment = {
            let mut conn = self.inner.lock_state();
            let mut st = self.shared.lock();
            if st.is_closed() {
                return Ok(());
            }
            let unread = st.set_reset(code, Initiator::Local);
            drop(st);
            self.inner.release_slot(&mut conn, self.id());
            conn.recent_resets.insert(self.id());
            conn.recv_window.release(unread)
        };
        self.shared.wake();

        tracing::debug!("resetting stream {} with {:?}", self.id(), code);
        self.inner
            .write_frame(RstStreamFrame::new(self.id(), code).serialize())
            .await?;
        if let Some(increment) = increment {
            self.inner
                .enqueue(Control::WindowUpdate {
                    stream_id: 0,
                    increment,
                })
                .await;
        }
        Ok(())
    }

    /// Promise and open a pushed stream associated with this one (server role).
    ///
    /// Sends PUSH_PROMISE carrying `request_headers` on this stream, then the
    /// pushed stream's `response_headers`. The returned handle is used to
    /// write the pushed body.
    pub async fn push_stream(
        &self,
        request_headers: Vec<Header>,
        response_headers: Vec<Header>,
    ) -> Result<StreamHandle> {
        if self.inner.role != Role::Server {
            return Err(Error::protocol(
                ErrorCode::ProtocolError,
                "only servers can push",
            ));
        }
        header::validate_block(&request_headers)?;
        header::validate_block(&response_headers)?;
        {
            let st = self.shared.lock();
            if let Some(err) = st.reset_error(self.id()) {
                return Err(err);
            }
            if st.send_finished {
                return Err(Error::StreamClosed(self.id()));
            }
        }

        let shared = self
            .inner
            .open_local(Opening::Push {
                associated: self.id(),
                request: &request_headers,
                response: &response_headers,
            })
            .await?;
        Ok(StreamHandle::new(self.inner.clone(), shared))
    }

    /// Emit buffered bytes as DATA frames, waiting for window credit.
    async fn send_buffered(&self, flush_all: bool, end_stream: bool) -> Result<()> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let timeout = {
                let mut writer = self.inner.writer.lock().await;
                let max_frame_size = writer.max_frame_size();
                match self.next_data_frame(max_frame_size, flush_all, end_stream)? {
                    Emit::Frame(frame) => {
                        let last = frame.end_stream;
                        writer.buffer(frame.serialize())?;
                        writer.flush().await?;
                        if last {
                            return Ok(());
                        }
                        continue;
                    }
                    Emit::Done => return Ok(()),
                    Emit::Wait => self.shared.lock().write_timeout,
                }
            };
            tracing::trace!("stream {} waiting for send window", self.id());
            self.wait(notified, timeout).await?;
        }
    }

    /// Size the next DATA frame as min(buffered, stream window, connection
    /// window, peer max frame size) and debit both windows.
    fn next_data_frame(&self, max_frame_size: u32, flush_all: bool, end_stream: bool) -> Result<Emit> {
        let id = self.id();
        let mut conn = self.inner.lock_state();
        let mut st = self.shared.lock();
        if let Some(err) = st.reset_error(id) {
            return Err(err);
        }
        if let Some(err) = conn.closed_error() {
            return Err(err);
        }
        if st.send_finished {
            return Err(Error::StreamClosed(id));
        }

        let buffered = st.send_buf.len();
        if buffered == 0 && !end_stream {
            return Ok(Emit::Done);
        }
        if !flush_all && buffered < FLUSH_THRESHOLD {
            return Ok(Emit::Done);
        }

        let n = buffered
            .min(st.send_window.available() as usize)
            .min(conn.send_window.available() as usize)
            .min(max_frame_size as usize);
        if n == 0 && buffered > 0 {
            return Ok(Emit::Wait);
        }

        st.send_window.consume(n as u32);
        conn.send_window.consume(n as u32);
        let data = st.send_buf.split_to(n).freeze();
        let last = end_stream && st.send_buf.is_empty();
        if last {
            st.send_finished = true;
            if st.recv_finished {
                drop(st);
                self.inner.release_slot(&mut conn, id);
            }
        }
        Ok(Emit::Frame(DataFrame::new(id, data).end_stream(last)))
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        let id = self.id();
        let (reset, increment) = {
            let mut conn = self.inner.lock_state();
            let mut st = self.shared.lock();
            let reset = !st.is_closed() && conn.closed.is_none();
            let unread = if reset {
                st.set_reset(ErrorCode::Cancel, Initiator::Local)
            } else {
                let unread = st.recv_buf.len() as u32;
                st.recv_buf.clear();
                unread
            };
            drop(st);
            if reset {
                self.inner.release_slot(&mut conn, id);
                conn.recent_resets.insert(id);
            }
            let increment = if unread > 0 && conn.closed.is_none() {
                conn.recv_window.release(unread)
            } else {
                None
            };
            (reset, increment)
        };

        if reset {
            tracing::debug!("stream {} dropped while open, resetting", id);
            self.shared.wake();
            self.inner.try_enqueue(Control::Reset {
                stream_id: id,
                code: ErrorCode::Cancel,
            });
        }
        if let Some(increment) = increment {
            self.inner.try_enqueue(Control::WindowUpdate {
                stream_id: 0,
                increment,
            });
        }
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.shared.lock();
        f.debug_struct("StreamHandle")
            .field("id", &self.shared.id)
            .field("recv_finished", &st.recv_finished)
            .field("send_finished", &st.send_finished)
            .field("reset", &st.reset)
            .finish()
    }
}
