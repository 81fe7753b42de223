//! HTTP/2 connection driver - background task that reads frames and routes them to streams.
//!
//! The driver is the only reader of the transport. It decodes one frame at a
//! time, applies connection-level effects, and hands stream-level effects to
//! the addressed stream. Anything it has to send in reply goes through the
//! control queue so it never waits on the writer lock.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::{Error, Initiator, Result};
use crate::h2::codec::{BoxedRead, FrameReader};
use crate::h2::connection::{Acceptor, ConnState, Inner, KEEPALIVE_PAYLOAD};
use crate::h2::flow_control::RecvWindow;
use crate::h2::frame::{
    DataFrame, ErrorCode, Frame, GoAwayFrame, PingFrame, RstStreamFrame, SettingsFrame,
    WindowUpdateFrame,
};
use crate::h2::header::{self, Header};
use crate::h2::push::PushEvent;
use crate::h2::settings::SettingsId;
use crate::h2::stream::{StreamHandle, StreamShared};
use crate::h2::worker::Control;
use crate::h2::Role;

enum HeadersOutcome {
    Handled,
    Push(PushEvent),
    Accept(Arc<StreamShared>),
}

/// HTTP/2 connection driver that runs in a background task.
pub(crate) struct ConnectionDriver {
    inner: Arc<Inner>,
    reader: FrameReader<BoxedRead>,
    acceptor: Acceptor,
    push_tx: Option<mpsc::Sender<PushEvent>>,
    /// Frames to send once the current frame's state changes are applied.
    replies: Vec<Control>,
}

impl ConnectionDriver {
    pub(crate) fn new(
        inner: Arc<Inner>,
        reader: FrameReader<BoxedRead>,
        acceptor: Acceptor,
        push_tx: Option<mpsc::Sender<PushEvent>>,
    ) -> Self {
        Self {
            inner,
            reader,
            acceptor,
            push_tx,
            replies: Vec::new(),
        }
    }

    /// Run the driver loop until EOF, a connection error, or a local close.
    pub(crate) async fn drive(mut self) {
        let mut closed = self.inner.close_tx.subscribe();

        let result = loop {
            tokio::select! {
                _ = async { let _ = closed.wait_for(|c| *c).await; } => break Ok(()),
                read = self.reader.read_frame() => match read {
                    Ok(Some(frame)) => {
                        if let Err(e) = self.handle_frame(frame).await {
                            break Err(e);
                        }
                    }
                    Ok(None) => {
                        tracing::debug!("peer closed the connection");
                        break Err(Error::connection_closed("peer closed the connection"));
                    }
                    Err(e) => break Err(e),
                },
            }
        };

        if let Err(e) = result {
            let (goaway, stream_code) = match &e {
                Error::ConnectionClosed(_) => (ErrorCode::NoError, ErrorCode::Cancel),
                Error::Io(_) => (ErrorCode::InternalError, ErrorCode::Cancel),
                other => {
                    tracing::warn!("connection error: {}", other);
                    (other.code(), ErrorCode::ProtocolError)
                }
            };
            self.inner.terminate(e, goaway, stream_code).await;
        }
        tracing::debug!("driver exiting");
    }

    /// Handle a single frame.
    async fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        match frame {
            Frame::Data(data) => self.on_data(data).await?,
            Frame::Headers {
                stream_id,
                end_stream,
                headers,
                ..
            } => self.on_headers(stream_id, headers, end_stream).await?,
            Frame::RstStream(rst) => self.on_rst_stream(rst).await,
            Frame::Settings(settings) => self.on_settings(settings)?,
            Frame::PushPromise {
                stream_id,
                promised_stream_id,
                headers,
            } => {
                self.on_push_promise(stream_id, promised_stream_id, headers)
                    .await?
            }
            Frame::Ping(ping) => self.on_ping(ping),
            Frame::GoAway(goaway) => self.on_goaway(goaway),
            Frame::WindowUpdate(update) => self.on_window_update(update)?,
            Frame::Priority(priority) => {
                tracing::trace!("ignoring PRIORITY for stream {}", priority.stream_id);
            }
            Frame::Unknown {
                frame_type,
                stream_id,
            } => {
                tracing::trace!(
                    "ignoring unknown frame type {:#x} on stream {}",
                    frame_type,
                    stream_id
                );
            }
        }

        for control in std::mem::take(&mut self.replies) {
            self.inner.enqueue(control).await;
        }
        Ok(())
    }

    fn reply(&mut self, control: Control) {
        self.replies.push(control);
    }

    fn reset_reply(&mut self, stream_id: u32, code: ErrorCode) {
        tracing::debug!("resetting stream {} with {:?}", stream_id, code);
        self.reply(Control::Reset { stream_id, code });
    }

    fn window_reply(&mut self, stream_id: u32, increment: Option<u32>) {
        if let Some(increment) = increment {
            self.reply(Control::WindowUpdate {
                stream_id,
                increment,
            });
        }
    }

    /// Reset a stream locally: record the code, drop it from the table,
    /// acknowledge whatever it had buffered, and queue RST_STREAM.
    fn reset_stream(
        &mut self,
        conn: &mut ConnState,
        stream: &StreamShared,
        code: ErrorCode,
        extra_unread: u32,
    ) {
        let unread = stream.lock().set_reset(code, Initiator::Local);
        stream.wake();
        self.inner.release_slot(conn, stream.id);
        conn.recent_resets.insert(stream.id);
        let increment = conn.recv_window.release(unread + extra_unread);
        self.window_reply(0, increment);
        self.reset_reply(stream.id, code);
    }

    async fn on_data(&mut self, frame: DataFrame) -> Result<()> {
        let stream_id = frame.stream_id;
        let flow_len = frame.flow_len();
        let padding = flow_len - frame.data.len() as u32;

        let inner = self.inner.clone();
        let push_event = {
            let mut conn = inner.lock_state();
            if !conn.recv_window.recv(flow_len) {
                tracing::warn!(
                    "peer exceeded connection receive window by {} bytes",
                    -conn.recv_window.window()
                );
            }

            if let Some(window) = conn.pushed.get_mut(&stream_id) {
                if !window.recv(flow_len) {
                    tracing::warn!(
                        "pushed stream {} exceeded its receive window ({} bytes)",
                        stream_id,
                        flow_len
                    );
                    conn.pushed.remove(&stream_id);
                    conn.recent_resets.insert(stream_id);
                    let increment = conn.recv_window.release(flow_len);
                    self.window_reply(0, increment);
                    self.reset_reply(stream_id, ErrorCode::FlowControlError);
                    Some(PushEvent::Reset {
                        stream_id,
                        code: ErrorCode::FlowControlError,
                    })
                } else {
                    // Pushed data goes straight to the observer, so it is
                    // acknowledged as soon as it arrives.
                    let stream_increment = if frame.end_stream {
                        None
                    } else {
                        window.consume(flow_len)
                    };
                    if frame.end_stream {
                        conn.pushed.remove(&stream_id);
                    }
                    let conn_increment = conn.recv_window.consume(flow_len);
                    self.window_reply(0, conn_increment);
                    self.window_reply(stream_id, stream_increment);
                    Some(PushEvent::Data {
                        stream_id,
                        data: frame.data,
                        end_stream: frame.end_stream,
                    })
                }
            } else if let Some(stream) = conn.streams.get(&stream_id).cloned() {
                let mut st = stream.lock();
                if st.recv_finished {
                    drop(st);
                    tracing::debug!("DATA after END_STREAM on stream {}", stream_id);
                    self.reset_stream(&mut conn, &stream, ErrorCode::StreamClosed, flow_len);
                } else if !st.recv_window.recv(flow_len) {
                    drop(st);
                    tracing::warn!(
                        "stream {} exceeded its receive window ({} bytes)",
                        stream_id,
                        flow_len
                    );
                    self.reset_stream(&mut conn, &stream, ErrorCode::FlowControlError, flow_len);
                } else {
                    if padding > 0 {
                        let stream_increment = st.recv_window.consume(padding);
                        let conn_increment = conn.recv_window.consume(padding);
                        self.window_reply(stream_id, stream_increment);
                        self.window_reply(0, conn_increment);
                    }
                    st.recv_buf.extend_from_slice(&frame.data);
                    if frame.end_stream {
                        st.recv_finished = true;
                        if st.send_finished {
                            drop(st);
                            inner.release_slot(&mut conn, stream_id);
                        }
                    }
                    stream.wake();
                }
                None
            } else if conn.recent_resets.contains(stream_id) {
                tracing::trace!("discarding DATA on reset stream {}", stream_id);
                let increment = conn.recv_window.release(flow_len);
                self.window_reply(0, increment);
                None
            } else {
                tracing::debug!("DATA on unknown or closed stream {}", stream_id);
                let increment = conn.recv_window.release(flow_len);
                self.window_reply(0, increment);
                self.reset_reply(stream_id, ErrorCode::ProtocolError);
                conn.recent_resets.insert(stream_id);
                None
            }
        };

        if let Some(event) = push_event {
            self.push(event).await;
        }
        Ok(())
    }

    async fn on_headers(
        &mut self,
        stream_id: u32,
        headers: Vec<Header>,
        end_stream: bool,
    ) -> Result<()> {
        match self.route_headers(stream_id, headers, end_stream) {
            HeadersOutcome::Handled => {}
            HeadersOutcome::Push(event) => self.push(event).await,
            HeadersOutcome::Accept(stream) => {
                tracing::debug!("accepted stream {}", stream_id);
                let handle = StreamHandle::new(self.inner.clone(), stream);
                tokio::spawn((self.acceptor)(handle));
            }
        }
        Ok(())
    }

    fn route_headers(
        &mut self,
        stream_id: u32,
        headers: Vec<Header>,
        end_stream: bool,
    ) -> HeadersOutcome {
        let role = self.inner.role;
        let inner = self.inner.clone();
        let mut conn = inner.lock_state();

        if conn.pushed.contains_key(&stream_id) {
            if end_stream {
                conn.pushed.remove(&stream_id);
            }
            return HeadersOutcome::Push(PushEvent::Headers {
                stream_id,
                headers,
                end_stream,
            });
        }

        if let Some(stream) = conn.streams.get(&stream_id).cloned() {
            let mut st = stream.lock();
            if st.recv_finished {
                drop(st);
                tracing::debug!("HEADERS after END_STREAM on stream {}", stream_id);
                self.reset_stream(&mut conn, &stream, ErrorCode::StreamClosed, 0);
            } else if let Err(e) = header::validate_block(&headers) {
                drop(st);
                tracing::debug!("malformed headers on stream {}: {}", stream_id, e);
                self.reset_stream(&mut conn, &stream, ErrorCode::ProtocolError, 0);
            } else {
                st.headers.push_back(headers);
                if end_stream {
                    st.recv_finished = true;
                    if st.send_finished {
                        drop(st);
                        inner.release_slot(&mut conn, stream_id);
                    }
                }
                stream.wake();
            }
            return HeadersOutcome::Handled;
        }

        // A new remotely-initiated stream. Servers only: clients see
        // peer-initiated streams through PUSH_PROMISE.
        if role != Role::Server || role.is_local(stream_id) {
            tracing::debug!("ignoring HEADERS on unexpected stream {}", stream_id);
            return HeadersOutcome::Handled;
        }
        if stream_id <= conn.last_remote_id {
            tracing::debug!(
                "ignoring HEADERS on stream {} (last accepted {})",
                stream_id,
                conn.last_remote_id
            );
            return HeadersOutcome::Handled;
        }
        if conn.shutdown {
            tracing::debug!("ignoring new stream {} after GOAWAY", stream_id);
            return HeadersOutcome::Handled;
        }
        conn.last_remote_id = stream_id;

        let limit = conn.local_settings.max_concurrent_streams(u32::MAX) as usize;
        let remote_open = conn.streams.len() - conn.local_stream_count(role);
        if remote_open >= limit {
            conn.recent_resets.insert(stream_id);
            self.reset_reply(stream_id, ErrorCode::RefusedStream);
            return HeadersOutcome::Handled;
        }
        if let Err(e) = header::validate_block(&headers) {
            tracing::debug!("malformed request on stream {}: {}", stream_id, e);
            conn.recent_resets.insert(stream_id);
            self.reset_reply(stream_id, ErrorCode::ProtocolError);
            return HeadersOutcome::Handled;
        }

        let stream = StreamShared::new(
            stream_id,
            conn.local_settings.initial_window_size(),
            conn.peer_settings.initial_window_size(),
            &self.inner.timeouts,
        );
        {
            let mut st = stream.lock();
            st.headers.push_back(headers);
            st.recv_finished = end_stream;
        }
        conn.streams.insert(stream_id, stream.clone());
        HeadersOutcome::Accept(stream)
    }

    async fn on_rst_stream(&mut self, rst: RstStreamFrame) {
        let stream_id = rst.stream_id;
        tracing::debug!("peer reset stream {} with {:?}", stream_id, rst.error_code);

        let inner = self.inner.clone();
        let push_event = {
            let mut conn = inner.lock_state();
            if conn.pushed.remove(&stream_id).is_some() {
                Some(PushEvent::Reset {
                    stream_id,
                    code: rst.error_code,
                })
            } else {
                if let Some(stream) = conn.streams.get(&stream_id).cloned() {
                    let unread = stream.lock().set_reset(rst.error_code, Initiator::Remote);
                    stream.wake();
                    inner.release_slot(&mut conn, stream_id);
                    let increment = conn.recv_window.release(unread);
                    self.window_reply(0, increment);
                }
                None
            }
        };

        if let Some(event) = push_event {
            self.push(event).await;
        }
    }

    fn on_settings(&mut self, frame: SettingsFrame) -> Result<()> {
        if frame.ack {
            tracing::debug!("peer acknowledged our SETTINGS");
            return Ok(());
        }
        frame.settings.validate()?;

        let streams = {
            let mut conn = self.inner.lock_state();
            let old_window = conn.peer_settings.initial_window_size() as i64;
            conn.peer_settings.merge(&frame.settings);
            let delta = conn.peer_settings.initial_window_size() as i64 - old_window;

            if delta != 0 {
                for stream in conn.streams.values() {
                    stream.lock().send_window.adjust(delta)?;
                }
            }
            conn.streams.values().cloned().collect::<Vec<_>>()
        };
        tracing::debug!("peer SETTINGS: {:?}", frame.settings);

        for stream in streams {
            stream.wake();
        }
        self.inner.capacity.notify_waiters();
        self.reply(Control::SettingsAck {
            header_table_size: frame.settings.get(SettingsId::HeaderTableSize),
            max_frame_size: frame.settings.get(SettingsId::MaxFrameSize),
        });
        Ok(())
    }

    async fn on_push_promise(
        &mut self,
        stream_id: u32,
        promised_stream_id: u32,
        headers: Vec<Header>,
    ) -> Result<()> {
        let role = self.inner.role;
        let inner = self.inner.clone();
        let event = {
            let mut conn = inner.lock_state();
            if role == Role::Server {
                return Err(Error::protocol(
                    ErrorCode::ProtocolError,
                    "client sent PUSH_PROMISE",
                ));
            }
            if !conn.local_settings.enable_push(true) || self.push_tx.is_none() {
                return Err(Error::protocol(
                    ErrorCode::ProtocolError,
                    "PUSH_PROMISE received with push disabled",
                ));
            }
            if role.is_local(promised_stream_id) || promised_stream_id <= conn.last_remote_id {
                return Err(Error::protocol(
                    ErrorCode::ProtocolError,
                    format!("invalid promised stream id {}", promised_stream_id),
                ));
            }
            if !role.is_local(stream_id) || stream_id >= conn.next_stream_id {
                return Err(Error::protocol(
                    ErrorCode::ProtocolError,
                    format!("PUSH_PROMISE on invalid stream {}", stream_id),
                ));
            }
            conn.last_remote_id = promised_stream_id;

            if !conn.streams.contains_key(&stream_id) {
                // Associated stream already gone; nobody wants the push.
                conn.recent_resets.insert(promised_stream_id);
                self.reset_reply(promised_stream_id, ErrorCode::Cancel);
                return Ok(());
            }

            let window = RecvWindow::new(conn.local_settings.initial_window_size());
            conn.pushed.insert(promised_stream_id, window);
            PushEvent::Promise {
                associated_stream_id: stream_id,
                promised_stream_id,
                headers,
            }
        };

        tracing::debug!("push promised: stream {} on {}", promised_stream_id, stream_id);
        self.push(event).await;
        Ok(())
    }

    fn on_ping(&mut self, ping: PingFrame) {
        if !ping.ack {
            self.reply(Control::PingAck(ping.data));
            return;
        }

        let mut conn = self.inner.lock_state();
        if ping.data == KEEPALIVE_PAYLOAD {
            conn.keepalive_outstanding = false;
        } else if let Some(tx) = conn.pings.remove(&ping.data) {
            let _ = tx.send(());
        } else {
            tracing::debug!("unsolicited PING ACK");
        }
    }

    fn on_goaway(&mut self, goaway: GoAwayFrame) {
        if goaway.error_code != ErrorCode::NoError {
            tracing::warn!(
                "GOAWAY from peer: {:?} last_stream_id={} debug={:?}",
                goaway.error_code,
                goaway.last_stream_id,
                String::from_utf8_lossy(&goaway.debug_data)
            );
        } else {
            tracing::debug!("GOAWAY from peer, last_stream_id={}", goaway.last_stream_id);
        }

        let role = self.inner.role;
        let inner = self.inner.clone();
        let refused = {
            let mut conn = inner.lock_state();
            conn.shutdown = true;
            conn.goaway_received = Some(goaway.last_stream_id);

            let refused: Vec<_> = conn
                .streams
                .iter()
                .filter(|(id, _)| role.is_local(**id) && **id > goaway.last_stream_id)
                .map(|(_, stream)| stream.clone())
                .collect();
            for stream in &refused {
                let unread = stream
                    .lock()
                    .set_reset(ErrorCode::RefusedStream, Initiator::Remote);
                inner.release_slot(&mut conn, stream.id);
                let increment = conn.recv_window.release(unread);
                self.window_reply(0, increment);
            }
            refused
        };

        for stream in refused {
            tracing::debug!("stream {} refused by GOAWAY", stream.id);
            stream.wake();
        }
        // Anyone waiting to open a stream must now fail.
        self.inner.capacity.notify_waiters();
    }

    fn on_window_update(&mut self, update: WindowUpdateFrame) -> Result<()> {
        let stream_id = update.stream_id;
        let inner = self.inner.clone();
        let mut conn = inner.lock_state();

        if stream_id == 0 {
            if update.increment == 0 {
                return Err(Error::protocol(
                    ErrorCode::ProtocolError,
                    "WINDOW_UPDATE with zero increment on connection",
                ));
            }
            conn.send_window.replenish(update.increment)?;
            tracing::trace!(
                "connection send window now {}",
                conn.send_window.window()
            );
            for stream in conn.streams.values() {
                stream.wake();
            }
            return Ok(());
        }

        let Some(stream) = conn.streams.get(&stream_id).cloned() else {
            return Ok(());
        };
        if update.increment == 0 {
            self.reset_stream(&mut conn, &stream, ErrorCode::ProtocolError, 0);
            return Ok(());
        }
        let replenished = stream.lock().send_window.replenish(update.increment);
        if replenished.is_err() {
            self.reset_stream(&mut conn, &stream, ErrorCode::FlowControlError, 0);
            return Ok(());
        }
        stream.wake();
        Ok(())
    }

    /// Hand an event to the push worker. Backpressure from a slow observer
    /// stalls reading, which in turn stalls the peer.
    async fn push(&mut self, event: PushEvent) {
        if let Some(tx) = &self.push_tx {
            if tx.send(event).await.is_err() {
                tracing::debug!("push worker gone");
            }
        }
    }
}
