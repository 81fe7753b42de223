//! HTTP/2 multiplexing over a single transport.
//!
//! [`ConnectionBuilder`] performs the preface and SETTINGS exchange on any
//! tokio `AsyncRead + AsyncWrite` and returns a [`Connection`]. A background
//! driver then owns all reading; callers open streams, read and write them
//! through [`StreamHandle`]s.
//!
//! ## Usage
//!
//! ```no_run
//! use h2mux::{ConnectionBuilder, Header};
//!
//! # async fn example(io: tokio::net::TcpStream) -> h2mux::Result<()> {
//! let conn = ConnectionBuilder::client()
//!     .initial_window_size(1 << 20)
//!     .handshake(io)
//!     .await?;
//!
//! let stream = conn
//!     .open_stream(
//!         vec![
//!             Header::new(":method", "GET"),
//!             Header::new(":scheme", "https"),
//!             Header::new(":authority", "example.com"),
//!             Header::new(":path", "/"),
//!         ],
//!         false,
//!     )
//!     .await?;
//! let response = stream.take_headers().await?;
//! let body = stream.read_to_end().await?;
//! # let _ = (response, body);
//! # Ok(())
//! # }
//! ```

mod codec;
mod connection;
mod driver;
mod flow_control;
mod frame;
mod header;
mod hpack;
mod push;
mod settings;
mod stream;
mod worker;

pub use codec::{BoxedRead, BoxedWrite, FrameReader, FrameWriter};
pub use connection::{AcceptFuture, Connection};
pub use flow_control::{RecvWindow, SendWindow};
pub use frame::{
    flags, ContinuationFrame, DataFrame, ErrorCode, Frame, FrameHeader, FrameType, GoAwayFrame,
    HeadersFrame, PingFrame, PriorityData, PriorityFrame, PushPromiseFrame, RstStreamFrame,
    SettingsFrame, WindowUpdateFrame, CONNECTION_PREFACE, DEFAULT_MAX_FRAME_SIZE,
    FRAME_HEADER_SIZE, MAX_MAX_FRAME_SIZE, MAX_WINDOW_SIZE,
};
pub use header::{find, request_headers, response_headers, status, validate_block, Header};
pub use hpack::{HeaderDecoder, HeaderEncoder, HpackDecoder, HpackEncoder};
pub use push::{PushObserver, RejectPushes};
pub use settings::{Settings, SettingsId, DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE};
pub use stream::{HeadersListener, StreamHandle};

use std::future::Future;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::timeouts::Timeouts;
use connection::Acceptor;

/// Largest header block the reader will reassemble when the local
/// MAX_HEADER_LIST_SIZE is unset.
const DEFAULT_MAX_HEADER_BLOCK: u32 = 256 * 1024;

/// Which end of the connection we are.
///
/// Clients initiate odd-numbered streams; servers push on even-numbered ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// True if `stream_id` has this role's parity.
    pub fn is_local(self, stream_id: u32) -> bool {
        let odd = stream_id % 2 == 1;
        match self {
            Role::Client => odd,
            Role::Server => !odd,
        }
    }
}

/// Builder for an HTTP/2 connection.
pub struct ConnectionBuilder {
    role: Role,
    settings: Settings,
    timeouts: Timeouts,
    acceptor: Option<Acceptor>,
    push_observer: Option<Box<dyn PushObserver>>,
    encoder: Option<Box<dyn HeaderEncoder>>,
    decoder: Option<Box<dyn HeaderDecoder>>,
}

impl ConnectionBuilder {
    /// Create a builder for `role` with protocol-default settings.
    pub fn new(role: Role) -> Self {
        let mut settings = Settings::new();
        if role == Role::Client {
            // Push stays off unless an observer is installed.
            settings.set(SettingsId::EnablePush, 0);
        }
        Self {
            role,
            settings,
            timeouts: Timeouts::default(),
            acceptor: None,
            push_observer: None,
            encoder: None,
            decoder: None,
        }
    }

    pub fn client() -> Self {
        Self::new(Role::Client)
    }

    pub fn server() -> Self {
        Self::new(Role::Server)
    }

    /// Replace every local setting at once.
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Set header table size (SETTINGS_HEADER_TABLE_SIZE).
    pub fn header_table_size(mut self, size: u32) -> Self {
        self.settings.set(SettingsId::HeaderTableSize, size);
        self
    }

    /// Set enable push (SETTINGS_ENABLE_PUSH).
    pub fn enable_push(mut self, enable: bool) -> Self {
        self.settings.set(SettingsId::EnablePush, enable as u32);
        self
    }

    /// Set max concurrent streams (SETTINGS_MAX_CONCURRENT_STREAMS).
    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.settings.set(SettingsId::MaxConcurrentStreams, max);
        self
    }

    /// Set initial window size (SETTINGS_INITIAL_WINDOW_SIZE).
    ///
    /// Also used for the connection-level receive window.
    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.settings.set(SettingsId::InitialWindowSize, size);
        self
    }

    /// Set max frame size (SETTINGS_MAX_FRAME_SIZE).
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.settings.set(SettingsId::MaxFrameSize, size);
        self
    }

    /// Set max header list size (SETTINGS_MAX_HEADER_LIST_SIZE).
    pub fn max_header_list_size(mut self, size: u32) -> Self {
        self.settings.set(SettingsId::MaxHeaderListSize, size);
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Handle remotely-initiated streams (server role).
    ///
    /// Each accepted stream runs `f` on its own task. Without an acceptor,
    /// incoming streams are refused with REFUSED_STREAM.
    pub fn on_stream<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(StreamHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let acceptor: Acceptor =
            Arc::new(move |stream: StreamHandle| Box::pin(f(stream)) as AcceptFuture);
        self.acceptor = Some(acceptor);
        self
    }

    /// Receive server pushes (client role). Enables SETTINGS_ENABLE_PUSH.
    pub fn push_observer(mut self, observer: impl PushObserver) -> Self {
        self.settings.set(SettingsId::EnablePush, 1);
        self.push_observer = Some(Box::new(observer));
        self
    }

    /// Use a custom header encoder instead of [`HpackEncoder`].
    pub fn header_encoder(mut self, encoder: impl HeaderEncoder + 'static) -> Self {
        self.encoder = Some(Box::new(encoder));
        self
    }

    /// Use a custom header decoder instead of [`HpackDecoder`].
    pub fn header_decoder(mut self, decoder: impl HeaderDecoder + 'static) -> Self {
        self.decoder = Some(Box::new(decoder));
        self
    }

    /// Get the configured settings.
    pub fn get_settings(&self) -> &Settings {
        &self.settings
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Exchange prefaces and SETTINGS over `io`, then start the connection.
    ///
    /// The client writes the preface; the server reads and verifies it. Both
    /// then send SETTINGS, followed by a connection WINDOW_UPDATE when the
    /// local initial window exceeds the protocol default. The peer's SETTINGS
    /// are applied by the driver as they arrive.
    pub async fn handshake<T>(self, io: T) -> Result<Connection>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.settings.validate()?;

        let (read_half, write_half) = tokio::io::split(io);

        let mut decoder = self
            .decoder
            .unwrap_or_else(|| Box::new(HpackDecoder::new()));
        decoder.set_header_table_size(self.settings.header_table_size());
        let encoder = self
            .encoder
            .unwrap_or_else(|| Box::new(HpackEncoder::new()));

        let mut reader = FrameReader::new(
            Box::new(read_half) as BoxedRead,
            decoder,
            self.settings.max_frame_size(DEFAULT_MAX_FRAME_SIZE),
            self.settings.max_header_list_size(DEFAULT_MAX_HEADER_BLOCK) as usize,
        );
        let mut writer = FrameWriter::new(Box::new(write_half) as BoxedWrite, encoder);

        match self.role {
            Role::Client => writer.buffer_raw(CONNECTION_PREFACE),
            Role::Server => reader.read_preface().await?,
        }

        writer.buffer(SettingsFrame::new(self.settings.clone()).serialize())?;
        let window = self.settings.initial_window_size();
        if window > DEFAULT_INITIAL_WINDOW_SIZE {
            writer.buffer(
                WindowUpdateFrame::new(0, window - DEFAULT_INITIAL_WINDOW_SIZE).serialize(),
            )?;
        }
        writer.flush().await?;
        tracing::debug!(
            "{:?} handshake sent, settings: {:?}",
            self.role,
            self.settings
        );

        let acceptor = self.acceptor.unwrap_or_else(refuse_streams);
        Ok(Connection::start(
            self.role,
            self.settings,
            self.timeouts,
            reader,
            writer,
            acceptor,
            self.push_observer,
        ))
    }
}

impl std::fmt::Debug for ConnectionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionBuilder")
            .field("role", &self.role)
            .field("settings", &self.settings)
            .field("timeouts", &self.timeouts)
            .field("acceptor", &self.acceptor.is_some())
            .field("push_observer", &self.push_observer.is_some())
            .finish()
    }
}

fn refuse_streams() -> Acceptor {
    Arc::new(|stream: StreamHandle| {
        Box::pin(async move {
            tracing::debug!("no acceptor, refusing stream {}", stream.id());
            let _ = stream.reset(ErrorCode::RefusedStream).await;
        }) as AcceptFuture
    })
}
