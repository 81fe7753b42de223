//! Timeout configuration for HTTP/2 connections and streams.
//!
//! # Timeout Types
//!
//! - **stream_read**: Maximum time a stream read waits for headers, data or end of stream
//! - **stream_write**: Maximum time a stream write waits for flow-control credit
//! - **ping**: Maximum time to wait for a PING acknowledgement
//! - **keepalive**: Interval between keepalive PINGs
//!
//! # Usage
//!
//! ```rust,ignore
//! use h2mux::{ConnectionBuilder, Timeouts};
//! use std::time::Duration;
//!
//! let conn = ConnectionBuilder::client()
//!     .timeouts(Timeouts::api_defaults().keepalive(Duration::from_secs(20)))
//!     .handshake(io)
//!     .await?;
//! ```

use std::time::Duration;

/// Timeout configuration for a connection.
///
/// All timeouts are optional. When `None`, no timeout is applied.
///
/// # Timeout Semantics
///
/// - **stream_read**: RESETS on each wakeup that delivers something. On expiry
///   the stream is reset with CANCEL.
/// - **stream_write**: RESETS each time a frame is emitted. On expiry the
///   stream is reset with CANCEL.
/// - **ping**: Does NOT reset. An unanswered PING force-closes the connection.
/// - **keepalive**: A keepalive PING still unanswered at the next tick also
///   force-closes the connection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Timeouts {
    /// Stream read timeout.
    ///
    /// Default: 30s for api_defaults(), 120s for streaming_defaults()
    pub stream_read: Option<Duration>,

    /// Stream write timeout (waiting on flow-control windows).
    ///
    /// Default: 30s for both presets
    pub stream_write: Option<Duration>,

    /// PING acknowledgement timeout.
    ///
    /// Default: 20s for both presets
    pub ping: Option<Duration>,

    /// Keepalive PING interval. Disabled unless set.
    pub keepalive: Option<Duration>,
}

impl Timeouts {
    /// Create a new Timeouts with all timeouts set to None.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sensible defaults for request/response traffic.
    ///
    /// - stream_read: 30s
    /// - stream_write: 30s
    /// - ping: 20s
    /// - keepalive: None
    pub fn api_defaults() -> Self {
        Self {
            stream_read: Some(Duration::from_secs(30)),
            stream_write: Some(Duration::from_secs(30)),
            ping: Some(Duration::from_secs(20)),
            keepalive: None,
        }
    }

    /// Defaults for long-lived streams (SSE, chunked downloads, etc.).
    ///
    /// - stream_read: 120s
    /// - stream_write: 30s
    /// - ping: 20s
    /// - keepalive: 30s
    pub fn streaming_defaults() -> Self {
        Self {
            stream_read: Some(Duration::from_secs(120)),
            stream_write: Some(Duration::from_secs(30)),
            ping: Some(Duration::from_secs(20)),
            keepalive: Some(Duration::from_secs(30)),
        }
    }

    /// Set stream read timeout.
    pub fn stream_read(mut self, timeout: Duration) -> Self {
        self.stream_read = Some(timeout);
        self
    }

    /// Set stream write timeout.
    pub fn stream_write(mut self, timeout: Duration) -> Self {
        self.stream_write = Some(timeout);
        self
    }

    /// Set PING acknowledgement timeout.
    pub fn ping(mut self, timeout: Duration) -> Self {
        self.ping = Some(timeout);
        self
    }

    /// Enable keepalive PINGs at the given interval.
    pub fn keepalive(mut self, interval: Duration) -> Self {
        self.keepalive = Some(interval);
        self
    }

    /// Disable stream read timeout.
    pub fn no_stream_read_timeout(mut self) -> Self {
        self.stream_read = None;
        self
    }

    /// Disable stream write timeout.
    pub fn no_stream_write_timeout(mut self) -> Self {
        self.stream_write = None;
        self
    }

    /// Disable PING timeout.
    pub fn no_ping_timeout(mut self) -> Self {
        self.ping = None;
        self
    }

    /// Disable keepalive.
    pub fn no_keepalive(mut self) -> Self {
        self.keepalive = None;
        self
    }
}
