//! Error types for h2mux crate.

use std::io;
use std::time::Duration;

use crate::h2::ErrorCode;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Which side of the connection reset a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    /// We sent RST_STREAM (timeout, cancellation, flow-control violation).
    Local,
    /// The peer sent RST_STREAM, or refused the stream via GOAWAY.
    Remote,
}

/// Errors that can occur on an HTTP/2 connection or one of its streams.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Connection-level protocol violation. Fatal to the connection.
    #[error("{code:?}: {message}")]
    Protocol { code: ErrorCode, message: String },

    /// Stream was reset. The connection itself is still usable.
    #[error("stream {stream_id} reset ({initiator:?}): {code:?}")]
    StreamReset {
        stream_id: u32,
        code: ErrorCode,
        initiator: Initiator,
    },

    /// Operation on a stream side that has already been closed.
    #[error("stream {0} closed")]
    StreamClosed(u32),

    /// A stream read or write did not make progress in time.
    #[error("stream timed out after {0:?}")]
    Timeout(Duration),

    /// No PING acknowledgement arrived in time.
    #[error("ping timed out after {0:?}")]
    PingTimeout(Duration),

    /// Connection has been closed (locally, by the peer, or by transport failure).
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// GOAWAY was sent or received; no new streams may be created.
    #[error("connection shutdown in progress")]
    Shutdown,

    /// Header block could not be encoded or decoded.
    #[error("header compression error: {0}")]
    Compression(String),

    /// IO error on the underlying transport.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Create a connection-level protocol error with the given code.
    pub fn protocol(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Protocol {
            code,
            message: message.into(),
        }
    }

    /// Create a connection closed error.
    pub fn connection_closed(message: impl Into<String>) -> Self {
        Self::ConnectionClosed(message.into())
    }

    /// Create a header compression error.
    pub fn compression(message: impl Into<String>) -> Self {
        Self::Compression(message.into())
    }

    /// The HTTP/2 error code a peer should see for this error, if any.
    ///
    /// Transport and timeout failures map to `INTERNAL_ERROR`.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Protocol { code, .. } | Self::StreamReset { code, .. } => *code,
            Self::StreamClosed(_) => ErrorCode::StreamClosed,
            Self::Compression(_) => ErrorCode::CompressionError,
            Self::Shutdown => ErrorCode::RefusedStream,
            Self::Timeout(_) => ErrorCode::Cancel,
            Self::PingTimeout(_) | Self::ConnectionClosed(_) | Self::Io(_) => {
                ErrorCode::InternalError
            }
        }
    }

    /// Returns true for stream resets delivered by the peer.
    pub fn is_remote_reset(&self) -> bool {
        matches!(
            self,
            Self::StreamReset {
                initiator: Initiator::Remote,
                ..
            }
        )
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Self::Protocol { code, message } => Self::Protocol {
                code: *code,
                message: message.clone(),
            },
            Self::StreamReset {
                stream_id,
                code,
                initiator,
            } => Self::StreamReset {
                stream_id: *stream_id,
                code: *code,
                initiator: *initiator,
            },
            Self::StreamClosed(id) => Self::StreamClosed(*id),
            Self::Timeout(d) => Self::Timeout(*d),
            Self::PingTimeout(d) => Self::PingTimeout(*d),
            Self::ConnectionClosed(m) => Self::ConnectionClosed(m.clone()),
            Self::Shutdown => Self::Shutdown,
            Self::Compression(m) => Self::Compression(m.clone()),
            // io::Error is not Clone; keep kind and message.
            Self::Io(e) => Self::Io(io::Error::new(e.kind(), e.to_string())),
        }
    }
}
