//! # h2mux
//!
//! HTTP/2 multiplexed connection engine.
//!
//! Turns one bidirectional byte stream (any tokio `AsyncRead + AsyncWrite`,
//! typically TCP+TLS) into many concurrent request/response streams using the
//! RFC 9113 binary framing layer, with per-stream and connection-level flow
//! control, GOAWAY/RST_STREAM recovery, PING and server push.

pub mod error;
pub mod h2;
pub mod timeouts;

// Re-exports
pub use error::{Error, Initiator, Result};
pub use h2::{
    Connection, ConnectionBuilder, ErrorCode, Header, PushObserver, Role, Settings, SettingsId,
    StreamHandle,
};
pub use timeouts::Timeouts;
