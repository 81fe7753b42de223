//! HTTP/2 frame types and binary serialization.
//!
//! Implements the RFC 9113 frame format. Each frame type has a struct with
//! `serialize` (header + payload) and `parse` (payload only, header already
//! consumed). Size and stream-scope rules that make a frame malformed are
//! enforced here and reported as connection-level [`Error::Protocol`].

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::h2::header::Header;
use crate::h2::settings::Settings;

/// Frame header size (9 bytes per RFC 9113).
pub const FRAME_HEADER_SIZE: usize = 9;

/// Default maximum frame size (16KB per RFC 9113).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Largest value a peer may advertise for SETTINGS_MAX_FRAME_SIZE.
pub const MAX_MAX_FRAME_SIZE: u32 = 16_777_215;

/// Largest flow-control window (2^31 - 1).
pub const MAX_WINDOW_SIZE: u32 = 0x7fff_ffff;

/// HTTP/2 connection preface (client must send this first).
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const STREAM_ID_MASK: u32 = 0x7fff_ffff;

/// Frame type identifiers per RFC 9113.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

impl From<u8> for FrameType {
    fn from(v: u8) -> Self {
        match v {
            0x0 => Self::Data,
            0x1 => Self::Headers,
            0x2 => Self::Priority,
            0x3 => Self::RstStream,
            0x4 => Self::Settings,
            0x5 => Self::PushPromise,
            0x6 => Self::Ping,
            0x7 => Self::GoAway,
            0x8 => Self::WindowUpdate,
            0x9 => Self::Continuation,
            other => Self::Unknown(other),
        }
    }
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        match ft {
            FrameType::Data => 0x0,
            FrameType::Headers => 0x1,
            FrameType::Priority => 0x2,
            FrameType::RstStream => 0x3,
            FrameType::Settings => 0x4,
            FrameType::PushPromise => 0x5,
            FrameType::Ping => 0x6,
            FrameType::GoAway => 0x7,
            FrameType::WindowUpdate => 0x8,
            FrameType::Continuation => 0x9,
            FrameType::Unknown(v) => v,
        }
    }
}

impl FrameType {
    /// Frames that only exist on stream 0.
    pub fn is_connection_scoped(self) -> bool {
        matches!(self, Self::Settings | Self::Ping | Self::GoAway)
    }

    /// Frames that must carry a nonzero stream id.
    pub fn is_stream_scoped(self) -> bool {
        matches!(
            self,
            Self::Data
                | Self::Headers
                | Self::Priority
                | Self::RstStream
                | Self::PushPromise
                | Self::Continuation
        )
    }
}

/// Frame flags.
pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1; // Same value, different context (SETTINGS/PING)
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

/// HTTP/2 error codes per RFC 9113 Section 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    /// Map a wire value to a code. Unknown codes are treated as PROTOCOL_ERROR.
    pub fn from_u32(raw: u32) -> Self {
        match raw {
            0x0 => Self::NoError,
            0x1 => Self::ProtocolError,
            0x2 => Self::InternalError,
            0x3 => Self::FlowControlError,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSizeError,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::CompressionError,
            0xa => Self::ConnectError,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            _ => Self::ProtocolError,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Parsed frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: FrameType,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    /// Parse a frame header from bytes.
    ///
    /// Returns None if fewer than 9 bytes are available. The reserved bit of
    /// the stream id is ignored.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return None;
        }

        let length = ((buf[0] as u32) << 16) | ((buf[1] as u32) << 8) | (buf[2] as u32);
        let frame_type = FrameType::from(buf[3]);
        let flags = buf[4];
        let stream_id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & STREAM_ID_MASK;

        Some(Self {
            length,
            frame_type,
            flags,
            stream_id,
        })
    }

    /// Serialize frame header to bytes.
    pub fn serialize(&self, buf: &mut BytesMut) {
        // Length (24 bits)
        buf.put_u8((self.length >> 16) as u8);
        buf.put_u8((self.length >> 8) as u8);
        buf.put_u8(self.length as u8);
        buf.put_u8(self.frame_type.into());
        buf.put_u8(self.flags);
        // Stream ID (31 bits, high bit reserved and must be 0)
        buf.put_u32(self.stream_id & STREAM_ID_MASK);
    }

    /// Check that a frame we are about to write is well formed.
    pub fn check_outbound(&self, max_frame_size: u32) -> Result<()> {
        if self.stream_id & !STREAM_ID_MASK != 0 {
            return Err(Error::protocol(
                ErrorCode::ProtocolError,
                format!("reserved bit set in stream id {:#x}", self.stream_id),
            ));
        }
        if self.length > max_frame_size {
            return Err(Error::protocol(
                ErrorCode::FrameSizeError,
                format!(
                    "frame length {} exceeds MAX_FRAME_SIZE {}",
                    self.length, max_frame_size
                ),
            ));
        }
        Ok(())
    }

    /// Validate that the frame is on the right kind of stream id.
    pub fn check_scope(&self) -> Result<()> {
        if self.frame_type.is_connection_scoped() && self.stream_id != 0 {
            return Err(Error::protocol(
                ErrorCode::ProtocolError,
                format!(
                    "{:?} frame must be on stream 0, got {}",
                    self.frame_type, self.stream_id
                ),
            ));
        }
        if self.frame_type.is_stream_scoped() && self.stream_id == 0 {
            return Err(Error::protocol(
                ErrorCode::ProtocolError,
                format!("{:?} frame must have a nonzero stream id", self.frame_type),
            ));
        }
        Ok(())
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

fn frame_size_error(what: &str, len: usize) -> Error {
    Error::protocol(
        ErrorCode::FrameSizeError,
        format!("{} payload has invalid length {}", what, len),
    )
}

/// Strip the PADDED prefix/suffix from a payload.
fn strip_padding(what: &str, flags: u8, mut payload: Bytes) -> Result<(Bytes, u8)> {
    if flags & flags::PADDED == 0 {
        return Ok((payload, 0));
    }
    if payload.remaining() < 1 {
        return Err(Error::protocol(
            ErrorCode::ProtocolError,
            format!("PADDED {} frame missing padding length", what),
        ));
    }
    let pad_len = payload.get_u8();
    if pad_len as usize > payload.remaining() {
        return Err(Error::protocol(
            ErrorCode::ProtocolError,
            format!("{} padding length exceeds payload size", what),
        ));
    }
    payload.truncate(payload.remaining() - pad_len as usize);
    Ok((payload, pad_len))
}

/// SETTINGS frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SettingsFrame {
    pub settings: Settings,
    pub ack: bool,
}

impl SettingsFrame {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            ack: false,
        }
    }

    /// Create a SETTINGS ACK frame.
    pub fn ack() -> Self {
        Self {
            settings: Settings::new(),
            ack: true,
        }
    }

    /// Serialize to bytes (including frame header).
    pub fn serialize(&self) -> BytesMut {
        let payload_len = if self.ack { 0 } else { self.settings.len() * 6 };
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);

        let header = FrameHeader {
            length: payload_len as u32,
            frame_type: FrameType::Settings,
            flags: if self.ack { flags::ACK } else { 0 },
            stream_id: 0,
        };
        header.serialize(&mut buf);

        if !self.ack {
            for (id, value) in self.settings.iter() {
                buf.put_u16(id.into());
                buf.put_u32(value);
            }
        }

        buf
    }

    /// Parse a SETTINGS payload. Unknown identifiers are ignored.
    pub fn parse(flags: u8, mut payload: Bytes) -> Result<Self> {
        let ack = flags & flags::ACK != 0;
        if ack {
            if !payload.is_empty() {
                return Err(frame_size_error("SETTINGS ACK", payload.len()));
            }
            return Ok(Self::ack());
        }
        if payload.len() % 6 != 0 {
            return Err(frame_size_error("SETTINGS", payload.len()));
        }

        let mut settings = Settings::new();
        while payload.remaining() >= 6 {
            let id = payload.get_u16();
            let value = payload.get_u32();
            settings.set_raw(id, value);
        }

        Ok(Self { settings, ack })
    }
}

/// WINDOW_UPDATE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowUpdateFrame {
    pub stream_id: u32,
    pub increment: u32,
}

impl WindowUpdateFrame {
    pub fn new(stream_id: u32, increment: u32) -> Self {
        Self {
            stream_id,
            increment,
        }
    }

    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);

        let header = FrameHeader {
            length: 4,
            frame_type: FrameType::WindowUpdate,
            flags: 0,
            stream_id: self.stream_id,
        };
        header.serialize(&mut buf);
        buf.put_u32(self.increment & MAX_WINDOW_SIZE);

        buf
    }

    /// Parse from payload.
    ///
    /// A zero increment is returned as-is: whether it is a stream or a
    /// connection error depends on the stream id, which the dispatcher decides.
    pub fn parse(stream_id: u32, mut payload: Bytes) -> Result<Self> {
        if payload.len() != 4 {
            return Err(frame_size_error("WINDOW_UPDATE", payload.len()));
        }
        let increment = payload.get_u32() & MAX_WINDOW_SIZE;
        Ok(Self {
            stream_id,
            increment,
        })
    }
}

/// Priority data (optional in HEADERS frame, mandatory in PRIORITY).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityData {
    pub exclusive: bool,
    pub stream_dependency: u32,
    pub weight: u8,
}

impl PriorityData {
    fn parse(payload: &mut Bytes) -> Self {
        let dep_raw = payload.get_u32();
        Self {
            exclusive: dep_raw & 0x8000_0000 != 0,
            stream_dependency: dep_raw & STREAM_ID_MASK,
            weight: payload.get_u8(),
        }
    }

    fn put(&self, buf: &mut BytesMut) {
        let dep = if self.exclusive {
            self.stream_dependency | 0x8000_0000
        } else {
            self.stream_dependency
        };
        buf.put_u32(dep);
        buf.put_u8(self.weight);
    }
}

/// HEADERS frame carrying one header block fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadersFrame {
    pub stream_id: u32,
    pub header_block: Bytes,
    pub end_stream: bool,
    pub end_headers: bool,
    pub priority: Option<PriorityData>,
}

impl HeadersFrame {
    pub fn new(stream_id: u32, header_block: Bytes) -> Self {
        Self {
            stream_id,
            header_block,
            end_stream: false,
            end_headers: true,
            priority: None,
        }
    }

    pub fn end_stream(mut self, end: bool) -> Self {
        self.end_stream = end;
        self
    }

    pub fn end_headers(mut self, end: bool) -> Self {
        self.end_headers = end;
        self
    }

    pub fn with_priority(mut self, priority: PriorityData) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Serialize to bytes (including frame header). Padding is never emitted.
    pub fn serialize(&self) -> BytesMut {
        let priority_len = if self.priority.is_some() { 5 } else { 0 };
        let payload_len = priority_len + self.header_block.len();
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);

        let mut frame_flags = 0u8;
        if self.end_stream {
            frame_flags |= flags::END_STREAM;
        }
        if self.end_headers {
            frame_flags |= flags::END_HEADERS;
        }
        if self.priority.is_some() {
            frame_flags |= flags::PRIORITY;
        }

        let header = FrameHeader {
            length: payload_len as u32,
            frame_type: FrameType::Headers,
            flags: frame_flags,
            stream_id: self.stream_id,
        };
        header.serialize(&mut buf);

        if let Some(priority) = &self.priority {
            priority.put(&mut buf);
        }
        buf.extend_from_slice(&self.header_block);

        buf
    }

    /// Parse a HEADERS payload (padding and priority handled).
    pub fn parse(stream_id: u32, flags: u8, payload: Bytes) -> Result<Self> {
        let (mut payload, _) = strip_padding("HEADERS", flags, payload)?;

        let priority = if flags & flags::PRIORITY != 0 {
            if payload.remaining() < 5 {
                return Err(Error::protocol(
                    ErrorCode::FrameSizeError,
                    "HEADERS frame with PRIORITY flag missing priority data",
                ));
            }
            Some(PriorityData::parse(&mut payload))
        } else {
            None
        };

        Ok(Self {
            stream_id,
            header_block: payload,
            end_stream: flags & flags::END_STREAM != 0,
            end_headers: flags & flags::END_HEADERS != 0,
            priority,
        })
    }
}

/// CONTINUATION frame (RFC 9113 Section 6.10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationFrame {
    pub stream_id: u32,
    pub header_fragment: Bytes,
    pub end_headers: bool,
}

impl ContinuationFrame {
    pub fn new(stream_id: u32, header_fragment: Bytes, end_headers: bool) -> Self {
        Self {
            stream_id,
            header_fragment,
            end_headers,
        }
    }

    pub fn serialize(&self) -> BytesMut {
        let payload_len = self.header_fragment.len();
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);

        let header = FrameHeader {
            length: payload_len as u32,
            frame_type: FrameType::Continuation,
            flags: if self.end_headers { flags::END_HEADERS } else { 0 },
            stream_id: self.stream_id,
        };
        header.serialize(&mut buf);
        buf.extend_from_slice(&self.header_fragment);

        buf
    }

    pub fn parse(stream_id: u32, flags: u8, payload: Bytes) -> Self {
        Self {
            stream_id,
            header_fragment: payload,
            end_headers: flags & flags::END_HEADERS != 0,
        }
    }
}

/// DATA frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub stream_id: u32,
    pub data: Bytes,
    pub end_stream: bool,
    pub padding_len: u8,
}

impl DataFrame {
    pub fn new(stream_id: u32, data: Bytes) -> Self {
        Self {
            stream_id,
            data,
            end_stream: false,
            padding_len: 0,
        }
    }

    pub fn end_stream(mut self, end: bool) -> Self {
        self.end_stream = end;
        self
    }

    /// Set padding length (0-255 bytes).
    pub fn with_padding(mut self, padding_len: u8) -> Self {
        self.padding_len = padding_len;
        self
    }

    /// Bytes this frame counts against flow control (data + padding + pad length byte).
    pub fn flow_len(&self) -> u32 {
        if self.padding_len > 0 {
            1 + self.data.len() as u32 + self.padding_len as u32
        } else {
            self.data.len() as u32
        }
    }

    pub fn serialize(&self) -> BytesMut {
        let payload_len = self.flow_len() as usize;
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);

        let mut frame_flags = if self.end_stream { flags::END_STREAM } else { 0 };
        if self.padding_len > 0 {
            frame_flags |= flags::PADDED;
        }

        let header = FrameHeader {
            length: payload_len as u32,
            frame_type: FrameType::Data,
            flags: frame_flags,
            stream_id: self.stream_id,
        };
        header.serialize(&mut buf);

        if self.padding_len > 0 {
            buf.put_u8(self.padding_len);
        }
        buf.extend_from_slice(&self.data);
        if self.padding_len > 0 {
            buf.put_bytes(0, self.padding_len as usize);
        }

        buf
    }

    /// Parse a DATA payload (padding handled).
    pub fn parse(stream_id: u32, flags: u8, payload: Bytes) -> Result<Self> {
        let (data, padding_len) = strip_padding("DATA", flags, payload)?;
        Ok(Self {
            stream_id,
            data,
            end_stream: flags & flags::END_STREAM != 0,
            padding_len,
        })
    }
}

/// PING frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingFrame {
    pub ack: bool,
    pub data: [u8; 8],
}

impl PingFrame {
    pub fn new(data: [u8; 8]) -> Self {
        Self { ack: false, data }
    }

    pub fn ack(data: [u8; 8]) -> Self {
        Self { ack: true, data }
    }

    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 8);

        let header = FrameHeader {
            length: 8,
            frame_type: FrameType::Ping,
            flags: if self.ack { flags::ACK } else { 0 },
            stream_id: 0,
        };
        header.serialize(&mut buf);
        buf.extend_from_slice(&self.data);

        buf
    }

    pub fn parse(flags: u8, payload: &[u8]) -> Result<Self> {
        let data: [u8; 8] = payload
            .try_into()
            .map_err(|_| frame_size_error("PING", payload.len()))?;
        Ok(Self {
            ack: flags & flags::ACK != 0,
            data,
        })
    }
}

/// GOAWAY frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoAwayFrame {
    pub last_stream_id: u32,
    pub error_code: ErrorCode,
    pub debug_data: Bytes,
}

impl GoAwayFrame {
    pub fn new(last_stream_id: u32, error_code: ErrorCode) -> Self {
        Self {
            last_stream_id,
            error_code,
            debug_data: Bytes::new(),
        }
    }

    pub fn with_debug_data(mut self, debug_data: Bytes) -> Self {
        self.debug_data = debug_data;
        self
    }

    pub fn serialize(&self) -> BytesMut {
        let payload_len = 8 + self.debug_data.len();
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);

        let header = FrameHeader {
            length: payload_len as u32,
            frame_type: FrameType::GoAway,
            flags: 0,
            stream_id: 0,
        };
        header.serialize(&mut buf);
        buf.put_u32(self.last_stream_id & STREAM_ID_MASK);
        buf.put_u32(self.error_code.as_u32());
        buf.extend_from_slice(&self.debug_data);

        buf
    }

    pub fn parse(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 8 {
            return Err(frame_size_error("GOAWAY", payload.len()));
        }
        let last_stream_id = payload.get_u32() & STREAM_ID_MASK;
        let error_code = ErrorCode::from_u32(payload.get_u32());

        Ok(Self {
            last_stream_id,
            error_code,
            debug_data: payload,
        })
    }
}

/// PRIORITY frame (RFC 9113 Section 6.3). Parsed and otherwise ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityFrame {
    pub stream_id: u32,
    pub priority: PriorityData,
}

impl PriorityFrame {
    pub fn new(stream_id: u32, priority: PriorityData) -> Self {
        Self {
            stream_id,
            priority,
        }
    }

    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 5);

        let header = FrameHeader {
            length: 5,
            frame_type: FrameType::Priority,
            flags: 0,
            stream_id: self.stream_id,
        };
        header.serialize(&mut buf);
        self.priority.put(&mut buf);

        buf
    }

    pub fn parse(stream_id: u32, mut payload: Bytes) -> Result<Self> {
        if payload.len() != 5 {
            return Err(frame_size_error("PRIORITY", payload.len()));
        }
        Ok(Self {
            stream_id,
            priority: PriorityData::parse(&mut payload),
        })
    }
}

/// PUSH_PROMISE frame (RFC 9113 Section 6.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushPromiseFrame {
    pub stream_id: u32,
    pub promised_stream_id: u32,
    pub header_block: Bytes,
    pub end_headers: bool,
}

impl PushPromiseFrame {
    pub fn new(stream_id: u32, promised_stream_id: u32, header_block: Bytes) -> Self {
        Self {
            stream_id,
            promised_stream_id,
            header_block,
            end_headers: true,
        }
    }

    pub fn end_headers(mut self, end: bool) -> Self {
        self.end_headers = end;
        self
    }

    pub fn serialize(&self) -> BytesMut {
        let payload_len = 4 + self.header_block.len();
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);

        let header = FrameHeader {
            length: payload_len as u32,
            frame_type: FrameType::PushPromise,
            flags: if self.end_headers { flags::END_HEADERS } else { 0 },
            stream_id: self.stream_id,
        };
        header.serialize(&mut buf);
        buf.put_u32(self.promised_stream_id & STREAM_ID_MASK);
        buf.extend_from_slice(&self.header_block);

        buf
    }

    /// Parse from payload (with padding handling).
    pub fn parse(stream_id: u32, flags: u8, payload: Bytes) -> Result<Self> {
        let (mut payload, _) = strip_padding("PUSH_PROMISE", flags, payload)?;
        if payload.remaining() < 4 {
            return Err(Error::protocol(
                ErrorCode::FrameSizeError,
                "PUSH_PROMISE frame missing promised stream id",
            ));
        }
        let promised_stream_id = payload.get_u32() & STREAM_ID_MASK;

        Ok(Self {
            stream_id,
            promised_stream_id,
            header_block: payload,
            end_headers: flags & flags::END_HEADERS != 0,
        })
    }
}

/// RST_STREAM frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RstStreamFrame {
    pub stream_id: u32,
    pub error_code: ErrorCode,
}

impl RstStreamFrame {
    pub fn new(stream_id: u32, error_code: ErrorCode) -> Self {
        Self {
            stream_id,
            error_code,
        }
    }

    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);

        let header = FrameHeader {
            length: 4,
            frame_type: FrameType::RstStream,
            flags: 0,
            stream_id: self.stream_id,
        };
        header.serialize(&mut buf);
        buf.put_u32(self.error_code.as_u32());

        buf
    }

    pub fn parse(stream_id: u32, mut payload: Bytes) -> Result<Self> {
        if payload.len() != 4 {
            return Err(frame_size_error("RST_STREAM", payload.len()));
        }
        Ok(Self {
            stream_id,
            error_code: ErrorCode::from_u32(payload.get_u32()),
        })
    }
}

/// Split an encoded header block into a HEADERS (or PUSH_PROMISE) frame plus
/// as many CONTINUATION frames as needed to respect `max_frame_size`.
///
/// The first frame carries END_HEADERS only if the whole block fits.
pub fn encode_header_block(
    dst: &mut BytesMut,
    first: HeaderBlockStart,
    mut block: Bytes,
    max_frame_size: u32,
) -> Result<()> {
    let max = max_frame_size as usize;
    let (stream_id, prefix_len) = match &first {
        HeaderBlockStart::Headers { stream_id, .. } => (*stream_id, 0),
        HeaderBlockStart::PushPromise { stream_id, .. } => (*stream_id, 4),
    };
    let first_len = block.len().min(max.saturating_sub(prefix_len));
    let fragment = block.split_to(first_len);
    let end_headers = block.is_empty();

    let frame = match first {
        HeaderBlockStart::Headers {
            stream_id,
            end_stream,
        } => HeadersFrame::new(stream_id, fragment)
            .end_stream(end_stream)
            .end_headers(end_headers)
            .serialize(),
        HeaderBlockStart::PushPromise {
            stream_id,
            promised_stream_id,
        } => PushPromiseFrame::new(stream_id, promised_stream_id, fragment)
            .end_headers(end_headers)
            .serialize(),
    };
    check_serialized(&frame, max_frame_size)?;
    dst.extend_from_slice(&frame);

    while !block.is_empty() {
        let fragment = block.split_to(block.len().min(max));
        let frame = ContinuationFrame::new(stream_id, fragment, block.is_empty()).serialize();
        check_serialized(&frame, max_frame_size)?;
        dst.extend_from_slice(&frame);
    }
    Ok(())
}

/// What starts a header block on the wire.
#[derive(Debug, Clone, Copy)]
pub enum HeaderBlockStart {
    Headers { stream_id: u32, end_stream: bool },
    PushPromise { stream_id: u32, promised_stream_id: u32 },
}

/// Validate a serialized frame's header against the outbound limits.
pub fn check_serialized(frame: &[u8], max_frame_size: u32) -> Result<()> {
    match FrameHeader::parse(frame) {
        Some(header) => header.check_outbound(max_frame_size),
        None => Err(Error::protocol(
            ErrorCode::InternalError,
            "serialized frame shorter than a frame header",
        )),
    }
}

/// A fully decoded inbound frame, as handed to the dispatch loop.
///
/// CONTINUATION frames never appear here: the reader folds them into the
/// HEADERS or PUSH_PROMISE that started the block.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Data(DataFrame),
    Headers {
        stream_id: u32,
        end_stream: bool,
        priority: Option<PriorityData>,
        headers: Vec<Header>,
    },
    Priority(PriorityFrame),
    RstStream(RstStreamFrame),
    Settings(SettingsFrame),
    PushPromise {
        stream_id: u32,
        promised_stream_id: u32,
        headers: Vec<Header>,
    },
    Ping(PingFrame),
    GoAway(GoAwayFrame),
    WindowUpdate(WindowUpdateFrame),
    Unknown {
        frame_type: u8,
        stream_id: u32,
    },
}

impl Frame {
    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Data(f) => f.stream_id,
            Frame::Headers { stream_id, .. } | Frame::PushPromise { stream_id, .. } => *stream_id,
            Frame::Priority(f) => f.stream_id,
            Frame::RstStream(f) => f.stream_id,
            Frame::WindowUpdate(f) => f.stream_id,
            Frame::Unknown { stream_id, .. } => *stream_id,
            Frame::Settings(_) | Frame::Ping(_) | Frame::GoAway(_) => 0,
        }
    }
}
