#![allow(dead_code)]

use bytes::Bytes;
use h2mux::h2::{HeaderDecoder, HeaderEncoder, HpackDecoder, HpackEncoder};
use h2mux::{ConnectionBuilder, Connection, Header};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

pub const DATA: u8 = 0x0;
pub const HEADERS: u8 = 0x1;
pub const RST_STREAM: u8 = 0x3;
pub const SETTINGS: u8 = 0x4;
pub const PUSH_PROMISE: u8 = 0x5;
pub const PING: u8 = 0x6;
pub const GOAWAY: u8 = 0x7;
pub const WINDOW_UPDATE: u8 = 0x8;
pub const CONTINUATION: u8 = 0x9;

pub const END_STREAM: u8 = 0x1;
pub const ACK: u8 = 0x1;
pub const END_HEADERS: u8 = 0x4;

/// One frame as read off the wire.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl RawFrame {
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// 32-bit big-endian value at `offset` of the payload.
    pub fn u32_at(&self, offset: usize) -> u32 {
        u32::from_be_bytes([
            self.payload[offset],
            self.payload[offset + 1],
            self.payload[offset + 2],
            self.payload[offset + 3],
        ]) & 0x7fff_ffff
    }

    /// Error code of a RST_STREAM frame.
    pub fn error_code(&self) -> u32 {
        u32::from_be_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ])
    }
}

/// Scripted HTTP/2 peer on the far side of an in-memory duplex pipe.
///
/// Frames are written byte-exact so tests control every flag; header blocks
/// go through a real HPACK codec.
pub struct MockPeer {
    reader: Mutex<ReadHalf<DuplexStream>>,
    writer: Mutex<WriteHalf<DuplexStream>>,
    encoder: Mutex<HpackEncoder>,
    decoder: Mutex<HpackDecoder>,
}

impl MockPeer {
    /// Create a pipe. The first half is handed to the engine.
    pub fn pair() -> (DuplexStream, MockPeer) {
        let (engine, peer) = tokio::io::duplex(1024 * 1024);
        let (reader, writer) = tokio::io::split(peer);
        let peer = MockPeer {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            encoder: Mutex::new(HpackEncoder::new()),
            decoder: Mutex::new(HpackDecoder::new()),
        };
        (engine, peer)
    }

    /// Read and check the 24-byte client preface.
    pub async fn read_preface(&self) -> std::io::Result<()> {
        let mut reader = self.reader.lock().await;
        let mut preface = [0u8; 24];
        reader.read_exact(&mut preface).await?;
        if preface.as_slice() != b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n" {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "invalid HTTP/2 preface",
            ));
        }
        Ok(())
    }

    /// Read the next complete frame.
    pub async fn read_frame(&self) -> std::io::Result<RawFrame> {
        let mut reader = self.reader.lock().await;
        let mut header = [0u8; 9];
        reader.read_exact(&mut header).await?;

        let length = u32::from_be_bytes([0, header[0], header[1], header[2]]);
        let stream_id = u32::from_be_bytes([header[5] & 0x7f, header[6], header[7], header[8]]);
        let mut payload = vec![0u8; length as usize];
        reader.read_exact(&mut payload).await?;

        Ok(RawFrame {
            frame_type: header[3],
            flags: header[4],
            stream_id,
            payload: Bytes::from(payload),
        })
    }

    /// Read frames until one of `frame_type` arrives, skipping the rest.
    pub async fn expect_frame(&self, frame_type: u8) -> RawFrame {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.read_frame())
                .await
                .expect("timed out waiting for frame")
                .expect("read frame");
            if frame.frame_type == frame_type {
                return frame;
            }
            tracing::debug!("mock peer skipping frame type {}", frame.frame_type);
        }
    }

    /// Read frames for `wait`, returning everything that arrived.
    pub async fn drain_for(&self, wait: Duration) -> Vec<RawFrame> {
        let mut frames = Vec::new();
        let deadline = tokio::time::Instant::now() + wait;
        while let Ok(Ok(frame)) = tokio::time::timeout_at(deadline, self.read_frame()).await {
            frames.push(frame);
        }
        frames
    }

    /// Read a HEADERS frame plus any CONTINUATIONs and decode the block.
    ///
    /// Returns (stream id, headers, END_STREAM).
    pub async fn read_headers(&self) -> (u32, Vec<Header>, bool) {
        let first = self.expect_frame(HEADERS).await;
        let mut block = first.payload.to_vec();
        let mut end_headers = first.has_flag(END_HEADERS);
        while !end_headers {
            let next = self.read_frame().await.expect("read CONTINUATION");
            assert_eq!(next.frame_type, CONTINUATION);
            assert_eq!(next.stream_id, first.stream_id);
            block.extend_from_slice(&next.payload);
            end_headers = next.has_flag(END_HEADERS);
        }
        let headers = self
            .decoder
            .lock()
            .await
            .decode(&block)
            .expect("decode header block");
        (first.stream_id, headers, first.has_flag(END_STREAM))
    }

    /// Read a PUSH_PROMISE (END_HEADERS set) and decode its block.
    ///
    /// Returns (associated stream id, promised stream id, request headers).
    pub async fn read_push_promise(&self) -> (u32, u32, Vec<Header>) {
        let frame = self.expect_frame(PUSH_PROMISE).await;
        assert!(frame.has_flag(END_HEADERS));
        let promised = frame.u32_at(0);
        let headers = self
            .decoder
            .lock()
            .await
            .decode(&frame.payload[4..])
            .expect("decode push promise block");
        (frame.stream_id, promised, headers)
    }

    /// Send a raw frame.
    pub async fn send_frame(
        &self,
        frame_type: u8,
        flags: u8,
        stream_id: u32,
        payload: &[u8],
    ) -> std::io::Result<()> {
        let length = payload.len() as u32;
        let mut frame = Vec::with_capacity(9 + payload.len());
        frame.extend_from_slice(&length.to_be_bytes()[1..]);
        frame.push(frame_type);
        frame.push(flags);
        frame.extend_from_slice(&(stream_id & 0x7fff_ffff).to_be_bytes());
        frame.extend_from_slice(payload);

        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await
    }

    pub async fn send_preface(&self) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n").await?;
        writer.flush().await
    }

    pub async fn send_settings(&self, settings: &[(u16, u32)]) -> std::io::Result<()> {
        let mut payload = Vec::new();
        for (id, value) in settings {
            payload.extend_from_slice(&id.to_be_bytes());
            payload.extend_from_slice(&value.to_be_bytes());
        }
        self.send_frame(SETTINGS, 0, 0, &payload).await
    }

    pub async fn send_settings_ack(&self) -> std::io::Result<()> {
        self.send_frame(SETTINGS, ACK, 0, &[]).await
    }

    pub async fn send_window_update(&self, stream_id: u32, increment: u32) -> std::io::Result<()> {
        self.send_frame(WINDOW_UPDATE, 0, stream_id, &increment.to_be_bytes())
            .await
    }

    async fn encode(&self, headers: &[Header]) -> Vec<u8> {
        self.encoder
            .lock()
            .await
            .encode(headers)
            .expect("encode header block")
            .to_vec()
    }

    /// Send a complete header block in one HEADERS frame.
    pub async fn send_headers(
        &self,
        stream_id: u32,
        headers: &[Header],
        end_stream: bool,
    ) -> std::io::Result<()> {
        let block = self.encode(headers).await;
        let mut flags = END_HEADERS;
        if end_stream {
            flags |= END_STREAM;
        }
        self.send_frame(HEADERS, flags, stream_id, &block).await
    }

    /// Send a header block split into HEADERS + CONTINUATION frames of at
    /// most `chunk` bytes.
    pub async fn send_headers_split(
        &self,
        stream_id: u32,
        headers: &[Header],
        end_stream: bool,
        chunk: usize,
    ) -> std::io::Result<()> {
        let block = self.encode(headers).await;
        let mut chunks = block.chunks(chunk).peekable();
        let first = chunks.next().unwrap_or(&[]);
        let mut flags = if end_stream { END_STREAM } else { 0 };
        if chunks.peek().is_none() {
            flags |= END_HEADERS;
        }
        self.send_frame(HEADERS, flags, stream_id, first).await?;
        while let Some(part) = chunks.next() {
            let flags = if chunks.peek().is_none() { END_HEADERS } else { 0 };
            self.send_frame(CONTINUATION, flags, stream_id, part).await?;
        }
        Ok(())
    }

    pub async fn send_data(
        &self,
        stream_id: u32,
        data: &[u8],
        end_stream: bool,
    ) -> std::io::Result<()> {
        let flags = if end_stream { END_STREAM } else { 0 };
        self.send_frame(DATA, flags, stream_id, data).await
    }

    pub async fn send_rst_stream(&self, stream_id: u32, error_code: u32) -> std::io::Result<()> {
        self.send_frame(RST_STREAM, 0, stream_id, &error_code.to_be_bytes())
            .await
    }

    pub async fn send_goaway(&self, last_stream_id: u32, error_code: u32) -> std::io::Result<()> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(last_stream_id & 0x7fff_ffff).to_be_bytes());
        payload.extend_from_slice(&error_code.to_be_bytes());
        self.send_frame(GOAWAY, 0, 0, &payload).await
    }

    pub async fn send_ping(&self, data: [u8; 8], ack: bool) -> std::io::Result<()> {
        self.send_frame(PING, if ack { ACK } else { 0 }, 0, &data)
            .await
    }

    pub async fn send_push_promise(
        &self,
        stream_id: u32,
        promised_stream_id: u32,
        headers: &[Header],
    ) -> std::io::Result<()> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(promised_stream_id & 0x7fff_ffff).to_be_bytes());
        payload.extend_from_slice(&self.encode(headers).await);
        self.send_frame(PUSH_PROMISE, END_HEADERS, stream_id, &payload)
            .await
    }

    /// Server side of the handshake against a client engine: read the
    /// preface and client SETTINGS, then send `settings` and an ACK.
    ///
    /// Returns the client's SETTINGS payload as (id, value) pairs.
    pub async fn accept_client(&self, settings: &[(u16, u32)]) -> Vec<(u16, u32)> {
        self.read_preface().await.expect("client preface");
        let frame = self.read_frame().await.expect("client SETTINGS");
        assert_eq!(frame.frame_type, SETTINGS);
        assert!(!frame.has_flag(ACK));
        self.send_settings(settings).await.expect("send SETTINGS");
        self.send_settings_ack().await.expect("send SETTINGS ACK");
        settings_pairs(&frame.payload)
    }

    /// Client side of the handshake against a server engine.
    pub async fn connect_server(&self, settings: &[(u16, u32)]) -> Vec<(u16, u32)> {
        self.send_preface().await.expect("send preface");
        self.send_settings(settings).await.expect("send SETTINGS");
        let frame = self.expect_frame(SETTINGS).await;
        assert!(!frame.has_flag(ACK));
        self.send_settings_ack().await.expect("send SETTINGS ACK");
        settings_pairs(&frame.payload)
    }
}

pub fn settings_pairs(payload: &[u8]) -> Vec<(u16, u32)> {
    payload
        .chunks_exact(6)
        .map(|c| {
            (
                u16::from_be_bytes([c[0], c[1]]),
                u32::from_be_bytes([c[2], c[3], c[4], c[5]]),
            )
        })
        .collect()
}

/// Handshake a client engine against a mock server peer.
///
/// The peer has already answered with `server_settings` and an ACK.
pub async fn client_with(
    builder: ConnectionBuilder,
    server_settings: &[(u16, u32)],
) -> (Connection, MockPeer) {
    let (io, peer) = MockPeer::pair();
    let conn = builder.handshake(io).await.expect("client handshake");
    peer.accept_client(server_settings).await;
    (conn, peer)
}

pub fn get_request(path: &str) -> Vec<Header> {
    vec![
        Header::new(":method", "GET"),
        Header::new(":scheme", "https"),
        Header::new(":authority", "example.com"),
        Header::new(":path", path),
    ]
}

pub fn post_request(path: &str) -> Vec<Header> {
    vec![
        Header::new(":method", "POST"),
        Header::new(":scheme", "https"),
        Header::new(":authority", "example.com"),
        Header::new(":path", path),
    ]
}

pub fn ok_response() -> Vec<Header> {
    vec![
        Header::new(":status", "200"),
        Header::new("content-type", "text/plain"),
    ]
}

/// Poll `condition` until it holds, failing after a few seconds.
pub async fn eventually(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
