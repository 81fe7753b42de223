//! Frame I/O over the transport halves.
//!
//! [`FrameReader`] owns the read half and the header decoder; it is used only
//! by the connection driver. [`FrameWriter`] owns the write half and the
//! header encoder and lives behind the connection's writer lock.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::h2::frame::*;
use crate::h2::header::Header;
use crate::h2::hpack::{HeaderDecoder, HeaderEncoder};

/// Type-erased read half of the transport.
pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;

/// Type-erased write half of the transport.
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Reads and decodes frames.
pub struct FrameReader<R> {
    io: R,
    read_buf: BytesMut,
    /// Our advertised SETTINGS_MAX_FRAME_SIZE.
    max_frame_size: u32,
    /// Bound on an accumulated header block.
    max_header_block: usize,
    decoder: Box<dyn HeaderDecoder>,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(
        io: R,
        decoder: Box<dyn HeaderDecoder>,
        max_frame_size: u32,
        max_header_block: usize,
    ) -> Self {
        Self {
            io,
            read_buf: BytesMut::with_capacity(DEFAULT_MAX_FRAME_SIZE as usize),
            max_frame_size,
            max_header_block,
            decoder,
        }
    }

    /// Read until `needed` bytes are buffered.
    ///
    /// Returns false on a clean EOF with nothing buffered.
    async fn fill(&mut self, needed: usize) -> Result<bool> {
        while self.read_buf.len() < needed {
            let n = self.io.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(false);
                }
                return Err(Error::protocol(
                    ErrorCode::ProtocolError,
                    format!(
                        "transport closed mid-frame ({} of {} bytes)",
                        self.read_buf.len(),
                        needed
                    ),
                ));
            }
        }
        Ok(true)
    }

    /// Read and verify the client connection preface (server role).
    pub async fn read_preface(&mut self) -> Result<()> {
        if !self.fill(CONNECTION_PREFACE.len()).await? {
            return Err(Error::connection_closed("transport closed before preface"));
        }
        let preface = self.read_buf.split_to(CONNECTION_PREFACE.len());
        if &preface[..] != CONNECTION_PREFACE {
            return Err(Error::protocol(
                ErrorCode::ProtocolError,
                "invalid connection preface",
            ));
        }
        Ok(())
    }

    /// Read one raw frame: header plus payload, with size and scope checks.
    ///
    /// Returns None on a clean EOF at a frame boundary.
    pub async fn read_raw(&mut self) -> Result<Option<(FrameHeader, Bytes)>> {
        if !self.fill(FRAME_HEADER_SIZE).await? {
            return Ok(None);
        }
        let header = FrameHeader::parse(&self.read_buf[..FRAME_HEADER_SIZE]).ok_or_else(|| {
            Error::protocol(ErrorCode::InternalError, "short frame header buffer")
        })?;

        if header.length > self.max_frame_size {
            return Err(Error::protocol(
                ErrorCode::FrameSizeError,
                format!(
                    "frame length {} exceeds MAX_FRAME_SIZE {}",
                    header.length, self.max_frame_size
                ),
            ));
        }
        header.check_scope()?;

        let frame_len = FRAME_HEADER_SIZE + header.length as usize;
        if !self.fill(frame_len).await? {
            return Err(Error::protocol(
                ErrorCode::ProtocolError,
                "transport closed mid-frame",
            ));
        }
        self.read_buf.advance(FRAME_HEADER_SIZE);
        let payload = self.read_buf.split_to(header.length as usize).freeze();

        tracing::trace!(
            "recv frame type={:?} stream={} flags={:#x} len={}",
            header.frame_type,
            header.stream_id,
            header.flags,
            header.length
        );
        Ok(Some((header, payload)))
    }

    /// Read the next logical frame.
    ///
    /// HEADERS and PUSH_PROMISE are returned with their CONTINUATIONs folded
    /// in and the block already decoded. Returns None on clean EOF.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        let Some((header, payload)) = self.read_raw().await? else {
            return Ok(None);
        };
        let stream_id = header.stream_id;

        let frame = match header.frame_type {
            FrameType::Data => Frame::Data(DataFrame::parse(stream_id, header.flags, payload)?),
            FrameType::Headers => {
                let frame = HeadersFrame::parse(stream_id, header.flags, payload)?;
                let headers = self
                    .read_header_block(stream_id, frame.header_block, frame.end_headers)
                    .await?;
                Frame::Headers {
                    stream_id,
                    end_stream: frame.end_stream,
                    priority: frame.priority,
                    headers,
                }
            }
            FrameType::Priority => Frame::Priority(PriorityFrame::parse(stream_id, payload)?),
            FrameType::RstStream => Frame::RstStream(RstStreamFrame::parse(stream_id, payload)?),
            FrameType::Settings => Frame::Settings(SettingsFrame::parse(header.flags, payload)?),
            FrameType::PushPromise => {
                let frame = PushPromiseFrame::parse(stream_id, header.flags, payload)?;
                let headers = self
                    .read_header_block(stream_id, frame.header_block, frame.end_headers)
                    .await?;
                Frame::PushPromise {
                    stream_id,
                    promised_stream_id: frame.promised_stream_id,
                    headers,
                }
            }
            FrameType::Ping => Frame::Ping(PingFrame::parse(header.flags, &payload)?),
            FrameType::GoAway => Frame::GoAway(GoAwayFrame::parse(payload)?),
            FrameType::WindowUpdate => {
                Frame::WindowUpdate(WindowUpdateFrame::parse(stream_id, payload)?)
            }
            FrameType::Continuation => {
                return Err(Error::protocol(
                    ErrorCode::ProtocolError,
                    format!("CONTINUATION on stream {} outside a header block", stream_id),
                ));
            }
            FrameType::Unknown(frame_type) => Frame::Unknown {
                frame_type,
                stream_id,
            },
        };
        Ok(Some(frame))
    }

    /// Follow CONTINUATION frames until END_HEADERS, then decode the block.
    async fn read_header_block(
        &mut self,
        stream_id: u32,
        first: Bytes,
        end_headers: bool,
    ) -> Result<Vec<Header>> {
        let block = if end_headers {
            self.check_block_size(first.len())?;
            first
        } else {
            let mut block = BytesMut::from(&first[..]);
            loop {
                self.check_block_size(block.len())?;
                let (next, fragment) = self.read_raw().await?.ok_or_else(|| {
                    Error::protocol(
                        ErrorCode::ProtocolError,
                        "transport closed inside a header block",
                    )
                })?;
                if next.frame_type != FrameType::Continuation || next.stream_id != stream_id {
                    return Err(Error::protocol(
                        ErrorCode::ProtocolError,
                        format!(
                            "expected CONTINUATION on stream {}, got {:?} on stream {}",
                            stream_id, next.frame_type, next.stream_id
                        ),
                    ));
                }
                block.extend_from_slice(&fragment);
                if next.has_flag(flags::END_HEADERS) {
                    break;
                }
            }
            self.check_block_size(block.len())?;
            block.freeze()
        };

        self.decoder.decode(&block)
    }

    fn check_block_size(&self, len: usize) -> Result<()> {
        if len > self.max_header_block {
            return Err(Error::protocol(
                ErrorCode::ProtocolError,
                format!(
                    "header block of {} bytes exceeds limit {}",
                    len, self.max_header_block
                ),
            ));
        }
        Ok(())
    }
}

/// Encodes frames into a buffer and flushes it to the transport.
///
/// Callers buffer one or more frames and then [`flush`](Self::flush) while
/// still holding the writer lock, so a header block and its CONTINUATIONs
/// are never interleaved with another writer's frames.
pub struct FrameWriter<W> {
    io: W,
    buf: BytesMut,
    encoder: Box<dyn HeaderEncoder>,
    /// Peer's SETTINGS_MAX_FRAME_SIZE, applied when we ACK their SETTINGS.
    max_frame_size: u32,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(io: W, encoder: Box<dyn HeaderEncoder>) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(DEFAULT_MAX_FRAME_SIZE as usize + FRAME_HEADER_SIZE),
            encoder,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    pub fn set_header_table_size(&mut self, size: u32) {
        self.encoder.set_header_table_size(size);
    }

    /// Raw bytes, used for the client preface.
    pub fn buffer_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Buffer an already serialized frame after checking its header.
    pub fn buffer(&mut self, frame: BytesMut) -> Result<()> {
        check_serialized(&frame, self.max_frame_size)?;
        if let Some(header) = FrameHeader::parse(&frame) {
            tracing::trace!(
                "send frame type={:?} stream={} flags={:#x} len={}",
                header.frame_type,
                header.stream_id,
                header.flags,
                header.length
            );
        }
        self.buf.extend_from_slice(&frame);
        Ok(())
    }

    /// Encode and buffer a header block as HEADERS + CONTINUATION*.
    pub fn buffer_headers(
        &mut self,
        stream_id: u32,
        headers: &[Header],
        end_stream: bool,
    ) -> Result<()> {
        let block = self.encoder.encode(headers)?;
        tracing::trace!(
            "send HEADERS stream={} fields={} block={} end_stream={}",
            stream_id,
            headers.len(),
            block.len(),
            end_stream
        );
        encode_header_block(
            &mut self.buf,
            HeaderBlockStart::Headers {
                stream_id,
                end_stream,
            },
            block,
            self.max_frame_size,
        )
    }

    /// Encode and buffer a PUSH_PROMISE + CONTINUATION*.
    pub fn buffer_push_promise(
        &mut self,
        stream_id: u32,
        promised_stream_id: u32,
        headers: &[Header],
    ) -> Result<()> {
        let block = self.encoder.encode(headers)?;
        tracing::trace!(
            "send PUSH_PROMISE stream={} promised={}",
            stream_id,
            promised_stream_id
        );
        encode_header_block(
            &mut self.buf,
            HeaderBlockStart::PushPromise {
                stream_id,
                promised_stream_id,
            },
            block,
            self.max_frame_size,
        )
    }

    /// Write everything buffered to the transport.
    pub async fn flush(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            let result = self.io.write_all(&self.buf).await;
            self.buf.clear();
            result?;
        }
        self.io.flush().await?;
        Ok(())
    }

    /// Flush and close the write direction of the transport.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.flush().await?;
        self.io.shutdown().await?;
        Ok(())
    }
}
