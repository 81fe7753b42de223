//! HPACK header compression seam.
//!
//! The connection talks to header compression only through [`HeaderEncoder`]
//! and [`HeaderDecoder`]. The default implementations delegate to
//! `loona-hpack`. Callers may plug in their own codec through the builder.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::h2::header::Header;

/// Compresses header lists into header block fragments.
///
/// Held under the connection's writer lock, so blocks are encoded in the
/// same order they reach the wire.
pub trait HeaderEncoder: Send {
    fn encode(&mut self, headers: &[Header]) -> Result<Bytes>;

    /// Apply the peer's SETTINGS_HEADER_TABLE_SIZE.
    fn set_header_table_size(&mut self, size: u32);
}

/// Decompresses complete header blocks. Owned by the connection's reader.
pub trait HeaderDecoder: Send {
    fn decode(&mut self, block: &[u8]) -> Result<Vec<Header>>;

    /// Apply our own advertised SETTINGS_HEADER_TABLE_SIZE.
    fn set_header_table_size(&mut self, size: u32);
}

/// HPACK encoder backed by `loona-hpack`.
pub struct HpackEncoder {
    encoder: loona_hpack::Encoder<'static>,
}

impl HpackEncoder {
    pub fn new() -> Self {
        Self {
            encoder: loona_hpack::Encoder::new(),
        }
    }
}

impl Default for HpackEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderEncoder for HpackEncoder {
    fn encode(&mut self, headers: &[Header]) -> Result<Bytes> {
        let fields = headers
            .iter()
            .map(|h| (h.name.as_bytes(), h.value.as_bytes()));
        Ok(Bytes::from(self.encoder.encode(fields)))
    }

    fn set_header_table_size(&mut self, size: u32) {
        self.encoder.set_max_table_size(size as usize);
    }
}

/// HPACK decoder backed by `loona-hpack`.
pub struct HpackDecoder {
    decoder: loona_hpack::Decoder<'static>,
}

impl HpackDecoder {
    pub fn new() -> Self {
        Self {
            decoder: loona_hpack::Decoder::new(),
        }
    }
}

impl Default for HpackDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderDecoder for HpackDecoder {
    fn decode(&mut self, block: &[u8]) -> Result<Vec<Header>> {
        let fields = self
            .decoder
            .decode(block)
            .map_err(|e| Error::compression(format!("HPACK decode failed: {:?}", e)))?;

        fields
            .into_iter()
            .map(|(name, value)| {
                let name = String::from_utf8(name)
                    .map_err(|_| Error::compression("header name is not valid UTF-8"))?;
                let value = String::from_utf8_lossy(&value).into_owned();
                Ok(Header::new(name, value))
            })
            .collect()
    }

    fn set_header_table_size(&mut self, size: u32) {
        self.decoder.set_max_allowed_table_size(size as usize);
    }
}
