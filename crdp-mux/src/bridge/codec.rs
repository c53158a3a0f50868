//! Framed codec for pipe transports.
//!
//! A browser started with `--remote-debugging-pipe` exchanges one JSON message per
//! frame, each terminated by a NUL byte. Uses AnyDelimiterCodec for framing and
//! hands out frames as UTF-8 strings; envelope parsing happens later in the multiplexor.

use std::io;

use tokio_util::bytes::BytesMut;
use tokio_util::codec::{AnyDelimiterCodec, Decoder, Encoder};

const DELIMITER: &[u8] = b"\0";

/// Frames above this size are logged; the protocol itself has no limit.
const LARGE_FRAME_BYTES: usize = 1024 * 1024;

/// Codec that splits a byte stream on NUL and yields each frame as text.
pub struct MessageCodec {
    inner: AnyDelimiterCodec,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            inner: AnyDelimiterCodec::new(DELIMITER.to_vec(), DELIMITER.to_vec()),
        }
    }

    fn frame_text(bytes: &[u8]) -> Result<String, io::Error> {
        String::from_utf8(bytes.to_vec()).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl Decoder for MessageCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src).map_err(into_io)? {
            Some(bytes) => Self::frame_text(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode_eof(src).map_err(into_io)? {
            Some(bytes) if bytes.is_empty() => Ok(None),
            Some(bytes) => Self::frame_text(&bytes).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<String> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.as_bytes().contains(&0) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "message contains a NUL byte",
            ));
        }
        let len = item.len();
        tracing::trace!(frame_size_bytes = len, "Encoding frame");
        if len > LARGE_FRAME_BYTES {
            tracing::info!(
                frame_size_bytes = len,
                frame_size_kb = len / 1024,
                "Large frame being encoded"
            );
        }
        self.inner.encode(item, dst).map_err(into_io)
    }
}

fn into_io(e: tokio_util::codec::AnyDelimiterCodecError) -> io::Error {
    match e {
        tokio_util::codec::AnyDelimiterCodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}
