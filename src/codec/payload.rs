//! Payload framing state machines.
//!
//! [`PayloadDecoder`] and [`PayloadEncoder`] frame message bodies one of
//! four ways: exact Content-Length, chunked transfer encoding
//! (RFC 7230 §4.1), read-until-close (client-side response bodies with no
//! framing headers), or no body at all. Both sides stream: chunks surface
//! as soon as bytes are available, never buffering a whole body.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

use crate::protocol::{ParseError, PayloadItem, PayloadSize, SendError};

/// Longest accepted chunk-size line, extensions included.
const MAX_CHUNK_SIZE_LINE: usize = 1024;

/// Streaming decoder for message payloads.
#[derive(Debug)]
pub struct PayloadDecoder {
    kind: DecodeKind,
}

#[derive(Debug)]
enum DecodeKind {
    /// Exactly this many bytes remain.
    Length(u64),
    /// Chunked transfer encoding.
    Chunked(ChunkedDecoder),
    /// Everything until the peer closes the connection.
    UntilClose,
    /// No payload.
    None,
}

impl PayloadDecoder {
    pub fn empty() -> Self {
        Self { kind: DecodeKind::None }
    }

    pub fn chunked() -> Self {
        Self { kind: DecodeKind::Chunked(ChunkedDecoder::new()) }
    }

    pub fn fix_length(size: u64) -> Self {
        Self { kind: DecodeKind::Length(size) }
    }

    pub fn until_close() -> Self {
        Self { kind: DecodeKind::UntilClose }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.kind, DecodeKind::None)
    }

    /// One decode step at end-of-stream. Until-close payloads finish
    /// cleanly here; the delimited kinds must already be complete.
    pub fn decode_at_eof(&mut self, src: &mut BytesMut) -> Result<Option<PayloadItem>, ParseError> {
        match &mut self.kind {
            DecodeKind::None => Ok(Some(PayloadItem::Eof)),
            DecodeKind::UntilClose => {
                if src.is_empty() {
                    Ok(Some(PayloadItem::Eof))
                } else {
                    Ok(Some(PayloadItem::Chunk(src.split().freeze())))
                }
            }
            DecodeKind::Length(remaining) => {
                if *remaining == 0 {
                    Ok(Some(PayloadItem::Eof))
                } else if src.is_empty() {
                    Err(ParseError::invalid_body("connection closed before declared content-length"))
                } else {
                    self.decode(src)
                }
            }
            DecodeKind::Chunked(chunked) => match chunked.decode(src)? {
                Some(item) => Ok(Some(item)),
                None => Err(ParseError::invalid_body("connection closed inside chunked body")),
            },
        }
    }
}

impl From<PayloadSize> for PayloadDecoder {
    fn from(size: PayloadSize) -> Self {
        match size {
            PayloadSize::Length(n) => Self::fix_length(n),
            PayloadSize::Chunked => Self::chunked(),
            PayloadSize::Unbounded => Self::until_close(),
            PayloadSize::Empty => Self::empty(),
        }
    }
}

impl Decoder for PayloadDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match &mut self.kind {
            DecodeKind::None => Ok(Some(PayloadItem::Eof)),

            DecodeKind::Length(remaining) => {
                if *remaining == 0 {
                    return Ok(Some(PayloadItem::Eof));
                }
                if src.is_empty() {
                    return Ok(None);
                }
                let take = (*remaining).min(src.len() as u64) as usize;
                let bytes = src.split_to(take).freeze();
                *remaining -= bytes.len() as u64;
                Ok(Some(PayloadItem::Chunk(bytes)))
            }

            DecodeKind::Chunked(chunked) => chunked.decode(src),

            DecodeKind::UntilClose => {
                if src.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(PayloadItem::Chunk(src.split().freeze())))
                }
            }
        }
    }
}

/// State machine for chunked transfer decoding.
///
/// Size lines are parsed whole (terminated by CRLF, extensions after `;`
/// ignored); chunk data streams out in whatever pieces arrive.
#[derive(Debug)]
struct ChunkedDecoder {
    state: ChunkedState,
    remaining: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkedState {
    /// Awaiting a `<hex-size>[;ext]\r\n` line.
    SizeLine,
    /// Reading chunk data.
    Data,
    /// Awaiting the CRLF that terminates chunk data.
    DataCrlf,
    /// Awaiting trailer lines after the zero-size chunk.
    Trailers,
    /// Final chunk and trailers consumed.
    Done,
}

impl ChunkedDecoder {
    fn new() -> Self {
        Self { state: ChunkedState::SizeLine, remaining: 0 }
    }

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<PayloadItem>, ParseError> {
        loop {
            match self.state {
                ChunkedState::SizeLine => {
                    let Some(line) = take_line(src, MAX_CHUNK_SIZE_LINE)? else {
                        return Ok(None);
                    };
                    let size = parse_chunk_size(&line)?;
                    if size == 0 {
                        self.state = ChunkedState::Trailers;
                    } else {
                        self.remaining = size;
                        self.state = ChunkedState::Data;
                    }
                }

                ChunkedState::Data => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let take = self.remaining.min(src.len() as u64) as usize;
                    let bytes = src.split_to(take).freeze();
                    self.remaining -= bytes.len() as u64;
                    if self.remaining == 0 {
                        self.state = ChunkedState::DataCrlf;
                    }
                    trace!(len = bytes.len(), "read chunked bytes");
                    return Ok(Some(PayloadItem::Chunk(bytes)));
                }

                ChunkedState::DataCrlf => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    if &src[..2] != b"\r\n" {
                        return Err(ParseError::invalid_body("chunk data not terminated by CRLF"));
                    }
                    src.advance(2);
                    self.state = ChunkedState::SizeLine;
                }

                ChunkedState::Trailers => {
                    let Some(line) = take_line(src, MAX_CHUNK_SIZE_LINE)? else {
                        return Ok(None);
                    };
                    // trailer fields are read and ignored
                    if line.is_empty() {
                        self.state = ChunkedState::Done;
                    }
                }

                ChunkedState::Done => return Ok(Some(PayloadItem::Eof)),
            }
        }
    }
}

/// Splits one CRLF-terminated line off the buffer, excluding the CRLF.
/// Returns `None` when the line is still incomplete.
fn take_line(src: &mut BytesMut, max: usize) -> Result<Option<Bytes>, ParseError> {
    match src.iter().position(|&b| b == b'\n') {
        Some(pos) => {
            if pos == 0 || src[pos - 1] != b'\r' {
                return Err(ParseError::invalid_body("line terminated by bare LF"));
            }
            let line = src.split_to(pos + 1);
            Ok(Some(line.freeze().slice(..pos - 1)))
        }
        None => {
            if src.len() > max {
                return Err(ParseError::invalid_body("chunk size line too long"));
            }
            Ok(None)
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    let size_part = match line.iter().position(|&b| b == b';') {
        Some(pos) => &line[..pos],
        None => line,
    };
    let text = std::str::from_utf8(size_part)
        .map_err(|_| ParseError::invalid_body("chunk size is not ascii"))?
        .trim_matches([' ', '\t']);
    if text.is_empty() {
        return Err(ParseError::invalid_body("empty chunk size"));
    }
    u64::from_str_radix(text, 16)
        .map_err(|_| ParseError::invalid_body("invalid chunk size"))
}

/// Streaming encoder for message payloads.
#[derive(Debug)]
pub struct PayloadEncoder {
    kind: EncodeKind,
}

#[derive(Debug)]
enum EncodeKind {
    Length { remaining: u64, eof: bool },
    Chunked { eof: bool },
    None,
}

impl PayloadEncoder {
    pub fn empty() -> Self {
        Self { kind: EncodeKind::None }
    }

    pub fn chunked() -> Self {
        Self { kind: EncodeKind::Chunked { eof: false } }
    }

    pub fn fix_length(size: u64) -> Self {
        Self { kind: EncodeKind::Length { remaining: size, eof: size == 0 } }
    }

    /// True once the payload is fully framed and the encoder can be retired.
    pub fn is_finish(&self) -> bool {
        match &self.kind {
            EncodeKind::Length { remaining, eof } => *remaining == 0 && *eof,
            EncodeKind::Chunked { eof } => *eof,
            EncodeKind::None => true,
        }
    }
}

impl From<PayloadSize> for PayloadEncoder {
    fn from(size: PayloadSize) -> Self {
        match size {
            PayloadSize::Length(n) => Self::fix_length(n),
            PayloadSize::Chunked => Self::chunked(),
            PayloadSize::Empty => Self::empty(),
            // bodies are never written without delimitation
            PayloadSize::Unbounded => unreachable!("unbounded payloads cannot be encoded"),
        }
    }
}

impl Encoder<PayloadItem> for PayloadEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match &mut self.kind {
            EncodeKind::Length { remaining, eof } => match item {
                PayloadItem::Chunk(bytes) => {
                    if bytes.is_empty() {
                        return Ok(());
                    }
                    if bytes.len() as u64 > *remaining {
                        return Err(SendError::invalid_body("body exceeds declared content-length"));
                    }
                    *remaining -= bytes.len() as u64;
                    dst.extend_from_slice(&bytes);
                    Ok(())
                }
                PayloadItem::Eof => {
                    if *remaining > 0 {
                        return Err(SendError::invalid_body("body shorter than declared content-length"));
                    }
                    *eof = true;
                    Ok(())
                }
            },

            EncodeKind::Chunked { eof } => match item {
                PayloadItem::Chunk(bytes) => {
                    // an empty chunk would read as the terminator
                    if bytes.is_empty() {
                        return Ok(());
                    }
                    let size_line = format!("{:X}\r\n", bytes.len());
                    dst.reserve(size_line.len() + bytes.len() + 2);
                    dst.extend_from_slice(size_line.as_bytes());
                    dst.extend_from_slice(&bytes);
                    dst.extend_from_slice(b"\r\n");
                    Ok(())
                }
                PayloadItem::Eof => {
                    *eof = true;
                    dst.extend_from_slice(b"0\r\n\r\n");
                    Ok(())
                }
            },

            EncodeKind::None => match item {
                PayloadItem::Chunk(bytes) if !bytes.is_empty() => {
                    Err(SendError::invalid_body("payload chunk on a bodiless message"))
                }
                _ => {
                    warn!("ignoring empty payload frame on a bodiless message");
                    Ok(())
                }
            },
        }
    }
}
