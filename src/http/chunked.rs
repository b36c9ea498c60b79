//! Chunked transfer encoding support
//!
//! This module provides encoding and decoding for HTTP chunked transfer encoding.
//! The decoder works on a growing `BytesMut` and hands out body data without
//! copying it.

use super::{Error, Result, CRLF};
use bytes::{Buf, Bytes, BytesMut};
use std::io::Write;

/// Longest accepted chunk-size line, extensions included
const MAX_SIZE_LINE: usize = 4096;

/// Terminating zero-size chunk with an empty trailer
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Chunk header for `len` bytes of data
pub fn chunk_header(len: usize) -> String {
    format!("{:x}{}", len, CRLF)
}

/// Chunked encoder
///
/// Encodes data in HTTP chunked transfer encoding format
pub struct ChunkedEncoder<W: Write> {
    writer: W,
}

impl<W: Write> ChunkedEncoder<W> {
    /// Create a new chunked encoder
    pub fn new(writer: W) -> Self {
        ChunkedEncoder { writer }
    }

    /// Write a chunk of data
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        // An empty chunk would terminate the body
        if data.is_empty() {
            return Ok(());
        }

        self.writer.write_all(chunk_header(data.len()).as_bytes())?;
        self.writer.write_all(data)?;
        self.writer.write_all(CRLF.as_bytes())?;

        Ok(())
    }

    /// Write the final chunk (0-sized chunk)
    pub fn finish(&mut self) -> Result<()> {
        self.writer.write_all(LAST_CHUNK)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Consume the encoder and return the underlying writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Result of one decoding step
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// Body bytes
    Data(Bytes),
    /// The buffer holds no complete unit; read more
    NeedMore,
    /// Last chunk and trailer consumed
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DecoderState {
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkEnd,
    Trailer,
    Complete,
}

/// Chunked decoder
///
/// Decodes HTTP chunked transfer encoding format
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: DecoderState,
}

impl ChunkedDecoder {
    /// Create a new chunked decoder
    pub fn new() -> Self {
        ChunkedDecoder {
            state: DecoderState::ChunkSize,
        }
    }

    /// Decode the next unit from `buf`, consuming what was used
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Decoded> {
        loop {
            match self.state {
                DecoderState::ChunkSize => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(Decoded::NeedMore);
                    };
                    let size = parse_chunk_size(&line)?;
                    self.state = if size == 0 {
                        DecoderState::Trailer
                    } else {
                        DecoderState::ChunkData { remaining: size }
                    };
                }

                DecoderState::ChunkData { remaining } => {
                    if buf.is_empty() {
                        return Ok(Decoded::NeedMore);
                    }
                    let take = remaining.min(buf.len() as u64) as usize;
                    let data = buf.split_to(take).freeze();
                    let left = remaining - take as u64;
                    self.state = if left == 0 {
                        DecoderState::ChunkEnd
                    } else {
                        DecoderState::ChunkData { remaining: left }
                    };
                    return Ok(Decoded::Data(data));
                }

                DecoderState::ChunkEnd => {
                    if buf.len() < 2 {
                        return Ok(Decoded::NeedMore);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(Error::Protocol("Expected CRLF after chunk".to_string()));
                    }
                    buf.advance(2);
                    self.state = DecoderState::ChunkSize;
                }

                DecoderState::Trailer => {
                    // Trailer fields are skipped until the empty line
                    let Some(line) = take_line(buf)? else {
                        return Ok(Decoded::NeedMore);
                    };
                    if line.is_empty() {
                        self.state = DecoderState::Complete;
                        return Ok(Decoded::Done);
                    }
                }

                DecoderState::Complete => return Ok(Decoded::Done),
            }
        }
    }

    /// Check if decoding is complete
    pub fn is_complete(&self) -> bool {
        self.state == DecoderState::Complete
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Split off one CRLF-terminated line
fn take_line(buf: &mut BytesMut) -> Result<Option<Bytes>> {
    match buf.windows(2).position(|w| w == b"\r\n") {
        Some(pos) => {
            let line = buf.split_to(pos).freeze();
            buf.advance(2);
            Ok(Some(line))
        }
        None if buf.len() > MAX_SIZE_LINE => {
            Err(Error::InvalidChunkSize("chunk size line too long".to_string()))
        }
        None => Ok(None),
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    let line = String::from_utf8_lossy(line);
    let size_str = line.split(';').next().unwrap_or_default().trim();
    if size_str.is_empty() || size_str.len() > 16 {
        return Err(Error::InvalidChunkSize(size_str.to_string()));
    }
    u64::from_str_radix(size_str, 16).map_err(|_| Error::InvalidChunkSize(size_str.to_string()))
}

/// Decode complete chunked body from bytes
pub fn decode_chunked_body(input: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ChunkedDecoder::new();
    let mut buf = BytesMut::from(input);
    let mut output = Vec::new();

    loop {
        match decoder.decode(&mut buf)? {
            Decoded::Data(data) => output.extend_from_slice(&data),
            Decoded::NeedMore => return Err(Error::Incomplete),
            Decoded::Done => return Ok(output),
        }
    }
}
