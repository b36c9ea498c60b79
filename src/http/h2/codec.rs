//! HTTP/2 frame encoding and decoding
//!
//! Encoders produce complete wire frames. [`FrameCodec`] accumulates bytes
//! read from the connection and splits them into [`Frame`]s, so a reader
//! never blocks halfway through a frame.

use super::error::{Error, Result};
use super::frames::*;
use bytes::{BufMut, Bytes, BytesMut};

/// HTTP/2 frame header size (9 bytes)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Maximum frame payload size (16MB - 1)
pub const MAX_FRAME_SIZE: usize = 0x00FF_FFFF;

/// Incremental frame reader
pub struct FrameCodec {
    read_buffer: BytesMut,
}

impl FrameCodec {
    /// Create a new frame codec
    pub fn new() -> Self {
        FrameCodec {
            read_buffer: BytesMut::with_capacity(16 * 1024),
        }
    }

    /// Append bytes received from the peer
    pub fn feed(&mut self, data: &[u8]) {
        self.read_buffer.extend_from_slice(data);
    }

    /// Bytes received but not yet returned as a frame
    pub fn buffered(&self) -> usize {
        self.read_buffer.len()
    }

    /// Next complete frame, or `None` until more bytes arrive
    ///
    /// Frames of unknown type are discarded (RFC 7540 Section 4.1). A frame
    /// larger than `max_frame_size` is a connection error.
    pub fn next_frame(&mut self, max_frame_size: u32) -> Result<Option<Frame>> {
        loop {
            if self.read_buffer.len() < FRAME_HEADER_SIZE {
                return Ok(None);
            }
            let mut header = [0u8; FRAME_HEADER_SIZE];
            header.copy_from_slice(&self.read_buffer[..FRAME_HEADER_SIZE]);
            let (raw_type, flags, stream_id, length) = Self::decode_header(&header);

            if length > max_frame_size as usize {
                return Err(Error::FrameSize(format!(
                    "frame of {} bytes exceeds maximum {}",
                    length, max_frame_size
                )));
            }
            if self.read_buffer.len() < FRAME_HEADER_SIZE + length {
                return Ok(None);
            }

            let mut raw = self.read_buffer.split_to(FRAME_HEADER_SIZE + length);
            let payload = raw.split_off(FRAME_HEADER_SIZE).freeze();

            if let Some(frame_type) = FrameType::from_u8(raw_type) {
                return Ok(Some(Frame::new(frame_type, flags, stream_id, payload)));
            }
        }
    }

    /// Encode a frame header
    pub fn encode_header(
        frame_type: FrameType,
        flags: FrameFlags,
        stream_id: u32,
        length: usize,
    ) -> [u8; FRAME_HEADER_SIZE] {
        let mut header = [0u8; FRAME_HEADER_SIZE];

        // Length (24 bits, big-endian)
        header[0] = ((length >> 16) & 0xFF) as u8;
        header[1] = ((length >> 8) & 0xFF) as u8;
        header[2] = (length & 0xFF) as u8;

        header[3] = frame_type.as_u8();
        header[4] = flags.as_u8();

        // Stream ID (31 bits, reserved bit cleared)
        header[5..9].copy_from_slice(&(stream_id & 0x7FFF_FFFF).to_be_bytes());

        header
    }

    /// Decode a frame header into raw type, flags, stream ID and length
    pub fn decode_header(bytes: &[u8; FRAME_HEADER_SIZE]) -> (u8, FrameFlags, u32, usize) {
        let length = ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | (bytes[2] as usize);
        let flags = FrameFlags::from_u8(bytes[4]);
        let stream_id = u32::from_be_bytes([bytes[5] & 0x7F, bytes[6], bytes[7], bytes[8]]);
        (bytes[3], flags, stream_id, length)
    }

    /// Encode a DATA frame
    pub fn encode_data_frame(frame: &DataFrame) -> Bytes {
        let mut payload_len = frame.data.len();
        let mut flags = FrameFlags::empty();

        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }

        let padding_len = if let Some(pad_len) = frame.padding {
            flags.set(FrameFlags::PADDED);
            payload_len += 1 + pad_len as usize;
            pad_len
        } else {
            0
        };

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
        buf.put_slice(&Self::encode_header(FrameType::Data, flags, frame.stream_id, payload_len));
        if frame.padding.is_some() {
            buf.put_u8(padding_len);
        }
        buf.put_slice(&frame.data);
        if padding_len > 0 {
            buf.put_bytes(0, padding_len as usize);
        }

        buf.freeze()
    }

    /// Encode a single HEADERS frame
    pub fn encode_headers_frame(frame: &HeadersFrame) -> Bytes {
        let mut payload_len = frame.header_block.len();
        let mut flags = FrameFlags::empty();

        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }
        if frame.end_headers {
            flags.set(FrameFlags::END_HEADERS);
        }
        if frame.priority.is_some() {
            flags.set(FrameFlags::PRIORITY);
            payload_len += 5;
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
        buf.put_slice(&Self::encode_header(FrameType::Headers, flags, frame.stream_id, payload_len));
        if let Some(priority) = &frame.priority {
            let mut dep = priority.stream_dependency;
            if priority.exclusive {
                dep |= 0x8000_0000;
            }
            buf.put_u32(dep);
            buf.put_u8(priority.weight);
        }
        buf.put_slice(&frame.header_block);

        buf.freeze()
    }

    /// Encode a header block as HEADERS followed by CONTINUATION frames
    ///
    /// Each frame carries at most `max_frame_size` bytes of the block; only
    /// the last one has END_HEADERS set.
    pub fn encode_header_block(
        stream_id: u32,
        block: &Bytes,
        end_stream: bool,
        max_frame_size: u32,
    ) -> Bytes {
        let max = (max_frame_size as usize).max(1);
        if block.len() <= max {
            return Self::encode_headers_frame(&HeadersFrame::new(stream_id, block.clone(), end_stream, true));
        }

        let mut buf = BytesMut::with_capacity(block.len() + FRAME_HEADER_SIZE * (block.len() / max + 1));
        let mut chunks = block.chunks(max).peekable();
        let mut first = true;
        while let Some(chunk) = chunks.next() {
            let mut flags = FrameFlags::empty();
            if chunks.peek().is_none() {
                flags.set(FrameFlags::END_HEADERS);
            }
            let frame_type = if first {
                if end_stream {
                    flags.set(FrameFlags::END_STREAM);
                }
                FrameType::Headers
            } else {
                FrameType::Continuation
            };
            first = false;
            buf.put_slice(&Self::encode_header(frame_type, flags, stream_id, chunk.len()));
            buf.put_slice(chunk);
        }
        buf.freeze()
    }

    /// Encode a SETTINGS frame
    pub fn encode_settings_frame(frame: &SettingsFrame) -> Bytes {
        let (flags, payload) = if frame.ack {
            (FrameFlags::from_u8(FrameFlags::ACK), Bytes::new())
        } else {
            (FrameFlags::empty(), frame.settings.encode_payload())
        };

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        buf.put_slice(&Self::encode_header(FrameType::Settings, flags, 0, payload.len()));
        buf.put_slice(&payload);
        buf.freeze()
    }

    /// Encode a PING frame
    pub fn encode_ping_frame(frame: &PingFrame) -> Bytes {
        let flags = if frame.ack {
            FrameFlags::from_u8(FrameFlags::ACK)
        } else {
            FrameFlags::empty()
        };

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 8);
        buf.put_slice(&Self::encode_header(FrameType::Ping, flags, 0, 8));
        buf.put_slice(&frame.data);
        buf.freeze()
    }

    /// Encode a GOAWAY frame
    pub fn encode_goaway_frame(frame: &GoawayFrame) -> Bytes {
        let payload_len = 8 + frame.debug_data.len();

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
        buf.put_slice(&Self::encode_header(FrameType::Goaway, FrameFlags::empty(), 0, payload_len));
        buf.put_u32(frame.last_stream_id & 0x7FFF_FFFF);
        buf.put_u32(frame.error_code.as_u32());
        buf.put_slice(&frame.debug_data);
        buf.freeze()
    }

    /// Encode a WINDOW_UPDATE frame
    pub fn encode_window_update_frame(frame: &WindowUpdateFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);
        buf.put_slice(&Self::encode_header(
            FrameType::WindowUpdate,
            FrameFlags::empty(),
            frame.stream_id,
            4,
        ));
        buf.put_u32(frame.size_increment & 0x7FFF_FFFF);
        buf.freeze()
    }

    /// Encode a RST_STREAM frame
    pub fn encode_rst_stream_frame(frame: &RstStreamFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);
        buf.put_slice(&Self::encode_header(
            FrameType::RstStream,
            FrameFlags::empty(),
            frame.stream_id,
            4,
        ));
        buf.put_u32(frame.error_code.as_u32());
        buf.freeze()
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}
