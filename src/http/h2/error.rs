//! HTTP/2 error types
//!
//! Connection-level failures carry the RFC 7540 Section 7 error code sent in
//! GOAWAY; stream-level failures carry the code from RST_STREAM.

use std::fmt;

/// HTTP/2 errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error detected (error code 0x1)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Flow control error (error code 0x3)
    #[error("Flow control error: {0}")]
    FlowControl(String),

    /// Frame size error (error code 0x6)
    #[error("Frame size error: {0}")]
    FrameSize(String),

    /// HPACK decoding failed (error code 0x9)
    #[error("Compression error: {0}")]
    Compression(String),

    /// Invalid settings value
    #[error("Invalid settings value: {0}")]
    InvalidSettings(String),

    /// Peer reset the stream
    #[error("Stream {stream_id} reset by peer: {code}")]
    StreamReset { stream_id: u32, code: ErrorCode },

    /// Peer sent GOAWAY before this stream was processed
    #[error("Connection going away (last stream {last_stream_id}): {code}")]
    GoAway { last_stream_id: u32, code: ErrorCode },

    /// Stream was cancelled locally
    #[error("Stream cancelled: {0}")]
    Cancel(u32),

    /// Timeout waiting for the peer
    #[error("Timeout")]
    Timeout,

    /// Opening another stream would exceed the peer's limit
    #[error("Too many concurrent streams")]
    TooManyStreams,

    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Server did not start with the client preface
    #[error("Missing connection preface")]
    MissingPreface,

    /// Invalid header
    #[error("Invalid header: {0}")]
    InvalidHeader(String),
}

impl Error {
    /// Error code to send in GOAWAY for a connection error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::FlowControl(_) => ErrorCode::FlowControlError,
            Error::FrameSize(_) => ErrorCode::FrameSizeError,
            Error::Compression(_) => ErrorCode::CompressionError,
            Error::Io(_) | Error::ConnectionClosed | Error::Timeout => ErrorCode::InternalError,
            Error::StreamReset { code, .. } | Error::GoAway { code, .. } => *code,
            Error::Cancel(_) => ErrorCode::Cancel,
            Error::TooManyStreams => ErrorCode::RefusedStream,
            _ => ErrorCode::ProtocolError,
        }
    }

    /// Whether the request never reached the server's application
    ///
    /// Such requests may be sent again on another connection.
    pub fn is_unprocessed(&self) -> bool {
        match self {
            Error::GoAway { .. } => true,
            Error::StreamReset { code, .. } => *code == ErrorCode::RefusedStream,
            _ => false,
        }
    }
}

/// HTTP/2 error codes as defined in RFC 7540 Section 7
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
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
    /// Convert error code to u32
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Create error code from u32
    ///
    /// Unknown codes are treated as INTERNAL_ERROR (RFC 7540 Section 7).
    pub fn from_u32(code: u32) -> Self {
        match code {
            0x0 => ErrorCode::NoError,
            0x1 => ErrorCode::ProtocolError,
            0x3 => ErrorCode::FlowControlError,
            0x4 => ErrorCode::SettingsTimeout,
            0x5 => ErrorCode::StreamClosed,
            0x6 => ErrorCode::FrameSizeError,
            0x7 => ErrorCode::RefusedStream,
            0x8 => ErrorCode::Cancel,
            0x9 => ErrorCode::CompressionError,
            0xa => ErrorCode::ConnectError,
            0xb => ErrorCode::EnhanceYourCalm,
            0xc => ErrorCode::InadequateSecurity,
            0xd => ErrorCode::Http11Required,
            _ => ErrorCode::InternalError,
        }
    }

    /// Get error name
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u32())
    }
}

/// Result type for HTTP/2 operations
pub type Result<T> = std::result::Result<T, Error>;
