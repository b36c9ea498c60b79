//! HTTP/2 protocol implementation
//!
//! Hand-rolled framing on top of `bytes` and `hpack`, following RFC 7540.
//!
//! # Architecture
//!
//! - `frames` and `codec` turn bytes into typed frames and back
//! - `settings`, `flow_control` and `stream` hold per-connection and
//!   per-stream protocol state
//! - `connection` multiplexes client requests over one transport: a driver
//!   thread owns the socket and the HPACK contexts, callers open streams
//!   through a command channel and admission is bounded by the server's
//!   SETTINGS_MAX_CONCURRENT_STREAMS
//! - `server` is a small fixture server used by the tests
//!
//! # Example
//!
//! ```no_run
//! use vclient::http::h2::server::{H2Response, H2Server};
//! use vclient::http::{HttpClient, Request, Version};
//!
//! let server = H2Server::builder()
//!     .max_concurrent_streams(2)
//!     .start(|req| H2Response::ok(format!("hello {}", req.path)))
//!     .unwrap();
//!
//! let client = HttpClient::builder().version(Version::Http2).build().unwrap();
//! let request = Request::builder().uri(server.uri("/")).build().unwrap();
//! let response = client.send(&request).unwrap();
//! assert_eq!(response.version(), Version::Http2);
//! ```

pub mod codec;
pub mod connection;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod server;
pub mod settings;
pub mod stream;

pub use connection::{H2Connection, H2Options, PendingResponse};
pub use error::{Error, ErrorCode, Result};
pub use frames::{Frame, FrameFlags, FrameType};
pub use settings::{Settings, SettingsBuilder};
pub use stream::{H2Stream, StreamId, StreamState};

/// HTTP/2 connection preface that must be sent by clients
///
/// From RFC 7540 Section 3.5:
/// "PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default initial window size (65535 bytes)
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

/// Default maximum frame size (16384 bytes)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Maximum stream ID value (2^31 - 1)
pub const MAX_STREAM_ID: u32 = 0x7FFFFFFF;

/// Stream ID 0 (connection-level)
pub const CONNECTION_STREAM_ID: u32 = 0;
