//! HTTP/1.1 and HTTP/2 client engine
//!
//! # Architecture
//!
//! The engine is layered the same way as a single exchange flows through it:
//!
//! - `client::HttpClient` owns configuration, the connection pool and the
//!   async worker pool; there is no process-wide default client
//! - `pipeline` runs one logical request through redirects, authentication
//!   challenges and idempotent retries
//! - `pool` hands out pooled HTTP/1.1 connections and shared HTTP/2
//!   connections per `PoolKey`
//! - `connection` establishes transports (TCP, TLS with ALPN, CONNECT tunnels)
//! - `h1` and `h2` speak the wire protocols
//! - `flow` streams request and response bodies with explicit demand
//!
//! All transports are driven through the `SessionOps` trait so the HTTP code
//! never needs to know whether it is talking plain TCP or TLS.
//!
//! # Examples
//!
//! ```no_run
//! use vclient::http::{HttpClient, Request};
//! use std::time::Duration;
//!
//! let client = HttpClient::builder()
//!     .connect_timeout(Duration::from_secs(5))
//!     .build()
//!     .unwrap();
//!
//! let request = Request::builder()
//!     .uri("http://127.0.0.1:8080/")
//!     .timeout(Duration::from_secs(10))
//!     .build()
//!     .unwrap();
//!
//! let response = client.send(&request).unwrap();
//! assert_eq!(response.status().code(), 200);
//! let body = response.into_body().text().unwrap();
//! println!("{}", body);
//! ```

use std::fmt;

pub mod auth;
pub mod chunked;
pub mod client;
pub mod connection;
pub mod cookie;
pub mod executor;
pub mod flow;
pub mod h1;
pub mod h2;
pub mod headers;
pub mod message;
pub mod parser;
pub mod pipeline;
pub mod pool;
pub mod server;
pub mod session;
pub mod timeout;
pub mod tls;
pub mod uri;

pub use auth::{Authenticator, Credentials};
pub use client::{ClientBuilder, ClientConfig, HttpClient, Redirect, StreamLimitPolicy};
pub use connection::{ConnectionState, Proxy};
pub use cookie::{CookieStore, InMemoryCookieStore};
pub use executor::ResponseFuture;
pub use flow::body;
pub use headers::Headers;
pub use message::{Method, Request, RequestBuilder, Response, ResponseBody, Status, Version};
pub use parser::ResponseParser;
pub use pool::{ConnectionStats, PoolConfig, PoolKey};
pub use server::HttpServer;
pub use session::{HttpSession, SessionOps};
pub use uri::Uri;

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TCP connect to a resolved address failed
    #[error("Connection to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unresolved address: {0}")]
    Unresolved(String),

    /// Connection establishment exceeded the connect timeout
    #[error("HTTP connect timed out")]
    ConnectTimeout {
        #[source]
        source: Box<Error>,
    },

    /// The request deadline elapsed before response headers arrived
    #[error("request timed out")]
    RequestTimeout,

    /// A single poll or read on a session timed out
    #[error("Timeout")]
    Timeout,

    /// Transport was connected but could not be set up (TLS, CONNECT tunnel)
    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("TLS error: {0}")]
    Tls(#[from] tls::TlsError),

    #[error("HTTP/2 error: {0}")]
    H2(#[from] h2::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid HTTP version: {0}")]
    InvalidVersion(String),

    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("Invalid HTTP status: {0}")]
    InvalidStatus(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(String),

    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    #[error("Incomplete message")]
    Incomplete,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    BodyLengthMismatch(LengthMismatch),

    /// Opening another stream would exceed the peer's advertised limit
    #[error("Too many concurrent streams")]
    TooManyStreams,

    #[error("{0}")]
    Auth(String),

    /// Proxy answered a CONNECT request with 407
    #[error("Proxy authentication required")]
    ProxyAuthRequired(Box<parser::ResponseHead>),

    #[error("Cancelled")]
    Cancelled,

    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Too many redirects: {0}")]
    TooManyRedirects(usize),

    /// Failure after the response head was delivered to the caller
    #[error("Error reading response body: {0}")]
    Body(#[source] Box<Error>),
}

/// Classification of errors as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConnectTimeout,
    RequestTimeout,
    Connection,
    Handshake,
    Protocol,
    BodyLengthMismatch,
    Auth,
    Cancelled,
    TooManyStreams,
    IllegalArgument,
    IllegalState,
    Redirect,
    Body,
}

impl Error {
    /// Taxonomy kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::Connect { .. } | Error::Unresolved(_) | Error::ConnectionClosed => {
                ErrorKind::Connection
            }
            Error::ConnectTimeout { .. } => ErrorKind::ConnectTimeout,
            Error::RequestTimeout | Error::Timeout => ErrorKind::RequestTimeout,
            Error::Handshake(_) => ErrorKind::Handshake,
            Error::Tls(e) => match e {
                tls::TlsError::HandshakeFailed(_) => ErrorKind::Handshake,
                tls::TlsError::HandshakeTimeout => ErrorKind::ConnectTimeout,
                tls::TlsError::Io(_) => ErrorKind::Connection,
                _ => ErrorKind::IllegalArgument,
            },
            Error::H2(e) => match e {
                h2::Error::Io(_) | h2::Error::ConnectionClosed => ErrorKind::Connection,
                h2::Error::TooManyStreams => ErrorKind::TooManyStreams,
                h2::Error::Cancel(_) => ErrorKind::Cancelled,
                h2::Error::Timeout => ErrorKind::RequestTimeout,
                _ => ErrorKind::Protocol,
            },
            Error::Parse(_)
            | Error::InvalidVersion(_)
            | Error::InvalidStatus(_)
            | Error::InvalidHeader(_)
            | Error::InvalidChunkSize(_)
            | Error::Incomplete
            | Error::Protocol(_) => ErrorKind::Protocol,
            Error::InvalidMethod(_) | Error::InvalidUri(_) | Error::IllegalArgument(_) => {
                ErrorKind::IllegalArgument
            }
            Error::BodyLengthMismatch(_) => ErrorKind::BodyLengthMismatch,
            Error::TooManyStreams => ErrorKind::TooManyStreams,
            Error::Auth(_) | Error::ProxyAuthRequired(_) => ErrorKind::Auth,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::IllegalState(_) => ErrorKind::IllegalState,
            Error::TooManyRedirects(_) => ErrorKind::Redirect,
            Error::Body(_) => ErrorKind::Body,
        }
    }

    /// Turn a session-level poll timeout into a request timeout
    pub(crate) fn into_request_timeout(self) -> Error {
        match self {
            Error::Timeout | Error::H2(h2::Error::Timeout) => Error::RequestTimeout,
            other => other,
        }
    }

    /// Wrap an error raised while a response body was streaming
    pub(crate) fn into_body_error(self) -> Error {
        match self {
            Error::Body(_) | Error::Cancelled => self,
            other => Error::Body(Box::new(other.into_request_timeout())),
        }
    }

    /// Build an I/O error with the given kind and message
    pub(crate) fn io(kind: std::io::ErrorKind, msg: impl Into<String>) -> Error {
        Error::Io(std::io::Error::new(kind, msg.into()))
    }
}

/// Declared and actual request body sizes that disagree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthMismatch {
    pub declared: u64,
    pub actual: u64,
}

impl LengthMismatch {
    pub fn is_too_many(&self) -> bool {
        self.actual > self.declared
    }
}

impl fmt::Display for LengthMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_too_many() {
            write!(
                f,
                "too many bytes in request body: expected {}, got at least {}",
                self.declared, self.actual
            )
        } else {
            write!(
                f,
                "too few bytes returned by the publisher: expected {}, got {}",
                self.declared, self.actual
            )
        }
    }
}

/// Maximum number of header fields accepted in one message head
pub const MAX_HEADERS: usize = 256;

/// Default HTTP port
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Default HTTPS port
pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// CRLF line ending
pub const CRLF: &str = "\r\n";
