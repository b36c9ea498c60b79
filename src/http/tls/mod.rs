//! TLS support for HTTP connections
//!
//! # Architecture
//!
//! The TLS implementation uses the session operations abstraction pattern:
//!
//! 1. `TlsConfig` holds an OpenSSL context built from client or server options
//! 2. `handshake::connect` runs the client handshake with SNI, ALPN and a deadline
//! 3. `TlsSessionOps` implements the `SessionOps` trait for encrypted I/O
//!
//! The server side exists for fixture servers; it falls back to a built-in
//! self-signed certificate for `example.com`.
//!
//! # Examples
//!
//! ```no_run
//! use vclient::http::tls::{TlsConfig, TlsVersion};
//! use vclient::http::HttpClient;
//!
//! let tls = TlsConfig::client()
//!     .version_range(TlsVersion::Tls12, TlsVersion::Tls13)
//!     .verify_peer(true)
//!     .build()
//!     .unwrap();
//!
//! let client = HttpClient::builder().tls(tls).build().unwrap();
//! ```

pub mod builtin_cert;
pub mod cert;
pub mod config;
pub mod handshake;
pub mod session;
pub mod vars;

pub use cert::CertInfo;
pub use config::{ClientConfigBuilder, ServerConfigBuilder, TlsConfig, TlsError, TlsVersion};
pub use handshake::ClientHandshake;
pub use session::TlsSessionOps;
pub use vars::SslSessionInfo;

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, TlsError>;
