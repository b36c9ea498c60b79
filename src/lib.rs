//! vclient - pooling, protocol-negotiating HTTP client engine
//!
//! A blocking HTTP/1.1 and HTTP/2 client: plain TCP and TLS transports sit
//! behind one `SessionOps` trait, HTTP/2 framing is hand-rolled, and
//! concurrency comes from OS threads rather than an async runtime.

pub mod http;

pub use http::client::{ClientBuilder, ClientConfig, HttpClient};
pub use http::{Error, ErrorKind, Result};
