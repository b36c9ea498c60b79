//! Client-side TLS handshake
//!
//! The handshake runs in blocking mode on the TCP stream with socket-level
//! read/write timeouts derived from the connect deadline, so a stalled peer
//! cannot hold the connecting thread past its budget.

use super::config::{alpn_wire_format, TlsConfig, TlsError};
use super::session::TlsSessionOps;
use openssl::ssl::{HandshakeError, Ssl};
use std::io;
use std::net::TcpStream;
use std::time::Instant;

/// Parameters for one client handshake
#[derive(Debug, Clone)]
pub struct ClientHandshake<'a> {
    /// Host used for SNI and hostname verification
    pub host: &'a str,
    /// ALPN protocols offered, in preference order
    pub alpn: &'a [&'a str],
    /// Handshake must complete before this instant
    pub deadline: Option<Instant>,
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Perform a client handshake over an established TCP stream
pub fn connect(
    stream: TcpStream,
    config: &TlsConfig,
    params: &ClientHandshake<'_>,
) -> Result<TlsSessionOps, TlsError> {
    if config.is_server {
        return Err(TlsError::InvalidConfig(
            "Cannot use server config for client connection".to_string(),
        ));
    }

    let mut ssl = Ssl::new(&config.ctx)?;
    let servername = config.servername.as_deref().unwrap_or(params.host);
    if servername.parse::<std::net::IpAddr>().is_err() {
        ssl.set_hostname(servername)?;
    }
    if config.verify_peer {
        ssl.param_mut().set_host(servername)?;
    }
    if !params.alpn.is_empty() {
        ssl.set_alpn_protos(&alpn_wire_format(params.alpn)?)?;
    }

    if let Some(deadline) = params.deadline {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(TlsError::HandshakeTimeout);
        }
        stream.set_read_timeout(Some(left))?;
        stream.set_write_timeout(Some(left))?;
    }

    let ssl_stream = match ssl.connect(stream) {
        Ok(stream) => stream,
        Err(HandshakeError::WouldBlock(_)) => return Err(TlsError::HandshakeTimeout),
        Err(HandshakeError::SetupFailure(e)) => return Err(TlsError::OpenSsl(e)),
        Err(HandshakeError::Failure(mid)) => {
            if mid.error().io_error().map(is_timeout).unwrap_or(false) {
                return Err(TlsError::HandshakeTimeout);
            }
            return Err(TlsError::HandshakeFailed(mid.error().to_string()));
        }
    };

    ssl_stream.get_ref().set_read_timeout(None)?;
    ssl_stream.get_ref().set_write_timeout(None)?;

    let session = TlsSessionOps::from_stream(ssl_stream);
    tracing::debug!(
        host = params.host,
        version = %session.info().protocol,
        alpn = ?session.info().alpn,
        "TLS handshake complete"
    );
    Ok(session)
}
