//! TLS session operations
//!
//! This module implements the SessionOps trait for TLS connections,
//! enabling transparent switching between plain TCP and TLS I/O.

use super::config::{TlsConfig, TlsError};
use super::vars::SslSessionInfo;
use crate::http::session::{poll_fd, PollEvents, SessionOps};
use crate::http::{Error, Result as HttpResult};
use openssl::ssl::{Ssl, SslStream};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

/// TLS session operations
///
/// Wraps an OpenSSL SslStream and provides poll/read/write/close operations.
pub struct TlsSessionOps {
    stream: SslStream<TcpStream>,
    info: SslSessionInfo,
    failed: bool,
}

impl TlsSessionOps {
    pub(crate) fn from_stream(stream: SslStream<TcpStream>) -> Self {
        let info = SslSessionInfo::from_ssl(stream.ssl());
        TlsSessionOps {
            stream,
            info,
            failed: false,
        }
    }

    /// Accept a client connection with TLS (perform handshake)
    pub fn accept(tcp_stream: TcpStream, config: &TlsConfig) -> std::result::Result<Self, TlsError> {
        let ssl = Ssl::new(&config.ctx)?;

        let ssl_stream = ssl
            .accept(tcp_stream)
            .map_err(|e| TlsError::HandshakeFailed(format!("Accept failed: {}", e)))?;

        Ok(Self::from_stream(ssl_stream))
    }

    /// Negotiated session parameters
    pub fn info(&self) -> &SslSessionInfo {
        &self.info
    }

    /// Check if TLS I/O failed
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Get reference to underlying TCP stream
    pub fn get_ref(&self) -> &TcpStream {
        self.stream.get_ref()
    }
}

impl SessionOps for TlsSessionOps {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> HttpResult<bool> {
        // Decrypted bytes may already be waiting inside OpenSSL.
        if events != PollEvents::Write && self.stream.ssl().pending() > 0 {
            return Ok(true);
        }

        poll_fd(self.stream.get_ref().as_raw_fd(), events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> HttpResult<usize> {
        match self.stream.read(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.failed = true;
                Err(Error::Io(e))
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> HttpResult<usize> {
        match self.stream.write(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.failed = true;
                Err(Error::Io(e))
            }
        }
    }

    fn flush(&mut self) -> HttpResult<()> {
        self.stream.flush().map_err(|e| {
            self.failed = true;
            Error::Io(e)
        })
    }

    fn close(&mut self) -> HttpResult<()> {
        if !self.failed {
            let _ = self.stream.shutdown();
        }

        use std::net::Shutdown;
        match self.stream.get_mut().shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(Error::from(e)),
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.get_ref().as_raw_fd()
    }

    fn buffered(&self) -> usize {
        self.stream.ssl().pending()
    }

    fn ssl_info(&self) -> Option<SslSessionInfo> {
        Some(self.info.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::super::handshake::{connect, ClientHandshake};
    use super::super::{TlsConfig, TlsVersion};
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    #[test]
    fn test_tls_client_server_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server_config = TlsConfig::server()
            .version(TlsVersion::Tls13)
            .build()
            .unwrap();

        let client_config = TlsConfig::client()
            .version(TlsVersion::Tls13)
            .verify_peer(false)
            .build()
            .unwrap();

        let server_handle = thread::spawn(move || {
            let (tcp_stream, _) = listener.accept().unwrap();
            let mut tls_session = server_config.accept(tcp_stream).unwrap();

            let mut buf = vec![0u8; 5];
            let n = tls_session.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"Hello");

            tls_session.write(b"World").unwrap();
            tls_session.close().unwrap();
        });

        let tcp_stream = TcpStream::connect(addr).unwrap();
        let params = ClientHandshake {
            host: "localhost",
            alpn: &[],
            deadline: None,
        };
        let mut tls_session = connect(tcp_stream, &client_config, &params).unwrap();
        assert!(!tls_session.failed());

        tls_session.write(b"Hello").unwrap();

        assert!(tls_session
            .poll(PollEvents::Read, Some(Duration::from_secs(2)))
            .unwrap());
        let mut buf = vec![0u8; 5];
        let n = tls_session.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"World");

        let info = tls_session.ssl_info().unwrap();
        assert!(info.protocol.contains("TLS"));
        assert_eq!(info.peer_certificates[0].subject, "example.com");

        tls_session.close().unwrap();
        server_handle.join().unwrap();
    }
}
