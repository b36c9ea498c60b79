//! TLS configuration
//!
//! This module provides TLS configuration builders for both client and server.
//! Builders only collect options; the OpenSSL context is created in `build()`
//! so every OpenSSL failure surfaces as a `TlsError` there.

use openssl::pkey::PKey;
use openssl::ssl::{SslContext, SslContextBuilder, SslMethod, SslVerifyMode};
use openssl::x509::X509;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// TLS version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    /// TLS 1.0
    Tls10,
    /// TLS 1.1
    Tls11,
    /// TLS 1.2
    Tls12,
    /// TLS 1.3
    Tls13,
}

impl TlsVersion {
    /// Parse TLS version from string (case-insensitive)
    pub fn from_str(s: &str) -> Result<Self, TlsError> {
        match s.to_uppercase().as_str() {
            "TLSV1.0" | "TLS1.0" | "TLSV1" | "TLS1" => Ok(TlsVersion::Tls10),
            "TLSV1.1" | "TLS1.1" => Ok(TlsVersion::Tls11),
            "TLSV1.2" | "TLS1.2" => Ok(TlsVersion::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(TlsVersion::Tls13),
            _ => Err(TlsError::InvalidVersion(s.to_string())),
        }
    }

    /// Get OpenSSL protocol version constant
    pub fn to_openssl_version(&self) -> openssl::ssl::SslVersion {
        use openssl::ssl::SslVersion;
        match self {
            TlsVersion::Tls10 => SslVersion::TLS1,
            TlsVersion::Tls11 => SslVersion::TLS1_1,
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }

    /// Get version as string
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls10 => "TLSv1.0",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }
}

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TLS version: {0}")]
    InvalidVersion(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Handshake timed out")]
    HandshakeTimeout,
}

/// TLS configuration (immutable after building)
#[derive(Clone)]
pub struct TlsConfig {
    pub(crate) ctx: SslContext,
    pub(crate) is_server: bool,
    pub(crate) servername: Option<String>,
    pub(crate) verify_peer: bool,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("is_server", &self.is_server)
            .field("servername", &self.servername)
            .field("verify_peer", &self.verify_peer)
            .finish()
    }
}

impl TlsConfig {
    /// Create a new client configuration builder
    pub fn client() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Create a new server configuration builder
    pub fn server() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Accept a client connection with TLS (server-side)
    pub fn accept(&self, stream: std::net::TcpStream) -> Result<super::TlsSessionOps, TlsError> {
        if !self.is_server {
            return Err(TlsError::InvalidConfig(
                "Cannot use client config for server accept".to_string(),
            ));
        }
        super::session::TlsSessionOps::accept(stream, self)
    }
}

/// Encode protocol names in ALPN wire format (length-prefixed)
pub fn alpn_wire_format(protocols: &[&str]) -> Result<Vec<u8>, TlsError> {
    let mut wire = Vec::new();
    for proto in protocols {
        if proto.is_empty() || proto.len() > 255 {
            return Err(TlsError::InvalidConfig(format!("Invalid ALPN protocol: {:?}", proto)));
        }
        wire.push(proto.len() as u8);
        wire.extend_from_slice(proto.as_bytes());
    }
    Ok(wire)
}

fn read_pem(path: &Path) -> Result<Vec<u8>, TlsError> {
    let mut pem = Vec::new();
    File::open(path)?.read_to_end(&mut pem)?;
    Ok(pem)
}

fn load_cert_and_key(ctx: &mut SslContextBuilder, pem: &[u8]) -> Result<(), TlsError> {
    let cert = X509::from_pem(pem)
        .map_err(|e| TlsError::Certificate(format!("Failed to load certificate: {}", e)))?;
    ctx.set_certificate(&cert)?;

    let key = PKey::private_key_from_pem(pem)
        .map_err(|e| TlsError::Certificate(format!("Failed to load private key: {}", e)))?;
    ctx.set_private_key(&key)?;
    Ok(())
}

/// Client configuration builder
///
/// Peer verification is off by default; the engine is primarily exercised
/// against fixture servers with self-signed certificates.
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    min_version: Option<TlsVersion>,
    max_version: Option<TlsVersion>,
    cipher_list: Option<String>,
    ciphersuites: Option<String>,
    ca_file: Option<PathBuf>,
    cert_file: Option<PathBuf>,
    servername: Option<String>,
    verify_peer: bool,
}

impl ClientConfigBuilder {
    /// Set TLS version (both min and max)
    pub fn version(mut self, version: TlsVersion) -> Self {
        self.min_version = Some(version);
        self.max_version = Some(version);
        self
    }

    /// Set TLS version range
    pub fn version_range(mut self, min: TlsVersion, max: TlsVersion) -> Self {
        self.min_version = Some(min);
        self.max_version = Some(max);
        self
    }

    /// Set cipher list (for TLS <= 1.2)
    pub fn cipher_list(mut self, ciphers: impl Into<String>) -> Self {
        self.cipher_list = Some(ciphers.into());
        self
    }

    /// Set cipher suites (for TLS 1.3)
    pub fn ciphersuites(mut self, ciphers: impl Into<String>) -> Self {
        self.ciphersuites = Some(ciphers.into());
        self
    }

    /// Override the SNI servername (defaults to the request host)
    pub fn servername(mut self, name: impl Into<String>) -> Self {
        self.servername = Some(name.into());
        self
    }

    /// Enable/disable peer certificate and hostname verification
    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }

    /// Trust anchors for peer verification
    pub fn ca_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.ca_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Client certificate and key in one PEM file
    pub fn cert_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.cert_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Build the TLS configuration
    pub fn build(self) -> Result<TlsConfig, TlsError> {
        let mut ctx = SslContextBuilder::new(SslMethod::tls_client())?;

        if let Some(min) = self.min_version {
            ctx.set_min_proto_version(Some(min.to_openssl_version()))?;
        }
        if let Some(max) = self.max_version {
            ctx.set_max_proto_version(Some(max.to_openssl_version()))?;
        }
        if let Some(ref ciphers) = self.cipher_list {
            ctx.set_cipher_list(ciphers)?;
        }
        if let Some(ref suites) = self.ciphersuites {
            ctx.set_ciphersuites(suites)?;
        }

        if self.verify_peer {
            ctx.set_verify(SslVerifyMode::PEER);
            match self.ca_file {
                Some(ref path) => ctx.set_ca_file(path)?,
                None => ctx.set_default_verify_paths()?,
            }
        } else {
            ctx.set_verify(SslVerifyMode::NONE);
        }

        if let Some(ref path) = self.cert_file {
            let pem = read_pem(path)?;
            load_cert_and_key(&mut ctx, &pem)?;
        }

        Ok(TlsConfig {
            ctx: ctx.build(),
            is_server: false,
            servername: self.servername,
            verify_peer: self.verify_peer,
        })
    }
}

/// Server configuration builder, used by fixture servers
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    min_version: Option<TlsVersion>,
    max_version: Option<TlsVersion>,
    alpn: Vec<String>,
    cert_file: Option<PathBuf>,
}

impl ServerConfigBuilder {
    /// Set TLS version (both min and max)
    pub fn version(mut self, version: TlsVersion) -> Self {
        self.min_version = Some(version);
        self.max_version = Some(version);
        self
    }

    /// Set ALPN protocols the server is willing to select, in preference order
    pub fn alpn(mut self, protocols: &[&str]) -> Self {
        self.alpn = protocols.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Load server certificate and key from one PEM file
    pub fn cert_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.cert_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Build the TLS configuration
    ///
    /// Without a certificate file the built-in self-signed certificate is used.
    pub fn build(self) -> Result<TlsConfig, TlsError> {
        let mut ctx = SslContextBuilder::new(SslMethod::tls_server())?;

        if let Some(min) = self.min_version {
            ctx.set_min_proto_version(Some(min.to_openssl_version()))?;
        }
        if let Some(max) = self.max_version {
            ctx.set_max_proto_version(Some(max.to_openssl_version()))?;
        }

        match self.cert_file {
            Some(ref path) => {
                let pem = read_pem(path)?;
                load_cert_and_key(&mut ctx, &pem)?;
            }
            None => load_cert_and_key(&mut ctx, super::builtin_cert::BUILTIN_CERT.as_bytes())?,
        }

        if !self.alpn.is_empty() {
            let ours: Vec<Vec<u8>> = self.alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
            ctx.set_alpn_select_callback(move |_ssl, client_protos| {
                // Server preference order wins over client order.
                for proto in &ours {
                    let mut pos = 0;
                    while pos < client_protos.len() {
                        let len = client_protos[pos] as usize;
                        pos += 1;
                        if pos + len > client_protos.len() {
                            break;
                        }
                        let candidate = &client_protos[pos..pos + len];
                        if candidate == proto.as_slice() {
                            return Ok(candidate);
                        }
                        pos += len;
                    }
                }
                Err(openssl::ssl::AlpnError::NOACK)
            });
        }

        Ok(TlsConfig {
            ctx: ctx.build(),
            is_server: true,
            servername: None,
            verify_peer: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_version_parsing() {
        assert_eq!(TlsVersion::from_str("TLSv1.2").unwrap(), TlsVersion::Tls12);
        assert_eq!(TlsVersion::from_str("tlsv1.3").unwrap(), TlsVersion::Tls13);
        assert_eq!(TlsVersion::from_str("TLS1.0").unwrap(), TlsVersion::Tls10);
        assert!(TlsVersion::from_str("invalid").is_err());
    }

    #[test]
    fn test_client_config_builder() {
        let config = TlsConfig::client()
            .version(TlsVersion::Tls13)
            .servername("example.com")
            .verify_peer(false)
            .build()
            .unwrap();

        assert!(!config.is_server);
        assert_eq!(config.servername, Some("example.com".to_string()));
        assert!(!config.verify_peer);
    }

    #[test]
    fn test_server_config_builder() {
        let config = TlsConfig::server()
            .version(TlsVersion::Tls13)
            .alpn(&["h2", "http/1.1"])
            .build()
            .unwrap();

        assert!(config.is_server);
    }

    #[test]
    fn test_missing_cert_file() {
        let result = TlsConfig::client().cert_file("/nonexistent/client.pem").build();
        assert!(matches!(result, Err(TlsError::Io(_))));
    }

    #[test]
    fn test_alpn_wire_format() {
        assert_eq!(
            alpn_wire_format(&["h2", "http/1.1"]).unwrap(),
            b"\x02h2\x08http/1.1".to_vec()
        );
        assert!(alpn_wire_format(&[""]).is_err());
    }
}
