//! Negotiated TLS session parameters
//!
//! A snapshot of what the handshake settled on, attached to every response
//! received over TLS.

use super::cert::{get_cert_chain, CertInfo};
use openssl::ssl::SslRef;

/// TLS session information available after handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SslSessionInfo {
    /// Negotiated TLS version (e.g., "TLSv1.3")
    pub protocol: String,

    /// Negotiated cipher suite
    pub cipher: String,

    /// SNI servername sent by the client
    pub servername: Option<String>,

    /// Negotiated ALPN protocol
    pub alpn: Option<String>,

    /// Certificate chain (index 0 is the peer certificate)
    pub peer_certificates: Vec<CertInfo>,

    /// Whether the session was resumed
    pub session_reused: bool,
}

impl SslSessionInfo {
    /// Capture session parameters from an SSL connection
    pub fn from_ssl(ssl: &SslRef) -> Self {
        SslSessionInfo {
            protocol: ssl.version_str().to_string(),
            cipher: ssl
                .current_cipher()
                .map(|c| c.name().to_string())
                .unwrap_or_else(|| "<undef>".to_string()),
            servername: ssl
                .servername(openssl::ssl::NameType::HOST_NAME)
                .map(|s| s.to_string()),
            alpn: ssl
                .selected_alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).to_string()),
            peer_certificates: get_cert_chain(ssl),
            session_reused: ssl.session_reused(),
        }
    }

    /// Peer certificate, if the peer presented one
    pub fn peer_certificate(&self) -> Option<&CertInfo> {
        self.peer_certificates.first()
    }

    /// Whether ALPN selected HTTP/2
    pub fn is_h2(&self) -> bool {
        self.alpn.as_deref() == Some("h2")
    }
}
