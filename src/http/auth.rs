//! Authentication challenges and credentials
//!
//! A 401 or 407 response carries one or more challenges. The pipeline asks
//! the configured [`Authenticator`] for credentials and answers the first
//! challenge it supports: `Basic` (RFC 7617) or `Digest` with MD5 and
//! `qop=auth` (RFC 7616). Basic credentials that worked are cached per
//! (host, port, proxy) and sent preemptively on later requests.

use super::message::Method;
use super::{Error, Headers, Result, Uri};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use openssl::hash::{hash, MessageDigest};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Which hop is asking for credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthTarget {
    /// Origin server, `401` / `WWW-Authenticate` / `Authorization`
    Server,
    /// Proxy, `407` / `Proxy-Authenticate` / `Proxy-Authorization`
    Proxy,
}

impl AuthTarget {
    pub fn status(self) -> u16 {
        match self {
            AuthTarget::Server => 401,
            AuthTarget::Proxy => 407,
        }
    }

    pub fn challenge_header(self) -> &'static str {
        match self {
            AuthTarget::Server => "WWW-Authenticate",
            AuthTarget::Proxy => "Proxy-Authenticate",
        }
    }

    pub fn from_status(code: u16) -> Option<AuthTarget> {
        match code {
            401 => Some(AuthTarget::Server),
            407 => Some(AuthTarget::Proxy),
            _ => None,
        }
    }
}

/// User name and password
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Context handed to an [`Authenticator`]
#[derive(Debug, Clone)]
pub struct AuthRequest<'a> {
    pub target: AuthTarget,
    /// Host and port of the server or proxy asking
    pub host: &'a str,
    pub port: u16,
    /// Challenge scheme, e.g. `Basic`
    pub scheme: &'a str,
    pub realm: &'a str,
    /// URI of the request being authenticated
    pub uri: &'a Uri,
}

/// Supplier of credentials for authentication challenges
pub trait Authenticator: Send + Sync {
    /// Credentials for `request`, or `None` to give up
    fn credentials(&self, request: &AuthRequest<'_>) -> Option<Credentials>;
}

impl<F> Authenticator for F
where
    F: Fn(&AuthRequest<'_>) -> Option<Credentials> + Send + Sync,
{
    fn credentials(&self, request: &AuthRequest<'_>) -> Option<Credentials> {
        self(request)
    }
}

/// The same credentials for every challenge
impl Authenticator for Credentials {
    fn credentials(&self, _request: &AuthRequest<'_>) -> Option<Credentials> {
        Some(self.clone())
    }
}

/// One parsed challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    scheme: String,
    params: HashMap<String, String>,
}

impl Challenge {
    /// Parse a challenge header value
    ///
    /// Only the first challenge of a value is returned; servers offering
    /// several schemes are expected to send one header line per scheme.
    pub fn parse(value: &str) -> Option<Challenge> {
        let value = value.trim();
        let (scheme, rest) = match value.find(char::is_whitespace) {
            Some(idx) => (&value[..idx], value[idx..].trim_start()),
            None => (value, ""),
        };
        if scheme.is_empty() {
            return None;
        }
        Some(Challenge {
            scheme: scheme.to_string(),
            params: parse_params(rest),
        })
    }

    /// All challenges of the given header in `headers`
    pub fn from_headers(headers: &Headers, target: AuthTarget) -> Vec<Challenge> {
        headers
            .get_all(target.challenge_header())
            .into_iter()
            .filter_map(Challenge::parse)
            .collect()
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn realm(&self) -> &str {
        self.param("realm").unwrap_or("")
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn is_basic(&self) -> bool {
        self.scheme.eq_ignore_ascii_case("Basic")
    }

    pub fn is_digest(&self) -> bool {
        self.scheme.eq_ignore_ascii_case("Digest")
    }

    fn is_supported(&self) -> bool {
        if self.is_basic() {
            return true;
        }
        self.is_digest()
            && self.param("nonce").is_some()
            && self
                .param("algorithm")
                .map_or(true, |a| a.eq_ignore_ascii_case("MD5"))
    }
}

/// First challenge we know how to answer
pub fn select(challenges: &[Challenge]) -> Option<&Challenge> {
    challenges
        .iter()
        .find(|c| c.is_digest() && c.is_supported())
        .or_else(|| challenges.iter().find(|c| c.is_basic()))
}

/// `key=value` and `key="quoted, value"` pairs separated by commas
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut rest = input;
    loop {
        rest = rest.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
        let Some(eq) = rest.find('=') else {
            break;
        };
        let name = rest[..eq].trim().to_ascii_lowercase();
        rest = rest[eq + 1..].trim_start();
        let value;
        if let Some(quoted) = rest.strip_prefix('"') {
            let mut out = String::new();
            let mut chars = quoted.char_indices();
            let mut end = quoted.len();
            while let Some((idx, c)) = chars.next() {
                match c {
                    '\\' => {
                        if let Some((_, escaped)) = chars.next() {
                            out.push(escaped);
                        }
                    }
                    '"' => {
                        end = idx + 1;
                        break;
                    }
                    c => out.push(c),
                }
            }
            value = out;
            rest = &quoted[end.min(quoted.len())..];
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_string();
            rest = &rest[end..];
        }
        params.insert(name, value);
    }
    params
}

/// `Authorization` value for Basic
pub fn basic(credentials: &Credentials) -> String {
    let raw = format!("{}:{}", credentials.username, credentials.password);
    format!("Basic {}", STANDARD.encode(raw))
}

fn md5_hex(data: &str) -> Result<String> {
    let digest = hash(MessageDigest::md5(), data.as_bytes())
        .map_err(|e| Error::Auth(format!("digest computation failed: {}", e)))?;
    Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
}

fn cnonce() -> Result<String> {
    let mut bytes = [0u8; 8];
    openssl::rand::rand_bytes(&mut bytes)
        .map_err(|e| Error::Auth(format!("cnonce generation failed: {}", e)))?;
    Ok(bytes.iter().map(|b| format!("{:02x}", b)).collect())
}

/// `Authorization` value answering a Digest challenge
pub fn digest(
    challenge: &Challenge,
    credentials: &Credentials,
    method: Method,
    uri: &str,
    cnonce: &str,
) -> Result<String> {
    let nonce = challenge
        .param("nonce")
        .ok_or_else(|| Error::Auth("Digest challenge without nonce".to_string()))?;
    let realm = challenge.realm();
    let ha1 = md5_hex(&format!("{}:{}:{}", credentials.username, realm, credentials.password))?;
    let ha2 = md5_hex(&format!("{}:{}", method, uri))?;
    let qop_auth = challenge
        .param("qop")
        .is_some_and(|q| q.split(',').any(|v| v.trim().eq_ignore_ascii_case("auth")));

    let mut header = format!(
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\"",
        credentials.username, realm, nonce, uri
    );
    if qop_auth {
        let nc = "00000001";
        let response = md5_hex(&format!("{}:{}:{}:{}:auth:{}", ha1, nonce, nc, cnonce, ha2))?;
        header.push_str(&format!(
            ", qop=auth, nc={}, cnonce=\"{}\", response=\"{}\"",
            nc, cnonce, response
        ));
    } else {
        let response = md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2))?;
        header.push_str(&format!(", response=\"{}\"", response));
    }
    if let Some(opaque) = challenge.param("opaque") {
        header.push_str(&format!(", opaque=\"{}\"", opaque));
    }
    header.push_str(", algorithm=MD5");
    Ok(header)
}

/// Answer `challenge` with `credentials` for a request
pub fn respond(
    challenge: &Challenge,
    credentials: &Credentials,
    method: Method,
    uri: &Uri,
) -> Result<String> {
    if challenge.is_digest() {
        digest(challenge, credentials, method, &uri.request_target(), &cnonce()?)
    } else {
        Ok(basic(credentials))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    host: String,
    port: u16,
    target: AuthTarget,
}

/// Basic credentials known to work, sent without waiting for a challenge
#[derive(Debug, Default, Clone)]
pub struct AuthCache {
    entries: Arc<Mutex<HashMap<CacheKey, String>>>,
}

impl AuthCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(host: &str, port: u16, target: AuthTarget) -> CacheKey {
        CacheKey {
            host: host.to_ascii_lowercase(),
            port,
            target,
        }
    }

    /// Cached header value for a hop
    pub fn get(&self, host: &str, port: u16, target: AuthTarget) -> Option<String> {
        self.entries.lock().get(&Self::key(host, port, target)).cloned()
    }

    /// Remember a header value that was accepted
    pub fn store(&self, host: &str, port: u16, target: AuthTarget, value: String) {
        self.entries.lock().insert(Self::key(host, port, target), value);
    }

    /// Forget a header value that was rejected
    pub fn remove(&self, host: &str, port: u16, target: AuthTarget) {
        self.entries.lock().remove(&Self::key(host, port, target));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
