//! HTTP message types
//!
//! This module defines the request and response types the client exposes.
//! Requests are immutable once built; the pipeline derives new requests
//! for redirects and challenge retries instead of mutating the caller's.

use super::flow::{self, Body, BodyReader, Charset, Emitter, Lines, Pull, Subscriber};
use super::headers::{validate_name, validate_value};
use super::tls::SslSessionInfo;
use super::{Error, Headers, Result, Uri};
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// HTTP methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

impl Method {
    /// Parse method from string
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "CONNECT" => Ok(Method::Connect),
            "OPTIONS" => Ok(Method::Options),
            "TRACE" => Ok(Method::Trace),
            "PATCH" => Ok(Method::Patch),
            _ => Err(Error::InvalidMethod(s.to_string())),
        }
    }

    /// Convert method to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
        }
    }

    /// Methods that may be resent automatically after a connection failure
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            Method::Get | Method::Head | Method::Put | Method::Delete | Method::Options | Method::Trace
        )
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// HTTP version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Version {
    Http10,
    Http11,
    #[default]
    Http2,
}

impl Version {
    /// Parse version from string
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "HTTP/1.0" => Ok(Version::Http10),
            "HTTP/1.1" => Ok(Version::Http11),
            "HTTP/2" | "HTTP/2.0" => Ok(Version::Http2),
            _ => Err(Error::InvalidVersion(s.to_string())),
        }
    }

    /// Convert version to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
            Version::Http2 => "HTTP/2",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// HTTP status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status {
    code: u16,
}

impl Status {
    /// Create a new status code
    pub fn new(code: u16) -> Result<Self> {
        if (100..600).contains(&code) {
            Ok(Status { code })
        } else {
            Err(Error::InvalidStatus(format!("Invalid status code: {}", code)))
        }
    }

    /// Get the status code
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Get the canonical reason phrase for this status code
    pub fn reason_phrase(&self) -> &'static str {
        match self.code {
            100 => "Continue",
            101 => "Switching Protocols",
            200 => "OK",
            201 => "Created",
            204 => "No Content",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            407 => "Proxy Authentication Required",
            408 => "Request Timeout",
            411 => "Length Required",
            413 => "Payload Too Large",
            426 => "Upgrade Required",
            500 => "Internal Server Error",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            505 => "HTTP Version Not Supported",
            _ => "Unknown",
        }
    }

    /// Check if this is an informational status (1xx)
    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// Check if this is a success status (2xx)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Check if this is a redirection status (3xx)
    pub fn is_redirection(&self) -> bool {
        (300..400).contains(&self.code)
    }

    /// Check if this is a client error status (4xx)
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.code)
    }

    /// Check if this is a server error status (5xx)
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.code)
    }

    // Common status codes as constants
    pub const OK: Status = Status { code: 200 };
    pub const SWITCHING_PROTOCOLS: Status = Status { code: 101 };
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.reason_phrase())
    }
}

/// Headers the client manages itself and callers may not set
const RESTRICTED_HEADERS: &[&str] = &[
    "connection",
    "content-length",
    "expect",
    "host",
    "upgrade",
    "transfer-encoding",
    "te",
    "keep-alive",
    "http2-settings",
];

/// Immutable HTTP request
#[derive(Debug, Clone)]
pub struct Request {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) headers: Headers,
    pub(crate) body: Option<Body>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) version: Option<Version>,
}

impl Request {
    /// Create a builder for constructing requests
    pub fn builder() -> RequestBuilder {
        RequestBuilder::default()
    }

    /// Get the request method
    pub fn method(&self) -> Method {
        self.method
    }

    /// Get the request URI
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Get the user headers
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Get the body publisher, if any
    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    /// Per-request timeout, covering the exchange up to response headers
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Version override for this request
    pub fn version(&self) -> Option<Version> {
        self.version
    }

    /// Copy of this request aimed at another URI with another method
    pub(crate) fn redirected(&self, method: Method, uri: Uri, keep_body: bool) -> Request {
        let mut headers = self.headers.clone();
        if !self.uri.same_origin(&uri) {
            headers.remove("Authorization");
        }
        Request {
            method,
            uri,
            headers,
            body: if keep_body { self.body.clone() } else { None },
            timeout: self.timeout,
            version: self.version,
        }
    }
}

/// Builder for [`Request`]
#[derive(Debug, Default)]
pub struct RequestBuilder {
    method: Option<Method>,
    uri: Option<std::result::Result<Uri, String>>,
    headers: Headers,
    body: Option<Body>,
    timeout: Option<Duration>,
    version: Option<Version>,
}

impl RequestBuilder {
    /// Set the URI; parsed and validated by [`build`](RequestBuilder::build)
    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(Err(uri.into()));
        self
    }

    /// Set an already parsed URI
    pub fn uri_parsed(mut self, uri: Uri) -> Self {
        self.uri = Some(Ok(uri));
        self
    }

    /// Set the method without changing the body
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn get(self) -> Self {
        self.method(Method::Get).no_body()
    }

    pub fn head(self) -> Self {
        self.method(Method::Head).no_body()
    }

    pub fn delete(self) -> Self {
        self.method(Method::Delete).no_body()
    }

    pub fn post(self, body: Body) -> Self {
        self.method(Method::Post).body(body)
    }

    pub fn put(self, body: Body) -> Self {
        self.method(Method::Put).body(body)
    }

    /// Set the body publisher
    pub fn body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    fn no_body(mut self) -> Self {
        self.body = None;
        self
    }

    /// Append a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Replace a header
    pub fn set_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    /// Per-request timeout; must be positive
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Force a protocol version for this request
    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Build the request
    pub fn build(self) -> Result<Request> {
        let uri = match self.uri {
            Some(Ok(uri)) => uri,
            Some(Err(raw)) => Uri::parse(&raw)?,
            None => return Err(Error::IllegalArgument("request URI not set".to_string())),
        };
        if uri.host().is_empty() {
            return Err(Error::IllegalArgument(format!("URI has no host: {}", uri)));
        }

        for (name, value) in self.headers.iter() {
            validate_name(name)?;
            validate_value(value)?;
            if RESTRICTED_HEADERS.iter().any(|r| name.eq_ignore_ascii_case(r)) {
                return Err(Error::IllegalArgument(format!("restricted header name: {}", name)));
            }
        }
        self.headers.check_limit()?;

        if let Some(timeout) = self.timeout {
            if timeout.is_zero() {
                return Err(Error::IllegalArgument("timeout must be positive".to_string()));
            }
        }

        Ok(Request {
            method: self.method.unwrap_or(Method::Get),
            uri,
            headers: self.headers,
            body: self.body,
            timeout: self.timeout,
            version: self.version,
        })
    }
}

/// Streaming response body
///
/// The body is consumed exactly once, by one of the accessor methods.
/// Dropping an unconsumed body cancels it, which closes an HTTP/1.1
/// connection or resets an HTTP/2 stream.
pub struct ResponseBody {
    emitter: Option<Arc<Emitter<Bytes>>>,
    charset: Charset,
}

impl ResponseBody {
    pub(crate) fn new(emitter: Arc<Emitter<Bytes>>, charset: Charset) -> Self {
        ResponseBody {
            emitter: Some(emitter),
            charset,
        }
    }

    /// Body with no content
    pub(crate) fn empty() -> Self {
        let emitter = Emitter::new();
        emitter.complete();
        ResponseBody::new(emitter, Charset::default())
    }

    fn take(&mut self) -> Result<Arc<Emitter<Bytes>>> {
        self.emitter
            .take()
            .ok_or_else(|| Error::IllegalState("response body already consumed".to_string()))
    }

    /// Charset announced by the response `Content-Type`
    pub fn charset(&self) -> Charset {
        self.charset
    }

    /// Attach a subscriber to the raw byte stream
    pub fn subscribe(mut self, subscriber: Box<dyn Subscriber<Bytes>>) -> Result<()> {
        self.take()?.subscribe(subscriber);
        Ok(())
    }

    /// Blocking reader over the body
    pub fn reader(mut self) -> Result<BodyReader> {
        let emitter = self.take()?;
        let (reader, subscriber) = BodyReader::new();
        emitter.subscribe(Box::new(subscriber));
        Ok(reader)
    }

    /// Read the whole body into memory
    pub fn bytes(self) -> Result<Bytes> {
        let mut reader = self.reader()?;
        let mut buf = BytesMut::new();
        while let Some(chunk) = reader.next_chunk()? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Read the whole body and decode it with the announced charset
    pub fn text(self) -> Result<String> {
        let charset = self.charset;
        let bytes = self.bytes()?;
        Ok(charset.decode(&bytes))
    }

    /// Iterate over the lines of the body
    pub fn lines(mut self) -> Result<Lines> {
        let emitter = self.take()?;
        let pull = Pull::new();
        emitter.subscribe(Box::new(flow::lines(Box::new(pull.subscriber()), self.charset)));
        Ok(Lines::new(pull))
    }

    /// Read and drop the body so the connection can be reused
    pub fn discard(self) -> Result<()> {
        let mut reader = self.reader()?;
        while reader.next_chunk()?.is_some() {}
        Ok(())
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        if let Some(emitter) = self.emitter.take() {
            emitter.abandon();
        }
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBody")
            .field("consumed", &self.emitter.is_none())
            .field("charset", &self.charset)
            .finish()
    }
}

/// HTTP response
#[derive(Debug)]
pub struct Response {
    pub(crate) status: Status,
    pub(crate) version: Version,
    pub(crate) headers: Headers,
    pub(crate) uri: Uri,
    pub(crate) request: Request,
    pub(crate) previous: Option<Box<Response>>,
    pub(crate) ssl_session: Option<SslSessionInfo>,
    pub(crate) body: ResponseBody,
}

impl Response {
    /// Get the status
    pub fn status(&self) -> Status {
        self.status
    }

    /// Protocol version the response was received with
    pub fn version(&self) -> Version {
        self.version
    }

    /// Get the headers
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// URI that produced this response, after redirects
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Request actually sent for this response
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Response that led to this one through a redirect or challenge
    ///
    /// Previous responses carry no body.
    pub fn previous_response(&self) -> Option<&Response> {
        self.previous.as_deref()
    }

    /// Iterate from this response back through all previous ones
    pub fn chain(&self) -> impl Iterator<Item = &Response> {
        std::iter::successors(Some(self), |r| r.previous_response())
    }

    /// TLS session details for HTTPS responses
    pub fn ssl_session(&self) -> Option<&SslSessionInfo> {
        self.ssl_session.as_ref()
    }

    /// Get the body
    pub fn body(&mut self) -> &mut ResponseBody {
        &mut self.body
    }

    /// Take the body, leaving an empty one behind
    pub fn take_body(&mut self) -> ResponseBody {
        std::mem::replace(&mut self.body, ResponseBody::empty())
    }

    /// Consume the response, keeping the body
    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    /// Strip the body for use as a previous response
    pub(crate) fn into_previous(mut self) -> Response {
        // Replacing drops the old body, cancelling whatever is left of it
        self.body = ResponseBody::empty();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::flow::body;

    #[test]
    fn test_method_from_str() {
        assert_eq!(Method::from_str("GET").unwrap(), Method::Get);
        assert_eq!(Method::from_str("PATCH").unwrap(), Method::Patch);
        assert!(Method::from_str("get").is_err());
    }

    #[test]
    fn test_idempotent_methods() {
        assert!(Method::Get.is_idempotent());
        assert!(Method::Put.is_idempotent());
        assert!(!Method::Post.is_idempotent());
        assert!(!Method::Patch.is_idempotent());
    }

    #[test]
    fn test_version_from_str() {
        assert_eq!(Version::from_str("HTTP/1.1").unwrap(), Version::Http11);
        assert_eq!(Version::from_str("HTTP/2").unwrap(), Version::Http2);
        assert!(Version::from_str("HTTP/3").is_err());
    }

    #[test]
    fn test_status() {
        let status = Status::new(302).unwrap();
        assert!(status.is_redirection());
        assert_eq!(status.to_string(), "302 Found");
        assert!(Status::new(99).is_err());
        assert!(Status::new(600).is_err());
        assert!(Status::new(204).unwrap().is_success());
        assert!(Status::new(404).unwrap().is_client_error());
        assert!(Status::new(503).unwrap().is_server_error());
        assert!(!Status::new(503).unwrap().is_client_error());
    }

    #[test]
    fn test_request_builder() {
        let request = Request::builder()
            .uri("http://example.com/path?q=1")
            .post(body::text("payload"))
            .header("X-Test", "1")
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();

        assert_eq!(request.method(), Method::Post);
        assert_eq!(request.uri().path(), "/path");
        assert_eq!(request.headers().get("x-test"), Some("1"));
        assert_eq!(request.body().and_then(|b| b.content_length()), Some(7));
        assert_eq!(request.timeout(), Some(Duration::from_secs(5)));

        let replaced = Request::builder()
            .uri_parsed(Uri::parse("http://example.com/a%20b").unwrap())
            .header("Accept", "text/plain")
            .set_header("accept", "application/json")
            .build()
            .unwrap();
        assert_eq!(replaced.method(), Method::Get);
        assert_eq!(replaced.uri().path(), "/a%20b");
        assert_eq!(replaced.headers().get_all("Accept"), vec!["application/json"]);
    }

    #[test]
    fn test_request_builder_rejects() {
        assert!(Request::builder().build().is_err());
        assert!(Request::builder().uri("ftp://example.com/").build().is_err());
        assert!(Request::builder()
            .uri("http://example.com/")
            .header("Host", "other")
            .build()
            .is_err());
        assert!(Request::builder()
            .uri("http://example.com/")
            .header("X-Bad", "a\r\nb")
            .build()
            .is_err());
        assert!(Request::builder()
            .uri("http://example.com/")
            .timeout(Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn test_redirected_strips_authorization_cross_origin() {
        let request = Request::builder()
            .uri("http://a.example/")
            .header("Authorization", "Basic eDp5")
            .build()
            .unwrap();

        let same = request.redirected(Method::Get, Uri::parse("http://a.example/x").unwrap(), false);
        assert!(same.headers().contains("Authorization"));

        let other = request.redirected(Method::Get, Uri::parse("http://b.example/").unwrap(), false);
        assert!(!other.headers().contains("Authorization"));
    }

    #[test]
    fn test_response_body_consumed_once() {
        let mut body = ResponseBody::empty();
        assert!(body.take().is_ok());
        assert!(body.take().is_err());
    }

    #[test]
    fn test_response_body_text_charset() {
        let emitter = Emitter::new();
        emitter.push(Bytes::from_static(&[0x63, 0x61, 0x66, 0xE9]));
        emitter.complete();
        let body = ResponseBody::new(emitter, Charset::iso_8859_1());
        assert_eq!(body.text().unwrap(), "café");
    }

    #[test]
    fn test_response_body_lines() {
        let emitter = Emitter::new();
        emitter.push(Bytes::from_static(b"a\nb\r\n"));
        emitter.push(Bytes::from_static(b"c"));
        emitter.complete();
        let body = ResponseBody::new(emitter, Charset::utf8());
        let lines: Vec<String> = body.lines().unwrap().map(|l| l.unwrap()).collect();
        assert_eq!(lines, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_dropping_body_cancels() {
        let emitter: Arc<Emitter<Bytes>> = Emitter::new();
        let body = ResponseBody::new(Arc::clone(&emitter), Charset::utf8());
        drop(body);
        assert!(emitter.is_cancelled());
    }
}
