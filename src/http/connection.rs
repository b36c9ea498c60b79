//! Transport establishment
//!
//! Opens the socket a pooled connection runs on: TCP connect bounded by the
//! connect budget, an optional CONNECT tunnel through an HTTP proxy, and a
//! TLS handshake whose ALPN result decides between HTTP/1.1 and HTTP/2.
//! Everything is returned as a `Box<dyn SessionOps>` wrapped so the pool's
//! [`ConnectionStats`] see every socket that is opened and closed.

use super::message::{ResponseBody, Status, Version};
use super::parser::{ResponseHead, ResponseParser};
use super::pool::ConnectionStats;
use super::session::{self, FdSessionOps, HttpSession, PollEvents, SessionOps};
use super::timeout::{CancelToken, ConnectBudget, Deadline};
use super::tls::handshake::{self, ClientHandshake};
use super::tls::{SslSessionInfo, TlsConfig, TlsError};
use super::{Error, Headers, Result, Uri, CRLF};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// ALPN offer when HTTP/2 is acceptable
const ALPN_H2: &[&str] = &["h2", "http/1.1"];
const ALPN_HTTP11: &[&str] = &["http/1.1"];

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    /// Pooled, no exchange in flight
    Idle = 1,
    Active = 2,
    /// Shutting down once outstanding streams finish
    Draining = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> ConnectionState {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Idle,
            2 => ConnectionState::Active,
            3 => ConnectionState::Draining,
            _ => ConnectionState::Closed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Idle => "IDLE",
            ConnectionState::Active => "ACTIVE",
            ConnectionState::Draining => "DRAINING",
            ConnectionState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Atomically updated [`ConnectionState`]
///
/// Claiming an idle connection and evicting it both go through
/// `transition(Idle, ..)`, so exactly one of them wins.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: ConnectionState) -> Self {
        StateCell(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move from `from` to `to`; false if the state was not `from`
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Plain HTTP proxy
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Proxy {
    host: String,
    port: u16,
}

impl Proxy {
    pub fn http(host: impl Into<String>, port: u16) -> Proxy {
        Proxy {
            host: host.into(),
            port,
        }
    }

    /// Proxy listening on `addr`
    pub fn from_addr(addr: SocketAddr) -> Proxy {
        Proxy::http(addr.ip().to_string(), addr.port())
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http://{}", self.authority())
    }
}

/// How a request reaches its origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct,
    /// CONNECT tunnel through the proxy, then end-to-end TLS
    Tunnel,
    /// Plain proxy forwarding with absolute-form targets
    Forward,
}

impl Route {
    pub fn select(uri: &Uri, proxy: Option<&Proxy>) -> Route {
        match proxy {
            None => Route::Direct,
            Some(_) if uri.is_https() => Route::Tunnel,
            Some(_) => Route::Forward,
        }
    }
}

/// Protocol plan for a new connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    Http1,
    /// TLS offering `h2` through ALPN
    Alpn,
    /// Plaintext `Upgrade: h2c` on the first request
    Upgrade,
}

impl Negotiation {
    /// Decide how to reach HTTP/2, if at all
    ///
    /// A plaintext request through a forwarding proxy is silently sent as
    /// HTTP/1.1 even when HTTP/2 was preferred. `Upgrade` still reuses a
    /// pooled HTTP/2 connection; the pool only leads a new `h2c` upgrade
    /// with a request that has no body.
    pub fn select(uri: &Uri, route: Route, preference: Version) -> Negotiation {
        if preference != Version::Http2 {
            return Negotiation::Http1;
        }
        match route {
            _ if uri.is_https() => Negotiation::Alpn,
            Route::Forward => Negotiation::Http1,
            _ => Negotiation::Upgrade,
        }
    }
}

/// Outcome of an exchange that did not produce a response
#[derive(Debug)]
pub(crate) struct Failure {
    pub error: Error,
    /// Nothing of the request was processed; it may be resent elsewhere
    pub retryable: bool,
}

impl Failure {
    pub fn fatal(error: Error) -> Failure {
        Failure {
            error,
            retryable: false,
        }
    }

    pub fn retryable(error: Error) -> Failure {
        Failure {
            error,
            retryable: true,
        }
    }
}

impl From<Error> for Failure {
    fn from(error: Error) -> Failure {
        Failure::fatal(error)
    }
}

/// Response head plus a body that may still be streaming
#[derive(Debug)]
pub(crate) struct ResponseParts {
    pub status: Status,
    pub version: Version,
    pub headers: Headers,
    pub body: ResponseBody,
    pub ssl: Option<SslSessionInfo>,
}

/// Session that reports its close to the pool's statistics
pub(crate) struct TrackedSession {
    inner: Box<dyn SessionOps>,
    stats: Arc<ConnectionStats>,
}

impl SessionOps for TrackedSession {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
        self.inner.poll(events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.inner.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }

    fn raw_fd(&self) -> RawFd {
        self.inner.raw_fd()
    }

    fn buffered(&self) -> usize {
        self.inner.buffered()
    }

    fn ssl_info(&self) -> Option<SslSessionInfo> {
        self.inner.ssl_info()
    }
}

impl Drop for TrackedSession {
    fn drop(&mut self) {
        self.stats.record_closed();
    }
}

/// Counts a socket as closed unless ownership moved to a [`TrackedSession`]
struct OpenGuard {
    stats: Arc<ConnectionStats>,
    armed: bool,
}

impl OpenGuard {
    fn new(stats: &Arc<ConnectionStats>) -> OpenGuard {
        stats.record_opened();
        OpenGuard {
            stats: Arc::clone(stats),
            armed: true,
        }
    }

    fn track(mut self, inner: Box<dyn SessionOps>) -> TrackedSession {
        self.armed = false;
        TrackedSession {
            inner,
            stats: Arc::clone(&self.stats),
        }
    }
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        if self.armed {
            self.stats.record_closed();
        }
    }
}

/// Established transport
pub(crate) struct Transport {
    pub session: Box<dyn SessionOps>,
    pub ssl: Option<SslSessionInfo>,
    /// ALPN selected `h2`
    pub h2: bool,
    pub route: Route,
}

/// Everything needed to open one transport
pub(crate) struct ConnectParams<'a> {
    pub uri: &'a Uri,
    pub proxy: Option<&'a Proxy>,
    pub tls: &'a TlsConfig,
    pub negotiation: Negotiation,
    pub budget: ConnectBudget,
    /// `Proxy-Authorization` value for the CONNECT request
    pub proxy_authorization: Option<String>,
    pub stats: &'a Arc<ConnectionStats>,
    pub cancel: &'a CancelToken,
}

/// Open a transport to `params.uri`
pub(crate) fn connect(params: &ConnectParams<'_>) -> Result<Transport> {
    let route = Route::select(params.uri, params.proxy);
    let (host, port) = match params.proxy {
        Some(proxy) => (proxy.host().to_string(), proxy.port()),
        None => (
            params.uri.host_for_connect().to_string(),
            params.uri.port_or_default(),
        ),
    };

    params.cancel.check()?;
    let guard = OpenGuard::new(params.stats);
    let stream = connect_tcp(&host, port, &params.budget)?;

    let interrupt = session::interrupt_on_cancel(params.cancel, stream.as_raw_fd());
    let established = establish(stream, route, params);
    drop(interrupt);
    params.cancel.check()?;
    let (inner, ssl, h2) = established?;

    debug!(
        authority = %params.uri.authority_with_port(),
        proxy = ?params.proxy.map(|p| p.authority()),
        ?route,
        h2,
        "connection established"
    );
    Ok(Transport {
        session: Box::new(guard.track(inner)),
        ssl,
        h2,
        route,
    })
}

type Established = (Box<dyn SessionOps>, Option<SslSessionInfo>, bool);

/// Tunnel and TLS on top of a connected socket
fn establish(stream: TcpStream, route: Route, params: &ConnectParams<'_>) -> Result<Established> {
    if route == Route::Tunnel {
        establish_tunnel(&stream, params)?;
    }
    if params.uri.is_https() {
        let session = tls_handshake(stream, params)?;
        let info = session.info().clone();
        let h2 = info.is_h2();
        Ok((Box::new(session), Some(info), h2))
    } else {
        Ok((Box::new(FdSessionOps::new(stream)), None, false))
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

/// TCP connect to the first address that accepts, within the budget
fn connect_tcp(host: &str, port: u16, budget: &ConnectBudget) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::Unresolved(format!("{}:{}: {}", host, port, e)))?
        .collect();
    if addrs.is_empty() {
        return Err(Error::Unresolved(format!("{}:{}", host, port)));
    }

    let deadline = budget.effective();
    let mut last = None;
    for addr in addrs {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        let target = SockAddr::from(addr);
        let attempt = match deadline.remaining() {
            Some(left) if left.is_zero() => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
            Some(left) => socket.connect_timeout(&target, left),
            None => socket.connect(&target),
        };
        match attempt {
            Ok(()) => {
                socket.set_nodelay(true)?;
                trace!(%addr, "tcp connected");
                return Ok(socket.into());
            }
            Err(e) => {
                let timed_out = is_timeout(&e) || deadline.is_expired();
                let cause = Error::Connect {
                    addr: addr.to_string(),
                    source: e,
                };
                if timed_out {
                    return Err(budget.timeout_error(cause));
                }
                last = Some(cause);
            }
        }
    }
    Err(last.unwrap_or_else(|| Error::Unresolved(format!("{}:{}", host, port))))
}

/// CONNECT request for `uri`'s authority
fn connect_request(uri: &Uri, proxy_authorization: Option<&str>) -> String {
    let authority = uri.authority_with_port();
    let mut wire = format!("CONNECT {} HTTP/1.1{}Host: {}{}", authority, CRLF, authority, CRLF);
    if let Some(value) = proxy_authorization {
        wire.push_str(&format!("Proxy-Authorization: {}{}", value, CRLF));
    }
    wire.push_str(CRLF);
    wire
}

/// Ask the proxy for a tunnel; the stream is left positioned after the reply
fn establish_tunnel(stream: &TcpStream, params: &ConnectParams<'_>) -> Result<()> {
    let session = FdSessionOps::new(stream.try_clone()?);
    let mut session = HttpSession::new(session);
    session.set_deadline(params.budget.effective().instant());

    let wire = connect_request(params.uri, params.proxy_authorization.as_deref());
    let head = match send_connect(&mut session, wire.as_bytes()) {
        Ok(head) => head,
        Err(Error::Timeout) => {
            return Err(params.budget.timeout_error(Error::io(
                io::ErrorKind::TimedOut,
                "proxy did not answer CONNECT",
            )))
        }
        Err(e) => return Err(e),
    };

    let code = head.status.code();
    debug!(proxy = ?params.proxy.map(|p| p.authority()), status = code, "CONNECT answered");
    if (200..300).contains(&code) {
        return Ok(());
    }
    if code == 407 {
        return Err(Error::ProxyAuthRequired(Box::new(head)));
    }
    Err(Error::Handshake(format!(
        "Unable to tunnel through proxy. Proxy returns \"{} {} {}\"",
        head.version, code, head.reason
    )))
}

fn send_connect<S: SessionOps>(session: &mut HttpSession<S>, wire: &[u8]) -> Result<ResponseHead> {
    session.write_all(wire)?;
    // Byte at a time so nothing of the tunnelled stream is consumed
    let mut parser = ResponseParser::new();
    let mut byte = [0u8; 1];
    loop {
        if session.read(&mut byte)? == 0 {
            return Err(Error::ConnectionClosed);
        }
        if let Some(head) = parser.parse(&byte)? {
            return Ok(head);
        }
    }
}

fn tls_handshake(stream: TcpStream, params: &ConnectParams<'_>) -> Result<super::tls::TlsSessionOps> {
    let alpn = match params.negotiation {
        Negotiation::Alpn => ALPN_H2,
        _ => ALPN_HTTP11,
    };
    let handshake = ClientHandshake {
        host: params.uri.host_for_connect(),
        alpn,
        deadline: params.budget.effective().instant(),
    };
    handshake::connect(stream, params.tls, &handshake).map_err(|e| match e {
        TlsError::HandshakeTimeout => params
            .budget
            .timeout_error(Error::io(io::ErrorKind::TimedOut, "TLS handshake timed out")),
        TlsError::HandshakeFailed(msg) => Error::Handshake(msg),
        TlsError::Io(e) => Error::Io(e),
        other => Error::Tls(other),
    })
}

/// Deadline for the connect phase of a request
pub(crate) fn connect_budget(connect_timeout: Option<Duration>, request: Deadline) -> ConnectBudget {
    ConnectBudget::new(connect_timeout, request)
}
