//! HTTP/1.1 exchange on one connection
//!
//! A connection carries one exchange at a time. The request head and body
//! are written on the caller's thread; once the response head is parsed the
//! body is pumped into a bounded [`Emitter`] by a dedicated thread, which
//! hands the connection back through the release callback as soon as the
//! last body byte was read.

use super::chunked::{chunk_header, ChunkedDecoder, Decoded, LAST_CHUNK};
use super::connection::{ConnectionState, Failure, ResponseParts, Route, StateCell, Transport};
use super::flow::{Body, Charset, Emitter, Pull};
use super::h2::{H2Connection, H2Options};
use super::message::{Method, Request, ResponseBody, Status, Version};
use super::parser::{ResponseHead, ResponseParser};
use super::session::{self, HttpSession, SessionOps};
use super::timeout::{CancelToken, Deadline};
use super::tls::SslSessionInfo;
use super::{Error, Headers, LengthMismatch, Result, CRLF};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Read slice of the body pump; cancellation is noticed within one slice
const PUMP_SLICE: Duration = Duration::from_millis(100);

/// Body chunks buffered ahead of the consumer
const BODY_QUEUE: usize = 16;

const READ_SIZE: usize = 16 * 1024;

/// Hands a connection back once its exchange is complete
pub(crate) type Release = Box<dyn FnOnce(H1Connection) + Send>;

/// Connection speaking HTTP/1.1
pub(crate) struct H1Connection {
    session: HttpSession<Box<dyn SessionOps>>,
    /// Bytes read past the end of the previous message
    buffered: BytesMut,
    ssl: Option<SslSessionInfo>,
    route: Route,
    state: StateCell,
    idle_since: Instant,
    exchanges: u64,
}

impl H1Connection {
    pub(crate) fn new(transport: Transport) -> Self {
        H1Connection {
            session: HttpSession::new(transport.session),
            buffered: BytesMut::new(),
            ssl: transport.ssl,
            route: transport.route,
            state: StateCell::new(ConnectionState::Active),
            idle_since: Instant::now(),
            exchanges: 0,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Mark idle; called when the connection enters the pool
    pub(crate) fn park(&mut self) {
        self.state.set(ConnectionState::Idle);
        self.idle_since = Instant::now();
    }

    /// Claim an idle connection for an exchange
    pub(crate) fn claim(&self) -> bool {
        self.state.transition(ConnectionState::Idle, ConnectionState::Active)
    }

    /// Claim an idle connection for closing
    pub(crate) fn evict(&self) -> bool {
        self.state.transition(ConnectionState::Idle, ConnectionState::Closed)
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.idle_since.elapsed()
    }

    /// Whether the peer closed or sent something while nobody was asking
    pub(crate) fn is_stale(&self) -> bool {
        !self.buffered.is_empty() || self.session.is_stale()
    }

    fn close(mut self) {
        self.state.set(ConnectionState::Closed);
        let _ = self.session.close();
    }
}

/// One request to run on an [`H1Connection`]
pub(crate) struct Exchange<'a> {
    pub request: &'a Request,
    /// Headers added by the client (cookies, credentials)
    pub extra: &'a Headers,
    pub deadline: Deadline,
    /// Offer `Upgrade: h2c` with these options
    pub upgrade: Option<H2Options>,
    /// Shuts the socket down while the request is written or the head awaited
    pub cancel: &'a CancelToken,
}

pub(crate) enum Outcome {
    Http1(ResponseParts),
    /// The server switched protocols; the response arrived on stream 1
    Upgraded(Arc<H2Connection>, ResponseParts),
}

/// Failure on an exchange; connection-level errors before any response
/// byte was read leave the request unprocessed
fn failure(error: Error, response_started: bool) -> Failure {
    let unprocessed = matches!(error, Error::Io(_) | Error::ConnectionClosed);
    if unprocessed && !response_started {
        Failure::retryable(error)
    } else {
        Failure::fatal(error.into_request_timeout())
    }
}

/// Run `exchange` on `conn`
///
/// The connection is consumed: it is either handed to `release` after the
/// response body ends, upgraded to HTTP/2, or closed.
pub(crate) fn exchange(
    mut conn: H1Connection,
    exchange: &Exchange<'_>,
    release: Release,
) -> std::result::Result<Outcome, Failure> {
    conn.exchanges += 1;
    conn.session.set_timeout(None);
    conn.session.set_deadline(exchange.deadline.instant());

    let request = exchange.request;
    let interrupt = session::interrupt_on_cancel(exchange.cancel, conn.session.get_ref().raw_fd());
    let sent = send_and_read_head(&mut conn, exchange);
    drop(interrupt);
    let head = match sent {
        _ if exchange.cancel.is_cancelled() => {
            conn.close();
            return Err(Failure::fatal(Error::Cancelled));
        }
        Ok(head) => head,
        Err(failure) => {
            conn.close();
            return Err(failure);
        }
    };
    debug!(status = head.status.code(), version = %head.version, "HTTP/1.1 response head");

    if head.status == Status::SWITCHING_PROTOCOLS {
        let Some(options) = exchange.upgrade else {
            conn.close();
            return Err(Failure::fatal(Error::Protocol(
                "unsolicited 101 Switching Protocols".to_string(),
            )));
        };
        return upgrade(conn, options, exchange.deadline, exchange.cancel);
    }

    let framing = match framing(request.method, &head) {
        Ok(framing) => framing,
        Err(error) => {
            conn.close();
            return Err(Failure::fatal(error));
        }
    };
    let keep_alive = keep_alive(&head) && framing != Framing::UntilClose;
    let charset = Charset::from_content_type(head.headers.get("Content-Type"));
    let ssl = conn.ssl.clone();
    let parts = |body: ResponseBody| ResponseParts {
        status: head.status,
        version: head.version,
        headers: head.headers.clone(),
        body,
        ssl,
    };

    if framing == Framing::Empty {
        finish(conn, keep_alive, release);
        return Ok(Outcome::Http1(parts(ResponseBody::empty())));
    }

    let emitter = Emitter::bounded(BODY_QUEUE);
    let pump = BodyPump {
        conn,
        emitter: Arc::clone(&emitter),
        framing,
        keep_alive,
    };
    let spawned = thread::Builder::new()
        .name("vclient-h1-body".to_string())
        .spawn(move || pump.run(release));
    if let Err(e) = spawned {
        return Err(Failure::fatal(Error::Io(e)));
    }
    Ok(Outcome::Http1(parts(ResponseBody::new(emitter, charset))))
}

/// Write the request and parse the response head
fn send_and_read_head(conn: &mut H1Connection, exchange: &Exchange<'_>) -> std::result::Result<ResponseHead, Failure> {
    let request = exchange.request;
    let declared = request.body.as_ref().and_then(|b| b.content_length());
    let head = request_head(request, exchange.extra, conn.route, declared, exchange.upgrade.is_some());
    trace!(method = %request.method, uri = %request.uri, "writing HTTP/1.1 request");

    conn.session
        .write_all(head.as_bytes())
        .map_err(|error| failure(error, false))?;
    if let Some(body) = &request.body {
        write_body(&mut conn.session, body, declared, exchange.deadline).map_err(|error| failure(error, false))?;
    }
    read_head(conn, exchange.upgrade.is_some()).map_err(|(error, started)| failure(error, started))
}

fn finish(mut conn: H1Connection, keep_alive: bool, release: Release) {
    if keep_alive && conn.buffered.is_empty() {
        conn.session.set_deadline(None);
        release(conn);
    } else {
        conn.close();
    }
}

/// Serialize the request line and headers
fn request_head(
    request: &Request,
    extra: &Headers,
    route: Route,
    declared: Option<u64>,
    upgrade: bool,
) -> String {
    let uri = &request.uri;
    let target = match route {
        Route::Forward => uri.absolute_target(),
        _ => uri.request_target(),
    };
    let mut head = format!("{} {} HTTP/1.1{}", request.method, target, CRLF);
    head.push_str(&format!("Host: {}{}", uri.authority(), CRLF));
    for (name, value) in request.headers.iter().chain(extra.iter()) {
        head.push_str(&format!("{}: {}{}", name, value, CRLF));
    }

    match (&request.body, declared) {
        (Some(_), Some(length)) => head.push_str(&format!("Content-Length: {}{}", length, CRLF)),
        (Some(_), None) => head.push_str(&format!("Transfer-Encoding: chunked{}", CRLF)),
        (None, _) if matches!(request.method, Method::Post | Method::Put | Method::Patch) => {
            head.push_str(&format!("Content-Length: 0{}", CRLF))
        }
        (None, _) => {}
    }

    if upgrade {
        let settings = H2Connection::local_settings().encode_payload();
        head.push_str(&format!("Connection: Upgrade, HTTP2-Settings{}", CRLF));
        head.push_str(&format!("Upgrade: h2c{}", CRLF));
        head.push_str(&format!("HTTP2-Settings: {}{}", URL_SAFE_NO_PAD.encode(settings), CRLF));
    }
    head.push_str(CRLF);
    head
}

/// Stream the request body, checking it against the declared length
fn write_body<S: SessionOps>(
    session: &mut HttpSession<S>,
    body: &Body,
    declared: Option<u64>,
    deadline: Deadline,
) -> Result<()> {
    let pull = Pull::new();
    body.subscribe(Box::new(pull.subscriber()));
    let mut sent = 0u64;
    loop {
        let chunk = match pull.next(deadline.instant()) {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(error) => {
                pull.close();
                return Err(error.into_request_timeout());
            }
        };
        sent += chunk.len() as u64;
        if let Some(declared) = declared {
            if sent > declared {
                pull.close();
                return Err(Error::BodyLengthMismatch(LengthMismatch {
                    declared,
                    actual: sent,
                }));
            }
        }
        if chunk.is_empty() {
            continue;
        }
        let written = match declared {
            Some(_) => session.write_all(&chunk),
            None => {
                let mut framed = BytesMut::with_capacity(chunk.len() + 16);
                framed.extend_from_slice(chunk_header(chunk.len()).as_bytes());
                framed.extend_from_slice(&chunk);
                framed.extend_from_slice(CRLF.as_bytes());
                session.write_all(&framed)
            }
        };
        if let Err(error) = written {
            pull.close();
            return Err(error);
        }
    }

    match declared {
        Some(declared) if sent < declared => Err(Error::BodyLengthMismatch(LengthMismatch {
            declared,
            actual: sent,
        })),
        Some(_) => Ok(()),
        None => session.write_all(LAST_CHUNK),
    }
}

/// Read the final response head, skipping interim 1xx heads
///
/// The error carries whether any response byte had arrived.
fn read_head(
    conn: &mut H1Connection,
    upgrading: bool,
) -> std::result::Result<ResponseHead, (Error, bool)> {
    let mut parser = ResponseParser::new();
    let mut started = !conn.buffered.is_empty();
    let mut pending = conn.buffered.split().freeze();
    let mut buf = vec![0u8; READ_SIZE];
    loop {
        let parsed = parser.parse(&pending).map_err(|e| (e, true))?;
        pending = Bytes::new();
        if let Some(head) = parsed {
            let code = head.status.code();
            if head.status.is_informational() && !(code == 101 && upgrading) {
                trace!(status = code, "skipping interim response");
                parser.reset();
                continue;
            }
            conn.buffered.extend_from_slice(&parser.take_remaining());
            return Ok(head);
        }

        let n = conn.session.read(&mut buf).map_err(|e| (e, started))?;
        if n == 0 {
            let error = if started {
                Error::io(io::ErrorKind::UnexpectedEof, "connection closed in response head")
            } else {
                Error::ConnectionClosed
            };
            return Err((error, started));
        }
        started = true;
        pending = Bytes::copy_from_slice(&buf[..n]);
    }
}

fn upgrade(
    conn: H1Connection,
    options: H2Options,
    deadline: Deadline,
    cancel: &CancelToken,
) -> std::result::Result<Outcome, Failure> {
    let H1Connection {
        session, buffered, ..
    } = conn;
    debug!("server accepted h2c upgrade");
    let (h2, pending) = H2Connection::from_upgrade(session.into_inner(), &buffered, options, deadline)
        .map_err(Failure::fatal)?;
    let parts = pending.wait(deadline, cancel)?;
    Ok(Outcome::Upgraded(h2, parts))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

fn framing(method: Method, head: &ResponseHead) -> Result<Framing> {
    let code = head.status.code();
    if method == Method::Head || head.status.is_informational() || code == 204 || code == 304 {
        return Ok(Framing::Empty);
    }
    if head.headers.has_token("Transfer-Encoding", "chunked") {
        return Ok(Framing::Chunked);
    }
    match head.headers.content_length()? {
        Some(0) => Ok(Framing::Empty),
        Some(length) => Ok(Framing::Length(length)),
        None => Ok(Framing::UntilClose),
    }
}

fn keep_alive(head: &ResponseHead) -> bool {
    if head.headers.has_token("Connection", "close") {
        return false;
    }
    match head.version {
        Version::Http10 => head.headers.has_token("Connection", "keep-alive"),
        _ => true,
    }
}

/// Moves response body bytes from the socket into the emitter
struct BodyPump {
    conn: H1Connection,
    emitter: Arc<Emitter<Bytes>>,
    framing: Framing,
    keep_alive: bool,
}

enum PumpEnd {
    Complete,
    Cancelled,
}

impl BodyPump {
    fn run(mut self, release: Release) {
        self.conn.session.set_deadline(None);
        self.conn.session.set_timeout(Some(PUMP_SLICE));
        let outcome = self.pump();
        let BodyPump {
            conn,
            emitter,
            keep_alive,
            ..
        } = self;
        match outcome {
            Ok(PumpEnd::Complete) => {
                // The connection goes back before the consumer learns the body ended
                finish(conn, keep_alive, release);
                emitter.complete();
            }
            Ok(PumpEnd::Cancelled) => {
                trace!("response body cancelled, closing connection");
                conn.close();
            }
            Err(error) => {
                debug!(%error, "response body failed");
                conn.close();
                emitter.fail(error.into_body_error());
            }
        }
    }

    fn pump(&mut self) -> Result<PumpEnd> {
        match self.framing {
            Framing::Empty => Ok(PumpEnd::Complete),
            Framing::Length(length) => self.pump_length(length),
            Framing::Chunked => self.pump_chunked(),
            Framing::UntilClose => self.pump_until_close(),
        }
    }

    /// Next bytes from the socket; `None` on EOF
    fn read_some(&mut self) -> Result<Option<Bytes>> {
        let mut buf = vec![0u8; READ_SIZE];
        loop {
            if self.emitter.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self.conn.session.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(Some(Bytes::from(buf)));
                }
                Err(Error::Timeout) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn emit(&self, data: Bytes) -> bool {
        data.is_empty() || self.emitter.push(data)
    }

    fn pump_length(&mut self, length: u64) -> Result<PumpEnd> {
        let mut remaining = length;
        while remaining > 0 {
            let data = if self.conn.buffered.is_empty() {
                match self.read_some() {
                    Ok(Some(data)) => data,
                    Ok(None) => {
                        return Err(Error::io(
                            io::ErrorKind::UnexpectedEof,
                            format!("EOF reached while reading body, {} bytes missing", remaining),
                        ))
                    }
                    Err(Error::Cancelled) => return Ok(PumpEnd::Cancelled),
                    Err(e) => return Err(e),
                }
            } else {
                self.conn.buffered.split().freeze()
            };
            let mut data = data;
            if data.len() as u64 > remaining {
                let extra = data.split_off(remaining as usize);
                self.conn.buffered.extend_from_slice(&extra);
            }
            remaining -= data.len() as u64;
            if !self.emit(data) {
                return Ok(PumpEnd::Cancelled);
            }
        }
        Ok(PumpEnd::Complete)
    }

    fn pump_chunked(&mut self) -> Result<PumpEnd> {
        let mut decoder = ChunkedDecoder::new();
        loop {
            match decoder.decode(&mut self.conn.buffered)? {
                Decoded::Data(data) => {
                    if !self.emit(data) {
                        return Ok(PumpEnd::Cancelled);
                    }
                }
                Decoded::Done => return Ok(PumpEnd::Complete),
                Decoded::NeedMore => match self.read_some() {
                    Ok(Some(data)) => self.conn.buffered.extend_from_slice(&data),
                    Ok(None) => {
                        return Err(Error::io(
                            io::ErrorKind::UnexpectedEof,
                            "EOF reached while reading chunked body",
                        ))
                    }
                    Err(Error::Cancelled) => return Ok(PumpEnd::Cancelled),
                    Err(e) => return Err(e),
                },
            }
        }
    }

    fn pump_until_close(&mut self) -> Result<PumpEnd> {
        let leftover = self.conn.buffered.split().freeze();
        if !self.emit(leftover) {
            return Ok(PumpEnd::Cancelled);
        }
        loop {
            match self.read_some() {
                Ok(Some(data)) => {
                    if !self.emit(data) {
                        return Ok(PumpEnd::Cancelled);
                    }
                }
                Ok(None) => return Ok(PumpEnd::Complete),
                Err(Error::Cancelled) => return Ok(PumpEnd::Cancelled),
                Err(e) => return Err(e),
            }
        }
    }
}
