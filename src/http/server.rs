//! HTTP/1.1 fixture server
//!
//! Scripted server used by the integration tests and benchmarks. Every
//! accepted connection runs on its own thread and answers each request with
//! the [`Reply`] the handler returns. Replies can be deliberately broken
//! (truncated bodies, byte-by-byte writes, close-delimited bodies) and can
//! turn the connection into a CONNECT tunnel.

use super::chunked::{self, ChunkedDecoder, Decoded};
use super::parser::{RequestHead, RequestParser};
use super::session::{poll_fds, FdSessionOps, HttpSession, PollEvents, SessionOps};
use super::tls::TlsConfig;
use super::{Error, Headers, Method, Result, Status, Version, CRLF};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// How often blocked fixture threads look at the stop flag
const STOP_POLL: Duration = Duration::from_millis(50);

/// Listening socket plus one thread per accepted connection
///
/// Shared by the HTTP/1.1 and HTTP/2 fixtures.
pub struct Acceptor {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    connections: Arc<AtomicUsize>,
    thread: Option<JoinHandle<()>>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Acceptor {
    /// Bind an ephemeral loopback port and serve each connection with `serve`
    pub fn spawn<F>(name: &str, serve: F) -> Result<Acceptor>
    where
        F: Fn(TcpStream, &AtomicBool) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));
        let connections = Arc::new(AtomicUsize::new(0));
        let workers: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));
        let serve = Arc::new(serve);

        let thread = {
            let stop = Arc::clone(&stop);
            let connections = Arc::clone(&connections);
            let workers = Arc::clone(&workers);
            let name = name.to_string();
            thread::Builder::new()
                .name(format!("{}-accept", name))
                .spawn(move || {
                    for stream in listener.incoming() {
                        if stop.load(Ordering::Acquire) {
                            break;
                        }
                        let stream = match stream {
                            Ok(stream) => stream,
                            Err(e) => {
                                warn!(error = %e, "fixture accept failed");
                                continue;
                            }
                        };
                        connections.fetch_add(1, Ordering::AcqRel);
                        let serve = Arc::clone(&serve);
                        let stop = Arc::clone(&stop);
                        let spawned = thread::Builder::new()
                            .name(name.clone())
                            .spawn(move || serve(stream, &stop));
                        match spawned {
                            Ok(handle) => workers.lock().push(handle),
                            Err(e) => warn!(error = %e, "cannot spawn fixture connection thread"),
                        }
                    }
                })?
        };

        debug!(%addr, name, "fixture server listening");
        Ok(Acceptor {
            addr,
            stop,
            connections,
            thread: Some(thread),
            workers,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Connections accepted so far
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    /// Stop accepting and wait for connection threads to finish
    pub fn stop(&mut self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        // Wake the blocking accept
        let _ = TcpStream::connect(self.addr);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Request as seen by a fixture handler
#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub method: Method,
    /// Request target exactly as sent (origin, absolute or authority form)
    pub target: String,
    pub version: Version,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl ReceivedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Clone)]
enum Framing {
    Length,
    Chunked(Vec<Vec<u8>>),
    /// Announce `declared` bytes, send the body, then close
    Truncated(u64),
    /// No length; the body ends when the connection closes
    UntilClose,
    /// Write these bytes verbatim instead of a formatted response
    Raw(Vec<u8>),
}

/// Scripted response
#[derive(Debug, Clone)]
pub struct Reply {
    status: u16,
    reason: Option<String>,
    version: Version,
    interim: Vec<u16>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    framing: Framing,
    delay: Option<Duration>,
    byte_delay: Option<Duration>,
    close: bool,
    tunnel: Option<SocketAddr>,
}

impl Reply {
    pub fn new(status: u16) -> Self {
        Reply {
            status,
            reason: None,
            version: Version::Http11,
            interim: Vec::new(),
            headers: Vec::new(),
            body: Vec::new(),
            framing: Framing::Length,
            delay: None,
            byte_delay: None,
            close: false,
            tunnel: None,
        }
    }

    /// 200 with a text body
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Reply::new(200).header("Content-Type", "text/plain").body(body)
    }

    /// Redirect to `location`
    pub fn redirect(status: u16, location: &str) -> Self {
        Reply::new(status).header("Location", location)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Answer as HTTP/1.0, which closes the connection afterwards
    pub fn http10(mut self) -> Self {
        self.version = Version::Http10;
        self.close = true;
        self
    }

    /// Send an interim 1xx head first
    pub fn interim(mut self, status: u16) -> Self {
        self.interim.push(status);
        self
    }

    /// Send the body with chunked transfer coding, one chunk per entry
    pub fn chunked<I, C>(mut self, chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Vec<u8>>,
    {
        self.framing = Framing::Chunked(chunks.into_iter().map(Into::into).collect());
        self
    }

    /// Announce a Content-Length of `declared` but send only the body
    pub fn truncated(mut self, declared: u64) -> Self {
        self.framing = Framing::Truncated(declared);
        self.close = true;
        self
    }

    /// Omit the length and close after the body
    pub fn until_close(mut self) -> Self {
        self.framing = Framing::UntilClose;
        self.close = true;
        self
    }

    /// Write `bytes` as the whole response
    pub fn raw(bytes: impl Into<Vec<u8>>) -> Self {
        let mut reply = Reply::new(200);
        reply.framing = Framing::Raw(bytes.into());
        reply
    }

    /// Wait before answering
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Write the response one byte at a time
    pub fn byte_by_byte(mut self, pause: Duration) -> Self {
        self.byte_delay = Some(pause);
        self
    }

    /// Close the connection after this response
    pub fn close(mut self) -> Self {
        self.close = true;
        self
    }

    /// Accept a CONNECT and relay bytes to `target`
    pub fn tunnel(target: SocketAddr) -> Self {
        let mut reply = Reply::new(200).reason("Connection established");
        reply.tunnel = Some(target);
        reply
    }

    fn head_only(&self, request: &ReceivedRequest) -> bool {
        request.method == Method::Head || self.status == 204 || self.status == 304
    }

    /// Serialize for `request`
    fn to_wire(&self, request: &ReceivedRequest) -> Vec<u8> {
        if let Framing::Raw(bytes) = &self.framing {
            return bytes.clone();
        }

        let mut wire = Vec::new();
        for code in &self.interim {
            wire.extend_from_slice(status_line(Version::Http11, *code, None).as_bytes());
            wire.extend_from_slice(CRLF.as_bytes());
        }

        wire.extend_from_slice(status_line(self.version, self.status, self.reason.as_deref()).as_bytes());
        for (name, value) in &self.headers {
            wire.extend_from_slice(format!("{}: {}{}", name, value, CRLF).as_bytes());
        }
        let has = |name: &str| self.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name));
        if self.tunnel.is_none() {
            match &self.framing {
                Framing::Length if !has("Content-Length") => {
                    wire.extend_from_slice(format!("Content-Length: {}{}", self.body.len(), CRLF).as_bytes());
                }
                Framing::Chunked(_) => {
                    wire.extend_from_slice(format!("Transfer-Encoding: chunked{}", CRLF).as_bytes());
                }
                Framing::Truncated(declared) => {
                    wire.extend_from_slice(format!("Content-Length: {}{}", declared, CRLF).as_bytes());
                }
                _ => {}
            }
        }
        if self.close && self.version == Version::Http11 && !has("Connection") {
            wire.extend_from_slice(format!("Connection: close{}", CRLF).as_bytes());
        }
        wire.extend_from_slice(CRLF.as_bytes());

        if !self.head_only(request) && self.tunnel.is_none() {
            match &self.framing {
                Framing::Chunked(chunks) => {
                    let mut encoder = chunked::ChunkedEncoder::new(&mut wire);
                    for chunk in chunks {
                        // Writing into a Vec cannot fail
                        let _ = encoder.write_chunk(chunk);
                    }
                    let _ = encoder.finish();
                }
                _ => wire.extend_from_slice(&self.body),
            }
        }
        wire
    }
}

fn status_line(version: Version, code: u16, reason: Option<&str>) -> String {
    let phrase = match reason {
        Some(reason) => reason.to_string(),
        None => Status::new(code)
            .map(|s| s.reason_phrase().to_string())
            .unwrap_or_default(),
    };
    format!("{} {} {}{}", version.as_str(), code, phrase, CRLF)
}

/// One server-side HTTP/1.1 connection
pub struct ServerConnection<S: SessionOps> {
    session: HttpSession<S>,
    buffer: BytesMut,
}

impl<S: SessionOps> ServerConnection<S> {
    pub fn new(session: S) -> Self {
        let mut session = HttpSession::new(session);
        session.set_timeout(Some(STOP_POLL));
        ServerConnection {
            session,
            buffer: BytesMut::new(),
        }
    }

    /// Read more bytes into the buffer; `None` on EOF or stop
    fn fill(&mut self, stop: &AtomicBool) -> Result<Option<usize>> {
        let mut temp = [0u8; 4096];
        loop {
            if stop.load(Ordering::Acquire) {
                return Ok(None);
            }
            match self.session.read(&mut temp) {
                Ok(0) => return Ok(None),
                Ok(n) => {
                    self.buffer.extend_from_slice(&temp[..n]);
                    return Ok(Some(n));
                }
                Err(Error::Timeout) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Receive the next request head; `None` when the client went away
    pub fn receive_head(&mut self, stop: &AtomicBool) -> Result<Option<RequestHead>> {
        let mut parser = RequestParser::new();
        let mut pending = std::mem::take(&mut self.buffer);
        loop {
            if let Some(head) = parser.parse(&pending)? {
                self.buffer = BytesMut::from(&parser.take_remaining()[..]);
                return Ok(Some(head));
            }
            if self.fill(stop)?.is_none() {
                return Ok(None);
            }
            pending = std::mem::take(&mut self.buffer);
        }
    }

    /// Receive a request body framed by `headers`
    pub fn receive_body(&mut self, headers: &Headers, stop: &AtomicBool) -> Result<Vec<u8>> {
        if headers.has_token("Transfer-Encoding", "chunked") {
            return self.receive_chunked_body(stop);
        }

        let Some(length) = headers.content_length()? else {
            return Ok(Vec::new());
        };
        let length = length as usize;
        while self.buffer.len() < length {
            if self.fill(stop)?.is_none() {
                return Err(Error::ConnectionClosed);
            }
        }
        Ok(self.buffer.split_to(length).to_vec())
    }

    fn receive_chunked_body(&mut self, stop: &AtomicBool) -> Result<Vec<u8>> {
        let mut decoder = ChunkedDecoder::new();
        let mut output = Vec::new();
        loop {
            match decoder.decode(&mut self.buffer)? {
                Decoded::Data(data) => output.extend_from_slice(&data),
                Decoded::Done => return Ok(output),
                Decoded::NeedMore => {
                    if self.fill(stop)?.is_none() {
                        return Err(Error::ConnectionClosed);
                    }
                }
            }
        }
    }

    /// Receive a whole request
    pub fn receive_request(&mut self, stop: &AtomicBool) -> Result<Option<ReceivedRequest>> {
        let Some(head) = self.receive_head(stop)? else {
            return Ok(None);
        };
        let body = if head.method == Method::Connect {
            Vec::new()
        } else {
            self.receive_body(&head.headers, stop)?
        };
        Ok(Some(ReceivedRequest {
            method: head.method,
            target: head.target,
            version: head.version,
            headers: head.headers,
            body,
        }))
    }

    /// Send raw bytes
    pub fn send_bytes(&mut self, wire: &[u8]) -> Result<()> {
        self.session.write_all(wire)
    }

    /// Send `reply`; returns whether the connection stays open
    pub fn send_reply(&mut self, request: &ReceivedRequest, reply: &Reply, stop: &AtomicBool) -> Result<bool> {
        if let Some(delay) = reply.delay {
            thread::sleep(delay);
        }
        let wire = reply.to_wire(request);
        match reply.byte_delay {
            Some(pause) => {
                for byte in &wire {
                    if stop.load(Ordering::Acquire) {
                        return Ok(false);
                    }
                    self.send_bytes(std::slice::from_ref(byte))?;
                    thread::sleep(pause);
                }
            }
            None => self.send_bytes(&wire)?,
        }

        let client_close = request.headers.has_token("Connection", "close")
            || (request.version == Version::Http10 && !request.headers.has_token("Connection", "keep-alive"));
        Ok(!(reply.close || client_close || matches!(reply.framing, Framing::Raw(_))))
    }

    /// Relay bytes between the client and `target` until either side closes
    pub fn relay(&mut self, target: SocketAddr, stop: &AtomicBool) -> Result<()> {
        let mut upstream = TcpStream::connect(target)?;
        if !self.buffer.is_empty() {
            upstream.write_all(&self.buffer)?;
            self.buffer.clear();
        }
        let mut buf = [0u8; 16 * 1024];
        let fds = [
            (self.session.get_ref().raw_fd(), PollEvents::Read),
            (upstream.as_raw_fd(), PollEvents::Read),
        ];
        while !stop.load(Ordering::Acquire) {
            let ready = poll_fds(&fds, Some(STOP_POLL))?;
            if ready[0] || self.session.get_ref().buffered() > 0 {
                let n = self.session.get_mut().read(&mut buf)?;
                if n == 0 {
                    break;
                }
                upstream.write_all(&buf[..n])?;
            }
            if ready[1] {
                let n = upstream.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                self.send_bytes(&buf[..n])?;
            }
        }
        Ok(())
    }

    /// Close the connection
    pub fn close(&mut self) -> Result<()> {
        self.session.close()
    }

    /// Get a reference to the underlying session
    pub fn session(&self) -> &HttpSession<S> {
        &self.session
    }
}

type Handler = dyn Fn(&ReceivedRequest) -> Reply + Send + Sync;

#[derive(Default)]
struct Log {
    requests: Mutex<Vec<ReceivedRequest>>,
}

/// Scripted HTTP/1.1 server on an ephemeral loopback port
pub struct HttpServer {
    acceptor: Acceptor,
    log: Arc<Log>,
    https: bool,
}

impl HttpServer {
    /// Plain HTTP server answering with `handler`
    pub fn start<F>(handler: F) -> Result<HttpServer>
    where
        F: Fn(&ReceivedRequest) -> Reply + Send + Sync + 'static,
    {
        Self::spawn(None, Arc::new(handler))
    }

    /// HTTPS server (built-in certificate) answering with `handler`
    pub fn start_tls<F>(tls: TlsConfig, handler: F) -> Result<HttpServer>
    where
        F: Fn(&ReceivedRequest) -> Reply + Send + Sync + 'static,
    {
        Self::spawn(Some(tls), Arc::new(handler))
    }

    fn spawn(tls: Option<TlsConfig>, handler: Arc<Handler>) -> Result<HttpServer> {
        let log = Arc::new(Log::default());
        let https = tls.is_some();
        let acceptor = {
            let log = Arc::clone(&log);
            Acceptor::spawn("fixture-h1", move |stream, stop| {
                let outcome = match &tls {
                    Some(tls) => match tls.accept(stream) {
                        Ok(session) => serve_connection(session, &*handler, &log, stop),
                        Err(e) => Err(e.into()),
                    },
                    None => serve_connection(FdSessionOps::new(stream), &*handler, &log, stop),
                };
                if let Err(e) = outcome {
                    debug!(error = %e, "fixture connection ended");
                }
            })?
        };
        Ok(HttpServer { acceptor, log, https })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    pub fn port(&self) -> u16 {
        self.local_addr().port()
    }

    /// Absolute URI for `path` on this server
    pub fn uri(&self, path: &str) -> String {
        let scheme = if self.https { "https" } else { "http" };
        format!("{}://127.0.0.1:{}{}", scheme, self.port(), path)
    }

    /// Connections accepted so far
    pub fn connections(&self) -> usize {
        self.acceptor.connections()
    }

    /// Requests received so far
    pub fn request_count(&self) -> usize {
        self.log.requests.lock().len()
    }

    /// Copy of every request received so far
    pub fn requests(&self) -> Vec<ReceivedRequest> {
        self.log.requests.lock().clone()
    }

    pub fn stop(&mut self) {
        self.acceptor.stop();
    }
}

fn serve_connection<S: SessionOps>(session: S, handler: &Handler, log: &Log, stop: &AtomicBool) -> Result<()> {
    let mut conn = ServerConnection::new(session);
    while let Some(request) = conn.receive_request(stop)? {
        log.requests.lock().push(request.clone());
        let reply = handler(&request);

        if let (Method::Connect, Some(target)) = (request.method, reply.tunnel) {
            conn.send_reply(&request, &reply, stop)?;
            conn.relay(target, stop)?;
            break;
        }
        if !conn.send_reply(&request, &reply, stop)? {
            break;
        }
    }
    conn.close()
}
