//! Minimal HTTP/2 fixture server
//!
//! Speaks just enough HTTP/2 to drive the client in tests: the preface with
//! prior knowledge or the `h2c` upgrade, configurable SETTINGS, HPACK,
//! CONTINUATION, PING and WINDOW_UPDATE replenishment. Response bodies are
//! sent as far as the client's receive windows allow.
//!
//! Responses can be held back until the test releases them, which makes
//! the number of concurrently open streams observable and deterministic.

use super::codec::FrameCodec;
use super::error::{Error as H2Error, ErrorCode};
use super::frames::*;
use super::settings::Settings;
use super::{CONNECTION_PREFACE, CONNECTION_STREAM_ID, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE};
use crate::http::parser::RequestParser;
use crate::http::server::Acceptor;
use crate::http::session::{FdSessionOps, HttpSession, SessionOps};
use crate::http::tls::TlsConfig;
use crate::http::{Error, Headers, Result};
use base64::Engine;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Request received on one stream
#[derive(Debug, Clone)]
pub struct H2Request {
    pub stream_id: u32,
    pub method: String,
    pub scheme: String,
    pub authority: String,
    pub path: String,
    pub headers: Headers,
    pub body: Bytes,
}

/// Response for one stream
#[derive(Debug, Clone)]
pub struct H2Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl H2Response {
    pub fn new(status: u16) -> Self {
        H2Response {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn ok(body: impl Into<Bytes>) -> Self {
        H2Response::new(200).body(body)
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

type Handler = dyn Fn(&H2Request) -> H2Response + Send + Sync;

struct State {
    handler: Box<Handler>,
    settings: Settings,
    tls: Option<TlsConfig>,
    /// Answer this many requests per connection, then send GOAWAY
    goaway_after: Option<usize>,
    held: AtomicBool,
    open_streams: AtomicUsize,
    max_open_streams: AtomicUsize,
    requests: AtomicUsize,
    upgrades: AtomicUsize,
    /// Response body bytes waiting for client window
    unsent: AtomicUsize,
    received: Mutex<Vec<H2Request>>,
}

impl State {
    fn stream_opened(&self) {
        let open = self.open_streams.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_open_streams.fetch_max(open, Ordering::AcqRel);
    }

    fn stream_closed(&self) {
        self.open_streams.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Builder for [`H2Server`]
pub struct H2ServerBuilder {
    settings: Settings,
    tls: Option<TlsConfig>,
    hold: bool,
    goaway_after: Option<usize>,
}

impl H2ServerBuilder {
    pub fn new() -> Self {
        H2ServerBuilder {
            settings: Settings::new(),
            tls: None,
            hold: false,
            goaway_after: None,
        }
    }

    /// Advertise SETTINGS_MAX_CONCURRENT_STREAMS
    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.settings.max_concurrent_streams = Some(max);
        self
    }

    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.settings.initial_window_size = Some(size);
        self
    }

    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.settings.max_frame_size = Some(size);
        self
    }

    /// Serve over TLS; the config should offer `h2` through ALPN
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Hold complete requests until [`H2Server::release`] is called
    pub fn hold_responses(mut self) -> Self {
        self.hold = true;
        self
    }

    /// Send GOAWAY after answering `n` requests on a connection
    pub fn goaway_after(mut self, n: usize) -> Self {
        self.goaway_after = Some(n);
        self
    }

    pub fn start<F>(self, handler: F) -> Result<H2Server>
    where
        F: Fn(&H2Request) -> H2Response + Send + Sync + 'static,
    {
        self.settings.validate()?;
        let https = self.tls.is_some();
        let state = Arc::new(State {
            handler: Box::new(handler),
            settings: self.settings,
            tls: self.tls,
            goaway_after: self.goaway_after,
            held: AtomicBool::new(self.hold),
            open_streams: AtomicUsize::new(0),
            max_open_streams: AtomicUsize::new(0),
            requests: AtomicUsize::new(0),
            upgrades: AtomicUsize::new(0),
            unsent: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
        });

        let acceptor = {
            let state = Arc::clone(&state);
            Acceptor::spawn("fixture-h2", move |stream, stop| {
                if let Err(e) = accept(stream, &state, stop) {
                    debug!(error = %e, "fixture HTTP/2 connection ended");
                }
            })?
        };
        Ok(H2Server {
            acceptor,
            state,
            https,
        })
    }
}

impl Default for H2ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP/2 fixture server on an ephemeral loopback port
pub struct H2Server {
    acceptor: Acceptor,
    state: Arc<State>,
    https: bool,
}

impl H2Server {
    pub fn builder() -> H2ServerBuilder {
        H2ServerBuilder::new()
    }

    /// Plain server with default SETTINGS
    pub fn start<F>(handler: F) -> Result<H2Server>
    where
        F: Fn(&H2Request) -> H2Response + Send + Sync + 'static,
    {
        H2ServerBuilder::new().start(handler)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    pub fn port(&self) -> u16 {
        self.local_addr().port()
    }

    pub fn uri(&self, path: &str) -> String {
        let scheme = if self.https { "https" } else { "http" };
        format!("{}://127.0.0.1:{}{}", scheme, self.port(), path)
    }

    /// Hold complete requests from now on
    pub fn hold(&self) {
        self.state.held.store(true, Ordering::Release);
    }

    /// Answer every held request and stop holding
    pub fn release(&self) {
        self.state.held.store(false, Ordering::Release);
    }

    /// Streams currently open across all connections
    pub fn open_streams(&self) -> usize {
        self.state.open_streams.load(Ordering::Acquire)
    }

    /// Highest number of streams that were open at the same time
    pub fn max_open_streams(&self) -> usize {
        self.state.max_open_streams.load(Ordering::Acquire)
    }

    pub fn connections(&self) -> usize {
        self.acceptor.connections()
    }

    pub fn request_count(&self) -> usize {
        self.state.requests.load(Ordering::Acquire)
    }

    /// Connections that arrived as an `h2c` upgrade
    pub fn upgrades(&self) -> usize {
        self.state.upgrades.load(Ordering::Acquire)
    }

    pub fn requests(&self) -> Vec<H2Request> {
        self.state.received.lock().clone()
    }

    /// Response body bytes held back because the client's window is closed
    pub fn unsent_body_bytes(&self) -> usize {
        self.state.unsent.load(Ordering::Acquire)
    }

    pub fn stop(&mut self) {
        self.acceptor.stop();
    }
}

fn accept(stream: TcpStream, state: &Arc<State>, stop: &AtomicBool) -> Result<()> {
    let session: Box<dyn SessionOps> = match &state.tls {
        Some(tls) => Box::new(tls.accept(stream)?),
        None => Box::new(FdSessionOps::new(stream)),
    };
    let mut session = HttpSession::new(session);
    session.set_timeout(Some(POLL_INTERVAL));
    let mut conn = ServerConn::new(session, Arc::clone(state));
    let outcome = conn.serve(stop);
    for _ in conn.streams.drain() {
        state.stream_closed();
    }
    for _ in conn.ready.drain(..) {
        state.stream_closed();
    }
    for body in conn.outbound.drain(..) {
        state.unsent.fetch_sub(body.rest.len(), Ordering::AcqRel);
    }
    let _ = conn.session.close();
    outcome
}

#[derive(Default)]
struct Incoming {
    fields: Vec<(String, String)>,
    body: BytesMut,
}

/// Response body still going out on one stream
struct Outbound {
    id: u32,
    rest: Bytes,
    window: i64,
}

struct ServerConn {
    session: HttpSession<Box<dyn SessionOps>>,
    state: Arc<State>,
    codec: FrameCodec,
    encoder: hpack::Encoder<'static>,
    decoder: hpack::Decoder<'static>,
    streams: HashMap<u32, Incoming>,
    /// Complete requests waiting to be answered
    ready: VecDeque<H2Request>,
    continuation: Option<(u32, BytesMut, bool)>,
    answered: usize,
    last_stream_id: u32,
    peer_max_frame: u32,
    peer_initial_window: u32,
    /// Connection send window
    window: i64,
    outbound: VecDeque<Outbound>,
    /// GOAWAY naming this stream goes out once every body is sent
    goaway: Option<u32>,
}

impl ServerConn {
    fn new(session: HttpSession<Box<dyn SessionOps>>, state: Arc<State>) -> Self {
        ServerConn {
            session,
            state,
            codec: FrameCodec::new(),
            encoder: hpack::Encoder::new(),
            decoder: hpack::Decoder::new(),
            streams: HashMap::new(),
            ready: VecDeque::new(),
            continuation: None,
            answered: 0,
            last_stream_id: 0,
            peer_max_frame: DEFAULT_MAX_FRAME_SIZE,
            peer_initial_window: DEFAULT_INITIAL_WINDOW_SIZE,
            window: i64::from(DEFAULT_INITIAL_WINDOW_SIZE),
            outbound: VecDeque::new(),
            goaway: None,
        }
    }

    /// Read more bytes into the codec; false on EOF
    fn fill(&mut self, buf: &mut [u8]) -> Result<Option<bool>> {
        match self.session.read(buf) {
            Ok(0) => Ok(Some(false)),
            Ok(n) => {
                self.codec.feed(&buf[..n]);
                Ok(Some(true))
            }
            Err(Error::Timeout) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn serve(&mut self, stop: &AtomicBool) -> Result<()> {
        let mut buf = vec![0u8; 16 * 1024];
        self.start(&mut buf, stop)?;

        loop {
            if stop.load(Ordering::Acquire) {
                return Ok(());
            }
            while let Some(frame) = self.codec.next_frame(self.local_max_frame())? {
                if !self.handle_frame(frame)? {
                    return Ok(());
                }
            }
            if !self.state.held.load(Ordering::Acquire) && self.goaway.is_none() {
                while let Some(request) = self.ready.pop_front() {
                    self.respond(&request)?;
                    if self.state.goaway_after == Some(self.answered) {
                        self.goaway = Some(request.stream_id);
                        break;
                    }
                }
            }
            if let (Some(last), true) = (self.goaway, self.outbound.is_empty()) {
                let goaway = GoawayFrame::new(last, ErrorCode::NoError, Bytes::new());
                self.session.write_all(&FrameCodec::encode_goaway_frame(&goaway))?;
                debug!(last_stream = last, "fixture sent GOAWAY");
                return Ok(());
            }
            if self.fill(&mut buf)? == Some(false) {
                return Ok(());
            }
        }
    }

    fn local_max_frame(&self) -> u32 {
        self.state.settings.get_max_frame_size()
    }

    /// Preface or `h2c` upgrade, then our SETTINGS
    fn start(&mut self, buf: &mut [u8], stop: &AtomicBool) -> Result<()> {
        let mut head = BytesMut::new();
        loop {
            let seen = head.len().min(CONNECTION_PREFACE.len());
            if head[..seen] != CONNECTION_PREFACE[..seen] {
                return self.upgrade(head, buf, stop);
            }
            if seen == CONNECTION_PREFACE.len() {
                self.codec.feed(&head[seen..]);
                self.send_settings()?;
                return Ok(());
            }
            if stop.load(Ordering::Acquire) {
                return Err(Error::ConnectionClosed);
            }
            match self.session.read(buf) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => head.extend_from_slice(&buf[..n]),
                Err(Error::Timeout) => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn upgrade(&mut self, mut head: BytesMut, buf: &mut [u8], stop: &AtomicBool) -> Result<()> {
        let mut parser = RequestParser::new();
        let request = loop {
            if let Some(request) = parser.parse(&head)? {
                break request;
            }
            head.clear();
            if stop.load(Ordering::Acquire) {
                return Err(Error::ConnectionClosed);
            }
            match self.session.read(buf) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => head.extend_from_slice(&buf[..n]),
                Err(Error::Timeout) => {}
                Err(e) => return Err(e),
            }
        };

        let settings = request
            .headers
            .get("HTTP2-Settings")
            .and_then(|v| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(v.trim()).ok());
        if !request.headers.has_token("Upgrade", "h2c") || settings.is_none() {
            self.session
                .write_all(b"HTTP/1.1 505 HTTP Version Not Supported\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")?;
            return Err(Error::Protocol("fixture only speaks HTTP/2".to_string()));
        }
        if let Some(payload) = settings {
            if let Ok(client) = Settings::decode_payload(&payload) {
                self.apply_settings(&client);
            }
        }

        self.session
            .write_all(b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: h2c\r\n\r\n")?;
        self.state.upgrades.fetch_add(1, Ordering::AcqRel);
        self.send_settings()?;

        let mut rest = BytesMut::from(&parser.take_remaining()[..]);
        while rest.len() < CONNECTION_PREFACE.len() {
            if stop.load(Ordering::Acquire) {
                return Err(Error::ConnectionClosed);
            }
            match self.session.read(buf) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => rest.extend_from_slice(&buf[..n]),
                Err(Error::Timeout) => {}
                Err(e) => return Err(e),
            }
        }
        if !rest.starts_with(CONNECTION_PREFACE) {
            return Err(H2Error::MissingPreface.into());
        }
        self.codec.feed(&rest[CONNECTION_PREFACE.len()..]);

        let authority = request.headers.get("Host").unwrap_or_default().to_string();
        let upgraded = H2Request {
            stream_id: 1,
            method: request.method.as_str().to_string(),
            scheme: "http".to_string(),
            authority,
            path: request.target,
            headers: request.headers,
            body: Bytes::new(),
        };
        self.last_stream_id = 1;
        self.state.stream_opened();
        self.complete(upgraded);
        Ok(())
    }

    fn send_settings(&mut self) -> Result<()> {
        let frame = SettingsFrame::new(self.state.settings.clone());
        self.session.write_all(&FrameCodec::encode_settings_frame(&frame))
    }

    fn apply_settings(&mut self, settings: &Settings) {
        if let Some(size) = settings.max_frame_size {
            self.peer_max_frame = size;
        }
        if let Some(size) = settings.initial_window_size {
            let delta = i64::from(size) - i64::from(self.peer_initial_window);
            for body in &mut self.outbound {
                body.window += delta;
            }
            self.peer_initial_window = size;
        }
    }

    /// Write as much of the queued bodies as the windows allow
    fn send_bodies(&mut self) -> Result<()> {
        let mut out = BytesMut::new();
        for body in &mut self.outbound {
            while !body.rest.is_empty() {
                let room = self.window.min(body.window).max(0) as usize;
                let n = body.rest.len().min(room).min(self.peer_max_frame as usize);
                if n == 0 {
                    break;
                }
                let piece = body.rest.split_to(n);
                self.window -= n as i64;
                body.window -= n as i64;
                self.state.unsent.fetch_sub(n, Ordering::AcqRel);
                let end = body.rest.is_empty();
                out.extend_from_slice(&FrameCodec::encode_data_frame(&DataFrame::new(body.id, piece, end)));
            }
        }
        self.outbound.retain(|body| !body.rest.is_empty());
        if out.is_empty() {
            return Ok(());
        }
        self.session.write_all(&out)
    }

    /// Handle one frame; false when the client is going away
    fn handle_frame(&mut self, frame: Frame) -> Result<bool> {
        trace!(frame = %frame.frame_type, stream = frame.stream_id, "fixture received frame");
        match frame.frame_type {
            FrameType::Headers => {
                let headers = HeadersFrame::decode(&frame)?;
                if headers.stream_id > self.last_stream_id {
                    self.last_stream_id = headers.stream_id;
                    self.state.stream_opened();
                    self.streams.insert(headers.stream_id, Incoming::default());
                }
                let block = BytesMut::from(&headers.header_block[..]);
                if headers.end_headers {
                    self.finish_headers(headers.stream_id, block, headers.end_stream)?;
                } else {
                    self.continuation = Some((headers.stream_id, block, headers.end_stream));
                }
            }
            FrameType::Continuation => {
                let Some((id, mut block, end_stream)) = self.continuation.take() else {
                    return Err(H2Error::Protocol("unexpected CONTINUATION".to_string()).into());
                };
                block.extend_from_slice(&frame.payload);
                if frame.flags.is_end_headers() {
                    self.finish_headers(id, block, end_stream)?;
                } else {
                    self.continuation = Some((id, block, end_stream));
                }
            }
            FrameType::Data => {
                let data = DataFrame::decode(&frame)?;
                if data.flow_len > 0 {
                    let mut out = BytesMut::new();
                    out.extend_from_slice(&FrameCodec::encode_window_update_frame(
                        &WindowUpdateFrame::new(0, data.flow_len as u32),
                    ));
                    if !data.end_stream {
                        out.extend_from_slice(&FrameCodec::encode_window_update_frame(
                            &WindowUpdateFrame::new(data.stream_id, data.flow_len as u32),
                        ));
                    }
                    self.session.write_all(&out)?;
                }
                if let Some(incoming) = self.streams.get_mut(&data.stream_id) {
                    incoming.body.extend_from_slice(&data.data);
                }
                if data.end_stream {
                    self.finish_stream(data.stream_id);
                }
            }
            FrameType::Settings => {
                let settings = SettingsFrame::decode(&frame)?;
                if !settings.ack {
                    self.apply_settings(&settings.settings);
                    self.session
                        .write_all(&FrameCodec::encode_settings_frame(&SettingsFrame::ack()))?;
                }
            }
            FrameType::Ping => {
                let ping = PingFrame::decode(&frame)?;
                if !ping.ack {
                    self.session
                        .write_all(&FrameCodec::encode_ping_frame(&PingFrame::ack(ping.data)))?;
                }
            }
            FrameType::RstStream => {
                let id = frame.stream_id;
                let state = &self.state;
                self.outbound.retain(|body| {
                    if body.id == id {
                        state.unsent.fetch_sub(body.rest.len(), Ordering::AcqRel);
                    }
                    body.id != id
                });
                let before = self.ready.len();
                self.ready.retain(|r| r.stream_id != id);
                if self.streams.remove(&id).is_some() || self.ready.len() < before {
                    self.state.stream_closed();
                }
            }
            FrameType::Goaway => return Ok(false),
            FrameType::WindowUpdate => {
                let update = WindowUpdateFrame::decode(&frame)?;
                let increment = i64::from(update.size_increment);
                if update.stream_id == CONNECTION_STREAM_ID {
                    self.window += increment;
                } else if let Some(body) = self.outbound.iter_mut().find(|b| b.id == update.stream_id) {
                    body.window += increment;
                }
                self.send_bodies()?;
            }
            FrameType::Priority | FrameType::PushPromise => {}
        }
        Ok(true)
    }

    fn finish_headers(&mut self, id: u32, block: BytesMut, end_stream: bool) -> Result<()> {
        let fields = self
            .decoder
            .decode(&block)
            .map_err(|e| H2Error::Compression(format!("{:?}", e)))?;
        if let Some(incoming) = self.streams.get_mut(&id) {
            // Trailers after a body are appended to the header list
            incoming.fields.extend(fields.into_iter().map(|(n, v)| {
                (
                    String::from_utf8_lossy(&n).into_owned(),
                    String::from_utf8_lossy(&v).into_owned(),
                )
            }));
        }
        if end_stream {
            self.finish_stream(id);
        }
        Ok(())
    }

    fn finish_stream(&mut self, id: u32) {
        let Some(incoming) = self.streams.remove(&id) else {
            return;
        };
        let mut request = H2Request {
            stream_id: id,
            method: String::new(),
            scheme: String::new(),
            authority: String::new(),
            path: String::new(),
            headers: Headers::new(),
            body: incoming.body.freeze(),
        };
        for (name, value) in incoming.fields {
            match name.as_str() {
                ":method" => request.method = value,
                ":scheme" => request.scheme = value,
                ":authority" => request.authority = value,
                ":path" => request.path = value,
                _ => request.headers.insert(name, value),
            }
        }
        self.complete(request);
    }

    fn complete(&mut self, request: H2Request) {
        self.state.requests.fetch_add(1, Ordering::AcqRel);
        self.state.received.lock().push(request.clone());
        self.ready.push_back(request);
    }

    fn respond(&mut self, request: &H2Request) -> Result<()> {
        let response = (self.state.handler)(request);
        let id = request.stream_id;

        let status = response.status.to_string();
        let length = response.body.len().to_string();
        let mut fields: Vec<(&[u8], &[u8])> = vec![(&b":status"[..], status.as_bytes())];
        for (name, value) in &response.headers {
            fields.push((name.as_bytes(), value.as_bytes()));
        }
        if request.method != "HEAD" {
            fields.push((&b"content-length"[..], length.as_bytes()));
        }
        let block = Bytes::from(self.encoder.encode(fields));

        let body_follows = !response.body.is_empty() && request.method != "HEAD";
        let mut out = BytesMut::new();
        out.extend_from_slice(&FrameCodec::encode_header_block(
            id,
            &block,
            !body_follows,
            self.peer_max_frame,
        ));
        self.session.write_all(&out)?;
        if body_follows {
            self.state.unsent.fetch_add(response.body.len(), Ordering::AcqRel);
            self.outbound.push_back(Outbound {
                id,
                rest: response.body.clone(),
                window: i64::from(self.peer_initial_window),
            });
            self.send_bodies()?;
        }
        self.answered += 1;
        self.state.stream_closed();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn read_frame(stream: &mut TcpStream, codec: &mut FrameCodec) -> Frame {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame) = codec.next_frame(1 << 20).unwrap() {
                return frame;
            }
            let n = stream.read(&mut buf).unwrap();
            assert!(n > 0, "server closed the connection");
            codec.feed(&buf[..n]);
        }
    }

    #[test]
    fn test_settings_sent_after_preface() {
        let server = H2Server::builder()
            .max_concurrent_streams(7)
            .start(|_| H2Response::ok("unused"))
            .unwrap();

        let mut stream = TcpStream::connect(server.local_addr()).unwrap();
        stream.write_all(CONNECTION_PREFACE).unwrap();
        let mut codec = FrameCodec::new();
        let frame = read_frame(&mut stream, &mut codec);
        assert_eq!(frame.frame_type, FrameType::Settings);
        let settings = SettingsFrame::decode(&frame).unwrap();
        assert_eq!(settings.settings.get_max_concurrent_streams(), Some(7));
    }

    #[test]
    fn test_request_response_round_trip() {
        let server = H2Server::start(|req| H2Response::ok(format!("{} {}", req.method, req.path))).unwrap();

        let mut stream = TcpStream::connect(server.local_addr()).unwrap();
        let mut encoder = hpack::Encoder::new();
        let fields = [(":method", "GET"), (":scheme", "http"), (":authority", "localhost"), (":path", "/hello")];
        let block = encoder.encode(fields.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())));
        let mut out = BytesMut::from(CONNECTION_PREFACE);
        out.extend_from_slice(&FrameCodec::encode_settings_frame(&SettingsFrame::new(Settings::client())));
        out.extend_from_slice(&FrameCodec::encode_header_block(1, &Bytes::from(block), true, 16_384));
        stream.write_all(&out).unwrap();

        let mut codec = FrameCodec::new();
        let mut decoder = hpack::Decoder::new();
        let mut status = None;
        loop {
            let frame = read_frame(&mut stream, &mut codec);
            match frame.frame_type {
                FrameType::Headers => {
                    let headers = HeadersFrame::decode(&frame).unwrap();
                    let fields = decoder.decode(&headers.header_block).unwrap();
                    status = Some(fields[0].1.clone());
                }
                FrameType::Data => {
                    let data = DataFrame::decode(&frame).unwrap();
                    assert_eq!(&data.data[..], b"GET /hello");
                    assert!(data.end_stream);
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(status.as_deref(), Some(&b"200"[..]));
        assert_eq!(server.request_count(), 1);
        assert_eq!(server.requests()[0].authority, "localhost");
    }
}
