//! HTTP/2 connection driver
//!
//! One thread per connection owns the transport, both HPACK contexts and all
//! stream state. Callers hand it commands over a channel and wake it through
//! a socket pair, so the driver blocks in a single poll(2) over the transport
//! and the waker.
//!
//! Stream admission happens on the caller's thread under the `Mux` lock:
//! the stream ID is allocated and the open command queued while the lock is
//! held, so streams reach the wire in ID order. The driver releases a slot
//! before it completes the stream's body, so a caller that has just read a
//! full response always finds its slot free again.
//!
//! Receive windows are only replenished for bytes the body consumer has
//! taken, so a slow reader stalls its stream instead of buffering the whole
//! response. Request bodies are throttled the same way: the caller blocks
//! while too much of its body waits in the driver for send window.

use super::codec::FrameCodec;
use super::error::{Error as H2Error, ErrorCode};
use super::flow_control::FlowControl;
use super::frames::*;
use super::settings::Settings;
use super::stream::H2Stream;
use super::{
    CONNECTION_PREFACE, CONNECTION_STREAM_ID, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE,
    MAX_STREAM_ID,
};
use crate::http::client::StreamLimitPolicy;
use crate::http::connection::{ConnectionState, Failure, ResponseParts};
use crate::http::flow::emitter::DemandHooks;
use crate::http::flow::{Body, Charset, Emitter, Pull};
use crate::http::message::{Request, ResponseBody, Status, Version};
use crate::http::session::{poll_fds, HttpSession, PollEvents, SessionOps};
use crate::http::timeout::{CancelToken, Deadline};
use crate::http::tls::SslSessionInfo;
use crate::http::{Error, Headers, LengthMismatch, Result};
use bytes::{Bytes, BytesMut};
use crossbeam_channel::{select, Receiver, Sender, TryRecvError};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Receive window of the whole connection, shared by all streams
const CONNECTION_WINDOW: u32 = 16 * 1024 * 1024;

/// Request body bytes a stream may have queued in the driver
const UPLOAD_BUFFER: usize = 64 * 1024;

/// Per-connection multiplexing options
#[derive(Debug, Clone, Copy)]
pub struct H2Options {
    /// Stream limit assumed until the server announces its own
    pub default_max_streams: u32,
    pub policy: StreamLimitPolicy,
}

/// Response head delivered by the driver
struct Head {
    status: Status,
    headers: Headers,
}

enum Command {
    Open {
        id: u32,
        fields: Vec<(String, String)>,
        end_stream: bool,
        reply: Sender<Result<Head>>,
        emitter: Arc<Emitter<Bytes>>,
        outbox: Option<Arc<Outbox>>,
    },
    Data {
        id: u32,
        data: Bytes,
        end: bool,
    },
    Reset {
        id: u32,
        code: ErrorCode,
    },
    /// The body consumer took the oldest undelivered chunk of a stream
    Delivered {
        id: u32,
    },
    /// Stop opening streams and close once the open ones finish
    Drain,
    Shutdown,
}

/// Sending half of the command channel plus the waker
#[derive(Clone)]
struct Handle {
    commands: Sender<Command>,
    waker: Arc<UnixStream>,
}

impl Handle {
    /// Queue a command; false once the driver is gone
    fn send(&self, command: Command) -> bool {
        if self.commands.send(command).is_err() {
            return false;
        }
        // A full socket buffer means a wakeup is already pending
        let _ = (&*self.waker).write(&[1]);
        true
    }
}

/// Request body bytes waiting in the driver for send window
struct Outbox {
    state: Mutex<OutboxState>,
    drained: Condvar,
}

#[derive(Default)]
struct OutboxState {
    queued: usize,
    /// The stream ended; nothing more will be sent
    closed: bool,
}

impl Outbox {
    fn new() -> Arc<Outbox> {
        Arc::new(Outbox {
            state: Mutex::new(OutboxState::default()),
            drained: Condvar::new(),
        })
    }

    /// Wait until `len` more bytes fit; false once the stream has ended
    fn reserve(&self, len: usize, deadline: Deadline, cancel: &CancelToken) -> Result<bool> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Ok(false);
            }
            cancel.check()?;
            if state.queued == 0 || state.queued + len <= UPLOAD_BUFFER {
                state.queued += len;
                return Ok(true);
            }
            match deadline.instant() {
                Some(at) => {
                    if self.drained.wait_until(&mut state, at).timed_out() && deadline.is_expired() {
                        return Err(Error::RequestTimeout);
                    }
                }
                None => self.drained.wait(&mut state),
            }
        }
    }

    fn sent(&self, len: usize) {
        let mut state = self.state.lock();
        state.queued = state.queued.saturating_sub(len);
        drop(state);
        self.drained.notify_all();
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.drained.notify_all();
    }

    /// Wake a waiting caller without changing anything
    fn nudge(&self) {
        drop(self.state.lock());
        self.drained.notify_all();
    }
}

/// Admission state shared by callers and the driver
struct Mux {
    active: usize,
    next_stream_id: u32,
    limit: usize,
    /// Callers queued for a slot, in arrival order
    waiting: VecDeque<u64>,
    next_ticket: u64,
    going_away: bool,
    closed: bool,
    idle_since: Option<Instant>,
}

struct Shared {
    mux: Mutex<Mux>,
    changed: Condvar,
}

impl Shared {
    fn release_slot(&self) {
        {
            let mut mux = self.mux.lock();
            mux.active = mux.active.saturating_sub(1);
            if mux.active == 0 {
                mux.idle_since = Some(Instant::now());
            }
        }
        self.changed.notify_all();
    }
}

/// Multiplexed HTTP/2 connection
pub struct H2Connection {
    shared: Arc<Shared>,
    handle: Handle,
    policy: StreamLimitPolicy,
    ssl: Option<SslSessionInfo>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// Stream whose response head has not arrived yet
pub struct PendingResponse {
    conn: Arc<H2Connection>,
    id: u32,
    reply: Receiver<Result<Head>>,
    emitter: Arc<Emitter<Bytes>>,
}

impl H2Connection {
    /// Start HTTP/2 on a fresh transport (prior knowledge or ALPN `h2`)
    ///
    /// Sends the preface and waits for the server's SETTINGS within
    /// `deadline`.
    pub fn handshake(
        session: Box<dyn SessionOps>,
        ssl: Option<SslSessionInfo>,
        options: H2Options,
        deadline: Deadline,
    ) -> Result<Arc<H2Connection>> {
        let (conn, _) = Self::start(session, &[], ssl, options, deadline, None)?;
        Ok(conn)
    }

    /// Continue on a connection that accepted `Upgrade: h2c`
    ///
    /// The upgrading request becomes stream 1, already half-closed on our
    /// side. `leftover` holds bytes read past the 101 response.
    pub fn from_upgrade(
        session: Box<dyn SessionOps>,
        leftover: &[u8],
        options: H2Options,
        deadline: Deadline,
    ) -> Result<(Arc<H2Connection>, PendingResponse)> {
        let emitter = Emitter::new();
        let (conn, reply) =
            Self::start(session, leftover, None, options, deadline, Some(Arc::clone(&emitter)))?;
        let reply = reply.ok_or_else(|| Error::IllegalState("upgrade stream missing".to_string()))?;
        emitter.set_hooks(Arc::new(StreamHooks {
            handle: conn.handle.clone(),
            id: 1,
        }));
        let pending = PendingResponse {
            conn: Arc::clone(&conn),
            id: 1,
            reply,
            emitter,
        };
        Ok((conn, pending))
    }

    /// Local SETTINGS, also sent as the `HTTP2-Settings` upgrade header
    pub fn local_settings() -> Settings {
        Settings::client()
    }

    fn start(
        session: Box<dyn SessionOps>,
        leftover: &[u8],
        ssl: Option<SslSessionInfo>,
        options: H2Options,
        deadline: Deadline,
        upgraded: Option<Arc<Emitter<Bytes>>>,
    ) -> Result<(Arc<H2Connection>, Option<Receiver<Result<Head>>>)> {
        let local = Self::local_settings();
        let mut codec = FrameCodec::new();
        codec.feed(leftover);

        let mut session = HttpSession::new(session);
        session.set_deadline(deadline.instant());
        let mut preface = BytesMut::from(CONNECTION_PREFACE);
        preface.extend_from_slice(&FrameCodec::encode_settings_frame(&SettingsFrame::new(
            local.clone(),
        )));
        session.write_all(&preface)?;

        let mut buf = vec![0u8; 16 * 1024];
        let peer = loop {
            if let Some(frame) = codec.next_frame(DEFAULT_MAX_FRAME_SIZE)? {
                if frame.frame_type != FrameType::Settings || frame.flags.is_ack() {
                    return Err(H2Error::Protocol(format!(
                        "expected server SETTINGS, got {}",
                        frame.frame_type
                    ))
                    .into());
                }
                break SettingsFrame::decode(&frame)?.settings;
            }
            let n = session.read(&mut buf)?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            codec.feed(&buf[..n]);
        };
        let session = session.into_inner();

        let limit = peer
            .get_max_concurrent_streams()
            .unwrap_or(options.default_max_streams) as usize;
        debug!(
            limit,
            window = peer.get_initial_window_size(),
            upgraded = upgraded.is_some(),
            "HTTP/2 connection established"
        );

        let shared = Arc::new(Shared {
            mux: Mutex::new(Mux {
                active: usize::from(upgraded.is_some()),
                next_stream_id: if upgraded.is_some() { 3 } else { 1 },
                limit,
                waiting: VecDeque::new(),
                next_ticket: 0,
                going_away: false,
                closed: false,
                idle_since: if upgraded.is_some() { None } else { Some(Instant::now()) },
            }),
            changed: Condvar::new(),
        });

        let (waker_rx, waker_tx) = UnixStream::pair()?;
        waker_rx.set_nonblocking(true)?;
        waker_tx.set_nonblocking(true)?;
        let (commands_tx, commands_rx) = crossbeam_channel::unbounded();

        let mut driver = Driver {
            session,
            codec,
            encoder: hpack::Encoder::new(),
            decoder: hpack::Decoder::new(),
            commands: commands_rx,
            waker: waker_rx,
            shared: Arc::clone(&shared),
            streams: HashMap::new(),
            undelivered: HashMap::new(),
            // Connection windows start at the protocol default regardless of SETTINGS
            flow: FlowControl::new(DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_INITIAL_WINDOW_SIZE),
            peer_initial_window: peer.get_initial_window_size(),
            peer_max_frame: peer.get_max_frame_size(),
            local,
            pending_headers: None,
            out: BytesMut::new(),
        };
        driver
            .out
            .extend_from_slice(&FrameCodec::encode_settings_frame(&SettingsFrame::ack()));
        let widen = CONNECTION_WINDOW - DEFAULT_INITIAL_WINDOW_SIZE;
        driver.flow.recv.increase(widen)?;
        driver.out.extend_from_slice(&FrameCodec::encode_window_update_frame(
            &WindowUpdateFrame::new(CONNECTION_STREAM_ID, widen),
        ));

        let reply = upgraded.map(|emitter| {
            let (tx, rx) = crossbeam_channel::bounded(1);
            let stream = H2Stream::open(
                1,
                driver.peer_initial_window,
                driver.local.get_initial_window_size(),
                true,
            );
            driver.streams.insert(
                1,
                Active {
                    stream,
                    reply: Some(tx),
                    emitter,
                    outbox: None,
                },
            );
            rx
        });

        let thread = thread::Builder::new()
            .name("vclient-h2".to_string())
            .spawn(move || driver.run())?;

        let conn = Arc::new(H2Connection {
            shared,
            handle: Handle {
                commands: commands_tx,
                waker: Arc::new(waker_tx),
            },
            policy: options.policy,
            ssl,
            driver: Mutex::new(Some(thread)),
        });
        Ok((conn, reply))
    }

    /// Send `request` on a new stream and wait for the response head
    ///
    /// `extra` carries headers the client adds itself (cookies,
    /// credentials). The body streams while the response is awaited.
    /// Tripping `cancel` stops any wait and resets the stream.
    pub(crate) fn exchange(
        self: &Arc<Self>,
        request: &Request,
        extra: &Headers,
        deadline: Deadline,
        cancel: &CancelToken,
    ) -> std::result::Result<ResponseParts, Failure> {
        let body = request.body.clone();
        let declared = body.as_ref().and_then(|b| b.content_length());
        let end_stream = body.is_none() || declared == Some(0);
        let fields = request_fields(request, extra, body.as_ref().and(declared));

        let emitter = Emitter::new();
        let outbox = (!end_stream).then(Outbox::new);
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let id = self.open_stream(
            Opening {
                fields,
                end_stream,
                reply: reply_tx,
                emitter: Arc::clone(&emitter),
                outbox: outbox.clone(),
            },
            deadline,
            cancel,
        )?;
        emitter.set_hooks(Arc::new(StreamHooks {
            handle: self.handle.clone(),
            id,
        }));

        if let (Some(body), Some(outbox)) = (&body, &outbox) {
            let wake = {
                let outbox = Arc::clone(outbox);
                cancel.on_cancel(move || outbox.nudge())
            };
            let sent = self.send_body(id, body, declared, outbox, deadline, cancel);
            drop(wake);
            if let Err(error) = sent {
                self.handle.send(Command::Reset {
                    id,
                    code: ErrorCode::Cancel,
                });
                return Err(Failure::fatal(error));
            }
        }

        PendingResponse {
            conn: Arc::clone(self),
            id,
            reply: reply_rx,
            emitter,
        }
        .wait(deadline, cancel)
    }

    fn open_stream(
        &self,
        opening: Opening,
        deadline: Deadline,
        cancel: &CancelToken,
    ) -> std::result::Result<u32, Failure> {
        let wake = {
            let shared = Arc::clone(&self.shared);
            cancel.on_cancel(move || {
                drop(shared.mux.lock());
                shared.changed.notify_all();
            })
        };
        let mut open = Some(opening);
        let mut ticket: Option<u64> = None;
        let mut mux = self.shared.mux.lock();

        let result = loop {
            if mux.closed || mux.going_away || mux.next_stream_id > MAX_STREAM_ID {
                break Err(Failure::retryable(Error::H2(H2Error::ConnectionClosed)));
            }
            if cancel.is_cancelled() {
                break Err(Failure::fatal(Error::Cancelled));
            }

            let first_in_line = match ticket {
                None => mux.waiting.is_empty(),
                Some(t) => mux.waiting.front() == Some(&t),
            };
            if mux.active < mux.limit && first_in_line {
                if ticket.is_some() {
                    mux.waiting.pop_front();
                }
                let Some(opening) = open.take() else {
                    break Err(Failure::fatal(Error::IllegalState("stream opened twice".to_string())));
                };
                let id = mux.next_stream_id;
                let sent = self.handle.send(Command::Open {
                    id,
                    fields: opening.fields,
                    end_stream: opening.end_stream,
                    reply: opening.reply,
                    emitter: opening.emitter,
                    outbox: opening.outbox,
                });
                if !sent {
                    mux.closed = true;
                    break Err(Failure::retryable(Error::H2(H2Error::ConnectionClosed)));
                }
                mux.next_stream_id += 2;
                mux.active += 1;
                mux.idle_since = None;
                trace!(stream = id, active = mux.active, "stream opened");
                break Ok(id);
            }

            if self.policy == StreamLimitPolicy::Reject {
                break Err(Failure::fatal(Error::TooManyStreams));
            }
            if deadline.is_expired() {
                break Err(Failure::fatal(Error::RequestTimeout));
            }
            if ticket.is_none() {
                let t = mux.next_ticket;
                mux.next_ticket += 1;
                mux.waiting.push_back(t);
                ticket = Some(t);
            }
            match deadline.instant() {
                Some(at) => {
                    self.shared.changed.wait_until(&mut mux, at);
                }
                None => self.shared.changed.wait(&mut mux),
            }
        };

        let abandoned = matches!((&result, ticket), (Err(_), Some(_)));
        if let (true, Some(t)) = (abandoned, ticket) {
            mux.waiting.retain(|w| *w != t);
        }
        // The cancel hook takes the mux lock, so it must not be held here
        drop(mux);
        drop(wake);
        if abandoned {
            self.shared.changed.notify_all();
        }
        result
    }

    fn send_body(
        &self,
        id: u32,
        body: &Body,
        declared: Option<u64>,
        outbox: &Outbox,
        deadline: Deadline,
        cancel: &CancelToken,
    ) -> Result<()> {
        let pull = Pull::new();
        body.subscribe(Box::new(pull.subscriber()));
        let mut sent = 0u64;
        loop {
            match pull.next(deadline.instant()) {
                Ok(Some(chunk)) => {
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
                    match outbox.reserve(chunk.len(), deadline, cancel) {
                        Ok(true) => {}
                        Ok(false) => {
                            // The response already ended the stream
                            pull.close();
                            return Ok(());
                        }
                        Err(error) => {
                            pull.close();
                            return Err(error);
                        }
                    }
                    if !self.handle.send(Command::Data {
                        id,
                        data: chunk,
                        end: false,
                    }) {
                        pull.close();
                        return Err(Error::ConnectionClosed);
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    pull.close();
                    return Err(error.into_request_timeout());
                }
            }
        }
        if let Some(declared) = declared {
            if sent < declared {
                return Err(Error::BodyLengthMismatch(LengthMismatch {
                    declared,
                    actual: sent,
                }));
            }
        }
        if !self.handle.send(Command::Data {
            id,
            data: Bytes::new(),
            end: true,
        }) {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    /// Whether new streams may still be opened
    pub fn is_usable(&self) -> bool {
        let mux = self.shared.mux.lock();
        !mux.closed && !mux.going_away
    }

    /// When the last stream finished, if none is open
    pub fn idle_since(&self) -> Option<Instant> {
        let mux = self.shared.mux.lock();
        if mux.active == 0 {
            mux.idle_since
        } else {
            None
        }
    }

    pub fn ssl_info(&self) -> Option<&SslSessionInfo> {
        self.ssl.as_ref()
    }

    /// Lifecycle state as seen by the pool
    pub fn state(&self) -> ConnectionState {
        let mux = self.shared.mux.lock();
        if mux.closed {
            ConnectionState::Closed
        } else if mux.going_away {
            ConnectionState::Draining
        } else if mux.active > 0 {
            ConnectionState::Active
        } else {
            ConnectionState::Idle
        }
    }

    /// Refuse new streams and close after the open ones complete
    pub fn drain(&self) {
        self.handle.send(Command::Drain);
    }

    /// Wait for the driver to exit after [`drain`](H2Connection::drain)
    pub fn wait_closed(&self) {
        if let Some(thread) = self.driver.lock().take() {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }

    /// Send GOAWAY and stop the driver; open streams fail
    pub fn shutdown(&self) {
        self.handle.send(Command::Shutdown);
        if let Some(thread) = self.driver.lock().take() {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for H2Connection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum Received {
    Head(Result<Head>),
    Gone,
    TimedOut,
    Cancelled,
}

impl PendingResponse {
    /// Wait for the response head
    ///
    /// On timeout or cancellation the stream is reset.
    pub(crate) fn wait(
        self,
        deadline: Deadline,
        cancel: &CancelToken,
    ) -> std::result::Result<ResponseParts, Failure> {
        let received = match deadline.remaining() {
            Some(left) => select! {
                recv(self.reply) -> head => head.map_or(Received::Gone, Received::Head),
                recv(cancel.signal()) -> _ => Received::Cancelled,
                default(left) => Received::TimedOut,
            },
            None => select! {
                recv(self.reply) -> head => head.map_or(Received::Gone, Received::Head),
                recv(cancel.signal()) -> _ => Received::Cancelled,
            },
        };

        match received {
            Received::Head(Ok(head)) => {
                let charset = Charset::from_content_type(head.headers.get("content-type"));
                Ok(ResponseParts {
                    status: head.status,
                    version: Version::Http2,
                    headers: head.headers,
                    body: ResponseBody::new(self.emitter, charset),
                    ssl: self.conn.ssl.clone(),
                })
            }
            Received::Head(Err(error)) => {
                let retryable = is_retryable(&error);
                Err(Failure { error, retryable })
            }
            Received::TimedOut => {
                self.reset();
                Err(Failure::fatal(Error::RequestTimeout))
            }
            Received::Cancelled => {
                self.reset();
                Err(Failure::fatal(Error::Cancelled))
            }
            Received::Gone => Err(Failure::retryable(Error::H2(H2Error::ConnectionClosed))),
        }
    }

    fn reset(&self) {
        self.conn.handle.send(Command::Reset {
            id: self.id,
            code: ErrorCode::Cancel,
        });
    }
}

/// Failures after which the request may be sent again elsewhere
fn is_retryable(error: &Error) -> bool {
    match error {
        Error::H2(e) => {
            e.is_unprocessed() || matches!(e, H2Error::ConnectionClosed | H2Error::Io(_))
        }
        Error::Io(_) | Error::ConnectionClosed => true,
        _ => false,
    }
}

fn request_fields(request: &Request, extra: &Headers, length: Option<u64>) -> Vec<(String, String)> {
    let uri = &request.uri;
    let mut fields = vec![
        (":method".to_string(), request.method.as_str().to_string()),
        (":scheme".to_string(), uri.scheme().to_string()),
        (":authority".to_string(), uri.authority()),
        (":path".to_string(), uri.request_target()),
    ];
    for (name, value) in request.headers.iter().chain(extra.iter()) {
        fields.push((name.to_ascii_lowercase(), value.to_string()));
    }
    if let Some(length) = length {
        fields.push(("content-length".to_string(), length.to_string()));
    }
    fields
}

/// Everything the driver needs to start a stream
struct Opening {
    fields: Vec<(String, String)>,
    end_stream: bool,
    reply: Sender<Result<Head>>,
    emitter: Arc<Emitter<Bytes>>,
    outbox: Option<Arc<Outbox>>,
}

/// Reports consumed chunks to the driver and resets the stream when the
/// body consumer cancels
struct StreamHooks {
    handle: Handle,
    id: u32,
}

impl DemandHooks for StreamHooks {
    fn on_delivered(&self) {
        self.handle.send(Command::Delivered { id: self.id });
    }

    fn on_cancel(&self) {
        self.handle.send(Command::Reset {
            id: self.id,
            code: ErrorCode::Cancel,
        });
    }
}

struct Active {
    stream: H2Stream,
    reply: Option<Sender<Result<Head>>>,
    emitter: Arc<Emitter<Bytes>>,
    outbox: Option<Arc<Outbox>>,
}

/// Header block split across HEADERS and CONTINUATION frames
struct PendingHeaders {
    stream_id: u32,
    block: BytesMut,
    end_stream: bool,
}

struct Driver {
    session: Box<dyn SessionOps>,
    codec: FrameCodec,
    encoder: hpack::Encoder<'static>,
    decoder: hpack::Decoder<'static>,
    commands: Receiver<Command>,
    waker: UnixStream,
    shared: Arc<Shared>,
    streams: HashMap<u32, Active>,
    /// Sizes of chunks pushed to a body emitter but not yet consumed
    undelivered: HashMap<u32, VecDeque<usize>>,
    /// Connection-level windows
    flow: FlowControl,
    peer_initial_window: u32,
    peer_max_frame: u32,
    local: Settings,
    pending_headers: Option<PendingHeaders>,
    out: BytesMut,
}

type DriverResult<T> = std::result::Result<T, H2Error>;

fn session_error(error: Error) -> H2Error {
    match error {
        Error::Io(e) => H2Error::Io(e),
        Error::ConnectionClosed => H2Error::ConnectionClosed,
        other => H2Error::Io(io::Error::new(io::ErrorKind::Other, other.to_string())),
    }
}

impl Driver {
    fn run(mut self) {
        let outcome = self.serve();
        self.teardown(outcome.err());
    }

    fn serve(&mut self) -> DriverResult<()> {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            if !self.drain_commands()? {
                return Ok(());
            }
            self.send_pending_data();
            self.flush()?;
            if self.is_drained() {
                debug!("HTTP/2 connection drained after GOAWAY");
                return Ok(());
            }

            let readable = if self.session.buffered() > 0 {
                true
            } else {
                let ready = poll_fds(
                    &[
                        (self.session.raw_fd(), PollEvents::Read),
                        (self.waker.as_raw_fd(), PollEvents::Read),
                    ],
                    None,
                )
                .map_err(session_error)?;
                if ready[1] {
                    let mut sink = [0u8; 64];
                    while matches!(self.waker.read(&mut sink), Ok(n) if n > 0) {}
                }
                ready[0]
            };

            if readable {
                let n = self.session.read(&mut buf).map_err(session_error)?;
                if n == 0 {
                    return Err(H2Error::ConnectionClosed);
                }
                self.codec.feed(&buf[..n]);
                while let Some(frame) = self.codec.next_frame(self.local.get_max_frame_size())? {
                    self.handle_frame(frame)?;
                }
            }
        }
    }

    fn is_drained(&self) -> bool {
        self.streams.is_empty() && self.shared.mux.lock().going_away
    }

    /// Process queued commands; false when the driver should stop
    fn drain_commands(&mut self) -> DriverResult<bool> {
        loop {
            let command = match self.commands.try_recv() {
                Ok(command) => command,
                Err(TryRecvError::Empty) => return Ok(true),
                Err(TryRecvError::Disconnected) => return Ok(false),
            };
            match command {
                Command::Open {
                    id,
                    fields,
                    end_stream,
                    reply,
                    emitter,
                    outbox,
                } => {
                    let block = Bytes::from(
                        self.encoder
                            .encode(fields.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes()))),
                    );
                    self.out.extend_from_slice(&FrameCodec::encode_header_block(
                        id,
                        &block,
                        end_stream,
                        self.peer_max_frame,
                    ));
                    let stream = H2Stream::open(
                        id,
                        self.peer_initial_window,
                        self.local.get_initial_window_size(),
                        end_stream,
                    );
                    self.streams.insert(
                        id,
                        Active {
                            stream,
                            reply: Some(reply),
                            emitter,
                            outbox,
                        },
                    );
                }
                Command::Data { id, data, end } => {
                    if let Some(active) = self.streams.get_mut(&id) {
                        let len = data.len();
                        if let Err(e) = active.stream.queue_data(data, end) {
                            warn!(stream = id, error = %e, "dropping request data");
                            if let Some(outbox) = &active.outbox {
                                outbox.sent(len);
                            }
                        }
                    }
                }
                Command::Reset { id, code } => {
                    // Chunks still queued for the consumer will never be read
                    if let Some(chunks) = self.undelivered.remove(&id) {
                        self.release_connection(chunks.iter().sum())?;
                    }
                    if let Some(active) = self.streams.remove(&id) {
                        trace!(stream = id, %code, "resetting stream");
                        self.out.extend_from_slice(&FrameCodec::encode_rst_stream_frame(
                            &RstStreamFrame::new(id, code),
                        ));
                        self.close_stream(active, Err(Error::Cancelled));
                    }
                }
                Command::Delivered { id } => {
                    let len = self.undelivered.get_mut(&id).and_then(VecDeque::pop_front);
                    if !self.streams.contains_key(&id)
                        && self.undelivered.get(&id).is_some_and(VecDeque::is_empty)
                    {
                        self.undelivered.remove(&id);
                    }
                    if let Some(len) = len {
                        self.release(id, len)?;
                    }
                }
                Command::Drain => {
                    debug!(open = self.streams.len(), "draining HTTP/2 connection");
                    self.shared.mux.lock().going_away = true;
                    self.shared.changed.notify_all();
                }
                Command::Shutdown => return Ok(false),
            }
        }
    }

    fn send_pending_data(&mut self) {
        let mut ids: Vec<u32> = self
            .streams
            .iter()
            .filter(|(_, active)| active.stream.has_pending())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();

        let max_frame = self.peer_max_frame as usize;
        for id in ids {
            let Some(active) = self.streams.get_mut(&id) else {
                continue;
            };
            while let Some((data, end)) = active.stream.next_sendable(&mut self.flow.send, max_frame) {
                if let Some(outbox) = &active.outbox {
                    outbox.sent(data.len());
                }
                self.out
                    .extend_from_slice(&FrameCodec::encode_data_frame(&DataFrame::new(id, data, end)));
                if end {
                    break;
                }
            }
        }
    }

    fn flush(&mut self) -> DriverResult<()> {
        let mut written = 0;
        while written < self.out.len() {
            let n = self.session.write(&self.out[written..]).map_err(session_error)?;
            if n == 0 {
                return Err(H2Error::ConnectionClosed);
            }
            written += n;
        }
        self.out.clear();
        self.session.flush().map_err(session_error)
    }

    fn handle_frame(&mut self, frame: Frame) -> DriverResult<()> {
        if let Some(pending) = &self.pending_headers {
            if frame.frame_type != FrameType::Continuation || frame.stream_id != pending.stream_id {
                return Err(H2Error::Protocol(format!(
                    "expected CONTINUATION on stream {}, got {}",
                    pending.stream_id, frame.frame_type
                )));
            }
        }

        match frame.frame_type {
            FrameType::Data => self.on_data(DataFrame::decode(&frame)?)?,
            FrameType::Headers => {
                let headers = HeadersFrame::decode(&frame)?;
                self.pending_headers = Some(PendingHeaders {
                    stream_id: headers.stream_id,
                    block: BytesMut::from(&headers.header_block[..]),
                    end_stream: headers.end_stream,
                });
                if headers.end_headers {
                    self.finish_headers()?;
                }
            }
            FrameType::Continuation => {
                let Some(pending) = self.pending_headers.as_mut() else {
                    return Err(H2Error::Protocol("unexpected CONTINUATION".to_string()));
                };
                pending.block.extend_from_slice(&frame.payload);
                if frame.flags.is_end_headers() {
                    self.finish_headers()?;
                }
            }
            FrameType::Priority => {}
            FrameType::RstStream => {
                let rst = RstStreamFrame::decode(&frame)?;
                if let Some(mut active) = self.streams.remove(&rst.stream_id) {
                    debug!(stream = rst.stream_id, code = %rst.error_code, "stream reset by peer");
                    active.stream.reset();
                    self.close_stream(
                        active,
                        Err(Error::H2(H2Error::StreamReset {
                            stream_id: rst.stream_id,
                            code: rst.error_code,
                        })),
                    );
                }
            }
            FrameType::Settings => {
                let settings = SettingsFrame::decode(&frame)?;
                if !settings.ack {
                    self.apply_settings(&settings.settings)?;
                    self.out
                        .extend_from_slice(&FrameCodec::encode_settings_frame(&SettingsFrame::ack()));
                }
            }
            FrameType::PushPromise => {
                return Err(H2Error::Protocol(
                    "PUSH_PROMISE received with push disabled".to_string(),
                ));
            }
            FrameType::Ping => {
                let ping = PingFrame::decode(&frame)?;
                if !ping.ack {
                    self.out
                        .extend_from_slice(&FrameCodec::encode_ping_frame(&PingFrame::ack(ping.data)));
                }
            }
            FrameType::Goaway => self.on_goaway(GoawayFrame::decode(&frame)?),
            FrameType::WindowUpdate => self.on_window_update(WindowUpdateFrame::decode(&frame)?)?,
        }
        Ok(())
    }

    fn apply_settings(&mut self, settings: &Settings) -> DriverResult<()> {
        if let Some(size) = settings.initial_window_size {
            for active in self.streams.values_mut() {
                active.stream.flow_mut().send.update_initial_size(size)?;
            }
            self.peer_initial_window = size;
        }
        if let Some(size) = settings.max_frame_size {
            self.peer_max_frame = size;
        }
        if let Some(max) = settings.max_concurrent_streams {
            self.shared.mux.lock().limit = max as usize;
            self.shared.changed.notify_all();
        }
        Ok(())
    }

    fn finish_headers(&mut self) -> DriverResult<()> {
        let Some(pending) = self.pending_headers.take() else {
            return Ok(());
        };
        // Decode even for streams we reset so the HPACK tables stay in sync
        let fields = self
            .decoder
            .decode(&pending.block)
            .map_err(|e| H2Error::Compression(format!("{:?}", e)))?;

        let id = pending.stream_id;
        let Some(active) = self.streams.get_mut(&id) else {
            return Ok(());
        };
        if active.stream.check_receive().is_err() {
            self.reset_stream(id, ErrorCode::StreamClosed, "HEADERS on closed stream");
            return Ok(());
        }

        let mut status = None;
        let mut headers = Headers::new();
        for (name, value) in fields {
            let name = String::from_utf8_lossy(&name).into_owned();
            let value = String::from_utf8_lossy(&value).into_owned();
            if name == ":status" {
                status = value.parse::<u16>().ok().and_then(|code| Status::new(code).ok());
            } else if !name.starts_with(':') {
                headers.insert(name, value);
            }
        }

        if active.stream.response_started() {
            // Trailers end the stream and are otherwise ignored
            if !pending.end_stream {
                self.reset_stream(id, ErrorCode::ProtocolError, "trailers without END_STREAM");
                return Ok(());
            }
        } else {
            let Some(status) = status else {
                self.reset_stream(id, ErrorCode::ProtocolError, "response without :status");
                return Ok(());
            };
            if status.is_informational() {
                if pending.end_stream {
                    self.reset_stream(id, ErrorCode::ProtocolError, "END_STREAM on 1xx response");
                }
                return Ok(());
            }
            active.stream.mark_response_started();
            trace!(stream = id, status = status.code(), "response headers");
            if let Some(reply) = active.reply.take() {
                let _ = reply.send(Ok(Head { status, headers }));
            }
        }

        if pending.end_stream {
            self.on_remote_end(id);
        }
        Ok(())
    }

    fn on_data(&mut self, frame: DataFrame) -> DriverResult<()> {
        self.flow.recv.receive(frame.flow_len)?;

        let id = frame.stream_id;
        let Some(active) = self.streams.get_mut(&id) else {
            return self.release_connection(frame.flow_len);
        };
        if active.stream.check_receive().is_err() || !active.stream.response_started() {
            self.release_connection(frame.flow_len)?;
            self.reset_stream(id, ErrorCode::ProtocolError, "DATA before response headers");
            return Ok(());
        }
        if active.stream.flow_mut().recv.receive(frame.flow_len).is_err() {
            self.release_connection(frame.flow_len)?;
            self.reset_stream(id, ErrorCode::FlowControlError, "stream window exceeded");
            return Ok(());
        }

        // Padding is credited back at once, data once the consumer takes it
        let mut unused = frame.flow_len - frame.data.len();
        let len = frame.data.len();
        if len > 0 {
            if active.emitter.push(frame.data) {
                self.undelivered.entry(id).or_default().push_back(len);
            } else {
                unused += len;
            }
        }
        if unused > 0 {
            self.release(id, unused)?;
        }
        if frame.end_stream {
            self.on_remote_end(id);
        }
        Ok(())
    }

    /// Credit `amount` consumed bytes to the connection and, while it can
    /// still receive, to the stream
    fn release(&mut self, id: u32, amount: usize) -> DriverResult<()> {
        self.release_connection(amount)?;
        let Some(active) = self.streams.get_mut(&id) else {
            return Ok(());
        };
        if !active.stream.state().can_receive() {
            return Ok(());
        }
        if let Some(increment) = active.stream.flow_mut().release(amount)? {
            self.out
                .extend_from_slice(&FrameCodec::encode_window_update_frame(&WindowUpdateFrame::new(id, increment)));
        }
        Ok(())
    }

    fn release_connection(&mut self, amount: usize) -> DriverResult<()> {
        if let Some(increment) = self.flow.release(amount)? {
            self.out.extend_from_slice(&FrameCodec::encode_window_update_frame(&WindowUpdateFrame::new(
                CONNECTION_STREAM_ID,
                increment,
            )));
        }
        Ok(())
    }

    fn on_window_update(&mut self, frame: WindowUpdateFrame) -> DriverResult<()> {
        if frame.stream_id == CONNECTION_STREAM_ID {
            self.flow.send.increase(frame.size_increment)?;
            return Ok(());
        }
        let failed = match self.streams.get_mut(&frame.stream_id) {
            Some(active) => active
                .stream
                .flow_mut()
                .send
                .increase(frame.size_increment)
                .is_err(),
            None => false,
        };
        if failed {
            self.reset_stream(frame.stream_id, ErrorCode::FlowControlError, "bad WINDOW_UPDATE");
        }
        Ok(())
    }

    fn on_goaway(&mut self, frame: GoawayFrame) {
        warn!(
            last_stream = frame.last_stream_id,
            code = %frame.error_code,
            "server sent GOAWAY"
        );
        self.shared.mux.lock().going_away = true;
        self.shared.changed.notify_all();

        let doomed: Vec<u32> = self
            .streams
            .keys()
            .filter(|id| **id > frame.last_stream_id)
            .copied()
            .collect();
        for id in doomed {
            if let Some(mut active) = self.streams.remove(&id) {
                active.stream.reset();
                self.close_stream(
                    active,
                    Err(Error::H2(H2Error::GoAway {
                        last_stream_id: frame.last_stream_id,
                        code: frame.error_code,
                    })),
                );
            }
        }
    }

    /// Peer sent END_STREAM
    fn on_remote_end(&mut self, id: u32) {
        let Some(mut active) = self.streams.remove(&id) else {
            return;
        };
        let _ = active.stream.close_remote();
        if !active.stream.state().is_closed() {
            // Response finished while the request body is still going out
            self.out.extend_from_slice(&FrameCodec::encode_rst_stream_frame(&RstStreamFrame::new(
                id,
                ErrorCode::NoError,
            )));
            active.stream.reset();
        }
        self.close_stream(active, Ok(()));
    }

    fn reset_stream(&mut self, id: u32, code: ErrorCode, reason: &str) {
        let Some(mut active) = self.streams.remove(&id) else {
            return;
        };
        warn!(stream = id, %code, reason, "resetting stream");
        self.out
            .extend_from_slice(&FrameCodec::encode_rst_stream_frame(&RstStreamFrame::new(id, code)));
        active.stream.reset();
        self.close_stream(active, Err(Error::H2(H2Error::Protocol(reason.to_string()))));
    }

    /// Release the slot, then deliver the outcome
    fn close_stream(&mut self, mut active: Active, outcome: Result<()>) {
        self.shared.release_slot();
        if let Some(outbox) = &active.outbox {
            outbox.close();
        }
        let id = active.stream.id();
        if self.undelivered.get(&id).is_some_and(VecDeque::is_empty) {
            self.undelivered.remove(&id);
        }
        match (active.reply.take(), outcome) {
            (Some(reply), Ok(())) => {
                let _ = reply.send(Err(Error::H2(H2Error::Protocol(
                    "stream ended without a response".to_string(),
                ))));
            }
            (Some(reply), Err(error)) => {
                let _ = reply.send(Err(error));
            }
            (None, Ok(())) => active.emitter.complete(),
            (None, Err(error)) => active.emitter.fail(error.into_body_error()),
        }
    }

    fn teardown(&mut self, error: Option<H2Error>) {
        let code = error.as_ref().map_or(ErrorCode::NoError, |e| e.code());
        match &error {
            Some(e) => warn!(error = %e, "HTTP/2 connection failed"),
            None => debug!("HTTP/2 connection closing"),
        }
        if !matches!(error, Some(H2Error::Io(_)) | Some(H2Error::ConnectionClosed)) {
            self.out.extend_from_slice(&FrameCodec::encode_goaway_frame(&GoawayFrame::new(
                0,
                code,
                Bytes::new(),
            )));
            let _ = self.flush();
        }

        {
            let mut mux = self.shared.mux.lock();
            mux.closed = true;
        }
        self.shared.changed.notify_all();

        let streams: Vec<Active> = self.streams.drain().map(|(_, active)| active).collect();
        for active in streams {
            let failure = match &error {
                None | Some(H2Error::Io(_)) | Some(H2Error::ConnectionClosed) => {
                    H2Error::ConnectionClosed
                }
                Some(e) => H2Error::Protocol(e.to_string()),
            };
            self.close_stream(active, Err(Error::H2(failure)));
        }
        let _ = self.session.close();
    }
}
