//! Session operations abstraction
//!
//! This module provides the session operations pattern that allows
//! transparent switching between plain TCP and TLS connections.
//!
//! Every connection the client opens ends up as a `Box<dyn SessionOps>`,
//! so the HTTP/1.1 exchange code and the HTTP/2 connection driver never
//! need to know which transport they run on.

use super::timeout::{CancelHook, CancelToken};
use super::tls::SslSessionInfo;
use super::{Error, Result};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

/// Session operations trait
///
/// This trait defines the operations that can be performed on a session,
/// abstracting over plain TCP and TLS connections.
pub trait SessionOps: Send {
    /// Poll the session for events
    ///
    /// Returns true if the session is ready for the requested operation
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool>;

    /// Read data from the session
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write data to the session
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Flush buffered output
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Close the session
    fn close(&mut self) -> Result<()>;

    /// Raw descriptor of the underlying socket
    fn raw_fd(&self) -> RawFd;

    /// Bytes already read from the socket but not yet handed out
    fn buffered(&self) -> usize {
        0
    }

    /// Negotiated TLS parameters, if this is a TLS session
    fn ssl_info(&self) -> Option<SslSessionInfo> {
        None
    }
}

impl SessionOps for Box<dyn SessionOps> {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
        (**self).poll(events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        (**self).write(buf)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }

    fn raw_fd(&self) -> RawFd {
        (**self).raw_fd()
    }

    fn buffered(&self) -> usize {
        (**self).buffered()
    }

    fn ssl_info(&self) -> Option<SslSessionInfo> {
        (**self).ssl_info()
    }
}

/// Poll events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
    Both,
}

impl PollEvents {
    fn as_libc(self) -> libc::c_short {
        match self {
            PollEvents::Read => libc::POLLIN,
            PollEvents::Write => libc::POLLOUT,
            PollEvents::Both => libc::POLLIN | libc::POLLOUT,
        }
    }
}

/// Convert an optional timeout to poll(2) milliseconds, rounding up
fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            let mut ms = d.as_millis();
            if Duration::from_millis(ms as u64) < d {
                ms += 1;
            }
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

/// Poll a set of descriptors, retrying on EINTR
///
/// Returns the `revents` of each descriptor in order.
pub fn poll_fds(fds: &[(RawFd, PollEvents)], timeout: Option<Duration>) -> Result<Vec<bool>> {
    let mut pfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|(fd, events)| libc::pollfd {
            fd: *fd,
            events: events.as_libc(),
            revents: 0,
        })
        .collect();

    let started = Instant::now();
    loop {
        let remaining = timeout.map(|t| t.saturating_sub(started.elapsed()));
        let result = unsafe {
            libc::poll(
                pfds.as_mut_ptr(),
                pfds.len() as libc::nfds_t,
                timeout_ms(remaining),
            )
        };

        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::Io(err));
        }

        return Ok(pfds.iter().map(|p| p.revents != 0).collect());
    }
}

/// Poll a single descriptor
pub fn poll_fd(fd: RawFd, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
    Ok(poll_fds(&[(fd, events)], timeout)?[0])
}

/// Shut `fd` down in both directions once `cancel` trips
///
/// Blocked reads and writes on it fail right away. The hook must be dropped
/// before the descriptor is closed.
pub(crate) fn interrupt_on_cancel(cancel: &CancelToken, fd: RawFd) -> CancelHook {
    cancel.on_cancel(move || {
        // SAFETY: the descriptor outlives the hook
        unsafe {
            libc::shutdown(fd, libc::SHUT_RDWR);
        }
    })
}

/// HTTP session wrapping a transport with session operations
///
/// Reads and writes wait at most `timeout` for readiness, further capped by
/// the deadline if one is set. Both default to unbounded.
pub struct HttpSession<S: SessionOps> {
    session: S,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl<S: SessionOps> HttpSession<S> {
    /// Create a new HTTP session
    pub fn new(session: S) -> Self {
        HttpSession {
            session,
            timeout: None,
            deadline: None,
        }
    }

    /// Set the timeout for operations
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Get the timeout
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Set an absolute deadline for all subsequent operations
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    fn wait_budget(&self) -> Result<Option<Duration>> {
        match self.deadline {
            None => Ok(self.timeout),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::Timeout);
                }
                let left = deadline - now;
                Ok(Some(self.timeout.map_or(left, |t| t.min(left))))
            }
        }
    }

    /// Read data with timeout
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let budget = self.wait_budget()?;
        if self.session.buffered() == 0 && !self.session.poll(PollEvents::Read, budget)? {
            return Err(Error::Timeout);
        }

        self.session.read(buf)
    }

    /// Write data with timeout
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let budget = self.wait_budget()?;
        if !self.session.poll(PollEvents::Write, budget)? {
            return Err(Error::Timeout);
        }

        self.session.write(buf)
    }

    /// Write the whole buffer, then flush
    pub fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf)?;
            if n == 0 {
                return Err(Error::io(io::ErrorKind::WriteZero, "failed to write whole buffer"));
            }
            buf = &buf[n..];
        }
        self.session.flush()
    }

    /// Check whether the peer has closed or sent unsolicited data
    ///
    /// An idle keep-alive connection must not be readable; if it is, the
    /// peer either closed it or violated the protocol.
    pub fn is_stale(&self) -> bool {
        if self.session.buffered() > 0 {
            return true;
        }
        self.session
            .poll(PollEvents::Read, Some(Duration::ZERO))
            .unwrap_or(true)
    }

    /// Close the session
    pub fn close(&mut self) -> Result<()> {
        self.session.close()
    }

    /// Get a reference to the underlying session
    pub fn get_ref(&self) -> &S {
        &self.session
    }

    /// Get a mutable reference to the underlying session
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.session
    }

    /// Unwrap the underlying session
    pub fn into_inner(self) -> S {
        self.session
    }
}

/// Plain file descriptor session operations
pub struct FdSessionOps {
    stream: TcpStream,
}

impl FdSessionOps {
    /// Create a new FD session operations from a TCP stream
    pub fn new(stream: TcpStream) -> Self {
        FdSessionOps { stream }
    }
}

impl SessionOps for FdSessionOps {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
        poll_fd(self.stream.as_raw_fd(), events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.stream.read(buf).map_err(Error::from)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.stream.write(buf).map_err(Error::from)
    }

    fn flush(&mut self) -> Result<()> {
        self.stream.flush().map_err(Error::from)
    }

    fn close(&mut self) -> Result<()> {
        use std::net::Shutdown;
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(Error::from(e)),
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// Helper to create an HTTP session from a TCP stream
pub fn from_tcp_stream(stream: TcpStream) -> HttpSession<FdSessionOps> {
    HttpSession::new(FdSessionOps::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_fd_session_ops() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"Hello").unwrap();
        });

        let stream = TcpStream::connect(addr).unwrap();
        let mut session = FdSessionOps::new(stream);

        assert!(session.poll(PollEvents::Read, Some(Duration::from_secs(1))).unwrap());

        let mut buf = [0u8; 5];
        let n = session.read(&mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"Hello");

        handle.join().unwrap();
    }

    #[test]
    fn test_http_session_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let _handle = thread::spawn(move || {
            let (_stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_secs(2));
        });

        let stream = TcpStream::connect(addr).unwrap();
        let mut session = from_tcp_stream(stream);
        session.set_timeout(Some(Duration::from_millis(100)));

        let mut buf = [0u8; 10];
        let result = session.read(&mut buf);
        assert!(matches!(result.unwrap_err(), Error::Timeout));
    }

    #[test]
    fn test_http_session_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let _handle = thread::spawn(move || {
            let (_stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_secs(2));
        });

        let stream = TcpStream::connect(addr).unwrap();
        let mut session = from_tcp_stream(stream);
        let started = Instant::now();
        session.set_deadline(Some(started + Duration::from_millis(50)));

        let mut buf = [0u8; 10];
        assert!(matches!(session.read(&mut buf), Err(Error::Timeout)));
        assert!(started.elapsed() < Duration::from_secs(1));
        // Once the deadline has passed, reads fail without polling.
        assert!(matches!(session.read(&mut buf), Err(Error::Timeout)));
    }

    #[test]
    fn test_stale_detection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });

        let stream = TcpStream::connect(addr).unwrap();
        let session = from_tcp_stream(stream);
        handle.join().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(session.is_stale());
    }

    #[test]
    fn test_timeout_rounding() {
        assert_eq!(timeout_ms(None), -1);
        assert_eq!(timeout_ms(Some(Duration::from_micros(10))), 1);
        assert_eq!(timeout_ms(Some(Duration::from_millis(5))), 5);
    }
}
