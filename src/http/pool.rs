//! Keyed connection pool
//!
//! HTTP/1.1 connections are pooled per [`PoolKey`] and lent out one exchange
//! at a time. HTTP/2 connections are shared: at most one live connection per
//! key, created single-flight so a burst of first requests to a new origin
//! opens exactly one socket. A reaper thread closes connections that stayed
//! idle past the configured timeout.

use super::connection::{self, ConnectParams, Negotiation, Proxy};
use super::h1::H1Connection;
use super::h2::{H2Connection, H2Options};
use super::timeout::{CancelToken, ConnectBudget};
use super::tls::TlsConfig;
use super::{Error, Result, Uri};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace};

/// Longest pause between two reaper passes
const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Identity of a pool bucket: (scheme, host, port, proxy)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    scheme: String,
    host: String,
    port: u16,
    proxy: Option<Proxy>,
}

impl PoolKey {
    pub fn new(uri: &Uri, proxy: Option<&Proxy>) -> PoolKey {
        PoolKey {
            scheme: uri.scheme().to_ascii_lowercase(),
            host: uri.host_for_connect().to_ascii_lowercase(),
            port: uri.port_or_default(),
            proxy: proxy.cloned(),
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn proxy(&self) -> Option<&Proxy> {
        self.proxy.as_ref()
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)?;
        if let Some(proxy) = &self.proxy {
            write!(f, " via {}", proxy.authority())?;
        }
        Ok(())
    }
}

/// Pool limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Idle connections are closed after this long
    pub idle_timeout: Duration,
    /// Idle HTTP/1.1 connections kept per key
    pub max_idle_per_key: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            idle_timeout: Duration::from_secs(30),
            max_idle_per_key: 16,
        }
    }
}

/// Transport counters
///
/// Every socket the pool opens is counted once in `opened` and once in
/// `closed` when its last owner lets go of it.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    opened: AtomicU64,
    closed: AtomicU64,
}

impl ConnectionStats {
    pub(crate) fn record_opened(&self) {
        self.opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_closed(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }

    /// Sockets currently open
    pub fn open(&self) -> u64 {
        self.opened().saturating_sub(self.closed())
    }
}

/// What [`Pool::acquire`] hands out
pub(crate) enum Acquired {
    /// Exclusive HTTP/1.1 connection
    Http1(H1Connection),
    /// Shared HTTP/2 connection
    Http2(Arc<H2Connection>),
    /// Fresh plaintext connection that should offer `Upgrade: h2c`
    ///
    /// The guard keeps other callers for the key waiting until the outcome
    /// is reported with [`Pool::register_h2`] or [`Pool::pin_http1`].
    Upgrade(H1Connection, ConnectingGuard),
}

/// Parameters of one acquisition
pub(crate) struct AcquireParams<'a> {
    pub uri: &'a Uri,
    pub proxy: Option<&'a Proxy>,
    pub negotiation: Negotiation,
    /// The request carries a body and cannot lead an `h2c` upgrade
    pub has_body: bool,
    pub budget: ConnectBudget,
    pub proxy_authorization: Option<String>,
    pub cancel: &'a CancelToken,
}

#[derive(Default)]
struct PoolState {
    idle: HashMap<PoolKey, Vec<H1Connection>>,
    h2: HashMap<PoolKey, Arc<H2Connection>>,
    /// Keys with an HTTP/2 connection attempt in flight
    connecting: HashSet<PoolKey>,
    /// Origins that answered HTTP/2 attempts with HTTP/1.1
    http1_only: HashSet<PoolKey>,
    closed: bool,
}

pub(crate) struct PoolInner {
    config: PoolConfig,
    h2: H2Options,
    tls: TlsConfig,
    stats: Arc<ConnectionStats>,
    state: Mutex<PoolState>,
    changed: Condvar,
}

/// Connection pool shared by all requests of one client
pub(crate) struct Pool {
    inner: Arc<PoolInner>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

/// Clears the in-flight HTTP/2 marker of a key when dropped
pub(crate) struct ConnectingGuard {
    inner: Arc<PoolInner>,
    key: PoolKey,
}

impl Drop for ConnectingGuard {
    fn drop(&mut self) {
        self.inner.state.lock().connecting.remove(&self.key);
        self.inner.changed.notify_all();
    }
}

enum Step {
    Reuse(Acquired),
    /// Connect, leading the HTTP/2 attempt for the key if a guard is present
    Connect(Negotiation, Option<ConnectingGuard>),
}

impl Pool {
    pub(crate) fn new(config: PoolConfig, h2: H2Options, tls: TlsConfig) -> Result<Pool> {
        let inner = Arc::new(PoolInner {
            config,
            h2,
            tls,
            stats: Arc::new(ConnectionStats::default()),
            state: Mutex::new(PoolState::default()),
            changed: Condvar::new(),
        });
        let weak = Arc::downgrade(&inner);
        let reaper = thread::Builder::new()
            .name("vclient-pool-reaper".to_string())
            .spawn(move || reap_loop(weak))?;
        Ok(Pool {
            inner,
            reaper: Mutex::new(Some(reaper)),
        })
    }

    pub(crate) fn stats(&self) -> &Arc<ConnectionStats> {
        &self.inner.stats
    }

    pub(crate) fn h2_options(&self) -> H2Options {
        self.inner.h2
    }

    /// Idle HTTP/1.1 connections held for `key`
    pub(crate) fn idle_count(&self, key: &PoolKey) -> usize {
        self.inner.state.lock().idle.get(key).map_or(0, Vec::len)
    }

    /// Get a connection for `key`, reusing one when possible
    pub(crate) fn acquire(&self, key: &PoolKey, params: &AcquireParams<'_>) -> Result<Acquired> {
        let weak = Arc::downgrade(&self.inner);
        let wake = params.cancel.on_cancel(move || {
            if let Some(inner) = weak.upgrade() {
                drop(inner.state.lock());
                inner.changed.notify_all();
            }
        });
        let step = self.inner.next_step(key, params);
        drop(wake);
        match step? {
            Step::Reuse(acquired) => Ok(acquired),
            Step::Connect(negotiation, guard) => self.connect(key, params, negotiation, guard),
        }
    }

    fn connect(
        &self,
        key: &PoolKey,
        params: &AcquireParams<'_>,
        negotiation: Negotiation,
        guard: Option<ConnectingGuard>,
    ) -> Result<Acquired> {
        let transport = connection::connect(&ConnectParams {
            uri: params.uri,
            proxy: params.proxy,
            tls: &self.inner.tls,
            negotiation,
            budget: params.budget,
            proxy_authorization: params.proxy_authorization.clone(),
            stats: &self.inner.stats,
            cancel: params.cancel,
        })?;

        if transport.h2 {
            let ssl = transport.ssl.clone();
            let conn = H2Connection::handshake(
                transport.session,
                ssl,
                self.inner.h2,
                params.budget.effective(),
            )?;
            if let Some(guard) = guard {
                self.register_h2(guard, Arc::clone(&conn));
            }
            return Ok(Acquired::Http2(conn));
        }

        match (negotiation, guard) {
            (Negotiation::Upgrade, Some(guard)) => {
                Ok(Acquired::Upgrade(H1Connection::new(transport), guard))
            }
            (Negotiation::Alpn, Some(guard)) => {
                debug!(key = %key, "server selected http/1.1 through ALPN");
                self.pin_http1(guard);
                Ok(Acquired::Http1(H1Connection::new(transport)))
            }
            _ => Ok(Acquired::Http1(H1Connection::new(transport))),
        }
    }

    /// Publish a freshly established HTTP/2 connection for its key
    pub(crate) fn register_h2(&self, guard: ConnectingGuard, conn: Arc<H2Connection>) {
        let mut state = self.inner.state.lock();
        if state.closed {
            drop(state);
            conn.drain();
            return;
        }
        debug!(key = %guard.key, "pooling HTTP/2 connection");
        state.h2.insert(guard.key.clone(), conn);
        drop(state);
        drop(guard);
    }

    /// Remember that the key's origin only speaks HTTP/1.1
    pub(crate) fn pin_http1(&self, guard: ConnectingGuard) {
        debug!(key = %guard.key, "origin pinned to HTTP/1.1");
        self.inner.state.lock().http1_only.insert(guard.key.clone());
        drop(guard);
    }

    /// Return an HTTP/1.1 connection after a clean exchange
    pub(crate) fn release(&self, key: &PoolKey, conn: H1Connection) {
        release(&self.inner, key.clone(), conn);
    }

    /// Callback form of [`release`](Pool::release) that does not keep the pool alive
    pub(crate) fn releaser(&self, key: &PoolKey) -> impl FnOnce(H1Connection) + Send + 'static {
        let weak = Arc::downgrade(&self.inner);
        let key = key.clone();
        move |conn| {
            if let Some(inner) = weak.upgrade() {
                release(&inner, key, conn);
            }
        }
    }

    /// Close idle connections and drain HTTP/2 connections
    pub(crate) fn shutdown(&self) {
        let (idle, h2) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle: Vec<H1Connection> = state.idle.drain().flat_map(|(_, conns)| conns).collect();
            let h2: Vec<Arc<H2Connection>> = state.h2.drain().map(|(_, conn)| conn).collect();
            (idle, h2)
        };
        self.inner.changed.notify_all();
        debug!(idle = idle.len(), h2 = h2.len(), "shutting down connection pool");
        drop(idle);
        for conn in &h2 {
            conn.drain();
        }
        for conn in &h2 {
            conn.wait_closed();
        }
        if let Some(reaper) = self.reaper.lock().take() {
            let _ = reaper.join();
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl PoolInner {
    fn next_step(self: &Arc<Self>, key: &PoolKey, params: &AcquireParams<'_>) -> Result<Step> {
        let negotiation = params.negotiation;
        let budget = &params.budget;
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(Error::IllegalState("connection pool is shut down".to_string()));
            }
            params.cancel.check()?;

            let mut negotiation = negotiation;
            if negotiation != Negotiation::Http1 {
                if let Some(conn) = state.h2.get(key) {
                    if conn.is_usable() {
                        trace!(key = %key, "reusing HTTP/2 connection");
                        return Ok(Step::Reuse(Acquired::Http2(Arc::clone(conn))));
                    }
                    debug!(key = %key, state = %conn.state(), "dropping unusable HTTP/2 connection");
                    state.h2.remove(key);
                }
                if state.http1_only.contains(key) {
                    negotiation = Negotiation::Http1;
                } else if state.connecting.contains(key) {
                    let timed_out = match budget.effective().instant() {
                        Some(at) => self.changed.wait_until(&mut state, at).timed_out(),
                        None => {
                            self.changed.wait(&mut state);
                            false
                        }
                    };
                    if timed_out {
                        return Err(budget.timeout_error(Error::io(
                            io::ErrorKind::TimedOut,
                            "timed out waiting for a shared HTTP/2 connection",
                        )));
                    }
                    continue;
                } else if negotiation == Negotiation::Upgrade && params.has_body {
                    trace!(key = %key, "request body rules out an h2c upgrade");
                    negotiation = Negotiation::Http1;
                } else {
                    state.connecting.insert(key.clone());
                    return Ok(Step::Connect(
                        negotiation,
                        Some(ConnectingGuard {
                            inner: Arc::clone(self),
                            key: key.clone(),
                        }),
                    ));
                }
            }

            if let Some(conn) = take_idle(&mut state, key) {
                return Ok(Step::Reuse(Acquired::Http1(conn)));
            }
            return Ok(Step::Connect(Negotiation::Http1, None));
        }
    }
}

/// Claim the most recently parked live connection; stale ones are closed
fn take_idle(state: &mut PoolState, key: &PoolKey) -> Option<H1Connection> {
    let conns = state.idle.get_mut(key)?;
    while let Some(conn) = conns.pop() {
        if conn.is_stale() {
            trace!(key = %key, "discarding stale HTTP/1.1 connection");
            continue;
        }
        if conn.claim() {
            trace!(key = %key, "reusing HTTP/1.1 connection");
            return Some(conn);
        }
    }
    None
}

fn release(inner: &PoolInner, key: PoolKey, mut conn: H1Connection) {
    conn.park();
    let mut state = inner.state.lock();
    if state.closed {
        return;
    }
    let conns = state.idle.entry(key).or_default();
    if conns.len() < inner.config.max_idle_per_key {
        conns.push(conn);
    }
}

impl PoolInner {
    /// One eviction pass; connections are closed outside the lock
    fn reap(&self) {
        let idle_timeout = self.config.idle_timeout;
        let (expired, h2) = {
            let mut state = self.state.lock();
            let mut expired = Vec::new();
            for conns in state.idle.values_mut() {
                let mut kept = Vec::with_capacity(conns.len());
                for conn in conns.drain(..) {
                    if conn.idle_for() >= idle_timeout && conn.evict() {
                        expired.push(conn);
                    } else {
                        kept.push(conn);
                    }
                }
                *conns = kept;
            }
            state.idle.retain(|_, conns| !conns.is_empty());

            let stale: Vec<PoolKey> = state
                .h2
                .iter()
                .filter(|(_, conn)| {
                    !conn.is_usable() || conn.idle_since().is_some_and(|at| at.elapsed() >= idle_timeout)
                })
                .map(|(key, _)| key.clone())
                .collect();
            let h2: Vec<Arc<H2Connection>> = stale.iter().filter_map(|key| state.h2.remove(key)).collect();
            (expired, h2)
        };
        if !expired.is_empty() || !h2.is_empty() {
            debug!(http1 = expired.len(), http2 = h2.len(), "evicting idle connections");
        }
        drop(expired);
        for conn in h2 {
            conn.drain();
        }
    }
}

fn reap_loop(weak: Weak<PoolInner>) {
    loop {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let pause = inner.config.idle_timeout.min(REAP_INTERVAL);
        {
            let mut state = inner.state.lock();
            if state.closed {
                return;
            }
            inner.changed.wait_for(&mut state, pause);
            if state.closed {
                return;
            }
        }
        inner.reap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::client::StreamLimitPolicy;
    use crate::http::timeout::Deadline;
    use crate::http::connection::{Route, Transport};
    use crate::http::session::FdSessionOps;
    use std::net::{TcpListener, TcpStream};

    fn options() -> H2Options {
        H2Options {
            default_max_streams: 100,
            policy: StreamLimitPolicy::Reject,
        }
    }

    fn pool(config: PoolConfig) -> Pool {
        Pool::new(config, options(), TlsConfig::client().build().unwrap()).unwrap()
    }

    fn connection(listener: &TcpListener) -> (H1Connection, TcpStream) {
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (peer, _) = listener.accept().unwrap();
        let conn = H1Connection::new(Transport {
            session: Box::new(FdSessionOps::new(stream)),
            ssl: None,
            h2: false,
            route: Route::Direct,
        });
        (conn, peer)
    }

    #[test]
    fn test_pool_key_identity() {
        let a = PoolKey::new(&Uri::parse("http://Example.com/a").unwrap(), None);
        let b = PoolKey::new(&Uri::parse("http://example.com:80/b").unwrap(), None);
        let proxy = Proxy::http("127.0.0.1", 3128);
        let c = PoolKey::new(&Uri::parse("http://example.com/").unwrap(), Some(&proxy));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(c.to_string(), "http://example.com:80 via 127.0.0.1:3128");
    }

    #[test]
    fn test_release_then_reuse() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let pool = pool(PoolConfig::default());
        let key = PoolKey::new(&Uri::parse("http://127.0.0.1/").unwrap(), None);
        let (conn, _peer) = connection(&listener);
        pool.release(&key, conn);
        assert_eq!(pool.idle_count(&key), 1);

        let mut state = pool.inner.state.lock();
        let conn = take_idle(&mut state, &key).unwrap();
        assert_eq!(conn.state(), crate::http::ConnectionState::Active);
        assert!(take_idle(&mut state, &key).is_none());
    }

    #[test]
    fn test_stale_connection_not_reused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let pool = pool(PoolConfig::default());
        let key = PoolKey::new(&Uri::parse("http://127.0.0.1/").unwrap(), None);
        let (conn, peer) = connection(&listener);
        pool.release(&key, conn);
        drop(peer);
        thread::sleep(Duration::from_millis(50));

        let mut state = pool.inner.state.lock();
        assert!(take_idle(&mut state, &key).is_none());
    }

    #[test]
    fn test_reaper_evicts_idle() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let pool = pool(PoolConfig {
            idle_timeout: Duration::from_millis(50),
            max_idle_per_key: 4,
        });
        let key = PoolKey::new(&Uri::parse("http://127.0.0.1/").unwrap(), None);
        let (conn, _peer) = connection(&listener);
        pool.release(&key, conn);
        thread::sleep(Duration::from_millis(300));
        assert_eq!(pool.idle_count(&key), 0);
    }

    #[test]
    fn test_shutdown_rejects_acquire() {
        let pool = pool(PoolConfig::default());
        pool.shutdown();
        let uri = Uri::parse("http://127.0.0.1:1/").unwrap();
        let key = PoolKey::new(&uri, None);
        let err = pool
            .acquire(
                &key,
                &AcquireParams {
                    uri: &uri,
                    proxy: None,
                    negotiation: Negotiation::Http1,
                    has_body: false,
                    budget: ConnectBudget::new(None, Deadline::none()),
                    proxy_authorization: None,
                    cancel: &CancelToken::new(),
                },
            )
            .err()
            .unwrap();
        assert_eq!(err.kind(), crate::http::ErrorKind::IllegalState);
    }

    #[test]
    fn test_cancel_wakes_waiter_for_shared_connection() {
        let pool = pool(PoolConfig::default());
        let uri = Uri::parse("https://127.0.0.1:1/").unwrap();
        let key = PoolKey::new(&uri, None);
        pool.inner.state.lock().connecting.insert(key.clone());

        let cancel = CancelToken::new();
        let canceller = {
            let cancel = cancel.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                cancel.cancel();
            })
        };
        let err = pool
            .acquire(
                &key,
                &AcquireParams {
                    uri: &uri,
                    proxy: None,
                    negotiation: Negotiation::Alpn,
                    has_body: false,
                    budget: ConnectBudget::new(None, Deadline::none()),
                    proxy_authorization: None,
                    cancel: &cancel,
                },
            )
            .err()
            .unwrap();
        assert_eq!(err.kind(), crate::http::ErrorKind::Cancelled);
        canceller.join().unwrap();
    }
}
