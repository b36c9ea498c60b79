//! HTTP client
//!
//! [`HttpClient`] is the entry point of the crate. It owns the configuration,
//! the connection pool, the credential cache and the worker threads used by
//! [`send_async`](HttpClient::send_async). Clients are cheap to clone; all
//! clones share the same pool.

use super::auth::{AuthCache, Authenticator};
use super::connection::Proxy;
use super::cookie::CookieStore;
use super::executor::{Executor, ResponseFuture};
use super::h2::H2Options;
use super::message::{Request, Response, Version};
use super::pipeline::Pipeline;
use super::pool::{ConnectionStats, Pool, PoolConfig};
use super::timeout::{CancelToken, TimerService};
use super::tls::TlsConfig;
use super::{Error, Result};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Which redirects the client follows on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Redirect {
    /// Hand every 3xx response to the caller
    #[default]
    Never,
    /// Follow every redirect
    Always,
    /// Follow redirects except from `https` to `http`
    Normal,
}

/// What happens when every stream of an HTTP/2 connection is busy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamLimitPolicy {
    /// Fail the request with a too-many-streams error
    #[default]
    Reject,
    /// Wait for a stream to finish, in arrival order
    Queue,
}

/// Client configuration
#[derive(Clone)]
pub struct ClientConfig {
    /// Preferred protocol version; requests may override it
    pub version: Version,
    /// Bound on establishing a connection, TLS and tunnels included
    pub connect_timeout: Option<Duration>,
    pub redirect: Redirect,
    pub max_redirects: usize,
    /// Challenges answered per logical request
    pub max_auth_attempts: usize,
    pub pool: PoolConfig,
    /// Concurrent stream limit assumed before the server's SETTINGS arrive
    pub default_max_streams: u32,
    pub stream_limit_policy: StreamLimitPolicy,
    /// Resends of a request that never reached the server
    pub retries: usize,
    /// Allow resending POST requests as well as idempotent ones
    pub retry_post: bool,
    /// Worker threads behind `send_async`
    pub workers: usize,
    pub tls: Option<TlsConfig>,
    pub proxy: Option<Proxy>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub cookie_store: Option<Arc<dyn CookieStore>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            version: Version::Http2,
            connect_timeout: None,
            redirect: Redirect::Never,
            max_redirects: 20,
            max_auth_attempts: 3,
            pool: PoolConfig::default(),
            default_max_streams: 100,
            stream_limit_policy: StreamLimitPolicy::Reject,
            retries: 1,
            retry_post: false,
            workers: 4,
            tls: None,
            proxy: None,
            authenticator: None,
            cookie_store: None,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("version", &self.version)
            .field("connect_timeout", &self.connect_timeout)
            .field("redirect", &self.redirect)
            .field("max_redirects", &self.max_redirects)
            .field("pool", &self.pool)
            .field("stream_limit_policy", &self.stream_limit_policy)
            .field("proxy", &self.proxy)
            .field("authenticator", &self.authenticator.is_some())
            .field("cookie_store", &self.cookie_store.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for [`HttpClient`]
#[derive(Debug, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    pub fn version(mut self, version: Version) -> Self {
        self.config.version = version;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = Some(timeout);
        self
    }

    pub fn redirect(mut self, policy: Redirect) -> Self {
        self.config.redirect = policy;
        self
    }

    pub fn max_redirects(mut self, max: usize) -> Self {
        self.config.max_redirects = max;
        self
    }

    pub fn max_auth_attempts(mut self, max: usize) -> Self {
        self.config.max_auth_attempts = max;
        self
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.config.pool = pool;
        self
    }

    pub fn default_max_streams(mut self, streams: u32) -> Self {
        self.config.default_max_streams = streams;
        self
    }

    pub fn stream_limit_policy(mut self, policy: StreamLimitPolicy) -> Self {
        self.config.stream_limit_policy = policy;
        self
    }

    pub fn retries(mut self, retries: usize) -> Self {
        self.config.retries = retries;
        self
    }

    pub fn retry_post(mut self, enabled: bool) -> Self {
        self.config.retry_post = enabled;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.config.tls = Some(tls);
        self
    }

    pub fn proxy(mut self, proxy: Proxy) -> Self {
        self.config.proxy = Some(proxy);
        self
    }

    pub fn authenticator(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.config.authenticator = Some(Arc::new(authenticator));
        self
    }

    pub fn cookie_store(mut self, store: Arc<dyn CookieStore>) -> Self {
        self.config.cookie_store = Some(store);
        self
    }

    pub fn build(self) -> Result<HttpClient> {
        HttpClient::with_config(self.config)
    }
}

struct ClientInner {
    config: ClientConfig,
    pool: Pool,
    auth_cache: AuthCache,
    executor: Executor,
    timers: Arc<TimerService>,
    /// Tripped by `shutdown`; cancels every request still running
    closing: CancelToken,
}

impl ClientInner {
    fn pipeline<'a>(&'a self, cancel: &'a CancelToken) -> Pipeline<'a> {
        Pipeline {
            config: &self.config,
            pool: &self.pool,
            auth_cache: &self.auth_cache,
            cancel,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closing.is_cancelled() {
            return Err(Error::IllegalState("client is shut down".to_string()));
        }
        Ok(())
    }

    /// Run `request` under `cancel`, which client shutdown also trips
    fn run(&self, request: &Request, cancel: &CancelToken) -> Result<Response> {
        let linked = cancel.clone();
        let _link = self.closing.on_cancel(move || {
            linked.cancel();
        });
        self.pipeline(cancel).send(request)
    }

    fn close(&self) {
        self.closing.cancel();
        self.executor.shutdown();
        self.pool.shutdown();
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.closing.cancel();
        self.executor.shutdown();
        self.timers.shutdown();
        self.pool.shutdown();
    }
}

/// HTTP client with a shared connection pool
///
/// ```no_run
/// use vclient::http::{HttpClient, Redirect, Request};
///
/// let client = HttpClient::builder().redirect(Redirect::Normal).build()?;
/// let request = Request::builder().uri("http://127.0.0.1:8080/").build()?;
/// let response = client.send(&request)?;
/// println!("{}", response.status());
/// # Ok::<(), vclient::Error>(())
/// ```
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

impl HttpClient {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Client with the default configuration
    pub fn new() -> Result<HttpClient> {
        HttpClient::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Result<HttpClient> {
        if config.max_auth_attempts == 0 {
            return Err(Error::IllegalArgument(
                "max_auth_attempts must be at least 1".to_string(),
            ));
        }
        if config.default_max_streams == 0 {
            return Err(Error::IllegalArgument(
                "default_max_streams must be at least 1".to_string(),
            ));
        }
        let tls = match &config.tls {
            Some(tls) => tls.clone(),
            None => TlsConfig::client().build()?,
        };
        let h2 = H2Options {
            default_max_streams: config.default_max_streams,
            policy: config.stream_limit_policy,
        };
        let pool = Pool::new(config.pool, h2, tls)?;
        let executor = Executor::new("vclient", config.workers)?;
        let timers = Arc::new(TimerService::new("vclient")?);
        debug!(?config, "client created");

        Ok(HttpClient {
            inner: Arc::new(ClientInner {
                config,
                pool,
                auth_cache: AuthCache::new(),
                executor,
                timers,
                closing: CancelToken::new(),
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Send `request` and wait for the response head
    ///
    /// The body of the returned response is still streaming; read it through
    /// [`Response::into_body`].
    pub fn send(&self, request: &Request) -> Result<Response> {
        self.inner.check_open()?;
        self.inner.run(request, &CancelToken::new())
    }

    /// Send `request` on a worker thread
    ///
    /// The future fails with a request timeout once the request's timeout
    /// elapses, even if the request is still queued behind busy workers.
    /// Either way, and on [`ResponseFuture::cancel`], the worker abandons
    /// the request promptly.
    pub fn send_async(&self, request: &Request) -> ResponseFuture {
        if let Err(error) = self.inner.check_open() {
            return ResponseFuture::ready(Err(error));
        }
        let (future, completer) = ResponseFuture::new();
        if let Some(timeout) = request.timeout {
            completer.expire_at(&self.inner.timers, Instant::now() + timeout);
        }

        let inner = Arc::clone(&self.inner);
        let request = request.clone();
        let job = completer.clone();
        let spawned = self.inner.executor.spawn(move || {
            if job.is_done() {
                return;
            }
            let result = inner.run(&request, job.token());
            job.complete(result);
        });
        match spawned {
            Ok(()) => future,
            Err(error) => {
                completer.complete(Err(error));
                future
            }
        }
    }

    /// Counters of transports opened and closed by this client
    pub fn connection_stats(&self) -> &ConnectionStats {
        self.inner.pool.stats()
    }

    /// Cancel running requests, stop the worker threads and close all
    /// pooled connections
    ///
    /// Requests still in flight fail with a cancellation error; requests
    /// sent afterwards fail with an illegal-state error.
    pub fn shutdown(&self) {
        self.inner.close();
    }
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ErrorKind;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.version, Version::Http2);
        assert_eq!(config.redirect, Redirect::Never);
        assert_eq!(config.max_redirects, 20);
        assert_eq!(config.stream_limit_policy, StreamLimitPolicy::Reject);
        assert!(config.connect_timeout.is_none());
        assert!(!config.retry_post);
    }

    #[test]
    fn test_builder_sets_fields() {
        let client = HttpClient::builder()
            .version(Version::Http11)
            .connect_timeout(Duration::from_millis(250))
            .redirect(Redirect::Normal)
            .max_redirects(3)
            .workers(1)
            .build()
            .unwrap();
        let config = client.config();
        assert_eq!(config.version, Version::Http11);
        assert_eq!(config.connect_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.redirect, Redirect::Normal);
        assert_eq!(config.max_redirects, 3);
        assert_eq!(client.connection_stats().opened(), 0);
    }

    #[test]
    fn test_rejects_zero_limits() {
        let err = HttpClient::builder().max_auth_attempts(0).build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalArgument);
        let err = HttpClient::builder().default_max_streams(0).build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalArgument);
    }

    #[test]
    fn test_send_after_shutdown() {
        let client = HttpClient::builder().workers(1).build().unwrap();
        client.shutdown();
        let request = Request::builder().uri("http://127.0.0.1:9/").build().unwrap();
        let err = client.send(&request).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
        let err = client.send_async(&request).wait().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
    }
}
