//! One logical request, start to finish
//!
//! A logical request may take several exchanges: redirects, answers to
//! authentication challenges and retries of requests that never reached the
//! server. Every exchange re-reads the cookie store and the credential cache,
//! so each hop carries the state left behind by the previous one.

use super::auth::{self, AuthCache, AuthRequest, AuthTarget, Challenge};
use super::client::{ClientConfig, Redirect};
use super::connection::{connect_budget, Failure, Negotiation, ResponseParts, Route};
use super::cookie::cookie_header;
use super::h1::{self, Exchange, Outcome};
use super::message::{Method, Request, Response, ResponseBody};
use super::pool::{AcquireParams, Acquired, Pool, PoolKey};
use super::timeout::{CancelToken, Deadline};
use super::uri::Uri;
use super::{Error, Headers, Result};
use tracing::{debug, info, warn};

/// Headers describing a body that is not sent on after a method change
const CONTENT_HEADERS: &[&str] = &["Content-Type", "Content-Encoding", "Content-Language"];

/// Statuses that carry a `Location` worth following
fn is_followed_redirect(code: u16) -> bool {
    matches!(code, 301 | 302 | 303 | 307 | 308)
}

/// Method for the next hop of a redirect
pub(crate) fn redirect_method(method: Method, code: u16) -> Method {
    match code {
        303 if method == Method::Head => Method::Head,
        303 => Method::Get,
        301 | 302 if method == Method::Post => Method::Get,
        _ => method,
    }
}

/// Whether `policy` allows following a redirect from `from` to `to`
pub(crate) fn redirect_allowed(policy: Redirect, from: &Uri, to: &Uri) -> bool {
    match policy {
        Redirect::Never => false,
        Redirect::Always => true,
        Redirect::Normal => !(from.is_https() && !to.is_https()),
    }
}

/// Why an exchange did not produce a response
enum Miss {
    Failed(Failure),
    /// CONNECT was answered with 407
    ProxyAuth(Box<super::parser::ResponseHead>),
}

/// Credentials waiting to be confirmed by a non-challenge response
struct Pending {
    target: AuthTarget,
    host: String,
    port: u16,
    value: String,
}

/// Runs requests against a client's pool and configuration
pub(crate) struct Pipeline<'a> {
    pub config: &'a ClientConfig,
    pub pool: &'a Pool,
    pub auth_cache: &'a AuthCache,
    pub cancel: &'a CancelToken,
}

/// State carried across the exchanges of one logical request
struct Progress {
    current: Request,
    previous: Option<Response>,
    redirects: usize,
    auth_attempts: usize,
    retries: usize,
    authorization: Option<String>,
    proxy_authorization: Option<String>,
    pending: Vec<Pending>,
}

impl Pipeline<'_> {
    /// Send `request`, following redirects and challenges as configured
    pub(crate) fn send(&self, request: &Request) -> Result<Response> {
        let deadline = Deadline::after(request.timeout);
        let proxy = self.config.proxy.as_ref();
        let mut progress = Progress {
            current: request.clone(),
            previous: None,
            redirects: 0,
            auth_attempts: 0,
            retries: 0,
            authorization: None,
            proxy_authorization: proxy
                .and_then(|p| self.auth_cache.get(p.host(), p.port(), AuthTarget::Proxy)),
            pending: Vec::new(),
        };

        loop {
            self.cancel.check()?;
            let extra = self.extra_headers(&progress);
            let parts = match self.attempt(&progress.current, &extra, deadline, &progress) {
                Ok(parts) => parts,
                Err(Miss::Failed(failure)) => {
                    // Whatever broke, a cancelled request reports the cancellation
                    self.cancel.check()?;
                    if self.may_retry(&failure, &progress) {
                        progress.retries += 1;
                        info!(
                            uri = %progress.current.uri,
                            error = %failure.error,
                            "retrying request on a fresh connection"
                        );
                        continue;
                    }
                    return Err(failure.error);
                }
                Err(Miss::ProxyAuth(head)) => {
                    let response = Response {
                        status: head.status,
                        version: head.version,
                        headers: head.headers,
                        uri: progress.current.uri.clone(),
                        request: progress.current.clone(),
                        previous: progress.previous.take().map(Box::new),
                        ssl_session: None,
                        body: ResponseBody::empty(),
                    };
                    self.forget_rejected(AuthTarget::Proxy, &progress);
                    if self.answer_challenge(AuthTarget::Proxy, &response, &mut progress)? {
                        progress.previous = Some(response.into_previous());
                        continue;
                    }
                    return Ok(response);
                }
            };

            if let Some(store) = &self.config.cookie_store {
                let values = parts.headers.get_all("Set-Cookie");
                if !values.is_empty() {
                    store.set_cookies(&progress.current.uri, &values);
                }
            }

            let response = Response {
                status: parts.status,
                version: parts.version,
                headers: parts.headers,
                uri: progress.current.uri.clone(),
                request: progress.current.clone(),
                previous: progress.previous.take().map(Box::new),
                ssl_session: parts.ssl,
                body: parts.body,
            };
            let code = response.status.code();

            if let Some(target) = AuthTarget::from_status(code) {
                self.forget_rejected(target, &progress);
                if self.answer_challenge(target, &response, &mut progress)? {
                    progress.previous = Some(response.into_previous());
                    continue;
                }
                return Ok(response);
            }
            self.confirm_pending(&mut progress);

            if is_followed_redirect(code) {
                if let Some(next) = self.follow(&response, &mut progress)? {
                    progress.current = next;
                    progress.previous = Some(response.into_previous());
                    continue;
                }
            }
            return Ok(response);
        }
    }

    /// Headers the client adds to `progress.current` for the next exchange
    fn extra_headers(&self, progress: &Progress) -> Headers {
        let request = &progress.current;
        let mut extra = Headers::new();

        if let Some(store) = &self.config.cookie_store {
            if let Some(value) = cookie_header(store.as_ref(), &request.uri) {
                extra.insert("Cookie", value);
            }
        }

        if !request.headers.contains("Authorization") {
            let cached = || {
                self.auth_cache.get(
                    request.uri.host_for_connect(),
                    request.uri.port_or_default(),
                    AuthTarget::Server,
                )
            };
            if let Some(value) = progress.authorization.clone().or_else(cached) {
                extra.insert("Authorization", value);
            }
        }

        let proxy = self.config.proxy.as_ref();
        if Route::select(&request.uri, proxy) == Route::Forward {
            if let Some(value) = &progress.proxy_authorization {
                extra.insert("Proxy-Authorization", value.clone());
            }
        }
        extra
    }

    /// Run one exchange of `request`
    fn attempt(
        &self,
        request: &Request,
        extra: &Headers,
        deadline: Deadline,
        progress: &Progress,
    ) -> std::result::Result<ResponseParts, Miss> {
        let proxy = self.config.proxy.as_ref();
        let route = Route::select(&request.uri, proxy);
        let preference = request.version.unwrap_or(self.config.version);
        let negotiation = Negotiation::select(&request.uri, route, preference);
        let key = PoolKey::new(&request.uri, proxy);

        let acquired = self
            .pool
            .acquire(
                &key,
                &AcquireParams {
                    uri: &request.uri,
                    proxy,
                    negotiation,
                    has_body: request.body.is_some(),
                    budget: connect_budget(self.config.connect_timeout, deadline),
                    cancel: self.cancel,
                    proxy_authorization: progress.proxy_authorization.clone(),
                },
            )
            .map_err(|error| match error {
                Error::ProxyAuthRequired(head) => Miss::ProxyAuth(head),
                other => Miss::Failed(Failure::fatal(other)),
            })?;

        let cancel = self.cancel;
        let exchange = move |upgrade| Exchange {
            request,
            extra,
            deadline,
            cancel,
            upgrade,
        };
        let release = || -> h1::Release { Box::new(self.pool.releaser(&key)) };

        let result = match acquired {
            Acquired::Http2(conn) => conn.exchange(request, extra, deadline, self.cancel),
            Acquired::Http1(conn) => {
                h1::exchange(conn, &exchange(None), release()).map(|outcome| match outcome {
                    Outcome::Http1(parts) | Outcome::Upgraded(_, parts) => parts,
                })
            }
            Acquired::Upgrade(conn, guard) => {
                let offer = exchange(Some(self.pool.h2_options()));
                match h1::exchange(conn, &offer, release()) {
                    Ok(Outcome::Upgraded(h2, parts)) => {
                        self.pool.register_h2(guard, h2);
                        Ok(parts)
                    }
                    Ok(Outcome::Http1(parts)) => {
                        self.pool.pin_http1(guard);
                        Ok(parts)
                    }
                    Err(failure) => Err(failure),
                }
            }
        };
        result.map_err(Miss::Failed)
    }

    fn may_retry(&self, failure: &Failure, progress: &Progress) -> bool {
        let method = progress.current.method;
        failure.retryable
            && progress.retries < self.config.retries
            && (method.is_idempotent() || (method == Method::Post && self.config.retry_post))
    }

    /// Prepare credentials answering the challenge in `response`
    ///
    /// Returns false when the response should go to the caller unanswered.
    fn answer_challenge(
        &self,
        target: AuthTarget,
        response: &Response,
        progress: &mut Progress,
    ) -> Result<bool> {
        let Some(authenticator) = &self.config.authenticator else {
            return Ok(false);
        };
        let challenges = Challenge::from_headers(&response.headers, target);
        if challenges.is_empty() {
            return Err(Error::Auth(format!(
                "{} response without {} header",
                response.status.code(),
                target.challenge_header()
            )));
        }
        progress.auth_attempts += 1;
        if progress.auth_attempts > self.config.max_auth_attempts {
            return Err(Error::Auth(format!(
                "too many authentication attempts. Limit: {}",
                self.config.max_auth_attempts
            )));
        }
        let Some(challenge) = auth::select(&challenges) else {
            warn!(status = response.status.code(), "no supported authentication scheme offered");
            return Ok(false);
        };

        let uri = &progress.current.uri;
        let (host, port) = match target {
            AuthTarget::Server => (uri.host_for_connect().to_string(), uri.port_or_default()),
            AuthTarget::Proxy => match &self.config.proxy {
                Some(proxy) => (proxy.host().to_string(), proxy.port()),
                None => return Ok(false),
            },
        };
        let query = AuthRequest {
            target,
            host: &host,
            port,
            scheme: challenge.scheme(),
            realm: challenge.realm(),
            uri,
        };
        let Some(credentials) = authenticator.credentials(&query) else {
            return Ok(false);
        };

        let value = auth::respond(challenge, &credentials, progress.current.method, uri)?;
        debug!(
            target = ?target,
            scheme = challenge.scheme(),
            realm = challenge.realm(),
            "answering authentication challenge"
        );
        if challenge.is_basic() {
            progress.pending.retain(|p| p.target != target);
            progress.pending.push(Pending {
                target,
                host,
                port,
                value: value.clone(),
            });
        }
        match target {
            AuthTarget::Server => progress.authorization = Some(value),
            AuthTarget::Proxy => progress.proxy_authorization = Some(value),
        }
        Ok(true)
    }

    /// Drop cached credentials that were sent preemptively and rejected
    fn forget_rejected(&self, target: AuthTarget, progress: &Progress) {
        if progress.auth_attempts > 0 {
            return;
        }
        match (target, &self.config.proxy) {
            (AuthTarget::Server, _) => {
                let uri = &progress.current.uri;
                self.auth_cache
                    .remove(uri.host_for_connect(), uri.port_or_default(), target);
            }
            (AuthTarget::Proxy, Some(proxy)) => {
                self.auth_cache.remove(proxy.host(), proxy.port(), target);
            }
            (AuthTarget::Proxy, None) => {}
        }
    }

    /// Cache Basic credentials that were accepted
    fn confirm_pending(&self, progress: &mut Progress) {
        for pending in progress.pending.drain(..) {
            self.auth_cache
                .store(&pending.host, pending.port, pending.target, pending.value);
        }
    }

    /// Next request of a redirect chain, or `None` to stop here
    fn follow(&self, response: &Response, progress: &mut Progress) -> Result<Option<Request>> {
        let Some(location) = response.headers.get("Location") else {
            return Ok(None);
        };
        let current = &progress.current;
        let target = current.uri.resolve(location)?;
        if !redirect_allowed(self.config.redirect, &current.uri, &target) {
            return Ok(None);
        }
        progress.redirects += 1;
        if progress.redirects > self.config.max_redirects {
            return Err(Error::TooManyRedirects(self.config.max_redirects));
        }

        let code = response.status.code();
        let method = redirect_method(current.method, code);
        let keep_body = method == current.method;
        debug!(status = code, from = %current.uri, to = %target, method = %method, "following redirect");

        if !current.uri.same_origin(&target) {
            progress.authorization = None;
        }
        let mut next = current.redirected(method, target, keep_body);
        if !keep_body {
            for name in CONTENT_HEADERS {
                next.headers.remove(name);
            }
        }
        Ok(Some(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> Uri {
        Uri::parse(s).unwrap()
    }

    #[test]
    fn test_redirect_method_table() {
        let cases = [
            (Method::Get, 301, Method::Get),
            (Method::Get, 303, Method::Get),
            (Method::Head, 303, Method::Head),
            (Method::Post, 301, Method::Get),
            (Method::Post, 302, Method::Get),
            (Method::Post, 303, Method::Get),
            (Method::Post, 307, Method::Post),
            (Method::Post, 308, Method::Post),
            (Method::Put, 301, Method::Put),
            (Method::Put, 303, Method::Get),
            (Method::Put, 307, Method::Put),
            (Method::Delete, 302, Method::Delete),
        ];
        for (method, code, expected) in cases {
            assert_eq!(redirect_method(method, code), expected, "{} {}", method, code);
        }
    }

    #[test]
    fn test_redirect_policy() {
        let secure = uri("https://example.com/a");
        let plain = uri("http://example.com/b");
        assert!(!redirect_allowed(Redirect::Never, &plain, &plain));
        assert!(redirect_allowed(Redirect::Always, &secure, &plain));
        assert!(!redirect_allowed(Redirect::Normal, &secure, &plain));
        assert!(redirect_allowed(Redirect::Normal, &plain, &secure));
        assert!(redirect_allowed(Redirect::Normal, &plain, &plain));
    }

    #[test]
    fn test_followed_statuses() {
        for code in [301, 302, 303, 307, 308] {
            assert!(is_followed_redirect(code));
        }
        for code in [300, 304, 305, 306, 200] {
            assert!(!is_followed_redirect(code));
        }
    }
}
