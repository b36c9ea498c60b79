//! Cookie storage
//!
//! The pipeline offers every `Set-Cookie` header it receives to the client's
//! [`CookieStore`] and asks it for a `Cookie` header before every attempt,
//! redirects and retries included.

use super::Uri;
use parking_lot::Mutex;
use tracing::warn;

/// Pluggable cookie jar
pub trait CookieStore: Send + Sync {
    /// Record the `Set-Cookie` values of a response from `uri`
    fn set_cookies(&self, uri: &Uri, values: &[&str]);

    /// `name=value` pairs to send to `uri`
    fn cookies(&self, uri: &Uri) -> Vec<(String, String)>;
}

/// `Cookie` header value for `uri`, if the store has anything to send
pub fn cookie_header(store: &dyn CookieStore, uri: &Uri) -> Option<String> {
    let cookies = store.cookies(uri);
    if cookies.is_empty() {
        return None;
    }
    Some(
        cookies
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("; "),
    )
}

/// A stored cookie
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    /// Domain the cookie applies to, lowercase, without a leading dot
    pub domain: String,
    /// Only the exact host that set it, not its subdomains
    pub host_only: bool,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
}

/// Parsed `Set-Cookie` value
#[derive(Debug)]
enum Directive {
    Store(Cookie),
    /// `Max-Age` of zero or less
    Delete(Cookie),
}

/// Directory part of a request path, as used for the default cookie path
fn default_path(uri: &Uri) -> String {
    let path = uri.path();
    if !path.starts_with('/') {
        return "/".to_string();
    }
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

fn parse(value: &str, uri: &Uri) -> Option<Directive> {
    let mut parts = value.split(';');
    let (name, val) = parts.next()?.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    let host = uri.host_for_connect().to_ascii_lowercase();
    let mut cookie = Cookie {
        name: name.to_string(),
        value: val.trim().trim_matches('"').to_string(),
        domain: host.clone(),
        host_only: true,
        path: default_path(uri),
        secure: false,
        http_only: false,
    };
    let mut delete = false;

    for attr in parts {
        let (key, arg) = match attr.split_once('=') {
            Some((k, v)) => (k.trim(), v.trim()),
            None => (attr.trim(), ""),
        };
        match key.to_ascii_lowercase().as_str() {
            "domain" if !arg.is_empty() => {
                let domain = arg.trim_start_matches('.').to_ascii_lowercase();
                if !domain_matches(&host, &domain) {
                    return None;
                }
                cookie.domain = domain;
                cookie.host_only = false;
            }
            "path" if arg.starts_with('/') => cookie.path = arg.to_string(),
            "secure" => cookie.secure = true,
            "httponly" => cookie.http_only = true,
            "max-age" => match arg.parse::<i64>() {
                Ok(age) if age <= 0 => delete = true,
                Ok(_) => {}
                Err(_) => return None,
            },
            _ => {}
        }
    }
    Some(if delete {
        Directive::Delete(cookie)
    } else {
        Directive::Store(cookie)
    })
}

fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain
        || (host.len() > domain.len()
            && host.ends_with(domain)
            && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/') || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/'))
}

impl Cookie {
    /// Whether this cookie is sent with requests to `uri`
    pub fn matches(&self, uri: &Uri) -> bool {
        let host = uri.host_for_connect().to_ascii_lowercase();
        let host_ok = if self.host_only {
            host == self.domain
        } else {
            domain_matches(&host, &self.domain)
        };
        let path = if uri.path().is_empty() { "/" } else { uri.path() };
        host_ok && path_matches(path, &self.path) && (!self.secure || uri.is_https())
    }

    fn same_slot(&self, other: &Cookie) -> bool {
        self.name == other.name && self.domain == other.domain && self.path == other.path
    }
}

/// Cookie store kept in memory for the lifetime of a client
#[derive(Debug, Default)]
pub struct InMemoryCookieStore {
    cookies: Mutex<Vec<Cookie>>,
}

impl InMemoryCookieStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a cookie directly, replacing one with the same name, domain and path
    pub fn add(&self, cookie: Cookie) {
        let mut cookies = self.cookies.lock();
        cookies.retain(|c| !c.same_slot(&cookie));
        cookies.push(cookie);
    }

    /// Snapshot of all stored cookies
    pub fn all(&self) -> Vec<Cookie> {
        self.cookies.lock().clone()
    }

    pub fn clear(&self) {
        self.cookies.lock().clear();
    }
}

impl CookieStore for InMemoryCookieStore {
    fn set_cookies(&self, uri: &Uri, values: &[&str]) {
        for value in values {
            match parse(value, uri) {
                Some(Directive::Store(cookie)) => self.add(cookie),
                Some(Directive::Delete(cookie)) => {
                    self.cookies.lock().retain(|c| !c.same_slot(&cookie));
                }
                None => warn!(value = *value, "ignoring malformed Set-Cookie"),
            }
        }
    }

    fn cookies(&self, uri: &Uri) -> Vec<(String, String)> {
        let cookies = self.cookies.lock();
        let mut matching: Vec<&Cookie> = cookies.iter().filter(|c| c.matches(uri)).collect();
        // Longer paths first
        matching.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        matching
            .into_iter()
            .map(|c| (c.name.clone(), c.value.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> Uri {
        Uri::parse(s).unwrap()
    }

    #[test]
    fn test_store_and_send() {
        let store = InMemoryCookieStore::new();
        let origin = uri("http://example.com/login/form");
        store.set_cookies(&origin, &["CUSTOMER=WILE_E_COYOTE; Path=/", "session=abc"]);

        assert_eq!(
            cookie_header(&store, &uri("http://example.com/login/next")).as_deref(),
            Some("session=abc; CUSTOMER=WILE_E_COYOTE")
        );
        assert_eq!(
            cookie_header(&store, &uri("http://example.com/other")).as_deref(),
            Some("CUSTOMER=WILE_E_COYOTE")
        );
        assert!(cookie_header(&store, &uri("http://other.com/")).is_none());
    }

    #[test]
    fn test_domain_attribute() {
        let store = InMemoryCookieStore::new();
        store.set_cookies(&uri("http://www.example.com/"), &["a=1; Domain=.example.com"]);
        assert_eq!(store.cookies(&uri("http://api.example.com/")).len(), 1);
        assert!(store.cookies(&uri("http://badexample.com/")).is_empty());

        store.set_cookies(&uri("http://www.example.com/"), &["b=2; Domain=other.org"]);
        assert_eq!(store.all().len(), 1);
    }

    #[test]
    fn test_secure_and_delete() {
        let store = InMemoryCookieStore::new();
        store.set_cookies(&uri("https://example.com/"), &["token=t; Secure; HttpOnly"]);
        assert!(store.cookies(&uri("http://example.com/")).is_empty());
        assert_eq!(store.cookies(&uri("https://example.com/")).len(), 1);

        store.set_cookies(&uri("https://example.com/"), &["token=; Max-Age=0"]);
        assert!(store.all().is_empty());
    }

    #[test]
    fn test_replace_same_slot() {
        let store = InMemoryCookieStore::new();
        let origin = uri("http://example.com/");
        store.set_cookies(&origin, &["n=1"]);
        store.set_cookies(&origin, &["n=2"]);
        assert_eq!(store.cookies(&origin), vec![("n".to_string(), "2".to_string())]);
    }
}
