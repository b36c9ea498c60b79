//! Request URIs
//!
//! Two construction modes are supported:
//!
//! - `Uri::parse` keeps the text exactly as supplied: existing percent
//!   escapes are preserved and non-ASCII characters are accepted verbatim.
//!   Illegal ASCII characters (spaces, controls, malformed escapes) are errors.
//! - `Uri::from_parts` quotes every character that is not legal in its
//!   component, including `%`, so arbitrary text can be placed in a path or
//!   query.
//!
//! In both modes non-ASCII characters stay in `as_str()`; the wire always uses
//! `to_ascii_string()`/`request_target()`, which percent-encode them as UTF-8.

use super::{Error, Result, DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS, NON_ALPHANUMERIC};
use std::fmt;

/// An absolute `http` or `https` URI
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Uri {
    raw: String,
    scheme: String,
    userinfo: Option<String>,
    host: String,
    port: Option<u16>,
    path: String,
    query: Option<String>,
    fragment: Option<String>,
}

/// Bytes escaped in a path: everything except pchar and `/`
const PATH: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'!')
    .remove(b'$')
    .remove(b'&')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b'*')
    .remove(b'+')
    .remove(b',')
    .remove(b';')
    .remove(b'=')
    .remove(b':')
    .remove(b'@')
    .remove(b'/');

/// Query and fragment also allow `?`
const QUERY: &AsciiSet = &PATH.remove(b'?');

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~')
}

fn is_sub_delim(b: u8) -> bool {
    matches!(b, b'!' | b'$' | b'&' | b'\'' | b'(' | b')' | b'*' | b'+' | b',' | b';' | b'=')
}

/// Characters legal in a path segment besides `/`
fn is_pchar(b: u8) -> bool {
    is_unreserved(b) || is_sub_delim(b) || b == b':' || b == b'@'
}

#[derive(Clone, Copy)]
enum Component {
    Path,
    Query,
}

impl Component {
    fn escapes(self) -> &'static AsciiSet {
        match self {
            Component::Path => PATH,
            Component::Query => QUERY,
        }
    }

    fn allows(self, b: u8) -> bool {
        match self {
            Component::Path => is_pchar(b) || b == b'/',
            Component::Query => is_pchar(b) || b == b'/' || b == b'?',
        }
    }
}

/// Quote characters not legal in `component`; non-ASCII is kept
fn quote(text: &str, component: Component) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while !rest.is_empty() {
        let ascii = rest.find(|c: char| !c.is_ascii()).unwrap_or(rest.len());
        out.extend(utf8_percent_encode(&rest[..ascii], component.escapes()));
        rest = &rest[ascii..];
        let other = rest.find(|c: char| c.is_ascii()).unwrap_or(rest.len());
        out.push_str(&rest[..other]);
        rest = &rest[other..];
    }
    out
}

/// Check one component of an as-is URI
fn check_component(text: &str, component: Component, what: &str) -> Result<()> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'%' {
            let valid = i + 2 < bytes.len()
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit();
            if !valid {
                return Err(Error::InvalidUri(format!(
                    "Malformed escape pair at index {} in {}: {}",
                    i, what, text
                )));
            }
            i += 3;
            continue;
        }
        if b.is_ascii() && !component.allows(b) {
            return Err(Error::InvalidUri(format!(
                "Illegal character {:?} in {}: {}",
                b as char, what, text
            )));
        }
        i += 1;
    }
    Ok(())
}

impl Uri {
    /// Parse an absolute URI, preserving its text as supplied
    pub fn parse(text: &str) -> Result<Uri> {
        let (scheme, rest) = text
            .split_once("://")
            .ok_or_else(|| Error::InvalidUri(format!("Not an absolute URI: {}", text)))?;
        let scheme = scheme.to_ascii_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(Error::InvalidUri(format!("Unsupported scheme: {}", text)));
        }

        let (before_fragment, fragment) = match rest.split_once('#') {
            Some((a, f)) => (a, Some(f.to_string())),
            None => (rest, None),
        };
        let (before_query, query) = match before_fragment.split_once('?') {
            Some((a, q)) => (a, Some(q.to_string())),
            None => (before_fragment, None),
        };
        let (authority, path) = match before_query.find('/') {
            Some(i) => (&before_query[..i], &before_query[i..]),
            None => (before_query, ""),
        };

        let (userinfo, hostport) = match authority.rsplit_once('@') {
            Some((u, h)) => (Some(u.to_string()), h),
            None => (None, authority),
        };

        let (host, port) = split_host_port(hostport, text)?;
        if host.is_empty() {
            return Err(Error::InvalidUri(format!("Missing host: {}", text)));
        }
        if host.bytes().any(|b| b.is_ascii() && !(is_unreserved(b) || is_sub_delim(b) || matches!(b, b'[' | b']' | b':' | b'%'))) {
            return Err(Error::InvalidUri(format!("Illegal character in authority: {}", text)));
        }

        check_component(path, Component::Path, "path")?;
        if let Some(ref q) = query {
            check_component(q, Component::Query, "query")?;
        }
        if let Some(ref f) = fragment {
            check_component(f, Component::Query, "fragment")?;
        }

        Ok(Uri {
            raw: text.to_string(),
            scheme,
            userinfo,
            host: host.to_string(),
            port,
            path: path.to_string(),
            query,
            fragment,
        })
    }

    /// Build a URI from components, quoting illegal characters
    ///
    /// `authority` is `host[:port]`; `path` should start with `/` or be empty.
    pub fn from_parts(
        scheme: &str,
        authority: &str,
        path: &str,
        query: Option<&str>,
        fragment: Option<&str>,
    ) -> Result<Uri> {
        let mut text = format!("{}://{}", scheme, authority);
        if !path.is_empty() && !path.starts_with('/') {
            return Err(Error::InvalidUri(format!("Relative path in absolute URI: {}", path)));
        }
        text.push_str(&quote(path, Component::Path));
        if let Some(q) = query {
            text.push('?');
            text.push_str(&quote(q, Component::Query));
        }
        if let Some(f) = fragment {
            text.push('#');
            text.push_str(&quote(f, Component::Query));
        }
        Uri::parse(&text)
    }

    /// The URI text as supplied
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The URI with non-ASCII characters percent-encoded as UTF-8
    pub fn to_ascii_string(&self) -> String {
        encode_non_ascii(&self.raw)
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn is_https(&self) -> bool {
        self.scheme == "https"
    }

    /// Host as written, with brackets for IPv6 literals
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Host suitable for resolving and for TLS SNI
    pub fn host_for_connect(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Explicit port or the scheme default
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(if self.is_https() {
            DEFAULT_HTTPS_PORT
        } else {
            DEFAULT_HTTP_PORT
        })
    }

    pub fn userinfo(&self) -> Option<&str> {
        self.userinfo.as_deref()
    }

    /// Raw path; empty when the URI has none
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn fragment(&self) -> Option<&str> {
        self.fragment.as_deref()
    }

    /// `host[:port]` as used in the `Host` header and `:authority`
    pub fn authority(&self) -> String {
        let host = encode_non_ascii(&self.host);
        match self.port {
            Some(port) if port != self.default_port() => format!("{}:{}", host, port),
            _ => host,
        }
    }

    /// `host:port` with the port always present, as used by CONNECT
    pub fn authority_with_port(&self) -> String {
        format!("{}:{}", encode_non_ascii(&self.host), self.port_or_default())
    }

    fn default_port(&self) -> u16 {
        if self.is_https() {
            DEFAULT_HTTPS_PORT
        } else {
            DEFAULT_HTTP_PORT
        }
    }

    /// Origin-form request target (path and query, ASCII-encoded)
    pub fn request_target(&self) -> String {
        let mut target = if self.path.is_empty() {
            "/".to_string()
        } else {
            encode_non_ascii(&self.path)
        };
        if let Some(ref q) = self.query {
            target.push('?');
            target.push_str(&encode_non_ascii(q));
        }
        target
    }

    /// Absolute-form request target for plain proxies (no fragment)
    pub fn absolute_target(&self) -> String {
        format!("{}://{}{}", self.scheme, self.authority(), self.request_target())
    }

    /// Scheme, host and port identify the same server
    pub fn same_origin(&self, other: &Uri) -> bool {
        self.scheme == other.scheme
            && self.host.eq_ignore_ascii_case(&other.host)
            && self.port_or_default() == other.port_or_default()
    }

    /// Resolve a reference (e.g. a `Location` value) against this URI
    pub fn resolve(&self, reference: &str) -> Result<Uri> {
        let reference = reference.trim();
        if let Some(colon) = reference.find(':') {
            let scheme = &reference[..colon];
            if !scheme.is_empty()
                && scheme.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'-' | b'.'))
                && !reference[..colon].contains('/')
            {
                return Uri::parse(reference);
            }
        }

        let base_authority = match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        };

        if let Some(rest) = reference.strip_prefix("//") {
            return Uri::parse(&format!("{}://{}", self.scheme, rest));
        }

        let (without_fragment, fragment) = match reference.split_once('#') {
            Some((a, f)) => (a, Some(f)),
            None => (reference, None),
        };
        let (ref_path, ref_query) = match without_fragment.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (without_fragment, None),
        };

        let (path, query) = if ref_path.is_empty() {
            (
                self.path.clone(),
                ref_query.map(str::to_string).or_else(|| self.query.clone()),
            )
        } else if ref_path.starts_with('/') {
            (remove_dot_segments(ref_path), ref_query.map(str::to_string))
        } else {
            let merged = match self.path.rfind('/') {
                Some(i) => format!("{}{}", &self.path[..=i], ref_path),
                None => format!("/{}", ref_path),
            };
            (remove_dot_segments(&merged), ref_query.map(str::to_string))
        };

        let mut text = format!("{}://{}{}", self.scheme, base_authority, path);
        if let Some(q) = query {
            text.push('?');
            text.push_str(&q);
        }
        if let Some(f) = fragment {
            text.push('#');
            text.push_str(f);
        }
        Uri::parse(&text)
    }
}

fn split_host_port<'a>(hostport: &'a str, text: &str) -> Result<(&'a str, Option<u16>)> {
    let invalid_port = || Error::InvalidUri(format!("Invalid port: {}", text));

    if hostport.starts_with('[') {
        let end = hostport
            .find(']')
            .ok_or_else(|| Error::InvalidUri(format!("Unterminated IPv6 literal: {}", text)))?;
        let host = &hostport[..=end];
        let rest = &hostport[end + 1..];
        return match rest.strip_prefix(':') {
            Some("") => Ok((host, None)),
            Some(p) => Ok((host, Some(p.parse().map_err(|_| invalid_port())?))),
            None if rest.is_empty() => Ok((host, None)),
            None => Err(invalid_port()),
        };
    }

    match hostport.rsplit_once(':') {
        Some((host, "")) => Ok((host, None)),
        Some((host, port)) => Ok((host, Some(port.parse().map_err(|_| invalid_port())?))),
        None => Ok((hostport, None)),
    }
}

/// Percent-encode every non-ASCII character as its UTF-8 octets
///
/// ASCII controls are escaped too; as-is parsing never lets them through.
pub fn encode_non_ascii(text: &str) -> String {
    utf8_percent_encode(text, CONTROLS).to_string()
}

/// RFC 3986 section 5.2.4
fn remove_dot_segments(path: &str) -> String {
    let mut output: Vec<&str> = Vec::new();
    let segments: Vec<&str> = path.split('/').collect();
    let last = segments.len().saturating_sub(1);

    for (i, segment) in segments.iter().enumerate() {
        match *segment {
            "." => {
                if i == last {
                    output.push("");
                }
            }
            ".." => {
                if output.len() > 1 {
                    output.pop();
                }
                if i == last {
                    output.push("");
                }
            }
            s => output.push(s),
        }
    }

    let joined = output.join("/");
    if joined.starts_with('/') {
        joined
    } else {
        format!("/{}", joined)
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl fmt::Debug for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uri({:?})", self.raw)
    }
}

impl std::str::FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Uri> {
        Uri::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_components() {
        let uri = Uri::parse("https://user@Example.com:8443/a/b?x=1#frag").unwrap();
        assert_eq!(uri.scheme(), "https");
        assert_eq!(uri.userinfo(), Some("user"));
        assert_eq!(uri.host(), "Example.com");
        assert_eq!(uri.port(), Some(8443));
        assert_eq!(uri.path(), "/a/b");
        assert_eq!(uri.query(), Some("x=1"));
        assert_eq!(uri.fragment(), Some("frag"));
        assert_eq!(uri.request_target(), "/a/b?x=1");
        assert_eq!(uri.authority(), "Example.com:8443");
    }

    #[test]
    fn test_default_ports() {
        let uri = Uri::parse("http://localhost").unwrap();
        assert_eq!(uri.port_or_default(), 80);
        assert_eq!(uri.request_target(), "/");
        assert_eq!(uri.authority(), "localhost");
        assert_eq!(uri.authority_with_port(), "localhost:80");

        let uri = Uri::parse("https://[::1]:443/").unwrap();
        assert_eq!(uri.host_for_connect(), "::1");
        assert_eq!(uri.authority(), "[::1]");
    }

    #[test]
    fn test_as_is_preserves_escapes_and_non_ascii() {
        let text = "http://localhost/%C3%A9t%C3%A9/caf\u{e9}?q=%2F\u{20ac}";
        let uri = Uri::parse(text).unwrap();
        assert_eq!(uri.as_str(), text);
        assert_eq!(
            uri.to_ascii_string(),
            "http://localhost/%C3%A9t%C3%A9/caf%C3%A9?q=%2F%E2%82%AC"
        );
        assert_eq!(uri.request_target(), "/%C3%A9t%C3%A9/caf%C3%A9?q=%2F%E2%82%AC");
    }

    #[test]
    fn test_as_is_rejects_illegal() {
        assert!(Uri::parse("http://localhost/a b").is_err());
        assert!(Uri::parse("http://localhost/%zz").is_err());
        assert!(Uri::parse("http://localhost/%4").is_err());
        assert!(Uri::parse("ftp://localhost/").is_err());
        assert!(Uri::parse("/relative").is_err());
        assert!(Uri::parse("http://localhost:notaport/").is_err());
    }

    #[test]
    fn test_from_parts_quotes() {
        let uri = Uri::from_parts("http", "localhost:8080", "/a b/100%", Some("k=v w"), None).unwrap();
        assert_eq!(uri.as_str(), "http://localhost:8080/a%20b/100%25?k=v%20w");

        let uri = Uri::from_parts("http", "localhost", "/caf\u{e9}", None, None).unwrap();
        assert_eq!(uri.as_str(), "http://localhost/caf\u{e9}");
        assert_eq!(uri.request_target(), "/caf%C3%A9");
    }

    #[test]
    fn test_resolve() {
        let base = Uri::parse("http://host:8080/a/b/c?q=1").unwrap();
        assert_eq!(base.resolve("/x").unwrap().as_str(), "http://host:8080/x");
        assert_eq!(base.resolve("d").unwrap().as_str(), "http://host:8080/a/b/d");
        assert_eq!(base.resolve("../d").unwrap().as_str(), "http://host:8080/a/d");
        assert_eq!(base.resolve("?z=2").unwrap().as_str(), "http://host:8080/a/b/c?z=2");
        assert_eq!(
            base.resolve("https://other/p").unwrap().as_str(),
            "https://other/p"
        );
        assert_eq!(base.resolve("//other:1/p").unwrap().as_str(), "http://other:1/p");
    }

    #[test]
    fn test_same_origin() {
        let a = Uri::parse("http://Host/a").unwrap();
        let b = Uri::parse("http://host:80/b").unwrap();
        let c = Uri::parse("https://host/b").unwrap();
        assert!(a.same_origin(&b));
        assert!(!a.same_origin(&c));
    }

    proptest! {
        #[test]
        fn prop_from_parts_round_trips_through_ascii(path in "/[a-zA-Z0-9 %?#\u{e9}\u{4e2d}\u{1f600}/]{0,24}") {
            let uri = Uri::from_parts("http", "localhost", &path, None, None).unwrap();
            let ascii = uri.to_ascii_string();
            prop_assert!(ascii.is_ascii());
            let reparsed = Uri::parse(&ascii).unwrap();
            prop_assert_eq!(reparsed.to_ascii_string(), ascii);
        }
    }
}
