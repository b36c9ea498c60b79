//! Authentication challenges against origins and proxies

mod common;

use common::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use vclient::http::auth::{AuthRequest, AuthTarget};
use vclient::http::server::{ReceivedRequest, Reply};
use vclient::http::{Credentials, ErrorKind, HttpClient, HttpServer, Proxy, Version};

const BASIC_USER_PW: &str = "Basic dXNlcjpwdw==";

fn basic_guard(req: &ReceivedRequest) -> Reply {
    match req.header("Authorization") {
        Some(BASIC_USER_PW) => Reply::ok("welcome"),
        _ => Reply::new(401).header("WWW-Authenticate", "Basic realm=\"fixture\""),
    }
}

fn client_with(credentials: Option<Credentials>) -> HttpClient {
    let builder = HttpClient::builder().version(Version::Http11);
    match credentials {
        Some(c) => builder.authenticator(c).build().unwrap(),
        None => builder.build().unwrap(),
    }
}

#[test]
fn test_basic_challenge_answered() {
    init_tracing();
    let server = HttpServer::start(basic_guard).unwrap();
    let client = client_with(Some(Credentials::new("user", "pw")));

    let (response, text) = fetch(&client, &get(&server.uri("/private")));
    assert_eq!(response.status().code(), 200);
    assert_eq!(text, "welcome");
    assert_eq!(response.previous_response().unwrap().status().code(), 401);
    assert_eq!(response.request().uri().path(), "/private");
}

#[test]
fn test_basic_credentials_sent_preemptively_afterwards() {
    let server = HttpServer::start(basic_guard).unwrap();
    let client = client_with(Some(Credentials::new("user", "pw")));

    fetch(&client, &get(&server.uri("/one")));
    let (response, _) = fetch(&client, &get(&server.uri("/two")));
    assert!(response.previous_response().is_none());

    let statuses: Vec<Option<String>> = server
        .requests()
        .iter()
        .map(|r| r.header("Authorization").map(str::to_string))
        .collect();
    assert_eq!(
        statuses,
        vec![None, Some(BASIC_USER_PW.to_string()), Some(BASIC_USER_PW.to_string())]
    );
}

#[test]
fn test_digest_challenge_answered() {
    let server = HttpServer::start(|req| match req.header("Authorization") {
        Some(value) if value.starts_with("Digest ") && value.contains("username=\"user\"") => {
            Reply::ok("digested")
        }
        _ => Reply::new(401).header(
            "WWW-Authenticate",
            "Digest realm=\"fixture\", qop=\"auth\", nonce=\"n0nce\", opaque=\"op\"",
        ),
    })
    .unwrap();
    let client = client_with(Some(Credentials::new("user", "pw")));

    let (response, text) = fetch(&client, &get(&server.uri("/dir/index.html")));
    assert_eq!(text, "digested");
    let answer = server.requests()[1].header("Authorization").unwrap().to_string();
    assert!(answer.contains("realm=\"fixture\""));
    assert!(answer.contains("uri=\"/dir/index.html\""));
    assert!(answer.contains("opaque=\"op\""));
    assert!(answer.contains("nc=00000001"));
    assert_eq!(response.status().code(), 200);
}

#[test]
fn test_authenticator_sees_challenge_context() {
    let server = HttpServer::start(basic_guard).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let port = server.port();
    let client = HttpClient::builder()
        .version(Version::Http11)
        .authenticator(move |request: &AuthRequest<'_>| {
            seen.fetch_add(1, Ordering::SeqCst);
            assert_eq!(request.target, AuthTarget::Server);
            assert_eq!(request.scheme.to_ascii_lowercase(), "basic");
            assert_eq!(request.realm, "fixture");
            assert_eq!(request.host, "127.0.0.1");
            assert_eq!(request.port, port);
            Some(Credentials::new("user", "pw"))
        })
        .build()
        .unwrap();

    let (response, _) = fetch(&client, &get(&server.uri("/")));
    assert_eq!(response.status().code(), 200);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_declined_challenge_returns_401() {
    let server = HttpServer::start(basic_guard).unwrap();
    let client = HttpClient::builder()
        .version(Version::Http11)
        .authenticator(|_: &AuthRequest<'_>| -> Option<Credentials> { None })
        .build()
        .unwrap();

    let (response, _) = fetch(&client, &get(&server.uri("/")));
    assert_eq!(response.status().code(), 401);
    assert_eq!(server.request_count(), 1);
}

#[test]
fn test_wrong_credentials_give_up() {
    let server = HttpServer::start(basic_guard).unwrap();
    let client = HttpClient::builder()
        .version(Version::Http11)
        .max_auth_attempts(3)
        .authenticator(Credentials::new("user", "wrong"))
        .build()
        .unwrap();

    let err = client.send(&get(&server.uri("/"))).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);
    assert_eq!(server.request_count(), 4);
}

#[test]
fn test_401_without_challenge_header() {
    let server = HttpServer::start(|_| Reply::new(401).body("no challenge")).unwrap();

    // Without an authenticator the response is the caller's business
    let (response, text) = fetch(&client_with(None), &get(&server.uri("/")));
    assert_eq!(response.status().code(), 401);
    assert_eq!(text, "no challenge");

    // With one, the missing header is an error naming it
    let err = client_with(Some(Credentials::new("user", "pw")))
        .send(&get(&server.uri("/")))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);
    assert!(err.to_string().contains("WWW-Authenticate"), "{}", err);
}

#[test]
fn test_407_without_challenge_header() {
    let proxy = HttpServer::start(|_| Reply::new(407)).unwrap();
    let builder = || {
        HttpClient::builder()
            .version(Version::Http11)
            .proxy(Proxy::from_addr(proxy.local_addr()))
    };

    let response = builder()
        .build()
        .unwrap()
        .send(&get("http://origin.test/resource"))
        .unwrap();
    assert_eq!(response.status().code(), 407);

    let err = builder()
        .authenticator(Credentials::new("user", "pw"))
        .build()
        .unwrap()
        .send(&get("http://origin.test/resource"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);
    assert!(err.to_string().contains("Proxy-Authenticate"), "{}", err);
}

#[test]
fn test_forward_proxy_challenge_answered() {
    let proxy = HttpServer::start(|req| match req.header("Proxy-Authorization") {
        Some(BASIC_USER_PW) => Reply::ok(format!("proxied {}", req.target)),
        _ => Reply::new(407).header("Proxy-Authenticate", "Basic realm=\"gateway\""),
    })
    .unwrap();
    let client = HttpClient::builder()
        .version(Version::Http11)
        .proxy(Proxy::from_addr(proxy.local_addr()))
        .authenticator(|request: &AuthRequest<'_>| {
            (request.target == AuthTarget::Proxy).then(|| Credentials::new("user", "pw"))
        })
        .build()
        .unwrap();

    let (response, text) = fetch(&client, &get("http://origin.test/resource"));
    assert_eq!(response.status().code(), 200);
    assert_eq!(text, "proxied http://origin.test/resource");
    assert!(server_saw_no_origin_credentials(&proxy.requests()));
}

fn server_saw_no_origin_credentials(requests: &[ReceivedRequest]) -> bool {
    requests.iter().all(|r| r.header("Authorization").is_none())
}
