//! HTTP/2 negotiation and stream multiplexing
//!
//! Covers the three ways a client ends up on HTTP/2 or not:
//! - ALPN during the TLS handshake
//! - `Upgrade: h2c` on a plaintext connection
//! - the forced HTTP/1.1 path through a plain proxy

mod common;

use common::*;
use std::thread;
use std::time::Duration;
use vclient::http::h2::server::{H2Request, H2Response, H2Server};
use vclient::http::server::Reply;
use vclient::http::tls::TlsConfig;
use bytes::Bytes;
use vclient::http::{
    body, ErrorKind, HttpClient, HttpServer, Proxy, Request, StreamLimitPolicy, Version,
};

fn echo_path(req: &H2Request) -> H2Response {
    H2Response::ok(format!("hello {}", req.path))
}

fn tls_h2_server() -> H2Server {
    let tls = TlsConfig::server().alpn(&["h2"]).build().unwrap();
    H2Server::builder().tls(tls).start(echo_path).unwrap()
}

#[test]
fn test_h2c_upgrade_then_reuse() {
    init_tracing();
    let server = H2Server::start(echo_path).unwrap();
    let client = HttpClient::new().unwrap();

    for i in 0..3 {
        let path = format!("/up/{}", i);
        let (response, text) = fetch(&client, &get(&server.uri(&path)));
        assert_eq!(response.version(), Version::Http2);
        assert_eq!(text, format!("hello {}", path));
    }
    assert_eq!(server.upgrades(), 1);
    assert_eq!(server.connections(), 1);
}

#[test]
fn test_upgrade_declined_by_http1_server() {
    let server = HttpServer::start(|req| {
        Reply::ok(req.header("Upgrade").unwrap_or("no upgrade").to_string())
    })
    .unwrap();
    let client = HttpClient::new().unwrap();

    let (response, text) = fetch(&client, &get(&server.uri("/")));
    assert_eq!(response.version(), Version::Http11);
    assert_eq!(text, "h2c");

    // The origin is remembered as HTTP/1.1 only
    let (_, text) = fetch(&client, &get(&server.uri("/")));
    assert_eq!(text, "no upgrade");
    assert_eq!(server.connections(), 1);
}

#[test]
fn test_alpn_selects_h2() {
    let server = tls_h2_server();
    let client = HttpClient::new().unwrap();

    let (response, text) = fetch(&client, &get(&server.uri("/secure")));
    assert_eq!(response.version(), Version::Http2);
    assert_eq!(text, "hello /secure");
    let ssl = response.ssl_session().unwrap();
    assert!(ssl.is_h2());
    assert_eq!(server.upgrades(), 0);
}

#[test]
fn test_alpn_falls_back_to_http1() {
    let tls = TlsConfig::server().alpn(&["http/1.1"]).build().unwrap();
    let server = HttpServer::start_tls(tls, |_| Reply::ok("classic")).unwrap();
    let client = HttpClient::new().unwrap();

    for _ in 0..3 {
        let (response, text) = fetch(&client, &get(&server.uri("/")));
        assert_eq!(response.version(), Version::Http11);
        assert_eq!(text, "classic");
    }
    assert_eq!(server.connections(), 1);
}

#[test]
fn test_http11_preference_skips_alpn_h2() {
    let server = HttpServer::start_tls(TlsConfig::server().alpn(&["h2", "http/1.1"]).build().unwrap(), |_| {
        Reply::ok("one point one")
    })
    .unwrap();
    let request = Request::builder()
        .uri(server.uri("/"))
        .version(Version::Http11)
        .build()
        .unwrap();
    let (response, text) = fetch(&HttpClient::new().unwrap(), &request);
    assert_eq!(response.version(), Version::Http11);
    assert_eq!(text, "one point one");
}

#[test]
fn test_plain_proxy_forces_http1() {
    let proxy = HttpServer::start(|req| {
        Reply::ok(format!(
            "{} upgrade={}",
            req.target,
            req.header("Upgrade").unwrap_or("none")
        ))
    })
    .unwrap();
    let client = HttpClient::builder()
        .version(Version::Http2)
        .proxy(Proxy::from_addr(proxy.local_addr()))
        .build()
        .unwrap();

    let (response, text) = fetch(&client, &get("http://origin.test:8080/path?q=1"));
    assert_eq!(response.version(), Version::Http11);
    assert_eq!(text, "http://origin.test:8080/path?q=1 upgrade=none");
}

#[test]
fn test_concurrent_requests_multiplexed() {
    let server = tls_h2_server();
    let client = HttpClient::builder().workers(8).build().unwrap();

    // One connection first, so the rest find it
    fetch(&client, &get(&server.uri("/warm")));
    let futures: Vec<_> = (0..20)
        .map(|i| client.send_async(&get(&server.uri(&format!("/m/{}", i)))))
        .collect();
    for (i, future) in futures.into_iter().enumerate() {
        let text = future.wait().unwrap().into_body().text().unwrap();
        assert_eq!(text, format!("hello /m/{}", i));
    }
    assert_eq!(server.connections(), 1);
}

#[test]
fn test_stream_limit_rejects_excess() {
    let server = H2Server::builder()
        .max_concurrent_streams(10)
        .start(echo_path)
        .unwrap();
    let client = HttpClient::builder()
        .workers(10)
        .stream_limit_policy(StreamLimitPolicy::Reject)
        .build()
        .unwrap();
    fetch(&client, &get(&server.uri("/warm")));

    server.hold();
    let futures: Vec<_> = (0..10)
        .map(|i| client.send_async(&get(&server.uri(&format!("/held/{}", i)))))
        .collect();
    assert!(eventually(Duration::from_secs(5), || server.open_streams() == 10));

    let err = client.send(&get(&server.uri("/one-too-many"))).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TooManyStreams);

    server.release();
    for future in futures {
        let response = future.wait().unwrap();
        assert_eq!(response.status().code(), 200);
    }
    assert_eq!(server.max_open_streams(), 10);

    // The rejected request did not leave a slot behind
    let (response, text) = fetch(&client, &get(&server.uri("/after")));
    assert_eq!(response.status().code(), 200);
    assert_eq!(text, "hello /after");
    assert_eq!(server.connections(), 1);
}

#[test]
fn test_stream_limit_queues_excess() {
    let server = H2Server::builder()
        .max_concurrent_streams(2)
        .start(echo_path)
        .unwrap();
    let client = HttpClient::builder()
        .workers(6)
        .stream_limit_policy(StreamLimitPolicy::Queue)
        .build()
        .unwrap();
    fetch(&client, &get(&server.uri("/warm")));

    server.hold();
    let futures: Vec<_> = (0..6)
        .map(|i| client.send_async(&get(&server.uri(&format!("/q/{}", i)))))
        .collect();
    assert!(eventually(Duration::from_secs(5), || server.open_streams() == 2));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(server.open_streams(), 2);

    server.release();
    for future in futures {
        assert_eq!(future.wait().unwrap().status().code(), 200);
    }
    assert_eq!(server.max_open_streams(), 2);
}

#[test]
fn test_goaway_moves_to_new_connection() {
    let tls = TlsConfig::server().alpn(&["h2"]).build().unwrap();
    let server = H2Server::builder()
        .tls(tls)
        .goaway_after(1)
        .start(echo_path)
        .unwrap();
    let client = HttpClient::new().unwrap();

    for i in 0..4 {
        let path = format!("/g/{}", i);
        let (response, text) = fetch(&client, &get(&server.uri(&path)));
        assert_eq!(response.version(), Version::Http2);
        assert_eq!(text, format!("hello {}", path));
    }
    assert!(server.connections() >= 2, "{} connections", server.connections());
    assert_eq!(server.request_count(), 4);
}

#[test]
fn test_h2_request_timeout_resets_stream() {
    let tls = TlsConfig::server().alpn(&["h2"]).build().unwrap();
    let server = H2Server::builder()
        .tls(tls)
        .hold_responses()
        .start(echo_path)
        .unwrap();
    let client = HttpClient::new().unwrap();

    let request = Request::builder()
        .uri(server.uri("/slow"))
        .timeout(Duration::from_millis(100))
        .build()
        .unwrap();
    let err = client.send(&request).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RequestTimeout);

    server.release();
    let (response, text) = fetch(&client, &get(&server.uri("/fast")));
    assert_eq!(response.status().code(), 200);
    assert_eq!(text, "hello /fast");
    assert_eq!(server.connections(), 1);
}

#[test]
fn test_body_request_reuses_h2c_connection() {
    let server = H2Server::start(|req: &H2Request| {
        H2Response::ok(format!("{} {} {}", req.method, req.path, req.body.len()))
    })
    .unwrap();
    let client = HttpClient::new().unwrap();

    let (response, text) = fetch(&client, &get(&server.uri("/first")));
    assert_eq!(response.version(), Version::Http2);
    assert_eq!(text, "GET /first 0");

    let request = Request::builder()
        .uri(server.uri("/form"))
        .post(body::text("name=value"))
        .build()
        .unwrap();
    let (response, text) = fetch(&client, &request);
    assert_eq!(response.version(), Version::Http2);
    assert_eq!(text, "POST /form 10");
    assert_eq!(server.upgrades(), 1);
    assert_eq!(server.connections(), 1);
}

#[test]
fn test_h2_body_length_mismatch_keeps_connection() {
    let server = tls_h2_server();
    let client = HttpClient::new().unwrap();
    fetch(&client, &get(&server.uri("/warm")));
    let payload = vec![b'x'; 10];

    for (i, delta) in [-3i64, -1, 1, 3].into_iter().enumerate() {
        let declared = (payload.len() as i64 + delta) as u64;
        let body = body::declared_length(body::bytes(payload.clone()), declared);
        let builder = Request::builder().uri(server.uri("/upload"));
        let request = if i % 2 == 0 { builder.post(body) } else { builder.put(body) };
        let err = client.send(&request.build().unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BodyLengthMismatch, "delta {}", delta);
        let expected = if delta < 0 { "too many" } else { "too few" };
        assert!(err.to_string().contains(expected), "{}", err);

        let path = format!("/after/{}", i);
        let (response, text) = fetch(&client, &get(&server.uri(&path)));
        assert_eq!(response.version(), Version::Http2);
        assert_eq!(text, format!("hello {}", path));
    }
    assert_eq!(server.connections(), 1);
}

#[test]
fn test_unread_body_holds_back_server() {
    const SIZE: usize = 1 << 20;
    let payload = Bytes::from((0..SIZE).map(|i| (i % 251) as u8).collect::<Vec<u8>>());
    let expected = payload.clone();
    let tls = TlsConfig::server().alpn(&["h2"]).build().unwrap();
    let server = H2Server::builder()
        .tls(tls)
        .start(move |_: &H2Request| H2Response::ok(payload.clone()))
        .unwrap();
    let client = HttpClient::new().unwrap();

    let response = client.send(&get(&server.uri("/large"))).unwrap();
    assert_eq!(response.version(), Version::Http2);
    assert!(eventually(Duration::from_secs(2), || server.unsent_body_bytes() > 0));
    thread::sleep(Duration::from_millis(100));
    // Nothing was read, so only about one stream window has left the server
    let unsent = server.unsent_body_bytes();
    assert!(unsent >= SIZE / 2, "{} bytes still unsent", unsent);

    let body = response.into_body().bytes().unwrap();
    assert_eq!(body.len(), SIZE);
    assert!(body == expected);
    assert!(eventually(Duration::from_secs(2), || server.unsent_body_bytes() == 0));
}

#[test]
fn test_large_upload_follows_server_window() {
    const CHUNKS: usize = 64;
    let tls = TlsConfig::server().alpn(&["h2"]).build().unwrap();
    let server = H2Server::builder()
        .tls(tls)
        .initial_window_size(16_384)
        .start(|req: &H2Request| H2Response::ok(req.body.len().to_string()))
        .unwrap();
    let client = HttpClient::new().unwrap();

    let upload = body::iter(|| (0..CHUNKS).map(|i| Ok(Bytes::from(vec![i as u8; 16 * 1024]))));
    let request = Request::builder()
        .uri(server.uri("/upload"))
        .post(upload)
        .build()
        .unwrap();
    let (response, text) = fetch(&client, &request);
    assert_eq!(response.version(), Version::Http2);
    assert_eq!(text, (CHUNKS * 16 * 1024).to_string());

    let received = &server.requests()[0].body;
    for (i, chunk) in received.chunks(16 * 1024).enumerate() {
        assert!(chunk.iter().all(|b| *b == i as u8), "chunk {}", i);
    }
}

#[test]
fn test_request_target_encoded_on_every_transport() {
    const RAW: &str = "/caf\u{e9}/%41?x=\u{4e2d}";
    const WIRE: &str = "/caf%C3%A9/%41?x=%E4%B8%AD";

    let h1_plain = HttpServer::start(|req| Reply::ok(req.target.clone())).unwrap();
    let tls = TlsConfig::server().alpn(&["http/1.1"]).build().unwrap();
    let h1_tls = HttpServer::start_tls(tls, |req| Reply::ok(req.target.clone())).unwrap();
    let h2_plain = H2Server::start(|req: &H2Request| H2Response::ok(req.path.clone())).unwrap();
    let tls = TlsConfig::server().alpn(&["h2"]).build().unwrap();
    let h2_tls = H2Server::builder()
        .tls(tls)
        .start(|req: &H2Request| H2Response::ok(req.path.clone()))
        .unwrap();
    let client = HttpClient::new().unwrap();

    let cases = [
        ("h1 plain", h1_plain.uri(RAW), Version::Http11),
        ("h1 tls", h1_tls.uri(RAW), Version::Http11),
        // Once through the upgrade request, once as a HEADERS frame
        ("h2c upgrade", h2_plain.uri(RAW), Version::Http2),
        ("h2c", h2_plain.uri(RAW), Version::Http2),
        ("h2 tls", h2_tls.uri(RAW), Version::Http2),
    ];
    for (name, uri, version) in cases {
        let (response, text) = fetch(&client, &get(&uri));
        assert_eq!(response.version(), version, "{}", name);
        assert_eq!(text, WIRE, "{}", name);
    }
    assert_eq!(h2_plain.upgrades(), 1);
}
