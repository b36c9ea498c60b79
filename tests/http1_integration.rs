//! HTTP/1.1 exchanges end to end
//!
//! Every test runs the real client against a scripted fixture server or a
//! hand-driven socket on the loopback interface.

mod common;

use common::*;
use std::io::Write;
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use vclient::http::server::Reply;
use vclient::http::{
    body, ErrorKind, HttpClient, HttpServer, InMemoryCookieStore, Method, PoolConfig, Request,
    Version,
};

#[test]
fn test_get_and_read_body() {
    init_tracing();
    let server = HttpServer::start(|req| Reply::ok(format!("hello {}", req.target))).unwrap();
    let client = http1_client();

    let (response, text) = fetch(&client, &get(&server.uri("/greet")));
    assert_eq!(response.status().code(), 200);
    assert_eq!(response.version(), Version::Http11);
    assert_eq!(response.headers().get("Content-Type"), Some("text/plain"));
    assert_eq!(text, "hello /greet");

    let seen = &server.requests()[0];
    assert_eq!(seen.method, Method::Get);
    assert_eq!(seen.header("Host"), Some(format!("127.0.0.1:{}", server.port()).as_str()));
}

#[test]
fn test_post_body_with_length() {
    let server = HttpServer::start(|req| Reply::ok(req.body.clone())).unwrap();
    let client = http1_client();

    let request = Request::builder()
        .uri(server.uri("/echo"))
        .post(body::text("ping pong"))
        .build()
        .unwrap();
    let (_, text) = fetch(&client, &request);
    assert_eq!(text, "ping pong");

    let seen = &server.requests()[0];
    assert_eq!(seen.header("Content-Length"), Some("9"));
    assert!(seen.header("Transfer-Encoding").is_none());
}

#[test]
fn test_streaming_body_is_chunked() {
    let server = HttpServer::start(|req| Reply::ok(req.body.clone())).unwrap();
    let client = http1_client();

    let request = Request::builder()
        .uri(server.uri("/echo"))
        .post(body::streaming(vec!["ab".into(), "cd".into(), "ef".into()]))
        .build()
        .unwrap();
    let (_, text) = fetch(&client, &request);
    assert_eq!(text, "abcdef");
    assert_eq!(server.requests()[0].header("Transfer-Encoding"), Some("chunked"));
}

#[test]
fn test_chunked_and_until_close_responses() {
    let server = HttpServer::start(|req| match req.target.as_str() {
        "/chunked" => Reply::ok("").chunked(vec!["one ", "two ", "three"]),
        _ => Reply::ok("streamed to the end").until_close(),
    })
    .unwrap();
    let client = http1_client();

    let (_, text) = fetch(&client, &get(&server.uri("/chunked")));
    assert_eq!(text, "one two three");
    let (_, text) = fetch(&client, &get(&server.uri("/close")));
    assert_eq!(text, "streamed to the end");
}

#[test]
fn test_response_split_byte_by_byte() {
    let server = HttpServer::start(|_| {
        Reply::ok("")
            .chunked(vec!["split ", "across ", "reads"])
            .byte_by_byte(Duration::from_micros(200))
    })
    .unwrap();
    let client = http1_client();

    for _ in 0..2 {
        let (response, text) = fetch(&client, &get(&server.uri("/slow")));
        assert_eq!(response.status().code(), 200);
        assert_eq!(text, "split across reads");
    }
    assert_eq!(server.connections(), 1);
}

#[test]
fn test_discarded_body_releases_connection() {
    let server = HttpServer::start(|_| Reply::ok("x".repeat(10_000))).unwrap();
    let client = http1_client();

    let response = client.send(&get(&server.uri("/big"))).unwrap();
    response.into_body().discard().unwrap();
    let (_, text) = fetch(&client, &get(&server.uri("/big")));
    assert_eq!(text.len(), 10_000);
    assert_eq!(server.connections(), 1);
}

#[test]
fn test_interim_response_skipped() {
    let server = HttpServer::start(|_| Reply::ok("after continue").interim(100)).unwrap();
    let (response, text) = fetch(&http1_client(), &get(&server.uri("/")));
    assert_eq!(response.status().code(), 200);
    assert_eq!(text, "after continue");
}

#[test]
fn test_head_has_no_body() {
    let server = HttpServer::start(|_| Reply::ok("invisible")).unwrap();
    let request = Request::builder().uri(server.uri("/")).head().build().unwrap();
    let (response, text) = fetch(&http1_client(), &request);
    assert_eq!(response.headers().get("Content-Length"), Some("9"));
    assert!(text.is_empty());
}

#[test]
fn test_connection_reused_after_body_read() {
    let server = HttpServer::start(|_| Reply::ok("again")).unwrap();
    let client = http1_client();

    for _ in 0..5 {
        let (_, text) = fetch(&client, &get(&server.uri("/")));
        assert_eq!(text, "again");
    }
    assert_eq!(server.connections(), 1);
    assert_eq!(client.connection_stats().opened(), 1);
}

#[test]
fn test_http10_response_not_pooled() {
    let server = HttpServer::start(|_| Reply::ok("old").http10()).unwrap();
    let client = http1_client();

    for _ in 0..3 {
        let (response, text) = fetch(&client, &get(&server.uri("/")));
        assert_eq!(response.version(), Version::Http10);
        assert_eq!(text, "old");
    }
    assert_eq!(server.connections(), 3);
}

#[test]
fn test_same_request_sent_repeatedly() {
    let server = HttpServer::start(|req| Reply::ok(req.body.clone())).unwrap();
    let client = http1_client();
    let request = Request::builder()
        .uri(server.uri("/again"))
        .put(body::bytes(&b"same payload"[..]))
        .build()
        .unwrap();

    for _ in 0..3 {
        let (_, text) = fetch(&client, &request);
        assert_eq!(text, "same payload");
    }
    let seen = server.requests();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|r| r.body == b"same payload" && r.method == Method::Put));
}

#[test]
fn test_uri_round_trip() {
    let server = HttpServer::start(|_| Reply::ok("")).unwrap();
    let client = http1_client();
    let paths = [
        "/plain",
        "/with%20space/?q=a%2Fb&x=1",
        "/a/b/c/?empty=",
        "/unicode/%E2%82%AC",
    ];

    for path in paths {
        let uri = server.uri(path);
        let (response, _) = fetch(&client, &get(&uri));
        assert_eq!(response.uri().as_str(), uri);
        assert_eq!(response.request().uri().as_str(), uri);
    }
    let targets: Vec<String> = server.requests().into_iter().map(|r| r.target).collect();
    assert_eq!(targets, paths);
}

#[test]
fn test_body_length_mismatch() {
    let server = HttpServer::start(|req| Reply::ok(format!("{} {}", req.method.as_str(), req.target))).unwrap();
    let client = http1_client();
    let payload = vec![b'x'; 10];

    for (i, delta) in [-3i64, -2, -1, 1, 2, 3].into_iter().enumerate() {
        let declared = (payload.len() as i64 + delta) as u64;
        let body = body::declared_length(body::bytes(payload.clone()), declared);
        let builder = Request::builder().uri(server.uri("/upload"));
        let request = if i % 2 == 0 { builder.post(body) } else { builder.put(body) };
        let err = client.send(&request.build().unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BodyLengthMismatch, "delta {}", delta);
        let message = err.to_string();
        if delta < 0 {
            assert!(message.contains("too many"), "{}", message);
        } else {
            assert!(message.contains("too few"), "{}", message);
        }

        let path = format!("/after/{}", i);
        let (response, text) = fetch(&client, &get(&server.uri(&path)));
        assert_eq!(response.status().code(), 200);
        assert_eq!(text, format!("GET {}", path));
    }
}

#[test]
fn test_truncated_response_body() {
    let server = HttpServer::start(|_| Reply::ok("short").truncated(100)).unwrap();
    let response = http1_client().send(&get(&server.uri("/"))).unwrap();
    let err = response.into_body().bytes().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Body);
}

#[test]
fn test_idempotent_request_retried_once() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = thread::spawn(move || {
        // First connection: read the request, then hang up without answering
        let (mut first, _) = listener.accept().unwrap();
        let head = read_head(&mut first);
        drop(first);
        let (mut second, _) = listener.accept().unwrap();
        let retried = read_head(&mut second);
        second
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .unwrap();
        (head, retried)
    });

    let client = http1_client();
    let (response, text) = fetch(&client, &get(&format!("http://{}/flaky", addr)));
    assert_eq!(response.status().code(), 200);
    assert_eq!(text, "ok");

    let (head, retried) = handle.join().unwrap();
    assert!(head.starts_with("GET /flaky HTTP/1.1"));
    assert_eq!(head, retried);
}

#[test]
fn test_retry_keeps_cookie_state() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = thread::spawn(move || {
        // Set a cookie, then hang up on the next request of the same connection
        let (mut first, _) = listener.accept().unwrap();
        read_head(&mut first);
        first
            .write_all(b"HTTP/1.1 200 OK\r\nSet-Cookie: id=42; Path=/\r\nContent-Length: 2\r\n\r\nin")
            .unwrap();
        let dropped = read_head(&mut first);
        drop(first);
        let (mut second, _) = listener.accept().unwrap();
        let retried = read_head(&mut second);
        second
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\n\r\nprofile")
            .unwrap();
        (dropped, retried)
    });

    let client = HttpClient::builder()
        .version(Version::Http11)
        .cookie_store(Arc::new(InMemoryCookieStore::new()))
        .build()
        .unwrap();
    let (_, text) = fetch(&client, &get(&format!("http://{}/login", addr)));
    assert_eq!(text, "in");
    let (response, text) = fetch(&client, &get(&format!("http://{}/profile", addr)));
    assert_eq!(response.status().code(), 200);
    assert_eq!(text, "profile");

    let (dropped, retried) = handle.join().unwrap();
    assert!(dropped.contains("Cookie: id=42"), "{}", dropped);
    assert!(retried.contains("Cookie: id=42"), "{}", retried);
}

#[test]
fn test_post_not_retried_by_default() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        read_head(&mut conn);
        drop(conn);
        listener.set_nonblocking(true).unwrap();
        thread::sleep(Duration::from_millis(200));
        listener.accept().is_ok()
    });

    let request = Request::builder()
        .uri(format!("http://{}/submit", addr))
        .post(body::empty())
        .build()
        .unwrap();
    let err = http1_client().send(&request).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert!(!handle.join().unwrap(), "POST must not be resent");
}

#[test]
fn test_concurrent_requests_share_pool() {
    let server = HttpServer::start(|req| Reply::ok(req.target.clone())).unwrap();
    let client = http1_client();
    let uri = Arc::new(server.uri(""));

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let client = client.clone();
            let uri = Arc::clone(&uri);
            thread::spawn(move || {
                for i in 0..5 {
                    let path = format!("/t{}/r{}", t, i);
                    let (_, text) = fetch(&client, &get(&format!("{}{}", uri, path)));
                    assert_eq!(text, path);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(server.request_count(), 40);
    assert!(server.connections() <= 8, "{} connections", server.connections());
}

#[test]
fn test_send_async_completes() {
    let server = HttpServer::start(|_| Reply::ok("later").delay(Duration::from_millis(20))).unwrap();
    let client = HttpClient::builder()
        .version(Version::Http11)
        .workers(2)
        .build()
        .unwrap();

    let futures: Vec<_> = (0..4).map(|_| client.send_async(&get(&server.uri("/")))).collect();
    for future in futures {
        let response = future.wait().unwrap();
        assert_eq!(response.into_body().text().unwrap(), "later");
    }
}

#[test]
fn test_send_async_polled_by_executor() {
    let server = HttpServer::start(|_| Reply::ok("polled")).unwrap();
    let client = http1_client();
    let response = futures_lite::future::block_on(client.send_async(&get(&server.uri("/")))).unwrap();
    assert_eq!(response.into_body().text().unwrap(), "polled");
}

#[test]
fn test_dropping_body_closes_connection() {
    let big = vec![b'z'; 1 << 20];
    let server = HttpServer::start(move |_| Reply::ok(big.clone())).unwrap();
    let client = http1_client();

    let response = client.send(&get(&server.uri("/big"))).unwrap();
    drop(response);
    assert!(eventually(Duration::from_secs(2), || client.connection_stats().open() == 0));

    let (_, text) = fetch(&client, &get(&server.uri("/big")));
    assert_eq!(text.len(), 1 << 20);
    assert_eq!(server.connections(), 2);
}

#[test]
fn test_concurrent_requests_with_closing_connections() {
    let served = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&served);
    let server = HttpServer::start(move |req| {
        let reply = Reply::ok(req.target.clone());
        // Every other response ends its connection
        if counter.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
            reply.close()
        } else {
            reply
        }
    })
    .unwrap();
    let client = HttpClient::builder()
        .version(Version::Http11)
        .pool(PoolConfig {
            idle_timeout: Duration::from_millis(100),
            ..PoolConfig::default()
        })
        .build()
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let client = client.clone();
            let uri = server.uri("");
            thread::spawn(move || {
                for i in 0..10 {
                    let path = format!("/t{}/r{}", t, i);
                    let (response, text) = fetch(&client, &get(&format!("{}{}", uri, path)));
                    assert_eq!(response.status().code(), 200);
                    assert_eq!(text, path);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(served.load(Ordering::SeqCst), 80);
    assert!(server.connections() >= 40, "{} connections", server.connections());
    let stats = client.connection_stats();
    assert!(eventually(Duration::from_secs(5), || stats.open() == 0), "{} open", stats.open());
    assert_eq!(stats.opened(), stats.closed());
}
