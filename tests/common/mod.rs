//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use vclient::http::{HttpClient, Request, Response, Version};

static TRACING: Once = Once::new();

/// Install a test subscriber; `RUST_LOG` selects the verbosity
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Client speaking HTTP/1.1 only
pub fn http1_client() -> HttpClient {
    HttpClient::builder().version(Version::Http11).build().unwrap()
}

pub fn get(uri: &str) -> Request {
    Request::builder().uri(uri).build().unwrap()
}

/// Send and read the whole body as text
pub fn fetch(client: &HttpClient, request: &Request) -> (Response, String) {
    let mut response = client.send(request).unwrap();
    let text = response.take_body().text().unwrap();
    (response, text)
}

/// Poll `cond` until it holds or `timeout` passes
pub fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let until = Instant::now() + timeout;
    while Instant::now() < until {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Listener that completes TCP handshakes but never reads or answers
pub fn silent_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Read one request head (and nothing more) from `stream`
pub fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(0) | Err(_) => break,
            Ok(_) => head.push(byte[0]),
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}
