//! End-to-end tests against a live proxy and throwaway origins on loopback

use super::*;
use crate::config::ProxyConfig;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};

const LIMIT: Duration = Duration::from_secs(10);

fn test_config() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listen_addr = "127.0.0.1:0".parse().unwrap();
    config.worker_threads = 2;
    config.worker.poll_interval_ms = 20;
    config.tunnel.poll_interval_ms = 20;
    config
}

async fn start_proxy() -> (ServerHandle, SocketAddr) {
    start_proxy_with(test_config()).await
}

async fn start_proxy_with(config: ProxyConfig) -> (ServerHandle, SocketAddr) {
    let server = ProxyServer::bind(config).unwrap();
    let handle = server.spawn();
    let addr = handle.local_addr().unwrap();
    (handle, addr)
}

/// Origin that answers every connection with `response` and counts connections
async fn start_origin(response: &'static str) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });

    (addr, hits)
}

async fn roundtrip(proxy: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(request).await.unwrap();
    let mut response = Vec::new();
    timeout(LIMIT, client.read_to_end(&mut response)).await.unwrap().unwrap();
    response
}

fn get(origin: SocketAddr, path: &str) -> Vec<u8> {
    format!("GET {} HTTP/1.1\r\nHost: {}\r\nProxy-Connection: keep-alive\r\n\r\n", path, origin).into_bytes()
}

/// Origin that echoes every byte of a single connection back
async fn start_echo_origin() -> SocketAddr {
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = echo.accept().await {
            let mut buf = [0u8; 1024];
            while let Ok(n) = stream.read(&mut buf).await {
                if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    });
    addr
}

/// Read from `stream` until the bytes received so far contain `needle`
async fn read_until(stream: &mut TcpStream, needle: &[u8]) -> Vec<u8> {
    let mut received = Vec::new();
    while !received.windows(needle.len()).any(|w| w == needle) {
        let mut buf = [0u8; 256];
        let n = timeout(LIMIT, stream.read(&mut buf)).await.unwrap().unwrap();
        assert!(n > 0, "connection closed before {:?}", String::from_utf8_lossy(needle));
        received.extend_from_slice(&buf[..n]);
    }
    received
}

/// Read the request head from an origin-side stream, recording every byte
async fn read_request_head(stream: &mut TcpStream, seen: &Mutex<Vec<u8>>) -> bool {
    let mut buf = [0u8; 1024];
    loop {
        if seen.lock().unwrap().windows(4).any(|w| w == b"\r\n\r\n") {
            return true;
        }
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return false,
            Ok(n) => {
                seen.lock().unwrap().extend_from_slice(&buf[..n]);
            }
        }
    }
}

const OK: &str = "HTTP/1.1 200 OK\r\nETag: \"v1\"\r\nContent-Length: 5\r\n\r\nhello";

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forward_then_serve_from_cache() {
    let (origin, hits) = start_origin(OK).await;
    let (proxy, proxy_addr) = start_proxy().await;

    let first = roundtrip(proxy_addr, &get(origin, "/page")).await;
    assert_eq!(first, OK.as_bytes());
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let second = roundtrip(proxy_addr, &get(origin, "/page")).await;
    assert_eq!(second, OK.as_bytes());
    assert_eq!(hits.load(Ordering::SeqCst), 1, "cache hit must not reach the origin");

    let key = format!("127.0.0.1:{}:/page", origin.port());
    assert_eq!(proxy.cache().get(&key).unwrap().etag.as_deref(), Some("\"v1\""));

    let stats = proxy.shutdown().await;
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 1);
    assert_eq!(stats.accepted, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_request_split_across_writes() {
    let (origin, _) = start_origin(OK).await;
    let (proxy, proxy_addr) = start_proxy().await;

    let request = get(origin, "/split");
    let (head, tail) = request.split_at(10);
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(head).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.write_all(tail).await.unwrap();

    let mut response = Vec::new();
    timeout(LIMIT, client.read_to_end(&mut response)).await.unwrap().unwrap();
    assert_eq!(response, OK.as_bytes());
    proxy.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_non_200_is_relayed_but_not_cached() {
    let not_found = "HTTP/1.1 404 Not Found\r\nContent-Length: 4\r\n\r\nnope";
    let (origin, hits) = start_origin(not_found).await;
    let (proxy, proxy_addr) = start_proxy().await;

    for _ in 0..2 {
        let response = roundtrip(proxy_addr, &get(origin, "/missing")).await;
        assert_eq!(response, not_found.as_bytes());
    }
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert!(proxy.cache().is_empty());
    proxy.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_host_is_bad_request() {
    let (proxy, proxy_addr) = start_proxy().await;

    let response = roundtrip(proxy_addr, b"GET /x HTTP/1.1\r\nAccept: */*\r\n\r\n").await;
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(text.ends_with("\r\n\r\nBad Request"));

    let stats = proxy.shutdown().await;
    assert_eq!(stats.bad_requests, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreachable_origin_is_bad_gateway() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = closed.local_addr().unwrap().port();
    drop(closed);
    let (proxy, proxy_addr) = start_proxy().await;

    let request = format!("GET / HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n", port);
    let response = roundtrip(proxy_addr, request.as_bytes()).await;
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 502 Bad Gateway\r\n"));

    let stats = proxy.shutdown().await;
    assert_eq!(stats.upstream_failures, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_tunnel_echo() {
    let echo_addr = start_echo_origin().await;
    let (proxy, proxy_addr) = start_proxy().await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let request = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", echo_addr);
    client.write_all(request.as_bytes()).await.unwrap();

    let reply = read_until(&mut client, b"\r\n\r\n").await;
    assert!(reply.starts_with(b"HTTP/1.1 200 Connection established\r\n"));

    client.write_all(b"through the tunnel").await.unwrap();
    let mut echoed = [0u8; 18];
    timeout(LIMIT, client.read_exact(&mut echoed)).await.unwrap().unwrap();
    assert_eq!(&echoed, b"through the tunnel");

    drop(client);
    let stats = proxy.shutdown().await;
    assert_eq!(stats.tunnels, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_to_closed_port_is_bad_gateway() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = closed.local_addr().unwrap();
    drop(closed);
    let (proxy, proxy_addr) = start_proxy().await;

    let request = format!("CONNECT {} HTTP/1.1\r\n\r\n", addr);
    let response = roundtrip(proxy_addr, request.as_bytes()).await;
    assert!(response.starts_with(b"HTTP/1.1 502 Bad Gateway\r\n"));
    proxy.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_closes_idle_clients() {
    let (proxy, proxy_addr) = start_proxy().await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(b"GET / HTT").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(proxy.open_connections(), 1);

    timeout(LIMIT, proxy.shutdown()).await.unwrap();

    let mut rest = Vec::new();
    let read = timeout(LIMIT, client.read_to_end(&mut rest)).await.unwrap();
    assert!(read.map(|n| n == 0).unwrap_or(true));
    assert!(TcpStream::connect(proxy_addr).await.is_err());
}

const FIRST: &str = "HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nfirst!";

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bytes_after_forwarded_request_never_reach_origin() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        if !read_request_head(&mut stream, &record).await {
            return;
        }
        // Keep listening a while so anything relayed late is captured
        let mut buf = [0u8; 1024];
        let deadline = tokio::time::Instant::now() + Duration::from_millis(300);
        while let Ok(Ok(n)) = tokio::time::timeout_at(deadline, stream.read(&mut buf)).await {
            if n == 0 {
                break;
            }
            record.lock().unwrap().extend_from_slice(&buf[..n]);
        }
        let _ = stream.write_all(FIRST.as_bytes()).await;
    });
    let (proxy, proxy_addr) = start_proxy().await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(&get(origin, "/a")).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    client.write_all(&get(origin, "/b")).await.unwrap();

    let mut response = Vec::new();
    timeout(LIMIT, client.read_to_end(&mut response)).await.unwrap().unwrap();
    assert_eq!(response, FIRST.as_bytes());

    let upstream = String::from_utf8(seen.lock().unwrap().clone()).unwrap();
    assert!(upstream.starts_with("GET /a HTTP/1.1\r\n"));
    assert!(!upstream.contains("GET /b"), "origin saw a second request: {:?}", upstream);

    let key = format!("127.0.0.1:{}:/a", origin.port());
    assert_eq!(proxy.cache().get(&key).unwrap().data, FIRST.as_bytes());
    assert_eq!(proxy.cache().len(), 1);
    proxy.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_response_streams_before_origin_finishes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = listener.local_addr().unwrap();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        if !read_request_head(&mut stream, &Mutex::new(Vec::new())).await {
            return;
        }
        let _ = stream.write_all(b"HTTP/1.1 200 OK\r\n\r\nfirst").await;
        let _ = release_rx.await;
        let _ = stream.write_all(b"second").await;
    });
    let (proxy, proxy_addr) = start_proxy().await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(&get(origin, "/stream")).await.unwrap();

    // The origin is still holding "second" back at this point
    let mut response = read_until(&mut client, b"first").await;
    release_tx.send(()).unwrap();
    timeout(LIMIT, client.read_to_end(&mut response)).await.unwrap().unwrap();
    assert_eq!(response, b"HTTP/1.1 200 OK\r\n\r\nfirstsecond");

    let key = format!("127.0.0.1:{}:/stream", origin.port());
    assert_eq!(proxy.cache().get(&key).unwrap().data, &b"HTTP/1.1 200 OK\r\n\r\nfirstsecond"[..]);
    proxy.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oversized_request_headers_are_rejected() {
    let mut config = test_config();
    config.worker.max_request_header_bytes = 1024;
    let (proxy, proxy_addr) = start_proxy_with(config).await;

    let mut request = b"GET / HTTP/1.1\r\nHost: example.com\r\nX-Fill: ".to_vec();
    request.resize(2000, b'a');
    let response = roundtrip(proxy_addr, &request).await;
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 400 Bad Request\r\n"));

    let stats = proxy.shutdown().await;
    assert_eq!(stats.bad_requests, 1);
}

const BIG: &str = "HTTP/1.1 200 OK\r\nContent-Length: 40\r\n\r\n0123456789012345678901234567890123456789";

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oversized_response_is_relayed_but_not_cached() {
    let (origin, hits) = start_origin(BIG).await;
    let mut config = test_config();
    config.cache.max_entry_bytes = 16;
    let (proxy, proxy_addr) = start_proxy_with(config).await;

    for _ in 0..2 {
        let response = roundtrip(proxy_addr, &get(origin, "/big")).await;
        assert_eq!(response, BIG.as_bytes());
    }
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert!(proxy.cache().is_empty());
    proxy.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_silent_origin_is_finished_after_io_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        if read_request_head(&mut stream, &Mutex::new(Vec::new())).await {
            let _ = stream.write_all(OK.as_bytes()).await;
            // Never close
            sleep(Duration::from_secs(60)).await;
        }
    });
    let mut config = test_config();
    config.upstream.io_timeout_secs = 1;
    let (proxy, proxy_addr) = start_proxy_with(config).await;

    let started = tokio::time::Instant::now();
    let response = roundtrip(proxy_addr, &get(origin, "/idle")).await;
    assert_eq!(response, OK.as_bytes());
    assert!(started.elapsed() >= Duration::from_secs(1));

    let key = format!("127.0.0.1:{}:/idle", origin.port());
    assert_eq!(proxy.cache().get(&key).unwrap().data, OK.as_bytes());
    proxy.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_half_close_still_gets_response() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        if read_request_head(&mut stream, &Mutex::new(Vec::new())).await {
            sleep(Duration::from_millis(200)).await;
            let _ = stream.write_all(OK.as_bytes()).await;
        }
    });
    let (proxy, proxy_addr) = start_proxy().await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(&get(origin, "/half")).await.unwrap();
    client.shutdown().await.unwrap();

    let mut response = Vec::new();
    timeout(LIMIT, client.read_to_end(&mut response)).await.unwrap().unwrap();
    assert_eq!(response, OK.as_bytes());

    let stats = proxy.shutdown().await;
    assert_eq!(stats.cache_misses, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_headers_arriving_late_stay_out_of_tunnel() {
    let echo_addr = start_echo_origin().await;
    let (proxy, proxy_addr) = start_proxy().await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(format!("CONNECT {} HTTP/1.1\r\n", echo_addr).as_bytes()).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    client.write_all(format!("Host: {}\r\n\r\n", echo_addr).as_bytes()).await.unwrap();

    let reply = read_until(&mut client, b"\r\n\r\n").await;
    assert!(reply.starts_with(b"HTTP/1.1 200 Connection established\r\n"));
    assert!(!String::from_utf8_lossy(&reply).contains("Host:"));

    client.write_all(b"payload").await.unwrap();
    let mut echoed = [0u8; 7];
    timeout(LIMIT, client.read_exact(&mut echoed)).await.unwrap().unwrap();
    assert_eq!(&echoed, b"payload");

    drop(client);
    let stats = proxy.shutdown().await;
    assert_eq!(stats.tunnels, 1);
}
