//! Gateway tests over loopback sockets.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{Duration, Utc};
use portcullis_lib::{Gateway, HEALTH_PATH};
use portcullis_session::{SessionCodec, SessionState};
use portcullis_tunnel::{UpstreamConnector, UpstreamTlsOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};

const KEY: &[u8] = b"0123456789abcdef0123456789abcdef";
const COOKIE: &str = "_portcullis_session";

/// Upstream that reports the bytes it receives, then echoes them back.
async fn spawn_upstream() -> (SocketAddr, oneshot::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();
        stream.write_all(&received).await.unwrap();
        stream.shutdown().await.unwrap();
        let _ = tx.send(received);
    });
    (addr, rx)
}

struct Running {
    addr: SocketAddr,
    _shutdown: watch::Sender<bool>,
}

async fn start_gateway(upstream: SocketAddr) -> Running {
    let connector =
        UpstreamConnector::new(&format!("http://{}", upstream), &UpstreamTlsOptions::default())
            .unwrap();
    let gateway = Arc::new(
        Gateway::new(SessionCodec::new(KEY).unwrap(), connector).with_cookie_name(COOKIE),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(gateway.serve(listener, None, shutdown_rx));

    Running {
        addr,
        _shutdown: shutdown_tx,
    }
}

fn session_cookie(ttl: Duration) -> String {
    SessionCodec::new(KEY)
        .unwrap()
        .seal_state(&SessionState::new("refresh-token", Utc::now() + ttl))
        .unwrap()
}

fn upgrade_request(cookie: Option<&str>) -> String {
    let mut request = String::from(
        "GET /socket HTTP/1.1\r\nHost: app.example.com\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n",
    );
    if let Some(value) = cookie {
        request.push_str(&format!("Cookie: theme=dark; {}={}\r\n", COOKIE, value));
    }
    request.push_str("\r\n");
    request
}

async fn exchange(addr: SocketAddr, request: &[u8]) -> String {
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(request).await.unwrap();
    client.shutdown().await.unwrap();
    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

#[tokio::test]
async fn authorized_upgrade_is_tunneled_verbatim() {
    let (upstream, received_rx) = spawn_upstream().await;
    let gateway = start_gateway(upstream).await;

    let cookie = session_cookie(Duration::hours(1));
    let mut request = upgrade_request(Some(&cookie)).into_bytes();
    request.extend_from_slice(b"frame");

    let response = exchange(gateway.addr, &request).await;

    let received = received_rx.await.unwrap();
    assert_eq!(received, request);
    assert_eq!(response.as_bytes(), &request[..]);
}

#[tokio::test]
async fn upgrade_without_cookie_is_unauthorized() {
    let (upstream, _received) = spawn_upstream().await;
    let gateway = start_gateway(upstream).await;

    let response = exchange(gateway.addr, upgrade_request(None).as_bytes()).await;
    assert!(response.starts_with("HTTP/1.1 401 Unauthorized\r\n"), "{}", response);
    assert!(response.contains("connection: close"));
}

#[tokio::test]
async fn tampered_or_expired_cookie_is_unauthorized() {
    let (upstream, _received) = spawn_upstream().await;
    let gateway = start_gateway(upstream).await;

    let mut tampered = session_cookie(Duration::hours(1));
    let last = if tampered.ends_with('0') { "1" } else { "0" };
    tampered.replace_range(tampered.len() - 1.., last);
    let response = exchange(gateway.addr, upgrade_request(Some(&tampered)).as_bytes()).await;
    assert!(response.starts_with("HTTP/1.1 401"), "{}", response);

    let expired = session_cookie(Duration::minutes(-5));
    let response = exchange(gateway.addr, upgrade_request(Some(&expired)).as_bytes()).await;
    assert!(response.starts_with("HTTP/1.1 401"), "{}", response);
}

#[tokio::test]
async fn health_endpoint_reports_status() {
    let (upstream, _received) = spawn_upstream().await;
    let gateway = start_gateway(upstream).await;

    let response = reqwest::get(format!("http://{}{}", gateway.addr, HEALTH_PATH))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["upstream"], upstream.to_string());
    assert!(body["issuer"].is_null());
}

#[tokio::test]
async fn unknown_path_is_not_found() {
    let (upstream, _received) = spawn_upstream().await;
    let gateway = start_gateway(upstream).await;

    let response = reqwest::get(format!("http://{}/elsewhere", gateway.addr))
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn upgrade_after_plain_request_is_not_tunneled() {
    let (upstream, _received) = spawn_upstream().await;
    let gateway = start_gateway(upstream).await;

    let cookie = session_cookie(Duration::hours(1));
    let mut request =
        format!("GET {} HTTP/1.1\r\nHost: app.example.com\r\n\r\n", HEALTH_PATH).into_bytes();
    request.extend_from_slice(upgrade_request(Some(&cookie)).as_bytes());

    // Keep the write side open; the refusal closes the connection.
    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    client.write_all(&request).await.unwrap();
    let mut raw = Vec::new();
    client.read_to_end(&mut raw).await.unwrap();
    let response = String::from_utf8_lossy(&raw);

    let ok = response.find("HTTP/1.1 200 OK").unwrap();
    let refused = response.find("HTTP/1.1 501 Not Implemented").unwrap();
    assert!(ok < refused, "{}", response);
}

async fn rejected_as_too_large(request: &[u8]) -> bool {
    let (upstream, _received) = spawn_upstream().await;
    let gateway = start_gateway(upstream).await;
    exchange(gateway.addr, request)
        .await
        .starts_with("HTTP/1.1 431")
}

#[tokio::test]
async fn unterminated_head_at_the_limit_is_rejected() {
    let mut request = b"GET / HTTP/1.1\r\nX-Padding: ".to_vec();
    request.resize(portcullis_tunnel::DEFAULT_MAX_HEADER_SIZE, b'a');

    assert!(rejected_as_too_large(&request).await);
}

#[tokio::test]
async fn complete_head_over_the_limit_is_rejected() {
    // Arrives in one write, so a single read could complete it.
    let mut request = b"GET / HTTP/1.1\r\nX-Padding: ".to_vec();
    request.resize(portcullis_tunnel::DEFAULT_MAX_HEADER_SIZE + 2048, b'a');
    request.extend_from_slice(b"\r\n\r\n");

    assert!(rejected_as_too_large(&request).await);
}

#[tokio::test]
async fn shutdown_stops_accepting() {
    let (upstream, _received) = spawn_upstream().await;
    let connector =
        UpstreamConnector::new(&format!("http://{}", upstream), &UpstreamTlsOptions::default())
            .unwrap();
    let gateway = Arc::new(Gateway::new(SessionCodec::new(KEY).unwrap(), connector));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let serving = tokio::spawn(gateway.serve(listener, None, shutdown_rx));

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(5), serving)
        .await
        .unwrap()
        .unwrap();
}
