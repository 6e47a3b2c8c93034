//! End-to-end tests against a real proxy on a loopback port

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use burrow_client::{ControlClient, TunnelClient, TunnelClientConfig};
use burrow_control::ShutdownSignal;
use burrow_proto::{ServerInfo, TunnelRequest, GATEWAY_TIMEOUT, INTERNAL_SERVER_ERROR, NOT_FOUND};
use burrow_router::RouteRegistry;
use burrow_server::{ProxyConfig, ProxyServer, ServerRecord, ShutdownOutcome};
use burrow_transport::ClientTrust;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct TestProxy {
    addr: SocketAddr,
    registry: Arc<RouteRegistry>,
    shutdown: ShutdownSignal,
    handle: JoinHandle<ShutdownOutcome>,
}

async fn start_proxy(mut config: ProxyConfig) -> TestProxy {
    config.addr = "127.0.0.1:0".to_string();
    let server = ProxyServer::builder(config)
        .tunnel_password("tunnel-pw")
        .control_password("control-pw")
        .bind()
        .await
        .unwrap();

    TestProxy {
        addr: server.local_addr(),
        registry: server.registry(),
        shutdown: server.shutdown_signal(),
        handle: tokio::spawn(server.run()),
    }
}

async fn dead_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

/// Send `request` and collect everything until the proxy closes
async fn exchange(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    response
}

/// Read a request head up to and including the blank line
async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert_ne!(n, 0, "connection closed mid-head");
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

async fn wait_for_route(registry: &RouteRegistry, path: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !registry.contains(path) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_unknown_path_is_404() {
    let proxy = start_proxy(ProxyConfig::default()).await;

    let response = exchange(proxy.addr, b"GET /nope HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert_eq!(response, NOT_FOUND);
}

#[tokio::test]
async fn test_reserved_paths_and_bad_requests() {
    let proxy = start_proxy(ProxyConfig::default()).await;

    assert_eq!(
        exchange(proxy.addr, b"GET / HTTP/1.1\r\n\r\n").await,
        NOT_FOUND
    );
    assert_eq!(
        exchange(proxy.addr, b"GET /favicon.ico HTTP/1.1\r\n\r\n").await,
        NOT_FOUND
    );
    assert_eq!(
        exchange(proxy.addr, b"hello world\r\n\r\n").await,
        b"HTTP/1.1 400 Bad Request\r\n\r\n"
    );
    assert_eq!(
        exchange(proxy.addr, b"x").await,
        b"HTTP/1.1 400 Bad Request\r\n\r\n"
    );
}

#[tokio::test]
async fn test_control_add_then_route_with_rewrite() {
    let proxy = start_proxy(ProxyConfig::default()).await;

    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend.local_addr().unwrap();
    let service = tokio::spawn(async move {
        let (mut stream, _) = backend.accept().await.unwrap();
        let head = read_head(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\npong")
            .await
            .unwrap();
        head
    });

    let control = ControlClient::new(proxy.addr.to_string(), "control-pw", None).unwrap();
    control
        .add(ServerInfo::new("svc1", backend_addr.to_string()))
        .await
        .unwrap();
    assert!(proxy.registry.contains("/svc1"));

    let response = exchange(proxy.addr, b"GET /svc1/ping HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert_eq!(response, b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\npong");

    let head = service.await.unwrap();
    assert!(head.starts_with("GET /ping HTTP/1.1\r\nHost: x\r\n"), "{}", head);
    assert!(head.contains("Forwarded: for=\"127.0.0.1:"), "{}", head);

    // a second add for the same path is refused
    let err = control
        .add(ServerInfo::new("svc1", backend_addr.to_string()))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("server path already exists"));
}

#[tokio::test]
async fn test_unreachable_backend_is_500() {
    let mut config = ProxyConfig::default();
    config.servers.push(ServerRecord {
        name: "down".to_string(),
        addr: dead_address().await,
        ..Default::default()
    });
    let proxy = start_proxy(config).await;

    let response = exchange(proxy.addr, b"GET /down HTTP/1.1\r\n\r\n").await;
    assert_eq!(response, INTERNAL_SERVER_ERROR);
    // dial failures leave the route in place
    assert!(proxy.registry.contains("/down"));
}

#[tokio::test]
async fn test_tunnel_handshake_responses() {
    let proxy = start_proxy(ProxyConfig::default()).await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream
        .write_all(&TunnelRequest::new("edge1", "tunnel-pw").encode().unwrap())
        .await
        .unwrap();
    let mut response = [0u8; 4];
    stream.read_exact(&mut response).await.unwrap();
    assert_eq!(response, [0x7B, 0x87, 0x0F, 0x00]);
    assert!(proxy.registry.lookup("/edge1").unwrap().tunnel);

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream
        .write_all(&TunnelRequest::new("edge2", "wrong").encode().unwrap())
        .await
        .unwrap();
    let mut response = [0u8; 4];
    stream.read_exact(&mut response).await.unwrap();
    assert_eq!(response, [0x7B, 0x87, 0x00, 0x00]);
    assert!(!proxy.registry.contains("/edge2"));
}

#[tokio::test]
async fn test_tunnel_round_trip() {
    let proxy = start_proxy(ProxyConfig::default()).await;

    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_addr = target.local_addr().unwrap();
    let service = tokio::spawn(async move {
        let (mut stream, _) = target.accept().await.unwrap();
        let head = read_head(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();
        head
    });

    let client = Arc::new(
        TunnelClient::new(TunnelClientConfig::new(
            proxy.addr.to_string(),
            "edge1",
            "tunnel-pw",
            target_addr.to_string(),
        ))
        .unwrap(),
    );
    let stop = CancellationToken::new();
    tokio::spawn(client.run(stop.clone()));

    wait_for_route(&proxy.registry, "/edge1").await;

    let response = exchange(proxy.addr, b"GET /edge1/greet HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert_eq!(response, b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");

    let head = service.await.unwrap();
    assert!(head.starts_with("GET /greet HTTP/1.1\r\n"), "{}", head);
    stop.cancel();
}

#[tokio::test]
async fn test_tunnel_without_publisher_is_504_after_wait() {
    let mut config = ProxyConfig::default();
    config.timeouts.tunnel_claim_ms = 300;
    config.servers.push(ServerRecord {
        name: "edge9".to_string(),
        tunnel: true,
        ..Default::default()
    });
    let proxy = start_proxy(config).await;

    let start = Instant::now();
    let response = exchange(proxy.addr, b"GET /edge9/x HTTP/1.1\r\n\r\n").await;
    assert_eq!(response, GATEWAY_TIMEOUT);
    assert!(start.elapsed() >= Duration::from_millis(300));
}

/// Open a forwarded connection whose backend keeps it open until told to close
async fn held_connection(proxy: &TestProxy) -> (TcpStream, tokio::sync::oneshot::Sender<()>) {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend.local_addr().unwrap();
    let (release, released) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        let (mut stream, _) = backend.accept().await.unwrap();
        read_head(&mut stream).await;
        stream.write_all(b"HTTP/1.1 200 OK\r\n").await.unwrap();
        let _ = released.await;
    });

    proxy
        .registry
        .insert_if_absent(burrow_router::BackendDescriptor::dialed(
            "/slow",
            backend_addr.to_string(),
        ))
        .unwrap();

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(b"GET /slow HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let mut first = [0u8; 17];
    client.read_exact(&mut first).await.unwrap();
    assert_eq!(&first, b"HTTP/1.1 200 OK\r\n");

    (client, release)
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_connections() {
    let proxy = start_proxy(ProxyConfig::default()).await;
    let (_client, release) = held_connection(&proxy).await;

    let control = ControlClient::new(proxy.addr.to_string(), "control-pw", None).unwrap();
    control.shutdown(None).await.unwrap();
    assert!(proxy.shutdown.is_shutting_down());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!proxy.handle.is_finished());
    assert!(TcpStream::connect(proxy.addr).await.is_err());

    release.send(()).unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), proxy.handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, ShutdownOutcome::Drained);
}

#[tokio::test]
async fn test_shutdown_deadline_forces_completion() {
    let proxy = start_proxy(ProxyConfig::default()).await;
    let (_client, _release) = held_connection(&proxy).await;

    let control = ControlClient::new(proxy.addr.to_string(), "control-pw", None).unwrap();
    control
        .shutdown(Some(Duration::from_secs(1)))
        .await
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), proxy.handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, ShutdownOutcome::Forced { remaining: 1 });
}

#[tokio::test]
async fn test_tls_listener() {
    use std::io::Write;

    let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let mut cert = tempfile::NamedTempFile::new().unwrap();
    cert.write_all(generated.cert.pem().as_bytes()).unwrap();
    let mut key = tempfile::NamedTempFile::new().unwrap();
    key.write_all(generated.key_pair.serialize_pem().as_bytes())
        .unwrap();

    let config = ProxyConfig {
        server_cert_file_path: cert.path().display().to_string(),
        server_key_file_path: key.path().display().to_string(),
        ..Default::default()
    };
    let proxy = start_proxy(config).await;

    let control = ControlClient::new(
        proxy.addr.to_string(),
        "control-pw",
        Some(ClientTrust::Insecure),
    )
    .unwrap();
    control
        .add(ServerInfo::new("svc1", "127.0.0.1:9"))
        .await
        .unwrap();
    assert!(proxy.registry.contains("/svc1"));

    let connector = burrow_transport::client_connector(&ClientTrust::Insecure).unwrap();
    let dialer = burrow_transport::BackendDialer::new(connector, Duration::from_secs(2));
    let mut stream = dialer.dial(&proxy.addr.to_string(), true).await.unwrap();
    stream
        .write_all(b"GET /nope HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    stream.flush().await.unwrap();
    let mut response = vec![0u8; NOT_FOUND.len()];
    stream.read_exact(&mut response).await.unwrap();
    assert_eq!(response, NOT_FOUND);
}
