//! End-to-end forwarder tests: real sockets, real backends, one worker's
//! worth of gateway state, no TLS (the TLS path is exercised in the unit
//! tests of the tls crate and by the SNI resolver tests).

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use relaygate_proxy::{run_http, Gateway};
use relaygate_store::MappingStore;
use relaygate_tls::{CertBroker, CertStore};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Plain HTTP backend that echoes the request line and interesting headers.
async fn spawn_echo_backend() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let path_and_query = req
                        .uri()
                        .path_and_query()
                        .map(|pq| pq.as_str().to_string())
                        .unwrap_or_default();
                    let host = header(&req, "host");
                    let proto = header(&req, "x-forwarded-proto");
                    let forwarded_for = header(&req, "x-forwarded-for");
                    let body = format!(
                        "{} {}|host={}|proto={}|for={}",
                        req.method(),
                        path_and_query,
                        host,
                        proto,
                        forwarded_for
                    );
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    port
}

fn header<B>(req: &Request<B>, name: &str) -> String {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string()
}

/// WebSocket echo backend; negotiates the offered subprotocol.
async fn spawn_ws_backend() -> u16 {
    use tokio_tungstenite::tungstenite::handshake::server::{Request as WsRequest, Response as WsResponse};

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let callback = |req: &WsRequest, mut resp: WsResponse| {
                    if let Some(proto) = req.headers().get("sec-websocket-protocol") {
                        resp.headers_mut()
                            .insert("sec-websocket-protocol", proto.clone());
                    }
                    Ok(resp)
                };
                let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await
                else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    if msg.is_text() || msg.is_binary() {
                        if ws.send(msg).await.is_err() {
                            break;
                        }
                    }
                }
            });
        }
    });

    port
}

struct TestProxy {
    port: u16,
    store: Arc<MappingStore>,
    gateway: Arc<Gateway>,
    _dir: tempfile::TempDir,
}

/// One worker's gateway on an ephemeral port, with an empty mapping table.
async fn spawn_proxy() -> TestProxy {
    let dir = tempfile::tempdir().unwrap();

    let store = Arc::new(
        MappingStore::initialize(dir.path().join("current.db"))
            .await
            .unwrap(),
    );

    let cert_store = Arc::new(CertStore::new(dir.path().join("certs")));
    cert_store.init().await.unwrap();
    let broker = CertBroker::new(cert_store, None);

    let gateway = Arc::new(Gateway::new(store.clone(), broker));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let serving = gateway.clone();
    tokio::spawn(async move {
        let _ = run_http(listener, serving).await;
    });

    TestProxy {
        port,
        store,
        gateway,
        _dir: dir,
    }
}

fn client_for(proxy: &TestProxy, domain: &str) -> reqwest::Client {
    let addr: SocketAddr = format!("127.0.0.1:{}", proxy.port).parse().unwrap();
    reqwest::Client::builder()
        .resolve(domain, addr)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_health_ignores_routing_state() {
    let proxy = spawn_proxy().await;

    let response = reqwest::get(format!("http://127.0.0.1:{}/health", proxy.port))
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/plain"
    );
    assert_eq!(response.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn test_unknown_host_is_404() {
    let proxy = spawn_proxy().await;
    let client = client_for(&proxy, "unknown.example");

    let response = client
        .get(format!("http://unknown.example:{}/", proxy.port))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
    assert_eq!(response.text().await.unwrap(), "Not Found");
}

#[tokio::test]
async fn test_passthrough_mapping_preserves_path() {
    let backend_port = spawn_echo_backend().await;
    let proxy = spawn_proxy().await;
    proxy
        .store
        .add("example.com", "", backend_port, "")
        .await
        .unwrap();

    let client = client_for(&proxy, "example.com");
    let response = client
        .get(format!("http://example.com:{}/a/b?x=1", proxy.port))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.starts_with("GET /a/b?x=1|"), "unexpected body: {body}");
    assert!(body.contains("host=example.com"), "host not preserved: {body}");
    assert!(body.contains("proto=http"), "wrong proto: {body}");
    assert!(body.contains("for=127.0.0.1"), "missing forwarded-for: {body}");
}

#[tokio::test]
async fn test_longest_prefix_routes_and_rewrites() {
    let api_port = spawn_echo_backend().await;
    let users_port = spawn_echo_backend().await;
    let proxy = spawn_proxy().await;

    proxy
        .store
        .add("app.example.com", "api/v1", api_port, "v1")
        .await
        .unwrap();
    proxy
        .store
        .add("app.example.com", "api/v1/users", users_port, "v2")
        .await
        .unwrap();

    let client = client_for(&proxy, "app.example.com");

    let body = client
        .get(format!(
            "http://app.example.com:{}/api/v1/users/123",
            proxy.port
        ))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.starts_with("GET /v2/users/123|"), "unexpected body: {body}");

    let body = client
        .get(format!(
            "http://app.example.com:{}/api/v1/orders?page=2",
            proxy.port
        ))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(
        body.starts_with("GET /v1/orders?page=2|"),
        "unexpected body: {body}"
    );
}

#[tokio::test]
async fn test_dead_backend_is_502() {
    let proxy = spawn_proxy().await;
    // Nothing listens on this port.
    proxy.store.add("dead.example", "", 1, "").await.unwrap();

    let client = client_for(&proxy, "dead.example");
    let response = client
        .get(format!("http://dead.example:{}/", proxy.port))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 502);
    assert_eq!(response.text().await.unwrap(), "Bad Gateway");
}

#[tokio::test]
async fn test_acme_challenge_lookup() {
    let proxy = spawn_proxy().await;

    proxy
        .gateway
        .broker()
        .store()
        .write_challenge("test-token-abc", "test-token-abc.keyauth")
        .await
        .unwrap();

    let base = format!("http://127.0.0.1:{}", proxy.port);

    let hit = reqwest::get(format!("{base}/.well-known/acme-challenge/test-token-abc"))
        .await
        .unwrap();
    assert_eq!(hit.status(), 200);
    assert_eq!(hit.text().await.unwrap(), "test-token-abc.keyauth");

    let miss = reqwest::get(format!("{base}/.well-known/acme-challenge/nope"))
        .await
        .unwrap();
    assert_eq!(miss.status(), 404);
    assert_eq!(miss.text().await.unwrap(), "Challenge not found");
}

#[tokio::test]
async fn test_missing_host_is_400() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let proxy = spawn_proxy().await;
    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", proxy.port))
        .await
        .unwrap();

    stream
        .write_all(b"GET / HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let mut buf = vec![0u8; 1024];
    let n = stream.read(&mut buf).await.unwrap();
    let response = String::from_utf8_lossy(&buf[..n]);
    assert!(response.starts_with("HTTP/1.1 400"), "got: {response}");
}

#[tokio::test]
async fn test_websocket_round_trip_with_subprotocol() {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::Message;

    let ws_port = spawn_ws_backend().await;
    let proxy = spawn_proxy().await;
    proxy.store.add("ws.example", "", ws_port, "").await.unwrap();

    let connect = |message: String| {
        let proxy_port = proxy.port;
        async move {
            let stream = tokio::net::TcpStream::connect(("127.0.0.1", proxy_port))
                .await
                .unwrap();
            let mut request = "ws://ws.example/".into_client_request().unwrap();
            request.headers_mut().insert(
                "sec-websocket-protocol",
                http::HeaderValue::from_static("chat"),
            );

            let (mut ws, response) = tokio_tungstenite::client_async(request, stream)
                .await
                .unwrap();

            // Subprotocol survived both hops.
            assert_eq!(
                response.headers()["sec-websocket-protocol"]
                    .to_str()
                    .unwrap(),
                "chat"
            );

            ws.send(Message::Text(message.clone().into())).await.unwrap();
            let echoed = ws.next().await.unwrap().unwrap();
            assert_eq!(echoed.to_text().unwrap(), message);
            ws.close(None).await.ok();
        }
    };

    // Two concurrent clients, no crosstalk.
    tokio::join!(connect("first-client".to_string()), connect("second-client".to_string()));
}

#[tokio::test]
async fn test_unroutable_upgrade_socket_is_destroyed() {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let proxy = spawn_proxy().await;
    let stream = tokio::net::TcpStream::connect(("127.0.0.1", proxy.port))
        .await
        .unwrap();
    let request = "ws://nobody.example/".into_client_request().unwrap();

    // No mapping for the host: the proxy hangs up instead of answering.
    assert!(tokio_tungstenite::client_async(request, stream).await.is_err());
}
