//! End-to-end proxy tests
//!
//! Runs the gateway on an ephemeral port in front of live backends:
//! - Path rewriting and forwarded headers
//! - Connection-failure retries and the idempotency rule
//! - Per-request deadline
//! - Bearer authentication, claims forwarding, client-credential injection
//! - Protocol upgrades relayed as raw byte streams
//! - Chunked trailer fields relayed to the client

mod common;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{Json, Router, body::Body, http::Request};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use authproxy::config::{Config, RouteConfig};
use authproxy::gateway::{AppState, Gateway};

use common::{TestKey, claims, client_config, jwks};

/// Backend that echoes what it received as JSON
async fn echo_backend() -> SocketAddr {
    async fn echo(request: Request<Body>) -> Json<Value> {
        let headers: BTreeMap<String, String> = request
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        let method = request.method().to_string();
        let uri = request.uri().to_string();
        let body = axum::body::to_bytes(request.into_body(), usize::MAX).await.unwrap();
        Json(json!({
            "method": method,
            "uri": uri,
            "headers": headers,
            "body": String::from_utf8_lossy(&body),
        }))
    }

    serve_backend(Router::new().fallback(echo)).await
}

/// Backend that takes two seconds to answer
async fn slow_backend() -> SocketAddr {
    async fn slow() -> &'static str {
        tokio::time::sleep(Duration::from_secs(2)).await;
        "late"
    }
    serve_backend(Router::new().fallback(slow)).await
}

async fn serve_backend(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// A port nothing listens on
async fn refused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

struct Running {
    addr: SocketAddr,
    state: Arc<AppState>,
    _shutdown: oneshot::Sender<()>,
}

impl Running {
    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    fn connect_attempts(&self) -> u64 {
        self.state.proxy.as_ref().unwrap().pool().connect_attempts()
    }
}

async fn start(config: Config) -> Running {
    let gateway = Gateway::new(config).unwrap();
    let state = Arc::clone(gateway.state());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        gateway
            .serve(listener, async {
                let _ = rx.await;
            })
            .await
            .unwrap();
    });
    Running {
        addr,
        state,
        _shutdown: tx,
    }
}

fn route(prefix: &str, hosts: Vec<String>, base_path: &str) -> RouteConfig {
    RouteConfig {
        path_prefix: prefix.to_string(),
        hosts,
        base_path: base_path.to_string(),
    }
}

fn open_config(routes: Vec<RouteConfig>) -> Config {
    let mut config = Config::default();
    config.security.enabled = false;
    config.proxy.routes = routes;
    config
}

#[tokio::test]
async fn rewrites_path_and_sets_forwarded_headers() {
    // GIVEN: /api/petstore routed to a backend under /v1
    let backend = echo_backend().await;
    let gw = start(open_config(vec![route(
        "/api/petstore",
        vec![format!("http://{backend}")],
        "/v1",
    )]))
    .await;

    // WHEN
    let response = reqwest::Client::new()
        .get(gw.url("/api/petstore/pets?limit=2"))
        .header("x-request-id", "r-42")
        .send()
        .await
        .unwrap();

    // THEN
    assert_eq!(response.status(), 200);
    let echoed: Value = response.json().await.unwrap();
    assert_eq!(echoed["uri"], "/v1/pets?limit=2");
    let headers = &echoed["headers"];
    assert_eq!(headers["host"], backend.to_string());
    assert_eq!(headers["x-forwarded-for"], "127.0.0.1");
    assert_eq!(headers["x-forwarded-proto"], "http");
    assert_eq!(headers["x-forwarded-host"], gw.addr.to_string());
    assert_eq!(headers["x-forwarded-port"], gw.addr.port().to_string());
    assert_eq!(headers["x-request-id"], "r-42");
}

#[tokio::test]
async fn streams_request_bodies_upstream() {
    let backend = echo_backend().await;
    let gw = start(open_config(vec![route("/api", vec![format!("http://{backend}")], "")])).await;

    let payload = "x".repeat(256 * 1024);
    let response = reqwest::Client::new()
        .post(gw.url("/api/upload"))
        .body(payload.clone())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let echoed: Value = response.json().await.unwrap();
    assert_eq!(echoed["method"], "POST");
    assert_eq!(echoed["body"].as_str().unwrap().len(), payload.len());
}

#[tokio::test]
async fn unrouted_path_falls_through_to_not_found() {
    let backend = echo_backend().await;
    let gw = start(open_config(vec![route("/api", vec![format!("http://{backend}")], "")])).await;

    let response = reqwest::get(gw.url("/other")).await.unwrap();
    assert_eq!(response.status(), 404);
    assert_eq!(gw.connect_attempts(), 0);
}

#[tokio::test]
async fn unrouted_path_is_not_found_before_authentication() {
    // GIVEN: authentication enabled and a provider that must not be asked
    let provider = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&provider)
        .await;
    let backend = echo_backend().await;
    let mut config = open_config(vec![route("/api", vec![format!("http://{backend}")], "")]);
    config.security.enabled = true;
    config.client = client_config(&[("main", &provider.uri())]);
    let gw = start(config).await;
    let client = reqwest::Client::new();

    // WHEN: a path no route covers is requested, with or without a token
    let anonymous = client.get(gw.url("/other")).send().await.unwrap();
    let bearer = client
        .get(gw.url("/other"))
        .bearer_auth("a.b.c")
        .send()
        .await
        .unwrap();

    // THEN: both are 404 rather than an authentication failure
    assert_eq!(anonymous.status(), 404);
    assert!(!anonymous.headers().contains_key("www-authenticate"));
    let body: Value = anonymous.json().await.unwrap();
    assert_eq!(body["error"], "not_found");
    assert_eq!(bearer.status(), 404);

    // AND: routed paths still require a token
    let routed = client.get(gw.url("/api/pets")).send().await.unwrap();
    assert_eq!(routed.status(), 401);
    assert_eq!(gw.connect_attempts(), 0);
}

#[tokio::test]
async fn connect_method_is_refused() {
    use tower::ServiceExt;

    let backend = echo_backend().await;
    let gateway = Gateway::new(open_config(vec![route(
        "/api",
        vec![format!("http://{backend}")],
        "",
    )]))
    .unwrap();

    let request = Request::builder()
        .method("CONNECT")
        .uri("/api/tunnel")
        .body(Body::empty())
        .unwrap();
    let response = gateway.router().oneshot(request).await.unwrap();

    assert_eq!(response.status(), 405);
    assert_eq!(
        gateway.state().proxy.as_ref().unwrap().pool().connect_attempts(),
        0
    );
}

#[tokio::test]
async fn health_reports_cache_statistics() {
    let gw = start(open_config(vec![])).await;

    let response = reqwest::get(gw.url("/health")).await.unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["token_cache"]["size"], 0);
    assert_eq!(body["keys"]["jwks"], 0);
}

#[tokio::test]
async fn idempotent_request_is_retried_then_answered_503() {
    // GIVEN: two dead upstreams and three retries
    let hosts = vec![
        format!("http://127.0.0.1:{}", refused_port().await),
        format!("http://127.0.0.1:{}", refused_port().await),
    ];
    let mut config = open_config(vec![route("/api", hosts, "")]);
    config.proxy.max_connection_retries = 3;
    let gw = start(config).await;

    // WHEN
    let response = reqwest::get(gw.url("/api/pets")).await.unwrap();

    // THEN: N + 1 attempts, then 503
    assert_eq!(response.status(), 503);
    assert_eq!(gw.connect_attempts(), 4);
}

#[tokio::test]
async fn non_idempotent_request_is_attempted_once() {
    let hosts = vec![format!("http://127.0.0.1:{}", refused_port().await)];
    let mut config = open_config(vec![route("/api", hosts, "")]);
    config.proxy.max_connection_retries = 3;
    let gw = start(config).await;

    let response = reqwest::Client::new()
        .post(gw.url("/api/orders"))
        .body("{}")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 503);
    assert_eq!(gw.connect_attempts(), 1);
}

#[tokio::test]
async fn retry_moves_on_to_a_live_upstream() {
    // GIVEN: a dead host followed by a live one
    let backend = echo_backend().await;
    let hosts = vec![
        format!("http://127.0.0.1:{}", refused_port().await),
        format!("http://{backend}"),
    ];
    let gw = start(open_config(vec![route("/api", hosts, "")])).await;

    // WHEN / THEN
    let response = reqwest::get(gw.url("/api/pets")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(gw.connect_attempts(), 2);
}

#[tokio::test]
async fn request_deadline_answers_503() {
    let backend = slow_backend().await;
    let mut config = open_config(vec![route("/slow", vec![format!("http://{backend}")], "")]);
    config.proxy.max_request_time = Duration::from_millis(200);
    let gw = start(config).await;

    let started = std::time::Instant::now();
    let response = reqwest::get(gw.url("/slow")).await.unwrap();

    assert_eq!(response.status(), 503);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn authenticated_request_forwards_claims() {
    // GIVEN: verification against a mock provider and claims forwarding
    let provider = MockServer::start().await;
    let key = TestKey::new("k1");
    Mock::given(method("GET"))
        .and(path("/oauth2/keys"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks(&[&key])))
        .mount(&provider)
        .await;
    let backend = echo_backend().await;

    let mut config = open_config(vec![route("/api", vec![format!("http://{backend}")], "")]);
    config.security.enabled = true;
    config.client = client_config(&[("main", &provider.uri())]);
    config.proxy.forward_jwt_claims = true;
    let gw = start(config).await;
    let client = reqwest::Client::new();

    // WHEN: no token
    let anonymous = client.get(gw.url("/api/pets")).send().await.unwrap();

    // THEN
    assert_eq!(anonymous.status(), 401);
    assert_eq!(anonymous.headers()["www-authenticate"], "Bearer");

    // WHEN: a valid token
    let exp = authproxy::clock::Clock::now_secs(&authproxy::clock::SystemClock) + 600;
    let token = key.sign(&claims(exp));
    let response = client
        .get(gw.url("/api/pets"))
        .bearer_auth(&token)
        .header("x-jwt-claims", "{\"sub\":\"spoofed\"}")
        .send()
        .await
        .unwrap();

    // THEN: the backend sees the verified claims, not the client's copy
    assert_eq!(response.status(), 200);
    let echoed: Value = response.json().await.unwrap();
    let forwarded: Value =
        serde_json::from_str(echoed["headers"]["x-jwt-claims"].as_str().unwrap()).unwrap();
    assert_eq!(forwarded["sub"], "user-1");
    assert_eq!(echoed["headers"]["authorization"], format!("Bearer {token}"));

    // AND: a garbage token is refused
    let garbage = client
        .get(gw.url("/api/pets"))
        .bearer_auth("a.b.c")
        .send()
        .await
        .unwrap();
    assert_eq!(garbage.status(), 401);
}

#[tokio::test]
async fn client_credential_token_is_attached() {
    // GIVEN: the proxy presents its own token to the backend
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "cc-token",
            "token_type": "bearer",
            "expires_in": 3600,
        })))
        .expect(1)
        .mount(&provider)
        .await;
    let backend = echo_backend().await;

    let mut config = open_config(vec![route("/api", vec![format!("http://{backend}")], "")]);
    config.client = client_config(&[("main", &provider.uri())]);
    config.proxy.client_credentials = Some("main".to_string());
    let gw = start(config).await;
    let client = reqwest::Client::new();

    // WHEN: the caller sends no Authorization header
    let echoed: Value = client
        .get(gw.url("/api/a"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    // THEN: the proxy's token becomes the Authorization header
    assert_eq!(echoed["headers"]["authorization"], "Bearer cc-token");

    // WHEN: the caller has its own Authorization header
    let echoed: Value = client
        .get(gw.url("/api/b"))
        .header("authorization", "Bearer caller")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    // THEN: the proxy's token travels as X-Scope-Token (cached, one issuance)
    assert_eq!(echoed["headers"]["authorization"], "Bearer caller");
    assert_eq!(echoed["headers"]["x-scope-token"], "Bearer cc-token");
}

/// Raw backend that accepts any upgrade and echoes bytes afterwards
async fn upgrade_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_head(&mut socket).await;
        socket
            .write_all(b"HTTP/1.1 101 Switching Protocols\r\nconnection: upgrade\r\nupgrade: echo\r\n\r\n")
            .await
            .unwrap();
        let mut buf = [0u8; 1024];
        loop {
            let n = socket.read(&mut buf).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            socket.write_all(&buf[..n]).await.unwrap();
        }
    });
    addr
}

async fn read_head(socket: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        socket.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

#[tokio::test]
async fn upgrade_switches_to_raw_relay() {
    let backend = upgrade_backend().await;
    let gw = start(open_config(vec![route("/ws", vec![format!("http://{backend}")], "")])).await;

    // WHEN: a client asks for an upgrade through the proxy
    let mut client = TcpStream::connect(gw.addr).await.unwrap();
    client
        .write_all(b"GET /ws/chat HTTP/1.1\r\nhost: gateway\r\nconnection: upgrade\r\nupgrade: echo\r\n\r\n")
        .await
        .unwrap();
    let head = read_head(&mut client).await;

    // THEN: the 101 is passed through and bytes flow both ways
    assert!(head.starts_with("HTTP/1.1 101"), "{head}");
    assert!(head.to_ascii_lowercase().contains("upgrade: echo"), "{head}");

    tokio::time::timeout(Duration::from_secs(5), async {
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    })
    .await
    .unwrap();
}

/// Raw backend answering one chunked response that ends in a trailer field.
/// Sends the request head it received on the returned channel.
async fn trailer_backend() -> (SocketAddr, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let _ = tx.send(read_head(&mut socket).await);
        socket
            .write_all(
                b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ntransfer-encoding: chunked\r\n\
                  trailer: x-checksum\r\n\r\n5\r\nhello\r\n0\r\nx-checksum: abc\r\n\r\n",
            )
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        let _ = socket.read(&mut buf).await;
    });
    (addr, rx)
}

#[tokio::test]
async fn chunked_trailers_reach_the_client() {
    // GIVEN: a backend that ends its body with a checksum trailer
    let (backend, upstream_head) = trailer_backend().await;
    let gw = start(open_config(vec![route("/stream", vec![format!("http://{backend}")], "")])).await;

    // WHEN: a client that accepts trailers fetches it through the proxy
    let mut client = TcpStream::connect(gw.addr).await.unwrap();
    client
        .write_all(b"GET /stream/data HTTP/1.1\r\nhost: gateway\r\nte: trailers\r\nconnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut raw = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut raw))
        .await
        .unwrap()
        .unwrap();
    let response = String::from_utf8(raw).unwrap().to_ascii_lowercase();

    // THEN: the body and the trailer field both arrive
    assert!(response.starts_with("http/1.1 200"), "{response}");
    assert!(response.contains("trailer: x-checksum"), "{response}");
    assert!(response.contains("hello"), "{response}");
    let (_, tail) = response.rsplit_once("\r\n0\r\n").unwrap();
    assert!(tail.starts_with("x-checksum: abc\r\n"), "{response}");

    // AND: the upstream was told trailers are accepted
    let head = upstream_head.await.unwrap().to_ascii_lowercase();
    assert!(head.contains("te: trailers\r\n"), "{head}");
}
