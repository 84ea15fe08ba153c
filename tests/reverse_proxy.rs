use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    Method, Request, Response, StatusCode, Uri,
    body::Incoming,
    header::{self, HeaderValue},
    service::service_fn,
};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use serde_json::Value;
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
};

#[derive(Debug)]
struct CapturedRequest {
    uri: Uri,
    headers: hyper::HeaderMap,
    body: Bytes,
}

struct TestUpstream {
    addr: SocketAddr,
    calls: Arc<AtomicUsize>,
    captured_rx: mpsc::UnboundedReceiver<CapturedRequest>,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl TestUpstream {
    async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

type Responder = Arc<dyn Fn(usize) -> Response<Full<Bytes>> + Send + Sync>;

fn default_responder() -> Responder {
    Arc::new(|call| {
        let mut res = Response::new(Full::new(Bytes::from(format!("upstream-body-{call}"))));
        *res.status_mut() = StatusCode::CREATED;
        res.headers_mut().insert(
            header::CONNECTION,
            HeaderValue::from_static("close, x-resp-hop"),
        );
        res.headers_mut()
            .insert("x-resp-hop", HeaderValue::from_static("yes"));
        res.headers_mut()
            .insert("x-resp-end", HeaderValue::from_static("ok"));
        res
    })
}

async fn spawn_upstream() -> TestUpstream {
    spawn_upstream_with(Duration::ZERO, default_responder()).await
}

async fn spawn_upstream_with(delay: Duration, responder: Responder) -> TestUpstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let (captured_tx, captured_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    let loop_calls = Arc::clone(&calls);
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let calls = Arc::clone(&loop_calls);
                    let captured_tx = captured_tx.clone();
                    let responder = Arc::clone(&responder);
                    tokio::spawn(async move {
                        let service = service_fn(move |req: Request<Incoming>| {
                            let calls = Arc::clone(&calls);
                            let captured_tx = captured_tx.clone();
                            let responder = Arc::clone(&responder);
                            async move {
                                let (parts, body) = req.into_parts();
                                let body_bytes = body.collect().await.unwrap().to_bytes();
                                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                                let _ = captured_tx.send(CapturedRequest {
                                    uri: parts.uri,
                                    headers: parts.headers,
                                    body: body_bytes,
                                });
                                if !delay.is_zero() {
                                    tokio::time::sleep(delay).await;
                                }
                                Ok::<_, hyper::Error>(responder(call))
                            }
                        });
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        let _ = builder.serve_connection(io, service).await;
                    });
                }
            }
        }
    });

    TestUpstream {
        addr,
        calls,
        captured_rx,
        shutdown_tx,
        join,
    }
}

fn test_client() -> Client<HttpConnector, Full<Bytes>> {
    let mut connector = HttpConnector::new();
    connector.enforce_http(false);
    Client::builder(TokioExecutor::new()).build(connector)
}

fn proxy_config(mode: &str, upstream_addr: SocketAddr, dir: &std::path::Path) -> vcrproxy::config::Config {
    let yaml = format!(
        r#"
mode: {mode}
port: 0
admin_port: 0
targets:
  /api: http://{upstream_addr}
cassettes:
  dir: {}
"#,
        dir.display()
    );
    vcrproxy::config::Config::from_yaml_str(&yaml).unwrap()
}

async fn send_json(
    client: &Client<HttpConnector, Full<Bytes>>,
    method: Method,
    url: String,
    body: &str,
) -> Response<Incoming> {
    let req = Request::builder()
        .method(method)
        .uri(url)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body.to_owned())))
        .unwrap();
    client.request(req).await.unwrap()
}

async fn admin_stats(
    client: &Client<HttpConnector, Full<Bytes>>,
    admin_addr: SocketAddr,
) -> Value {
    let req = Request::builder()
        .method(Method::GET)
        .uri(format!("http://{admin_addr}/api/stats"))
        .body(Full::new(Bytes::new()))
        .unwrap();
    let res = client.request(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = res.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

fn domain_dir(dir: &std::path::Path, upstream_addr: SocketAddr) -> std::path::PathBuf {
    dir.join(upstream_addr.to_string())
}

fn cassette_files(dir: &std::path::Path, upstream_addr: SocketAddr) -> Vec<std::path::PathBuf> {
    let domain = domain_dir(dir, upstream_addr);
    if !domain.exists() {
        return Vec::new();
    }
    let mut files: Vec<_> = std::fs::read_dir(domain)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    files
}

#[tokio::test]
async fn spy_cold_then_warm_records_then_replays() {
    let upstream = spawn_upstream().await;
    let cassettes = tempfile::tempdir().unwrap();
    let config = proxy_config("spy", upstream.addr, cassettes.path());
    let proxy = vcrproxy::proxy::serve(&config).await.unwrap();
    let client = test_client();

    let url = format!("http://{}/api/v1/users", proxy.listen_addr);
    let res = send_json(&client, Method::POST, url.clone(), r#"{"name":"Alice"}"#).await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"upstream-body-1");
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);

    let files = cassette_files(cassettes.path(), upstream.addr);
    assert_eq!(files.len(), 1);
    let name = files[0].file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("POST_v1_users_"), "unexpected name: {name}");

    // Same request again: served from the cassette, upstream untouched.
    let res = send_json(&client, Method::POST, url, r#"{"name":"Alice"}"#).await;
    assert_eq!(res.status(), StatusCode::CREATED);
    assert_eq!(
        res.headers().get("x-resp-end").unwrap(),
        &HeaderValue::from_static("ok")
    );
    assert!(res.headers().get("x-resp-hop").is_none());
    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"upstream-body-1");
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);

    let stats = admin_stats(&client, proxy.admin_listen_addr).await;
    assert_eq!(stats["hits"].as_u64(), Some(1));
    assert_eq!(stats["misses"].as_u64(), Some(1));
    assert_eq!(stats["recorded"].as_u64(), Some(1));
    assert_eq!(stats["errors"].as_u64(), Some(0));

    proxy.shutdown().await;
    upstream.shutdown().await;
}

#[tokio::test]
async fn recorded_cassette_and_route_config_land_on_disk() {
    let upstream = spawn_upstream().await;
    let cassettes = tempfile::tempdir().unwrap();
    let config = proxy_config("spy", upstream.addr, cassettes.path());
    let proxy = vcrproxy::proxy::serve(&config).await.unwrap();
    let client = test_client();

    let url = format!("http://{}/api/v1/users?team=a", proxy.listen_addr);
    let res = send_json(&client, Method::POST, url, r#"{"name":"Alice"}"#).await;
    assert_eq!(res.status(), StatusCode::CREATED);

    let files = cassette_files(cassettes.path(), upstream.addr);
    assert_eq!(files.len(), 1);
    let cassette: Value =
        serde_json::from_slice(&std::fs::read(&files[0]).unwrap()).unwrap();
    let fingerprint = cassette["meta"]["fingerprint"].as_str().unwrap();
    assert_eq!(fingerprint.len(), 64);
    assert!(fingerprint.bytes().all(|b| b.is_ascii_hexdigit()));
    assert_eq!(
        cassette["meta"]["domain"].as_str(),
        Some(upstream.addr.to_string().as_str())
    );
    assert_eq!(cassette["meta"]["version"].as_str(), Some("1"));
    assert_eq!(cassette["request"]["method"].as_str(), Some("POST"));
    assert_eq!(cassette["request"]["path"].as_str(), Some("/v1/users"));
    assert_eq!(cassette["request"]["body"].as_str(), Some(r#"{"name":"Alice"}"#));
    assert_eq!(cassette["request"]["body_encoding"].as_str(), Some("utf-8"));
    assert_eq!(cassette["request"]["query"]["team"][0].as_str(), Some("a"));
    assert_eq!(cassette["response"]["status_code"].as_u64(), Some(201));
    assert_eq!(cassette["response"]["body"].as_str(), Some("upstream-body-1"));

    let route_path = cassettes
        .path()
        .join("_routes")
        .join(upstream.addr.to_string())
        .join("POST_v1_users.yaml");
    assert!(route_path.exists(), "route config should be auto-written");
    let route: Value =
        serde_yaml::from_str(&std::fs::read_to_string(&route_path).unwrap()).unwrap();
    assert_eq!(route["route"]["method"].as_str(), Some("POST"));
    assert_eq!(route["route"]["path"].as_str(), Some("/v1/users"));
    assert_eq!(route["matched"]["body_fields"][0].as_str(), Some("name"));
    assert_eq!(route["matched"]["query_params"][0].as_str(), Some("team"));
    assert!(route["ignore"]["headers"].as_array().unwrap().is_empty());

    proxy.shutdown().await;
    upstream.shutdown().await;
}

#[tokio::test]
async fn different_bodies_record_separate_cassettes() {
    let upstream = spawn_upstream().await;
    let cassettes = tempfile::tempdir().unwrap();
    let config = proxy_config("spy", upstream.addr, cassettes.path());
    let proxy = vcrproxy::proxy::serve(&config).await.unwrap();
    let client = test_client();

    let url = format!("http://{}/api/v1/users", proxy.listen_addr);
    send_json(&client, Method::POST, url.clone(), r#"{"name":"Alice"}"#).await;
    send_json(&client, Method::POST, url, r#"{"name":"Bob"}"#).await;

    assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);
    assert_eq!(cassette_files(cassettes.path(), upstream.addr).len(), 2);

    proxy.shutdown().await;
    upstream.shutdown().await;
}

#[tokio::test]
async fn json_key_order_does_not_change_the_cassette() {
    let upstream = spawn_upstream().await;
    let cassettes = tempfile::tempdir().unwrap();
    let config = proxy_config("spy", upstream.addr, cassettes.path());
    let proxy = vcrproxy::proxy::serve(&config).await.unwrap();
    let client = test_client();

    let url = format!("http://{}/api/v1/items", proxy.listen_addr);
    send_json(&client, Method::POST, url.clone(), r#"{"a":1,"b":2}"#).await;
    let res = send_json(&client, Method::POST, url, r#"{"b":2,"a":1}"#).await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"upstream-body-1");

    assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
    assert_eq!(cassette_files(cassettes.path(), upstream.addr).len(), 1);

    proxy.shutdown().await;
    upstream.shutdown().await;
}

#[tokio::test]
async fn route_config_ignored_body_field_shares_one_cassette() {
    let upstream = spawn_upstream().await;
    let cassettes = tempfile::tempdir().unwrap();

    // Curated override: requests differing only in request_id are identical.
    let route_dir = cassettes
        .path()
        .join("_routes")
        .join(upstream.addr.to_string());
    std::fs::create_dir_all(&route_dir).unwrap();
    std::fs::write(
        route_dir.join("POST_v1_events.yaml"),
        r#"
route:
  method: POST
  path: /v1/events
ignore:
  body_fields: ["$.request_id"]
"#,
    )
    .unwrap();

    let config = proxy_config("spy", upstream.addr, cassettes.path());
    let proxy = vcrproxy::proxy::serve(&config).await.unwrap();
    let client = test_client();

    let url = format!("http://{}/api/v1/events", proxy.listen_addr);
    send_json(
        &client,
        Method::POST,
        url.clone(),
        r#"{"kind":"signup","request_id":"r-1"}"#,
    )
    .await;
    let res = send_json(
        &client,
        Method::POST,
        url,
        r#"{"kind":"signup","request_id":"r-2"}"#,
    )
    .await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"upstream-body-1");

    assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
    assert_eq!(cassette_files(cassettes.path(), upstream.addr).len(), 1);

    proxy.shutdown().await;
    upstream.shutdown().await;
}

#[tokio::test]
async fn replay_miss_returns_404_with_fingerprint() {
    let upstream = spawn_upstream().await;
    let cassettes = tempfile::tempdir().unwrap();
    let config = proxy_config("replay", upstream.addr, cassettes.path());
    let proxy = vcrproxy::proxy::serve(&config).await.unwrap();
    let client = test_client();

    let url = format!("http://{}/api/v1/users", proxy.listen_addr);
    let res = send_json(&client, Method::POST, url, r#"{"name":"Alice"}"#).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body = res.into_body().collect().await.unwrap().to_bytes();
    let payload: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(payload["error"].as_str(), Some("cassette_miss"));
    let fingerprint = payload["fingerprint"].as_str().unwrap();
    assert_eq!(fingerprint.len(), 64);
    assert!(
        fingerprint
            .bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    );

    assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
    let stats = admin_stats(&client, proxy.admin_listen_addr).await;
    assert_eq!(stats["misses"].as_u64(), Some(1));
    assert_eq!(stats["errors"].as_u64(), Some(0));

    proxy.shutdown().await;
    upstream.shutdown().await;
}

#[tokio::test]
async fn runtime_mode_switch_applies_to_the_next_request() {
    let upstream = spawn_upstream().await;
    let cassettes = tempfile::tempdir().unwrap();
    let config = proxy_config("spy", upstream.addr, cassettes.path());
    let proxy = vcrproxy::proxy::serve(&config).await.unwrap();
    let client = test_client();

    let recorded_url = format!("http://{}/api/v1/users", proxy.listen_addr);
    send_json(&client, Method::POST, recorded_url.clone(), r#"{"name":"Alice"}"#).await;
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);

    let req = Request::builder()
        .method(Method::PUT)
        .uri(format!("http://{}/api/mode", proxy.admin_listen_addr))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from_static(br#"{"mode":"replay"}"#)))
        .unwrap();
    let res = client.request(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(
        serde_json::from_slice::<Value>(&body).unwrap()["mode"].as_str(),
        Some("replay")
    );

    let req = Request::builder()
        .method(Method::GET)
        .uri(format!("http://{}/api/mode", proxy.admin_listen_addr))
        .body(Full::new(Bytes::new()))
        .unwrap();
    let res = client.request(req).await.unwrap();
    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(
        serde_json::from_slice::<Value>(&body).unwrap()["mode"].as_str(),
        Some("replay")
    );

    // Recorded request replays; anything else is now a hard miss.
    let res = send_json(&client, Method::POST, recorded_url, r#"{"name":"Alice"}"#).await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let res = send_json(
        &client,
        Method::POST,
        format!("http://{}/api/v1/other", proxy.listen_addr),
        r#"{"name":"Alice"}"#,
    )
    .await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);

    proxy.shutdown().await;
    upstream.shutdown().await;
}

#[tokio::test]
async fn record_mode_always_forwards_and_respects_overwrite_policy() {
    let upstream = spawn_upstream().await;
    let cassettes = tempfile::tempdir().unwrap();
    let yaml = format!(
        r#"
mode: record
port: 0
admin_port: 0
targets:
  /api: http://{}
cassettes:
  dir: {}
  overwrite: false
"#,
        upstream.addr,
        cassettes.path().display()
    );
    let config = vcrproxy::config::Config::from_yaml_str(&yaml).unwrap();
    let proxy = vcrproxy::proxy::serve(&config).await.unwrap();
    let client = test_client();

    let url = format!("http://{}/api/v1/users", proxy.listen_addr);
    let res = send_json(&client, Method::POST, url.clone(), r#"{"name":"Alice"}"#).await;
    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"upstream-body-1");

    // Record mode never consults the cache: the upstream is called again and
    // the live response is returned, but the first cassette survives.
    let res = send_json(&client, Method::POST, url, r#"{"name":"Alice"}"#).await;
    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"upstream-body-2");
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);

    let files = cassette_files(cassettes.path(), upstream.addr);
    assert_eq!(files.len(), 1);
    let cassette: Value = serde_json::from_slice(&std::fs::read(&files[0]).unwrap()).unwrap();
    assert_eq!(cassette["response"]["body"].as_str(), Some("upstream-body-1"));

    let stats = admin_stats(&client, proxy.admin_listen_addr).await;
    assert_eq!(stats["recorded"].as_u64(), Some(1));
    assert_eq!(stats["hits"].as_u64(), Some(0));

    proxy.shutdown().await;
    upstream.shutdown().await;
}

#[tokio::test]
async fn concurrent_identical_requests_share_one_upstream_call() {
    let upstream = spawn_upstream_with(Duration::from_millis(150), default_responder()).await;
    let cassettes = tempfile::tempdir().unwrap();
    let config = proxy_config("spy", upstream.addr, cassettes.path());
    let proxy = vcrproxy::proxy::serve(&config).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let url = format!("http://{}/api/v1/users", proxy.listen_addr);
        handles.push(tokio::spawn(async move {
            let client = test_client();
            let res = send_json(&client, Method::POST, url, r#"{"name":"Alice"}"#).await;
            let status = res.status();
            let body = res.into_body().collect().await.unwrap().to_bytes();
            (status, body)
        }));
    }

    for handle in handles {
        let (status, body) = handle.await.unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(&body[..], b"upstream-body-1");
    }

    assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
    assert_eq!(cassette_files(cassettes.path(), upstream.addr).len(), 1);

    let client = test_client();
    let stats = admin_stats(&client, proxy.admin_listen_addr).await;
    assert_eq!(stats["recorded"].as_u64(), Some(1));

    proxy.shutdown().await;
    upstream.shutdown().await;
}

#[tokio::test]
async fn forwards_request_and_strips_hop_by_hop_headers() {
    let mut upstream = spawn_upstream().await;
    let cassettes = tempfile::tempdir().unwrap();
    let config = proxy_config("record", upstream.addr, cassettes.path());
    let proxy = vcrproxy::proxy::serve(&config).await.unwrap();
    let client = test_client();

    let mut req = Request::builder()
        .method(Method::GET)
        .uri(format!("http://{}/api/hello?x=1", proxy.listen_addr))
        .header(header::CONNECTION, "x-hop")
        .header("x-hop", "secret")
        .header("x-end", "kept")
        .body(Full::new(Bytes::new()))
        .unwrap();
    req.headers_mut()
        .insert(header::HOST, HeaderValue::from_static("proxy.invalid"));

    let res = client.request(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    assert_eq!(
        res.headers().get("x-resp-end").unwrap(),
        &HeaderValue::from_static("ok")
    );
    assert!(res.headers().get("x-resp-hop").is_none());

    let captured = upstream.captured_rx.recv().await.unwrap();
    assert_eq!(captured.uri.path(), "/hello");
    assert_eq!(captured.uri.query(), Some("x=1"));
    assert_eq!(
        captured.headers.get("x-end").unwrap(),
        &HeaderValue::from_static("kept")
    );
    assert!(captured.headers.get("x-hop").is_none());
    assert_eq!(
        captured.headers.get(header::HOST).unwrap(),
        &HeaderValue::from_str(&upstream.addr.to_string()).unwrap()
    );
    assert_eq!(&captured.body[..], b"");

    proxy.shutdown().await;
    upstream.shutdown().await;
}

#[tokio::test]
async fn binary_upstream_bodies_round_trip_through_base64_cassettes() {
    const BINARY_BODY: &[u8] = &[0x00, 0x01, 0xfe, 0xff, 0x80];
    let responder: Responder = Arc::new(|_call| {
        let mut res = Response::new(Full::new(Bytes::from_static(BINARY_BODY)));
        *res.status_mut() = StatusCode::OK;
        res.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        res
    });
    let upstream = spawn_upstream_with(Duration::ZERO, responder).await;
    let cassettes = tempfile::tempdir().unwrap();
    let config = proxy_config("spy", upstream.addr, cassettes.path());
    let proxy = vcrproxy::proxy::serve(&config).await.unwrap();
    let client = test_client();

    let url = format!("http://{}/api/v1/blob", proxy.listen_addr);
    let req = Request::builder()
        .method(Method::GET)
        .uri(url.clone())
        .body(Full::new(Bytes::new()))
        .unwrap();
    let res = client.request(req).await.unwrap();
    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], BINARY_BODY);

    let files = cassette_files(cassettes.path(), upstream.addr);
    let cassette: Value = serde_json::from_slice(&std::fs::read(&files[0]).unwrap()).unwrap();
    assert_eq!(cassette["response"]["body_encoding"].as_str(), Some("base64"));

    // Warm read decodes back to the original bytes.
    let req = Request::builder()
        .method(Method::GET)
        .uri(url)
        .body(Full::new(Bytes::new()))
        .unwrap();
    let res = client.request(req).await.unwrap();
    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], BINARY_BODY);
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);

    proxy.shutdown().await;
    upstream.shutdown().await;
}

#[tokio::test]
async fn unmatched_path_returns_502_and_counts_an_error() {
    let upstream = spawn_upstream().await;
    let cassettes = tempfile::tempdir().unwrap();
    let config = proxy_config("spy", upstream.addr, cassettes.path());
    let proxy = vcrproxy::proxy::serve(&config).await.unwrap();
    let client = test_client();

    let req = Request::builder()
        .method(Method::GET)
        .uri(format!("http://{}/unrouted/path", proxy.listen_addr))
        .body(Full::new(Bytes::new()))
        .unwrap();
    let res = client.request(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
    let body = res.into_body().collect().await.unwrap().to_bytes();
    let payload: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(payload["error"].as_str(), Some("upstream_unavailable"));

    let stats = admin_stats(&client, proxy.admin_listen_addr).await;
    assert_eq!(stats["errors"].as_u64(), Some(1));

    proxy.shutdown().await;
    upstream.shutdown().await;
}

#[tokio::test]
async fn unreachable_upstream_returns_502_without_writing_a_cassette() {
    let cassettes = tempfile::tempdir().unwrap();
    // Reserve an address and close it so nothing listens there.
    let dead_addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let config = proxy_config("spy", dead_addr, cassettes.path());
    let proxy = vcrproxy::proxy::serve(&config).await.unwrap();
    let client = test_client();

    let url = format!("http://{}/api/v1/users", proxy.listen_addr);
    let res = send_json(&client, Method::POST, url, r#"{"name":"Alice"}"#).await;
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
    let body = res.into_body().collect().await.unwrap().to_bytes();
    let payload: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(payload["error"].as_str(), Some("upstream_unavailable"));
    assert!(payload["detail"].is_string());

    assert!(cassette_files(cassettes.path(), dead_addr).is_empty());
    let stats = admin_stats(&client, proxy.admin_listen_addr).await;
    assert_eq!(stats["errors"].as_u64(), Some(1));
    assert_eq!(stats["recorded"].as_u64(), Some(0));

    proxy.shutdown().await;
}

#[tokio::test]
async fn upstream_5xx_is_recorded_and_replayed_verbatim() {
    let responder: Responder = Arc::new(|call| {
        let mut res = Response::new(Full::new(Bytes::from(format!("boom-{call}"))));
        *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        res
    });
    let upstream = spawn_upstream_with(Duration::ZERO, responder).await;
    let cassettes = tempfile::tempdir().unwrap();
    let config = proxy_config("spy", upstream.addr, cassettes.path());
    let proxy = vcrproxy::proxy::serve(&config).await.unwrap();
    let client = test_client();

    let url = format!("http://{}/api/v1/flaky", proxy.listen_addr);
    let res = send_json(&client, Method::GET, url.clone(), "").await;
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"boom-1");

    // The 5xx came from the upstream and was recorded, not retried.
    let res = send_json(&client, Method::GET, url, "").await;
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"boom-1");
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);

    let stats = admin_stats(&client, proxy.admin_listen_addr).await;
    assert_eq!(stats["recorded"].as_u64(), Some(1));
    assert_eq!(stats["hits"].as_u64(), Some(1));
    // A proxied upstream 5xx is not a proxy error.
    assert_eq!(stats["errors"].as_u64(), Some(0));

    proxy.shutdown().await;
    upstream.shutdown().await;
}

#[tokio::test]
async fn oversized_request_body_is_rejected_with_400() {
    let upstream = spawn_upstream().await;
    let cassettes = tempfile::tempdir().unwrap();
    let yaml = format!(
        r#"
mode: spy
port: 0
admin_port: 0
targets:
  /api: http://{}
cassettes:
  dir: {}
max_body_size: 64
"#,
        upstream.addr,
        cassettes.path().display()
    );
    let config = vcrproxy::config::Config::from_yaml_str(&yaml).unwrap();
    let proxy = vcrproxy::proxy::serve(&config).await.unwrap();
    let client = test_client();

    let url = format!("http://{}/api/v1/users", proxy.listen_addr);
    let oversized = "x".repeat(256);
    let res = send_json(&client, Method::POST, url, &oversized).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body = res.into_body().collect().await.unwrap().to_bytes();
    let payload: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(payload["error"].as_str(), Some("body_too_large"));

    assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
    assert!(cassette_files(cassettes.path(), upstream.addr).is_empty());

    proxy.shutdown().await;
    upstream.shutdown().await;
}

#[tokio::test]
async fn upstream_timeout_returns_504_without_writing_a_cassette() {
    let upstream = spawn_upstream_with(Duration::from_millis(500), default_responder()).await;
    let cassettes = tempfile::tempdir().unwrap();
    let yaml = format!(
        r#"
mode: spy
port: 0
admin_port: 0
targets:
  /api: http://{}
cassettes:
  dir: {}
proxy_timeout: 0.1
"#,
        upstream.addr,
        cassettes.path().display()
    );
    let config = vcrproxy::config::Config::from_yaml_str(&yaml).unwrap();
    let proxy = vcrproxy::proxy::serve(&config).await.unwrap();
    let client = test_client();

    let url = format!("http://{}/api/v1/slow", proxy.listen_addr);
    let res = send_json(&client, Method::GET, url, "").await;
    assert_eq!(res.status(), StatusCode::GATEWAY_TIMEOUT);
    let body = res.into_body().collect().await.unwrap().to_bytes();
    let payload: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(payload["error"].as_str(), Some("upstream_timeout"));

    assert!(cassette_files(cassettes.path(), upstream.addr).is_empty());
    let stats = admin_stats(&client, proxy.admin_listen_addr).await;
    assert_eq!(stats["errors"].as_u64(), Some(1));
    assert_eq!(stats["recorded"].as_u64(), Some(0));

    proxy.shutdown().await;
    upstream.shutdown().await;
}

#[tokio::test]
async fn trailing_slash_and_header_case_hit_the_same_cassette() {
    let upstream = spawn_upstream().await;
    let cassettes = tempfile::tempdir().unwrap();
    let config = proxy_config("spy", upstream.addr, cassettes.path());
    let proxy = vcrproxy::proxy::serve(&config).await.unwrap();
    let client = test_client();

    let req = Request::builder()
        .method(Method::GET)
        .uri(format!("http://{}/api/v1/users?b=2&a=1", proxy.listen_addr))
        .header("X-Team", "core")
        .header("x-request-id", "first")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let res = client.request(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);

    // Trailing slash, different header case, reordered query, fresh
    // request id: still the same fingerprint.
    let req = Request::builder()
        .method(Method::GET)
        .uri(format!("http://{}/api/v1/Users/?a=1&b=2", proxy.listen_addr))
        .header("x-team", "core")
        .header("X-Request-Id", "second")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let res = client.request(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"upstream-body-1");
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);

    proxy.shutdown().await;
    upstream.shutdown().await;
}
