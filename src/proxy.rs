use std::{
    collections::{BTreeMap, HashSet},
    convert::Infallible,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use chrono::Utc;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    Method, Request, Response, StatusCode, Uri,
    body::Incoming,
    header::{self, HeaderMap, HeaderName, HeaderValue},
    service::service_fn,
};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::{net::TcpListener, sync::oneshot};

use crate::{
    config::{Config, ProxyMode},
    fingerprint,
    mode::ModeEngine,
    normalize::{self, CanonicalRequest, MatchPolicy},
    route_config::{RouteConfig, RouteConfigStore},
    singleflight::{self, Flight, SingleFlight},
    store::{
        CASSETTE_FORMAT_VERSION, Cassette, CassetteMeta, CassetteStore, RecordedRequest,
        RecordedResponse, SaveOutcome, encode_body,
    },
};

type ProxyHttpsConnector = HttpsConnector<HttpConnector>;
type HttpClient = Client<ProxyHttpsConnector, Full<Bytes>>;

const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Bind failure carries its own type so `main` can map it to exit code 2.
#[derive(Debug)]
pub struct PortBindError {
    pub addr: SocketAddr,
    source: std::io::Error,
}

impl std::fmt::Display for PortBindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bind {}: {}", self.addr, self.source)
    }
}

impl std::error::Error for PortBindError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

#[derive(Debug)]
pub struct ProxyHandle {
    pub listen_addr: SocketAddr,
    pub admin_listen_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
    admin_shutdown_tx: oneshot::Sender<()>,
    admin_join: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.admin_shutdown_tx.send(());
        let _ = self.join.await;
        let _ = self.admin_join.await;
    }
}

pub async fn serve(config: &Config) -> anyhow::Result<ProxyHandle> {
    ensure_rustls_crypto_provider()?;

    let listener = bind(SocketAddr::from(([0, 0, 0, 0], config.port))).await?;
    let listen_addr = listener
        .local_addr()
        .map_err(|err| anyhow::anyhow!("get local_addr: {err}"))?;
    let admin_listener = bind(SocketAddr::from(([0, 0, 0, 0], config.admin_port))).await?;
    let admin_listen_addr = admin_listener
        .local_addr()
        .map_err(|err| anyhow::anyhow!("get admin local_addr: {err}"))?;

    let state = Arc::new(ProxyState::from_config(config)?);

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let accept_state = Arc::clone(&state);
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let state = Arc::clone(&accept_state);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| proxy_handler(req, Arc::clone(&state)));
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!("connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    let (admin_shutdown_tx, mut admin_shutdown_rx) = oneshot::channel::<()>();
    let admin_state = Arc::clone(&state);
    let admin_join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut admin_shutdown_rx => break,
                accept = admin_listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let state = Arc::clone(&admin_state);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| admin_handler(req, Arc::clone(&state)));
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!("admin connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    tracing::info!(
        listen = %listen_addr,
        admin = %admin_listen_addr,
        mode = state.engine.mode().as_str(),
        "proxy started"
    );

    Ok(ProxyHandle {
        listen_addr,
        admin_listen_addr,
        shutdown_tx,
        join,
        admin_shutdown_tx,
        admin_join,
    })
}

async fn bind(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| anyhow::Error::new(PortBindError { addr, source }))
}

fn ensure_rustls_crypto_provider() -> anyhow::Result<()> {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return Ok(());
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(anyhow::anyhow!("install rustls ring crypto provider"));
    }
    Ok(())
}

fn build_http_client() -> anyhow::Result<HttpClient> {
    let connector = HttpsConnectorBuilder::new()
        .with_native_roots()
        .map_err(|err| anyhow::anyhow!("load native TLS root certificates: {err}"))?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();
    Ok(Client::builder(TokioExecutor::new()).build(connector))
}

#[derive(Debug, Clone)]
struct TargetRoute {
    prefix: String,
    target: Uri,
    /// The configured URL, stored verbatim in cassette metadata.
    display: String,
    domain: String,
}

struct ProxyState {
    targets: Vec<TargetRoute>,
    client: HttpClient,
    store: CassetteStore,
    routes: RouteConfigStore,
    engine: ModeEngine,
    flights: SingleFlight<FlightOutcome>,
    always_ignore_headers: Vec<String>,
    proxy_timeout: Duration,
    max_body_bytes: usize,
    overwrite: bool,
}

impl ProxyState {
    fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut targets = Vec::with_capacity(config.targets.len());
        for (prefix, target) in &config.targets {
            let uri: Uri = target
                .parse()
                .map_err(|err| anyhow::anyhow!("parse target URL `{target}`: {err}"))?;
            let domain = uri
                .authority()
                .ok_or_else(|| anyhow::anyhow!("target URL `{target}` must include a host"))?
                .to_string();
            targets.push(TargetRoute {
                prefix: prefix.clone(),
                target: uri,
                display: target.clone(),
                domain,
            });
        }
        // Longest prefix wins.
        targets.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        Ok(Self {
            targets,
            client: build_http_client()?,
            store: CassetteStore::new(&config.cassettes.dir),
            routes: RouteConfigStore::new(&config.cassettes.dir),
            engine: ModeEngine::new(config.mode),
            flights: SingleFlight::default(),
            always_ignore_headers: config.matching.always_ignore_headers_lc(),
            proxy_timeout: config.proxy_timeout(),
            max_body_bytes: config.max_body_size,
            overwrite: config.cassettes.overwrite,
        })
    }
}

#[derive(Debug, Clone)]
struct ResolvedTarget {
    target: Uri,
    display: String,
    domain: String,
    remaining_path: String,
}

fn resolve_target(state: &ProxyState, uri: &Uri) -> Option<ResolvedTarget> {
    // Absolute-form requests (plain-HTTP forward proxying) route by their
    // own authority.
    if let (Some(scheme), Some(authority)) = (uri.scheme(), uri.authority()) {
        let display = format!("{scheme}://{authority}");
        let target: Uri = display.parse().ok()?;
        let path = uri.path();
        return Some(ResolvedTarget {
            target,
            display: display.clone(),
            domain: authority.to_string(),
            remaining_path: if path.is_empty() { "/".to_owned() } else { path.to_owned() },
        });
    }

    let path = uri.path();
    for route in &state.targets {
        if let Some(remaining) = match_prefix(&route.prefix, path) {
            return Some(ResolvedTarget {
                target: route.target.clone(),
                display: route.display.clone(),
                domain: route.domain.clone(),
                remaining_path: remaining,
            });
        }
    }
    None
}

fn match_prefix(prefix: &str, path: &str) -> Option<String> {
    if prefix == "/" {
        return Some(if path.is_empty() { "/".to_owned() } else { path.to_owned() });
    }
    if path == prefix {
        return Some("/".to_owned());
    }
    if let Some(rest) = path.strip_prefix(prefix)
        && rest.starts_with('/')
    {
        return Some(rest.to_owned());
    }
    None
}

enum BodyReadOutcome {
    Buffered(Bytes),
    TooLarge { limit_bytes: usize },
}

async fn read_body_with_limit(
    mut body: Incoming,
    max_body_bytes: usize,
) -> Result<BodyReadOutcome, hyper::Error> {
    let mut buffered = Vec::new();
    let mut buffered_len = 0usize;
    while let Some(frame_result) = body.frame().await {
        let frame = frame_result?;
        let Ok(data) = frame.into_data() else {
            continue;
        };
        buffered_len = buffered_len.saturating_add(data.len());
        if buffered_len > max_body_bytes {
            return Ok(BodyReadOutcome::TooLarge {
                limit_bytes: max_body_bytes,
            });
        }
        buffered.push(data);
    }

    if buffered.len() == 1 {
        return Ok(BodyReadOutcome::Buffered(buffered.remove(0)));
    }
    let mut flat = Vec::with_capacity(buffered_len);
    for chunk in buffered {
        flat.extend_from_slice(&chunk);
    }
    Ok(BodyReadOutcome::Buffered(Bytes::from(flat)))
}

async fn proxy_handler(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    // In-flight requests finish under the mode they started with.
    let mode = state.engine.mode();
    let method = req.method().clone();
    let uri = req.uri().clone();

    if method == Method::CONNECT {
        return Ok(error_response(
            &state,
            StatusCode::BAD_GATEWAY,
            "upstream_unavailable",
            Some("CONNECT tunneling is not supported"),
        ));
    }

    let Some(resolved) = resolve_target(&state, &uri) else {
        return Ok(error_response(
            &state,
            StatusCode::BAD_GATEWAY,
            "upstream_unavailable",
            Some("no target configured for path"),
        ));
    };

    let (parts, inbound_body) = req.into_parts();
    let body = match read_body_with_limit(inbound_body, state.max_body_bytes).await {
        Ok(BodyReadOutcome::Buffered(bytes)) => bytes,
        Ok(BodyReadOutcome::TooLarge { limit_bytes }) => {
            tracing::debug!(limit_bytes, "rejecting oversized request body");
            return Ok(error_response(
                &state,
                StatusCode::BAD_REQUEST,
                "body_too_large",
                Some(&format!("request body exceeds {limit_bytes} bytes")),
            ));
        }
        Err(err) => {
            return Ok(error_response(
                &state,
                StatusCode::BAD_REQUEST,
                "invalid_request",
                Some(&format!("read request body: {err}")),
            ));
        }
    };

    // The route config's ignore lists feed normalization, so it is resolved
    // before fingerprinting during both record and lookup.
    let canonical_path = normalize::normalize_path(&resolved.remaining_path);
    let route_config = match state
        .routes
        .load(&resolved.domain, method.as_str(), &canonical_path)
        .await
    {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("route config load failed, matching without overrides: {err:#}");
            None
        }
    };
    let policy = match_policy(&state, route_config.as_deref());
    let canonical = normalize::normalize(
        &method,
        &resolved.remaining_path,
        uri.query(),
        &parts.headers,
        &body,
        &policy,
    );
    let fp = fingerprint::fingerprint(&canonical);

    let response = match mode {
        ProxyMode::Replay => replay(&state, &resolved, &fp).await,
        ProxyMode::Record => {
            forward_and_record(
                &state,
                &resolved,
                &method,
                &parts.headers,
                &body,
                uri.query(),
                &canonical,
                &fp,
            )
            .await
        }
        ProxyMode::Spy => match state.store.lookup(&resolved.domain, &fp).await {
            Ok(Some(cassette)) => {
                state.engine.record_hit();
                tracing::info!(method = %method, path = %canonical.path, fingerprint = %fp, "cache hit");
                cassette_response(&state, &cassette)
            }
            Ok(None) => {
                state.engine.record_miss();
                forward_and_record(
                    &state,
                    &resolved,
                    &method,
                    &parts.headers,
                    &body,
                    uri.query(),
                    &canonical,
                    &fp,
                )
                .await
            }
            Err(err) => error_response(
                &state,
                StatusCode::INTERNAL_SERVER_ERROR,
                "store_io",
                Some(&format!("{err:#}")),
            ),
        },
    };

    Ok(response)
}

fn match_policy(state: &ProxyState, route: Option<&RouteConfig>) -> MatchPolicy {
    match route {
        Some(route) => MatchPolicy::new(
            &state.always_ignore_headers,
            &route.ignore.headers,
            &route.ignore.query_params,
            &route.ignore.body_fields,
        ),
        None => MatchPolicy::new(&state.always_ignore_headers, &[], &[], &[]),
    }
}

async fn replay(state: &ProxyState, resolved: &ResolvedTarget, fp: &str) -> Response<Full<Bytes>> {
    match state.store.lookup(&resolved.domain, fp).await {
        Ok(Some(cassette)) => {
            state.engine.record_hit();
            tracing::info!(fingerprint = %fp, "cache hit");
            cassette_response(state, &cassette)
        }
        Ok(None) => {
            state.engine.record_miss();
            tracing::info!(fingerprint = %fp, "cache miss");
            json_response(
                StatusCode::NOT_FOUND,
                &json!({"error": "cassette_miss", "fingerprint": fp}),
            )
        }
        Err(err) => error_response(
            state,
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_io",
            Some(&format!("{err:#}")),
        ),
    }
}

#[derive(Debug, Clone)]
enum FlightOutcome {
    Success(Arc<UpstreamExchange>),
    Timeout,
    Unavailable(String),
    StoreFailed(String),
}

#[derive(Debug)]
struct UpstreamExchange {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

#[allow(clippy::too_many_arguments)]
async fn forward_and_record(
    state: &Arc<ProxyState>,
    resolved: &ResolvedTarget,
    method: &Method,
    inbound_headers: &HeaderMap,
    body: &Bytes,
    raw_query: Option<&str>,
    canonical: &CanonicalRequest,
    fp: &str,
) -> Response<Full<Bytes>> {
    match state.flights.join(fp) {
        Flight::Leader(leader) => {
            let outcome = fetch_and_store(
                state,
                resolved,
                method,
                inbound_headers,
                body,
                raw_query,
                canonical,
                fp,
            )
            .await;
            leader.complete(outcome.clone());
            outcome_response(state, outcome)
        }
        Flight::Follower(rx) => match singleflight::await_outcome(rx).await {
            Ok(outcome) => outcome_response(state, outcome),
            Err(_aborted) => error_response(
                state,
                StatusCode::BAD_GATEWAY,
                "upstream_unavailable",
                Some("concurrent recording was cancelled; retry"),
            ),
        },
    }
}

#[allow(clippy::too_many_arguments)]
async fn fetch_and_store(
    state: &ProxyState,
    resolved: &ResolvedTarget,
    method: &Method,
    inbound_headers: &HeaderMap,
    body: &Bytes,
    raw_query: Option<&str>,
    canonical: &CanonicalRequest,
    fp: &str,
) -> FlightOutcome {
    let upstream_uri = match upstream_uri(&resolved.target, &resolved.remaining_path, raw_query) {
        Ok(uri) => uri,
        Err(err) => return FlightOutcome::Unavailable(format!("build upstream request: {err:#}")),
    };
    let upstream_req =
        match build_upstream_request(method, &upstream_uri, inbound_headers, body.clone()) {
            Ok(req) => req,
            Err(err) => {
                return FlightOutcome::Unavailable(format!("build upstream request: {err:#}"));
            }
        };

    tracing::debug!(upstream = %upstream_uri, "forwarding to upstream");
    let upstream_res =
        match tokio::time::timeout(state.proxy_timeout, state.client.request(upstream_req)).await {
            Err(_elapsed) => return FlightOutcome::Timeout,
            Ok(Err(err)) => return FlightOutcome::Unavailable(err.to_string()),
            Ok(Ok(res)) => res,
        };

    let (res_parts, res_body) = upstream_res.into_parts();
    let res_body = match read_body_with_limit(res_body, state.max_body_bytes).await {
        Ok(BodyReadOutcome::Buffered(bytes)) => bytes,
        Ok(BodyReadOutcome::TooLarge { limit_bytes }) => {
            return FlightOutcome::Unavailable(format!(
                "upstream response body exceeds {limit_bytes} bytes"
            ));
        }
        Err(err) => return FlightOutcome::Unavailable(format!("read upstream response: {err}")),
    };

    let kept_headers = filter_hop_by_hop(&res_parts.headers);
    let cassette = build_cassette(
        resolved,
        inbound_headers,
        body,
        raw_query,
        canonical,
        fp,
        res_parts.status,
        &kept_headers,
        &res_body,
    );

    match state.store.save(cassette, state.overwrite).await {
        Ok(outcome) => {
            if outcome == SaveOutcome::Recorded {
                state.engine.record_recorded();
                tracing::info!(
                    method = %canonical.method,
                    path = %canonical.path,
                    fingerprint = %fp,
                    status = res_parts.status.as_u16(),
                    "cassette recorded"
                );
            }
            let content_type = content_type_of(inbound_headers);
            let route_config = RouteConfig::default_for_request(
                canonical.method.as_str(),
                &canonical.path,
                normalize::parse_query_pairs(raw_query)
                    .into_iter()
                    .map(|(name, _)| name)
                    .collect(),
                inbound_headers
                    .keys()
                    .map(|name| name.as_str().to_ascii_lowercase())
                    .collect(),
                body,
                content_type.as_deref(),
            );
            if let Err(err) = state.routes.ensure_exists(&resolved.domain, route_config).await {
                tracing::warn!("write route config: {err:#}");
            }
        }
        Err(err) => return FlightOutcome::StoreFailed(format!("{err:#}")),
    }

    FlightOutcome::Success(Arc::new(UpstreamExchange {
        status: res_parts.status,
        headers: kept_headers,
        body: res_body,
    }))
}

#[allow(clippy::too_many_arguments)]
fn build_cassette(
    resolved: &ResolvedTarget,
    inbound_headers: &HeaderMap,
    body: &Bytes,
    raw_query: Option<&str>,
    canonical: &CanonicalRequest,
    fp: &str,
    status: StatusCode,
    response_headers: &HeaderMap,
    response_body: &Bytes,
) -> Cassette {
    let (request_body, request_body_encoding) = encode_body(body);
    let (stored_response_body, response_body_encoding) = encode_body(response_body);

    let mut query: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in normalize::parse_query_pairs(raw_query) {
        query.entry(name).or_default().push(value);
    }

    Cassette {
        meta: CassetteMeta {
            recorded_at: Utc::now(),
            target: resolved.display.clone(),
            domain: resolved.domain.clone(),
            version: CASSETTE_FORMAT_VERSION.to_owned(),
            fingerprint: fp.to_owned(),
        },
        request: RecordedRequest {
            method: canonical.method.clone(),
            path: canonical.path.clone(),
            query,
            headers: headers_to_map(inbound_headers),
            body: request_body,
            body_encoding: request_body_encoding,
            content_type: content_type_of(inbound_headers).unwrap_or_default(),
        },
        response: RecordedResponse {
            status_code: status.as_u16(),
            headers: headers_to_map(response_headers),
            body: stored_response_body,
            body_encoding: response_body_encoding,
        },
    }
}

fn content_type_of(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::CONTENT_TYPE)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
}

fn headers_to_map(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers.iter() {
        out.entry(name.as_str().to_ascii_lowercase())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    out
}

fn upstream_uri(target: &Uri, remaining_path: &str, raw_query: Option<&str>) -> anyhow::Result<Uri> {
    let base_path = target.path().trim_end_matches('/');
    let mut path_and_query = format!("{base_path}{remaining_path}");
    if path_and_query.is_empty() {
        path_and_query.push('/');
    }
    if let Some(query) = raw_query {
        path_and_query.push('?');
        path_and_query.push_str(query);
    }

    let mut builder = Uri::builder();
    if let Some(scheme) = target.scheme() {
        builder = builder.scheme(scheme.clone());
    }
    if let Some(authority) = target.authority() {
        builder = builder.authority(authority.clone());
    }
    builder
        .path_and_query(path_and_query)
        .build()
        .map_err(|err| anyhow::anyhow!("build upstream URI: {err}"))
}

fn build_upstream_request(
    method: &Method,
    uri: &Uri,
    inbound_headers: &HeaderMap,
    body: Bytes,
) -> anyhow::Result<Request<Full<Bytes>>> {
    let mut request = Request::builder()
        .method(method.clone())
        .uri(uri.clone())
        .body(Full::new(body))
        .map_err(|err| anyhow::anyhow!("assemble upstream request: {err}"))?;

    let headers = request.headers_mut();
    for (name, value) in filter_hop_by_hop(inbound_headers).iter() {
        if name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    if let Some(authority) = uri.authority() {
        let host = HeaderValue::from_str(authority.as_str())
            .map_err(|err| anyhow::anyhow!("set upstream host header: {err}"))?;
        headers.insert(header::HOST, host);
    }
    Ok(request)
}

/// Removes hop-by-hop headers plus anything named by the `connection` header.
fn filter_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut connection_named: HashSet<String> = HashSet::new();
    for value in headers.get_all(header::CONNECTION) {
        if let Ok(value) = value.to_str() {
            for token in value.split(',') {
                let token = token.trim().to_ascii_lowercase();
                if !token.is_empty() {
                    connection_named.insert(token);
                }
            }
        }
    }

    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        let name_lc = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP_HEADERS.contains(&name_lc.as_str()) || connection_named.contains(&name_lc) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn outcome_response(state: &ProxyState, outcome: FlightOutcome) -> Response<Full<Bytes>> {
    match outcome {
        FlightOutcome::Success(exchange) => {
            let mut response = Response::new(Full::new(exchange.body.clone()));
            *response.status_mut() = exchange.status;
            for (name, value) in exchange.headers.iter() {
                response.headers_mut().append(name.clone(), value.clone());
            }
            // The body is re-framed; hyper recomputes the length.
            response.headers_mut().remove(header::CONTENT_LENGTH);
            response
        }
        FlightOutcome::Timeout => error_response(
            state,
            StatusCode::GATEWAY_TIMEOUT,
            "upstream_timeout",
            Some("upstream call exceeded proxy_timeout"),
        ),
        FlightOutcome::Unavailable(detail) => error_response(
            state,
            StatusCode::BAD_GATEWAY,
            "upstream_unavailable",
            Some(&detail),
        ),
        FlightOutcome::StoreFailed(detail) => {
            error_response(state, StatusCode::BAD_GATEWAY, "store_io", Some(&detail))
        }
    }
}

fn cassette_response(state: &ProxyState, cassette: &Cassette) -> Response<Full<Bytes>> {
    let body = match cassette.response.body_bytes() {
        Ok(bytes) => bytes,
        Err(err) => {
            return error_response(
                state,
                StatusCode::INTERNAL_SERVER_ERROR,
                "store_io",
                Some(&format!("{err:#}")),
            );
        }
    };
    let Ok(status) = StatusCode::from_u16(cassette.response.status_code) else {
        return error_response(
            state,
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_io",
            Some(&format!(
                "cassette has invalid status code {}",
                cassette.response.status_code
            )),
        );
    };

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    for (name, values) in &cassette.response.headers {
        let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
            tracing::debug!(name, "skipping invalid cassette header name");
            continue;
        };
        for value in values {
            let Ok(header_value) = HeaderValue::from_str(value) else {
                tracing::debug!(name, "skipping invalid cassette header value");
                continue;
            };
            response.headers_mut().append(header_name.clone(), header_value);
        }
    }
    let filtered = filter_hop_by_hop(response.headers());
    *response.headers_mut() = filtered;
    response.headers_mut().remove(header::CONTENT_LENGTH);
    response
}

fn json_response<T: Serialize>(status: StatusCode, payload: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(payload) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            *response.status_mut() = status;
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(err) => {
            tracing::debug!("failed to serialize JSON response: {err}");
            let mut response = Response::new(Full::new(Bytes::from_static(
                br#"{"error":"internal"}"#,
            )));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            response
        }
    }
}

/// Error payload for the proxy surface. Every 5xx the handler emits counts
/// toward the `errors` stat.
fn error_response(
    state: &ProxyState,
    status: StatusCode,
    kind: &str,
    detail: Option<&str>,
) -> Response<Full<Bytes>> {
    if status.is_server_error() {
        state.engine.record_error();
        tracing::warn!(status = status.as_u16(), kind, detail, "request failed");
    }
    let mut payload = json!({"error": kind});
    if let Some(detail) = detail {
        payload["detail"] = json!(detail);
    }
    json_response(status, &payload)
}

fn admin_error_response(status: StatusCode, kind: &str, detail: Option<&str>) -> Response<Full<Bytes>> {
    let mut payload = json!({"error": kind});
    if let Some(detail) = detail {
        payload["detail"] = json!(detail);
    }
    json_response(status, &payload)
}

#[derive(Debug, Deserialize)]
struct SetModeRequest {
    mode: ProxyMode,
}

async fn admin_handler(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let segments: Vec<&str> = path
        .trim_matches('/')
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();

    let response = match segments.as_slice() {
        ["api", "mode"] => match method {
            Method::GET => json_response(
                StatusCode::OK,
                &json!({"mode": state.engine.mode().as_str()}),
            ),
            Method::PUT => {
                let body_bytes = match req.into_body().collect().await {
                    Ok(body) => body.to_bytes(),
                    Err(err) => {
                        return Ok(admin_error_response(
                            StatusCode::BAD_REQUEST,
                            "invalid_request",
                            Some(&format!("read request body: {err}")),
                        ));
                    }
                };
                match serde_json::from_slice::<SetModeRequest>(&body_bytes) {
                    Ok(request) => {
                        state.engine.set_mode(request.mode);
                        tracing::info!(mode = request.mode.as_str(), "mode changed");
                        json_response(
                            StatusCode::OK,
                            &json!({"mode": request.mode.as_str()}),
                        )
                    }
                    Err(err) => admin_error_response(
                        StatusCode::BAD_REQUEST,
                        "mode_invalid",
                        Some(&err.to_string()),
                    ),
                }
            }
            _ => admin_error_response(StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed", None),
        },
        ["api", "stats"] => match method {
            Method::GET => json_response(StatusCode::OK, &state.engine.stats()),
            _ => admin_error_response(StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed", None),
        },
        ["api", "cassettes"] => match method {
            Method::GET => match state.store.list(None).await {
                Ok(cassettes) => json_response(StatusCode::OK, &cassettes),
                Err(err) => admin_error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "store_io",
                    Some(&format!("{err:#}")),
                ),
            },
            Method::DELETE => match state.store.delete_all().await {
                Ok(deleted) => json_response(StatusCode::OK, &json!({"deleted": deleted})),
                Err(err) => admin_error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "store_io",
                    Some(&format!("{err:#}")),
                ),
            },
            _ => admin_error_response(StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed", None),
        },
        ["api", "cassettes", domain] => match method {
            Method::GET => match state.store.list(Some(*domain)).await {
                Ok(cassettes) => json_response(StatusCode::OK, &cassettes),
                Err(err) => admin_error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "store_io",
                    Some(&format!("{err:#}")),
                ),
            },
            Method::DELETE => match state.store.delete_domain(domain).await {
                Ok(deleted) => json_response(StatusCode::OK, &json!({"deleted": deleted})),
                Err(err) => admin_error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "store_io",
                    Some(&format!("{err:#}")),
                ),
            },
            _ => admin_error_response(StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed", None),
        },
        ["api", "cassettes", domain, id] => match method {
            Method::DELETE => match state.store.delete(domain, id).await {
                Ok(deleted) => {
                    json_response(StatusCode::OK, &json!({"deleted": u32::from(deleted)}))
                }
                Err(err) => admin_error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "store_io",
                    Some(&format!("{err:#}")),
                ),
            },
            _ => admin_error_response(StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed", None),
        },
        _ => admin_error_response(StatusCode::NOT_FOUND, "not_found", None),
    };

    Ok(response)
}
