//! HTTP server: health check plus a reverse proxy that hands HTML responses
//! to the experiment orchestrator.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::body::{Body, HttpBody as _};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio_stream::StreamExt as _;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};
use url::Url;

use experiflow_engine::headers::is_html;
use experiflow_engine::{Orchestrator, ProxiedResponse, VisitorContext};

/// Headers that only make sense for a single connection.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    client: reqwest::Client,
    origin: Url,
    orchestrator: Arc<Orchestrator>,
    read_timeout: Duration,
}

impl AppState {
    pub fn new(origin: Url, orchestrator: Orchestrator, read_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("building origin HTTP client")?;
        Ok(Self {
            client,
            origin,
            orchestrator: Arc::new(orchestrator),
            read_timeout,
        })
    }
}

pub fn router(state: AppState, write_timeout: Duration) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(forward)
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, write_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> impl IntoResponse {
    Json(json!({"status": "healthy", "service": "experiflow-proxy"}))
}

async fn forward(State(state): State<AppState>, request: Request) -> Response {
    match proxy(&state, request).await {
        Ok(response) => response,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Proxy error");
            (StatusCode::BAD_GATEWAY, "Proxy error").into_response()
        }
    }
}

async fn proxy(state: &AppState, request: Request) -> anyhow::Result<Response> {
    let (parts, body) = request.into_parts();
    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let visitor = VisitorContext::from_headers(&parts.headers, peer);

    let url = origin_url(&state.origin, &parts.uri);
    let headers = outbound_headers(&parts.headers, &state.origin, peer);
    debug!(method = %parts.method, %url, "Forwarding to origin");

    let mut outbound = state
        .client
        .request(parts.method.clone(), url)
        .headers(headers);
    if !body.is_end_stream() {
        if let Some(length) = parts.headers.get(header::CONTENT_LENGTH) {
            outbound = outbound.header(header::CONTENT_LENGTH, length.clone());
        }
        outbound = outbound.body(streamed_body(body, state.read_timeout));
    }
    let upstream = outbound.send().await.context("origin request failed")?;

    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    strip_hop_by_hop(&mut headers);

    if !has_body(&parts.method, status) || !is_html(&headers) {
        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        return Ok(response);
    }

    let body = upstream.bytes().await.context("reading origin body")?;
    let mut proxied = ProxiedResponse { headers, body };
    let reports = state.orchestrator.modify_response(&visitor, &mut proxied).await;
    for report in &reports {
        debug!(
            experiment = %report.experiment_id,
            variant = %report.variant_key,
            status = %report.status,
            new_assignment = report.new_assignment,
            "Experiment attempt"
        );
    }

    let mut response = Response::new(Body::from(proxied.body));
    *response.status_mut() = status;
    *response.headers_mut() = proxied.headers;
    Ok(response)
}

// ---------------------------------------------------------------------------
// Request rewriting
// ---------------------------------------------------------------------------

/// The inbound body as a stream for the origin request. Each chunk must
/// arrive within `read_timeout` of the previous one.
fn streamed_body(body: Body, read_timeout: Duration) -> reqwest::Body {
    let chunks = body
        .into_data_stream()
        .timeout(read_timeout)
        .map(|chunk| match chunk {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(e)) => Err(std::io::Error::other(e)),
            Err(_) => Err(std::io::Error::new(
                ErrorKind::TimedOut,
                "timed out reading request body",
            )),
        });
    reqwest::Body::wrap_stream(chunks)
}

/// Whether a response to `method` with `status` can carry a body at all.
fn has_body(method: &Method, status: StatusCode) -> bool {
    *method != Method::HEAD
        && !status.is_informational()
        && status != StatusCode::NO_CONTENT
        && status != StatusCode::NOT_MODIFIED
}

/// `origin` joined with the inbound path and query.
fn origin_url(origin: &Url, uri: &Uri) -> Url {
    let mut url = origin.clone();
    let base = origin.path().trim_end_matches('/');
    url.set_path(&format!("{base}{}", uri.path()));
    url.set_query(uri.query());
    url
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named in `Connection` are hop-by-hop too.
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

fn outbound_headers(inbound: &HeaderMap, origin: &Url, peer: Option<std::net::IpAddr>) -> HeaderMap {
    let mut headers = inbound.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    // Ask for an identity-encoded body so HTML can be rewritten.
    headers.remove(header::ACCEPT_ENCODING);

    if let Some(host) = inbound.get(header::HOST) {
        headers.insert("x-forwarded-host", host.clone());
    }
    if let Ok(proto) = HeaderValue::from_str(origin.scheme()) {
        headers.insert("x-forwarded-proto", proto);
    }
    if let Some(ip) = peer {
        let forwarded = match inbound.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            Some(prior) => format!("{prior}, {ip}"),
            None => ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded) {
            headers.insert("x-forwarded-for", value);
        }
    }
    headers
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
