//! HTTP surface
//!
//! # Routes
//!
//! - `POST /send/:id`: publish the body through producer `id`; answers
//!   `{"partition":p,"offset":o}`, 400 for an unknown id, 401 when the
//!   producer's auth rejects the request, 500 when the broker does
//! - `GET /stop`: trigger a graceful shutdown when `server.allow_stop` is
//!   set, 403 otherwise
//! - `GET /metrics`: Prometheus text when the exporter is built in, 404
//!   otherwise
//! - `POST /dump`: print the request (URL, query, headers, body) to stdout
//!   and echo the same text back; handy as a callback target
//! - `POST /fail?status=N`: answer with status `N` (500 when absent)
//!
//! Only an allow-list of inbound headers reaches the broker, plus any
//! header under the passthrough prefix (`melp-` by default), which is
//! stripped. A request id is generated when the caller sent none.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::message::Message;
use crate::metrics::MetricsExporter;
use crate::registry::Registry;

/// Header carrying the request identifier.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

const FORWARDED_HEADERS: &[&str] = &[
    "content-type",
    "content-encoding",
    "content-disposition",
    "content-language",
    "content-range",
    "etag",
    "expires",
    REQUEST_ID_HEADER,
    "x-correlation-id",
    "traceparent",
    "tracestate",
];

const FORWARDED_PREFIXES: &[&str] = &["x-b3-"];

/// Application state injected into handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Live units
    pub registry: Arc<Registry>,
    /// Whether `GET /stop` is honoured
    pub allow_stop: bool,
    /// Prefix of headers forwarded with the prefix stripped
    pub passthrough_prefix: String,
    /// Cancelled to stop the process
    pub stop: CancellationToken,
    /// `/metrics` renderer
    pub metrics: MetricsExporter,
}

/// Builds the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/send/:id", post(send_handler))
        .route("/stop", get(stop_handler))
        .route("/metrics", get(metrics_handler))
        .route("/dump", post(dump_handler))
        .route("/fail", post(fail_handler))
        .with_state(state)
}

/// Serves `router` on `listener` until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns the I/O error that stopped the server.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(address = %addr, "HTTP server starting");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

/// Builds the broker message from an inbound request.
///
/// Keeps allow-listed headers and prefixed passthrough headers (prefix
/// stripped), and adds a request id when none was sent.
pub fn build_message(headers: &HeaderMap, body: Bytes, passthrough_prefix: &str) -> Message {
    let mut msg = Message::new(body);
    let prefix = passthrough_prefix.to_ascii_lowercase();

    for (name, value) in headers {
        let name = name.as_str();
        let Ok(value) = value.to_str() else {
            continue;
        };
        if FORWARDED_HEADERS.contains(&name)
            || FORWARDED_PREFIXES.iter().any(|p| name.starts_with(p))
        {
            msg.add_header(name, value);
        } else if !prefix.is_empty() {
            if let Some(stripped) = name.strip_prefix(prefix.as_str()) {
                msg.add_header(stripped, value);
            }
        }
    }

    if msg.header(REQUEST_ID_HEADER).is_none() {
        msg.add_header(REQUEST_ID_HEADER, &uuid::Uuid::new_v4().to_string());
    }
    msg
}

async fn send_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(producer) = state.registry.producer(&id) else {
        debug!(producer = %id, "Unknown producer");
        return (StatusCode::BAD_REQUEST, format!("unknown id '{}'", id)).into_response();
    };

    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if let Err(e) = producer.authorize(authorization) {
        warn!(producer = %id, error = %e, "Request rejected");
        return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
    }

    let msg = build_message(&headers, body, &state.passthrough_prefix);
    match producer.send(&msg).await {
        Ok(delivery) => Json(delivery).into_response(),
        Err(e) => {
            error!(producer = %id, error = %e, "Publish failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn stop_handler(State(state): State<AppState>) -> Response {
    if !state.allow_stop {
        return (StatusCode::FORBIDDEN, "stop is disabled").into_response();
    }
    info!("Stop requested over HTTP");
    state.stop.cancel();
    (StatusCode::OK, "stopping").into_response()
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Some(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Renders a request the way `/dump` prints it
///
/// One line for the URL, one `name: value` line per query parameter and per
/// header, then every body line prefixed with ` > `.
pub fn render_dump(
    uri: &Uri,
    query: &BTreeMap<String, String>,
    headers: &HeaderMap,
    body: &[u8],
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "URL: {}", uri);
    for (name, value) in query {
        let _ = writeln!(out, "Param {}: {}", name, value);
    }
    for (name, value) in headers {
        let _ = writeln!(
            out,
            "Header {}: {}",
            name,
            String::from_utf8_lossy(value.as_bytes())
        );
    }
    for line in String::from_utf8_lossy(body).lines() {
        let _ = writeln!(out, " > {}", line);
    }
    out
}

async fn dump_handler(
    uri: Uri,
    Query(query): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let dump = render_dump(&uri, &query, &headers, &body);
    print!("{}", dump);
    info!(url = %uri, size = body.len(), "dump complete");
    (StatusCode::OK, dump).into_response()
}

#[derive(Debug, Deserialize)]
struct FailParams {
    status: Option<u16>,
}

async fn fail_handler(Query(params): Query<FailParams>) -> Response {
    let code = params.status.unwrap_or(500);
    match StatusCode::from_u16(code) {
        Ok(status) => {
            debug!(status = code, "Failing on request");
            (status, status.canonical_reason().unwrap_or_default()).into_response()
        }
        Err(_) => (StatusCode::BAD_REQUEST, format!("invalid status {}", code)).into_response(),
    }
}
