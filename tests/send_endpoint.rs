//! HTTP surface tests driven through the router without a socket.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use melp::broker::memory::MemoryBroker;
use melp::config::Config;
use melp::metrics::MetricsExporter;
use melp::registry::{Registry, RegistryOptions};
use melp::server::{router, AppState};

const CONFIG: &str = r#"
server:
  allow_stop: true
endpoints:
  kafka:
    - name: local
      endpoint: localhost:9092
producers:
  kafka:
    - id: orders
      endpoint: local
      topic: orders
      auth:
        anon: true
    - id: secured
      endpoint: local
      topic: audit
      auth:
        bearer: s3cret
"#;

async fn build_app(broker: &MemoryBroker, allow_stop: bool) -> (Router, CancellationToken) {
    let config = Config::parse(CONFIG).unwrap();
    let (fatal, _) = mpsc::unbounded_channel();
    let registry = Registry::build(
        &config,
        Arc::new(broker.clone()),
        RegistryOptions::default(),
        fatal,
    )
    .unwrap();
    assert!(registry.connect().await);

    let stop = CancellationToken::new();
    let state = AppState {
        registry: Arc::new(registry),
        allow_stop,
        passthrough_prefix: config.server.passthrough_header_prefix.clone(),
        stop: stop.clone(),
        metrics: MetricsExporter::disabled(),
    };
    (router(state), stop)
}

fn send(id: &str) -> axum::http::request::Builder {
    Request::builder()
        .method("POST")
        .uri(format!("/send/{}", id))
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_unknown_id_is_rejected_without_publishing() {
    let broker = MemoryBroker::new();
    let (app, _) = build_app(&broker, false).await;

    let response = app
        .oneshot(send("unknown-id").body(Body::from("{}")).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(broker.published().await.is_empty());
}

#[tokio::test]
async fn test_send_publishes_and_returns_delivery() {
    let broker = MemoryBroker::new();
    broker.publish("orders", "earlier").await;
    let (app, _) = build_app(&broker, false).await;

    let response = app
        .oneshot(
            send("orders")
                .header(header::CONTENT_TYPE, "application/json")
                .header("melp-tenant", "acme")
                .header(header::COOKIE, "session=1")
                .body(Body::from(r#"{"x":1}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(json, serde_json::json!({"partition": 0, "offset": 1}));

    let published = broker.published().await;
    assert_eq!(published.len(), 1);
    let (topic, msg, _) = &published[0];
    assert_eq!(topic, "orders");
    assert_eq!(&msg.body[..], br#"{"x":1}"#);
    assert_eq!(msg.header("content-type"), Some("application/json"));
    assert_eq!(msg.header("tenant"), Some("acme"));
    assert!(msg.header("cookie").is_none());
    assert!(msg.header("x-request-id").is_some());
}

#[tokio::test]
async fn test_bearer_producer_requires_token() {
    let broker = MemoryBroker::new();
    let (app, _) = build_app(&broker, false).await;

    let response = app
        .clone()
        .oneshot(send("secured").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(
            send("secured")
                .header(header::AUTHORIZATION, "Bearer wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(broker.published().await.is_empty());

    let response = app
        .oneshot(
            send("secured")
                .header(header::AUTHORIZATION, "Bearer s3cret")
                .body(Body::from("audit"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(broker.published().await.len(), 1);
}

#[tokio::test]
async fn test_broker_failure_returns_500() {
    let broker = MemoryBroker::new();
    let (app, _) = build_app(&broker, false).await;
    broker.fail_publishes(Some("leader not available")).await;

    let response = app
        .oneshot(send("orders").body(Body::from("x")).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body_text(response).await.contains("leader not available"));
}

#[tokio::test]
async fn test_stop_requires_allow_stop() {
    let broker = MemoryBroker::new();

    let (app, stop) = build_app(&broker, false).await;
    let response = app
        .oneshot(Request::get("/stop").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(!stop.is_cancelled());

    let (app, stop) = build_app(&broker, true).await;
    let response = app
        .oneshot(Request::get("/stop").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(stop.is_cancelled());
}

#[tokio::test]
async fn test_metrics_disabled_returns_404() {
    let broker = MemoryBroker::new();
    let (app, _) = build_app(&broker, false).await;

    let response = app
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_dump_echoes_request() {
    let broker = MemoryBroker::new();
    let (app, _) = build_app(&broker, false).await;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/dump?source=test")
                .header("x-trace", "t-1")
                .body(Body::from("hello\nworld"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let text = body_text(response).await;
    assert!(text.starts_with("URL: /dump?source=test\n"));
    assert!(text.contains("Param source: test\n"));
    assert!(text.contains("Header x-trace: t-1\n"));
    assert!(text.ends_with(" > hello\n > world\n"));
    assert!(broker.published().await.is_empty());
}

#[tokio::test]
async fn test_fail_answers_requested_status() {
    let broker = MemoryBroker::new();
    let (app, _) = build_app(&broker, false).await;

    for (uri, expected) in [
        ("/fail?status=503", StatusCode::SERVICE_UNAVAILABLE),
        ("/fail?status=418", StatusCode::IM_A_TEAPOT),
        ("/fail", StatusCode::INTERNAL_SERVER_ERROR),
        ("/fail?status=42", StatusCode::BAD_REQUEST),
        ("/fail?status=abc", StatusCode::BAD_REQUEST),
    ] {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), expected, "{}", uri);
    }
}
