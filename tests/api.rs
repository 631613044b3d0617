//! Control-plane API tests against the full router.

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower::ServiceExt;

use av_uplink::config::ConfigStore;
use av_uplink::events::EventBus;
use av_uplink::pipeline::{EncoderPipeline, EncoderPipelineConfig, MediaPipeline};
use av_uplink::state::AppState;
use av_uplink::upstream::UpstreamController;
use av_uplink::web::create_router;

async fn router() -> (Router, tempfile::TempDir) {
    let events = Arc::new(EventBus::new());
    let (fault_tx, _fault_rx) = mpsc::unbounded_channel();
    let pipeline: Arc<dyn MediaPipeline> = Arc::new(EncoderPipeline::new(
        EncoderPipelineConfig::default(),
        events.clone(),
        fault_tx.clone(),
    ));
    pipeline.set_ready().await.unwrap();
    let upstream = UpstreamController::new(pipeline.clone(), events.clone(), fault_tx, true);
    upstream.properties().refresh();

    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(
        ConfigStore::new(&dir.path().join("config.toml"))
            .await
            .unwrap(),
    );

    let state = AppState {
        config,
        events,
        pipeline,
        upstream,
    };
    (create_router(Arc::new(state)), dir)
}

async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = match body {
        Some(json) => Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn health_reports_ok() {
    let (router, _dir) = router().await;
    let (status, body) = send(&router, Method::GET, "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn status_exposes_upstream_and_source() {
    let (router, _dir) = router().await;
    let (status, body) = send(&router, Method::GET, "/api/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["upstream"]["state"], 0);
    assert_eq!(body["source"]["audio_bitrate"], 128);
    assert_eq!(body["source"]["video_bitrate"], 2500);
}

#[tokio::test]
async fn properties_read_their_wire_values() {
    let (router, _dir) = router().await;

    let (_, body) = send(&router, Method::GET, "/api/properties/upstreamState", None).await;
    assert_eq!(body["value"], 0);

    let (_, body) = send(&router, Method::GET, "/api/properties/inputMode", None).await;
    assert_eq!(body["value"], 0);

    let (_, body) = send(&router, Method::GET, "/api/properties/clients", None).await;
    assert_eq!(body["value"], 0);
}

#[tokio::test]
async fn unknown_property_is_reported() {
    let (router, _dir) = router().await;
    let (status, body) = send(&router, Method::GET, "/api/properties/bogus", None).await;
    // Errors travel as success=false with a 200 status
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn read_only_properties_reject_writes() {
    let (router, _dir) = router().await;
    for name in ["upstreamState", "clients", "width", "height"] {
        let (_, body) = send(
            &router,
            Method::PUT,
            &format!("/api/properties/{name}"),
            Some(serde_json::json!({ "value": 1 })),
        )
        .await;
        assert_eq!(body["success"], false, "{name} accepted a write");
    }
}

#[tokio::test]
async fn bitrate_writes_apply_and_read_back() {
    let (router, _dir) = router().await;

    let (_, body) = send(
        &router,
        Method::PUT,
        "/api/properties/videoBitrate",
        Some(serde_json::json!({ "value": 1800 })),
    )
    .await;
    assert_eq!(body["success"], true);

    let (_, body) = send(&router, Method::GET, "/api/properties/videoBitrate", None).await;
    assert_eq!(body["value"], 1800);

    let (_, body) = send(
        &router,
        Method::PUT,
        "/api/properties/audioBitrate",
        Some(serde_json::json!({ "value": 0 })),
    )
    .await;
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn input_mode_accepts_number_or_name() {
    let (router, _dir) = router().await;

    let (_, body) = send(
        &router,
        Method::PUT,
        "/api/properties/inputMode",
        Some(serde_json::json!({ "value": "hdmi" })),
    )
    .await;
    assert_eq!(body["success"], true);

    let (_, body) = send(&router, Method::GET, "/api/properties/inputMode", None).await;
    assert_eq!(body["value"], 1);

    let (_, body) = send(
        &router,
        Method::PUT,
        "/api/properties/inputMode",
        Some(serde_json::json!({ "value": 2 })),
    )
    .await;
    assert_eq!(body["success"], true);
}

#[tokio::test]
async fn resolution_endpoint_sets_both_dimensions() {
    let (router, _dir) = router().await;

    let (_, body) = send(
        &router,
        Method::POST,
        "/api/resolution",
        Some(serde_json::json!({ "width": 1920, "height": 1080 })),
    )
    .await;
    assert_eq!(body["success"], true);

    let (_, body) = send(&router, Method::GET, "/api/properties/width", None).await;
    assert_eq!(body["value"], 1920);
    let (_, body) = send(&router, Method::GET, "/api/properties/height", None).await;
    assert_eq!(body["value"], 1080);
}

#[tokio::test]
async fn upstream_enable_and_disable_through_the_api() {
    let (router, _dir) = router().await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (_, body) = send(
        &router,
        Method::POST,
        "/api/upstream",
        Some(serde_json::json!({ "enable": true, "host": "127.0.0.1", "port": port })),
    )
    .await;
    assert_eq!(body["success"], true);
    assert_eq!(body["state"], 1);

    // A second enable is refused
    let (_, body) = send(
        &router,
        Method::POST,
        "/api/upstream",
        Some(serde_json::json!({ "enable": true, "host": "127.0.0.1", "port": port })),
    )
    .await;
    assert_eq!(body["success"], false);

    let (_, body) = send(
        &router,
        Method::POST,
        "/api/upstream",
        Some(serde_json::json!({ "enable": false })),
    )
    .await;
    assert_eq!(body["success"], true);
    assert_eq!(body["state"], 0);
}

#[tokio::test]
async fn enable_without_host_is_a_bad_request() {
    let (router, _dir) = router().await;
    let (_, body) = send(
        &router,
        Method::POST,
        "/api/upstream",
        Some(serde_json::json!({ "enable": true })),
    )
    .await;
    assert_eq!(body["success"], false);
}
