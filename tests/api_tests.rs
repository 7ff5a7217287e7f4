use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use tower::util::ServiceExt;

use ts_proxy_core::channels::{Channel, M3uCatalog};
use ts_proxy_core::kv::MemoryKv;
use ts_proxy_core::lifecycle::LifecycleConfig;
use ts_proxy_core::streamer::StreamerConfig;
use ts_proxy_core::{create_app, Core};

fn test_app() -> (axum::Router, String) {
    let channel = Channel { name: "Test Channel".to_string(), url: "http://upstream/test".to_string() };
    let uuid = ts_proxy_core::channels::derive_channel_uuid(&channel);
    let catalog = Arc::new(M3uCatalog::from_channels(vec![channel], "test-agent/1.0".to_string()));
    let kv = Arc::new(MemoryKv::new());

    let core = Arc::new(Core::new(
        "worker-test".to_string(),
        kv,
        catalog,
        LifecycleConfig::default(),
        StreamerConfig::default(),
    ));

    (create_app(core), uuid)
}

#[tokio::test]
async fn healthz_returns_ok() {
    let (app, _uuid) = test_app();
    let response = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn status_all_lists_no_channels_before_any_request() {
    let (app, _uuid) = test_app();
    let response = app
        .oneshot(Request::builder().uri("/status/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = http_body_util::BodyExt::collect(response.into_body()).await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["count"], 0);
}

#[tokio::test]
async fn status_one_returns_404_for_unknown_channel() {
    let (app, _uuid) = test_app();
    let response = app
        .oneshot(Request::builder().uri("/status/not-a-real-channel").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn change_stream_rejects_missing_url() {
    let (app, uuid) = test_app();
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/change_stream/{uuid}"))
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn change_stream_404s_for_unknown_channel() {
    let (app, _uuid) = test_app();
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/change_stream/not-a-real-channel")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"url":"http://new"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn metrics_endpoint_exposes_prometheus_text() {
    let (app, _uuid) = test_app();
    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
