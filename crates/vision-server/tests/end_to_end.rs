//! Real pipeline and stub telemetry behind the router

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::Value;
use std::io::Cursor;
use std::sync::Arc;
use tower::ServiceExt;
use vision_adapter_gpu::{ChainConfig, TelemetryChain};
use vision_core::{BatchProfile, DeviceSelector, EngineConfig, ServerConfig, TelemetryConfig};
use vision_engine::InferencePipeline;
use vision_server::HttpServer;

fn png() -> Vec<u8> {
    let image = RgbImage::from_fn(64, 64, |x, y| Rgb([(x * 4) as u8, (y * 4) as u8, 90]));
    let mut bytes = Cursor::new(Vec::new());
    image.write_to(&mut bytes, ImageFormat::Png).unwrap();
    bytes.into_inner()
}

fn upload(payload: &[u8]) -> Request<Body> {
    let boundary = "e2e-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(b"Content-Disposition: form-data; name=\"file\"; filename=\"cat.png\"\r\n");
    body.extend_from_slice(b"Content-Type: image/png\r\n\r\n");
    body.extend_from_slice(payload);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

    Request::builder()
        .method("POST")
        .uri("/infer")
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={}", boundary))
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn classify_and_report_health() {
    let dir = tempfile::tempdir().unwrap();
    let engine = EngineConfig {
        device: DeviceSelector::Cpu,
        artifact_path: dir.path().join("classifier.plan"),
        input_size: 32,
        patch_size: 8,
        hidden_dim: 16,
        num_classes: 12,
        batch_profile: BatchProfile::from_max(2),
        ..EngineConfig::default()
    };
    let telemetry_config = TelemetryConfig {
        dcgm_endpoint: None,
        enable_nvml: false,
        interval_ms: 1,
        ..TelemetryConfig::default()
    };

    let pipeline = Arc::new(InferencePipeline::new(engine).unwrap());
    let telemetry = Arc::new(TelemetryChain::new(ChainConfig::from(&telemetry_config)));
    let router = HttpServer::new(ServerConfig::default(), &telemetry_config, pipeline, telemetry)
        .unwrap()
        .router();

    let response = router.clone().oneshot(upload(&png())).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await.unwrap()).unwrap();
    assert_eq!(body["engine"], "Compiled");
    assert!(body["top1"]["confidence"].as_f64().unwrap() > 0.0);
    assert_eq!(body["top1"], body["top5"][0]);

    let response = router
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await.unwrap()).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["engine_status"], "ready");

    let response = router
        .oneshot(Request::builder().uri("/metrics/gpu?samples=3").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await.unwrap()).unwrap();
    assert_eq!(body["samples"].as_array().unwrap().len(), 3);
    assert_eq!(body["source"], "stub");
}
