//! HTTP surface tests against the router, without a socket.

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use base64::Engine;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use common::{noisy_png, packshot_png, pipeline_with, test_config, FakeGenerator, FakeVision};
use creativeforge_core::server::router;
use creativeforge_core::{Capabilities, CreativePipeline, MemoryPaletteStore, RuleCatalog};

fn app() -> Router {
    router(Arc::new(pipeline_with(
        Arc::new(FakeVision::seeing(&[("soda_can", 0.94)])),
        Arc::new(FakeGenerator::default()),
    )))
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>, axum::http::HeaderMap) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(b) => builder.header("content-type", "application/json").body(Body::from(b.to_string())),
        None => builder.body(Body::empty()),
    }
    .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec(), headers)
}

async fn call_json(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let (status, bytes, _) = call(app, method, uri, body).await;
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

async fn upload(app: &Router, bytes: &[u8]) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    let (status, body) = call_json(app, "POST", "/assets", Some(json!({ "bytes": encoded }))).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    body["assetId"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health_reports_provider() {
    let app = app();
    let (status, body) = call_json(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["provider"], "fake-generator");
}

#[tokio::test]
async fn test_upload_then_analyze() {
    let app = app();
    let asset_id = upload(&app, &packshot_png()).await;

    let (status, body) = call_json(&app, "POST", "/analyze-image", Some(json!({ "assetId": asset_id }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["detectedObjects"][0]["label"], "soda_can");
    assert_eq!(body["hasTransparentBackground"], true);

    let (status, body) = call_json(&app, "POST", "/analyze-image", Some(json!({ "assetId": "ast_missing" }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "asset_not_found");
}

#[tokio::test]
async fn test_bad_upload_is_input_error() {
    let app = app();
    let (status, _) = call_json(&app, "POST", "/assets", Some(json!({ "bytes": "not base64!" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let garbage = base64::engine::general_purpose::STANDARD.encode(b"plain text");
    let (status, _) = call_json(&app, "POST", "/assets", Some(json!({ "bytes": garbage }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_mismatched_mime_is_rejected_before_storing() {
    let app = app();
    let encoded = base64::engine::general_purpose::STANDARD.encode(packshot_png());
    let (status, body) =
        call_json(&app, "POST", "/assets", Some(json!({ "bytes": encoded, "mimeType": "image/jpeg" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
    let (_, health) = call_json(&app, "GET", "/health", None).await;
    assert_eq!(health["assets"], 0);

    let (status, _) = call_json(&app, "POST", "/assets", Some(json!({ "bytes": encoded, "mimeType": "image/png" }))).await;
    assert_eq!(status, StatusCode::OK);
    let (_, health) = call_json(&app, "GET", "/health", None).await;
    assert_eq!(health["assets"], 1);
}

#[tokio::test]
async fn test_oversized_upload_is_413() {
    let config = creativeforge_core::EngineConfig { max_upload_bytes: 1024, ..test_config() };
    let pipeline = CreativePipeline::new(
        config,
        Capabilities::offline(),
        Arc::new(RuleCatalog::builtin()),
        Arc::new(MemoryPaletteStore::new()),
    )
    .unwrap();
    let app = router(Arc::new(pipeline));
    let encoded = base64::engine::general_purpose::STANDARD.encode(noisy_png(64, 64));
    let (status, _) = call_json(&app, "POST", "/assets", Some(json!({ "bytes": encoded }))).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_generate_validate_export_round() {
    let app = app();
    let asset_id = upload(&app, &packshot_png()).await;

    let (status, outcome) = call_json(
        &app,
        "POST",
        "/generate-layout",
        Some(json!({
            "assetId": asset_id,
            "contentSpec": { "headline": "Ice Cold Soda", "price": "£1.00" },
            "ratios": ["1:1", "9:16"]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{outcome}");
    let generation_id = outcome["generationId"].as_str().unwrap().to_string();
    let square = &outcome["results"]["1:1"];
    assert_eq!(square["report"]["layoutRatio"], "1:1");
    assert!(outcome["results"]["9:16"]["layout"].is_object());
    assert!(outcome["results"].get("1.91:1").is_none());

    let (status, bytes, headers) = call(
        &app,
        "GET",
        &format!("/export?generationId={generation_id}&ratio=1:1&format=png"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-type"], "image/png");
    assert_eq!(headers["x-artifact-sha256"].len(), 64);
    assert!(bytes.starts_with(&[0x89, b'P', b'N', b'G']));

    let (status, body) = call_json(
        &app,
        "GET",
        &format!("/export?generationId={generation_id}&ratio=1:1&format=png&maxBytes=10"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["kind"], "export_too_large");
    assert!(!body["ladder"].as_array().unwrap().is_empty());

    let (status, report) = call_json(
        &app,
        "POST",
        "/validate",
        Some(json!({
            "layout": square["layout"],
            "contentSpec": { "headline": "Ice Cold Soda", "price": "£1.00" },
            "analysisResult": call_json(&app, "POST", "/analyze-image", Some(json!({ "assetId": asset_id }))).await.1,
            "generationId": generation_id,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{report}");
    assert_eq!(report["perRule"].as_array().unwrap().len(), RuleCatalog::builtin().rules.len());
    assert_ne!(report["reportId"], square["report"]["reportId"]);
}

#[tokio::test]
async fn test_export_unknown_generation_is_404() {
    let app = app();
    let (status, body) = call_json(&app, "GET", "/export?generationId=gen_nope&ratio=9:16", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "generation_not_found");
}

#[tokio::test]
async fn test_palette_history_endpoints() {
    let app = app();
    for _ in 0..2 {
        let (status, _, _) = call(&app, "POST", "/palettes", Some(json!({ "brandColors": { "primary": "#112233" } }))).await;
        assert_eq!(status, StatusCode::CREATED);
    }
    let (status, _, _) = call(&app, "POST", "/palettes", Some(json!({ "brandColors": {} }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call_json(&app, "GET", "/palettes/frequent?n=3", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["usageCount"], 2);
    assert_eq!(body[0]["colors"]["primary"], "#112233");

    let asset_id = upload(&app, &packshot_png()).await;
    let (status, body) = call_json(&app, "POST", "/palettes/suggest", Some(json!({ "assetId": asset_id }))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_rules_lists_catalog() {
    let app = app();
    let (status, body) = call_json(&app, "GET", "/rules", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rules"][13]["id"], "claim-matches-product");
    assert_eq!(body["rules"][13]["evaluator"]["kind"], "semantic");
}
