//! In-process router tests: each request goes through the full axum stack
//! against a real registry with push-driven sessions.
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use gazed_config::{Config, SourceMode};
use gazed_core::SessionRegistry;
use gazed_server::routes::router;
use gazed_server::state::AppState;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

fn app(data_dir: &std::path::Path) -> (Router, Arc<SessionRegistry>) {
    let mut cfg = Config::default();
    cfg.persist.data_dir = data_dir.display().to_string();
    cfg.source.mode = SourceMode::Push;
    cfg.validate().unwrap();
    let registry = Arc::new(SessionRegistry::new(Arc::new(cfg)));
    let state = AppState {
        registry: Arc::clone(&registry),
    };
    (router(state), registry)
}

async fn request(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    let request = match body {
        Some(v) => builder.body(Body::from(v.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn session_lifecycle_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _registry) = app(dir.path());

    // No session yet: statistics is a stable 404.
    let (status, body) = request(&app, "GET", "/api/session/statistics", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "session_not_found");

    let (status, body) = request(
        &app,
        "POST",
        "/api/session/start",
        Some(json!({"sessionId": "http-1", "studentName": "Ada"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "started");
    assert_eq!(body["session_id"], "http-1");

    // Starting the same running session again is idempotent.
    let (status, body) = request(
        &app,
        "POST",
        "/api/session/start",
        Some(json!({"sessionId": "http-1"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "already_running");

    let (status, body) = request(&app, "GET", "/api/session/statistics", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "streaming");

    let (status, body) = request(
        &app,
        "POST",
        "/api/session/stop",
        Some(json!({"sessionId": "http-1"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "stopped");
    let export = body["export_uri"].as_str().unwrap();
    assert!(std::path::Path::new(export).exists());
    assert_eq!(body["final_statistics"]["total_samples"], 0);
}

#[tokio::test]
async fn stopping_an_unknown_session_is_a_404() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _registry) = app(dir.path());
    let (status, body) = request(
        &app,
        "POST",
        "/api/session/stop",
        Some(json!({"sessionId": "ghost"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "session_not_found");
}

#[tokio::test]
async fn aoi_add_list_and_current_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let (app, registry) = app(dir.path());
    request(&app, "POST", "/api/session/start", Some(json!({"sessionId": "aoi"}))).await;

    let (status, _) = request(
        &app,
        "POST",
        "/api/aoi/add",
        Some(json!({
            "id": "biodiversity",
            "x": 556.0, "y": 391.0, "w": 100.0, "h": 20.0,
            "kind": "vocab",
            "text": "biodiversity",
            "difficulty": "hard"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = request(&app, "GET", "/api/aoi/list", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["aois"][0]["id"], "biodiversity");
    assert_eq!(body["aois"][0]["kind"], "vocab");

    let (status, body) = request(&app, "GET", "/api/gaze/current", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session_id"], "aoi");
    assert_eq!(body["streaming"], true);

    let (status, body) = request(&app, "GET", "/api/aoi/hits", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_hits"], 0);

    registry.stop_all();
}

#[tokio::test]
async fn calibration_flow_surfaces_errors_and_state() {
    let dir = tempfile::tempdir().unwrap();
    let (app, registry) = app(dir.path());
    request(&app, "POST", "/api/session/start", Some(json!({"sessionId": "cal"}))).await;

    let (status, body) = request(&app, "POST", "/api/calibration/start", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "collecting");

    let (status, body) = request(&app, "GET", "/api/calibration/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "collecting");
    assert_eq!(body["calibrated"], false);

    // No gaze sample has arrived: capture reports that without erroring.
    let (status, body) = request(
        &app,
        "POST",
        "/api/calibration/capture_point",
        Some(json!({"point_index": 0, "screen_x": 0.0, "screen_y": 0.0})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["gaze_captured"], false);

    // Too few points: a stable 4xx code, transform untouched.
    let (status, body) = request(
        &app,
        "POST",
        "/api/calibration/calculate",
        Some(json!({"method": "homography"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "insufficient_points");

    let (_, body) = request(&app, "GET", "/api/calibration/status", None).await;
    assert_eq!(body["calibrated"], false);

    registry.stop_all();
}

#[tokio::test]
async fn camera_intrinsics_label_their_source() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _registry) = app(dir.path());
    let (status, body) = request(&app, "GET", "/api/calibration/camera_intrinsics", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["source"], "mock");
    assert_eq!(body["focal_length"]["fx"], 800.0);
}

#[tokio::test]
async fn text_upload_lays_out_word_aois() {
    let dir = tempfile::tempdir().unwrap();
    let (app, registry) = app(dir.path());
    request(&app, "POST", "/api/session/start", Some(json!({"sessionId": "text"}))).await;

    let (status, body) = request(
        &app,
        "POST",
        "/api/text/upload",
        Some(json!({
            "text": "Biodiversity supports every ecosystem",
            "vocabulary": ["biodiversity", "ecosystem"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["aois_created"], 4);
    let aois = body["aois"].as_array().unwrap();
    assert_eq!(aois[0]["kind"], "vocab");
    assert_eq!(aois[1]["kind"], "content");
    assert_eq!(aois[3]["kind"], "vocab");
    // Words on one line advance monotonically in x.
    assert!(aois[1]["x"].as_f64().unwrap() > aois[0]["x"].as_f64().unwrap());

    let (status, body) = request(
        &app,
        "POST",
        "/api/text/create-aois",
        Some(json!({"aois": [{
            "id": "extra", "x": 0.0, "y": 0.0, "w": 10.0, "h": 10.0,
            "kind": "custom", "text": "extra"
        }]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);

    let (_, body) = request(&app, "GET", "/api/aoi/list", None).await;
    assert_eq!(body["count"], 5);

    let (status, body) = request(&app, "GET", "/api/text/vocabulary-hits", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["vocabulary_count"], 0);

    registry.stop_all();
}
