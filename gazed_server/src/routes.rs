//! HTTP + SSE control and data plane.
//!
//! The control plane surfaces engine errors directly (stable code strings,
//! 4xx/5xx); the live path degrades instead of erroring.

use crate::error_fmt::ApiError;
use crate::state::{AppState, MpscSnapshotSink};
use axum::extract::{Json, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::Router;
use futures::stream::Stream;
use futures::StreamExt;
use gazed_core::session::{SessionState, Snapshot, StartOptions};
use gazed_core::{Aoi, AoiKind, EngineError};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/session/start", post(session_start))
        .route("/api/session/stop", post(session_stop))
        .route("/api/session/statistics", get(session_statistics))
        .route("/api/gaze/stream", get(gaze_stream))
        .route("/api/gaze/current", get(gaze_current))
        .route("/api/aoi/add", post(aoi_add))
        .route("/api/aoi/list", get(aoi_list))
        .route("/api/aoi/hits", get(aoi_hits))
        .route("/api/calibration/start", post(calibration_start))
        .route("/api/calibration/capture_point", post(calibration_capture_point))
        .route("/api/calibration/calculate", post(calibration_calculate))
        .route("/api/calibration/status", get(calibration_status))
        .route("/api/calibration/camera_intrinsics", get(camera_intrinsics))
        .route("/api/text/upload", post(text_upload))
        .route("/api/text/create-aois", post(text_create_aois))
        .route("/api/text/vocabulary-hits", get(text_vocabulary_hits))
        .route("/ws/sessions/{session_id}", get(crate::ws::session_socket))
        .route("/ws/time-sync", get(crate::ws::time_sync_socket))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartBody {
    session_id: Option<String>,
    student_name: Option<String>,
    lesson_title: Option<String>,
}

async fn session_start(
    State(st): State<AppState>,
    Json(body): Json<StartBody>,
) -> Json<serde_json::Value> {
    let (session, already_running) = st.registry.start_session(&StartOptions {
        session_id: body.session_id,
        student_name: body.student_name,
        lesson_title: body.lesson_title,
        source: None,
    });
    Json(json!({
        "status": if already_running { "already_running" } else { "started" },
        "session_id": session.id(),
        "started_at": session.started_at_ms(),
        "source": session.statistics().source,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopBody {
    session_id: Option<String>,
}

async fn session_stop(
    State(st): State<AppState>,
    Json(body): Json<StopBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = st.registry.resolve(body.session_id.as_deref())?;
    let report = session.stop();
    Ok(Json(json!({
        "status": "stopped",
        "session_id": session.id(),
        "export_uri": report.export_path,
        "final_statistics": report.statistics,
    })))
}

async fn session_statistics(
    State(st): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = st.registry.resolve(None)?;
    Ok(Json(json!({
        "session_id": session.id(),
        "state": session.state().as_str(),
        "statistics": session.statistics(),
    })))
}

// ---------------------------------------------------------------------------
// Gaze stream
// ---------------------------------------------------------------------------

async fn gaze_stream(
    State(st): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let session = st.registry.resolve(None)?;
    if session.state() == SessionState::Stopped {
        return Err(EngineError::InvalidState("session is stopped".to_string()).into());
    }

    // Bounded: a slow consumer misses snapshots instead of back-pressuring
    // the session. Dropping the receiver unregisters the sink on the next
    // fan-out attempt.
    let (tx, rx) = tokio::sync::mpsc::channel::<Snapshot>(8);
    session.subscribe_snapshots(Box::new(MpscSnapshotSink(tx)));

    let stream = ReceiverStream::new(rx).map(|snapshot| {
        let data = serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().data(data))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn gaze_current(State(st): State<AppState>) -> Result<Json<Snapshot>, ApiError> {
    let session = st.registry.resolve(None)?;
    Ok(Json(session.snapshot()))
}

// ---------------------------------------------------------------------------
// AOIs
// ---------------------------------------------------------------------------

async fn aoi_add(
    State(st): State<AppState>,
    Json(aoi): Json<Aoi>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = st.registry.resolve(None)?;
    let id = aoi.id.clone();
    session.add_aoi(aoi)?;
    Ok(Json(json!({"status": "added", "aoi_id": id})))
}

async fn aoi_list(State(st): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let session = st.registry.resolve(None)?;
    let aois = session.aois();
    Ok(Json(json!({"count": aois.len(), "aois": aois})))
}

async fn aoi_hits(State(st): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let session = st.registry.resolve(None)?;
    let snapshot = session.snapshot();
    Ok(Json(json!({
        "total_hits": snapshot.statistics.total_hits,
        "recent": snapshot.recent_hits,
    })))
}

// ---------------------------------------------------------------------------
// Calibration (calibration-aware variants only)
// ---------------------------------------------------------------------------

async fn calibration_start(
    State(st): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = st.registry.resolve(None)?;
    session.begin_calibration();
    Ok(Json(json!({"status": "collecting"})))
}

#[derive(Debug, Deserialize)]
struct CapturePointBody {
    point_index: u32,
    screen_x: f64,
    screen_y: f64,
}

async fn calibration_capture_point(
    State(st): State<AppState>,
    Json(body): Json<CapturePointBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = st.registry.resolve(None)?;
    match session.capture_calibration_point(body.point_index, body.screen_x, body.screen_y) {
        Ok(point) => Ok(Json(json!({
            "status": "captured",
            "gaze_captured": true,
            "point": {
                "index": point.index,
                "screen_x": point.screen_x,
                "screen_y": point.screen_y,
                "device_x": point.device_x,
                "device_y": point.device_y,
                "confidence": point.confidence,
            },
        }))),
        // No gaze yet is an expected race during setup, not a 4xx.
        Err(EngineError::CalibrationFailed(gazed_core::error::CalibrationError::NoSampleYet)) => {
            Ok(Json(json!({"status": "no_sample", "gaze_captured": false})))
        }
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Deserialize)]
struct CalculateBody {
    method: Option<String>,
}

async fn calibration_calculate(
    State(st): State<AppState>,
    Json(body): Json<CalculateBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = st.registry.resolve(None)?;
    let prefer_homography = body.method.map_or(true, |m| m != "linear");

    let transform = session.compute_calibration(prefer_homography)?;
    let doc = transform.to_doc(&session.calibration_points());
    // Future sessions inherit and reload this transform.
    st.registry
        .adopt_transform(&transform, &session.calibration_points())?;

    Ok(Json(json!({
        "status": "calibrated",
        "method": transform.method_name(),
        "accuracy_px": transform.accuracy_px,
        "points_used": transform.points_used,
        "fallback_reason": transform.fallback_reason,
        "transform": doc,
    })))
}

async fn calibration_status(
    State(st): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = st.registry.resolve(None)?;
    Ok(Json(serde_json::to_value(session.calibration_view()).unwrap_or_default()))
}

/// Scene-camera intrinsics. Without a device adapter this reports the mock
/// parameter set, explicitly labelled so the control plane can tell.
async fn camera_intrinsics(State(_st): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "source": "mock",
        "intrinsic": [[800.0, 0.0, 400.0], [0.0, 800.0, 300.0], [0.0, 0.0, 1.0]],
        "distortion": [0.0, 0.0, 0.0, 0.0, 0.0],
        "resolution": {"width": 800, "height": 600},
        "focal_length": {"fx": 800.0, "fy": 800.0},
        "principal_point": {"cx": 400.0, "cy": 300.0},
    }))
}

// ---------------------------------------------------------------------------
// Bulk AOI authoring
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TextUploadBody {
    text: String,
    #[serde(default)]
    vocabulary: Vec<String>,
    #[serde(default = "default_origin_x")]
    origin_x: f64,
    #[serde(default = "default_origin_y")]
    origin_y: f64,
    #[serde(default = "default_char_width")]
    char_width_px: f64,
    #[serde(default = "default_line_height")]
    line_height_px: f64,
    #[serde(default = "default_line_chars")]
    max_line_chars: usize,
}

fn default_origin_x() -> f64 {
    100.0
}
fn default_origin_y() -> f64 {
    200.0
}
fn default_char_width() -> f64 {
    12.0
}
fn default_line_height() -> f64 {
    32.0
}
fn default_line_chars() -> usize {
    80
}

/// Lay the uploaded text out on a monospace grid and create one AOI per
/// word; words on the vocabulary list become vocab AOIs.
async fn text_upload(
    State(st): State<AppState>,
    Json(body): Json<TextUploadBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = st.registry.resolve(None)?;
    let vocabulary: Vec<String> = body
        .vocabulary
        .iter()
        .map(|w| w.to_lowercase())
        .collect();

    let mut aois = Vec::new();
    let mut col = 0usize;
    let mut line = 0usize;
    for (i, word) in body.text.split_whitespace().enumerate() {
        let len = word.chars().count();
        if col > 0 && col + len > body.max_line_chars {
            col = 0;
            line += 1;
        }
        let bare = word
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        let is_vocab = vocabulary.contains(&bare);
        let aoi = Aoi {
            id: format!("word_{i}_{bare}"),
            x: body.origin_x + col as f64 * body.char_width_px,
            y: body.origin_y + line as f64 * body.line_height_px,
            w: len as f64 * body.char_width_px,
            h: body.line_height_px * 0.75,
            kind: if is_vocab { AoiKind::Vocab } else { AoiKind::Content },
            priority: 0,
            text: word.to_string(),
            difficulty: None,
            attributes: serde_json::Map::new(),
        };
        col += len + 1;
        session.add_aoi(aoi.clone())?;
        aois.push(aoi);
    }

    Ok(Json(json!({
        "status": "uploaded",
        "aois_created": aois.len(),
        "aois": aois,
    })))
}

#[derive(Debug, Deserialize)]
struct CreateAoisBody {
    aois: Vec<Aoi>,
}

async fn text_create_aois(
    State(st): State<AppState>,
    Json(body): Json<CreateAoisBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = st.registry.resolve(None)?;
    let count = body.aois.len();
    for aoi in body.aois {
        session.add_aoi(aoi)?;
    }
    Ok(Json(json!({"status": "added", "count": count})))
}

async fn text_vocabulary_hits(
    State(st): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = st.registry.resolve(None)?;
    let snapshot = session.snapshot();
    let vocab_hits: Vec<_> = snapshot
        .recent_hits
        .iter()
        .filter(|h| h.is_vocabulary)
        .collect();
    Ok(Json(json!({
        "vocabulary_count": snapshot.statistics.vocabulary_count,
        "discoveries": snapshot.vocabulary_discoveries,
        "recent": vocab_hits,
    })))
}
