//! WebSocket endpoints: session ingest (with feedback push) and time sync.

use crate::state::{AppState, MpscCommandSink};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use gazed_config::SourceMode;
use gazed_core::rules::FeedbackCommand;
use gazed_core::session::StartOptions;
use gazed_traits::RawSample;
use serde::Deserialize;
use serde_json::json;

/// Acknowledgement cadence on the ingest socket.
const ACK_EVERY: u64 = 50;

#[derive(Debug, Deserialize)]
struct IngestFrame {
    /// Client clock; only the time-sync socket uses client time, ingest
    /// ordering is server-stamped.
    #[allow(dead_code)]
    #[serde(default)]
    timestamp: u64,
    gaze_data: GazeData,
}

#[derive(Debug, Deserialize)]
struct GazeData {
    x: f64,
    y: f64,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

fn default_confidence() -> f64 {
    1.0
}

pub async fn session_socket(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(st): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_session_socket(socket, session_id, st))
}

async fn handle_session_socket(mut socket: WebSocket, session_id: String, st: AppState) {
    // Connecting to the socket starts (or rejoins) a push-driven session.
    let (session, rejoined) = st.registry.start_session(&StartOptions {
        session_id: Some(session_id.clone()),
        source: Some(SourceMode::Push),
        ..StartOptions::default()
    });
    tracing::info!(%session_id, rejoined, "ingest socket connected");

    let (cmd_tx, mut cmd_rx) = tokio::sync::mpsc::channel::<FeedbackCommand>(16);
    let sub_id = session.subscribe_commands(Box::new(MpscCommandSink(cmd_tx)));

    let mut frames: u64 = 0;
    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<IngestFrame>(&text) {
                            Ok(frame) => {
                                let raw = RawSample::at(
                                    frame.gaze_data.x,
                                    frame.gaze_data.y,
                                    frame.gaze_data.confidence,
                                );
                                if let Err(e) = session.push_sample(&raw) {
                                    tracing::debug!(error = %e, "pushed sample rejected");
                                }
                                frames += 1;
                                if frames % ACK_EVERY == 0 {
                                    let ack = json!({
                                        "status": "batch_received",
                                        "samples_processed": frames,
                                    });
                                    if socket.send(Message::Text(ack.to_string().into())).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                let err = json!({"error": "invalid_json", "message": e.to_string()});
                                if socket.send(Message::Text(err.to_string().into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "ingest socket error");
                        break;
                    }
                }
            }
            command = cmd_rx.recv() => {
                let Some(command) = command else { break };
                let frame = json!({
                    "type": "feedback",
                    "command": {
                        "type": command.kind.as_str(),
                        "payload": command.payload,
                        "timestamp": command.ts_ms,
                    },
                });
                if socket.send(Message::Text(frame.to_string().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    session.unsubscribe_commands(sub_id);
    tracing::info!(%session_id, frames, "ingest socket disconnected");
}

pub async fn time_sync_socket(ws: WebSocketUpgrade, State(_st): State<AppState>) -> Response {
    ws.on_upgrade(handle_time_sync)
}

/// Client sends an 8-byte big-endian ms timestamp; the reply is 16 bytes
/// `[client_ts_ms | server_ts_ms]` for offset computation.
async fn handle_time_sync(mut socket: WebSocket) {
    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Binary(data) if data.len() == 8 => {
                let mut client_bytes = [0u8; 8];
                client_bytes.copy_from_slice(&data[..8]);
                let client_ts = u64::from_be_bytes(client_bytes);
                let server_ts = gazed_core::util::wall_ms();

                let mut reply = Vec::with_capacity(16);
                reply.extend_from_slice(&client_ts.to_be_bytes());
                reply.extend_from_slice(&server_ts.to_be_bytes());
                if socket.send(Message::Binary(reply.into())).await.is_err() {
                    break;
                }
            }
            Message::Binary(data) => {
                tracing::warn!(len = data.len(), "invalid time-sync request length");
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}
