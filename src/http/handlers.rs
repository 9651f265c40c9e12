use super::state::AppState;
use crate::broadcast::{deliver, ClientSink, ClientSnapshot, ControlFrame, OutboundMessage, StatusMessage};
use crate::capture::{CaptureError, SessionSnapshot};
use crate::config::AudioConfig;
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

// ============================================================================
// Request/Response Types
// ============================================================================

/// Every field is optional; missing ones come from the configured device.
#[derive(Debug, Default, Deserialize)]
pub struct StartCaptureRequest {
    pub device: Option<String>,
    pub input_format: Option<String>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
}

impl StartCaptureRequest {
    fn into_audio(self, defaults: &AudioConfig) -> AudioConfig {
        AudioConfig {
            device: self.device.unwrap_or_else(|| defaults.device.clone()),
            input_format: self
                .input_format
                .unwrap_or_else(|| defaults.input_format.clone()),
            sample_rate: self.sample_rate.unwrap_or(defaults.sample_rate),
            channels: self.channels.unwrap_or(defaults.channels),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StopCaptureRequest {
    pub device: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CaptureResponse {
    pub status: String,
    pub message: String,
    pub session: SessionSnapshot,
}

#[derive(Debug, Serialize)]
pub struct CaptureStatusResponse {
    pub relay: StatusMessage,
    pub sessions: Vec<SessionSnapshot>,
    pub listeners: Vec<ClientSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(e: &CaptureError) -> Response {
    let status = match e {
        CaptureError::AlreadyActive { .. } => StatusCode::CONFLICT,
        CaptureError::NotActive { .. } => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
        .into_response()
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /capture/start
/// Start a capture session
pub async fn start_capture(
    State(state): State<AppState>,
    req: Option<Json<StartCaptureRequest>>,
) -> impl IntoResponse {
    let audio = req
        .map(|Json(req)| req)
        .unwrap_or_default()
        .into_audio(&state.default_audio);
    let device = audio.device.clone();

    info!("Starting capture on {}", device);

    match state.supervisor.start(audio).await {
        Ok(session) => (
            StatusCode::OK,
            Json(CaptureResponse {
                status: session.state.name().to_string(),
                message: format!("Capture starting on {}", device),
                session,
            }),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to start capture on {}: {}", device, e);
            error_response(&e)
        }
    }
}

/// POST /capture/stop
/// Stop a capture session and remove its pipes
pub async fn stop_capture(
    State(state): State<AppState>,
    req: Option<Json<StopCaptureRequest>>,
) -> impl IntoResponse {
    let device = req
        .and_then(|Json(req)| req.device)
        .unwrap_or_else(|| state.default_audio.device.clone());

    info!("Stopping capture on {}", device);

    match state.supervisor.stop(&device).await {
        Ok(session) => (
            StatusCode::OK,
            Json(CaptureResponse {
                status: session.state.name().to_string(),
                message: format!("Capture stopped on {}", device),
                session,
            }),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to stop capture on {}: {}", device, e);
            error_response(&e)
        }
    }
}

/// GET /capture/status
pub async fn capture_status(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.supervisor.sessions().await;

    (
        StatusCode::OK,
        Json(CaptureStatusResponse {
            relay: state.broadcaster.status_message(),
            sessions,
            listeners: state.broadcaster.clients(),
        }),
    )
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "healthy",
            "service": "analog-relay",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// GET /listen
/// Live PCM as binary frames, relay status as text frames
pub async fn listen(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_listener(socket, state))
}

/// GET /events
/// Lifecycle events as JSON text frames
pub async fn events(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_events(socket, state))
}

// ============================================================================
// Push connections
// ============================================================================

struct WebSocketSink(SplitSink<WebSocket, Message>);

#[async_trait::async_trait]
impl ClientSink for WebSocketSink {
    async fn send(&mut self, message: &OutboundMessage) -> Result<()> {
        let frame = match message {
            OutboundMessage::Audio(chunk) => Message::Binary(chunk.to_vec()),
            OutboundMessage::Status(status) => {
                Message::Text(serde_json::to_string(&ControlFrame::Status(*status))?)
            }
        };
        self.0.send(frame).await?;
        Ok(())
    }
}

async fn serve_listener(socket: WebSocket, state: AppState) {
    let client = state.broadcaster.join();
    let id = client.id();
    let (sink, mut incoming) = socket.split();
    let mut sink = WebSocketSink(sink);

    // Listeners never send anything meaningful; reading only detects hang-up
    let hangup = async move {
        while let Some(Ok(message)) = incoming.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    };

    tokio::select! {
        end = deliver(client, &mut sink) => debug!("Listener {} delivery ended: {:?}", id, end),
        _ = hangup => debug!("Listener {} hung up", id),
    }

    let _ = sink.0.close().await;
}

async fn serve_events(socket: WebSocket, state: AppState) {
    let mut events = state.events.subscribe();
    let (mut sink, mut incoming) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Event subscriber fell behind, skipped {} events", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to encode event: {}", e);
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            message = incoming.next() => match message {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_request_falls_back_to_configured_device() {
        let defaults = AudioConfig::default();
        let audio = StartCaptureRequest {
            sample_rate: Some(44100),
            ..Default::default()
        }
        .into_audio(&defaults);

        assert_eq!(audio.device, defaults.device);
        assert_eq!(audio.sample_rate, 44100);
        assert_eq!(audio.channels, defaults.channels);
    }

    #[test]
    fn test_capture_errors_map_to_status_codes() {
        let conflict = error_response(&CaptureError::AlreadyActive {
            device: "hw:1,0".to_string(),
            state: "running".to_string(),
        });
        assert_eq!(conflict.status(), StatusCode::CONFLICT);

        let missing = error_response(&CaptureError::NotActive {
            device: "hw:1,0".to_string(),
        });
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let gone = error_response(&CaptureError::SupervisorGone);
        assert_eq!(gone.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
