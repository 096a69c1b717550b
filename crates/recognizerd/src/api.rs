//! HTTP front end.
//!
//! `POST /v1/recognize` grabs one frame from the given stream URL and runs it
//! through the engine. Every failure is reported as `400` with a message;
//! only a fully processed, recognized image gets `200`.

use crate::engine::{EngineError, EngineHandle, EngineStatus};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use recognizer_core::Mode;
use recognizer_io::{FrameSource, RunMode};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

const INVALID_PAYLOAD: &str = "Invalid request payload";
const PROCESSED: &str = "Processed image successfully";

#[derive(Clone)]
pub struct ApiState {
    pub engine: EngineHandle,
    pub frames: Arc<dyn FrameSource>,
    pub run_mode: RunMode,
}

#[derive(Debug, Deserialize)]
pub struct RecognizeRequest {
    pub webrtc_url: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ApiMessage {
    pub message: String,
}

impl ApiMessage {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: &'static str,
    pub run_mode: String,
    pub discovery: bool,
    #[serde(flatten)]
    pub engine: EngineStatus,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/v1/recognize", post(recognize))
        .route("/v1/status", get(status))
        .with_state(state)
}

/// Bind `listen` and serve until `shutdown` resolves.
pub async fn serve<F>(listen: SocketAddr, state: ApiState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!(addr = %listener.local_addr()?, "API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn recognize(
    State(state): State<ApiState>,
    payload: Result<Json<RecognizeRequest>, JsonRejection>,
) -> (StatusCode, Json<ApiMessage>) {
    let request = match payload {
        Ok(Json(request)) if !request.webrtc_url.trim().is_empty() => request,
        Ok(_) => {
            tracing::warn!("recognize request without a stream URL");
            return (StatusCode::BAD_REQUEST, Json(ApiMessage::new(INVALID_PAYLOAD)));
        }
        Err(rejection) => {
            tracing::warn!(error = %rejection, "rejected recognize request");
            return (StatusCode::BAD_REQUEST, Json(ApiMessage::new(INVALID_PAYLOAD)));
        }
    };
    handle_recognize(&state, request).await
}

async fn handle_recognize(state: &ApiState, request: RecognizeRequest) -> (StatusCode, Json<ApiMessage>) {
    let image = match state.frames.grab(&request.webrtc_url).await {
        Ok(image) => image,
        Err(err) => {
            tracing::error!(error = %err, url = %request.webrtc_url, "frame grab failed");
            return (StatusCode::BAD_REQUEST, Json(ApiMessage::new(err.to_string())));
        }
    };

    match state.engine.process(image).await {
        Ok(assessment) => {
            tracing::info!(decision = ?assessment.decision, "API request processed");
            (StatusCode::OK, Json(ApiMessage::new(PROCESSED)))
        }
        Err(EngineError::ChannelClosed) => {
            tracing::error!("engine is gone");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ApiMessage::new(EngineError::ChannelClosed.to_string())),
            )
        }
        Err(err) => {
            tracing::warn!(error = %err, "error processing image");
            (StatusCode::BAD_REQUEST, Json(ApiMessage::new(err.to_string())))
        }
    }
}

async fn status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let engine = state.engine.status();
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        run_mode: state.run_mode.to_string(),
        discovery: engine.mode == Mode::Discovery,
        engine,
    })
}
