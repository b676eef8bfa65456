use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Json, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use kiln_core::{Error, GenerationRequest, Orchestrator};
use serde::Serialize;
use tracing::warn;

/// Shared between handlers; the orchestrator also owns the model manager
/// that `/health` reports on.
#[derive(Clone)]
pub struct AppState(pub Arc<Orchestrator>);

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub model_loaded: bool,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub detail: String,
}

/// Maps a core error onto the wire: 400 for bad input, 500 for the rest.
pub struct ApiError(kiln_core::Error);

impl From<kiln_core::Error> for ApiError {
    fn from(err: kiln_core::Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // the orchestrator has already logged the full error
        let status = if self.0.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        let body = ErrorResponse {
            detail: self.0.client_message(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/generate", post(generate_image_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        model_loaded: state.0.models().is_ready(),
    })
}

async fn generate_image_handler(
    State(state): State<AppState>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = payload.map_err(|rejection| {
        warn!(status = %rejection.status(), "rejected request body: {}", rejection.body_text());
        Error::invalid_argument(format!("invalid request body: {}", rejection.body_text()))
    })?;
    let image = state.0.generate(req).await?;
    Ok(([(header::CONTENT_TYPE, image.media_type)], image.bytes).into_response())
}
