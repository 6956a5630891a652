//! The privacy-policy analysis API.
//!
//! A single route:
//! - POST /analyze
//!
//! Requests are validated before any model work. Admitted requests run
//! generation on the blocking thread pool; the number admitted at once is
//! capped and anything beyond the cap is turned away with 503.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::inference::engine::{InferenceError, TextGenerator};
use crate::server::protocol::{self, AnalyzeResponse, ErrorResponse, ERROR_MESSAGE};

/// Application state shared across handlers.
pub struct AppState {
    pub generator: Arc<dyn TextGenerator>,
    pub admission: Arc<Semaphore>,
    pub max_new_tokens: usize,
    pub max_body_bytes: usize,
}

impl AppState {
    pub fn new(generator: Arc<dyn TextGenerator>, config: &Config) -> Self {
        Self {
            generator,
            admission: Arc::new(Semaphore::new(config.server.max_concurrent_requests.max(1))),
            max_new_tokens: config.generation.max_new_tokens,
            max_body_bytes: config.server.max_body_bytes,
        }
    }
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let body_limit = state.max_body_bytes;
    Router::new()
        .route("/analyze", post(analyze))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{msg}", msg = ERROR_MESSAGE)]
    MissingPrivacyPolicy,

    #[error("Too many analysis requests in flight, retry later")]
    Overloaded,

    #[error("Privacy policy is too long to analyze")]
    DocumentTooLong,

    #[error("Generation failed")]
    Generation(#[source] InferenceError),

    #[error("Generation worker failed")]
    Internal,
}

impl From<InferenceError> for ApiError {
    fn from(e: InferenceError) -> Self {
        match e {
            InferenceError::PromptTooLong { .. } => ApiError::DocumentTooLong,
            other => ApiError::Generation(other),
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingPrivacyPolicy => StatusCode::BAD_REQUEST,
            ApiError::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::DocumentTooLong => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Generation(_) | ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable error kind reported to clients. The 400 body carries none.
    /// Failure details stay in the server log.
    pub fn kind(&self) -> Option<&'static str> {
        match self {
            ApiError::MissingPrivacyPolicy => None,
            ApiError::Overloaded => Some("overloaded"),
            ApiError::DocumentTooLong => Some("document_too_long"),
            ApiError::Generation(_) => Some("generation_failed"),
            ApiError::Internal => Some("internal"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            message: self.to_string(),
            error: self.kind().map(str::to_string),
        };
        (self.status(), Json(body)).into_response()
    }
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn analyze(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<AnalyzeResponse>, ApiError> {
    let request_id = Uuid::new_v4();

    let Some(document) = protocol::extract_document(&body) else {
        debug!(%request_id, body_bytes = body.len(), "Rejected analysis request");
        return Err(ApiError::MissingPrivacyPolicy);
    };

    let permit = state.admission.clone().try_acquire_owned().map_err(|_| {
        warn!(%request_id, "Admission limit reached");
        ApiError::Overloaded
    })?;

    info!(
        %request_id,
        document_bytes = document.len(),
        "Analysis request"
    );

    let prompt = protocol::build_prompt(&document);
    let generator = state.generator.clone();
    let max_new_tokens = state.max_new_tokens;
    let started = Instant::now();

    // The permit travels with the work so it is only returned once the model is free again.
    let result = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        generator.generate(&prompt, max_new_tokens)
    })
    .await;

    let generation = match result {
        Ok(Ok(generation)) => generation,
        Ok(Err(e @ InferenceError::PromptTooLong { .. })) => {
            warn!(%request_id, "Rejected analysis request: {e}");
            return Err(e.into());
        }
        Ok(Err(e)) => {
            error!(%request_id, "Generation failed: {e}");
            return Err(e.into());
        }
        Err(e) => {
            error!(%request_id, "Generation task aborted: {e}");
            return Err(ApiError::Internal);
        }
    };

    info!(
        %request_id,
        prompt_tokens = generation.prompt_tokens,
        completion_tokens = generation.completion_tokens,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Analysis complete"
    );

    Ok(Json(AnalyzeResponse {
        analysis: generation.text,
    }))
}
