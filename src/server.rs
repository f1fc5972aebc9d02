// server.rs — HTTP surface: GET /health and POST /embeddings.
//
// Handlers are thin adapters over the engine. All encodes go through one dispatch point:
// a semaphore bounding concurrent CPU work, `spawn_blocking` to keep the async workers free,
// and a per-request timeout.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::Semaphore;

use crate::config::ServiceConfig;
use crate::embeddings::engine::EmbeddingEngine;
use crate::protocol::{EncodeRequest, EncodeResponse, ErrorResponse, HealthResponse};

/// Shared, read-only request context. Built once the engine is loaded.
pub struct AppState {
    engine: Arc<EmbeddingEngine>,
    permits: Arc<Semaphore>,
    request_timeout: Duration,
}

impl AppState {
    pub fn new(engine: Arc<EmbeddingEngine>, max_concurrency: usize, request_timeout: Duration) -> Self {
        Self {
            engine,
            permits: Arc::new(Semaphore::new(max_concurrency)),
            request_timeout,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self { status, code, message: message.into() }
    }

    fn from_rejection(rejection: JsonRejection) -> Self {
        let (status, code) = match &rejection {
            JsonRejection::JsonSyntaxError(_) => (StatusCode::BAD_REQUEST, "INVALID_JSON"),
            JsonRejection::JsonDataError(_) => (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_REQUEST"),
            JsonRejection::MissingJsonContentType(_) => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, "UNSUPPORTED_MEDIA_TYPE")
            }
            _ => (rejection.status(), "INVALID_REQUEST"),
        };
        Self::new(status, code, rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.message,
            code: self.code.to_string(),
        };
        (self.status, Json(body)).into_response()
    }
}

pub fn router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/embeddings", post(create_embeddings))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}

/// "ok" means loaded-and-ready: the listener only exists after the engine has loaded.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        model: state.engine.model_id().to_string(),
    })
}

async fn create_embeddings(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<EncodeRequest>, JsonRejection>,
) -> Result<Json<EncodeResponse>, ApiError> {
    let Json(request) = payload.map_err(|rejection| {
        log::warn!("Rejected /embeddings request: {}", rejection.body_text());
        ApiError::from_rejection(rejection)
    })?;

    let count = request.input.len();
    if count == 0 {
        return Ok(Json(EncodeResponse::from_vectors(Vec::new(), state.engine.model_id())));
    }

    let started = Instant::now();
    let vectors = dispatch(&state, request.input).await?;
    log::info!("Encoded {} texts in {} ms", count, started.elapsed().as_millis());

    Ok(Json(EncodeResponse::from_vectors(vectors, state.engine.model_id())))
}

/// Run one encode on the blocking pool, bounded by the semaphore and the request timeout.
///
/// On timeout the blocking work is not interrupted: it keeps its permit until it finishes,
/// and its result is discarded.
async fn dispatch(state: &AppState, texts: Vec<String>) -> Result<Vec<Vec<f32>>, ApiError> {
    let engine = Arc::clone(&state.engine);
    let permits = Arc::clone(&state.permits);
    let count = texts.len();

    let work = async move {
        let permit = permits
            .acquire_owned()
            .await
            .map_err(|_| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE", "encoder is shutting down"))?;

        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            engine.encode(&texts)
        });

        match task.await {
            Ok(Ok(vectors)) => Ok(vectors),
            Ok(Err(e)) => {
                log::error!("Encode of {} texts failed: {:#}", count, e);
                Err(ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "ENCODE_FAILED", format!("{e:#}")))
            }
            Err(e) => {
                log::error!("Encode task aborted: {}", e);
                Err(ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "ENCODE_FAILED", "encode task aborted"))
            }
        }
    };

    match tokio::time::timeout(state.request_timeout, work).await {
        Ok(result) => result,
        Err(_) => {
            log::warn!("Encode of {} texts timed out after {:?}", count, state.request_timeout);
            Err(ApiError::new(
                StatusCode::GATEWAY_TIMEOUT,
                "ENCODE_TIMEOUT",
                format!("encode did not finish within {}s", state.request_timeout.as_secs_f32()),
            ))
        }
    }
}

/// Bind and serve until Ctrl-C / SIGTERM. In-flight requests are allowed to finish.
pub async fn serve(cfg: &ServiceConfig, engine: Arc<EmbeddingEngine>) -> anyhow::Result<()> {
    let state = Arc::new(AppState::new(engine, cfg.max_concurrency, cfg.request_timeout));
    let app = router(state, cfg.max_body_bytes);

    let addr = cfg.bind_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    log::info!("Embedding service listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("Shutdown signal received, draining requests");
}
