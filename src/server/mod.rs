mod handlers;

use anyhow::{Context, Result};
use axum::http::{header, Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;

use crate::capture::CaptureManager;
use crate::llm::LlmClient;
use crate::logger;
use crate::scheduler::RefinerScheduler;
use crate::store::MemoryStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<MemoryStore>,
    pub manager: Arc<CaptureManager>,
    pub scheduler: Arc<RefinerScheduler>,
    pub llm: Arc<LlmClient>,
    pub started_at: Instant,
    pub agent_name: String,
}

/// Uniform error envelope: 4xx/5xx always carry `{error: message}` and never
/// a stack trace.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        logger::error("api", "request failed", Some(&e.to_string()));
        Self::internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({"error": self.message}))).into_response()
    }
}

const READ_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
const WRITE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::AllowOrigin::mirror_request())
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

    // read-only surface gets the short deadline
    let reads = Router::new()
        .route("/health", get(handlers::health))
        .route("/api/status", get(handlers::status))
        .route("/api/repair/embedding-gaps", get(handlers::embedding_gaps))
        .route("/api/agent-card", get(handlers::agent_card))
        .route("/api/expertise/related", get(handlers::expertise_related))
        .route("/api/expertise/depth", get(handlers::expertise_depth))
        .route("/api/logs", get(handlers::logs_tail))
        .layer(TimeoutLayer::new(READ_TIMEOUT));

    let writes = Router::new()
        .route("/api/memory/remember", post(handlers::remember))
        .route("/api/memory/recall", post(handlers::recall))
        .route("/api/repair/re-embed", post(handlers::re_embed))
        .layer(TimeoutLayer::new(WRITE_TIMEOUT));

    // hooks may wait on the inference endpoint and the SSE stream is
    // long-lived; neither gets a deadline
    let undeadlined = Router::new()
        .route("/api/hooks/session-start", post(handlers::session_start))
        .route(
            "/api/hooks/user-prompt-submit",
            post(handlers::user_prompt_submit),
        )
        .route("/api/hooks/session-end", post(handlers::session_end))
        .route("/api/hooks/pre-compaction", post(handlers::pre_compaction))
        .route(
            "/api/hooks/compaction-complete",
            post(handlers::compaction_complete),
        )
        .route("/api/logs/stream", get(handlers::logs_stream));

    reads
        .merge(writes)
        .merge(undeadlined)
        .layer(cors)
        .layer(middleware::from_fn(validate_host))
        .with_state(state)
}

/// Serve until the shutdown future resolves. Bind failure is fatal: the
/// caller exits non-zero.
pub async fn run(
    state: AppState,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{port}"))
        .await
        .with_context(|| format!("binding 127.0.0.1:{port}"))?;
    logger::info("daemon", &format!("listening on http://127.0.0.1:{port}"));

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("serving http")?;
    Ok(())
}

/// Loopback only: reject requests whose Host header names anything else.
async fn validate_host(req: Request<axum::body::Body>, next: Next) -> Response {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let hostname = host.split(':').next().unwrap_or("");
    if !matches!(hostname, "127.0.0.1" | "localhost" | "[::1]" | "") {
        return StatusCode::FORBIDDEN.into_response();
    }
    next.run(req).await
}
