//! HTTP gateway built on axum.
//!
//! Errors leave the gateway as `{"error": {"code", "message"}}` with a status
//! derived from the error code.

use crate::config::ServerConfig;
use crate::engine::{DatabaseStatus, Engine};
use crate::error::RagError;
use crate::types::QueryRequest;
use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

/// Shared engine reference for axum handlers.
pub type SharedEngine = Arc<Engine>;

/// An error rendered as a JSON envelope.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn invalid(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "invalid_input",
            message: message.into(),
        }
    }
}

/// HTTP status for an envelope code.
pub fn status_for(code: &str) -> StatusCode {
    match code {
        "invalid_input" => StatusCode::BAD_REQUEST,
        "not_found" => StatusCode::NOT_FOUND,
        "rate_limited" | "provider_unavailable" | "generation_unavailable" => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        "timeout" => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<RagError> for ApiError {
    fn from(err: RagError) -> Self {
        let code = err.code();
        Self {
            status: status_for(code),
            code,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(code = self.code, error = %self.message, "Request failed");
        }
        let body = json!({
            "error": {
                "code": self.code,
                "message": self.message,
            }
        });
        (self.status, Json(body)).into_response()
    }
}

/// Build the router with `/api/query`, `/api/health`, `/api/stats` and document routes.
pub fn router(engine: SharedEngine) -> Router {
    Router::new()
        .route("/api/query", post(query_handler))
        .route("/api/health", get(health_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/documents", get(documents_handler))
        .route("/api/documents/{id}", delete(delete_handler))
        .with_state(engine)
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(AllowOrigin::list(origins))
    }
}

async fn query_handler(
    State(engine): State<SharedEngine>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::invalid(e.body_text()))?;
    let response = engine.query(&request).await?;
    Ok(Json(response))
}

async fn health_handler(State(engine): State<SharedEngine>) -> impl IntoResponse {
    let report = engine.health().await;
    let status = if report.database == DatabaseStatus::Disconnected {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(report))
}

async fn stats_handler(
    State(engine): State<SharedEngine>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(engine.stats().await?))
}

async fn documents_handler(State(engine): State<SharedEngine>) -> impl IntoResponse {
    Json(json!({ "documents": engine.documents() }))
}

async fn delete_handler(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = Uuid::parse_str(&id).map_err(|_| ApiError::invalid(format!("invalid document id: {id}")))?;
    let removed = engine.delete_document(id).await?;
    Ok(Json(json!({ "id": id, "chunks_removed": removed })))
}

/// Serve the gateway until ctrl-c.
pub async fn run(engine: SharedEngine, config: &ServerConfig) -> Result<(), std::io::Error> {
    let app = router(engine)
        .layer(cors_layer(config))
        .layer(TraceLayer::new_for_http());
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "Gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
}
