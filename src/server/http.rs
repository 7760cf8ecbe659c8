use crate::config::HttpServerConfig;
use crate::error::{Result, ShakerError};
use crate::query::QueryEngine;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{sse::{Event, KeepAlive, Sse}, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{stream, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Check if a port is available by attempting to bind to it
async fn check_port_available(port: u16) -> bool {
    tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .is_ok()
}

/// HTTP chat surface: `GET /health` and `POST /chat` streaming SSE.
pub struct ChatHttpServer {
    state: AppState,
}

impl ChatHttpServer {
    /// `engine` is `None` when no index could be loaded; `/chat` then answers
    /// 503 with `load_error` until the server is restarted after ingestion.
    pub fn new(engine: Option<QueryEngine>, load_error: Option<String>, config: &HttpServerConfig) -> Self {
        Self {
            state: AppState {
                engine: engine.map(Arc::new),
                load_error,
                allowed_origins: config.allowed_origins.clone(),
            },
        }
    }

    pub async fn run(&self, port: u16) -> Result<()> {
        let app = router(self.state.clone());
        let addr = format!("127.0.0.1:{}", port);
        log::info!("Starting chat server on http://{}", addr);

        if !check_port_available(port).await {
            return Err(ShakerError::Config(format!(
                "Port {} is already in use. Stop the other process or set http_server.port in config.toml",
                port
            )));
        }

        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            ShakerError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to bind to {}: {}", addr, e),
            ))
        })?;

        axum::serve(listener, app)
            .await
            .map_err(|e| ShakerError::Io(std::io::Error::other(format!("HTTP server error: {}", e))))?;

        Ok(())
    }
}

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    engine: Option<Arc<QueryEngine>>,
    load_error: Option<String>,
    allowed_origins: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    query: String,
}

fn router(state: AppState) -> Router {
    let cors = if state.allowed_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<axum::http::HeaderValue> = state
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        .route("/health", get(handle_health))
        .route("/chat", post(handle_chat))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

async fn handle_health(State(state): State<AppState>) -> Response {
    let index = match &state.engine {
        Some(engine) => serde_json::json!({
            "loaded": true,
            "documents": engine.index().document_count(),
            "chunks": engine.index().chunk_count(),
        }),
        None => serde_json::json!({
            "loaded": false,
            "error": state.load_error,
        }),
    };

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "service": "shaker",
            "version": env!("CARGO_PKG_VERSION"),
            "index": index,
        })),
    )
        .into_response()
}

/// Stream an answer as SSE: one `sources` event, `fragment` events, then `done`.
/// A generation failure mid-stream is sent as an `error` event before `done`.
async fn handle_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Response {
    if let Err(response) = validate_origin(&headers, &state.allowed_origins) {
        return response;
    }

    let Some(engine) = state.engine.clone() else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Index not loaded",
            state
                .load_error
                .clone()
                .unwrap_or_else(|| "Run the ingest command first".to_string()),
        );
    };

    let answer = match engine.answer(&request.query).await {
        Ok(answer) => answer,
        Err(e) => {
            log::error!("Chat request failed: {}", e);
            let status = match e.root() {
                ShakerError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                _ if e.is_recoverable() => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            return error_response(status, "Query failed", e.to_string());
        }
    };

    let sources: Vec<serde_json::Value> = answer
        .sources()
        .iter()
        .map(|s| serde_json::json!({ "file_name": s.file_name, "score": s.score, "rank": s.rank }))
        .collect();
    let sources_event = Event::default()
        .event("sources")
        .data(serde_json::Value::Array(sources).to_string());

    let fragments = answer.map(|item| {
        let event = match item {
            Ok(fragment) => Event::default().event("fragment").data(fragment),
            Err(e) => {
                log::error!("Answer stream failed: {}", e);
                Event::default().event("error").data(e.to_string())
            }
        };
        Ok::<Event, Infallible>(event)
    });

    let events = stream::once(async move { Ok::<Event, Infallible>(sources_event) })
        .chain(fragments)
        .chain(stream::once(async { Ok::<Event, Infallible>(Event::default().event("done").data("")) }));

    Sse::new(events)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping"))
        .into_response()
}

fn error_response(status: StatusCode, error: &str, details: String) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": error,
            "details": details,
        })),
    )
        .into_response()
}

/// Validate Origin header (prevents DNS rebinding attacks)
fn validate_origin(headers: &HeaderMap, allowed_origins: &[String]) -> std::result::Result<(), Response> {
    if allowed_origins.is_empty() {
        return Ok(());
    }

    // No origin header means a direct request, not a browser
    let Some(origin) = headers.get("origin").and_then(|h| h.to_str().ok()) else {
        return Ok(());
    };

    if allowed_origins.iter().any(|allowed| origin == allowed) {
        Ok(())
    } else {
        Err(error_response(
            StatusCode::FORBIDDEN,
            "Origin not allowed",
            format!("Origin '{}' is not in the allowed origins list", origin),
        ))
    }
}
