use crate::config::{AppState, Endpoint, ServerConfig};
use anyhow::{Context, Result};
use axum::{
    extract::{FromRef, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

mod handlers;

/// Start the gateway and run until `shutdown` resolves.
pub async fn serve(
    config: ServerConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = format!("{}:{}", config.http.host, config.http.port);
    let state = Arc::new(AppState::new(config)?);

    state.relay.start_eager().await?;
    if state.config.relay.bridge.health_check {
        state.relay.check_health().await;
    }

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(
        addr = %addr,
        providers = state.relay.registry().len(),
        "MCP gateway listening"
    );

    run(listener, state, shutdown).await
}

/// Serve on an already bound listener. Open SSE streams are ended and backing
/// processes drained once `shutdown` resolves.
pub async fn run(
    listener: tokio::net::TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = create_router(state.clone());

    let signal_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            tracing::info!("Shutting down, closing SSE sessions");
            signal_state.sessions.close_all();
        })
        .await
        .context("HTTP server failed")?;

    state.root.close();
    for endpoint in state.providers.values() {
        endpoint.close();
    }
    state.relay.shutdown(state.config.relay.bridge.drain_timeout()).await;
    Ok(())
}

/// State for one mount point's routes.
#[derive(Clone)]
pub struct EndpointState {
    pub app: Arc<AppState>,
    pub endpoint: Arc<Endpoint>,
}

impl FromRef<EndpointState> for Arc<AppState> {
    fn from_ref(state: &EndpointState) -> Self {
        state.app.clone()
    }
}

/// Create the API router: the whole relay at `/`, each provider under `/{name}`.
pub fn create_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health_check))
        .with_state(state.clone())
        .merge(endpoint_routes(EndpointState {
            app: state.clone(),
            endpoint: state.root.clone(),
        }));

    for (name, endpoint) in &state.providers {
        router = router.nest(
            &format!("/{}", name),
            endpoint_routes(EndpointState {
                app: state.clone(),
                endpoint: endpoint.clone(),
            }),
        );
    }

    router.layer(
        ServiceBuilder::new()
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new().include_headers(true))
                    .on_response(DefaultOnResponse::new().include_headers(true)),
            )
            .layer(CorsLayer::permissive()),
    )
}

fn endpoint_routes(state: EndpointState) -> Router {
    Router::new()
        .route("/", post(handlers::post_rpc))
        .route("/mcp", post(handlers::post_rpc))
        .route("/jsonrpc", post(handlers::post_rpc))
        .route("/sse", get(handlers::open_sse))
        .route("/sse/message", post(handlers::post_sse_message))
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": state.config.relay.dispatcher.server_name,
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "providers": state.relay.statuses(),
        "sse_sessions": state.sessions.len(),
    }))
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// Custom error type for API handlers
pub struct ApiError {
    status: StatusCode,
    error: anyhow::Error,
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: anyhow::anyhow!(message.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error_msg = self.error.to_string();
        let details = self
            .error
            .chain()
            .skip(1)
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join(": ");

        let response = if details.is_empty() {
            ErrorResponse::new(error_msg)
        } else {
            ErrorResponse::with_details(error_msg, details)
        };

        (self.status, Json(response)).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: err.into(),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
