//! HTTP front end for the execd execution service
//!
//! Thin axum layer over `ExecutionService`: admission returns 202 with the
//! execution id, status and cancellation address executions by id, and logs
//! stream as line-delimited plain text. Every `ExecError` kind maps to one
//! distinct status code; error bodies carry the machine-readable kind and a
//! caller-safe message.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{Json, Response};
use axum::routing::{get, post};
use axum::Router;
use execd_core::{ExecError, ExecutionRequest, ExecutionService};
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
}

/// Configuration for the HTTP front end.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Enable CORS
    pub enable_cors: bool,
    /// CORS allowed origins (if None, allows any origin)
    pub cors_origins: Option<Vec<String>>,
    /// Enable request logging
    pub enable_logging: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".parse().unwrap(),
            enable_cors: true,
            cors_origins: None,
            enable_logging: true,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address.
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Parse and set the bind address from a string.
    pub fn with_bind_addr_str(mut self, addr: &str) -> Result<Self, ExecError> {
        self.bind_addr = addr
            .parse()
            .map_err(|e| ExecError::internal(format!("invalid bind address: {}", e)))?;
        Ok(self)
    }

    /// Enable or disable CORS.
    pub fn with_cors(mut self, enable: bool) -> Self {
        self.enable_cors = enable;
        self
    }

    /// Set allowed CORS origins.
    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = Some(origins);
        self
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ExecutionService>,
}

type ErrorResponse = (StatusCode, Json<serde_json::Value>);

fn error_response(err: &ExecError) -> ErrorResponse {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(json!({
            "error": err.kind(),
            "details": err.to_string(),
            "timestamp": chrono::Utc::now()
        })),
    )
}

/// Handler for the POST /execute/{bucket}/{key} endpoint.
async fn execute_handler(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<(StatusCode, Json<serde_json::Value>), ErrorResponse> {
    log::info!("execute request for {}/{}", bucket, key);

    match state
        .service
        .execute(ExecutionRequest::new(bucket, key))
        .await
    {
        Ok(id) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({
                "execution_id": id,
                "timestamp": chrono::Utc::now()
            })),
        )),
        Err(e) => {
            log::warn!("execute request refused: {}", e);
            Err(error_response(&e))
        }
    }
}

/// Handler for the GET /executions/{id} endpoint.
async fn status_handler(
    State(state): State<AppState>,
    Path(id): Path<uuid::Uuid>,
) -> Result<Json<serde_json::Value>, ErrorResponse> {
    match state.service.status(id) {
        Ok(snapshot) => Ok(Json(
            serde_json::to_value(snapshot).unwrap_or_else(|_| json!({})),
        )),
        Err(e) => Err(error_response(&e)),
    }
}

/// Handler for the POST /executions/{id}/cancel endpoint.
async fn cancel_handler(
    State(state): State<AppState>,
    Path(id): Path<uuid::Uuid>,
) -> Result<Json<serde_json::Value>, ErrorResponse> {
    log::info!("cancel request for execution {}", id);

    match state.service.cancel(id) {
        Ok(()) => Ok(Json(json!({
            "status": "cancellation_requested",
            "execution_id": id,
            "timestamp": chrono::Utc::now()
        }))),
        Err(e) => {
            log::warn!("cancel of execution {} refused: {}", id, e);
            Err(error_response(&e))
        }
    }
}

/// Handler for the GET /executions/{id}/logs endpoint.
///
/// Streams retained output from the first line and stays open while the
/// execution runs; the body ends once the execution is terminal.
async fn logs_handler(
    State(state): State<AppState>,
    Path(id): Path<uuid::Uuid>,
) -> Result<Response, ErrorResponse> {
    let lines = state.service.stream_logs(id).map_err(|e| error_response(&e))?;
    let body = Body::from_stream(
        lines.map(|line| Ok::<_, Infallible>(format!("{}\n", line))),
    );
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(body)
        .map_err(|e| error_response(&ExecError::internal(e.to_string())))?;
    Ok(response)
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// The execd HTTP server.
pub struct ExecServer {
    service: Arc<ExecutionService>,
    config: ServerConfig,
}

impl ExecServer {
    /// Create a new server with default configuration.
    pub fn new(service: Arc<ExecutionService>) -> Self {
        Self {
            service,
            config: ServerConfig::default(),
        }
    }

    /// Create a new server with custom configuration.
    pub fn with_config(service: Arc<ExecutionService>, config: ServerConfig) -> Self {
        Self { service, config }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Build the axum router with all routes and middleware.
    pub fn build_router(&self) -> Router {
        let state = AppState {
            service: self.service.clone(),
        };

        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/execute/{bucket}/{key}", post(execute_handler))
            .route("/executions/{id}", get(status_handler))
            .route("/executions/{id}/cancel", post(cancel_handler))
            .route("/executions/{id}/logs", get(logs_handler))
            .with_state(state);

        if self.config.enable_logging {
            router = router.layer(axum::middleware::from_fn(
                |request: axum::http::Request<Body>, next: axum::middleware::Next| async {
                    let request_id = uuid::Uuid::new_v4().to_string();
                    let method = request.method().clone();
                    let uri = request.uri().clone();
                    log::info!("Request {} {} {}", request_id, method, uri);

                    let start = std::time::Instant::now();
                    let response = next.run(request).await;
                    log::info!(
                        "Response {} {} in {:?}",
                        request_id,
                        response.status(),
                        start.elapsed()
                    );
                    response
                },
            ));
        }

        router = router.layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            let cors_layer = if let Some(ref origins) = self.config.cors_origins {
                let origins: Result<Vec<_>, _> = origins.iter().map(|s| s.parse()).collect();
                match origins {
                    Ok(origins) => CorsLayer::new()
                        .allow_origin(origins)
                        .allow_methods(Any)
                        .allow_headers(Any),
                    Err(_) => CorsLayer::permissive(),
                }
            } else {
                CorsLayer::permissive()
            };
            router = router.layer(cors_layer);
        }

        router
    }

    /// Start the server and listen for connections until shut down.
    pub async fn serve(self) -> Result<(), ExecError> {
        let bind_addr = self.config.bind_addr;
        let router = self.build_router();
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| ExecError::internal(format!("failed to bind to {}: {}", bind_addr, e)))?;

        log::info!("execd listening on {}", bind_addr);
        log::info!("Execute endpoint: POST http://{}/execute/{{bucket}}/{{key}}", bind_addr);
        log::info!("Status endpoint: GET http://{}/executions/{{id}}", bind_addr);
        log::info!("Logs endpoint: GET http://{}/executions/{{id}}/logs", bind_addr);

        axum::serve(listener, router)
            .await
            .map_err(|e| ExecError::internal(format!("server error: {}", e)))
    }

    /// Start the server with graceful shutdown support.
    pub async fn serve_with_shutdown<F>(self, shutdown_signal: F) -> Result<(), ExecError>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_addr;
        let router = self.build_router();
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| ExecError::internal(format!("failed to bind to {}: {}", bind_addr, e)))?;

        log::info!("execd listening on {} with graceful shutdown", bind_addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ExecError::internal(format!("server error: {}", e)))?;

        log::info!("execd shut down gracefully");
        Ok(())
    }
}

/// Utility function to create a shutdown signal from Ctrl+C / SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            log::info!("Received SIGTERM, shutting down...");
        },
    }
}
