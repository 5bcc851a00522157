//! HTTP server exposing guarded demo routes and the admin surface.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::{by_client_ip, by_header_or_client_ip, RateLimitLayer};
use crate::error::{GatekeeperError, Result};
use crate::ratelimit::{
    CleanupReport, ResetOutcome, RuleConfig, SlidingWindowLimiter, StatsOptions, StatsReport,
    UsageReport, API_CALLS, AUTH_ATTEMPTS,
};

/// Header carrying API keys on guarded routes.
pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
struct AppState {
    limiter: Arc<SlidingWindowLimiter>,
}

/// Error wrapper turning library errors into HTTP responses.
struct ApiError(GatekeeperError);

impl From<GatekeeperError> for ApiError {
    fn from(err: GatekeeperError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GatekeeperError::Validation(_) => StatusCode::BAD_REQUEST,
            GatekeeperError::NotFound(_) => StatusCode::NOT_FOUND,
            GatekeeperError::Backend(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatekeeperError::Config(_) | GatekeeperError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// HTTP server for the rate limit service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limiter instance
    limiter: Arc<SlidingWindowLimiter>,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, limiter: Arc<SlidingWindowLimiter>) -> Self {
        Self { addr, limiter }
    }

    /// Build the application router.
    pub fn router(&self) -> Result<Router> {
        let api_calls = RateLimitLayer::new(
            self.limiter.clone(),
            API_CALLS,
            by_header_or_client_ip(API_KEY_HEADER),
        )?;
        let auth_attempts = RateLimitLayer::new(self.limiter.clone(), AUTH_ATTEMPTS, by_client_ip)?;

        let router = Router::new()
            .route("/health", get(health))
            .route("/api/ping", get(ping).layer(api_calls))
            .route("/auth/login", post(login).layer(auth_attempts))
            .route("/admin/rules", get(list_rules))
            .route("/admin/usage/{rule}/{id}", get(usage))
            .route("/admin/stats/{rule}", get(stats))
            .route("/admin/reset/{rule}/{id}", post(reset))
            .route("/admin/cleanup", post(cleanup))
            .with_state(AppState {
                limiter: self.limiter.clone(),
            });
        Ok(router)
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = self.router()?;
        let listener = TcpListener::bind(self.addr).await?;

        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            GatekeeperError::Io(e)
        })
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn ping() -> Json<serde_json::Value> {
    Json(json!({ "message": "pong" }))
}

async fn login() -> Json<serde_json::Value> {
    Json(json!({ "message": "login attempt recorded" }))
}

async fn list_rules(State(state): State<AppState>) -> Json<BTreeMap<String, RuleConfig>> {
    Json(state.limiter.rules().rules())
}

async fn usage(
    State(state): State<AppState>,
    Path((rule, id)): Path<(String, String)>,
) -> ApiResult<UsageReport> {
    Ok(Json(state.limiter.get_usage(&id, &rule).await?))
}

async fn stats(
    State(state): State<AppState>,
    Path(rule): Path<String>,
    Query(options): Query<StatsOptions>,
) -> ApiResult<StatsReport> {
    Ok(Json(state.limiter.get_stats(&rule, options).await?))
}

async fn reset(
    State(state): State<AppState>,
    Path((rule, id)): Path<(String, String)>,
) -> ApiResult<ResetOutcome> {
    let outcome = state.limiter.reset_limit(&id, &rule).await?;
    info!(rule = %rule, identifier = %id, success = outcome.success, "Admin reset");
    Ok(Json(outcome))
}

async fn cleanup(State(state): State<AppState>) -> Json<CleanupReport> {
    Json(state.limiter.cleanup().await)
}
