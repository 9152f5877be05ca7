//! Inbound HTTP surface of the controller

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
#[cfg(test)]
use mockall::automock;
use stagehand_common::config::Config;
use stagehand_common::SharedConfig;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::{token_from_headers, verify_token};
use crate::types::{
    CurrentQueueResponse, QueueSummary, UpdateConfigurationRequest, UpdateConfigurationResponse,
};
use crate::{Error, Result};

/// Read access to the queue the controller is working on
#[cfg_attr(test, automock)]
pub trait QueueStatusProvider: Send + Sync {
    /// Summary of the current queue, if any
    fn current_queue(&self) -> Option<QueueSummary>;
}

/// Shared state of the HTTP handlers
pub struct ServerState {
    token: String,
    config: Arc<SharedConfig>,
    queues: Arc<dyn QueueStatusProvider>,
}

impl ServerState {
    /// State for a controller authenticating callers with `token`
    pub fn new(
        token: impl Into<String>,
        config: Arc<SharedConfig>,
        queues: Arc<dyn QueueStatusProvider>,
    ) -> Self {
        Self {
            token: token.into(),
            config,
            queues,
        }
    }
}

/// Build the controller's router
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/twirp/stagehand.staging.RPC/UpdateConfiguration",
            post(update_configuration),
        )
        .route(
            "/twirp/stagehand.staging.RPC/GetCurrentQueue",
            post(get_current_queue),
        )
        .with_state(state)
}

/// Serve the router on `addr` until `cancel` fires
pub async fn serve(
    addr: SocketAddr,
    state: Arc<ServerState>,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("failed to bind {}: {}", addr, e)))?;
    info!(addr = %addr, "HTTP server started");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("http server error: {}", e)))
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "msg": "ok" }))
}

/// Replace the tenant configuration.
///
/// The body is parsed only after the caller is authenticated.
async fn update_configuration(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<UpdateConfigurationResponse>> {
    if let Err(e) = verify_token(&state.token, token_from_headers(&headers)) {
        warn!(method = "UpdateConfiguration", error = %e, "Rejected RPC call");
        return Err(e);
    }

    let request: UpdateConfigurationRequest =
        serde_json::from_slice(&body).map_err(|e| Error::BadRequest(e.to_string()))?;
    let raw = base64::engine::general_purpose::STANDARD
        .decode(request.config.as_bytes())
        .map_err(|e| Error::BadRequest(format!("config is not base64: {}", e)))?;
    let config = Config::from_slice(&raw).map_err(|e| Error::BadRequest(e.to_string()))?;

    let accepted = state.config.update(config, request.revision);
    Ok(Json(UpdateConfigurationResponse { accepted }))
}

async fn get_current_queue(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> Result<Json<CurrentQueueResponse>> {
    verify_token(&state.token, token_from_headers(&headers))?;
    Ok(Json(CurrentQueueResponse {
        queue: state.queues.current_queue(),
    }))
}
