//! HTTP surface: liveness, health and the operator send API.
//!
//! Routes:
//! - `GET /` static liveness text
//! - `GET /health` connection state and component health
//! - `POST /send` `{"to": "...", "message": "..."}`

use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::connection::{ConnectionHandle, ConnectionState};
use crate::health::HealthRegistry;
use crate::inbound::SenderNormalizer;
use crate::util::truncate_with_ellipsis;

/// Maximum request body size (64KB)
pub const MAX_BODY_SIZE: usize = 65_536;
/// Per-request timeout (30s)
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

pub const LIVENESS_TEXT: &str = "WhatsApp relay is running";

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub connection: ConnectionHandle,
    pub normalizer: Arc<SenderNormalizer>,
    pub health: HealthRegistry,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/send", post(handle_send))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

/// Serve until `cancel` fires.
pub async fn run_gateway(
    host: &str,
    port: u16,
    state: AppState,
    cancel: CancellationToken,
) -> Result<()> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("Invalid gateway address {host}:{port}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind gateway on {addr}"))?;
    let actual = listener.local_addr()?;
    tracing::info!(addr = %actual, "Gateway listening");
    state.health.mark_component_ok("gateway");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { cancel.cancelled().await })
    .await?;

    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
// AXUM HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

/// GET /: static liveness for orchestrators
async fn handle_root() -> &'static str {
    LIVENESS_TEXT
}

/// GET /health: always public, never exposes link material
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    let connection = state.connection.state();
    let body = serde_json::json!({
        "status": "ok",
        "connection": connection,
        "connected": connection == ConnectionState::Connected,
        "link_pending": state.connection.link_challenge().is_some(),
        "runtime": state.health.snapshot_json(),
    });
    Json(body)
}

#[derive(Debug, Deserialize)]
pub struct SendBody {
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// POST /send: operator-initiated message
async fn handle_send(
    State(state): State<AppState>,
    body: Result<Json<SendBody>, JsonRejection>,
) -> impl IntoResponse {
    let Json(body) = match body {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!("/send JSON parse error: {e}");
            return bad_request("Invalid JSON body. Expected: {\"to\": \"...\", \"message\": \"...\"}");
        }
    };

    let to = body.to.as_deref().map(str::trim).unwrap_or_default();
    let message = body.message.as_deref().unwrap_or_default();
    if to.is_empty() || message.trim().is_empty() {
        return bad_request("Both 'to' and 'message' are required");
    }

    let Some(target) = send_target(&state.normalizer, to) else {
        return bad_request("'to' is not a phone number or chat identifier");
    };

    match state.connection.send(&target, message).await {
        Ok(()) => {
            tracing::info!(
                to = %target,
                "Operator message sent: {}",
                truncate_with_ellipsis(message, 80)
            );
            (
                StatusCode::OK,
                Json(serde_json::json!({"success": true, "sent_to": target})),
            )
        }
        Err(e) => {
            tracing::warn!(to = %target, "Operator send failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
        }
    }
}

/// Qualified identities are used as given; bare numbers get the personal form.
fn send_target(normalizer: &SenderNormalizer, to: &str) -> Option<String> {
    if to.contains('@') {
        Some(to.to_string())
    } else {
        normalizer.normalize_identifier(to)
    }
}

fn bad_request(message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({"error": message})),
    )
}
