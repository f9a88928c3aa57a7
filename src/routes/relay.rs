//! Relay route configuration
//!
//! # Endpoints
//!
//! - `GET {relay_path}` - WebSocket upgrade for a bridged session
//! - `GET /health` - liveness probe
//!
//! An upgrade on any other path is accepted and closed straight away. Plain
//! requests to unknown paths get 404.

use axum::{
    Extension, Router,
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocketUpgrade, close_code, rejection::WebSocketUpgradeRejection},
    },
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::handlers::api::health_check;
use crate::handlers::relay_handler;
use crate::middleware::ClientIp;
use crate::state::AppState;

/// Create the relay router for `relay_path`
pub fn create_relay_router(relay_path: &str) -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_check))
        .route(relay_path, get(relay_handler))
        .fallback(reject_unknown_target)
        .layer(TraceLayer::new_for_http())
}

async fn reject_unknown_target(
    State(state): State<Arc<AppState>>,
    client_ip: Option<Extension<ClientIp>>,
    uri: Uri,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let client_ip = client_ip.map(|Extension(ip)| ip);

    let Ok(ws) = upgrade else {
        if let Some(ClientIp(ip)) = client_ip {
            state.release_connection(ip);
        }
        return StatusCode::NOT_FOUND.into_response();
    };

    tracing::warn!(path = %uri.path(), "Closing connection on invalid path");
    ws.on_upgrade(move |mut socket| async move {
        let frame = CloseFrame {
            code: close_code::POLICY,
            reason: "invalid path".into(),
        };
        if let Err(e) = socket.send(Message::Close(Some(frame))).await {
            tracing::debug!("Close frame not sent: {}", e);
        }
        if let Some(ClientIp(ip)) = client_ip {
            state.release_connection(ip);
        }
    })
}
