//! Relay WebSocket handler
//!
//! Accepts a caller connection on the relay path, pairs it with a fresh
//! upstream session and runs a `BridgeSession` until either side goes away.
//! Caller text frames are JSON envelopes relayed verbatim; binary frames are
//! raw PCM16 LE audio.

use axum::{
    Extension,
    extract::{
        ConnectInfo, State,
        ws::{Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::messages::{CallerFrame, RelayMessageRoute};
use super::session::BridgeSession;
use crate::core::realtime::create_upstream_session;
use crate::errors::SessionError;
use crate::middleware::ClientIp;
use crate::state::AppState;

/// Channel buffer size for caller frames and outgoing routes
const CHANNEL_BUFFER_SIZE: usize = 1024;

/// Maximum WebSocket frame size (10 MB)
const MAX_WS_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Maximum WebSocket message size (10 MB)
const MAX_WS_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// How long the sender task gets to flush the final Close
const SENDER_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Relay WebSocket handler
///
/// Upgrades the HTTP connection and hands it to a new bridge session.
pub async fn relay_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    client_ip: Option<Extension<ClientIp>>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let client_ip = client_ip.map(|Extension(ip)| ip);

    let ws = match upgrade {
        Ok(ws) => ws,
        Err(rejection) => {
            // The slot taken by the limit middleware is never used
            if let Some(ClientIp(ip)) = client_ip {
                state.release_connection(ip);
            }
            debug!(peer = %peer, "Rejected non-WebSocket request on relay path");
            return rejection.into_response();
        }
    };

    let session_id = uuid::Uuid::new_v4().to_string();
    info!(session_id = %session_id, peer = %peer, "Relay connection upgrade requested");

    ws.max_frame_size(MAX_WS_FRAME_SIZE)
        .max_message_size(MAX_WS_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_relay_socket(socket, state, session_id, peer, client_ip))
}

async fn handle_relay_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    session_id: String,
    peer: SocketAddr,
    client_ip: Option<ClientIp>,
) {
    let (mut sender, mut receiver) = socket.split();
    let (route_tx, mut route_rx) = mpsc::channel::<RelayMessageRoute>(CHANNEL_BUFFER_SIZE);
    let (inbound_tx, inbound_rx) = mpsc::channel::<CallerFrame>(CHANNEL_BUFFER_SIZE);

    // Sender task for outgoing messages
    let mut sender_task = tokio::spawn(async move {
        while let Some(route) = route_rx.recv().await {
            match route {
                RelayMessageRoute::Outgoing(envelope) => {
                    if let Err(e) = sender.send(Message::Text(envelope.into_string().into())).await {
                        error!("Failed to send WebSocket message: {}", e);
                        break;
                    }
                }
                RelayMessageRoute::Close => {
                    if let Err(e) = sender.send(Message::Close(None)).await {
                        debug!("Close frame not sent: {}", e);
                    }
                    break;
                }
            }
        }
    });

    // Reader task: dropping `inbound_tx` tells the session the caller left
    let reader_session = session_id.clone();
    let reader_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            let frame = match msg {
                Ok(Message::Text(text)) => CallerFrame::Text(text.as_str().to_owned()),
                Ok(Message::Binary(data)) => CallerFrame::Binary(data),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Close(_)) => {
                    info!(session_id = %reader_session, "Caller sent close");
                    break;
                }
                Err(e) => {
                    warn!(session_id = %reader_session, "Caller WebSocket error: {}", e);
                    break;
                }
            };
            if inbound_tx.send(frame).await.is_err() {
                break;
            }
        }
    });

    match create_upstream_session(state.config.upstream_config()) {
        Ok(upstream) => {
            state.sessions.register(&session_id, Some(peer));
            let session = BridgeSession::new(
                session_id.clone(),
                upstream,
                route_tx,
                state.bridge_config(),
            )
            .with_registry(state.sessions.clone());

            let summary = session.run(inbound_rx).await;
            debug!(
                session_id = %summary.id,
                final_state = %summary.final_state,
                error = ?summary.error.as_ref().map(SessionError::code),
                "Bridge session finished"
            );
        }
        Err(e) => {
            let err = SessionError::connect(e);
            error!(session_id = %session_id, "Cannot create upstream session: {}", err);
            let _ = route_tx
                .send(RelayMessageRoute::Outgoing(err.to_envelope()))
                .await;
            let _ = route_tx.send(RelayMessageRoute::Close).await;
            drop(route_tx);
        }
    }

    if tokio::time::timeout(SENDER_FLUSH_TIMEOUT, &mut sender_task)
        .await
        .is_err()
    {
        sender_task.abort();
    }
    reader_task.abort();

    if let Some(ClientIp(ip)) = client_ip {
        state.release_connection(ip);
    }

    info!(session_id = %session_id, "Relay connection terminated");
}
