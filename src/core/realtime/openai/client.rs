//! OpenAI Realtime API client implementation.
//!
//! This module provides the `UpstreamSession` implementation for OpenAI's
//! WebSocket-based Realtime API. The same client also talks to a relay that
//! speaks the identical protocol, which is how the caller endpoint reaches the
//! upstream through `persona-relay serve`.
//!
//! # API Reference
//!
//! - Endpoint: `wss://api.openai.com/v1/realtime?model=<model>`
//! - Protocol: WebSocket with JSON events
//! - Audio: PCM 16-bit, 24kHz, mono, little-endian, base64 encoded
//!
//! # Readiness
//!
//! `connect()` resolves when the upstream sends `session.created`. Events that
//! arrive before it, including `session.created` itself, are delivered on the
//! event stream in order.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use http::{HeaderName, HeaderValue, header::AUTHORIZATION};
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use zeroize::Zeroize;

use super::config::{OPENAI_REALTIME_SAMPLE_RATE, build_ws_url};
use super::messages::{ClientEvent, ServerEvent, SessionConfig};
use crate::core::audio::AudioFrame;
use crate::core::envelope::Envelope;
use crate::core::realtime::base::{
    ConnectionState, RealtimeConfig, RealtimeError, RealtimeResult, SessionControl,
    UpstreamEvent, UpstreamEvents, UpstreamSession,
};

/// Channel capacity for WebSocket message sending.
const WS_CHANNEL_CAPACITY: usize = 256;

/// Channel capacity for inbound server events.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// How long `disconnect` waits for the close handshake before aborting.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Server event that marks the session as ready.
const READY_EVENT: &str = "session.created";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// OpenAI Realtime Client
// =============================================================================

/// OpenAI Realtime API client.
///
/// One instance is one upstream session; it is not reconnected after the
/// transport ends.
pub struct OpenAIRealtime {
    /// Configuration
    config: RealtimeConfig,
    /// Connection state, shared with the I/O task
    state: Arc<RwLock<ConnectionState>>,
    /// Connected flag for fast checks (shared with the I/O task)
    connected: Arc<AtomicBool>,
    /// Session ID reported by `session.created`
    session_id: Option<String>,
    /// Outbound envelope channel feeding the I/O task
    ws_sender: Option<mpsc::Sender<Envelope>>,
    /// Inbound event channel, moved into the I/O task on connect
    events_tx: Option<mpsc::Sender<UpstreamEvent>>,
    events_rx: Option<UpstreamEvents>,
    /// Control applied before connect, sent once ready
    pending_control: Option<SessionControl>,
    /// I/O task handle
    connection_handle: Option<JoinHandle<()>>,
}

impl OpenAIRealtime {
    /// Create a client for the configured endpoint. No I/O happens until `connect`.
    pub fn new(config: RealtimeConfig) -> RealtimeResult<Self> {
        build_ws_url(&config.url, config.model.as_deref())?;

        if let Some(key) = &config.api_key
            && key.trim().is_empty()
        {
            return Err(RealtimeError::AuthenticationFailed(
                "API key is empty".to_string(),
            ));
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            connected: Arc::new(AtomicBool::new(false)),
            session_id: None,
            ws_sender: None,
            events_tx: Some(events_tx),
            events_rx: Some(events_rx),
            pending_control: None,
            connection_handle: None,
        })
    }

    /// Get the session ID if connected.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Build the handshake request with auth and beta headers.
    fn build_request(&self) -> RealtimeResult<tungstenite::handshake::client::Request> {
        let url = build_ws_url(&self.config.url, self.config.model.as_deref())?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| RealtimeError::InvalidConfiguration(e.to_string()))?;

        let headers = request.headers_mut();
        if let Some(key) = &self.config.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| RealtimeError::InvalidConfiguration(e.to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }
        headers.insert(
            HeaderName::from_static("openai-beta"),
            HeaderValue::from_static("realtime=v1"),
        );

        Ok(request)
    }

    /// Serialize and enqueue a typed client event.
    async fn send_client_event(&self, event: &ClientEvent) -> RealtimeResult<()> {
        let envelope = Envelope::from_event(event)
            .map_err(|e| RealtimeError::SerializationError(e.to_string()))?;
        self.enqueue(envelope).await
    }

    async fn enqueue(&self, envelope: Envelope) -> RealtimeResult<()> {
        if !self.is_ready() {
            return Err(RealtimeError::NotConnected);
        }
        let sender = self.ws_sender.as_ref().ok_or(RealtimeError::NotConnected)?;
        sender
            .send(envelope)
            .await
            .map_err(|e| RealtimeError::WebSocketError(e.to_string()))
    }

    async fn send_session_update(&self, control: &SessionControl) -> RealtimeResult<()> {
        let event = ClientEvent::SessionUpdate {
            session: SessionConfig::from(control),
        };
        self.send_client_event(&event).await
    }
}

#[async_trait]
impl UpstreamSession for OpenAIRealtime {
    async fn connect(&mut self) -> RealtimeResult<()> {
        if self.is_ready() {
            return Ok(());
        }
        let Some(events_tx) = self.events_tx.clone() else {
            return Err(RealtimeError::InvalidConfiguration(
                "session has already ended".to_string(),
            ));
        };

        *self.state.write() = ConnectionState::Connecting;

        let request = self.build_request()?;
        let (mut ws_stream, _response) =
            match tokio_tungstenite::connect_async(request).await {
                Ok(connected) => connected,
                Err(e) => {
                    *self.state.write() = ConnectionState::Failed;
                    return Err(RealtimeError::ConnectionFailed(e.to_string()));
                }
            };

        tracing::debug!("WebSocket open, waiting for {}", READY_EVENT);

        let session_id = match await_ready(&mut ws_stream, &events_tx).await {
            Ok(session_id) => session_id,
            Err(e) => {
                *self.state.write() = ConnectionState::Failed;
                let _ = ws_stream.close(None).await;
                return Err(e);
            }
        };

        tracing::info!(
            session_id = session_id.as_deref().unwrap_or("-"),
            "Connected to realtime upstream"
        );
        self.session_id = session_id;

        // The I/O task now owns the only event sender, so the stream ends with it.
        self.events_tx = None;
        let (tx, rx) = mpsc::channel::<Envelope>(WS_CHANNEL_CAPACITY);
        self.ws_sender = Some(tx);

        self.connected.store(true, Ordering::SeqCst);
        *self.state.write() = ConnectionState::Connected;

        let handle = tokio::spawn(run_io(
            ws_stream,
            rx,
            events_tx,
            self.connected.clone(),
            self.state.clone(),
        ));
        self.connection_handle = Some(handle);

        if let Some(control) = self.pending_control.take() {
            self.send_session_update(&control).await?;
        }

        Ok(())
    }

    async fn send_control(&mut self, control: &SessionControl) -> RealtimeResult<()> {
        if self.is_ready() {
            self.send_session_update(control).await
        } else {
            tracing::debug!("Holding session control until the upstream is ready");
            self.pending_control = Some(control.clone());
            Ok(())
        }
    }

    async fn append_input_audio(&mut self, frame: &AudioFrame) -> RealtimeResult<()> {
        if !self.is_ready() {
            return Err(RealtimeError::NotConnected);
        }
        let event = ClientEvent::audio_append(&frame.to_pcm16_le());
        self.send_client_event(&event).await
    }

    async fn send_event(&mut self, envelope: Envelope) -> RealtimeResult<()> {
        self.enqueue(envelope).await
    }

    async fn cancel_response(&mut self, track_id: &str, offset: u64) -> RealtimeResult<()> {
        let audio_end_ms = offset * 1000 / OPENAI_REALTIME_SAMPLE_RATE as u64;
        tracing::debug!(
            track_id,
            offset,
            audio_end_ms,
            "Cancelling response and truncating track"
        );

        self.send_client_event(&ClientEvent::ResponseCancel).await?;
        self.send_client_event(&ClientEvent::ConversationItemTruncate {
            item_id: track_id.to_string(),
            content_index: 0,
            audio_end_ms,
        })
        .await
    }

    fn events(&mut self) -> Option<UpstreamEvents> {
        self.events_rx.take()
    }

    async fn disconnect(&mut self) -> RealtimeResult<()> {
        // Dropping the sender asks the I/O task to close the socket
        self.ws_sender = None;
        self.events_tx = None;

        if let Some(mut handle) = self.connection_handle.take()
            && tokio::time::timeout(CLOSE_GRACE, &mut handle).await.is_err()
        {
            tracing::warn!("Upstream close handshake timed out, aborting I/O task");
            handle.abort();
        }

        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        *self.state.write() = ConnectionState::Disconnected;

        if was_connected {
            tracing::info!("Disconnected from realtime upstream");
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.read()
    }
}

impl Drop for OpenAIRealtime {
    fn drop(&mut self) {
        if let Some(ref mut key) = self.config.api_key {
            key.zeroize();
        }
        if let Some(handle) = self.connection_handle.take() {
            handle.abort();
        }
    }
}

// =============================================================================
// Connection Task
// =============================================================================

/// Read until the upstream reports readiness, forwarding everything before it.
async fn await_ready(
    ws: &mut WsStream,
    events_tx: &mpsc::Sender<UpstreamEvent>,
) -> RealtimeResult<Option<String>> {
    while let Some(message) = ws.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let envelope = match Envelope::parse(&text) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        tracing::warn!("Dropping malformed upstream event: {}", e);
                        continue;
                    }
                };

                if envelope.kind() == "error" {
                    let detail = match envelope.decode::<ServerEvent>() {
                        Ok(ServerEvent::Error { error }) => error.message,
                        _ => envelope.into_string(),
                    };
                    return Err(RealtimeError::ConnectionFailed(format!(
                        "upstream rejected session: {detail}"
                    )));
                }

                let ready = envelope.kind() == READY_EVENT;
                let session_id = if ready {
                    match envelope.decode::<ServerEvent>() {
                        Ok(ServerEvent::SessionCreated { session }) if !session.id.is_empty() => {
                            Some(session.id)
                        }
                        _ => None,
                    }
                } else {
                    None
                };

                let _ = events_tx.send(UpstreamEvent::Message(envelope)).await;

                if ready {
                    return Ok(session_id);
                }
            }
            Ok(Message::Ping(data)) => {
                let _ = ws.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(frame)) => {
                return Err(RealtimeError::ConnectionFailed(format!(
                    "upstream closed before session was ready: {}",
                    close_reason(frame.as_ref())
                )));
            }
            Ok(_) => {}
            Err(e) => return Err(RealtimeError::WebSocketError(e.to_string())),
        }
    }

    Err(RealtimeError::ConnectionFailed(
        "upstream ended before session was ready".to_string(),
    ))
}

/// Pump envelopes in both directions until either side ends.
async fn run_io(
    ws: WsStream,
    mut outbound: mpsc::Receiver<Envelope>,
    events_tx: mpsc::Sender<UpstreamEvent>,
    connected: Arc<AtomicBool>,
    state: Arc<RwLock<ConnectionState>>,
) {
    let (mut sink, mut stream) = ws.split();

    let terminal = loop {
        tokio::select! {
            outgoing = outbound.recv() => match outgoing {
                Some(envelope) => {
                    tracing::debug!(event_type = envelope.kind(), "Relaying event upstream");
                    if let Err(e) = sink.send(Message::Text(envelope.into_string().into())).await {
                        tracing::error!("Failed to send WebSocket message: {}", e);
                        break Some(UpstreamEvent::Failed(RealtimeError::WebSocketError(
                            e.to_string(),
                        )));
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break None;
                }
            },

            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => match Envelope::parse(&text) {
                    Ok(envelope) => {
                        if events_tx.send(UpstreamEvent::Message(envelope)).await.is_err() {
                            tracing::debug!("Upstream event receiver dropped");
                        }
                    }
                    Err(e) => tracing::warn!("Dropping malformed upstream event: {}", e),
                },
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = sink.send(Message::Pong(data)).await {
                        tracing::error!("Failed to send pong: {}", e);
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("WebSocket closed by upstream");
                    break Some(UpstreamEvent::Closed {
                        reason: close_reason(frame.as_ref()),
                    });
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::error!("WebSocket error: {}", e);
                    break Some(UpstreamEvent::Failed(RealtimeError::WebSocketError(
                        e.to_string(),
                    )));
                }
                None => {
                    break Some(UpstreamEvent::Closed {
                        reason: "connection ended".to_string(),
                    });
                }
            },
        }
    };

    connected.store(false, Ordering::SeqCst);
    *state.write() = match terminal {
        Some(UpstreamEvent::Failed(_)) => ConnectionState::Failed,
        _ => ConnectionState::Disconnected,
    };

    if let Some(event) = terminal {
        let _ = events_tx.send(event).await;
    }
    tracing::debug!("Realtime upstream I/O task ended");
}

fn close_reason(frame: Option<&CloseFrame>) -> String {
    match frame {
        Some(frame) if !frame.reason.is_empty() => {
            format!("{} ({})", frame.reason.as_str(), u16::from(frame.code))
        }
        Some(frame) => format!("code {}", u16::from(frame.code)),
        None => "no close frame".to_string(),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn relay_config(url: String) -> RealtimeConfig {
        RealtimeConfig {
            url,
            api_key: None,
            model: None,
        }
    }

    /// Accept one connection, send `greeting`, then echo every received text
    /// frame back to the test through a channel.
    async fn spawn_mock_upstream(greeting: Vec<Value>) -> (String, mpsc::Receiver<Value>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, seen_rx) = mpsc::channel(64);

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            for event in greeting {
                ws.send(Message::Text(event.to_string().into())).await.unwrap();
            }
            while let Some(Ok(message)) = ws.next().await {
                if let Message::Text(text) = message {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    if seen_tx.send(value).await.is_err() {
                        break;
                    }
                }
            }
        });

        (format!("ws://{addr}/"), seen_rx)
    }

    #[test]
    fn test_creation_requires_ws_url() {
        let result = OpenAIRealtime::new(relay_config("http://localhost:1".to_string()));
        assert!(matches!(result, Err(RealtimeError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_empty_api_key_rejected() {
        let result = OpenAIRealtime::new(RealtimeConfig {
            url: "wss://api.openai.com/v1/realtime".to_string(),
            api_key: Some("  ".to_string()),
            model: None,
        });
        assert!(matches!(result, Err(RealtimeError::AuthenticationFailed(_))));
    }

    #[test]
    fn test_request_headers() {
        let client = OpenAIRealtime::new(RealtimeConfig {
            url: "wss://api.openai.com/v1/realtime".to_string(),
            api_key: Some("sk-test".to_string()),
            model: Some("gpt-4o-realtime-preview".to_string()),
        })
        .unwrap();

        let request = client.build_request().unwrap();
        assert_eq!(request.headers()["authorization"], "Bearer sk-test");
        assert_eq!(request.headers()["openai-beta"], "realtime=v1");
        assert_eq!(
            request.uri().to_string(),
            "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview"
        );
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let mut client =
            OpenAIRealtime::new(relay_config("ws://127.0.0.1:9/".to_string())).unwrap();

        let result = client.append_input_audio(&AudioFrame::silence(480)).await;
        assert!(matches!(result, Err(RealtimeError::NotConnected)));

        let result = client.cancel_response("item_1", 4800).await;
        assert!(matches!(result, Err(RealtimeError::NotConnected)));
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let mut client =
            OpenAIRealtime::new(relay_config("ws://127.0.0.1:9/".to_string())).unwrap();
        assert!(client.disconnect().await.is_ok());
        assert!(client.disconnect().await.is_ok());
        assert!(!client.is_ready());
    }

    #[tokio::test]
    async fn test_events_taken_once() {
        let mut client =
            OpenAIRealtime::new(relay_config("ws://127.0.0.1:9/".to_string())).unwrap();
        assert!(client.events().is_some());
        assert!(client.events().is_none());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut client = OpenAIRealtime::new(relay_config(format!("ws://{addr}/"))).unwrap();
        let result = client.connect().await;
        assert!(matches!(result, Err(RealtimeError::ConnectionFailed(_))));
        assert_eq!(client.connection_state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_connect_waits_for_session_created() {
        let (url, mut seen) = spawn_mock_upstream(vec![
            json!({"type": "rate_limits.updated", "rate_limits": []}),
            json!({"type": "session.created", "session": {"id": "sess_1"}}),
        ])
        .await;

        let mut client = OpenAIRealtime::new(relay_config(url)).unwrap();
        let mut events = client.events().unwrap();

        client
            .send_control(&SessionControl::persona_defaults())
            .await
            .unwrap();
        client.connect().await.unwrap();
        assert!(client.is_ready());
        assert_eq!(client.session_id(), Some("sess_1"));

        // Pre-ready events arrive in order, followed by the ready event itself
        match events.recv().await.unwrap() {
            UpstreamEvent::Message(envelope) => assert_eq!(envelope.kind(), "rate_limits.updated"),
            other => panic!("unexpected event {other:?}"),
        }
        match events.recv().await.unwrap() {
            UpstreamEvent::Message(envelope) => assert_eq!(envelope.kind(), "session.created"),
            other => panic!("unexpected event {other:?}"),
        }

        // Control held before connect goes out first
        let update = seen.recv().await.unwrap();
        assert_eq!(update["type"], "session.update");
        assert_eq!(update["session"]["voice"], "coral");

        client.cancel_response("item_1", 4800).await.unwrap();
        assert_eq!(seen.recv().await.unwrap()["type"], "response.cancel");
        let truncate = seen.recv().await.unwrap();
        assert_eq!(truncate["type"], "conversation.item.truncate");
        assert_eq!(truncate["item_id"], "item_1");
        assert_eq!(truncate["audio_end_ms"], 200);

        client.disconnect().await.unwrap();
        assert!(!client.is_ready());
    }

    #[tokio::test]
    async fn test_connect_fails_on_upstream_error() {
        let (url, _seen) = spawn_mock_upstream(vec![json!({
            "type": "error",
            "error": {"type": "invalid_request_error", "message": "bad key"}
        })])
        .await;

        let mut client = OpenAIRealtime::new(relay_config(url)).unwrap();
        match client.connect().await {
            Err(RealtimeError::ConnectionFailed(message)) => assert!(message.contains("bad key")),
            other => panic!("expected ConnectionFailed, got {other:?}"),
        }
        assert!(!client.is_ready());
    }
}
