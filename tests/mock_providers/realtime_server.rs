//! Minimal upstream realtime WebSocket server.
//!
//! Sends `session.created` on connect, records every text frame it receives
//! and answers each with a `mock.ack` naming the received type.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_tungstenite::{accept_async, tungstenite::Message};

#[derive(Default)]
pub struct MockServerState {
    pub connections: AtomicUsize,
    pub received: Mutex<Vec<Value>>,
}

impl MockServerState {
    pub fn received_types(&self) -> Vec<String> {
        self.received
            .lock()
            .iter()
            .filter_map(|value| value["type"].as_str().map(str::to_string))
            .collect()
    }
}

/// Start the server on an ephemeral port.
pub async fn start_mock_realtime_server() -> (SocketAddr, Arc<MockServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(MockServerState::default());

    let server_state = state.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let state = server_state.clone();
            tokio::spawn(async move {
                let Ok(ws) = accept_async(stream).await else {
                    return;
                };
                state.connections.fetch_add(1, Ordering::SeqCst);
                let (mut write, mut read) = ws.split();

                let created = json!({"type": "session.created", "session": {"id": "sess_test"}});
                if write
                    .send(Message::Text(created.to_string().into()))
                    .await
                    .is_err()
                {
                    return;
                }

                while let Some(Ok(message)) = read.next().await {
                    match message {
                        Message::Text(text) => {
                            let Ok(value) = serde_json::from_str::<Value>(text.as_str()) else {
                                continue;
                            };
                            let kind = value["type"].as_str().unwrap_or_default().to_string();
                            state.received.lock().push(value);
                            let ack = json!({"type": "mock.ack", "of": kind});
                            if write.send(Message::Text(ack.to_string().into())).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            });
        }
    });

    (addr, state)
}
