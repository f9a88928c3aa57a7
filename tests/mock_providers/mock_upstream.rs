//! In-process upstream adapter with scripted readiness and a call log.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use persona_relay::core::audio::AudioFrame;
use persona_relay::core::envelope::Envelope;
use persona_relay::core::realtime::{
    ConnectionState, RealtimeError, RealtimeResult, SessionControl, UpstreamEvent, UpstreamEvents,
    UpstreamSession,
};

/// Everything the session asked the upstream to do, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Connect,
    Control(SessionControl),
    Event(Value),
    Audio(u64),
    Cancel(String, u64),
    Disconnect,
}

#[derive(Debug, Clone, Copy)]
enum Readiness {
    After(Duration),
    Never,
    Refuse,
}

pub struct MockUpstream {
    log: Arc<Mutex<Vec<MockCall>>>,
    readiness: Readiness,
    events_tx: mpsc::Sender<UpstreamEvent>,
    events_rx: Option<UpstreamEvents>,
    pending_control: Option<SessionControl>,
    state: ConnectionState,
}

/// Test-side view of a `MockUpstream`.
#[derive(Clone)]
pub struct MockHandle {
    log: Arc<Mutex<Vec<MockCall>>>,
    events: mpsc::Sender<UpstreamEvent>,
}

impl MockUpstream {
    /// Ready `delay` after `connect` is called.
    pub fn ready_after(delay: Duration) -> (Self, MockHandle) {
        Self::build(Readiness::After(delay))
    }

    /// `connect` never resolves.
    pub fn never_ready() -> (Self, MockHandle) {
        Self::build(Readiness::Never)
    }

    /// `connect` fails straight away.
    pub fn refusing() -> (Self, MockHandle) {
        Self::build(Readiness::Refuse)
    }

    fn build(readiness: Readiness) -> (Self, MockHandle) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (events_tx, events_rx) = mpsc::channel(256);
        let handle = MockHandle {
            log: log.clone(),
            events: events_tx.clone(),
        };
        let upstream = Self {
            log,
            readiness,
            events_tx,
            events_rx: Some(events_rx),
            pending_control: None,
            state: ConnectionState::Disconnected,
        };
        (upstream, handle)
    }

    fn record(&self, call: MockCall) {
        self.log.lock().push(call);
    }

    fn ensure_connected(&self) -> RealtimeResult<()> {
        if self.state == ConnectionState::Connected {
            Ok(())
        } else {
            Err(RealtimeError::NotConnected)
        }
    }
}

#[async_trait]
impl UpstreamSession for MockUpstream {
    async fn connect(&mut self) -> RealtimeResult<()> {
        self.state = ConnectionState::Connecting;
        match self.readiness {
            Readiness::After(delay) => tokio::time::sleep(delay).await,
            Readiness::Never => std::future::pending::<()>().await,
            Readiness::Refuse => {
                self.state = ConnectionState::Failed;
                return Err(RealtimeError::ConnectionFailed(
                    "connection refused".to_string(),
                ));
            }
        }

        self.state = ConnectionState::Connected;
        self.record(MockCall::Connect);
        let created = Envelope::parse(r#"{"type":"session.created","session":{"id":"sess_mock"}}"#)
            .map_err(|e| RealtimeError::SerializationError(e.to_string()))?;
        let _ = self.events_tx.send(UpstreamEvent::Message(created)).await;

        if let Some(control) = self.pending_control.take() {
            self.record(MockCall::Control(control));
        }
        Ok(())
    }

    async fn send_control(&mut self, control: &SessionControl) -> RealtimeResult<()> {
        if self.state == ConnectionState::Connected {
            self.record(MockCall::Control(control.clone()));
        } else {
            self.pending_control = Some(control.clone());
        }
        Ok(())
    }

    async fn append_input_audio(&mut self, frame: &AudioFrame) -> RealtimeResult<()> {
        self.ensure_connected()?;
        self.record(MockCall::Audio(frame.sample_count()));
        Ok(())
    }

    async fn send_event(&mut self, envelope: Envelope) -> RealtimeResult<()> {
        self.ensure_connected()?;
        let value: Value = serde_json::from_str(envelope.as_str())
            .map_err(|e| RealtimeError::SerializationError(e.to_string()))?;
        self.record(MockCall::Event(value));
        Ok(())
    }

    async fn cancel_response(&mut self, track_id: &str, offset: u64) -> RealtimeResult<()> {
        self.ensure_connected()?;
        self.record(MockCall::Cancel(track_id.to_string(), offset));
        Ok(())
    }

    fn events(&mut self) -> Option<UpstreamEvents> {
        self.events_rx.take()
    }

    async fn disconnect(&mut self) -> RealtimeResult<()> {
        self.state = ConnectionState::Disconnected;
        self.record(MockCall::Disconnect);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    fn connection_state(&self) -> ConnectionState {
        self.state
    }
}

impl MockHandle {
    pub fn calls(&self) -> Vec<MockCall> {
        self.log.lock().clone()
    }

    /// `type` of every forwarded envelope, in order.
    pub fn sent_types(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::Event(value) => value["type"].as_str().map(str::to_string),
                _ => None,
            })
            .collect()
    }

    pub fn audio_frames(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, MockCall::Audio(_)))
            .count()
    }

    pub fn cancels(&self) -> Vec<(String, u64)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::Cancel(id, offset) => Some((id, offset)),
                _ => None,
            })
            .collect()
    }

    /// Deliver a server event as if the upstream had sent it.
    pub async fn push(&self, event: Value) {
        let envelope = Envelope::parse(&event.to_string()).unwrap();
        self.events.send(UpstreamEvent::Message(envelope)).await.unwrap();
    }

    pub async fn close(&self, reason: &str) {
        self.events
            .send(UpstreamEvent::Closed {
                reason: reason.to_string(),
            })
            .await
            .unwrap();
    }
}

/// `response.audio.delta` carrying `samples` of silence for `item_id`.
pub fn audio_delta(item_id: &str, samples: usize) -> Value {
    json!({
        "type": "response.audio.delta",
        "response_id": "resp_1",
        "item_id": item_id,
        "output_index": 0,
        "content_index": 0,
        "delta": AudioFrame::silence(samples).to_base64(),
    })
}

pub fn assistant_item_added(item_id: &str) -> Value {
    json!({
        "type": "response.output_item.added",
        "item": {"id": item_id, "type": "message", "role": "assistant", "status": "in_progress", "content": []}
    })
}
