//! Bridge session: one caller connection paired with one upstream session.
//!
//! The session owns its upstream adapter and its pending queue. A single
//! `select!` loop handles caller frames and upstream events, so the state and
//! the queue have one writer. Caller envelopes that arrive before the upstream
//! is ready are queued and flushed in order once it is.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::messages::{CallerFrame, RelayMessageRoute};
use crate::core::audio::AudioFrame;
use crate::core::envelope::Envelope;
use crate::core::realtime::{
    BoxedUpstream, ClientEvent, ServerEvent, SessionControl, UpstreamEvent, UpstreamEvents,
};
use crate::core::session::{PendingQueue, SessionState};
use crate::errors::SessionError;
use crate::state::SessionRegistry;

/// Per-session settings taken from the server configuration.
#[derive(Debug, Clone)]
pub struct BridgeSessionConfig {
    /// Upper bound on upstream readiness
    pub connect_timeout: Duration,
    /// Control applied before any caller envelope
    pub session_defaults: Option<SessionControl>,
}

impl Default for BridgeSessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            session_defaults: None,
        }
    }
}

/// What a finished session did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub final_state: SessionState,
    /// Envelopes and audio frames sent to the upstream
    pub forwarded_upstream: u64,
    /// Upstream envelopes relayed to the caller
    pub relayed_to_caller: u64,
    pub dropped_malformed: u64,
    #[serde(skip)]
    pub error: Option<SessionError>,
}

#[derive(Debug, Default)]
struct SessionStats {
    forwarded_upstream: u64,
    relayed_to_caller: u64,
    dropped_malformed: u64,
}

/// Why the session is draining.
#[derive(Debug)]
enum Ending {
    CallerClosed,
    Failed(SessionError),
}

pub struct BridgeSession {
    id: String,
    state: SessionState,
    upstream: BoxedUpstream,
    pending: PendingQueue,
    outbound: mpsc::Sender<RelayMessageRoute>,
    config: BridgeSessionConfig,
    registry: Option<Arc<SessionRegistry>>,
    stats: SessionStats,
}

impl BridgeSession {
    pub fn new(
        id: impl Into<String>,
        upstream: BoxedUpstream,
        outbound: mpsc::Sender<RelayMessageRoute>,
        config: BridgeSessionConfig,
    ) -> Self {
        Self {
            id: id.into(),
            state: SessionState::Idle,
            upstream,
            pending: PendingQueue::new(),
            outbound,
            config,
            registry: None,
            stats: SessionStats::default(),
        }
    }

    /// Report state changes to `registry` and remove the entry on close.
    pub fn with_registry(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session until both legs are torn down.
    ///
    /// `inbound` carries caller frames; it closing means the caller went away.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<CallerFrame>) -> SessionSummary {
        info!(session_id = %self.id, "Bridge session started");

        let ending = match self.connect(&mut inbound).await {
            Ok(events) => self.relay(&mut inbound, events).await,
            Err(ending) => ending,
        };

        self.drain(ending).await
    }

    async fn connect(
        &mut self,
        inbound: &mut mpsc::Receiver<CallerFrame>,
    ) -> Result<UpstreamEvents, Ending> {
        self.transition(SessionState::Connecting);

        let Some(events) = self.upstream.events() else {
            return Err(Ending::Failed(SessionError::UpstreamConnect(
                "upstream event stream unavailable".to_string(),
            )));
        };

        if let Some(defaults) = self.config.session_defaults.clone() {
            self.upstream
                .send_control(&defaults)
                .await
                .map_err(|e| Ending::Failed(SessionError::connect(e)))?;
        }

        let timeout = self.config.connect_timeout;
        let ready = {
            let connecting = tokio::time::timeout(timeout, self.upstream.connect());
            tokio::pin!(connecting);

            loop {
                tokio::select! {
                    result = &mut connecting => break result,
                    frame = inbound.recv() => match frame {
                        Some(frame) => queue_frame(&self.id, &mut self.pending, &mut self.stats, frame),
                        None => return Err(Ending::CallerClosed),
                    },
                }
            }
        };

        match ready {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(Ending::Failed(SessionError::connect(e))),
            Err(_) => {
                return Err(Ending::Failed(SessionError::UpstreamConnect(format!(
                    "upstream not ready within {}ms",
                    timeout.as_millis()
                ))));
            }
        }

        self.transition(SessionState::Active);

        let queued = self.pending.take_all();
        if !queued.is_empty() {
            debug!(session_id = %self.id, count = queued.len(), "Flushing queued caller envelopes");
        }
        for envelope in queued {
            self.forward(envelope).await?;
        }

        Ok(events)
    }

    async fn relay(
        &mut self,
        inbound: &mut mpsc::Receiver<CallerFrame>,
        mut events: UpstreamEvents,
    ) -> Ending {
        loop {
            tokio::select! {
                frame = inbound.recv() => {
                    let result = match frame {
                        Some(CallerFrame::Text(text)) => match Envelope::parse(&text) {
                            Ok(envelope) => self.forward(envelope).await,
                            Err(e) => {
                                self.drop_malformed(SessionError::from(e));
                                Ok(())
                            }
                        },
                        Some(CallerFrame::Binary(data)) => self.forward_audio(&data).await,
                        None => {
                            info!(session_id = %self.id, "Caller closed the connection");
                            return Ending::CallerClosed;
                        }
                    };
                    if let Err(ending) = result {
                        return ending;
                    }
                }
                event = events.recv() => match event {
                    Some(UpstreamEvent::Message(envelope)) => {
                        log_failed_response(&self.id, &envelope);
                        if self
                            .outbound
                            .send(RelayMessageRoute::Outgoing(envelope))
                            .await
                            .is_err()
                        {
                            debug!(session_id = %self.id, "Caller sender gone");
                            return Ending::CallerClosed;
                        }
                        self.stats.relayed_to_caller += 1;
                    }
                    Some(UpstreamEvent::Closed { reason }) => {
                        return Ending::Failed(SessionError::UpstreamClosed(reason));
                    }
                    Some(UpstreamEvent::Failed(e)) => {
                        return Ending::Failed(SessionError::UpstreamClosed(format!(
                            "transport failed: {e}"
                        )));
                    }
                    None => {
                        return Ending::Failed(SessionError::UpstreamClosed(
                            "upstream event stream ended".to_string(),
                        ));
                    }
                },
            }
        }
    }

    async fn forward(&mut self, envelope: Envelope) -> Result<(), Ending> {
        let kind = envelope.kind().to_string();
        self.upstream.send_event(envelope).await.map_err(|e| {
            Ending::Failed(SessionError::UpstreamClosed(format!(
                "failed to forward {kind}: {e}"
            )))
        })?;
        self.stats.forwarded_upstream += 1;
        Ok(())
    }

    async fn forward_audio(&mut self, data: &[u8]) -> Result<(), Ending> {
        let frame = match AudioFrame::from_pcm16_le(data) {
            Ok(frame) => frame,
            Err(e) => {
                self.drop_malformed(SessionError::ProtocolParse(e.to_string()));
                return Ok(());
            }
        };
        self.upstream.append_input_audio(&frame).await.map_err(|e| {
            Ending::Failed(SessionError::UpstreamClosed(format!(
                "failed to forward audio: {e}"
            )))
        })?;
        self.stats.forwarded_upstream += 1;
        Ok(())
    }

    fn drop_malformed(&mut self, err: SessionError) {
        warn!(session_id = %self.id, "Dropping malformed caller message: {}", err);
        self.stats.dropped_malformed += 1;
    }

    async fn drain(mut self, ending: Ending) -> SessionSummary {
        self.transition(SessionState::Draining);

        let discarded = self.pending.len();
        self.pending.clear();
        if discarded > 0 {
            debug!(session_id = %self.id, discarded, "Discarded queued caller envelopes");
        }

        if let Err(e) = self.upstream.disconnect().await {
            warn!(session_id = %self.id, "Upstream disconnect failed: {}", e);
        }

        let error = match ending {
            Ending::CallerClosed => None,
            Ending::Failed(err) => {
                error!(session_id = %self.id, code = err.code(), "Session failed: {}", err);
                let _ = self
                    .outbound
                    .send(RelayMessageRoute::Outgoing(err.to_envelope()))
                    .await;
                Some(err)
            }
        };
        let _ = self.outbound.send(RelayMessageRoute::Close).await;

        self.transition(SessionState::Closed);
        if let Some(registry) = &self.registry {
            registry.remove(&self.id);
        }

        info!(
            session_id = %self.id,
            forwarded_upstream = self.stats.forwarded_upstream,
            relayed_to_caller = self.stats.relayed_to_caller,
            dropped_malformed = self.stats.dropped_malformed,
            "Bridge session closed"
        );

        SessionSummary {
            id: self.id.clone(),
            final_state: self.state,
            forwarded_upstream: self.stats.forwarded_upstream,
            relayed_to_caller: self.stats.relayed_to_caller,
            dropped_malformed: self.stats.dropped_malformed,
            error,
        }
    }

    fn transition(&mut self, next: SessionState) {
        let from = self.state;
        if self.state.advance(next) {
            debug!(session_id = %self.id, %from, to = %next, "Session state changed");
            if let Some(registry) = &self.registry {
                registry.set_state(&self.id, next);
            }
        }
    }
}

/// Queue a caller frame received before the upstream is ready.
fn queue_frame(id: &str, pending: &mut PendingQueue, stats: &mut SessionStats, frame: CallerFrame) {
    let parsed = match frame {
        CallerFrame::Text(text) => Envelope::parse(&text).map_err(SessionError::from),
        CallerFrame::Binary(data) => AudioFrame::from_pcm16_le(&data)
            .map_err(|e| SessionError::ProtocolParse(e.to_string()))
            .and_then(|_| {
                Envelope::from_event(&ClientEvent::audio_append(&data)).map_err(SessionError::from)
            }),
    };

    match parsed {
        Ok(envelope) => {
            debug!(session_id = %id, kind = envelope.kind(), "Queued caller envelope until upstream is ready");
            pending.push(envelope);
        }
        Err(e) => {
            warn!(session_id = %id, "Dropping malformed caller message: {}", e);
            stats.dropped_malformed += 1;
        }
    }
}

fn log_failed_response(id: &str, envelope: &Envelope) {
    if envelope.kind() != "response.done" {
        return;
    }
    if let Ok(ServerEvent::ResponseDone { response }) = envelope.decode::<ServerEvent>()
        && response.status == "failed"
    {
        error!(
            session_id = %id,
            response_id = %response.id,
            details = ?response.status_details,
            "Upstream response failed"
        );
    }
}
