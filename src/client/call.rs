//! Caller-side call session.
//!
//! Drives one conversation against an upstream (or a relay in front of it):
//! local capture feeds the upstream, assistant audio is played through the
//! playback tracker, and caller speech over assistant audio triggers a
//! barge-in. The session emits `CallEvent`s and accepts `CallCommand`s.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::core::audio::{
    AudioDeviceError, AudioFrame, AudioInput, AudioOutput, CaptureEvent, CapturePipeline,
    PlaybackTracker,
};
use crate::core::conversation::{Conversation, ConversationItem};
use crate::core::envelope::Envelope;
use crate::core::realtime::openai::ConversationItem as WireItem;
use crate::core::realtime::{
    BoxedUpstream, ClientEvent, RealtimeResult, ServerEvent, SessionControl, UpstreamEvent,
    UpstreamEvents,
};
use crate::core::session::{PendingQueue, SessionState};
use crate::core::turn::{TurnCoordinator, TurnMode, TurnOutcome};
use crate::errors::SessionError;

const CAPTURE_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct CallConfig {
    pub control: SessionControl,
    /// Sent as a user message once the session is active
    pub initial_message: Option<String>,
    pub connect_timeout: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            control: SessionControl::persona_defaults(),
            initial_message: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Instructions from whoever is driving the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallCommand {
    Mute,
    Unmute,
    SendText(String),
    /// Push-to-talk pressed (manual turn mode only)
    BeginTurn,
    /// Push-to-talk released (manual turn mode only)
    EndTurn,
    HangUp,
}

impl CallCommand {
    /// Parse an interactive line: `mute`, `unmute`, `say <text>`, `talk`,
    /// `done` or `hangup`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        match word.to_lowercase().as_str() {
            "mute" => Some(CallCommand::Mute),
            "unmute" => Some(CallCommand::Unmute),
            "say" if !rest.is_empty() => Some(CallCommand::SendText(rest.to_string())),
            "talk" => Some(CallCommand::BeginTurn),
            "done" => Some(CallCommand::EndTurn),
            "hangup" | "quit" | "exit" => Some(CallCommand::HangUp),
            _ => None,
        }
    }
}

/// What the session reports back.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StateChanged(SessionState),
    ItemUpdated(ConversationItem),
    Interrupted { track_id: String, offset: u64 },
    Error(SessionError),
    Ended { transcript: String },
}

#[derive(Debug)]
enum Ending {
    HangUp,
    Failed(SessionError),
}

pub struct CallSession {
    state: SessionState,
    upstream: BoxedUpstream,
    devices: Option<(Box<dyn AudioInput>, Box<dyn AudioOutput>)>,
    config: CallConfig,
    mode: TurnMode,
    pending: PendingQueue,
    muted: bool,
    conversation: Conversation,
    events: mpsc::Sender<CallEvent>,
}

impl CallSession {
    /// Create a session and the receiver its events arrive on.
    pub fn new(
        upstream: BoxedUpstream,
        input: Box<dyn AudioInput>,
        output: Box<dyn AudioOutput>,
        config: CallConfig,
    ) -> (Self, mpsc::Receiver<CallEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_BUFFER);
        let mode = TurnMode::from_control(&config.control);
        let session = Self {
            state: SessionState::Idle,
            upstream,
            devices: Some((input, output)),
            config,
            mode,
            pending: PendingQueue::new(),
            muted: false,
            conversation: Conversation::new(),
            events,
        };
        (session, events_rx)
    }

    pub fn mode(&self) -> TurnMode {
        self.mode
    }

    /// Run the call to completion and return the conversation record.
    pub async fn run(mut self, mut commands: mpsc::Receiver<CallCommand>) -> Conversation {
        info!(mode = %self.mode, "Call starting");

        let ending = match self.connect(&mut commands).await {
            Ok(events) => self.active(&mut commands, events).await,
            Err(ending) => ending,
        };

        self.drain(ending).await;
        self.conversation
    }

    async fn connect(
        &mut self,
        commands: &mut mpsc::Receiver<CallCommand>,
    ) -> Result<UpstreamEvents, Ending> {
        self.transition(SessionState::Connecting).await;

        let Some(events) = self.upstream.events() else {
            return Err(Ending::Failed(SessionError::UpstreamConnect(
                "upstream event stream unavailable".to_string(),
            )));
        };

        self.upstream
            .send_control(&self.config.control)
            .await
            .map_err(|e| Ending::Failed(SessionError::connect(e)))?;

        let timeout = self.config.connect_timeout;
        let ready = {
            let connecting = tokio::time::timeout(timeout, self.upstream.connect());
            tokio::pin!(connecting);

            loop {
                tokio::select! {
                    result = &mut connecting => break result,
                    command = commands.recv() => match command {
                        Some(CallCommand::Mute) => self.muted = true,
                        Some(CallCommand::Unmute) => self.muted = false,
                        Some(CallCommand::SendText(text)) => match text_envelopes(&text) {
                            Ok(envelopes) => {
                                for envelope in envelopes {
                                    self.pending.push(envelope);
                                }
                            }
                            Err(e) => warn!("Dropping text message: {}", e),
                        },
                        Some(CallCommand::BeginTurn | CallCommand::EndTurn) => {
                            debug!("Ignoring turn command while connecting");
                        }
                        Some(CallCommand::HangUp) | None => return Err(Ending::HangUp),
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

        self.transition(SessionState::Active).await;
        for envelope in self.pending.take_all() {
            self.upstream
                .send_event(envelope)
                .await
                .map_err(|e| Ending::Failed(send_failed(e)))?;
        }

        Ok(events)
    }

    async fn active(
        &mut self,
        commands: &mut mpsc::Receiver<CallCommand>,
        mut events: UpstreamEvents,
    ) -> Ending {
        let Some((input, output)) = self.devices.take() else {
            return Ending::Failed(SessionError::AudioDevice(AudioDeviceError::Input(
                "audio devices already in use".to_string(),
            )));
        };

        let (fault_tx, mut faults) = mpsc::channel(4);
        let mut tracker = PlaybackTracker::spawn(output, fault_tx);
        let (capture_tx, mut captured) = mpsc::channel(CAPTURE_BUFFER);
        let start_paused = self.muted || self.mode == TurnMode::Manual;
        let mut capture = CapturePipeline::spawn(input, capture_tx, start_paused);
        let mut coordinator = TurnCoordinator::new(self.mode);

        let mut ending = None;
        if let Some(text) = self.config.initial_message.clone()
            && let Err(e) = self.send_text(&text).await
        {
            ending = Some(Ending::Failed(e));
        }

        let mut capture_open = true;
        let mut faults_open = true;

        while ending.is_none() {
            tokio::select! {
                command = commands.recv() => {
                    let command = command.unwrap_or(CallCommand::HangUp);
                    if let Err(e) = self
                        .on_command(command, &tracker, &capture, &mut coordinator)
                        .await
                    {
                        ending = Some(e);
                    }
                }
                event = events.recv() => match event {
                    Some(UpstreamEvent::Message(envelope)) => {
                        if let Err(e) = self.on_upstream(envelope, &tracker, &mut coordinator).await {
                            ending = Some(Ending::Failed(e));
                        }
                    }
                    Some(UpstreamEvent::Closed { reason }) => {
                        ending = Some(Ending::Failed(SessionError::UpstreamClosed(reason)));
                    }
                    Some(UpstreamEvent::Failed(e)) => {
                        ending = Some(Ending::Failed(SessionError::UpstreamClosed(format!(
                            "transport failed: {e}"
                        ))));
                    }
                    None => {
                        ending = Some(Ending::Failed(SessionError::UpstreamClosed(
                            "upstream event stream ended".to_string(),
                        )));
                    }
                },
                frame = captured.recv(), if capture_open => match frame {
                    Some(CaptureEvent::Frame(frame)) => {
                        if let Err(e) = self.upstream.append_input_audio(&frame).await {
                            ending = Some(Ending::Failed(send_failed(e)));
                        }
                    }
                    Some(CaptureEvent::Ended) => info!("Audio input finished"),
                    Some(CaptureEvent::Failed(e)) => {
                        error!("Audio capture failed: {}", e);
                        ending = Some(Ending::Failed(SessionError::AudioDevice(e)));
                    }
                    None => capture_open = false,
                },
                fault = faults.recv(), if faults_open => match fault {
                    Some(e) => {
                        error!("Audio playback failed: {}", e);
                        ending = Some(Ending::Failed(SessionError::AudioDevice(e)));
                    }
                    None => faults_open = false,
                },
            }
        }

        let ending = ending.unwrap_or(Ending::HangUp);
        self.transition(SessionState::Draining).await;

        if matches!(ending, Ending::HangUp) && tracker.active_track().is_some() {
            let outcome = coordinator
                .on_speech_started(&tracker, self.upstream.as_mut(), &mut self.conversation)
                .await;
            if let Err(e) = self.report_turn(outcome).await {
                debug!("Barge-in on hang up failed: {}", e);
            }
        }

        capture.stop().await;
        tracker.shutdown().await;
        ending
    }

    async fn on_command(
        &mut self,
        command: CallCommand,
        tracker: &PlaybackTracker,
        capture: &CapturePipeline,
        coordinator: &mut TurnCoordinator,
    ) -> Result<(), Ending> {
        match command {
            CallCommand::Mute => {
                self.muted = true;
                capture.pause();
                info!("Microphone muted");
            }
            CallCommand::Unmute => {
                self.muted = false;
                if self.mode == TurnMode::ServerVad || coordinator.caller_turn_open() {
                    capture.resume();
                }
                info!("Microphone unmuted");
            }
            CallCommand::SendText(text) => self.send_text(&text).await.map_err(Ending::Failed)?,
            CallCommand::BeginTurn | CallCommand::EndTurn if self.mode != TurnMode::Manual => {
                warn!(mode = %self.mode, "Ignoring push-to-talk command outside manual mode");
            }
            CallCommand::BeginTurn => {
                let outcome = coordinator
                    .begin_turn(tracker, self.upstream.as_mut(), &mut self.conversation)
                    .await;
                self.report_turn(outcome).await.map_err(Ending::Failed)?;
                if !self.muted {
                    capture.resume();
                }
            }
            CallCommand::EndTurn => {
                capture.pause();
                coordinator
                    .end_turn(self.upstream.as_mut())
                    .await
                    .map_err(|e| Ending::Failed(send_failed(e)))?;
            }
            CallCommand::HangUp => {
                info!("Hanging up");
                return Err(Ending::HangUp);
            }
        }
        Ok(())
    }

    async fn on_upstream(
        &mut self,
        envelope: Envelope,
        tracker: &PlaybackTracker,
        coordinator: &mut TurnCoordinator,
    ) -> Result<(), SessionError> {
        debug!(kind = envelope.kind(), "Upstream event");

        let event = match envelope.decode::<ServerEvent>() {
            Ok(event) => event,
            Err(e) => {
                warn!(kind = envelope.kind(), "Undecodable upstream event: {}", e);
                return Ok(());
            }
        };

        match &event {
            ServerEvent::AudioDelta { item_id, delta, .. } => match AudioFrame::from_base64(delta) {
                Ok(frame) => {
                    tracker.on_audio_delta(item_id, frame);
                }
                Err(e) => warn!(item_id = %item_id, "Dropping undecodable audio delta: {}", e),
            },
            ServerEvent::SpeechStarted { .. } if coordinator.mode() == TurnMode::ServerVad => {
                let outcome = coordinator
                    .on_speech_started(tracker, self.upstream.as_mut(), &mut self.conversation)
                    .await;
                self.report_turn(outcome).await?;
            }
            ServerEvent::OutputItemDone { item } => {
                if let Some(id) = &item.id {
                    tracker.mark_complete(id);
                }
            }
            ServerEvent::Error { error } => {
                warn!(code = ?error.code, "Upstream reported an error: {}", error.message);
                self.emit(CallEvent::Error(SessionError::UpstreamRuntime(
                    error.message.clone(),
                )))
                .await;
            }
            _ => {}
        }

        let updated = self.conversation.apply(&event).cloned();
        if let Some(item) = updated {
            self.emit(CallEvent::ItemUpdated(item)).await;
        }
        Ok(())
    }

    async fn report_turn(
        &mut self,
        outcome: RealtimeResult<TurnOutcome>,
    ) -> Result<(), SessionError> {
        match outcome.map_err(send_failed)? {
            TurnOutcome::Interrupted { track_id, offset } => {
                self.emit(CallEvent::Interrupted { track_id, offset }).await;
            }
            TurnOutcome::NoActiveTrack | TurnOutcome::CancellationRace { .. } => {}
        }
        Ok(())
    }

    async fn send_text(&mut self, text: &str) -> Result<(), SessionError> {
        for envelope in text_envelopes(text)? {
            self.upstream.send_event(envelope).await.map_err(send_failed)?;
        }
        Ok(())
    }

    async fn drain(&mut self, ending: Ending) {
        if self.state != SessionState::Draining {
            self.transition(SessionState::Draining).await;
        }
        self.pending.clear();

        if let Err(e) = self.upstream.disconnect().await {
            warn!("Upstream disconnect failed: {}", e);
        }

        if let Ending::Failed(err) = ending {
            error!(code = err.code(), "Call failed: {}", err);
            self.emit(CallEvent::Error(err)).await;
        }

        self.transition(SessionState::Closed).await;
        let transcript = self.conversation.transcript();
        info!(items = self.conversation.len(), "Call ended");
        self.emit(CallEvent::Ended { transcript }).await;
    }

    async fn transition(&mut self, next: SessionState) {
        if self.state.advance(next) {
            self.emit(CallEvent::StateChanged(next)).await;
        }
    }

    /// The returned future owns its sender, so `self` is not held across the send.
    fn emit(&self, event: CallEvent) -> impl Future<Output = ()> + Send + use<> {
        let events = self.events.clone();
        async move {
            if events.send(event).await.is_err() {
                debug!("Call event receiver dropped");
            }
        }
    }
}

/// A user text message followed by a request for a reply.
fn text_envelopes(text: &str) -> Result<[Envelope; 2], SessionError> {
    Ok([
        Envelope::from_event(&ClientEvent::ConversationItemCreate {
            item: WireItem::user_text(text),
        })?,
        Envelope::from_event(&ClientEvent::ResponseCreate)?,
    ])
}

fn send_failed(err: crate::core::realtime::RealtimeError) -> SessionError {
    SessionError::UpstreamClosed(format!("send failed: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(CallCommand::parse("mute"), Some(CallCommand::Mute));
        assert_eq!(CallCommand::parse("  UNMUTE "), Some(CallCommand::Unmute));
        assert_eq!(
            CallCommand::parse("say I'd like a late checkout"),
            Some(CallCommand::SendText("I'd like a late checkout".to_string()))
        );
        assert_eq!(CallCommand::parse("talk"), Some(CallCommand::BeginTurn));
        assert_eq!(CallCommand::parse("done"), Some(CallCommand::EndTurn));
        assert_eq!(CallCommand::parse("hangup"), Some(CallCommand::HangUp));
    }

    #[test]
    fn test_parse_rejects_unknown_and_empty_say() {
        assert_eq!(CallCommand::parse("say"), None);
        assert_eq!(CallCommand::parse("say   "), None);
        assert_eq!(CallCommand::parse("dance"), None);
        assert_eq!(CallCommand::parse(""), None);
    }

    #[test]
    fn test_text_envelopes() {
        let [item, response] = text_envelopes("Hello").unwrap();
        assert_eq!(item.kind(), "conversation.item.create");
        assert!(item.as_str().contains("\"Hello\""));
        assert_eq!(response.kind(), "response.create");
    }
}
