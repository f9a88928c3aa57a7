//! Turn-taking and barge-in.
//!
//! When the caller starts speaking while an assistant track is playing, the
//! coordinator stops playback, reads how much of the track was actually
//! rendered, asks the upstream to cancel and truncate at that offset, and
//! records the assistant item as interrupted. The offset is read only after
//! rendering has stopped so the upstream learns exactly what the caller heard.

use std::fmt;

use crate::core::audio::PlaybackTracker;
use crate::core::conversation::{Conversation, InterruptOutcome};
use crate::core::envelope::Envelope;
use crate::core::realtime::{
    ClientEvent, RealtimeError, RealtimeResult, SessionControl, UpstreamSession,
};

/// Who decides when the caller's turn ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnMode {
    /// The upstream's voice-activity detection
    ServerVad,
    /// Push-to-talk: the caller begins and ends turns explicitly
    Manual,
}

impl TurnMode {
    pub fn from_control(control: &SessionControl) -> Self {
        if control.turn_detection.is_server_vad() {
            TurnMode::ServerVad
        } else {
            TurnMode::Manual
        }
    }
}

impl fmt::Display for TurnMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnMode::ServerVad => write!(f, "server_vad"),
            TurnMode::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Nothing was playing
    NoActiveTrack,
    Interrupted { track_id: String, offset: u64 },
    /// The item completed before the cancellation; its recorded state stands
    CancellationRace { track_id: String, offset: u64 },
}

#[derive(Debug)]
pub struct TurnCoordinator {
    mode: TurnMode,
    interruptions: u64,
    caller_turn_open: bool,
}

impl TurnCoordinator {
    pub fn new(mode: TurnMode) -> Self {
        Self {
            mode,
            interruptions: 0,
            caller_turn_open: false,
        }
    }

    pub fn mode(&self) -> TurnMode {
        self.mode
    }

    /// Number of tracks cut off by the caller so far.
    pub fn interruptions(&self) -> u64 {
        self.interruptions
    }

    pub fn caller_turn_open(&self) -> bool {
        self.caller_turn_open
    }

    /// Caller speech onset reported by the upstream.
    pub async fn on_speech_started(
        &mut self,
        tracker: &PlaybackTracker,
        upstream: &mut dyn UpstreamSession,
        conversation: &mut Conversation,
    ) -> RealtimeResult<TurnOutcome> {
        self.barge_in(tracker, upstream, conversation).await
    }

    /// Push-to-talk pressed. Cuts off any playing track.
    pub async fn begin_turn(
        &mut self,
        tracker: &PlaybackTracker,
        upstream: &mut dyn UpstreamSession,
        conversation: &mut Conversation,
    ) -> RealtimeResult<TurnOutcome> {
        self.caller_turn_open = true;
        self.barge_in(tracker, upstream, conversation).await
    }

    /// Push-to-talk released. Commits the caller's audio and requests a reply.
    pub async fn end_turn(&mut self, upstream: &mut dyn UpstreamSession) -> RealtimeResult<()> {
        self.caller_turn_open = false;
        for event in [ClientEvent::InputAudioBufferCommit, ClientEvent::ResponseCreate] {
            let envelope = Envelope::from_event(&event)
                .map_err(|e| RealtimeError::SerializationError(e.to_string()))?;
            upstream.send_event(envelope).await?;
        }
        Ok(())
    }

    async fn barge_in(
        &mut self,
        tracker: &PlaybackTracker,
        upstream: &mut dyn UpstreamSession,
        conversation: &mut Conversation,
    ) -> RealtimeResult<TurnOutcome> {
        let Some(track_id) = tracker.active_track() else {
            tracing::debug!("Speech started with no assistant audio playing");
            return Ok(TurnOutcome::NoActiveTrack);
        };

        tracker.stop(&track_id).await;
        let offset = tracker.current_offset(&track_id);
        let cancelled = upstream.cancel_response(&track_id, offset).await;
        let marked = conversation.mark_interrupted(&track_id);
        tracker.retire(&track_id);
        cancelled?;

        if marked == InterruptOutcome::AlreadyCompleted {
            tracing::warn!(
                track_id = %track_id,
                offset,
                "Cancellation raced item completion, keeping completed state"
            );
            return Ok(TurnOutcome::CancellationRace { track_id, offset });
        }

        self.interruptions += 1;
        tracing::info!(track_id = %track_id, offset, "Caller interrupted assistant");
        Ok(TurnOutcome::Interrupted { track_id, offset })
    }
}
