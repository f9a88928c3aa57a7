pub mod audio;
pub mod conversation;
pub mod envelope;
pub mod realtime;
pub mod session;
pub mod turn;

// Re-export commonly used types for convenience
pub use audio::{AudioDeviceError, AudioFrame, PlaybackTracker};
pub use conversation::{Conversation, ConversationItem, InterruptOutcome, ItemStatus};
pub use envelope::{Envelope, EnvelopeError};
pub use realtime::{
    BoxedUpstream, RealtimeConfig, RealtimeError, RealtimeResult, SessionControl, UpstreamEvent,
    UpstreamSession, create_upstream_session,
};
pub use session::{PendingQueue, SessionState};
pub use turn::{TurnCoordinator, TurnMode, TurnOutcome};
