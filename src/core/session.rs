//! Lifecycle state and pre-ready message queue shared by the relay's bridge
//! sessions and the caller-side call session.

use std::collections::VecDeque;
use std::fmt;

use serde::Serialize;

use crate::core::envelope::Envelope;

/// `Idle → Connecting → Active → Draining → Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Active,
    Draining,
    Closed,
}

impl SessionState {
    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Active)
                | (Idle | Connecting | Active, Draining)
                | (Draining, Closed)
        )
    }

    /// Move to `next` if legal. Returns false and leaves the state unchanged
    /// otherwise.
    pub fn advance(&mut self, next: SessionState) -> bool {
        if !self.can_transition_to(next) {
            tracing::warn!(from = %self, to = %next, "Ignoring invalid session transition");
            return false;
        }
        *self = next;
        true
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Closed
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// FIFO of caller envelopes received before the upstream is ready.
#[derive(Debug, Default)]
pub struct PendingQueue {
    items: VecDeque<Envelope>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, envelope: Envelope) {
        self.items.push_back(envelope);
    }

    /// Hand over every queued envelope in arrival order, leaving the queue empty.
    pub fn take_all(&mut self) -> VecDeque<Envelope> {
        std::mem::take(&mut self.items)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        let mut state = SessionState::default();
        assert!(state.advance(SessionState::Connecting));
        assert!(!state.advance(SessionState::Closed));
        assert_eq!(state, SessionState::Connecting);
        assert!(state.advance(SessionState::Active));
        assert!(!state.advance(SessionState::Connecting));
        assert!(state.advance(SessionState::Draining));
        assert!(state.advance(SessionState::Closed));
        assert!(state.is_terminal());
        assert!(!state.advance(SessionState::Draining));
    }

    #[test]
    fn test_connect_failure_path() {
        let mut state = SessionState::Connecting;
        assert!(state.advance(SessionState::Draining));
        assert!(state.advance(SessionState::Closed));
    }

    #[test]
    fn test_pending_queue_fifo_once() {
        let mut queue = PendingQueue::new();
        for i in 0..3 {
            queue.push(Envelope::parse(&format!(r#"{{"type":"t{i}"}}"#)).unwrap());
        }
        assert_eq!(queue.len(), 3);

        let flushed: Vec<String> = queue
            .take_all()
            .into_iter()
            .map(|e| e.kind().to_string())
            .collect();
        assert_eq!(flushed, vec!["t0", "t1", "t2"]);
        assert!(queue.is_empty());
        assert!(queue.take_all().is_empty());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Draining.to_string(), "draining");
        assert_eq!(
            serde_json::to_string(&SessionState::Active).unwrap(),
            "\"active\""
        );
    }
}
