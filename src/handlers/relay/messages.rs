//! Frames exchanged between the caller socket tasks and a bridge session.

use bytes::Bytes;

use crate::core::envelope::Envelope;

/// A data frame received from the caller connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallerFrame {
    /// JSON envelope text, not yet validated
    Text(String),
    /// Raw PCM16 LE audio
    Binary(Bytes),
}

/// Message routing for the caller socket's sender task
#[derive(Debug)]
pub enum RelayMessageRoute {
    /// Envelope to send as a text frame
    Outgoing(Envelope),
    /// Send a Close frame and stop
    Close,
}
