//! Caller-facing relay endpoint
//!
//! One WebSocket connection per caller, bridged to one upstream session.

pub mod handler;
pub mod messages;
pub mod session;

pub use handler::relay_handler;
pub use messages::{CallerFrame, RelayMessageRoute};
pub use session::{BridgeSession, BridgeSessionConfig, SessionSummary};
