//! HTTP and WebSocket request handlers
//!
//! - `api` - Health check endpoint
//! - `relay` - Caller WebSocket bridged to the upstream session

pub mod api;
pub mod relay;

pub use relay::relay_handler;
