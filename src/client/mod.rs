//! Caller endpoint: a call session that talks to the upstream directly or
//! through the relay, with local audio in and out.

pub mod call;

pub use call::{CallCommand, CallConfig, CallEvent, CallSession};
