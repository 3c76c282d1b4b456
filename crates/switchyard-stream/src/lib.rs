//! Switchyard Stream
//!
//! Server-Sent-Events relay between an upstream response body and the
//! caller-facing writer:
//! - Bounded line reading with an event size limit
//! - Keep-alive pings and idle timeout
//! - Multi-line `data:` aggregation with pluggable hooks
//! - Caller cancellation and deadline handling

pub mod error;
pub mod pump;
pub mod relay;

pub use error::{PumpError, Result, TransformError};
pub use pump::{PumpSummary, SsePump, SsePumpHooks, SsePumpOptions};
pub use relay::relay_sse;
