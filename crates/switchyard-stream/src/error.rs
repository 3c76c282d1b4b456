//! Stream relay errors

use std::io;
use switchyard_core::ErrorClass;
use thiserror::Error;

/// Terminal condition of a relayed stream
#[derive(Error, Debug)]
pub enum PumpError {
    #[error("client disconnected")]
    ClientDisconnect,

    #[error("stream exceeded its maximum duration")]
    MaxDuration,

    #[error("sse idle timeout")]
    IdleTimeout,

    #[error("sse event too large")]
    EventTooLarge,

    #[error("failed to read upstream stream: {0}")]
    Read(#[source] io::Error),

    #[error("failed to write to client: {0}")]
    Write(#[source] io::Error),
}

impl PumpError {
    /// Classification reported back to the scheduler
    pub fn error_class(&self) -> ErrorClass {
        match self {
            PumpError::ClientDisconnect | PumpError::Write(_) => ErrorClass::ClientDisconnect,
            PumpError::MaxDuration => ErrorClass::StreamMaxDuration,
            PumpError::IdleTimeout => ErrorClass::StreamIdleTimeout,
            PumpError::EventTooLarge => ErrorClass::StreamEventTooLarge,
            PumpError::Read(_) => ErrorClass::StreamReadError,
        }
    }
}

/// Failure of a `transform_data` hook; the original event is relayed instead
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("transform failed: {0}")]
pub struct TransformError(pub String);

pub type Result<T> = std::result::Result<T, PumpError>;
