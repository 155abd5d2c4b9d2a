//! Orchestration-level error type: wraps [`CoreError`] and adds the roles
//! specific to external collaborators the shared engine doesn't know about
//! (checkpoint store, dead-letter sinks, the event-source control plane).

use stream_consumer_shared::CoreError;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum OrchestrationError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("checkpoint store error: {0}")]
    Checkpoint(String),

    #[error("dead-letter sink error: {0}")]
    DeadLetter(String),

    #[error("event source control plane error: {0}")]
    ControlPlane(String),

    #[error("phase deadline exceeded: {0}")]
    DeadlineExceeded(String),
}

impl OrchestrationError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, OrchestrationError::Core(e) if e.is_fatal())
    }

    /// Whether this failure should trigger host redelivery of the same
    /// records (a non-fully-finalised batch re-raises, a fatal error
    /// disables intake entirely but still re-raises so the host doesn't
    /// silently drop the records already in flight).
    pub fn is_replay_trigger(&self) -> bool {
        match self {
            OrchestrationError::Core(e) => e.is_replay_trigger(),
            OrchestrationError::DeadlineExceeded(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestrationError>;
