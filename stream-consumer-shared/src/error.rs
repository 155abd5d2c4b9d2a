//! Error roles shared by every component of the batch lifecycle engine.
//!
//! Variant names follow failure roles (fatal, transient, task-local
//! failure, rejection, unusable input, timeout, replay trigger) rather
//! than any particular transport's vocabulary, so orchestration code can
//! match on *why* something failed instead of *where*.

use thiserror::Error;

/// The shared error type threaded through identifiers, the sequencer, the
/// task engine and the batch aggregate.
#[derive(Debug, Error, Clone)]
pub enum CoreError {
    /// Configuration missing, a required callback absent, or any condition
    /// that should surface to the operator and disable further intake.
    #[error("fatal: {0}")]
    Fatal(String),

    /// A retryable failure talking to an external collaborator (checkpoint
    /// store, dead-letter sink, control plane). The caller should revert any
    /// in-flight attempt and let the host redeliver.
    #[error("transient: {0}")]
    Transient(String),

    /// The user's execute callback failed for a single task. Non-fatal:
    /// counted as an attempt, retried on the next invocation unless over
    /// the cap.
    #[error("task failure: {0}")]
    TaskFailure(String),

    /// The user's callback returned a domain-level rejection. Terminal for
    /// the message.
    #[error("rejected: {reason}")]
    Rejected { reason: String },

    /// The record could not be decoded into a message at all. Terminal for
    /// the record.
    #[error("unusable: {reason}")]
    Unusable { reason: String },

    /// Computed from the host's remaining time; reverses attempts and stops
    /// further progress in the phase.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Anything that leaves the batch not-fully-finalised after finalise.
    /// Re-raising this triggers host redelivery of the same records.
    #[error("replay required: {0}")]
    Replay(String),

    /// A `serde_json` failure encountered while canonicalising or
    /// (de)serializing tracked state.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    pub fn fatal(msg: impl Into<String>) -> Self {
        CoreError::Fatal(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        CoreError::Transient(msg.into())
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        CoreError::Rejected {
            reason: reason.into(),
        }
    }

    pub fn unusable(reason: impl Into<String>) -> Self {
        CoreError::Unusable {
            reason: reason.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::Fatal(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::Transient(_))
    }

    pub fn is_replay_trigger(&self) -> bool {
        matches!(self, CoreError::Replay(_) | CoreError::Fatal(_))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
