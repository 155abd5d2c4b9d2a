//! Shared, I/O-free half of the batch lifecycle engine: identifiers, the
//! sequencer, the task state machine, the batch aggregate, the callback
//! traits hosts implement, and configuration.
//!
//! Everything an external collaborator would need to provide (checkpoint
//! storage, dead-letter sinks, the event-source control plane, the host
//! runtime clock) lives in `stream-consumer-orchestration` instead — this
//! crate only knows how to track state and run the task tree in memory.

pub mod batch;
pub mod callbacks;
pub mod config;
pub mod error;
pub mod identifiers;
pub mod sequencer;
pub mod task;

pub use batch::{Batch, BatchKey, ItemId};
pub use config::ConsumerConfig;
pub use error::CoreError;
