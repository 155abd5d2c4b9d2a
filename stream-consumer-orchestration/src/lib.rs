//! Orchestration layer for the stream consumer batch lifecycle engine:
//! the host-facing pieces that sit above [`stream_consumer_shared`]'s
//! pure batch/task/sequencer core — a checkpoint codec, terminal-action
//! handlers, the host runtime surface, and the phase orchestrator that
//! ties all of it together into one invocation.

pub mod checkpoint;
pub mod error;
pub mod host;
pub mod orchestrator;
pub mod terminal_actions;

pub use checkpoint::{CheckpointStore, PersistedBatchCheckpoint};
pub use error::OrchestrationError;
pub use host::{Deadline, HostRuntime};
pub use orchestrator::PhaseOrchestrator;
pub use terminal_actions::{DeadLetterSink, EventSourceControlPlane, TerminalActions};
