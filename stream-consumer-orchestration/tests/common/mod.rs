//! Shared fixtures for the end-to-end lifecycle scenario tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use stream_consumer_orchestration::checkpoint::{CheckpointStore, PersistedBatchCheckpoint};
use stream_consumer_orchestration::error::Result;
use stream_consumer_orchestration::{DeadLetterSink, EventSourceControlPlane, PhaseOrchestrator, TerminalActions};
use stream_consumer_shared::batch::{Batch, BatchKey, ItemId, MessageState, UnusableRecordState};
use stream_consumer_shared::callbacks::{DefaultDigestGenerator, DefaultEventCoordinateResolver, DefaultIdentityResolver};
use stream_consumer_shared::config::ConsumerConfig;
use stream_consumer_shared::task::{ExecuteFactory, ExecuteFn};

/// Captures everything routed to the dead-letter destinations so scenario
/// tests can assert on it directly instead of poking at task state.
#[derive(Default)]
pub struct RecordingDeadLetterSink {
    pub unusable: Mutex<Vec<String>>,
    pub rejected: Mutex<Vec<String>>,
}

#[async_trait]
impl DeadLetterSink for RecordingDeadLetterSink {
    async fn send_unusable_record(&self, _batch_key: &BatchKey, record: &UnusableRecordState) -> Result<()> {
        self.unusable.lock().await.push(record.reason_unusable.clone());
        Ok(())
    }

    async fn send_rejected_message(&self, _batch_key: &BatchKey, message: &MessageState) -> Result<()> {
        self.rejected.lock().await.push(message.identity.description.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct NoopControlPlane;

#[async_trait]
impl EventSourceControlPlane for NoopControlPlane {
    async fn resolve_mapping_id(&self, consumer_id: &str) -> Result<String> {
        Ok(format!("mapping-{consumer_id}"))
    }
    async fn disable_mapping(&self, _mapping_id: &str) -> Result<()> {
        Ok(())
    }
}

/// A [`CheckpointStore`] that reports whether a row already existed the
/// way a conditional-write table would, so the race scenario can assert
/// the second of two concurrent invocations is recognised as an update
/// rather than a fresh insert.
#[derive(Default)]
pub struct VersionedCheckpointStore {
    rows: Mutex<HashMap<String, PersistedBatchCheckpoint>>,
}

#[async_trait]
impl CheckpointStore for VersionedCheckpointStore {
    async fn load(&self, key: &BatchKey) -> Result<Option<PersistedBatchCheckpoint>> {
        let rows = self.rows.lock().await;
        Ok(rows.get(&key.to_string()).cloned())
    }

    async fn save(
        &self,
        key: &BatchKey,
        checkpoint: &PersistedBatchCheckpoint,
        _previously_saved: Option<bool>,
    ) -> Result<bool> {
        let mut rows = self.rows.lock().await;
        let existed = rows.insert(key.to_string(), checkpoint.clone()).is_some();
        Ok(existed)
    }
}

pub fn default_config() -> ConsumerConfig {
    ConsumerConfig::default()
}

pub fn new_batch(key: BatchKey, config: &ConsumerConfig) -> Batch {
    Batch::new(
        key,
        config,
        Arc::new(DefaultDigestGenerator),
        Arc::new(DefaultEventCoordinateResolver),
        Arc::new(DefaultIdentityResolver::new(config)),
    )
}

pub fn orchestrator(checkpoint_store: Arc<dyn CheckpointStore>, sink: Arc<dyn DeadLetterSink>) -> PhaseOrchestrator {
    let terminal_actions = Arc::new(TerminalActions::new(sink, Arc::new(NoopControlPlane), false));
    PhaseOrchestrator::new(checkpoint_store, terminal_actions)
}

/// An execute factory standing in for a host's discard-unusable /
/// discard-rejected task body: reports the item to a recording sink and
/// succeeds. A real host's closure would first look the item's state up
/// (by the `ItemId` it is called with) in its own batch handle and call
/// [`stream_consumer_orchestration::TerminalActions::discard_unusable_record_to_drq`]
/// / `discard_rejected_message_to_dmq`; these tests only need to observe
/// that the discard task ran exactly once per item.
pub fn recording_discard_factory(sink: Arc<RecordingDeadLetterSink>, unusable: bool) -> ExecuteFactory {
    Arc::new(move |id| {
        let sink = sink.clone();
        let f: ExecuteFn = Arc::new(move || {
            let sink = sink.clone();
            let label = id.as_str().to_string();
            Box::pin(async move {
                if unusable {
                    sink.unusable.lock().await.push(label);
                } else {
                    sink.rejected.lock().await.push(label);
                }
                Ok(Value::Null)
            })
        });
        f
    })
}

pub fn always_ok_factory() -> ExecuteFactory {
    Arc::new(|_id| {
        let f: ExecuteFn = Arc::new(|| Box::pin(async { Ok(Value::Null) }));
        f
    })
}

/// An execute factory that fails every attempt, for testing retry
/// exhaustion. Tracks the number of attempts made across every item it is
/// instantiated for (scenario 4 only ever builds one item from it).
pub fn always_fail_factory(attempts: Arc<AtomicU32>) -> ExecuteFactory {
    Arc::new(move |_id| {
        let attempts = attempts.clone();
        let f: ExecuteFn = Arc::new(move || {
            let attempts = attempts.clone();
            Box::pin(async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(stream_consumer_shared::error::CoreError::TaskFailure(
                    "execute callback always throws".to_string(),
                ))
            })
        });
        f
    })
}

/// An execute factory that succeeds every attempt and counts how many
/// times its callback actually ran, for asserting that an already
/// fully-finalised batch invokes no further callbacks.
pub fn counting_ok_factory(attempts: Arc<AtomicU32>) -> ExecuteFactory {
    Arc::new(move |_id| {
        let attempts = attempts.clone();
        let f: ExecuteFn = Arc::new(move || {
            let attempts = attempts.clone();
            Box::pin(async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            })
        });
        f
    })
}

/// An execute factory whose callback sleeps past a short deadline once,
/// then completes instantly on every later attempt — models scenario 5's
/// "resumes and completes on the next invocation" behaviour using a flag
/// rather than timing a real clock twice.
pub fn sleep_once_then_ok_factory(sleep_ms: u64) -> ExecuteFactory {
    let first_attempt = Arc::new(std::sync::atomic::AtomicBool::new(true));
    Arc::new(move |_id| {
        let first_attempt = first_attempt.clone();
        let f: ExecuteFn = Arc::new(move || {
            let first_attempt = first_attempt.clone();
            Box::pin(async move {
                if first_attempt.swap(false, Ordering::SeqCst) {
                    tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
                }
                Ok(Value::Null)
            })
        });
        f
    })
}
