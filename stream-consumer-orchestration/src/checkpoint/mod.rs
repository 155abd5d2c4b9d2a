//! The checkpoint codec: serializes a [`Batch`]'s task state for
//! persistence and restores it into a freshly-built batch on the next
//! invocation.
//!
//! Item ids are not stable across invocations (see
//! [`stream_consumer_shared::batch::ItemId`]), so matching a persisted
//! per-item record back onto the batch's freshly-assigned ids is done by
//! a "big fat key" (BFK): the message's resolved identity id when
//! present, falling back to its content digest, falling back to its event
//! coordinates. Whichever of the three is available and stable is enough
//! to re-associate prior task progress with the same logical item.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use stream_consumer_shared::batch::{
    Batch, BatchKey, ItemSnapshotOverlay, MessageState, RestoredOverlay, TrackedState,
    UnusableRecordState,
};
use stream_consumer_shared::task::TaskSnapshot;

use crate::error::Result;

/// One item's persisted task snapshots, addressed by [`Bfk`] rather than
/// by the [`stream_consumer_shared::batch::ItemId`] it had when saved.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersistedItem {
    pub bfk: String,
    pub ones: HashMap<String, TaskSnapshot>,
    pub alls: HashMap<String, TaskSnapshot>,
    pub discards: HashMap<String, TaskSnapshot>,
}

/// Everything persisted for one batch between invocations.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersistedBatchCheckpoint {
    pub items: Vec<PersistedItem>,
    pub batch_alls: HashMap<String, TaskSnapshot>,
    pub batch_initiating: HashMap<String, TaskSnapshot>,
    pub batch_processing: HashMap<String, TaskSnapshot>,
    pub batch_finalising: HashMap<String, TaskSnapshot>,
}

/// The external collaborator that actually stores checkpoints (a
/// DynamoDB table, in the AWS-flavoured deployment this engine's
/// vocabulary comes from). `save` reports whether a row already existed,
/// letting the caller fold the result back into `Batch::previously_saved`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, key: &BatchKey) -> Result<Option<PersistedBatchCheckpoint>>;

    async fn save(
        &self,
        key: &BatchKey,
        checkpoint: &PersistedBatchCheckpoint,
        previously_saved: Option<bool>,
    ) -> Result<bool>;
}

/// Computes the big fat key for a message: identity id, else content
/// digest, else event coordinates.
pub fn bfk_for_message(state: &MessageState) -> String {
    if !state.identity.id.is_empty() {
        format!("id:{}", state.identity.id)
    } else if let Some(digest) = &state.digests.msg {
        format!("digest:{digest}")
    } else {
        format!(
            "coords:{}/{}",
            state.coords.event_id, state.coords.event_seq_no
        )
    }
}

/// Computes the big fat key for an unusable record: content digest, else
/// event coordinates, else a constant that never matches (nothing
/// meaningful to key on, so it never restores task progress — proceeds as
/// new on every invocation, logged at warn level by the caller).
pub fn bfk_for_unusable(state: &UnusableRecordState) -> String {
    if let Some(digest) = &state.digests.rec {
        format!("digest:{digest}")
    } else if let Some(coords) = &state.coords {
        format!("coords:{}/{}", coords.event_id, coords.event_seq_no)
    } else {
        "unmatched".to_string()
    }
}

/// Snapshots every task map currently attached to the batch into a
/// [`PersistedBatchCheckpoint`], ready to hand to a [`CheckpointStore`].
pub async fn serialize(batch: &Batch) -> PersistedBatchCheckpoint {
    let mut items = Vec::new();

    for id in &batch.messages {
        if let Some(state) = batch.message_state(id) {
            items.push(PersistedItem {
                bfk: bfk_for_message(state),
                ones: snapshot_map(&state.ones).await,
                alls: snapshot_map(&state.alls).await,
                discards: snapshot_map(&state.discards).await,
            });
        }
    }
    for id in &batch.rejected_messages {
        if let Some(state) = batch.message_state(id) {
            items.push(PersistedItem {
                bfk: bfk_for_message(state),
                ones: HashMap::new(),
                alls: HashMap::new(),
                discards: snapshot_map(&state.discards).await,
            });
        }
    }
    for id in &batch.unusable_records {
        if let Some(TrackedState::UnusableRecord(state)) = batch.states().get(id) {
            items.push(PersistedItem {
                bfk: bfk_for_unusable(state),
                ones: HashMap::new(),
                alls: HashMap::new(),
                discards: snapshot_map(&state.discards).await,
            });
        }
    }

    let batch_state = batch.batch_state();
    PersistedBatchCheckpoint {
        items,
        batch_alls: snapshot_map(&batch_state.alls).await,
        batch_initiating: snapshot_map(&batch_state.initiating).await,
        batch_processing: snapshot_map(&batch_state.processing).await,
        batch_finalising: snapshot_map(&batch_state.finalising).await,
    }
}

async fn snapshot_map(
    map: &std::collections::HashMap<String, stream_consumer_shared::task::TaskHandle>,
) -> HashMap<String, TaskSnapshot> {
    let mut out = HashMap::new();
    for (name, handle) in map {
        out.insert(name.clone(), handle.lock().await.snapshot().await);
    }
    out
}

/// Matches a [`PersistedBatchCheckpoint`]'s per-item entries onto the
/// batch's current (freshly-assigned) item ids by BFK, producing the
/// overlay [`Batch::revive_tasks`] consumes. Persisted items with no match
/// in the current batch are dropped with a warning — the record they
/// described is gone from this invocation's input, so its task progress
/// no longer applies to anything.
pub fn restore(batch: &Batch, persisted: &PersistedBatchCheckpoint) -> RestoredOverlay {
    let mut by_bfk: HashMap<String, &PersistedItem> =
        persisted.items.iter().map(|item| (item.bfk.clone(), item)).collect();

    let mut overlay = RestoredOverlay::default();

    for id in batch.messages.iter().chain(batch.rejected_messages.iter()) {
        if let Some(state) = batch.message_state(id) {
            let key = bfk_for_message(state);
            if let Some(item) = by_bfk.remove(&key) {
                overlay.items.insert(
                    id.clone(),
                    ItemSnapshotOverlay {
                        ones: item.ones.clone(),
                        alls: item.alls.clone(),
                        discards: item.discards.clone(),
                    },
                );
            }
        }
    }

    for id in &batch.unusable_records {
        if let Some(TrackedState::UnusableRecord(state)) = batch.states().get(id) {
            let key = bfk_for_unusable(state);
            if let Some(item) = by_bfk.remove(&key) {
                overlay.items.insert(
                    id.clone(),
                    ItemSnapshotOverlay {
                        ones: HashMap::new(),
                        alls: HashMap::new(),
                        discards: item.discards.clone(),
                    },
                );
            }
        }
    }

    if !by_bfk.is_empty() {
        warn!(
            unmatched_items = by_bfk.len(),
            "checkpoint restore: persisted items had no matching current record"
        );
    }

    overlay.batch.alls = persisted.batch_alls.clone();
    overlay.batch.initiating = persisted.batch_initiating.clone();
    overlay.batch.processing = persisted.batch_processing.clone();
    overlay.batch.finalising = persisted.batch_finalising.clone();
    overlay
}

/// An in-memory [`CheckpointStore`] for tests: one slot per [`BatchKey`],
/// with `save` reporting whether a prior checkpoint existed the way a
/// real conditional-write table would.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    rows: tokio::sync::Mutex<HashMap<String, PersistedBatchCheckpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use stream_consumer_shared::callbacks::{
        DefaultDigestGenerator, DefaultEventCoordinateResolver, DefaultIdentityResolver,
    };
    use stream_consumer_shared::config::ConsumerConfig;
    use stream_consumer_shared::task::{TaskState, TaskTemplate};

    fn test_batch() -> Batch {
        let config = ConsumerConfig::default();
        Batch::new(
            BatchKey {
                consumer_id: "c1".into(),
                shard_or_partition_id: "shard-1".into(),
            },
            &config,
            Arc::new(DefaultDigestGenerator),
            Arc::new(DefaultEventCoordinateResolver),
            Arc::new(DefaultIdentityResolver::new(&config)),
        )
    }

    #[tokio::test]
    async fn round_trips_task_progress_across_a_fresh_batch_with_a_new_item_id() {
        let mut batch = test_batch();
        batch.define_process_tasks(vec![TaskTemplate::noop("validate")], vec![]);
        let record = json!({"eventId": "e1", "eventSeqNo": 1});
        let outcome = batch
            .add_message(Some(json!({"orderId": "o-1"})), Some(record), None)
            .unwrap();
        let id = match outcome {
            stream_consumer_shared::batch::AddOutcome::Message(id) => id,
            _ => panic!("expected message"),
        };
        {
            let state = batch.message_state(&id).unwrap();
            let handle = state.ones.get("validate").unwrap().clone();
            handle.lock().await.execute().await.unwrap();
        }
        let checkpoint = serialize(&batch).await;

        // A brand new batch, same logical record, gets a different ItemId.
        let mut next_batch = test_batch();
        next_batch.define_process_tasks(vec![TaskTemplate::noop("validate")], vec![]);
        let record2 = json!({"eventId": "e1", "eventSeqNo": 1});
        next_batch
            .add_message(Some(json!({"orderId": "o-1"})), Some(record2), None)
            .unwrap();

        let overlay = restore(&next_batch, &checkpoint);
        next_batch.revive_tasks(&overlay).await.unwrap();

        let restored_id = next_batch.messages[0].clone();
        let restored_state = next_batch.message_state(&restored_id).unwrap();
        let restored_task = restored_state.ones.get("validate").unwrap();
        assert_eq!(restored_task.lock().await.state, TaskState::Completed);
    }

    #[tokio::test]
    async fn unmatched_persisted_items_are_dropped_without_error() {
        let checkpoint = PersistedBatchCheckpoint {
            items: vec![PersistedItem {
                bfk: "digest:does-not-exist".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let batch = test_batch();
        let overlay = restore(&batch, &checkpoint);
        assert!(overlay.items.is_empty());
    }
}
