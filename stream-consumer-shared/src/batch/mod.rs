//! The batch aggregate: owns every tracked item for one invocation, the
//! task trees attached to each, and the operations the phase orchestrator
//! drives them through.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::callbacks::{self, DigestGenerator, EventCoordinateResolver, MessageIdentityResolver};
use crate::config::ConsumerConfig;
use crate::error::{CoreError, Result};
use crate::identifiers::{Digests, EventCoordinates, MessageIdentity};
use crate::task::{self, ReviveMode, TaskHandle, TaskMap, TaskSnapshot, TaskTemplate};

/// Opaque identifier for anything tracked in a [`Batch`]. Fresh every
/// invocation (never persisted as-is) — the checkpoint codec matches
/// persisted items back onto freshly-assigned ids by content ("big fat
/// key" matching), not by equality of this id across invocations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemId(String);

impl ItemId {
    pub fn new() -> Self {
        ItemId(Uuid::new_v4().to_string())
    }

    /// The fixed id under which the batch's own [`BatchState`] lives in
    /// [`Batch`]'s state map.
    pub fn batch_self() -> Self {
        ItemId("__batch__".to_string())
    }

    pub fn new_for_test(label: &str) -> Self {
        ItemId(label.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies which batch this invocation is processing: a consumer id
/// plus the shard (Kinesis) or partition key (DynamoDB Streams) the
/// records came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchKey {
    pub consumer_id: String,
    pub shard_or_partition_id: String,
}

impl std::fmt::Display for BatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.consumer_id, self.shard_or_partition_id)
    }
}

/// Tracked state for one successfully extracted message.
#[derive(Debug)]
pub struct MessageState {
    pub id: ItemId,
    pub message: Value,
    pub record: Option<Value>,
    pub user_record: Option<Value>,
    pub identity: MessageIdentity,
    pub digests: Digests,
    pub coords: EventCoordinates,
    pub ones: TaskMap,
    pub alls: TaskMap,
    pub discards: TaskMap,
    pub prev_message: Option<ItemId>,
    pub next_message: Option<ItemId>,
    pub reason_rejected: Option<String>,
    pub revision: u64,
}

/// Tracked state for a record that could not be turned into a message.
#[derive(Debug)]
pub struct UnusableRecordState {
    pub id: ItemId,
    pub record: Option<Value>,
    pub user_record: Option<Value>,
    pub coords: Option<EventCoordinates>,
    pub digests: Digests,
    pub reason_unusable: String,
    pub discards: TaskMap,
    pub revision: u64,
}

/// Tracked state for the batch itself: the phase tasks and the master
/// "process all" tasks mirrored onto every message.
#[derive(Debug, Default)]
pub struct BatchState {
    pub alls: TaskMap,
    pub initiating: TaskMap,
    pub processing: TaskMap,
    pub finalising: TaskMap,
    pub revision: u64,
}

#[derive(Debug)]
pub enum TrackedState {
    Message(MessageState),
    UnusableRecord(UnusableRecordState),
    BatchSelf(BatchState),
}

/// The catalog of task templates the host configures the batch with.
/// `process_one`/`process_all` are instantiated per message;
/// `discard_unusable`/`discard_rejected` per discarded item;
/// `initiating`/`processing`/`finalising` once, at the batch level.
#[derive(Default)]
pub struct TaskDefs {
    pub process_one: Vec<TaskTemplate>,
    pub process_all: Vec<TaskTemplate>,
    pub discard_unusable: Option<TaskTemplate>,
    pub discard_rejected: Option<TaskTemplate>,
    pub initiating: Option<TaskTemplate>,
    pub processing: Option<TaskTemplate>,
    pub finalising: Option<TaskTemplate>,
}

/// Where [`Batch::add_message`] routed an input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Message(ItemId),
    Rejected(ItemId),
    Unusable(ItemId),
}

/// Per-item overlay of persisted task snapshots, already matched onto the
/// batch's current (freshly-assigned) item ids by the checkpoint codec.
#[derive(Debug, Clone, Default)]
pub struct ItemSnapshotOverlay {
    pub ones: HashMap<String, TaskSnapshot>,
    pub alls: HashMap<String, TaskSnapshot>,
    pub discards: HashMap<String, TaskSnapshot>,
}

/// Persisted batch-level task snapshots, matched by name.
#[derive(Debug, Clone, Default)]
pub struct BatchSnapshotOverlay {
    pub alls: HashMap<String, TaskSnapshot>,
    pub initiating: HashMap<String, TaskSnapshot>,
    pub processing: HashMap<String, TaskSnapshot>,
    pub finalising: HashMap<String, TaskSnapshot>,
}

/// The full set of persisted snapshots relevant to this invocation, ready
/// for [`Batch::revive_tasks`] to overlay.
#[derive(Debug, Clone, Default)]
pub struct RestoredOverlay {
    pub items: HashMap<ItemId, ItemSnapshotOverlay>,
    pub batch: BatchSnapshotOverlay,
}

/// A summary of where the batch stands, used for logging and for the
/// final per-invocation report.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSummary {
    pub messages_total: usize,
    pub messages_finalised: usize,
    pub unusable_records_total: usize,
    pub unusable_records_finalised: usize,
    pub rejected_messages_total: usize,
    pub fully_finalised: bool,
}

pub struct Batch {
    pub key: BatchKey,
    pub messages: Vec<ItemId>,
    pub rejected_messages: Vec<ItemId>,
    pub unusable_records: Vec<ItemId>,
    pub first_messages_to_process: Vec<ItemId>,
    /// `None` means unknown — the checkpoint has never been confirmed to
    /// exist, so the next save should attempt an insert rather than an
    /// unconditional overwrite. Never itself persisted.
    pub previously_saved: Option<bool>,
    states: HashMap<ItemId, TrackedState>,
    task_defs: TaskDefs,
    digest_generator: Arc<dyn DigestGenerator>,
    coord_resolver: Arc<dyn EventCoordinateResolver>,
    identity_resolver: Arc<dyn MessageIdentityResolver>,
    max_number_of_attempts: u32,
}

impl Batch {
    pub fn new(
        key: BatchKey,
        config: &ConsumerConfig,
        digest_generator: Arc<dyn DigestGenerator>,
        coord_resolver: Arc<dyn EventCoordinateResolver>,
        identity_resolver: Arc<dyn MessageIdentityResolver>,
    ) -> Self {
        let mut states = HashMap::new();
        states.insert(ItemId::batch_self(), TrackedState::BatchSelf(BatchState::default()));
        Batch {
            key,
            messages: Vec::new(),
            rejected_messages: Vec::new(),
            unusable_records: Vec::new(),
            first_messages_to_process: Vec::new(),
            previously_saved: None,
            states,
            task_defs: TaskDefs::default(),
            digest_generator,
            coord_resolver,
            identity_resolver,
            max_number_of_attempts: config.max_number_of_attempts,
        }
    }

    pub fn define_process_tasks(&mut self, process_one: Vec<TaskTemplate>, process_all: Vec<TaskTemplate>) {
        self.task_defs.process_one = process_one;
        self.task_defs.process_all = process_all;
    }

    pub fn define_phase_tasks(&mut self, initiating: TaskTemplate, processing: TaskTemplate, finalising: TaskTemplate) {
        self.task_defs.initiating = Some(initiating);
        self.task_defs.processing = Some(processing);
        self.task_defs.finalising = Some(finalising);
    }

    /// Stores the templates used when discarding unusable records and
    /// rejected messages. Required before `discard_unusable_records` /
    /// `discard_rejected_messages` can do anything but error.
    pub fn define_discard_tasks(&mut self, discard_unusable: TaskTemplate, discard_rejected: TaskTemplate) -> Result<()> {
        if discard_unusable.name.trim().is_empty() || discard_rejected.name.trim().is_empty() {
            return Err(CoreError::fatal("discard task templates must have a non-blank name"));
        }
        self.task_defs.discard_unusable = Some(discard_unusable);
        self.task_defs.discard_rejected = Some(discard_rejected);
        Ok(())
    }

    fn build_ones(&self, id: &ItemId) -> TaskMap {
        self.task_defs
            .process_one
            .iter()
            .map(|t| (t.name.clone(), t.build(id.clone())))
            .collect()
    }

    /// Runs a one-to-many [`crate::callbacks::MessageExtractor`] over a
    /// record and files every extracted message via [`Batch::add_message`].
    /// A record the extractor rejects outright (`Err`) is filed as a single
    /// unusable record; an extractor that returns zero messages produces no
    /// tracked state at all, matching the "zero or more" contract.
    pub fn ingest_record(
        &mut self,
        extractor: &dyn crate::callbacks::MessageExtractor,
        record: Value,
        user_record: Option<Value>,
    ) -> Result<Vec<AddOutcome>> {
        let messages = match extractor.extract_messages(&record) {
            Ok(messages) => messages,
            Err(err) => {
                let outcome = self.add_unusable_record(
                    Some(record),
                    user_record,
                    format!("message extraction failed: {err}"),
                )?;
                return Ok(vec![outcome]);
            }
        };
        messages
            .into_iter()
            .map(|message| self.add_message(Some(message), Some(record.clone()), user_record.clone()))
            .collect()
    }

    /// Runs a one-to-one [`crate::callbacks::SingleMessageExtractor`] over a
    /// record and files the result via [`Batch::add_message`]. `None` from
    /// the extractor files the record as unusable, same as passing `None`
    /// directly to `add_message`.
    pub fn ingest_record_single(
        &mut self,
        extractor: &dyn crate::callbacks::SingleMessageExtractor,
        record: Value,
        user_record: Option<Value>,
    ) -> Result<AddOutcome> {
        match extractor.extract_message(&record) {
            Ok(message) => self.add_message(message, Some(record), user_record),
            Err(err) => self.add_unusable_record(
                Some(record),
                user_record,
                format!("message extraction failed: {err}"),
            ),
        }
    }

    /// Extracts digests, event coordinates and message identity for a
    /// (message, record, user record) triple and files the result into
    /// `messages` or `rejected_messages`. A record/message that could not
    /// be produced at all routes through [`Batch::add_unusable_record`]
    /// instead.
    pub fn add_message(
        &mut self,
        maybe_message: Option<Value>,
        record: Option<Value>,
        user_record: Option<Value>,
    ) -> Result<AddOutcome> {
        let record_value = match record.clone() {
            Some(r) => r,
            None => return self.add_unusable_record(None, user_record, "no record supplied".to_string()),
        };
        let message = match maybe_message {
            Some(m) => m,
            None => {
                return self.add_unusable_record(
                    record,
                    user_record,
                    "no message could be extracted from record".to_string(),
                )
            }
        };

        let digests = self
            .digest_generator
            .generate(Some(&message), Some(&record_value), user_record.as_ref())?;

        let coords = match self.coord_resolver.resolve(&record_value, user_record.as_ref()) {
            Ok(c) => c,
            Err(_) => {
                return self.add_unusable_record(
                    record,
                    user_record,
                    "could not resolve event coordinates".to_string(),
                )
            }
        };

        let id = ItemId::new();
        let resolved = self
            .identity_resolver
            .resolve(&message, &record_value, user_record.as_ref(), &coords, &digests);

        match resolved {
            Ok((ids, keys, seq_nos)) => {
                let identity = callbacks::build_identity(ids, keys, seq_nos, &coords);
                let state = MessageState {
                    id: id.clone(),
                    ones: self.build_ones(&id),
                    message,
                    record: Some(record_value),
                    user_record,
                    identity,
                    digests,
                    coords,
                    alls: HashMap::new(),
                    discards: HashMap::new(),
                    prev_message: None,
                    next_message: None,
                    reason_rejected: None,
                    revision: 0,
                };
                self.states.insert(id.clone(), TrackedState::Message(state));
                self.messages.push(id.clone());
                Ok(AddOutcome::Message(id))
            }
            Err(e) => {
                let state = MessageState {
                    id: id.clone(),
                    ones: HashMap::new(),
                    message,
                    record: Some(record_value),
                    user_record,
                    identity: callbacks::build_identity(Vec::new(), Vec::new(), Vec::new(), &coords),
                    digests,
                    coords,
                    alls: HashMap::new(),
                    discards: HashMap::new(),
                    prev_message: None,
                    next_message: None,
                    reason_rejected: Some(e.to_string()),
                    revision: 0,
                };
                self.states.insert(id.clone(), TrackedState::Message(state));
                self.rejected_messages.push(id.clone());
                Ok(AddOutcome::Rejected(id))
            }
        }
    }

    pub fn add_unusable_record(
        &mut self,
        record: Option<Value>,
        user_record: Option<Value>,
        reason: String,
    ) -> Result<AddOutcome> {
        let digests = self
            .digest_generator
            .generate(None, record.as_ref(), user_record.as_ref())
            .unwrap_or_default();
        let coords = record
            .as_ref()
            .and_then(|r| self.coord_resolver.resolve(r, user_record.as_ref()).ok());
        let id = ItemId::new();
        let state = UnusableRecordState {
            id: id.clone(),
            record,
            user_record,
            coords,
            digests,
            reason_unusable: reason,
            discards: HashMap::new(),
            revision: 0,
        };
        self.states.insert(id.clone(), TrackedState::UnusableRecord(state));
        self.unusable_records.push(id.clone());
        Ok(AddOutcome::Unusable(id))
    }

    pub fn message_state(&self, id: &ItemId) -> Option<&MessageState> {
        match self.states.get(id) {
            Some(TrackedState::Message(m)) => Some(m),
            _ => None,
        }
    }

    pub fn message_state_mut(&mut self, id: &ItemId) -> Option<&mut MessageState> {
        match self.states.get_mut(id) {
            Some(TrackedState::Message(m)) => Some(m),
            _ => None,
        }
    }

    pub fn unusable_state(&self, id: &ItemId) -> Option<&UnusableRecordState> {
        match self.states.get(id) {
            Some(TrackedState::UnusableRecord(u)) => Some(u),
            _ => None,
        }
    }

    pub fn batch_state(&self) -> &BatchState {
        match self.states.get(&ItemId::batch_self()) {
            Some(TrackedState::BatchSelf(b)) => b,
            _ => unreachable!("batch self state is always present"),
        }
    }

    pub fn batch_state_mut(&mut self) -> &mut BatchState {
        match self.states.get_mut(&ItemId::batch_self()) {
            Some(TrackedState::BatchSelf(b)) => b,
            _ => unreachable!("batch self state is always present"),
        }
    }

    /// Links same-key messages into chains via [`crate::sequencer`] and
    /// computes `first_messages_to_process`. Call once, after all inputs
    /// for the invocation have been added.
    pub fn link_messages(&mut self, per_key: bool) -> Result<()> {
        use crate::sequencer::{link_chains, SequenceItem, SortKind, SortPart};

        let mut items = Vec::with_capacity(self.messages.len());
        for id in &self.messages {
            let state = self.message_state(id).expect("tracked message");
            let key = if per_key {
                state.identity.key.clone()
            } else {
                String::new()
            };
            let parts = if state.identity.seq_nos.is_empty() {
                vec![SortPart {
                    name: "eventSeqNo".to_string(),
                    kind: SortKind::normalize(&Value::String(state.coords.event_seq_no.clone()))?,
                }]
            } else {
                state
                    .identity
                    .seq_nos
                    .iter()
                    .map(|(name, value)| {
                        Ok(SortPart {
                            name: name.clone(),
                            kind: SortKind::normalize(value)?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?
            };
            items.push(SequenceItem {
                id: id.clone(),
                key,
                parts,
            });
        }

        let chains = link_chains(items)?;
        for (id, prev) in &chains.prev {
            if let Some(state) = self.message_state_mut(id) {
                state.prev_message = Some(prev.clone());
            }
        }
        for (id, next) in &chains.next {
            if let Some(state) = self.message_state_mut(id) {
                state.next_message = Some(next.clone());
            }
        }
        self.first_messages_to_process = chains.heads;
        Ok(())
    }

    /// Builds the batch-level master "process all" tasks and wires every
    /// message's per-name slave entry as a mirror target. Safe to call on
    /// a batch with no prior persisted state (fresh build) — for a revived
    /// batch use [`Batch::revive_tasks`] instead.
    pub async fn materialize_process_all(&mut self) {
        let templates = self.task_defs.process_all.clone();
        let message_ids = self.messages.clone();
        for template in &templates {
            let master = template.build(ItemId::batch_self());
            let mut slave_handles = Vec::with_capacity(message_ids.len());
            for msg_id in &message_ids {
                let slave = template.build(msg_id.clone());
                if let Some(state) = self.message_state_mut(msg_id) {
                    state.alls.insert(template.name.clone(), slave.clone());
                }
                slave_handles.push(slave);
            }
            master.lock().await.slaves = slave_handles;
            let batch_state = self.batch_state_mut();
            batch_state.alls.insert(template.name.clone(), master);
            batch_state.revision += 1;
        }
    }

    /// Builds the batch-level phase-boundary tasks (initiating/processing/
    /// finalising) fresh. A no-op for any phase the host left undefined via
    /// [`Batch::define_phase_tasks`]. Counterpart to
    /// [`Batch::materialize_process_all`] for a batch with no prior
    /// checkpoint — a revived batch gets these from [`Batch::revive_tasks`]
    /// instead.
    pub async fn materialize_phase_tasks(&mut self) {
        if let Some(template) = self.task_defs.initiating.clone() {
            let handle = template.build(ItemId::batch_self());
            let batch_state = self.batch_state_mut();
            batch_state.initiating.insert(template.name, handle);
            batch_state.revision += 1;
        }
        if let Some(template) = self.task_defs.processing.clone() {
            let handle = template.build(ItemId::batch_self());
            let batch_state = self.batch_state_mut();
            batch_state.processing.insert(template.name, handle);
            batch_state.revision += 1;
        }
        if let Some(template) = self.task_defs.finalising.clone() {
            let handle = template.build(ItemId::batch_self());
            let batch_state = self.batch_state_mut();
            batch_state.finalising.insert(template.name, handle);
            batch_state.revision += 1;
        }
    }

    /// Revives every task map (ones/alls/discards, and the batch-level
    /// phase + alls trees) from a [`RestoredOverlay`], then re-wires the
    /// alls master/slave links using the revived handles. Items present in
    /// the current batch but absent from the overlay build fresh task
    /// trees, matching first-invocation behaviour for newly-arrived items
    /// within an otherwise-continuing batch.
    pub async fn revive_tasks(&mut self, overlay: &RestoredOverlay) -> Result<()> {
        let process_one = self.task_defs.process_one.clone();
        let process_all = self.task_defs.process_all.clone();
        let discard_unusable = self.task_defs.discard_unusable.clone();
        let discard_rejected = self.task_defs.discard_rejected.clone();

        for msg_id in self.messages.clone().into_iter().chain(self.rejected_messages.clone()) {
            let item_overlay = overlay.items.get(&msg_id);
            let ones = build_map_from_templates(&process_one, &msg_id, item_overlay.map(|o| &o.ones));
            if let Some(state) = self.message_state_mut(&msg_id) {
                state.ones = ones;
                state.revision += 1;
            }
            if let Some(template) = &discard_rejected {
                let snap = item_overlay.and_then(|o| o.discards.get(&template.name));
                if let Some(handle) = template.revive(msg_id.clone(), snap, ReviveMode::CreateMissing) {
                    if let Some(state) = self.message_state_mut(&msg_id) {
                        state.discards.insert(template.name.clone(), handle);
                        state.revision += 1;
                    }
                }
            }
        }

        for rec_id in self.unusable_records.clone() {
            let item_overlay = overlay.items.get(&rec_id);
            if let Some(template) = &discard_unusable {
                let snap = item_overlay.and_then(|o| o.discards.get(&template.name));
                if let Some(handle) = template.revive(rec_id.clone(), snap, ReviveMode::CreateMissing) {
                    if let Some(TrackedState::UnusableRecord(state)) = self.states.get_mut(&rec_id) {
                        state.discards.insert(template.name.clone(), handle);
                        state.revision += 1;
                    }
                }
            }
        }

        for template in &process_all {
            let mut slave_handles = Vec::with_capacity(self.messages.len());
            for msg_id in self.messages.clone() {
                let item_overlay = overlay.items.get(&msg_id);
                let snap = item_overlay.and_then(|o| o.alls.get(&template.name));
                let handle = template
                    .revive(msg_id.clone(), snap, ReviveMode::CreateMissing)
                    .expect("CreateMissing always yields a handle");
                if let Some(state) = self.message_state_mut(&msg_id) {
                    state.alls.insert(template.name.clone(), handle.clone());
                    state.revision += 1;
                }
                slave_handles.push(handle);
            }
            let master_snap = overlay.batch.alls.get(&template.name);
            let master = template
                .revive(ItemId::batch_self(), master_snap, ReviveMode::CreateMissing)
                .expect("CreateMissing always yields a handle");
            master.lock().await.slaves = slave_handles;
            let batch_state = self.batch_state_mut();
            batch_state.alls.insert(template.name.clone(), master);
            batch_state.revision += 1;
        }

        if let Some(template) = &self.task_defs.initiating {
            let snap = overlay.batch.initiating.get(&template.name);
            let handle = template.revive(ItemId::batch_self(), snap, ReviveMode::CreateMissing).unwrap();
            let batch_state = self.batch_state_mut();
            batch_state.initiating.insert(template.name.clone(), handle);
            batch_state.revision += 1;
        }
        if let Some(template) = &self.task_defs.processing {
            let snap = overlay.batch.processing.get(&template.name);
            let handle = template.revive(ItemId::batch_self(), snap, ReviveMode::CreateMissing).unwrap();
            let batch_state = self.batch_state_mut();
            batch_state.processing.insert(template.name.clone(), handle);
            batch_state.revision += 1;
        }
        if let Some(template) = &self.task_defs.finalising {
            let snap = overlay.batch.finalising.get(&template.name);
            let handle = template.revive(ItemId::batch_self(), snap, ReviveMode::CreateMissing).unwrap();
            let batch_state = self.batch_state_mut();
            batch_state.finalising.insert(template.name.clone(), handle);
            batch_state.revision += 1;
        }

        Ok(())
    }

    /// Routes every unusable record through the discard-unusable task
    /// (fire-and-forget with respect to this call — the caller drives the
    /// returned handles to completion as part of the finalise phase).
    pub fn discard_unusable_records(&mut self) -> Result<Vec<TaskHandle>> {
        let template = self
            .task_defs
            .discard_unusable
            .clone()
            .ok_or_else(|| CoreError::fatal("discard-unusable task template not defined"))?;
        let mut handles = Vec::new();
        for rec_id in self.unusable_records.clone() {
            if let Some(TrackedState::UnusableRecord(state)) = self.states.get_mut(&rec_id) {
                let is_new = !state.discards.contains_key(&template.name);
                let handle = state
                    .discards
                    .entry(template.name.clone())
                    .or_insert_with(|| template.build(rec_id.clone()))
                    .clone();
                if is_new {
                    state.revision += 1;
                }
                handles.push(handle);
            }
        }
        Ok(handles)
    }

    pub fn discard_rejected_messages(&mut self) -> Result<Vec<TaskHandle>> {
        let template = self
            .task_defs
            .discard_rejected
            .clone()
            .ok_or_else(|| CoreError::fatal("discard-rejected task template not defined"))?;
        let mut handles = Vec::new();
        for msg_id in self.rejected_messages.clone() {
            if let Some(state) = self.message_state_mut(&msg_id) {
                let is_new = !state.discards.contains_key(&template.name);
                let handle = state
                    .discards
                    .entry(template.name.clone())
                    .or_insert_with(|| template.build(msg_id.clone()))
                    .clone();
                if is_new {
                    state.revision += 1;
                }
                handles.push(handle);
            }
        }
        Ok(handles)
    }

    /// All "processing"-phase task handles currently tracked: every
    /// message's `ones` and `alls` slave entries, plus the batch-level
    /// `alls` masters.
    fn processing_task_handles(&self) -> Vec<TaskHandle> {
        let mut handles = Vec::new();
        for id in &self.messages {
            if let Some(state) = self.message_state(id) {
                handles.extend(state.ones.values().cloned());
                handles.extend(state.alls.values().cloned());
            }
        }
        handles.extend(self.batch_state().alls.values().cloned());
        handles
    }

    /// All "finalising"-phase task handles: every message's (including
    /// rejected messages') and unusable record's `discards` map entries.
    fn finalising_task_handles(&self) -> Vec<TaskHandle> {
        let mut handles = Vec::new();
        for id in self.messages.iter().chain(self.rejected_messages.iter()) {
            if let Some(state) = self.message_state(id) {
                handles.extend(state.discards.values().cloned());
            }
        }
        for id in &self.unusable_records {
            if let Some(TrackedState::UnusableRecord(state)) = self.states.get(id) {
                handles.extend(state.discards.values().cloned());
            }
        }
        handles
    }

    /// Discard tasks are never mirrored, so every handle returned by
    /// [`Batch::finalising_task_handles`] is safe to drive directly.
    fn drivable_finalising_handles(&self) -> Vec<TaskHandle> {
        self.finalising_task_handles()
    }

    /// Runs one round of progress across every drivable processing task.
    /// Walks each per-key chain from its head (`firstMessagesToProcess`)
    /// forward through `nextMessage`, driving one message's `ones` tasks
    /// to completion before moving on to the next — so a chain of already-
    /// ready messages cascades fully finalised within a single invocation,
    /// but a message never starts before its predecessor is fully
    /// finalised (the per-key ordering invariant). A message whose `ones`
    /// tasks are not yet all terminal after this round stops the walk down
    /// its chain; later messages in that chain wait for a later invocation.
    pub async fn drive_processing(&self) -> Result<()> {
        for head in self.first_messages_to_process.clone() {
            let mut current = Some(head);
            while let Some(id) = current {
                let Some(state) = self.message_state(&id) else {
                    break;
                };
                for handle in state.ones.values() {
                    task::drive_to_progress(handle).await?;
                }
                let mut fully_finalised = true;
                for handle in state.ones.values() {
                    if !handle.lock().await.is_fully_finalised().await {
                        fully_finalised = false;
                        break;
                    }
                }
                current = if fully_finalised { state.next_message.clone() } else { None };
            }
        }
        for handle in self.batch_state().alls.values() {
            task::drive_to_progress(handle).await?;
        }
        Ok(())
    }

    /// Runs one round of progress across every discard task.
    pub async fn drive_finalising(&self) -> Result<()> {
        for handle in self.drivable_finalising_handles() {
            task::drive_to_progress(&handle).await?;
        }
        Ok(())
    }

    async fn discard_if_over_attempted_many(&self, handles: Vec<TaskHandle>) -> usize {
        let mut discarded = 0;
        for handle in handles {
            let mut task = handle.lock().await;
            if task.discard_if_over_attempted(self.max_number_of_attempts, true).await {
                discarded += 1;
            }
        }
        discarded
    }

    pub async fn discard_processing_tasks_if_over_attempted(&self) -> usize {
        self.discard_if_over_attempted_many(self.processing_task_handles()).await
    }

    /// Moves any message whose process-one tasks include a discarded
    /// (over-attempted) task out of `messages` and into `rejectedMessages`,
    /// so the finalise phase routes it through discard-rejected to the
    /// dead-message stream instead of treating it as processed. Call after
    /// [`Batch::discard_processing_tasks_if_over_attempted`]. Idempotent —
    /// a message already moved is simply absent from `messages` on the
    /// next call.
    pub async fn reject_over_attempted_messages(&mut self) -> usize {
        let mut newly_rejected = Vec::new();
        for id in &self.messages {
            if let Some(state) = self.message_state(id) {
                let mut any_discarded = false;
                for handle in state.ones.values() {
                    if handle.lock().await.state == task::TaskState::Discarded {
                        any_discarded = true;
                        break;
                    }
                }
                if any_discarded {
                    newly_rejected.push(id.clone());
                }
            }
        }
        for id in &newly_rejected {
            self.messages.retain(|m| m != id);
            self.rejected_messages.push(id.clone());
            if let Some(state) = self.message_state_mut(id) {
                if state.reason_rejected.is_none() {
                    state.reason_rejected =
                        Some("process-one task discarded after exceeding max attempts".to_string());
                }
                state.revision += 1;
            }
        }
        newly_rejected.len()
    }

    pub async fn discard_finalising_tasks_if_over_attempted(&self) -> usize {
        self.discard_if_over_attempted_many(self.finalising_task_handles()).await
    }

    /// Groups of task handles that share a root: one group per message's
    /// `ones` + `alls` entries (that item's own task tree), plus one group
    /// for the batch-level `alls` masters (the batch itself is their
    /// root). A handle only abandons as dead once every *other* handle in
    /// its group has reached finality — that is this engine's
    /// operationalisation of "its root is fully finalised or unusable",
    /// since individual tasks have no parent/root pointer of their own.
    fn processing_task_groups(&self) -> Vec<Vec<TaskHandle>> {
        let mut groups = Vec::new();
        for id in &self.messages {
            if let Some(state) = self.message_state(id) {
                let mut group: Vec<TaskHandle> = state.ones.values().cloned().collect();
                group.extend(state.alls.values().cloned());
                if !group.is_empty() {
                    groups.push(group);
                }
            }
        }
        let batch_alls: Vec<TaskHandle> = self.batch_state().alls.values().cloned().collect();
        if !batch_alls.is_empty() {
            groups.push(batch_alls);
        }
        groups
    }

    /// Groups of finalising-phase handles that share a root: one group per
    /// message's (or rejected message's) `discards` entries, and one per
    /// unusable record's `discards` entries.
    fn finalising_task_groups(&self) -> Vec<Vec<TaskHandle>> {
        let mut groups = Vec::new();
        for id in self.messages.iter().chain(self.rejected_messages.iter()) {
            if let Some(state) = self.message_state(id) {
                let group: Vec<TaskHandle> = state.discards.values().cloned().collect();
                if !group.is_empty() {
                    groups.push(group);
                }
            }
        }
        for id in &self.unusable_records {
            if let Some(TrackedState::UnusableRecord(state)) = self.states.get(id) {
                let group: Vec<TaskHandle> = state.discards.values().cloned().collect();
                if !group.is_empty() {
                    groups.push(group);
                }
            }
        }
        groups
    }

    /// Abandons every unstarted-and-frozen handle in `group` whose
    /// siblings (the rest of the group) have all already finalised —
    /// i.e. a dead task whose root is otherwise done can't block that
    /// root from finishing.
    async fn abandon_dead_in_group(&self, group: &[TaskHandle]) -> usize {
        let mut abandoned = 0;
        for (i, handle) in group.iter().enumerate() {
            let mut siblings_done = true;
            for (j, other) in group.iter().enumerate() {
                if i == j {
                    continue;
                }
                if !other.lock().await.is_fully_finalised().await {
                    siblings_done = false;
                    break;
                }
            }
            if !siblings_done {
                continue;
            }
            let mut task = handle.lock().await;
            if task.abandon_if_frozen_and_dead().await {
                abandoned += 1;
            }
        }
        abandoned
    }

    pub async fn abandon_dead_processing_tasks(&self) -> usize {
        let mut abandoned = 0;
        for group in self.processing_task_groups() {
            abandoned += self.abandon_dead_in_group(&group).await;
        }
        abandoned
    }

    pub async fn abandon_dead_finalising_tasks(&self) -> usize {
        let mut abandoned = 0;
        for group in self.finalising_task_groups() {
            abandoned += self.abandon_dead_in_group(&group).await;
        }
        abandoned
    }

    async fn freeze_many(&self, handles: Vec<TaskHandle>) {
        for handle in handles {
            handle.lock().await.freeze().await;
        }
    }

    pub async fn freeze_processing_tasks(&self) {
        self.freeze_many(self.processing_task_handles()).await;
    }

    pub async fn freeze_finalising_tasks(&self) {
        self.freeze_many(self.finalising_task_handles()).await;
    }

    async fn timeout_many(&self, handles: Vec<TaskHandle>, error: &str) {
        for handle in handles {
            let mut task = handle.lock().await;
            let _ = task.timeout(error.to_string()).await;
        }
    }

    pub async fn timeout_processing_tasks(&self, error: &str) {
        self.timeout_many(self.processing_task_handles(), error).await;
    }

    pub async fn timeout_finalising_tasks(&self, error: &str) {
        self.timeout_many(self.finalising_task_handles(), error).await;
    }

    /// True once every message, every unusable record, and the batch-level
    /// `alls` masters have reached a terminal state.
    pub async fn is_fully_finalised(&self) -> bool {
        for handle in self.processing_task_handles() {
            if !handle.lock().await.is_fully_finalised().await {
                return false;
            }
        }
        for handle in self.finalising_task_handles() {
            if !handle.lock().await.is_fully_finalised().await {
                return false;
            }
        }
        true
    }

    pub async fn assess_progress(&self) -> ProgressSummary {
        let mut messages_finalised = 0;
        for id in &self.messages {
            if let Some(state) = self.message_state(id) {
                let mut all_done = true;
                for handle in state.ones.values().chain(state.alls.values()) {
                    if !handle.lock().await.is_fully_finalised().await {
                        all_done = false;
                        break;
                    }
                }
                if all_done {
                    messages_finalised += 1;
                }
            }
        }

        let mut unusable_finalised = 0;
        for id in &self.unusable_records {
            if let Some(TrackedState::UnusableRecord(state)) = self.states.get(id) {
                let mut all_done = true;
                for handle in state.discards.values() {
                    if !handle.lock().await.is_fully_finalised().await {
                        all_done = false;
                        break;
                    }
                }
                if all_done {
                    unusable_finalised += 1;
                }
            }
        }

        ProgressSummary {
            messages_total: self.messages.len(),
            messages_finalised,
            unusable_records_total: self.unusable_records.len(),
            unusable_records_finalised: unusable_finalised,
            rejected_messages_total: self.rejected_messages.len(),
            fully_finalised: self.is_fully_finalised().await,
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "batch[key={}, messages={}, rejected={}, unusable={}]",
            self.key,
            self.messages.len(),
            self.rejected_messages.len(),
            self.unusable_records.len()
        )
    }

    pub async fn summarize_final_results(&self) -> ProgressSummary {
        self.assess_progress().await
    }

    pub fn states(&self) -> &HashMap<ItemId, TrackedState> {
        &self.states
    }
}

fn build_map_from_templates(
    templates: &[TaskTemplate],
    item_id: &ItemId,
    snapshots: Option<&HashMap<String, TaskSnapshot>>,
) -> TaskMap {
    templates
        .iter()
        .map(|t| {
            let snap = snapshots.and_then(|m| m.get(&t.name));
            let handle = t
                .revive(item_id.clone(), snap, ReviveMode::CreateMissing)
                .expect("CreateMissing always yields a handle");
            (t.name.clone(), handle)
        })
        .collect()
}
