//! The hierarchical task engine: a small, reusable state machine used for
//! every "one" task (per message), every "all" task (per batch, mirrored
//! onto every message), every discard task, and every phase task.
//!
//! A [`TaskTemplate`] tree is a catalog entry: name, an execute-closure
//! factory, and child templates. [`TaskTemplate::build`] instantiates a
//! live [`Task`] tree for a concrete item. Every live task is held behind
//! `Arc<tokio::sync::Mutex<Task>>` so that a master task can hold direct
//! handles to its slaves (mirrored copies living inside other items'
//! task maps) without either side needing a back-pointer to the other.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::batch::ItemId;
use crate::error::{CoreError, Result};

/// A future boxed for storage inside a template/task, not tied to any
/// particular lifetime beyond `'static` — execute closures own everything
/// they need to run (typically an `Arc` to shared batch state and the item
/// id they operate on).
pub type StaticBoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// A future borrowing from `self`, used by the engine's own recursive
/// async methods (`is_fully_finalised`, `freeze`, `snapshot`, ...).
pub type LocalBoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The callback a task runs when executed. Bound to a concrete item id at
/// template-build time by the template's `execute_factory`.
pub type ExecuteFn = Arc<dyn Fn() -> StaticBoxFuture<Result<serde_json::Value>> + Send + Sync>;

/// Builds an [`ExecuteFn`] for a given item. One factory is shared by every
/// instantiation of a template across every item in the batch.
pub type ExecuteFactory = Arc<dyn Fn(ItemId) -> ExecuteFn + Send + Sync>;

/// The lifecycle states a task can occupy. `Unstarted`/`Started`/`Failed`/
/// `TimedOut` are non-terminal (retryable); the rest are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Unstarted,
    Started,
    Completed,
    Failed,
    TimedOut,
    Rejected,
    Discarded,
    Abandoned,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Rejected | TaskState::Discarded | TaskState::Abandoned
        )
    }

    pub fn is_retryable_nonterminal(self) -> bool {
        matches!(
            self,
            TaskState::Unstarted | TaskState::Failed | TaskState::TimedOut
        )
    }
}

/// A transition event applied to a task and mirrored verbatim onto its
/// slaves.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Start,
    Complete(serde_json::Value),
    Fail(String),
    /// `reversible` undoes the attempt increment taken when execution
    /// started, since a timed-out attempt never got to run to completion
    /// and should not count against the retry budget.
    Timeout { error: String, reversible: bool },
    Reject(String),
    Discard,
    Abandon(String),
    Freeze,
}

/// A reusable task descriptor. The same `TaskTemplate` tree is
/// instantiated once per item via [`TaskTemplate::build`].
#[derive(Clone)]
pub struct TaskTemplate {
    pub name: String,
    pub execute_factory: ExecuteFactory,
    pub children: Vec<TaskTemplate>,
    pub max_attempts_override: Option<u32>,
}

impl std::fmt::Debug for TaskTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskTemplate")
            .field("name", &self.name)
            .field("children", &self.children)
            .field("max_attempts_override", &self.max_attempts_override)
            .finish()
    }
}

impl TaskTemplate {
    pub fn new(name: impl Into<String>, execute_factory: ExecuteFactory) -> Self {
        TaskTemplate {
            name: name.into(),
            execute_factory,
            children: Vec::new(),
            max_attempts_override: None,
        }
    }

    pub fn with_children(mut self, children: Vec<TaskTemplate>) -> Self {
        self.children = children;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts_override = Some(max_attempts);
        self
    }

    /// A template whose execute closure never runs — used for mirror-only
    /// slave placeholders and tests.
    pub fn noop(name: impl Into<String>) -> Self {
        let factory: ExecuteFactory = Arc::new(|_id| {
            let f: ExecuteFn = Arc::new(|| Box::pin(async { Ok(serde_json::Value::Null) }));
            f
        });
        TaskTemplate::new(name, factory)
    }

    pub fn build(&self, item_id: ItemId) -> TaskHandle {
        let execute = (self.execute_factory)(item_id.clone());
        let mut task = Task::new(self.name.clone(), execute, self.max_attempts_override);
        for child in &self.children {
            task.children.push(child.build(item_id.clone()));
        }
        Arc::new(Mutex::new(task))
    }

    /// Revives a task tree from a persisted snapshot, or builds fresh when
    /// there is none (or `mode` is [`ReviveMode::OnlyExisting`] and there
    /// is none, in which case `None` is returned and the caller omits the
    /// task entirely).
    pub fn revive(
        &self,
        item_id: ItemId,
        snapshot: Option<&TaskSnapshot>,
        mode: ReviveMode,
    ) -> Option<TaskHandle> {
        match (snapshot, mode) {
            (None, ReviveMode::OnlyExisting) => None,
            (None, ReviveMode::CreateMissing) => Some(self.build(item_id)),
            (Some(snap), _) => {
                let execute = (self.execute_factory)(item_id.clone());
                let mut task = Task::new(self.name.clone(), execute, self.max_attempts_override);
                task.state = snap.state;
                task.attempts = snap.attempts;
                task.last_error = snap.last_error.clone();
                task.frozen = snap.frozen;
                for child_template in &self.children {
                    let child_snap = snap
                        .children
                        .iter()
                        .find(|c| c.name == child_template.name);
                    if let Some(handle) =
                        child_template.revive(item_id.clone(), child_snap, mode)
                    {
                        task.children.push(handle);
                    }
                }
                Some(Arc::new(Mutex::new(task)))
            }
        }
    }
}

/// Whether reviving a template tree should create children absent from the
/// snapshot (a template gained a step since the snapshot was taken) or
/// leave them out (only ever restore tasks that were actually persisted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviveMode {
    CreateMissing,
    OnlyExisting,
}

/// A serializable snapshot of a single task (and its children), persisted
/// by the checkpoint codec and reapplied on revival.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub name: String,
    pub state: TaskState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub frozen: bool,
    pub children: Vec<TaskSnapshot>,
}

pub type TaskHandle = Arc<Mutex<Task>>;
pub type TaskMap = HashMap<String, TaskHandle>;

/// A live task node. Never constructed directly by callers outside this
/// module except via [`Task::new`] for tests — production code goes
/// through [`TaskTemplate::build`]/[`TaskTemplate::revive`].
pub struct Task {
    pub name: String,
    pub state: TaskState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub frozen: bool,
    pub children: Vec<TaskHandle>,
    pub slaves: Vec<TaskHandle>,
    execute: ExecuteFn,
    max_attempts_override: Option<u32>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("attempts", &self.attempts)
            .field("frozen", &self.frozen)
            .field("children", &self.children.len())
            .field("slaves", &self.slaves.len())
            .finish()
    }
}

impl Task {
    pub fn new(name: impl Into<String>, execute: ExecuteFn, max_attempts_override: Option<u32>) -> Self {
        Task {
            name: name.into(),
            state: TaskState::Unstarted,
            attempts: 0,
            last_error: None,
            frozen: false,
            children: Vec::new(),
            slaves: Vec::new(),
            execute,
            max_attempts_override,
        }
    }

    fn effective_max_attempts(&self, configured_max: u32) -> u32 {
        self.max_attempts_override.unwrap_or(configured_max)
    }

    /// Applies an event to this task alone, without mirroring. Used both
    /// by [`Task::transition`] (for `self`) and for applying the already-
    /// mirrored event onto each slave.
    fn apply(&mut self, event: &TaskEvent) {
        if self.frozen {
            return;
        }
        match event {
            TaskEvent::Start => {
                if self.state == TaskState::Unstarted {
                    self.state = TaskState::Started;
                }
            }
            TaskEvent::Complete(_) => {
                self.state = TaskState::Completed;
            }
            TaskEvent::Fail(err) => {
                self.last_error = Some(err.clone());
                self.state = TaskState::Failed;
            }
            TaskEvent::Timeout { error, reversible } => {
                self.last_error = Some(error.clone());
                self.state = TaskState::TimedOut;
                if *reversible && self.attempts > 0 {
                    self.attempts -= 1;
                }
            }
            TaskEvent::Reject(reason) => {
                self.last_error = Some(reason.clone());
                self.state = TaskState::Rejected;
            }
            TaskEvent::Discard => {
                self.state = TaskState::Discarded;
            }
            TaskEvent::Abandon(reason) => {
                self.last_error = Some(reason.clone());
                self.state = TaskState::Abandoned;
            }
            TaskEvent::Freeze => {
                self.frozen = true;
            }
        }
    }

    /// Applies an event to this task and mirrors it onto every slave.
    /// Slaves never mirror further (a slave's own `slaves` list is always
    /// empty in this engine), so there is no risk of an event bouncing
    /// back and forth between master and slave.
    pub fn transition<'a>(&'a mut self, event: TaskEvent) -> LocalBoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.frozen {
                return Err(CoreError::TaskFailure(format!(
                    "task '{}' is frozen",
                    self.name
                )));
            }
            self.apply(&event);
            for slave in self.slaves.clone() {
                let mut guard = slave.lock().await;
                guard.apply(&event);
            }
            Ok(())
        })
    }

    /// Runs the task's execute callback, transitioning through
    /// `Started` -> `Completed`/`Failed`. Counts as one attempt regardless
    /// of outcome (a timeout later reverses it via [`Task::timeout`]).
    pub fn execute<'a>(&'a mut self) -> LocalBoxFuture<'a, Result<serde_json::Value>> {
        Box::pin(async move {
            if self.frozen {
                return Err(CoreError::TaskFailure(format!(
                    "task '{}' is frozen",
                    self.name
                )));
            }
            if self.state.is_terminal() {
                return Err(CoreError::TaskFailure(format!(
                    "task '{}' already reached a terminal state",
                    self.name
                )));
            }
            self.attempts += 1;
            self.transition(TaskEvent::Start).await?;
            let outcome = (self.execute)().await;
            match &outcome {
                Ok(value) => {
                    self.transition(TaskEvent::Complete(value.clone())).await?;
                }
                Err(err) => {
                    self.transition(TaskEvent::Fail(err.to_string())).await?;
                }
            }
            outcome
        })
    }

    pub fn timeout<'a>(&'a mut self, error: impl Into<String> + 'a) -> LocalBoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.state.is_terminal() {
                return Ok(());
            }
            self.transition(TaskEvent::Timeout {
                error: error.into(),
                reversible: true,
            })
            .await
        })
    }

    pub fn reject<'a>(&'a mut self, reason: impl Into<String> + 'a) -> LocalBoxFuture<'a, Result<()>> {
        Box::pin(async move { self.transition(TaskEvent::Reject(reason.into())).await })
    }

    pub fn abandon<'a>(&'a mut self, reason: impl Into<String> + 'a) -> LocalBoxFuture<'a, Result<()>> {
        Box::pin(async move { self.transition(TaskEvent::Abandon(reason.into())).await })
    }

    /// Freezes this task and every descendant (but not slaves directly —
    /// freezing mirrors through `transition` like any other event, and
    /// children are frozen independently since a frozen parent does not
    /// imply a frozen subtree in every caller's intent).
    pub fn freeze<'a>(&'a mut self) -> LocalBoxFuture<'a, ()> {
        Box::pin(async move {
            if self.frozen {
                return;
            }
            let _ = self.transition(TaskEvent::Freeze).await;
            for child in self.children.clone() {
                child.lock().await.freeze().await;
            }
        })
    }

    /// True if this task and every descendant (recursively) are terminal.
    pub fn is_fully_finalised<'a>(&'a self) -> LocalBoxFuture<'a, bool> {
        Box::pin(async move {
            if !self.state.is_terminal() {
                return false;
            }
            for child in &self.children {
                let guard = child.lock().await;
                if !guard.is_fully_finalised().await {
                    return false;
                }
            }
            true
        })
    }

    /// Discards this task if it is non-terminal, retryable, and already at
    /// or beyond `configured_max` attempts. When `only_when_children_finalised`
    /// is set, children must all be terminal first — used for tasks whose
    /// discard should not race an in-flight child.
    pub fn discard_if_over_attempted<'a>(
        &'a mut self,
        configured_max: u32,
        only_when_children_finalised: bool,
    ) -> LocalBoxFuture<'a, bool> {
        Box::pin(async move {
            if !self.state.is_retryable_nonterminal() {
                return false;
            }
            let max = self.effective_max_attempts(configured_max);
            if self.attempts < max {
                return false;
            }
            if only_when_children_finalised {
                for child in &self.children {
                    let guard = child.lock().await;
                    if !guard.is_fully_finalised().await {
                        return false;
                    }
                }
            }
            let _ = self.transition(TaskEvent::Discard).await;
            true
        })
    }

    /// Abandons this task if it never even started and has been frozen — a
    /// frozen, unstarted task can never make further progress, so once the
    /// rest of its item's tree is fully finalised the item has to move on
    /// without it. A task that already started (or already failed/retried)
    /// is left for the normal retry/discard path instead of being abandoned
    /// outright.
    pub fn abandon_if_frozen_and_dead<'a>(&'a mut self) -> LocalBoxFuture<'a, bool> {
        Box::pin(async move {
            if self.state != TaskState::Unstarted || !self.frozen {
                return false;
            }
            self.frozen = false; // lift the freeze so the abandon transition can apply
            let _ = self.abandon("frozen task abandoned as dead").await;
            true
        })
    }

    pub fn snapshot<'a>(&'a self) -> LocalBoxFuture<'a, TaskSnapshot> {
        Box::pin(async move {
            let mut children = Vec::with_capacity(self.children.len());
            for child in &self.children {
                children.push(child.lock().await.snapshot().await);
            }
            TaskSnapshot {
                name: self.name.clone(),
                state: self.state,
                attempts: self.attempts,
                last_error: self.last_error.clone(),
                frozen: self.frozen,
                children,
            }
        })
    }
}

/// Drives one round of progress through a task tree: recurses into
/// children first, and only attempts this task's own execute once every
/// child has reached a terminal state. This is bottom-up fan-in — a task
/// represents work that depends on its subtasks having finished, not an
/// independent unit that races its children.
///
/// Called once per phase per invocation; a task that is not yet ready
/// (children still in flight) simply stays `Unstarted`/non-terminal until
/// a later invocation's round reaches it.
pub fn drive_to_progress<'a>(handle: &'a TaskHandle) -> LocalBoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let children = handle.lock().await.children.clone();
        for child in &children {
            drive_to_progress(child).await?;
        }
        let mut children_ready = true;
        for child in &children {
            if !child.lock().await.is_fully_finalised().await {
                children_ready = false;
                break;
            }
        }
        if children_ready {
            let mut task = handle.lock().await;
            if task.state.is_retryable_nonterminal() && !task.frozen {
                let _ = task.execute().await;
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::ItemId;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    fn counting_factory(counter: Arc<AtomicU32>, fail_until: u32) -> ExecuteFactory {
        Arc::new(move |_id| {
            let counter = counter.clone();
            let f: ExecuteFn = Arc::new(move || {
                let counter = counter.clone();
                Box::pin(async move {
                    let n = counter.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                    if n <= fail_until {
                        Err(CoreError::TaskFailure("not yet".into()))
                    } else {
                        Ok(serde_json::json!({"attempt": n}))
                    }
                })
            });
            f
        })
    }

    #[tokio::test]
    async fn execute_retries_until_configured_cap() {
        let counter = Arc::new(AtomicU32::new(0));
        let template = TaskTemplate::new("step", counting_factory(counter, 2));
        let handle = template.build(ItemId::new_for_test("item-1"));
        {
            let mut task = handle.lock().await;
            assert!(task.execute().await.is_err());
            assert_eq!(task.attempts, 1);
            assert!(task.execute().await.is_err());
            assert_eq!(task.attempts, 2);
            assert!(task.execute().await.is_ok());
            assert_eq!(task.state, TaskState::Completed);
        }
    }

    #[tokio::test]
    async fn timeout_reverses_the_in_flight_attempt() {
        let counter = Arc::new(AtomicU32::new(0));
        let template = TaskTemplate::new("step", counting_factory(counter, 100));
        let handle = template.build(ItemId::new_for_test("item-1"));
        let mut task = handle.lock().await;
        task.attempts = 1;
        task.state = TaskState::Started;
        task.timeout("deadline reached").await.unwrap();
        assert_eq!(task.attempts, 0);
        assert_eq!(task.state, TaskState::TimedOut);
    }

    #[tokio::test]
    async fn master_transition_mirrors_onto_every_slave() {
        let template = TaskTemplate::noop("alls:validate");
        let master = template.build(ItemId::new_for_test("batch"));
        let slave_a = template.build(ItemId::new_for_test("msg-a"));
        let slave_b = template.build(ItemId::new_for_test("msg-b"));
        master.lock().await.slaves = vec![slave_a.clone(), slave_b.clone()];

        master
            .lock()
            .await
            .transition(TaskEvent::Complete(serde_json::Value::Null))
            .await
            .unwrap();

        assert_eq!(master.lock().await.state, TaskState::Completed);
        assert_eq!(slave_a.lock().await.state, TaskState::Completed);
        assert_eq!(slave_b.lock().await.state, TaskState::Completed);
    }

    #[tokio::test]
    async fn discard_if_over_attempted_respects_children_finalised_flag() {
        let counter = Arc::new(AtomicU32::new(0));
        let child_template = TaskTemplate::new("child", counting_factory(counter.clone(), 0));
        let parent_template =
            TaskTemplate::new("parent", counting_factory(counter, 0)).with_children(vec![child_template]);
        let handle = parent_template.build(ItemId::new_for_test("item-1"));
        let mut parent = handle.lock().await;
        parent.attempts = 5;
        parent.state = TaskState::Failed;
        assert!(!parent.discard_if_over_attempted(3, true).await);
        parent.children[0].lock().await.execute().await.unwrap();
        assert!(parent.discard_if_over_attempted(3, true).await);
        assert_eq!(parent.state, TaskState::Discarded);
    }

    #[tokio::test]
    async fn freeze_propagates_to_children() {
        let counter = Arc::new(AtomicU32::new(0));
        let child_template = TaskTemplate::new("child", counting_factory(counter.clone(), 0));
        let parent_template =
            TaskTemplate::new("parent", counting_factory(counter, 0)).with_children(vec![child_template]);
        let handle = parent_template.build(ItemId::new_for_test("item-1"));
        handle.lock().await.freeze().await;
        assert!(handle.lock().await.frozen);
        assert!(handle.lock().await.children[0].lock().await.frozen);
    }

    #[tokio::test]
    async fn revive_overlays_persisted_state_onto_a_fresh_template() {
        let counter = Arc::new(AtomicU32::new(0));
        let template = TaskTemplate::new("step", counting_factory(counter, 0));
        let snapshot = TaskSnapshot {
            name: "step".into(),
            state: TaskState::Failed,
            attempts: 2,
            last_error: Some("boom".into()),
            frozen: false,
            children: Vec::new(),
        };
        let handle = template
            .revive(ItemId::new_for_test("item-1"), Some(&snapshot), ReviveMode::CreateMissing)
            .unwrap();
        let task = handle.lock().await;
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.attempts, 2);
    }
}
