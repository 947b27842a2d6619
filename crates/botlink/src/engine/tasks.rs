//! Execution Tasks: background work started by loaded code that outlives the
//! call that started it.
//!
//! Tasks are recorded when spawned but only launched once the triggering
//! command has been answered (see [`TaskRegistry::launch_pending`]), so a
//! task's events always follow the reply that started it. Each task owns a
//! [`CancellationToken`]; cancellation is cooperative.

use std::{
    cell::RefCell,
    collections::BTreeMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use botlink_ipc::{CallbackMessage, callback::CallbackPublisher};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use strum::Display;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type TaskId = u64;

/// The work itself. Runs on its own thread with the task's token.
pub type TaskBody =
    Box<dyn FnOnce(&CancellationToken) -> Result<Value, String> + Send>;

pub fn task_body<F>(f: F) -> TaskBody
where
    F: FnOnce(&CancellationToken) -> Result<Value, String> + Send + 'static,
{
    Box::new(f)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskOutcome {
    Completed,
    Failed,
    Cancelled,
}

enum Phase {
    Pending(TaskBody),
    Running,
}

struct TaskEntry {
    owner: Option<String>,
    label: String,
    token: CancellationToken,
    phase: Phase,
}

thread_local! {
    static CURRENT_OWNER: RefCell<Option<String>> = const { RefCell::new(None) };
    static CURRENT_TOKEN: RefCell<Option<CancellationToken>> = const { RefCell::new(None) };
}

/// Marks the current thread as executing on behalf of `owner` until dropped.
pub struct OwnerScope {
    previous: Option<String>,
}

impl OwnerScope {
    pub fn enter(owner: &str) -> Self {
        let previous =
            CURRENT_OWNER.with(|o| o.borrow_mut().replace(owner.to_string()));
        Self { previous }
    }
}

impl Drop for OwnerScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_OWNER.with(|o| *o.borrow_mut() = previous);
    }
}

pub fn current_owner() -> Option<String> {
    CURRENT_OWNER.with(|o| o.borrow().clone())
}

/// Token of the task running on this thread, if any.
pub fn current_token() -> Option<CancellationToken> {
    CURRENT_TOKEN.with(|t| t.borrow().clone())
}

/// Sleep up to `duration`, waking early if the current task is cancelled.
/// Returns whether the full duration elapsed.
pub fn cancellable_sleep(duration: Duration) -> bool {
    const SLICE: Duration = Duration::from_millis(10);
    let Some(token) = current_token() else {
        std::thread::sleep(duration);
        return true;
    };
    let deadline = std::time::Instant::now() + duration;
    loop {
        if token.is_cancelled() {
            return false;
        }
        let now = std::time::Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(SLICE.min(deadline - now));
    }
}

pub struct TaskRegistry {
    tasks: Mutex<BTreeMap<TaskId, TaskEntry>>,
    next_id: AtomicU64,
    publisher: CallbackPublisher,
}

impl TaskRegistry {
    pub fn new(publisher: CallbackPublisher) -> Arc<Self> {
        Arc::new(Self {
            tasks: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            publisher,
        })
    }

    /// Record a task. Spawns from inside a running task start right away;
    /// everything else waits for [`launch_pending`](Self::launch_pending).
    pub fn spawn(
        self: &Arc<Self>,
        label: impl Into<String>,
        body: TaskBody,
    ) -> TaskId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = TaskEntry {
            owner: current_owner(),
            label: label.into(),
            token: CancellationToken::new(),
            phase: Phase::Pending(body),
        };
        debug!(id, label = %entry.label, owner = ?entry.owner, "task spawned");
        self.tasks.lock().insert(id, entry);

        if current_token().is_some() {
            self.launch(id);
        }
        id
    }

    /// Start every task still waiting for its command's reply.
    pub fn launch_pending(self: &Arc<Self>) -> usize {
        let pending: Vec<TaskId> = self
            .tasks
            .lock()
            .iter()
            .filter(|(_, e)| matches!(e.phase, Phase::Pending(_)))
            .map(|(id, _)| *id)
            .collect();
        for id in &pending {
            self.launch(*id);
        }
        pending.len()
    }

    fn launch(self: &Arc<Self>, id: TaskId) {
        let (body, token, label) = {
            let mut tasks = self.tasks.lock();
            let Some(entry) = tasks.get_mut(&id) else {
                return;
            };
            let Phase::Pending(body) =
                std::mem::replace(&mut entry.phase, Phase::Running)
            else {
                return;
            };
            (body, entry.token.clone(), entry.label.clone())
        };

        let registry = Arc::clone(self);
        let thread_token = token.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("task-{id}-{label}"))
            .spawn(move || {
                CURRENT_TOKEN
                    .with(|t| *t.borrow_mut() = Some(thread_token.clone()));
                let result = if thread_token.is_cancelled() {
                    Err("cancelled before start".to_string())
                } else {
                    catch_unwind(AssertUnwindSafe(|| body(&thread_token)))
                        .unwrap_or_else(|_| Err("task panicked".to_string()))
                };
                registry.finish(id, result);
            });

        if let Err(e) = spawned {
            warn!("could not start task {id}: {e}");
            token.cancel();
            self.finish(id, Err(format!("could not start thread: {e}")));
        }
    }

    fn finish(&self, id: TaskId, result: Result<Value, String>) {
        let Some(entry) = self.tasks.lock().remove(&id) else {
            return;
        };
        let outcome = match (&result, entry.token.is_cancelled()) {
            (_, true) => TaskOutcome::Cancelled,
            (Ok(_), false) => TaskOutcome::Completed,
            (Err(_), false) => TaskOutcome::Failed,
        };
        info!(id, label = %entry.label, %outcome, "task finished");

        let mut data = json!({
            "task_id": id,
            "object": entry.owner,
            "label": entry.label,
            "status": outcome,
        });
        match result {
            Ok(value) => data["result"] = value,
            Err(error) => data["error"] = Value::String(error),
        }
        self.publisher.publish(CallbackMessage::TASK_OUTCOME, data);
    }

    /// Signal one task. Returns whether it was still known.
    pub fn cancel(&self, id: TaskId) -> bool {
        let tasks = self.tasks.lock();
        match tasks.get(&id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Signal every task. Tasks not yet launched are dropped and reported as
    /// cancelled.
    pub fn cancel_all(&self) -> usize {
        let signalled = {
            let tasks = self.tasks.lock();
            for entry in tasks.values() {
                entry.token.cancel();
            }
            tasks.len()
        };
        self.drop_pending();
        signalled
    }

    /// Forget tasks that were never launched, reporting each as cancelled.
    /// Running tasks are untouched.
    pub fn drop_pending(&self) -> usize {
        let mut never_started = Vec::new();
        self.tasks.lock().retain(|id, entry| {
            let pending = matches!(entry.phase, Phase::Pending(_));
            if pending {
                entry.token.cancel();
                never_started.push(*id);
            }
            !pending
        });
        for id in &never_started {
            debug!(id, "dropping task that never started");
            self.publisher.publish(
                CallbackMessage::TASK_OUTCOME,
                json!({ "task_id": id, "status": TaskOutcome::Cancelled, "error": "cancelled before start" }),
            );
        }
        never_started.len()
    }

    pub fn is_running(&self, id: TaskId) -> bool {
        self.tasks.lock().contains_key(&id)
    }

    pub fn running_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Wait until no task is left or `grace` runs out. Returns how many are
    /// still running; those are abandoned, not killed.
    pub async fn wait_idle(&self, grace: Duration) -> usize {
        let deadline = Instant::now() + grace;
        loop {
            let left = self.running_count();
            if left == 0 || Instant::now() >= deadline {
                return left;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
