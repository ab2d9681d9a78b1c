//! Cooperative task scheduler.
//!
//! Every inbound message becomes one task. A task body runs on the tokio
//! runtime and cooperates through its [`TaskContext`]:
//!
//! - `enter()` waits for the task's fairness key, so at most one task per
//!   conversation is Running while the others are Suspended behind it. Tasks
//!   are admitted in the order `create_task` was called for them
//! - `strike()` records a timeout and decays priority; at the floor it signals
//!   a hard timeout
//! - `yield_now()` and `killed()` let the body notice an external kill and
//!   unwind without touching the session
//!
//! Priority never preempts anything. It is derived from the strike count and
//! exists for diagnostics and the hard-timeout rule.

mod error;
mod task;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PriorityConfig;
use crate::sync::KeyedGates;

pub use error::SchedulerError;
pub use task::{
    FairnessGuard, PriorityPolicy, Strike, TaskContext, TaskId, TaskInfo, TaskSpec, TaskStatus,
};

use task::{TaskSlot, TaskTable};

/// Removes a finished task from the table, even if its body panicked.
struct TaskExit {
    tasks: Arc<TaskTable>,
    slot: Arc<TaskSlot>,
}

impl Drop for TaskExit {
    fn drop(&mut self) {
        self.slot.mark_dead();
        self.tasks.remove(&self.slot.id);
        debug!(task = %self.slot.id, "Task finished");
    }
}

/// Task table plus per-key fairness gates. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    tasks: Arc<TaskTable>,
    gates: KeyedGates,
    policy: PriorityPolicy,
    // std::sync::Mutex is correct here: never held across .await points
    join_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
    closed: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(config: PriorityConfig) -> Self {
        Self {
            tasks: Arc::new(TaskTable::new()),
            gates: KeyedGates::new(),
            policy: config.into(),
            join_handles: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn policy(&self) -> PriorityPolicy {
        self.policy
    }

    /// Register a task, take its place in its key's line, and start its body.
    ///
    /// The body receives the task's [`TaskContext`]. The task is visible in
    /// `list()` from the moment this returns until the body completes.
    pub fn create_task<F, Fut>(&self, spec: TaskSpec, body: F) -> Result<TaskId, SchedulerError>
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SchedulerError::ShuttingDown);
        }

        let slot = Arc::new(TaskSlot::new(spec, &self.policy));
        let id = slot.id;
        self.tasks.insert(id, slot.clone());

        let ctx = TaskContext {
            slot: slot.clone(),
            tasks: self.tasks.clone(),
            gates: self.gates.clone(),
            ticket: Mutex::new(Some(self.gates.reserve(&slot.name))),
            policy: self.policy,
        };
        let exit = TaskExit {
            tasks: self.tasks.clone(),
            slot: slot.clone(),
        };
        let future = body(ctx);

        debug!(
            task = %id,
            name = %slot.name,
            user = slot.user.as_deref().unwrap_or("-"),
            "Task created"
        );
        let handle = tokio::spawn(async move {
            let _exit = exit;
            future.await;
        });

        let mut guard = self.join_handles.lock().expect("mutex poisoned");
        guard.retain(|h| !h.is_finished());
        guard.push(handle);

        Ok(id)
    }

    /// Kill a task. Its body observes the kill at its next cooperation point.
    ///
    /// Returns false if no such task is alive.
    pub fn kill(&self, id: TaskId) -> bool {
        let Some(slot) = self.tasks.get(&id).map(|entry| entry.value().clone()) else {
            return false;
        };
        slot.mark_dead();
        slot.cancel.cancel();
        info!(task = %id, name = %slot.name, "Task killed");
        true
    }

    /// Kill every task. Returns how many were alive.
    pub fn kill_all(&self) -> usize {
        let ids: Vec<TaskId> = self.tasks.iter().map(|entry| *entry.key()).collect();
        ids.into_iter().filter(|id| self.kill(*id)).count()
    }

    /// Every alive task, oldest first.
    pub fn list(&self) -> Vec<TaskInfo> {
        let mut infos: Vec<TaskInfo> = self
            .tasks
            .iter()
            .map(|entry| entry.info(&self.policy))
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub fn get(&self, id: TaskId) -> Option<TaskInfo> {
        self.tasks.get(&id).map(|entry| entry.info(&self.policy))
    }

    /// Alive tasks with fairness key `name`, oldest first.
    pub fn tasks_for(&self, name: &str) -> Vec<TaskInfo> {
        self.list()
            .into_iter()
            .filter(|info| info.name == name)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Periodically drop fairness gates of conversations that went quiet.
    pub fn spawn_gate_cleanup(&self, interval: Duration, max_age: Duration) {
        self.gates
            .clone()
            .spawn_cleanup_task(interval, max_age, "fairness");
    }

    /// Wait for every task body to finish.
    pub async fn join_all(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.join_handles.lock().expect("mutex poisoned"));
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Task panicked");
            }
        }
    }

    /// Stop accepting tasks, kill the alive ones, and wait for their bodies.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let killed = self.kill_all();
        info!(killed = killed, "Shutting down scheduler");
        self.join_all().await;
        info!("Scheduler shutdown complete");
    }
}
