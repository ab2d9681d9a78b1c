//! Tasks and the context a task body runs with.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use ulid::Ulid;

use crate::config::PriorityConfig;
use crate::sync::{GateTicket, KeyGuard, KeyedGates};

use super::error::SchedulerError;

// ============================================================================
// Identity and status
// ============================================================================

/// Unique task id. Ordered by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(Ulid);

impl TaskId {
    pub(crate) fn new() -> Self {
        Self(Ulid::new())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task_{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Created, has not asked for its fairness gate yet.
    Ready,
    /// Holds its fairness gate and may touch the session.
    Running,
    /// Waiting for its gate or yielding.
    Suspended,
    /// Finished or killed. Never resurrected.
    Dead,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Dead => "dead",
        };
        f.write_str(s)
    }
}

/// What to create a task with.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Fairness key, conventionally the conversation id.
    pub name: String,
    /// Starting priority; the configured initial priority when `None`.
    pub priority: Option<u8>,
    /// Who triggered the task, for diagnostics.
    pub user: Option<String>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: None,
            user: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Point-in-time view of a task.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    pub priority: u8,
    pub strikes: u32,
    pub user: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Priority
// ============================================================================

/// Outcome of a timeout strike.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strike {
    /// Priority decayed; `first` is set on the task's first strike.
    Slow { first: bool, priority: u8 },
    /// Priority reached the floor: abort the current step.
    HardTimeout,
}

/// Derives priority from a task's strike count.
#[derive(Debug, Clone, Copy)]
pub struct PriorityPolicy {
    pub initial: u8,
    pub step: u8,
    pub floor: u8,
}

impl From<PriorityConfig> for PriorityPolicy {
    fn from(config: PriorityConfig) -> Self {
        Self {
            initial: config.initial,
            step: config.step,
            floor: config.floor,
        }
    }
}

impl PriorityPolicy {
    /// `start - strikes * step`, never below the floor.
    pub fn priority(&self, start: u8, strikes: u32) -> u8 {
        let decay = u32::from(self.step).saturating_mul(strikes);
        let decay = u8::try_from(decay).unwrap_or(u8::MAX);
        start.saturating_sub(decay).max(self.floor)
    }
}

// ============================================================================
// Task slot
// ============================================================================

/// Scheduler-side record of a task.
pub(crate) struct TaskSlot {
    pub(crate) id: TaskId,
    pub(crate) name: String,
    pub(crate) user: Option<String>,
    pub(crate) start_priority: u8,
    pub(crate) created_at: DateTime<Utc>,
    // std::sync::Mutex is fine here: never held across an await
    status: Mutex<TaskStatus>,
    strikes: AtomicU32,
    pub(crate) cancel: CancellationToken,
}

pub(crate) type TaskTable = DashMap<TaskId, Arc<TaskSlot>>;

impl TaskSlot {
    pub(crate) fn new(spec: TaskSpec, policy: &PriorityPolicy) -> Self {
        Self {
            id: TaskId::new(),
            name: spec.name,
            user: spec.user,
            start_priority: spec.priority.unwrap_or(policy.initial),
            created_at: Utc::now(),
            status: Mutex::new(TaskStatus::Ready),
            strikes: AtomicU32::new(0),
            cancel: CancellationToken::new(),
        }
    }

    pub(crate) fn status(&self) -> TaskStatus {
        *self.status.lock().expect("mutex poisoned")
    }

    /// Set the status unless the task is already dead.
    pub(crate) fn set_status(&self, status: TaskStatus) {
        let mut guard = self.status.lock().expect("mutex poisoned");
        if *guard != TaskStatus::Dead {
            *guard = status;
        }
    }

    pub(crate) fn mark_dead(&self) {
        *self.status.lock().expect("mutex poisoned") = TaskStatus::Dead;
    }

    pub(crate) fn info(&self, policy: &PriorityPolicy) -> TaskInfo {
        let strikes = self.strikes.load(Ordering::SeqCst);
        TaskInfo {
            id: self.id,
            name: self.name.clone(),
            status: self.status(),
            priority: policy.priority(self.start_priority, strikes),
            strikes,
            user: self.user.clone(),
            created_at: self.created_at,
        }
    }
}

// ============================================================================
// Task context
// ============================================================================

/// Handed to a task body. All cooperation with the scheduler goes through it.
pub struct TaskContext {
    pub(crate) slot: Arc<TaskSlot>,
    pub(crate) tasks: Arc<TaskTable>,
    pub(crate) gates: KeyedGates,
    /// Place in line taken when the task was created.
    pub(crate) ticket: Mutex<Option<GateTicket>>,
    pub(crate) policy: PriorityPolicy,
}

impl TaskContext {
    pub fn id(&self) -> TaskId {
        self.slot.id
    }

    /// Fairness key.
    pub fn name(&self) -> &str {
        &self.slot.name
    }

    pub fn user(&self) -> Option<&str> {
        self.slot.user.as_deref()
    }

    pub fn status(&self) -> TaskStatus {
        self.slot.status()
    }

    pub fn priority(&self) -> u8 {
        self.policy
            .priority(self.slot.start_priority, self.slot.strikes.load(Ordering::SeqCst))
    }

    pub fn is_killed(&self) -> bool {
        self.slot.cancel.is_cancelled()
    }

    /// Resolves once the task has been killed.
    pub async fn killed(&self) {
        self.slot.cancel.cancelled().await
    }

    /// Token cancelled when the task is killed.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.slot.cancel
    }

    /// Wait for exclusive use of this task's fairness key.
    ///
    /// The task is Suspended while it waits behind tasks with the same key
    /// that were created before it, and Running once admitted. Returns `None`
    /// if the task was killed first; the caller must then unwind without
    /// touching the session.
    pub async fn enter(&self) -> Option<FairnessGuard> {
        let ticket = self.ticket.lock().expect("mutex poisoned").take();
        if self.is_killed() {
            return None;
        }
        // A second enter queues behind everyone created since
        let ticket = ticket.unwrap_or_else(|| self.gates.reserve(&self.slot.name));
        self.slot.set_status(TaskStatus::Suspended);

        let key_guard = tokio::select! {
            biased;
            _ = self.slot.cancel.cancelled() => return None,
            guard = ticket.enter() => guard,
        };
        if self.is_killed() {
            return None;
        }

        if let Some(conflict) = self.running_sibling() {
            let err = SchedulerError::SchedulingConflict {
                key: self.slot.name.clone(),
            };
            error!(task = %self.slot.id, other = %conflict, error = %err, "Fairness invariant violated");
            debug_assert!(false, "{err}");
        }

        self.slot.set_status(TaskStatus::Running);
        debug!(task = %self.slot.id, key = %self.slot.name, "Task entered");
        Some(FairnessGuard {
            slot: self.slot.clone(),
            _key: key_guard,
        })
    }

    fn running_sibling(&self) -> Option<TaskId> {
        self.tasks
            .iter()
            .find(|entry| {
                entry.id != self.slot.id
                    && entry.name == self.slot.name
                    && entry.status() == TaskStatus::Running
            })
            .map(|entry| entry.id)
    }

    /// Record a timeout strike and decay priority.
    ///
    /// Returns [`Strike::HardTimeout`] once priority reaches the floor; the
    /// caller must abort its current step.
    pub fn strike(&self) -> Strike {
        let strikes = self.slot.strikes.fetch_add(1, Ordering::SeqCst) + 1;
        let priority = self.policy.priority(self.slot.start_priority, strikes);
        if priority <= self.policy.floor {
            debug!(task = %self.slot.id, strikes = strikes, "Task hit priority floor");
            return Strike::HardTimeout;
        }
        debug!(task = %self.slot.id, strikes = strikes, priority = priority, "Task is slow");
        Strike::Slow {
            first: strikes == 1,
            priority,
        }
    }

    /// Restore the starting priority.
    pub fn reset_strikes(&self) {
        self.slot.strikes.store(0, Ordering::SeqCst);
    }

    /// Give other tasks a turn.
    ///
    /// Returns false if the task was killed; the caller must unwind without
    /// touching the session.
    pub async fn yield_now(&self) -> bool {
        if self.is_killed() {
            return false;
        }
        let previous = self.slot.status();
        self.slot.set_status(TaskStatus::Suspended);
        tokio::task::yield_now().await;
        if self.is_killed() {
            return false;
        }
        self.slot.set_status(previous);
        true
    }
}

/// Exclusive use of a fairness key. Dropping it admits the next waiter.
pub struct FairnessGuard {
    slot: Arc<TaskSlot>,
    _key: KeyGuard,
}

impl Drop for FairnessGuard {
    fn drop(&mut self) {
        // Leave Running before the gate opens
        self.slot.set_status(TaskStatus::Ready);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_decays_by_step_and_stops_at_floor() {
        let policy = PriorityPolicy {
            initial: 3,
            step: 1,
            floor: 0,
        };
        assert_eq!(policy.priority(3, 0), 3);
        assert_eq!(policy.priority(3, 2), 1);
        assert_eq!(policy.priority(3, 3), 0);
        assert_eq!(policy.priority(3, 100), 0);

        let raised = PriorityPolicy {
            initial: 10,
            step: 4,
            floor: 2,
        };
        assert_eq!(raised.priority(10, 2), 2);
        assert_eq!(raised.priority(10, 3), 2);
    }

    #[test]
    fn task_ids_display_with_prefix() {
        assert!(TaskId::new().to_string().starts_with("task_"));
    }
}
