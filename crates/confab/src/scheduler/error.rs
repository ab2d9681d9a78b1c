use thiserror::Error;

/// Scheduler errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Two tasks with the same fairness key were running at once.
    ///
    /// Never surfaces to users; it means the gate bookkeeping is broken.
    #[error("scheduling conflict: more than one running task for '{key}'")]
    SchedulingConflict { key: String },

    /// The scheduler no longer accepts tasks.
    #[error("scheduler is shutting down")]
    ShuttingDown,
}
