use cadence_core::TaskId;
use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The cron expression could not be parsed.
    #[error("Invalid schedule {expression:?}: {reason}")]
    InvalidSchedule { expression: String, reason: String },

    /// No task row with the given ID exists in the store.
    #[error("Task not found: {id}")]
    TaskNotFound { id: TaskId },

    /// The task exists but was excluded from triggering at startup.
    #[error("Task is not scheduled: {id}")]
    TaskNotScheduled { id: TaskId },

    /// A descriptor names a task with no registered unit of work.
    #[error("No job registered for task {name:?}")]
    JobNotRegistered { name: String },

    /// Two descriptors share the same name.
    #[error("Duplicate task descriptor: {name}")]
    DuplicateTask { name: String },

    /// `start` was called on a scheduler that is already running.
    #[error("Scheduler already started")]
    AlreadyStarted,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
