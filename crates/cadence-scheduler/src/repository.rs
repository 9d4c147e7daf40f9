//! Storage contracts consumed by the scheduler.
//!
//! The runner and triggers only ever talk to these traits; [`crate::store::SqliteStore`]
//! is the bundled implementation.

use cadence_core::{LogEntry, LogLevel, TaskId, TaskState, TaskStatus};
use chrono::{DateTime, Utc};

use crate::error::Result;

/// Column values used when `find_or_create_task` has to insert a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDefaults {
    pub cron_schedule: String,
    pub status: TaskStatus,
}

impl TaskDefaults {
    pub fn idle(cron_schedule: impl Into<String>) -> Self {
        Self {
            cron_schedule: cron_schedule.into(),
            status: TaskStatus::Idle,
        }
    }
}

/// Partial update of a task row. `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskUpdate {
    pub cron_schedule: Option<String>,
    pub status: Option<TaskStatus>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_log_message: Option<String>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn cron_schedule(expression: impl Into<String>) -> Self {
        Self {
            cron_schedule: Some(expression.into()),
            ..Self::default()
        }
    }

    pub fn next_run_at(at: DateTime<Utc>) -> Self {
        Self {
            next_run_at: Some(at),
            ..Self::default()
        }
    }

    pub fn last_log_message(message: impl Into<String>) -> Self {
        Self {
            last_log_message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_next_run_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_run_at = Some(at);
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Durable store of task rows.
pub trait TaskRepository: Send + Sync {
    /// Return the row named `name`, inserting it from `defaults` if absent.
    /// The flag is `true` when the row was created by this call.
    fn find_or_create_task(&self, name: &str, defaults: &TaskDefaults)
        -> Result<(TaskState, bool)>;

    /// Apply `update` and return the fresh row.
    fn update_task(&self, id: TaskId, update: &TaskUpdate) -> Result<TaskState>;

    fn find_task_by_id(&self, id: TaskId) -> Result<Option<TaskState>>;

    /// All rows ordered by name ascending.
    fn list_tasks(&self) -> Result<Vec<TaskState>>;

    /// Atomically move the task to `running` and stamp `last_run_at`.
    ///
    /// Succeeds only if the prior status was neither `running` nor
    /// `retrying`; returns `None` when another chain holds the claim.
    fn try_claim(&self, id: TaskId, started_at: DateTime<Utc>) -> Result<Option<TaskState>>;
}

/// Durable, append-only store of execution log lines.
pub trait LogSink: Send + Sync {
    fn append_log(&self, task_id: TaskId, level: LogLevel, message: &str) -> Result<LogEntry>;

    /// At most `limit` entries for the task, newest first.
    fn list_logs(&self, task_id: TaskId, limit: usize) -> Result<Vec<LogEntry>>;
}
