use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Primary key of a persisted task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl TaskId {
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for TaskId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// A compiled-in task definition: the unique name plus its 5-field cron
/// expression. The name is the key used to reconcile against persisted rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDescriptor {
    pub name: String,
    pub cron_schedule: String,
}

impl TaskDescriptor {
    pub fn new(name: impl Into<String>, cron_schedule: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cron_schedule: cron_schedule.into(),
        }
    }
}

/// Lifecycle state of a task row.
///
/// `Running` and `Retrying` mean an execution chain has claimed the task;
/// `Completed` and `Failed` are the terminal outcomes of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Idle,
    Running,
    Retrying,
    Completed,
    Failed,
}

impl TaskStatus {
    /// True while an execution chain owns the task.
    pub fn is_claimed(self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::Retrying)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Running => "running",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "idle" => Ok(TaskStatus::Idle),
            "running" => Ok(TaskStatus::Running),
            "retrying" => Ok(TaskStatus::Retrying),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Persisted state of one scheduled task.
///
/// Serialises with camelCase keys; this is the payload of every
/// `task_update` event and the element type of the task listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskState {
    pub id: TaskId,
    pub name: String,
    pub cron_schedule: String,
    pub status: TaskStatus,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    /// Mirrors the most recent log line for cheap display.
    pub last_log_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Severity of an execution log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

/// One append-only execution log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: i64,
    pub task_id: TaskId,
    pub level: LogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_state() -> TaskState {
        let at = Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap();
        TaskState {
            id: TaskId(7),
            name: "heartbeat".to_string(),
            cron_schedule: "* * * * *".to_string(),
            status: TaskStatus::Retrying,
            last_run_at: Some(at),
            next_run_at: None,
            last_log_message: Some("Retrying in 2 seconds...".to_string()),
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn claimed_statuses() {
        assert!(TaskStatus::Running.is_claimed());
        assert!(TaskStatus::Retrying.is_claimed());
        assert!(!TaskStatus::Idle.is_claimed());
        assert!(!TaskStatus::Failed.is_claimed());
        assert!(!TaskStatus::Completed.is_claimed());
    }

    #[test]
    fn status_parses_its_display_form() {
        for status in [
            TaskStatus::Idle,
            TaskStatus::Running,
            TaskStatus::Retrying,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("paused".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn task_state_serialises_camel_case() {
        let json = serde_json::to_value(sample_state()).unwrap();

        assert_eq!(json["id"], 7);
        assert_eq!(json["cronSchedule"], "* * * * *");
        assert_eq!(json["status"], "retrying");
        assert_eq!(json["lastRunAt"], "2026-10-16T12:00:00Z");
        assert!(json["nextRunAt"].is_null());
        assert_eq!(json["lastLogMessage"], "Retrying in 2 seconds...");
    }

    #[test]
    fn log_entry_serialises_task_id_flat() {
        let entry = LogEntry {
            id: 1,
            task_id: TaskId(7),
            level: LogLevel::Warn,
            message: "Retrying in 4 seconds...".to_string(),
            created_at: Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 4).unwrap(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["taskId"], 7);
        assert_eq!(json["level"], "warn");
    }
}
