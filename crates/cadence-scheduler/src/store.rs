use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cadence_core::{LogEntry, LogLevel, TaskId, TaskState, TaskStatus};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection};
use tracing::{debug, instrument};

use crate::clock::{Clock, SystemClock};
use crate::db::init_db;
use crate::error::{Result, SchedulerError};
use crate::repository::{LogSink, TaskDefaults, TaskRepository, TaskUpdate};

const TASK_COLUMNS: &str = "id, name, cron_schedule, status, last_run_at, next_run_at,
                            last_log_message, created_at, updated_at";

/// SQLite-backed [`TaskRepository`] and [`LogSink`].
///
/// Thread-safe: wraps a single connection in a `Mutex`, so every statement
/// (including the conditional claim) is serialised through one writer.
pub struct SqliteStore {
    db: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    /// Wrap `conn`, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        Self::with_clock(conn, Arc::new(SystemClock))
    }

    /// Like [`SqliteStore::new`] but stamping rows with `clock`.
    pub fn with_clock(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            clock,
        })
    }

    /// Private in-memory database with foreign keys enabled.
    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::with_clock(conn, clock)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now().trunc_subsecs(3)
    }
}

impl TaskRepository for SqliteStore {
    #[instrument(skip(self, defaults), fields(task = %name))]
    fn find_or_create_task(
        &self,
        name: &str,
        defaults: &TaskDefaults,
    ) -> Result<(TaskState, bool)> {
        let conn = self.conn();
        let now = format_ts(self.now());

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO scheduled_tasks
             (name, cron_schedule, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![name, defaults.cron_schedule, defaults.status.as_str(), now],
        )?;

        // Read back: covers both the fresh insert and the pre-existing row.
        let task = conn.query_row(
            &format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE name = ?1"),
            params![name],
            row_to_task,
        )?;
        debug!(task_id = %task.id, created = inserted == 1, "find_or_create_task");
        Ok((task, inserted == 1))
    }

    fn update_task(&self, id: TaskId, update: &TaskUpdate) -> Result<TaskState> {
        let conn = self.conn();
        let now = format_ts(self.now());

        let n = conn.execute(
            "UPDATE scheduled_tasks SET
                cron_schedule    = COALESCE(?2, cron_schedule),
                status           = COALESCE(?3, status),
                last_run_at      = COALESCE(?4, last_run_at),
                next_run_at      = COALESCE(?5, next_run_at),
                last_log_message = COALESCE(?6, last_log_message),
                updated_at       = ?7
             WHERE id = ?1",
            params![
                id.get(),
                update.cron_schedule,
                update.status.map(TaskStatus::as_str),
                update.last_run_at.map(format_ts),
                update.next_run_at.map(format_ts),
                update.last_log_message,
                now,
            ],
        )?;
        if n == 0 {
            return Err(SchedulerError::TaskNotFound { id });
        }

        select_task(&conn, id)?.ok_or(SchedulerError::TaskNotFound { id })
    }

    fn find_task_by_id(&self, id: TaskId) -> Result<Option<TaskState>> {
        let conn = self.conn();
        select_task(&conn, id)
    }

    fn list_tasks(&self) -> Result<Vec<TaskState>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM scheduled_tasks ORDER BY name ASC"
        ))?;
        let tasks = stmt
            .query_map([], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    #[instrument(skip(self))]
    fn try_claim(&self, id: TaskId, started_at: DateTime<Utc>) -> Result<Option<TaskState>> {
        let conn = self.conn();
        let started = format_ts(started_at.trunc_subsecs(3));

        // Single conditional UPDATE: the status check and the write cannot interleave.
        let n = conn.execute(
            "UPDATE scheduled_tasks
             SET status = 'running', last_run_at = ?2, updated_at = ?2
             WHERE id = ?1 AND status NOT IN ('running', 'retrying')",
            params![id.get(), started],
        )?;
        if n == 0 {
            debug!("claim refused");
            return Ok(None);
        }
        select_task(&conn, id)
    }
}

impl LogSink for SqliteStore {
    fn append_log(&self, task_id: TaskId, level: LogLevel, message: &str) -> Result<LogEntry> {
        let conn = self.conn();
        let created_at = self.now();

        conn.execute(
            "INSERT INTO task_logs (task_id, level, message, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![task_id.get(), level.as_str(), message, format_ts(created_at)],
        )?;

        Ok(LogEntry {
            id: conn.last_insert_rowid(),
            task_id,
            level,
            message: message.to_string(),
            created_at,
        })
    }

    fn list_logs(&self, task_id: TaskId, limit: usize) -> Result<Vec<LogEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, task_id, level, message, created_at
             FROM task_logs
             WHERE task_id = ?1
             ORDER BY created_at DESC, id DESC
             LIMIT ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let entries = stmt
            .query_map(params![task_id.get(), limit], row_to_log)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }
}

fn select_task(conn: &Connection, id: TaskId) -> Result<Option<TaskState>> {
    match conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE id = ?1"),
        params![id.get()],
        row_to_task,
    ) {
        Ok(task) => Ok(Some(task)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(SchedulerError::Database(e)),
    }
}

fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, err.into())
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskState> {
    let status: String = row.get(3)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;
    Ok(TaskState {
        id: TaskId(row.get(0)?),
        name: row.get(1)?,
        cron_schedule: row.get(2)?,
        status: status.parse().map_err(|e: String| conversion_error(3, e))?,
        last_run_at: parse_opt_ts(4, row.get(4)?)?,
        next_run_at: parse_opt_ts(5, row.get(5)?)?,
        last_log_message: row.get(6)?,
        created_at: parse_ts(7, &created_at)?,
        updated_at: parse_ts(8, &updated_at)?,
    })
}

fn row_to_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogEntry> {
    let level: String = row.get(2)?;
    let created_at: String = row.get(4)?;
    Ok(LogEntry {
        id: row.get(0)?,
        task_id: TaskId(row.get(1)?),
        level: level.parse().map_err(|e: String| conversion_error(2, e))?,
        message: row.get(3)?,
        created_at: parse_ts(4, &created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn store() -> SqliteStore {
        let at = Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap();
        SqliteStore::open_in_memory(Arc::new(FixedClock(at))).unwrap()
    }

    #[test]
    fn find_or_create_is_idempotent() {
        let store = store();
        let (first, created) = store
            .find_or_create_task("heartbeat", &TaskDefaults::idle("* * * * *"))
            .unwrap();
        assert!(created);
        assert_eq!(first.status, TaskStatus::Idle);
        assert_eq!(first.cron_schedule, "* * * * *");
        assert!(first.next_run_at.is_none());

        // Defaults are ignored for an existing row.
        let (second, created) = store
            .find_or_create_task("heartbeat", &TaskDefaults::idle("0 3 * * *"))
            .unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);
        assert_eq!(second.cron_schedule, "* * * * *");
    }

    #[test]
    fn update_touches_only_given_columns() {
        let store = store();
        let (task, _) = store
            .find_or_create_task("heartbeat", &TaskDefaults::idle("* * * * *"))
            .unwrap();
        let next = Utc.with_ymd_and_hms(2026, 10, 16, 12, 1, 0).unwrap();

        let updated = store
            .update_task(task.id, &TaskUpdate::status(TaskStatus::Completed).with_next_run_at(next))
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Completed);
        assert_eq!(updated.next_run_at, Some(next));
        assert_eq!(updated.cron_schedule, "* * * * *");

        let updated = store
            .update_task(task.id, &TaskUpdate::last_log_message("Task started."))
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Completed);
        assert_eq!(updated.last_log_message.as_deref(), Some("Task started."));
    }

    #[test]
    fn update_unknown_task_is_not_found() {
        let store = store();
        let err = store
            .update_task(TaskId(99), &TaskUpdate::status(TaskStatus::Idle))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::TaskNotFound { id } if id == TaskId(99)));
        assert!(store.find_task_by_id(TaskId(99)).unwrap().is_none());
    }

    #[test]
    fn claim_is_exclusive_until_released() {
        let store = store();
        let (task, _) = store
            .find_or_create_task("heartbeat", &TaskDefaults::idle("* * * * *"))
            .unwrap();
        let at = Utc.with_ymd_and_hms(2026, 10, 16, 12, 1, 0).unwrap();

        let claimed = store.try_claim(task.id, at).unwrap().unwrap();
        assert_eq!(claimed.status, TaskStatus::Running);
        assert_eq!(claimed.last_run_at, Some(at));

        assert!(store.try_claim(task.id, at).unwrap().is_none());

        store
            .update_task(task.id, &TaskUpdate::status(TaskStatus::Retrying))
            .unwrap();
        assert!(store.try_claim(task.id, at).unwrap().is_none());

        store
            .update_task(task.id, &TaskUpdate::status(TaskStatus::Failed))
            .unwrap();
        assert!(store.try_claim(task.id, at).unwrap().is_some());
    }

    #[test]
    fn list_tasks_orders_by_name() {
        let store = store();
        for name in ["zeta", "alpha", "mid"] {
            store
                .find_or_create_task(name, &TaskDefaults::idle("* * * * *"))
                .unwrap();
        }
        let names: Vec<_> = store
            .list_tasks()
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, ["alpha", "mid", "zeta"]);
    }

    #[test]
    fn list_logs_is_newest_first_and_limited() {
        let store = store();
        let (task, _) = store
            .find_or_create_task("heartbeat", &TaskDefaults::idle("* * * * *"))
            .unwrap();
        for i in 0..60 {
            store
                .append_log(task.id, LogLevel::Info, &format!("line {i}"))
                .unwrap();
        }

        let logs = store.list_logs(task.id, 50).unwrap();
        assert_eq!(logs.len(), 50);
        // Same timestamp throughout: insertion order breaks the tie.
        assert_eq!(logs[0].message, "line 59");
        assert_eq!(logs[49].message, "line 10");
        assert!(logs.windows(2).all(|w| w[0].id > w[1].id));
    }

    #[test]
    fn logs_cascade_with_their_task() {
        let store = store();
        let (task, _) = store
            .find_or_create_task("heartbeat", &TaskDefaults::idle("* * * * *"))
            .unwrap();
        store.append_log(task.id, LogLevel::Error, "boom").unwrap();

        store
            .conn()
            .execute("DELETE FROM scheduled_tasks WHERE id = ?1", params![task.id.get()])
            .unwrap();
        assert!(store.list_logs(task.id, 50).unwrap().is_empty());
    }
}
