//! Compiled-in tasks and the work they perform.

use std::path::PathBuf;

use async_trait::async_trait;
use cadence_core::TaskDescriptor;
use cadence_scheduler::{Job, JobContext, JobError};
use rusqlite::Connection;
use tracing::{debug, info};

pub const HEARTBEAT: &str = "heartbeat";
pub const DAILY_MAINTENANCE: &str = "daily-maintenance";

pub fn descriptors() -> Vec<TaskDescriptor> {
    vec![
        TaskDescriptor::new(HEARTBEAT, "* * * * *"),
        TaskDescriptor::new(DAILY_MAINTENANCE, "0 3 * * *"),
    ]
}

/// Probes the database once a minute with `PRAGMA quick_check`.
pub struct HeartbeatJob {
    db_path: PathBuf,
}

impl HeartbeatJob {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }
}

#[async_trait]
impl Job for HeartbeatJob {
    async fn run(&self, ctx: &JobContext) -> Result<(), JobError> {
        let path = self.db_path.clone();
        let verdict = blocking(move || {
            let conn = Connection::open(path)?;
            conn.query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
        })
        .await?;

        if verdict != "ok" {
            return Err(JobError::failed(format!("quick_check reported: {verdict}")));
        }
        debug!(run_id = %ctx.run_id, attempt = ctx.attempt, "database heartbeat ok");
        Ok(())
    }
}

/// Truncates the WAL and lets SQLite refresh its planner statistics.
pub struct MaintenanceJob {
    db_path: PathBuf,
}

impl MaintenanceJob {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }
}

#[async_trait]
impl Job for MaintenanceJob {
    async fn run(&self, ctx: &JobContext) -> Result<(), JobError> {
        let path = self.db_path.clone();
        let (busy, log_frames, checkpointed) = blocking(move || {
            let conn = Connection::open(path)?;
            let counts = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;
            conn.execute_batch("PRAGMA optimize;")?;
            Ok(counts)
        })
        .await?;

        // busy = 1 means a reader blocked the truncate; worth another attempt.
        if busy != 0 {
            return Err(JobError::failed("WAL checkpoint blocked by an active reader"));
        }
        info!(
            run_id = %ctx.run_id,
            log_frames,
            checkpointed,
            "database maintenance complete"
        );
        Ok(())
    }
}

async fn blocking<T, F>(f: F) -> Result<T, JobError>
where
    F: FnOnce() -> rusqlite::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(JobError::failed)?
        .map_err(JobError::failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::TaskId;
    use cadence_scheduler::CronSchedule;
    use chrono::Utc;
    use uuid::Uuid;

    fn ctx(name: &str) -> JobContext {
        JobContext {
            task_id: TaskId(1),
            task_name: name.to_string(),
            run_id: Uuid::now_v7(),
            attempt: 1,
            started_at: Utc::now(),
        }
    }

    fn wal_db(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("cadence.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             CREATE TABLE t (x INTEGER);
             INSERT INTO t VALUES (1), (2), (3);",
        )
        .unwrap();
        path
    }

    #[test]
    fn descriptors_are_valid_and_unique() {
        let descriptors = descriptors();
        assert_eq!(descriptors.len(), 2);
        assert_ne!(descriptors[0].name, descriptors[1].name);
        for d in &descriptors {
            assert!(CronSchedule::parse(&d.cron_schedule).is_ok(), "{}", d.name);
        }
    }

    #[tokio::test]
    async fn heartbeat_passes_on_a_healthy_database() {
        let dir = tempfile::tempdir().unwrap();
        let job = HeartbeatJob::new(wal_db(&dir));
        job.run(&ctx(HEARTBEAT)).await.unwrap();
    }

    #[tokio::test]
    async fn heartbeat_fails_when_the_database_cannot_open() {
        let dir = tempfile::tempdir().unwrap();
        let job = HeartbeatJob::new(dir.path().join("missing").join("cadence.db"));
        assert!(job.run(&ctx(HEARTBEAT)).await.is_err());
    }

    #[tokio::test]
    async fn maintenance_checkpoints_the_wal() {
        let dir = tempfile::tempdir().unwrap();
        let job = MaintenanceJob::new(wal_db(&dir));
        job.run(&ctx(DAILY_MAINTENANCE)).await.unwrap();
    }
}
