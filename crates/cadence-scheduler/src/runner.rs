//! Attempt-chain state machine: `running → {completed | failed}` with a
//! bounded `retrying → running` loop in between.

use std::any::Any;
use std::sync::Arc;

use cadence_core::{LogLevel, TaskId, TaskState, TaskStatus};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::job::{JobContext, JobError, JobRegistry};
use crate::publisher::{EventPublisher, TASK_UPDATE_EVENT};
use crate::repository::{LogSink, TaskRepository, TaskUpdate};
use crate::retry::{RetryPolicy, RetrySender};
use crate::schedule::CronSchedule;

/// One pending execution of a claimed task.
#[derive(Debug, Clone)]
pub(crate) struct Attempt {
    /// Snapshot taken at claim time; only identity and schedule are read.
    pub task: TaskState,
    pub run_id: Uuid,
    /// 1-based.
    pub number: u32,
}

/// Drives a claimed task through its attempts. Log and repository writes are
/// best effort: a failed write is reported and the chain carries on based on
/// the job's own outcome.
pub(crate) struct TaskRunner {
    pub(crate) repo: Arc<dyn TaskRepository>,
    pub(crate) logs: Arc<dyn LogSink>,
    pub(crate) publisher: Arc<dyn EventPublisher>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) jobs: JobRegistry,
    policy: RetryPolicy,
    retries: RetrySender,
}

impl TaskRunner {
    pub(crate) fn new(
        repo: Arc<dyn TaskRepository>,
        logs: Arc<dyn LogSink>,
        publisher: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
        jobs: JobRegistry,
        policy: RetryPolicy,
        retries: RetrySender,
    ) -> Self {
        Self {
            repo,
            logs,
            publisher,
            clock,
            jobs,
            policy,
            retries,
        }
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Spawn the attempt chain for a task this caller has just claimed.
    pub(crate) fn start(self: &Arc<Self>, claimed: TaskState) -> Uuid {
        let run_id = Uuid::now_v7();
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            info!(task_id = %claimed.id, task = %claimed.name, %run_id, "executing scheduled task");
            runner.record(&claimed, LogLevel::Info, "Task started.");
            runner
                .run_attempt(Attempt {
                    task: claimed,
                    run_id,
                    number: 1,
                })
                .await;
        });
        run_id
    }

    /// Execute one attempt and advance the chain: finish it, or park the
    /// next attempt on the retry queue.
    pub(crate) async fn run_attempt(&self, attempt: Attempt) {
        debug!(
            task_id = %attempt.task.id,
            task = %attempt.task.name,
            attempt = attempt.number,
            run_id = %attempt.run_id,
            "executing attempt"
        );
        if attempt.number > 1 {
            self.apply(attempt.task.id, &TaskUpdate::status(TaskStatus::Running));
        }

        match self.execute(&attempt).await {
            Ok(()) => self.complete(&attempt),
            Err(err) => self.fail(attempt, err),
        }
    }

    async fn execute(&self, attempt: &Attempt) -> Result<(), JobError> {
        let job = self
            .jobs
            .get(&attempt.task.name)
            .ok_or_else(|| JobError::NotRegistered(attempt.task.name.clone()))?;
        let ctx = JobContext {
            task_id: attempt.task.id,
            task_name: attempt.task.name.clone(),
            run_id: attempt.run_id,
            attempt: attempt.number,
            started_at: self.now(),
        };

        // Own task so a panicking job surfaces as a failed attempt.
        match tokio::spawn(async move { job.run(&ctx).await }).await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => {
                Err(JobError::Panicked(panic_message(join_err.into_panic())))
            }
            Err(join_err) => Err(JobError::Panicked(join_err.to_string())),
        }
    }

    fn complete(&self, attempt: &Attempt) {
        let task = &attempt.task;
        self.record(
            task,
            LogLevel::Info,
            &format!("Task completed successfully on attempt {}.", attempt.number),
        );

        let mut update = TaskUpdate::status(TaskStatus::Completed);
        match CronSchedule::parse(&task.cron_schedule) {
            Ok(schedule) => update.next_run_at = schedule.next_after(self.now()),
            Err(e) => error!(task_id = %task.id, error = %e, "cannot compute next run"),
        }
        self.apply(task.id, &update);
    }

    fn fail(&self, attempt: Attempt, err: JobError) {
        let task = &attempt.task;
        let number = attempt.number;

        if !self.policy.should_retry(number) {
            self.record(
                task,
                LogLevel::Error,
                &format!(
                    "Task failed on attempt {number}: {err}. Task failed after {} attempts.",
                    self.policy.max_attempts
                ),
            );
            self.apply(task.id, &TaskUpdate::status(TaskStatus::Failed));
            return;
        }

        self.record(
            task,
            LogLevel::Error,
            &format!("Task failed on attempt {number}: {err}"),
        );
        let delay = self.policy.delay_for(number);
        self.record(
            task,
            LogLevel::Warn,
            &format!("Retrying in {} seconds...", delay.as_secs_f64()),
        );
        self.apply(task.id, &TaskUpdate::status(TaskStatus::Retrying));

        let task_id = task.id;
        let next = Attempt {
            number: number + 1,
            ..attempt
        };
        if !self.retries.submit(next, delay) {
            warn!(%task_id, "retry queue closed; attempt chain abandoned");
        }
    }

    /// Append a log line, mirror it to tracing and refresh `last_log_message`.
    fn record(&self, task: &TaskState, level: LogLevel, message: &str) {
        match level {
            LogLevel::Info => info!(task_id = %task.id, task = %task.name, "{message}"),
            LogLevel::Warn => warn!(task_id = %task.id, task = %task.name, "{message}"),
            LogLevel::Error => error!(task_id = %task.id, task = %task.name, "{message}"),
        }

        if let Err(e) = self.logs.append_log(task.id, level, message) {
            error!(task_id = %task.id, error = %e, "failed to write task log");
            return;
        }
        self.apply(task.id, &TaskUpdate::last_log_message(message));
    }

    /// Persist `update` and publish the resulting row.
    pub(crate) fn apply(&self, task_id: TaskId, update: &TaskUpdate) -> Option<TaskState> {
        match self.repo.update_task(task_id, update) {
            Ok(row) => {
                self.publisher.publish(TASK_UPDATE_EVENT, &row);
                Some(row)
            }
            Err(e) => {
                error!(%task_id, error = %e, "failed to persist task update");
                None
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
