use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use cadence_core::{LogEntry, SchedulerConfig, TaskDescriptor, TaskId, TaskState};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, SchedulerError};
use crate::job::{Job, JobRegistry};
use crate::publisher::{EventPublisher, NullPublisher};
use crate::registry::{self, ArmedTask};
use crate::repository::{LogSink, TaskRepository};
use crate::retry::{drive_retries, retry_channel, RetryPolicy, RetryReceiver};
use crate::runner::TaskRunner;
use crate::trigger::{dispatch, run_trigger, DispatchOutcome, TriggerSource};

/// Explicit scheduler instance holding its injected collaborators.
///
/// Cheap to clone; clones share the same runner and retry queue.
#[derive(Clone)]
pub struct Scheduler {
    runner: Arc<TaskRunner>,
    retry_rx: Arc<Mutex<Option<RetryReceiver>>>,
    default_log_limit: usize,
    max_log_limit: usize,
}

impl Scheduler {
    /// Start building a scheduler over the given store.
    pub fn builder(repo: Arc<dyn TaskRepository>, logs: Arc<dyn LogSink>) -> SchedulerBuilder {
        SchedulerBuilder::new(repo, logs)
    }

    /// Reconcile `descriptors` with the store without arming anything.
    pub fn initialize(&self, descriptors: &[TaskDescriptor]) -> Result<Vec<ArmedTask>> {
        registry::initialize(&self.runner, descriptors)
    }

    /// Reconcile, arm one cron trigger per task and start the retry queue.
    ///
    /// Must be called from within a tokio runtime. A scheduler starts once;
    /// later calls return [`SchedulerError::AlreadyStarted`].
    pub fn start(&self, descriptors: &[TaskDescriptor]) -> Result<SchedulerHandle> {
        let mut slot = self.retry_rx.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            return Err(SchedulerError::AlreadyStarted);
        }
        let armed = self.initialize(descriptors)?;
        let Some(retry_rx) = slot.take() else {
            return Err(SchedulerError::AlreadyStarted);
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(armed.len() + 1);
        tasks.push(tokio::spawn(drive_retries(
            retry_rx,
            Arc::clone(&self.runner),
            shutdown_rx.clone(),
        )));
        for task in &armed {
            tasks.push(tokio::spawn(run_trigger(
                Arc::clone(&self.runner),
                task.clone(),
                shutdown_rx.clone(),
            )));
        }
        info!(triggers = armed.len(), "scheduler started");

        Ok(SchedulerHandle {
            runner: Arc::clone(&self.runner),
            armed,
            shutdown_tx,
            tasks,
        })
    }

    /// Start and block until `shutdown` broadcasts `true`.
    pub async fn run(
        &self,
        descriptors: &[TaskDescriptor],
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let handle = self.start(descriptors)?;
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        handle.shutdown().await;
        Ok(())
    }

    /// All tasks sorted by name.
    pub fn list_tasks(&self) -> Result<Vec<TaskState>> {
        self.runner.repo.list_tasks()
    }

    pub fn find_task(&self, id: TaskId) -> Result<Option<TaskState>> {
        self.runner.repo.find_task_by_id(id)
    }

    /// Newest-first log tail. `limit` defaults to the configured default and
    /// is capped at the configured maximum.
    pub fn task_logs(&self, id: TaskId, limit: Option<usize>) -> Result<Vec<LogEntry>> {
        let limit = limit
            .unwrap_or(self.default_log_limit)
            .min(self.max_log_limit);
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.runner.logs.list_logs(id, limit)
    }
}

/// Control surface of a started scheduler.
pub struct SchedulerHandle {
    runner: Arc<TaskRunner>,
    armed: Vec<ArmedTask>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("armed", &self.armed)
            .field("running", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl SchedulerHandle {
    /// Tasks that have a live cron trigger.
    pub fn armed(&self) -> &[ArmedTask] {
        &self.armed
    }

    /// Run a task now, through the same skip-or-claim path as a cron fire.
    pub fn trigger_now(&self, id: TaskId) -> Result<DispatchOutcome> {
        if !self.armed.iter().any(|t| t.task_id == id) {
            return Err(SchedulerError::TaskNotScheduled { id });
        }
        dispatch(&self.runner, id, TriggerSource::Manual)
    }

    /// Stop every trigger and the retry queue. Jobs already executing run
    /// to completion; retries still waiting on their backoff are dropped.
    pub async fn shutdown(self) {
        info!("scheduler shutting down");
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!("scheduler stopped");
    }
}

/// Builder for creating a scheduler.
pub struct SchedulerBuilder {
    repo: Arc<dyn TaskRepository>,
    logs: Arc<dyn LogSink>,
    publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    jobs: JobRegistry,
    default_log_limit: usize,
    max_log_limit: usize,
}

impl SchedulerBuilder {
    pub fn new(repo: Arc<dyn TaskRepository>, logs: Arc<dyn LogSink>) -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            repo,
            logs,
            publisher: Arc::new(NullPublisher),
            clock: Arc::new(SystemClock),
            policy: RetryPolicy::default(),
            jobs: JobRegistry::new(),
            default_log_limit: defaults.default_log_limit,
            max_log_limit: defaults.max_log_limit,
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Apply retry and log-limit settings from config.
    pub fn with_config(mut self, config: &SchedulerConfig) -> Self {
        self.default_log_limit = config.default_log_limit;
        self.max_log_limit = config.max_log_limit;
        self.with_retry_policy(RetryPolicy::from_config(config))
    }

    /// Register the unit of work for the task named `name`.
    pub fn with_job(mut self, name: impl Into<String>, job: impl Job + 'static) -> Self {
        self.jobs.register(name, Arc::new(job));
        self
    }

    pub fn build(self) -> Scheduler {
        let (retry_tx, retry_rx) = retry_channel();
        let runner = TaskRunner::new(
            self.repo,
            self.logs,
            self.publisher,
            self.clock,
            self.jobs,
            self.policy,
            retry_tx,
        );
        Scheduler {
            runner: Arc::new(runner),
            retry_rx: Arc::new(Mutex::new(Some(retry_rx))),
            default_log_limit: self.default_log_limit,
            max_log_limit: self.max_log_limit,
        }
    }
}
