//! Units of work and their registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use cadence_core::TaskId;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Failure of one attempt. Always retryable; drives the backoff loop.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    #[error("{0}")]
    Failed(String),

    #[error("job panicked: {0}")]
    Panicked(String),

    #[error("no job registered for task {0:?}")]
    NotRegistered(String),
}

impl JobError {
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        JobError::Failed(reason.to_string())
    }
}

/// Context handed to a job for one attempt.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub task_id: TaskId,
    pub task_name: String,
    /// Shared by every attempt of one execution chain.
    pub run_id: Uuid,
    /// 1-based attempt number within the chain.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
}

/// The work a scheduled task performs.
///
/// `run` may take arbitrarily long; there is no timeout and the task stays
/// claimed until it returns.
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self, ctx: &JobContext) -> Result<(), JobError>;
}

/// Adapter turning an async closure into a [`Job`]. See [`job_fn`].
pub struct FnJob<F>(F);

/// Wrap `f` as a job: `job_fn(|ctx| async move { ... Ok(()) })`.
pub fn job_fn<F, Fut>(f: F) -> FnJob<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), JobError>> + Send,
{
    FnJob(f)
}

#[async_trait]
impl<F, Fut> Job for FnJob<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), JobError>> + Send,
{
    async fn run(&self, ctx: &JobContext) -> Result<(), JobError> {
        (self.0)(ctx.clone()).await
    }
}

/// Jobs keyed by task name.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: HashMap<String, Arc<dyn Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `job` for `name`, replacing any previous registration.
    pub fn register(&mut self, name: impl Into<String>, job: Arc<dyn Job>) {
        self.jobs.insert(name.into(), job);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Job>> {
        self.jobs.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.jobs.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(attempt: u32) -> JobContext {
        JobContext {
            task_id: TaskId(1),
            task_name: "heartbeat".to_string(),
            run_id: Uuid::now_v7(),
            attempt,
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn closure_jobs_see_the_attempt() {
        let job = job_fn(|ctx: JobContext| async move {
            if ctx.attempt < 2 {
                Err(JobError::failed("too early"))
            } else {
                Ok(())
            }
        });

        assert_eq!(job.run(&ctx(1)).await.unwrap_err().to_string(), "too early");
        assert!(job.run(&ctx(2)).await.is_ok());
    }

    #[test]
    fn registry_lookup_by_name() {
        let mut registry = JobRegistry::new();
        registry.register("b", Arc::new(job_fn(|_| async { Ok(()) })));
        registry.register("a", Arc::new(job_fn(|_| async { Ok(()) })));

        assert!(registry.contains("a"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), ["a", "b"]);
    }
}
