//! `cadence-scheduler`: cron-driven background tasks with SQLite-persisted
//! state, bounded retries and an append-only execution log.
//!
//! # Overview
//!
//! Tasks are declared in code as [`TaskDescriptor`](cadence_core::TaskDescriptor)s
//! and paired with a [`Job`] by name. On [`Scheduler::start`] every descriptor
//! is reconciled with its `scheduled_tasks` row, and each valid task gets its
//! own cron trigger. A fire claims the row atomically (`running`), runs the
//! job, and on failure parks the next attempt on a delay queue with
//! exponential backoff.
//!
//! # Status lifecycle
//!
//! | From                    | To          | When                          |
//! |-------------------------|-------------|-------------------------------|
//! | `idle`/`completed`/`failed` | `running` | trigger fires and claims     |
//! | `running`               | `completed` | job succeeded                 |
//! | `running`               | `retrying`  | job failed, attempts remain   |
//! | `retrying`              | `running`   | backoff elapsed               |
//! | `running`               | `failed`    | final attempt failed          |
//!
//! A trigger that finds its task `running` or `retrying` skips the fire.

pub mod clock;
pub mod db;
pub mod engine;
pub mod error;
pub mod job;
pub mod publisher;
pub mod registry;
pub mod repository;
pub mod retry;
mod runner;
pub mod schedule;
pub mod store;
pub mod trigger;

pub use clock::{Clock, SystemClock, TokioClock};
pub use db::init_db;
pub use engine::{Scheduler, SchedulerBuilder, SchedulerHandle};
pub use error::{Result, SchedulerError};
pub use job::{job_fn, FnJob, Job, JobContext, JobError, JobRegistry};
pub use publisher::{BroadcastPublisher, EventPublisher, NullPublisher, TaskEvent, TASK_UPDATE_EVENT};
pub use registry::ArmedTask;
pub use repository::{LogSink, TaskDefaults, TaskRepository, TaskUpdate};
pub use retry::RetryPolicy;
pub use schedule::CronSchedule;
pub use store::SqliteStore;
pub use trigger::{DispatchOutcome, TriggerSource};
