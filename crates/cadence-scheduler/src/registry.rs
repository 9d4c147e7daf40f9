//! Startup reconciliation of compiled-in descriptors against persisted rows.

use std::collections::HashSet;

use cadence_core::{TaskDescriptor, TaskId, TaskStatus};
use tracing::{error, info, warn};

use crate::error::{Result, SchedulerError};
use crate::publisher::TASK_UPDATE_EVENT;
use crate::repository::{TaskDefaults, TaskUpdate};
use crate::runner::TaskRunner;
use crate::schedule::CronSchedule;

/// A task that passed reconciliation and gets a cron trigger.
#[derive(Debug, Clone)]
pub struct ArmedTask {
    pub task_id: TaskId,
    pub name: String,
    pub schedule: CronSchedule,
}

/// Bring the store into agreement with `descriptors` and return the tasks
/// to arm.
///
/// A malformed cron expression, a missing job or a duplicate name excludes
/// only that descriptor. Repository failures abort: the store must be
/// reachable at startup.
pub(crate) fn initialize(
    runner: &TaskRunner,
    descriptors: &[TaskDescriptor],
) -> Result<Vec<ArmedTask>> {
    info!(
        count = descriptors.len(),
        jobs = ?runner.jobs.names(),
        "initializing scheduler"
    );

    let mut seen = HashSet::new();
    let mut armed = Vec::with_capacity(descriptors.len());
    for descriptor in descriptors {
        if !seen.insert(descriptor.name.as_str()) {
            let err = SchedulerError::DuplicateTask {
                name: descriptor.name.clone(),
            };
            error!(task = %descriptor.name, "{err}; later descriptor ignored");
            continue;
        }
        if let Some(task) = reconcile(runner, descriptor)? {
            armed.push(task);
        }
    }

    info!(armed = armed.len(), "scheduler initialized");
    Ok(armed)
}

fn reconcile(runner: &TaskRunner, descriptor: &TaskDescriptor) -> Result<Option<ArmedTask>> {
    let repo = &runner.repo;
    let (mut task, created) = repo.find_or_create_task(
        &descriptor.name,
        &TaskDefaults::idle(descriptor.cron_schedule.as_str()),
    )?;

    let mut schedule_changed = false;
    if created {
        info!(task_id = %task.id, task = %task.name, "task created in store");
    } else {
        let mut update = TaskUpdate::default();
        if task.cron_schedule != descriptor.cron_schedule {
            info!(
                task = %task.name,
                old = %task.cron_schedule,
                new = %descriptor.cron_schedule,
                "task schedule updated in store"
            );
            update = TaskUpdate::cron_schedule(descriptor.cron_schedule.as_str());
            schedule_changed = true;
        }
        // No execution context survives a restart; the chain is lost.
        if task.status.is_claimed() {
            warn!(
                task = %task.name,
                status = %task.status,
                "task was {} at startup; resetting to idle",
                task.status
            );
            update.status = Some(TaskStatus::Idle);
        }
        if !update.is_empty() {
            task = repo.update_task(task.id, &update)?;
            runner.publisher.publish(TASK_UPDATE_EVENT, &task);
        }
    }

    let schedule = match CronSchedule::parse(&task.cron_schedule) {
        Ok(schedule) => schedule,
        Err(e) => {
            error!(task = %task.name, error = %e, "error parsing cron schedule; task will not be triggered");
            return Ok(None);
        }
    };

    if !runner.jobs.contains(&task.name) {
        let err = SchedulerError::JobNotRegistered {
            name: task.name.clone(),
        };
        error!(task = %task.name, "{err}; task will not be triggered");
        return Ok(None);
    }

    let now = runner.now();
    if schedule_changed || task.next_run_at.map_or(true, |at| at < now) {
        if let Some(next) = schedule.next_after(now) {
            task = repo.update_task(task.id, &TaskUpdate::next_run_at(next))?;
            runner.publisher.publish(TASK_UPDATE_EVENT, &task);
        }
    }

    info!(task_id = %task.id, task = %task.name, schedule = %schedule, "scheduling task");
    Ok(Some(ArmedTask {
        task_id: task.id,
        name: task.name,
        schedule,
    }))
}
