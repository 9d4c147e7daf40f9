//! Per-task cron triggers and the shared claim-and-dispatch path.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cadence_core::{TaskId, TaskStatus};
use tokio::sync::watch;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::publisher::TASK_UPDATE_EVENT;
use crate::registry::ArmedTask;
use crate::runner::TaskRunner;

/// What happened when a trigger fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The task was claimed and an attempt chain started.
    Dispatched { run_id: Uuid },
    /// Another chain holds the task (overlap skip); nothing was changed.
    Skipped { status: TaskStatus },
    /// The task row no longer exists.
    Missing,
}

/// Who asked for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Cron,
    Manual,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerSource::Cron => f.write_str("cron"),
            TriggerSource::Manual => f.write_str("manual"),
        }
    }
}

/// Reload the row, skip if it is claimed, otherwise claim it atomically and
/// hand it to the runner.
///
/// The status read is only a fast path; the conditional claim is what
/// guarantees a single active chain per task.
pub(crate) fn dispatch(
    runner: &Arc<TaskRunner>,
    task_id: TaskId,
    source: TriggerSource,
) -> Result<DispatchOutcome> {
    let Some(current) = runner.repo.find_task_by_id(task_id)? else {
        error!(%task_id, %source, "task not found for execution");
        return Ok(DispatchOutcome::Missing);
    };

    if current.status.is_claimed() {
        warn!(
            %task_id,
            task = %current.name,
            status = %current.status,
            %source,
            "skipping execution: task is {}",
            current.status
        );
        return Ok(DispatchOutcome::Skipped {
            status: current.status,
        });
    }

    match runner.repo.try_claim(task_id, runner.now())? {
        Some(claimed) => {
            runner.publisher.publish(TASK_UPDATE_EVENT, &claimed);
            Ok(DispatchOutcome::Dispatched {
                run_id: runner.start(claimed),
            })
        }
        None => {
            let status = runner
                .repo
                .find_task_by_id(task_id)?
                .map_or(TaskStatus::Running, |t| t.status);
            warn!(%task_id, %source, %status, "skipping execution: claim lost to a concurrent run");
            Ok(DispatchOutcome::Skipped { status })
        }
    }
}

/// Sleep until each cron occurrence and dispatch, until shutdown.
pub(crate) async fn run_trigger(
    runner: Arc<TaskRunner>,
    armed: ArmedTask,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut after = runner.now();

    loop {
        let Some(fire_at) = armed.schedule.next_after(after) else {
            warn!(task_id = %armed.task_id, schedule = %armed.schedule, "no further occurrences; trigger stopped");
            return;
        };
        let wait = (fire_at - runner.now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!(task_id = %armed.task_id, "trigger stopped");
                    return;
                }
                continue;
            }
        }

        debug!(task_id = %armed.task_id, task = %armed.name, %fire_at, "cron trigger fired");
        if let Err(e) = dispatch(&runner, armed.task_id, TriggerSource::Cron) {
            error!(task_id = %armed.task_id, error = %e, "error fetching task before execution");
        }

        // Never re-fire the same occurrence, and never replay ones missed
        // while the process was stalled.
        after = fire_at.max(runner.now());
    }
}
