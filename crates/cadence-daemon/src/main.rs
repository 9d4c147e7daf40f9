use std::sync::Arc;

use anyhow::Context;
use cadence_core::{CadenceConfig, TaskId};
use cadence_scheduler::{BroadcastPublisher, Scheduler, SqliteStore};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

mod jobs;

#[derive(Parser)]
#[command(name = "cadence-daemon")]
#[command(author, version, about = "Cron-driven background task runner", long_about = None)]
struct Cli {
    /// Path to cadence.toml
    #[arg(short, long, env = "CADENCE_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until Ctrl-C (default)
    Run,

    /// Print every task row as JSON
    Tasks,

    /// Print the newest log lines of one task as JSON
    Logs {
        /// Task name or numeric id
        task: String,

        /// Maximum number of lines
        #[arg(short, long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // load config: --config > CADENCE_CONFIG env > ~/.cadence/cadence.toml
    // filter comes from config: report a load failure once the subscriber exists
    let (config, config_error) = match CadenceConfig::load(cli.config.as_deref()) {
        Ok(config) => (config, None),
        Err(e) => (CadenceConfig::default(), Some(e)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.filter.as_str().into()),
        )
        .init();
    if let Some(e) = config_error {
        warn!("Config load failed ({}), using defaults", e);
    }

    let db_path = config.database.path.clone();
    config.database.ensure_parent_dir()?;
    info!(path = %db_path, "opening SQLite database");
    let conn = rusqlite::Connection::open(&db_path)
        .with_context(|| format!("opening database at {db_path}"))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    let store = Arc::new(SqliteStore::new(conn)?);

    let publisher = Arc::new(BroadcastPublisher::new(config.scheduler.event_capacity));
    let scheduler = Scheduler::builder(store.clone(), store)
        .with_publisher(publisher.clone())
        .with_config(&config.scheduler)
        .with_job(jobs::HEARTBEAT, jobs::HeartbeatJob::new(&db_path))
        .with_job(jobs::DAILY_MAINTENANCE, jobs::MaintenanceJob::new(&db_path))
        .build();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(scheduler, &publisher).await,
        Commands::Tasks => {
            let tasks = scheduler.list_tasks()?;
            println!("{}", serde_json::to_string_pretty(&tasks)?);
            Ok(())
        }
        Commands::Logs { task, limit } => {
            let id = resolve_task(&scheduler, &task)?;
            let logs = scheduler.task_logs(id, limit)?;
            println!("{}", serde_json::to_string_pretty(&logs)?);
            Ok(())
        }
    }
}

async fn run(scheduler: Scheduler, publisher: &BroadcastPublisher) -> anyhow::Result<()> {
    // forward task_update events to tracing; stands in for a push transport
    let mut events = publisher.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ev) => debug!(
                    event = %ev.event,
                    task_id = %ev.payload.id,
                    status = %ev.payload.status,
                    payload = %serde_json::to_string(&ev.payload).unwrap_or_default(),
                    "task update"
                ),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "event subscriber lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received, shutting down"),
            Err(e) => warn!("failed to listen for Ctrl-C ({}), shutting down", e),
        }
        let _ = shutdown_tx.send(true);
    });

    info!("cadence daemon running");
    scheduler.run(&jobs::descriptors(), shutdown_rx).await?;
    Ok(())
}

/// Accept a task name, or a numeric id when no task has that name.
fn resolve_task(scheduler: &Scheduler, task: &str) -> anyhow::Result<TaskId> {
    if let Some(found) = scheduler.list_tasks()?.into_iter().find(|t| t.name == task) {
        return Ok(found.id);
    }
    let id = task
        .parse::<i64>()
        .map(TaskId)
        .map_err(|_| anyhow::anyhow!("no task named {task:?}"))?;
    scheduler
        .find_task(id)?
        .map(|t| t.id)
        .with_context(|| format!("no task named or numbered {task:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::TaskDescriptor;
    use cadence_scheduler::job_fn;

    fn scheduler() -> Scheduler {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let store = Arc::new(SqliteStore::new(conn).unwrap());
        let scheduler = Scheduler::builder(store.clone(), store)
            .with_job("7", job_fn(|_| async { Ok(()) }))
            .with_job(jobs::HEARTBEAT, job_fn(|_| async { Ok(()) }))
            .build();
        scheduler
            .initialize(&[
                TaskDescriptor::new(jobs::HEARTBEAT, "* * * * *"),
                TaskDescriptor::new("7", "0 3 * * *"),
            ])
            .unwrap();
        scheduler
    }

    fn id_of(scheduler: &Scheduler, name: &str) -> TaskId {
        scheduler
            .list_tasks()
            .unwrap()
            .into_iter()
            .find(|t| t.name == name)
            .unwrap()
            .id
    }

    #[test]
    fn digit_only_names_resolve_by_name_first() {
        let scheduler = scheduler();
        let seven = id_of(&scheduler, "7");
        assert_ne!(seven, TaskId(7));
        assert_eq!(resolve_task(&scheduler, "7").unwrap(), seven);
    }

    #[test]
    fn numeric_ids_resolve_when_no_name_matches() {
        let scheduler = scheduler();
        let heartbeat = id_of(&scheduler, jobs::HEARTBEAT);
        assert_eq!(
            resolve_task(&scheduler, &heartbeat.to_string()).unwrap(),
            heartbeat
        );
        assert_eq!(resolve_task(&scheduler, jobs::HEARTBEAT).unwrap(), heartbeat);
    }

    #[test]
    fn unknown_tasks_are_errors() {
        let scheduler = scheduler();
        assert!(resolve_task(&scheduler, "nope").is_err());
        assert!(resolve_task(&scheduler, "999").is_err());
    }
}
