//! `cadence-core`: domain types, configuration and errors shared by the
//! scheduler library and the daemon.

pub mod config;
pub mod error;
pub mod types;

pub use config::{CadenceConfig, DatabaseConfig, LoggingConfig, SchedulerConfig};
pub use error::{CadenceError, Result};
pub use types::{LogEntry, LogLevel, TaskDescriptor, TaskId, TaskState, TaskStatus};
