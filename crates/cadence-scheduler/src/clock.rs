//! Time sources for the scheduler.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Supplies "now" to every component that stamps or compares times.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock anchored to a fixed UTC instant that advances with tokio's timer.
///
/// Under a paused runtime (`#[tokio::test(start_paused = true)]`) time only
/// moves when tokio auto-advances to the next pending timer, so timestamps
/// written by the scheduler line up exactly with cron fires and backoff
/// delays.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    anchor: DateTime<Utc>,
    started: Instant,
}

impl TokioClock {
    /// Must be called from within a tokio runtime.
    pub fn new(anchor: DateTime<Utc>) -> Self {
        Self {
            anchor,
            started: Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().saturating_duration_since(self.started);
        self.anchor + chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::zero())
    }
}
