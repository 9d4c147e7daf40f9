//! Exponential backoff policy and the delayed-retry queue.

use std::sync::Arc;
use std::time::Duration;

use cadence_core::SchedulerConfig;
use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_util::time::DelayQueue;
use tracing::{debug, warn};

use crate::runner::{Attempt, TaskRunner};

/// Bounded exponential backoff: attempt `k` that fails is retried after
/// `2^k * base_delay`, up to `max_attempts` attempts per chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.backoff_base_ms),
        )
    }

    /// Delay before the attempt that follows failed attempt `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

struct Submission {
    attempt: Attempt,
    delay: Duration,
}

/// Handle used by the runner to park an attempt until its backoff elapses.
#[derive(Clone)]
pub(crate) struct RetrySender {
    tx: mpsc::UnboundedSender<Submission>,
}

impl RetrySender {
    /// Returns false once the driver has stopped.
    pub(crate) fn submit(&self, attempt: Attempt, delay: Duration) -> bool {
        self.tx.send(Submission { attempt, delay }).is_ok()
    }
}

/// Receiving half, consumed by [`drive_retries`] when the scheduler starts.
pub(crate) struct RetryReceiver {
    rx: mpsc::UnboundedReceiver<Submission>,
}

pub(crate) fn retry_channel() -> (RetrySender, RetryReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RetrySender { tx }, RetryReceiver { rx })
}

/// Own the delay queue until shutdown. Each expired attempt runs on its own
/// tokio task so a slow job never holds up another task's retry.
pub(crate) async fn drive_retries(
    receiver: RetryReceiver,
    runner: Arc<TaskRunner>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut rx = receiver.rx;
    let mut queue: DelayQueue<Attempt> = DelayQueue::new();

    loop {
        tokio::select! {
            Some(submission) = rx.recv() => {
                debug!(
                    task_id = %submission.attempt.task.id,
                    attempt = submission.attempt.number,
                    delay_ms = submission.delay.as_millis() as u64,
                    "retry queued"
                );
                queue.insert(submission.attempt, submission.delay);
            }
            Some(expired) = queue.next(), if !queue.is_empty() => {
                let runner = Arc::clone(&runner);
                let attempt = expired.into_inner();
                tokio::spawn(async move { runner.run_attempt(attempt).await });
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    if !queue.is_empty() {
        warn!(pending = queue.len(), "retry driver stopping; pending retries dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(8000));
    }

    #[test]
    fn retries_stop_at_the_ceiling() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn policy_follows_config() {
        let config = SchedulerConfig {
            max_attempts: 5,
            backoff_base_ms: 250,
            ..SchedulerConfig::default()
        };
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
    }

    #[test]
    fn huge_attempt_numbers_saturate() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(64), Duration::from_millis(1000).saturating_mul(u32::MAX));
    }
}
