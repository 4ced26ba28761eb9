//! Fixed-delay timers and the bounded wait for a rendered view.
//!
//! Flash removal and pending-update retries are scheduled here and fired by
//! the host loop. Nothing runs on its own; the owner asks for due tasks.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::dom::FlashTarget;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerTask {
    RemoveFlash(FlashTarget),
    /// Retry flushing the pending update for a portfolio.
    RetryPending(String),
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    // (deadline, sequence) keeps insertion order for equal deadlines
    tasks: BTreeMap<(Instant, u64), TimerTask>,
    seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, delay: Duration, task: TimerTask) {
        self.schedule_at(Instant::now() + delay, task);
    }

    pub fn schedule_at(&mut self, deadline: Instant, task: TimerTask) {
        self.seq += 1;
        self.tasks.insert((deadline, self.seq), task);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.tasks.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Removes and returns every task due at `now`, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<TimerTask> {
        let mut due = Vec::new();
        while let Some(entry) = self.tasks.first_entry() {
            if entry.key().0 > now {
                break;
            }
            due.push(entry.remove());
        }
        due
    }

    /// Drops scheduled retries for one portfolio.
    pub fn cancel_retries(&mut self, portfolio_uuid: &str) {
        self.tasks
            .retain(|_, task| !matches!(task, TimerTask::RetryPending(uuid) if uuid == portfolio_uuid));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn clear(&mut self) {
        self.tasks.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Found,
    /// The deadline passed, or the sender went away first.
    TimedOut,
}

/// Waits until the watched value satisfies `condition`, at most `timeout`.
pub async fn wait_for<T>(
    rx: &mut watch::Receiver<T>,
    timeout: Duration,
    condition: impl FnMut(&T) -> bool,
) -> WaitOutcome {
    match tokio::time::timeout(timeout, rx.wait_for(condition)).await {
        Ok(Ok(_)) => WaitOutcome::Found,
        Ok(Err(_)) | Err(_) => WaitOutcome::TimedOut,
    }
}
