//! Updates waiting for their section to become visible.
//!
//! One entry per key; a newer update replaces the older one. The owner
//! decides when to flush and reports failures back, which either yields the
//! next retry delay or drops the entry for good.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::DashboardSettings;

#[derive(Debug, Clone, PartialEq)]
struct PendingEntry<U> {
    update: U,
    attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    Dropped,
}

#[derive(Debug)]
pub struct PendingQueue<U> {
    entries: HashMap<String, PendingEntry<U>>,
    retry_delay: Duration,
    max_attempts: u32,
}

impl<U> Default for PendingQueue<U> {
    fn default() -> Self {
        Self::new(&DashboardSettings::default())
    }
}

impl<U> PendingQueue<U> {
    pub fn new(settings: &DashboardSettings) -> Self {
        Self {
            entries: HashMap::new(),
            retry_delay: settings.pending_retry_delay(),
            max_attempts: settings.pending_max_attempts,
        }
    }

    /// Stores `update` for `key`, replacing anything queued before.
    pub fn queue(&mut self, key: &str, update: U) {
        if self.entries.contains_key(key) {
            debug!(key, "replacing pending update");
        }
        self.entries
            .insert(key.to_string(), PendingEntry { update, attempts: 0 });
    }

    pub fn get(&self, key: &str) -> Option<&U> {
        self.entries.get(key).map(|e| &e.update)
    }

    /// Removes the entry so it can be applied.
    pub fn take(&mut self, key: &str) -> Option<U> {
        self.entries.remove(key).map(|e| e.update)
    }

    /// Records a failed flush.
    pub fn record_failure(&mut self, key: &str) -> RetryDecision {
        let Some(entry) = self.entries.get_mut(key) else {
            return RetryDecision::Dropped;
        };
        entry.attempts += 1;
        if entry.attempts >= self.max_attempts {
            self.entries.remove(key);
            warn!(key, attempts = self.max_attempts, "pending update dropped, section never became visible");
            return RetryDecision::Dropped;
        }
        RetryDecision::RetryAfter(self.retry_delay)
    }

    pub fn attempts(&self, key: &str) -> Option<u32> {
        self.entries.get(key).map(|e| e.attempts)
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_update_wins() {
        let mut queue = PendingQueue::default();
        queue.queue("p", 1);
        queue.record_failure("p");
        queue.queue("p", 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.attempts("p"), Some(0));
        assert_eq!(queue.take("p"), Some(2));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_bounded_retries() {
        let settings = DashboardSettings {
            pending_max_attempts: 3,
            ..Default::default()
        };
        let mut queue = PendingQueue::new(&settings);
        queue.queue("p", "update");
        assert_eq!(
            queue.record_failure("p"),
            RetryDecision::RetryAfter(Duration::from_millis(500))
        );
        assert_eq!(
            queue.record_failure("p"),
            RetryDecision::RetryAfter(Duration::from_millis(500))
        );
        assert_eq!(queue.record_failure("p"), RetryDecision::Dropped);
        assert!(!queue.contains("p"));
        assert_eq!(queue.record_failure("p"), RetryDecision::Dropped);
    }
}
