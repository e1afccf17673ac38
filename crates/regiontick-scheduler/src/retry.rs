use std::time::{Duration, Instant};

use dashmap::DashMap;
use regiontick_core::config::RetryConfig;

use crate::task::{TaskFailure, TaskId};

/// A task waiting for its target to become owned.
#[derive(Debug, Clone)]
pub struct RetryEntry {
    pub task: TaskId,
    /// When the task should fire, on the global context's tick count.
    /// Translated into the owner's tick count at handoff.
    pub fire_ref: u64,
    /// First time the target was seen unowned; the window runs from here.
    pub first_seen: Instant,
    pub attempts: u32,
}

impl RetryEntry {
    pub fn new(task: TaskId, fire_ref: u64, now: Instant) -> Self {
        Self {
            task,
            fire_ref,
            first_seen: now,
            attempts: 0,
        }
    }

    pub fn waited(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.first_seen)
    }
}

/// Ceilings for how long an unowned target is waited on.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub window: Duration,
    pub max_attempts: u32,
    pub max_unowned_ticks: u32,
}

impl RetryPolicy {
    /// Sharded retries: wall-clock window plus attempt ceiling.
    pub fn exhausted(&self, entry: &RetryEntry, now: Instant) -> Option<TaskFailure> {
        let waited = entry.waited(now);
        if waited >= self.window || entry.attempts >= self.max_attempts {
            Some(unresolved(entry, waited))
        } else {
            None
        }
    }

    /// Single-loop retries: tick ceiling, still bounded by the wall-clock window.
    pub fn exhausted_ticks(&self, entry: &RetryEntry, now: Instant) -> Option<TaskFailure> {
        let waited = entry.waited(now);
        if waited >= self.window || entry.attempts > self.max_unowned_ticks {
            Some(unresolved(entry, waited))
        } else {
            None
        }
    }
}

fn unresolved(entry: &RetryEntry, waited: Duration) -> TaskFailure {
    TaskFailure::TargetUnresolved {
        waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
        attempts: entry.attempts,
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            window: cfg.window(),
            max_attempts: cfg.max_attempts,
            max_unowned_ticks: cfg.max_unowned_ticks,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// Tasks parked until their target resolves.
///
/// Written by submitting threads, region threads (ownership lost at fire
/// time) and the poller, so it lives in a concurrent map.
#[derive(Default)]
pub struct RetryQueue {
    entries: DashMap<TaskId, RetryEntry>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn park(&self, entry: RetryEntry) {
        self.entries.insert(entry.task, entry);
    }

    /// Remove and return an entry; the caller re-parks it if still unowned.
    pub fn take(&self, task: TaskId) -> Option<RetryEntry> {
        self.entries.remove(&task).map(|(_, e)| e)
    }

    /// Snapshot of parked ids. Taken without holding any shard lock across
    /// host calls.
    pub fn ids(&self) -> Vec<TaskId> {
        self.entries.iter().map(|e| *e.key()).collect()
    }

    pub fn contains(&self, task: TaskId) -> bool {
        self.entries.contains_key(&task)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
