use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{Result, SchedulerError};
use crate::scheduler::Scheduler;
use crate::task::{TaskHandle, TaskSpec};

/// A place for one task that remembers what it scheduled.
///
/// Useful for components that own a single recurring job: they hold the slot,
/// schedule once, and cancel through it later without keeping the handle
/// around themselves.
#[derive(Debug, Default)]
pub struct TaskSlot {
    handle: Mutex<Option<TaskHandle>>,
}

impl TaskSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit `spec` and remember the handle. A slot only schedules once.
    ///
    /// The slot stays locked across the submit, so of two racing callers
    /// exactly one submits and the other gets `AlreadyScheduled`.
    pub fn schedule(&self, scheduler: &Scheduler, spec: TaskSpec) -> Result<TaskHandle> {
        let mut slot = self.lock();
        if slot.is_some() {
            return Err(SchedulerError::AlreadyScheduled);
        }
        let handle = scheduler.submit(spec)?;
        *slot = Some(handle.clone());
        Ok(handle)
    }

    pub fn handle(&self) -> Option<TaskHandle> {
        self.lock().clone()
    }

    pub fn cancel(&self) -> Result<bool> {
        Ok(self.scheduled()?.cancel())
    }

    pub fn is_cancelled(&self) -> Result<bool> {
        Ok(self.scheduled()?.is_cancelled())
    }

    fn scheduled(&self) -> Result<TaskHandle> {
        self.handle().ok_or(SchedulerError::NotScheduled)
    }

    fn lock(&self) -> MutexGuard<'_, Option<TaskHandle>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
