use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use dashmap::DashMap;
use regiontick_core::Target;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CallbackError, Result, SchedulerError};
use crate::time::TimeSpan;

/// Unique identifier for a scheduled task (UUIDv7, time-sortable for log correlation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a task.
///
/// `Completed`, `Cancelled` and `Failed` are terminal: once reached, the
/// callback is never invoked again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TaskState {
    /// Queued on an owning context, waiting for its fire tick.
    Scheduled = 0,
    /// Target not owned yet; parked until it resolves or the window closes.
    RetryPending = 1,
    /// Callback is executing right now.
    Running = 2,
    /// One-shot task ran.
    Completed = 3,
    Cancelled = 4,
    /// Terminal failure; see [`TaskHandle::failure`].
    Failed = 5,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Cancelled | TaskState::Failed
        )
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => TaskState::Scheduled,
            1 => TaskState::RetryPending,
            2 => TaskState::Running,
            3 => TaskState::Completed,
            4 => TaskState::Cancelled,
            _ => TaskState::Failed,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Scheduled => "scheduled",
            TaskState::RetryPending => "retry_pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Cancelled => "cancelled",
            TaskState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Why a task failed terminally after it was accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    /// Entity despawned or location unloaded.
    TargetGone,
    /// Still unowned when the retry window or attempt ceiling ran out.
    TargetUnresolved { waited_ms: u64, attempts: u32 },
}

impl TaskFailure {
    pub fn into_error(self, task: TaskId) -> SchedulerError {
        match self {
            TaskFailure::TargetGone => SchedulerError::TargetGone { task },
            TaskFailure::TargetUnresolved {
                waited_ms,
                attempts,
            } => SchedulerError::TargetUnresolved {
                task,
                waited_ms,
                attempts,
            },
        }
    }
}

/// The unit of work. Receives its own handle so it can cancel itself.
pub type TaskFn = Box<dyn FnMut(&TaskHandle) + Send + 'static>;

type RetiredFn = Box<dyn FnOnce() + Send + 'static>;

struct TaskInner {
    id: TaskId,
    target: Target,
    /// 0 = one-shot.
    period_ticks: u64,
    label: Option<String>,
    state: AtomicU8,
    failure: OnceLock<TaskFailure>,
    callback: Mutex<TaskFn>,
    retired: Mutex<Option<RetiredFn>>,
    runs: AtomicU64,
    panics: AtomicU64,
}

/// Shared handle to one scheduled task.
///
/// Cheap to clone. Every queue that holds a task and the caller see the same
/// state word, so cancelling through any clone is visible everywhere at once.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<TaskInner>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn target(&self) -> &Target {
        &self.inner.target
    }

    pub fn period_ticks(&self) -> u64 {
        self.inner.period_ticks
    }

    pub fn is_repeating(&self) -> bool {
        self.inner.period_ticks > 0
    }

    pub fn label(&self) -> Option<&str> {
        self.inner.label.as_deref()
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == TaskState::Cancelled
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// How many times the callback has been invoked (including panicking runs).
    pub fn run_count(&self) -> u64 {
        self.inner.runs.load(Ordering::Relaxed)
    }

    /// How many invocations panicked.
    pub fn panic_count(&self) -> u64 {
        self.inner.panics.load(Ordering::Relaxed)
    }

    /// Cancel the task. Idempotent; returns `true` only for the call that
    /// actually moved the task into `Cancelled`.
    ///
    /// A run already in progress finishes, but the task never fires again.
    pub fn cancel(&self) -> bool {
        let mut current = self.inner.state.load(Ordering::Acquire);
        loop {
            if TaskState::from_u8(current).is_terminal() {
                return false;
            }
            match self.inner.state.compare_exchange_weak(
                current,
                TaskState::Cancelled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Terminal failure reason, present only when the state is `Failed`.
    pub fn failure(&self) -> Option<TaskFailure> {
        if self.state() == TaskState::Failed {
            self.inner.failure.get().cloned()
        } else {
            None
        }
    }

    /// Terminal failure as a [`SchedulerError`].
    pub fn error(&self) -> Option<SchedulerError> {
        self.failure().map(|f| f.into_error(self.id()))
    }

    // --- dispatcher-side transitions ---------------------------------------

    fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.inner
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Scheduled/RetryPending → Running. `false` means the task went terminal.
    pub(crate) fn begin_run(&self) -> bool {
        let mut current = self.inner.state.load(Ordering::Acquire);
        loop {
            match TaskState::from_u8(current) {
                TaskState::Scheduled | TaskState::RetryPending => {}
                _ => return false,
            }
            match self.inner.state.compare_exchange_weak(
                current,
                TaskState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Running → Scheduled (repeating) or Completed (one-shot).
    /// Returns `true` when the task must be queued again.
    pub(crate) fn finish_run(&self) -> bool {
        if self.is_repeating() {
            self.transition(TaskState::Running, TaskState::Scheduled)
        } else {
            self.transition(TaskState::Running, TaskState::Completed);
            false
        }
    }

    /// Scheduled → RetryPending. `true` if the task is (now) retry-pending.
    pub(crate) fn park(&self) -> bool {
        self.transition(TaskState::Scheduled, TaskState::RetryPending)
            || self.state() == TaskState::RetryPending
    }

    /// RetryPending → Scheduled. `true` if the task is (now) scheduled.
    pub(crate) fn unpark(&self) -> bool {
        self.transition(TaskState::RetryPending, TaskState::Scheduled)
            || self.state() == TaskState::Scheduled
    }

    /// Move to `Failed` with the given reason. No-op on terminal tasks.
    pub(crate) fn fail(&self, failure: TaskFailure) -> bool {
        if self.is_terminal() {
            return false;
        }
        let _ = self.inner.failure.set(failure);
        let mut current = self.inner.state.load(Ordering::Acquire);
        loop {
            if TaskState::from_u8(current).is_terminal() {
                return false;
            }
            match self.inner.state.compare_exchange_weak(
                current,
                TaskState::Failed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Run the retired callback, at most once.
    pub(crate) fn retire(&self) {
        let retired = self
            .inner
            .retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(retired) = retired {
            if panic::catch_unwind(AssertUnwindSafe(retired)).is_err() {
                tracing::warn!(task_id = %self.id(), "retired callback panicked");
            }
        }
    }

    /// Invoke the callback, catching any panic.
    pub(crate) fn invoke(&self) -> std::result::Result<(), CallbackError> {
        let outcome = {
            let mut callback = self
                .inner
                .callback
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            panic::catch_unwind(AssertUnwindSafe(|| (*callback)(self)))
        };
        self.inner.runs.fetch_add(1, Ordering::Relaxed);

        outcome.map_err(|payload| {
            self.inner.panics.fetch_add(1, Ordering::Relaxed);
            CallbackError {
                task: self.id(),
                message: panic_message(payload.as_ref()),
            }
        })
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.inner.id)
            .field("target", &self.inner.target)
            .field("period_ticks", &self.inner.period_ticks)
            .field("label", &self.inner.label)
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for TaskHandle {}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Declarative description of a task, consumed by `Scheduler::submit`.
///
/// ```ignore
/// let spec = TaskSpec::new(Target::Global)
///     .delay(TimeSpan::ticks(20))
///     .period(TimeSpan::ticks(20))
///     .run(|_| println!("every second"));
/// ```
pub struct TaskSpec {
    pub(crate) target: Target,
    pub(crate) delay: TimeSpan,
    pub(crate) period: TimeSpan,
    callback: Option<TaskFn>,
    retired: Option<RetiredFn>,
    label: Option<String>,
}

impl TaskSpec {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            delay: TimeSpan::ZERO,
            period: TimeSpan::ZERO,
            callback: None,
            retired: None,
            label: None,
        }
    }

    pub fn delay(mut self, delay: impl Into<TimeSpan>) -> Self {
        self.delay = delay.into();
        self
    }

    /// Zero (the default) means one-shot.
    pub fn period(mut self, period: impl Into<TimeSpan>) -> Self {
        self.period = period.into();
        self
    }

    pub fn run<F>(mut self, f: F) -> Self
    where
        F: FnMut(&TaskHandle) + Send + 'static,
    {
        self.callback = Some(Box::new(f));
        self
    }

    /// Called once if the task's target disappears before the task finishes.
    pub fn on_retired<F>(mut self, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.retired = Some(Box::new(f));
        self
    }

    /// Human-readable name carried into log lines.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Check the caller's input before anything is queued.
    pub fn validate(&self) -> Result<()> {
        if self.callback.is_none() {
            return Err(SchedulerError::InvalidSchedule(
                "a callback is required".to_string(),
            ));
        }
        if self.period.is_negative() {
            return Err(SchedulerError::InvalidSchedule(format!(
                "period must not be negative (got {:?})",
                self.period
            )));
        }
        if self.period.is_positive() && self.delay.is_negative() {
            return Err(SchedulerError::InvalidSchedule(format!(
                "repeating task needs a non-negative delay (got {:?})",
                self.delay
            )));
        }
        Ok(())
    }

    /// Validate and turn the spec into a live handle in `Scheduled` state.
    pub(crate) fn into_handle(self, period_ticks: u64) -> Result<TaskHandle> {
        self.validate()?;
        let callback = self.callback.ok_or_else(|| {
            SchedulerError::InvalidSchedule("a callback is required".to_string())
        })?;
        Ok(TaskHandle {
            inner: Arc::new(TaskInner {
                id: TaskId::new(),
                target: self.target,
                period_ticks,
                label: self.label,
                state: AtomicU8::new(TaskState::Scheduled as u8),
                failure: OnceLock::new(),
                callback: Mutex::new(callback),
                retired: Mutex::new(self.retired),
                runs: AtomicU64::new(0),
                panics: AtomicU64::new(0),
            }),
        })
    }
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("target", &self.target)
            .field("delay", &self.delay)
            .field("period", &self.period)
            .field("has_callback", &self.callback.is_some())
            .field("label", &self.label)
            .finish()
    }
}

/// Arena of in-flight tasks, keyed by id. Queues hold ids; the table holds
/// the one shared handle per task.
#[derive(Clone, Default)]
pub struct TaskTable {
    tasks: Arc<DashMap<TaskId, TaskHandle>>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task: TaskHandle) {
        self.tasks.insert(task.id(), task);
    }

    pub fn get(&self, id: TaskId) -> Option<TaskHandle> {
        self.tasks.get(&id).map(|t| t.value().clone())
    }

    pub fn remove(&self, id: TaskId) -> Option<TaskHandle> {
        self.tasks.remove(&id).map(|(_, t)| t)
    }

    /// Tasks not yet purged, terminal or not.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks that can still fire.
    pub fn live(&self) -> usize {
        self.tasks.iter().filter(|t| !t.value().is_terminal()).count()
    }

    /// Cancel every task in the table; returns how many were live.
    pub fn cancel_all(&self) -> usize {
        self.tasks.iter().filter(|t| t.value().cancel()).count()
    }
}
