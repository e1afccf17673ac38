use thiserror::Error;

use crate::task::TaskId;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Rejected at submit time: bad delay/period combination or missing callback.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// The task's entity or location no longer exists.
    #[error("Target of task {task} is gone")]
    TargetGone { task: TaskId },

    /// The target never became owned inside the retry window.
    #[error("Target of task {task} stayed unresolved for {waited_ms}ms ({attempts} attempts)")]
    TargetUnresolved {
        task: TaskId,
        waited_ms: u64,
        attempts: u32,
    },

    #[error(transparent)]
    Callback(#[from] CallbackError),

    /// A [`crate::slot::TaskSlot`] was asked to schedule a second time.
    #[error("Task is already scheduled")]
    AlreadyScheduled,

    /// A [`crate::slot::TaskSlot`] was queried before it was scheduled.
    #[error("Task is not scheduled yet")]
    NotScheduled,

    #[error("Scheduler has been shut down")]
    ShutDown,

    /// The off-loop worker runtime could not be started.
    #[error("Runtime error: {0}")]
    Runtime(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] regiontick_core::CoreError),
}

/// A panic that escaped a task callback.
///
/// Caught by the dispatcher, logged, and forwarded on the error side channel.
/// The task itself keeps its schedule.
#[derive(Debug, Clone, Error)]
#[error("Callback of task {task} panicked: {message}")]
pub struct CallbackError {
    pub task: TaskId,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
