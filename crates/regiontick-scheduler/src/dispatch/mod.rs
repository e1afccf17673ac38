//! Tick-bound dispatch. One [`Dispatcher`] implementation per threading
//! model; the scheduler picks one at bind time and never switches.

pub mod sharded;
pub mod single_loop;

use std::cmp::Ordering;
use std::time::Instant;

use regiontick_core::{ContextId, Ownership, ThreadingModel};
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::error::CallbackError;
use crate::task::{TaskFailure, TaskHandle, TaskId, TaskTable};

pub use sharded::ShardedDispatcher;
pub use single_loop::SingleLoopDispatcher;

/// What both threading models must provide.
pub trait Dispatcher: Send + Sync {
    fn model(&self) -> ThreadingModel;

    /// Accept a validated task. `ownership` is the answer the scheduler got
    /// at submit time; `Invalid` fails the task on the spot.
    fn enqueue(&self, task: TaskHandle, delay_ticks: u64, ownership: Ownership);

    /// Run everything due on `ctx` at `tick`. Called on that context's thread.
    fn tick(&self, ctx: ContextId, tick: u64);

    /// Re-resolve parked tasks. Returns how many were handed to an owner.
    fn poll_retries(&self, _now: Instant) -> usize {
        0
    }

    /// The host dissolved `ctx`; whatever it held, or is later routed to it,
    /// must find a new owner. Context ids are not reused after this.
    fn retire_context(&self, _ctx: ContextId) {}

    /// Cancel every task this dispatcher holds.
    fn cancel_all(&self) -> usize;

    /// Tasks that can still fire.
    fn pending(&self) -> usize;

    /// Look up a task this dispatcher holds.
    fn task(&self, id: TaskId) -> Option<TaskHandle>;
}

/// Side channel for callback panics.
///
/// Every report is logged; if a channel is attached, a copy is sent with
/// `try_send` so a tick thread never blocks on a slow consumer.
#[derive(Clone, Default)]
pub struct ErrorSink {
    tx: Option<mpsc::Sender<CallbackError>>,
}

impl ErrorSink {
    pub fn new(tx: Option<mpsc::Sender<CallbackError>>) -> Self {
        Self { tx }
    }

    pub fn report(&self, err: CallbackError) {
        error!(task_id = %err.task, message = %err.message, "task callback panicked");
        if let Some(ref tx) = self.tx {
            if tx.try_send(err).is_err() {
                warn!("callback error channel full or closed; report dropped");
            }
        }
    }
}

/// A queued firing: which task, when, and in what order among equals.
///
/// Ordered so the earliest fire tick pops first from a max-heap; `seq`
/// keeps submission order among tasks due on the same tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Due {
    pub fire_tick: u64,
    pub seq: u64,
    pub task: TaskId,
}

impl Ord for Due {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap behavior
        other
            .fire_tick
            .cmp(&self.fire_tick)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Due {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Fail a task terminally, run its retired callback when the target is
/// gone, and drop it from the table.
pub(crate) fn fail_task(tasks: &TaskTable, task: &TaskHandle, failure: TaskFailure) {
    let gone = failure == TaskFailure::TargetGone;
    if task.fail(failure.clone()) {
        warn!(task_id = %task.id(), target = %task.target(), ?failure, "task failed");
        if gone {
            task.retire();
        }
    }
    tasks.remove(task.id());
}
