//! `regiontick-scheduler` runs timed and repeating tasks inside a host
//! simulation, whether the host ticks everything on one global thread or
//! splits the world into regions that each tick on their own thread.
//!
//! # Overview
//!
//! Callers submit a [`TaskSpec`] through the [`Scheduler`]. The scheduler
//! binds once to a [`dispatch::Dispatcher`] for the host's threading model
//! and hands every tick-bound task to it. The dispatcher asks the
//! [`resolver::ContextResolver`] which context owns the task's target and
//! only ever fires the callback on that context's tick.
//!
//! # Targets
//!
//! | Target     | Runs on                                            |
//! |------------|----------------------------------------------------|
//! | `Global`   | the global context                                 |
//! | `Entity`   | whichever region owns the entity when it comes due |
//! | `Location` | whichever region owns the chunk                    |
//! | `Async`    | the off-loop worker pool, wall-clock timed         |
//!
//! A target with no owner yet is parked and re-resolved until the retry
//! window runs out. A target that no longer exists fails the task.

pub mod dispatch;
pub mod error;
pub mod host;
pub mod offloop;
pub mod resolver;
pub mod retry;
pub mod scheduler;
pub mod sim;
pub mod slot;
pub mod task;
pub mod time;

pub use error::{CallbackError, Result, SchedulerError};
pub use host::{Host, TickHook};
pub use scheduler::{Scheduler, SchedulerBuilder};
pub use slot::TaskSlot;
pub use task::{TaskFailure, TaskHandle, TaskId, TaskSpec, TaskState};
pub use time::{TimeConverter, TimeSpan};
