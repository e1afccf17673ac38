use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use regiontick_core::config::OffloopConfig;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::dispatch::ErrorSink;
use crate::error::Result;
use crate::task::{TaskHandle, TaskId, TaskTable};

/// Worker pool for `Target::Async` tasks.
///
/// A dedicated multi-thread tokio runtime, separate from whatever runtime
/// the caller lives on. Timing is wall clock; callbacks run on the blocking
/// pool so a slow one never stalls the timers. Also hosts the retry poller.
pub struct OffloopPool {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    tasks: TaskTable,
    errors: ErrorSink,
}

impl OffloopPool {
    pub fn new(cfg: &OffloopConfig, errors: ErrorSink) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(cfg.workers)
            .thread_name(cfg.thread_name.clone())
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        info!(workers = cfg.workers, thread_name = %cfg.thread_name, "off-loop pool started");
        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            handle,
            tasks: TaskTable::new(),
            errors,
        })
    }

    /// Spawn a background future on the pool runtime.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(fut);
    }

    /// Run `task` once after `delay`, or every `period` starting after `delay`.
    pub fn submit(&self, task: TaskHandle, delay: Duration, period: Option<Duration>) {
        let id = task.id();
        self.tasks.insert(task.clone());
        debug!(task_id = %id, delay_ms = delay.as_millis() as u64, ?period, "async task queued");

        let tasks = self.tasks.clone();
        let errors = self.errors.clone();
        self.handle.spawn(async move {
            drive(&task, delay, period, &errors).await;
            tasks.remove(id);
        });
    }

    pub fn cancel_all(&self) -> usize {
        self.tasks.cancel_all()
    }

    pub fn pending(&self) -> usize {
        self.tasks.live()
    }

    pub fn task(&self, id: TaskId) -> Option<TaskHandle> {
        self.tasks.get(id)
    }

    /// Stop the runtime without waiting for in-flight callbacks.
    pub fn shutdown(&self) {
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
            info!("off-loop pool stopped");
        }
    }
}

impl Drop for OffloopPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Roughly thirty years; what tokio itself treats as "never".
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + delay`, capped instead of overflowing on huge delays.
fn deadline(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE)
}

async fn drive(task: &TaskHandle, delay: Duration, period: Option<Duration>, errors: &ErrorSink) {
    match period {
        None => {
            tokio::time::sleep_until(deadline(delay)).await;
            run_once(task, errors).await;
        }
        Some(every) => {
            let mut ticks = tokio::time::interval_at(deadline(delay), every);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                if !run_once(task, errors).await {
                    break;
                }
            }
        }
    }
}

/// Returns `true` when the task should run again.
async fn run_once(task: &TaskHandle, errors: &ErrorSink) -> bool {
    if !task.begin_run() {
        return false;
    }
    let worker = task.clone();
    match tokio::task::spawn_blocking(move || worker.invoke()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => errors.report(e),
        Err(e) => warn!(task_id = %task.id(), error = %e, "async callback did not complete"),
    }
    task.finish_run()
}
