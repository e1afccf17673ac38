use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use regiontick_core::{ContextId, ModelSelection, RegiontickConfig, Target, ThreadingModel};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::dispatch::{Dispatcher, ErrorSink, ShardedDispatcher, SingleLoopDispatcher};
use crate::error::{CallbackError, Result, SchedulerError};
use crate::host::Host;
use crate::offloop::OffloopPool;
use crate::resolver::ContextResolver;
use crate::retry::RetryPolicy;
use crate::task::{TaskHandle, TaskId, TaskSpec};
use crate::time::{TimeConverter, TimeSpan};

/// Builder for [`Scheduler`].
pub struct SchedulerBuilder {
    host: Arc<dyn Host>,
    config: RegiontickConfig,
    model: Option<ModelSelection>,
    errors: Option<mpsc::Sender<CallbackError>>,
}

impl SchedulerBuilder {
    pub fn config(mut self, config: RegiontickConfig) -> Self {
        self.config = config;
        self
    }

    /// Override `scheduler.threading_model` from the config.
    pub fn threading_model(mut self, model: impl Into<ModelSelection>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Receive a copy of every callback panic.
    pub fn callback_errors(mut self, tx: mpsc::Sender<CallbackError>) -> Self {
        self.errors = Some(tx);
        self
    }

    pub fn build(self) -> Result<Scheduler> {
        self.config.validate()?;
        let selection = self
            .model
            .unwrap_or(self.config.scheduler.threading_model);
        let errors = ErrorSink::new(self.errors);
        let pool = OffloopPool::new(&self.config.offloop, errors.clone())?;
        let (shutdown, _) = watch::channel(false);

        Ok(Scheduler {
            resolver: ContextResolver::new(self.host.clone()),
            host: self.host,
            time: TimeConverter::new(self.config.scheduler.tick_millis),
            policy: RetryPolicy::from(&self.config.retry),
            config: self.config,
            selection,
            errors,
            pool,
            dispatcher: OnceLock::new(),
            shutdown,
            closed: AtomicBool::new(false),
        })
    }
}

/// The single entry point callers submit work through.
///
/// Holds no task state of its own. On first use it probes the host (unless
/// the model was forced), builds the matching dispatcher, registers one tick
/// hook, and keeps that binding for the rest of its life. `Async` targets
/// bypass the dispatcher and go straight to the off-loop pool.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use regiontick_core::Target;
/// # use regiontick_scheduler::{Scheduler, TimeSpan, sim::SimHost};
/// let host = Arc::new(SimHost::regionized());
/// let scheduler = Scheduler::builder(host).build()?;
/// let handle = scheduler.run_timer(Target::Global, TimeSpan::ticks(0), TimeSpan::ticks(20), |_| {
///     println!("once a second");
/// })?;
/// scheduler.cancel(&handle);
/// # Ok::<(), regiontick_scheduler::SchedulerError>(())
/// ```
pub struct Scheduler {
    host: Arc<dyn Host>,
    config: RegiontickConfig,
    selection: ModelSelection,
    time: TimeConverter,
    policy: RetryPolicy,
    resolver: ContextResolver,
    errors: ErrorSink,
    pool: OffloopPool,
    dispatcher: OnceLock<Arc<dyn Dispatcher>>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl Scheduler {
    pub fn builder(host: Arc<dyn Host>) -> SchedulerBuilder {
        SchedulerBuilder {
            host,
            config: RegiontickConfig::default(),
            model: None,
            errors: None,
        }
    }

    /// Build with defaults (auto-detected model).
    pub fn new(host: Arc<dyn Host>) -> Result<Self> {
        Self::builder(host).build()
    }

    pub fn config(&self) -> &RegiontickConfig {
        &self.config
    }

    pub fn time(&self) -> &TimeConverter {
        &self.time
    }

    /// Bind now instead of on first submission. Returns the bound model.
    pub fn bind(&self) -> ThreadingModel {
        self.dispatcher().model()
    }

    pub fn model(&self) -> ThreadingModel {
        self.bind()
    }

    fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        self.dispatcher.get_or_init(|| self.create_dispatcher())
    }

    fn create_dispatcher(&self) -> Arc<dyn Dispatcher> {
        let model = self
            .selection
            .resolve(|| self.host.is_global_threading_model());

        let dispatcher: Arc<dyn Dispatcher> = match model {
            ThreadingModel::SingleLoop => Arc::new(SingleLoopDispatcher::new(
                self.resolver.clone(),
                self.policy,
                self.errors.clone(),
            )),
            ThreadingModel::Regionized => {
                let sharded = Arc::new(ShardedDispatcher::new(
                    self.resolver.clone(),
                    self.policy,
                    self.errors.clone(),
                ));
                if self.config.retry.spawn_poller {
                    self.pool.spawn(sharded.clone().run_retry_poller(
                        self.config.retry.poll_interval(),
                        self.shutdown.subscribe(),
                    ));
                }
                sharded
            }
        };

        // Weak so a scheduler dropped before the host stops ticking is freed.
        let weak = Arc::downgrade(&dispatcher);
        self.host.register_tick_hook(Arc::new(move |ctx, tick| {
            if let Some(dispatcher) = weak.upgrade() {
                dispatcher.tick(ctx, tick);
            }
        }));

        info!(%model, selection = ?self.selection, "scheduler bound to threading model");
        dispatcher
    }

    /// Queue a task. Never runs the callback before returning.
    ///
    /// Only input errors are returned here. A target that is already gone
    /// yields `Ok` with the handle already failed.
    pub fn submit(&self, spec: TaskSpec) -> Result<TaskHandle> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SchedulerError::ShutDown);
        }
        spec.validate()?;

        let delay = spec.delay;
        let period = spec.period;
        let period_ticks = self.time.to_ticks(period, true);
        let task = spec.into_handle(period_ticks)?;

        if task.target().is_async() {
            let every = (period_ticks > 0)
                .then(|| self.time.to_duration(period).max(self.time.tick_duration()));
            self.pool
                .submit(task.clone(), self.time.to_duration(delay), every);
            return Ok(task);
        }

        let dispatcher = self.dispatcher();
        let ownership = self.resolver.resolve(task.target());
        let delay_ticks = self.time.to_ticks(delay, false);
        debug!(
            task_id = %task.id(),
            target = %task.target(),
            label = task.label().unwrap_or(""),
            delay_ticks,
            period_ticks,
            ?ownership,
            "task submitted"
        );
        dispatcher.enqueue(task.clone(), delay_ticks, ownership);
        Ok(task)
    }

    /// Run on the next tick of whichever context owns `target`.
    pub fn run<F>(&self, target: Target, f: F) -> Result<TaskHandle>
    where
        F: FnMut(&TaskHandle) + Send + 'static,
    {
        self.submit(TaskSpec::new(target).run(f))
    }

    pub fn run_later<F>(
        &self,
        target: Target,
        delay: impl Into<TimeSpan>,
        f: F,
    ) -> Result<TaskHandle>
    where
        F: FnMut(&TaskHandle) + Send + 'static,
    {
        self.submit(TaskSpec::new(target).delay(delay).run(f))
    }

    pub fn run_timer<F>(
        &self,
        target: Target,
        delay: impl Into<TimeSpan>,
        period: impl Into<TimeSpan>,
        f: F,
    ) -> Result<TaskHandle>
    where
        F: FnMut(&TaskHandle) + Send + 'static,
    {
        self.submit(TaskSpec::new(target).delay(delay).period(period).run(f))
    }

    /// Idempotent. Returns `true` only if this call cancelled the task.
    pub fn cancel(&self, handle: &TaskHandle) -> bool {
        let cancelled = handle.cancel();
        if cancelled {
            debug!(task_id = %handle.id(), "task cancelled");
        }
        cancelled
    }

    pub fn is_cancelled(&self, handle: &TaskHandle) -> bool {
        handle.is_cancelled()
    }

    /// Cancel every live task, tick-bound and async alike.
    pub fn cancel_all(&self) -> usize {
        let tick_bound = self.dispatcher.get().map(|d| d.cancel_all()).unwrap_or(0);
        let offloop = self.pool.cancel_all();
        info!(tick_bound, offloop, "all tasks cancelled");
        tick_bound + offloop
    }

    /// Re-resolve parked tasks now. Only the regionized model parks tasks.
    pub fn poll_retries(&self) -> usize {
        self.poll_retries_at(Instant::now())
    }

    /// [`Self::poll_retries`] as if the wall clock read `now`.
    pub fn poll_retries_at(&self, now: Instant) -> usize {
        self.dispatcher
            .get()
            .map(|d| d.poll_retries(now))
            .unwrap_or(0)
    }

    /// The host dissolved `ctx`. Its queued tasks go back through resolution.
    pub fn context_retired(&self, ctx: ContextId) {
        if let Some(dispatcher) = self.dispatcher.get() {
            dispatcher.retire_context(ctx);
        }
    }

    /// Tasks that can still fire.
    pub fn pending_tasks(&self) -> usize {
        let tick_bound = self.dispatcher.get().map(|d| d.pending()).unwrap_or(0);
        tick_bound + self.pool.pending()
    }

    pub fn task(&self, id: TaskId) -> Option<TaskHandle> {
        self.dispatcher
            .get()
            .and_then(|d| d.task(id))
            .or_else(|| self.pool.task(id))
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Cancel everything, stop the poller and the off-loop pool. Later
    /// submissions fail with [`SchedulerError::ShutDown`].
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let cancelled = self.cancel_all();
        self.shutdown.send_replace(true);
        self.pool.shutdown();
        info!(cancelled, "scheduler shut down");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimHost;
    use crate::task::TaskState;
    use std::sync::atomic::AtomicUsize;

    fn quiet_config() -> RegiontickConfig {
        let mut cfg = RegiontickConfig::default();
        cfg.retry.spawn_poller = false;
        cfg.offloop.workers = 1;
        cfg
    }

    #[test]
    fn auto_detects_model_once() {
        let host = Arc::new(SimHost::single_loop());
        let scheduler = Scheduler::builder(host).config(quiet_config()).build().unwrap();
        assert_eq!(scheduler.model(), ThreadingModel::SingleLoop);

        let host = Arc::new(SimHost::regionized());
        let scheduler = Scheduler::builder(host).config(quiet_config()).build().unwrap();
        assert_eq!(scheduler.model(), ThreadingModel::Regionized);
    }

    #[test]
    fn forced_model_wins_over_probe() {
        let host = Arc::new(SimHost::single_loop());
        let scheduler = Scheduler::builder(host)
            .config(quiet_config())
            .threading_model(ThreadingModel::Regionized)
            .build()
            .unwrap();
        assert_eq!(scheduler.model(), ThreadingModel::Regionized);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut cfg = quiet_config();
        cfg.scheduler.tick_millis = 0;
        let err = Scheduler::builder(Arc::new(SimHost::regionized()))
            .config(cfg)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, SchedulerError::Core(_)));
    }

    #[test]
    fn missing_callback_is_rejected_at_submit() {
        let scheduler = Scheduler::builder(Arc::new(SimHost::regionized()))
            .config(quiet_config())
            .build()
            .unwrap();
        let err = scheduler.submit(TaskSpec::new(Target::Global)).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule(_)));
        assert_eq!(scheduler.pending_tasks(), 0);
    }

    #[test]
    fn submit_never_runs_inline() {
        let host = Arc::new(SimHost::single_loop());
        let scheduler = Scheduler::builder(host.clone())
            .config(quiet_config())
            .build()
            .unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let task = scheduler
            .run_later(Target::Global, TimeSpan::ticks(-5), move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        host.advance();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(task.state(), TaskState::Completed);
    }

    #[test]
    fn shutdown_rejects_new_work() {
        let host = Arc::new(SimHost::regionized());
        let scheduler = Scheduler::builder(host)
            .config(quiet_config())
            .build()
            .unwrap();
        let task = scheduler
            .run_timer(Target::Global, TimeSpan::ticks(1), TimeSpan::ticks(1), |_| {})
            .unwrap();
        scheduler.shutdown();
        scheduler.shutdown();
        assert!(scheduler.is_shut_down());
        assert!(task.is_cancelled());
        assert!(matches!(
            scheduler.run(Target::Global, |_| {}),
            Err(SchedulerError::ShutDown)
        ));
    }

    #[test]
    fn task_lookup_covers_both_paths() {
        let scheduler = Scheduler::builder(Arc::new(SimHost::regionized()))
            .config(quiet_config())
            .build()
            .unwrap();
        let ticked = scheduler.run_later(Target::Global, TimeSpan::ticks(10), |_| {}).unwrap();
        let offloop = scheduler
            .run_later(Target::Async, TimeSpan::millis(60_000), |_| {})
            .unwrap();
        assert_eq!(scheduler.task(ticked.id()), Some(ticked.clone()));
        assert_eq!(scheduler.task(offloop.id()), Some(offloop.clone()));
        assert_eq!(scheduler.pending_tasks(), 2);
        assert_eq!(scheduler.cancel_all(), 2);
    }
}
