use std::collections::BinaryHeap;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dashmap::{DashMap, DashSet};
use regiontick_core::{ContextId, Ownership, ThreadingModel};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use super::{fail_task, Dispatcher, Due, ErrorSink};
use crate::resolver::ContextResolver;
use crate::retry::{RetryEntry, RetryPolicy, RetryQueue};
use crate::task::{TaskFailure, TaskHandle, TaskId, TaskTable};

/// One region's pending work.
///
/// Anyone may hand work to a lane through the inbox; only the region's own
/// tick drains the inbox into the heap and pops from it.
#[derive(Default)]
struct Lane {
    inbox: Mutex<Vec<Due>>,
    queue: Mutex<BinaryHeap<Due>>,
    /// Last tick this lane was drained on.
    clock: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Lane {
    fn hand_off(&self, due: Due) {
        lock(&self.inbox).push(due);
    }

    fn push_local(&self, due: Due) {
        lock(&self.queue).push(due);
    }

    fn take_due(&self, tick: u64) -> Vec<Due> {
        self.clock.fetch_max(tick, Ordering::Relaxed);
        let incoming = mem::take(&mut *lock(&self.inbox));
        let mut queue = lock(&self.queue);
        queue.extend(incoming);
        let mut due = Vec::new();
        while queue.peek().is_some_and(|d| d.fire_tick <= tick) {
            if let Some(d) = queue.pop() {
                due.push(d);
            }
        }
        due
    }

    fn drain(&self) -> Vec<Due> {
        let mut all = mem::take(&mut *lock(&self.inbox));
        all.extend(lock(&self.queue).drain());
        all
    }

    fn len(&self) -> usize {
        lock(&self.inbox).len() + lock(&self.queue).len()
    }
}

/// Dispatcher for hosts that run many regions on their own threads.
///
/// Each task is queued on the lane of the context that owns its target and
/// only ever runs on that context's tick. Tasks whose target has no owner
/// wait in a shared retry queue that the poller re-resolves.
///
/// A retired context never gets a lane again: anything routed to it is
/// parked, so a stale `Owned` answer cannot strand a task.
pub struct ShardedDispatcher {
    resolver: ContextResolver,
    tasks: TaskTable,
    lanes: DashMap<ContextId, Arc<Lane>>,
    retired: DashSet<ContextId>,
    retry: RetryQueue,
    policy: RetryPolicy,
    errors: ErrorSink,
    seq: AtomicU64,
}

impl ShardedDispatcher {
    pub fn new(resolver: ContextResolver, policy: RetryPolicy, errors: ErrorSink) -> Self {
        Self {
            resolver,
            tasks: TaskTable::new(),
            lanes: DashMap::new(),
            retired: DashSet::new(),
            retry: RetryQueue::new(),
            policy,
            errors,
            seq: AtomicU64::new(0),
        }
    }

    /// Tasks waiting for their target to gain an owner.
    pub fn parked(&self) -> usize {
        self.retry.len()
    }

    /// Entries queued on one context, cancelled ones included until popped.
    pub fn queued_on(&self, ctx: ContextId) -> usize {
        self.lanes.get(&ctx).map(|l| l.len()).unwrap_or(0)
    }

    fn lane(&self, ctx: ContextId) -> Arc<Lane> {
        self.lanes.entry(ctx).or_default().value().clone()
    }

    fn due(&self, task: TaskId, fire_tick: u64) -> Due {
        Due {
            fire_tick,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            task,
        }
    }

    /// Queue `task` on `ctx`, `delay` ticks from that context's clock.
    /// `false` if `ctx` is retired and the task went back to the retry queue.
    fn route(&self, task: &TaskHandle, ctx: ContextId, delay: u64) -> bool {
        if self.retired.contains(&ctx) {
            let fire_ref = self.resolver.current_tick(ContextId::GLOBAL) + delay;
            self.park(task, fire_ref, Instant::now());
            debug!(task_id = %task.id(), context = %ctx, "owner already retired; task parked");
            return false;
        }
        let fire_tick = self.resolver.current_tick(ctx) + delay;
        self.lane(ctx).hand_off(self.due(task.id(), fire_tick));
        trace!(task_id = %task.id(), context = %ctx, fire_tick, "task routed");
        // Lost a race with retire_context: the lane we just filled is orphaned.
        if self.retired.contains(&ctx) {
            self.evict(ctx);
        }
        true
    }

    /// Drop `ctx`'s lane and park whatever it held.
    fn evict(&self, ctx: ContextId) -> usize {
        let Some((_, lane)) = self.lanes.remove(&ctx) else {
            return 0;
        };
        let ctx_tick = lane
            .clock
            .load(Ordering::Relaxed)
            .max(self.resolver.current_tick(ctx));
        let global_tick = self.resolver.current_tick(ContextId::GLOBAL);
        let now = Instant::now();
        let mut parked = 0;
        for due in lane.drain() {
            let Some(task) = self.tasks.get(due.task) else {
                continue;
            };
            if task.is_terminal() {
                self.tasks.remove(due.task);
                continue;
            }
            let fire_ref = global_tick + due.fire_tick.saturating_sub(ctx_tick);
            self.park(&task, fire_ref, now);
            parked += 1;
        }
        parked
    }

    fn park(&self, task: &TaskHandle, fire_ref: u64, now: Instant) {
        if task.park() {
            self.retry.park(RetryEntry::new(task.id(), fire_ref, now));
        } else {
            self.tasks.remove(task.id());
        }
    }

    fn run_due(&self, ctx: ContextId, tick: u64, lane: &Lane, due: Due) {
        let Some(task) = self.tasks.get(due.task) else {
            return;
        };
        if task.is_terminal() {
            self.tasks.remove(due.task);
            return;
        }

        match self.resolver.resolve(task.target()) {
            Ownership::Owned(owner) if owner == ctx => self.fire(tick, lane, &task),
            Ownership::Owned(owner) => {
                // Moved since it was queued. Run as soon as the new owner can.
                if self.route(&task, owner, 0) {
                    debug!(task_id = %due.task, from = %ctx, to = %owner, "task re-routed");
                }
            }
            Ownership::Unowned => {
                let fire_ref = self.resolver.current_tick(ContextId::GLOBAL);
                self.park(&task, fire_ref, Instant::now());
                debug!(task_id = %due.task, context = %ctx, "target lost its owner; task parked");
            }
            Ownership::Invalid => fail_task(&self.tasks, &task, TaskFailure::TargetGone),
        }
    }

    fn fire(&self, tick: u64, lane: &Lane, task: &TaskHandle) {
        if !task.begin_run() {
            self.tasks.remove(task.id());
            return;
        }
        trace!(task_id = %task.id(), tick, "firing task");
        if let Err(e) = task.invoke() {
            self.errors.report(e);
        }
        if task.finish_run() {
            lane.push_local(self.due(task.id(), tick + task.period_ticks()));
        } else {
            self.tasks.remove(task.id());
        }
    }

    /// Re-resolve parked tasks every `every` until `shutdown` flips to `true`
    /// or its sender is dropped.
    pub async fn run_retry_poller(
        self: Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(interval_ms = every.as_millis() as u64, "retry poller started");
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.retry.is_empty() {
                        continue;
                    }
                    let handed = self.poll_retries(Instant::now());
                    if handed > 0 {
                        debug!(
                            handed,
                            parked = self.retry.len(),
                            "retry poll handed tasks to owners"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("retry poller shutting down");
                        break;
                    }
                }
            }
        }
    }
}

impl Dispatcher for ShardedDispatcher {
    fn model(&self) -> ThreadingModel {
        ThreadingModel::Regionized
    }

    fn enqueue(&self, task: TaskHandle, delay_ticks: u64, ownership: Ownership) {
        let id = task.id();
        self.tasks.insert(task.clone());
        match ownership {
            Ownership::Owned(ctx) => {
                if self.route(&task, ctx, delay_ticks) {
                    debug!(task_id = %id, context = %ctx, delay_ticks, "task submitted to owner");
                }
            }
            Ownership::Unowned => {
                let fire_ref = self.resolver.current_tick(ContextId::GLOBAL) + delay_ticks;
                self.park(&task, fire_ref, Instant::now());
                debug!(task_id = %id, target = %task.target(), "target unowned; task parked");
            }
            Ownership::Invalid => fail_task(&self.tasks, &task, TaskFailure::TargetGone),
        }
    }

    fn tick(&self, ctx: ContextId, tick: u64) {
        let Some(lane) = self.lanes.get(&ctx).map(|l| l.value().clone()) else {
            return;
        };
        for due in lane.take_due(tick) {
            self.run_due(ctx, tick, &lane, due);
        }
    }

    fn poll_retries(&self, now: Instant) -> usize {
        let mut handed = 0;
        for id in self.retry.ids() {
            let Some(mut entry) = self.retry.take(id) else {
                continue;
            };
            let Some(task) = self.tasks.get(id) else {
                continue;
            };
            if task.is_terminal() {
                self.tasks.remove(id);
                continue;
            }

            entry.attempts += 1;
            match self.resolver.resolve(task.target()) {
                Ownership::Owned(ctx) => {
                    if !task.unpark() {
                        self.tasks.remove(id);
                        continue;
                    }
                    let remaining = entry
                        .fire_ref
                        .saturating_sub(self.resolver.current_tick(ContextId::GLOBAL));
                    if self.route(&task, ctx, remaining) {
                        handed += 1;
                        debug!(
                            task_id = %id,
                            context = %ctx,
                            remaining,
                            attempts = entry.attempts,
                            "parked task handed to owner"
                        );
                    }
                }
                Ownership::Invalid => fail_task(&self.tasks, &task, TaskFailure::TargetGone),
                Ownership::Unowned => match self.policy.exhausted(&entry, now) {
                    Some(failure) => fail_task(&self.tasks, &task, failure),
                    None => self.retry.park(entry),
                },
            }
        }
        handed
    }

    /// Park everything queued on `ctx` and everything routed to it later.
    /// Call once the host has stopped ticking it. Retired ids are not reused.
    fn retire_context(&self, ctx: ContextId) {
        if !self.retired.insert(ctx) {
            return;
        }
        let parked = self.evict(ctx);
        info!(context = %ctx, parked, "context retired; queued tasks parked");
    }

    fn cancel_all(&self) -> usize {
        self.tasks.cancel_all()
    }

    fn pending(&self) -> usize {
        self.tasks.live()
    }

    fn task(&self, id: TaskId) -> Option<TaskHandle> {
        self.tasks.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Host;
    use crate::sim::SimHost;
    use crate::task::{TaskSpec, TaskState};
    use regiontick_core::Target;
    use std::sync::atomic::AtomicUsize;

    fn setup() -> (Arc<SimHost>, ShardedDispatcher) {
        let host = Arc::new(SimHost::regionized());
        let resolver = ContextResolver::new(host.clone());
        (host, ShardedDispatcher::new(resolver, RetryPolicy::default(), ErrorSink::default()))
    }

    fn counting(target: Target, period: u64) -> (TaskHandle, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let task = TaskSpec::new(target)
            .run(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .into_handle(period)
            .unwrap();
        (task, hits)
    }

    fn step(host: &SimHost, d: &ShardedDispatcher) {
        host.advance();
        for ctx in std::iter::once(ContextId::GLOBAL).chain(host.regions()) {
            d.tick(ctx, host.current_tick(ctx));
        }
    }

    #[test]
    fn runs_only_on_owner_lane() {
        let (host, d) = setup();
        let r1 = host.add_region(1);
        let r2 = host.add_region(2);
        let e = host.spawn_entity();
        host.place_entity(e, r1);

        let (task, hits) = counting(Target::entity(e), 0);
        d.enqueue(task.clone(), 1, Ownership::Owned(r1));
        assert_eq!(d.queued_on(r1), 1);

        d.tick(r2, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        d.tick(r1, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(task.state(), TaskState::Completed);
        assert_eq!(d.pending(), 0);
    }

    #[test]
    fn repeating_task_stays_on_its_lane() {
        let (host, d) = setup();
        let r1 = host.add_region(1);
        let e = host.spawn_entity();
        host.place_entity(e, r1);

        let (task, hits) = counting(Target::entity(e), 2);
        d.enqueue(task.clone(), 1, Ownership::Owned(r1));
        for _ in 0..5 {
            step(&host, &d);
        }
        // ticks 1, 3, 5
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(d.queued_on(r1), 1);
        task.cancel();
        step(&host, &d);
        step(&host, &d);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(d.queued_on(r1), 0);
    }

    #[test]
    fn moved_target_is_rerouted() {
        let (host, d) = setup();
        let r1 = host.add_region(1);
        let r2 = host.add_region(2);
        let e = host.spawn_entity();
        host.place_entity(e, r1);

        let (task, hits) = counting(Target::entity(e), 0);
        d.enqueue(task, 2, Ownership::Owned(r1));
        host.place_entity(e, r2);

        host.advance_by(2);
        d.tick(r1, 2);
        // popped on r1, handed to r2 for its next tick
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(d.queued_on(r1), 0);
        assert_eq!(d.queued_on(r2), 1);

        host.advance_context(r2);
        d.tick(r2, 3);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unowned_waits_for_poll() {
        let (host, d) = setup();
        let r1 = host.add_region(1);
        let e = host.spawn_entity();

        let (task, hits) = counting(Target::entity(e), 0);
        d.enqueue(task.clone(), 3, Ownership::Unowned);
        assert_eq!(task.state(), TaskState::RetryPending);
        assert_eq!(d.parked(), 1);

        step(&host, &d);
        assert_eq!(d.poll_retries(Instant::now()), 0);

        host.place_entity(e, r1);
        assert_eq!(d.poll_retries(Instant::now()), 1);
        assert_eq!(task.state(), TaskState::Scheduled);
        assert_eq!(d.parked(), 0);

        // fire_ref was tick 3 on the global clock; now at 1
        step(&host, &d);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        step(&host, &d);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retry_window_expires() {
        let (host, d) = setup();
        let e = host.spawn_entity();
        let (task, hits) = counting(Target::entity(e), 0);
        d.enqueue(task.clone(), 1, Ownership::Unowned);

        d.poll_retries(Instant::now() + Duration::from_secs(60));
        assert_eq!(task.state(), TaskState::Failed);
        assert!(matches!(
            task.failure(),
            Some(TaskFailure::TargetUnresolved { .. })
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(d.parked(), 0);
    }

    #[test]
    fn despawned_while_parked_fails_gone() {
        let (host, d) = setup();
        let e = host.spawn_entity();
        let (task, _) = counting(Target::entity(e), 0);
        d.enqueue(task.clone(), 1, Ownership::Unowned);
        host.despawn_entity(e);
        d.poll_retries(Instant::now());
        assert_eq!(task.failure(), Some(TaskFailure::TargetGone));
    }

    #[test]
    fn retired_context_parks_its_tasks() {
        let (host, d) = setup();
        let r1 = host.add_region(1);
        let r2 = host.add_region(2);
        let e = host.spawn_entity();
        host.place_entity(e, r1);

        let (task, hits) = counting(Target::entity(e), 5);
        d.enqueue(task.clone(), 1, Ownership::Owned(r1));
        host.remove_region(r1);
        d.retire_context(r1);
        assert_eq!(task.state(), TaskState::RetryPending);
        assert_eq!(d.parked(), 1);

        host.place_entity(e, r2);
        assert_eq!(d.poll_retries(Instant::now()), 1);
        step(&host, &d);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stale_owner_after_retire_is_parked() {
        let (host, d) = setup();
        let r1 = host.add_region(1);
        let r2 = host.add_region(2);
        let e = host.spawn_entity();
        host.place_entity(e, r1);
        let ownership = host.resolve_owner(&Target::entity(e));
        assert_eq!(ownership, Ownership::Owned(r1));

        // r1 dissolves between resolution and enqueue
        host.remove_region(r1);
        d.retire_context(r1);
        host.place_entity(e, r2);

        let (task, hits) = counting(Target::entity(e), 0);
        d.enqueue(task.clone(), 1, ownership);
        assert_eq!(task.state(), TaskState::RetryPending);
        assert_eq!(d.queued_on(r1), 0);
        assert_eq!(d.parked(), 1);

        assert_eq!(d.poll_retries(Instant::now()), 1);
        step(&host, &d);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(task.state(), TaskState::Completed);
        assert_eq!(d.pending(), 0);
    }

    #[test]
    fn reroute_to_retired_owner_is_parked() {
        let (host, d) = setup();
        let r1 = host.add_region(1);
        let r2 = host.add_region(2);
        let r3 = host.add_region(3);
        let e = host.spawn_entity();
        host.place_entity(e, r1);

        let (task, hits) = counting(Target::entity(e), 0);
        d.enqueue(task.clone(), 1, Ownership::Owned(r1));
        // the host still reports r2 when r1 pops the task
        host.place_entity(e, r2);
        d.retire_context(r2);
        host.advance_context(r1);
        d.tick(r1, 1);
        assert_eq!(task.state(), TaskState::RetryPending);
        assert_eq!(d.queued_on(r2), 0);

        host.place_entity(e, r3);
        assert_eq!(d.poll_retries(Instant::now()), 1);
        host.advance_context(r3);
        d.tick(r3, host.current_tick(r3));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn poller_hands_off_and_stops() {
        let host = Arc::new(SimHost::regionized());
        let d = Arc::new(ShardedDispatcher::new(
            ContextResolver::new(host.clone()),
            RetryPolicy::default(),
            ErrorSink::default(),
        ));
        let r1 = host.add_region(1);
        let e = host.spawn_entity();
        let (task, _) = counting(Target::entity(e), 0);
        d.enqueue(task.clone(), 1, Ownership::Unowned);

        let (tx, rx) = watch::channel(false);
        let poller = tokio::spawn(d.clone().run_retry_poller(Duration::from_millis(50), rx));

        host.place_entity(e, r1);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(task.state(), TaskState::Scheduled);
        assert_eq!(d.queued_on(r1), 1);

        tx.send(true).unwrap();
        poller.await.unwrap();
    }
}
