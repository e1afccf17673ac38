use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use regiontick_core::{ContextId, Ownership, ThreadingModel};
use tracing::{debug, trace};

use super::{fail_task, Dispatcher, Due, ErrorSink};
use crate::resolver::ContextResolver;
use crate::retry::{RetryEntry, RetryPolicy};
use crate::task::{TaskFailure, TaskHandle, TaskId, TaskTable};

#[derive(Default)]
struct LoopState {
    queue: BinaryHeap<Due>,
    /// Tasks whose target was unowned when they came due, with their tally.
    unowned: HashMap<TaskId, RetryEntry>,
}

/// Dispatcher for hosts that run every tick on one global thread.
///
/// One timer heap, drained by the global context's tick. Resolution and
/// execution happen on the same thread, so an unowned target is simply
/// retried on the next tick until the tick ceiling or the window runs out.
pub struct SingleLoopDispatcher {
    resolver: ContextResolver,
    tasks: TaskTable,
    policy: RetryPolicy,
    errors: ErrorSink,
    seq: AtomicU64,
    state: Mutex<LoopState>,
}

impl SingleLoopDispatcher {
    pub fn new(resolver: ContextResolver, policy: RetryPolicy, errors: ErrorSink) -> Self {
        Self {
            resolver,
            tasks: TaskTable::new(),
            policy,
            errors,
            seq: AtomicU64::new(0),
            state: Mutex::new(LoopState::default()),
        }
    }

    /// Number of entries in the timer heap (including cancelled ones not yet popped).
    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, task: TaskId, fire_tick: u64) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.lock().queue.push(Due {
            fire_tick,
            seq,
            task,
        });
    }

    fn take_due(&self, tick: u64) -> Vec<Due> {
        let mut state = self.lock();
        let mut due = Vec::new();
        while state.queue.peek().is_some_and(|d| d.fire_tick <= tick) {
            if let Some(d) = state.queue.pop() {
                due.push(d);
            }
        }
        due
    }

    fn forget(&self, task: TaskId) {
        self.lock().unowned.remove(&task);
        self.tasks.remove(task);
    }

    fn run_due(&self, due: Due, tick: u64) {
        let Some(task) = self.tasks.get(due.task) else {
            return;
        };
        if task.is_terminal() {
            self.forget(due.task);
            return;
        }

        match self.resolver.resolve(task.target()) {
            Ownership::Invalid => {
                self.lock().unowned.remove(&due.task);
                fail_task(&self.tasks, &task, TaskFailure::TargetGone);
            }
            Ownership::Unowned => {
                let now = Instant::now();
                let verdict = {
                    let mut state = self.lock();
                    let entry = state
                        .unowned
                        .entry(due.task)
                        .or_insert_with(|| RetryEntry::new(due.task, due.fire_tick, now));
                    entry.attempts += 1;
                    self.policy.exhausted_ticks(entry, now)
                };
                match verdict {
                    Some(failure) => {
                        self.lock().unowned.remove(&due.task);
                        fail_task(&self.tasks, &task, failure);
                    }
                    None => {
                        task.park();
                        self.push(due.task, tick + 1);
                        trace!(task_id = %due.task, tick, "target unowned; retrying next tick");
                    }
                }
            }
            Ownership::Owned(_) => {
                self.lock().unowned.remove(&due.task);
                if task.unpark() {
                    self.fire(&task, tick);
                } else {
                    self.tasks.remove(due.task);
                }
            }
        }
    }

    fn fire(&self, task: &TaskHandle, tick: u64) {
        if !task.begin_run() {
            self.tasks.remove(task.id());
            return;
        }
        trace!(task_id = %task.id(), tick, "firing task");
        if let Err(e) = task.invoke() {
            self.errors.report(e);
        }
        if task.finish_run() {
            self.push(task.id(), tick + task.period_ticks());
        } else {
            self.tasks.remove(task.id());
        }
    }
}

impl Dispatcher for SingleLoopDispatcher {
    fn model(&self) -> ThreadingModel {
        ThreadingModel::SingleLoop
    }

    fn enqueue(&self, task: TaskHandle, delay_ticks: u64, ownership: Ownership) {
        match ownership {
            Ownership::Invalid => {
                fail_task(&self.tasks, &task, TaskFailure::TargetGone);
                return;
            }
            Ownership::Unowned => {
                task.park();
            }
            Ownership::Owned(_) => {}
        }
        let fire_tick = self.resolver.current_tick(ContextId::GLOBAL) + delay_ticks;
        let id = task.id();
        self.tasks.insert(task);
        self.push(id, fire_tick);
        debug!(task_id = %id, fire_tick, ?ownership, "task queued on main loop");
    }

    fn tick(&self, ctx: ContextId, tick: u64) {
        if !ctx.is_global() {
            return;
        }
        for due in self.take_due(tick) {
            self.run_due(due, tick);
        }
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
    use std::sync::Arc;
    use std::time::Duration;

    fn setup(policy: RetryPolicy) -> (Arc<SimHost>, SingleLoopDispatcher) {
        let host = Arc::new(SimHost::single_loop());
        let resolver = ContextResolver::new(host.clone());
        (host, SingleLoopDispatcher::new(resolver, policy, ErrorSink::default()))
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

    fn step(host: &SimHost, d: &SingleLoopDispatcher) -> u64 {
        host.advance();
        let tick = host.current_tick(ContextId::GLOBAL);
        d.tick(ContextId::GLOBAL, tick);
        tick
    }

    #[test]
    fn fires_on_due_tick_and_repeats() {
        let (host, d) = setup(RetryPolicy::default());
        let (task, hits) = counting(Target::Global, 3);
        d.enqueue(task.clone(), 2, Ownership::Owned(ContextId::GLOBAL));

        step(&host, &d);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        step(&host, &d);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        for _ in 0..3 {
            step(&host, &d);
        }
        // ticks 2 and 5
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(task.state(), TaskState::Scheduled);
        assert_eq!(d.queued(), 1);
    }

    #[test]
    fn region_ticks_are_ignored() {
        let (_host, d) = setup(RetryPolicy::default());
        let (task, hits) = counting(Target::Global, 0);
        d.enqueue(task, 1, Ownership::Owned(ContextId::GLOBAL));
        d.tick(ContextId(4), 10);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        d.tick(ContextId::GLOBAL, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unowned_retries_each_tick_until_owned() {
        let (host, d) = setup(RetryPolicy::default());
        let r1 = host.add_region(1);
        let e = host.spawn_entity();
        let (task, hits) = counting(Target::entity(e), 0);
        d.enqueue(task.clone(), 1, Ownership::Unowned);
        assert_eq!(task.state(), TaskState::RetryPending);

        step(&host, &d);
        step(&host, &d);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(task.state(), TaskState::RetryPending);

        host.place_entity(e, r1);
        step(&host, &d);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(task.state(), TaskState::Completed);
    }

    #[test]
    fn tick_ceiling_fails_task() {
        let policy = RetryPolicy {
            window: Duration::from_secs(60),
            max_attempts: 10,
            max_unowned_ticks: 2,
        };
        let (host, d) = setup(policy);
        let e = host.spawn_entity();
        let (task, hits) = counting(Target::entity(e), 0);
        d.enqueue(task.clone(), 1, Ownership::Unowned);

        step(&host, &d);
        step(&host, &d);
        assert!(!task.is_terminal());
        step(&host, &d);
        assert!(matches!(
            task.failure(),
            Some(TaskFailure::TargetUnresolved { attempts: 3, .. })
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(d.pending(), 0);
    }

    #[test]
    fn despawn_before_fire_retires_task() {
        let (host, d) = setup(RetryPolicy::default());
        let r1 = host.add_region(1);
        let e = host.spawn_entity();
        host.place_entity(e, r1);

        let retired = Arc::new(AtomicUsize::new(0));
        let r = retired.clone();
        let task = TaskSpec::new(Target::entity(e))
            .run(|_| panic!("must not run"))
            .on_retired(move || {
                r.fetch_add(1, Ordering::SeqCst);
            })
            .into_handle(0)
            .unwrap();
        d.enqueue(task.clone(), 1, Ownership::Owned(ContextId::GLOBAL));
        host.despawn_entity(e);

        step(&host, &d);
        assert_eq!(task.failure(), Some(TaskFailure::TargetGone));
        assert_eq!(retired.load(Ordering::SeqCst), 1);
        assert_eq!(task.run_count(), 0);
    }

    #[test]
    fn panicking_callback_keeps_repeating() {
        let (host, d) = setup(RetryPolicy::default());
        let task = TaskSpec::new(Target::Global)
            .run(|_| panic!("boom"))
            .into_handle(1)
            .unwrap();
        d.enqueue(task.clone(), 1, Ownership::Owned(ContextId::GLOBAL));
        for _ in 0..3 {
            step(&host, &d);
        }
        assert_eq!(task.run_count(), 3);
        assert_eq!(task.panic_count(), 3);
        assert_eq!(task.state(), TaskState::Scheduled);
    }

    #[test]
    fn cancel_all_stops_everything() {
        let (host, d) = setup(RetryPolicy::default());
        let (a, hits_a) = counting(Target::Global, 1);
        let (b, hits_b) = counting(Target::Global, 0);
        d.enqueue(a, 1, Ownership::Owned(ContextId::GLOBAL));
        d.enqueue(b, 5, Ownership::Owned(ContextId::GLOBAL));
        assert_eq!(d.pending(), 2);
        assert_eq!(d.cancel_all(), 2);
        assert_eq!(d.cancel_all(), 0);
        for _ in 0..6 {
            step(&host, &d);
        }
        assert_eq!(hits_a.load(Ordering::SeqCst) + hits_b.load(Ordering::SeqCst), 0);
        assert_eq!(d.queued(), 0);
    }
}
