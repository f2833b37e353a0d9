// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Event loop driver (spec §4.1).
//!
//! All state lives behind one thread-local `Rc<RefCell<Driver>>`, the same
//! `thread_local!`-scoped-state shape used elsewhere for per-thread
//! cancellation tokens — except here the *entire* scheduler state rides
//! along, because this runtime has exactly one poller and never crosses a
//! thread (spec §5). `tick` is a free function, not a method held across
//! the whole call, so that a waker fired synchronously during a poll (e.g.
//! an already-ready future) can re-borrow the driver without double-borrow
//! panics — see the fine-grained borrow scopes below.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::context::Context as RtContext;
use crate::error::{TaskFailure, TaskId, UsageError};
use crate::exception::{self, ExceptionHolder};
use crate::reactor::{Interest, Reactor};
use crate::scheduler::TimerHeap;
use crate::task::{poll_task, task_waker, BoxFuture, TaskInner, TaskRef, TaskState};

pub(crate) const DEFAULT_PREEMPT_INTERVAL_US: u64 = 50;
const DEADLINE_SCAN_INTERVAL: Duration = Duration::from_millis(100);

/// Runtime configuration (spec §3 "Configuration surface", §4.2).
pub struct Config {
    pub default_timeout: Option<Duration>,
    pub preempt_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_timeout: Some(Duration::from_secs(30)),
            preempt_interval: Duration::from_micros(DEFAULT_PREEMPT_INTERVAL_US),
        }
    }
}

pub(crate) struct Driver {
    next_id: u64,
    next_flag: u64,
    tasks: HashMap<TaskId, TaskRef>,
    ready: VecDeque<TaskId>,
    enqueued: HashSet<TaskId>,
    timers: TimerHeap,
    reactor: Reactor,
    flag_waiters: HashMap<u64, Vec<(TaskId, Rc<std::cell::Cell<bool>>)>>,
    idle_waiters: Vec<TaskId>,
    microtasks: VecDeque<Box<dyn FnOnce()>>,
    holders: HashMap<TaskId, Rc<ExceptionHolder>>,
    join_waiters: HashMap<TaskId, Vec<std::task::Waker>>,
    terminated_this_tick: Vec<TaskId>,
    current: Option<TaskId>,
    last_deadline_scan: Instant,
    pub config: Config,
}

impl Driver {
    fn new() -> Self {
        Self {
            next_id: 1,
            next_flag: 1,
            tasks: HashMap::new(),
            ready: VecDeque::new(),
            enqueued: HashSet::new(),
            timers: TimerHeap::new(),
            reactor: Reactor::new().expect("failed to create epoll instance"),
            flag_waiters: HashMap::new(),
            idle_waiters: Vec::new(),
            microtasks: VecDeque::new(),
            holders: HashMap::new(),
            join_waiters: HashMap::new(),
            terminated_this_tick: Vec::new(),
            current: None,
            last_deadline_scan: Instant::now(),
            config: Config::default(),
        }
    }

    pub(crate) fn current_task(&self) -> Option<TaskId> {
        self.current
    }

    /// Marking a task runnable always clears its deadline (spec §3 Flag
    /// invariant: "waking a flag also cancels the deadline associated with
    /// parked tasks" — generalized here to every wake source, since a task
    /// can only be parked on one wait-structure at a time).
    pub(crate) fn mark_ready(&mut self, id: TaskId) {
        if let Some(task_ref) = self.tasks.get(&id) {
            task_ref.borrow_mut().deadline = None;
        }
        if self.tasks.contains_key(&id) && self.enqueued.insert(id) {
            self.ready.push_back(id);
        }
    }

    /// Set (or clear) the deadline a parked task's wait currently carries
    /// (spec §4.1.1). Cleared automatically once the task wakes, by
    /// `mark_ready`.
    pub(crate) fn set_deadline(&mut self, task: TaskId, deadline: Option<Instant>) {
        if let Some(task_ref) = self.tasks.get(&task) {
            task_ref.borrow_mut().deadline = deadline;
        }
    }

    /// Evict `task` from whichever wait-structure currently holds it (spec
    /// §4.1.1 "cancels the task in its current wait-structure"), ahead of
    /// planning an exception for its next resume. A task can only be parked
    /// on one of these at a time, so the other lookups are harmless no-ops.
    pub(crate) fn cancel_wait(&mut self, task: TaskId) {
        self.idle_waiters.retain(|&id| id != task);
        for waiters in self.flag_waiters.values_mut() {
            waiters.retain(|(id, _)| *id != task);
        }
        self.reactor.deregister_task(task);
        self.timers.cancel(task);
    }

    /// Push a scoped-release closure onto `task`'s finalizer stack (spec
    /// §4.1.2 `finally`); run LIFO by `finish_task` on every termination
    /// path.
    pub(crate) fn push_finalizer(&mut self, task: TaskId, f: Box<dyn FnOnce()>) {
        if let Some(task_ref) = self.tasks.get(&task) {
            task_ref.borrow_mut().finalizers.push(f);
        }
    }

    pub(crate) fn spawn(
        &mut self,
        parent: Option<TaskId>,
        context: RtContext,
        name: &'static str,
        future: BoxFuture,
    ) -> (TaskId, Rc<ExceptionHolder>) {
        let id = TaskId(self.next_id);
        self.next_id += 1;

        let ancestor = if parent.is_some() { Some(context.clone()) } else { None };
        let holder = ExceptionHolder::new(id, ancestor);
        self.holders.insert(id, holder.clone());

        let inner = TaskInner {
            id,
            state: TaskState::SuspendedEnqueued,
            parent,
            context: context.clone(),
            created_at: Instant::now(),
            deadline: None,
            planned_exception: None,
            on_abort: None,
            finalizers: Vec::new(),
            future: Some(future),
            name,
        };
        let task_ref: TaskRef = Rc::new(RefCell::new(inner));
        context.attach_member(&task_ref);
        self.tasks.insert(id, task_ref);
        self.mark_ready(id);
        tracing::trace!(task = ?id, name, "spawned");
        (id, holder)
    }

    pub(crate) fn set_abort_hook(&mut self, task: TaskId, hook: Box<dyn FnOnce(TaskFailure)>) {
        if let Some(task_ref) = self.tasks.get(&task) {
            task_ref.borrow_mut().on_abort = Some(hook);
        }
    }

    pub(crate) fn plan_exception(&mut self, task: TaskId, failure: TaskFailure) -> Result<(), UsageError> {
        let Some(task_ref) = self.tasks.get(&task).cloned() else {
            return Err(UsageError::NotPending);
        };
        if task_ref.borrow().state == TaskState::Running {
            return Err(UsageError::NotPending);
        }
        self.cancel_wait(task);
        task_ref.borrow_mut().planned_exception = Some(failure);
        self.mark_ready(task);
        Ok(())
    }

    pub(crate) fn context_of(&self, task: TaskId) -> Option<RtContext> {
        self.tasks.get(&task).map(|t| t.borrow().context.clone())
    }

    pub(crate) fn task_state(&self, task: TaskId) -> Option<TaskState> {
        self.tasks.get(&task).map(|t| t.borrow().state)
    }

    pub(crate) fn register_join_waiter(&mut self, target: TaskId, waker: std::task::Waker) {
        if self.tasks.contains_key(&target) {
            self.join_waiters.entry(target).or_default().push(waker);
        } else {
            waker.wake();
        }
    }

    pub(crate) fn register_deadline(&mut self, task: TaskId, wake_at: Instant) {
        self.timers.push(wake_at, task);
    }

    pub(crate) fn cancel_timer(&mut self, task: TaskId) {
        self.timers.cancel(task);
    }

    pub(crate) fn register_io(
        &mut self,
        fd: RawFd,
        interest: Interest,
        task: TaskId,
        waker: std::task::Waker,
    ) -> Result<(), UsageError> {
        self.reactor.register(fd, interest, task, waker)
    }

    pub(crate) fn deregister_io(&mut self, fd: RawFd, interest: Interest) {
        self.reactor.deregister(fd, interest);
    }

    pub(crate) fn park_idle(&mut self, task: TaskId) {
        self.idle_waiters.push(task);
    }

    pub(crate) fn new_flag(&mut self) -> u64 {
        let id = self.next_flag;
        self.next_flag += 1;
        self.flag_waiters.insert(id, Vec::new());
        id
    }

    pub(crate) fn await_flag(&mut self, flag: u64, task: TaskId, signal: Rc<std::cell::Cell<bool>>) {
        self.flag_waiters.entry(flag).or_default().push((task, signal));
    }

    /// Wake every task waiting on `flag` (spec §5 FIFO suspension order).
    pub(crate) fn raise_flag(&mut self, flag: u64) {
        if let Some(waiters) = self.flag_waiters.get_mut(&flag) {
            let waiters = std::mem::take(waiters);
            for (id, signal) in waiters {
                signal.set(true);
                self.mark_ready(id);
            }
        }
    }

    pub(crate) fn drop_flag(&mut self, flag: u64) {
        self.flag_waiters.remove(&flag);
    }

    pub(crate) fn defer_microtask(&mut self, task: Box<dyn FnOnce()>) {
        self.microtasks.push_back(task);
    }

    /// Terminate `id` (spec §4.1.2): runs its finalizer stack LIFO, wakes
    /// anything joined on it, and retires its bookkeeping. Finalizers are
    /// deferred onto the microtask queue rather than run here directly —
    /// `finish_task` itself runs under an active driver borrow (the tick
    /// loop's `driver.borrow_mut()`), and a finalizer closure calling back
    /// into `with_driver` would otherwise double-borrow the same
    /// thread-local `RefCell`. `drain_microtasks` already pops-then-calls
    /// outside any borrow, so routing through it is the safe path.
    fn finish_task(&mut self, id: TaskId) {
        if let Some(task_ref) = self.tasks.remove(&id) {
            let finalizers = std::mem::take(&mut task_ref.borrow_mut().finalizers);
            if !finalizers.is_empty() {
                self.microtasks.push_back(Box::new(move || {
                    for f in finalizers.into_iter().rev() {
                        f();
                    }
                }));
            }
            task_ref.borrow_mut().state = TaskState::Terminated;
            tracing::trace!(task = ?id, "terminated");
        }
        self.timers.cancel(id);
        if let Some(waiters) = self.join_waiters.remove(&id) {
            for waker in waiters {
                waker.wake();
            }
        }
        self.terminated_this_tick.push(id);
    }

    fn scan_deadlines(&mut self, now: Instant) {
        let expired: Vec<TaskId> = self
            .tasks
            .values()
            .filter_map(|t| {
                let inner = t.borrow();
                match inner.deadline {
                    Some(d) if d <= now => Some(inner.id),
                    _ => None,
                }
            })
            .collect();
        for id in expired {
            self.cancel_wait(id);
            if let Some(task_ref) = self.tasks.get(&id) {
                task_ref.borrow_mut().planned_exception = Some(TaskFailure::Timeout);
            }
            self.mark_ready(id);
        }
    }

    fn gc_terminated(&mut self) {
        for id in self.terminated_this_tick.drain(..) {
            self.holders.remove(&id);
        }
        if let Some((id, failure)) = exception::take_last_unhandled() {
            tracing::error!(task = ?id, %failure, "unhandled failure reached the root of the task tree");
        }
    }
}

thread_local! {
    static DRIVER: Rc<RefCell<Driver>> = Rc::new(RefCell::new(Driver::new()));
}

pub(crate) fn with_driver<R>(f: impl FnOnce(&mut Driver) -> R) -> R {
    DRIVER.with(|d| f(&mut d.borrow_mut()))
}

pub(crate) fn current_task() -> Option<TaskId> {
    with_driver(|d| d.current_task())
}

fn drain_microtasks(driver: &Rc<RefCell<Driver>>) {
    loop {
        let next = driver.borrow_mut().microtasks.pop_front();
        match next {
            Some(task) => task(),
            None => break,
        }
    }
}

/// One pass of spec §4.1's ten-step tick algorithm.
pub(crate) fn tick(max_sleep: Duration) -> bool {
    let driver = DRIVER.with(|d| d.clone());

    // 1. Deadline scan, throttled to once per 100ms.
    {
        let mut drv = driver.borrow_mut();
        let now = Instant::now();
        if now.duration_since(drv.last_deadline_scan) >= DEADLINE_SCAN_INTERVAL {
            drv.last_deadline_scan = now;
            drv.scan_deadlines(now);
        }
    }

    // 2. Microtask drain.
    drain_microtasks(&driver);

    // 3. Timer heap promotion.
    {
        let mut drv = driver.borrow_mut();
        let now = Instant::now();
        let ready = drv.timers.drain_ready(now);
        for id in ready {
            drv.mark_ready(id);
        }
    }

    // 4. Auxiliary readiness poll: no external pollers in scope, kept as a
    // no-op hook for symmetry with the normative step numbering.

    // 5. Sleep budget.
    let sleep_budget = {
        let drv = driver.borrow();
        if !drv.ready.is_empty() {
            Duration::ZERO
        } else {
            match drv.timers.peek_deadline() {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline > now {
                        max_sleep.min(deadline - now)
                    } else {
                        Duration::ZERO
                    }
                }
                None => max_sleep,
            }
        }
    };

    // 6. Idle-flag promotion.
    if sleep_budget > Duration::ZERO {
        let mut drv = driver.borrow_mut();
        if !drv.idle_waiters.is_empty() {
            let idles = std::mem::take(&mut drv.idle_waiters);
            for id in idles {
                drv.mark_ready(id);
            }
        }
    }

    // 7. Bounded epoll wait.
    let woken = {
        let drv = driver.borrow();
        drv.reactor.poll_once(sleep_budget).unwrap_or_default()
    };
    if !woken.is_empty() {
        let mut drv = driver.borrow_mut();
        for id in woken {
            drv.mark_ready(id);
        }
    }

    // 8. Bounded drain of the ready queue (snapshot length so tasks that
    // re-enqueue themselves this tick run next tick, not in a tight loop).
    let batch_len = driver.borrow().ready.len();
    for _ in 0..batch_len {
        let task_id = {
            let mut drv = driver.borrow_mut();
            let id = drv.ready.pop_front();
            if let Some(id) = id {
                drv.enqueued.remove(&id);
            }
            id
        };
        let Some(task_id) = task_id else { break };
        let task_ref = {
            let drv = driver.borrow();
            drv.tasks.get(&task_id).cloned()
        };
        let Some(task_ref) = task_ref else { continue };

        let planned = task_ref.borrow_mut().planned_exception.take();
        if let Some(failure) = planned {
            let hook = task_ref.borrow_mut().on_abort.take();
            if let Some(hook) = hook {
                hook(failure);
            }
            task_ref.borrow_mut().future = None;
            driver.borrow_mut().finish_task(task_id);
            continue;
        }

        let wake_fn: Rc<dyn Fn(TaskId)> = Rc::new(|id| with_driver(|d| d.mark_ready(id)));
        let waker = task_waker(task_id, wake_fn);

        driver.borrow_mut().current = Some(task_id);
        let finished = poll_task(&task_ref, &waker);
        {
            let mut drv = driver.borrow_mut();
            drv.current = None;
            if finished {
                drv.finish_task(task_id);
            }
        }
    }

    // 9. Second microtask drain (finalizers queued while draining step 8).
    drain_microtasks(&driver);

    // 10. Exception-holder GC.
    driver.borrow_mut().gc_terminated();

    let drv = driver.borrow();
    !drv.tasks.is_empty() || !drv.microtasks.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ResultSlot;
    use std::future::Future;
    use std::pin::Pin;
    use std::task::{Context as StdContext, Poll};

    struct Ready;
    impl Future for Ready {
        type Output = ();
        fn poll(self: Pin<&mut Self>, _cx: &mut StdContext<'_>) -> Poll<()> {
            Poll::Ready(())
        }
    }

    #[test]
    fn spawned_task_runs_to_completion_within_one_tick() {
        let ctx = RtContext::new();
        let slot = ResultSlot::<()>::new();
        let slot2 = slot.clone();
        let fut: BoxFuture = Box::pin(async move {
            Ready.await;
            slot2.set(Ok(()));
        });
        let id = with_driver(|d| d.spawn(None, ctx, "test", fut).0);
        let _ = tick(Duration::from_millis(10));
        assert!(slot.take().is_some());
        with_driver(|d| assert!(!d.tasks.contains_key(&id)));
    }

    #[test]
    fn ready_flag_wakes_all_waiters_in_order() {
        with_driver(|d| {
            let flag = d.new_flag();
            let ctx = RtContext::new();
            let fut: BoxFuture = Box::pin(async {});
            let (t1, _) = d.spawn(None, ctx.clone(), "a", fut);
            let fut2: BoxFuture = Box::pin(async {});
            let (t2, _) = d.spawn(None, ctx, "b", fut2);
            d.ready.clear();
            d.enqueued.clear();
            let sig1 = Rc::new(std::cell::Cell::new(false));
            let sig2 = Rc::new(std::cell::Cell::new(false));
            d.await_flag(flag, t1, sig1.clone());
            d.await_flag(flag, t2, sig2.clone());
            d.raise_flag(flag);
            assert!(sig1.get() && sig2.get());
            assert_eq!(d.ready, VecDeque::from([t1, t2]));
        });
    }
}
