// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task representation (spec §3 "Task").
//!
//! The host primitive this crate assumes (spec §5) is played by Rust's
//! native `Future`/`Waker`: a task is a boxed, pinned future; suspension is
//! `Poll::Pending`; resumption is re-polling. Because the whole runtime is
//! single-threaded (spec §5), task bookkeeping lives behind `Rc<RefCell<_>>`
//! rather than an `Arc<Mutex<_>>` sized for multi-worker green tasks —
//! there is never more than one poller here.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use std::time::Instant;

use crate::context::Context as RtContext;
use crate::error::{TaskFailure, TaskId};

/// Task lifecycle (spec §3 "State").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    SuspendedEnqueued,
    SuspendedDelayed,
    SuspendedOnIo,
    SuspendedOnFlag,
    SuspendedOnIdle,
    Terminated,
}

pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()>>>;

/// Per-task state shared between the driver and any handle/waker that
/// refers to the task. `Rc`, not `Arc`: this runtime never crosses a
/// thread boundary (spec §5).
pub(crate) struct TaskInner {
    pub id: TaskId,
    pub state: TaskState,
    pub parent: Option<TaskId>,
    pub context: RtContext,
    pub created_at: Instant,
    pub deadline: Option<Instant>,
    pub planned_exception: Option<TaskFailure>,
    pub on_abort: Option<Box<dyn FnOnce(TaskFailure)>>,
    pub finalizers: Vec<Box<dyn FnOnce()>>,
    pub future: Option<BoxFuture>,
    pub name: &'static str,
}

pub(crate) type TaskRef = Rc<RefCell<TaskInner>>;

impl fmt::Debug for TaskInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskInner")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("name", &self.name)
            .finish()
    }
}

/// Result slot a task's wrapper future writes into; `await_task` reads it.
pub(crate) struct ResultSlot<T>(RefCell<Option<Result<T, TaskFailure>>>);

impl<T> ResultSlot<T> {
    pub fn new() -> Rc<Self> {
        Rc::new(Self(RefCell::new(None)))
    }

    pub fn set(&self, result: Result<T, TaskFailure>) {
        *self.0.borrow_mut() = Some(result);
    }

    pub fn take(&self) -> Option<Result<T, TaskFailure>> {
        self.0.borrow_mut().take()
    }
}

/// Waker whose only job is to mark `task` runnable again via `wake_fn`.
/// Built on a raw vtable over `Rc` because `std::task::Wake` requires
/// `Arc` (Send + Sync) — overkill for a single-threaded poller.
struct TaskWaker {
    id: TaskId,
    wake_fn: Rc<dyn Fn(TaskId)>,
}

unsafe fn clone_waker(data: *const ()) -> RawWaker {
    let rc = Rc::from_raw(data as *const TaskWaker);
    let cloned = rc.clone();
    std::mem::forget(rc);
    RawWaker::new(Rc::into_raw(cloned) as *const (), &VTABLE)
}

unsafe fn wake_waker(data: *const ()) {
    let rc = Rc::from_raw(data as *const TaskWaker);
    (rc.wake_fn)(rc.id);
}

unsafe fn wake_by_ref_waker(data: *const ()) {
    let rc = Rc::from_raw(data as *const TaskWaker);
    (rc.wake_fn)(rc.id);
    std::mem::forget(rc);
}

unsafe fn drop_waker(data: *const ()) {
    drop(Rc::from_raw(data as *const TaskWaker));
}

static VTABLE: RawWakerVTable =
    RawWakerVTable::new(clone_waker, wake_waker, wake_by_ref_waker, drop_waker);

/// Build a `Waker` that re-enqueues `id` via `wake_fn` when woken.
///
/// # Safety
/// The returned `Waker` must never be sent across threads; it wraps an
/// `Rc`, which is not `Send`. This invariant holds because every part of
/// this crate's public API is `!Send` by construction (tasks capture
/// `Rc`-based runtime state).
pub(crate) fn task_waker(id: TaskId, wake_fn: Rc<dyn Fn(TaskId)>) -> Waker {
    let raw = Rc::into_raw(Rc::new(TaskWaker { id, wake_fn })) as *const ();
    unsafe { Waker::from_raw(RawWaker::new(raw, &VTABLE)) }
}

/// Poll `task`'s future once. Returns `true` if it completed this call.
///
/// The future is taken out of `task` before polling and put back if it's
/// still pending, rather than holding `task.borrow_mut()` across the call —
/// a task's own body routinely calls back into the driver referencing its
/// own id while running synchronously (e.g. `go()` looking up its parent's
/// context), which would otherwise double-borrow this same `RefCell`.
pub(crate) fn poll_task(task: &TaskRef, waker: &Waker) -> bool {
    let mut cx = Context::from_waker(waker);
    let mut fut = match task.borrow_mut().future.take() {
        Some(fut) => fut,
        None => return true,
    };
    match fut.as_mut().poll(&mut cx) {
        Poll::Ready(()) => true,
        Poll::Pending => {
            task.borrow_mut().future = Some(fut);
            false
        }
    }
}
