// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Exception holder (spec §4.1.2/§7).
//!
//! Rust's deterministic `Drop` plays the role spec §9 calls out as the
//! re-architecture point for non-GC hosts: instead of a GC finalizer
//! surfacing an unobserved task failure at an arbitrary later point,
//! `Drop for ExceptionHolder` surfaces it exactly when the holder's last
//! reference goes away, which the driver arranges to happen at GC time
//! (tick step 10) rather than at task-finish time, so concurrently
//! running siblings get a chance to observe the result first.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::context::Context as RtContext;
use crate::error::{TaskFailure, TaskId};

thread_local! {
    static LAST_UNHANDLED: RefCell<Option<(TaskId, TaskFailure)>> = RefCell::new(None);
}

pub(crate) struct ExceptionHolder {
    task: TaskId,
    ancestor: Option<RtContext>,
    failure: RefCell<Option<TaskFailure>>,
    observed: Cell<bool>,
}

impl ExceptionHolder {
    pub fn new(task: TaskId, ancestor: Option<RtContext>) -> Rc<Self> {
        Rc::new(Self {
            task,
            ancestor,
            failure: RefCell::new(None),
            observed: Cell::new(false),
        })
    }

    pub fn set(&self, failure: TaskFailure) {
        *self.failure.borrow_mut() = Some(failure);
    }

    /// Called by `await_task` (or anything that consumes the result) to
    /// mark the failure as handled, so `Drop` stays quiet.
    pub fn observe(&self) -> Option<TaskFailure> {
        self.observed.set(true);
        self.failure.borrow_mut().take()
    }
}

impl Drop for ExceptionHolder {
    fn drop(&mut self) {
        if self.observed.get() {
            return;
        }
        let Some(failure) = self.failure.borrow_mut().take() else {
            return;
        };
        if let Some(ctx) = &self.ancestor {
            ctx.plant_exception(self.task, failure);
        } else {
            tracing::error!(task = ?self.task, %failure, "unhandled task failure with no enclosing context");
            LAST_UNHANDLED.with(|cell| *cell.borrow_mut() = Some((self.task, failure)));
        }
    }
}

/// Drained by the outermost `run()` after its context subtree empties, so
/// a root-level unobserved failure still aborts the program loudly
/// instead of vanishing (spec §7 "uncaught failures must not be silent").
pub(crate) fn take_last_unhandled() -> Option<(TaskId, TaskFailure)> {
    LAST_UNHANDLED.with(|cell| cell.borrow_mut().take())
}
