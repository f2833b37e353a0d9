// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Structured-concurrency membership set (spec §3 "Context", §4.1.2).
//!
//! A `RuntimeContext` that only toggled thread-backed vs. green-task
//! execution mode is generalized here into the membership-and-exception-
//! slot object spec §3 requires: a set of tasks sharing a lifetime
//! envelope, with at most one pending failure that `run()` raises once
//! the subtree drains.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::error::{TaskFailure, TaskId, UsageError};
use crate::task::TaskInner;

struct ContextInner {
    activated: bool,
    members: Vec<Weak<RefCell<TaskInner>>>,
    pending_exception: Option<(TaskId, TaskFailure)>,
}

/// Handle returned by `get_context()` from within a task (spec §3).
#[derive(Clone)]
pub struct Context(Rc<RefCell<ContextInner>>);

impl Context {
    pub(crate) fn new() -> Self {
        Context(Rc::new(RefCell::new(ContextInner {
            activated: false,
            members: Vec::new(),
            pending_exception: None,
        })))
    }

    /// Activate the context; fails if already active (spec §3 Invariant).
    pub(crate) fn activate(&self) -> Result<(), UsageError> {
        let mut inner = self.0.borrow_mut();
        if inner.activated {
            return Err(UsageError::ContextReused);
        }
        inner.activated = true;
        Ok(())
    }

    pub(crate) fn attach_member(&self, task: &Rc<RefCell<TaskInner>>) {
        self.0.borrow_mut().members.push(Rc::downgrade(task));
    }

    /// True once every member task has terminated or been dropped.
    pub(crate) fn subtree_drained(&self) -> bool {
        self.0
            .borrow()
            .members
            .iter()
            .all(|m| m.upgrade().is_none())
    }

    /// Plant a failure to be raised when `run()`'s subtree drains. Only
    /// the first failure in a tick is kept (spec §9 Open Question:
    /// first-observed-wins tie-break).
    pub(crate) fn plant_exception(&self, from: TaskId, failure: TaskFailure) {
        let mut inner = self.0.borrow_mut();
        if inner.pending_exception.is_none() {
            inner.pending_exception = Some((from, failure));
        } else {
            tracing::warn!(task = ?from, "exception dropped: an earlier failure already claimed this context's slot");
        }
    }

    pub(crate) fn take_exception(&self) -> Option<(TaskId, TaskFailure)> {
        self.0.borrow_mut().pending_exception.take()
    }
}
