// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Error taxonomy (spec §7).
//!
//! One variant family per error kind: usage errors are contract misuse
//! and never cross the task tree; the rest can be thrown at a task's next
//! resume and propagate through `await`/`run` like ordinary failures.

use std::fmt;

/// Contract misuse: outside-task calls, double-registration, cancelling a
/// non-pending task, etc. Always fails immediately and loudly.
#[derive(Debug, thiserror::Error)]
pub enum UsageError {
    #[error("operation requires a currently-running task")]
    NoCurrentTask,
    #[error("task is the caller of its own await")]
    AwaitSelf,
    #[error("handle {0:?}/{1:?} already has a registered waiter")]
    DoubleRegistered(u64, &'static str),
    #[error("cannot cancel a task that is not suspended")]
    NotPending,
    #[error("WaitGroup::done() called with counter already at zero")]
    WaitGroupUnderflow,
    #[error("context already activated")]
    ContextReused,
    #[error("StringBuffer::end() called twice")]
    AlreadyEnded,
    #[error("negative or invalid length: {0}")]
    InvalidLength(i64),
    #[error("driver already implicitly constructed; set_driver must run first")]
    DriverAlreadyInit,
    #[error("Synchronized::run re-entered by the same task holding key {0}")]
    SynchronizedReentry(String),
}

/// A failure thrown into a task at its next resume (timeout, cancellation,
/// channel error, deadman error, or a user failure that unwound a task).
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskFailure {
    #[error("operation timed out")]
    Timeout,
    #[error("task was cancelled")]
    Cancelled,
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("deadman switch tripped: producer dropped without disarming or ending the buffer")]
    Deadman,
    #[error("{0}")]
    User(String),
}

/// Errors specific to channel and publisher operations (spec §4.3/§4.4).
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("write to closed channel")]
    Closed,
    #[error(
        "channel used without activation: the creating task performed the first \
         operation with no counterparty present [deadlock protection]"
    )]
    Unactivated,
    #[error("buffer full")]
    Full,
    #[error("no value available")]
    Empty,
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Opaque task identity (spec §3: "comparable for equality").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);
