// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Broadcast publisher/subscriber (spec §4.4).
//!
//! Every subscriber gets every message from the point it subscribed,
//! tracked by its own monotonically increasing read cursor rather than a
//! shared consume-once queue like [`crate::channel`]. Entries are garbage
//! collected once every live cursor has moved past them. Same deadlock
//! protection as channels (§4.3): a creator publishing to or reading from
//! its own unactivated publisher is refused.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context as StdContext, Poll, Waker};

use crate::driver::current_task;
use crate::error::{ChannelError, TaskId};

struct PublisherInner<T> {
    entries: VecDeque<T>,
    base: u64,
    closed: bool,
    creator: TaskId,
    activated: bool,
    cursors: Vec<Weak<Cell<u64>>>,
    read_waiters: Vec<Waker>,
}

impl<T> PublisherInner<T> {
    fn check_activation(&mut self, caller: Option<TaskId>) -> Result<(), ChannelError> {
        if self.activated {
            return Ok(());
        }
        if caller == Some(self.creator) {
            return Err(ChannelError::Unactivated);
        }
        self.activated = true;
        Ok(())
    }

    fn gc(&mut self) {
        let min = self
            .cursors
            .iter()
            .filter_map(|w| w.upgrade())
            .map(|c| c.get())
            .min();
        let Some(min) = min else { return };
        while self.base < min && !self.entries.is_empty() {
            self.entries.pop_front();
            self.base += 1;
        }
        self.cursors.retain(|w| w.strong_count() > 0);
    }

    fn wake_readers(&mut self) {
        for w in self.read_waiters.drain(..) {
            w.wake();
        }
    }
}

/// Broadcasting half (spec §3: non-linear, cloneable).
pub struct Publisher<T> {
    inner: Rc<RefCell<PublisherInner<T>>>,
}

/// Receiving half; each subscriber owns its own read cursor.
pub struct Subscriber<T> {
    inner: Rc<RefCell<PublisherInner<T>>>,
    cursor: Rc<Cell<u64>>,
}

pub fn publisher<T>() -> Publisher<T> {
    let creator = current_task().unwrap_or(TaskId(0));
    Publisher {
        inner: Rc::new(RefCell::new(PublisherInner {
            entries: VecDeque::new(),
            base: 0,
            closed: false,
            creator,
            activated: false,
            cursors: Vec::new(),
            read_waiters: Vec::new(),
        })),
    }
}

impl<T> Publisher<T> {
    pub fn activate(&self) {
        self.inner.borrow_mut().activated = true;
    }

    pub fn close(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.closed = true;
        inner.wake_readers();
    }

    /// Subscribe from the current tail: the new subscriber only observes
    /// messages published after this call (spec §4.4).
    pub fn subscribe(&self) -> Subscriber<T> {
        let tail = {
            let inner = self.inner.borrow();
            inner.base + inner.entries.len() as u64
        };
        let cursor = Rc::new(Cell::new(tail));
        self.inner.borrow_mut().cursors.push(Rc::downgrade(&cursor));
        Subscriber { inner: self.inner.clone(), cursor }
    }
}

impl<T: Clone> Publisher<T> {
    pub fn publish(&self, value: T) -> Result<(), ChannelError> {
        let mut inner = self.inner.borrow_mut();
        inner.check_activation(current_task())?;
        inner.entries.push_back(value);
        inner.wake_readers();
        Ok(())
    }
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Publisher { inner: self.inner.clone() }
    }
}

impl<T: Clone> Subscriber<T> {
    pub fn next(&self) -> Next<T> {
        Next { inner: self.inner.clone(), cursor: self.cursor.clone() }
    }
}

pub struct Next<T> {
    inner: Rc<RefCell<PublisherInner<T>>>,
    cursor: Rc<Cell<u64>>,
}

impl<T: Clone> Future for Next<T> {
    /// `Ok(None)` once the publisher is closed and this cursor has drained
    /// every remaining entry — a normal end-of-stream, not an error (spec
    /// §4.4, mirroring §4.3's closed-read semantics).
    type Output = Result<Option<T>, ChannelError>;

    fn poll(self: Pin<&mut Self>, cx: &mut StdContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.inner.borrow_mut();
        if let Err(e) = inner.check_activation(current_task()) {
            return Poll::Ready(Err(e));
        }
        let pos = this.cursor.get();
        let tail = inner.base + inner.entries.len() as u64;
        if pos < tail {
            let idx = (pos - inner.base) as usize;
            let value = inner.entries[idx].clone();
            this.cursor.set(pos + 1);
            inner.gc();
            return Poll::Ready(Ok(Some(value)));
        }
        if inner.closed {
            return Poll::Ready(Ok(None));
        }
        inner.read_waiters.push(cx.waker().clone());
        Poll::Pending
    }
}
