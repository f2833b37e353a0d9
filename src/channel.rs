// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Channels with deadlock protection (spec §4.3).
//!
//! A channel starts "unactivated": spec §8 requires that a lone creator
//! task calling `send`/`recv` on its own freshly made channel, before any
//! other task has touched it, be refused rather than silently wedging the
//! only thread this runtime has. `activate()` lets a creator that knows
//! what it is doing (e.g. handing both ends to children before using
//! either itself) proceed anyway. An `std::sync::mpsc`-backed channel
//! never needed this protection, since blocking an OS thread is always
//! safe; a single-poller runtime can wedge itself instead.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context as StdContext, Poll, Waker};

use crate::driver::current_task;
use crate::error::{ChannelError, TaskId};

struct ChannelInner<T> {
    buffer: VecDeque<T>,
    capacity: Option<usize>,
    creator: TaskId,
    activated: bool,
    senders_alive: Cell<usize>,
    receivers_alive: Cell<usize>,
    read_waiters: Vec<Waker>,
    write_waiters: Vec<Waker>,
}

impl<T> ChannelInner<T> {
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

    fn closed_for_send(&self) -> bool {
        self.receivers_alive.get() == 0
    }

    fn closed_for_recv(&self) -> bool {
        self.buffer.is_empty() && self.senders_alive.get() == 0
    }

    fn has_room(&self) -> bool {
        match self.capacity {
            Some(0) => !self.read_waiters.is_empty(),
            Some(cap) => self.buffer.len() < cap,
            None => true,
        }
    }

    fn wake_readers(&mut self) {
        for w in self.read_waiters.drain(..) {
            w.wake();
        }
    }

    fn wake_writers(&mut self) {
        for w in self.write_waiters.drain(..) {
            w.wake();
        }
    }
}

/// Sending half (spec §3: non-linear, cloneable).
pub struct Sender<T> {
    inner: Rc<RefCell<ChannelInner<T>>>,
}

/// Receiving half (spec §3: non-linear, cloneable).
pub struct Receiver<T> {
    inner: Rc<RefCell<ChannelInner<T>>>,
}

/// Create a bounded channel (spec §4.3). `capacity` of 0 approximates a
/// CSP-style rendezvous: a send only completes once a reader is already
/// suspended waiting for a value.
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    build(Some(capacity))
}

/// Create an unbounded channel: `send` never suspends on capacity.
pub fn unbounded<T>() -> (Sender<T>, Receiver<T>) {
    build(None)
}

fn build<T>(capacity: Option<usize>) -> (Sender<T>, Receiver<T>) {
    let creator = current_task().unwrap_or(TaskId(0));
    let inner = Rc::new(RefCell::new(ChannelInner {
        buffer: VecDeque::new(),
        capacity,
        creator,
        activated: false,
        senders_alive: Cell::new(1),
        receivers_alive: Cell::new(1),
        read_waiters: Vec::new(),
        write_waiters: Vec::new(),
    }));
    (Sender { inner: inner.clone() }, Receiver { inner })
}

impl<T> Sender<T> {
    /// Explicitly mark the channel activated, bypassing the creator's
    /// first-operation deadlock check (spec §4.3).
    pub fn activate(&self) {
        self.inner.borrow_mut().activated = true;
    }

    /// Close the channel: pending and future `recv`s drain the buffer
    /// then observe [`ChannelError::Closed`] once it empties.
    pub fn close(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.senders_alive.set(0);
        inner.wake_readers();
    }

    pub fn send(&self, value: T) -> Send<T> {
        Send {
            inner: self.inner.clone(),
            value: Some(value),
        }
    }

    /// Non-blocking send attempt (spec §4.3 edge case: full/closed).
    pub fn try_send(&self, value: T) -> Result<(), (ChannelError, T)> {
        let mut inner = self.inner.borrow_mut();
        if inner.closed_for_send() {
            return Err((ChannelError::Closed, value));
        }
        if let Err(e) = inner.check_activation(current_task()) {
            return Err((e, value));
        }
        if !inner.has_room() {
            return Err((ChannelError::Full, value));
        }
        inner.buffer.push_back(value);
        inner.wake_readers();
        Ok(())
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        let inner = self.inner.borrow();
        inner.senders_alive.set(inner.senders_alive.get() + 1);
        drop(inner);
        Sender { inner: self.inner.clone() }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let mut inner = self.inner.borrow_mut();
        let remaining = inner.senders_alive.get().saturating_sub(1);
        inner.senders_alive.set(remaining);
        if remaining == 0 {
            inner.wake_readers();
        }
    }
}

impl<T> Receiver<T> {
    pub fn recv(&self) -> Recv<T> {
        Recv { inner: self.inner.clone() }
    }

    /// Non-blocking receive attempt (spec §4.3 edge case: empty/closed). A
    /// drained, closed channel yields `Ok(None)` — a closed *read* is a
    /// normal end-of-stream, not an error; only a closed *write* raises.
    pub fn try_recv(&self) -> Result<Option<T>, ChannelError> {
        let mut inner = self.inner.borrow_mut();
        inner.check_activation(current_task())?;
        if let Some(value) = inner.buffer.pop_front() {
            inner.wake_writers();
            return Ok(Some(value));
        }
        if inner.closed_for_recv() {
            return Ok(None);
        }
        Err(ChannelError::Empty)
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        let inner = self.inner.borrow();
        inner.receivers_alive.set(inner.receivers_alive.get() + 1);
        drop(inner);
        Receiver { inner: self.inner.clone() }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let mut inner = self.inner.borrow_mut();
        let remaining = inner.receivers_alive.get().saturating_sub(1);
        inner.receivers_alive.set(remaining);
        if remaining == 0 {
            inner.wake_writers();
        }
    }
}

pub struct Send<T> {
    inner: Rc<RefCell<ChannelInner<T>>>,
    value: Option<T>,
}

impl<T: Unpin> Future for Send<T> {
    type Output = Result<(), ChannelError>;

    fn poll(self: Pin<&mut Self>, cx: &mut StdContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.inner.borrow_mut();
        if inner.closed_for_send() {
            return Poll::Ready(Err(ChannelError::Closed));
        }
        if let Err(e) = inner.check_activation(current_task()) {
            return Poll::Ready(Err(e));
        }
        if inner.has_room() {
            let value = this.value.take().expect("Send polled after completion");
            inner.buffer.push_back(value);
            inner.wake_readers();
            return Poll::Ready(Ok(()));
        }
        inner.write_waiters.push(cx.waker().clone());
        Poll::Pending
    }
}

pub struct Recv<T> {
    inner: Rc<RefCell<ChannelInner<T>>>,
}

impl<T> Future for Recv<T> {
    /// `Ok(None)` marks a drained, closed channel — a normal end-of-stream,
    /// not a [`ChannelError`] (spec §4.3: closed reads are null, only
    /// closed writes raise).
    type Output = Result<Option<T>, ChannelError>;

    fn poll(self: Pin<&mut Self>, cx: &mut StdContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.inner.borrow_mut();
        if let Err(e) = inner.check_activation(current_task()) {
            return Poll::Ready(Err(e));
        }
        if let Some(value) = inner.buffer.pop_front() {
            inner.wake_writers();
            return Poll::Ready(Ok(Some(value)));
        }
        if inner.closed_for_recv() {
            return Poll::Ready(Ok(None));
        }
        inner.read_waiters.push(cx.waker().clone());
        inner.wake_writers(); // a capacity-0 sender may now see a waiting reader
        Poll::Pending
    }
}
