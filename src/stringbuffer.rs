// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! `StringBuffer` with deadman switch (spec §4.8).
//!
//! Rust's deterministic `Drop` is the mechanism spec §9 says other hosts
//! must simulate with a GC finalizer: a [`DeadmanSwitch`] that goes out of
//! scope without [`DeadmanSwitch::disarm`] having run, and without the
//! buffer having been cleanly [`StringBuffer::end`]ed, marks the buffer
//! failed — so a reader blocked in [`StringBuffer::read`] wakes with
//! [`TaskFailure::Deadman`] instead of hanging forever.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context as StdContext, Poll, Waker};

use crate::error::{TaskFailure, UsageError};

struct BufferInner {
    data: VecDeque<u8>,
    ended: bool,
    failed: bool,
    read_waiters: Vec<Waker>,
}

/// FIFO byte buffer (spec §3 "StringBuffer"). Cheap to clone: all handles
/// share the same backing queue.
#[derive(Clone)]
pub struct StringBuffer {
    inner: Rc<RefCell<BufferInner>>,
}

impl StringBuffer {
    pub fn new() -> Self {
        StringBuffer {
            inner: Rc::new(RefCell::new(BufferInner {
                data: VecDeque::new(),
                ended: false,
                failed: false,
                read_waiters: Vec::new(),
            })),
        }
    }

    /// Append bytes (spec §4.8). A no-op error if the buffer already
    /// ended — nothing downstream will ever see the bytes.
    pub fn write(&self, bytes: &[u8]) -> Result<(), UsageError> {
        let mut inner = self.inner.borrow_mut();
        if inner.ended {
            return Err(UsageError::AlreadyEnded);
        }
        inner.data.extend(bytes.iter().copied());
        for w in inner.read_waiters.drain(..) {
            w.wake();
        }
        Ok(())
    }

    /// Push bytes back onto the front of the queue, as if they were never
    /// read (spec §4.8 `unread`) — used to put back an over-read framing
    /// delimiter.
    pub fn unread(&self, bytes: &[u8]) {
        let mut inner = self.inner.borrow_mut();
        for &b in bytes.iter().rev() {
            inner.data.push_front(b);
        }
    }

    /// Signal no more writes are coming. A second call is a usage error
    /// (spec §4.8 edge case).
    pub fn end(&self) -> Result<(), UsageError> {
        let mut inner = self.inner.borrow_mut();
        if inner.ended {
            return Err(UsageError::AlreadyEnded);
        }
        inner.ended = true;
        for w in inner.read_waiters.drain(..) {
            w.wake();
        }
        Ok(())
    }

    pub fn eof(&self) -> bool {
        let inner = self.inner.borrow();
        inner.ended && inner.data.is_empty()
    }

    pub fn is_ready(&self) -> bool {
        let inner = self.inner.borrow();
        !inner.data.is_empty() || inner.ended || inner.failed
    }

    /// Read up to `max_len` bytes, suspending if none are available yet.
    /// Returns an empty vector at EOF. `max_len < 0` is a usage error
    /// (spec §4.8 edge case).
    pub fn read(&self, max_len: i64) -> Result<Read, UsageError> {
        if max_len < 0 {
            return Err(UsageError::InvalidLength(max_len));
        }
        Ok(Read { inner: self.inner.clone(), max_len: max_len as usize })
    }

    /// Read exactly `len` bytes, failing with [`TaskFailure::Deadman`] or
    /// an end-of-stream error if the buffer ends first.
    pub fn read_fixed(&self, len: usize) -> ReadFixed {
        ReadFixed { inner: self.inner.clone(), len }
    }

    /// Arm a deadman switch tied to this buffer (spec §4.8). Dropping the
    /// returned handle without calling [`DeadmanSwitch::disarm`] first
    /// marks the buffer failed, unless `end()` already ran.
    pub fn arm(&self) -> DeadmanSwitch {
        DeadmanSwitch { inner: self.inner.clone(), disarmed: Cell::new(false) }
    }
}

impl Default for StringBuffer {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Read {
    inner: Rc<RefCell<BufferInner>>,
    max_len: usize,
}

impl Future for Read {
    type Output = Result<Vec<u8>, TaskFailure>;

    fn poll(self: Pin<&mut Self>, cx: &mut StdContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.inner.borrow_mut();
        if !inner.data.is_empty() {
            let n = this.max_len.min(inner.data.len());
            let out: Vec<u8> = inner.data.drain(..n).collect();
            return Poll::Ready(Ok(out));
        }
        if inner.failed {
            return Poll::Ready(Err(TaskFailure::Deadman));
        }
        if inner.ended {
            return Poll::Ready(Ok(Vec::new()));
        }
        inner.read_waiters.push(cx.waker().clone());
        Poll::Pending
    }
}

pub struct ReadFixed {
    inner: Rc<RefCell<BufferInner>>,
    len: usize,
}

impl Future for ReadFixed {
    type Output = Result<Vec<u8>, TaskFailure>;

    fn poll(self: Pin<&mut Self>, cx: &mut StdContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.inner.borrow_mut();
        if inner.data.len() >= this.len {
            let out: Vec<u8> = inner.data.drain(..this.len).collect();
            return Poll::Ready(Ok(out));
        }
        if inner.failed {
            return Poll::Ready(Err(TaskFailure::Deadman));
        }
        if inner.ended {
            return Poll::Ready(Err(TaskFailure::User(format!(
                "stream ended after {} of {} requested bytes",
                inner.data.len(),
                this.len
            ))));
        }
        inner.read_waiters.push(cx.waker().clone());
        Poll::Pending
    }
}

/// Sentinel owned by a producer; its destruction marks the associated
/// buffer failed unless disarmed or the buffer was cleanly ended first
/// (spec §3/§4.8).
pub struct DeadmanSwitch {
    inner: Rc<RefCell<BufferInner>>,
    disarmed: Cell<bool>,
}

impl DeadmanSwitch {
    pub fn disarm(&self) {
        self.disarmed.set(true);
    }
}

impl Drop for DeadmanSwitch {
    fn drop(&mut self) {
        if self.disarmed.get() {
            return;
        }
        let mut inner = self.inner.borrow_mut();
        if inner.ended {
            return;
        }
        inner.failed = true;
        for w in inner.read_waiters.drain(..) {
            w.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::run;

    #[test]
    fn write_then_read_round_trips_bytes() {
        run(async {
            let buf = StringBuffer::new();
            buf.write(b"hello").unwrap();
            let out = buf.read(5).unwrap().await.unwrap();
            assert_eq!(out, b"hello");
        })
        .unwrap();
    }

    #[test]
    fn unread_puts_bytes_back_in_front() {
        run(async {
            let buf = StringBuffer::new();
            buf.write(b"world").unwrap();
            let head = buf.read(1).unwrap().await.unwrap();
            assert_eq!(head, b"w");
            buf.unread(&head);
            let whole = buf.read(5).unwrap().await.unwrap();
            assert_eq!(whole, b"world");
        })
        .unwrap();
    }

    #[test]
    fn ended_buffer_reads_empty_at_eof() {
        run(async {
            let buf = StringBuffer::new();
            buf.write(b"x").unwrap();
            buf.end().unwrap();
            assert_eq!(buf.read(10).unwrap().await.unwrap(), b"x");
            assert_eq!(buf.read(10).unwrap().await.unwrap(), b"");
            assert!(buf.eof());
        })
        .unwrap();
    }

    #[test]
    fn double_end_is_usage_error() {
        run(async {
            let buf = StringBuffer::new();
            buf.end().unwrap();
            assert!(matches!(buf.end(), Err(UsageError::AlreadyEnded)));
        })
        .unwrap();
    }

    #[test]
    fn negative_length_read_is_usage_error() {
        run(async {
            let buf = StringBuffer::new();
            assert!(matches!(buf.read(-1), Err(UsageError::InvalidLength(-1))));
        })
        .unwrap();
    }

    #[test]
    fn dropped_armed_switch_fails_pending_read() {
        run(async {
            let buf = StringBuffer::new();
            let switch = buf.arm();
            drop(switch);
            let err = buf.read(1).unwrap().await.unwrap_err();
            assert!(matches!(err, TaskFailure::Deadman));
        })
        .unwrap();
    }

    #[test]
    fn disarmed_switch_does_not_fail_buffer() {
        run(async {
            let buf = StringBuffer::new();
            let switch = buf.arm();
            switch.disarm();
            drop(switch);
            buf.write(b"ok").unwrap();
            buf.end().unwrap();
            assert_eq!(buf.read(10).unwrap().await.unwrap(), b"ok");
        })
        .unwrap();
    }
}
