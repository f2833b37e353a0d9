// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Readiness multiplexer (spec §4.1 step 7, §3 "Stream-readiness registration").
//!
//! Same epoll wrapper shape as a work-stealing scheduler's reactor, but
//! with its `Mutex<HashMap<..>>` and dedicated reactor *thread* removed.
//! This runtime has exactly one poller, so registrations live behind a
//! `RefCell` and `poll_once` is called inline from the driver's tick (spec
//! §4.1 step 7), not from a background thread.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::task::Waker;
use std::time::Duration;

use crate::error::{TaskId, UsageError};

/// I/O interest for reactor registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    Readable,
    Writable,
    /// Combined read+write mask backing `facade::stream`.
    ReadWrite,
}

impl Interest {
    fn to_epoll_events(self) -> u32 {
        match self {
            Interest::Readable => libc::EPOLLIN as u32,
            Interest::Writable => libc::EPOLLOUT as u32,
            Interest::ReadWrite => (libc::EPOLLIN | libc::EPOLLOUT) as u32,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Interest::Readable => "readable",
            Interest::Writable => "writable",
            Interest::ReadWrite => "stream",
        }
    }
}

struct Registration {
    task: TaskId,
    waker: Waker,
    interest: Interest,
}

/// Single epoll instance. At most one task per (fd, direction) pair may be
/// registered (spec §3 invariant); a second registration on the same key
/// is a usage error rather than silently overwriting the first.
pub(crate) struct Reactor {
    epoll_fd: RawFd,
    registrations: RefCell<HashMap<(RawFd, Interest), Registration>>,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epoll_fd,
            registrations: RefCell::new(HashMap::new()),
        })
    }

    /// Register `fd` for `interest`, waking `task` via `waker` on readiness.
    pub fn register(
        &self,
        fd: RawFd,
        interest: Interest,
        task: TaskId,
        waker: Waker,
    ) -> Result<(), UsageError> {
        let mut regs = self.registrations.borrow_mut();
        let key = (fd, interest);
        if regs.contains_key(&key) {
            return Err(UsageError::DoubleRegistered(fd as u64, interest.label()));
        }

        let mut ev = libc::epoll_event {
            events: interest.to_epoll_events(),
            u64: encode_key(fd, interest),
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if ret < 0 {
            return Ok(()); // Non-pollable fd (e.g. a plain file): caller treats as immediately ready.
        }

        regs.insert(key, Registration { task, waker, interest });
        Ok(())
    }

    pub fn deregister(&self, fd: RawFd, interest: Interest) {
        let mut regs = self.registrations.borrow_mut();
        if regs.remove(&(fd, interest)).is_some() {
            unsafe {
                libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
            }
        }
    }

    /// Remove every registration belonging to `task` (driver deadline scan
    /// evicting a task from its current wait-structure). Keyed by `(fd,
    /// interest)`, not by task, so this is a linear scan.
    pub fn deregister_task(&self, task: TaskId) {
        let mut regs = self.registrations.borrow_mut();
        let keys: Vec<(RawFd, Interest)> = regs
            .iter()
            .filter(|(_, reg)| reg.task == task)
            .map(|(key, _)| *key)
            .collect();
        for key in keys {
            regs.remove(&key);
            unsafe {
                libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, key.0, std::ptr::null_mut());
            }
        }
    }

    /// One poll cycle (spec §4.1 step 7). Wakes ready tasks and clears
    /// their registration; returns the set of tasks woken.
    pub fn poll_once(&self, timeout: Duration) -> io::Result<Vec<TaskId>> {
        const MAX_EVENTS: usize = 64;
        let mut events: [libc::epoll_event; MAX_EVENTS] =
            [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let n = unsafe {
            libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let mut woken = Vec::new();
        let mut regs = self.registrations.borrow_mut();
        for ev in &events[..n as usize] {
            let (fd, interest) = decode_key(ev.u64);
            if let Some(reg) = regs.remove(&(fd, interest)) {
                unsafe {
                    libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
                }
                woken.push(reg.task);
                reg.waker.wake();
            }
        }
        Ok(woken)
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.borrow().is_empty()
    }
}

fn encode_key(fd: RawFd, interest: Interest) -> u64 {
    let tag = match interest {
        Interest::Readable => 0u64,
        Interest::Writable => 1u64,
        Interest::ReadWrite => 2u64,
    };
    ((fd as u64) << 2) | tag
}

fn decode_key(raw: u64) -> (RawFd, Interest) {
    let fd = (raw >> 2) as RawFd;
    let interest = match raw & 0b11 {
        0 => Interest::Readable,
        1 => Interest::Writable,
        _ => Interest::ReadWrite,
    };
    (fd, interest)
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::Wake;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct TestWaker(AtomicBool);
    impl Wake for TestWaker {
        fn wake(self: Arc<Self>) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn pipe_becomes_readable() {
        let reactor = Reactor::new().unwrap();
        let mut fds = [0i32; 2];
        unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let tw = Arc::new(TestWaker(AtomicBool::new(false)));
        let waker = Waker::from(tw.clone());
        reactor
            .register(read_fd, Interest::Readable, TaskId(1), waker)
            .unwrap();

        unsafe {
            libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1);
        }
        let woken = reactor.poll_once(Duration::from_millis(200)).unwrap();
        assert_eq!(woken, vec![TaskId(1)]);
        assert!(tw.0.load(Ordering::SeqCst));

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn readwrite_interest_is_woken_by_either_direction() {
        let reactor = Reactor::new().unwrap();
        let mut fds = [0i32; 2];
        unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let tw = Arc::new(TestWaker(AtomicBool::new(false)));
        let waker = Waker::from(tw.clone());
        // A pipe's write end is writable as soon as it's non-full, so a
        // combined-mask registration on it fires immediately.
        reactor
            .register(write_fd, Interest::ReadWrite, TaskId(1), waker)
            .unwrap();
        let woken = reactor.poll_once(Duration::from_millis(200)).unwrap();
        assert_eq!(woken, vec![TaskId(1)]);

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn deregister_task_removes_every_registration_for_it() {
        let reactor = Reactor::new().unwrap();
        let mut fds = [0i32; 2];
        unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        let (read_fd, write_fd) = (fds[0], fds[1]);
        let tw = Arc::new(TestWaker(AtomicBool::new(false)));

        reactor
            .register(read_fd, Interest::Readable, TaskId(5), Waker::from(tw.clone()))
            .unwrap();
        reactor.deregister_task(TaskId(5));
        assert!(reactor.is_empty());

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn double_register_same_key_is_usage_error() {
        let reactor = Reactor::new().unwrap();
        let mut fds = [0i32; 2];
        unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        let (read_fd, write_fd) = (fds[0], fds[1]);
        let tw = Arc::new(TestWaker(AtomicBool::new(false)));

        reactor
            .register(read_fd, Interest::Readable, TaskId(1), Waker::from(tw.clone()))
            .unwrap();
        let err = reactor.register(read_fd, Interest::Readable, TaskId(2), Waker::from(tw));
        assert!(matches!(err, Err(UsageError::DoubleRegistered(_, "readable"))));

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
