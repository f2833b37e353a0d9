// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Reentrant lock (spec §4.7), built strictly on
//! [`crate::facade::Flag`]/[`crate::facade::await_flag`].

use std::cell::Cell;

use crate::driver::current_task;
use crate::error::UsageError;
use crate::facade::{await_flag, Flag, Timeout};

pub struct Lock {
    holder: Cell<Option<crate::error::TaskId>>,
    depth: Cell<u32>,
    flag: Flag,
}

impl Lock {
    pub fn new() -> Self {
        Lock {
            holder: Cell::new(None),
            depth: Cell::new(0),
            flag: Flag::new(),
        }
    }

    /// Acquire the lock, reentering freely if the current task already
    /// holds it (spec §4.7: tracked by holder task + depth).
    pub async fn acquire(&self) -> Result<Guard<'_>, UsageError> {
        let task = current_task().ok_or(UsageError::NoCurrentTask)?;
        loop {
            match self.holder.get() {
                Some(h) if h == task => {
                    self.depth.set(self.depth.get() + 1);
                    return Ok(Guard { lock: self });
                }
                None => {
                    self.holder.set(Some(task));
                    self.depth.set(1);
                    return Ok(Guard { lock: self });
                }
                Some(_) => {
                    let _ = await_flag(&self.flag, Timeout::Disabled).await;
                }
            }
        }
    }

    fn release(&self) {
        let depth = self.depth.get().saturating_sub(1);
        self.depth.set(depth);
        if depth == 0 {
            self.holder.set(None);
            self.flag.raise();
        }
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard; releasing (one level of reentrance) on drop.
pub struct Guard<'a> {
    lock: &'a Lock,
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::{go, run};

    #[test]
    fn reentrant_acquire_by_same_task_nests() {
        run(async {
            let lock = Lock::new();
            let outer = lock.acquire().await.unwrap();
            let inner = lock.acquire().await.unwrap();
            drop(inner);
            drop(outer);
        })
        .unwrap();
    }

    #[test]
    fn second_task_waits_for_release() {
        run(async {
            let lock = std::rc::Rc::new(Lock::new());
            let guard = lock.acquire().await.unwrap();
            let waiter = lock.clone();
            let handle = go(async move {
                let _g = waiter.acquire().await.unwrap();
            })
            .unwrap();
            crate::facade::yield_now().await;
            drop(guard);
            crate::facade::await_task(handle, Timeout::Default).await.unwrap();
        })
        .unwrap();
    }
}
