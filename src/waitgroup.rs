// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Wait-group (spec §4.5), built strictly on [`crate::facade::Flag`] —
//! no direct driver access, per spec's "built strictly on top of the core
//! suspend/resume API" mandate.

use std::cell::Cell;
use std::rc::Rc;

use crate::error::UsageError;
use crate::facade::{await_flag, Flag, Timeout};

#[derive(Clone)]
pub struct WaitGroup {
    remaining: Rc<Cell<i64>>,
    flag: Rc<Flag>,
}

impl WaitGroup {
    pub fn new(count: u32) -> Self {
        WaitGroup {
            remaining: Rc::new(Cell::new(count as i64)),
            flag: Rc::new(Flag::new()),
        }
    }

    /// Add (or, with a negative delta, remove) outstanding work items.
    pub fn add(&self, delta: i64) {
        self.remaining.set(self.remaining.get() + delta);
    }

    /// Mark one unit of work done (spec §4.5 edge case: underflow is a
    /// usage error, not a silently clamped counter).
    pub fn done(&self) -> Result<(), UsageError> {
        let left = self.remaining.get();
        if left <= 0 {
            return Err(UsageError::WaitGroupUnderflow);
        }
        self.remaining.set(left - 1);
        if left - 1 == 0 {
            self.flag.raise();
        }
        Ok(())
    }

    /// Suspend until the counter reaches zero.
    pub async fn wait(&self) -> Result<(), UsageError> {
        if self.remaining.get() <= 0 {
            return Ok(());
        }
        await_flag(&self.flag, Timeout::Disabled).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::{go, run};

    #[test]
    fn three_workers_release_waiter() {
        run(async {
            let wg = WaitGroup::new(3);
            let waiter = wg.clone();
            let handle = go(async move { waiter.wait().await.unwrap() }).unwrap();
            for _ in 0..3 {
                wg.done().unwrap();
            }
            crate::facade::await_task(handle, Timeout::Default).await.unwrap();
        })
        .unwrap();
    }

    #[test]
    fn done_below_zero_is_usage_error() {
        run(async {
            let wg = WaitGroup::new(0);
            assert!(matches!(wg.done(), Err(UsageError::WaitGroupUnderflow)));
        })
        .unwrap();
    }

    #[test]
    fn wait_returns_immediately_if_already_zero() {
        run(async {
            let wg = WaitGroup::new(0);
            wg.wait().await.unwrap();
        })
        .unwrap();
    }
}
