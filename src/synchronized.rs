// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Named, non-reentrant critical sections (spec §4.7 `Synchronized`).
//!
//! Unlike [`crate::lock::Lock`], re-entering the same key from the task
//! that already holds it is a programming error, not a nested acquire —
//! spec §4.7 calls for it to fail loudly rather than silently deadlock
//! the single poller this runtime has.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;

use crate::driver::current_task;
use crate::error::{TaskId, UsageError};
use crate::facade::{await_flag, Flag, Timeout};

struct Section {
    holder: Cell<Option<TaskId>>,
    flag: Flag,
}

thread_local! {
    static SECTIONS: RefCell<HashMap<String, Rc<Section>>> = RefCell::new(HashMap::new());
}

fn section_for(key: &str) -> Rc<Section> {
    SECTIONS.with(|sections| {
        sections
            .borrow_mut()
            .entry(key.to_string())
            .or_insert_with(|| {
                Rc::new(Section {
                    holder: Cell::new(None),
                    flag: Flag::new(),
                })
            })
            .clone()
    })
}

/// Run `f` exclusively under `key`. Panics if the calling task already
/// holds `key` (spec §4.7, [`UsageError::SynchronizedReentry`] documents
/// the condition even though this path never returns it as a `Result` —
/// matching spec's "panics loudly" wording for this one case).
pub async fn run<F, Fut, T>(key: &str, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let task = current_task().expect("Synchronized::run requires a current task");
    let section = section_for(key);

    loop {
        match section.holder.get() {
            Some(h) if h == task => {
                panic!(
                    "{}",
                    UsageError::SynchronizedReentry(key.to_string())
                );
            }
            None => {
                section.holder.set(Some(task));
                break;
            }
            Some(_) => {
                let _ = await_flag(&section.flag, Timeout::Disabled).await;
            }
        }
    }

    let result = f().await;

    section.holder.set(None);
    section.flag.raise();
    result
}
