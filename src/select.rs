// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Heterogeneous select (spec §4.2 `select`).
//!
//! Spec §8 requires `select` to race awaitables of different kinds — a
//! task join, a channel receive, a flag wait — side by side. Rust has no
//! built-in way to poll a list of differently-typed futures, so callers
//! box each branch behind a common output enum (the same trick
//! `futures::select!` expands to); `select` then just round-robins
//! `poll` over the list and returns the first branch ready, by index.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context as StdContext, Poll};

pub type SelectBranch<T> = Pin<Box<dyn Future<Output = T>>>;

/// Race `branches` and resolve to `(index, value)` of the first ready one.
/// Polls in listed order each wakeup (spec §9: no fairness guarantee
/// beyond the ordering already documented for flag wakeups).
pub fn select<T>(branches: Vec<SelectBranch<T>>) -> Select<T> {
    Select { branches }
}

pub struct Select<T> {
    branches: Vec<SelectBranch<T>>,
}

impl<T> Future for Select<T> {
    type Output = (usize, T);

    fn poll(self: Pin<&mut Self>, cx: &mut StdContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        for (idx, branch) in this.branches.iter_mut().enumerate() {
            if let Poll::Ready(value) = branch.as_mut().poll(cx) {
                return Poll::Ready((idx, value));
            }
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel;
    use crate::facade::{go, run, sleep};
    use std::time::Duration;

    #[derive(Debug, PartialEq)]
    enum Event {
        Timer,
        Value(i32),
    }

    #[test]
    fn first_ready_branch_wins() {
        run(async {
            let (tx, rx) = channel::channel::<i32>(1);
            tx.activate();
            let _sender = go(async move {
                tx.send(7).await.unwrap();
            })
            .unwrap();

            let branches: Vec<SelectBranch<Event>> = vec![
                Box::pin(async {
                    sleep(Duration::from_secs(10)).await;
                    Event::Timer
                }),
                Box::pin(async move { Event::Value(rx.recv().await.unwrap().unwrap()) }),
            ];
            let (idx, event) = select(branches).await;
            assert_eq!(idx, 1);
            assert_eq!(event, Event::Value(7));
        })
        .unwrap();
    }

    #[test]
    fn timer_branch_wins_when_nothing_else_ready() {
        run(async {
            let branches: Vec<SelectBranch<Event>> = vec![Box::pin(async {
                sleep(Duration::from_millis(1)).await;
                Event::Timer
            })];
            let (idx, event) = select(branches).await;
            assert_eq!(idx, 0);
            assert_eq!(event, Event::Timer);
        })
        .unwrap();
    }
}
