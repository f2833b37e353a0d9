// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Token-bucket rate limiter (spec §4.6), built strictly on
//! [`crate::facade::sleep`] — refills are lazy (computed from elapsed
//! wall-clock time on each call) and an empty bucket suspends the caller
//! via the same timer heap `sleep` itself uses, rather than the limiter
//! reaching into the driver directly.

use std::cell::Cell;
use std::time::{Duration, Instant};

use crate::facade::sleep;

pub struct RateLimiter {
    rate: f64,
    burst: f64,
    tokens: Cell<f64>,
    last_refill: Cell<Instant>,
}

impl RateLimiter {
    /// `rate` tokens accrue per second, capped at `burst` (spec §4.6).
    pub fn new(rate: f64, burst: f64) -> Self {
        RateLimiter {
            rate,
            burst,
            tokens: Cell::new(burst),
            last_refill: Cell::new(Instant::now()),
        }
    }

    fn refill(&self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill.get()).as_secs_f64();
        let refreshed = (self.tokens.get() + elapsed * self.rate).min(self.burst);
        self.tokens.set(refreshed);
        self.last_refill.set(now);
    }

    /// Suspend until `n` tokens are available, then consume them.
    pub async fn acquire(&self, n: f64) {
        loop {
            self.refill();
            if self.tokens.get() >= n {
                self.tokens.set(self.tokens.get() - n);
                return;
            }
            let deficit = n - self.tokens.get();
            sleep(Duration::from_secs_f64(deficit / self.rate)).await;
        }
    }

    /// Non-blocking attempt to consume `n` tokens (spec §4.6 edge case).
    pub fn try_acquire(&self, n: f64) -> bool {
        self.refill();
        if self.tokens.get() >= n {
            self.tokens.set(self.tokens.get() - n);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::run;

    #[test]
    fn burst_allows_immediate_acquire_up_to_capacity() {
        run(async {
            let limiter = RateLimiter::new(10.0, 10.0);
            for _ in 0..10 {
                assert!(limiter.try_acquire(1.0));
            }
            assert!(!limiter.try_acquire(1.0));
        })
        .unwrap();
    }

    #[test]
    fn acquire_suspends_until_refilled() {
        run(async {
            let limiter = RateLimiter::new(1000.0, 1.0);
            assert!(limiter.try_acquire(1.0));
            limiter.acquire(1.0).await;
        })
        .unwrap();
    }
}
