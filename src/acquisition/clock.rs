//! Periodic driver for the acquisition callback.
//!
//! Stands in for the driver's "every N samples" event. Deadlines are absolute
//! (`start + n * period`) so a slow callback does not shift later blocks; when
//! a callback overruns, the clock fires immediately and catches up.

use std::thread;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Fixed-period block clock.
#[derive(Debug)]
pub struct BlockClock {
    period: Duration,
    next: Instant,
    ticks: u64,
    overruns: u64,
}

impl BlockClock {
    /// Clock whose first tick is one period from now.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next: Instant::now() + period,
            ticks: 0,
            overruns: 0,
        }
    }

    /// Block period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Ticks delivered so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Ticks that fired late by at least one full period.
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Sleep until the next deadline. Returns `false` if cancelled first.
    ///
    /// Sleeps in slices of at most 10 ms so cancellation is observed promptly.
    pub fn wait(&mut self, cancel: &CancellationToken) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= self.next {
                let late = now - self.next;
                if late >= self.period {
                    self.overruns += 1;
                    warn!(tick = self.ticks + 1, ?late, "Block clock running late");
                }
                self.ticks += 1;
                self.next += self.period;
                return true;
            }
            thread::sleep((self.next - now).min(Duration::from_millis(10)));
        }
    }
}
