//! Exponential reconnect backoff with jitter.
//!
//! Initial 1 s, factor 2, cap 30 s, jitter ±20%. Reset on every successful
//! `server_welcome`.

use rand::Rng;
use std::time::Duration;

pub const DEFAULT_INITIAL: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX: Duration = Duration::from_secs(30);

const JITTER_FRACTION: f64 = 0.2;

#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// Return the jittered delay for the next attempt and advance the base.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.next;
        self.next = (base * 2).min(self.max);
        jitter(base)
    }

    /// Back to the initial delay; called on each successful handshake.
    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL, DEFAULT_MAX)
    }
}

fn jitter(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(1.0 - JITTER_FRACTION..=1.0 + JITTER_FRACTION);
    base.mul_f64(factor)
}
