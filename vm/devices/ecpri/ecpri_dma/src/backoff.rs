// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bounded spin loop support for blocking callers.

use std::time::Duration;

const SPIN_ATTEMPTS: u32 = 16;
const YIELD_ATTEMPTS: u32 = 64;
const SHORT_SLEEP_ATTEMPTS: u32 = 256;
const SHORT_SLEEP_DURATION: Duration = Duration::from_micros(50);
const LONG_SLEEP_DURATION: Duration = Duration::from_millis(1);

/// Backs off a polling loop that waits for a condition without an interrupt,
/// giving up after a fixed number of attempts.
///
/// The first attempts spin, then yield the thread, then sleep for short and
/// finally longer intervals.
pub struct Backoff {
    n: u32,
    limit: u32,
}

impl Backoff {
    /// Returns a backoff that allows `limit` waits.
    pub fn new(limit: u32) -> Self {
        Self { n: 0, limit }
    }

    /// Waits once. Returns false, without waiting, once the limit is reached.
    pub fn back_off(&mut self) -> bool {
        if self.n >= self.limit {
            return false;
        }
        if self.n < SPIN_ATTEMPTS {
            std::hint::spin_loop();
        } else if self.n < SPIN_ATTEMPTS + YIELD_ATTEMPTS {
            std::thread::yield_now();
        } else {
            let delay = if self.n - SPIN_ATTEMPTS - YIELD_ATTEMPTS < SHORT_SLEEP_ATTEMPTS {
                SHORT_SLEEP_DURATION
            } else {
                LONG_SLEEP_DURATION
            };
            std::thread::sleep(delay);
        }
        self.n += 1;
        true
    }

    /// The number of waits so far.
    pub fn attempts(&self) -> u32 {
        self.n
    }
}

#[cfg(test)]
mod tests {
    use super::Backoff;

    #[test]
    fn stops_at_limit() {
        let mut backoff = Backoff::new(3);
        assert!(backoff.back_off());
        assert!(backoff.back_off());
        assert!(backoff.back_off());
        assert!(!backoff.back_off());
        assert_eq!(backoff.attempts(), 3);
    }
}
