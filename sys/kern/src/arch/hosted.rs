// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hosted (OS-thread) implementations of the platform collaborators.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use abi::{Timestamp, FOREVER};

/// A counting semaphore used in binary fashion to signal event arrival.
///
/// `release` may be called from any context, including while the caller
/// holds the kernel core lock: it only unblocks, it never waits.
#[derive(Debug, Default)]
pub struct EventSem {
    count: Mutex<u32>,
    cond: Condvar,
}

impl EventSem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a permit and wakes one waiter.
    pub fn release(&self) {
        let mut count = self.count.lock().unwrap();
        *count = count.saturating_add(1);
        self.cond.notify_one();
    }

    /// Takes a permit, blocking up to `timeout_ms` (or indefinitely for
    /// `FOREVER`). Returns false on timeout.
    pub fn take(&self, timeout_ms: u32) -> bool {
        let mut count = self.count.lock().unwrap();
        if timeout_ms == FOREVER {
            while *count == 0 {
                count = self.cond.wait(count).unwrap();
            }
        } else {
            let deadline =
                Instant::now() + Duration::from_millis(timeout_ms.into());
            while *count == 0 {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                let (guard, _) = self
                    .cond
                    .wait_timeout(count, deadline - now)
                    .unwrap();
                count = guard;
            }
        }
        *count -= 1;
        true
    }
}

/// Monotonic millisecond clock, zeroed at kernel start.
#[derive(Debug)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }

    pub fn now(&self) -> Timestamp {
        Timestamp::from(self.epoch.elapsed().as_millis() as u64)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
