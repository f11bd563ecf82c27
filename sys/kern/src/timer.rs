// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Time events: deferred and periodic publishes of a topic.
//!
//! A flat fixed-capacity table scanned by the periodic driver. Each entry
//! stores its period in the coarsest unit that can express it (ms, 100 ms,
//! s, min) so it fits 16 bits, plus the absolute millisecond deadline. The
//! earliest deadline across the table is cached so the common driver pass
//! is one comparison.
//!
//! A topic may appear at most once; scheduling it twice is a programming
//! error. One-shot entries are removed by swap-with-last when they fire.

use abi::{Timestamp, Topic, FOREVER, MAX_TIME_EVENTS};
use heapless::Vec;

/// Period encoding units, coarsest-first thresholds.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum TimeUnit {
    Ms,
    HundredMs,
    Sec,
    Min,
}

impl TimeUnit {
    /// Longest delay expressible in each unit, in ms.
    const THRESHOLDS: [(TimeUnit, u64); 4] = [
        (TimeUnit::Ms, 60_000),
        (TimeUnit::HundredMs, 6_000_000),
        (TimeUnit::Sec, 57_600_000),
        (TimeUnit::Min, 1_296_000_000),
    ];

    pub(crate) const MAX_DELAY_MS: u64 = 1_296_000_000;

    fn factor(self) -> u64 {
        match self {
            TimeUnit::Ms => 1,
            TimeUnit::HundredMs => 100,
            TimeUnit::Sec => 1_000,
            TimeUnit::Min => 60_000,
        }
    }

    /// Picks the finest unit that can express `ms` and encodes the period
    /// in it, rounding half up.
    fn encode(ms: u64) -> (TimeUnit, u16) {
        for (unit, threshold) in Self::THRESHOLDS {
            if ms <= threshold {
                let period = if unit == TimeUnit::Ms {
                    ms
                } else {
                    (ms + unit.factor() / 2) / unit.factor()
                };
                return (unit, period as u16);
            }
        }
        panic!("time event beyond the valid range: {ms} ms");
    }
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct TimeEvent {
    pub topic: Topic,
    pub one_shot: bool,
    pub unit: TimeUnit,
    /// Period in `unit` steps.
    pub period: u16,
    /// Absolute deadline, ms.
    pub timeout: Timestamp,
}

#[derive(Debug)]
pub(crate) struct TimerList {
    events: Vec<TimeEvent, MAX_TIME_EVENTS>,
    /// `min(timeout)` across `events`, or `u64::MAX` when empty.
    timeout_min: Timestamp,
}

impl TimerList {
    pub(crate) fn new() -> Self {
        Self { events: Vec::new(), timeout_min: Timestamp::from(u64::MAX) }
    }

    pub(crate) fn count(&self) -> usize {
        self.events.len()
    }

    /// Registers a delayed (`one_shot`) or periodic publish of `topic`,
    /// `ms` milliseconds from `now`.
    pub(crate) fn schedule(
        &mut self,
        topic: Topic,
        ms: u32,
        one_shot: bool,
        now: Timestamp,
    ) {
        assert!(ms != 0, "zero-length time event for {topic}");
        assert!(ms != FOREVER, "unbounded time event for {topic}");
        assert!(
            u64::from(ms) <= TimeUnit::MAX_DELAY_MS,
            "time event beyond the valid range: {ms} ms",
        );
        assert!(
            !self.events.iter().any(|e| e.topic == topic),
            "time event already scheduled for {topic}",
        );

        let (unit, period) = TimeUnit::encode(u64::from(ms));
        let timeout = now.offset_ms(u64::from(ms));
        self.events
            .push(TimeEvent { topic, one_shot, unit, period, timeout })
            .unwrap_or_else(|_| panic!("time-event table full at {topic}"));

        if timeout < self.timeout_min {
            self.timeout_min = timeout;
        }
    }

    /// Removes every entry for `topic` (by content) and refreshes the
    /// cached minimum.
    pub(crate) fn cancel(&mut self, topic: &str) {
        let mut i = 0;
        while i < self.events.len() {
            if self.events[i].topic == topic {
                self.events.swap_remove(i);
            } else {
                i += 1;
            }
        }
        self.refresh_min();
    }

    pub(crate) fn scheduled(&self, topic: &str) -> bool {
        self.events.iter().any(|e| e.topic == topic)
    }

    /// One driver pass: collects every topic whose deadline has passed,
    /// rearms periodic entries, drops fired one-shots, and refreshes the
    /// cached minimum. Returns the topics to publish.
    pub(crate) fn poll(
        &mut self,
        now: Timestamp,
    ) -> Vec<Topic, MAX_TIME_EVENTS> {
        let mut fired = Vec::new();

        if self.events.is_empty() || now < self.timeout_min {
            return fired;
        }

        let mut i = 0;
        while i < self.events.len() {
            let e = self.events[i];
            if e.timeout <= now {
                // Table capacity bounds `fired`, so this cannot overflow.
                fired.push(e.topic).ok();
                if e.one_shot {
                    // Swap-with-last; re-examine this index.
                    self.events.swap_remove(i);
                    continue;
                }
                self.events[i].timeout = e
                    .timeout
                    .offset_ms(u64::from(e.period) * e.unit.factor());
            }
            i += 1;
        }

        self.refresh_min();
        fired
    }

    /// The next deadline, if any. Drivers can use this to sleep precisely.
    pub(crate) fn next_deadline(&self) -> Option<Timestamp> {
        self.events.iter().map(|e| e.timeout).min()
    }

    fn refresh_min(&mut self) {
        self.timeout_min =
            self.next_deadline().unwrap_or_else(|| Timestamp::from(u64::MAX));
    }
}
