// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared definitions, used by the kernel and by applications.
//!
//! Everything in here is small, `Copy`, and free of policy: identifiers,
//! the event descriptor handed to user code, attribute bits, and the
//! compile-time sizing limits of the system.

#![forbid(unsafe_code)]

/// Maximum number of tasks. Task identity feeds a fixed-width owner bitmap,
/// so this cannot exceed the bitmap width without changing `OWNER_WORDS`.
pub const MAX_TASKS: usize = 32;

/// Number of priority levels. Priorities are recorded per task and exposed
/// through stats; the host scheduler is what actually acts on them.
pub const MAX_PRIORITIES: usize = 32;

/// Number of slots in the topic registry. Must comfortably exceed the number
/// of live topics (tasks + events + data-store entries) or insertion will
/// blow the probe budget.
pub const MAX_OBJECTS: usize = 128;

/// Outer probe iterations the registry will attempt before declaring a topic
/// missing (lookup) or the table overfull (insertion).
pub const MAX_HASH_SEEK_TIMES: usize = 5;

/// Capacity of the time-event table.
pub const MAX_TIME_EVENTS: usize = 64;

/// Maximum nesting depth of hierarchical state machines, counting the target
/// state but not `top`.
pub const MAX_HSM_NEST_DEPTH: usize = 4;

/// Words in a task owner bitmap.
pub const OWNER_WORDS: usize = MAX_TASKS.div_ceil(32);

/// Words in a registry-slot occupancy bitmap.
pub const SLOT_WORDS: usize = MAX_OBJECTS.div_ceil(32);

/// Timeout sentinel meaning "block until the event arrives".
pub const FOREVER: u32 = u32::MAX;

static_assertions::const_assert!(MAX_TASKS >= 1 && MAX_TASKS <= 32);
static_assertions::const_assert!(MAX_PRIORITIES >= 1 && MAX_PRIORITIES <= 32);
static_assertions::const_assert!(MAX_OBJECTS >= 16 && MAX_OBJECTS <= 65536);
static_assertions::const_assert!(MAX_TASKS <= MAX_OBJECTS);
static_assertions::const_assert!(MAX_TIME_EVENTS < 256);
static_assertions::const_assert!(
    MAX_HSM_NEST_DEPTH >= 2 && MAX_HSM_NEST_DEPTH <= 4
);

/// A topic: the string name of a task, an event, or a data-store entry.
///
/// Topics must outlive the kernel, and identity is by content, never by
/// address. In practice they are string literals.
pub type Topic = &'static str;

/// Names a task by its registry slot.
///
/// The slot index doubles as the task's bit position in owner bitmaps, which
/// is why `MAX_TASKS` is bounded by the bitmap width.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct TaskId(pub u16);

impl TaskId {
    /// Extracts the slot index.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Indicates priority of a task.
///
/// Priorities are small numbers starting from zero, and numerically lower
/// priorities are more important. This type deliberately does not implement
/// `PartialOrd`/`Ord`, to keep us from confusing "numerically greater" with
/// "more important".
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Checks if `self` is strictly more important than `other`.
    ///
    /// This is easier to read than comparing the numeric values of the
    /// priorities, since lower numbers are more important.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }
}

/// Kernel timestamp, in milliseconds since kernel start.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    pub fn millis(self) -> u64 {
        self.0
    }

    /// Saturating advance, so periodic deadlines can never wrap backwards.
    pub fn offset_ms(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }
}

impl From<u64> for Timestamp {
    fn from(v: u64) -> Self {
        Timestamp(v)
    }
}

impl From<Timestamp> for u64 {
    fn from(v: Timestamp) -> Self {
        v.0
    }
}

bitflags::bitflags! {
    /// Attribute bits of an event slot in the registry.
    ///
    /// `VALUE` and `STREAM` select the payload shape and are mutually
    /// exclusive; a slot with neither is a bare topic event. The remaining
    /// bits qualify behavior and can be OR'd in freely.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct EventAttrs: u8 {
        /// Fixed-size payload, read and written whole.
        const VALUE = 0x01;
        /// Byte-stream payload behind a circular buffer.
        const STREAM = 0x02;
        /// Delivery is not suppressed for event-receive-disabled tasks.
        /// Recorded but not yet consumed by the dispatch path.
        const UNBLOCKED = 0x08;
        /// Reserved: survive reboots. Never acted on.
        const PERSISTENT = 0x10;
        /// Data-store writes to this topic publish the topic themselves.
        const LINK_EVENT = 0x40;
        /// Visible to every task without subscription. Recorded but not yet
        /// consumed by the dispatch path.
        const GLOBAL = 0x80;
    }
}

impl EventAttrs {
    /// The payload-shape bits.
    pub const PAYLOAD: Self = Self::VALUE.union(Self::STREAM);

    /// True if exactly one payload shape is selected.
    pub fn payload_is_exclusive(self) -> bool {
        let p = self.intersection(Self::PAYLOAD);
        p == Self::VALUE || p == Self::STREAM
    }
}

/// The event descriptor delivered to user code.
///
/// `size` is 0 for bare topic events, the registered payload size for value
/// events, and the stream fill level at delivery time for stream events.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Event {
    pub topic: Topic,
    pub id: u16,
    pub size: u16,
}

impl Event {
    /// Checks the descriptor against a topic name.
    pub fn matches(&self, topic: &str) -> bool {
        self.topic == topic
    }
}
