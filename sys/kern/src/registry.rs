// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The topic registry: one open-addressed hash table naming everything.
//!
//! Tasks, events, and data-store entries all live here, keyed by topic
//! string. A slot index is an object's identity for its whole life: it is
//! the task's bit position in owner masks and the `id` field of delivered
//! event descriptors. Slots are never deleted.
//!
//! Lookup hashes with DJB2 and probes `(base ± i) mod N` around the home
//! position, where the home position is taken modulo the largest prime not
//! exceeding the table size. The probe budget is deliberately tiny
//! (`MAX_HASH_SEEK_TIMES`): a workload that blows it needs a bigger table,
//! not a cleverer probe, so insertion failure is fatal.

use std::sync::Arc;

use abi::{
    EventAttrs, Priority, Topic, MAX_HASH_SEEK_TIMES, MAX_OBJECTS,
};
use streamq::ByteRing;

use crate::arch::EventSem;
use crate::heap::REF_NIL;
use crate::{OwnerMask, SlotMask};

/// Payload shape of an event slot. `Value` and `Stream` reference data-store
/// heap allocations; bare topic events carry nothing.
#[derive(Debug)]
pub(crate) enum Payload {
    None,
    Value { off: u32, size: u16 },
    Stream { off: u32, ring: ByteRing },
}

/// Registry body of an event topic.
#[derive(Debug)]
pub(crate) struct EventSlot {
    pub attrs: EventAttrs,
    /// Subscriber bitmap.
    pub subs: OwnerMask,
    /// Event-heap offset of the live undelivered record, for value/stream
    /// events only. Bare topic events always append fresh records.
    pub head: u32,
    pub payload: Payload,
}

impl EventSlot {
    fn bare() -> Self {
        Self {
            attrs: EventAttrs::empty(),
            subs: OwnerMask::EMPTY,
            head: REF_NIL,
            payload: Payload::None,
        }
    }
}

/// Registry body of a task.
#[derive(Debug)]
pub(crate) struct TaskSlot {
    pub priority: Priority,
    /// The task's private wake semaphore. Cloned out of the core lock by
    /// waiters before blocking.
    pub sem: Arc<EventSem>,
    /// Receive gate: while set, sends and publishes skip this task
    /// entirely. This is the intended back-pressure mechanism.
    pub recv_disabled: bool,
    /// While set, the task only accepts the named topic; give() filters
    /// everything else away from it.
    pub waiting_for: Option<Topic>,
}

/// What a registry slot holds.
#[derive(Debug)]
pub(crate) enum SlotBody {
    Task(TaskSlot),
    Event(EventSlot),
}

#[derive(Debug)]
pub(crate) struct Slot {
    pub key: Topic,
    pub body: SlotBody,
}

pub(crate) struct Registry {
    slots: [Option<Slot>; MAX_OBJECTS],
    /// Largest prime not exceeding `MAX_OBJECTS`, computed once at init;
    /// the modulus for home positions.
    prime: u16,
    /// Which slots hold tasks, so publish can walk tasks without touching
    /// every slot.
    pub task_occupancy: SlotMask,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
            prime: largest_prime_not_above(MAX_OBJECTS as u16),
            task_occupancy: SlotMask::EMPTY,
        }
    }

    /// Finds the slot holding `topic`, if any.
    pub(crate) fn get_index(&self, topic: &str) -> Option<u16> {
        // Occupied-and-matching is the only way probe() can return an
        // index under this predicate.
        self.probe(topic, |slot| slot.is_some())
    }

    /// Finds `topic`'s slot, or claims an empty one for a bare event.
    /// Idempotent on existing keys regardless of their body.
    pub(crate) fn insert_event(&mut self, topic: Topic) -> u16 {
        self.insert(topic, || SlotBody::Event(EventSlot::bare()))
    }

    /// Claims a slot for a new task. The name must not already be taken.
    pub(crate) fn insert_task(
        &mut self,
        name: Topic,
        priority: Priority,
    ) -> u16 {
        assert!(
            self.get_index(name).is_none(),
            "task name already registered: {name}",
        );
        let index = self.insert(name, || {
            SlotBody::Task(TaskSlot {
                priority,
                sem: Arc::new(EventSem::new()),
                recv_disabled: false,
                waiting_for: None,
            })
        });
        self.task_occupancy.set(index as usize);
        index
    }

    fn insert(&mut self, topic: Topic, body: impl FnOnce() -> SlotBody) -> u16 {
        let index = self
            .probe(topic, |slot| {
                slot.as_ref().map_or(true, |s| s.key == topic)
            })
            .unwrap_or_else(|| {
                // The table is too small for the workload; growing it is a
                // build-time decision.
                panic!("registry overfull inserting {topic}");
            });
        if self.slots[index as usize].is_none() {
            self.slots[index as usize] =
                Some(Slot { key: topic, body: body() });
        }
        index
    }

    /// Runs the shared probe sequence and returns the first index whose
    /// slot satisfies `hit`, giving up after the seek budget.
    fn probe(
        &self,
        topic: &str,
        hit: impl Fn(&Option<Slot>) -> bool,
    ) -> Option<u16> {
        let base = (djb2(topic) % u32::from(self.prime)) as isize;
        for i in 0..=MAX_HASH_SEEK_TIMES as isize {
            for offset in [-i, i] {
                let index = (base + offset)
                    .rem_euclid(MAX_OBJECTS as isize)
                    as usize;
                let slot = &self.slots[index];
                if hit(slot) {
                    // Content equality short-circuits; so does the first
                    // empty slot during insertion.
                    if slot.as_ref().map_or(true, |s| s.key == topic) {
                        return Some(index as u16);
                    }
                }
            }
        }
        None
    }

    pub(crate) fn slot(&self, index: u16) -> &Slot {
        self.slots[index as usize].as_ref().expect("empty registry slot")
    }

    /// The event body at `index`; panics if the slot holds something else.
    pub(crate) fn event(&self, index: u16) -> &EventSlot {
        match &self.slot(index).body {
            SlotBody::Event(e) => e,
            SlotBody::Task(_) => {
                panic!("slot {index} is a task, not an event")
            }
        }
    }

    pub(crate) fn event_mut(&mut self, index: u16) -> &mut EventSlot {
        let slot =
            self.slots[index as usize].as_mut().expect("empty registry slot");
        match &mut slot.body {
            SlotBody::Event(e) => e,
            SlotBody::Task(_) => {
                panic!("slot {index} is a task, not an event")
            }
        }
    }

    /// The task body at `index`; panics if the slot holds something else.
    pub(crate) fn task(&self, index: u16) -> &TaskSlot {
        match &self.slot(index).body {
            SlotBody::Task(t) => t,
            SlotBody::Event(_) => {
                panic!("slot {index} is an event, not a task")
            }
        }
    }

    pub(crate) fn task_mut(&mut self, index: u16) -> &mut TaskSlot {
        let slot =
            self.slots[index as usize].as_mut().expect("empty registry slot");
        match &mut slot.body {
            SlotBody::Task(t) => t,
            SlotBody::Event(_) => {
                panic!("slot {index} is an event, not a task")
            }
        }
    }

    pub(crate) fn task_count(&self) -> usize {
        self.task_occupancy.count()
    }
}

/// DJB2, masked to 31 bits.
fn djb2(s: &str) -> u32 {
    let mut hash: u32 = 5381;
    for &byte in s.as_bytes() {
        hash = hash
            .wrapping_add(hash << 5)
            .wrapping_add(u32::from(byte));
    }
    hash & 0x7fff_ffff
}

fn largest_prime_not_above(n: u16) -> u16 {
    'candidate: for p in (2..=n).rev() {
        for d in 2..p {
            if u32::from(d) * u32::from(d) > u32::from(p) {
                break;
            }
            if p % d == 0 {
                continue 'candidate;
            }
        }
        return p;
    }
    unreachable!("no prime below {n}")
}
