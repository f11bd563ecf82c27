// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event delivery: the unified give path and the consume path.
//!
//! `give` is the single internal entry point behind send, send-by-id, and
//! publish. Every step -- target resolution, specific-wait filtering,
//! semaphore release, record materialization, cached-union maintenance --
//! runs under the core lock, which is what makes the owner-mask invariants
//! hold: at any observable instant, the OR of all queued records' owners
//! equals `g_owner`.
//!
//! Releasing recipient semaphores from inside the lock is fine: release
//! only unblocks, it never waits.

use abi::{TaskId, Timestamp, Topic};
use zerocopy::byteorder::U64;

use crate::heap::REF_NIL;
use crate::queue::EventQueue;
use crate::registry::Payload;
use crate::{Core, OwnerMask, Trace};

/// Who an event is for.
#[derive(Copy, Clone, Debug)]
pub(crate) enum Recipient<'a> {
    /// Point-to-point, task named by topic.
    Task(&'a str),
    /// Point-to-point, task named by id.
    TaskById(TaskId),
    /// Everyone subscribed to the event's topic.
    Subscribers,
}

impl Core {
    /// Delivers `topic` to `to`. `caller`, when known, is exempted from the
    /// wake phase so a task cannot release its own semaphore by sending to
    /// itself.
    pub(crate) fn give(
        &mut self,
        caller: Option<TaskId>,
        to: Recipient<'_>,
        topic: Topic,
        now: Timestamp,
    ) {
        // Resolve the event slot, creating a bare topic event on first use.
        let e_id = self.registry.insert_event(topic);
        let _ = self.registry.event(e_id); // must not name a task

        // Step 1: the raw target mask.
        let mut target = match to {
            Recipient::Task(name) => {
                let t_id = self
                    .registry
                    .get_index(name)
                    .unwrap_or_else(|| panic!("send to unknown task {name}"));
                self.single_task_target(TaskId(t_id), e_id)
            }
            Recipient::TaskById(id) => self.single_task_target(id, e_id),
            Recipient::Subscribers => {
                self.trace.record(Trace::Publish { id: e_id });
                let subs = self.registry.event(e_id).subs;
                let mut mask = subs;
                for t in subs.iter() {
                    if self.registry.task(t as u16).recv_disabled {
                        mask.clear(t);
                    }
                }
                mask
            }
        };

        // Step 2: tasks blocked in a specific wait for some other topic do
        // not receive this one at all.
        let snapshot = target;
        for t in snapshot.iter() {
            if let Some(waited) = self.registry.task(t as u16).waiting_for {
                if waited != topic {
                    target.clear(t);
                }
            }
        }
        if target.is_empty() {
            self.trace.record(Trace::NoTargets { id: e_id });
            return;
        }

        // Step 3: wake every recipient except the caller.
        for t in target.iter() {
            if caller.map_or(true, |c| c.index() != t) {
                self.registry.task(t as u16).sem.release();
                self.trace.record(Trace::Wake { task: TaskId(t as u16) });
            }
        }

        // Step 4: materialize the record. Bare topic events always get a
        // fresh record; value/stream events coalesce into their live one.
        let (has_payload, head) = {
            let e = self.registry.event(e_id);
            (!matches!(e.payload, Payload::None), e.head)
        };
        if has_payload && head != REF_NIL {
            let mut rec = EventQueue::read(&self.eheap, head);
            rec.owner.merge(&target);
            rec.time = U64::new(now.millis());
            EventQueue::write(&mut self.eheap, head, &rec);
            self.trace.record(Trace::Coalesced { id: e_id });
        } else {
            let off = self.equeue.append(&mut self.eheap, e_id, target, now);
            if has_payload {
                self.registry.event_mut(e_id).head = off;
            }
            self.trace.record(Trace::Queued { id: e_id });
        }

        // Step 5: fold the new recipients into the cached union.
        self.g_owner.merge(&target);
    }

    /// Send-target resolution: one bit, unless the receive gate is closed.
    fn single_task_target(&mut self, id: TaskId, e_id: u16) -> OwnerMask {
        self.trace.record(Trace::Send { id: e_id });
        let task = self.registry.task(id.0);
        if task.recv_disabled {
            // Dropped silently; disabling receive is the intended
            // back-pressure mechanism.
            self.trace.record(Trace::DropDisabled { id: e_id });
            return OwnerMask::EMPTY;
        }
        OwnerMask::single(id.index())
    }

    /// Pops the first queued event owned by `task`, if any, releasing the
    /// record once its last owner has consumed it.
    pub(crate) fn consume_one(&mut self, task: TaskId) -> Option<abi::Event> {
        let hit = self.equeue.first_owned_by(&self.eheap, task.index())?;

        let topic = self.registry.slot(hit.id).key;
        let (size, has_payload) = match &self.registry.event(hit.id).payload {
            Payload::None => (0, false),
            Payload::Value { size, .. } => (*size, true),
            Payload::Stream { ring, .. } => (ring.len() as u16, true),
        };

        let mut rec = EventQueue::read(&self.eheap, hit.off);
        rec.owner.clear(task.index());
        if rec.owner.is_empty() {
            if has_payload {
                self.registry.event_mut(hit.id).head = REF_NIL;
            }
            self.equeue.remove(&mut self.eheap, hit.off);
        } else {
            EventQueue::write(&mut self.eheap, hit.off, &rec);
        }
        // Keep the cached union in sync with what is actually queued.
        self.g_owner = self.equeue.union_owners(&self.eheap);

        self.trace.record(Trace::Delivered { task, id: hit.id });
        Some(abi::Event { topic, id: hit.id, size })
    }

    pub(crate) fn subscribe(&mut self, task: TaskId, topic: Topic) {
        let e_id = self.registry.insert_event(topic);
        let e = self.registry.event_mut(e_id);
        if matches!(e.payload, Payload::Stream { .. }) {
            // A stream has one reader; competing subscribers would race the
            // ring cursors.
            assert!(
                e.subs.is_empty(),
                "stream topic {topic} already has a subscriber",
            );
        }
        e.subs.set(task.index());
        self.trace.record(Trace::Subscribed { task, id: e_id });
    }

    pub(crate) fn unsubscribe(&mut self, task: TaskId, topic: &str) {
        let e_id = self
            .registry
            .get_index(topic)
            .unwrap_or_else(|| panic!("unsubscribe from unknown {topic}"));
        let e = self.registry.event_mut(e_id);
        assert!(
            !matches!(e.payload, Payload::Stream { .. }),
            "stream topic {topic} cannot be unsubscribed",
        );
        e.subs.clear(task.index());
        self.trace.record(Trace::Unsubscribed { task, id: e_id });
    }
}
