// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The event queue: undelivered event-data records, in arrival order.
//!
//! Records are small fixed-size structures allocated from the event heap
//! and doubly linked through heap offsets. A record's `owner` bitmap is the
//! authoritative delivery state: one bit per recipient task that has not
//! consumed the record yet. Records enter at the tail and leave from
//! wherever their last owner bit was cleared.
//!
//! Exhausting the event heap is a sizing error by the application, not a
//! runtime condition, so allocation failure here is fatal.

use abi::Timestamp;
use zerocopy::byteorder::{LittleEndian, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::heap::{Heap, REF_NIL};
use crate::OwnerMask;

/// One event-data record, as laid out in the event heap.
///
/// The byte-order type for the timestamp keeps the record padding-free
/// independent of the owner-mask width.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub(crate) struct EventData {
    pub next: u32,
    pub prev: u32,
    pub owner: OwnerMask,
    pub time: U64<LittleEndian>,
    /// Registry slot of the event's topic.
    pub id: u16,
    pub _pad: u16,
}

pub(crate) const RECORD_SIZE: u32 = core::mem::size_of::<EventData>() as u32;

/// Queue bookkeeping. The records themselves live in the event heap.
#[derive(Debug)]
pub(crate) struct EventQueue {
    head: u32,
    tail: u32,
}

impl EventQueue {
    pub(crate) fn new() -> Self {
        Self { head: REF_NIL, tail: REF_NIL }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head == REF_NIL
    }

    pub(crate) fn read(heap: &Heap, off: u32) -> EventData {
        EventData::read_from_bytes(heap.data(off, RECORD_SIZE as usize))
            .expect("event record")
    }

    pub(crate) fn write(heap: &mut Heap, off: u32, rec: &EventData) {
        rec.write_to(heap.data_mut(off, RECORD_SIZE as usize))
            .expect("event record")
    }

    /// Allocates a record for event `id` owned by `owner` and links it at
    /// the tail.
    pub(crate) fn append(
        &mut self,
        heap: &mut Heap,
        id: u16,
        owner: OwnerMask,
        now: Timestamp,
    ) -> u32 {
        assert!(!owner.is_empty(), "queued record must have a recipient");
        let off = match heap.alloc(RECORD_SIZE) {
            Ok(off) => off,
            // Sizing error; see module docs.
            Err(e) => panic!("event heap exhausted: {e:?}"),
        };
        let rec = EventData {
            next: REF_NIL,
            prev: self.tail,
            owner,
            time: U64::new(now.millis()),
            id,
            _pad: 0,
        };
        Self::write(heap, off, &rec);

        if self.tail == REF_NIL {
            self.head = off;
        } else {
            let mut tail = Self::read(heap, self.tail);
            tail.next = off;
            Self::write(heap, self.tail, &tail);
        }
        self.tail = off;
        off
    }

    /// Unlinks the record at `off` and returns its storage to the heap.
    pub(crate) fn remove(&mut self, heap: &mut Heap, off: u32) {
        let rec = Self::read(heap, off);

        if rec.prev == REF_NIL {
            self.head = rec.next;
        } else {
            let mut prev = Self::read(heap, rec.prev);
            prev.next = rec.next;
            Self::write(heap, rec.prev, &prev);
        }
        if rec.next == REF_NIL {
            self.tail = rec.prev;
        } else {
            let mut next = Self::read(heap, rec.next);
            next.prev = rec.prev;
            Self::write(heap, rec.next, &next);
        }

        heap.free(off).expect("freeing a linked record");
    }

    /// Record offsets, head to tail.
    pub(crate) fn offsets(&self, heap: &Heap) -> Vec<u32> {
        let mut out = Vec::new();
        let mut off = self.head;
        while off != REF_NIL {
            out.push(off);
            off = Self::read(heap, off).next;
        }
        out
    }

    /// Bitwise OR of every queued record's owner mask. This is what the
    /// cached global union must always equal.
    pub(crate) fn union_owners(&self, heap: &Heap) -> OwnerMask {
        let mut union = OwnerMask::EMPTY;
        for off in self.offsets(heap) {
            union.merge(&Self::read(heap, off).owner);
        }
        union
    }

    pub(crate) fn depth(&self, heap: &Heap) -> usize {
        self.offsets(heap).len()
    }
}

/// Descriptor-sized summary used by the wait path.
#[derive(Copy, Clone, Debug)]
pub(crate) struct QueuedEvent {
    pub off: u32,
    pub id: u16,
}

impl EventQueue {
    /// Finds the first record whose owner bitmap includes `task`.
    pub(crate) fn first_owned_by(
        &self,
        heap: &Heap,
        task: usize,
    ) -> Option<QueuedEvent> {
        let mut off = self.head;
        while off != REF_NIL {
            let rec = Self::read(heap, off);
            if rec.owner.contains(task) {
                return Some(QueuedEvent { off, id: rec.id });
            }
            off = rec.next;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> Heap {
        Heap::new(1024)
    }

    #[test]
    fn append_links_in_order() {
        let mut heap = heap();
        let mut q = EventQueue::new();
        assert!(q.is_empty());

        let a = q.append(&mut heap, 1, OwnerMask::single(0), 10.into());
        let b = q.append(&mut heap, 2, OwnerMask::single(1), 11.into());
        let c = q.append(&mut heap, 3, OwnerMask::single(0), 12.into());
        assert_eq!(q.offsets(&heap), vec![a, b, c]);
        assert_eq!(q.depth(&heap), 3);
    }

    #[test]
    fn remove_from_every_position() {
        for victim in 0..3 {
            let mut heap = heap();
            let mut q = EventQueue::new();
            let offs: Vec<u32> = (0..3u16)
                .map(|i| {
                    q.append(
                        &mut heap,
                        i,
                        OwnerMask::single(i as usize),
                        0.into(),
                    )
                })
                .collect();

            q.remove(&mut heap, offs[victim]);
            let expect: Vec<u32> = offs
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != victim)
                .map(|(_, &o)| o)
                .collect();
            assert_eq!(q.offsets(&heap), expect);

            // Tail append still works after surgery.
            q.append(&mut heap, 9, OwnerMask::single(5), 1.into());
            assert_eq!(q.depth(&heap), 3);
        }
    }

    #[test]
    fn remove_last_record_empties_queue() {
        let mut heap = heap();
        let mut q = EventQueue::new();
        let a = q.append(&mut heap, 1, OwnerMask::single(0), 0.into());
        q.remove(&mut heap, a);
        assert!(q.is_empty());
        assert_eq!(q.depth(&heap), 0);
        // Storage actually returned.
        assert_eq!(heap.used(), 0);
    }

    #[test]
    fn union_tracks_owners() {
        let mut heap = heap();
        let mut q = EventQueue::new();
        let mut both = OwnerMask::single(2);
        both.set(7);
        q.append(&mut heap, 1, both, 0.into());
        let b = q.append(&mut heap, 2, OwnerMask::single(3), 0.into());

        let mut expect = both;
        expect.set(3);
        assert_eq!(q.union_owners(&heap), expect);

        q.remove(&mut heap, b);
        assert_eq!(q.union_owners(&heap), both);
    }

    #[test]
    fn first_owned_by_scans_in_order() {
        let mut heap = heap();
        let mut q = EventQueue::new();
        q.append(&mut heap, 1, OwnerMask::single(0), 0.into());
        let b = q.append(&mut heap, 2, OwnerMask::single(4), 0.into());
        q.append(&mut heap, 3, OwnerMask::single(4), 0.into());

        let hit = q.first_owned_by(&heap, 4).unwrap();
        assert_eq!(hit.off, b);
        assert_eq!(hit.id, 2);
        assert!(q.first_owned_by(&heap, 9).is_none());
    }

    #[test]
    #[should_panic(expected = "event heap exhausted")]
    fn heap_exhaustion_is_fatal() {
        let mut heap = Heap::new(64);
        let mut q = EventQueue::new();
        for i in 0..4 {
            q.append(&mut heap, i, OwnerMask::single(0), 0.into());
        }
    }
}
