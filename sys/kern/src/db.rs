// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The data store: payload-bearing topics.
//!
//! A registered topic carries either a fixed-size value, read and written
//! whole, or a byte stream behind a circular buffer. The bytes live in the
//! data-store heap; the slot's tagged payload holds the offset (and, for
//! streams, the ring cursors). Delivery of the *fact that data changed*
//! goes through the ordinary event path: either the producer publishes the
//! topic explicitly after writing, or the topic was registered with
//! `LINK_EVENT` and every write publishes on its own.

use abi::{EventAttrs, TaskId, Timestamp, Topic};
use streamq::ByteRing;

use crate::bus::Recipient;
use crate::registry::Payload;
use crate::{Core, OwnerMask, Trace};

impl Core {
    /// Registers `topic` as a payload-bearing event. `attrs` must select
    /// exactly one payload shape; re-registering with the same shape is a
    /// no-op, changing shapes is fatal.
    pub(crate) fn db_register(
        &mut self,
        topic: Topic,
        size: u16,
        attrs: EventAttrs,
    ) {
        assert!(
            attrs.payload_is_exclusive(),
            "{topic}: registration must pick VALUE or STREAM",
        );
        assert!(size > 0, "{topic}: zero-size registration");

        let e_id = self.registry.insert_event(topic);
        let existing = self.registry.event(e_id);
        let new_kind = attrs & EventAttrs::PAYLOAD;
        let old_kind = existing.attrs & EventAttrs::PAYLOAD;
        assert!(
            old_kind.is_empty() || old_kind == new_kind,
            "{topic}: payload shape may not change",
        );

        if !old_kind.is_empty() {
            // Redundant registration; keep the existing buffer, refresh the
            // qualifier bits.
            self.registry.event_mut(e_id).attrs = attrs;
            return;
        }

        let off = match self.dbheap.alloc(u32::from(size)) {
            Ok(off) => off,
            Err(e) => panic!("data-store heap exhausted at {topic}: {e:?}"),
        };
        let e = self.registry.event_mut(e_id);
        e.attrs = attrs;
        if new_kind == EventAttrs::VALUE {
            e.payload = Payload::Value { off, size };
        } else {
            e.payload =
                Payload::Stream { off, ring: ByteRing::new(u32::from(size)) };
            // A stream starts with a clean single-reader slate.
            e.subs = OwnerMask::EMPTY;
        }
        self.trace.record(Trace::DbRegistered { id: e_id });
    }

    /// Overwrites the whole value buffer of `topic`.
    pub(crate) fn db_block_write(
        &mut self,
        caller: Option<TaskId>,
        topic: &str,
        data: &[u8],
        now: Timestamp,
    ) {
        let e_id = self.lookup_db(topic, EventAttrs::VALUE);
        let key = self.registry.slot(e_id).key;
        let attrs = self.registry.event(e_id).attrs;

        {
            let Core { registry, dbheap, trace, .. } = self;
            let &Payload::Value { off, size } = &registry.event(e_id).payload
            else {
                unreachable!()
            };
            assert!(
                data.len() == usize::from(size),
                "{topic}: write of {} bytes into a {size}-byte value",
                data.len(),
            );
            dbheap.data_mut(off, data.len()).copy_from_slice(data);
            trace.record(Trace::DbWrite { id: e_id, len: size });
        }

        if attrs.contains(EventAttrs::LINK_EVENT) {
            self.give(caller, Recipient::Subscribers, key, now);
        }
    }

    /// Copies the whole value buffer of `topic` out.
    pub(crate) fn db_block_read(&self, topic: &str, out: &mut [u8]) {
        let e_id = self.lookup_db(topic, EventAttrs::VALUE);
        let &Payload::Value { off, size } =
            &self.registry.event(e_id).payload
        else {
            unreachable!()
        };
        assert!(
            out.len() == usize::from(size),
            "{topic}: read of {} bytes from a {size}-byte value",
            out.len(),
        );
        out.copy_from_slice(self.dbheap.data(off, out.len()));
    }

    /// Appends `data` to the stream behind `topic`. Overflow is a sizing
    /// error and fatal; writing with no subscriber is fine.
    pub(crate) fn db_stream_write(
        &mut self,
        caller: Option<TaskId>,
        topic: &str,
        data: &[u8],
        now: Timestamp,
    ) {
        let e_id = self.lookup_db(topic, EventAttrs::STREAM);
        let key = self.registry.slot(e_id).key;
        let attrs = self.registry.event(e_id).attrs;

        {
            let Core { registry, dbheap, trace, .. } = self;
            let Payload::Stream { off, ring } =
                &mut registry.event_mut(e_id).payload
            else {
                unreachable!()
            };
            let cap = ring.capacity() as usize;
            let storage = dbheap.data_mut(*off, cap);
            if ring.push(storage, data).is_err() {
                panic!(
                    "{topic}: stream overflow ({} in, {} free)",
                    data.len(),
                    ring.free(),
                );
            }
            trace.record(Trace::DbWrite { id: e_id, len: data.len() as u16 });
        }

        if attrs.contains(EventAttrs::LINK_EVENT) {
            self.give(caller, Recipient::Subscribers, key, now);
        }
    }

    /// Drains up to `out.len()` bytes from the stream behind `topic`,
    /// returning how many were present.
    pub(crate) fn db_stream_read(
        &mut self,
        topic: &str,
        out: &mut [u8],
    ) -> usize {
        let e_id = self.lookup_db(topic, EventAttrs::STREAM);
        let Core { registry, dbheap, .. } = self;
        let Payload::Stream { off, ring } =
            &mut registry.event_mut(e_id).payload
        else {
            unreachable!()
        };
        let cap = ring.capacity() as usize;
        ring.pull(dbheap.data(*off, cap), out)
    }

    /// Shared validation: `topic` must exist, be an event, and carry the
    /// requested payload attribute.
    fn lookup_db(&self, topic: &str, wanted: EventAttrs) -> u16 {
        let e_id = self
            .registry
            .get_index(topic)
            .unwrap_or_else(|| panic!("unregistered data topic {topic}"));
        let e = self.registry.event(e_id);
        assert!(
            e.attrs.contains(wanted),
            "{topic}: not registered for this access kind",
        );
        e_id
    }
}
