// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The event-dispatch kernel.
//!
//! Everything in this system is named by a topic string and registered in
//! one hash table: tasks, events, and data-store entries. Producers send a
//! topic to one task or publish it to subscribers; recipients block on a
//! private semaphore and drain the shared event queue. Payloads, when
//! present, live in the data store (fixed-size values or byte streams) and
//! events about them coalesce rather than pile up.
//!
//! # Design principles
//!
//! While this isn't a *deeply* principled kernel, some basic ideas appear
//! consistently.
//!
//! 1. Static configuration. Table sizes, mask widths, and nesting depths
//!    are fixed at compile time; running out of any of them is a sizing
//!    error, not a runtime condition.
//! 2. One lock. A single mutex over the kernel core plays the role the
//!    interrupt gate plays on bare metal: every public operation is atomic with
//!    respect to every other, and there are exactly two places a task can
//!    block, neither of which holds the lock.
//! 3. A strong preference for safe code. Heap-resident records are typed
//!    `zerocopy` views at offsets, not pointers.
//! 4. Simple and clear algorithms over fast and clever ones: linear scans
//!    over tiny tables beat data structures you have to debug.

mod arch;
mod bus;
mod db;
mod heap;
mod queue;
mod registry;
mod timer;

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

pub use abi::{
    Event, EventAttrs, Priority, TaskId, Timestamp, Topic, FOREVER,
    OWNER_WORDS,
};
pub use ktrace::TraceEntry;

use bus::Recipient;
use heap::Heap;
use ktrace::TraceBuf;
use queue::EventQueue;
use registry::Registry;
use timer::TimerList;

/// Task-width bitmap: bit *n* names the task in registry slot *n*.
pub type OwnerMask = ownermask::BitMask<{ abi::OWNER_WORDS }>;

/// Registry-width bitmap, used for slot occupancy.
pub(crate) type SlotMask = ownermask::BitMask<{ abi::SLOT_WORDS }>;

/// Sizing knobs fixed at kernel construction.
#[derive(Copy, Clone, Debug)]
pub struct Config {
    /// Bytes backing event-data records.
    pub event_heap_size: usize,
    /// Bytes backing data-store payloads.
    pub db_heap_size: usize,
    /// Period of the time-event driver.
    pub tick: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            event_heap_size: 5120,
            db_heap_size: 4096,
            tick: Duration::from_millis(1),
        }
    }
}

/// What the kernel has been doing lately; see [`Kernel::trace`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Trace {
    TaskRegistered { task: TaskId },
    Send { id: u16 },
    Publish { id: u16 },
    /// A send hit a task with its receive gate closed.
    DropDisabled { id: u16 },
    /// Target resolution came up empty; nothing was queued.
    NoTargets { id: u16 },
    Wake { task: TaskId },
    Queued { id: u16 },
    /// A value/stream give folded into the live record.
    Coalesced { id: u16 },
    Delivered { task: TaskId, id: u16 },
    Subscribed { task: TaskId, id: u16 },
    Unsubscribed { task: TaskId, id: u16 },
    TimerScheduled { topic: Topic },
    TimerFired { topic: Topic },
    TimerCanceled { topic: Topic },
    DbRegistered { id: u16 },
    DbWrite { id: u16, len: u16 },
}

/// All mutable kernel state, guarded by the one lock.
pub(crate) struct Core {
    pub registry: Registry,
    pub equeue: EventQueue,
    pub eheap: Heap,
    pub dbheap: Heap,
    pub timers: TimerList,
    /// Cached OR of every queued record's owner mask.
    pub g_owner: OwnerMask,
    pub trace: TraceBuf<Trace, 128>,
}

/// One kernel instance.
///
/// On a device this would be the singleton behind `init()`; here it is an
/// explicit context so several instances can coexist in one process (which
/// is also what keeps the test suite parallel-safe).
pub struct Kernel {
    core: Mutex<Core>,
    clock: arch::Clock,
}

impl Kernel {
    /// Builds a kernel and starts its time-event driver thread. The driver
    /// holds only a weak reference, so dropping the last `Arc` shuts it
    /// down.
    pub fn new(config: Config) -> Arc<Kernel> {
        let kernel = Arc::new(Kernel {
            core: Mutex::new(Core {
                registry: Registry::new(),
                equeue: EventQueue::new(),
                eheap: Heap::new(config.event_heap_size),
                dbheap: Heap::new(config.db_heap_size),
                timers: TimerList::new(),
                g_owner: OwnerMask::EMPTY,
                trace: TraceBuf::new(),
            }),
            clock: arch::Clock::new(),
        });

        let weak: Weak<Kernel> = Arc::downgrade(&kernel);
        let tick = config.tick;
        std::thread::Builder::new()
            .name("system-timer".into())
            .spawn(move || loop {
                std::thread::sleep(tick);
                match weak.upgrade() {
                    Some(k) => k.poll_time_events(),
                    None => break,
                }
            })
            .expect("spawning the system-timer thread");

        kernel
    }

    /// Milliseconds since this kernel was created.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().expect("kernel core lock")
    }

    // --- tasks ---

    /// Claims a registry slot and a wake semaphore for a task. The name
    /// must be fresh.
    pub fn register_task(&self, name: Topic, priority: Priority) -> TaskId {
        let mut core = self.lock();
        let index = core.registry.insert_task(name, priority);
        core.trace.record(Trace::TaskRegistered { task: TaskId(index) });
        TaskId(index)
    }

    /// Opens or closes the task's receive gate. While closed, sends and
    /// publishes pass the task by silently.
    pub fn set_event_recv_disabled(&self, task: TaskId, disabled: bool) {
        self.lock().registry.task_mut(task.0).recv_disabled = disabled;
    }

    // --- event bus ---

    /// Sends `topic` point-to-point to the task named `task`.
    pub fn send(&self, task: &str, topic: Topic) {
        self.send_from(None, task, topic);
    }

    /// `send`, with the producing task identified so it is not woken by
    /// its own event.
    pub fn send_from(&self, caller: Option<TaskId>, task: &str, topic: Topic) {
        let now = self.now();
        self.lock().give(caller, Recipient::Task(task), topic, now);
    }

    /// Sends `topic` to a task already resolved to an id.
    pub fn send_by_id(&self, task: TaskId, topic: Topic) {
        self.send_by_id_from(None, task, topic);
    }

    pub fn send_by_id_from(
        &self,
        caller: Option<TaskId>,
        task: TaskId,
        topic: Topic,
    ) {
        let now = self.now();
        self.lock().give(caller, Recipient::TaskById(task), topic, now);
    }

    /// Publishes `topic` to its subscribers.
    pub fn publish(&self, topic: Topic) {
        self.publish_from(None, topic);
    }

    pub fn publish_from(&self, caller: Option<TaskId>, topic: Topic) {
        let now = self.now();
        self.lock().give(caller, Recipient::Subscribers, topic, now);
    }

    /// Adds `task` to `topic`'s subscribers, creating the topic on first
    /// use. A stream topic accepts at most one subscriber.
    pub fn subscribe(&self, task: TaskId, topic: Topic) {
        self.lock().subscribe(task, topic);
    }

    /// Removes `task` from `topic`'s subscribers. The topic must exist and
    /// must not be a stream.
    pub fn unsubscribe(&self, task: TaskId, topic: &str) {
        self.lock().unsubscribe(task, topic);
    }

    /// Blocks `task` until an event for it arrives, for at most
    /// `timeout_ms` (`FOREVER` to wait indefinitely). Returns the event
    /// descriptor, or `None` on timeout.
    pub fn wait_event(&self, task: TaskId, timeout_ms: u32) -> Option<Event> {
        let sem = Arc::clone(&self.lock().registry.task(task.0).sem);
        if !sem.take(timeout_ms) {
            return None;
        }
        // A successful take with nothing queued for us is legal: value and
        // stream gives coalesce records but still release once per give.
        self.lock().consume_one(task)
    }

    /// Like [`Kernel::wait_event`], but only `topic` is accepted: while
    /// waiting, the give path filters every other topic away from this
    /// task. Returns `None` on timeout or if the delivered event does not
    /// match.
    pub fn wait_specific_event(
        &self,
        task: TaskId,
        topic: Topic,
        timeout_ms: u32,
    ) -> Option<Event> {
        {
            let mut core = self.lock();
            core.registry.insert_event(topic);
            core.registry.task_mut(task.0).waiting_for = Some(topic);
        }
        let got = self.wait_event(task, timeout_ms);
        self.lock().registry.task_mut(task.0).waiting_for = None;
        got.filter(|e| e.matches(topic))
    }

    /// Marks `topic` globally visible. Recorded attribute only.
    pub fn mark_topic_global(&self, topic: Topic) {
        let mut core = self.lock();
        let e_id = core.registry.insert_event(topic);
        core.registry.event_mut(e_id).attrs |= EventAttrs::GLOBAL;
    }

    /// Marks `topic` as exempt from receive gating. Recorded attribute
    /// only.
    pub fn mark_topic_unblocked(&self, topic: Topic) {
        let mut core = self.lock();
        let e_id = core.registry.insert_event(topic);
        core.registry.event_mut(e_id).attrs |= EventAttrs::UNBLOCKED;
    }

    // --- time events ---

    /// Publishes `topic` once, `ms` milliseconds from now.
    pub fn publish_delay(&self, topic: Topic, ms: u32) {
        let now = self.now();
        let mut core = self.lock();
        core.timers.schedule(topic, ms, true, now);
        core.trace.record(Trace::TimerScheduled { topic });
    }

    /// Publishes `topic` every `ms` milliseconds.
    pub fn publish_period(&self, topic: Topic, ms: u32) {
        let now = self.now();
        let mut core = self.lock();
        core.timers.schedule(topic, ms, false, now);
        core.trace.record(Trace::TimerScheduled { topic });
    }

    /// Subscribes the named task to `topic` and schedules a one-shot
    /// publish `ms` milliseconds from now.
    pub fn send_delay(&self, task: &str, topic: Topic, ms: u32) {
        self.send_timed(task, topic, ms, true);
    }

    /// Subscribes the named task to `topic` and schedules a periodic
    /// publish every `ms` milliseconds.
    pub fn send_period(&self, task: &str, topic: Topic, ms: u32) {
        self.send_timed(task, topic, ms, false);
    }

    fn send_timed(&self, task: &str, topic: Topic, ms: u32, one_shot: bool) {
        let now = self.now();
        let mut core = self.lock();
        let t_id = core
            .registry
            .get_index(task)
            .unwrap_or_else(|| panic!("timed send to unknown task {task}"));
        let _ = core.registry.task(t_id); // must name a task

        let e_id = core.registry.insert_event(topic);
        let e = core.registry.event_mut(e_id);
        assert!(
            (e.attrs & EventAttrs::PAYLOAD).is_empty(),
            "timed send needs a bare topic event: {topic}",
        );
        e.subs.set(usize::from(t_id));

        core.timers.schedule(topic, ms, one_shot, now);
        core.trace.record(Trace::TimerScheduled { topic });
    }

    /// Cancels every pending time event for `topic`.
    pub fn time_cancel(&self, topic: &str) {
        let mut core = self.lock();
        // The topic may never have been published, in which case it has no
        // interned key to trace.
        let key = core
            .registry
            .get_index(topic)
            .map(|i| core.registry.slot(i).key);
        core.timers.cancel(topic);
        if let Some(key) = key {
            core.trace.record(Trace::TimerCanceled { topic: key });
        }
    }

    /// One pass of the time-event driver. The kernel's own driver thread
    /// calls this every tick; it is public so tests (or an external tick
    /// source) can drive it directly.
    pub fn poll_time_events(&self) {
        let now = self.now();
        // A poisoned core means a fatal assertion already fired; the
        // driver just stops polling.
        let Ok(mut core) = self.core.lock() else { return };
        let fired = core.timers.poll(now);
        for topic in fired {
            core.trace.record(Trace::TimerFired { topic });
            core.give(None, Recipient::Subscribers, topic, now);
        }
    }

    // --- data store ---

    /// Registers a value- or stream-typed topic of `size` bytes.
    pub fn db_register(&self, topic: Topic, size: u16, attrs: EventAttrs) {
        self.lock().db_register(topic, size, attrs);
    }

    /// Overwrites the value behind `topic`. `data` must be exactly the
    /// registered size.
    pub fn db_block_write(&self, topic: &str, data: &[u8]) {
        self.db_block_write_from(None, topic, data);
    }

    pub fn db_block_write_from(
        &self,
        caller: Option<TaskId>,
        topic: &str,
        data: &[u8],
    ) {
        let now = self.now();
        self.lock().db_block_write(caller, topic, data, now);
    }

    /// Reads the value behind `topic`. `out` must be exactly the
    /// registered size.
    pub fn db_block_read(&self, topic: &str, out: &mut [u8]) {
        self.lock().db_block_read(topic, out);
    }

    /// Appends to the stream behind `topic`; overflow is fatal.
    pub fn db_stream_write(&self, topic: &str, data: &[u8]) {
        self.db_stream_write_from(None, topic, data);
    }

    pub fn db_stream_write_from(
        &self,
        caller: Option<TaskId>,
        topic: &str,
        data: &[u8],
    ) {
        let now = self.now();
        self.lock().db_stream_write(caller, topic, data, now);
    }

    /// Drains up to `out.len()` bytes from the stream behind `topic`;
    /// returns the byte count, 0 when the stream is empty.
    pub fn db_stream_read(&self, topic: &str, out: &mut [u8]) -> usize {
        self.lock().db_stream_read(topic, out)
    }

    // --- debug surface ---

    /// Counters and gauges for tests and debugging.
    pub fn stats(&self) -> Stats {
        let core = self.lock();
        Stats {
            queue_depth: core.equeue.depth(&core.eheap),
            queued_owner_union: *core
                .equeue
                .union_owners(&core.eheap)
                .words(),
            g_owner: *core.g_owner.words(),
            timer_count: core.timers.count(),
            task_count: core.registry.task_count(),
            event_heap_used: core.eheap.used(),
            db_heap_used: core.dbheap.used(),
            trace_total: core.trace.total(),
        }
    }

    /// Snapshot of the trace ring, oldest surviving entry first.
    pub fn trace(&self) -> Vec<TraceEntry<Trace>> {
        self.lock().trace.iter().copied().collect()
    }
}

/// Point-in-time snapshot of kernel gauges.
#[derive(Copy, Clone, Debug)]
pub struct Stats {
    pub queue_depth: usize,
    /// OR of owner masks actually present in the queue.
    pub queued_owner_union: [u32; abi::OWNER_WORDS],
    /// The cached union the dispatch path maintains. Must always equal
    /// `queued_owner_union`.
    pub g_owner: [u32; abi::OWNER_WORDS],
    pub timer_count: usize,
    pub task_count: usize,
    pub event_heap_used: u32,
    pub db_heap_used: u32,
    pub trace_total: u64,
}

impl Stats {
    /// The mirror invariant between the queue and the cached union.
    pub fn owner_union_consistent(&self) -> bool {
        self.queued_owner_union == self.g_owner
    }
}
