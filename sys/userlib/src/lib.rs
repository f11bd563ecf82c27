// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Application-side interface to the event kernel.
//!
//! This is intended to provide a more ergonomic interface than calling the
//! kernel directly: it spawns task threads, hands each one a [`TaskHandle`]
//! carrying its identity, and builds the two event-loop shapes applications
//! actually write on top of `wait_event` -- the flat [`reactor`] and the
//! hierarchical state machine in [`sm`].

pub mod reactor;
pub mod sm;

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub use abi::{Event, EventAttrs, Priority, TaskId, Topic, FOREVER};
pub use kern::{Config, Kernel};

/// A task's identity plus its way back to the kernel.
///
/// Wherever the device original would ask "who am I?" through the
/// scheduler, code here carries the answer explicitly: the handle is given
/// to the task's entry function and travels with it.
#[derive(Clone)]
pub struct TaskHandle {
    kernel: Arc<Kernel>,
    id: TaskId,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// Sends `topic` to the named task. The caller is exempt from its own
    /// wake, so a task may send to itself without tripping its semaphore.
    pub fn send(&self, task: &str, topic: Topic) {
        self.kernel.send_from(Some(self.id), task, topic);
    }

    pub fn send_by_id(&self, task: TaskId, topic: Topic) {
        self.kernel.send_by_id_from(Some(self.id), task, topic);
    }

    pub fn publish(&self, topic: Topic) {
        self.kernel.publish_from(Some(self.id), topic);
    }

    pub fn subscribe(&self, topic: Topic) {
        self.kernel.subscribe(self.id, topic);
    }

    pub fn unsubscribe(&self, topic: &str) {
        self.kernel.unsubscribe(self.id, topic);
    }

    /// Blocks until an event arrives, up to `timeout_ms` (`FOREVER` to
    /// wait indefinitely).
    pub fn wait_event(&self, timeout_ms: u32) -> Option<Event> {
        self.kernel.wait_event(self.id, timeout_ms)
    }

    /// Blocks until `topic` specifically arrives; everything else is
    /// filtered away for the duration.
    pub fn wait_specific_event(
        &self,
        topic: Topic,
        timeout_ms: u32,
    ) -> Option<Event> {
        self.kernel.wait_specific_event(self.id, topic, timeout_ms)
    }

    pub fn db_block_write(&self, topic: &str, data: &[u8]) {
        self.kernel.db_block_write_from(Some(self.id), topic, data);
    }

    pub fn db_block_read(&self, topic: &str, out: &mut [u8]) {
        self.kernel.db_block_read(topic, out);
    }

    pub fn db_stream_write(&self, topic: &str, data: &[u8]) {
        self.kernel.db_stream_write_from(Some(self.id), topic, data);
    }

    pub fn db_stream_read(&self, topic: &str, out: &mut [u8]) -> usize {
        self.kernel.db_stream_read(topic, out)
    }

    /// In-task delay. Plain scheduler sleep; the event queue is untouched.
    pub fn delay_ms(&self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

/// Registers a task and starts its thread. The name is claimed before the
/// thread runs, so sends by name resolve as soon as `spawn` returns.
pub fn spawn<F>(
    kernel: &Arc<Kernel>,
    name: Topic,
    priority: Priority,
    entry: F,
) -> JoinHandle<()>
where
    F: FnOnce(TaskHandle) + Send + 'static,
{
    let id = kernel.register_task(name, priority);
    let handle = TaskHandle { kernel: Arc::clone(kernel), id };
    std::thread::Builder::new()
        .name(name.into())
        .spawn(move || entry(handle))
        .expect("spawning task thread")
}
