// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The reactor: a task whose whole event loop is one flat handler.
//!
//! On startup the handler sees a synthetic `Event_Enter`, then every event
//! the task receives, in arrival order. State lives in the actor value the
//! caller builds; the handler decides everything else.

use std::sync::Arc;
use std::thread::JoinHandle;

use abi::{Event, Priority, Topic, FOREVER};
use kern::Kernel;

use crate::sm::EVENT_ENTER;
use crate::TaskHandle;

/// Spawns a reactor task. `make_actor` runs on the task thread with its
/// handle, so the actor can keep it for sends and publishes from inside
/// the handler.
pub fn start<A, M, F>(
    kernel: &Arc<Kernel>,
    name: Topic,
    priority: Priority,
    make_actor: M,
    mut handler: F,
) -> JoinHandle<()>
where
    A: 'static,
    M: FnOnce(TaskHandle) -> A + Send + 'static,
    F: FnMut(&mut A, &Event) + Send + 'static,
{
    crate::spawn(kernel, name, priority, move |handle| {
        let mut actor = make_actor(handle.clone());
        handler(&mut actor, &EVENT_ENTER);
        loop {
            if let Some(e) = handle.wait_event(FOREVER) {
                handler(&mut actor, &e);
            }
        }
    })
}
