// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Two reactors lobbing events at each other.
//!
//! `ping` opens the rally on startup; `pong` returns everything; after a
//! fixed number of rounds `ping` reports back to `main`, which prints the
//! kernel's view of what happened.

use std::sync::mpsc;

use userlib::{reactor, Config, Event, Kernel, Priority, TaskHandle};

const ROUNDS: u32 = 5;

struct Pinger {
    handle: TaskHandle,
    rounds: u32,
    done: mpsc::Sender<u32>,
}

fn main() {
    let kernel = Kernel::new(Config::default());
    let (done_tx, done_rx) = mpsc::channel();

    reactor::start(
        &kernel,
        "pong",
        Priority(3),
        |handle| handle,
        |me: &mut TaskHandle, e: &Event| {
            if e.matches("Ping") {
                me.send("ping", "Pong");
            }
        },
    );

    reactor::start(
        &kernel,
        "ping",
        Priority(2),
        move |handle| Pinger { handle, rounds: 0, done: done_tx },
        |me: &mut Pinger, e: &Event| {
            if e.matches("Event_Enter") {
                me.handle.send("pong", "Ping");
            } else if e.matches("Pong") {
                me.rounds += 1;
                if me.rounds < ROUNDS {
                    me.handle.send("pong", "Ping");
                } else {
                    me.done.send(me.rounds).unwrap();
                }
            }
        },
    );

    let rounds = done_rx.recv().expect("the rally to finish");
    println!("completed {rounds} ping/pong rounds");

    let stats = kernel.stats();
    println!(
        "queue depth {}, event heap in use {} B, traces recorded {}",
        stats.queue_depth, stats.event_heap_used, stats.trace_total,
    );
}
