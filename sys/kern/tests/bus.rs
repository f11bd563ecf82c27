// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event-bus scenarios: point-to-point sends, publish fan-out, waits.
//!
//! Each test builds its own kernel, so the suite can run in parallel. A
//! "task" here is just a registered identity; whichever thread calls
//! `wait_event` with that id plays the task.

use kern::{Config, Kernel, Priority, Trace, FOREVER};
use std::sync::Arc;
use std::time::Duration;

fn kernel() -> Arc<Kernel> {
    Kernel::new(Config::default())
}

#[test]
fn point_to_point_send() {
    let k = kernel();
    let _a = k.register_task("A", Priority(2));
    let b = k.register_task("B", Priority(3));
    k.subscribe(b, "Unused");

    k.send("B", "Tick");

    let e = k.wait_event(b, 1000).expect("B should receive the send");
    assert_eq!(e.topic, "Tick");
    assert_eq!(e.size, 0);
    assert!(e.matches("Tick"));

    let stats = k.stats();
    assert_eq!(stats.queue_depth, 0);
    assert_eq!(stats.g_owner, [0; kern::OWNER_WORDS]);
    assert_eq!(stats.event_heap_used, 0);
    assert!(stats.owner_union_consistent());
}

#[test]
fn publish_reaches_every_subscriber() {
    let k = kernel();
    let a = k.register_task("A", Priority(1));
    let b = k.register_task("B", Priority(2));
    let c = k.register_task("C", Priority(3));
    k.subscribe(a, "X");
    k.subscribe(b, "X");
    // C does not subscribe.

    k.publish("X");

    assert_eq!(k.wait_event(a, 1000).unwrap().topic, "X");
    assert!(k.stats().owner_union_consistent());
    assert_eq!(k.wait_event(b, 1000).unwrap().topic, "X");
    assert!(k.wait_event(c, 20).is_none());

    let stats = k.stats();
    assert_eq!(stats.queue_depth, 0);
    assert!(stats.owner_union_consistent());
}

#[test]
fn publish_without_subscribers_is_a_no_op() {
    let k = kernel();
    let _ = k.register_task("A", Priority(1));
    k.publish("Nobody-Home");
    let stats = k.stats();
    assert_eq!(stats.queue_depth, 0);
    assert_eq!(stats.event_heap_used, 0);
}

#[test]
fn send_by_id_matches_send_by_name() {
    let k = kernel();
    let b = k.register_task("B", Priority(3));
    k.send_by_id(b, "Ping");
    let e = k.wait_event(b, 1000).unwrap();
    assert_eq!(e.topic, "Ping");
}

#[test]
fn fifo_order_within_bare_topics() {
    let k = kernel();
    let b = k.register_task("B", Priority(3));
    k.send("B", "First");
    k.send("B", "Second");
    k.send("B", "Third");

    assert_eq!(k.wait_event(b, 1000).unwrap().topic, "First");
    assert_eq!(k.wait_event(b, 1000).unwrap().topic, "Second");
    assert_eq!(k.wait_event(b, 1000).unwrap().topic, "Third");
}

#[test]
fn wait_times_out_cleanly() {
    let k = kernel();
    let b = k.register_task("B", Priority(3));
    let t0 = std::time::Instant::now();
    assert!(k.wait_event(b, 30).is_none());
    assert!(t0.elapsed() >= Duration::from_millis(30));
    // Nothing was consumed or created.
    assert_eq!(k.stats().queue_depth, 0);
}

#[test]
fn receive_gate_drops_sends_silently() {
    let k = kernel();
    let b = k.register_task("B", Priority(3));

    k.set_event_recv_disabled(b, true);
    k.send("B", "Tick");
    assert_eq!(k.stats().queue_depth, 0);
    assert!(k.wait_event(b, 20).is_none());

    k.set_event_recv_disabled(b, false);
    k.send("B", "Tick");
    assert_eq!(k.wait_event(b, 1000).unwrap().topic, "Tick");
}

#[test]
fn receive_gate_filters_publish_targets() {
    let k = kernel();
    let a = k.register_task("A", Priority(1));
    let b = k.register_task("B", Priority(2));
    k.subscribe(a, "X");
    k.subscribe(b, "X");

    k.set_event_recv_disabled(a, true);
    k.publish("X");

    // Exactly |subscribers minus disabled| deliveries.
    assert_eq!(k.wait_event(b, 1000).unwrap().topic, "X");
    assert!(k.wait_event(a, 20).is_none());
    assert_eq!(k.stats().queue_depth, 0);
}

#[test]
fn unsubscribe_stops_delivery() {
    let k = kernel();
    let a = k.register_task("A", Priority(1));
    let b = k.register_task("B", Priority(2));
    k.subscribe(a, "X");
    k.subscribe(b, "X");
    k.unsubscribe(a, "X");

    k.publish("X");
    assert_eq!(k.wait_event(b, 1000).unwrap().topic, "X");
    assert!(k.wait_event(a, 20).is_none());
}

#[test]
fn self_send_does_not_self_wake() {
    let k = kernel();
    let a = k.register_task("A", Priority(1));

    // A sends to itself: the record is queued but A's semaphore is not
    // released, so an immediate wait times out.
    k.send_from(Some(a), "A", "Note");
    assert_eq!(k.stats().queue_depth, 1);
    assert!(k.stats().owner_union_consistent());
    assert!(k.wait_event(a, 20).is_none());

    // Any later wake lets A drain its queue in order.
    k.send("A", "Nudge");
    assert_eq!(k.wait_event(a, 1000).unwrap().topic, "Note");
    assert_eq!(k.wait_event(a, 1000).unwrap().topic, "Nudge");
}

#[test]
fn specific_wait_filters_other_topics() {
    let k = kernel();
    let b = k.register_task("B", Priority(2));

    let kb = Arc::clone(&k);
    let waiter = std::thread::spawn(move || {
        kb.wait_specific_event(b, "Want", 2000)
    });

    // Let the waiter arm its filter before producing.
    std::thread::sleep(Duration::from_millis(200));
    k.send("B", "Noise");
    k.send("B", "Want");

    let got = waiter.join().unwrap().expect("the wanted topic");
    assert_eq!(got.topic, "Want");
    // The filtered topic never reached B's queue.
    assert_eq!(k.stats().queue_depth, 0);
}

#[test]
fn specific_wait_times_out() {
    let k = kernel();
    let b = k.register_task("B", Priority(2));
    assert!(k.wait_specific_event(b, "Never", 30).is_none());
}

#[test]
fn trace_records_the_dispatch_path() {
    let k = kernel();
    let b = k.register_task("B", Priority(3));
    k.send("B", "Tick");
    k.wait_event(b, 1000).unwrap();

    let trace: Vec<Trace> = k.trace().iter().map(|e| e.payload).collect();
    assert!(trace.contains(&Trace::TaskRegistered { task: b }));
    assert!(trace.iter().any(|t| matches!(t, Trace::Queued { .. })));
    assert!(trace
        .iter()
        .any(|t| matches!(t, Trace::Delivered { task, .. } if *task == b)));
}

#[test]
fn waiter_blocks_until_producer_arrives() {
    let k = kernel();
    let b = k.register_task("B", Priority(2));

    let kb = Arc::clone(&k);
    let waiter =
        std::thread::spawn(move || kb.wait_event(b, FOREVER).unwrap());

    std::thread::sleep(Duration::from_millis(50));
    k.send("B", "Late");
    assert_eq!(waiter.join().unwrap().topic, "Late");
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        // One publish produces exactly |subscribers \ disabled| deliveries
        // across all tasks, and the queue drains back to empty.
        #[test]
        fn publish_fanout_counts(
            tasks in prop::collection::vec(any::<(bool, bool)>(), 1..8)
        ) {
            let k = kernel();
            let ids: Vec<_> = tasks
                .iter()
                .enumerate()
                .map(|(i, &(subscribed, disabled))| {
                    let name: &'static str =
                        Box::leak(format!("task-{i}").into_boxed_str());
                    let id = k.register_task(name, Priority(i as u8));
                    if subscribed {
                        k.subscribe(id, "X");
                    }
                    k.set_event_recv_disabled(id, disabled);
                    id
                })
                .collect();

            k.publish("X");
            prop_assert!(k.stats().owner_union_consistent());

            let mut delivered = 0;
            for &id in &ids {
                while k.wait_event(id, 0).is_some() {
                    delivered += 1;
                }
            }
            let expected = tasks
                .iter()
                .filter(|&&(subscribed, disabled)| subscribed && !disabled)
                .count();
            prop_assert_eq!(delivered, expected);

            let stats = k.stats();
            prop_assert_eq!(stats.queue_depth, 0);
            prop_assert!(stats.owner_union_consistent());
        }
    }
}

#[test]
#[should_panic(expected = "unknown task")]
fn send_to_unknown_task_is_fatal() {
    let k = kernel();
    k.send("Ghost", "Tick");
}

#[test]
#[should_panic(expected = "already has a subscriber")]
fn second_stream_subscriber_is_fatal() {
    let k = kernel();
    let a = k.register_task("A", Priority(1));
    let b = k.register_task("B", Priority(2));
    k.db_register("S", 16, kern::EventAttrs::STREAM);
    k.subscribe(a, "S");
    k.subscribe(b, "S");
}
