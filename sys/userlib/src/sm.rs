// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hierarchical state machines.
//!
//! A state is a plain function from `(actor, event)` to a [`Ret`]. The
//! contract, which user handlers must follow exactly:
//!
//! - An event the state handles: return [`Ret::Handled`] (or
//!   [`Ret::Tran`] to move to a new state).
//! - Anything it does not handle -- including the probe event
//!   `Event_Null` -- falls through to `Ret::Super(parent)`, naming the
//!   superstate. This is how the engine discovers the state tree: it asks.
//! - [`top`] is the root of every tree and answers `Ret::Null`.
//!
//! Transitions exit from the current state up to the lowest common
//! ancestor of source and target, then enter down to the target, then
//! drill into the target's own initial transitions (`Event_Init`) until a
//! state declines to go deeper. Nesting is bounded by
//! `MAX_HSM_NEST_DEPTH`; state identity is by function address.

use std::thread::JoinHandle;

use abi::{Event, Priority, Topic, FOREVER, MAX_HSM_NEST_DEPTH};
use kern::Kernel;

use crate::TaskHandle;

/// Probe event: "name your superstate".
pub const EVENT_NULL: Event = Event { topic: "Event_Null", id: 0, size: 0 };
/// Delivered on the way into a state.
pub const EVENT_ENTER: Event = Event { topic: "Event_Enter", id: 0, size: 0 };
/// Delivered on the way out of a state.
pub const EVENT_EXIT: Event = Event { topic: "Event_Exit", id: 0, size: 0 };
/// Asks a freshly entered state for its initial substate transition.
pub const EVENT_INIT: Event = Event { topic: "Event_Init", id: 0, size: 0 };

/// What a state handler may answer.
pub enum Ret<A> {
    /// Event consumed; dispatch stops here.
    Handled,
    /// Not mine; my superstate is the carried one.
    Super(State<A>),
    /// Transition to the carried target state.
    Tran(State<A>),
    /// Only the sentinel [`top`] answers this.
    Null,
}

/// A state handler.
pub type State<A> = fn(&mut A, &Event) -> Ret<A>;

/// The root superstate; every chain of `Ret::Super` ends here.
pub fn top<A>(_actor: &mut A, _e: &Event) -> Ret<A> {
    Ret::Null
}

/// Function-address identity for states.
fn same<A>(a: State<A>, b: State<A>) -> bool {
    a as usize == b as usize
}

/// A running hierarchical state machine: the actor plus its current leaf
/// state.
pub struct Hsm<A> {
    state: State<A>,
    actor: A,
}

impl<A> Hsm<A> {
    /// Runs the machine's initial transition: the `initial` handler must
    /// answer the probe with `Ret::Tran`, and entry then drills down
    /// through `Event_Init` until the tree settles.
    pub fn start(actor: A, initial: State<A>) -> Self {
        let mut hsm = Self { state: initial, actor };
        hsm.enter();
        hsm
    }

    pub fn actor(&self) -> &A {
        &self.actor
    }

    pub fn actor_mut(&mut self) -> &mut A {
        &mut self.actor
    }

    /// True if `s` is the current leaf state.
    pub fn is_in(&self, s: State<A>) -> bool {
        same(self.state, s)
    }

    fn trig(&mut self, s: State<A>, e: &Event) -> Ret<A> {
        s(&mut self.actor, e)
    }

    /// The superstate of `s`, or `None` at the root.
    fn try_parent(&mut self, s: State<A>) -> Option<State<A>> {
        match self.trig(s, &EVENT_NULL) {
            Ret::Super(p) => Some(p),
            Ret::Null => None,
            _ => panic!("state must answer the probe with its superstate"),
        }
    }

    fn parent_of(&mut self, s: State<A>) -> State<A> {
        self.try_parent(s)
            .unwrap_or_else(|| panic!("probed above the root state"))
    }

    /// Exits `s` and reports its superstate, whether or not the handler
    /// consumed the exit event.
    fn exit_and_parent(&mut self, s: State<A>) -> State<A> {
        match self.trig(s, &EVENT_EXIT) {
            Ret::Handled => self.parent_of(s),
            Ret::Super(p) => p,
            _ => panic!("exit handler may not transition"),
        }
    }

    fn exit_state(&mut self, s: State<A>) {
        let _ = self.exit_and_parent(s);
    }

    /// Initial entry: take the mandated first transition, then enter and
    /// drill down.
    fn enter(&mut self) {
        let target = match self.trig(self.state, &EVENT_NULL) {
            Ret::Tran(t) => t,
            _ => panic!("the initial handler must transition"),
        };
        self.state = target;

        // Entering the target may cascade through nested initial
        // transitions; each round enters one level deeper.
        let mut outermost: State<A> = top;
        loop {
            let mut path = [self.state; MAX_HSM_NEST_DEPTH];
            let mut ip = 0;
            let mut p = self.parent_of(self.state);
            while !same(p, outermost) {
                ip += 1;
                assert!(ip < MAX_HSM_NEST_DEPTH, "state nesting too deep");
                path[ip] = p;
                p = self.parent_of(p);
            }
            for i in (0..=ip).rev() {
                self.trig(path[i], &EVENT_ENTER);
            }

            outermost = path[0];
            match self.trig(outermost, &EVENT_INIT) {
                Ret::Tran(sub) => self.state = sub,
                _ => break,
            }
        }
        self.state = outermost;
    }

    /// Delivers one event.
    pub fn dispatch(&mut self, e: &Event) {
        let current = self.state;

        // Climb the super-chain until some state takes the event.
        let mut source = current;
        let outcome = loop {
            match self.trig(source, e) {
                Ret::Super(p) => source = p,
                other => break other,
            }
        };
        let target = match outcome {
            Ret::Tran(t) => t,
            // Handled somewhere up the chain, or ignored at top.
            Ret::Handled | Ret::Null => {
                self.state = current;
                return;
            }
            Ret::Super(_) => unreachable!("the climb loop only breaks on non-Super outcomes"),
        };

        // Exit from the current leaf up to the state that owns the
        // transition.
        let mut t = current;
        while !same(t, source) {
            t = self.exit_and_parent(t);
        }

        let mut path = [target; MAX_HSM_NEST_DEPTH];
        path[1] = current;
        path[2] = source;
        let ip = self.transition_path(&mut path);
        for i in (0..=ip).rev() {
            self.trig(path[i as usize], &EVENT_ENTER);
        }

        // Drill into the target's initial substates.
        let mut t = path[0];
        while let Ret::Tran(sub) = self.trig(t, &EVENT_INIT) {
            let mut path = [sub; MAX_HSM_NEST_DEPTH];
            let mut ip = 0;
            let mut p = self.parent_of(sub);
            while !same(p, t) {
                ip += 1;
                assert!(ip < MAX_HSM_NEST_DEPTH, "state nesting too deep");
                path[ip] = p;
                p = self.parent_of(p);
            }
            for i in (0..=ip).rev() {
                self.trig(path[i], &EVENT_ENTER);
            }
            t = sub;
        }
        self.state = t;
    }

    /// The exit/entry bookkeeping of a transition whose source and target
    /// are `path[2]` and `path[0]`. Exits everything between source and
    /// the lowest common ancestor; fills `path` with the states to enter
    /// and returns the highest index to enter from (`-1` for none).
    ///
    /// The cases, cheapest first: (a) self-transition, (b) target is a
    /// child of source, (c) siblings, (d) target is the parent of source,
    /// (e) target's ancestor chain contains the source, (f) the source's
    /// parent appears in target's ancestor chain, (g) the general cross
    /// search, exiting source-side levels until an ancestor of the target
    /// turns up.
    fn transition_path(
        &mut self,
        path: &mut [State<A>; MAX_HSM_NEST_DEPTH],
    ) -> i32 {
        let target = path[0];
        let source = path[2];

        // (a) Transition to self: exactly one exit, one enter.
        if same(source, target) {
            self.exit_state(source);
            return 0;
        }

        let target_parent = self.parent_of(target);
        // (b) Entering a direct child.
        if same(source, target_parent) {
            return 0;
        }

        let source_parent = self.parent_of(source);
        // (c) Siblings.
        if same(source_parent, target_parent) {
            self.exit_state(source);
            return 0;
        }
        // (d) Leaving into the parent: exit only.
        if same(source_parent, target) {
            self.exit_state(source);
            return -1;
        }

        // (e) Walk the target's ancestors, recording the entry path and
        // watching for the source along the way.
        let mut ip: i32 = 1;
        path[1] = target_parent;
        let mut found_source = false;
        let mut probe = self.try_parent(target_parent);
        while let Some(ancestor) = probe {
            ip += 1;
            assert!(
                (ip as usize) < MAX_HSM_NEST_DEPTH,
                "state nesting too deep",
            );
            path[ip as usize] = ancestor;
            if same(ancestor, source) {
                // The source is an ancestor of the target: enter below it.
                found_source = true;
                ip -= 1;
                break;
            }
            probe = self.try_parent(ancestor);
        }
        if found_source {
            return ip;
        }

        self.exit_state(source);

        // (f) Perhaps the source's parent is already on the recorded
        // chain.
        for iq in (0..=ip).rev() {
            if same(source_parent, path[iq as usize]) {
                return iq - 1;
            }
        }

        // (g) General case: climb and exit the source side one level at a
        // time until a recorded ancestor of the target appears.
        let mut t = source_parent;
        loop {
            t = self.exit_and_parent(t);
            for iq in (0..=ip).rev() {
                if same(t, path[iq as usize]) {
                    return iq - 1;
                }
            }
        }
    }
}

/// Spawns a state-machine task: builds the actor on the task thread, runs
/// the initial transition, then dispatches every received event.
pub fn start<A, M>(
    kernel: &std::sync::Arc<Kernel>,
    name: Topic,
    priority: Priority,
    make_actor: M,
    initial: State<A>,
) -> JoinHandle<()>
where
    A: 'static,
    M: FnOnce(TaskHandle) -> A + Send + 'static,
{
    crate::spawn(kernel, name, priority, move |handle| {
        let actor = make_actor(handle.clone());
        let mut hsm = Hsm::start(actor, initial);
        loop {
            if let Some(e) = handle.wait_event(FOREVER) {
                hsm.dispatch(&e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test actor: a log of every enter/exit, written by the handlers.
    #[derive(Default)]
    struct Log {
        seen: Vec<String>,
    }

    impl Log {
        fn note(&mut self, what: &str) {
            self.seen.push(what.to_string());
        }
    }

    fn user_event(topic: abi::Topic) -> Event {
        Event { topic, id: 0, size: 0 }
    }

    // The tree from the classic two-branch example:
    //
    //   top ── s1 ── s11
    //       └─ s2 ── s21
    //
    // The initial transition lands on s11; "go" transitions s11 -> s21.

    fn init(_a: &mut Log, _e: &Event) -> Ret<Log> {
        Ret::Tran(s11)
    }

    fn s1(a: &mut Log, e: &Event) -> Ret<Log> {
        match e.topic {
            "Event_Enter" => {
                a.note("enter S1");
                Ret::Handled
            }
            "Event_Exit" => {
                a.note("exit S1");
                Ret::Handled
            }
            _ => Ret::Super(top),
        }
    }

    fn s11(a: &mut Log, e: &Event) -> Ret<Log> {
        match e.topic {
            "Event_Enter" => {
                a.note("enter S11");
                Ret::Handled
            }
            "Event_Exit" => {
                a.note("exit S11");
                Ret::Handled
            }
            "go" => Ret::Tran(s21),
            "again" => Ret::Tran(s11),
            _ => Ret::Super(s1),
        }
    }

    fn s2(a: &mut Log, e: &Event) -> Ret<Log> {
        match e.topic {
            "Event_Enter" => {
                a.note("enter S2");
                Ret::Handled
            }
            "Event_Exit" => {
                a.note("exit S2");
                Ret::Handled
            }
            "reset" => Ret::Tran(s11),
            _ => Ret::Super(top),
        }
    }

    fn s21(a: &mut Log, e: &Event) -> Ret<Log> {
        match e.topic {
            "Event_Enter" => {
                a.note("enter S21");
                Ret::Handled
            }
            "Event_Exit" => {
                a.note("exit S21");
                Ret::Handled
            }
            _ => Ret::Super(s2),
        }
    }

    #[test]
    fn startup_enters_the_initial_chain() {
        let hsm = Hsm::start(Log::default(), init);
        assert_eq!(hsm.actor().seen, ["enter S1", "enter S11"]);
        assert!(hsm.is_in(s11));
    }

    #[test]
    fn cross_branch_transition_walks_the_lca() {
        let mut hsm = Hsm::start(Log::default(), init);
        hsm.actor_mut().seen.clear();

        hsm.dispatch(&user_event("go"));
        assert_eq!(
            hsm.actor().seen,
            ["exit S11", "exit S1", "enter S2", "enter S21"],
        );
        assert!(hsm.is_in(s21));
    }

    #[test]
    fn self_transition_is_one_exit_one_enter() {
        let mut hsm = Hsm::start(Log::default(), init);
        hsm.actor_mut().seen.clear();

        hsm.dispatch(&user_event("again"));
        assert_eq!(hsm.actor().seen, ["exit S11", "enter S11"]);
        assert!(hsm.is_in(s11));
    }

    #[test]
    fn ancestor_handles_with_transition_to_child() {
        let mut hsm = Hsm::start(Log::default(), init);
        hsm.dispatch(&user_event("go"));
        hsm.actor_mut().seen.clear();

        // "reset" is unknown to s21; s2 takes it and transitions into the
        // other branch.
        hsm.dispatch(&user_event("reset"));
        assert_eq!(
            hsm.actor().seen,
            ["exit S21", "exit S2", "enter S1", "enter S11"],
        );
        assert!(hsm.is_in(s11));
    }

    #[test]
    fn unhandled_events_fall_off_the_top_quietly() {
        let mut hsm = Hsm::start(Log::default(), init);
        hsm.actor_mut().seen.clear();

        hsm.dispatch(&user_event("nobody-handles-this"));
        assert!(hsm.actor().seen.is_empty());
        assert!(hsm.is_in(s11));
    }

    mod deeper {
        use super::*;

        // A three-level branch with an initial drilldown:
        //
        //   top ── d1 ── d11 ── d111
        //       └─ flat
        //
        // Entering d1 (via Event_Init) drills to d11, then d111.

        fn dinit(_a: &mut Log, _e: &Event) -> Ret<Log> {
            Ret::Tran(d1)
        }

        fn d1(a: &mut Log, e: &Event) -> Ret<Log> {
            match e.topic {
                "Event_Enter" => {
                    a.note("enter D1");
                    Ret::Handled
                }
                "Event_Exit" => {
                    a.note("exit D1");
                    Ret::Handled
                }
                "Event_Init" => Ret::Tran(d11),
                "jump" => Ret::Tran(flat),
                _ => Ret::Super(top),
            }
        }

        fn d11(a: &mut Log, e: &Event) -> Ret<Log> {
            match e.topic {
                "Event_Enter" => {
                    a.note("enter D11");
                    Ret::Handled
                }
                "Event_Exit" => {
                    a.note("exit D11");
                    Ret::Handled
                }
                "Event_Init" => Ret::Tran(d111),
                _ => Ret::Super(d1),
            }
        }

        fn d111(a: &mut Log, e: &Event) -> Ret<Log> {
            match e.topic {
                "Event_Enter" => {
                    a.note("enter D111");
                    Ret::Handled
                }
                "Event_Exit" => {
                    a.note("exit D111");
                    Ret::Handled
                }
                "out" => Ret::Tran(flat),
                "up" => Ret::Tran(d1),
                _ => Ret::Super(d11),
            }
        }

        fn flat(a: &mut Log, e: &Event) -> Ret<Log> {
            match e.topic {
                "Event_Enter" => {
                    a.note("enter FLAT");
                    Ret::Handled
                }
                "Event_Exit" => {
                    a.note("exit FLAT");
                    Ret::Handled
                }
                "dive" => Ret::Tran(d111),
                _ => Ret::Super(top),
            }
        }

        #[test]
        fn init_drilldown_descends_level_by_level() {
            let hsm = Hsm::start(Log::default(), dinit);
            assert_eq!(
                hsm.actor().seen,
                ["enter D1", "enter D11", "enter D111"],
            );
            assert!(hsm.is_in(d111));
        }

        #[test]
        fn deep_exit_counts_match_the_depth_delta() {
            let mut hsm = Hsm::start(Log::default(), dinit);
            hsm.actor_mut().seen.clear();

            // d111 is three levels down; flat is one. Three exits, one
            // enter.
            hsm.dispatch(&user_event("out"));
            assert_eq!(
                hsm.actor().seen,
                ["exit D111", "exit D11", "exit D1", "enter FLAT"],
            );
            assert!(hsm.is_in(flat));
        }

        #[test]
        fn deep_entry_counts_match_the_depth_delta() {
            let mut hsm = Hsm::start(Log::default(), dinit);
            hsm.dispatch(&user_event("out"));
            hsm.actor_mut().seen.clear();

            hsm.dispatch(&user_event("dive"));
            assert_eq!(
                hsm.actor().seen,
                ["exit FLAT", "enter D1", "enter D11", "enter D111"],
            );
            assert!(hsm.is_in(d111));
        }

        #[test]
        fn transition_to_own_ancestor_exits_to_it_then_drills() {
            let mut hsm = Hsm::start(Log::default(), dinit);
            hsm.actor_mut().seen.clear();

            // d111 -> d1: exit two levels, then d1's initial transition
            // drills right back down.
            hsm.dispatch(&user_event("up"));
            assert_eq!(
                hsm.actor().seen,
                ["exit D111", "exit D11", "enter D11", "enter D111"],
            );
            assert!(hsm.is_in(d111));
        }

        #[test]
        fn ancestor_of_leaf_owns_the_transition() {
            let mut hsm = Hsm::start(Log::default(), dinit);
            hsm.actor_mut().seen.clear();

            // "jump" is handled by d1, two levels above the leaf.
            hsm.dispatch(&user_event("jump"));
            assert_eq!(
                hsm.actor().seen,
                ["exit D111", "exit D11", "exit D1", "enter FLAT"],
            );
            assert!(hsm.is_in(flat));
        }
    }
}
