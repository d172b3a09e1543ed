//! Ordered buffer of calls waiting to be bundled.
//!
//! The queue never reorders: calls leave in enqueue order, except that an
//! authentication call may leave ahead of calls held back by the
//! [`AuthGate`].

use std::collections::VecDeque;

use crate::auth_gate::{AuthGate, GateState};
use crate::descriptor::OperationDescriptor;
use crate::protocol::{CallId, CallKind};

/// Calls removed from the queue by one [`RequestQueue::drain_for_bundle`].
#[derive(Debug, Default)]
pub struct Drained {
    /// Calls to send, in enqueue order.
    pub ready: Vec<OperationDescriptor>,
    /// Heartbeats dropped because they would precede authentication. They are
    /// never sent and never answered.
    pub elided: Vec<OperationDescriptor>,
}

/// FIFO of pending [`OperationDescriptor`]s.
#[derive(Debug, Default)]
pub struct RequestQueue {
    items: VecDeque<OperationDescriptor>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a call to the tail.
    pub fn enqueue(&mut self, descriptor: OperationDescriptor) {
        self.items.push_back(descriptor);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns `true` if a call of `kind` is waiting.
    pub fn contains_kind(&self, kind: CallKind) -> bool {
        self.items.iter().any(|d| d.kind() == kind)
    }

    /// Remove a call that has not been drained yet.
    pub fn withdraw(&mut self, id: CallId) -> Option<OperationDescriptor> {
        let pos = self.items.iter().position(|d| d.id() == id)?;
        self.items.remove(pos)
    }

    /// Remove every queued call, in enqueue order.
    pub fn drain_all(&mut self) -> Vec<OperationDescriptor> {
        self.items.drain(..).collect()
    }

    /// Remove the calls the gate lets through right now, at most `max` of them.
    ///
    /// - `Authenticated`: the longest prefix up to `max` calls, ending early
    ///   after the first authentication call (which moves the gate to
    ///   `AuthPending`). Heartbeats drained ahead of that call are elided, so
    ///   a heartbeat never precedes authentication in a bundle.
    /// - `Unauthenticated`: only the first authentication call, if any.
    ///   Draining it moves the gate to `AuthPending` and elides every queued
    ///   heartbeat.
    /// - `AuthPending`: nothing is drained; queued heartbeats are elided.
    pub fn drain_for_bundle(&mut self, gate: &mut AuthGate, max: usize) -> Drained {
        let max = max.max(1);
        match gate.state() {
            GateState::Authenticated => {
                let mut ready = Vec::new();
                let mut reauth = false;
                while ready.len() < max {
                    let Some(descriptor) = self.items.pop_front() else {
                        break;
                    };
                    reauth = descriptor.is_authenticate();
                    ready.push(descriptor);
                    if reauth {
                        gate.begin_authentication();
                        break;
                    }
                }
                if !reauth {
                    return Drained {
                        ready,
                        elided: Vec::new(),
                    };
                }
                let (elided, ready): (Vec<_>, Vec<_>) = ready
                    .into_iter()
                    .partition(OperationDescriptor::is_heartbeat);
                Drained { ready, elided }
            }
            GateState::Unauthenticated => {
                let Some(pos) = self.items.iter().position(OperationDescriptor::is_authenticate)
                else {
                    return Drained::default();
                };
                let Some(auth) = self.items.remove(pos) else {
                    return Drained::default();
                };
                gate.begin_authentication();
                Drained {
                    ready: vec![auth],
                    elided: self.remove_heartbeats(),
                }
            }
            GateState::AuthPending => Drained {
                ready: Vec::new(),
                elided: self.remove_heartbeats(),
            },
        }
    }

    fn remove_heartbeats(&mut self) -> Vec<OperationDescriptor> {
        let (heartbeats, rest): (VecDeque<_>, VecDeque<_>) =
            self.items.drain(..).partition(OperationDescriptor::is_heartbeat);
        self.items = rest;
        heartbeats.into()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::auth_gate::SessionSignal;
    use crate::descriptor::Responder;
    use crate::protocol::{Payload, ServiceCall};

    fn descriptor(id: CallId, call: ServiceCall) -> OperationDescriptor {
        OperationDescriptor::new(id, call, Responder::Discard)
    }

    fn regular(id: CallId) -> OperationDescriptor {
        descriptor(id, ServiceCall::new("playerState", "READ"))
    }

    fn auth(id: CallId) -> OperationDescriptor {
        descriptor(id, ServiceCall::authenticate(Payload::new()))
    }

    fn heartbeat(id: CallId) -> OperationDescriptor {
        descriptor(id, ServiceCall::heartbeat())
    }

    fn ids(descriptors: &[OperationDescriptor]) -> Vec<CallId> {
        descriptors.iter().map(OperationDescriptor::id).collect()
    }

    fn authenticated_gate() -> AuthGate {
        let mut gate = AuthGate::new();
        gate.apply(
            SessionSignal::AuthSucceeded { session_id: None },
            &mut RequestQueue::new(),
        );
        gate
    }

    #[test]
    fn unauthenticated_holds_regular_calls() {
        let mut queue = RequestQueue::new();
        let mut gate = AuthGate::new();
        queue.enqueue(regular(1));
        queue.enqueue(heartbeat(2));

        let drained = queue.drain_for_bundle(&mut gate, 10);
        assert!(drained.ready.is_empty());
        assert!(drained.elided.is_empty());
        assert_eq!(queue.len(), 2);
        assert_eq!(gate.state(), GateState::Unauthenticated);
    }

    #[test]
    fn auth_jumps_ahead_of_held_calls() {
        let mut queue = RequestQueue::new();
        let mut gate = AuthGate::new();
        queue.enqueue(regular(1));
        queue.enqueue(auth(2));
        queue.enqueue(regular(3));

        let drained = queue.drain_for_bundle(&mut gate, 10);
        assert_eq!(ids(&drained.ready), vec![2]);
        assert_eq!(gate.state(), GateState::AuthPending);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn heartbeat_before_auth_is_elided() {
        let mut queue = RequestQueue::new();
        let mut gate = AuthGate::new();
        queue.enqueue(heartbeat(1));
        queue.enqueue(auth(2));

        let drained = queue.drain_for_bundle(&mut gate, 10);
        assert_eq!(ids(&drained.ready), vec![2]);
        assert_eq!(ids(&drained.elided), vec![1]);
        assert!(queue.is_empty());
    }

    #[test]
    fn pending_auth_elides_late_heartbeats_and_holds_rest() {
        let mut queue = RequestQueue::new();
        let mut gate = AuthGate::new();
        gate.begin_authentication();
        queue.enqueue(regular(1));
        queue.enqueue(heartbeat(2));
        queue.enqueue(regular(3));

        let drained = queue.drain_for_bundle(&mut gate, 10);
        assert!(drained.ready.is_empty());
        assert_eq!(ids(&drained.elided), vec![2]);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn authenticated_drains_prefix_up_to_max() {
        let mut queue = RequestQueue::new();
        let mut gate = authenticated_gate();
        for id in 1..=5 {
            queue.enqueue(regular(id));
        }

        let first = queue.drain_for_bundle(&mut gate, 3);
        assert_eq!(ids(&first.ready), vec![1, 2, 3]);
        let second = queue.drain_for_bundle(&mut gate, 3);
        assert_eq!(ids(&second.ready), vec![4, 5]);
        assert!(queue.is_empty());
    }

    #[test]
    fn reauth_closes_the_bundle() {
        let mut queue = RequestQueue::new();
        let mut gate = authenticated_gate();
        queue.enqueue(regular(1));
        queue.enqueue(auth(2));
        queue.enqueue(regular(3));

        let drained = queue.drain_for_bundle(&mut gate, 10);
        assert_eq!(ids(&drained.ready), vec![1, 2]);
        assert_eq!(gate.state(), GateState::AuthPending);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn reauth_elides_heartbeats_ahead_of_it() {
        let mut queue = RequestQueue::new();
        let mut gate = authenticated_gate();
        queue.enqueue(heartbeat(1));
        queue.enqueue(regular(2));
        queue.enqueue(auth(3));
        queue.enqueue(heartbeat(4));

        let drained = queue.drain_for_bundle(&mut gate, 10);
        assert_eq!(ids(&drained.ready), vec![2, 3]);
        assert_eq!(ids(&drained.elided), vec![1]);
        assert_eq!(gate.state(), GateState::AuthPending);

        // The heartbeat behind the auth call goes on the next build.
        let next = queue.drain_for_bundle(&mut gate, 10);
        assert!(next.ready.is_empty());
        assert_eq!(ids(&next.elided), vec![4]);
    }

    #[test]
    fn heartbeat_without_reauth_is_sent() {
        let mut queue = RequestQueue::new();
        let mut gate = authenticated_gate();
        queue.enqueue(heartbeat(1));
        queue.enqueue(regular(2));

        let drained = queue.drain_for_bundle(&mut gate, 10);
        assert_eq!(ids(&drained.ready), vec![1, 2]);
        assert!(drained.elided.is_empty());
    }

    #[test]
    fn withdraw_only_affects_queued_calls() {
        let mut queue = RequestQueue::new();
        queue.enqueue(regular(1));
        queue.enqueue(regular(2));

        assert_eq!(queue.withdraw(1).map(|d| d.id()), Some(1));
        assert!(queue.withdraw(1).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn zero_max_still_makes_progress() {
        let mut queue = RequestQueue::new();
        let mut gate = authenticated_gate();
        queue.enqueue(regular(1));
        let drained = queue.drain_for_bundle(&mut gate, 0);
        assert_eq!(ids(&drained.ready), vec![1]);
    }
}
