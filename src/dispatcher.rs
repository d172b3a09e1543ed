//! Routes bundle outcomes back to the calls that produced them.
//!
//! Dispatch is split in two phases so callbacks never run while the client's
//! queue lock is held:
//!
//! 1. [`ResponseDispatcher::dispatch`] pairs every descriptor with its outcome
//!    and works out which [`SessionSignal`]s the bundle raised.
//! 2. [`Dispatch::deliver`] invokes the responders in call id order, which
//!    is enqueue order. Calls cascaded by the auth gate are merged in, so a
//!    call queued before the authentication fires before it.

use serde_json::Value;
use tracing::{debug, warn};

use crate::auth_gate::SessionSignal;
use crate::bundler::Bundle;
use crate::descriptor::{OperationDescriptor, Responder};
use crate::error::{CallFailure, CloudCallError, FailureKind, Result};
use crate::error_codes::ReasonCode;
use crate::protocol::{auth_keys, BundleOutcome, CallId, CallKind, CallOutcome};

/// Responders paired with their outcomes, ready to be invoked.
#[derive(Debug, Default)]
#[must_use = "a dispatch does nothing until delivered"]
pub struct Dispatch {
    deliveries: Vec<(CallId, Responder, CallOutcome)>,
    signals: Vec<SessionSignal>,
    failed: usize,
}

impl Dispatch {
    /// Session signals raised by the bundle, in bundle order.
    pub fn signals(&self) -> &[SessionSignal] {
        &self.signals
    }

    pub(crate) fn take_signals(&mut self) -> Vec<SessionSignal> {
        std::mem::take(&mut self.signals)
    }

    /// Number of pending deliveries.
    pub fn len(&self) -> usize {
        self.deliveries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }

    /// Number of pending deliveries that are failures.
    pub fn failed(&self) -> usize {
        self.failed
    }

    /// Queue failures for calls that were never sent (auth cascade, shutdown).
    ///
    /// The failures are merged with the pending deliveries by call id.
    pub fn fail_all(&mut self, descriptors: Vec<OperationDescriptor>, failure: &CallFailure) {
        if descriptors.is_empty() {
            return;
        }
        for descriptor in descriptors {
            self.push(descriptor, Err(failure.clone()));
        }
        // Stable, and both runs are already sorted.
        self.deliveries.sort_by_key(|(id, _, _)| *id);
    }

    fn push(&mut self, descriptor: OperationDescriptor, outcome: CallOutcome) {
        if outcome.is_err() {
            self.failed += 1;
        }
        let id = descriptor.id();
        let (_, responder) = descriptor.into_parts();
        self.deliveries.push((id, responder, outcome));
    }

    /// Invoke every responder exactly once, in order. Returns how many ran.
    pub fn deliver(self) -> usize {
        let count = self.deliveries.len();
        for (_, responder, outcome) in self.deliveries {
            responder.resolve(outcome);
        }
        count
    }
}

/// Matches response bundles to request bundles.
#[derive(Debug, Default)]
pub struct ResponseDispatcher {
    dispatched_bundles: u64,
}

impl ResponseDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bundles dispatched so far.
    pub fn dispatched_bundles(&self) -> u64 {
        self.dispatched_bundles
    }

    /// Pair every call in `bundle` with its outcome.
    ///
    /// A transport failure, or a response list whose length does not match
    /// the bundle, fails every call in the bundle.
    ///
    /// # Errors
    ///
    /// Returns [`CloudCallError::AlreadyDispatched`] if `bundle` was
    /// dispatched before. Nothing is resolved in that case.
    pub fn dispatch(&mut self, bundle: &mut Bundle, outcome: BundleOutcome) -> Result<Dispatch> {
        if bundle.dispatched {
            return Err(CloudCallError::AlreadyDispatched {
                packet_id: bundle.packet_id(),
            });
        }
        bundle.dispatched = true;
        self.dispatched_bundles += 1;

        let descriptors = std::mem::take(&mut bundle.descriptors);
        let outcomes: Vec<CallOutcome> = match outcome {
            BundleOutcome::Responses(responses) if responses.len() == descriptors.len() => {
                responses
            }
            BundleOutcome::Responses(responses) => {
                warn!(
                    packet_id = bundle.packet_id(),
                    expected = descriptors.len(),
                    received = responses.len(),
                    "response count does not match bundle"
                );
                let failure = CallFailure::transport(
                    ReasonCode::MalformedResponse,
                    format!(
                        "expected {} responses, received {}",
                        descriptors.len(),
                        responses.len()
                    ),
                );
                vec![Err(failure); descriptors.len()]
            }
            BundleOutcome::TransportFailure(failure) => {
                debug!(packet_id = bundle.packet_id(), "bundle failed: {failure}");
                vec![Err(failure); descriptors.len()]
            }
        };

        let mut dispatch = Dispatch::default();
        for (descriptor, outcome) in descriptors.into_iter().zip(outcomes) {
            let outcome = match (descriptor.kind(), outcome) {
                (CallKind::Authenticate, Err(failure)) => Err(failure.into_auth_error()),
                (_, outcome) => outcome,
            };
            if let Some(signal) = session_signal(descriptor.kind(), &outcome) {
                dispatch.signals.push(signal);
            }
            dispatch.push(descriptor, outcome);
        }
        Ok(dispatch)
    }
}

/// What one call's outcome means for the session.
fn session_signal(kind: CallKind, outcome: &CallOutcome) -> Option<SessionSignal> {
    match (kind, outcome) {
        (CallKind::Authenticate, Ok(data)) => Some(SessionSignal::AuthSucceeded {
            session_id: data
                .get(auth_keys::SESSION_ID)
                .and_then(Value::as_str)
                .map(String::from),
        }),
        (CallKind::Authenticate, Err(failure)) => Some(SessionSignal::AuthFailed(failure.clone())),
        (CallKind::Logout, Ok(_)) => Some(SessionSignal::LoggedOut),
        (_, Err(failure))
            if failure.kind == FailureKind::Operation
                && failure.reason_code.invalidates_session() =>
        {
            Some(SessionSignal::SessionExpired(failure.clone()))
        }
        _ => None,
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::auth_gate::{AuthGate, GateTransition};
    use crate::bundler::Bundler;
    use crate::descriptor::UserContext;
    use crate::error_codes::status;
    use crate::protocol::{Payload, ServiceCall};
    use crate::queue::RequestQueue;
    use std::sync::{Arc, Mutex as StdMutex};

    type Log = Arc<StdMutex<Vec<(CallId, &'static str)>>>;

    fn recording(id: CallId, call: ServiceCall, log: &Log) -> OperationDescriptor {
        let ok_log = Arc::clone(log);
        let err_log = Arc::clone(log);
        OperationDescriptor::new(
            id,
            call,
            Responder::callbacks(
                Some(Box::new(move |_: Value, _: Option<UserContext>| {
                    ok_log.lock().unwrap().push((id, "success"))
                })),
                Some(Box::new(move |_: CallFailure, _: Option<UserContext>| {
                    err_log.lock().unwrap().push((id, "failure"))
                })),
                None,
            ),
        )
    }

    /// Build an authenticated bundle of `n` regular calls with ids 1..=n.
    fn bundle_of(n: CallId, log: &Log) -> Bundle {
        let mut queue = RequestQueue::new();
        let mut gate = AuthGate::new();
        gate.apply(SessionSignal::AuthSucceeded { session_id: None }, &mut queue);
        for id in 1..=n {
            queue.enqueue(recording(id, ServiceCall::new("entity", "READ"), log));
        }
        Bundler::default().build_bundle(&mut queue, &mut gate)
    }

    fn op_failure() -> CallFailure {
        CallFailure::operation(status::BAD_REQUEST, ReasonCode::InvalidRequest, "bad")
    }

    #[test]
    fn correlates_by_position() {
        let log = Log::default();
        let mut bundle = bundle_of(3, &log);
        let mut dispatcher = ResponseDispatcher::new();

        let dispatch = dispatcher
            .dispatch(
                &mut bundle,
                BundleOutcome::Responses(vec![
                    Err(op_failure()),
                    Ok(Value::Null),
                    Ok(serde_json::json!({"x": 1})),
                ]),
            )
            .unwrap();
        assert_eq!(dispatch.failed(), 1);
        assert_eq!(dispatch.deliver(), 3);
        assert_eq!(
            *log.lock().unwrap(),
            vec![(1, "failure"), (2, "success"), (3, "success")]
        );
    }

    #[test]
    fn transport_failure_fails_every_call() {
        let log = Log::default();
        let mut bundle = bundle_of(2, &log);
        let mut dispatcher = ResponseDispatcher::new();

        let failure = CallFailure::transport(ReasonCode::ClientNetworkError, "unreachable");
        dispatcher
            .dispatch(&mut bundle, BundleOutcome::TransportFailure(failure))
            .unwrap()
            .deliver();
        assert_eq!(*log.lock().unwrap(), vec![(1, "failure"), (2, "failure")]);
    }

    #[test]
    fn second_dispatch_is_rejected() {
        let log = Log::default();
        let mut bundle = bundle_of(1, &log);
        let mut dispatcher = ResponseDispatcher::new();
        let outcome = BundleOutcome::Responses(vec![Ok(Value::Null)]);

        dispatcher
            .dispatch(&mut bundle, outcome.clone())
            .unwrap()
            .deliver();
        let second = dispatcher.dispatch(&mut bundle, outcome);
        assert!(matches!(
            second,
            Err(CloudCallError::AlreadyDispatched { packet_id: 0 })
        ));
        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(dispatcher.dispatched_bundles(), 1);
    }

    #[test]
    fn count_mismatch_is_treated_as_malformed() {
        let log = Log::default();
        let mut bundle = bundle_of(2, &log);
        let mut dispatcher = ResponseDispatcher::new();

        let dispatch = dispatcher
            .dispatch(&mut bundle, BundleOutcome::Responses(vec![Ok(Value::Null)]))
            .unwrap();
        assert_eq!(dispatch.failed(), 2);
        dispatch.deliver();
        assert_eq!(*log.lock().unwrap(), vec![(1, "failure"), (2, "failure")]);
    }

    #[test]
    fn auth_success_signal_carries_session_id() {
        let log = Log::default();
        let mut queue = RequestQueue::new();
        let mut gate = AuthGate::new();
        queue.enqueue(recording(
            1,
            ServiceCall::authenticate(Payload::new()),
            &log,
        ));
        let mut bundle = Bundler::default().build_bundle(&mut queue, &mut gate);

        let dispatch = ResponseDispatcher::new()
            .dispatch(
                &mut bundle,
                BundleOutcome::Responses(vec![Ok(serde_json::json!({"sessionId": "abc"}))]),
            )
            .unwrap();
        assert_eq!(
            dispatch.signals(),
            &[SessionSignal::AuthSucceeded {
                session_id: Some("abc".into())
            }]
        );
    }

    #[test]
    fn auth_failure_is_reported_as_authentication() {
        let log = Log::default();
        let mut queue = RequestQueue::new();
        let mut gate = AuthGate::new();
        queue.enqueue(recording(
            1,
            ServiceCall::authenticate(Payload::new()),
            &log,
        ));
        let mut bundle = Bundler::default().build_bundle(&mut queue, &mut gate);
        let failure = CallFailure::transport(ReasonCode::ClientTimeout, "slow");

        let dispatch = ResponseDispatcher::new()
            .dispatch(&mut bundle, BundleOutcome::TransportFailure(failure.clone()))
            .unwrap();
        assert_eq!(
            dispatch.signals(),
            &[SessionSignal::AuthFailed(failure.into_auth_error())]
        );
    }

    #[test]
    fn session_expired_failure_raises_signal() {
        let log = Log::default();
        let mut bundle = bundle_of(2, &log);
        let expired = CallFailure::operation(status::FORBIDDEN, ReasonCode::SessionExpired, "old");

        let dispatch = ResponseDispatcher::new()
            .dispatch(
                &mut bundle,
                BundleOutcome::Responses(vec![Ok(Value::Null), Err(expired.clone())]),
            )
            .unwrap();
        assert_eq!(dispatch.signals(), &[SessionSignal::SessionExpired(expired)]);
    }

    #[test]
    fn transport_failure_does_not_expire_session() {
        let log = Log::default();
        let mut bundle = bundle_of(1, &log);
        let failure = CallFailure::transport(ReasonCode::SessionExpired, "proxy said so");

        let dispatch = ResponseDispatcher::new()
            .dispatch(&mut bundle, BundleOutcome::TransportFailure(failure))
            .unwrap();
        assert!(dispatch.signals().is_empty());
    }

    #[test]
    fn fail_all_appends_later_calls_after_bundle_deliveries() {
        let log = Log::default();
        let mut bundle = bundle_of(1, &log);
        let mut dispatch = ResponseDispatcher::new()
            .dispatch(&mut bundle, BundleOutcome::Responses(vec![Ok(Value::Null)]))
            .unwrap();
        dispatch.fail_all(
            vec![recording(9, ServiceCall::new("entity", "READ"), &log)],
            &op_failure(),
        );
        assert_eq!(dispatch.len(), 2);
        dispatch.deliver();
        assert_eq!(*log.lock().unwrap(), vec![(1, "success"), (9, "failure")]);
    }

    #[test]
    fn cascaded_calls_queued_before_auth_fire_first() {
        let log = Log::default();
        let mut queue = RequestQueue::new();
        let mut gate = AuthGate::new();
        queue.enqueue(recording(1, ServiceCall::new("entity", "READ"), &log));
        queue.enqueue(recording(2, ServiceCall::new("entity", "READ"), &log));
        queue.enqueue(recording(
            3,
            ServiceCall::authenticate(Payload::new()),
            &log,
        ));
        let mut bundle = Bundler::default().build_bundle(&mut queue, &mut gate);
        let rejected =
            CallFailure::operation(status::FORBIDDEN, ReasonCode::InvalidCredentials, "no");

        let mut dispatch = ResponseDispatcher::new()
            .dispatch(&mut bundle, BundleOutcome::Responses(vec![Err(rejected)]))
            .unwrap();
        for signal in dispatch.take_signals() {
            if let Some(GateTransition::AuthenticationFailed { failure, cascaded }) =
                gate.apply(signal, &mut queue)
            {
                dispatch.fail_all(cascaded, &failure);
            }
        }
        assert_eq!(dispatch.failed(), 3);
        dispatch.deliver();
        assert_eq!(
            *log.lock().unwrap(),
            vec![(1, "failure"), (2, "failure"), (3, "failure")]
        );
    }
}
