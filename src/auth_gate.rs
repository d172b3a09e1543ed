//! Session tracking and authentication gating.
//!
//! The [`AuthGate`] decides whether queued calls may leave the client. It
//! moves through three states:
//!
//! ```text
//! Unauthenticated ──auth drained──▶ AuthPending ──auth ok──▶ Authenticated
//!        ▲                               │                        │
//!        └──────────auth failed──────────┘                        │
//!        └──────────────logout / session expired──────────────────┘
//! ```
//!
//! Each client owns its own gate, so independent clients never share a
//! session.

use tracing::{debug, warn};

use crate::descriptor::OperationDescriptor;
use crate::error::CallFailure;
use crate::queue::RequestQueue;

/// Authentication state of one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GateState {
    /// No session. Only authentication may be sent.
    #[default]
    Unauthenticated,
    /// An authentication call is in flight.
    AuthPending,
    /// A session exists; every call may be sent.
    Authenticated,
}

/// Session data held while authenticated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub authenticated: bool,
    pub session_id: Option<String>,
}

/// Why an established session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEndReason {
    /// The logout call succeeded.
    LoggedOut,
    /// A call failed because the backend no longer knows the session.
    Expired(CallFailure),
}

/// What a dispatched bundle tells the gate.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSignal {
    /// The authentication call succeeded.
    AuthSucceeded { session_id: Option<String> },
    /// The authentication call failed (backend rejection or transport failure).
    AuthFailed(CallFailure),
    /// The logout call succeeded.
    LoggedOut,
    /// A regular call reported an expired or missing session.
    SessionExpired(CallFailure),
}

/// State change produced by [`AuthGate::apply`].
#[derive(Debug)]
pub enum GateTransition {
    /// The session is now established.
    Authenticated { session_id: Option<String> },
    /// Authentication failed. `cascaded` holds every call that was queued,
    /// in enqueue order; each must be failed with `failure`.
    AuthenticationFailed {
        failure: CallFailure,
        cascaded: Vec<OperationDescriptor>,
    },
    /// The session ended. Queued calls wait for the next authentication.
    SessionEnded { reason: SessionEndReason },
}

/// Tracks the session and gates which calls may be bundled.
#[derive(Debug, Default)]
pub struct AuthGate {
    state: GateState,
    session: SessionState,
}

impl AuthGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == GateState::Authenticated
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.session_id.as_deref()
    }

    /// Record that an authentication call has been drained for sending.
    pub fn begin_authentication(&mut self) {
        debug!(from = ?self.state, "auth gate: authentication in flight");
        self.state = GateState::AuthPending;
    }

    /// Apply a signal from a dispatched bundle.
    ///
    /// On authentication failure every queued call is removed from `queue`
    /// and returned in the transition so the caller can fail it.
    pub fn apply(
        &mut self,
        signal: SessionSignal,
        queue: &mut RequestQueue,
    ) -> Option<GateTransition> {
        match signal {
            SessionSignal::AuthSucceeded { session_id } => {
                self.state = GateState::Authenticated;
                self.session = SessionState {
                    authenticated: true,
                    session_id: session_id.clone(),
                };
                debug!(queued = queue.len(), "auth gate: authenticated");
                Some(GateTransition::Authenticated { session_id })
            }
            SessionSignal::AuthFailed(failure) => {
                self.clear();
                let cascaded = queue.drain_all();
                warn!(
                    cascaded = cascaded.len(),
                    "auth gate: authentication failed: {failure}"
                );
                Some(GateTransition::AuthenticationFailed {
                    failure: failure.into_auth_error(),
                    cascaded,
                })
            }
            SessionSignal::LoggedOut => {
                self.clear();
                debug!("auth gate: logged out");
                Some(GateTransition::SessionEnded {
                    reason: SessionEndReason::LoggedOut,
                })
            }
            SessionSignal::SessionExpired(failure) => {
                // A re-authentication already in flight supersedes the stale session.
                if self.state != GateState::Authenticated {
                    return None;
                }
                self.clear();
                warn!("auth gate: session invalidated: {failure}");
                Some(GateTransition::SessionEnded {
                    reason: SessionEndReason::Expired(failure),
                })
            }
        }
    }

    fn clear(&mut self) {
        self.state = GateState::Unauthenticated;
        self.session = SessionState::default();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::descriptor::Responder;
    use crate::error::FailureKind;
    use crate::error_codes::{status, ReasonCode};
    use crate::protocol::ServiceCall;

    fn queued(ids: &[u64]) -> RequestQueue {
        let mut queue = RequestQueue::new();
        for id in ids {
            queue.enqueue(OperationDescriptor::new(
                *id,
                ServiceCall::new("entity", "READ"),
                Responder::Discard,
            ));
        }
        queue
    }

    #[test]
    fn starts_unauthenticated() {
        let gate = AuthGate::new();
        assert_eq!(gate.state(), GateState::Unauthenticated);
        assert!(!gate.session().authenticated);
        assert!(gate.session_id().is_none());
    }

    #[test]
    fn auth_success_stores_session() {
        let mut gate = AuthGate::new();
        let mut queue = queued(&[1, 2]);
        gate.begin_authentication();
        let transition = gate.apply(
            SessionSignal::AuthSucceeded {
                session_id: Some("sess-1".into()),
            },
            &mut queue,
        );
        assert!(matches!(
            transition,
            Some(GateTransition::Authenticated { .. })
        ));
        assert!(gate.is_authenticated());
        assert_eq!(gate.session_id(), Some("sess-1"));
        // Queued work is released, not consumed.
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn auth_failure_cascades_whole_queue_in_order() {
        let mut gate = AuthGate::new();
        let mut queue = queued(&[5, 6, 7]);
        gate.begin_authentication();
        let failure = CallFailure::operation(
            status::FORBIDDEN,
            ReasonCode::TokenDoesNotMatchUser,
            "nope",
        );
        let Some(GateTransition::AuthenticationFailed { failure, cascaded }) =
            gate.apply(SessionSignal::AuthFailed(failure), &mut queue)
        else {
            panic!("expected AuthenticationFailed");
        };
        assert_eq!(failure.kind, FailureKind::Authentication);
        let ids: Vec<u64> = cascaded.iter().map(OperationDescriptor::id).collect();
        assert_eq!(ids, vec![5, 6, 7]);
        assert!(queue.is_empty());
        assert_eq!(gate.state(), GateState::Unauthenticated);
    }

    #[test]
    fn logout_clears_session_but_keeps_queue() {
        let mut gate = AuthGate::new();
        let mut queue = queued(&[1]);
        gate.apply(
            SessionSignal::AuthSucceeded {
                session_id: Some("s".into()),
            },
            &mut queue,
        );
        let transition = gate.apply(SessionSignal::LoggedOut, &mut queue);
        assert!(matches!(
            transition,
            Some(GateTransition::SessionEnded {
                reason: SessionEndReason::LoggedOut
            })
        ));
        assert_eq!(gate.state(), GateState::Unauthenticated);
        assert!(gate.session_id().is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn expiry_ignored_while_reauthenticating() {
        let mut gate = AuthGate::new();
        let mut queue = RequestQueue::new();
        gate.begin_authentication();
        let failure = CallFailure::operation(status::FORBIDDEN, ReasonCode::SessionExpired, "old");
        assert!(gate
            .apply(SessionSignal::SessionExpired(failure), &mut queue)
            .is_none());
        assert_eq!(gate.state(), GateState::AuthPending);
    }

    #[test]
    fn expiry_ends_established_session() {
        let mut gate = AuthGate::new();
        let mut queue = RequestQueue::new();
        gate.apply(
            SessionSignal::AuthSucceeded { session_id: None },
            &mut queue,
        );
        let failure = CallFailure::operation(status::FORBIDDEN, ReasonCode::NoSession, "gone");
        let transition = gate.apply(SessionSignal::SessionExpired(failure), &mut queue);
        assert!(matches!(
            transition,
            Some(GateTransition::SessionEnded {
                reason: SessionEndReason::Expired(_)
            })
        ));
        assert!(!gate.is_authenticated());
    }
}
