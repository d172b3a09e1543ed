//! Operation descriptors and their single-resolution responders.
//!
//! Every submitted call becomes an [`OperationDescriptor`]. The descriptor
//! owns a [`Responder`], and resolving the responder consumes it, so a call
//! can never be answered twice.

use std::any::Any;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{CallFailure, CloudCallError, Result};
use crate::protocol::{CallId, CallKind, CallOutcome, ServiceCall};

/// Opaque caller value handed back to callbacks.
pub type UserContext = Arc<dyn Any + Send + Sync>;

/// Invoked with the response data when a call succeeds.
pub type SuccessCallback = Box<dyn FnOnce(Value, Option<UserContext>) + Send>;

/// Invoked with the failure when a call fails.
pub type FailureCallback = Box<dyn FnOnce(CallFailure, Option<UserContext>) + Send>;

/// Where the outcome of a call goes.
pub enum Responder {
    /// Resolve a [`CallHandle`].
    Channel(oneshot::Sender<CallOutcome>),
    /// Invoke one of two callbacks. Either may be absent.
    Callbacks {
        on_success: Option<SuccessCallback>,
        on_failure: Option<FailureCallback>,
        context: Option<UserContext>,
    },
    /// Nobody is listening.
    Discard,
}

impl Responder {
    /// Build a callback responder.
    pub fn callbacks(
        on_success: Option<SuccessCallback>,
        on_failure: Option<FailureCallback>,
        context: Option<UserContext>,
    ) -> Self {
        Self::Callbacks {
            on_success,
            on_failure,
            context,
        }
    }

    /// Deliver the outcome. Consumes the responder.
    pub fn resolve(self, outcome: CallOutcome) {
        match self {
            Self::Channel(tx) => {
                // The handle may have been dropped; that is the caller's choice.
                let _ = tx.send(outcome);
            }
            Self::Callbacks {
                on_success,
                on_failure,
                context,
            } => match outcome {
                Ok(data) => {
                    if let Some(cb) = on_success {
                        cb(data, context);
                    }
                }
                Err(failure) => {
                    if let Some(cb) = on_failure {
                        cb(failure, context);
                    }
                }
            },
            Self::Discard => {}
        }
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Channel(_) => f.write_str("Responder::Channel"),
            Self::Callbacks {
                on_success,
                on_failure,
                context,
            } => f
                .debug_struct("Responder::Callbacks")
                .field("on_success", &on_success.is_some())
                .field("on_failure", &on_failure.is_some())
                .field("context", &context.is_some())
                .finish(),
            Self::Discard => f.write_str("Responder::Discard"),
        }
    }
}

/// One logical call waiting in the queue or riding in a bundle.
#[derive(Debug)]
pub struct OperationDescriptor {
    id: CallId,
    call: ServiceCall,
    kind: CallKind,
    responder: Responder,
}

impl OperationDescriptor {
    /// Wrap a call and its responder.
    pub fn new(id: CallId, call: ServiceCall, responder: Responder) -> Self {
        let kind = call.kind();
        Self {
            id,
            call,
            kind,
            responder,
        }
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn call(&self) -> &ServiceCall {
        &self.call
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    pub fn is_authenticate(&self) -> bool {
        self.kind == CallKind::Authenticate
    }

    pub fn is_heartbeat(&self) -> bool {
        self.kind == CallKind::Heartbeat
    }

    /// Split into the wire call and the responder.
    pub fn into_parts(self) -> (ServiceCall, Responder) {
        (self.call, self.responder)
    }

    /// Resolve this descriptor's responder.
    pub fn resolve(self, outcome: CallOutcome) {
        self.responder.resolve(outcome);
    }
}

/// Awaitable result of a call submitted with
/// [`CloudCallClient::call`](crate::client::CloudCallClient::call).
#[derive(Debug)]
#[must_use = "dropping the handle discards the call's result"]
pub struct CallHandle {
    id: CallId,
    rx: oneshot::Receiver<CallOutcome>,
}

impl CallHandle {
    pub(crate) fn new(id: CallId, rx: oneshot::Receiver<CallOutcome>) -> Self {
        Self { id, rx }
    }

    /// Client-local id of the call, usable with
    /// [`CloudCallClient::cancel`](crate::client::CloudCallClient::cancel).
    pub fn id(&self) -> CallId {
        self.id
    }

    /// Wait for the call to be answered.
    ///
    /// # Errors
    ///
    /// Returns [`CloudCallError::CallFailed`] when the call failed, or
    /// [`CloudCallError::Cancelled`] when it was withdrawn before being sent.
    pub async fn response(self) -> Result<Value> {
        match self.rx.await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(failure)) => Err(CloudCallError::CallFailed(failure)),
            Err(_) => Err(CloudCallError::Cancelled),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::error_codes::ReasonCode;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn callbacks_receive_context() {
        let seen = Arc::new(StdMutex::new(None));
        let seen_cb = Arc::clone(&seen);
        let responder = Responder::callbacks(
            Some(Box::new(move |data: Value, ctx: Option<UserContext>| {
                let tag = ctx
                    .and_then(|c| c.downcast_ref::<&'static str>().copied())
                    .unwrap();
                *seen_cb.lock().unwrap() = Some((data, tag));
            })),
            None,
            Some(Arc::new("ctx-tag") as UserContext),
        );
        responder.resolve(Ok(serde_json::json!({"n": 1})));
        let (data, tag) = seen.lock().unwrap().take().unwrap();
        assert_eq!(data, serde_json::json!({"n": 1}));
        assert_eq!(tag, "ctx-tag");
    }

    #[test]
    fn failure_goes_to_failure_callback_only() {
        let hits = Arc::new(StdMutex::new(Vec::new()));
        let on_ok = Arc::clone(&hits);
        let on_err = Arc::clone(&hits);
        let responder = Responder::callbacks(
            Some(Box::new(move |_: Value, _: Option<UserContext>| {
                on_ok.lock().unwrap().push("success")
            })),
            Some(Box::new(move |_: CallFailure, _: Option<UserContext>| {
                on_err.lock().unwrap().push("failure")
            })),
            None,
        );
        responder.resolve(Err(CallFailure::transport(
            ReasonCode::ClientNetworkError,
            "down",
        )));
        assert_eq!(*hits.lock().unwrap(), vec!["failure"]);
    }

    #[tokio::test]
    async fn handle_reports_cancel_when_responder_dropped() {
        let (tx, rx) = oneshot::channel();
        let handle = CallHandle::new(1, rx);
        drop(Responder::Channel(tx));
        assert!(matches!(
            handle.response().await,
            Err(CloudCallError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn handle_maps_failure() {
        let (tx, rx) = oneshot::channel();
        let handle = CallHandle::new(2, rx);
        Responder::Channel(tx).resolve(Err(CallFailure::operation(
            400,
            ReasonCode::InvalidRequest,
            "bad",
        )));
        match handle.response().await {
            Err(CloudCallError::CallFailed(f)) => {
                assert_eq!(f.reason_code, ReasonCode::InvalidRequest)
            }
            other => panic!("expected CallFailed, got {other:?}"),
        }
    }
}
