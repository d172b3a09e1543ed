#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for CloudCall client integration tests.
//!
//! Provides a scripted [`MockTransport`] that plays the backend, plus helper
//! functions for building common call responses.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use cloudcall_client::error_codes::{status, ReasonCode};
use cloudcall_client::protocol::{CallKind, CallResponse, InboundBundle, OutboundBundle};
use cloudcall_client::{CloudCallError, ServiceCall, Transport};
use serde_json::json;

/// Session token handed out by [`backend_response`].
pub const SESSION_ID: &str = "session-1";

/// Decides the reply to one request bundle.
pub type Responder = Box<dyn FnMut(&OutboundBundle) -> Result<String, CloudCallError> + Send>;

// ── MockTransport ───────────────────────────────────────────────────

/// A scripted mock transport for integration testing.
///
/// Every request bundle is parsed, recorded in `sent`, and answered by the
/// responder. Scripted failures queued with [`MockTransport::fail_next`]
/// take precedence over the responder.
pub struct MockTransport {
    responder: Responder,
    /// Errors returned by the next exchanges, in order.
    failures: VecDeque<CloudCallError>,
    /// Delay applied before every reply.
    latency: Duration,
    /// Recorded request bundles from the client.
    pub sent: Arc<StdMutex<Vec<OutboundBundle>>>,
    /// Whether `close()` has been called.
    pub closed: Arc<AtomicBool>,
}

impl MockTransport {
    /// Create a mock transport answering every call with `respond`.
    ///
    /// Returns the transport plus shared handles for inspecting sent bundles
    /// and whether close was called.
    pub fn new(
        respond: impl FnMut(&ServiceCall) -> CallResponse + Send + 'static,
    ) -> (Self, Arc<StdMutex<Vec<OutboundBundle>>>, Arc<AtomicBool>) {
        let mut respond = respond;
        Self::with_responder(Box::new(move |bundle: &OutboundBundle| {
            Ok::<_, CloudCallError>(reply_with(bundle, &mut respond))
        }))
    }

    /// Create a mock transport backed by [`backend_response`].
    pub fn backend() -> (Self, Arc<StdMutex<Vec<OutboundBundle>>>, Arc<AtomicBool>) {
        Self::new(backend_response)
    }

    /// Create a mock transport with full control over each reply.
    pub fn with_responder(
        responder: Responder,
    ) -> (Self, Arc<StdMutex<Vec<OutboundBundle>>>, Arc<AtomicBool>) {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let transport = Self {
            responder,
            failures: VecDeque::new(),
            latency: Duration::ZERO,
            sent: Arc::clone(&sent),
            closed: Arc::clone(&closed),
        };
        (transport, sent, closed)
    }

    /// Fail the next exchange with `error` instead of replying.
    pub fn fail_next(mut self, error: CloudCallError) -> Self {
        self.failures.push_back(error);
        self
    }

    /// Delay every reply by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn exchange(&mut self, request: String) -> Result<String, CloudCallError> {
        let bundle: OutboundBundle =
            serde_json::from_str(&request).expect("client sent a malformed bundle");
        self.sent.lock().unwrap().push(bundle.clone());

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(error) = self.failures.pop_front() {
            return Err(error);
        }
        (self.responder)(&bundle)
    }

    async fn close(&mut self) -> Result<(), CloudCallError> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

// ── Response helpers ────────────────────────────────────────────────

/// Serialize a response bundle answering every call in `bundle` with `respond`.
pub fn reply_with(
    bundle: &OutboundBundle,
    mut respond: impl FnMut(&ServiceCall) -> CallResponse,
) -> String {
    let reply = InboundBundle {
        packet_id: bundle.packet_id,
        responses: bundle.messages.iter().map(|call| respond(call)).collect(),
    };
    serde_json::to_string(&reply).expect("reply serialization")
}

/// Default backend behavior: authentication hands out [`SESSION_ID`],
/// every other call echoes its service and operation.
pub fn backend_response(call: &ServiceCall) -> CallResponse {
    match call.kind() {
        CallKind::Authenticate => session_response(SESSION_ID),
        _ => echo_response(call),
    }
}

/// A successful authenticate response carrying `session_id`.
pub fn session_response(session_id: &str) -> CallResponse {
    CallResponse::success(json!({ "sessionId": session_id, "profileId": "profile-1" }))
}

/// A successful response echoing the call's service and operation.
pub fn echo_response(call: &ServiceCall) -> CallResponse {
    CallResponse::success(json!({
        "service": call.service,
        "operation": call.operation,
    }))
}

/// A rejected authentication.
pub fn auth_rejected() -> CallResponse {
    CallResponse::failure(
        status::FORBIDDEN,
        ReasonCode::InvalidCredentials,
        "invalid credentials",
    )
}

/// An operation failure reporting an expired session.
pub fn session_expired() -> CallResponse {
    CallResponse::failure(
        status::FORBIDDEN,
        ReasonCode::SessionExpired,
        "session expired",
    )
}

/// Operations of every call in every recorded bundle, in send order.
pub fn sent_operations(sent: &Arc<StdMutex<Vec<OutboundBundle>>>) -> Vec<Vec<String>> {
    sent.lock()
        .unwrap()
        .iter()
        .map(|bundle| {
            bundle
                .messages
                .iter()
                .map(|call| call.operation.clone())
                .collect()
        })
        .collect()
}
