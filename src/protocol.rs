//! Wire types exchanged with the backend.
//!
//! A request bundle carries an ordered list of [`ServiceCall`]s; the response
//! bundle carries one [`CallResponse`] per call, in the same order. Call
//! payloads are opaque JSON objects built by service wrappers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CallFailure;
use crate::error_codes::{status, ReasonCode};

// ── Type aliases ────────────────────────────────────────────────────

/// Ordered key/value payload of a call.
pub type Payload = serde_json::Map<String, Value>;

/// Identifier of one bundle round trip.
pub type PacketId = u64;

/// Client-local identifier of one call.
pub type CallId = u64;

// ── Well-known operations ───────────────────────────────────────────

/// Service and operation tags the client itself needs to recognize.
pub mod ops {
    /// Service owning authentication.
    pub const AUTHENTICATION_SERVICE: &str = "authenticationV2";
    /// Authenticate operation.
    pub const AUTHENTICATE: &str = "AUTHENTICATE";

    /// Service owning the session heartbeat.
    pub const HEARTBEAT_SERVICE: &str = "heartbeat";
    /// Heartbeat operation.
    pub const HEARTBEAT: &str = "READ";

    /// Service owning session teardown.
    pub const PLAYER_STATE_SERVICE: &str = "playerState";
    /// Logout operation.
    pub const LOGOUT: &str = "LOGOUT";
}

/// Keys the client adds to authentication payloads.
pub mod auth_keys {
    /// Application identifier.
    pub const APP_ID: &str = "appId";
    /// Client library version.
    pub const SDK_VERSION: &str = "sdkVersion";
    /// Country code override.
    pub const COUNTRY_CODE: &str = "countryCode";
    /// Language code override.
    pub const LANGUAGE_CODE: &str = "languageCode";
    /// Session token returned in a successful authentication response.
    pub const SESSION_ID: &str = "sessionId";
}

/// How the client treats a call when gating and dispatching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Establishes a session.
    Authenticate,
    /// Keeps a session alive; elided when no session exists yet.
    Heartbeat,
    /// Tears the session down.
    Logout,
    /// Any other service call.
    Regular,
}

// ── Calls ───────────────────────────────────────────────────────────

/// One logical API call: service tag, operation tag and payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCall {
    pub service: String,
    pub operation: String,
    #[serde(default)]
    pub data: Payload,
}

impl ServiceCall {
    /// Create a call with an empty payload.
    pub fn new(service: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            operation: operation.into(),
            data: Payload::new(),
        }
    }

    /// Set the payload.
    #[must_use]
    pub fn with_data(mut self, data: Payload) -> Self {
        self.data = data;
        self
    }

    /// Insert one payload entry.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// The generic authenticate call.
    pub fn authenticate(data: Payload) -> Self {
        Self::new(ops::AUTHENTICATION_SERVICE, ops::AUTHENTICATE).with_data(data)
    }

    /// The session heartbeat call.
    pub fn heartbeat() -> Self {
        Self::new(ops::HEARTBEAT_SERVICE, ops::HEARTBEAT)
    }

    /// The logout call.
    pub fn logout() -> Self {
        Self::new(ops::PLAYER_STATE_SERVICE, ops::LOGOUT)
    }

    /// Classify this call for the auth gate.
    pub fn kind(&self) -> CallKind {
        match (self.service.as_str(), self.operation.as_str()) {
            (ops::AUTHENTICATION_SERVICE, ops::AUTHENTICATE) => CallKind::Authenticate,
            (ops::HEARTBEAT_SERVICE, ops::HEARTBEAT) => CallKind::Heartbeat,
            (ops::PLAYER_STATE_SERVICE, ops::LOGOUT) => CallKind::Logout,
            _ => CallKind::Regular,
        }
    }
}

// ── Bundles ─────────────────────────────────────────────────────────

/// Request bundle sent in one round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundBundle {
    pub packet_id: PacketId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub messages: Vec<ServiceCall>,
}

/// Response bundle answering one [`OutboundBundle`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundBundle {
    pub packet_id: PacketId,
    #[serde(default)]
    pub responses: Vec<CallResponse>,
}

/// The backend's answer to one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResponse {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<ReasonCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
}

impl CallResponse {
    /// A successful response carrying `data`.
    pub fn success(data: Value) -> Self {
        Self {
            status: status::OK,
            data: Some(data),
            reason_code: None,
            status_message: None,
        }
    }

    /// A failed response.
    pub fn failure(status: u16, reason_code: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            status,
            data: None,
            reason_code: Some(reason_code),
            status_message: Some(message.into()),
        }
    }

    /// Convert into the outcome handed to the call's responder.
    pub fn into_outcome(self) -> CallOutcome {
        if status::is_success(self.status) {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            let reason_code = self.reason_code.unwrap_or(ReasonCode::Unknown);
            let message = self
                .status_message
                .unwrap_or_else(|| reason_code.description().to_string());
            Err(CallFailure::operation(self.status, reason_code, message))
        }
    }
}

/// Result of one call: the response data or a failure.
pub type CallOutcome = std::result::Result<Value, CallFailure>;

/// What came back from the transport for a whole bundle.
#[derive(Debug, Clone, PartialEq)]
pub enum BundleOutcome {
    /// One outcome per call, aligned with the bundle order.
    Responses(Vec<CallOutcome>),
    /// The bundle as a whole failed; no call got a response.
    TransportFailure(CallFailure),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    #[test]
    fn call_kind_classification() {
        assert_eq!(
            ServiceCall::authenticate(Payload::new()).kind(),
            CallKind::Authenticate
        );
        assert_eq!(ServiceCall::heartbeat().kind(), CallKind::Heartbeat);
        assert_eq!(ServiceCall::logout().kind(), CallKind::Logout);
        assert_eq!(ServiceCall::new("event", "SEND").kind(), CallKind::Regular);
        // Same operation name under a different service is not special.
        assert_eq!(
            ServiceCall::new("event", ops::HEARTBEAT).kind(),
            CallKind::Regular
        );
    }

    #[test]
    fn payload_preserves_insertion_order() {
        let call = ServiceCall::new("event", "SEND")
            .with_param("zeta", 1)
            .with_param("alpha", "two")
            .with_param("mid", true);
        let json = serde_json::to_string(&call.data).unwrap();
        assert_eq!(json, r#"{"zeta":1,"alpha":"two","mid":true}"#);
    }

    #[test]
    fn outbound_bundle_omits_missing_session() {
        let bundle = OutboundBundle {
            packet_id: 7,
            session_id: None,
            messages: vec![ServiceCall::heartbeat()],
        };
        let value = serde_json::to_value(&bundle).unwrap();
        assert!(value.get("session_id").is_none());
        assert_eq!(value["packet_id"], 7);
        assert_eq!(value["messages"][0]["service"], "heartbeat");
    }

    #[test]
    fn inbound_bundle_parses_mixed_responses() {
        let json = r#"{
            "packet_id": 3,
            "responses": [
                {"status": 200, "data": {"ok": true}},
                {"status": 403, "reason_code": "SESSION_EXPIRED", "status_message": "expired"},
                {"status": 200}
            ]
        }"#;
        let inbound: InboundBundle = serde_json::from_str(json).unwrap();
        assert_eq!(inbound.packet_id, 3);
        let outcomes: Vec<CallOutcome> = inbound
            .responses
            .into_iter()
            .map(CallResponse::into_outcome)
            .collect();
        assert_eq!(outcomes[0], Ok(serde_json::json!({"ok": true})));
        let failure = outcomes[1].clone().unwrap_err();
        assert_eq!(failure.kind, FailureKind::Operation);
        assert_eq!(failure.reason_code, ReasonCode::SessionExpired);
        assert_eq!(failure.message, "expired");
        assert_eq!(outcomes[2], Ok(Value::Null));
    }

    #[test]
    fn failure_without_reason_defaults_to_unknown() {
        let response = CallResponse {
            status: 500,
            data: None,
            reason_code: None,
            status_message: None,
        };
        let failure = response.into_outcome().unwrap_err();
        assert_eq!(failure.reason_code, ReasonCode::Unknown);
        assert_eq!(failure.message, ReasonCode::Unknown.description());
    }
}
