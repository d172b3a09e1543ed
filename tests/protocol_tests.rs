#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Protocol serialization tests for the CloudCall client.
//!
//! Checks the wire shape of request bundles, parsing of JSON fixtures shaped
//! like real backend output, and the SCREAMING_SNAKE_CASE reason codes.

use cloudcall_client::error::FailureKind;
use cloudcall_client::error_codes::{status, ReasonCode};
use cloudcall_client::protocol::{
    ops, CallKind, CallResponse, InboundBundle, OutboundBundle, Payload, ServiceCall,
};
use serde_json::{json, Value};

// ════════════════════════════════════════════════════════════════════
// Request bundles
// ════════════════════════════════════════════════════════════════════

#[test]
fn outbound_bundle_wire_shape() {
    let bundle = OutboundBundle {
        packet_id: 7,
        session_id: Some("sess-9".into()),
        messages: vec![
            ServiceCall::new("entity", "READ").with_param("entityType", "inventory"),
            ServiceCall::heartbeat(),
        ],
    };
    let value = serde_json::to_value(&bundle).unwrap();
    assert_eq!(
        value,
        json!({
            "packet_id": 7,
            "session_id": "sess-9",
            "messages": [
                { "service": "entity", "operation": "READ", "data": { "entityType": "inventory" } },
                { "service": "heartbeat", "operation": "READ", "data": {} }
            ]
        })
    );
}

#[test]
fn outbound_bundle_without_session_omits_the_key() {
    let bundle = OutboundBundle {
        packet_id: 0,
        session_id: None,
        messages: vec![ServiceCall::authenticate(Payload::new())],
    };
    let text = serde_json::to_string(&bundle).unwrap();
    assert!(!text.contains("session_id"), "got {text}");
}

#[test]
fn payload_keeps_insertion_order() {
    let call = ServiceCall::new("leaderboard", "POST_SCORE")
        .with_param("zeta", 1)
        .with_param("alpha", 2)
        .with_param("mid", 3);
    let text = serde_json::to_string(&call).unwrap();
    let zeta = text.find("zeta").unwrap();
    let alpha = text.find("alpha").unwrap();
    let mid = text.find("mid").unwrap();
    assert!(zeta < alpha && alpha < mid, "got {text}");
}

#[test]
fn service_call_without_data_parses() {
    let call: ServiceCall =
        serde_json::from_str(r#"{"service":"playerState","operation":"LOGOUT"}"#).unwrap();
    assert!(call.data.is_empty());
    assert_eq!(call.kind(), CallKind::Logout);
}

#[test]
fn well_known_calls_are_classified() {
    assert_eq!(
        ServiceCall::new(ops::AUTHENTICATION_SERVICE, ops::AUTHENTICATE).kind(),
        CallKind::Authenticate
    );
    assert_eq!(ServiceCall::heartbeat().kind(), CallKind::Heartbeat);
    assert_eq!(ServiceCall::logout().kind(), CallKind::Logout);
    // Same operation name on another service is an ordinary call.
    assert_eq!(
        ServiceCall::new("entity", ops::HEARTBEAT).kind(),
        CallKind::Regular
    );
}

// ════════════════════════════════════════════════════════════════════
// Response bundles
// ════════════════════════════════════════════════════════════════════

/// Response bundle shaped like real backend output.
const MIXED_RESPONSE_FIXTURE: &str = r#"{
    "packet_id": 3,
    "responses": [
        { "status": 200, "data": { "sessionId": "abc", "profileId": "p-1", "newUser": false } },
        { "status": 403, "reason_code": "SESSION_EXPIRED", "status_message": "Session expired" },
        { "status": 200 },
        { "status": 429, "reason_code": "SOME_FUTURE_CODE" }
    ]
}"#;

#[test]
fn inbound_fixture_parses_into_outcomes() {
    let inbound: InboundBundle = serde_json::from_str(MIXED_RESPONSE_FIXTURE).unwrap();
    assert_eq!(inbound.packet_id, 3);
    let outcomes: Vec<_> = inbound
        .responses
        .into_iter()
        .map(CallResponse::into_outcome)
        .collect();

    assert_eq!(outcomes[0].as_ref().unwrap()["sessionId"], "abc");

    let expired = outcomes[1].as_ref().unwrap_err();
    assert_eq!(expired.kind, FailureKind::Operation);
    assert_eq!(expired.status, status::FORBIDDEN);
    assert_eq!(expired.reason_code, ReasonCode::SessionExpired);
    assert_eq!(expired.message, "Session expired");
    assert!(expired.reason_code.invalidates_session());

    // Success without data resolves to null.
    assert_eq!(outcomes[2].as_ref().unwrap(), &Value::Null);

    // Unknown codes do not break parsing; the message falls back to the description.
    let limited = outcomes[3].as_ref().unwrap_err();
    assert_eq!(limited.reason_code, ReasonCode::Unknown);
    assert_eq!(limited.message, ReasonCode::Unknown.description());
}

#[test]
fn inbound_bundle_without_responses_is_empty() {
    let inbound: InboundBundle = serde_json::from_str(r#"{"packet_id":12}"#).unwrap();
    assert!(inbound.responses.is_empty());
}

#[test]
fn inbound_bundle_rejects_missing_packet_id() {
    let result = serde_json::from_str::<InboundBundle>(r#"{"responses":[]}"#);
    assert!(result.is_err());
}

// ════════════════════════════════════════════════════════════════════
// Reason codes
// ════════════════════════════════════════════════════════════════════

#[test]
fn reason_codes_use_screaming_snake_case() {
    let cases = [
        (ReasonCode::InvalidCredentials, "INVALID_CREDENTIALS"),
        (ReasonCode::SessionExpired, "SESSION_EXPIRED"),
        (ReasonCode::NoSession, "NO_SESSION"),
        (ReasonCode::ClientNetworkError, "CLIENT_NETWORK_ERROR"),
        (ReasonCode::MalformedResponse, "MALFORMED_RESPONSE"),
    ];
    for (code, wire) in cases {
        assert_eq!(serde_json::to_value(code).unwrap(), json!(wire));
        let parsed: ReasonCode = serde_json::from_value(json!(wire)).unwrap();
        assert_eq!(parsed, code);
    }
}

#[test]
fn failure_response_serializes_reason_and_message() {
    let response = CallResponse::failure(
        status::BAD_REQUEST,
        ReasonCode::InvalidRequest,
        "missing field",
    );
    assert_eq!(
        serde_json::to_value(&response).unwrap(),
        json!({
            "status": 400,
            "reason_code": "INVALID_REQUEST",
            "status_message": "missing field"
        })
    );
}
