//! Status and reason codes attached to failed calls.
//!
//! The backend answers every call in a bundle with an HTTP-like status and,
//! on failure, a [`ReasonCode`]. Reason codes serialize using
//! `SCREAMING_SNAKE_CASE` (e.g. `"SESSION_EXPIRED"`). Codes the client
//! produces on its own (network errors, shutdown) share the same enum so a
//! failure callback only ever has one type to match on.

use serde::{Deserialize, Serialize};
use std::fmt;

/// HTTP-like status codes carried by call responses.
pub mod status {
    /// The call succeeded.
    pub const OK: u16 = 200;
    /// The request was malformed or rejected by validation.
    pub const BAD_REQUEST: u16 = 400;
    /// Authentication or session failure.
    pub const FORBIDDEN: u16 = 403;
    /// The backend failed while processing the call.
    pub const INTERNAL_SERVER_ERROR: u16 = 500;
    /// Client-side failure: the call never got a response from the backend.
    pub const CLIENT_NETWORK_ERROR: u16 = 900;

    /// Returns `true` for statuses that report a successful call.
    pub fn is_success(status: u16) -> bool {
        (200..300).contains(&status)
    }
}

/// Structured reason codes for failed calls.
///
/// Unrecognized codes from a newer backend deserialize to
/// [`ReasonCode::Unknown`] instead of failing the whole bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    // Authentication errors
    AuthenticationFailed,
    InvalidCredentials,
    TokenDoesNotMatchUser,
    SessionExpired,
    NoSession,
    InvalidAppId,
    SdkVersionUnsupported,

    // Request errors
    InvalidRequest,
    UnknownOperation,
    MessageTooLarge,
    RateLimitExceeded,

    // Server errors
    InternalError,
    ServiceUnavailable,

    // Client-side errors
    ClientNetworkError,
    ClientTimeout,
    MalformedResponse,
    ClientShutdown,

    #[serde(other)]
    Unknown,
}

impl ReasonCode {
    /// Returns a human-readable description of this reason code.
    pub fn description(&self) -> &'static str {
        match self {
            // Authentication errors
            Self::AuthenticationFailed => "Authentication was rejected by the backend.",
            Self::InvalidCredentials => {
                "The supplied credentials are invalid. Check the identifier and secret."
            }
            Self::TokenDoesNotMatchUser => {
                "The supplied token does not belong to the user being authenticated."
            }
            Self::SessionExpired => {
                "The session has expired. Authenticate again before sending more calls."
            }
            Self::NoSession => "No session exists. Authenticate before sending calls.",
            Self::InvalidAppId => {
                "The application ID is not recognized. Verify your app ID is correct."
            }
            Self::SdkVersionUnsupported => {
                "This client version is no longer supported. Please upgrade."
            }

            // Request errors
            Self::InvalidRequest => {
                "The call payload is invalid or malformed. Check the request parameters."
            }
            Self::UnknownOperation => "The service or operation name is not recognized.",
            Self::MessageTooLarge => "The call payload exceeds the maximum allowed size.",
            Self::RateLimitExceeded => "Too many calls in a short period. Slow down and retry.",

            // Server errors
            Self::InternalError => "The backend encountered an internal error.",
            Self::ServiceUnavailable => "The service is temporarily unavailable.",

            // Client-side errors
            Self::ClientNetworkError => "The bundle could not be delivered to the backend.",
            Self::ClientTimeout => "The backend did not answer the bundle in time.",
            Self::MalformedResponse => "The backend response could not be matched to the bundle.",
            Self::ClientShutdown => "The client shut down before the call was sent.",

            Self::Unknown => "The backend returned an unrecognized reason code.",
        }
    }

    /// Returns `true` for codes that mean the current session is no longer valid.
    pub fn invalidates_session(&self) -> bool {
        matches!(self, Self::SessionExpired | Self::NoSession)
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}
