//! Error types for the CloudCall client.

use thiserror::Error;

use crate::error_codes::{status, ReasonCode};
use crate::protocol::PacketId;

/// Which layer a [`CallFailure`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Authentication was rejected; also used for queued calls failed because
    /// of that rejection.
    Authentication,
    /// The backend rejected this single call. Siblings are unaffected.
    Operation,
    /// The whole bundle never got a usable response.
    Transport,
}

/// Failure delivered to a call's failure callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?} failure ({status} {reason_code:?}): {message}")]
pub struct CallFailure {
    /// Which layer produced the failure.
    pub kind: FailureKind,
    /// HTTP-like status returned by the backend, or
    /// [`status::CLIENT_NETWORK_ERROR`] for client-side failures.
    pub status: u16,
    /// Structured reason code.
    pub reason_code: ReasonCode,
    /// Human-readable message.
    pub message: String,
}

impl CallFailure {
    /// A failure the backend reported for one call.
    pub fn operation(status: u16, reason_code: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Operation,
            status,
            reason_code,
            message: message.into(),
        }
    }

    /// A whole-bundle failure raised on the client side.
    pub fn transport(reason_code: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transport,
            status: status::CLIENT_NETWORK_ERROR,
            reason_code,
            message: message.into(),
        }
    }

    /// Re-tag this failure as the authentication error that cascades to queued calls.
    #[must_use]
    pub fn into_auth_error(self) -> Self {
        Self {
            kind: FailureKind::Authentication,
            ..self
        }
    }
}

/// Errors that can occur when using the CloudCall client.
#[derive(Debug, Error)]
pub enum CloudCallError {
    /// Failed to send a bundle through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a response bundle from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed unexpectedly.
    #[error("transport connection closed")]
    TransportClosed,

    /// Failed to serialize or deserialize a bundle.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The response bundle does not line up with the request bundle.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The client has been shut down and no longer accepts calls.
    #[error("client is not running")]
    NotRunning,

    /// A bundle was handed to the dispatcher a second time.
    #[error("bundle {packet_id} was already dispatched")]
    AlreadyDispatched {
        /// Packet id of the bundle.
        packet_id: PacketId,
    },

    /// The call was withdrawn before it was sent.
    #[error("call was cancelled before it was sent")]
    Cancelled,

    /// The call was sent and failed.
    #[error(transparent)]
    CallFailed(#[from] CallFailure),

    /// The transport did not answer in time.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized [`Result`] type for CloudCall client operations.
pub type Result<T> = std::result::Result<T, CloudCallError>;
