//! Lifecycle events emitted by the comms loop.
//!
//! Events are informational: per-call results always travel through the
//! call's own responder. Use them to observe session changes, heartbeat
//! elision and bundle traffic.

use crate::auth_gate::SessionEndReason;
use crate::error::CallFailure;
use crate::protocol::PacketId;

/// An event observed by the comms loop.
#[derive(Debug, Clone, PartialEq)]
pub enum CommsEvent {
    /// Synthetic event emitted once when the comms loop starts.
    Started,

    /// An authentication call succeeded.
    Authenticated {
        /// Session token returned by the backend, if any.
        session_id: Option<String>,
    },

    /// An authentication call failed. `cascaded` queued calls were failed
    /// with the same error.
    AuthenticationFailed { failure: CallFailure, cascaded: usize },

    /// An established session ended.
    SessionInvalidated { reason: SessionEndReason },

    /// Heartbeats were dropped because authentication had not completed.
    HeartbeatElided { count: usize },

    /// A bundle round trip finished and its calls were answered.
    BundleCompleted {
        packet_id: PacketId,
        calls: usize,
        failed: usize,
    },

    /// A bundle never got a usable response; every call in it failed.
    TransportFailed {
        packet_id: PacketId,
        failure: CallFailure,
    },

    /// The comms loop stopped. Always the last event on the channel.
    Stopped {
        /// Human-readable reason, or `None` when the transport closed cleanly.
        reason: Option<String>,
    },
}
