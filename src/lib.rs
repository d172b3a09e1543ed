//! # CloudCall Client
//!
//! Async client core for a backend-as-a-service game platform: it batches
//! service calls into bundles, gates them on authentication, and routes each
//! response back to the code that made the call.
//!
//! The client communicates with the backend using JSON request/response
//! bundles over any request/response [`Transport`].
//!
//! ## Features
//!
//! - **Bundling**: queued calls are packed into bundles of up to
//!   `max_bundle_size` calls, one bundle in flight at a time
//! - **Auth gating**: nothing but the authenticate call leaves the queue
//!   until a session exists; a failed authentication fails everything queued
//! - **Heartbeat elision**: heartbeats queued ahead of authentication are dropped
//! - **Exactly-once results**: every call resolves through callbacks or a
//!   [`CallHandle`] exactly once
//! - **WebSocket built-in**: default `transport-websocket` feature provides `WebSocketTransport`
//! - **Event-driven**: receive typed [`CommsEvent`]s via a channel
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), cloudcall_client::CloudCallError> {
//! use cloudcall_client::{CloudCallClient, CloudCallConfig, Payload, ServiceCall, WebSocketTransport};
//!
//! let transport = WebSocketTransport::connect("wss://backend.example.com/bundles").await?;
//! let (mut client, mut events) = CloudCallClient::start(transport, CloudCallConfig::new("app-123"));
//!
//! let mut credentials = Payload::new();
//! credentials.insert("externalId".into(), "player-1".into());
//! client.authenticate(credentials)?.response().await?;
//!
//! let state = client
//!     .call(ServiceCall::new("playerState", "READ"))?
//!     .response()
//!     .await?;
//! println!("player state: {state}");
//!
//! client.shutdown().await;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod auth_gate;
pub mod bundler;
pub mod client;
pub mod descriptor;
pub mod dispatcher;
pub mod error;
pub mod error_codes;
pub mod event;
pub mod protocol;
pub mod queue;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use auth_gate::{GateState, SessionEndReason, SessionState};
pub use client::{CloudCallClient, CloudCallConfig};
pub use descriptor::{CallHandle, FailureCallback, SuccessCallback, UserContext};
pub use error::{CallFailure, CloudCallError, FailureKind};
pub use error_codes::ReasonCode;
pub use event::CommsEvent;
pub use protocol::{CallId, Payload, ServiceCall};
pub use transport::Transport;

#[cfg(feature = "transport-websocket")]
pub use transports::WebSocketTransport;
