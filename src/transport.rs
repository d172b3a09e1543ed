//! Transport abstraction for bundle round trips.
//!
//! The [`Transport`] trait moves one serialized request bundle to the backend
//! and returns the serialized response bundle. The client owns JSON encoding,
//! packet correlation and timeouts; a transport only moves text.
//!
//! # Connection Setup
//!
//! Connection setup is intentionally NOT part of this trait. HTTP endpoints,
//! WebSocket URLs and in-process fakes all take different parameters.
//! Construct a ready transport externally, then pass it to
//! `CloudCallClient::start`.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use cloudcall_client::error::CloudCallError;
//! use cloudcall_client::transport::Transport;
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn exchange(&mut self, request: String) -> Result<String, CloudCallError> {
//!         // Deliver the request bundle and return the response bundle
//!         todo!()
//!     }
//!
//!     async fn close(&mut self) -> Result<(), CloudCallError> {
//!         // Release the connection
//!         todo!()
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::CloudCallError;

/// A request/response text transport for bundle round trips.
///
/// The client never calls [`exchange`](Transport::exchange) concurrently:
/// one bundle is in flight at a time.
///
/// # Object Safety
///
/// This trait is object-safe, so `Box<dyn Transport>` works for dynamic dispatch.
/// However, `CloudCallClient::start` accepts `impl Transport` (monomorphized)
/// for the common case.
///
/// # Cancel Safety
///
/// [`exchange`](Transport::exchange) may be dropped mid-flight when the
/// client shuts down or the request timeout fires. Implementations must leave
/// the transport usable for the next exchange, or report
/// [`CloudCallError::TransportClosed`] from it.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send one JSON request bundle and return the JSON response bundle.
    ///
    /// # Errors
    ///
    /// - [`CloudCallError::TransportSend`] if the request could not be sent.
    /// - [`CloudCallError::TransportReceive`] if the response could not be read.
    /// - [`CloudCallError::TransportClosed`] if the connection is gone for good.
    ///   The client stops after this error.
    async fn exchange(&mut self, request: String) -> Result<String, CloudCallError>;

    /// Close the transport connection gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error if the graceful shutdown fails. Implementations should
    /// still release resources even if the close handshake fails.
    async fn close(&mut self) -> Result<(), CloudCallError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn exchange(&mut self, request: String) -> Result<String, CloudCallError> {
        (**self).exchange(request).await
    }

    async fn close(&mut self) -> Result<(), CloudCallError> {
        (**self).close().await
    }
}
