//! WebSocket transport implementation using `tokio-tungstenite`.
//!
//! This module provides [`WebSocketTransport`], a [`Transport`] that carries
//! each request bundle as one text frame and reads the next text frame as the
//! response bundle. Both `ws://` and `wss://` URLs are supported; TLS is
//! handled transparently via [`MaybeTlsStream`](tokio_tungstenite::MaybeTlsStream).
//!
//! # Feature gate
//!
//! This module is only available when the `transport-websocket` feature is enabled
//! (it is enabled by default).
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), cloudcall_client::CloudCallError> {
//! use cloudcall_client::{Transport, WebSocketTransport};
//!
//! let mut transport = WebSocketTransport::connect("ws://localhost:8080/bundles").await?;
//! let reply = transport
//!     .exchange(r#"{"packet_id":0,"messages":[]}"#.to_string())
//!     .await?;
//! println!("backend said: {reply}");
//!
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::error::CloudCallError;
use crate::transport::Transport;

/// Type alias for the underlying WebSocket stream.
///
/// Made public so that callers can construct a [`WebSocketTransport`] from an
/// existing stream via [`WebSocketTransport::from_stream`].
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A [`Transport`] implementation backed by a WebSocket connection.
///
/// # Construction
///
/// Use [`WebSocketTransport::connect`] to establish a new connection. For
/// custom TLS, proxies or headers, build the stream yourself and use
/// [`WebSocketTransport::from_stream`].
///
/// # Cancel Safety
///
/// If an exchange is dropped after the request frame was written, the late
/// response frame is still in the stream. The transport remembers that and
/// discards one text frame before reading the next response.
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WsStream,
    closed: bool,
    stale_responses: usize,
}

impl WebSocketTransport {
    /// Establish a new WebSocket connection to the given URL.
    ///
    /// # Errors
    ///
    /// Returns [`CloudCallError::Io`] if the URL is invalid or the connection
    /// cannot be established. When the underlying error is an I/O error its
    /// [`ErrorKind`](std::io::ErrorKind) is preserved; all other errors are
    /// mapped to [`ErrorKind::Other`](std::io::ErrorKind::Other).
    pub async fn connect(url: &str) -> Result<Self, CloudCallError> {
        tracing::debug!(url = %url, "connecting to WebSocket endpoint");

        let (stream, _response) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
            let kind = match &e {
                tokio_tungstenite::tungstenite::Error::Io(io) => io.kind(),
                _ => std::io::ErrorKind::Other,
            };
            CloudCallError::Io(std::io::Error::new(kind, e))
        })?;

        tracing::info!(url = %url, "WebSocket connection established");

        Ok(Self::from_stream(stream))
    }

    /// Create a [`WebSocketTransport`] from an already-established WebSocket stream.
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            stream,
            closed: false,
            stale_responses: 0,
        }
    }

    /// Establish a new WebSocket connection with a timeout.
    ///
    /// # Errors
    ///
    /// Returns [`CloudCallError::Timeout`] if the deadline elapses, or any
    /// error that [`connect`](Self::connect) may return.
    pub async fn connect_with_timeout(
        url: &str,
        timeout: std::time::Duration,
    ) -> Result<Self, CloudCallError> {
        tokio::time::timeout(timeout, Self::connect(url))
            .await
            .map_err(|_| CloudCallError::Timeout)?
    }

    /// Read the next text frame, skipping control and binary frames.
    async fn next_text(&mut self) -> Result<String, CloudCallError> {
        loop {
            let msg = match self.stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Err(CloudCallError::TransportReceive(e.to_string())),
                None => {
                    self.closed = true;
                    return Err(CloudCallError::TransportClosed);
                }
            };

            match msg {
                Message::Text(text) => return Ok(text.to_string()),
                Message::Close(frame) => {
                    tracing::debug!(?frame, "received WebSocket close frame");
                    self.closed = true;
                    return Err(CloudCallError::TransportClosed);
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {
                    // tungstenite answers pings on its own.
                }
                Message::Binary(_) => {
                    tracing::warn!("received unexpected binary WebSocket frame, skipping");
                }
            }
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn exchange(&mut self, request: String) -> Result<String, CloudCallError> {
        if self.closed {
            return Err(CloudCallError::TransportClosed);
        }
        while self.stale_responses > 0 {
            let stale = self.next_text().await?;
            self.stale_responses -= 1;
            tracing::debug!(len = stale.len(), "discarded late response frame");
        }

        self.stream
            .send(Message::Text(request.into()))
            .await
            .map_err(|e| CloudCallError::TransportSend(e.to_string()))?;

        // Counted until the response arrives so a dropped exchange is accounted for.
        self.stale_responses += 1;
        let response = self.next_text().await?;
        self.stale_responses -= 1;
        Ok(response)
    }

    async fn close(&mut self) -> Result<(), CloudCallError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .close(None)
            .await
            .map_err(|e| CloudCallError::TransportSend(e.to_string()))
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn websocket_transport_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<WebSocketTransport>();
    }

    #[tokio::test]
    async fn connect_fails_with_invalid_url() {
        let result = WebSocketTransport::connect("not-a-valid-url").await;
        assert!(matches!(result.unwrap_err(), CloudCallError::Io(_)));
    }

    #[tokio::test]
    async fn connect_fails_with_unreachable_host() {
        let result = WebSocketTransport::connect("ws://127.0.0.1:1").await;
        assert!(matches!(result.unwrap_err(), CloudCallError::Io(_)));
    }

    /// Start a local WebSocket server that runs `handler` on the accepted
    /// connection and returns the address to connect to.
    async fn start_mock_server<F, Fut>(handler: F) -> String
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            handler(ws).await;
        });

        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn exchange_returns_next_text_frame() {
        let url = start_mock_server(|mut ws| async move {
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let reply = format!("re:{text}");
                ws.send(Message::Text(reply.into())).await.unwrap();
            }
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        assert_eq!(transport.exchange("a".into()).await.unwrap(), "re:a");
        assert_eq!(transport.exchange("b".into()).await.unwrap(), "re:b");
    }

    #[tokio::test]
    async fn exchange_skips_binary_frames() {
        let url = start_mock_server(|mut ws| async move {
            if let Some(Ok(Message::Text(_))) = ws.next().await {
                ws.send(Message::Binary(vec![0xDE, 0xAD].into()))
                    .await
                    .unwrap();
                ws.send(Message::Text("after_binary".into())).await.unwrap();
            }
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        assert_eq!(
            transport.exchange("req".into()).await.unwrap(),
            "after_binary"
        );
    }

    #[tokio::test]
    async fn server_close_reports_transport_closed() {
        let url = start_mock_server(|mut ws| async move {
            let _ = ws.next().await;
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        let err = transport.exchange("req".into()).await.unwrap_err();
        assert!(matches!(err, CloudCallError::TransportClosed));
        // Further exchanges fail fast.
        let err = transport.exchange("again".into()).await.unwrap_err();
        assert!(matches!(err, CloudCallError::TransportClosed));
    }

    #[tokio::test]
    async fn dropped_exchange_discards_late_response() {
        let url = start_mock_server(|mut ws| async move {
            // First request is answered late, second immediately.
            if let Some(Ok(Message::Text(_))) = ws.next().await {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                ws.send(Message::Text("late".into())).await.unwrap();
            }
            if let Some(Ok(Message::Text(_))) = ws.next().await {
                ws.send(Message::Text("fresh".into())).await.unwrap();
            }
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        let first = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            transport.exchange("slow".into()),
        )
        .await;
        assert!(first.is_err(), "first exchange should time out");

        assert_eq!(transport.exchange("next".into()).await.unwrap(), "fresh");
    }

    #[tokio::test]
    async fn exchange_after_close_returns_transport_closed() {
        let url =
            start_mock_server(|mut ws| async move { while let Some(Ok(_)) = ws.next().await {} })
                .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        transport.close().await.unwrap();
        // Second close is a no-op.
        transport.close().await.unwrap();

        let err = transport.exchange("oops".to_string()).await.unwrap_err();
        assert!(matches!(err, CloudCallError::TransportClosed));
    }

    #[tokio::test]
    async fn connect_with_timeout_times_out() {
        let result = WebSocketTransport::connect_with_timeout(
            "ws://192.0.2.1:1",
            std::time::Duration::from_millis(50),
        )
        .await;
        assert!(matches!(result.unwrap_err(), CloudCallError::Timeout));
    }
}
