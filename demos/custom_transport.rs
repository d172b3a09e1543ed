//! # Custom Transport Example
//!
//! Shows how to implement the [`Transport`] trait with a simple in-process
//! loopback channel backed by a fake backend task. This is useful for:
//!
//! - **Testing**: unit-test your game logic without a real backend
//! - **Custom backends**: adapt any I/O layer (HTTP, QUIC, an embedded server)
//!
//! ## Running
//!
//! ```sh
//! cargo run --example custom_transport
//! ```

use async_trait::async_trait;
use cloudcall_client::protocol::{CallKind, CallResponse, InboundBundle, OutboundBundle};
use cloudcall_client::{
    CloudCallClient, CloudCallConfig, CloudCallError, CommsEvent, Payload, ServiceCall, Transport,
};
use tokio::sync::mpsc;

// ─────────────────────────────────────────────────────────────────────
// Step 1: Define a channel-based "loopback" transport
// ─────────────────────────────────────────────────────────────────────

/// A loopback transport that shuttles bundles through in-process channels.
///
/// Each exchange writes the request bundle to the backend task and waits
/// for the matching response bundle.
pub struct LoopbackTransport {
    /// Request bundles go here (the backend reads from the other end).
    tx: mpsc::UnboundedSender<String>,
    /// Response bundles arrive here.
    rx: mpsc::UnboundedReceiver<String>,
}

/// Spawn a fake backend and return a transport connected to it.
fn spawn_backend() -> LoopbackTransport {
    let (client_tx, mut backend_rx) = mpsc::unbounded_channel::<String>();
    let (backend_tx, client_rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        while let Some(request) = backend_rx.recv().await {
            let Ok(bundle) = serde_json::from_str::<OutboundBundle>(&request) else {
                tracing::warn!("backend received a malformed bundle");
                continue;
            };
            tracing::info!(
                packet_id = bundle.packet_id,
                calls = bundle.messages.len(),
                "backend received bundle"
            );
            let reply = InboundBundle {
                packet_id: bundle.packet_id,
                responses: bundle.messages.iter().map(answer).collect(),
            };
            let Ok(text) = serde_json::to_string(&reply) else {
                break;
            };
            if backend_tx.send(text).is_err() {
                break;
            }
        }
    });

    LoopbackTransport {
        tx: client_tx,
        rx: client_rx,
    }
}

/// What the fake backend says to each call.
fn answer(call: &ServiceCall) -> CallResponse {
    match call.kind() {
        CallKind::Authenticate => CallResponse::success(serde_json::json!({
            "sessionId": "demo-session",
            "profileId": "demo-profile",
        })),
        _ => CallResponse::success(serde_json::json!({
            "service": call.service,
            "operation": call.operation,
        })),
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 2: Implement the Transport trait
// ─────────────────────────────────────────────────────────────────────

#[async_trait]
impl Transport for LoopbackTransport {
    /// Send the request bundle and wait for the response bundle.
    ///
    /// A closed backend channel reports `TransportClosed`, which stops the
    /// client.
    async fn exchange(&mut self, request: String) -> Result<String, CloudCallError> {
        self.tx
            .send(request)
            .map_err(|_| CloudCallError::TransportClosed)?;
        self.rx.recv().await.ok_or(CloudCallError::TransportClosed)
    }

    /// Close is a no-op for channels; dropping is sufficient.
    async fn close(&mut self) -> Result<(), CloudCallError> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 3: Wire together the client and the fake backend
// ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing for readable output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = CloudCallConfig::new("demo-app").with_language_code("en");
    let (mut client, mut event_rx) = CloudCallClient::start(spawn_backend(), config);

    // Queued before authentication; held until the session exists.
    let player_state = client.call(ServiceCall::new("playerState", "READ"))?;
    // Elided: heartbeats are pointless before there is a session.
    client.send_heartbeat()?;

    let mut credentials = Payload::new();
    credentials.insert("externalId".into(), "demo-player".into());
    let session = client.authenticate(credentials)?.response().await?;
    tracing::info!("Authenticated: {session}");

    let state = player_state.response().await?;
    tracing::info!("Player state: {state}");

    // Several calls made together travel in one bundle.
    let handles = ["READ", "GET_INVENTORY", "GET_STATS"]
        .into_iter()
        .map(|op| client.call(ServiceCall::new("entity", op)))
        .collect::<Result<Vec<_>, _>>()?;
    for handle in handles {
        let data = handle.response().await?;
        tracing::info!("Entity call answered: {data}");
    }

    // ── Clean shutdown ──────────────────────────────────────────────
    client.shutdown().await;
    while let Some(event) = event_rx.recv().await {
        match event {
            CommsEvent::Stopped { reason } => {
                tracing::info!("Event: Stopped ({})", reason.as_deref().unwrap_or("clean"));
            }
            other => tracing::info!("Event: {other:?}"),
        }
    }
    Ok(())
}
