//! Async bundling client.
//!
//! [`CloudCallClient`] is a thin handle over state shared with a background
//! comms loop task. Calls are appended to a request queue; the loop drains
//! whatever the auth gate permits into a bundle, sends it through the
//! [`Transport`], and resolves every call's responder from the response
//! bundle. Lifecycle events are emitted on a bounded channel
//! ([`tokio::sync::mpsc::Receiver<CommsEvent>`]) returned from
//! [`CloudCallClient::start`].
//!
//! # Example
//!
//! ```rust,ignore
//! let transport = connect_somehow().await;
//! let config = CloudCallConfig::new("app-123").with_language_code("fr");
//! let (client, mut events) = CloudCallClient::start(transport, config);
//!
//! // Held back until authentication succeeds.
//! let state = client.call(ServiceCall::new("playerState", "READ"))?;
//! let auth = client.authenticate(credentials)?;
//!
//! auth.response().await?;
//! let player = state.response().await?;
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::auth_gate::{AuthGate, GateState, GateTransition, SessionState};
use crate::bundler::{Bundle, Bundler, DEFAULT_MAX_BUNDLE_SIZE};
use crate::descriptor::{
    CallHandle, FailureCallback, OperationDescriptor, Responder, SuccessCallback, UserContext,
};
use crate::dispatcher::{Dispatch, ResponseDispatcher};
use crate::error::{CallFailure, CloudCallError, Result};
use crate::error_codes::ReasonCode;
use crate::event::CommsEvent;
use crate::protocol::{
    auth_keys, BundleOutcome, CallId, CallKind, CallOutcome, CallResponse, InboundBundle,
    OutboundBundle, Payload, ServiceCall,
};
use crate::queue::RequestQueue;
use crate::transport::Transport;

/// Default capacity of the bounded event channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Default period of the background flush.
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(50);

/// Default time allowed for one bundle round trip.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Shortest period accepted for timers; tokio rejects a zero period.
const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`CloudCallClient`].
///
/// The only required field is `app_id`; all others have sensible defaults.
///
/// # Example
///
/// ```
/// use cloudcall_client::client::CloudCallConfig;
/// use std::time::Duration;
///
/// let config = CloudCallConfig::new("app-123")
///     .with_max_bundle_size(25)
///     .with_heartbeat_interval(Duration::from_secs(30))
///     .with_country_code("CA");
/// assert_eq!(config.max_bundle_size, 25);
/// assert!(config.sdk_version.is_some());
/// ```
#[derive(Debug, Clone)]
pub struct CloudCallConfig {
    /// Application identifier added to every authentication payload.
    pub app_id: String,
    /// Client version added to authentication payloads.
    /// Defaults to the crate version at compile time.
    pub sdk_version: Option<String>,
    /// Country code override added to authentication payloads.
    pub country_code: Option<String>,
    /// Language code override added to authentication payloads.
    pub language_code: Option<String>,
    /// Maximum number of calls per bundle.
    ///
    /// Defaults to **10**. Values below 1 are clamped to 1.
    pub max_bundle_size: usize,
    /// How often the comms loop checks the queue without being woken.
    ///
    /// Submitting a call or calling [`CloudCallClient::flush`] wakes the loop
    /// immediately; the interval only bounds how long a released call can
    /// wait. Defaults to **50 ms**.
    pub flush_interval: Duration,
    /// Period of the automatic session heartbeat.
    ///
    /// Heartbeats are only queued while a session exists. Defaults to
    /// `None` (no automatic heartbeat).
    pub heartbeat_interval: Option<Duration>,
    /// Time allowed for one bundle round trip. When it elapses, every call
    /// in the bundle fails with [`ReasonCode::ClientTimeout`].
    ///
    /// Defaults to **15 seconds**.
    pub request_timeout: Duration,
    /// Capacity of the bounded event channel.
    ///
    /// When the consumer cannot keep up, events are dropped (with a warning
    /// logged) to avoid blocking the comms loop. The `Stopped` event is
    /// always delivered regardless of capacity.
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// Timeout for the graceful shutdown.
    ///
    /// Defaults to **1 second**. A zero timeout aborts the comms loop
    /// immediately without waiting for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl CloudCallConfig {
    /// Create a new configuration with the given App ID and default values.
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            sdk_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            country_code: None,
            language_code: None,
            max_bundle_size: DEFAULT_MAX_BUNDLE_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            heartbeat_interval: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Override the country reported at authentication.
    #[must_use]
    pub fn with_country_code(mut self, code: impl Into<String>) -> Self {
        self.country_code = Some(code.into());
        self
    }

    /// Override the language reported at authentication.
    #[must_use]
    pub fn with_language_code(mut self, code: impl Into<String>) -> Self {
        self.language_code = Some(code.into());
        self
    }

    /// Set the maximum number of calls per bundle. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_max_bundle_size(mut self, size: usize) -> Self {
        self.max_bundle_size = size.max(1);
        self
    }

    /// Set the background flush period. Clamped to at least 1 ms.
    #[must_use]
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval.max(MIN_TIMER_PERIOD);
        self
    }

    /// Enable the automatic heartbeat. Clamped to at least 1 ms.
    ///
    /// A period too large to schedule disables automatic heartbeats.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval.max(MIN_TIMER_PERIOD));
        self
    }

    /// Set the round-trip timeout for one bundle.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the capacity of the bounded event channel. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    /// Set the timeout for the graceful shutdown.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Client identity merged into authentication payloads.
#[derive(Debug)]
struct AuthIdentity {
    app_id: String,
    sdk_version: Option<String>,
    country_code: Option<String>,
    language_code: Option<String>,
}

impl AuthIdentity {
    fn from_config(config: &CloudCallConfig) -> Self {
        Self {
            app_id: config.app_id.clone(),
            sdk_version: config.sdk_version.clone(),
            country_code: config.country_code.clone(),
            language_code: config.language_code.clone(),
        }
    }

    /// Fill in identity keys the caller did not set.
    fn apply(&self, data: &mut Payload) {
        let entries = [
            (auth_keys::APP_ID, Some(&self.app_id)),
            (auth_keys::SDK_VERSION, self.sdk_version.as_ref()),
            (auth_keys::COUNTRY_CODE, self.country_code.as_ref()),
            (auth_keys::LANGUAGE_CODE, self.language_code.as_ref()),
        ];
        for (key, value) in entries {
            if let Some(value) = value {
                data.entry(key)
                    .or_insert_with(|| Value::String(value.clone()));
            }
        }
    }
}

// ── Shared state ────────────────────────────────────────────────────

/// Everything enqueue and drain must see consistently, behind one lock.
#[derive(Debug)]
struct CommsState {
    running: bool,
    queue: RequestQueue,
    gate: AuthGate,
    bundler: Bundler,
}

/// Internal shared state between the client handle and the comms loop.
#[derive(Debug)]
struct Shared {
    state: Mutex<CommsState>,
    wake: Notify,
    next_call_id: AtomicU64,
    elided_heartbeats: AtomicU64,
    identity: AuthIdentity,
}

impl Shared {
    fn new(config: &CloudCallConfig) -> Self {
        Self {
            state: Mutex::new(CommsState {
                running: true,
                queue: RequestQueue::new(),
                gate: AuthGate::new(),
                bundler: Bundler::new(config.max_bundle_size),
            }),
            wake: Notify::new(),
            next_call_id: AtomicU64::new(1),
            elided_heartbeats: AtomicU64::new(0),
            identity: AuthIdentity::from_config(config),
        }
    }

    /// Append a call to the queue and wake the comms loop.
    fn enqueue(&self, mut call: ServiceCall, responder: Responder) -> Result<CallId> {
        if call.kind() == CallKind::Authenticate {
            self.identity.apply(&mut call.data);
        }
        // Ids are taken under the lock so they follow queue order.
        let accepted = {
            let mut state = self.state.lock();
            if state.running {
                let id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
                state
                    .queue
                    .enqueue(OperationDescriptor::new(id, call, responder));
                Some(id)
            } else {
                None
            }
        };
        let Some(id) = accepted else {
            return Err(CloudCallError::NotRunning);
        };

        self.wake.notify_one();
        Ok(id)
    }

    /// Stop accepting calls and fail everything still queued.
    fn fail_queued(&self, reason_code: ReasonCode, message: &str) -> usize {
        let queued = {
            let mut state = self.state.lock();
            state.running = false;
            state.queue.drain_all()
        };
        if queued.is_empty() {
            return 0;
        }
        let mut dispatch = Dispatch::default();
        dispatch.fail_all(queued, &CallFailure::transport(reason_code, message));
        dispatch.deliver()
    }
}

// ── Client handle ───────────────────────────────────────────────────

/// Async client handle for bundled backend calls.
///
/// Created via [`CloudCallClient::start`], which spawns the background comms
/// loop and returns this handle together with an event receiver.
///
/// Submitting methods return as soon as the call is queued. Results arrive
/// through the call's callbacks or [`CallHandle`].
pub struct CloudCallClient {
    /// State shared with the comms loop.
    shared: Arc<Shared>,
    /// Handle to the background comms loop task.
    task: Option<tokio::task::JoinHandle<()>>,
    /// Oneshot sender to signal the comms loop to shut down gracefully.
    shutdown_tx: Option<oneshot::Sender<()>>,
    /// Timeout for the graceful shutdown.
    shutdown_timeout: Duration,
}

impl CloudCallClient {
    /// Start the comms loop and return a handle plus event receiver.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Returns
    ///
    /// A tuple of `(client_handle, event_receiver)`. The event receiver yields
    /// [`CommsEvent`]s until the comms loop stops.
    #[must_use = "the event receiver must be used to receive events"]
    pub fn start(
        transport: impl Transport,
        config: CloudCallConfig,
    ) -> (Self, mpsc::Receiver<CommsEvent>) {
        // Clamp capacity to at least 1 (tokio panics on 0).
        let capacity = config.event_channel_capacity.max(1);
        let (event_tx, event_rx) = mpsc::channel::<CommsEvent>(capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let shared = Arc::new(Shared::new(&config));
        let timing = LoopTiming {
            flush_interval: config.flush_interval.max(MIN_TIMER_PERIOD),
            heartbeat_interval: config
                .heartbeat_interval
                .map(|period| period.max(MIN_TIMER_PERIOD)),
            request_timeout: config.request_timeout,
        };

        let task = tokio::spawn(comms_loop(
            transport,
            Arc::clone(&shared),
            event_tx,
            shutdown_rx,
            timing,
        ));

        let client = Self {
            shared,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout: config.shutdown_timeout,
        };

        (client, event_rx)
    }

    // ── Public API methods ──────────────────────────────────────────

    /// Queue a call whose result is delivered to callbacks.
    ///
    /// Exactly one of `on_success` / `on_failure` runs, on the comms loop
    /// task, unless the call is withdrawn with [`cancel`](Self::cancel) or
    /// is a heartbeat elided before authentication.
    ///
    /// # Errors
    ///
    /// Returns [`CloudCallError::NotRunning`] if the client has stopped.
    pub fn submit(
        &self,
        call: ServiceCall,
        on_success: Option<SuccessCallback>,
        on_failure: Option<FailureCallback>,
        context: Option<UserContext>,
    ) -> Result<CallId> {
        self.shared.enqueue(
            call,
            Responder::callbacks(on_success, on_failure, context),
        )
    }

    /// Queue a call and return a handle resolving to its result.
    ///
    /// # Errors
    ///
    /// Returns [`CloudCallError::NotRunning`] if the client has stopped.
    pub fn call(&self, call: ServiceCall) -> Result<CallHandle> {
        let (tx, rx) = oneshot::channel::<CallOutcome>();
        let id = self.shared.enqueue(call, Responder::Channel(tx))?;
        Ok(CallHandle::new(id, rx))
    }

    /// Queue the authenticate call.
    ///
    /// The configured app id, client version and country/language overrides
    /// are added to `data` unless already present. Queued calls are held
    /// until this succeeds and failed if it does not.
    ///
    /// # Errors
    ///
    /// Returns [`CloudCallError::NotRunning`] if the client has stopped.
    pub fn authenticate(&self, data: Payload) -> Result<CallHandle> {
        self.call(ServiceCall::authenticate(data))
    }

    /// Queue a session heartbeat. Nobody is told the result.
    ///
    /// # Errors
    ///
    /// Returns [`CloudCallError::NotRunning`] if the client has stopped.
    pub fn send_heartbeat(&self) -> Result<()> {
        self.shared
            .enqueue(ServiceCall::heartbeat(), Responder::Discard)
            .map(|_| ())
    }

    /// Queue the logout call. Its success ends the session.
    ///
    /// # Errors
    ///
    /// Returns [`CloudCallError::NotRunning`] if the client has stopped.
    pub fn logout(&self) -> Result<CallHandle> {
        self.call(ServiceCall::logout())
    }

    /// Withdraw a call that is still queued.
    ///
    /// Returns `false` if the call already left the queue; it then runs to
    /// completion. A withdrawn call's callbacks never run and its
    /// [`CallHandle`] resolves to [`CloudCallError::Cancelled`].
    pub fn cancel(&self, id: CallId) -> bool {
        let withdrawn = self.shared.state.lock().queue.withdraw(id);
        match withdrawn {
            Some(descriptor) => {
                debug!(call_id = id, operation = %descriptor.call().operation, "call withdrawn");
                true
            }
            None => false,
        }
    }

    /// Wake the comms loop to send whatever is eligible now.
    pub fn flush(&self) {
        self.shared.wake.notify_one();
    }

    /// Shut down the client, failing queued calls and closing the transport.
    ///
    /// A bundle in flight is failed with [`ReasonCode::ClientShutdown`].
    /// After this method returns, the event receiver yields `None` once
    /// drained.
    pub async fn shutdown(&mut self) {
        debug!("CloudCallClient: shutdown requested");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        // Await the comms loop with a timeout. If it doesn't exit in time,
        // abort it so the task cannot detach and run indefinitely.
        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("comms loop terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("comms loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("comms loop aborted: {join_err}");
                    }
                }
            }
        }

        self.shared
            .fail_queued(ReasonCode::ClientShutdown, "client shut down");
    }

    // ── State accessors ─────────────────────────────────────────────

    /// Returns `true` while the client accepts calls.
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    /// Returns `true` if a session is established.
    pub fn is_authenticated(&self) -> bool {
        self.shared.state.lock().gate.is_authenticated()
    }

    /// Current auth gate state.
    pub fn auth_state(&self) -> GateState {
        self.shared.state.lock().gate.state()
    }

    /// Snapshot of the session held by this client.
    pub fn session(&self) -> SessionState {
        self.shared.state.lock().gate.session().clone()
    }

    /// Session token of the current session, if any.
    pub fn session_id(&self) -> Option<String> {
        self.shared
            .state
            .lock()
            .gate
            .session_id()
            .map(String::from)
    }

    /// Number of calls waiting in the queue.
    pub fn queued_calls(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Total heartbeats elided ahead of authentication.
    pub fn elided_heartbeats(&self) -> u64 {
        self.shared.elided_heartbeats.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for CloudCallClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudCallClient")
            .field("running", &self.is_running())
            .field("auth_state", &self.auth_state())
            .field("queued_calls", &self.queued_calls())
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for CloudCallClient {
    fn drop(&mut self) {
        // `Drop` is synchronous so we cannot await a graceful shutdown.
        // Abort the task and answer whatever is still queued. A bundle on
        // the wire is answered when the aborted task drops it.
        if let Some(task) = self.task.take() {
            task.abort();
            self.shared
                .fail_queued(ReasonCode::ClientShutdown, "client dropped");
        }
    }
}

// ── Comms loop ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct LoopTiming {
    flush_interval: Duration,
    heartbeat_interval: Option<Duration>,
    request_timeout: Duration,
}

/// How a flush pass ended.
enum FlushEnd {
    /// Nothing eligible is left.
    Drained,
    /// Shutdown was requested while a bundle was in flight.
    Shutdown,
    /// The transport reported it is closed for good.
    TransportClosed,
}

/// Background loop that drains the queue one bundle at a time.
///
/// Exits when:
/// - Shutdown is requested (or the client handle is dropped)
/// - The transport reports [`CloudCallError::TransportClosed`]
async fn comms_loop(
    mut transport: impl Transport,
    shared: Arc<Shared>,
    event_tx: mpsc::Sender<CommsEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
    timing: LoopTiming,
) {
    debug!("comms loop started");
    emit_event(&event_tx, CommsEvent::Started);

    let mut dispatcher = ResponseDispatcher::new();
    let mut flush_tick = tokio::time::interval(timing.flush_interval);
    flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut heartbeat_tick = timing.heartbeat_interval.and_then(|period| {
        let Some(first) = Instant::now().checked_add(period) else {
            warn!(
                ?period,
                "heartbeat interval out of range, automatic heartbeats disabled"
            );
            return None;
        };
        let mut tick = tokio::time::interval_at(first, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(tick)
    });

    let end = loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                debug!("shutdown signal received");
                break FlushEnd::Shutdown;
            }
            () = shared.wake.notified() => {}
            _ = flush_tick.tick() => {}
            () = next_heartbeat(&mut heartbeat_tick) => queue_heartbeat(&shared),
        }

        match flush_queue(
            &mut transport,
            &shared,
            &mut dispatcher,
            &event_tx,
            timing.request_timeout,
            &mut shutdown_rx,
        )
        .await
        {
            FlushEnd::Drained => {}
            other => break other,
        }
    };

    let reason = match end {
        FlushEnd::TransportClosed => {
            let failed = shared.fail_queued(ReasonCode::ClientNetworkError, "transport closed");
            debug!(failed, "transport closed, comms loop stopping");
            None
        }
        _ => {
            if let Err(e) = transport.close().await {
                debug!("transport close failed: {e}");
            }
            let failed = shared.fail_queued(ReasonCode::ClientShutdown, "client shut down");
            debug!(failed, "comms loop shutting down");
            Some("client shut down".to_string())
        }
    };

    emit_stopped(&event_tx, reason).await;
    debug!(
        bundles = dispatcher.dispatched_bundles(),
        "comms loop exited"
    );
}

async fn next_heartbeat(tick: &mut Option<Interval>) {
    match tick {
        Some(tick) => {
            tick.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Queue an automatic heartbeat if a session exists and none is waiting.
fn queue_heartbeat(shared: &Shared) {
    let queued = {
        let state = shared.state.lock();
        state.running
            && state.gate.is_authenticated()
            && !state.queue.contains_kind(CallKind::Heartbeat)
    };
    if queued {
        if let Err(e) = shared.enqueue(ServiceCall::heartbeat(), Responder::Discard) {
            debug!("heartbeat not queued: {e}");
        }
    }
}

/// Send bundles until nothing eligible is left.
async fn flush_queue(
    transport: &mut impl Transport,
    shared: &Shared,
    dispatcher: &mut ResponseDispatcher,
    event_tx: &mpsc::Sender<CommsEvent>,
    request_timeout: Duration,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> FlushEnd {
    loop {
        let (mut in_flight, outbound) = {
            let mut state = shared.state.lock();
            let CommsState {
                queue,
                gate,
                bundler,
                ..
            } = &mut *state;
            let bundle = bundler.build_bundle(queue, gate);
            let outbound = bundle.to_outbound(gate.session_id());
            (InFlight(bundle), outbound)
        };
        let bundle = &mut in_flight.0;

        if bundle.elided() > 0 {
            let count = bundle.elided();
            shared
                .elided_heartbeats
                .fetch_add(count as u64, Ordering::Relaxed);
            info!(count, "elided heartbeats queued ahead of authentication");
            emit_event(event_tx, CommsEvent::HeartbeatElided { count });
        }
        if bundle.is_empty() {
            return FlushEnd::Drained;
        }

        debug!(
            packet_id = bundle.packet_id(),
            calls = bundle.len(),
            "sending bundle"
        );

        let (outcome, end) = tokio::select! {
            result = exchange_bundle(&mut *transport, &outbound, request_timeout) => match result {
                Ok(outcomes) => (BundleOutcome::Responses(outcomes), None),
                Err(e) => {
                    error!(packet_id = bundle.packet_id(), "bundle exchange failed: {e}");
                    let end = matches!(e, CloudCallError::TransportClosed)
                        .then_some(FlushEnd::TransportClosed);
                    (BundleOutcome::TransportFailure(transport_failure(&e)), end)
                }
            },
            _ = &mut *shutdown_rx => {
                debug!("shutdown signal received with a bundle in flight");
                let failure = CallFailure::transport(
                    ReasonCode::ClientShutdown,
                    "client shut down while the bundle was in flight",
                );
                (BundleOutcome::TransportFailure(failure), Some(FlushEnd::Shutdown))
            }
        };

        complete_bundle(shared, dispatcher, bundle, outcome, event_tx);

        if let Some(end) = end {
            return end;
        }
    }
}

/// Owns a bundle while it is on the wire.
///
/// If the comms task is aborted mid-exchange, dropping the guard fails
/// every call in the bundle with `CLIENT_SHUTDOWN`.
struct InFlight(Bundle);

impl Drop for InFlight {
    fn drop(&mut self) {
        let bundle = &mut self.0;
        if bundle.dispatched || bundle.is_empty() {
            return;
        }
        debug!(
            packet_id = bundle.packet_id(),
            calls = bundle.len(),
            "failing bundle abandoned in flight"
        );
        let failure = CallFailure::transport(
            ReasonCode::ClientShutdown,
            "client dropped while the bundle was in flight",
        );
        for descriptor in std::mem::take(&mut bundle.descriptors) {
            descriptor.resolve(Err(failure.clone()));
        }
    }
}

/// One round trip: serialize, exchange with timeout, parse, correlate.
async fn exchange_bundle(
    transport: &mut impl Transport,
    outbound: &OutboundBundle,
    request_timeout: Duration,
) -> Result<Vec<CallOutcome>> {
    let request = serde_json::to_string(outbound)?;
    let reply = tokio::time::timeout(request_timeout, transport.exchange(request))
        .await
        .map_err(|_| CloudCallError::Timeout)??;
    let inbound: InboundBundle = serde_json::from_str(&reply)?;
    if inbound.packet_id != outbound.packet_id {
        return Err(CloudCallError::Protocol(format!(
            "response packet {} does not answer packet {}",
            inbound.packet_id, outbound.packet_id
        )));
    }
    Ok(inbound
        .responses
        .into_iter()
        .map(CallResponse::into_outcome)
        .collect())
}

/// Map a round-trip error to the failure every call in the bundle receives.
fn transport_failure(err: &CloudCallError) -> CallFailure {
    let reason_code = match err {
        CloudCallError::Timeout => ReasonCode::ClientTimeout,
        CloudCallError::Serialization(_) | CloudCallError::Protocol(_) => {
            ReasonCode::MalformedResponse
        }
        _ => ReasonCode::ClientNetworkError,
    };
    CallFailure::transport(reason_code, err.to_string())
}

/// Dispatch a bundle outcome, update the gate, then run callbacks unlocked.
fn complete_bundle(
    shared: &Shared,
    dispatcher: &mut ResponseDispatcher,
    bundle: &mut Bundle,
    outcome: BundleOutcome,
    event_tx: &mpsc::Sender<CommsEvent>,
) {
    let packet_id = bundle.packet_id();
    let failed_bundle = match &outcome {
        BundleOutcome::TransportFailure(failure) => Some(failure.clone()),
        BundleOutcome::Responses(_) => None,
    };

    let mut dispatch = match dispatcher.dispatch(bundle, outcome) {
        Ok(dispatch) => dispatch,
        Err(e) => {
            error!(packet_id, "bundle dispatch rejected: {e}");
            return;
        }
    };
    let calls = dispatch.len();
    let failed = dispatch.failed();

    let mut events = Vec::new();
    {
        let mut state = shared.state.lock();
        let CommsState { queue, gate, .. } = &mut *state;
        for signal in dispatch.take_signals() {
            match gate.apply(signal, queue) {
                Some(GateTransition::Authenticated { session_id }) => {
                    events.push(CommsEvent::Authenticated { session_id });
                }
                Some(GateTransition::AuthenticationFailed { failure, cascaded }) => {
                    let cascaded_count = cascaded.len();
                    dispatch.fail_all(cascaded, &failure);
                    events.push(CommsEvent::AuthenticationFailed {
                        failure,
                        cascaded: cascaded_count,
                    });
                }
                Some(GateTransition::SessionEnded { reason }) => {
                    events.push(CommsEvent::SessionInvalidated { reason });
                }
                None => {}
            }
        }
    }

    dispatch.deliver();

    for event in events {
        emit_event(event_tx, event);
    }
    match failed_bundle {
        Some(failure) => emit_event(event_tx, CommsEvent::TransportFailed { packet_id, failure }),
        None => emit_event(
            event_tx,
            CommsEvent::BundleCompleted {
                packet_id,
                calls,
                failed,
            },
        ),
    }
}

/// Emit an event to the event channel. If the channel is full, log a warning
/// and drop the event to avoid blocking the comms loop.
fn emit_event(event_tx: &mpsc::Sender<CommsEvent>, event: CommsEvent) {
    match event_tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            warn!(
                "event channel full, dropping event: {:?}",
                std::mem::discriminant(&dropped)
            );
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("event channel closed, receiver dropped");
        }
    }
}

/// Emit the final [`Stopped`](CommsEvent::Stopped) event.
///
/// Uses `send().await` instead of `try_send` because `Stopped` is always the
/// last event on the channel and must never be silently dropped.
async fn emit_stopped(event_tx: &mpsc::Sender<CommsEvent>, reason: Option<String>) {
    if event_tx.send(CommsEvent::Stopped { reason }).await.is_err() {
        debug!("event channel closed, receiver dropped");
    }
}

// ── Tests ───────────────────────────────────────────────────────────

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
    use crate::error_codes::status;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex as StdMutex;

    // ── Mock transport ──────────────────────────────────────────────

    /// Answers every bundle from `respond` and records what was sent.
    struct MockTransport {
        respond: Box<dyn FnMut(&ServiceCall) -> CallResponse + Send>,
        sent: Arc<StdMutex<Vec<OutboundBundle>>>,
        closed: Arc<AtomicBool>,
    }

    impl MockTransport {
        fn new(
            respond: impl FnMut(&ServiceCall) -> CallResponse + Send + 'static,
        ) -> (Self, Arc<StdMutex<Vec<OutboundBundle>>>, Arc<AtomicBool>) {
            let sent = Arc::new(StdMutex::new(Vec::new()));
            let closed = Arc::new(AtomicBool::new(false));
            let transport = Self {
                respond: Box::new(respond),
                sent: Arc::clone(&sent),
                closed: Arc::clone(&closed),
            };
            (transport, sent, closed)
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn exchange(&mut self, request: String) -> Result<String> {
            let bundle: OutboundBundle = serde_json::from_str(&request).unwrap();
            let responses = bundle
                .messages
                .iter()
                .map(|call| (self.respond)(call))
                .collect();
            let reply = InboundBundle {
                packet_id: bundle.packet_id,
                responses,
            };
            self.sent.lock().unwrap().push(bundle);
            Ok(serde_json::to_string(&reply).unwrap())
        }

        async fn close(&mut self) -> Result<()> {
            self.closed.store(true, Ordering::Relaxed);
            Ok(())
        }
    }

    fn accept_all(call: &ServiceCall) -> CallResponse {
        match call.kind() {
            CallKind::Authenticate => {
                CallResponse::success(serde_json::json!({ "sessionId": "sess-42" }))
            }
            _ => CallResponse::success(serde_json::json!({ "op": call.operation })),
        }
    }

    // ── Tests ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn started_is_first_event() {
        let (transport, _sent, _closed) = MockTransport::new(accept_all);
        let (mut client, mut events) = CloudCallClient::start(transport, CloudCallConfig::new("app"));

        let first = events.recv().await.unwrap();
        assert!(
            matches!(first, CommsEvent::Started),
            "expected Started as first event, got {first:?}"
        );

        client.shutdown().await;
    }

    #[tokio::test]
    async fn authenticate_establishes_session() {
        let (transport, sent, _closed) = MockTransport::new(accept_all);
        let (mut client, _events) = CloudCallClient::start(transport, CloudCallConfig::new("app"));

        let data = client.authenticate(Payload::new()).unwrap().response().await.unwrap();
        assert_eq!(data["sessionId"], "sess-42");
        assert!(client.is_authenticated());
        assert_eq!(client.session_id().as_deref(), Some("sess-42"));
        assert_eq!(client.auth_state(), GateState::Authenticated);
        assert_eq!(
            client.session(),
            SessionState {
                authenticated: true,
                session_id: Some("sess-42".into()),
            }
        );

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].session_id.is_none());

        drop(sent);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn calls_after_auth_carry_session_id() {
        let (transport, sent, _closed) = MockTransport::new(accept_all);
        let (mut client, _events) = CloudCallClient::start(transport, CloudCallConfig::new("app"));

        client.authenticate(Payload::new()).unwrap().response().await.unwrap();
        client
            .call(ServiceCall::new("entity", "READ"))
            .unwrap()
            .response()
            .await
            .unwrap();

        {
            let sent = sent.lock().unwrap();
            assert_eq!(sent.last().unwrap().session_id.as_deref(), Some("sess-42"));
        }

        client.shutdown().await;
    }

    #[tokio::test]
    async fn auth_payload_gets_identity_and_overrides() {
        let (transport, sent, _closed) = MockTransport::new(accept_all);
        let config = CloudCallConfig::new("app-7")
            .with_country_code("RU")
            .with_language_code("ru");
        let (mut client, _events) = CloudCallClient::start(transport, config);

        let mut data = Payload::new();
        data.insert(auth_keys::LANGUAGE_CODE.into(), "fr".into());
        client.authenticate(data).unwrap().response().await.unwrap();

        {
            let sent = sent.lock().unwrap();
            let auth = &sent[0].messages[0].data;
            assert_eq!(auth[auth_keys::APP_ID], "app-7");
            assert_eq!(auth[auth_keys::COUNTRY_CODE], "RU");
            // Caller-supplied values win.
            assert_eq!(auth[auth_keys::LANGUAGE_CODE], "fr");
            assert_eq!(auth[auth_keys::SDK_VERSION], env!("CARGO_PKG_VERSION"));
        }

        client.shutdown().await;
    }

    #[tokio::test]
    async fn queued_call_waits_for_authentication() {
        let (transport, sent, _closed) = MockTransport::new(accept_all);
        let (mut client, _events) = CloudCallClient::start(transport, CloudCallConfig::new("app"));

        let read = client.call(ServiceCall::new("playerState", "READ")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sent.lock().unwrap().is_empty());
        assert_eq!(client.queued_calls(), 1);

        let auth = client.authenticate(Payload::new()).unwrap();
        auth.response().await.unwrap();
        let data = read.response().await.unwrap();
        assert_eq!(data["op"], "READ");

        {
            let sent = sent.lock().unwrap();
            assert_eq!(sent.len(), 2);
            assert_eq!(sent[0].messages[0].kind(), CallKind::Authenticate);
            assert_eq!(sent[1].messages[0].operation, "READ");
        }

        client.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_withdraws_queued_call() {
        let (transport, _sent, _closed) = MockTransport::new(accept_all);
        let (mut client, _events) = CloudCallClient::start(transport, CloudCallConfig::new("app"));

        let handle = client.call(ServiceCall::new("entity", "READ")).unwrap();
        assert!(client.cancel(handle.id()));
        assert!(!client.cancel(handle.id()));
        assert!(matches!(
            handle.response().await,
            Err(CloudCallError::Cancelled)
        ));

        client.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_fails_queued_calls() {
        let (transport, _sent, closed) = MockTransport::new(accept_all);
        let (mut client, mut events) = CloudCallClient::start(transport, CloudCallConfig::new("app"));

        let handle = client.call(ServiceCall::new("entity", "READ")).unwrap();
        client.shutdown().await;

        match handle.response().await {
            Err(CloudCallError::CallFailed(failure)) => {
                assert_eq!(failure.reason_code, ReasonCode::ClientShutdown);
                assert_eq!(failure.status, status::CLIENT_NETWORK_ERROR);
            }
            other => panic!("expected ClientShutdown failure, got {other:?}"),
        }
        assert!(closed.load(Ordering::Relaxed));

        let mut last = None;
        while let Some(event) = events.recv().await {
            last = Some(event);
        }
        assert_eq!(
            last,
            Some(CommsEvent::Stopped {
                reason: Some("client shut down".into())
            })
        );
    }

    #[tokio::test]
    async fn not_running_error_after_shutdown() {
        let (transport, _sent, _closed) = MockTransport::new(accept_all);
        let (mut client, _events) = CloudCallClient::start(transport, CloudCallConfig::new("app"));

        client.shutdown().await;

        assert!(!client.is_running());
        assert!(matches!(
            client.send_heartbeat(),
            Err(CloudCallError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn double_shutdown_does_not_panic() {
        let (transport, _sent, _closed) = MockTransport::new(accept_all);
        let (mut client, _events) = CloudCallClient::start(transport, CloudCallConfig::new("app"));

        client.shutdown().await;
        client.shutdown().await;
    }

    #[tokio::test]
    async fn drop_without_explicit_shutdown_answers_queued_calls() {
        let (transport, _sent, _closed) = MockTransport::new(accept_all);
        let (client, mut events) = CloudCallClient::start(transport, CloudCallConfig::new("app"));

        let handle = client.call(ServiceCall::new("entity", "READ")).unwrap();
        drop(client);

        assert!(matches!(
            handle.response().await,
            Err(CloudCallError::CallFailed(_))
        ));
        while let Some(_event) = events.recv().await {}
    }

    /// Transport whose exchange never completes.
    struct HangingTransport;

    #[async_trait]
    impl Transport for HangingTransport {
        async fn exchange(&mut self, _request: String) -> Result<String> {
            std::future::pending().await
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn request_timeout_fails_bundle() {
        let config = CloudCallConfig::new("app").with_request_timeout(Duration::from_millis(30));
        let (mut client, _events) = CloudCallClient::start(HangingTransport, config);

        let auth = client.authenticate(Payload::new()).unwrap();
        match auth.response().await {
            Err(CloudCallError::CallFailed(failure)) => {
                assert_eq!(failure.reason_code, ReasonCode::ClientTimeout);
            }
            other => panic!("expected timeout failure, got {other:?}"),
        }
        assert_eq!(client.auth_state(), GateState::Unauthenticated);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_fails_in_flight_bundle() {
        let (mut client, _events) =
            CloudCallClient::start(HangingTransport, CloudCallConfig::new("app"));

        let auth = client.authenticate(Payload::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.shutdown().await;

        match auth.response().await {
            Err(CloudCallError::CallFailed(failure)) => {
                assert_eq!(failure.reason_code, ReasonCode::ClientShutdown);
            }
            other => panic!("expected shutdown failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn drop_answers_in_flight_callbacks() {
        let (client, _events) =
            CloudCallClient::start(HangingTransport, CloudCallConfig::new("app"));

        let hits = Arc::new(StdMutex::new(Vec::new()));
        let on_ok = Arc::clone(&hits);
        let on_err = Arc::clone(&hits);
        client
            .submit(
                ServiceCall::authenticate(Payload::new()),
                Some(Box::new(move |_: Value, _: Option<UserContext>| {
                    on_ok.lock().unwrap().push(None)
                })),
                Some(Box::new(move |failure: CallFailure, _: Option<UserContext>| {
                    on_err.lock().unwrap().push(Some(failure.reason_code))
                })),
                None,
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(client);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(
            *hits.lock().unwrap(),
            vec![Some(ReasonCode::ClientShutdown)]
        );
    }

    #[tokio::test]
    async fn oversized_heartbeat_interval_disables_heartbeats() {
        let (transport, sent, _closed) = MockTransport::new(accept_all);
        let config = CloudCallConfig::new("app").with_heartbeat_interval(Duration::MAX);
        let (mut client, _events) = CloudCallClient::start(transport, config);

        let auth = tokio::time::timeout(
            Duration::from_secs(2),
            client.authenticate(Payload::new()).unwrap().response(),
        )
        .await
        .expect("comms loop should still answer calls");
        assert!(auth.is_ok());
        assert!(client.is_running());
        assert_eq!(sent.lock().unwrap().len(), 1);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn automatic_heartbeat_only_after_authentication() {
        let (transport, sent, _closed) = MockTransport::new(accept_all);
        let config = CloudCallConfig::new("app").with_heartbeat_interval(Duration::from_millis(20));
        let (mut client, _events) = CloudCallClient::start(transport, config);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(sent.lock().unwrap().is_empty());

        client.authenticate(Payload::new()).unwrap().response().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        {
            let sent = sent.lock().unwrap();
            assert!(sent
                .iter()
                .flat_map(|b| &b.messages)
                .any(|c| c.kind() == CallKind::Heartbeat));
        }

        client.shutdown().await;
    }

    #[tokio::test]
    async fn config_defaults() {
        let config = CloudCallConfig::new("app-defaults");
        assert_eq!(config.app_id, "app-defaults");
        assert!(config.sdk_version.is_some());
        assert!(config.country_code.is_none());
        assert!(config.language_code.is_none());
        assert_eq!(config.max_bundle_size, 10);
        assert_eq!(config.flush_interval, Duration::from_millis(50));
        assert!(config.heartbeat_interval.is_none());
        assert_eq!(config.request_timeout, Duration::from_secs(15));
        assert_eq!(config.event_channel_capacity, 256);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn config_builders_clamp() {
        let config = CloudCallConfig::new("app")
            .with_max_bundle_size(0)
            .with_event_channel_capacity(0)
            .with_flush_interval(Duration::ZERO)
            .with_heartbeat_interval(Duration::ZERO);
        assert_eq!(config.max_bundle_size, 1);
        assert_eq!(config.event_channel_capacity, 1);
        assert_eq!(config.flush_interval, MIN_TIMER_PERIOD);
        assert_eq!(config.heartbeat_interval, Some(MIN_TIMER_PERIOD));
    }

    #[tokio::test]
    async fn debug_impl_for_client() {
        let (transport, _sent, _closed) = MockTransport::new(accept_all);
        let (mut client, _events) = CloudCallClient::start(transport, CloudCallConfig::new("app"));

        let debug_str = format!("{client:?}");
        assert!(debug_str.contains("CloudCallClient"));
        assert!(debug_str.contains("auth_state"));

        client.shutdown().await;
    }
}
