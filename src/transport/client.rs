//! Reconnecting stream client
//!
//! One logical connection to a server, kept alive across network flaps and
//! server restarts. The client is generic over a [`Dialer`], so the same
//! reconnect logic drives the TCP transport, the in-memory transport and
//! anything else that can dial a channel and open a stream on it.
//!
//! Failure is detected three ways: a failed write in [`ReconnectingClient::send`],
//! a read error or EOF in the receive loop, and the monitor observing the
//! channel in `TransientFailure`/`Shutdown`. All three funnel into one
//! single-flight reconnect path.

use super::backoff::BackoffPolicy;
use super::health_monitor::{HealthMetrics, HealthMonitor, ReconnectionDecision};
use super::{Channel, ConnectionState, Dialer, Envelope, StreamSink, StreamSource};
use crate::client_span;
use crate::error::{FleetError, FleetResult};
use crate::observability::metrics::metrics;
use crate::runtime::{spawn_supervised, CloseOnDrop, Shutdown, ShutdownSignal};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn, Instrument};

const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// Construction parameters for [`ReconnectingClient`]
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub client_id: String,
    /// Base interval handed to the backoff policy
    pub reconnect_interval: Duration,
    /// 0 = unlimited
    pub max_reconnect_attempts: u32,
    pub monitor_interval: Duration,
    /// Sent to the server in the handshake envelope
    pub metadata: HashMap<String, String>,
    /// Fixed seed for the backoff jitter; `None` seeds from entropy
    pub backoff_seed: Option<u64>,
}

impl ClientConfig {
    pub fn new<S: Into<String>>(
        client_id: S,
        reconnect_interval: Duration,
        max_reconnect_attempts: u32,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            reconnect_interval,
            max_reconnect_attempts,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            metadata: HashMap::new(),
            backoff_seed: None,
        }
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_backoff_seed(mut self, seed: u64) -> Self {
        self.backoff_seed = Some(seed);
        self
    }
}

/// Handle to a reconnecting client. Clones share the same connection.
///
/// Dropping the last clone closes the client.
pub struct ReconnectingClient<D: Dialer> {
    inner: Arc<Inner<D>>,
    _close_on_drop: Arc<CloseOnDrop>,
}

impl<D: Dialer> Clone for ReconnectingClient<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _close_on_drop: self._close_on_drop.clone(),
        }
    }
}

type SharedSink<D> = Arc<AsyncMutex<<<D as Dialer>::Channel as Channel>::Sink>>;

struct ActiveStream<D: Dialer> {
    generation: u64,
    sink: SharedSink<D>,
}

/// Everything the reconnect logic reads or writes, behind one lock
struct ReconnectState<D: Dialer> {
    channel: Option<Arc<D::Channel>>,
    stream: Option<ActiveStream<D>>,
    /// Bumped on every successful connect; loops of older streams see a
    /// mismatch and stay quiet
    generation: u64,
    closed: bool,
    reconnecting: bool,
    reconnect_attempts: u32,
    gave_up: bool,
    ever_connected: bool,
    connected_at: Option<Instant>,
    last_message_at: Option<Instant>,
    reconnect_count: u32,
}

impl<D: Dialer> ReconnectState<D> {
    fn new() -> Self {
        Self {
            channel: None,
            stream: None,
            generation: 0,
            closed: false,
            reconnecting: false,
            reconnect_attempts: 0,
            gave_up: false,
            ever_connected: false,
            connected_at: None,
            last_message_at: None,
            reconnect_count: 0,
        }
    }

    fn observed_state(&self) -> ConnectionState {
        if self.closed {
            return ConnectionState::Shutdown;
        }
        if self.stream.is_some() {
            if let Some(channel) = &self.channel {
                return channel.state();
            }
        }
        if self.reconnecting {
            return ConnectionState::Connecting;
        }
        if self.gave_up {
            return ConnectionState::TransientFailure;
        }
        match &self.channel {
            Some(channel) => channel.state(),
            None => ConnectionState::Idle,
        }
    }
}

struct Inner<D: Dialer> {
    dialer: D,
    config: ClientConfig,
    backoff: BackoffPolicy,
    state: Mutex<ReconnectState<D>>,
    shutdown: Shutdown,
    inbound: Mutex<Option<mpsc::Sender<Envelope>>>,
}

impl<D: Dialer> ReconnectingClient<D> {
    pub fn new(dialer: D, config: ClientConfig) -> Self {
        let backoff = match config.backoff_seed {
            Some(seed) => BackoffPolicy::with_seed(config.reconnect_interval, seed),
            None => BackoffPolicy::new(config.reconnect_interval),
        };

        let inner = Arc::new(Inner {
            dialer,
            config,
            backoff,
            state: Mutex::new(ReconnectState::new()),
            shutdown: Shutdown::new(),
            inbound: Mutex::new(None),
        });
        let closing = inner.clone();
        Self {
            inner,
            _close_on_drop: CloseOnDrop::new(move || closing.close()),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.inner.config.client_id
    }

    /// Dial (or reuse a healthy channel), open one stream and start the
    /// receive loop, handshake and monitor for it.
    ///
    /// Never retries; a failure is returned to the caller as is.
    pub async fn connect(&self) -> FleetResult<()> {
        Inner::connect(&self.inner).await
    }

    /// Send one payload tagged with this client's identifier
    pub async fn send(&self, payload: Vec<u8>) -> FleetResult<()> {
        let (generation, sink) = {
            let state = self.inner.lock_state();
            if state.closed {
                return Err(FleetError::Closed);
            }
            match &state.stream {
                Some(stream) => (stream.generation, stream.sink.clone()),
                None => {
                    return Err(FleetError::NotConnected {
                        state: state.observed_state(),
                    })
                }
            }
        };

        let envelope = Envelope::new(self.inner.config.client_id.clone(), payload);
        let result = sink.lock().await.send(envelope).await;

        match result {
            Ok(()) => {
                metrics().message_sent();
                Ok(())
            }
            Err(e) => {
                metrics().send_failed();
                if e.is_transport() && self.inner.mark_stream_failed(generation) {
                    warn!(
                        client_id = %self.inner.config.client_id,
                        error = %e,
                        "Write failed, reconnecting"
                    );
                    Inner::trigger_reconnect(&self.inner);
                }
                Err(e)
            }
        }
    }

    /// Connect, fall back to the reconnect path on failure, then block
    /// until the client is closed.
    pub async fn run(&self) -> FleetResult<()> {
        match self.connect().await {
            Ok(()) => {}
            Err(FleetError::Closed) => return Err(FleetError::Closed),
            Err(e) => {
                warn!(
                    client_id = %self.inner.config.client_id,
                    error = %e,
                    "Initial connect failed, reconnecting in background"
                );
                Inner::trigger_reconnect(&self.inner);
            }
        }

        self.inner.shutdown.subscribe().wait().await;
        Ok(())
    }

    /// Stop every loop, release the channel and refuse further work. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Last observed state; never blocks on I/O
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.lock_state().observed_state()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock_state().closed
    }

    /// Retry budget exhausted; only a manual `connect()` brings the client back
    pub fn is_permanently_disconnected(&self) -> bool {
        let state = self.inner.lock_state();
        state.gave_up && !state.closed
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lock_state().reconnect_attempts
    }

    /// Forward every inbound envelope to `sender`
    pub fn set_inbound_sender(&self, sender: mpsc::Sender<Envelope>) {
        *self
            .inner
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(sender);
    }

    pub fn health_metrics(&self) -> HealthMetrics {
        let state = self.inner.lock_state();
        let connected_at = if state.stream.is_some() {
            state.connected_at
        } else {
            None
        };
        HealthMonitor::calculate_health_metrics(
            connected_at,
            state.last_message_at,
            state.reconnect_count,
        )
    }
}

impl<D: Dialer> Inner<D> {
    fn lock_state(&self) -> MutexGuard<'_, ReconnectState<D>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        let channel = {
            let mut state = self.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.stream = None;
            state.channel.take()
        };

        self.shutdown.fire();
        if let Some(channel) = channel {
            channel.close();
        }
        info!(client_id = %self.config.client_id, "Client closed");
    }

    async fn connect(this: &Arc<Self>) -> FleetResult<()> {
        let existing = {
            let state = this.lock_state();
            if state.closed {
                return Err(FleetError::Closed);
            }
            state.channel.clone()
        };

        metrics().connect_attempt();
        let client_id = this.config.client_id.as_str();

        let channel = match existing {
            Some(channel) if !HealthMonitor::needs_reconnect(channel.state()) => channel,
            stale => {
                if let Some(stale) = stale {
                    stale.close();
                }
                debug!(client_id, "Dialing server");
                Arc::new(this.dialer.dial().await?)
            }
        };

        let (sink, source) = match channel.open_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                let mut state = this.lock_state();
                if state.closed {
                    channel.close();
                } else {
                    state.channel = Some(channel);
                }
                return Err(e);
            }
        };

        // Held by the handshake task so user sends queue up behind it.
        let sink = Arc::new(AsyncMutex::new(sink));
        let handshake_guard = sink.clone().lock_owned().await;

        let generation = {
            let mut state = this.lock_state();
            if state.closed {
                channel.close();
                return Err(FleetError::Closed);
            }
            if let Some(previous) = state.channel.replace(channel.clone()) {
                if !Arc::ptr_eq(&previous, &channel) {
                    previous.close();
                }
            }
            state.generation += 1;
            let generation = state.generation;
            state.stream = Some(ActiveStream {
                generation,
                sink: sink.clone(),
            });
            state.reconnect_attempts = 0;
            state.gave_up = false;
            if state.ever_connected {
                state.reconnect_count += 1;
            }
            state.ever_connected = true;
            state.connected_at = Some(Instant::now());
            generation
        };

        metrics().connection_established();
        info!(client_id, generation, "Connected to server");

        let span = client_span!(client_id = %client_id, generation);
        spawn_supervised(
            "client-receive-loop",
            Self::receive_loop(this.clone(), source, generation, this.shutdown.subscribe())
                .instrument(span.clone()),
        );
        spawn_supervised(
            "client-handshake",
            Self::handshake(this.clone(), handshake_guard, generation, this.shutdown.subscribe())
                .instrument(span.clone()),
        );
        spawn_supervised(
            "client-monitor",
            Self::monitor(this.clone(), generation, this.shutdown.subscribe()).instrument(span),
        );

        Ok(())
    }

    /// Drop the active stream if it is still generation `generation`.
    ///
    /// Returns whether the caller should start a reconnect: false when the
    /// stream was already replaced or the client is closed.
    fn mark_stream_failed(&self, generation: u64) -> bool {
        let mut state = self.lock_state();
        match &state.stream {
            Some(stream) if stream.generation == generation => {
                state.stream = None;
                state.connected_at = None;
                !state.closed
            }
            _ => false,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        let state = self.lock_state();
        !state.closed
            && state
                .stream
                .as_ref()
                .is_some_and(|stream| stream.generation == generation)
    }

    fn channel_state(&self) -> ConnectionState {
        let state = self.lock_state();
        match &state.channel {
            Some(channel) => channel.state(),
            None => ConnectionState::Idle,
        }
    }

    fn trigger_reconnect(this: &Arc<Self>) {
        let span = client_span!(client_id = %this.config.client_id);
        spawn_supervised("client-reconnect", Self::reconnect(this.clone()).instrument(span));
    }

    async fn reconnect(this: Arc<Self>) {
        let max = this.config.max_reconnect_attempts;
        let attempt = {
            let mut state = this.lock_state();
            if state.reconnecting || state.stream.is_some() {
                return;
            }
            let attempt = state.reconnect_attempts + 1;
            match HealthMonitor::should_attempt_reconnection(attempt, max, state.closed) {
                ReconnectionDecision::Proceed { attempt } => {
                    state.reconnect_attempts = attempt;
                    state.reconnecting = true;
                    attempt
                }
                ReconnectionDecision::AbortMaxAttemptsExceeded { max } => {
                    state.reconnect_attempts = attempt;
                    state.gave_up = true;
                    drop(state);
                    metrics().reconnect_gave_up();
                    let error = FleetError::MaxAttemptsExceeded { max };
                    warn!(
                        client_id = %this.config.client_id,
                        error = %error,
                        "Giving up on reconnecting; call connect() to retry"
                    );
                    return;
                }
                ReconnectionDecision::AbortClosed => {
                    debug!(client_id = %this.config.client_id, "Client closed, not reconnecting");
                    return;
                }
            }
        };

        let delay = this.backoff.delay(attempt);
        metrics().reconnect_attempt(delay);
        let max_display = if max == 0 {
            "unlimited".to_string()
        } else {
            max.to_string()
        };
        info!(
            client_id = %this.config.client_id,
            attempt,
            max_attempts = %max_display,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting after backoff"
        );

        if !Self::interruptible_sleep(this.shutdown.subscribe(), delay).await {
            this.lock_state().reconnecting = false;
            debug!(client_id = %this.config.client_id, "Client closed during backoff");
            return;
        }

        let result = Self::connect(&this).await;

        let lost_again = {
            let mut state = this.lock_state();
            state.reconnecting = false;
            state.stream.is_none() && !state.closed
        };

        match result {
            Ok(()) => {
                info!(client_id = %this.config.client_id, attempt, "Reconnected");
                // The new stream died before the flag cleared; its trigger was a no-op.
                if lost_again {
                    Self::trigger_reconnect(&this);
                }
            }
            Err(FleetError::Closed) => {}
            Err(e) => {
                warn!(
                    client_id = %this.config.client_id,
                    attempt,
                    error = %e,
                    "Reconnect attempt failed"
                );
                Self::trigger_reconnect(&this);
            }
        }
    }

    /// Returns false when the client closed before the delay elapsed
    async fn interruptible_sleep(mut shutdown: ShutdownSignal, delay: Duration) -> bool {
        tokio::select! {
            _ = shutdown.wait() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn receive_loop(
        this: Arc<Self>,
        mut source: <D::Channel as Channel>::Source,
        generation: u64,
        mut shutdown: ShutdownSignal,
    ) {
        loop {
            let received = tokio::select! {
                _ = shutdown.wait() => return,
                received = source.recv() => received,
            };

            match received {
                Ok(Some(envelope)) => {
                    metrics().message_received();
                    this.lock_state().last_message_at = Some(Instant::now());
                    this.forward_inbound(envelope);
                }
                Ok(None) => {
                    info!(client_id = %this.config.client_id, "Server ended the stream");
                    break;
                }
                Err(e) => {
                    warn!(client_id = %this.config.client_id, error = %e, "Receive failed");
                    break;
                }
            }
        }

        if this.mark_stream_failed(generation) {
            Self::trigger_reconnect(&this);
        }
    }

    fn forward_inbound(&self, envelope: Envelope) {
        let sender = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(sender) = sender else {
            return;
        };

        match sender.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                metrics().queue_full();
                warn!(client_id = %self.config.client_id, "Inbound consumer is full, dropping envelope");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(client_id = %self.config.client_id, "Inbound consumer gone");
            }
        }
    }

    async fn handshake(
        this: Arc<Self>,
        mut sink: OwnedMutexGuard<<D::Channel as Channel>::Sink>,
        generation: u64,
        mut shutdown: ShutdownSignal,
    ) {
        let envelope =
            Envelope::handshake(this.config.client_id.clone(), this.config.metadata.clone());

        let result = tokio::select! {
            _ = shutdown.wait() => return,
            result = sink.send(envelope) => result,
        };
        drop(sink);

        match result {
            Ok(()) => debug!(client_id = %this.config.client_id, generation, "Handshake sent"),
            Err(e) => {
                warn!(client_id = %this.config.client_id, error = %e, "Handshake failed");
                if e.is_transport() && this.mark_stream_failed(generation) {
                    Self::trigger_reconnect(&this);
                }
            }
        }
    }

    /// Poll the channel state; hand off to the reconnect path once, then stop
    async fn monitor(this: Arc<Self>, generation: u64, mut shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(this.config.monitor_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.wait() => return,
                _ = ticker.tick() => {}
            }

            if !this.is_current(generation) {
                return;
            }

            let observed = this.channel_state();
            if HealthMonitor::needs_reconnect(observed) {
                HealthMonitor::log_state_transition(
                    &this.config.client_id,
                    ConnectionState::Ready,
                    observed,
                );
                if this.mark_stream_failed(generation) {
                    Self::trigger_reconnect(&this);
                }
                return;
            }
        }
    }
}
