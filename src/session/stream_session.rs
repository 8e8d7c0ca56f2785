//! One registered logical connection on the server side

use crate::error::{FleetError, FleetResult};
use crate::observability::metrics::metrics;
use crate::runtime::Shutdown;
use crate::transport::{Envelope, StreamSink, StreamSource};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// Mutable session fields, all behind the session's own lock
struct SessionState {
    closed: bool,
    last_active: Instant,
    /// Dropped exactly once, by `close()`
    outbound: Option<mpsc::Sender<Envelope>>,
    /// Taken by `run()`
    outbound_rx: Option<mpsc::Receiver<Envelope>>,
}

/// A client's stream as seen by the server: an outbound queue drained by a
/// send loop, and a receive loop that tracks activity.
pub struct StreamSession {
    client_id: String,
    metadata: HashMap<String, String>,
    capacity: usize,
    created_at: Instant,
    connected_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    closed: Shutdown,
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("client_id", &self.client_id)
            .field("capacity", &self.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl StreamSession {
    /// `capacity` is clamped to at least 1
    pub fn new<S: Into<String>>(
        client_id: S,
        metadata: HashMap<String, String>,
        capacity: usize,
    ) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let now = Instant::now();

        Self {
            client_id: client_id.into(),
            metadata,
            capacity,
            created_at: now,
            connected_at: Utc::now(),
            state: Mutex::new(SessionState {
                closed: false,
                last_active: now,
                outbound: Some(tx),
                outbound_rx: Some(rx),
            }),
            closed: Shutdown::new(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    pub fn last_active(&self) -> Instant {
        self.lock_state().last_active
    }

    /// Time since the last inbound envelope
    pub fn idle_for(&self) -> Duration {
        self.last_active().elapsed()
    }

    /// Queue an envelope for the send loop without waiting.
    ///
    /// A full queue is reported as `QueueFull`; the caller decides what to drop.
    pub fn send(&self, envelope: Envelope) -> FleetResult<()> {
        let state = self.lock_state();
        if state.closed {
            return Err(FleetError::Closed);
        }
        let Some(outbound) = &state.outbound else {
            return Err(FleetError::Closed);
        };

        match outbound.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                metrics().queue_full();
                Err(FleetError::QueueFull {
                    capacity: self.capacity,
                })
            }
            Err(TrySendError::Closed(_)) => Err(FleetError::Closed),
        }
    }

    /// Mark the session closed and close its outbound queue.
    ///
    /// Returns `true` only for the call that actually closed it.
    pub fn close(&self) -> bool {
        {
            let mut state = self.lock_state();
            if state.closed {
                return false;
            }
            state.closed = true;
            state.outbound = None;
        }

        self.closed.fire();
        metrics().session_closed(self.created_at.elapsed());
        info!(client_id = %self.client_id, "Session closed");
        true
    }

    fn touch(&self) {
        self.lock_state().last_active = Instant::now();
    }

    /// Drive both loops until the session closes.
    ///
    /// Inbound envelopes go to `inbound` when given. Runs at most once per
    /// session; a second call returns immediately.
    pub async fn run<K, S>(self: Arc<Self>, sink: K, source: S, inbound: Option<mpsc::Sender<Envelope>>)
    where
        K: StreamSink,
        S: StreamSource,
    {
        let Some(outbound_rx) = self.lock_state().outbound_rx.take() else {
            warn!(client_id = %self.client_id, "Session loops already running");
            return;
        };

        tokio::join!(
            self.send_loop(sink, outbound_rx),
            self.receive_loop(source, inbound)
        );
        self.close();
    }

    async fn send_loop<K: StreamSink>(&self, mut sink: K, mut outbound: mpsc::Receiver<Envelope>) {
        let mut closed = self.closed.subscribe();

        while let Some(envelope) = outbound.recv().await {
            if self.is_closed() {
                break;
            }

            let written = tokio::select! {
                _ = closed.wait() => break,
                written = sink.send(envelope) => written,
            };

            if let Err(e) = written {
                warn!(client_id = %self.client_id, error = %e, "Session write failed");
                self.close();
                break;
            }
        }
        debug!(client_id = %self.client_id, "Send loop stopped");
    }

    async fn receive_loop<S: StreamSource>(
        &self,
        mut source: S,
        inbound: Option<mpsc::Sender<Envelope>>,
    ) {
        let mut closed = self.closed.subscribe();

        loop {
            let received = tokio::select! {
                _ = closed.wait() => break,
                received = source.recv() => received,
            };

            match received {
                Ok(Some(envelope)) => {
                    self.touch();
                    metrics().message_received();
                    if let Some(inbound) = &inbound {
                        self.forward(inbound, envelope);
                    }
                }
                Ok(None) => {
                    debug!(client_id = %self.client_id, "Client ended the stream");
                    self.close();
                    break;
                }
                Err(e) => {
                    warn!(client_id = %self.client_id, error = %e, "Session read failed");
                    self.close();
                    break;
                }
            }
        }
        debug!(client_id = %self.client_id, "Receive loop stopped");
    }

    fn forward(&self, inbound: &mpsc::Sender<Envelope>, envelope: Envelope) {
        match inbound.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                metrics().queue_full();
                warn!(client_id = %self.client_id, "Inbound channel is full, dropping envelope");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(client_id = %self.client_id, "Inbound channel closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryNetwork;
    use crate::transport::{Channel, Dialer};

    fn session(capacity: usize) -> Arc<StreamSession> {
        Arc::new(StreamSession::new("agent-1", HashMap::new(), capacity))
    }

    #[test]
    fn test_queue_full_at_capacity_plus_one() {
        let session = session(3);
        for i in 0..3 {
            session.send(Envelope::new("srv", vec![i])).unwrap();
        }

        let err = session.send(Envelope::new("srv", vec![3])).unwrap_err();
        assert!(matches!(err, FleetError::QueueFull { capacity: 3 }));
    }

    #[test]
    fn test_close_is_idempotent() {
        let session = session(1);
        assert!(session.close());
        assert!(!session.close());
        assert!(session.is_closed());
        assert!(matches!(
            session.send(Envelope::new("srv", vec![])),
            Err(FleetError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_close_single_winner() {
        let session = session(4);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let session = session.clone();
            handles.push(tokio::spawn(async move { session.close() }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_run_delivers_in_order_and_tracks_activity() {
        let network = MemoryNetwork::new();
        let channel = network.dialer().dial().await.unwrap();
        let (mut client_sink, mut client_source) = channel.open_stream().await.unwrap();
        let (server_sink, server_source) = network.accept().await.unwrap();

        let session = session(8);
        let (inbound_tx, mut inbound_rx) = mpsc::channel(8);
        let driver = tokio::spawn(session.clone().run(server_sink, server_source, Some(inbound_tx)));

        for i in 0..3u8 {
            session.send(Envelope::new("srv", vec![i])).unwrap();
        }
        for i in 0..3u8 {
            let envelope = client_source.recv().await.unwrap().unwrap();
            assert_eq!(envelope.payload, vec![i]);
        }

        let before = session.last_active();
        tokio::time::sleep(Duration::from_millis(5)).await;
        client_sink.send(Envelope::new("agent-1", vec![7])).await.unwrap();
        assert_eq!(inbound_rx.recv().await.unwrap().payload, vec![7]);
        assert!(session.last_active() > before);

        drop(client_sink);
        tokio::time::timeout(Duration::from_secs(1), driver)
            .await
            .expect("loops should stop at EOF")
            .unwrap();
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_close_stops_loops() {
        let network = MemoryNetwork::new();
        let channel = network.dialer().dial().await.unwrap();
        let (_client_sink, _client_source) = channel.open_stream().await.unwrap();
        let (server_sink, server_source) = network.accept().await.unwrap();

        let session = session(2);
        let driver = tokio::spawn(session.clone().run(server_sink, server_source, None));

        session.close();
        tokio::time::timeout(Duration::from_secs(1), driver)
            .await
            .expect("close should stop both loops")
            .unwrap();
    }
}
