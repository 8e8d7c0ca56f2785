//! In-process transport with fault injection
//!
//! A [`MemoryNetwork`] stands in for a server endpoint: clients dial it
//! through [`MemoryDialer`], the server side pulls accepted streams with
//! [`MemoryNetwork::accept`] (or hands them to a registry with [`serve`]).
//! Tests break the network on purpose with [`MemoryNetwork::sever_all`],
//! [`MemoryNetwork::set_refusing`] and the write-failure switches.

use super::{Channel, ConnectionState, Dialer, Envelope, StreamSink, StreamSource};
use crate::error::{FleetError, FleetResult};
use crate::runtime::{spawn_supervised, ShutdownSignal};
use crate::session::SessionRegistry;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Buffered envelopes per direction of a link
const LINK_BUFFER: usize = 64;

type StreamPair = (MemorySink, MemorySource);

/// One stream: both ends share the severed flag
struct Link {
    severed: watch::Sender<bool>,
    channel_state: Option<Arc<Mutex<ConnectionState>>>,
}

impl Link {
    fn sever(&self) -> bool {
        let fired = self.severed.send_if_modified(|severed| {
            let changed = !*severed;
            *severed = true;
            changed
        });
        if let Some(state) = &self.channel_state {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == ConnectionState::Ready {
                *state = ConnectionState::TransientFailure;
            }
        }
        fired
    }
}

struct NetworkInner {
    accept_tx: mpsc::UnboundedSender<StreamPair>,
    accept_rx: AsyncMutex<mpsc::UnboundedReceiver<StreamPair>>,
    links: Mutex<Vec<Weak<Link>>>,
    refusing: AtomicBool,
    fail_client_writes: Arc<AtomicBool>,
    fail_server_writes: Arc<AtomicBool>,
    dials: AtomicUsize,
    streams: AtomicUsize,
}

/// In-process server endpoint
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(NetworkInner {
                accept_tx,
                accept_rx: AsyncMutex::new(accept_rx),
                links: Mutex::new(Vec::new()),
                refusing: AtomicBool::new(false),
                fail_client_writes: Arc::new(AtomicBool::new(false)),
                fail_server_writes: Arc::new(AtomicBool::new(false)),
                dials: AtomicUsize::new(0),
                streams: AtomicUsize::new(0),
            }),
        }
    }

    pub fn dialer(&self) -> MemoryDialer {
        MemoryDialer {
            network: self.clone(),
        }
    }

    /// Next stream opened by a client, server end
    pub async fn accept(&self) -> Option<StreamPair> {
        self.inner.accept_rx.lock().await.recv().await
    }

    /// Kill every live stream; both ends see a transport failure.
    ///
    /// Returns how many streams were severed.
    pub fn sever_all(&self) -> usize {
        let links: Vec<Arc<Link>> = {
            let mut links = self
                .inner
                .links
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let live: Vec<Arc<Link>> = links.iter().filter_map(Weak::upgrade).collect();
            links.clear();
            live
        };

        let severed = links.iter().filter(|link| link.sever()).count();
        debug!(severed, "Severed memory links");
        severed
    }

    /// Refuse new dials and streams while set
    pub fn set_refusing(&self, refusing: bool) {
        self.inner.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Make writes from client ends fail while set
    pub fn fail_client_writes(&self, fail: bool) {
        self.inner.fail_client_writes.store(fail, Ordering::SeqCst);
    }

    /// Make writes from server ends fail while set
    pub fn fail_server_writes(&self, fail: bool) {
        self.inner.fail_server_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of `dial()` calls so far, refused ones included
    pub fn dial_count(&self) -> usize {
        self.inner.dials.load(Ordering::SeqCst)
    }

    /// Number of streams successfully opened
    pub fn stream_count(&self) -> usize {
        self.inner.streams.load(Ordering::SeqCst)
    }

    fn open(&self, channel_state: Arc<Mutex<ConnectionState>>) -> FleetResult<StreamPair> {
        if self.inner.refusing.load(Ordering::SeqCst) {
            return Err(FleetError::transport_failure("connection refused"));
        }

        let (severed, _) = watch::channel(false);
        let link = Arc::new(Link {
            severed,
            channel_state: Some(channel_state),
        });
        let (to_server, from_client) = mpsc::channel(LINK_BUFFER);
        let (to_client, from_server) = mpsc::channel(LINK_BUFFER);

        let client_end = (
            MemorySink {
                tx: to_server,
                link: link.clone(),
                fail_writes: self.inner.fail_client_writes.clone(),
            },
            MemorySource {
                rx: from_server,
                severed: link.severed.subscribe(),
            },
        );
        let server_end = (
            MemorySink {
                tx: to_client,
                link: link.clone(),
                fail_writes: self.inner.fail_server_writes.clone(),
            },
            MemorySource {
                rx: from_client,
                severed: link.severed.subscribe(),
            },
        );

        {
            let mut links = self
                .inner
                .links
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            links.retain(|link| link.strong_count() > 0);
            links.push(Arc::downgrade(&link));
        }

        self.inner
            .accept_tx
            .send(server_end)
            .map_err(|_| FleetError::transport_failure("network is gone"))?;
        self.inner.streams.fetch_add(1, Ordering::SeqCst);
        Ok(client_end)
    }
}

/// Dials a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryDialer {
    network: MemoryNetwork,
}

#[async_trait]
impl Dialer for MemoryDialer {
    type Channel = MemoryChannel;

    async fn dial(&self) -> FleetResult<MemoryChannel> {
        self.network.inner.dials.fetch_add(1, Ordering::SeqCst);
        if self.network.inner.refusing.load(Ordering::SeqCst) {
            return Err(FleetError::transport_failure("connection refused"));
        }
        Ok(MemoryChannel {
            network: self.network.clone(),
            state: Arc::new(Mutex::new(ConnectionState::Idle)),
            current: Mutex::new(None),
        })
    }
}

/// Client-side channel on a [`MemoryNetwork`]
pub struct MemoryChannel {
    network: MemoryNetwork,
    state: Arc<Mutex<ConnectionState>>,
    current: Mutex<Option<Arc<Link>>>,
}

impl MemoryChannel {
    fn set_state(&self, next: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    type Sink = MemorySink;
    type Source = MemorySource;

    async fn open_stream(&self) -> FleetResult<StreamPair> {
        if self.state() == ConnectionState::Shutdown {
            return Err(FleetError::transport_failure("channel is shut down"));
        }
        self.set_state(ConnectionState::Connecting);

        match self.network.open(self.state.clone()) {
            Ok((sink, source)) => {
                let previous = self
                    .current
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .replace(sink.link.clone());
                if let Some(previous) = previous {
                    previous.sever();
                }
                self.set_state(ConnectionState::Ready);
                Ok((sink, source))
            }
            Err(e) => {
                self.set_state(ConnectionState::TransientFailure);
                Err(e)
            }
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        self.set_state(ConnectionState::Shutdown);
        let current = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(link) = current {
            link.sever();
        }
    }
}

/// Write end of a memory stream
pub struct MemorySink {
    tx: mpsc::Sender<Envelope>,
    link: Arc<Link>,
    fail_writes: Arc<AtomicBool>,
}

#[async_trait]
impl StreamSink for MemorySink {
    async fn send(&mut self, envelope: Envelope) -> FleetResult<()> {
        if *self.link.severed.borrow() {
            return Err(FleetError::transport_failure("link severed"));
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(FleetError::transport_failure("injected write failure"));
        }
        self.tx
            .send(envelope)
            .await
            .map_err(|_| FleetError::transport_failure("peer closed the stream"))
    }
}

/// Read end of a memory stream
pub struct MemorySource {
    rx: mpsc::Receiver<Envelope>,
    severed: watch::Receiver<bool>,
}

#[async_trait]
impl StreamSource for MemorySource {
    async fn recv(&mut self) -> FleetResult<Option<Envelope>> {
        loop {
            if *self.severed.borrow_and_update() {
                return Err(FleetError::transport_failure("link severed"));
            }
            tokio::select! {
                changed = self.severed.changed() => {
                    if changed.is_err() {
                        // Link dropped; the peer's sender closing ends the stream.
                        return Ok(self.rx.recv().await);
                    }
                }
                envelope = self.rx.recv() => return Ok(envelope),
            }
        }
    }
}

/// Hand every stream accepted on `network` to `registry` until `shutdown` fires
pub fn serve(
    network: &MemoryNetwork,
    registry: SessionRegistry,
    mut shutdown: ShutdownSignal,
) -> JoinHandle<()> {
    let network = network.clone();
    spawn_supervised("memory-accept-loop", async move {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.wait() => break,
                accepted = network.accept() => accepted,
            };
            let Some((sink, source)) = accepted else {
                break;
            };

            let registry = registry.clone();
            spawn_supervised("memory-accept", async move {
                if let Err(e) = registry.accept(sink, source).await {
                    warn!(error = %e, "Rejected memory stream");
                }
            });
        }
        debug!("Memory accept loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_carries_envelopes_both_ways() {
        let network = MemoryNetwork::new();
        let channel = network.dialer().dial().await.unwrap();
        assert_eq!(channel.state(), ConnectionState::Idle);

        let (mut client_sink, mut client_source) = channel.open_stream().await.unwrap();
        assert_eq!(channel.state(), ConnectionState::Ready);
        let (mut server_sink, mut server_source) = network.accept().await.unwrap();

        client_sink.send(Envelope::new("a", vec![1])).await.unwrap();
        assert_eq!(server_source.recv().await.unwrap().unwrap().payload, vec![1]);

        server_sink.send(Envelope::new("s", vec![2])).await.unwrap();
        assert_eq!(client_source.recv().await.unwrap().unwrap().payload, vec![2]);
    }

    #[tokio::test]
    async fn test_sever_fails_both_ends() {
        let network = MemoryNetwork::new();
        let channel = network.dialer().dial().await.unwrap();
        let (mut client_sink, mut client_source) = channel.open_stream().await.unwrap();
        let (_server_sink, mut server_source) = network.accept().await.unwrap();

        assert_eq!(network.sever_all(), 1);

        assert_eq!(channel.state(), ConnectionState::TransientFailure);
        assert!(client_sink.send(Envelope::new("a", vec![])).await.is_err());
        assert!(client_source.recv().await.is_err());
        assert!(server_source.recv().await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_sink_is_eof() {
        let network = MemoryNetwork::new();
        let channel = network.dialer().dial().await.unwrap();
        let (client_sink, _client_source) = channel.open_stream().await.unwrap();
        let (_server_sink, mut server_source) = network.accept().await.unwrap();

        drop(client_sink);
        assert!(server_source.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_refusing_network() {
        let network = MemoryNetwork::new();
        network.set_refusing(true);

        assert!(network.dialer().dial().await.is_err());
        assert_eq!(network.dial_count(), 1);

        network.set_refusing(false);
        assert!(network.dialer().dial().await.is_ok());
        assert_eq!(network.dial_count(), 2);
    }

    #[tokio::test]
    async fn test_injected_write_failure_keeps_link() {
        let network = MemoryNetwork::new();
        let channel = network.dialer().dial().await.unwrap();
        let (mut client_sink, _client_source) = channel.open_stream().await.unwrap();

        network.fail_client_writes(true);
        assert!(client_sink.send(Envelope::new("a", vec![])).await.is_err());
        assert_eq!(channel.state(), ConnectionState::Ready);

        network.fail_client_writes(false);
        assert!(client_sink.send(Envelope::new("a", vec![])).await.is_ok());
    }

    #[tokio::test]
    async fn test_close_shuts_channel_down() {
        let network = MemoryNetwork::new();
        let channel = network.dialer().dial().await.unwrap();
        let (_sink, mut source) = channel.open_stream().await.unwrap();

        channel.close();
        assert_eq!(channel.state(), ConnectionState::Shutdown);
        assert!(source.recv().await.is_err());
        assert!(channel.open_stream().await.is_err());
    }
}
