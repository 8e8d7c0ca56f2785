//! TCP transport: one JSON frame per line
//!
//! Frames are `{"type":"message", ...envelope}` or `{"type":"ping"}`. Each
//! open stream runs a ping task; a ping that fails or exceeds the ping
//! timeout marks the link failed, which fails pending reads and moves the
//! owning channel to `TransientFailure`.

use super::{Channel, ConnectionState, Dialer, Envelope, StreamSink, StreamSource};
use crate::error::{FleetError, FleetResult};
use crate::runtime::{spawn_supervised, ShutdownSignal};
use crate::session::SessionRegistry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};
use url::Url;

/// Transport-level knobs; this layer sets them but does not reinterpret them
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Interval between pings on an open stream; zero disables pings
    pub keepalive_ping: Duration,
    pub ping_timeout: Duration,
    /// Largest encoded frame accepted in either direction, newline excluded
    pub max_message_bytes: usize,
    pub connect_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            keepalive_ping: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(3),
            max_message_bytes: 4 * 1024 * 1024,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Frame {
    Message(Envelope),
    Ping,
}

/// Serialize `frame` as one newline-terminated line
fn encode_frame(frame: &Frame, max_message_bytes: usize) -> FleetResult<Vec<u8>> {
    let mut bytes = serde_json::to_vec(frame)?;
    if bytes.len() > max_message_bytes {
        return Err(FleetError::invalid_parameter(format!(
            "frame of {} bytes exceeds max_message_bytes {}",
            bytes.len(),
            max_message_bytes
        )));
    }
    bytes.push(b'\n');
    Ok(bytes)
}

/// Read one frame, appending to `buf` so a cancelled read loses nothing.
///
/// `Ok(None)` is a clean EOF between frames.
async fn read_frame(
    reader: &mut BufReader<OwnedReadHalf>,
    buf: &mut Vec<u8>,
    max_message_bytes: usize,
) -> FleetResult<Option<Frame>> {
    let remaining = (max_message_bytes + 1).saturating_sub(buf.len()) as u64;
    let read = (&mut *reader).take(remaining).read_until(b'\n', buf).await?;

    if buf.last() == Some(&b'\n') {
        buf.pop();
        let frame = serde_json::from_slice(buf);
        buf.clear();
        return frame
            .map(Some)
            .map_err(|e| FleetError::transport_failure(format!("malformed frame: {e}")));
    }

    if buf.len() > max_message_bytes {
        return Err(FleetError::transport_failure(format!(
            "inbound frame exceeds max_message_bytes {max_message_bytes}"
        )));
    }
    if read == 0 && buf.is_empty() {
        return Ok(None);
    }
    Err(FleetError::transport_failure("stream ended mid-frame"))
}

async fn write_bytes(writer: &AsyncMutex<OwnedWriteHalf>, bytes: &[u8]) -> std::io::Result<()> {
    let mut writer = writer.lock().await;
    writer.write_all(bytes).await?;
    writer.flush().await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkStatus {
    Open,
    /// Our own sink was dropped; reads may continue
    Stopped,
    Failed,
}

/// Health of one TCP stream, shared by its sink, source and ping task
struct Link {
    status: watch::Sender<LinkStatus>,
    channel_state: Option<Arc<watch::Sender<ConnectionState>>>,
}

impl Link {
    fn new(channel_state: Option<Arc<watch::Sender<ConnectionState>>>) -> Arc<Self> {
        let (status, _) = watch::channel(LinkStatus::Open);
        Arc::new(Self {
            status,
            channel_state,
        })
    }

    fn fail(&self, reason: &str) {
        let failed = self.status.send_if_modified(|status| {
            if *status == LinkStatus::Failed {
                false
            } else {
                *status = LinkStatus::Failed;
                true
            }
        });
        if !failed {
            return;
        }
        if let Some(state) = &self.channel_state {
            state.send_if_modified(|state| {
                if *state == ConnectionState::Ready {
                    *state = ConnectionState::TransientFailure;
                    true
                } else {
                    false
                }
            });
        }
        debug!(reason, "TCP link failed");
    }

    fn stop(&self) {
        self.status.send_if_modified(|status| {
            if *status == LinkStatus::Open {
                *status = LinkStatus::Stopped;
                true
            } else {
                false
            }
        });
    }

    fn is_failed(&self) -> bool {
        *self.status.borrow() == LinkStatus::Failed
    }
}

/// Split `stream` into a sink/source pair and start its ping task
fn split_stream(
    stream: TcpStream,
    options: &TransportOptions,
    channel_state: Option<Arc<watch::Sender<ConnectionState>>>,
) -> (TcpSink, TcpSource) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Failed to set TCP_NODELAY");
    }

    let (reader, writer) = stream.into_split();
    let writer = Arc::new(AsyncMutex::new(writer));
    let link = Link::new(channel_state);

    if !options.keepalive_ping.is_zero() {
        spawn_supervised(
            "tcp-ping",
            ping_loop(link.clone(), writer.clone(), options.clone()),
        );
    }

    let source = TcpSource {
        reader: BufReader::new(reader),
        buf: Vec::new(),
        status: link.status.subscribe(),
        link: link.clone(),
        max_message_bytes: options.max_message_bytes,
    };
    let sink = TcpSink {
        writer,
        link,
        max_message_bytes: options.max_message_bytes,
    };
    (sink, source)
}

async fn ping_loop(link: Arc<Link>, writer: Arc<AsyncMutex<OwnedWriteHalf>>, options: TransportOptions) {
    let ping = match encode_frame(&Frame::Ping, usize::MAX) {
        Ok(ping) => ping,
        Err(e) => {
            warn!(error = %e, "Could not encode ping frame");
            return;
        }
    };

    let mut status = link.status.subscribe();
    let mut ticker = tokio::time::interval(options.keepalive_ping);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() || *status.borrow() != LinkStatus::Open {
                    return;
                }
            }
            _ = ticker.tick() => {
                match tokio::time::timeout(options.ping_timeout, write_bytes(&writer, &ping)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        link.fail(&format!("ping failed: {e}"));
                        return;
                    }
                    Err(_) => {
                        link.fail("ping timed out");
                        return;
                    }
                }
            }
        }
    }
}

/// Write half of a TCP stream
pub struct TcpSink {
    writer: Arc<AsyncMutex<OwnedWriteHalf>>,
    link: Arc<Link>,
    max_message_bytes: usize,
}

impl Drop for TcpSink {
    fn drop(&mut self) {
        self.link.stop();
    }
}

#[async_trait]
impl StreamSink for TcpSink {
    async fn send(&mut self, envelope: Envelope) -> FleetResult<()> {
        let bytes = encode_frame(&Frame::Message(envelope), self.max_message_bytes)?;
        if self.link.is_failed() {
            return Err(FleetError::transport_failure("link failed"));
        }

        if let Err(e) = write_bytes(&self.writer, &bytes).await {
            self.link.fail(&format!("write failed: {e}"));
            return Err(FleetError::transport_failure(format!("write failed: {e}")));
        }
        Ok(())
    }
}

/// Read half of a TCP stream
pub struct TcpSource {
    reader: BufReader<OwnedReadHalf>,
    buf: Vec<u8>,
    status: watch::Receiver<LinkStatus>,
    link: Arc<Link>,
    max_message_bytes: usize,
}

#[async_trait]
impl StreamSource for TcpSource {
    async fn recv(&mut self) -> FleetResult<Option<Envelope>> {
        loop {
            if *self.status.borrow_and_update() == LinkStatus::Failed {
                return Err(FleetError::transport_failure("link failed"));
            }

            let frame = tokio::select! {
                _ = self.status.changed() => continue,
                frame = read_frame(&mut self.reader, &mut self.buf, self.max_message_bytes) => frame,
            };

            match frame {
                Ok(Some(Frame::Message(envelope))) => return Ok(Some(envelope)),
                Ok(Some(Frame::Ping)) => continue,
                Ok(None) => return Ok(None),
                Err(e) => {
                    self.link.fail(&e.to_string());
                    return Err(e);
                }
            }
        }
    }
}

/// Server-side stream pair for an accepted connection
pub fn accept_stream(stream: TcpStream, options: &TransportOptions) -> (TcpSink, TcpSource) {
    split_stream(stream, options, None)
}

/// Normalize `tcp://host:port` or `host:port` into a connectable `host:port`
pub fn parse_address(address: &str) -> FleetResult<String> {
    let with_scheme = if address.contains("://") {
        address.to_string()
    } else {
        format!("tcp://{address}")
    };

    let url = Url::parse(&with_scheme)
        .map_err(|e| FleetError::invalid_parameter(format!("invalid address {address}: {e}")))?;
    if url.scheme() != "tcp" {
        return Err(FleetError::invalid_parameter(format!(
            "unsupported scheme {} in {address}",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| FleetError::invalid_parameter(format!("missing host in {address}")))?;
    let port = url
        .port()
        .ok_or_else(|| FleetError::invalid_parameter(format!("missing port in {address}")))?;

    Ok(format!("{host}:{port}"))
}

/// Dials a TCP server endpoint
#[derive(Debug, Clone)]
pub struct TcpDialer {
    address: String,
    options: TransportOptions,
}

impl TcpDialer {
    pub fn new(address: &str, options: TransportOptions) -> FleetResult<Self> {
        Ok(Self {
            address: parse_address(address)?,
            options,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    type Channel = TcpChannel;

    /// Lazy: nothing is connected until the first `open_stream()`
    async fn dial(&self) -> FleetResult<TcpChannel> {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Ok(TcpChannel {
            address: self.address.clone(),
            options: self.options.clone(),
            state: Arc::new(state),
            current: Mutex::new(None),
        })
    }
}

/// Client-side TCP channel; each stream is its own connection
pub struct TcpChannel {
    address: String,
    options: TransportOptions,
    state: Arc<watch::Sender<ConnectionState>>,
    current: Mutex<Option<Arc<Link>>>,
}

#[async_trait]
impl Channel for TcpChannel {
    type Sink = TcpSink;
    type Source = TcpSource;

    async fn open_stream(&self) -> FleetResult<(TcpSink, TcpSource)> {
        if self.state() == ConnectionState::Shutdown {
            return Err(FleetError::transport_failure("channel is shut down"));
        }
        self.state.send_replace(ConnectionState::Connecting);

        let connected =
            tokio::time::timeout(self.options.connect_timeout, TcpStream::connect(&self.address))
                .await;
        let stream = match connected {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.state.send_replace(ConnectionState::TransientFailure);
                return Err(FleetError::transport_failure(format!(
                    "connect to {} failed: {e}",
                    self.address
                )));
            }
            Err(_) => {
                self.state.send_replace(ConnectionState::TransientFailure);
                return Err(FleetError::transport_failure(format!(
                    "connect to {} timed out",
                    self.address
                )));
            }
        };

        let (sink, source) = split_stream(stream, &self.options, Some(self.state.clone()));
        let previous = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(sink.link.clone());
        if let Some(previous) = previous {
            previous.fail("superseded by a new stream");
        }

        // close() may have run while connecting
        let opened = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Shutdown {
                false
            } else {
                *state = ConnectionState::Ready;
                true
            }
        });
        if !opened {
            sink.link.fail("channel closed while connecting");
            return Err(FleetError::transport_failure("channel is shut down"));
        }

        debug!(address = %self.address, "TCP stream opened");
        Ok((sink, source))
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn close(&self) {
        self.state.send_replace(ConnectionState::Shutdown);
        let current = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(link) = current {
            link.fail("channel closed");
        }
    }
}

/// Accept connections on `listener` and hand each to `registry` until `shutdown` fires
pub async fn serve(
    listener: TcpListener,
    registry: SessionRegistry,
    options: TransportOptions,
    mut shutdown: ShutdownSignal,
) -> FleetResult<()> {
    let local = listener.local_addr()?;
    info!(address = %local, "Accepting agent streams");

    loop {
        let accepted = tokio::select! {
            _ = shutdown.wait() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let (sink, source) = accept_stream(stream, &options);
                let registry = registry.clone();
                spawn_supervised("tcp-accept", async move {
                    match registry.accept(sink, source).await {
                        Ok(session) => {
                            debug!(peer = %peer, client_id = %session.client_id(), "Accepted stream")
                        }
                        Err(e) => warn!(peer = %peer, error = %e, "Rejected stream"),
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }

    info!(address = %local, "Stopped accepting agent streams");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> TransportOptions {
        TransportOptions {
            keepalive_ping: Duration::from_millis(20),
            ping_timeout: Duration::from_millis(200),
            max_message_bytes: 1024,
            connect_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("tcp://127.0.0.1:7070").unwrap(), "127.0.0.1:7070");
        assert_eq!(parse_address("localhost:9000").unwrap(), "localhost:9000");
        assert_eq!(parse_address("tcp://[::1]:7070").unwrap(), "[::1]:7070");

        assert!(parse_address("http://127.0.0.1:80").is_err());
        assert!(parse_address("tcp://127.0.0.1").is_err());
        assert!(parse_address("not an address").is_err());
    }

    #[test]
    fn test_frame_wire_format() {
        let bytes = encode_frame(&Frame::Message(Envelope::new("a", vec![1, 2])), 1024).unwrap();
        let line = std::str::from_utf8(&bytes).unwrap();
        assert!(line.ends_with('\n'));
        assert!(line.starts_with(r#"{"type":"message""#));

        let ping = encode_frame(&Frame::Ping, 1024).unwrap();
        assert_eq!(ping, b"{\"type\":\"ping\"}\n");
    }

    #[test]
    fn test_oversized_frame_rejected_on_encode() {
        let envelope = Envelope::new("a", vec![0u8; 2048]);
        let err = encode_frame(&Frame::Message(envelope), 1024).unwrap_err();
        assert!(matches!(err, FleetError::InvalidParameter { .. }));
    }

    #[tokio::test]
    async fn test_dial_is_lazy() {
        let dialer = TcpDialer::new("127.0.0.1:1", options()).unwrap();
        let channel = dialer.dial().await.unwrap();
        assert_eq!(channel.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_connect_refused_is_transient_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let dialer = TcpDialer::new(&address.to_string(), options()).unwrap();
        let channel = dialer.dial().await.unwrap();
        let err = channel.open_stream().await.err().unwrap();
        assert!(err.is_transport());
        assert_eq!(channel.state(), ConnectionState::TransientFailure);
    }

    #[tokio::test]
    async fn test_stream_roundtrip_skips_pings() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut sink, mut source) = accept_stream(stream, &options());
            let envelope = source.recv().await.unwrap().unwrap();
            sink.send(Envelope::new("server", envelope.payload)).await.unwrap();
            // Outlive a few ping intervals so the client sees pings first.
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let channel = TcpDialer::new(&address, options()).unwrap().dial().await.unwrap();
        let (mut sink, mut source) = channel.open_stream().await.unwrap();
        assert_eq!(channel.state(), ConnectionState::Ready);

        sink.send(Envelope::new("agent-1", vec![0x01, 0x02])).await.unwrap();
        let echoed = source.recv().await.unwrap().unwrap();
        assert_eq!(echoed.payload, vec![0x01, 0x02]);

        server.await.unwrap();
        // Clean EOF or a reset, depending on whether our pings were still unread.
        assert!(!matches!(source.recv().await, Ok(Some(_))));
    }

    #[tokio::test]
    async fn test_oversized_send_keeps_stream_usable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (_sink, mut source) = accept_stream(stream, &options());
            source.recv().await.unwrap().unwrap()
        });

        let channel = TcpDialer::new(&address, options()).unwrap().dial().await.unwrap();
        let (mut sink, _source) = channel.open_stream().await.unwrap();

        let too_big = sink.send(Envelope::new("agent-1", vec![0u8; 4096])).await;
        assert!(matches!(too_big, Err(FleetError::InvalidParameter { .. })));

        sink.send(Envelope::new("agent-1", vec![7])).await.unwrap();
        assert_eq!(server.await.unwrap().payload, vec![7]);
    }

    #[tokio::test]
    async fn test_close_fails_pending_read() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _pair = accept_stream(stream, &options());
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let channel = Arc::new(TcpDialer::new(&address, options()).unwrap().dial().await.unwrap());
        let (_sink, mut source) = channel.open_stream().await.unwrap();

        let closer = channel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.close();
        });

        let result = tokio::time::timeout(Duration::from_secs(1), source.recv())
            .await
            .expect("close should wake the reader");
        assert!(result.is_err());
        assert_eq!(channel.state(), ConnectionState::Shutdown);
    }
}
