//! Transport layer for agent-to-server streams
//!
//! This module defines the capability set a transport must provide
//! ([`Dialer`] -> [`Channel`] -> [`StreamSink`]/[`StreamSource`]) and the
//! pieces built on top of it: the backoff policy, the reconnecting client
//! and the concrete TCP and in-memory transports.
//!
//! # Usage
//!
//! ```rust,no_run
//! use fleetwire::transport::client::{ClientConfig, ReconnectingClient};
//! use fleetwire::transport::tcp::{TcpDialer, TransportOptions};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let dialer = TcpDialer::new("tcp://127.0.0.1:7070", TransportOptions::default())?;
//! let config = ClientConfig::new("agent-1", Duration::from_secs(1), 0);
//! let client = ReconnectingClient::new(dialer, config);
//!
//! client.connect().await?;
//! client.send(vec![0x01, 0x02]).await?;
//! client.close();
//! # Ok::<(), fleetwire::FleetError>(())
//! # });
//! ```

use crate::error::FleetResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod backoff;
pub mod client;
pub mod health_monitor;
pub mod memory;
pub mod tcp;

// Re-export public types for convenience
pub use backoff::BackoffPolicy;
pub use client::{ClientConfig, ReconnectingClient};
pub use health_monitor::{ConnectionQuality, HealthMetrics, HealthMonitor, ReconnectionDecision};

/// Observed state of a transport channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Created but no stream has been opened yet
    Idle,
    /// A stream is being opened
    Connecting,
    /// Stream established and usable
    Ready,
    /// The link failed; a new stream has to be opened
    TransientFailure,
    /// Closed on purpose, never usable again
    Shutdown,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::TransientFailure => "transient_failure",
            ConnectionState::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message on a stream: an opaque payload keyed by the client identifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new<S: Into<String>>(client_id: S, payload: Vec<u8>) -> Self {
        Self {
            client_id: client_id.into(),
            headers: HashMap::new(),
            payload,
        }
    }

    /// First message of every stream: announces the identifier and metadata
    pub fn handshake<S: Into<String>>(client_id: S, headers: HashMap<String, String>) -> Self {
        Self {
            client_id: client_id.into(),
            headers,
            payload: Vec::new(),
        }
    }
}

/// Write half of an open stream
#[async_trait]
pub trait StreamSink: Send + 'static {
    async fn send(&mut self, envelope: Envelope) -> FleetResult<()>;
}

/// Read half of an open stream
#[async_trait]
pub trait StreamSource: Send + 'static {
    /// Next envelope; `Ok(None)` means the peer ended the stream cleanly.
    async fn recv(&mut self) -> FleetResult<Option<Envelope>>;
}

/// A transport connection that can carry streams
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    type Sink: StreamSink;
    type Source: StreamSource;

    async fn open_stream(&self) -> FleetResult<(Self::Sink, Self::Source)>;

    /// Last observed state. Must not block.
    fn state(&self) -> ConnectionState;

    fn close(&self);
}

/// Creates channels to one server endpoint
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Channel: Channel;

    async fn dial(&self) -> FleetResult<Self::Channel>;
}
