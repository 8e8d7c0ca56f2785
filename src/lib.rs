//! fleetwire - liveness and session layer for fleet telemetry
//!
//! Long-lived bidirectional streams between many agents and a server,
//! plus lease-based service discovery on a coordination store.
//!
//! # Overview
//!
//! - [`transport`]: the reconnecting client with exponential backoff and
//!   jitter, and the TCP and in-memory transports it dials
//! - [`session`]: the server-side registry of live per-client sessions,
//!   keyed by the identifier each client announces first
//! - [`discovery`]: a lease registrar that keeps service records alive and
//!   recovers them when the lease is lost, and a watcher that turns store
//!   changes into event channels
//! - [`observability`]: structured logging, metrics and the health server
//!
//! # Quick Start
//!
//! ```rust
//! use fleetwire::session::{SessionConfig, SessionRegistry};
//! use fleetwire::transport::memory::{self, MemoryNetwork};
//! use fleetwire::transport::{ClientConfig, ReconnectingClient};
//! use fleetwire::runtime::Shutdown;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let network = MemoryNetwork::new();
//! let registry = SessionRegistry::new(SessionConfig::default());
//! let shutdown = Shutdown::new();
//! let _server = memory::serve(&network, registry.clone(), shutdown.subscribe());
//!
//! let config = ClientConfig::new("agent-1", Duration::from_millis(50), 0);
//! let client = ReconnectingClient::new(network.dialer(), config);
//! client.connect().await?;
//! client.send(vec![0x01, 0x02]).await?;
//!
//! client.close();
//! shutdown.fire();
//! # Ok::<(), fleetwire::FleetError>(())
//! # });
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod observability;
pub mod runtime;
pub mod session;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, FleetConfig};
pub use discovery::{CoordinationStore, Event, EventKind, LeaseRegistrar, RegistrarConfig, Watcher};
pub use error::{FleetError, FleetResult};
pub use session::{SessionConfig, SessionRegistry};
pub use transport::{ConnectionState, Envelope, ReconnectingClient};
