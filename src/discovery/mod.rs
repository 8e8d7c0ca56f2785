//! Service discovery over a coordination store
//!
//! Long-running servers announce themselves with a [`LeaseRegistrar`]:
//! their liveness key lives exactly as long as the lease behind it, and the
//! registrar re-grants and republishes when the lease is lost. Consumers
//! follow those keys through a [`Watcher`].
//!
//! ```rust
//! use fleetwire::discovery::{LeaseRegistrar, MemoryStore, RegistrarConfig, Watcher};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let store = Arc::new(MemoryStore::new());
//! let registrar = LeaseRegistrar::new(
//!     store.clone(),
//!     RegistrarConfig::new("/fleetwire/registry", "collector", "node-1"),
//! );
//! registrar.set_service("{\"addr\":\"10.0.0.7:7070\"}").await?;
//!
//! let watcher = Watcher::new(store);
//! let live = watcher.get_prefix("/fleetwire/registry/collector").await?;
//! assert_eq!(live.len(), 1);
//!
//! watcher.close().await;
//! registrar.close().await;
//! # Ok::<(), fleetwire::FleetError>(())
//! # });
//! ```

#[cfg(feature = "etcd")]
pub mod etcd;
pub mod memory;
pub mod registrar;
pub mod store;
pub mod watcher;

#[cfg(feature = "etcd")]
pub use etcd::{EtcdOptions, EtcdStore};
pub use memory::MemoryStore;
pub use registrar::{LeaseRegistrar, RegistrarConfig, RegistrarState, MIN_TTL_SECS};
pub use store::{
    CoordinationStore, Event, EventKind, KeepAliveResponse, LeaseId, RawEvent, WatchTarget,
    RAW_WATCH_CAPACITY,
};
pub use watcher::{Watcher, DEFAULT_EVENT_CAPACITY};
