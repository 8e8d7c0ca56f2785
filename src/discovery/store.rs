//! Coordination store abstraction
//!
//! The registrar and watcher only need a handful of lease and key-value
//! primitives. Anything that offers them (etcd, the in-process
//! [`MemoryStore`](super::memory::MemoryStore)) can back discovery.

use crate::error::{FleetError, FleetResult};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::mpsc;

/// Store-issued lease identifier
pub type LeaseId = i64;

/// Pending batches a store buffers per watch before it stops delivering
pub const RAW_WATCH_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Put,
    Delete,
}

/// A change to one key, as delivered by a [`Watcher`](super::Watcher)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub key: String,
    /// Empty for deletes
    pub value: Vec<u8>,
}

impl Event {
    /// Value as UTF-8 text, lossily
    pub fn value_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }
}

/// A change as the store reports it, before key decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: EventKind,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl TryFrom<RawEvent> for Event {
    type Error = FleetError;

    fn try_from(raw: RawEvent) -> Result<Self, Self::Error> {
        let key = String::from_utf8(raw.key)
            .map_err(|e| FleetError::store(format!("watch key is not UTF-8: {e}")))?;
        if key.is_empty() {
            return Err(FleetError::store("watch event without a key"));
        }
        Ok(Self {
            kind: raw.kind,
            key,
            value: raw.value,
        })
    }
}

/// One keepalive acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveResponse {
    pub lease_id: LeaseId,
    /// Remaining TTL in seconds after the refresh
    pub ttl: i64,
}

/// What a watch observes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchTarget {
    Key(String),
    Prefix(String),
}

impl WatchTarget {
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Key(exact) => key == exact,
            Self::Prefix(prefix) => key.starts_with(prefix.as_str()),
        }
    }
}

impl fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => write!(f, "key {key}"),
            Self::Prefix(prefix) => write!(f, "prefix {prefix}"),
        }
    }
}

/// Lease and key-value primitives consumed by discovery
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Grant a lease living `ttl_secs` seconds unless kept alive
    async fn grant(&self, ttl_secs: i64) -> FleetResult<LeaseId>;

    /// Start refreshing `lease`.
    ///
    /// The returned channel yields one response per refresh and is closed by
    /// the store once the lease can no longer be kept alive.
    async fn keep_alive(&self, lease: LeaseId) -> FleetResult<mpsc::Receiver<KeepAliveResponse>>;

    /// Remaining TTL in seconds; `-1` once the lease is gone
    async fn time_to_live(&self, lease: LeaseId) -> FleetResult<i64>;

    /// Write `key`, attached to `lease` when given
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> FleetResult<()>;

    async fn get(&self, key: &str) -> FleetResult<Option<Vec<u8>>>;

    async fn get_prefix(&self, prefix: &str) -> FleetResult<BTreeMap<String, Vec<u8>>>;

    /// Stream batches of changes for `target` until the receiver is dropped.
    ///
    /// The channel holds at most [`RAW_WATCH_CAPACITY`] batches. A store may
    /// end a watch whose reader stays that far behind.
    async fn watch(&self, target: WatchTarget) -> FleetResult<mpsc::Receiver<Vec<RawEvent>>>;
}
