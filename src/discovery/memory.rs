//! In-process coordination store
//!
//! Behaves like a single-node lease store: leases expire unless refreshed,
//! keys attached to a lease vanish with it (emitting delete events), and
//! watches see every change in commit order. Fault hooks let tests revoke
//! leases, make the store unreachable or skew reported TTLs.

use super::store::{
    CoordinationStore, EventKind, KeepAliveResponse, LeaseId, RawEvent, WatchTarget,
    RAW_WATCH_CAPACITY,
};
use crate::error::{FleetError, FleetResult};
use crate::runtime::spawn_supervised;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace, warn};

const SWEEP_INTERVAL: Duration = Duration::from_millis(50);
const KEEPALIVE_BUFFER: usize = 16;

struct LeaseEntry {
    ttl: i64,
    expires_at: Instant,
    /// Dropped with the entry, which closes every keepalive channel
    keepalives: Vec<mpsc::Sender<KeepAliveResponse>>,
}

struct Entry {
    value: Vec<u8>,
    lease: Option<LeaseId>,
}

struct WatchEntry {
    target: WatchTarget,
    tx: mpsc::Sender<Vec<RawEvent>>,
}

#[derive(Default)]
struct StoreState {
    next_lease: LeaseId,
    leases: HashMap<LeaseId, LeaseEntry>,
    kv: BTreeMap<String, Entry>,
    watches: Vec<WatchEntry>,
    ttl_skew: i64,
}

impl StoreState {
    fn emit(&mut self, events: &[RawEvent]) {
        if events.is_empty() {
            return;
        }
        self.watches.retain(|watch| {
            let matching: Vec<RawEvent> = events
                .iter()
                .filter(|event| {
                    std::str::from_utf8(&event.key).map_or(true, |key| watch.target.matches(key))
                })
                .cloned()
                .collect();
            if matching.is_empty() {
                return !watch.tx.is_closed();
            }
            match watch.tx.try_send(matching) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    // Emitted under the store lock, so a stalled reader loses its watch
                    warn!(target = %watch.target, "Watch reader fell behind, cancelling watch");
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }

    fn remove_lease(&mut self, lease: LeaseId) -> bool {
        if self.leases.remove(&lease).is_none() {
            return false;
        }
        let doomed: Vec<String> = self
            .kv
            .iter()
            .filter(|(_, entry)| entry.lease == Some(lease))
            .map(|(key, _)| key.clone())
            .collect();

        let mut events = Vec::with_capacity(doomed.len());
        for key in doomed {
            self.kv.remove(&key);
            events.push(RawEvent {
                kind: EventKind::Delete,
                key: key.into_bytes(),
                value: Vec::new(),
            });
        }
        self.emit(&events);
        true
    }

    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for lease in expired {
            debug!(lease_id = lease, "Lease expired");
            self.remove_lease(lease);
        }
    }
}

#[derive(Default)]
struct StoreInner {
    state: Mutex<StoreState>,
    unavailable: AtomicBool,
    grants: AtomicU64,
    sweeper_started: AtomicBool,
}

impl StoreInner {
    fn lock(&self) -> MutexGuard<'_, StoreState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.purge_expired(Instant::now());
        state
    }
}

/// Shared in-process store; clones see the same data
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("grants", &self.grant_count())
            .field("unavailable", &self.inner.unavailable.load(Ordering::SeqCst))
            .finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_available(&self) -> FleetResult<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(FleetError::store("store unavailable"));
        }
        Ok(())
    }

    fn ensure_sweeper(&self) {
        if self.inner.sweeper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        spawn_supervised("memory-store-sweeper", async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                drop(inner.lock());
            }
        });
    }

    /// Revoke `lease` as the server would, deleting its keys and closing
    /// its keepalive channels. Returns `false` if it did not exist.
    pub fn revoke(&self, lease: LeaseId) -> bool {
        let revoked = self.inner.lock().remove_lease(lease);
        if revoked {
            debug!(lease_id = lease, "Lease revoked");
        }
        revoked
    }

    /// While unavailable every operation fails and no lease is refreshed
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Seconds added to every reported TTL
    pub fn set_ttl_skew(&self, secs: i64) {
        self.inner.lock().ttl_skew = secs;
    }

    /// Number of successful grants since creation
    pub fn grant_count(&self) -> u64 {
        self.inner.grants.load(Ordering::SeqCst)
    }

    /// Live leases, sorted
    pub fn lease_ids(&self) -> Vec<LeaseId> {
        let mut ids: Vec<LeaseId> = self.inner.lock().leases.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Lease a key is attached to, if any
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        self.inner.lock().kv.get(key).and_then(|entry| entry.lease)
    }

    /// Delete `key` directly. Returns whether it existed.
    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.inner.lock();
        if state.kv.remove(key).is_none() {
            return false;
        }
        state.emit(&[RawEvent {
            kind: EventKind::Delete,
            key: key.as_bytes().to_vec(),
            value: Vec::new(),
        }]);
        true
    }

    async fn refresh_loop(weak: Weak<StoreInner>, lease: LeaseId, ttl: i64, every: Duration) {
        let lifetime = Duration::from_secs(u64::try_from(ttl).unwrap_or(1));
        loop {
            tokio::time::sleep(every).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.unavailable.load(Ordering::SeqCst) {
                continue;
            }

            let mut state = inner.lock();
            let Some(entry) = state.leases.get_mut(&lease) else {
                return;
            };
            entry.keepalives.retain(|tx| !tx.is_closed());
            if entry.keepalives.is_empty() {
                return;
            }
            entry.expires_at = Instant::now() + lifetime;
            for tx in &entry.keepalives {
                let _ = tx.try_send(KeepAliveResponse {
                    lease_id: lease,
                    ttl: entry.ttl,
                });
            }
            trace!(lease_id = lease, "Lease refreshed");
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn grant(&self, ttl_secs: i64) -> FleetResult<LeaseId> {
        self.check_available()?;
        if ttl_secs <= 0 {
            return Err(FleetError::invalid_parameter(format!(
                "lease TTL must be positive, got {ttl_secs}"
            )));
        }
        self.ensure_sweeper();

        let mut state = self.inner.lock();
        state.next_lease += 1;
        let lease = state.next_lease;
        state.leases.insert(
            lease,
            LeaseEntry {
                ttl: ttl_secs,
                expires_at: Instant::now() + Duration::from_secs(ttl_secs.unsigned_abs()),
                keepalives: Vec::new(),
            },
        );
        drop(state);

        self.inner.grants.fetch_add(1, Ordering::SeqCst);
        debug!(lease_id = lease, ttl = ttl_secs, "Lease granted");
        Ok(lease)
    }

    async fn keep_alive(&self, lease: LeaseId) -> FleetResult<mpsc::Receiver<KeepAliveResponse>> {
        self.check_available()?;
        let (tx, rx) = mpsc::channel(KEEPALIVE_BUFFER);

        let ttl = {
            let mut state = self.inner.lock();
            let entry = state
                .leases
                .get_mut(&lease)
                .ok_or_else(|| FleetError::store(format!("lease {lease} not found")))?;
            entry.keepalives.push(tx);
            entry.ttl
        };

        let every = Duration::from_millis(u64::try_from(ttl.saturating_mul(1000) / 3).unwrap_or(1))
            .max(Duration::from_millis(10));
        spawn_supervised(
            "memory-store-keepalive",
            Self::refresh_loop(Arc::downgrade(&self.inner), lease, ttl, every),
        );
        Ok(rx)
    }

    async fn time_to_live(&self, lease: LeaseId) -> FleetResult<i64> {
        self.check_available()?;
        let state = self.inner.lock();
        let Some(entry) = state.leases.get(&lease) else {
            return Ok(-1);
        };
        let remaining = entry
            .expires_at
            .saturating_duration_since(Instant::now())
            .as_millis();
        let secs = i64::try_from(remaining.div_ceil(1000)).unwrap_or(i64::MAX);
        Ok(secs.saturating_add(state.ttl_skew))
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> FleetResult<()> {
        self.check_available()?;
        let mut state = self.inner.lock();
        if let Some(lease) = lease {
            if !state.leases.contains_key(&lease) {
                return Err(FleetError::store(format!(
                    "requested lease {lease} not found"
                )));
            }
        }

        state.kv.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                lease,
            },
        );
        state.emit(&[RawEvent {
            kind: EventKind::Put,
            key: key.as_bytes().to_vec(),
            value,
        }]);
        Ok(())
    }

    async fn get(&self, key: &str) -> FleetResult<Option<Vec<u8>>> {
        self.check_available()?;
        Ok(self.inner.lock().kv.get(key).map(|entry| entry.value.clone()))
    }

    async fn get_prefix(&self, prefix: &str) -> FleetResult<BTreeMap<String, Vec<u8>>> {
        self.check_available()?;
        Ok(self
            .inner
            .lock()
            .kv
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect())
    }

    async fn watch(&self, target: WatchTarget) -> FleetResult<mpsc::Receiver<Vec<RawEvent>>> {
        self.check_available()?;
        let (tx, rx) = mpsc::channel(RAW_WATCH_CAPACITY);
        self.inner.lock().watches.push(WatchEntry { target, tx });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_prefix() {
        let store = MemoryStore::new();
        store.put("/a/1", b"one".to_vec(), None).await.unwrap();
        store.put("/a/2", b"two".to_vec(), None).await.unwrap();
        store.put("/b/1", b"other".to_vec(), None).await.unwrap();

        assert_eq!(store.get("/a/1").await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(store.get("/missing").await.unwrap(), None);

        let found = store.get_prefix("/a/").await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found["/a/2"], b"two".to_vec());
    }

    #[tokio::test]
    async fn test_revoke_deletes_keys_and_closes_keepalive() {
        let store = MemoryStore::new();
        let lease = store.grant(6).await.unwrap();
        let mut keepalive = store.keep_alive(lease).await.unwrap();
        store.put("/svc/x", b"up".to_vec(), Some(lease)).await.unwrap();
        let mut events = store
            .watch(WatchTarget::Prefix("/svc/".to_string()))
            .await
            .unwrap();

        assert!(store.revoke(lease));
        assert!(!store.revoke(lease));

        assert!(keepalive.recv().await.is_none());
        assert_eq!(store.get("/svc/x").await.unwrap(), None);
        assert_eq!(store.time_to_live(lease).await.unwrap(), -1);

        let batch = events.recv().await.unwrap();
        assert_eq!(batch[0].kind, EventKind::Delete);
        assert_eq!(batch[0].key, b"/svc/x".to_vec());
    }

    #[tokio::test]
    async fn test_stalled_watch_is_cancelled_not_buffered() {
        let store = MemoryStore::new();
        let mut stalled = store
            .watch(WatchTarget::Prefix("/svc/".to_string()))
            .await
            .unwrap();

        for index in 0..=RAW_WATCH_CAPACITY {
            store
                .put(&format!("/svc/{index}"), b"up".to_vec(), None)
                .await
                .unwrap();
        }
        assert!(store.inner.lock().watches.is_empty());

        let mut delivered = 0;
        while let Some(batch) = stalled.recv().await {
            assert_eq!(batch.len(), 1);
            delivered += 1;
        }
        assert_eq!(delivered, RAW_WATCH_CAPACITY);

        // Writes keep working for everyone else
        let mut fresh = store
            .watch(WatchTarget::Key("/svc/late".to_string()))
            .await
            .unwrap();
        store.put("/svc/late", b"up".to_vec(), None).await.unwrap();
        assert_eq!(fresh.recv().await.unwrap()[0].key, b"/svc/late".to_vec());
    }

    #[tokio::test]
    async fn test_put_with_unknown_lease_fails() {
        let store = MemoryStore::new();
        let err = store.put("/k", Vec::new(), Some(99)).await.unwrap_err();
        assert!(matches!(err, FleetError::Store { .. }));
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_everything() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(store.grant(6).await.is_err());
        assert!(store.get("/k").await.is_err());
        assert!(store.time_to_live(1).await.is_err());

        store.set_unavailable(false);
        assert!(store.grant(6).await.is_ok());
        assert_eq!(store.grant_count(), 1);
    }

    #[tokio::test]
    async fn test_ttl_reporting_and_skew() {
        let store = MemoryStore::new();
        let lease = store.grant(6).await.unwrap();
        let ttl = store.time_to_live(lease).await.unwrap();
        assert!((1..=6).contains(&ttl));

        store.set_ttl_skew(100);
        assert!(store.time_to_live(lease).await.unwrap() > 6);
    }

    #[tokio::test]
    async fn test_unrefreshed_lease_expires() {
        let store = MemoryStore::new();
        let lease = store.grant(1).await.unwrap();
        store.put("/k", b"v".to_vec(), Some(lease)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1200)).await;

        assert_eq!(store.time_to_live(lease).await.unwrap(), -1);
        assert_eq!(store.get("/k").await.unwrap(), None);
        assert!(store.lease_ids().is_empty());
    }

    #[tokio::test]
    async fn test_keepalive_refreshes_lease() {
        let store = MemoryStore::new();
        let lease = store.grant(1).await.unwrap();
        let mut keepalive = store.keep_alive(lease).await.unwrap();

        let response = keepalive.recv().await.unwrap();
        assert_eq!(response.lease_id, lease);

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(store.time_to_live(lease).await.unwrap() > 0);
    }
}
