//! Lease-backed self-registration
//!
//! A [`LeaseRegistrar`] keeps one lease alive in the coordination store and
//! publishes liveness keys under it. Two watchdogs guard each lease: one
//! observes the keepalive channel, the other polls the remaining TTL. Either
//! may start a recovery; recoveries are serialized so concurrent triggers for
//! the same lost lease collapse into a single re-grant.

use super::store::{CoordinationStore, KeepAliveResponse, LeaseId};
use crate::error::{FleetError, FleetResult};
use crate::lease_span;
use crate::observability::metrics::metrics;
use crate::runtime::{CloseOnDrop, Shutdown, ShutdownSignal, TaskGroup};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn, Instrument};

/// Lowest TTL ever requested from the store
pub const MIN_TTL_SECS: i64 = 6;

#[derive(Debug, Clone)]
pub struct RegistrarConfig {
    /// Namespace shared by every registrar, e.g. `/fleetwire/registry`
    pub root_prefix: String,
    pub service_id: String,
    pub instance_id: String,
    /// Requested lease TTL; raised to `min_ttl_secs` when lower
    pub ttl_secs: i64,
    pub min_ttl_secs: i64,
    /// TTL poll period; `None` polls every `floor(ttl / 2)` seconds
    pub ttl_poll_interval: Option<Duration>,
}

impl RegistrarConfig {
    pub fn new(
        root_prefix: impl Into<String>,
        service_id: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            root_prefix: root_prefix.into(),
            service_id: service_id.into(),
            instance_id: instance_id.into(),
            ttl_secs: MIN_TTL_SECS,
            min_ttl_secs: MIN_TTL_SECS,
            ttl_poll_interval: None,
        }
    }

    pub fn with_ttl(mut self, ttl_secs: i64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    pub fn with_ttl_poll_interval(mut self, interval: Duration) -> Self {
        self.ttl_poll_interval = Some(interval);
        self
    }

    /// TTL actually requested from the store
    pub fn effective_ttl(&self) -> i64 {
        self.ttl_secs.max(self.min_ttl_secs).max(1)
    }

    pub fn poll_interval(&self) -> Duration {
        self.ttl_poll_interval.unwrap_or_else(|| {
            let half = (self.effective_ttl() / 2).max(1);
            Duration::from_secs(half.unsigned_abs())
        })
    }

    /// `<root_prefix>/<service_id>/<instance_id>`
    pub fn root_key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.root_prefix.trim().trim_end_matches('/'),
            self.service_id.trim(),
            self.instance_id.trim()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrarState {
    /// No lease granted yet
    Unleased,
    Leased,
    /// The current lease was lost and no replacement is in place yet
    Recovering,
    Closed,
}

impl RegistrarState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unleased => "unleased",
            Self::Leased => "leased",
            Self::Recovering => "recovering",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for RegistrarState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct LeaseState {
    current: Option<LeaseId>,
    granted_ttl: i64,
    phase: RegistrarState,
    /// Every key ever published, rewritten under each new lease
    published: BTreeMap<String, Vec<u8>>,
    /// A publish failed and must be retried on the next healthy poll
    dirty: bool,
}

struct Inner<S> {
    store: Arc<S>,
    config: RegistrarConfig,
    root_key: String,
    lease: Mutex<LeaseState>,
    /// Held for the whole of a grant, so recoveries never overlap
    recovery: AsyncMutex<()>,
    closing: AsyncMutex<()>,
    exit: Shutdown,
    tasks: TaskGroup,
}

/// Publishes liveness keys under a self-healing lease.
///
/// Dropping the last clone stops the watchdogs, like an un-awaited
/// [`close`](Self::close).
pub struct LeaseRegistrar<S> {
    inner: Arc<Inner<S>>,
    _close_on_drop: Arc<CloseOnDrop>,
}

impl<S> Clone for LeaseRegistrar<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _close_on_drop: self._close_on_drop.clone(),
        }
    }
}

impl<S: CoordinationStore> fmt::Debug for LeaseRegistrar<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock_lease();
        f.debug_struct("LeaseRegistrar")
            .field("root_key", &self.inner.root_key)
            .field("lease", &state.current)
            .field("state", &state.phase)
            .finish()
    }
}

impl<S: CoordinationStore> LeaseRegistrar<S> {
    /// Create an unleased registrar. Nothing touches the store until the
    /// first publish or an explicit [`grant`](Self::grant).
    pub fn new(store: Arc<S>, config: RegistrarConfig) -> Self {
        let root_key = config.root_key();
        let inner = Arc::new(Inner {
            store,
            config,
            root_key,
            lease: Mutex::new(LeaseState {
                current: None,
                granted_ttl: 0,
                phase: RegistrarState::Unleased,
                published: BTreeMap::new(),
                dirty: false,
            }),
            recovery: AsyncMutex::new(()),
            closing: AsyncMutex::new(()),
            exit: Shutdown::new(),
            tasks: TaskGroup::new(),
        });
        let abandoned = inner.clone();
        Self {
            inner,
            _close_on_drop: CloseOnDrop::new(move || {
                if abandoned.stop() {
                    debug!(root_key = %abandoned.root_key, "Registrar dropped without close");
                }
            }),
        }
    }

    pub fn config(&self) -> &RegistrarConfig {
        &self.inner.config
    }

    pub fn root_key(&self) -> &str {
        &self.inner.root_key
    }

    pub fn state(&self) -> RegistrarState {
        self.inner.lock_lease().phase
    }

    /// Lease keys are currently written under. Never cache it across a
    /// recovery; always publish through the registrar.
    pub fn current_lease(&self) -> Option<LeaseId> {
        let state = self.inner.lock_lease();
        match state.phase {
            RegistrarState::Leased => state.current,
            _ => None,
        }
    }

    /// Make sure a lease is held, granting one if needed
    pub async fn grant(&self) -> FleetResult<LeaseId> {
        Inner::ensure_lease(&self.inner).await
    }

    /// Publish `value` at the root key
    pub async fn set_service(&self, value: &str) -> FleetResult<()> {
        if self.inner.config.service_id.trim().is_empty() {
            return Err(FleetError::invalid_parameter("service id is empty"));
        }
        let key = self.inner.root_key.clone();
        Inner::publish(&self.inner, key, value.trim()).await
    }

    /// Publish `value` at `key`, which is placed under the root key unless
    /// it already is
    pub async fn set(&self, key: &str, value: &str) -> FleetResult<()> {
        let key = key.trim();
        if key.is_empty() {
            return Err(FleetError::invalid_parameter("key is empty"));
        }
        let key = if key.starts_with(self.inner.root_key.as_str()) {
            key.to_string()
        } else {
            format!("{}/{}", self.inner.root_key, key.trim_start_matches('/'))
        };
        Inner::publish(&self.inner, key, value.trim()).await
    }

    /// Stop both watchdogs and any recovery, and wait for them to finish.
    ///
    /// Idempotent. The lease itself is left to expire in the store.
    pub async fn close(&self) {
        let first = self.inner.stop();

        let _closing = self.inner.closing.lock().await;
        self.inner.tasks.wait().await;
        if first {
            info!(root_key = %self.inner.root_key, "Registrar closed");
        }
    }
}

impl<S: CoordinationStore> Inner<S> {
    fn lock_lease(&self) -> MutexGuard<'_, LeaseState> {
        self.lease.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark closed and signal every task. True for the first caller only.
    fn stop(&self) -> bool {
        let first = {
            let mut state = self.lock_lease();
            let first = state.phase != RegistrarState::Closed;
            state.phase = RegistrarState::Closed;
            first
        };
        self.exit.fire();
        first
    }

    fn is_current(&self, lease: LeaseId) -> bool {
        let state = self.lock_lease();
        state.phase != RegistrarState::Closed && state.current == Some(lease)
    }

    fn leased(&self) -> FleetResult<Option<LeaseId>> {
        let state = self.lock_lease();
        match state.phase {
            RegistrarState::Closed => Err(FleetError::Closed),
            RegistrarState::Leased => Ok(state.current),
            _ => Ok(None),
        }
    }

    async fn ensure_lease(this: &Arc<Self>) -> FleetResult<LeaseId> {
        if let Some(lease) = this.leased()? {
            return Ok(lease);
        }
        let _recovery = this.recovery.lock().await;
        if let Some(lease) = this.leased()? {
            return Ok(lease);
        }
        Self::grant_locked(this).await
    }

    async fn publish(this: &Arc<Self>, key: String, value: &str) -> FleetResult<()> {
        let lease = Self::ensure_lease(this).await?;

        // Recorded after the grant so a fresh lease does not write it twice.
        // A recovery racing past this point fails the put below and marks dirty.
        {
            let mut state = this.lock_lease();
            if state.phase == RegistrarState::Closed {
                return Err(FleetError::Closed);
            }
            state.published.insert(key.clone(), value.as_bytes().to_vec());
        }

        match this
            .store
            .put(&key, value.as_bytes().to_vec(), Some(lease))
            .await
        {
            Ok(()) => {
                debug!(key = %key, lease_id = lease, "Published key");
                Ok(())
            }
            Err(e) => {
                this.lock_lease().dirty = true;
                Err(e)
            }
        }
    }

    /// Grant a fresh lease and republish everything under it.
    ///
    /// Callers hold `recovery`.
    async fn grant_locked(this: &Arc<Self>) -> FleetResult<LeaseId> {
        let ttl = this.config.effective_ttl();
        let lease = this.store.grant(ttl).await?;
        let keepalive = this.store.keep_alive(lease).await?;

        let published = {
            let mut state = this.lock_lease();
            if state.phase == RegistrarState::Closed {
                return Err(FleetError::Closed);
            }
            state.current = Some(lease);
            state.granted_ttl = ttl;
            state.phase = RegistrarState::Leased;
            state.dirty = false;
            // Spawned under the lock so close() either sees these tasks or
            // they never start.
            Self::spawn_watchdogs(this, lease, ttl, keepalive);
            state.published.clone()
        };

        metrics().lease_granted();
        info!(lease_id = lease, ttl, root_key = %this.root_key, "Lease granted");
        Self::republish(this, lease, published).await;
        Ok(lease)
    }

    async fn republish(this: &Arc<Self>, lease: LeaseId, published: BTreeMap<String, Vec<u8>>) {
        for (key, value) in published {
            if let Err(e) = this.store.put(&key, value, Some(lease)).await {
                warn!(key = %key, lease_id = lease, error = %e, "Republish failed, retrying on next poll");
                this.lock_lease().dirty = true;
            }
        }
    }

    fn take_dirty(&self) -> Option<BTreeMap<String, Vec<u8>>> {
        let mut state = self.lock_lease();
        if std::mem::take(&mut state.dirty) {
            Some(state.published.clone())
        } else {
            None
        }
    }

    fn spawn_watchdogs(
        this: &Arc<Self>,
        lease: LeaseId,
        ttl: i64,
        keepalive: mpsc::Receiver<KeepAliveResponse>,
    ) {
        let span = lease_span!(lease_id = lease, root_key = %this.root_key);
        this.tasks.spawn(
            "lease-keepalive-watchdog",
            Self::keepalive_watchdog(this.clone(), lease, keepalive, this.exit.subscribe())
                .instrument(span.clone()),
        );
        this.tasks.spawn(
            "lease-ttl-watchdog",
            Self::ttl_watchdog(this.clone(), lease, ttl, this.exit.subscribe()).instrument(span),
        );
    }

    fn spawn_recovery(this: &Arc<Self>, lease: LeaseId) {
        let span = lease_span!(lease_id = lease, root_key = %this.root_key);
        this.tasks.spawn(
            "lease-recovery",
            Self::recover(this.clone(), lease).instrument(span),
        );
    }

    async fn keepalive_watchdog(
        this: Arc<Self>,
        lease: LeaseId,
        mut keepalive: mpsc::Receiver<KeepAliveResponse>,
        mut exit: ShutdownSignal,
    ) {
        loop {
            let response = tokio::select! {
                _ = exit.wait() => {
                    debug!("Keepalive watchdog stopped");
                    return;
                }
                response = keepalive.recv() => response,
            };

            match response {
                Some(response) => trace!(ttl = response.ttl, "Keepalive acknowledged"),
                None => {
                    if !this.is_current(lease) {
                        debug!("Keepalive closed for a superseded lease");
                        return;
                    }
                    metrics().lease_lost();
                    let error = FleetError::lease_lost(lease, "keepalive channel closed");
                    warn!(error = %error, "Lease keepalive lost, starting recovery");
                    Self::spawn_recovery(&this, lease);
                    return;
                }
            }
        }
    }

    async fn ttl_watchdog(this: Arc<Self>, lease: LeaseId, granted_ttl: i64, mut exit: ShutdownSignal) {
        let mut ticker = tokio::time::interval(this.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = exit.wait() => {
                    debug!("TTL watchdog stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }
            if !this.is_current(lease) {
                debug!("TTL watchdog stopped for a superseded lease");
                return;
            }

            let queried = tokio::select! {
                _ = exit.wait() => return,
                queried = this.store.time_to_live(lease) => queried,
            };

            match queried {
                Ok(ttl) if ttl > 0 => {
                    trace!(ttl, "Lease TTL polled");
                    if ttl > granted_ttl {
                        let error = FleetError::ClockSkew {
                            message: format!(
                                "lease {lease} reports {ttl}s remaining but was granted {granted_ttl}s"
                            ),
                        };
                        warn!(error = %error, "Lease TTL exceeds its grant");
                    }
                    if let Some(published) = this.take_dirty() {
                        Self::republish(&this, lease, published).await;
                    }
                }
                Ok(ttl) => {
                    metrics().lease_lost();
                    let error = FleetError::lease_lost(lease, format!("TTL poll reported {ttl}"));
                    warn!(error = %error, "Lease expired, starting recovery");
                    Self::spawn_recovery(&this, lease);
                }
                Err(e) => {
                    warn!(error = %e, "Lease TTL query failed, starting recovery");
                    Self::spawn_recovery(&this, lease);
                }
            }
        }
    }

    async fn recover(this: Arc<Self>, lost: LeaseId) {
        let mut exit = this.exit.subscribe();
        let _recovery = tokio::select! {
            _ = exit.wait() => return,
            guard = this.recovery.lock() => guard,
        };
        if !this.is_current(lost) {
            debug!("Lease already recovered");
            return;
        }

        let remaining = tokio::select! {
            _ = exit.wait() => return,
            remaining = this.store.time_to_live(lost) => remaining,
        };
        match remaining {
            Ok(ttl) if ttl > 0 => {
                // Only the keepalive stream went away; the lease is still live.
                match this.store.keep_alive(lost).await {
                    Ok(keepalive) => {
                        let state = this.lock_lease();
                        if state.phase != RegistrarState::Closed && state.current == Some(lost) {
                            let span = lease_span!(lease_id = lost, root_key = %this.root_key);
                            this.tasks.spawn(
                                "lease-keepalive-watchdog",
                                Self::keepalive_watchdog(
                                    this.clone(),
                                    lost,
                                    keepalive,
                                    this.exit.subscribe(),
                                )
                                .instrument(span),
                            );
                            info!(ttl, "Lease still alive, keepalive re-established");
                        }
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "Could not resume keepalive, granting a new lease");
                    }
                }
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "TTL query failed during recovery"),
        }

        {
            let mut state = this.lock_lease();
            if state.phase == RegistrarState::Closed {
                return;
            }
            state.phase = RegistrarState::Recovering;
        }

        let granted = tokio::select! {
            _ = exit.wait() => return,
            granted = Self::grant_locked(&this) => granted,
        };
        match granted {
            Ok(lease) => {
                metrics().lease_recovered();
                info!(old_lease_id = lost, new_lease_id = lease, "Lease recovered");
            }
            Err(FleetError::Closed) => {}
            Err(e) => warn!(error = %e, "Lease recovery failed, retrying on next poll"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::memory::MemoryStore;
    use crate::testing::wait_for;

    fn registrar(store: &MemoryStore, poll: Duration) -> LeaseRegistrar<MemoryStore> {
        LeaseRegistrar::new(
            Arc::new(store.clone()),
            RegistrarConfig::new("/fleetwire/registry/", "collector", "node-1")
                .with_ttl_poll_interval(poll),
        )
    }

    #[test]
    fn test_config_root_key_and_ttl_floor() {
        let config = RegistrarConfig::new("/root/", "svc", "i-1").with_ttl(2);
        assert_eq!(config.root_key(), "/root/svc/i-1");
        assert_eq!(config.effective_ttl(), MIN_TTL_SECS);
        assert_eq!(config.poll_interval(), Duration::from_secs(3));

        let config = config.with_ttl(30);
        assert_eq!(config.effective_ttl(), 30);
        assert_eq!(config.poll_interval(), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_first_publish_grants_lazily() {
        let store = MemoryStore::new();
        let registrar = registrar(&store, Duration::from_secs(60));
        assert_eq!(registrar.state(), RegistrarState::Unleased);
        assert_eq!(store.grant_count(), 0);

        registrar.set_service("  {\"addr\":\"10.0.0.1\"}  ").await.unwrap();

        let lease = registrar.current_lease().unwrap();
        assert_eq!(registrar.state(), RegistrarState::Leased);
        assert_eq!(store.grant_count(), 1);
        assert_eq!(
            store.get(registrar.root_key()).await.unwrap(),
            Some(b"{\"addr\":\"10.0.0.1\"}".to_vec())
        );
        assert_eq!(store.lease_of(registrar.root_key()), Some(lease));
        registrar.close().await;
    }

    #[tokio::test]
    async fn test_set_places_keys_under_root() {
        let store = MemoryStore::new();
        let registrar = registrar(&store, Duration::from_secs(60));

        registrar.set("status", "ok").await.unwrap();
        registrar
            .set("/fleetwire/registry/collector/node-1/port", "9000")
            .await
            .unwrap();

        assert_eq!(
            store
                .get("/fleetwire/registry/collector/node-1/status")
                .await
                .unwrap(),
            Some(b"ok".to_vec())
        );
        assert_eq!(
            store
                .get("/fleetwire/registry/collector/node-1/port")
                .await
                .unwrap(),
            Some(b"9000".to_vec())
        );
        assert_eq!(store.grant_count(), 1);

        assert!(matches!(
            registrar.set("   ", "x").await,
            Err(FleetError::InvalidParameter { .. })
        ));
        registrar.close().await;
    }

    #[tokio::test]
    async fn test_empty_service_id_rejected() {
        let store = MemoryStore::new();
        let registrar = LeaseRegistrar::new(
            Arc::new(store.clone()),
            RegistrarConfig::new("/r", "  ", "i"),
        );
        assert!(matches!(
            registrar.set_service("up").await,
            Err(FleetError::InvalidParameter { .. })
        ));
        assert_eq!(store.grant_count(), 0);
    }

    #[tokio::test]
    async fn test_revoked_lease_recovers_once_and_republishes() {
        let store = MemoryStore::new();
        let registrar = registrar(&store, Duration::from_millis(20));
        registrar.set_service("up").await.unwrap();
        registrar.set("extra", "1").await.unwrap();
        let first = registrar.current_lease().unwrap();

        assert!(store.revoke(first));

        let root = registrar.root_key().to_string();
        let observed = store.clone();
        assert!(
            wait_for(Duration::from_secs(2), || {
                observed.lease_of(&root).is_some_and(|lease| lease != first)
            })
            .await,
            "root key should be republished under a new lease"
        );

        // Give the TTL watchdog a few more ticks to race.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.grant_count(), 2);
        assert_eq!(registrar.state(), RegistrarState::Leased);
        let second = registrar.current_lease().unwrap();
        assert_eq!(store.lease_of(&format!("{root}/extra")), Some(second));
        registrar.close().await;
    }

    #[tokio::test]
    async fn test_recovery_retries_while_store_unavailable() {
        let store = MemoryStore::new();
        let registrar = registrar(&store, Duration::from_millis(20));
        registrar.set_service("up").await.unwrap();
        let first = registrar.current_lease().unwrap();

        store.set_unavailable(true);
        store.revoke(first);

        let observed = registrar.clone();
        assert!(
            wait_for(Duration::from_secs(1), || {
                observed.state() == RegistrarState::Recovering
            })
            .await
        );
        assert_eq!(store.grant_count(), 1);

        store.set_unavailable(false);
        let observed = registrar.clone();
        assert!(
            wait_for(Duration::from_secs(2), || observed.state() == RegistrarState::Leased).await
        );
        assert_eq!(store.grant_count(), 2);
        assert_eq!(store.get(registrar.root_key()).await.unwrap(), Some(b"up".to_vec()));
        registrar.close().await;
    }

    #[tokio::test]
    async fn test_clock_skew_does_not_recover() {
        let store = MemoryStore::new();
        let registrar = registrar(&store, Duration::from_millis(10));
        registrar.set_service("up").await.unwrap();
        store.set_ttl_skew(1_000);

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(store.grant_count(), 1);
        assert_eq!(registrar.state(), RegistrarState::Leased);
        registrar.close().await;
    }

    #[tokio::test]
    async fn test_no_recovery_after_close() {
        let store = MemoryStore::new();
        let registrar = registrar(&store, Duration::from_millis(10));
        registrar.set_service("up").await.unwrap();
        let lease = registrar.current_lease().unwrap();

        registrar.close().await;
        store.revoke(lease);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(store.grant_count(), 1);
        assert_eq!(registrar.state(), RegistrarState::Closed);
        assert!(matches!(
            registrar.set_service("again").await,
            Err(FleetError::Closed)
        ));
        assert!(matches!(registrar.grant().await, Err(FleetError::Closed)));
    }

    #[tokio::test]
    async fn test_debug_shows_lease_and_state() {
        let store = MemoryStore::new();
        let registrar = registrar(&store, Duration::from_secs(60));
        let rendered = format!("{registrar:?}");
        assert!(rendered.contains("/fleetwire/registry/collector/node-1"));
        assert!(rendered.contains("state: Unleased"));

        registrar.set_service("up").await.unwrap();
        let lease = registrar.current_lease().unwrap();
        let rendered = format!("{registrar:?}");
        assert!(rendered.contains("state: Leased"));
        assert!(rendered.contains(&format!("Some({lease})")));
        registrar.close().await;
    }

    #[tokio::test]
    async fn test_dropping_last_handle_stops_watchdogs() {
        let store = MemoryStore::new();
        let registrar = registrar(&store, Duration::from_millis(10));
        registrar.set_service("up").await.unwrap();
        let lease = registrar.current_lease().unwrap();

        let clone = registrar.clone();
        drop(registrar);
        assert_eq!(clone.state(), RegistrarState::Leased);
        drop(clone);

        store.revoke(lease);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.grant_count(), 1, "no recovery once every handle is gone");
    }

    #[tokio::test]
    async fn test_concurrent_close() {
        let store = MemoryStore::new();
        let registrar = registrar(&store, Duration::from_millis(10));
        registrar.set_service("up").await.unwrap();

        let a = registrar.clone();
        let b = registrar.clone();
        let (first, second) = tokio::join!(
            tokio::spawn(async move { a.close().await }),
            tokio::spawn(async move { b.close().await })
        );
        first.unwrap();
        second.unwrap();
        assert_eq!(registrar.state(), RegistrarState::Closed);
    }
}
