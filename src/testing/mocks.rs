//! Mock implementations for testing
//!
//! Wrappers that count and record what flows through a [`Dialer`] or a
//! [`CoordinationStore`], and can be switched into failing mode at runtime.

use crate::discovery::{CoordinationStore, KeepAliveResponse, LeaseId, RawEvent, WatchTarget};
use crate::error::{FleetError, FleetResult};
use crate::transport::Dialer;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Dialer wrapper counting every dial, optionally refusing them all
#[derive(Debug)]
pub struct CountingDialer<D> {
    inner: Arc<D>,
    dials: Arc<AtomicUsize>,
    should_fail: Arc<AtomicBool>,
}

impl<D> Clone for CountingDialer<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            dials: self.dials.clone(),
            should_fail: self.should_fail.clone(),
        }
    }
}

impl<D: Dialer> CountingDialer<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner: Arc::new(inner),
            dials: Arc::new(AtomicUsize::new(0)),
            should_fail: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start in failing mode
    pub fn with_failure(inner: D) -> Self {
        let dialer = Self::new(inner);
        dialer.set_failing(true);
        dialer
    }

    pub fn set_failing(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }

    /// Dials attempted, failed ones included
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<D: Dialer> Dialer for CountingDialer<D> {
    type Channel = D::Channel;

    async fn dial(&self) -> FleetResult<Self::Channel> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(FleetError::transport_failure("Mock dial failure"));
        }
        self.inner.dial().await
    }
}

/// Store wrapper recording grants and writes
#[derive(Debug)]
pub struct RecordingStore<S> {
    inner: Arc<S>,
    grants: Arc<Mutex<Vec<LeaseId>>>,
    puts: Arc<Mutex<Vec<(String, Option<LeaseId>)>>>,
    fail_grants: Arc<AtomicBool>,
}

impl<S> Clone for RecordingStore<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            grants: self.grants.clone(),
            puts: self.puts.clone(),
            fail_grants: self.fail_grants.clone(),
        }
    }
}

impl<S: CoordinationStore> RecordingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner: Arc::new(inner),
            grants: Arc::new(Mutex::new(Vec::new())),
            puts: Arc::new(Mutex::new(Vec::new())),
            fail_grants: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn set_failing_grants(&self, fail: bool) {
        self.fail_grants.store(fail, Ordering::SeqCst);
    }

    /// Leases granted through this wrapper, in order
    pub async fn get_grants(&self) -> Vec<LeaseId> {
        self.grants.lock().await.clone()
    }

    pub async fn get_puts(&self) -> Vec<(String, Option<LeaseId>)> {
        self.puts.lock().await.clone()
    }

    pub async fn clear_history(&self) {
        self.grants.lock().await.clear();
        self.puts.lock().await.clear();
    }
}

#[async_trait]
impl<S: CoordinationStore> CoordinationStore for RecordingStore<S> {
    async fn grant(&self, ttl_secs: i64) -> FleetResult<LeaseId> {
        // Serialized so concurrent grants are counted exactly.
        let mut grants = self.grants.lock().await;
        if self.fail_grants.load(Ordering::SeqCst) {
            return Err(FleetError::store("Mock grant failure"));
        }
        let lease = self.inner.grant(ttl_secs).await?;
        grants.push(lease);
        Ok(lease)
    }

    async fn keep_alive(&self, lease: LeaseId) -> FleetResult<mpsc::Receiver<KeepAliveResponse>> {
        self.inner.keep_alive(lease).await
    }

    async fn time_to_live(&self, lease: LeaseId) -> FleetResult<i64> {
        self.inner.time_to_live(lease).await
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> FleetResult<()> {
        self.inner.put(key, value, lease).await?;
        self.puts.lock().await.push((key.to_string(), lease));
        Ok(())
    }

    async fn get(&self, key: &str) -> FleetResult<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn get_prefix(&self, prefix: &str) -> FleetResult<BTreeMap<String, Vec<u8>>> {
        self.inner.get_prefix(prefix).await
    }

    async fn watch(&self, target: WatchTarget) -> FleetResult<mpsc::Receiver<Vec<RawEvent>>> {
        self.inner.watch(target).await
    }
}
