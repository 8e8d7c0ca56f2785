//! etcd-backed coordination store

use super::store::{
    CoordinationStore, EventKind, KeepAliveResponse, LeaseId, RawEvent, WatchTarget,
    RAW_WATCH_CAPACITY,
};
use crate::error::{FleetError, FleetResult};
use crate::runtime::spawn_supervised;
use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, EventType, GetOptions, PutOptions, WatchOptions};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const KEEPALIVE_BUFFER: usize = 16;

/// Connection settings for [`EtcdStore::connect`]
#[derive(Debug, Clone, Default)]
pub struct EtcdOptions {
    pub endpoints: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub dial_timeout: Option<Duration>,
}

fn store_error(e: etcd_client::Error) -> FleetError {
    FleetError::store(e.to_string())
}

#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    pub async fn connect(options: &EtcdOptions) -> FleetResult<Self> {
        if options.endpoints.is_empty() {
            return Err(FleetError::invalid_parameter("no etcd endpoints configured"));
        }

        let mut connect = ConnectOptions::new();
        if let (Some(user), Some(password)) = (&options.username, &options.password) {
            connect = connect.with_user(user.clone(), password.clone());
        }
        if let Some(timeout) = options.dial_timeout {
            connect = connect.with_connect_timeout(timeout);
        }

        let client = Client::connect(&options.endpoints, Some(connect))
            .await
            .map_err(store_error)?;
        info!(endpoints = ?options.endpoints, "Connected to etcd");
        Ok(Self { client })
    }

    async fn keepalive_loop(
        mut client: Client,
        lease: LeaseId,
        tx: mpsc::Sender<KeepAliveResponse>,
        every: Duration,
    ) {
        let (mut keeper, mut stream) = match client.lease_keep_alive(lease).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(lease_id = lease, error = %e, "etcd keepalive could not start");
                return;
            }
        };

        loop {
            if let Err(e) = keeper.keep_alive().await {
                warn!(lease_id = lease, error = %e, "etcd keepalive request failed");
                return;
            }
            match stream.message().await {
                Ok(Some(response)) if response.ttl() > 0 => {
                    let ack = KeepAliveResponse {
                        lease_id: response.id(),
                        ttl: response.ttl(),
                    };
                    if tx.send(ack).await.is_err() {
                        debug!(lease_id = lease, "Keepalive consumer went away");
                        return;
                    }
                }
                Ok(Some(_)) => {
                    warn!(lease_id = lease, "etcd reports the lease expired");
                    return;
                }
                Ok(None) => {
                    warn!(lease_id = lease, "etcd keepalive stream ended");
                    return;
                }
                Err(e) => {
                    warn!(lease_id = lease, error = %e, "etcd keepalive stream failed");
                    return;
                }
            }
            tokio::select! {
                _ = tx.closed() => return,
                _ = tokio::time::sleep(every) => {}
            }
        }
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn grant(&self, ttl_secs: i64) -> FleetResult<LeaseId> {
        let response = self
            .client
            .clone()
            .lease_grant(ttl_secs, None)
            .await
            .map_err(store_error)?;
        Ok(response.id())
    }

    async fn keep_alive(&self, lease: LeaseId) -> FleetResult<mpsc::Receiver<KeepAliveResponse>> {
        let ttl = self.time_to_live(lease).await?;
        if ttl <= 0 {
            return Err(FleetError::store(format!("lease {lease} not found")));
        }

        let (tx, rx) = mpsc::channel(KEEPALIVE_BUFFER);
        let every = Duration::from_secs((ttl / 3).max(1).unsigned_abs());
        spawn_supervised(
            "etcd-keepalive",
            Self::keepalive_loop(self.client.clone(), lease, tx, every),
        );
        Ok(rx)
    }

    async fn time_to_live(&self, lease: LeaseId) -> FleetResult<i64> {
        let response = self
            .client
            .clone()
            .lease_time_to_live(lease, None)
            .await
            .map_err(store_error)?;
        Ok(response.ttl())
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> FleetResult<()> {
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        self.client
            .clone()
            .put(key, value, options)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> FleetResult<Option<Vec<u8>>> {
        let response = self
            .client
            .clone()
            .get(key, None)
            .await
            .map_err(store_error)?;
        Ok(response.kvs().last().map(|kv| kv.value().to_vec()))
    }

    async fn get_prefix(&self, prefix: &str) -> FleetResult<BTreeMap<String, Vec<u8>>> {
        let response = self
            .client
            .clone()
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(store_error)?;

        let mut found = BTreeMap::new();
        for kv in response.kvs() {
            match kv.key_str() {
                Ok(key) => {
                    found.insert(key.to_string(), kv.value().to_vec());
                }
                Err(e) => warn!(error = %e, "Skipping non UTF-8 key"),
            }
        }
        Ok(found)
    }

    async fn watch(&self, target: WatchTarget) -> FleetResult<mpsc::Receiver<Vec<RawEvent>>> {
        let (key, options) = match &target {
            WatchTarget::Key(key) => (key.clone(), None),
            WatchTarget::Prefix(prefix) => (prefix.clone(), Some(WatchOptions::new().with_prefix())),
        };
        let (watcher, mut stream) = self
            .client
            .clone()
            .watch(key, options)
            .await
            .map_err(store_error)?;

        let (tx, rx) = mpsc::channel(RAW_WATCH_CAPACITY);
        spawn_supervised("etcd-watch", async move {
            // Dropping the etcd watcher cancels the server-side watch.
            let _watcher = watcher;
            loop {
                let response = tokio::select! {
                    _ = tx.closed() => return,
                    response = stream.message() => response,
                };
                let response = match response {
                    Ok(Some(response)) => response,
                    Ok(None) => {
                        debug!(target = %target, "etcd watch ended");
                        return;
                    }
                    Err(e) => {
                        warn!(target = %target, error = %e, "etcd watch failed");
                        return;
                    }
                };

                let batch: Vec<RawEvent> = response
                    .events()
                    .iter()
                    .filter_map(|event| {
                        let kv = event.kv()?;
                        let kind = match event.event_type() {
                            EventType::Put => EventKind::Put,
                            EventType::Delete => EventKind::Delete,
                        };
                        Some(RawEvent {
                            kind,
                            key: kv.key().to_vec(),
                            value: kv.value().to_vec(),
                        })
                    })
                    .collect();
                // Waits for room, leaving the backlog in the etcd stream
                if !batch.is_empty() && tx.send(batch).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}
