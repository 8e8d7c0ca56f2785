//! Typed watch and read access to the coordination store

use super::store::{CoordinationStore, Event, RawEvent, WatchTarget};
use crate::error::{FleetError, FleetResult};
use crate::observability::metrics::metrics;
use crate::runtime::{Shutdown, ShutdownSignal, TaskGroup};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Event channel size handed to every watch consumer
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Turns store watches into [`Event`] streams.
///
/// Each watch runs one forwarding task. Delivery waits for room when the
/// consumer falls behind, so size consumers accordingly.
pub struct Watcher<S> {
    store: Arc<S>,
    capacity: usize,
    exit: Shutdown,
    tasks: TaskGroup,
}

impl<S: CoordinationStore> Watcher<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_capacity(store, DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(store: Arc<S>, capacity: usize) -> Self {
        Self {
            store,
            capacity: capacity.max(1),
            exit: Shutdown::new(),
            tasks: TaskGroup::new(),
        }
    }

    /// Watch a single key
    pub async fn watch(&self, key: &str) -> FleetResult<mpsc::Receiver<Event>> {
        let key = non_empty(key, "key")?;
        self.start(WatchTarget::Key(key)).await
    }

    /// Watch every key under `prefix`
    pub async fn watch_prefix(&self, prefix: &str) -> FleetResult<mpsc::Receiver<Event>> {
        let prefix = non_empty(prefix, "prefix")?;
        self.start(WatchTarget::Prefix(prefix)).await
    }

    async fn start(&self, target: WatchTarget) -> FleetResult<mpsc::Receiver<Event>> {
        if self.exit.is_fired() {
            return Err(FleetError::Closed);
        }
        let raw = self.store.watch(target.clone()).await?;
        let (tx, rx) = mpsc::channel(self.capacity);

        info!(target = %target, "Watch started");
        self.tasks.spawn(
            "watch-forwarder",
            forward(target, raw, tx, self.exit.subscribe()),
        );
        Ok(rx)
    }

    /// Current value of `key`
    pub async fn get(&self, key: &str) -> FleetResult<Option<Vec<u8>>> {
        let key = non_empty(key, "key")?;
        self.store.get(&key).await
    }

    /// Every key under `prefix` with its value
    pub async fn get_prefix(&self, prefix: &str) -> FleetResult<BTreeMap<String, Vec<u8>>> {
        let prefix = non_empty(prefix, "prefix")?;
        self.store.get_prefix(&prefix).await
    }

    /// Stop every watch and wait for the forwarders. Idempotent.
    pub async fn close(&self) {
        if self.exit.fire() {
            debug!("Closing watcher");
        }
        self.tasks.wait().await;
    }
}

fn non_empty(value: &str, what: &str) -> FleetResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(FleetError::invalid_parameter(format!("{what} is empty")));
    }
    Ok(trimmed.to_string())
}

async fn forward(
    target: WatchTarget,
    mut raw: mpsc::Receiver<Vec<RawEvent>>,
    tx: mpsc::Sender<Event>,
    mut exit: ShutdownSignal,
) {
    loop {
        let batch = tokio::select! {
            _ = exit.wait() => break,
            batch = raw.recv() => batch,
        };
        let Some(batch) = batch else {
            debug!(target = %target, "Store ended the watch");
            break;
        };

        for raw_event in batch {
            let event = match Event::try_from(raw_event) {
                Ok(event) => event,
                Err(e) => {
                    warn!(target = %target, error = %e, "Skipping untranslatable watch event");
                    continue;
                }
            };

            let delivered = tokio::select! {
                _ = exit.wait() => return,
                delivered = tx.send(event) => delivered,
            };
            if delivered.is_err() {
                debug!(target = %target, "Watch consumer went away");
                return;
            }
            metrics().watch_event_delivered();
        }
    }
    info!(target = %target, "Watch stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::memory::MemoryStore;
    use crate::discovery::store::EventKind;
    use std::time::Duration;

    #[tokio::test]
    async fn test_empty_targets_rejected() {
        let watcher = Watcher::new(Arc::new(MemoryStore::new()));
        assert!(matches!(
            watcher.watch("  ").await,
            Err(FleetError::InvalidParameter { .. })
        ));
        assert!(matches!(
            watcher.watch_prefix("").await,
            Err(FleetError::InvalidParameter { .. })
        ));
        assert!(watcher.get(" ").await.is_err());
        assert!(watcher.get_prefix("").await.is_err());
    }

    #[tokio::test]
    async fn test_key_watch_sees_put_and_delete() {
        let store = MemoryStore::new();
        let watcher = Watcher::new(Arc::new(store.clone()));
        let mut events = watcher.watch(" /svc/a ").await.unwrap();

        store.put("/svc/a", b"up".to_vec(), None).await.unwrap();
        store.put("/svc/ab", b"other".to_vec(), None).await.unwrap();
        store.delete("/svc/a");

        let put = events.recv().await.unwrap();
        assert_eq!(put.kind, EventKind::Put);
        assert_eq!(put.key, "/svc/a");
        assert_eq!(put.value, b"up".to_vec());

        let delete = events.recv().await.unwrap();
        assert_eq!(delete.kind, EventKind::Delete);
        assert_eq!(delete.key, "/svc/a");
        watcher.close().await;
    }

    #[tokio::test]
    async fn test_close_ends_event_streams() {
        let store = MemoryStore::new();
        let watcher = Watcher::new(Arc::new(store.clone()));
        let mut events = watcher.watch_prefix("/svc/").await.unwrap();

        watcher.close().await;
        watcher.close().await;

        let ended = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap();
        assert!(ended.is_none());
        assert!(matches!(
            watcher.watch("/svc/a").await,
            Err(FleetError::Closed)
        ));
    }
}
