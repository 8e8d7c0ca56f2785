//! Server-side map from client identifier to its one active session

use super::stream_session::StreamSession;
use crate::error::{FleetError, FleetResult};
use crate::observability::metrics::metrics;
use crate::runtime::{spawn_supervised, supervised};
use crate::session_span;
use crate::transport::{Envelope, StreamSink, StreamSource};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, Instrument};
use uuid::Uuid;

/// Session settings chosen by the hosting server
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Outbound queue size of every session
    pub queue_capacity: usize,
    /// Give up on a stream that sends nothing for this long; `None` waits forever
    pub handshake_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            handshake_timeout: None,
        }
    }
}

/// Point-in-time view of one session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub client_id: String,
    pub metadata: HashMap<String, String>,
    pub connected_at: DateTime<Utc>,
    pub idle_ms: u64,
}

struct RegistryInner {
    sessions: RwLock<HashMap<String, Arc<StreamSession>>>,
    config: SessionConfig,
    inbound: Mutex<Option<mpsc::Sender<Envelope>>>,
}

/// Thread-safe registry of live sessions, at most one per client identifier
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl SessionRegistry {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: RwLock::new(HashMap::new()),
                config,
                inbound: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Forward inbound envelopes of sessions accepted from now on to `sender`
    pub fn set_inbound_sender(&self, sender: mpsc::Sender<Envelope>) {
        *self
            .inner
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(sender);
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<StreamSession>>> {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<StreamSession>>> {
        self.inner
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `session` under its client identifier, closing any session it replaces.
    ///
    /// Returns the evicted session, if there was one.
    pub fn register(&self, session: Arc<StreamSession>) -> Option<Arc<StreamSession>> {
        let client_id = session.client_id().to_string();
        let mut sessions = self.write();

        if let Some(existing) = sessions.get(&client_id) {
            if Arc::ptr_eq(existing, &session) {
                return None;
            }
            existing.close();
        }

        let evicted = sessions.insert(client_id.clone(), session);
        drop(sessions);

        metrics().session_registered();
        if evicted.is_some() {
            metrics().session_evicted();
            info!(client_id = %client_id, "Replaced existing session");
        } else {
            info!(client_id = %client_id, "Registered session");
        }
        evicted
    }

    /// Close and remove the session for `client_id`. Idempotent.
    pub fn unregister(&self, client_id: &str) -> bool {
        let removed = self.write().remove(client_id);
        match removed {
            Some(session) => {
                session.close();
                debug!(client_id, "Unregistered session");
                true
            }
            None => false,
        }
    }

    /// Remove `session` only if it is still the registered one for its identifier
    fn release(&self, session: &Arc<StreamSession>) {
        session.close();
        let mut sessions = self.write();
        let current = sessions
            .get(session.client_id())
            .is_some_and(|registered| Arc::ptr_eq(registered, session));
        if current {
            sessions.remove(session.client_id());
            debug!(client_id = %session.client_id(), "Released session");
        }
    }

    pub fn lookup(&self, client_id: &str) -> FleetResult<Arc<StreamSession>> {
        self.read()
            .get(client_id)
            .cloned()
            .ok_or_else(|| FleetError::NotFound(format!("session {client_id}")))
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Registered identifiers, sorted
    pub fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Queue `envelope` on the session for `client_id`
    pub fn send_to(&self, client_id: &str, envelope: Envelope) -> FleetResult<()> {
        self.lookup(client_id)?.send(envelope)
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .read()
            .values()
            .map(|session| SessionInfo {
                client_id: session.client_id().to_string(),
                metadata: session.metadata().clone(),
                connected_at: session.connected_at(),
                idle_ms: u64::try_from(session.idle_for().as_millis()).unwrap_or(u64::MAX),
            })
            .collect();
        infos.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        infos
    }

    /// Close every session and empty the registry. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let drained: Vec<Arc<StreamSession>> = self.write().drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.close();
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "Closed all sessions");
        }
        drained.len()
    }

    /// Accept a freshly opened stream.
    ///
    /// Reads the first envelope for the client identifier and metadata,
    /// registers the session (evicting any previous one for that identifier)
    /// and drives it on a supervised task. Nothing is registered if the
    /// stream fails or ends before the first envelope.
    pub async fn accept<K, S>(&self, sink: K, mut source: S) -> FleetResult<Arc<StreamSession>>
    where
        K: StreamSink,
        S: StreamSource,
    {
        let first = match self.inner.config.handshake_timeout {
            Some(limit) => tokio::time::timeout(limit, source.recv())
                .await
                .map_err(|_| FleetError::transport_failure("no handshake before timeout"))??,
            None => source.recv().await?,
        };
        let Some(first) = first else {
            return Err(FleetError::transport_failure(
                "stream ended before the first message",
            ));
        };

        let client_id = if first.client_id.trim().is_empty() {
            format!("client-{}", Uuid::new_v4())
        } else {
            first.client_id
        };

        let session = Arc::new(StreamSession::new(
            client_id.clone(),
            first.headers,
            self.inner.config.queue_capacity,
        ));
        self.register(session.clone());

        let inbound = self
            .inner
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let registry = self.clone();
        let driven = session.clone();
        let span = session_span!(client_id = %client_id);
        spawn_supervised(
            "session-driver",
            async move {
                supervised("session-loops", driven.clone().run(sink, source, inbound)).await;
                registry.release(&driven);
            }
            .instrument(span),
        );

        Ok(session)
    }
}
