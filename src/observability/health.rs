//! Health check HTTP server for container orchestration
//!
//! Serves aggregated health, readiness, liveness and a metrics snapshot.
//! The hosting process owns the checks: it sets them as its client,
//! listener or registrar changes state.

use crate::error::{FleetError, FleetResult};
use crate::observability::metrics::metrics;
use crate::runtime::ShutdownSignal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use warp::http::StatusCode;
use warp::Filter;

/// HTTP health check server
pub struct HealthServer {
    node_id: String,
    port: u16,
    ready: AtomicBool,
    checks: RwLock<HashMap<String, HealthCheck>>,
}

impl HealthServer {
    pub fn new(node_id: impl Into<String>, port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            port,
            ready: AtomicBool::new(false),
            checks: RwLock::new(HashMap::new()),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Readiness reported on `/ready`
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Add or replace a named check
    pub async fn set_check(&self, name: impl Into<String>, check: HealthCheck) {
        self.checks.write().await.insert(name.into(), check);
    }

    pub async fn remove_check(&self, name: &str) {
        self.checks.write().await.remove(name);
    }

    /// Aggregate status: healthy only when every check is
    pub async fn health_status(&self) -> HealthStatus {
        let checks: BTreeMap<String, HealthCheck> = self
            .checks
            .read()
            .await
            .iter()
            .map(|(name, check)| (name.clone(), check.clone()))
            .collect();

        let healthy = checks.values().all(HealthCheck::is_healthy);
        HealthStatus {
            status: if healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: current_timestamp(),
            node_id: self.node_id.clone(),
            uptime_seconds: metrics().snapshot().uptime_seconds,
            checks,
        }
    }

    /// Every route the server answers
    pub fn routes(
        self: &Arc<Self>,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone + Send + Sync + 'static
    {
        let with_server = {
            let server = self.clone();
            warp::any().map(move || server.clone())
        };

        // GET /health - aggregated status
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_server.clone())
            .and_then(|server: Arc<HealthServer>| async move {
                let status = server.health_status().await;
                let code = if status.status == "healthy" {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
            });

        // GET /metrics - process-wide counters
        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(|| async move {
                Ok::<_, Infallible>(warp::reply::json(&metrics().snapshot()))
            });

        // GET /ready - readiness probe
        let ready_route = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_server)
            .and_then(|server: Arc<HealthServer>| async move {
                let ready = server.is_ready();
                let response = ReadinessResponse {
                    ready,
                    timestamp: current_timestamp(),
                };
                let code = if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&response), code))
            });

        // GET /live - liveness probe
        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(|| async move {
                let response = LivenessResponse {
                    alive: true,
                    timestamp: current_timestamp(),
                };
                Ok::<_, Infallible>(warp::reply::json(&response))
            });

        // GET / - endpoint index
        let root_route = warp::path::end().and(warp::get()).and_then(|| async move {
            let endpoints = BTreeMap::from([
                ("/health", "Aggregated health status with named checks"),
                ("/metrics", "Connection, session and lease counters"),
                ("/ready", "Readiness probe"),
                ("/live", "Liveness probe"),
            ]);
            Ok::<_, Infallible>(warp::reply::json(&ApiDocumentationResponse { endpoints }))
        });

        health_route
            .or(metrics_route)
            .or(ready_route)
            .or(live_route)
            .or(root_route)
            .with(warp::cors().allow_any_origin())
    }

    /// Serve until `shutdown` fires
    pub async fn start(self: Arc<Self>, mut shutdown: ShutdownSignal) -> FleetResult<()> {
        let address = SocketAddr::from(([0, 0, 0, 0], self.port));
        let (bound, server) = warp::serve(self.routes())
            .try_bind_with_graceful_shutdown(address, async move { shutdown.wait().await })
            .map_err(|e| FleetError::transport_failure(format!("health server bind failed: {e}")))?;

        tracing::info!(address = %bound, "Starting health server");
        server.await;
        tracing::info!("Health server stopped");
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

impl HealthCheck {
    pub fn healthy(message: impl Into<String>) -> Self {
        Self {
            status: "healthy".to_string(),
            message: Some(message.into()),
            last_check: current_timestamp(),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: "unhealthy".to_string(),
            message: Some(message.into()),
            last_check: current_timestamp(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub node_id: String,
    pub uptime_seconds: u64,
    pub checks: BTreeMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct ApiDocumentationResponse {
    endpoints: BTreeMap<&'static str, &'static str>,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_server_creation() {
        let health_server = HealthServer::new("collector-1", 8080);
        assert_eq!(health_server.node_id, "collector-1");
        assert_eq!(health_server.port(), 8080);
        assert!(!health_server.is_ready());
    }

    #[tokio::test]
    async fn test_aggregate_status() {
        let health_server = HealthServer::new("collector-1", 8080);

        // No checks at all counts as healthy
        assert_eq!(health_server.health_status().await.status, "healthy");

        health_server
            .set_check("listener", HealthCheck::healthy("accepting"))
            .await;
        health_server
            .set_check("registry", HealthCheck::unhealthy("lease recovering"))
            .await;
        let status = health_server.health_status().await;
        assert_eq!(status.status, "degraded");
        assert_eq!(status.checks.len(), 2);

        health_server.remove_check("registry").await;
        assert_eq!(health_server.health_status().await.status, "healthy");
    }

    #[tokio::test]
    async fn test_health_route_status_codes() {
        let health_server = Arc::new(HealthServer::new("collector-1", 0));
        let routes = health_server.routes();

        let response = warp::test::request().path("/health").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::OK);

        health_server
            .set_check("client", HealthCheck::unhealthy("disconnected"))
            .await;
        let response = warp::test::request().path("/health").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["checks"]["client"]["status"], "unhealthy");
    }

    #[tokio::test]
    async fn test_ready_and_live_routes() {
        let health_server = Arc::new(HealthServer::new("collector-1", 0));
        let routes = health_server.routes();

        let response = warp::test::request().path("/ready").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        health_server.set_ready(true);
        let response = warp::test::request().path("/ready").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = warp::test::request().path("/live").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = warp::test::request().path("/metrics").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert!(body["sessions"].is_object());

        let response = warp::test::request().path("/").reply(&routes).await;
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert!(body["endpoints"]["/health"].is_string());
    }
}
