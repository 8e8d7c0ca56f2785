//! Reconnecting client behavior against the in-memory transport
//!
//! Covers the retry budget, close during backoff, recovery after a severed
//! link, manual reconnection after giving up and concurrent close.

use fleetwire::runtime::Shutdown;
use fleetwire::session::{SessionConfig, SessionRegistry};
use fleetwire::testing::{wait_for, CountingDialer};
use fleetwire::transport::memory::{self, MemoryNetwork};
use fleetwire::transport::{ClientConfig, ConnectionState, ReconnectingClient};
use fleetwire::FleetError;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn config(id: &str, interval_ms: u64, max: u32) -> ClientConfig {
    ClientConfig::new(id, Duration::from_millis(interval_ms), max)
        .with_monitor_interval(Duration::from_millis(20))
        .with_backoff_seed(7)
}

#[tokio::test]
async fn test_max_attempts_bounds_total_dials() {
    let network = MemoryNetwork::new();
    network.set_refusing(true);
    let dialer = CountingDialer::new(network.dialer());
    let client = ReconnectingClient::new(dialer.clone(), config("agent-1", 10, 3));

    let runner = client.clone();
    tokio::spawn(async move { runner.run().await });

    assert!(wait_for(Duration::from_secs(3), || client.is_permanently_disconnected()).await);

    // Initial dial plus three reconnect attempts
    assert_eq!(dialer.dial_count(), 4);
    assert_eq!(client.connection_state(), ConnectionState::TransientFailure);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(dialer.dial_count(), 4, "no dials after giving up");

    client.close();
}

#[tokio::test]
async fn test_close_during_backoff_stops_reconnecting() {
    let network = MemoryNetwork::new();
    network.set_refusing(true);
    let dialer = CountingDialer::new(network.dialer());
    let client = ReconnectingClient::new(dialer.clone(), config("agent-1", 200, 0));

    let runner = client.clone();
    let run = tokio::spawn(async move { runner.run().await });

    assert!(wait_for(Duration::from_secs(1), || dialer.dial_count() >= 1).await);
    client.close();

    let dials = dialer.dial_count();
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(dialer.dial_count(), dials);
    assert_eq!(client.connection_state(), ConnectionState::Shutdown);
    assert!(!client.is_permanently_disconnected());

    let outcome = tokio::time::timeout(Duration::from_secs(1), run).await;
    assert!(outcome.is_ok(), "run() should return once closed");
    assert!(matches!(client.send(vec![1]).await, Err(FleetError::Closed)));
}

#[tokio::test]
async fn test_reconnects_after_severed_link() {
    let network = MemoryNetwork::new();
    let registry = SessionRegistry::new(SessionConfig::default());
    let shutdown = Shutdown::new();
    let _server = memory::serve(&network, registry.clone(), shutdown.subscribe());

    let client = ReconnectingClient::new(network.dialer(), config("agent-1", 10, 0));
    client.connect().await.unwrap();
    assert_eq!(client.connection_state(), ConnectionState::Ready);

    assert_eq!(network.sever_all(), 1);

    assert!(wait_for(Duration::from_secs(2), || network.stream_count() == 2).await);
    assert!(
        wait_for(Duration::from_secs(2), || {
            client.connection_state() == ConnectionState::Ready
        })
        .await
    );
    assert_eq!(client.reconnect_attempts(), 0);
    assert_eq!(client.health_metrics().reconnect_count, 1);
    client.send(vec![9]).await.unwrap();

    client.close();
    shutdown.fire();
}

#[tokio::test]
async fn test_severed_link_heals_within_first_backoff_window() {
    let network = MemoryNetwork::new();
    let registry = SessionRegistry::new(SessionConfig::default());
    let shutdown = Shutdown::new();
    let _server = memory::serve(&network, registry.clone(), shutdown.subscribe());

    let interval = Duration::from_millis(200);
    let client = ReconnectingClient::new(network.dialer(), config("agent-1", 200, 0));
    client.connect().await.unwrap();
    assert!(wait_for(Duration::from_secs(1), || registry.len() == 1).await);
    let first_session = registry.lookup("agent-1").unwrap();

    let severed_at = Instant::now();
    network.sever_all();
    assert!(
        wait_for(Duration::from_secs(2), || {
            registry
                .lookup("agent-1")
                .is_ok_and(|session| !Arc::ptr_eq(&session, &first_session))
        })
        .await
    );
    let elapsed = severed_at.elapsed();

    // First retry waits between one and one and a half intervals; allow
    // for scheduling and the 10ms polling step on top.
    assert!(elapsed >= interval, "reconnected before backoff: {elapsed:?}");
    assert!(
        elapsed < interval * 3 / 2 + Duration::from_millis(100),
        "reconnect took {elapsed:?}"
    );
    assert_eq!(registry.len(), 1);

    client.close();
    shutdown.fire();
}

#[tokio::test]
async fn test_concurrent_close_is_clean() {
    let network = MemoryNetwork::new();
    let registry = SessionRegistry::new(SessionConfig::default());
    let shutdown = Shutdown::new();
    let _server = memory::serve(&network, registry.clone(), shutdown.subscribe());

    let dialer = CountingDialer::new(network.dialer());
    let client = ReconnectingClient::new(dialer.clone(), config("agent-1", 10, 0));
    client.connect().await.unwrap();
    assert!(wait_for(Duration::from_secs(1), || registry.len() == 1).await);
    let dials = dialer.dial_count();

    let closers: Vec<_> = (0..8)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.close() })
        })
        .collect();
    for closer in closers {
        closer.await.unwrap();
    }

    assert_eq!(client.connection_state(), ConnectionState::Shutdown);
    assert!(client.is_closed());
    // Closing drops the stream, so the server session goes too
    assert!(wait_for(Duration::from_secs(1), || registry.is_empty()).await);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(dialer.dial_count(), dials, "close must not reconnect");
    assert!(matches!(client.connect().await, Err(FleetError::Closed)));

    shutdown.fire();
}

#[tokio::test]
async fn test_failed_write_triggers_reconnect() {
    let network = MemoryNetwork::new();
    let registry = SessionRegistry::new(SessionConfig::default());
    let shutdown = Shutdown::new();
    let _server = memory::serve(&network, registry.clone(), shutdown.subscribe());

    let client = ReconnectingClient::new(network.dialer(), config("agent-1", 10, 0));
    client.connect().await.unwrap();
    assert!(wait_for(Duration::from_secs(1), || registry.len() == 1).await);

    network.fail_client_writes(true);
    let result = client.send(vec![1]).await;
    network.fail_client_writes(false);
    assert!(result.unwrap_err().is_transport());

    assert!(wait_for(Duration::from_secs(2), || network.stream_count() == 2).await);
    assert!(
        wait_for(Duration::from_secs(2), || {
            client.connection_state() == ConnectionState::Ready
        })
        .await
    );

    client.close();
    shutdown.fire();
}

#[tokio::test]
async fn test_manual_connect_after_giving_up() {
    let network = MemoryNetwork::new();
    network.set_refusing(true);
    let client = ReconnectingClient::new(network.dialer(), config("agent-1", 5, 1));

    let runner = client.clone();
    tokio::spawn(async move { runner.run().await });
    assert!(wait_for(Duration::from_secs(2), || client.is_permanently_disconnected()).await);
    assert_eq!(network.dial_count(), 2);

    network.set_refusing(false);
    client.connect().await.unwrap();

    assert!(!client.is_permanently_disconnected());
    assert_eq!(client.connection_state(), ConnectionState::Ready);
    assert_eq!(client.reconnect_attempts(), 0);

    client.close();
}

#[tokio::test]
async fn test_send_while_disconnected_reports_state() {
    let network = MemoryNetwork::new();
    network.set_refusing(true);
    let client = ReconnectingClient::new(network.dialer(), config("agent-1", 5, 1));

    assert!(client.connect().await.is_err());
    match client.send(vec![1]).await {
        Err(FleetError::NotConnected { state }) => assert_ne!(state, ConnectionState::Ready),
        other => panic!("expected NotConnected, got {other:?}"),
    }

    client.close();
}
