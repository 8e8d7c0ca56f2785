//! Pure health monitoring and reconnection decisions for the client
//!
//! Nothing here touches the network or takes a lock; the reconnecting
//! client feeds in counters and states and acts on the answer.

use super::ConnectionState;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// A live stream with no inbound traffic for this long is reported unhealthy
pub const STALE_STREAM_AFTER: Duration = Duration::from_secs(300);

pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether attempt number `attempt` may run.
    ///
    /// `max_attempts == 0` means unlimited. Otherwise the run gives up once
    /// the counter exceeds the limit, so a limit of 3 allows attempts 1..=3.
    pub fn should_attempt_reconnection(
        attempt: u32,
        max_attempts: u32,
        closed: bool,
    ) -> ReconnectionDecision {
        if closed {
            return ReconnectionDecision::AbortClosed;
        }

        if max_attempts > 0 && attempt > max_attempts {
            return ReconnectionDecision::AbortMaxAttemptsExceeded { max: max_attempts };
        }

        ReconnectionDecision::Proceed { attempt }
    }

    /// States in which the monitor hands the client to the reconnect path
    pub fn needs_reconnect(state: ConnectionState) -> bool {
        matches!(
            state,
            ConnectionState::TransientFailure | ConnectionState::Shutdown
        )
    }

    /// Snapshot of a client's stream; `connected_at` is `None` while disconnected
    pub fn calculate_health_metrics(
        connected_at: Option<Instant>,
        last_message_at: Option<Instant>,
        reconnect_count: u32,
    ) -> HealthMetrics {
        let uptime = connected_at.map(|at| at.elapsed());
        let time_since_last_message = last_message_at.map(|at| at.elapsed());

        HealthMetrics {
            uptime,
            time_since_last_message,
            reconnect_count,
            is_healthy: Self::is_stream_healthy(uptime, time_since_last_message),
        }
    }

    /// Connected, and either silent since connecting or heard from recently
    fn is_stream_healthy(uptime: Option<Duration>, silence: Option<Duration>) -> bool {
        uptime.is_some() && silence.map_or(true, |silence| silence < STALE_STREAM_AFTER)
    }

    /// Log a connection state transition
    pub fn log_state_transition(client_id: &str, from: ConnectionState, to: ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Ready) => {
                info!(client_id, "Stream established");
            }
            (ConnectionState::Ready, ConnectionState::TransientFailure) => {
                warn!(client_id, "Stream lost");
            }
            (_, ConnectionState::Shutdown) => {
                info!(client_id, "Client shut down");
            }
            _ => {
                info!(client_id, from = %from, to = %to, "Connection state changed");
            }
        }
    }

    /// Grade a client by stability: long uptime and few reconnects rank highest
    pub fn assess_connection_quality(metrics: &HealthMetrics) -> ConnectionQuality {
        if !metrics.is_healthy {
            return ConnectionQuality::Critical;
        }

        match (metrics.reconnect_count, metrics.uptime) {
            (0, Some(uptime)) if uptime > Duration::from_secs(3600) => ConnectionQuality::Excellent,
            (0, Some(_)) => ConnectionQuality::Good,

            (1..=2, Some(uptime)) if uptime > Duration::from_secs(1800) => ConnectionQuality::Good,
            (1..=2, Some(_)) => ConnectionQuality::Fair,

            (3..=5, _) => ConnectionQuality::Fair,
            (6..=10, _) => ConnectionQuality::Poor,

            _ => ConnectionQuality::Critical,
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq, Eq)]
pub enum ReconnectionDecision {
    /// Proceed with reconnection attempt
    Proceed { attempt: u32 },
    /// Client was closed on purpose
    AbortClosed,
    /// Retry budget spent; stay disconnected until `connect()` is called by hand
    AbortMaxAttemptsExceeded { max: u32 },
}

/// Health metrics for connection monitoring
#[derive(Debug, Clone, Serialize)]
pub struct HealthMetrics {
    /// Time since the current stream was established
    pub uptime: Option<Duration>,
    /// Time since the last inbound envelope
    pub time_since_last_message: Option<Duration>,
    /// Successful reconnects over the client's lifetime
    pub reconnect_count: u32,
    pub is_healthy: bool,
}

/// Connection quality assessment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}
