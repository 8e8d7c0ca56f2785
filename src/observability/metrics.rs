//! Thread-safe metrics collection system
//!
//! Provides atomic counters and mutex-protected collections for tracking
//! client connections, server sessions, leases and watches.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Samples kept for each timing series
const MAX_SAMPLES: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Client side
    connect_attempts: AtomicU64,
    connections_established: AtomicU64,
    reconnect_attempts: AtomicU64,
    reconnect_give_ups: AtomicU64,
    messages_sent: AtomicU64,
    send_failures: AtomicU64,
    messages_received: AtomicU64,

    // Server side
    sessions_registered: AtomicU64,
    sessions_evicted: AtomicU64,
    sessions_closed: AtomicU64,
    sessions_active: AtomicU64,
    queue_full_rejections: AtomicU64,

    // Discovery
    lease_grants: AtomicU64,
    lease_recoveries: AtomicU64,
    leases_lost: AtomicU64,
    watch_events: AtomicU64,

    task_panics: AtomicU64,
    uptime_start: AtomicU64,

    // Timing series in milliseconds
    reconnect_delays: Mutex<VecDeque<u64>>,
    session_lifetimes: Mutex<VecDeque<u64>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            connect_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            reconnect_give_ups: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            sessions_registered: AtomicU64::new(0),
            sessions_evicted: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            sessions_active: AtomicU64::new(0),
            queue_full_rejections: AtomicU64::new(0),
            lease_grants: AtomicU64::new(0),
            lease_recoveries: AtomicU64::new(0),
            leases_lost: AtomicU64::new(0),
            watch_events: AtomicU64::new(0),
            task_panics: AtomicU64::new(0),
            uptime_start: AtomicU64::new(current_timestamp()),
            reconnect_delays: Mutex::new(VecDeque::new()),
            session_lifetimes: Mutex::new(VecDeque::new()),
        }
    }

    // Client metrics
    pub fn connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect_attempt(&self, delay: Duration) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
        record_sample(&self.reconnect_delays, delay);
    }

    pub fn reconnect_gave_up(&self) {
        self.reconnect_give_ups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_failed(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    // Session metrics
    pub fn session_registered(&self) {
        self.sessions_registered.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_evicted(&self) {
        self.sessions_evicted.fetch_add(1, Ordering::Relaxed);
    }

    /// Called once per registered session, when it closes
    pub fn session_closed(&self, lifetime: Duration) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .sessions_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |active| {
                Some(active.saturating_sub(1))
            });
        record_sample(&self.session_lifetimes, lifetime);
    }

    pub fn queue_full(&self) {
        self.queue_full_rejections.fetch_add(1, Ordering::Relaxed);
    }

    // Discovery metrics
    pub fn lease_granted(&self) {
        self.lease_grants.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lease_recovered(&self) {
        self.lease_recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lease_lost(&self) {
        self.leases_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn watch_event_delivered(&self) {
        self.watch_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_panicked(&self) {
        self.task_panics.fetch_add(1, Ordering::Relaxed);
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.connect_attempts,
            &self.connections_established,
            &self.reconnect_attempts,
            &self.reconnect_give_ups,
            &self.messages_sent,
            &self.send_failures,
            &self.messages_received,
            &self.sessions_registered,
            &self.sessions_evicted,
            &self.sessions_closed,
            &self.sessions_active,
            &self.queue_full_rejections,
            &self.lease_grants,
            &self.lease_recoveries,
            &self.leases_lost,
            &self.watch_events,
            &self.task_panics,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
        lock_samples(&self.reconnect_delays).clear();
        lock_samples(&self.session_lifetimes).clear();
    }

    /// Get complete metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        MetricsSnapshot {
            client: ClientMetrics {
                connect_attempts: load(&self.connect_attempts),
                connections_established: load(&self.connections_established),
                reconnect_attempts: load(&self.reconnect_attempts),
                reconnect_give_ups: load(&self.reconnect_give_ups),
                messages_sent: load(&self.messages_sent),
                send_failures: load(&self.send_failures),
                messages_received: load(&self.messages_received),
                reconnect_delay: TimingSummary::from_samples(&self.reconnect_delays),
            },
            sessions: SessionMetrics {
                registered: load(&self.sessions_registered),
                evicted: load(&self.sessions_evicted),
                closed: load(&self.sessions_closed),
                active: load(&self.sessions_active),
                queue_full_rejections: load(&self.queue_full_rejections),
                lifetime: TimingSummary::from_samples(&self.session_lifetimes),
            },
            discovery: DiscoveryMetrics {
                lease_grants: load(&self.lease_grants),
                lease_recoveries: load(&self.lease_recoveries),
                leases_lost: load(&self.leases_lost),
                watch_events: load(&self.watch_events),
            },
            task_panics: load(&self.task_panics),
            uptime_seconds: now.saturating_sub(load(&self.uptime_start)),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_samples(samples: &Mutex<VecDeque<u64>>) -> std::sync::MutexGuard<'_, VecDeque<u64>> {
    samples.lock().unwrap_or_else(PoisonError::into_inner)
}

fn record_sample(samples: &Mutex<VecDeque<u64>>, value: Duration) {
    let mut samples = lock_samples(samples);
    samples.push_back(u64::try_from(value.as_millis()).unwrap_or(u64::MAX));
    while samples.len() > MAX_SAMPLES {
        samples.pop_front();
    }
}

// Public metrics structures
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub client: ClientMetrics,
    pub sessions: SessionMetrics,
    pub discovery: DiscoveryMetrics,
    pub task_panics: u64,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct ClientMetrics {
    pub connect_attempts: u64,
    pub connections_established: u64,
    pub reconnect_attempts: u64,
    pub reconnect_give_ups: u64,
    pub messages_sent: u64,
    pub send_failures: u64,
    pub messages_received: u64,
    pub reconnect_delay: TimingSummary,
}

#[derive(Debug, Serialize)]
pub struct SessionMetrics {
    pub registered: u64,
    pub evicted: u64,
    pub closed: u64,
    pub active: u64,
    pub queue_full_rejections: u64,
    pub lifetime: TimingSummary,
}

#[derive(Debug, Serialize)]
pub struct DiscoveryMetrics {
    pub lease_grants: u64,
    pub lease_recoveries: u64,
    pub leases_lost: u64,
    pub watch_events: u64,
}

/// Average and percentiles of a timing series, in milliseconds
#[derive(Debug, Default, Serialize)]
pub struct TimingSummary {
    pub samples: usize,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

impl TimingSummary {
    fn from_samples(samples: &Mutex<VecDeque<u64>>) -> Self {
        let mut sorted: Vec<u64> = lock_samples(samples).iter().copied().collect();
        if sorted.is_empty() {
            return Self::default();
        }
        sorted.sort_unstable();

        Self {
            samples: sorted.len(),
            avg_ms: sorted.iter().sum::<u64>() as f64 / sorted.len() as f64,
            p50_ms: percentile(&sorted, 50.0),
            p95_ms: percentile(&sorted, 95.0),
            p99_ms: percentile(&sorted, 99.0),
        }
    }
}

// Helper functions
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_index = index.floor() as usize;
        let upper_index = index.ceil() as usize;
        let lower_value = sorted_data[lower_index] as f64;
        let upper_value = sorted_data[upper_index] as f64;

        lower_value + (upper_value - lower_value) * index.fract()
    }
}
