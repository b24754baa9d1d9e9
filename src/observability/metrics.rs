//! Thread-safe metrics collection system
//!
//! Atomic counters for the link, the MQTT session, and the telemetry buffer,
//! plus a bounded window of supervisor cycle durations.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Cycle durations kept for percentile calculation
const MAX_CYCLE_SAMPLES: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Link
    link_up: AtomicBool,
    link_connect_attempts: AtomicU64,
    link_connects: AtomicU64,
    link_connect_failures: AtomicU64,
    link_drops: AtomicU64,

    // Session
    session_up: AtomicBool,
    session_open_attempts: AtomicU64,
    sessions_established: AtomicU64,
    session_failures: AtomicU64,
    session_drops: AtomicU64,
    messages_received: AtomicU64,
    publish_failures: AtomicU64,

    // Telemetry
    samples_enqueued: AtomicU64,
    samples_published: AtomicU64,
    samples_dropped: AtomicU64,
    buffer_depth: AtomicU64,
    last_publish: AtomicU64,

    // Supervisor
    cycles: AtomicU64,
    cycle_times: Mutex<Vec<u64>>, // in microseconds
    uptime_start: AtomicU64,
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub uptime_seconds: u64,
    pub link: LinkMetrics,
    pub session: SessionMetrics,
    pub telemetry: TelemetryMetrics,
    pub supervisor: SupervisorMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkMetrics {
    pub connected: bool,
    pub connect_attempts: u64,
    pub connects: u64,
    pub connect_failures: u64,
    pub drops: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionMetrics {
    pub connected: bool,
    pub open_attempts: u64,
    pub established: u64,
    pub failures: u64,
    pub drops: u64,
    pub messages_received: u64,
    pub publish_failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetryMetrics {
    pub samples_enqueued: u64,
    pub samples_published: u64,
    pub samples_dropped: u64,
    pub buffer_depth: u64,
    /// Unix seconds of the last successful publish, 0 if none
    pub last_publish: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorMetrics {
    pub cycles: u64,
    pub cycle_p50_us: f64,
    pub cycle_p95_us: f64,
    pub cycle_max_us: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            link_up: AtomicBool::new(false),
            link_connect_attempts: AtomicU64::new(0),
            link_connects: AtomicU64::new(0),
            link_connect_failures: AtomicU64::new(0),
            link_drops: AtomicU64::new(0),
            session_up: AtomicBool::new(false),
            session_open_attempts: AtomicU64::new(0),
            sessions_established: AtomicU64::new(0),
            session_failures: AtomicU64::new(0),
            session_drops: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            samples_enqueued: AtomicU64::new(0),
            samples_published: AtomicU64::new(0),
            samples_dropped: AtomicU64::new(0),
            buffer_depth: AtomicU64::new(0),
            last_publish: AtomicU64::new(0),
            cycles: AtomicU64::new(0),
            cycle_times: Mutex::new(Vec::new()),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // Link metrics
    pub fn link_connect_attempted(&self) {
        self.link_connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn link_connected(&self) {
        self.link_connects.fetch_add(1, Ordering::Relaxed);
        self.link_up.store(true, Ordering::Relaxed);
    }

    pub fn link_connect_failed(&self) {
        self.link_connect_failures.fetch_add(1, Ordering::Relaxed);
        self.link_up.store(false, Ordering::Relaxed);
    }

    pub fn link_dropped(&self) {
        self.link_drops.fetch_add(1, Ordering::Relaxed);
        self.link_up.store(false, Ordering::Relaxed);
    }

    // Session metrics
    pub fn session_open_attempted(&self) {
        self.session_open_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_established(&self) {
        self.sessions_established.fetch_add(1, Ordering::Relaxed);
        self.session_up.store(true, Ordering::Relaxed);
    }

    pub fn session_failed(&self) {
        self.session_failures.fetch_add(1, Ordering::Relaxed);
        self.session_up.store(false, Ordering::Relaxed);
    }

    pub fn session_dropped(&self) {
        self.session_drops.fetch_add(1, Ordering::Relaxed);
        self.session_up.store(false, Ordering::Relaxed);
    }

    pub fn set_session_up(&self, up: bool) {
        self.session_up.store(up, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Telemetry metrics
    pub fn sample_enqueued(&self, depth: usize) {
        self.samples_enqueued.fetch_add(1, Ordering::Relaxed);
        self.buffer_depth.store(depth as u64, Ordering::Relaxed);
    }

    pub fn sample_dropped(&self) {
        self.samples_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn samples_flushed(&self, published: usize, depth: usize) {
        if published > 0 {
            self.samples_published
                .fetch_add(published as u64, Ordering::Relaxed);
            self.last_publish
                .store(current_timestamp(), Ordering::Relaxed);
        }
        self.buffer_depth.store(depth as u64, Ordering::Relaxed);
    }

    // Supervisor metrics
    pub fn cycle_completed(&self, duration: Duration) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut times) = self.cycle_times.lock() {
            times.push(duration.as_micros().min(u64::MAX as u128) as u64);
            if times.len() > MAX_CYCLE_SAMPLES {
                let excess = times.len() - MAX_CYCLE_SAMPLES;
                times.drain(..excess);
            }
        }
    }

    /// Reset all metrics (for testing)
    pub fn reset(&self) {
        for counter in [
            &self.link_connect_attempts,
            &self.link_connects,
            &self.link_connect_failures,
            &self.link_drops,
            &self.session_open_attempts,
            &self.sessions_established,
            &self.session_failures,
            &self.session_drops,
            &self.messages_received,
            &self.publish_failures,
            &self.samples_enqueued,
            &self.samples_published,
            &self.samples_dropped,
            &self.buffer_depth,
            &self.last_publish,
            &self.cycles,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.link_up.store(false, Ordering::Relaxed);
        self.session_up.store(false, Ordering::Relaxed);
        if let Ok(mut times) = self.cycle_times.lock() {
            times.clear();
        }
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
    }

    fn cycle_statistics(&self) -> (f64, f64, u64) {
        let Ok(times) = self.cycle_times.lock() else {
            return (0.0, 0.0, 0);
        };
        let mut sorted = times.clone();
        sorted.sort_unstable();
        (
            percentile(&sorted, 50.0),
            percentile(&sorted, 95.0),
            sorted.last().copied().unwrap_or(0),
        )
    }

    /// Get current metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (cycle_p50_us, cycle_p95_us, cycle_max_us) = self.cycle_statistics();

        MetricsSnapshot {
            timestamp: now,
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            link: LinkMetrics {
                connected: self.link_up.load(Ordering::Relaxed),
                connect_attempts: self.link_connect_attempts.load(Ordering::Relaxed),
                connects: self.link_connects.load(Ordering::Relaxed),
                connect_failures: self.link_connect_failures.load(Ordering::Relaxed),
                drops: self.link_drops.load(Ordering::Relaxed),
            },
            session: SessionMetrics {
                connected: self.session_up.load(Ordering::Relaxed),
                open_attempts: self.session_open_attempts.load(Ordering::Relaxed),
                established: self.sessions_established.load(Ordering::Relaxed),
                failures: self.session_failures.load(Ordering::Relaxed),
                drops: self.session_drops.load(Ordering::Relaxed),
                messages_received: self.messages_received.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
            },
            telemetry: TelemetryMetrics {
                samples_enqueued: self.samples_enqueued.load(Ordering::Relaxed),
                samples_published: self.samples_published.load(Ordering::Relaxed),
                samples_dropped: self.samples_dropped.load(Ordering::Relaxed),
                buffer_depth: self.buffer_depth.load(Ordering::Relaxed),
                last_publish: self.last_publish.load(Ordering::Relaxed),
            },
            supervisor: SupervisorMetrics {
                cycles: self.cycles.load(Ordering::Relaxed),
                cycle_p50_us,
                cycle_p95_us,
                cycle_max_us,
            },
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
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
        let lower_value = sorted_data[index.floor() as usize] as f64;
        let upper_value = sorted_data[index.ceil() as usize] as f64;
        lower_value + (upper_value - lower_value) * index.fract()
    }
}
