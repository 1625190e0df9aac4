//! Sender metrics: latency samples and error counters by class.
//!
//! Single producer per worker, concurrent readers via snapshot.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const MAX_SAMPLES: usize = 1024;

/// Rolling window of send latencies.
#[derive(Default)]
pub struct LatencyWindow {
    samples: Mutex<Vec<u64>>,
}

impl LatencyWindow {
    pub fn record(&self, latency: Duration) {
        let mut samples = self.samples.lock().unwrap();
        if samples.len() >= MAX_SAMPLES {
            samples.remove(0);
        }
        samples.push(latency.as_micros() as u64);
    }

    /// (p50, p99) in microseconds over the current window.
    pub fn percentiles(&self) -> (u64, u64) {
        let samples = self.samples.lock().unwrap();
        if samples.is_empty() {
            return (0, 0);
        }
        let mut sorted = samples.clone();
        sorted.sort_unstable();
        let pick = |q: f64| sorted[((sorted.len() - 1) as f64 * q) as usize];
        (pick(0.50), pick(0.99))
    }
}

/// Error counters by class plus in-flight gauge.
#[derive(Default)]
pub struct SenderCounters {
    pub sent: AtomicU64,
    pub not_found: AtomicU64,
    pub stale: AtomicU64,
    pub transient: AtomicU64,
    pub circuit_open: AtomicU64,
    pub circuit_trips: AtomicU64,
    pub active: AtomicU64,
}

impl SenderCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view returned by `GetMetrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub sent: u64,
    pub not_found: u64,
    pub stale: u64,
    pub transient: u64,
    pub circuit_open_rejections: u64,
    pub circuit_trips: u64,
    pub active_operations: u64,
    pub latency_p50_us: u64,
    pub latency_p99_us: u64,
    /// Circuit state per connection with a breaker allocated.
    pub circuits: HashMap<String, String>,
}

/// RAII guard for the in-flight gauge.
pub struct ActiveGuard<'a>(&'a AtomicU64);

impl<'a> ActiveGuard<'a> {
    pub fn enter(gauge: &'a AtomicU64) -> Self {
        gauge.fetch_add(1, Ordering::Relaxed);
        Self(gauge)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_over_window() {
        let window = LatencyWindow::default();
        for ms in 1..=100u64 {
            window.record(Duration::from_millis(ms));
        }
        let (p50, p99) = window.percentiles();
        assert!((45_000..=55_000).contains(&p50), "p50 was {p50}");
        assert!(p99 >= 98_000, "p99 was {p99}");
    }

    #[test]
    fn empty_window_is_zero() {
        let window = LatencyWindow::default();
        assert_eq!(window.percentiles(), (0, 0));
    }

    #[test]
    fn active_guard_tracks_in_flight() {
        let gauge = AtomicU64::new(0);
        {
            let _a = ActiveGuard::enter(&gauge);
            let _b = ActiveGuard::enter(&gauge);
            assert_eq!(gauge.load(Ordering::Relaxed), 2);
        }
        assert_eq!(gauge.load(Ordering::Relaxed), 0);
    }
}
