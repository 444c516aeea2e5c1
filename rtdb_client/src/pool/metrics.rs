//! Per-connection and pool-level health telemetry, grounded on
//! `ConnectionHealth` / `ConnectionPool.get_pool_metrics` in
//! `examples/original_source/src/spacetimedb_sdk/connection_pool.py`.

use std::collections::VecDeque;

/// Bounds the latency sample ring buffer, matching the Python original's
/// `deque(maxlen=100)`.
const MAX_SAMPLES: usize = 100;

/// Rolling health telemetry for one pooled connection.
#[derive(Debug, Clone)]
pub struct ConnectionHealth {
    latency_samples: VecDeque<f64>,
    successes: u64,
    failures: u64,
    consecutive_failures: u32,
    consecutive_successes: u32,
    avg_latency_ms: f64,
    p95_latency_ms: f64,
    p99_latency_ms: f64,
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self {
            latency_samples: VecDeque::with_capacity(MAX_SAMPLES),
            successes: 0,
            failures: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            avg_latency_ms: 0.0,
            p95_latency_ms: 0.0,
            p99_latency_ms: 0.0,
        }
    }
}

impl ConnectionHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, latency_ms: f64) {
        self.successes += 1;
        self.consecutive_failures = 0;
        self.consecutive_successes += 1;
        if self.latency_samples.len() == MAX_SAMPLES {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(latency_ms);
        self.recompute();
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
        self.consecutive_successes = 0;
        self.consecutive_failures += 1;
    }

    fn recompute(&mut self) {
        let mut sorted: Vec<f64> = self.latency_samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let n = sorted.len();
        self.avg_latency_ms = sorted.iter().sum::<f64>() / n as f64;
        self.p95_latency_ms = percentile(&sorted, 0.95);
        self.p99_latency_ms = percentile(&sorted, 0.99);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn avg_latency_ms(&self) -> f64 {
        self.avg_latency_ms
    }

    pub fn p95_latency_ms(&self) -> f64 {
        self.p95_latency_ms
    }

    pub fn p99_latency_ms(&self) -> f64 {
        self.p99_latency_ms
    }

    /// Fraction of failed operations over the last 100 recorded outcomes
    /// (successes + failures both count toward the window in the Python
    /// original; here we approximate over the retained latency window plus
    /// the running failure count since it last reset to avoid a second
    /// ring buffer for outcomes alone).
    pub fn error_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            return 0.0;
        }
        self.failures as f64 / total as f64
    }
}

fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 - 1.0) * pct).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// A snapshot of one connection's health, for [`PoolMetrics`].
#[derive(Debug, Clone)]
pub struct ConnectionMetrics {
    pub id: u64,
    pub healthy: bool,
    pub active: bool,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub error_rate: f64,
}

/// Aggregated pool-wide telemetry, spec §4.10's observability surface.
#[derive(Debug, Clone, Default)]
pub struct PoolMetrics {
    pub total_connections: usize,
    pub healthy_connections: usize,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub connections: Vec<ConnectionMetrics>,
}
