//! Simulation metrics.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use serde::Serialize;

use bank_common::BankError;

/// Simulation metrics.
#[derive(Debug, Clone)]
pub struct SimulationMetrics {
    /// Total transfers attempted.
    pub total_transfers: u64,
    /// Committed transfers.
    pub successful_transfers: u64,
    /// Failed or rejected transfers.
    pub failed_transfers: u64,
    /// Failures by error code.
    pub failures_by_code: BTreeMap<&'static str, u64>,
    /// Latency samples (microseconds).
    latency_samples: VecDeque<u64>,
    /// Maximum samples to keep.
    max_samples: usize,
}

impl SimulationMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self {
            total_transfers: 0,
            successful_transfers: 0,
            failed_transfers: 0,
            failures_by_code: BTreeMap::new(),
            latency_samples: VecDeque::with_capacity(10000),
            max_samples: 10000,
        }
    }

    /// Record a committed transfer.
    pub fn record_success(&mut self, latency: Duration) {
        self.total_transfers += 1;
        self.successful_transfers += 1;

        if self.latency_samples.len() >= self.max_samples {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(latency.as_micros() as u64);
    }

    /// Record a failed transfer.
    pub fn record_failure(&mut self, error: &BankError) {
        self.total_transfers += 1;
        self.failed_transfers += 1;
        *self.failures_by_code.entry(error.error_code()).or_default() += 1;
    }

    /// Get average latency in microseconds.
    pub fn average_latency_us(&self) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let sum: u64 = self.latency_samples.iter().sum();
        sum / self.latency_samples.len() as u64
    }

    pub fn p50_latency_us(&self) -> u64 {
        self.percentile_latency(50)
    }

    pub fn p99_latency_us(&self) -> u64 {
        self.percentile_latency(99)
    }

    fn percentile_latency(&self, percentile: usize) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let mut sorted: Vec<_> = self.latency_samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (sorted.len() * percentile / 100).min(sorted.len() - 1);
        sorted[idx]
    }

    /// Get success rate.
    pub fn success_rate(&self) -> f64 {
        if self.total_transfers == 0 {
            return 0.0;
        }

        self.successful_transfers as f64 / self.total_transfers as f64
    }

    /// Transfers per second over `elapsed`.
    pub fn throughput(&self, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }

        self.total_transfers as f64 / secs
    }

    /// Summarise for the final report.
    pub fn summary(&self, elapsed: Duration) -> MetricsSummary {
        MetricsSummary {
            total_transfers: self.total_transfers,
            successful_transfers: self.successful_transfers,
            failed_transfers: self.failed_transfers,
            failures_by_code: self.failures_by_code.clone(),
            success_rate: self.success_rate(),
            throughput_per_sec: self.throughput(elapsed),
            average_latency_us: self.average_latency_us(),
            p50_latency_us: self.p50_latency_us(),
            p99_latency_us: self.p99_latency_us(),
        }
    }
}

impl Default for SimulationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable metrics summary.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub total_transfers: u64,
    pub successful_transfers: u64,
    pub failed_transfers: u64,
    pub failures_by_code: BTreeMap<&'static str, u64>,
    pub success_rate: f64,
    pub throughput_per_sec: f64,
    pub average_latency_us: u64,
    pub p50_latency_us: u64,
    pub p99_latency_us: u64,
}
