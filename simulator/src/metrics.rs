//! Simulation metrics.

use std::collections::VecDeque;

use serde::Serialize;

/// Outcome counters and latency samples for one run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationMetrics {
    /// Settlements that credited an account.
    pub settlements_credited: u64,
    /// Redeliveries answered from the idempotency ledger.
    pub settlements_duplicate: u64,
    /// Transfers committed.
    pub transfers_committed: u64,
    /// Transfers refused for insufficient funds.
    pub transfers_insufficient: u64,
    /// Any other failure.
    pub errors: u64,
    #[serde(skip)]
    latency_samples: VecDeque<u64>,
    #[serde(skip)]
    max_samples: usize,
}

impl SimulationMetrics {
    pub fn new() -> Self {
        Self {
            settlements_credited: 0,
            settlements_duplicate: 0,
            transfers_committed: 0,
            transfers_insufficient: 0,
            errors: 0,
            latency_samples: VecDeque::with_capacity(10000),
            max_samples: 10000,
        }
    }

    fn sample(&mut self, latency_us: u64) {
        if self.latency_samples.len() >= self.max_samples {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(latency_us);
    }

    pub fn record_settlement(&mut self, duplicate: bool, latency_us: u64) {
        if duplicate {
            self.settlements_duplicate += 1;
        } else {
            self.settlements_credited += 1;
        }
        self.sample(latency_us);
    }

    pub fn record_transfer(&mut self, latency_us: u64) {
        self.transfers_committed += 1;
        self.sample(latency_us);
    }

    pub fn record_insufficient(&mut self, latency_us: u64) {
        self.transfers_insufficient += 1;
        self.sample(latency_us);
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    /// Operations attempted.
    pub fn total_operations(&self) -> u64 {
        self.settlements_credited
            + self.settlements_duplicate
            + self.transfers_committed
            + self.transfers_insufficient
            + self.errors
    }

    /// Average latency in microseconds.
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
}

impl Default for SimulationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics() {
        let mut metrics = SimulationMetrics::new();

        metrics.record_settlement(false, 100);
        metrics.record_settlement(true, 200);
        metrics.record_transfer(150);
        metrics.record_insufficient(50);
        metrics.record_error();

        assert_eq!(metrics.total_operations(), 5);
        assert_eq!(metrics.settlements_credited, 1);
        assert_eq!(metrics.settlements_duplicate, 1);
        assert_eq!(metrics.average_latency_us(), 125);
        assert_eq!(metrics.p50_latency_us(), 150);
        assert_eq!(metrics.p99_latency_us(), 200);
    }
}
