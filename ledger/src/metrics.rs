//! Operation counters for the ledger engine.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Ledger metrics.
#[derive(Debug, Default)]
pub struct LedgerMetrics {
    /// Settlements that credited an account.
    pub settlements_credited: AtomicU64,
    /// Settlement ids presented again after they were settled.
    pub settlements_duplicate: AtomicU64,
    /// Settlements that failed.
    pub settlements_failed: AtomicU64,
    /// Transfers committed.
    pub transfers_committed: AtomicU64,
    /// Transfers rejected before commit.
    pub transfers_rejected: AtomicU64,
    /// Operations that hit the deadline.
    pub timeouts: AtomicU64,
    /// Operations that failed on the store.
    pub storage_errors: AtomicU64,
}

impl LedgerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settlement_credited(&self) {
        self.settlements_credited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn settlement_duplicate(&self) {
        self.settlements_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    pub fn settlement_failed(&self) {
        self.settlements_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transfer_committed(&self) {
        self.transfers_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transfer_rejected(&self) {
        self.transfers_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn storage_error(&self) {
        self.storage_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            settlements_credited: self.settlements_credited.load(Ordering::Relaxed),
            settlements_duplicate: self.settlements_duplicate.load(Ordering::Relaxed),
            settlements_failed: self.settlements_failed.load(Ordering::Relaxed),
            transfers_committed: self.transfers_committed.load(Ordering::Relaxed),
            transfers_rejected: self.transfers_rejected.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub settlements_credited: u64,
    pub settlements_duplicate: u64,
    pub settlements_failed: u64,
    pub transfers_committed: u64,
    pub transfers_rejected: u64,
    pub timeouts: u64,
    pub storage_errors: u64,
}
