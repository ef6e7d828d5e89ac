//! Ledger configuration.

use std::str::FromStr;
use std::time::Duration;

use aurapay_common::Money;

use crate::fee::FeeBasis;

/// What to do with a committed settlement row that is still PENDING.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StalePendingPolicy {
    /// Redo the credit inside the current transaction.
    Retry,
    /// Leave the row alone and fail the request for manual review.
    FlagForReview,
}

impl FromStr for StalePendingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "retry" => Ok(StalePendingPolicy::Retry),
            "flag" | "review" | "flag-for-review" => Ok(StalePendingPolicy::FlagForReview),
            other => Err(format!("unknown stale pending policy: {other}")),
        }
    }
}

/// Durable store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// SQLite database URL (`sqlite://path.db` or `sqlite::memory:`).
    pub database_url: String,
    /// Maximum pooled connections. Forced to 1 for in-memory databases.
    pub max_connections: u32,
    /// How long a writer waits on a locked database before giving up.
    pub busy_timeout: Duration,
    /// How long to wait for a pooled connection.
    pub acquire_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://aurapay-ledger.db".to_string(),
            max_connections: 8,
            busy_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl StoreConfig {
    /// Single-connection in-memory store, used by tests and the simulator.
    pub fn in_memory() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            max_connections: 1,
            ..Self::default()
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.database_url.contains(":memory:") || self.database_url.contains("mode=memory")
    }
}

/// Platform fee configuration.
#[derive(Debug, Clone)]
pub struct FeeConfig {
    /// Fee rate in basis points (100 = 1%).
    pub rate_bps: u32,
    /// Whether the rate applies to the gross capture or to the net deposit.
    pub basis: FeeBasis,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            rate_bps: 100,
            basis: FeeBasis::Net,
        }
    }
}

/// Request limits.
#[derive(Debug, Clone)]
pub struct LimitsConfig {
    /// Largest amount accepted for one settlement or transfer.
    pub max_transaction: Money,
    /// Deadline for one engine operation.
    pub operation_timeout: Duration,
    /// Rows fetched per page when streaming history.
    pub history_page_size: u32,
    /// Idle account locks are pruned once the lock table grows past this.
    pub lock_table_soft_limit: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_transaction: Money::from_minor(1_000_000),
            operation_timeout: Duration::from_secs(10),
            history_page_size: 100,
            lock_table_soft_limit: 10_000,
        }
    }
}

/// Main ledger configuration.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Store configuration.
    pub store: StoreConfig,
    /// Fee configuration.
    pub fee: FeeConfig,
    /// Limits configuration.
    pub limits: LimitsConfig,
    /// Handling of stale PENDING settlements.
    pub stale_pending_policy: StalePendingPolicy,
    /// Log level.
    pub log_level: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            fee: FeeConfig::default(),
            limits: LimitsConfig::default(),
            stale_pending_policy: StalePendingPolicy::FlagForReview,
            log_level: "info".to_string(),
        }
    }
}

impl LedgerConfig {
    /// Configuration backed by a private in-memory store.
    pub fn in_memory() -> Self {
        Self {
            store: StoreConfig::in_memory(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup. Unparseable values are ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("DATABASE_URL") {
            config.store.database_url = url;
        }

        if let Some(n) = lookup("LEDGER_MAX_CONNECTIONS") {
            if let Ok(n) = n.parse() {
                config.store.max_connections = n;
            }
        }

        if let Some(ms) = lookup("LEDGER_BUSY_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse() {
                config.store.busy_timeout = Duration::from_millis(ms);
            }
        }

        if let Some(bps) = lookup("LEDGER_FEE_RATE_BPS") {
            if let Ok(bps) = bps.parse() {
                config.fee.rate_bps = bps;
            }
        }

        if let Some(basis) = lookup("LEDGER_FEE_BASIS") {
            if let Ok(basis) = basis.parse() {
                config.fee.basis = basis;
            }
        }

        if let Some(max) = lookup("LEDGER_MAX_TRANSACTION") {
            if let Ok(max) = max.parse() {
                config.limits.max_transaction = max;
            }
        }

        if let Some(ms) = lookup("LEDGER_OPERATION_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse() {
                config.limits.operation_timeout = Duration::from_millis(ms);
            }
        }

        if let Some(size) = lookup("LEDGER_HISTORY_PAGE_SIZE") {
            if let Ok(size) = size.parse() {
                config.limits.history_page_size = size;
            }
        }

        if let Some(policy) = lookup("LEDGER_STALE_PENDING_POLICY") {
            if let Ok(policy) = policy.parse() {
                config.stale_pending_policy = policy;
            }
        }

        if let Some(level) = lookup("LOG_LEVEL") {
            config.log_level = level;
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.store.database_url.is_empty() {
            return Err("Database URL cannot be empty".to_string());
        }

        if !self.store.database_url.starts_with("sqlite:") {
            return Err("Only sqlite: database URLs are supported".to_string());
        }

        if self.store.max_connections == 0 {
            return Err("Max connections cannot be 0".to_string());
        }

        if self.fee.rate_bps > 10_000 {
            return Err("Fee rate cannot exceed 10000 basis points".to_string());
        }

        if !self.limits.max_transaction.is_positive() {
            return Err("Maximum transaction must be positive".to_string());
        }

        if self.limits.operation_timeout.is_zero() {
            return Err("Operation timeout cannot be 0".to_string());
        }

        if self.limits.history_page_size == 0 {
            return Err("History page size cannot be 0".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = LedgerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fee.rate_bps, 100);
        assert_eq!(config.fee.basis, FeeBasis::Net);
    }

    #[test]
    fn test_invalid_config() {
        let mut config = LedgerConfig::default();
        config.fee.rate_bps = 10_001;
        assert!(config.validate().is_err());

        let mut config = LedgerConfig::default();
        config.store.database_url = "postgres://localhost/ledger".to_string();
        assert!(config.validate().is_err());

        let mut config = LedgerConfig::default();
        config.limits.max_transaction = Money::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("DATABASE_URL", "sqlite::memory:"),
            ("LEDGER_FEE_RATE_BPS", "250"),
            ("LEDGER_FEE_BASIS", "gross"),
            ("LEDGER_MAX_TRANSACTION", "500.00"),
            ("LEDGER_STALE_PENDING_POLICY", "retry"),
            ("LEDGER_OPERATION_TIMEOUT_MS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let config = LedgerConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));

        assert!(config.store.is_in_memory());
        assert_eq!(config.fee.rate_bps, 250);
        assert_eq!(config.fee.basis, FeeBasis::Gross);
        assert_eq!(config.limits.max_transaction, Money::from_minor(50_000));
        assert_eq!(config.stale_pending_policy, StalePendingPolicy::Retry);
        assert_eq!(config.limits.operation_timeout, Duration::from_secs(10));
    }
}
