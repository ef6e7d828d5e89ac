//! AuraPay Ledger Engine
//!
//! Durable account balances with an append-only ledger, exactly-once crediting
//! of external settlements, and atomic account-to-account transfers.

pub mod account;
pub mod config;
pub mod engine;
pub mod fee;
pub mod journal;
pub mod lock_manager;
pub mod metrics;
pub mod service;
pub mod settlement;
pub mod store;
pub mod transfer;

pub use account::Account;
pub use config::{FeeConfig, LedgerConfig, LimitsConfig, StalePendingPolicy, StoreConfig};
pub use engine::{
    AuditReport, BalanceMismatch, LedgerEngine, ReconcileFailure, ReconciliationReport,
    SettlementOutcome, TransferOutcome, TransferRequest,
};
pub use fee::{FeeBasis, FeePolicy, FeeSplit};
pub use journal::{EntryReason, HistoryOrder, LedgerEntry};
pub use metrics::{LedgerMetrics, MetricsSnapshot};
pub use service::{
    AuditView, LedgerEntryView, LedgerService, MismatchView, SettlementReceipt, TransferReceipt,
};
pub use settlement::{SettlementRecord, SettlementStatus};
pub use store::LedgerStore;
pub use transfer::TransferRecord;
