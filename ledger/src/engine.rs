//! Transfer engine: settlements, transfers and the audit passes over the store.

use std::future::Future;
use std::sync::Arc;

use futures::stream::{BoxStream, TryStreamExt};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use tracing::{error, info, instrument, warn};

use aurapay_common::{AccountId, LedgerError, Money, Result, SettlementId};

use crate::account::{self, Account};
use crate::config::{LedgerConfig, StalePendingPolicy};
use crate::fee::FeePolicy;
use crate::journal::{self, EntryReason, HistoryOrder, LedgerEntry};
use crate::lock_manager::AccountLockManager;
use crate::metrics::{LedgerMetrics, MetricsSnapshot};
use crate::settlement::{self, Claim, SettlementRecord};
use crate::store::{storage_error, LedgerStore};
use crate::transfer;

/// Result of presenting a settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementOutcome {
    /// The account was credited by this call.
    Credited(SettlementRecord),
    /// The settlement id was credited earlier; nothing changed.
    AlreadySettled(SettlementRecord),
}

impl SettlementOutcome {
    pub fn record(&self) -> &SettlementRecord {
        match self {
            SettlementOutcome::Credited(record) | SettlementOutcome::AlreadySettled(record) => {
                record
            }
        }
    }

    pub fn net(&self) -> Money {
        self.record().net
    }

    pub fn is_already_settled(&self) -> bool {
        matches!(self, SettlementOutcome::AlreadySettled(_))
    }
}

/// A request to move funds between two accounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub from: AccountId,
    pub to: AccountId,
    pub amount: Money,
    /// Free-text reason stored on both entries.
    pub memo: Option<String>,
    /// Makes the transfer safe to retry.
    pub idempotency_key: Option<String>,
}

impl TransferRequest {
    pub fn new(from: AccountId, to: AccountId, amount: Money) -> Self {
        Self {
            from,
            to,
            amount,
            memo: None,
            idempotency_key: None,
        }
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Balances after a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub from_balance: Money,
    pub to_balance: Money,
    /// True when an idempotency key matched an earlier transfer and nothing moved.
    pub replayed: bool,
}

/// An account whose stored balance disagrees with its entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceMismatch {
    pub account_id: AccountId,
    pub stored: Money,
    pub recomputed: Money,
}

/// Result of a full ledger audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    pub accounts_checked: usize,
    /// Sum of all stored balances.
    pub total_balance: Money,
    /// Sum of net amounts over settled settlements.
    pub settled_net_total: Money,
    /// Sum of all deposit entries.
    pub deposit_total: Money,
    pub pending_settlements: usize,
    pub mismatches: Vec<BalanceMismatch>,
}

impl AuditReport {
    /// Every balance matches its entries, and funds equal what was deposited.
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty()
            && self.settled_net_total == self.deposit_total
            && self.total_balance == self.deposit_total
    }
}

/// A pending settlement the reconciliation pass could not finish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileFailure {
    pub settlement_id: SettlementId,
    pub error: String,
}

/// Result of a reconciliation pass over pending settlements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub examined: usize,
    /// Credited by this pass.
    pub retried: Vec<SettlementId>,
    /// Left pending for an operator.
    pub flagged: Vec<SettlementId>,
    pub failed: Vec<ReconcileFailure>,
}

/// Keep rejected amounts, store faults, deadlines and invariant breaks as they are; anything else
/// that stops a settlement midway is a settlement failure.
fn settlement_failure(settlement_id: &SettlementId, err: LedgerError) -> LedgerError {
    match err {
        LedgerError::InvalidAmount(_)
        | LedgerError::StorageUnavailable(_)
        | LedgerError::DuplicateEntry(_)
        | LedgerError::Timeout(_)
        | LedgerError::SettlementFailed { .. } => err,
        other => LedgerError::SettlementFailed {
            settlement_id: settlement_id.clone(),
            reason: other.to_string(),
        },
    }
}

/// The ledger engine.
///
/// Every write locks the accounts it touches, then runs one database
/// transaction. Balances are never cached; every read goes to the store.
pub struct LedgerEngine {
    store: LedgerStore,
    locks: AccountLockManager,
    fee_policy: FeePolicy,
    config: LedgerConfig,
    metrics: Arc<LedgerMetrics>,
}

impl LedgerEngine {
    /// Build an engine over an open store.
    pub fn new(store: LedgerStore, config: LedgerConfig) -> Result<Self> {
        config.validate().map_err(LedgerError::Configuration)?;
        let fee_policy = FeePolicy::new(config.fee.rate_bps, config.fee.basis)
            .map_err(|e| LedgerError::Configuration(e.to_string()))?;

        Ok(Self {
            store,
            locks: AccountLockManager::new(config.limits.lock_table_soft_limit),
            fee_policy,
            config,
            metrics: Arc::new(LedgerMetrics::new()),
        })
    }

    /// Open the configured store and build an engine over it.
    pub async fn connect(config: LedgerConfig) -> Result<Self> {
        config.validate().map_err(LedgerError::Configuration)?;
        let store = LedgerStore::connect(&config.store).await?;
        Self::new(store, config)
    }

    /// Engine over a private in-memory store with default settings.
    pub async fn in_memory() -> Result<Self> {
        Self::connect(LedgerConfig::in_memory()).await
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn fee_policy(&self) -> &FeePolicy {
        &self.fee_policy
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    async fn with_deadline<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let deadline = self.config.limits.operation_timeout;
        let result = match tokio::time::timeout(deadline, fut).await {
            Ok(result) => result,
            Err(_) => {
                self.metrics.timeout();
                warn!(operation, timeout_ms = deadline.as_millis() as u64, "Operation deadline elapsed");
                Err(LedgerError::Timeout(format!(
                    "{operation} exceeded {}ms",
                    deadline.as_millis()
                )))
            }
        };

        if let Err(LedgerError::StorageUnavailable(reason)) = &result {
            self.metrics.storage_error();
            error!(operation, reason = %reason, "Ledger store unavailable");
        }
        result
    }

    fn check_positive(amount: Money) -> Result<()> {
        if !amount.is_positive() {
            return Err(LedgerError::InvalidAmount(format!(
                "amount must be positive, got {amount}"
            )));
        }
        Ok(())
    }

    fn check_limit(&self, amount: Money) -> Result<()> {
        let max = self.config.limits.max_transaction;
        if amount > max {
            return Err(LedgerError::InvalidAmount(format!(
                "amount {amount} exceeds maximum {max}"
            )));
        }
        Ok(())
    }

    fn check_amount(&self, amount: Money) -> Result<()> {
        Self::check_positive(amount)?;
        self.check_limit(amount)
    }

    /// Amount to charge a payer so that `requested` is credited.
    ///
    /// The quoted gross itself must be settleable, so it is held to the
    /// transaction limit as well.
    pub fn quote(&self, requested: Money) -> Result<Money> {
        self.check_amount(requested)?;
        let gross = self.fee_policy.quote(requested)?;
        self.check_limit(gross)?;
        Ok(gross)
    }

    /// Credit an account from a captured external payment, at most once per settlement id.
    #[instrument(skip_all, fields(account = %account_id, settlement = %settlement_id, gross = %gross))]
    pub async fn settle_external_payment(
        &self,
        account_id: &AccountId,
        settlement_id: &SettlementId,
        gross: Money,
    ) -> Result<SettlementOutcome> {
        Self::check_positive(gross)?;

        let result = self
            .with_deadline("settle", async {
                let _locks = self.locks.acquire(&[account_id]).await;
                self.settle_locked(account_id, settlement_id, gross).await
            })
            .await
            .map_err(|err| settlement_failure(settlement_id, err));

        match &result {
            Ok(SettlementOutcome::Credited(record)) => {
                self.metrics.settlement_credited();
                info!(net = %record.net, fee = %record.fee, "Settlement credited");
            }
            Ok(SettlementOutcome::AlreadySettled(record)) => {
                self.metrics.settlement_duplicate();
                info!(net = %record.net, "Settlement already credited");
            }
            Err(err) => {
                self.metrics.settlement_failed();
                warn!(error = %err, code = err.error_code(), "Settlement failed");
            }
        }
        result
    }

    async fn settle_locked(
        &self,
        account_id: &AccountId,
        settlement_id: &SettlementId,
        gross: Money,
    ) -> Result<SettlementOutcome> {
        let mut tx = self.store.begin().await?;

        let record = match settlement::try_begin(&mut tx, settlement_id, account_id, gross).await? {
            Claim::Fresh => {
                // The limit applies to new settlements only.
                self.check_limit(gross)?;
                self.credit(&mut tx, account_id, settlement_id, gross).await?
            }
            Claim::AlreadySettled(existing) => {
                if existing.account_id != *account_id || existing.gross != gross {
                    warn!(
                        recorded_account = %existing.account_id,
                        recorded_gross = %existing.gross,
                        "Settlement re-presented with different details, returning recorded result"
                    );
                }
                return Ok(SettlementOutcome::AlreadySettled(existing));
            }
            Claim::StalePending(pending) => match self.config.stale_pending_policy {
                StalePendingPolicy::FlagForReview => {
                    return Err(LedgerError::SettlementFailed {
                        settlement_id: settlement_id.clone(),
                        reason: "settlement is pending review".to_string(),
                    });
                }
                StalePendingPolicy::Retry => {
                    if pending.account_id != *account_id {
                        return Err(LedgerError::SettlementFailed {
                            settlement_id: settlement_id.clone(),
                            reason: format!("pending settlement belongs to {}", pending.account_id),
                        });
                    }
                    warn!(recorded_gross = %pending.gross, "Retrying stale pending settlement");
                    self.credit(&mut tx, account_id, settlement_id, pending.gross)
                        .await?
                }
            },
        };

        tx.commit().await.map_err(storage_error)?;
        Ok(SettlementOutcome::Credited(record))
    }

    /// Apply a claimed settlement: split, credit, log, mark settled.
    async fn credit(
        &self,
        conn: &mut SqliteConnection,
        account_id: &AccountId,
        settlement_id: &SettlementId,
        gross: Money,
    ) -> Result<SettlementRecord> {
        let split = self.fee_policy.split(gross)?;

        account::get_or_create(conn, account_id).await?;
        account::apply_delta(conn, account_id, split.net).await?;
        journal::append(
            conn,
            LedgerEntry::deposit(account_id.clone(), split.net, settlement_id.clone()),
        )
        .await?;
        settlement::commit(conn, settlement_id, &split).await
    }

    /// Move funds between two accounts. Debit precedes credit; both commit or neither does.
    #[instrument(skip(self, request), fields(from = %request.from, to = %request.to, amount = %request.amount))]
    pub async fn transfer(&self, request: TransferRequest) -> Result<TransferOutcome> {
        if request.from == request.to {
            return Err(LedgerError::InvalidAmount(
                "cannot transfer to the same account".to_string(),
            ));
        }
        self.check_amount(request.amount)?;
        if let Some(key) = &request.idempotency_key {
            if key.trim().is_empty() {
                return Err(LedgerError::InvalidIdentifier {
                    kind: "idempotency key",
                    value: key.clone(),
                });
            }
        }

        let result = self
            .with_deadline("transfer", async {
                let _locks = self.locks.acquire(&[&request.from, &request.to]).await;
                self.transfer_locked(&request).await
            })
            .await;

        match &result {
            Ok(outcome) if outcome.replayed => {
                info!("Transfer replayed from idempotency key");
            }
            Ok(outcome) => {
                self.metrics.transfer_committed();
                info!(from_balance = %outcome.from_balance, to_balance = %outcome.to_balance, "Transfer committed");
            }
            Err(err) => {
                self.metrics.transfer_rejected();
                warn!(error = %err, code = err.error_code(), "Transfer rejected");
            }
        }
        result
    }

    async fn transfer_locked(&self, request: &TransferRequest) -> Result<TransferOutcome> {
        let mut tx = self.store.begin().await?;

        let mut touched = [&request.from, &request.to];
        touched.sort();
        for account_id in touched {
            account::get_or_create(&mut tx, account_id).await?;
        }

        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = transfer::find(&mut tx, key).await? {
                if !existing.matches(&request.from, &request.to, request.amount) {
                    return Err(LedgerError::IdempotencyKeyReused(key.clone()));
                }
                return Ok(TransferOutcome {
                    from_balance: existing.from_balance,
                    to_balance: existing.to_balance,
                    replayed: true,
                });
            }
        }

        let from_balance =
            account::apply_delta(&mut tx, &request.from, request.amount.negate()?).await?;
        let to_balance = account::apply_delta(&mut tx, &request.to, request.amount).await?;

        let debit = LedgerEntry::transfer_out(
            request.from.clone(),
            request.amount,
            request.to.clone(),
            request.memo.clone(),
        )?;
        let credit = LedgerEntry::transfer_in(
            request.to.clone(),
            request.amount,
            request.from.clone(),
            request.memo.clone(),
        );
        journal::append(&mut tx, debit).await?;
        journal::append(&mut tx, credit).await?;

        if let Some(key) = &request.idempotency_key {
            transfer::record(
                &mut tx,
                key,
                &request.from,
                &request.to,
                request.amount,
                (from_balance, to_balance),
            )
            .await?;
        }

        tx.commit().await.map_err(storage_error)?;
        Ok(TransferOutcome {
            from_balance,
            to_balance,
            replayed: false,
        })
    }

    /// Stored balance. Unknown accounts read as zero and are not created.
    pub async fn balance(&self, account_id: &AccountId) -> Result<Money> {
        Ok(self
            .account(account_id)
            .await?
            .map_or(Money::ZERO, |account| account.balance))
    }

    /// Look up an account without creating it.
    pub async fn account(&self, account_id: &AccountId) -> Result<Option<Account>> {
        self.with_deadline("balance", async {
            let mut tx = self.store.begin().await?;
            account::find(&mut tx, account_id).await
        })
        .await
    }

    /// Look up a settlement by id.
    pub async fn settlement(&self, settlement_id: &SettlementId) -> Result<Option<SettlementRecord>> {
        self.with_deadline("settlement", async {
            let mut tx = self.store.begin().await?;
            settlement::find(&mut tx, settlement_id).await
        })
        .await
    }

    /// Stream an account's entries. Not bounded by the operation deadline.
    pub fn history<'a>(
        &'a self,
        account_id: &'a AccountId,
        limit: Option<usize>,
        order: HistoryOrder,
    ) -> BoxStream<'a, Result<LedgerEntry>> {
        journal::list_by_account(
            self.store.pool(),
            account_id,
            limit,
            order,
            self.config.limits.history_page_size as usize,
        )
    }

    /// Up to `limit` most recent entries, newest first.
    pub async fn recent_history(&self, account_id: &AccountId, limit: usize) -> Result<Vec<LedgerEntry>> {
        self.with_deadline(
            "history",
            self.history(account_id, Some(limit), HistoryOrder::NewestFirst)
                .try_collect(),
        )
        .await
    }

    /// Number of ledger entries for an account.
    pub async fn entry_count(&self, account_id: &AccountId) -> Result<u64> {
        self.with_deadline("entry_count", async {
            let mut tx = self.store.begin().await?;
            journal::count_for_account(&mut tx, account_id).await
        })
        .await
    }

    /// Replay an account's entries.
    pub async fn recompute_balance(&self, account_id: &AccountId) -> Result<Money> {
        self.with_deadline("recompute", async {
            let mut tx = self.store.begin().await?;
            journal::recompute_balance(&mut tx, account_id).await
        })
        .await
    }

    /// Compare every stored balance with its entries and check funds against deposits.
    #[instrument(skip(self))]
    pub async fn audit(&self) -> Result<AuditReport> {
        let report = self
            .with_deadline("audit", async {
                let mut tx = self.store.begin().await?;
                let accounts = account::list(&mut tx).await?;

                let mut total_balance = Money::ZERO;
                let mut mismatches = Vec::new();
                for account in &accounts {
                    total_balance = total_balance.checked_add(account.balance)?;
                    let recomputed = journal::recompute_balance(&mut tx, &account.id).await?;
                    if recomputed != account.balance {
                        error!(
                            account = %account.id,
                            stored = %account.balance,
                            recomputed = %recomputed,
                            "Balance does not match ledger entries"
                        );
                        mismatches.push(BalanceMismatch {
                            account_id: account.id.clone(),
                            stored: account.balance,
                            recomputed,
                        });
                    }
                }

                Ok(AuditReport {
                    accounts_checked: accounts.len(),
                    total_balance,
                    settled_net_total: settlement::settled_net_total(&mut tx).await?,
                    deposit_total: journal::total_by_reason(&mut tx, EntryReason::Deposit).await?,
                    pending_settlements: settlement::list_pending(&mut tx).await?.len(),
                    mismatches,
                })
            })
            .await?;

        if report.is_consistent() {
            info!(
                accounts = report.accounts_checked,
                total = %report.total_balance,
                pending = report.pending_settlements,
                "Ledger audit passed"
            );
        } else {
            error!(
                mismatches = report.mismatches.len(),
                settled = %report.settled_net_total,
                deposits = %report.deposit_total,
                total = %report.total_balance,
                "Ledger audit failed"
            );
        }
        Ok(report)
    }

    /// Finish or flag settlements left PENDING, according to the stale-pending policy.
    #[instrument(skip(self))]
    pub async fn reconcile_pending(&self) -> Result<ReconciliationReport> {
        let pending = self
            .with_deadline("reconcile", async {
                let mut tx = self.store.begin().await?;
                settlement::list_pending(&mut tx).await
            })
            .await?;

        let mut report = ReconciliationReport {
            examined: pending.len(),
            ..Default::default()
        };

        for record in pending {
            match self.config.stale_pending_policy {
                StalePendingPolicy::FlagForReview => {
                    warn!(
                        settlement = %record.settlement_id,
                        account = %record.account_id,
                        gross = %record.gross,
                        "Pending settlement flagged for review"
                    );
                    report.flagged.push(record.settlement_id);
                }
                StalePendingPolicy::Retry => {
                    let retried = self
                        .with_deadline("reconcile", async {
                            let _locks = self.locks.acquire(&[&record.account_id]).await;
                            self.retry_pending(&record).await
                        })
                        .await;

                    match retried {
                        Ok(Some(credited)) => {
                            self.metrics.settlement_credited();
                            info!(settlement = %credited.settlement_id, net = %credited.net, "Pending settlement credited");
                            report.retried.push(credited.settlement_id);
                        }
                        Ok(None) => {}
                        Err(err) => {
                            self.metrics.settlement_failed();
                            error!(settlement = %record.settlement_id, error = %err, "Pending settlement retry failed");
                            report.failed.push(ReconcileFailure {
                                settlement_id: record.settlement_id,
                                error: err.to_string(),
                            });
                        }
                    }
                }
            }
        }

        info!(
            examined = report.examined,
            retried = report.retried.len(),
            flagged = report.flagged.len(),
            failed = report.failed.len(),
            "Reconciliation finished"
        );
        Ok(report)
    }

    /// Credit a pending settlement unless someone else already has.
    async fn retry_pending(&self, pending: &SettlementRecord) -> Result<Option<SettlementRecord>> {
        let mut tx = self.store.begin().await?;

        let claim = settlement::try_begin(
            &mut tx,
            &pending.settlement_id,
            &pending.account_id,
            pending.gross,
        )
        .await?;

        match claim {
            Claim::StalePending(current) => {
                let record = self
                    .credit(&mut tx, &current.account_id, &current.settlement_id, current.gross)
                    .await?;
                tx.commit().await.map_err(storage_error)?;
                Ok(Some(record))
            }
            Claim::AlreadySettled(_) => Ok(None),
            Claim::Fresh => Err(LedgerError::SettlementFailed {
                settlement_id: pending.settlement_id.clone(),
                reason: "pending settlement disappeared".to_string(),
            }),
        }
    }
}
