//! Decimal-string boundary over the engine.
//!
//! Hosting applications pass amounts and identifiers as strings and get back
//! serializable receipts. Amounts in every view are rendered with exactly two
//! fractional digits.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use aurapay_common::{AccountId, Money, Result, SettlementId, Timestamp};

use crate::config::LedgerConfig;
use crate::engine::{AuditReport, LedgerEngine, ReconciliationReport, TransferRequest};
use crate::journal::{EntryReason, LedgerEntry};

/// Result of presenting a settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementReceipt {
    pub settlement_id: String,
    pub account_id: String,
    pub gross_amount: String,
    pub net_amount: String,
    pub fee: String,
    /// The id had been credited before this call.
    pub already_settled: bool,
}

/// Balances after a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub from: String,
    pub to: String,
    pub amount: String,
    pub from_balance: String,
    pub to_balance: String,
    pub replayed: bool,
}

/// One history line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntryView {
    pub entry_id: String,
    /// Signed amount.
    pub amount: String,
    pub reason: EntryReason,
    pub timestamp: Timestamp,
    pub counterparty: Option<String>,
    pub settlement_id: Option<String>,
    pub memo: Option<String>,
}

impl From<LedgerEntry> for LedgerEntryView {
    fn from(entry: LedgerEntry) -> Self {
        Self {
            entry_id: entry.id.to_string(),
            amount: entry.amount.to_string(),
            reason: entry.reason,
            timestamp: entry.created_at,
            counterparty: entry.counterparty.map(|c| c.to_string()),
            settlement_id: entry.settlement_id.map(|s| s.to_string()),
            memo: entry.memo,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MismatchView {
    pub account_id: String,
    pub stored: String,
    pub recomputed: String,
}

/// Audit result with amounts as decimal strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditView {
    pub consistent: bool,
    pub accounts_checked: usize,
    pub total_balance: String,
    pub settled_net_total: String,
    pub deposit_total: String,
    pub pending_settlements: usize,
    pub mismatches: Vec<MismatchView>,
}

impl From<AuditReport> for AuditView {
    fn from(report: AuditReport) -> Self {
        Self {
            consistent: report.is_consistent(),
            accounts_checked: report.accounts_checked,
            total_balance: report.total_balance.to_string(),
            settled_net_total: report.settled_net_total.to_string(),
            deposit_total: report.deposit_total.to_string(),
            pending_settlements: report.pending_settlements,
            mismatches: report
                .mismatches
                .into_iter()
                .map(|m| MismatchView {
                    account_id: m.account_id.to_string(),
                    stored: m.stored.to_string(),
                    recomputed: m.recomputed.to_string(),
                })
                .collect(),
        }
    }
}

/// String-typed front of the ledger.
#[derive(Clone)]
pub struct LedgerService {
    engine: Arc<LedgerEngine>,
}

impl LedgerService {
    pub fn new(engine: Arc<LedgerEngine>) -> Self {
        Self { engine }
    }

    /// Open the configured store and wrap a new engine.
    pub async fn connect(config: LedgerConfig) -> Result<Self> {
        Ok(Self::new(Arc::new(LedgerEngine::connect(config).await?)))
    }

    pub fn engine(&self) -> &Arc<LedgerEngine> {
        &self.engine
    }

    fn parse_amount(&self, amount: &str) -> Result<Money> {
        Ok(Money::from_decimal_str(
            amount.trim(),
            self.engine.config().limits.max_transaction,
        )?)
    }

    /// Credit `account_id` from a captured payment. Safe to call repeatedly.
    pub async fn settle_external_payment(
        &self,
        account_id: &str,
        settlement_id: &str,
        gross_amount: &str,
    ) -> Result<SettlementReceipt> {
        let account = AccountId::new(account_id)?;
        let settlement = SettlementId::new(settlement_id)?;
        // The engine applies the limit to new settlements only.
        let gross: Money = gross_amount.trim().parse()?;

        let outcome = self
            .engine
            .settle_external_payment(&account, &settlement, gross)
            .await?;
        let already_settled = outcome.is_already_settled();
        let record = outcome.record();

        Ok(SettlementReceipt {
            settlement_id: record.settlement_id.to_string(),
            account_id: record.account_id.to_string(),
            gross_amount: record.gross.to_string(),
            net_amount: record.net.to_string(),
            fee: record.fee.to_string(),
            already_settled,
        })
    }

    /// Move funds between accounts.
    pub async fn transfer(
        &self,
        from: &str,
        to: &str,
        amount: &str,
        reason: Option<&str>,
        idempotency_key: Option<&str>,
    ) -> Result<TransferReceipt> {
        let amount = self.parse_amount(amount)?;
        let mut request = TransferRequest::new(AccountId::new(from)?, AccountId::new(to)?, amount);
        if let Some(reason) = reason.filter(|r| !r.trim().is_empty()) {
            request = request.with_memo(reason.trim());
        }
        if let Some(key) = idempotency_key {
            request = request.with_idempotency_key(key);
        }

        let outcome = self.engine.transfer(request.clone()).await?;

        Ok(TransferReceipt {
            from: request.from.to_string(),
            to: request.to.to_string(),
            amount: amount.to_string(),
            from_balance: outcome.from_balance.to_string(),
            to_balance: outcome.to_balance.to_string(),
            replayed: outcome.replayed,
        })
    }

    /// Current balance as a decimal string.
    pub async fn get_balance(&self, account_id: &str) -> Result<String> {
        let account = AccountId::new(account_id)?;
        Ok(self.engine.balance(&account).await?.to_string())
    }

    /// Most recent entries first.
    pub async fn list_history(&self, account_id: &str, limit: usize) -> Result<Vec<LedgerEntryView>> {
        let account = AccountId::new(account_id)?;
        let entries = self.engine.recent_history(&account, limit).await?;
        Ok(entries.into_iter().map(LedgerEntryView::from).collect())
    }

    /// Amount to charge a payer so that `requested_net` is credited.
    pub fn quote_charge(&self, requested_net: &str) -> Result<String> {
        let requested = self.parse_amount(requested_net)?;
        Ok(self.engine.quote(requested)?.to_string())
    }

    pub async fn audit(&self) -> Result<AuditView> {
        Ok(self.engine.audit().await?.into())
    }

    pub async fn reconcile_pending(&self) -> Result<ReconciliationReport> {
        self.engine.reconcile_pending().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn service() -> LedgerService {
        LedgerService::connect(LedgerConfig::in_memory()).await.unwrap()
    }

    #[tokio::test]
    async fn test_settlement_receipts() {
        let service = service().await;

        let receipt = service
            .settle_external_payment("alice@example.com", "S1", "101.00")
            .await
            .unwrap();
        assert_eq!(receipt.net_amount, "100.00");
        assert_eq!(receipt.fee, "1.00");
        assert!(!receipt.already_settled);

        let again = service
            .settle_external_payment("alice@example.com", "S1", "101")
            .await
            .unwrap();
        assert_eq!(again.net_amount, "100.00");
        assert!(again.already_settled);

        assert_eq!(service.get_balance("alice@example.com").await.unwrap(), "100.00");
    }

    #[tokio::test]
    async fn test_transfer_receipt_and_history() {
        let service = service().await;
        service
            .settle_external_payment("alice", "S1", "101.00")
            .await
            .unwrap();

        let receipt = service
            .transfer("alice", "bob", "30.00", Some("dinner"), None)
            .await
            .unwrap();
        assert_eq!(receipt.from_balance, "70.00");
        assert_eq!(receipt.to_balance, "30.00");

        let history = service.list_history("alice", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].amount, "-30.00");
        assert_eq!(history[0].reason, EntryReason::TransferOut);
        assert_eq!(history[0].counterparty.as_deref(), Some("bob"));
        assert_eq!(history[0].memo.as_deref(), Some("dinner"));
        assert_eq!(history[1].settlement_id.as_deref(), Some("S1"));

        let err = service
            .transfer("alice", "bob", "100.00", None, None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INSUFFICIENT_FUNDS");
        assert_eq!(service.get_balance("alice").await.unwrap(), "70.00");
        assert_eq!(service.get_balance("bob").await.unwrap(), "30.00");
    }

    #[tokio::test]
    async fn test_rejects_malformed_input() {
        let service = service().await;

        for amount in ["1.001", "-5.00", "abc", "", "20000.00"] {
            let err = service
                .settle_external_payment("alice", "S1", amount)
                .await
                .unwrap_err();
            assert_eq!(err.error_code(), "INVALID_AMOUNT", "amount {amount:?}");
        }

        let err = service
            .settle_external_payment("", "S1", "1.00")
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_IDENTIFIER");

        let err = service.get_balance("  ").await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_IDENTIFIER");
    }

    #[tokio::test]
    async fn test_quote_and_audit() {
        let service = service().await;
        assert_eq!(service.quote_charge("100.00").unwrap(), "101.00");

        service
            .settle_external_payment("alice", "S1", "101.00")
            .await
            .unwrap();
        let audit = service.audit().await.unwrap();
        assert!(audit.consistent);
        assert_eq!(audit.total_balance, "100.00");
        assert_eq!(audit.deposit_total, "100.00");

        let reconcile = service.reconcile_pending().await.unwrap();
        assert_eq!(reconcile.examined, 0);
    }

    #[tokio::test]
    async fn test_history_view_serializes() {
        let service = service().await;
        service
            .settle_external_payment("alice", "S1", "10.10")
            .await
            .unwrap();

        let history = service.list_history("alice", 1).await.unwrap();
        let json = serde_json::to_value(&history[0]).unwrap();
        assert_eq!(json["amount"], "10.00");
        assert_eq!(json["reason"], "DEPOSIT");
        assert!(json["timestamp"].is_string());
    }
}
