//! Settlement idempotency ledger.
//!
//! One row per external settlement id. The row is inserted PENDING and flipped
//! to SETTLED in the same transaction that credits the account, so a settlement
//! id credits at most once no matter how often the processor redelivers it.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection};
use tracing::debug;

use aurapay_common::{time, AccountId, LedgerError, Money, Result, SettlementId, Timestamp};

use crate::account::stored_time;
use crate::fee::FeeSplit;
use crate::store::storage_error;

/// Settlement status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementStatus {
    /// Claimed, credit not yet committed.
    Pending,
    /// Credited.
    Settled,
}

impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Pending => "PENDING",
            SettlementStatus::Settled => "SETTLED",
        }
    }
}

impl fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of one external settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub settlement_id: SettlementId,
    /// Account credited.
    pub account_id: AccountId,
    /// Amount captured by the processor.
    pub gross: Money,
    /// Amount credited. Zero while pending.
    pub net: Money,
    /// Fee retained. Zero while pending.
    pub fee: Money,
    pub status: SettlementStatus,
    pub created_at: Timestamp,
    pub settled_at: Option<Timestamp>,
}

#[derive(Debug, FromRow)]
struct SettlementRow {
    id: String,
    account_id: String,
    gross_cents: i64,
    net_cents: i64,
    fee_cents: i64,
    status: String,
    created_at: i64,
    settled_at: Option<i64>,
}

impl TryFrom<SettlementRow> for SettlementRecord {
    type Error = LedgerError;

    fn try_from(row: SettlementRow) -> Result<Self> {
        let status = match row.status.as_str() {
            "PENDING" => SettlementStatus::Pending,
            "SETTLED" => SettlementStatus::Settled,
            other => {
                return Err(LedgerError::StorageUnavailable(format!(
                    "bad settlement status {other}"
                )))
            }
        };

        Ok(Self {
            settlement_id: SettlementId::new(row.id)?,
            account_id: AccountId::new(row.account_id)?,
            gross: Money::from_minor(row.gross_cents),
            net: Money::from_minor(row.net_cents),
            fee: Money::from_minor(row.fee_cents),
            status,
            created_at: stored_time(row.created_at)?,
            settled_at: row.settled_at.map(stored_time).transpose()?,
        })
    }
}

const SELECT_COLUMNS: &str =
    "SELECT id, account_id, gross_cents, net_cents, fee_cents, status, created_at, settled_at FROM settlements";

/// Outcome of claiming a settlement id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// First time this id is seen; a PENDING row now exists in the current transaction.
    Fresh,
    /// Already credited.
    AlreadySettled(SettlementRecord),
    /// A committed PENDING row left by an interrupted writer.
    StalePending(SettlementRecord),
}

/// Claim a settlement id by inserting a PENDING row if none exists.
pub async fn try_begin(
    conn: &mut SqliteConnection,
    settlement_id: &SettlementId,
    account_id: &AccountId,
    gross: Money,
) -> Result<Claim> {
    let inserted = sqlx::query(
        "INSERT INTO settlements (id, account_id, gross_cents, net_cents, fee_cents, status, created_at)
         VALUES (?1, ?2, ?3, 0, 0, 'PENDING', ?4)
         ON CONFLICT(id) DO NOTHING",
    )
    .bind(settlement_id.as_str())
    .bind(account_id.as_str())
    .bind(gross.minor_units())
    .bind(time::to_micros(time::now()))
    .execute(&mut *conn)
    .await
    .map_err(storage_error)?
    .rows_affected();

    if inserted == 1 {
        return Ok(Claim::Fresh);
    }

    let existing = find(conn, settlement_id).await?.ok_or_else(|| {
        LedgerError::StorageUnavailable(format!(
            "settlement {settlement_id} conflicted but is missing"
        ))
    })?;

    debug!(settlement_id = %settlement_id, status = %existing.status, "Settlement id already claimed");
    Ok(match existing.status {
        SettlementStatus::Settled => Claim::AlreadySettled(existing),
        SettlementStatus::Pending => Claim::StalePending(existing),
    })
}

/// Flip a PENDING settlement to SETTLED with its final split.
pub async fn commit(
    conn: &mut SqliteConnection,
    settlement_id: &SettlementId,
    split: &FeeSplit,
) -> Result<SettlementRecord> {
    let row: Option<SettlementRow> = sqlx::query_as(
        "UPDATE settlements
         SET net_cents = ?1, fee_cents = ?2, status = 'SETTLED', settled_at = ?3
         WHERE id = ?4 AND status = 'PENDING'
         RETURNING id, account_id, gross_cents, net_cents, fee_cents, status, created_at, settled_at",
    )
    .bind(split.net.minor_units())
    .bind(split.fee.minor_units())
    .bind(time::to_micros(time::now()))
    .bind(settlement_id.as_str())
    .fetch_optional(&mut *conn)
    .await
    .map_err(storage_error)?;

    match row {
        Some(row) => row.try_into(),
        None => Err(LedgerError::SettlementFailed {
            settlement_id: settlement_id.clone(),
            reason: "settlement is not pending".to_string(),
        }),
    }
}

/// Look up a settlement.
pub async fn find(
    conn: &mut SqliteConnection,
    settlement_id: &SettlementId,
) -> Result<Option<SettlementRecord>> {
    let row: Option<SettlementRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
        .bind(settlement_id.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage_error)?;

    row.map(SettlementRecord::try_from).transpose()
}

/// Committed settlements still PENDING, oldest first.
pub async fn list_pending(conn: &mut SqliteConnection) -> Result<Vec<SettlementRecord>> {
    let rows: Vec<SettlementRow> = sqlx::query_as(&format!(
        "{SELECT_COLUMNS} WHERE status = 'PENDING' ORDER BY created_at, id"
    ))
    .fetch_all(&mut *conn)
    .await
    .map_err(storage_error)?;

    rows.into_iter().map(SettlementRecord::try_from).collect()
}

/// Sum of net amounts over SETTLED rows.
pub async fn settled_net_total(conn: &mut SqliteConnection) -> Result<Money> {
    let total: Option<i64> =
        sqlx::query_scalar("SELECT SUM(net_cents) FROM settlements WHERE status = 'SETTLED'")
            .fetch_one(&mut *conn)
            .await
            .map_err(storage_error)?;

    Ok(Money::from_minor(total.unwrap_or(0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LedgerStore;

    fn ids() -> (SettlementId, AccountId) {
        (SettlementId::new("S1").unwrap(), AccountId::new("alice").unwrap())
    }

    fn split(gross: i64, net: i64) -> FeeSplit {
        FeeSplit {
            gross: Money::from_minor(gross),
            net: Money::from_minor(net),
            fee: Money::from_minor(gross - net),
        }
    }

    #[tokio::test]
    async fn test_claim_then_commit() {
        let store = LedgerStore::in_memory().await.unwrap();
        let (sid, alice) = ids();
        let mut tx = store.begin().await.unwrap();

        let claim = try_begin(&mut tx, &sid, &alice, Money::from_minor(10100)).await.unwrap();
        assert_eq!(claim, Claim::Fresh);

        let record = commit(&mut tx, &sid, &split(10100, 10000)).await.unwrap();
        assert_eq!(record.status, SettlementStatus::Settled);
        assert_eq!(record.net, Money::from_minor(10000));
        assert_eq!(record.fee, Money::from_minor(100));
        assert!(record.settled_at.is_some());
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        match try_begin(&mut tx, &sid, &alice, Money::from_minor(10100)).await.unwrap() {
            Claim::AlreadySettled(existing) => assert_eq!(existing, record),
            other => panic!("unexpected claim: {other:?}"),
        }
        assert_eq!(settled_net_total(&mut tx).await.unwrap(), Money::from_minor(10000));
    }

    #[tokio::test]
    async fn test_rolled_back_claim_leaves_no_row() {
        let store = LedgerStore::in_memory().await.unwrap();
        let (sid, alice) = ids();

        {
            let mut tx = store.begin().await.unwrap();
            try_begin(&mut tx, &sid, &alice, Money::from_minor(500)).await.unwrap();
        }

        let mut tx = store.begin().await.unwrap();
        assert!(find(&mut tx, &sid).await.unwrap().is_none());
        assert_eq!(
            try_begin(&mut tx, &sid, &alice, Money::from_minor(500)).await.unwrap(),
            Claim::Fresh
        );
    }

    #[tokio::test]
    async fn test_committed_pending_is_stale() {
        let store = LedgerStore::in_memory().await.unwrap();
        let (sid, alice) = ids();

        let mut tx = store.begin().await.unwrap();
        try_begin(&mut tx, &sid, &alice, Money::from_minor(500)).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        match try_begin(&mut tx, &sid, &alice, Money::from_minor(500)).await.unwrap() {
            Claim::StalePending(record) => {
                assert_eq!(record.gross, Money::from_minor(500));
                assert_eq!(record.net, Money::ZERO);
            }
            other => panic!("unexpected claim: {other:?}"),
        }

        let pending = list_pending(&mut tx).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].settlement_id, sid);
    }

    #[tokio::test]
    async fn test_commit_twice_fails() {
        let store = LedgerStore::in_memory().await.unwrap();
        let (sid, alice) = ids();
        let mut tx = store.begin().await.unwrap();

        try_begin(&mut tx, &sid, &alice, Money::from_minor(100)).await.unwrap();
        commit(&mut tx, &sid, &split(100, 99)).await.unwrap();

        let err = commit(&mut tx, &sid, &split(100, 99)).await.unwrap_err();
        assert_eq!(err.error_code(), "SETTLEMENT_FAILED");
    }
}
