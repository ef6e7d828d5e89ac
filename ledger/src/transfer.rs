//! Transfer idempotency keys.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection};

use aurapay_common::{time, AccountId, LedgerError, Money, Result, Timestamp};

use crate::account::stored_time;
use crate::store::{is_unique_violation, storage_error};

/// Result of a committed keyed transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub key: String,
    pub from: AccountId,
    pub to: AccountId,
    pub amount: Money,
    /// Sender balance right after the transfer.
    pub from_balance: Money,
    /// Receiver balance right after the transfer.
    pub to_balance: Money,
    pub created_at: Timestamp,
}

impl TransferRecord {
    /// Whether a new request carries the same parameters as this record.
    pub fn matches(&self, from: &AccountId, to: &AccountId, amount: Money) -> bool {
        &self.from == from && &self.to == to && self.amount == amount
    }
}

#[derive(Debug, FromRow)]
struct TransferKeyRow {
    key: String,
    from_id: String,
    to_id: String,
    amount_cents: i64,
    from_balance_cents: i64,
    to_balance_cents: i64,
    created_at: i64,
}

impl TryFrom<TransferKeyRow> for TransferRecord {
    type Error = LedgerError;

    fn try_from(row: TransferKeyRow) -> Result<Self> {
        Ok(Self {
            key: row.key,
            from: AccountId::new(row.from_id)?,
            to: AccountId::new(row.to_id)?,
            amount: Money::from_minor(row.amount_cents),
            from_balance: Money::from_minor(row.from_balance_cents),
            to_balance: Money::from_minor(row.to_balance_cents),
            created_at: stored_time(row.created_at)?,
        })
    }
}

/// Look up a transfer by idempotency key.
pub async fn find(conn: &mut SqliteConnection, key: &str) -> Result<Option<TransferRecord>> {
    let row: Option<TransferKeyRow> = sqlx::query_as(
        "SELECT key, from_id, to_id, amount_cents, from_balance_cents, to_balance_cents, created_at
         FROM transfer_keys WHERE key = ?1",
    )
    .bind(key)
    .fetch_optional(&mut *conn)
    .await
    .map_err(storage_error)?;

    row.map(TransferRecord::try_from).transpose()
}

/// Store the outcome of a keyed transfer. A key that is already taken fails with
/// `IdempotencyKeyReused`.
pub async fn record(
    conn: &mut SqliteConnection,
    key: &str,
    from: &AccountId,
    to: &AccountId,
    amount: Money,
    balances: (Money, Money),
) -> Result<TransferRecord> {
    let created_at = time::now();

    let result = sqlx::query(
        "INSERT INTO transfer_keys
            (key, from_id, to_id, amount_cents, from_balance_cents, to_balance_cents, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )
    .bind(key)
    .bind(from.as_str())
    .bind(to.as_str())
    .bind(amount.minor_units())
    .bind(balances.0.minor_units())
    .bind(balances.1.minor_units())
    .bind(time::to_micros(created_at))
    .execute(&mut *conn)
    .await;

    match result {
        Ok(_) => Ok(TransferRecord {
            key: key.to_string(),
            from: from.clone(),
            to: to.clone(),
            amount,
            from_balance: balances.0,
            to_balance: balances.1,
            created_at,
        }),
        Err(err) if is_unique_violation(&err) => {
            Err(LedgerError::IdempotencyKeyReused(key.to_string()))
        }
        Err(err) => Err(storage_error(err)),
    }
}
