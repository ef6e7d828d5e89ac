//! Account store: the durable account -> balance mapping.
//!
//! Every function takes the caller's connection so that it runs inside the
//! engine's enclosing transaction. [`apply_delta`] is the only way a balance changes.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection};
use tracing::debug;

use aurapay_common::{time, AccountId, LedgerError, Money, Result, Timestamp};

use crate::store::storage_error;

/// A ledger account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account identity.
    pub id: AccountId,
    /// Current balance, never negative.
    pub balance: Money,
    /// When the account was first touched.
    pub created_at: Timestamp,
    /// When the balance last changed.
    pub updated_at: Timestamp,
}

#[derive(Debug, FromRow)]
struct AccountRow {
    id: String,
    balance_cents: i64,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<AccountRow> for Account {
    type Error = LedgerError;

    fn try_from(row: AccountRow) -> Result<Self> {
        Ok(Self {
            id: AccountId::new(row.id)?,
            balance: Money::from_minor(row.balance_cents),
            created_at: stored_time(row.created_at)?,
            updated_at: stored_time(row.updated_at)?,
        })
    }
}

pub(crate) fn stored_time(micros: i64) -> Result<Timestamp> {
    time::from_micros(micros)
        .ok_or_else(|| LedgerError::StorageUnavailable(format!("bad stored timestamp {micros}")))
}

/// Return the account, creating it with a zero balance if it does not exist.
pub async fn get_or_create(conn: &mut SqliteConnection, id: &AccountId) -> Result<Account> {
    let now = time::to_micros(time::now());

    let row: AccountRow = sqlx::query_as(
        "INSERT INTO accounts (id, balance_cents, created_at, updated_at)
         VALUES (?1, 0, ?2, ?2)
         ON CONFLICT(id) DO UPDATE SET updated_at = accounts.updated_at
         RETURNING id, balance_cents, created_at, updated_at",
    )
    .bind(id.as_str())
    .bind(now)
    .fetch_one(&mut *conn)
    .await
    .map_err(storage_error)?;

    row.try_into()
}

/// Look up an account without creating it.
pub async fn find(conn: &mut SqliteConnection, id: &AccountId) -> Result<Option<Account>> {
    let row: Option<AccountRow> = sqlx::query_as(
        "SELECT id, balance_cents, created_at, updated_at FROM accounts WHERE id = ?1",
    )
    .bind(id.as_str())
    .fetch_optional(&mut *conn)
    .await
    .map_err(storage_error)?;

    row.map(Account::try_from).transpose()
}

/// All accounts, ordered by id.
pub async fn list(conn: &mut SqliteConnection) -> Result<Vec<Account>> {
    let rows: Vec<AccountRow> = sqlx::query_as(
        "SELECT id, balance_cents, created_at, updated_at FROM accounts ORDER BY id",
    )
    .fetch_all(&mut *conn)
    .await
    .map_err(storage_error)?;

    rows.into_iter().map(Account::try_from).collect()
}

/// Add a signed amount to the stored balance and return the new balance.
///
/// Fails with `InsufficientFunds` if the result would be negative; nothing is
/// written in that case.
pub async fn apply_delta(
    conn: &mut SqliteConnection,
    id: &AccountId,
    delta: Money,
) -> Result<Money> {
    let account = find(conn, id)
        .await?
        .ok_or_else(|| LedgerError::InvalidIdentifier {
            kind: "account",
            value: id.to_string(),
        })?;

    let balance = account.balance.checked_add(delta)?;
    if balance.is_negative() {
        return Err(LedgerError::InsufficientFunds {
            account: id.clone(),
            required: delta.negate()?,
            available: account.balance,
        });
    }

    sqlx::query("UPDATE accounts SET balance_cents = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(balance.minor_units())
        .bind(time::to_micros(time::now()))
        .bind(id.as_str())
        .execute(&mut *conn)
        .await
        .map_err(storage_error)?;

    debug!(account = %id, delta = %delta, balance = %balance, "Balance updated");
    Ok(balance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LedgerStore;

    fn account(id: &str) -> AccountId {
        AccountId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_get_or_create_starts_at_zero() {
        let store = LedgerStore::in_memory().await.unwrap();
        let mut tx = store.begin().await.unwrap();

        let created = get_or_create(&mut tx, &account("alice")).await.unwrap();
        assert_eq!(created.balance, Money::ZERO);

        let again = get_or_create(&mut tx, &account("alice")).await.unwrap();
        assert_eq!(again.created_at, created.created_at);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_apply_delta_credit_and_debit() {
        let store = LedgerStore::in_memory().await.unwrap();
        let mut tx = store.begin().await.unwrap();
        let alice = account("alice");

        get_or_create(&mut tx, &alice).await.unwrap();
        let balance = apply_delta(&mut tx, &alice, Money::from_minor(10000)).await.unwrap();
        assert_eq!(balance, Money::from_minor(10000));

        let balance = apply_delta(&mut tx, &alice, Money::from_minor(-3000)).await.unwrap();
        assert_eq!(balance, Money::from_minor(7000));
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let stored = find(&mut tx, &alice).await.unwrap().unwrap();
        assert_eq!(stored.balance, Money::from_minor(7000));
    }

    #[tokio::test]
    async fn test_apply_delta_rejects_overdraft() {
        let store = LedgerStore::in_memory().await.unwrap();
        let mut tx = store.begin().await.unwrap();
        let bob = account("bob");

        get_or_create(&mut tx, &bob).await.unwrap();
        apply_delta(&mut tx, &bob, Money::from_minor(500)).await.unwrap();

        let err = apply_delta(&mut tx, &bob, Money::from_minor(-501))
            .await
            .unwrap_err();
        match err {
            LedgerError::InsufficientFunds {
                required,
                available,
                ..
            } => {
                assert_eq!(required, Money::from_minor(501));
                assert_eq!(available, Money::from_minor(500));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let stored = find(&mut tx, &bob).await.unwrap().unwrap();
        assert_eq!(stored.balance, Money::from_minor(500));
    }

    #[tokio::test]
    async fn test_apply_delta_unknown_account() {
        let store = LedgerStore::in_memory().await.unwrap();
        let mut tx = store.begin().await.unwrap();

        let err = apply_delta(&mut tx, &account("ghost"), Money::from_minor(1))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_IDENTIFIER");
    }

    #[tokio::test]
    async fn test_list_orders_by_id() {
        let store = LedgerStore::in_memory().await.unwrap();
        let mut tx = store.begin().await.unwrap();

        get_or_create(&mut tx, &account("carol")).await.unwrap();
        get_or_create(&mut tx, &account("alice")).await.unwrap();

        let ids: Vec<_> = list(&mut tx)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id.to_string())
            .collect();
        assert_eq!(ids, vec!["alice", "carol"]);
    }
}
