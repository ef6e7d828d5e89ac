//! Ledger log: the append-only record of every balance change.

use std::fmt;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tracing::error;

use aurapay_common::{time, AccountId, EntryId, LedgerError, Money, Result, SettlementId, Timestamp};

use crate::account::stored_time;
use crate::store::{is_unique_violation, storage_error};

/// Why an entry was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryReason {
    /// Credit from a settled external payment.
    Deposit,
    /// Credit from another account.
    TransferIn,
    /// Debit to another account.
    TransferOut,
}

impl EntryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryReason::Deposit => "DEPOSIT",
            EntryReason::TransferIn => "TRANSFER_IN",
            EntryReason::TransferOut => "TRANSFER_OUT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DEPOSIT" => Some(EntryReason::Deposit),
            "TRANSFER_IN" => Some(EntryReason::TransferIn),
            "TRANSFER_OUT" => Some(EntryReason::TransferOut),
            _ => None,
        }
    }
}

impl fmt::Display for EntryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry ID.
    pub id: EntryId,
    /// Account affected.
    pub account_id: AccountId,
    /// Signed amount: positive credits, negative debits.
    pub amount: Money,
    /// Why the balance changed.
    pub reason: EntryReason,
    /// Other side of a transfer.
    pub counterparty: Option<AccountId>,
    /// External settlement that funded a deposit.
    pub settlement_id: Option<SettlementId>,
    /// Caller-supplied transfer reason.
    pub memo: Option<String>,
    /// When the entry was written.
    pub created_at: Timestamp,
}

impl LedgerEntry {
    /// Credit from a settled external payment.
    pub fn deposit(account_id: AccountId, net: Money, settlement_id: SettlementId) -> Self {
        Self {
            id: EntryId::new(),
            account_id,
            amount: net,
            reason: EntryReason::Deposit,
            counterparty: None,
            settlement_id: Some(settlement_id),
            memo: None,
            created_at: time::now(),
        }
    }

    /// Debit leg of a transfer. `amount` is the positive amount moved.
    pub fn transfer_out(
        account_id: AccountId,
        amount: Money,
        counterparty: AccountId,
        memo: Option<String>,
    ) -> Result<Self> {
        Ok(Self {
            id: EntryId::new(),
            account_id,
            amount: amount.negate()?,
            reason: EntryReason::TransferOut,
            counterparty: Some(counterparty),
            settlement_id: None,
            memo,
            created_at: time::now(),
        })
    }

    /// Credit leg of a transfer.
    pub fn transfer_in(
        account_id: AccountId,
        amount: Money,
        counterparty: AccountId,
        memo: Option<String>,
    ) -> Self {
        Self {
            id: EntryId::new(),
            account_id,
            amount,
            reason: EntryReason::TransferIn,
            counterparty: Some(counterparty),
            settlement_id: None,
            memo,
            created_at: time::now(),
        }
    }
}

#[derive(Debug, FromRow)]
struct EntryRow {
    seq: i64,
    id: String,
    account_id: String,
    amount_cents: i64,
    reason: String,
    counterparty_id: Option<String>,
    settlement_id: Option<String>,
    memo: Option<String>,
    created_at: i64,
}

impl TryFrom<EntryRow> for LedgerEntry {
    type Error = LedgerError;

    fn try_from(row: EntryRow) -> Result<Self> {
        let id = EntryId::parse(&row.id)
            .map_err(|e| LedgerError::StorageUnavailable(format!("bad entry id {}: {e}", row.id)))?;
        let reason = EntryReason::parse(&row.reason).ok_or_else(|| {
            LedgerError::StorageUnavailable(format!("bad entry reason {}", row.reason))
        })?;

        Ok(Self {
            id,
            account_id: AccountId::new(row.account_id)?,
            amount: Money::from_minor(row.amount_cents),
            reason,
            counterparty: row.counterparty_id.map(AccountId::new).transpose()?,
            settlement_id: row.settlement_id.map(SettlementId::new).transpose()?,
            memo: row.memo,
            created_at: stored_time(row.created_at)?,
        })
    }
}

/// Order of a history listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

/// Write an entry. Returns the entry as stored.
///
/// The stored timestamp is never earlier than the account's previous entry. An id
/// collision fails with `DuplicateEntry`; existing rows are never overwritten.
pub async fn append(conn: &mut SqliteConnection, mut entry: LedgerEntry) -> Result<LedgerEntry> {
    let last: Option<i64> =
        sqlx::query_scalar("SELECT MAX(created_at) FROM ledger_entries WHERE account_id = ?1")
            .bind(entry.account_id.as_str())
            .fetch_one(&mut *conn)
            .await
            .map_err(storage_error)?;

    let floor = last.and_then(time::from_micros);
    entry.created_at = time::now_not_before(floor);

    let result = sqlx::query(
        "INSERT INTO ledger_entries
            (id, account_id, amount_cents, reason, counterparty_id, settlement_id, memo, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )
    .bind(entry.id.to_string())
    .bind(entry.account_id.as_str())
    .bind(entry.amount.minor_units())
    .bind(entry.reason.as_str())
    .bind(entry.counterparty.as_ref().map(|c| c.as_str().to_string()))
    .bind(entry.settlement_id.as_ref().map(|s| s.as_str().to_string()))
    .bind(entry.memo.clone())
    .bind(time::to_micros(entry.created_at))
    .execute(&mut *conn)
    .await;

    match result {
        Ok(_) => Ok(entry),
        Err(err) if is_unique_violation(&err) => {
            error!(entry_id = %entry.id, account = %entry.account_id, "Ledger entry id collision");
            Err(LedgerError::DuplicateEntry(entry.id.to_string()))
        }
        Err(err) => Err(storage_error(err)),
    }
}

struct PageState {
    cursor: Option<(i64, i64)>,
    remaining: Option<usize>,
    exhausted: bool,
}

async fn fetch_page(
    pool: &SqlitePool,
    account_id: &AccountId,
    order: HistoryOrder,
    cursor: Option<(i64, i64)>,
    page_len: usize,
) -> Result<Vec<EntryRow>> {
    let sql = match order {
        HistoryOrder::NewestFirst => {
            "SELECT seq, id, account_id, amount_cents, reason, counterparty_id, settlement_id, memo, created_at
             FROM ledger_entries
             WHERE account_id = ?1 AND (?2 IS NULL OR (created_at, seq) < (?2, ?3))
             ORDER BY created_at DESC, seq DESC
             LIMIT ?4"
        }
        HistoryOrder::OldestFirst => {
            "SELECT seq, id, account_id, amount_cents, reason, counterparty_id, settlement_id, memo, created_at
             FROM ledger_entries
             WHERE account_id = ?1 AND (?2 IS NULL OR (created_at, seq) > (?2, ?3))
             ORDER BY created_at ASC, seq ASC
             LIMIT ?4"
        }
    };

    sqlx::query_as(sql)
        .bind(account_id.as_str())
        .bind(cursor.map(|(ts, _)| ts))
        .bind(cursor.map(|(_, seq)| seq))
        .bind(page_len as i64)
        .fetch_all(pool)
        .await
        .map_err(storage_error)
}

/// Stream an account's committed entries, `limit` at most, `page_size` rows per query.
///
/// The stream is lazy and finite; calling again restarts from the beginning.
pub fn list_by_account<'a>(
    pool: &'a SqlitePool,
    account_id: &'a AccountId,
    limit: Option<usize>,
    order: HistoryOrder,
    page_size: usize,
) -> BoxStream<'a, Result<LedgerEntry>> {
    let page_size = page_size.max(1);
    let state = PageState {
        cursor: None,
        remaining: limit,
        exhausted: false,
    };

    stream::try_unfold(state, move |mut state| async move {
        if state.exhausted || state.remaining == Some(0) {
            return Ok(None);
        }

        let page_len = state.remaining.map_or(page_size, |r| r.min(page_size));
        let rows = fetch_page(pool, account_id, order, state.cursor, page_len).await?;

        if rows.len() < page_len {
            state.exhausted = true;
        }
        if let Some(last) = rows.last() {
            state.cursor = Some((last.created_at, last.seq));
        }
        if let Some(remaining) = state.remaining.as_mut() {
            *remaining -= rows.len();
        }
        if rows.is_empty() {
            return Ok(None);
        }

        let entries = rows
            .into_iter()
            .map(LedgerEntry::try_from)
            .collect::<Result<Vec<_>>>()?;
        let page = stream::iter(entries.into_iter().map(Ok::<_, LedgerError>));
        Ok::<_, LedgerError>(Some((page, state)))
    })
    .try_flatten()
    .boxed()
}

/// Replay an account's entries in timestamp order and sum them.
pub async fn recompute_balance(conn: &mut SqliteConnection, account_id: &AccountId) -> Result<Money> {
    let mut amounts = sqlx::query_scalar::<_, i64>(
        "SELECT amount_cents FROM ledger_entries
         WHERE account_id = ?1
         ORDER BY created_at ASC, seq ASC",
    )
    .bind(account_id.as_str())
    .fetch(&mut *conn);

    let mut balance = Money::ZERO;
    while let Some(amount) = amounts.try_next().await.map_err(storage_error)? {
        balance = balance.checked_add(Money::from_minor(amount))?;
    }
    Ok(balance)
}

/// Sum of every entry with the given reason, across all accounts.
pub async fn total_by_reason(conn: &mut SqliteConnection, reason: EntryReason) -> Result<Money> {
    let total: Option<i64> =
        sqlx::query_scalar("SELECT SUM(amount_cents) FROM ledger_entries WHERE reason = ?1")
            .bind(reason.as_str())
            .fetch_one(&mut *conn)
            .await
            .map_err(storage_error)?;

    Ok(Money::from_minor(total.unwrap_or(0)))
}

/// Number of entries for an account.
pub async fn count_for_account(conn: &mut SqliteConnection, account_id: &AccountId) -> Result<u64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ledger_entries WHERE account_id = ?1")
        .bind(account_id.as_str())
        .fetch_one(&mut *conn)
        .await
        .map_err(storage_error)?;

    Ok(count as u64)
}
