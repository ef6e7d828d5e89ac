//! Durable SQLite store shared by the account, journal and settlement tables.

use std::str::FromStr;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, Transaction};
use tracing::{info, warn};

use aurapay_common::{LedgerError, Result};

use crate::config::StoreConfig;

/// An open database transaction. Dropping it without `commit` rolls back.
pub type LedgerTx = Transaction<'static, Sqlite>;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS accounts (
        id TEXT PRIMARY KEY NOT NULL,
        balance_cents INTEGER NOT NULL DEFAULT 0 CHECK (balance_cents >= 0),
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS ledger_entries (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        account_id TEXT NOT NULL REFERENCES accounts(id),
        amount_cents INTEGER NOT NULL,
        reason TEXT NOT NULL CHECK (reason IN ('DEPOSIT', 'TRANSFER_IN', 'TRANSFER_OUT')),
        counterparty_id TEXT,
        settlement_id TEXT,
        memo TEXT,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_ledger_entries_account_ts
        ON ledger_entries(account_id, created_at, seq)",
    "CREATE TRIGGER IF NOT EXISTS ledger_entries_immutable_update
        BEFORE UPDATE ON ledger_entries
        BEGIN SELECT RAISE(ABORT, 'ledger entries are immutable'); END",
    "CREATE TRIGGER IF NOT EXISTS ledger_entries_immutable_delete
        BEFORE DELETE ON ledger_entries
        BEGIN SELECT RAISE(ABORT, 'ledger entries are immutable'); END",
    "CREATE TABLE IF NOT EXISTS settlements (
        id TEXT PRIMARY KEY NOT NULL,
        account_id TEXT NOT NULL,
        gross_cents INTEGER NOT NULL CHECK (gross_cents >= 0),
        net_cents INTEGER NOT NULL CHECK (net_cents >= 0),
        fee_cents INTEGER NOT NULL CHECK (fee_cents >= 0),
        status TEXT NOT NULL CHECK (status IN ('PENDING', 'SETTLED')),
        created_at INTEGER NOT NULL,
        settled_at INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_settlements_status ON settlements(status)",
    "CREATE TABLE IF NOT EXISTS transfer_keys (
        key TEXT PRIMARY KEY NOT NULL,
        from_id TEXT NOT NULL,
        to_id TEXT NOT NULL,
        amount_cents INTEGER NOT NULL,
        from_balance_cents INTEGER NOT NULL,
        to_balance_cents INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    )",
];

/// Map a driver error onto the ledger taxonomy.
pub(crate) fn storage_error(err: sqlx::Error) -> LedgerError {
    LedgerError::StorageUnavailable(err.to_string())
}

/// Whether a driver error is a primary-key or unique-constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

/// Handle to the ledger database.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    pool: SqlitePool,
}

impl LedgerStore {
    /// Open (creating if needed) the database and apply the schema.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        if !config.database_url.starts_with("sqlite:") {
            return Err(LedgerError::Configuration(format!(
                "unsupported database url: {}",
                config.database_url
            )));
        }

        let mut options = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(|e| LedgerError::Configuration(e.to_string()))?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(config.busy_timeout);

        let mut pool_options = SqlitePoolOptions::new().acquire_timeout(config.acquire_timeout);

        if config.is_in_memory() {
            if config.max_connections > 1 {
                warn!(
                    max_connections = config.max_connections,
                    "In-memory database is private to one connection, using a single connection"
                );
            }
            // Closing the only connection would drop the database.
            pool_options = pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        } else {
            options = options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
            pool_options = pool_options.max_connections(config.max_connections);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(storage_error)?;

        let store = Self { pool };
        store.migrate().await?;

        info!(database_url = %config.database_url, "Ledger store ready");
        Ok(store)
    }

    /// Private in-memory store.
    pub async fn in_memory() -> Result<Self> {
        Self::connect(&StoreConfig::in_memory()).await
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(storage_error)?;
        }
        Ok(())
    }

    /// Start a transaction.
    pub async fn begin(&self) -> Result<LedgerTx> {
        self.pool.begin().await.map_err(storage_error)
    }

    /// Underlying pool, for read-only streaming queries.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close all connections.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
