//! Command-line surface and command execution.

use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use aurapay_common::{LedgerError, Result};
use aurapay_ledger::{LedgerConfig, LedgerService};

/// Operate an AuraPay ledger database.
#[derive(Parser, Debug)]
#[command(name = "ledgerctl", version, about = "Operate an AuraPay ledger database")]
pub struct Cli {
    /// Database URL, overrides DATABASE_URL
    #[arg(long)]
    pub database_url: Option<String>,

    /// Log level, overrides LOG_LEVEL
    #[arg(long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Credit an account from a captured external payment
    Settle {
        account: String,
        settlement_id: String,
        /// Captured gross amount, e.g. 101.00
        gross: String,
    },
    /// Amount to charge a payer for a requested deposit
    Quote { net: String },
    /// Move funds between two accounts
    Transfer {
        from: String,
        to: String,
        amount: String,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        idempotency_key: Option<String>,
    },
    /// Show an account balance
    Balance { account: String },
    /// Show recent ledger entries, newest first
    History {
        account: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Check every balance against its ledger entries
    Audit,
    /// Finish or flag settlements left pending
    Reconcile,
}

impl Cli {
    /// Environment configuration with command-line overrides applied.
    pub fn config(&self) -> LedgerConfig {
        self.config_from(LedgerConfig::from_env())
    }

    pub fn config_from(&self, mut config: LedgerConfig) -> LedgerConfig {
        if let Some(url) = &self.database_url {
            config.store.database_url = url.clone();
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        config
    }
}

/// Run one command and return its JSON result.
pub async fn execute(service: &LedgerService, command: &Command) -> Result<Value> {
    let value = match command {
        Command::Settle {
            account,
            settlement_id,
            gross,
        } => to_json(
            service
                .settle_external_payment(account, settlement_id, gross)
                .await?,
        )?,
        Command::Quote { net } => json!({
            "requested_net": net,
            "gross": service.quote_charge(net)?,
        }),
        Command::Transfer {
            from,
            to,
            amount,
            reason,
            idempotency_key,
        } => to_json(
            service
                .transfer(from, to, amount, reason.as_deref(), idempotency_key.as_deref())
                .await?,
        )?,
        Command::Balance { account } => json!({
            "account": account,
            "balance": service.get_balance(account).await?,
        }),
        Command::History { account, limit } => json!({
            "account": account,
            "entries": to_json(service.list_history(account, *limit).await?)?,
        }),
        Command::Audit => to_json(service.audit().await?)?,
        Command::Reconcile => to_json(service.reconcile_pending().await?)?,
    };
    Ok(value)
}

fn to_json<T: serde::Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| LedgerError::Internal(e.to_string()))
}

/// JSON body printed when a command fails.
pub fn error_json(err: &LedgerError) -> Value {
    json!({
        "error": err.error_code(),
        "message": err.to_string(),
        "retryable": err.is_retryable(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    async fn service() -> LedgerService {
        LedgerService::connect(LedgerConfig::in_memory()).await.unwrap()
    }

    #[test]
    fn test_parse_transfer() {
        let cli = parse(&[
            "ledgerctl",
            "transfer",
            "alice",
            "bob",
            "30.00",
            "--reason",
            "dinner",
            "--idempotency-key",
            "T-1",
        ]);
        assert_eq!(
            cli.command,
            Command::Transfer {
                from: "alice".into(),
                to: "bob".into(),
                amount: "30.00".into(),
                reason: Some("dinner".into()),
                idempotency_key: Some("T-1".into()),
            }
        );
    }

    #[test]
    fn test_database_url_override() {
        let cli = parse(&["ledgerctl", "--database-url", "sqlite::memory:", "audit"]);
        let config = cli.config_from(LedgerConfig::default());
        assert!(config.store.is_in_memory());
        assert_eq!(cli.command, Command::Audit);
    }

    #[test]
    fn test_history_default_limit() {
        let cli = parse(&["ledgerctl", "history", "alice"]);
        assert_eq!(
            cli.command,
            Command::History {
                account: "alice".into(),
                limit: 20
            }
        );
    }

    #[tokio::test]
    async fn test_execute_commands() {
        let service = service().await;

        let settled = execute(
            &service,
            &Command::Settle {
                account: "alice".into(),
                settlement_id: "S1".into(),
                gross: "101.00".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(settled["net_amount"], "100.00");

        let balance = execute(&service, &Command::Balance { account: "alice".into() })
            .await
            .unwrap();
        assert_eq!(balance["balance"], "100.00");

        let history = execute(
            &service,
            &Command::History {
                account: "alice".into(),
                limit: 5,
            },
        )
        .await
        .unwrap();
        assert_eq!(history["entries"].as_array().unwrap().len(), 1);

        let audit = execute(&service, &Command::Audit).await.unwrap();
        assert_eq!(audit["consistent"], true);
    }

    #[tokio::test]
    async fn test_error_body() {
        let service = service().await;

        let err = tokio_test::assert_err!(
            execute(
                &service,
                &Command::Transfer {
                    from: "alice".into(),
                    to: "bob".into(),
                    amount: "5.00".into(),
                    reason: None,
                    idempotency_key: None,
                },
            )
            .await
        );

        let body = error_json(&err);
        assert_eq!(body["error"], "INSUFFICIENT_FUNDS");
        assert_eq!(body["retryable"], false);
    }

    #[test]
    fn test_encode_failure_is_not_retryable() {
        let mut by_pair = std::collections::HashMap::new();
        by_pair.insert((1u8, 2u8), "unencodable key");

        let err = tokio_test::assert_err!(to_json(by_pair));
        assert_eq!(err.error_code(), "INTERNAL_ERROR");

        let body = error_json(&err);
        assert_eq!(body["error"], "INTERNAL_ERROR");
        assert_eq!(body["retryable"], false);
    }
}
