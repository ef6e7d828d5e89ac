//! ledgerctl binary.

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aurapay_ledger::LedgerService;
use aurapay_ledgerctl::{error_json, execute, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.config();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }

    info!(database_url = %config.store.database_url, command = ?cli.command, "Running ledger command");

    let service = LedgerService::connect(config).await?;
    let result = execute(&service, &cli.command).await;
    info!(metrics = ?service.engine().metrics(), "Ledger metrics");
    service.engine().store().close().await;

    match result {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(err) => {
            error!(error = %err, code = err.error_code(), "Command failed");
            println!("{}", serde_json::to_string_pretty(&error_json(&err))?);
            std::process::exit(1);
        }
    }
}
