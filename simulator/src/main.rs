//! AuraPay Ledger Simulator
//!
//! Scenario and load driver for the ledger engine.

use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aurapay_ledger::{LedgerConfig, LedgerEngine, StoreConfig};

mod controller;
mod metrics;
mod scenario;
mod users;

use controller::{LoadConfig, SimulationController};
use scenario::Scenario;

/// AuraPay Ledger Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(about = "AuraPay ledger scenario and load simulator")]
struct Args {
    /// Number of simulated users for load runs
    #[arg(short, long, default_value = "5")]
    users: usize,

    /// Scenario to run: a built-in name, "all", or a .json file
    #[arg(short, long)]
    scenario: Option<String>,

    /// Random transfers to run in load mode
    #[arg(long, default_value = "500")]
    transfers: usize,

    /// Concurrent transfer workers
    #[arg(long, default_value = "8")]
    concurrency: usize,

    /// Chance that a seeding settlement is redelivered, between 0 and 1
    #[arg(long, default_value = "0.2", value_parser = parse_rate)]
    duplicate_rate: f64,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Ledger database URL (default: private in-memory database)
    #[arg(long)]
    database_url: Option<String>,
}

fn parse_rate(s: &str) -> Result<f64, String> {
    let rate: f64 = s.parse().map_err(|e| format!("{e}"))?;
    if (0.0..=1.0).contains(&rate) {
        Ok(rate)
    } else {
        Err(format!("{rate} is not between 0 and 1"))
    }
}

impl Args {
    fn ledger_config(&self) -> LedgerConfig {
        let mut config = LedgerConfig::from_env();
        config.store = match &self.database_url {
            Some(url) => StoreConfig {
                database_url: url.clone(),
                ..config.store
            },
            None => StoreConfig::in_memory(),
        };
        config
    }

    async fn engine(&self) -> anyhow::Result<Arc<LedgerEngine>> {
        Ok(Arc::new(LedgerEngine::connect(self.ledger_config()).await?))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("Starting AuraPay Ledger Simulator");

    if let Some(scenario_name) = &args.scenario {
        let names: Vec<String> = if scenario_name == "all" {
            Scenario::NAMES.iter().map(|n| n.to_string()).collect()
        } else {
            vec![scenario_name.clone()]
        };

        for name in names {
            let scenario = Scenario::load(&name)?;
            // Built-in scenarios reuse account and settlement ids.
            let controller = SimulationController::new(args.engine().await?, args.users, args.seed)?;
            controller.run_scenario(&scenario).await?;
        }

        info!("Scenarios complete");
        return Ok(());
    }

    let controller = SimulationController::new(args.engine().await?, args.users, args.seed)?;
    let load = LoadConfig {
        transfers: args.transfers,
        concurrency: args.concurrency,
        duplicate_rate: args.duplicate_rate,
        ..LoadConfig::default()
    };

    let report = controller.run_load(&load).await?;

    info!("Simulation complete");
    info!("Total operations: {}", report.metrics.total_operations());
    info!("Transfers committed: {}", report.metrics.transfers_committed);
    info!("Transfers refused: {}", report.metrics.transfers_insufficient);
    info!("Duplicate deliveries: {}", report.metrics.settlements_duplicate);
    info!("Funds held: {} (deposited {})", report.audit.total_balance, report.seeded_total);
    info!(
        "Latency avg/p50/p99: {}/{}/{}us",
        report.metrics.average_latency_us(),
        report.metrics.p50_latency_us(),
        report.metrics.p99_latency_us()
    );

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_rate_is_validated() {
        let args = Args::try_parse_from(["simulator", "--duplicate-rate", "0.5"]).unwrap();
        assert_eq!(args.duplicate_rate, 0.5);

        for bad in ["NaN", "-0.1", "1.5", "often"] {
            assert!(Args::try_parse_from(["simulator", "--duplicate-rate", bad]).is_err());
        }
    }
}
