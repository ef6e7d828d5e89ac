//! Simulation controller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use aurapay_common::{AccountId, LedgerError, Money, SettlementId};
use aurapay_ledger::{
    account, AuditReport, LedgerEngine, MetricsSnapshot, SettlementOutcome,
    TransferOutcome, TransferRequest,
};

use crate::metrics::SimulationMetrics;
use crate::scenario::{AssertCondition, Scenario, ScenarioStep};
use crate::users::{SimulatedUser, UserFactory};

/// Parameters of a random load run.
#[derive(Debug, Clone)]
pub struct LoadConfig {
    /// Random transfers to run after seeding.
    pub transfers: usize,
    /// Concurrent transfer workers.
    pub concurrency: usize,
    /// Chance that a seeding settlement is delivered twice.
    pub duplicate_rate: f64,
    /// Largest seeding capture, in cents.
    pub max_deposit_cents: i64,
    /// Largest random transfer, in cents.
    pub max_transfer_cents: i64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            transfers: 500,
            concurrency: 8,
            duplicate_rate: 0.2,
            max_deposit_cents: 50_000,
            max_transfer_cents: 5_000,
        }
    }
}

/// Summary of a load run.
#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub metrics: SimulationMetrics,
    /// Counters kept by the engine itself.
    pub ledger_metrics: MetricsSnapshot,
    pub audit: AuditReport,
    /// Net credited during seeding.
    pub seeded_total: Money,
    pub elapsed_ms: u64,
}

/// Result of the previous scenario step, consulted by assertions.
#[derive(Debug)]
enum LastStep {
    Nothing,
    Settled(SettlementOutcome),
    Transferred(TransferOutcome),
    Failed(LedgerError),
}

fn account_id(name: &str) -> anyhow::Result<AccountId> {
    Ok(AccountId::new(name)?)
}

/// Drives a ledger engine through scenarios and random load.
pub struct SimulationController {
    engine: Arc<LedgerEngine>,
    users: Vec<SimulatedUser>,
    rng: Arc<RwLock<StdRng>>,
    metrics: Arc<RwLock<SimulationMetrics>>,
}

impl SimulationController {
    /// Create a new simulation controller.
    pub fn new(engine: Arc<LedgerEngine>, user_count: usize, seed: Option<u64>) -> anyhow::Result<Self> {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            engine,
            users: UserFactory::create_users(user_count)?,
            rng: Arc::new(RwLock::new(rng)),
            metrics: Arc::new(RwLock::new(SimulationMetrics::new())),
        })
    }

    fn parse_amount(&self, amount: &str) -> anyhow::Result<Money> {
        let max = self.engine.config().limits.max_transaction;
        Ok(Money::from_decimal_str(amount, max)?)
    }

    /// Run a scenario, failing on the first assertion that does not hold.
    pub async fn run_scenario(&self, scenario: &Scenario) -> anyhow::Result<()> {
        info!("Running scenario: {} - {}", scenario.name, scenario.description);

        let mut last = LastStep::Nothing;
        for (n, step) in scenario.steps.iter().enumerate() {
            self.execute_step(step, &mut last)
                .await
                .with_context(|| format!("scenario {} step {}: {:?}", scenario.name, n + 1, step))?;
        }

        info!("Scenario {} passed", scenario.name);
        Ok(())
    }

    async fn execute_step(&self, step: &ScenarioStep, last: &mut LastStep) -> anyhow::Result<()> {
        match step {
            ScenarioStep::Settle {
                account,
                settlement_id,
                gross,
            } => {
                let account = account_id(account)?;
                let settlement = SettlementId::new(settlement_id.as_str())?;
                let gross = self.parse_amount(gross)?;
                info!("Settling {} for {} ({})", settlement, account, gross);

                *last = self.settle(&account, &settlement, gross).await;
            }
            ScenarioStep::Transfer { from, to, amount } => {
                let request =
                    TransferRequest::new(account_id(from)?, account_id(to)?, self.parse_amount(amount)?);
                info!("Transferring {} -> {} for {}", request.from, request.to, request.amount);

                *last = self.transfer(request).await;
            }
            ScenarioStep::ConcurrentTransfers { transfers } => {
                let mut requests = Vec::with_capacity(transfers.len());
                for (from, to, amount) in transfers {
                    requests.push(TransferRequest::new(
                        account_id(from)?,
                        account_id(to)?,
                        self.parse_amount(amount)?,
                    ));
                }
                self.run_concurrent(requests).await?;
                *last = LastStep::Nothing;
            }
            ScenarioStep::Assert { condition } => self.check(condition, last).await?,
        }
        Ok(())
    }

    async fn settle(&self, account: &AccountId, settlement: &SettlementId, gross: Money) -> LastStep {
        let started = Instant::now();
        match self.engine.settle_external_payment(account, settlement, gross).await {
            Ok(outcome) => {
                let latency = started.elapsed().as_micros() as u64;
                self.metrics
                    .write()
                    .await
                    .record_settlement(outcome.is_already_settled(), latency);
                LastStep::Settled(outcome)
            }
            Err(err) => {
                warn!("Settlement {} failed: {}", settlement, err);
                self.metrics.write().await.record_error();
                LastStep::Failed(err)
            }
        }
    }

    async fn transfer(&self, request: TransferRequest) -> LastStep {
        let started = Instant::now();
        let result = self.engine.transfer(request).await;
        let latency = started.elapsed().as_micros() as u64;

        let mut metrics = self.metrics.write().await;
        match result {
            Ok(outcome) => {
                metrics.record_transfer(latency);
                LastStep::Transferred(outcome)
            }
            Err(err @ LedgerError::InsufficientFunds { .. }) => {
                metrics.record_insufficient(latency);
                LastStep::Failed(err)
            }
            Err(err) => {
                metrics.record_error();
                LastStep::Failed(err)
            }
        }
    }

    /// Run transfers at once while a reader checks that the involved balances
    /// never go negative and never change their sum.
    async fn run_concurrent(&self, requests: Vec<TransferRequest>) -> anyhow::Result<()> {
        let mut watched: Vec<AccountId> = requests
            .iter()
            .flat_map(|r| [r.from.clone(), r.to.clone()])
            .collect();
        watched.sort();
        watched.dedup();

        let before = self.sum_balances(&watched).await?;
        let stop = Arc::new(AtomicBool::new(false));

        let reader = {
            let engine = self.engine.clone();
            let watched = watched.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                let mut reads = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    let mut tx = engine.store().begin().await?;
                    let mut total = Money::ZERO;
                    for id in &watched {
                        let balance = account::find(&mut tx, id)
                            .await?
                            .map_or(Money::ZERO, |a| a.balance);
                        if balance.is_negative() {
                            bail!("reader observed negative balance {} for {}", balance, id);
                        }
                        total = total.checked_add(balance)?;
                    }
                    drop(tx);

                    if total != before {
                        bail!("reader observed total {} instead of {}", total, before);
                    }
                    reads += 1;
                    tokio::task::yield_now().await;
                }
                Ok::<_, anyhow::Error>(reads)
            })
        };

        let handles: Vec<_> = requests
            .into_iter()
            .map(|request| {
                let engine = self.engine.clone();
                tokio::spawn(async move {
                    let started = Instant::now();
                    let result = engine.transfer(request).await;
                    (result, started.elapsed().as_micros() as u64)
                })
            })
            .collect();

        for handle in handles {
            let (result, latency) = handle.await?;
            let mut metrics = self.metrics.write().await;
            match result {
                Ok(_) => metrics.record_transfer(latency),
                Err(LedgerError::InsufficientFunds { .. }) => metrics.record_insufficient(latency),
                Err(err) => {
                    metrics.record_error();
                    bail!("concurrent transfer failed: {}", err);
                }
            }
        }

        stop.store(true, Ordering::Relaxed);
        let reads = reader.await??;
        debug!("Concurrent reader completed {} reads", reads);
        Ok(())
    }

    async fn sum_balances(&self, accounts: &[AccountId]) -> anyhow::Result<Money> {
        let mut total = Money::ZERO;
        for id in accounts {
            total = total.checked_add(self.engine.balance(id).await?)?;
        }
        Ok(total)
    }

    async fn check(&self, condition: &AssertCondition, last: &LastStep) -> anyhow::Result<()> {
        match condition {
            AssertCondition::BalanceEquals { account, amount } => {
                let actual = self.engine.balance(&account_id(account)?).await?;
                let expected = self.parse_amount(amount)?;
                if actual != expected {
                    bail!("balance of {} is {}, expected {}", account, actual, expected);
                }
            }
            AssertCondition::LastNetEquals { amount } => match last {
                LastStep::Settled(outcome) => {
                    let expected = self.parse_amount(amount)?;
                    if outcome.net() != expected {
                        bail!("net was {}, expected {}", outcome.net(), expected);
                    }
                }
                other => bail!("last step was not a settlement: {:?}", other),
            },
            AssertCondition::LastAlreadySettled { expected } => match last {
                LastStep::Settled(outcome) if outcome.is_already_settled() == *expected => {}
                other => bail!("expected already_settled={}, last step was {:?}", expected, other),
            },
            AssertCondition::LastTransferBalances {
                from_balance,
                to_balance,
            } => match last {
                LastStep::Transferred(outcome) => {
                    let expected = (self.parse_amount(from_balance)?, self.parse_amount(to_balance)?);
                    if (outcome.from_balance, outcome.to_balance) != expected {
                        bail!("transfer left {:?}, expected {:?}", outcome, expected);
                    }
                }
                other => bail!("last step was not a transfer: {:?}", other),
            },
            AssertCondition::LastErrorCode { code } => match last {
                LastStep::Failed(err) if err.error_code() == code => {}
                other => bail!("expected error {}, last step was {:?}", code, other),
            },
            AssertCondition::EntryCount { account, count } => {
                let actual = self.engine.entry_count(&account_id(account)?).await?;
                if actual != *count as u64 {
                    bail!("{} has {} entries, expected {}", account, actual, count);
                }
            }
            AssertCondition::TotalEquals { accounts, amount } => {
                let ids = accounts
                    .iter()
                    .map(|a| account_id(a))
                    .collect::<anyhow::Result<Vec<_>>>()?;
                let total = self.sum_balances(&ids).await?;
                let expected = self.parse_amount(amount)?;
                if total != expected {
                    bail!("total is {}, expected {}", total, expected);
                }
            }
            AssertCondition::AuditConsistent => {
                let report = self.engine.audit().await?;
                if !report.is_consistent() {
                    bail!("audit failed: {:?}", report);
                }
            }
        }
        Ok(())
    }

    /// Seed every user through settlements, run random concurrent transfers,
    /// then audit the ledger.
    pub async fn run_load(&self, load: &LoadConfig) -> anyhow::Result<LoadReport> {
        if !(0.0..=1.0).contains(&load.duplicate_rate) {
            bail!("duplicate rate must be between 0 and 1, got {}", load.duplicate_rate);
        }

        let started = Instant::now();
        info!(
            "Seeding {} users, then {} transfers over {} workers",
            self.users.len(),
            load.transfers,
            load.concurrency
        );

        let seeded_total = self.seed_users(load).await?;
        let plan = self.plan_transfers(load).await;

        let workers = load.concurrency.max(1);
        let mut chunks: Vec<Vec<TransferRequest>> = vec![Vec::new(); workers];
        for (i, request) in plan.into_iter().enumerate() {
            chunks[i % workers].push(request);
        }

        let handles: Vec<_> = chunks
            .into_iter()
            .map(|chunk| {
                let engine = self.engine.clone();
                let metrics = self.metrics.clone();
                tokio::spawn(async move {
                    for request in chunk {
                        let started = Instant::now();
                        let result = engine.transfer(request).await;
                        let latency = started.elapsed().as_micros() as u64;

                        let mut metrics = metrics.write().await;
                        match result {
                            Ok(_) => metrics.record_transfer(latency),
                            Err(LedgerError::InsufficientFunds { .. }) => {
                                metrics.record_insufficient(latency)
                            }
                            Err(err) => {
                                warn!("Transfer failed: {}", err);
                                metrics.record_error();
                            }
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.await?;
        }

        let audit = self.engine.audit().await?;
        if !audit.is_consistent() {
            bail!("ledger audit failed after load: {:?}", audit);
        }
        if audit.total_balance != seeded_total {
            bail!(
                "funds not conserved: {} held, {} deposited",
                audit.total_balance,
                seeded_total
            );
        }

        let metrics = self.get_metrics().await;
        Ok(LoadReport {
            metrics,
            ledger_metrics: self.engine.metrics(),
            audit,
            seeded_total,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// One settlement per user, sometimes delivered twice at once.
    async fn seed_users(&self, load: &LoadConfig) -> anyhow::Result<Money> {
        let mut total = Money::ZERO;

        for user in &self.users {
            let (gross, deliveries) = {
                let mut rng = self.rng.write().await;
                let gross = rng.gen_range(100..=load.max_deposit_cents.max(100));
                let deliveries = if rng.gen_bool(load.duplicate_rate) { 2 } else { 1 };
                (Money::from_minor(gross), deliveries)
            };
            let settlement = SettlementId::new(format!("PAY-{}", uuid::Uuid::new_v4()))?;

            let outcomes = futures::future::join_all(
                (0..deliveries).map(|_| self.settle(&user.account, &settlement, gross)),
            )
            .await;

            let mut credited = 0;
            for outcome in outcomes {
                match outcome {
                    LastStep::Settled(SettlementOutcome::Credited(record)) => {
                        credited += 1;
                        total = total.checked_add(record.net)?;
                    }
                    LastStep::Settled(SettlementOutcome::AlreadySettled(_)) => {}
                    other => bail!("seeding {} failed: {:?}", user.name, other),
                }
            }
            if credited != 1 {
                bail!("settlement {} credited {} times", settlement, credited);
            }
        }

        Ok(total)
    }

    async fn plan_transfers(&self, load: &LoadConfig) -> Vec<TransferRequest> {
        if self.users.len() < 2 {
            return Vec::new();
        }

        let mut rng = self.rng.write().await;
        (0..load.transfers)
            .map(|_| {
                let from = rng.gen_range(0..self.users.len());
                let mut to = rng.gen_range(0..self.users.len());
                while to == from {
                    to = rng.gen_range(0..self.users.len());
                }
                let amount = Money::from_minor(rng.gen_range(1..=load.max_transfer_cents.max(1)));
                TransferRequest::new(
                    self.users[from].account.clone(),
                    self.users[to].account.clone(),
                    amount,
                )
            })
            .collect()
    }

    /// Get simulation metrics.
    pub async fn get_metrics(&self) -> SimulationMetrics {
        self.metrics.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn controller(users: usize) -> SimulationController {
        let engine = Arc::new(LedgerEngine::in_memory().await.unwrap());
        SimulationController::new(engine, users, Some(7)).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_builtin_scenarios_pass() {
        for name in Scenario::NAMES {
            let controller = controller(2).await;
            let scenario = Scenario::load(name).unwrap();
            controller.run_scenario(&scenario).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_failed_assertion_is_reported() {
        let controller = controller(2).await;
        let scenario = Scenario {
            name: "wrong".to_string(),
            description: "expects the gross to be credited".to_string(),
            steps: vec![
                ScenarioStep::Settle {
                    account: "alice".to_string(),
                    settlement_id: "S1".to_string(),
                    gross: "101.00".to_string(),
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::BalanceEquals {
                        account: "alice".to_string(),
                        amount: "101.00".to_string(),
                    },
                },
            ],
        };

        let err = controller.run_scenario(&scenario).await.unwrap_err();
        assert!(format!("{err:#}").contains("expected 101.00"));
    }

    #[tokio::test]
    async fn test_load_rejects_bad_duplicate_rate() {
        let controller = controller(2).await;

        for rate in [f64::NAN, -0.1, 1.5] {
            let load = LoadConfig {
                duplicate_rate: rate,
                ..LoadConfig::default()
            };
            let err = controller.run_load(&load).await.unwrap_err();
            assert!(err.to_string().contains("duplicate rate"));
        }
        assert_eq!(controller.get_metrics().await.total_operations(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_load_run_conserves_funds() {
        let controller = controller(5).await;
        let load = LoadConfig {
            transfers: 100,
            concurrency: 4,
            duplicate_rate: 0.5,
            ..LoadConfig::default()
        };

        let report = controller.run_load(&load).await.unwrap();
        assert!(report.audit.is_consistent());
        assert_eq!(report.audit.total_balance, report.seeded_total);
        assert_eq!(report.metrics.settlements_credited, 5);
        assert_eq!(
            report.metrics.transfers_committed + report.metrics.transfers_insufficient,
            100
        );
        assert_eq!(report.metrics.errors, 0);
        assert_eq!(report.ledger_metrics.settlements_credited, 5);
        assert_eq!(
            report.ledger_metrics.transfers_committed,
            report.metrics.transfers_committed
        );
    }
}
