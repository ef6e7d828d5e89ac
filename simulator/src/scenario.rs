//! Scripted scenarios.

use serde::{Deserialize, Serialize};

/// A scripted scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Steps, run in order.
    pub steps: Vec<ScenarioStep>,
}

/// A step in a scenario. Amounts are decimal strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScenarioStep {
    /// Deliver a captured payment.
    Settle {
        account: String,
        settlement_id: String,
        gross: String,
    },
    /// Move funds between accounts.
    Transfer {
        from: String,
        to: String,
        amount: String,
    },
    /// Run transfers at the same time while a reader watches the balances.
    ConcurrentTransfers { transfers: Vec<(String, String, String)> },
    /// Check a condition.
    Assert { condition: AssertCondition },
}

/// Conditions that can be asserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AssertCondition {
    /// Account balance equals.
    BalanceEquals { account: String, amount: String },
    /// Net credited by the last settlement step.
    LastNetEquals { amount: String },
    /// Whether the last settlement step was a redelivery.
    LastAlreadySettled { expected: bool },
    /// Balances returned by the last transfer step.
    LastTransferBalances { from_balance: String, to_balance: String },
    /// Error code of the last step.
    LastErrorCode { code: String },
    /// Number of ledger entries for an account.
    EntryCount { account: String, count: usize },
    /// Sum of the listed balances.
    TotalEquals { accounts: Vec<String>, amount: String },
    /// Every balance matches its entries.
    AuditConsistent,
}

fn settle(account: &str, settlement_id: &str, gross: &str) -> ScenarioStep {
    ScenarioStep::Settle {
        account: account.to_string(),
        settlement_id: settlement_id.to_string(),
        gross: gross.to_string(),
    }
}

fn transfer(from: &str, to: &str, amount: &str) -> ScenarioStep {
    ScenarioStep::Transfer {
        from: from.to_string(),
        to: to.to_string(),
        amount: amount.to_string(),
    }
}

fn expect(condition: AssertCondition) -> ScenarioStep {
    ScenarioStep::Assert { condition }
}

fn balance(account: &str, amount: &str) -> ScenarioStep {
    expect(AssertCondition::BalanceEquals {
        account: account.to_string(),
        amount: amount.to_string(),
    })
}

fn entries(account: &str, count: usize) -> ScenarioStep {
    expect(AssertCondition::EntryCount {
        account: account.to_string(),
        count,
    })
}

impl Scenario {
    /// Built-in scenario names.
    pub const NAMES: [&'static str; 5] = [
        "first-settlement",
        "duplicate-settlement",
        "transfer",
        "overdraft",
        "concurrent-opposing",
    ];

    /// Load a built-in scenario by name, or a scenario file ending in `.json`.
    pub fn load(name: &str) -> anyhow::Result<Self> {
        if name.ends_with(".json") {
            let text = std::fs::read_to_string(name)?;
            return Ok(serde_json::from_str(&text)?);
        }

        match name {
            "first-settlement" => Ok(Self::first_settlement()),
            "duplicate-settlement" => Ok(Self::duplicate_settlement()),
            "transfer" => Ok(Self::transfer()),
            "overdraft" => Ok(Self::overdraft()),
            "concurrent-opposing" => Ok(Self::concurrent_opposing()),
            _ => Err(anyhow::anyhow!("Unknown scenario: {}", name)),
        }
    }

    fn first_settlement_steps() -> Vec<ScenarioStep> {
        vec![
            settle("alice", "S1", "101.00"),
            expect(AssertCondition::LastAlreadySettled { expected: false }),
            expect(AssertCondition::LastNetEquals {
                amount: "100.00".to_string(),
            }),
            balance("alice", "100.00"),
        ]
    }

    /// A $101.00 capture at 1% credits $100.00.
    fn first_settlement() -> Self {
        Self {
            name: "first-settlement".to_string(),
            description: "First settlement credits the net amount".to_string(),
            steps: Self::first_settlement_steps(),
        }
    }

    fn duplicate_settlement_steps() -> Vec<ScenarioStep> {
        let mut steps = Self::first_settlement_steps();
        steps.extend([
            settle("alice", "S1", "101.00"),
            expect(AssertCondition::LastAlreadySettled { expected: true }),
            expect(AssertCondition::LastNetEquals {
                amount: "100.00".to_string(),
            }),
            balance("alice", "100.00"),
            entries("alice", 1),
        ]);
        steps
    }

    /// Redelivering a settlement id credits nothing.
    fn duplicate_settlement() -> Self {
        Self {
            name: "duplicate-settlement".to_string(),
            description: "Redelivered settlement returns the recorded result".to_string(),
            steps: Self::duplicate_settlement_steps(),
        }
    }

    fn transfer_steps() -> Vec<ScenarioStep> {
        let mut steps = Self::duplicate_settlement_steps();
        steps.extend([
            transfer("alice", "bob", "30.00"),
            expect(AssertCondition::LastTransferBalances {
                from_balance: "70.00".to_string(),
                to_balance: "30.00".to_string(),
            }),
            balance("alice", "70.00"),
            balance("bob", "30.00"),
            entries("alice", 2),
            entries("bob", 1),
        ]);
        steps
    }

    fn transfer() -> Self {
        Self {
            name: "transfer".to_string(),
            description: "Transfer moves funds and writes both entries".to_string(),
            steps: Self::transfer_steps(),
        }
    }

    fn overdraft() -> Self {
        let mut steps = Self::transfer_steps();
        steps.extend([
            transfer("alice", "bob", "100.00"),
            expect(AssertCondition::LastErrorCode {
                code: "INSUFFICIENT_FUNDS".to_string(),
            }),
            balance("alice", "70.00"),
            balance("bob", "30.00"),
            entries("alice", 2),
            expect(AssertCondition::AuditConsistent),
        ]);

        Self {
            name: "overdraft".to_string(),
            description: "Overdraft is refused and changes nothing".to_string(),
            steps,
        }
    }

    fn concurrent_opposing() -> Self {
        let mut steps = Self::transfer_steps();
        steps.extend([
            ScenarioStep::ConcurrentTransfers {
                transfers: vec![
                    ("alice".to_string(), "bob".to_string(), "50.00".to_string()),
                    ("bob".to_string(), "alice".to_string(), "50.00".to_string()),
                ],
            },
            expect(AssertCondition::TotalEquals {
                accounts: vec!["alice".to_string(), "bob".to_string()],
                amount: "100.00".to_string(),
            }),
            expect(AssertCondition::AuditConsistent),
        ]);

        Self {
            name: "concurrent-opposing".to_string(),
            description: "Opposing concurrent transfers conserve the total".to_string(),
            steps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_all_builtins() {
        for name in Scenario::NAMES {
            let scenario = Scenario::load(name).unwrap();
            assert_eq!(scenario.name, name);
            assert!(!scenario.steps.is_empty());
        }
        assert!(Scenario::load("missing").is_err());
    }

    #[test]
    fn test_scenario_round_trips_as_json() {
        let scenario = Scenario::load("overdraft").unwrap();
        let json = serde_json::to_string(&scenario).unwrap();
        let parsed: Scenario = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.steps.len(), scenario.steps.len());
    }
}
