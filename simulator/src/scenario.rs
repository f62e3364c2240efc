//! Simulation scenarios.

use clap::ValueEnum;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use bank_common::AccountId;
use bank_service::TransferCommand;

/// Built-in scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScenarioKind {
    /// Transfers alternating direction between the same two accounts.
    OpposingPair,
    /// Transfers between random pairs of accounts.
    RandomMesh,
    /// Random transfers while store faults are switched on and off.
    FaultInjection,
}

/// A store fault, with accounts given by their index in the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultSpec {
    CreateTransfer,
    CreateEntry { account: usize },
    AddBalance { account: usize },
    Commit,
}

/// A batch of transfers run concurrently, optionally under a fault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    pub fault: Option<FaultSpec>,
    pub transfers: Vec<TransferCommand>,
}

/// A simulation scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Phases, run in order.
    pub phases: Vec<Phase>,
}

impl Scenario {
    /// Build a scenario over `accounts`.
    pub fn build(
        kind: ScenarioKind,
        accounts: &[AccountId],
        currency: &str,
        transfers: usize,
        rng: &mut StdRng,
    ) -> anyhow::Result<Self> {
        if accounts.len() < 2 {
            anyhow::bail!("scenario needs at least 2 accounts, got {}", accounts.len());
        }

        let scenario = match kind {
            ScenarioKind::OpposingPair => Self {
                name: "opposing-pair".to_string(),
                description: "Concurrent transfers in both directions over one account pair"
                    .to_string(),
                phases: vec![Phase {
                    name: "opposing".to_string(),
                    fault: None,
                    transfers: opposing_pair(accounts[0], accounts[1], currency, transfers),
                }],
            },
            ScenarioKind::RandomMesh => Self {
                name: "random-mesh".to_string(),
                description: "Concurrent transfers between random account pairs".to_string(),
                phases: vec![Phase {
                    name: "mesh".to_string(),
                    fault: None,
                    transfers: random_mesh(accounts, currency, transfers, rng),
                }],
            },
            ScenarioKind::FaultInjection => Self::fault_injection(accounts, currency, transfers, rng),
        };

        Ok(scenario)
    }

    /// Total transfers across all phases.
    pub fn transfer_count(&self) -> usize {
        self.phases.iter().map(|phase| phase.transfers.len()).sum()
    }

    fn fault_injection(
        accounts: &[AccountId],
        currency: &str,
        transfers: usize,
        rng: &mut StdRng,
    ) -> Self {
        let faults = [
            None,
            Some(FaultSpec::AddBalance { account: 1 }),
            Some(FaultSpec::CreateEntry { account: 0 }),
            Some(FaultSpec::Commit),
            Some(FaultSpec::CreateTransfer),
            None,
        ];
        let per_phase = (transfers / faults.len()).max(1);

        let phases = faults
            .iter()
            .enumerate()
            .map(|(i, fault)| Phase {
                name: match fault {
                    Some(spec) => format!("fault-{i}-{spec:?}"),
                    None => format!("clean-{i}"),
                },
                fault: *fault,
                transfers: random_mesh(accounts, currency, per_phase, rng),
            })
            .collect();

        Self {
            name: "fault-injection".to_string(),
            description: "Random transfers with store failures at each write step".to_string(),
            phases,
        }
    }
}

fn command(from: AccountId, to: AccountId, amount: i64, currency: &str) -> TransferCommand {
    TransferCommand {
        from_account_id: from,
        to_account_id: to,
        amount,
        currency: currency.to_string(),
    }
}

fn opposing_pair(x: AccountId, y: AccountId, currency: &str, count: usize) -> Vec<TransferCommand> {
    (0..count)
        .map(|i| {
            if i % 2 == 0 {
                command(x, y, 10, currency)
            } else {
                command(y, x, 10, currency)
            }
        })
        .collect()
}

fn random_mesh(
    accounts: &[AccountId],
    currency: &str,
    count: usize,
    rng: &mut StdRng,
) -> Vec<TransferCommand> {
    (0..count)
        .map(|_| {
            let from = rng.gen_range(0..accounts.len());
            let mut to = rng.gen_range(0..accounts.len());
            while to == from {
                to = rng.gen_range(0..accounts.len());
            }
            command(accounts[from], accounts[to], rng.gen_range(1..1_000), currency)
        })
        .collect()
}
