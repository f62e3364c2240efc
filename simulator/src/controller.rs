//! Simulation controller.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use bank_common::{AccountId, Currency, Money};
use bank_ledger::{
    FailPoint, LedgerReader, LedgerStore, ListEntriesParams, ListTransfersParams,
    MemoryLedgerStore,
};
use bank_service::BankService;

use crate::bank::{CustomerFactory, SimulatedCustomer};
use crate::metrics::{MetricsSummary, SimulationMetrics};
use crate::scenario::{FaultSpec, Phase, Scenario};

const SCAN_PAGE: i64 = 500;

/// Switches store faults on and off.
pub trait FaultInjector: Send + Sync {
    fn inject(&self, point: FailPoint);
    fn clear(&self);
}

impl FaultInjector for MemoryLedgerStore {
    fn inject(&self, point: FailPoint) {
        self.inject_fault(point);
    }

    fn clear(&self) {
        self.clear_faults();
    }
}

/// Balance check for one account.
#[derive(Debug, Clone, Serialize)]
pub struct AccountCheck {
    pub account_id: AccountId,
    pub balance: i64,
    pub entries_sum: i64,
    pub entries: usize,
}

/// Ledger invariants after a run.
#[derive(Debug, Clone, Serialize)]
pub struct Verification {
    pub expected_total: i64,
    pub actual_total: i64,
    /// Accounts whose balance differs from the sum of their entries.
    pub mismatched: Vec<AccountCheck>,
    /// Distinct transfer rows touching the simulated accounts.
    pub transfer_rows: usize,
    /// Transfers the client saw commit.
    pub committed: u64,
    /// Entry rows beyond the one funding entry per account.
    pub transfer_entries: usize,
}

impl Verification {
    pub fn is_ok(&self) -> bool {
        self.expected_total == self.actual_total
            && self.mismatched.is_empty()
            && self.transfer_rows as u64 == self.committed
            && self.transfer_entries == self.transfer_rows * 2
    }
}

/// Final run report.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub scenario: String,
    pub accounts: usize,
    pub concurrency: usize,
    pub elapsed_ms: u128,
    pub metrics: MetricsSummary,
    pub volume_committed: String,
    pub verification: Verification,
}

/// Controls the simulation.
pub struct SimulationController<S: LedgerStore> {
    service: Arc<BankService<S>>,
    faults: Option<Arc<dyn FaultInjector>>,
    currency: Currency,
    concurrency: usize,
    initial_balance: i64,
    customers: Vec<SimulatedCustomer>,
    metrics: Arc<RwLock<SimulationMetrics>>,
}

impl<S: LedgerStore + 'static> SimulationController<S> {
    /// Create a new simulation controller.
    pub fn new(
        service: Arc<BankService<S>>,
        faults: Option<Arc<dyn FaultInjector>>,
        currency: Currency,
        concurrency: usize,
        initial_balance: i64,
    ) -> Self {
        Self {
            service,
            faults,
            currency,
            concurrency: concurrency.max(1),
            initial_balance,
            customers: Vec::new(),
            metrics: Arc::new(RwLock::new(SimulationMetrics::new())),
        }
    }

    /// Create and fund the simulated accounts.
    pub async fn initialize(&mut self, run_id: &str, accounts: usize) -> anyhow::Result<()> {
        info!(accounts, initial_balance = self.initial_balance, "Initializing simulation");

        self.customers = CustomerFactory::provision(
            &self.service,
            run_id,
            accounts,
            self.currency.code(),
            self.initial_balance,
        )
        .await?;

        Ok(())
    }

    /// Account ids in provisioning order.
    pub fn account_ids(&self) -> Vec<AccountId> {
        self.customers.iter().map(SimulatedCustomer::account_id).collect()
    }

    /// Run every phase of `scenario`, then verify the ledger.
    pub async fn run_scenario(&self, scenario: &Scenario) -> anyhow::Result<Report> {
        info!(
            scenario = %scenario.name,
            description = %scenario.description,
            transfers = scenario.transfer_count(),
            "Running scenario"
        );

        let started = Instant::now();
        for phase in &scenario.phases {
            self.run_phase(phase).await?;
        }
        let elapsed = started.elapsed();

        let verification = self.verify().await?;
        let snapshot = self.service.metrics().snapshot();
        let volume = Money::new(
            i64::try_from(snapshot.volume_committed).unwrap_or(i64::MAX),
            self.currency.clone(),
        );

        Ok(Report {
            scenario: scenario.name.clone(),
            accounts: self.customers.len(),
            concurrency: self.concurrency,
            elapsed_ms: elapsed.as_millis(),
            metrics: self.metrics.read().await.summary(elapsed),
            volume_committed: volume.to_string(),
            verification,
        })
    }

    async fn run_phase(&self, phase: &Phase) -> anyhow::Result<()> {
        if let Some(spec) = phase.fault {
            let injector = self
                .faults
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("fault injection is only supported by the memory store"))?;
            let point = self.fail_point(spec)?;
            injector.inject(point);
            info!(phase = %phase.name, ?point, "Fault injected");
        }

        let service = Arc::clone(&self.service);
        let mut outcomes = stream::iter(phase.transfers.clone())
            .map(|command| {
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    let started = Instant::now();
                    let outcome = service.transfer(command).await;
                    (outcome, started.elapsed())
                })
            })
            .buffer_unordered(self.concurrency);

        while let Some(joined) = outcomes.next().await {
            let (outcome, latency) = joined?;
            let mut metrics = self.metrics.write().await;
            match outcome {
                Ok(_) => metrics.record_success(latency),
                Err(err) => metrics.record_failure(&err),
            }
        }

        if let Some(injector) = &self.faults {
            injector.clear();
        }

        info!(phase = %phase.name, transfers = phase.transfers.len(), "Phase complete");
        Ok(())
    }

    fn fail_point(&self, spec: FaultSpec) -> anyhow::Result<FailPoint> {
        let account = |index: usize| {
            self.customers
                .get(index)
                .map(SimulatedCustomer::account_id)
                .ok_or_else(|| anyhow::anyhow!("fault targets unknown account index {index}"))
        };

        Ok(match spec {
            FaultSpec::CreateTransfer => FailPoint::CreateTransfer,
            FaultSpec::CreateEntry { account: index } => FailPoint::CreateEntry(account(index)?),
            FaultSpec::AddBalance { account: index } => FailPoint::AddBalance(account(index)?),
            FaultSpec::Commit => FailPoint::Commit,
        })
    }

    /// Check conservation and that every balance equals the sum of its entries.
    pub async fn verify(&self) -> anyhow::Result<Verification> {
        let store = self.service.engine().store();
        let mut actual_total = 0i64;
        let mut mismatched = Vec::new();
        let mut transfer_ids = HashSet::new();
        let mut transfer_entries = 0usize;

        for customer in &self.customers {
            let account_id = customer.account_id();
            let account = store.get_account(account_id).await?;
            actual_total += account.balance;

            let mut entries_sum = 0i64;
            let mut entries = 0usize;
            let mut offset = 0;
            loop {
                let page = store
                    .list_entries(ListEntriesParams {
                        account_id,
                        limit: SCAN_PAGE,
                        offset,
                    })
                    .await?;
                entries += page.len();
                entries_sum += page.iter().map(|entry| entry.amount).sum::<i64>();
                if (page.len() as i64) < SCAN_PAGE {
                    break;
                }
                offset += SCAN_PAGE;
            }

            let mut offset = 0;
            loop {
                let page = store
                    .list_transfers(ListTransfersParams {
                        account_id,
                        limit: SCAN_PAGE,
                        offset,
                    })
                    .await?;
                transfer_ids.extend(page.iter().map(|transfer| transfer.id));
                if (page.len() as i64) < SCAN_PAGE {
                    break;
                }
                offset += SCAN_PAGE;
            }

            let funding_entries = usize::from(self.initial_balance != 0);
            transfer_entries += entries.saturating_sub(funding_entries);

            if entries_sum != account.balance {
                error!(
                    account_id = %account_id,
                    balance = account.balance,
                    entries_sum,
                    "Balance does not match entries"
                );
                mismatched.push(AccountCheck {
                    account_id,
                    balance: account.balance,
                    entries_sum,
                    entries,
                });
            }
        }

        let expected_total = self.initial_balance * self.customers.len() as i64;
        let committed = self.service.metrics().snapshot().transfers_committed;
        if actual_total != expected_total {
            warn!(expected_total, actual_total, "Total balance changed");
        }

        Ok(Verification {
            expected_total,
            actual_total,
            mismatched,
            transfer_rows: transfer_ids.len(),
            committed,
            transfer_entries,
        })
    }
}
