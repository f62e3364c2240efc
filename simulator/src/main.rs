//! Bank Ledger Simulator
//!
//! Drives concurrent transfers through the service layer and checks that
//! the ledger stays consistent.

use std::sync::Arc;

use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use bank_common::Currency;
use bank_ledger::{LedgerStore, MemoryLedgerStore, PgLedgerStore};
use bank_service::{BankService, LogFormat, ServiceConfig};

mod bank;
mod controller;
mod metrics;
mod scenario;

use controller::{FaultInjector, Report, SimulationController};
use scenario::{Scenario, ScenarioKind};

/// Ledger store backing the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    Memory,
    Postgres,
}

/// Bank ledger simulator CLI
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(about = "Concurrent transfer simulator for the bank ledger")]
struct Args {
    /// Number of accounts to create
    #[arg(short, long, default_value = "4")]
    accounts: usize,

    /// Scenario to run
    #[arg(short, long, value_enum, default_value = "random-mesh")]
    scenario: ScenarioKind,

    /// Number of transfers to generate
    #[arg(short, long, default_value = "1000")]
    transfers: usize,

    /// Maximum transfers in flight
    #[arg(short, long, default_value = "16")]
    concurrency: usize,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Opening balance of every account, in minor units
    #[arg(long, default_value = "100000")]
    initial_balance: i64,

    /// Account currency
    #[arg(long, default_value = "USD")]
    currency: String,

    /// Ledger store
    #[arg(long, value_enum, default_value = "memory")]
    store: StoreKind,

    /// Print the final report as JSON
    #[arg(long)]
    json: bool,
}

fn init_tracing(config: &ServiceConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).init(),
    }
}

async fn simulate<S: LedgerStore + 'static>(
    args: &Args,
    config: ServiceConfig,
    store: Arc<S>,
    faults: Option<Arc<dyn FaultInjector>>,
) -> anyhow::Result<Report> {
    let currency = Currency::parse_supported(&args.currency)?;
    let service = Arc::new(BankService::new(store, config));
    service.health_check().await?;

    let mut controller = SimulationController::new(
        service,
        faults,
        currency.clone(),
        args.concurrency,
        args.initial_balance,
    );

    let run_id = Uuid::new_v4().simple().to_string()[..8].to_string();
    controller.initialize(&run_id, args.accounts).await?;

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let scenario = Scenario::build(
        args.scenario,
        &controller.account_ids(),
        currency.code(),
        args.transfers,
        &mut rng,
    )?;

    controller.run_scenario(&scenario).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = ServiceConfig::from_env()?;
    config.validate()?;
    init_tracing(&config);

    info!(
        accounts = args.accounts,
        scenario = ?args.scenario,
        transfers = args.transfers,
        concurrency = args.concurrency,
        store = ?args.store,
        "Starting bank ledger simulator"
    );

    let report = match args.store {
        StoreKind::Memory => {
            let store = Arc::new(MemoryLedgerStore::new());
            let faults: Arc<dyn FaultInjector> = store.clone();
            simulate(&args, config, store, Some(faults)).await?
        }
        StoreKind::Postgres => {
            if args.scenario == ScenarioKind::FaultInjection {
                anyhow::bail!("the fault-injection scenario needs --store memory");
            }
            let store = PgLedgerStore::connect(
                &config.database_url,
                config.pool.max_connections,
                config.pool.acquire_timeout,
            )
            .await?;
            store.install_schema().await?;
            simulate(&args, config, Arc::new(store), None).await?
        }
    };

    let metrics = &report.metrics;
    info!(
        total = metrics.total_transfers,
        committed = metrics.successful_transfers,
        failed = metrics.failed_transfers,
        success_rate = metrics.success_rate,
        throughput_per_sec = metrics.throughput_per_sec,
        p50_us = metrics.p50_latency_us,
        p99_us = metrics.p99_latency_us,
        volume = %report.volume_committed,
        "Simulation complete"
    );

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    let verification = &report.verification;
    if !verification.is_ok() {
        error!(
            expected_total = verification.expected_total,
            actual_total = verification.actual_total,
            mismatched = verification.mismatched.len(),
            transfer_rows = verification.transfer_rows,
            committed = verification.committed,
            "Ledger invariant violated"
        );
        std::process::exit(1);
    }

    info!(
        total_balance = verification.actual_total,
        transfer_rows = verification.transfer_rows,
        "Ledger invariants hold"
    );
    Ok(())
}
