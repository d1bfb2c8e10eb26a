use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hour_escrow::{
    models::{hours, Amount, BlockNumber},
    reconciler::{Anomaly, ReconcileState, SkippedLog},
    settlement::SettlementConfig,
    Address, EngineConfig, EscrowEvent, EventReconciler, JsonRpcLedgerClient, LedgerClient,
    NetworkSummary, ReconcilerConfig, ReputationAggregator, ReputationService, ReputationView,
    SettlementMachine,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "hour-escrow", about = "Hour token escrow reputation and settlement tools")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reputation stats and history for an address
    Reputation {
        /// Address to score, omit for the unfiltered history
        #[arg(short, long)]
        subject: Option<String>,

        /// Only print escrows the subject took part in
        #[arg(long)]
        participant_only: bool,

        /// Reconciled state file, resumed from and written back after sync
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },

    /// Network-wide escrow totals and leaderboards
    Analytics {
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },

    /// Every escrow event in ledger order
    Timeline {
        /// First block, defaults to the configured deployment block
        #[arg(long)]
        from_block: Option<u64>,
    },

    /// Run a settlement scenario against the in-memory ledger
    Simulate {
        /// Hours locked per escrow
        #[arg(long, default_value_t = 2)]
        hours: u64,
    },
}

#[derive(Serialize)]
struct AnalyticsOutput {
    summary: NetworkSummary,
    anomalies: Vec<Anomaly>,
    skipped: usize,
}

#[derive(Serialize)]
struct TimelineOutput {
    from_block: BlockNumber,
    to_block: BlockNumber,
    events: Vec<EscrowEvent>,
    skipped: Vec<SkippedLog>,
}

#[derive(Serialize)]
struct SimulationOutput {
    requester_balance: Amount,
    provider_balance: Amount,
    custody_balance: Amount,
    head: BlockNumber,
    provider_view: ReputationView,
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn rpc_client(config: &EngineConfig) -> Result<Arc<JsonRpcLedgerClient>> {
    config
        .ledger
        .validate()
        .context("Ledger configuration incomplete")?;
    let client = JsonRpcLedgerClient::new(
        config.ledger.rpc_url.clone(),
        config.ledger.token_contract.clone(),
        config.ledger.request_timeout(),
    )
    .context("Failed to create JSON-RPC client")?;
    Ok(Arc::new(client))
}

fn connect(config: &EngineConfig) -> Result<EventReconciler> {
    Ok(EventReconciler::new(
        rpc_client(config)?,
        config.reconciler_config()?,
    ))
}

fn load_checkpoint(path: &Path) -> Result<ReconcileState> {
    if !path.exists() {
        info!(path = %path.display(), "No checkpoint yet, replaying from deployment block");
        return Ok(ReconcileState::new());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read checkpoint {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Corrupt checkpoint {}", path.display()))
}

fn save_checkpoint(path: &Path, state: &ReconcileState) -> Result<()> {
    let raw = serde_json::to_string(state)?;
    std::fs::write(path, raw)
        .with_context(|| format!("Failed to write checkpoint {}", path.display()))
}

/// Reconciled state, incrementally synced when a checkpoint is given
async fn reconciled_state(
    reconciler: &EventReconciler,
    checkpoint: Option<&Path>,
) -> Result<ReconcileState> {
    let Some(path) = checkpoint else {
        return Ok(reconciler.reconcile_full().await?);
    };
    let mut state = load_checkpoint(path)?;
    let outcome = reconciler.sync(&mut state).await?;
    info!(head = outcome.head, new_events = outcome.new_events, "Checkpoint synced");
    save_checkpoint(path, &state)?;
    Ok(state)
}

async fn reputation(
    config: &EngineConfig,
    subject: Option<String>,
    participant_only: bool,
    checkpoint: Option<PathBuf>,
) -> Result<()> {
    let subject = subject
        .map(|raw| Address::parse(&raw))
        .transpose()
        .context("Invalid subject address")?;
    let reconciler = connect(config)?;
    let service = ReputationService::new(
        reconciler.clone(),
        ReputationAggregator::new(config.reputation.clone()),
    );

    let mut view = match checkpoint {
        Some(path) => {
            let state = reconciled_state(&reconciler, Some(&path)).await?;
            service.build_view(0, subject.as_ref(), &state)
        }
        None => service
            .query(subject.as_ref())
            .await
            .fresh()
            .context("Reputation query was superseded")?,
    };

    if !view.completeness.is_complete() {
        warn!(completeness = ?view.completeness, "Reputation view is incomplete");
    }
    if participant_only {
        view.history = view.participant_history().into_iter().cloned().collect();
    }
    print_json(&view)
}

async fn analytics(config: &EngineConfig, checkpoint: Option<PathBuf>) -> Result<()> {
    let reconciler = connect(config)?;
    let state = reconciled_state(&reconciler, checkpoint.as_deref()).await?;

    let aggregator = ReputationAggregator::new(config.reputation.clone());
    let report = aggregator.aggregate(&state.escrows, None);
    let summary = aggregator.network_summary(&report.history);

    print_json(&AnalyticsOutput {
        summary,
        skipped: state.skipped.len(),
        anomalies: state.anomalies,
    })
}

async fn timeline(config: &EngineConfig, from_block: Option<u64>) -> Result<()> {
    let client = rpc_client(config)?;
    let head = client
        .block_number()
        .await
        .context("Failed to read head block")?;
    let reconciler = EventReconciler::new(client, config.reconciler_config()?);

    let from_block = from_block.unwrap_or(config.ledger.from_block);
    let fetched = reconciler.fetch_range(from_block, head).await?;
    for skipped in &fetched.skipped {
        warn!(stream = %skipped.stream, reason = %skipped.reason, "Skipped malformed log");
    }

    print_json(&TimelineOutput {
        from_block,
        to_block: head,
        events: fetched.streams.timeline(),
        skipped: fetched.skipped,
    })
}

async fn simulate(config: &EngineConfig, whole_hours: u64) -> Result<()> {
    let machine = SettlementMachine::new(SettlementConfig::default());
    let requester = Address::from_bytes([0xaa; 20]);
    let provider = Address::from_bytes([0xbb; 20]);
    let amount = hours(whole_hours);

    machine.mint(&requester, amount * 2).await?;
    machine.approve(&requester, amount * 2).await;

    let completed = machine.create_escrow(&requester, &provider, amount).await?;
    machine.confirm(&requester, completed.escrow_id).await?;
    machine.confirm(&provider, completed.escrow_id).await?;

    let refunded = machine.create_escrow(&requester, &provider, amount).await?;
    machine.cancel(&provider, refunded.escrow_id).await?;

    let reconciler = EventReconciler::new(
        Arc::new(machine.clone()),
        ReconcilerConfig {
            contract_address: machine.contract_address().clone(),
            from_block: 0,
            retry: config.retry.to_policy()?,
        },
    );
    let service = ReputationService::new(
        reconciler,
        ReputationAggregator::new(config.reputation.clone()),
    );
    let view = service
        .query(Some(&provider))
        .await
        .fresh()
        .context("Reputation query was superseded")?;

    print_json(&SimulationOutput {
        requester_balance: machine.balance(&requester).await,
        provider_balance: machine.balance(&provider).await,
        custody_balance: machine.custody_balance().await,
        head: machine.head().await,
        provider_view: view,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.log_level);

    match cli.command {
        Commands::Reputation {
            subject,
            participant_only,
            checkpoint,
        } => reputation(&config, subject, participant_only, checkpoint).await,
        Commands::Analytics { checkpoint } => analytics(&config, checkpoint).await,
        Commands::Timeline { from_block } => timeline(&config, from_block).await,
        Commands::Simulate { hours } => simulate(&config, hours).await,
    }
}
