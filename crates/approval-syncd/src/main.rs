//! Approval Sync daemon
//!
//! Replays policy events against a world fixture through the reconciliation
//! engine and prints the resulting approval state.
//!
//! ## Commands
//!
//! - `run`: seed the fixture, route every event through the worker pool,
//!   print rules and violations as JSON
//! - `validate`: parse a fixture and summarise what it contains

mod fixture;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use approval_state::fakes::MemoryStore;
use approval_state::{
    ApprovalRule, ApprovalStore, MergeRequestId, RuleKind, SurrealApprovalStore, ViolationRecord,
};
use approval_sync::{
    init_tracing, BroadcastSignal, DispatcherConfig, Engine, EvidenceSources, LogCommentNotifier,
    Outputs, ReconciliationConfig, RetryPolicy, WorkerStats,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{info, warn, Level};

use crate::fixture::Fixture;

const RULE_KINDS: [RuleKind; 3] = [
    RuleKind::ScanFinding,
    RuleKind::LicenseFinding,
    RuleKind::AnyMergeRequest,
];

#[derive(Parser)]
#[command(name = "approval-syncd")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Security policy approval reconciliation daemon", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a fixture's events and print the reconciled approval state
    Run(RunArgs),

    /// Parse a fixture and print a summary
    Validate {
        /// Path to the world fixture (JSON)
        fixture: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreBackend {
    /// Keep rules and violations in the fixture's in-memory world
    Memory,
    /// Persist rules and violations in SurrealDB
    Surreal,
}

#[derive(Debug, Clone, Args)]
struct RunArgs {
    /// Path to the world fixture (JSON)
    fixture: PathBuf,

    /// Where approval rules and violations live
    #[arg(long, value_enum, default_value = "memory", env = "APPROVAL_SYNC_STORE")]
    approval_store: StoreBackend,

    /// SurrealDB endpoint used with `--approval-store surreal`
    #[arg(long, default_value = "mem://", env = "APPROVAL_SYNC_SURREAL_URL")]
    surreal_url: String,

    /// Number of queue workers
    #[arg(long, default_value = "4", env = "APPROVAL_SYNC_WORKERS")]
    workers: usize,

    /// Attempts per job, including the first run
    #[arg(long, default_value = "5", env = "APPROVAL_SYNC_MAX_ATTEMPTS")]
    max_attempts: u32,

    /// Backoff before the first retry, in milliseconds
    #[arg(long, default_value = "100", env = "APPROVAL_SYNC_BASE_BACKOFF_MS")]
    base_backoff_ms: u64,

    /// Upper bound on retry backoff, in milliseconds
    #[arg(long, default_value = "10000", env = "APPROVAL_SYNC_MAX_BACKOFF_MS")]
    max_backoff_ms: u64,

    /// Evaluate child pipelines on their own instead of through the root
    #[arg(long, env = "APPROVAL_SYNC_NO_CHILD_AGGREGATION")]
    no_child_aggregation: bool,

    /// Treat manual pipelines as finished
    #[arg(long, env = "APPROVAL_SYNC_MANUAL_IS_TERMINAL")]
    manual_is_terminal: bool,

    /// Reconcile findings jobs even when the pipeline is no longer the head
    #[arg(long, env = "APPROVAL_SYNC_KEEP_STALE_PIPELINES")]
    keep_stale_pipelines: bool,
}

impl RunArgs {
    fn reconciliation_config(&self) -> ReconciliationConfig {
        ReconciliationConfig::default()
            .with_child_pipeline_aggregation(!self.no_child_aggregation)
            .with_manual_as_terminal(self.manual_is_terminal)
            .with_stale_pipeline_skip(!self.keep_stale_pipelines)
    }

    fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            workers: self.workers,
            retry: RetryPolicy {
                max_attempts: self.max_attempts.max(1),
                base_backoff: Duration::from_millis(self.base_backoff_ms),
                max_backoff: Duration::from_millis(self.max_backoff_ms),
            },
        }
    }
}

/// Final approval state of one merge request.
#[derive(Debug, Serialize)]
struct MergeRequestReport {
    merge_request_id: MergeRequestId,
    rules: Vec<ApprovalRule>,
    violations: Vec<ViolationRecord>,
}

#[derive(Debug, Serialize)]
struct RunReport {
    events: usize,
    routing_errors: Vec<String>,
    workers: WorkerStats,
    /// Merge requests whose approval state changed, as signalled
    changed: Vec<MergeRequestId>,
    merge_requests: Vec<MergeRequestReport>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    match cli.command {
        Commands::Run(args) => cmd_run(&args).await,
        Commands::Validate { fixture } => cmd_validate(&fixture),
    }
}

async fn cmd_run(args: &RunArgs) -> Result<()> {
    let fixture = Fixture::load(&args.fixture)?;
    let report = run(&fixture, args).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn cmd_validate(path: &Path) -> Result<()> {
    let fixture = Fixture::load(path)?;
    let summary = serde_json::json!({
        "merge_requests": fixture.merge_requests.len(),
        "pipelines": fixture.pipelines.len(),
        "rules": fixture.rules.len(),
        "findings": fixture.findings.len(),
        "licenses": fixture.licenses.len(),
        "vulnerabilities": fixture.vulnerabilities.len(),
        "events": fixture.events.len(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn run(fixture: &Fixture, args: &RunArgs) -> Result<RunReport> {
    let world = Arc::new(MemoryStore::new());
    fixture.seed(&world);

    let store: Arc<dyn ApprovalStore> = match args.approval_store {
        StoreBackend::Memory => world.clone(),
        StoreBackend::Surreal => {
            let surreal = SurrealApprovalStore::connect(&args.surreal_url)
                .await
                .with_context(|| format!("Failed to connect to {}", args.surreal_url))?;
            fixture.seed_approvals(&surreal).await?;
            Arc::new(surreal)
        }
    };

    let signal = Arc::new(BroadcastSignal::new(fixture.events.len().max(1) * 16));
    let mut changes = signal.subscribe();

    let sources = EvidenceSources {
        merge_requests: world.clone(),
        pipelines: world.clone(),
        evidence: world.clone(),
    };
    let outputs = Outputs {
        store: store.clone(),
        notifier: Arc::new(LogCommentNotifier),
        signal: signal.clone(),
    };
    let engine = Engine::start(
        sources,
        outputs,
        args.reconciliation_config(),
        args.dispatcher_config(),
    );

    let mut routing_errors = Vec::new();
    for event in &fixture.events {
        match engine.submit(*event).await {
            Ok(jobs) => info!(?event, jobs = jobs.len(), "event routed"),
            Err(e) => {
                warn!(?event, error = %e, "event could not be routed");
                routing_errors.push(e.to_string());
            }
        }
    }
    let workers = engine.shutdown().await;

    let mut changed = BTreeSet::new();
    loop {
        match changes.try_recv() {
            Ok(mr) => {
                changed.insert(mr);
            }
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }

    let mut merge_requests = Vec::new();
    for mr in &fixture.merge_requests {
        let id = mr.merge_request.id;
        let mut rules = Vec::new();
        for kind in RULE_KINDS {
            rules.extend(store.rules_for(id, kind).await?);
        }
        rules.sort_by_key(|r| r.id);
        merge_requests.push(MergeRequestReport {
            merge_request_id: id,
            rules,
            violations: store.violations_for(id).await?,
        });
    }

    Ok(RunReport {
        events: fixture.events.len(),
        routing_errors,
        workers,
        changed: changed.into_iter().collect(),
        merge_requests,
    })
}
