//! meshwall - multi-cluster ingress firewall
//!
//! Compiles per-cluster ingress policy from a desired-state snapshot into
//! nftables specs and converges the local packet filter to them.
//!
//! # Usage
//!
//! ```bash
//! meshwall compile state.json                  # Print every compiled configuration
//! meshwall compile state.json --format nft     # ...as nft scripts
//! meshwall diff state.json                     # Show what apply would change
//! meshwall apply state.json --check            # Verify, then converge once
//! meshwall apply state.json --dry-run          # Converge an in-memory filter
//! meshwall run state.json --interval 30 --out /var/lib/meshwall
//! ```
//!
//! Gateway tables share one name across clusters, so they are only enforced
//! with `--gateway-cluster <id>` naming the cluster this gateway serves.

use clap::{Parser, Subcommand, ValueEnum};
use meshwall::audit::AuditLog;
use meshwall::config::{self, AppConfig};
use meshwall::converger::{Converger, ConvergerOptions, Outcome};
use meshwall::core::diff::Plan;
use meshwall::core::firewall::ClusterId;
use meshwall::core::observed::ObservedTable;
use meshwall::reconciler::{ReconcileReport, Reconciler, ReconcilerOptions};
use meshwall::store::{DesiredStateStore, FileStore, FirewallConfiguration, MemoryStore, Snapshot};
use meshwall::transport::{MemoryFilter, NftFilter, PacketFilter};
use meshwall::utils;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "meshwall")]
#[command(version = build::PKG_VERSION, long_version = build::CLAP_LONG_VERSION)]
#[command(about = "Multi-cluster ingress firewall for nftables", long_about = None)]
struct Cli {
    /// Configuration file (default: <config dir>/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Cluster ID whose gateway runs on this host
    #[arg(long, global = true, value_name = "CLUSTER_ID")]
    gateway_cluster: Option<String>,
    /// Also write logs to meshwall.log in the state directory
    #[arg(long, global = true)]
    log_file: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile every target of a snapshot and print the configurations
    Compile {
        snapshot: PathBuf,
        #[arg(short, long, value_enum, default_value_t = Format::Json)]
        format: Format,
    },
    /// Show the plan converging the packet filter to a snapshot
    Diff { snapshot: PathBuf },
    /// Converge the packet filter to a snapshot once
    Apply {
        snapshot: PathBuf,
        /// Apply to an in-memory packet filter instead of nft
        #[arg(long)]
        dry_run: bool,
        /// Run `nft --check` on every batch before applying it
        #[arg(long)]
        check: bool,
    },
    /// Reconcile continuously, re-reading the snapshot on every tick
    Run {
        snapshot: PathBuf,
        /// Seconds between reconciliations
        #[arg(long, default_value_t = 30, value_name = "SECONDS")]
        interval: u64,
        /// Directory compiled configurations are written to
        #[arg(long, value_name = "DIR")]
        out: Option<PathBuf>,
        #[arg(long)]
        check: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Json,
    Nft,
}

fn init_logging(to_file: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if to_file && let Some(mut log_path) = utils::get_state_dir() {
        log_path.push("meshwall.log");
        if let Ok(file) = std::fs::File::create(log_path) {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(file)
                .init();
            return;
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = utils::ensure_dirs() {
        eprintln!("Warning: cannot create meshwall directories: {e}");
    }
    init_logging(cli.log_file);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(handle_cli(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

async fn load_options(cli: &Cli) -> CliResult<(AppConfig, ReconcilerOptions)> {
    let config = config::load_config(cli.config.as_deref()).await?;
    let mut options = ReconcilerOptions::from(&config);
    options.local_gateway = cli
        .gateway_cluster
        .as_deref()
        .map(ClusterId::new)
        .transpose()?;
    Ok((config, options))
}

fn build_converger(config: &AppConfig, filter: Arc<dyn PacketFilter>, verify: bool) -> Converger {
    Converger::new(
        filter,
        ConvergerOptions {
            fetch_timeout: config.fetch_timeout(),
            apply_timeout: config.apply_timeout(),
            verify,
        },
    )
}

/// Cancels `token` on Ctrl-C.
fn cancel_on_interrupt(token: &CancellationToken) {
    let token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling in-flight operations");
            token.cancel();
        }
    });
}

fn print_report(report: &ReconcileReport) {
    for entry in &report.targets {
        match &entry.result {
            Ok(Some(Outcome::Applied { ops })) => println!("✓ {}: applied {ops} operations", entry.target),
            Ok(Some(Outcome::AlreadyConverged)) => println!("✓ {}: already converged", entry.target),
            Ok(Some(Outcome::Superseded)) => println!("- {}: superseded", entry.target),
            Ok(None) => println!("✓ {}: compiled", entry.target),
            Err(e) => println!("✗ {}: {e}", entry.target),
        }
    }
}

/// Compiles every target of `snapshot` into an in-memory store.
async fn compile_snapshot(
    snapshot: &Path,
    options: ReconcilerOptions,
) -> CliResult<(Reconciler, Vec<FirewallConfiguration>, ReconcileReport)> {
    let store = Arc::new(MemoryStore::new(Snapshot::load(snapshot).await?));
    let reconciler = Reconciler::new(store.clone(), options);
    let report = reconciler.reconcile_all().await?;
    Ok((reconciler, store.configurations().await, report))
}

async fn handle_cli(cli: Cli) -> CliResult<ExitCode> {
    let (config, options) = load_options(&cli).await?;

    match cli.command {
        Commands::Compile { snapshot, format } => {
            let (_, configurations, report) = compile_snapshot(&snapshot, options).await?;
            for configuration in &configurations {
                match format {
                    Format::Json => println!("{}", serde_json::to_string_pretty(configuration)?),
                    Format::Nft => {
                        println!("# {}/{}", configuration.namespace, configuration.name);
                        println!("{}", configuration.spec.normalize()?.to_nft_text()?);
                    }
                }
            }
            for failure in report.failures() {
                if let Err(e) = &failure.result {
                    eprintln!("✗ {}: {e}", failure.target);
                }
            }
            Ok(exit_code(&report))
        }
        Commands::Diff { snapshot } => {
            let (reconciler, configurations, report) = compile_snapshot(&snapshot, options).await?;
            let filter: Arc<dyn PacketFilter> = Arc::new(NftFilter::from_env_or(&config.nft_command)?);
            let converger = build_converger(&config, Arc::clone(&filter), false);
            let cancel = CancellationToken::new();

            for configuration in configurations.iter().filter(|c| reconciler.converges_here(c)) {
                let spec = &configuration.spec;
                let plan = converger.plan(spec, &cancel).await?;
                if plan.is_empty() {
                    println!("✓ table {}: converged", spec.table.name);
                    continue;
                }
                println!("table {}: {} operations", spec.table.name, plan.ops.len());
                for op in &plan.ops {
                    println!("  {op}");
                }
                let observed = filter.fetch(spec.table.family, &spec.table.name).await?;
                println!("{}", render_diff(observed, &plan).await?);
            }
            Ok(exit_code(&report))
        }
        Commands::Apply { snapshot, dry_run, check } => {
            let filter: Arc<dyn PacketFilter> = if dry_run {
                Arc::new(MemoryFilter::new())
            } else {
                Arc::new(NftFilter::from_env_or(&config.nft_command)?)
            };
            let mut converger = build_converger(&config, filter, check);
            if !dry_run {
                converger = converger.with_audit(AuditLog::new()?);
            }

            let cancel = CancellationToken::new();
            cancel_on_interrupt(&cancel);
            let store = Arc::new(MemoryStore::new(Snapshot::load(&snapshot).await?));
            let reconciler = Reconciler::new(store, options)
                .with_converger(Arc::new(converger))
                .with_cancellation(cancel);

            let report = reconciler.reconcile_all().await?;
            print_report(&report);
            Ok(exit_code(&report))
        }
        Commands::Run {
            snapshot,
            interval,
            out,
            check,
        } => {
            let out = out
                .or_else(|| utils::get_data_dir().map(|d| d.join("configurations")))
                .ok_or("no output directory; pass --out")?;
            let filter = Arc::new(NftFilter::from_env_or(&config.nft_command)?);
            let converger = build_converger(&config, filter, check).with_audit(AuditLog::new()?);
            let store: Arc<dyn DesiredStateStore> = Arc::new(FileStore::new(snapshot, out));

            let cancel = CancellationToken::new();
            cancel_on_interrupt(&cancel);
            let reconciler = Reconciler::new(store, options)
                .with_converger(Arc::new(converger))
                .with_cancellation(cancel.clone());

            run_loop(&reconciler, Duration::from_secs(interval.max(1)), &cancel).await;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_loop(reconciler: &Reconciler, interval: Duration, cancel: &CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match reconciler.reconcile_all().await {
            Ok(report) => {
                let failed = report.failures().count();
                if failed == 0 {
                    info!(targets = report.targets.len(), "Reconciled");
                } else {
                    for failure in report.failures() {
                        if let Err(e) = &failure.result {
                            warn!(reconcile_target = %failure.target, "Reconciliation failed: {e}");
                        }
                    }
                }
            }
            Err(e) => error!("Cannot list policies: {e}"),
        }
    }
    info!("Stopped");
}

/// Unified diff between the observed listing and the listing after `plan`.
async fn render_diff(observed: Option<ObservedTable>, plan: &Plan) -> CliResult<String> {
    let before = match &observed {
        Some(table) => serde_json::to_string_pretty(&table.to_listing())?,
        None => String::new(),
    };

    let preview = MemoryFilter::new();
    if let Some(table) = observed {
        preview.insert_table(table).await;
    }
    preview.apply(&plan.to_nftables_json()?).await?;
    let after = match preview.fetch(plan.family, &plan.table).await? {
        Some(table) => serde_json::to_string_pretty(&table.to_listing())?,
        None => String::new(),
    };

    Ok(similar::TextDiff::from_lines(&before, &after)
        .unified_diff()
        .header("observed", "desired")
        .to_string())
}

fn exit_code(report: &ReconcileReport) -> ExitCode {
    if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
