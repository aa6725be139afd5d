//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use samplegraph_backup::{BackupGateway, RestoreOutcome};
use samplegraph_core::milestone::MilestoneReport;
use samplegraph_core::pipeline::{CrawlPipelineConfig, run_crawl, verify_checkpoint};
use samplegraph_core::ProgressReporter;
use samplegraph_crawler::{ApiClient, CrawlSummary};
use samplegraph_shared::{
    AppConfig, DiscoveryMode, ItemId, RunConfig, RunStats, expand_path, init_config, load_config,
};
use samplegraph_storage::CheckpointManager;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// SampleGraph: grow a relationship graph of audio samples, one budgeted run at a time.
#[derive(Parser)]
#[command(
    name = "samplegraph",
    version,
    about = "Budgeted, resumable crawler that builds a relationship graph of catalog items.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run one budgeted crawl: restore, crawl, back up, post-process milestones.
    Crawl {
        /// Discovery mode: search, relationships, or mixed.
        #[arg(short, long)]
        mode: Option<DiscoveryMode>,

        /// Per-run API request ceiling.
        #[arg(long)]
        max_requests: Option<u32>,

        /// Item id to start relationship discovery from.
        #[arg(long)]
        seed: Option<ItemId>,

        /// Skip restore and upload against the backup store.
        #[arg(long)]
        no_backup: bool,
    },

    /// Check a checkpoint's counters against its contents.
    Verify {
        /// Checkpoint directory (defaults to `[checkpoint].dir`).
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Repair an inconsistent checkpoint and save it.
        #[arg(long)]
        repair: bool,
    },

    /// Replace the local checkpoint with the newest usable backup archive.
    Restore,

    /// Print whether a node-count change crosses a milestone, as JSON.
    Milestone {
        /// Node count now.
        #[arg(long)]
        current: usize,

        /// Node count before the run.
        #[arg(long)]
        previous: usize,

        /// Milestone size (defaults to `[milestone].boundary`).
        #[arg(long)]
        boundary: Option<u64>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "samplegraph=info",
        1 => "samplegraph=debug",
        _ => "samplegraph=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Crawl {
            mode,
            max_requests,
            seed,
            no_backup,
        } => cmd_crawl(mode, max_requests, seed, no_backup).await,
        Command::Verify { checkpoint, repair } => cmd_verify(checkpoint, repair).await,
        Command::Restore => cmd_restore().await,
        Command::Milestone {
            current,
            previous,
            boundary,
        } => cmd_milestone(current, previous, boundary),
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

fn checkpoint_manager(config: &AppConfig, run: &RunConfig) -> CheckpointManager {
    CheckpointManager::new(expand_path(&config.checkpoint.dir))
        .with_update_mode(run.metadata_update_mode)
        .with_queue_capacity(run.max_pending_nodes)
}

// ---------------------------------------------------------------------------
// crawl
// ---------------------------------------------------------------------------

async fn cmd_crawl(
    mode: Option<DiscoveryMode>,
    max_requests: Option<u32>,
    seed: Option<ItemId>,
    no_backup: bool,
) -> Result<()> {
    let config = load_config()?;

    let mut run = RunConfig::from(&config);
    if let Some(mode) = mode {
        run.discovery_mode = mode;
    }
    if let Some(max) = max_requests {
        run.max_requests = max;
    }
    if seed.is_some() {
        run.seed_item_id = seed;
    }
    run.validate()?;

    let pipeline = CrawlPipelineConfig::from_app(&config, run);
    tokio::spawn(cancel_on_shutdown_signal(pipeline.cancel.clone()));
    let client = ApiClient::from_config(&config.api, pipeline.run.max_requests)?;
    let gateway = if no_backup {
        None
    } else {
        BackupGateway::from_config(&config.backup)?
    };

    info!(
        mode = %pipeline.run.discovery_mode,
        max_requests = pipeline.run.max_requests,
        checkpoint = %pipeline.checkpoint_dir.display(),
        backup = gateway.is_some(),
        "starting crawl"
    );

    let reporter = Arc::new(CliProgress::new(pipeline.run.max_requests));
    let result = run_crawl(&pipeline, client, gateway.as_ref(), reporter).await?;
    let summary = &result.summary;

    println!();
    println!("  Crawl finished ({})", summary.stop_reason.as_str());
    println!("  Run:        {}", summary.run_id);
    println!("  Requests:   {}/{}", summary.requests_made, pipeline.run.max_requests);
    println!("  Processed:  {}", summary.items_processed);
    println!("  Nodes:      +{} ({} updated)", summary.nodes_added, summary.nodes_updated);
    println!("  Edges:      +{}", summary.edges_added);
    println!("  Failures:   {}", summary.failures.len());
    if !summary.invalidated.is_empty() {
        println!("  Removed:    {} (no longer in catalog)", summary.invalidated.len());
    }
    println!(
        "  Graph:      {} nodes, {} edges, {} pending",
        summary.final_stats.nodes, summary.final_stats.edges, summary.final_stats.pending_count
    );
    if let Some(asset) = &result.uploaded {
        println!("  Backup:     {}", asset.name);
    }
    if let Some(post) = &result.post_processing {
        println!("  Milestone:  {} ({})", post.milestone, post.dir.display());
        for report in &post.reports {
            println!("    {:<18} exit {}", report.kind.as_str(), report.exit_code);
        }
    }
    println!("  Time:       {:.1}s", result.elapsed.as_secs_f64());
    println!();

    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM so the crawl stops between items and
/// still saves and uploads its checkpoint.
async fn cancel_on_shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "could not listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    warn!("shutdown signal received; finishing the current item and saving");
    token.cancel();
}

// ---------------------------------------------------------------------------
// verify / restore / milestone
// ---------------------------------------------------------------------------

async fn cmd_verify(checkpoint: Option<PathBuf>, repair: bool) -> Result<()> {
    let config = load_config()?;
    let run = RunConfig::from(&config);
    let manager = match checkpoint {
        Some(dir) => checkpoint_manager(&config, &run).relocated(dir),
        None => checkpoint_manager(&config, &run),
    };

    let outcome = verify_checkpoint(&manager, repair)
        .await?
        .ok_or_else(|| eyre!("no checkpoint found at '{}'", manager.dir().display()))?;

    print_stats(&outcome.stats);
    match (&outcome.mismatch, outcome.repaired) {
        (None, _) => {
            println!("  Checkpoint is consistent.");
            Ok(())
        }
        (Some(mismatch), true) => {
            println!("  Repaired: {mismatch}");
            Ok(())
        }
        (Some(mismatch), false) => Err(eyre!(
            "checkpoint is inconsistent: {mismatch}. Re-run with --repair to fix it."
        )),
    }
}

async fn cmd_restore() -> Result<()> {
    let config = load_config()?;
    let run = RunConfig::from(&config);
    let gateway = BackupGateway::from_config(&config.backup)?
        .ok_or_else(|| eyre!("backups are disabled; set `enabled = true` under [backup]"))?;
    let manager = checkpoint_manager(&config, &run);

    match gateway.restore_latest(&manager).await? {
        RestoreOutcome::Restored { asset, repair } => {
            println!("Restored {} into {}", asset.name, manager.dir().display());
            if let Some(report) = repair {
                println!("Repaired on restore: {}", report.mismatch);
            }
        }
        RestoreOutcome::Empty => println!("No checkpoint archives found; nothing restored."),
    }
    Ok(())
}

fn cmd_milestone(current: usize, previous: usize, boundary: Option<u64>) -> Result<()> {
    let boundary = match boundary {
        Some(b) => b,
        None => load_config()?.milestone.boundary,
    };
    let report = MilestoneReport::evaluate(current, previous, boundary);
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}

fn print_stats(stats: &RunStats) {
    println!();
    println!("  Schema:     v{}", stats.schema_version);
    println!("  Run:        {}", stats.run_id);
    println!("  Saved:      {}", stats.timestamp.to_rfc3339());
    println!("  Nodes:      {}", stats.nodes);
    println!("  Edges:      {}", stats.edges);
    println!("  Processed:  {}", stats.processed_count);
    println!("  Pending:    {}", stats.pending_count);
    println!("  Runs:       {}", stats.runs_completed);
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif bar over the request budget.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new(max_requests: u32) -> Self {
        let bar = ProgressBar::new(u64::from(max_requests));
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} requests {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { bar }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.bar.set_message(name.to_string());
    }

    fn item_processed(&self, id: ItemId, processed: usize, requests_made: u32, _max_requests: u32) {
        self.bar.set_position(u64::from(requests_made));
        self.bar.set_message(format!("{processed} processed, last #{id}"));
    }

    fn checkpoint_saved(&self, stats: &RunStats) {
        self.bar.println(format!(
            "  checkpoint: {} nodes, {} edges, {} pending",
            stats.nodes, stats.edges, stats.pending_count
        ));
    }

    fn done(&self, _summary: &CrawlSummary) {
        self.bar.finish_and_clear();
    }
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
