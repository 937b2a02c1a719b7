//! CLI command definitions for hive-forge.
//!
//! `run` hosts the whole service in one process: the worker pool over the
//! three stage queues, the beat and the health publisher. The other commands
//! are short-lived operator tools that talk to the same Redis.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use redis::aio::ConnectionManager;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::clock::{system_clock, SharedClock};
use crate::config::HiveConfig;
use crate::dispatch::{build_executor, DispatchExecutor, Secret};
use crate::health::{
    spawn_publisher, HealthChecker, HealthReport, HealthSnapshotStore, HealthStatus,
};
use crate::pipeline::{build_handlers, PipelineOrchestrator, RedisStateStore, StateStore};
use crate::scheduler::{Beat, QueueStats, RedisTaskQueue, ScrapeRequest, TaskQueue, WorkerPool};

/// Resilient scrape → write → publish pipeline over multiple LLM providers.
#[derive(Parser)]
#[command(name = "hive-forge")]
#[command(about = "Queue-driven content pipeline with multi-provider LLM dispatch")]
#[command(version)]
#[command(
    long_about = "hive-forge runs a scrape → write → publish pipeline on Redis-backed stage queues.\n\nGeneration calls are spread across providers and credentials with rate limits, credential cooldowns and per-provider circuit breakers.\n\nExample usage:\n  hive-forge run --config hive.yaml\n  hive-forge trigger https://news.example.com --query rust"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (YAML). Falls back to $HIVE_CONFIG, then defaults.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run workers, the beat and the health publisher until Ctrl-C.
    Run(RunArgs),

    /// Start one pipeline instance now.
    Trigger(TriggerArgs),

    /// Show the health report published by the running service.
    Health(HealthArgs),

    /// Print the Prometheus metrics published by the running service.
    Metrics,

    /// Show queue depths, terminal counts, or one instance's state.
    Status(StatusArgs),

    /// Load and validate the configuration, then print a summary.
    #[command(name = "check-config")]
    CheckConfig(CheckConfigArgs),
}

/// Arguments for `hive-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Override the number of workers per stage queue.
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Do not start the recurring trigger.
    #[arg(long)]
    pub no_beat: bool,
}

/// Arguments for `hive-forge trigger`.
#[derive(Parser, Debug)]
pub struct TriggerArgs {
    /// Page to scrape. Defaults to the first scheduled source.
    pub source_url: Option<String>,

    /// Keyword filter applied to scraped titles.
    #[arg(short, long)]
    pub query: Option<String>,

    /// Explicit correlation id; a repeated id is ignored.
    #[arg(long)]
    pub correlation_id: Option<String>,
}

/// Arguments for `hive-forge health`.
#[derive(Parser, Debug)]
pub struct HealthArgs {
    /// Output the raw JSON report.
    #[arg(short = 'j', long)]
    pub json: bool,

    /// Build a report in this process when no service has published one.
    #[arg(long)]
    pub local: bool,
}

/// Arguments for `hive-forge status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Correlation id of one pipeline instance.
    pub correlation_id: Option<String>,

    /// Dead-letter entries listed per queue.
    #[arg(long, default_value = "5")]
    pub dead_letters: usize,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `hive-forge check-config`.
#[derive(Parser, Debug)]
pub struct CheckConfigArgs {
    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// For control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = HiveConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run(args) => run_service(config, args).await,
        Commands::Trigger(args) => run_trigger_command(config, args).await,
        Commands::Health(args) => run_health_command(config, args).await,
        Commands::Metrics => run_metrics_command(config).await,
        Commands::Status(args) => run_status_command(config, args).await,
        Commands::CheckConfig(args) => run_check_config_command(config, args),
    }
}

// ============================================================================
// Wiring
// ============================================================================

/// Components shared by the commands that touch Redis.
struct Backend {
    redis: ConnectionManager,
    queue: Arc<dyn TaskQueue>,
    state: Arc<dyn StateStore>,
}

async fn connect_backend(config: &HiveConfig, clock: SharedClock) -> anyhow::Result<Backend> {
    let client = redis::Client::open(config.redis_url.as_str())?;
    let redis = ConnectionManager::new(client)
        .await
        .map_err(|e| anyhow::anyhow!("Cannot reach Redis at {}: {}", config.redis_url, e))?;

    let queue = RedisTaskQueue::from_connection(redis.clone(), config.queues.clone(), clock);
    let state = RedisStateStore::from_connection(
        redis.clone(),
        config.queues.prefix.clone(),
        &config.pipeline,
    );

    Ok(Backend {
        redis,
        queue: Arc::new(queue),
        state: Arc::new(state),
    })
}

fn build_orchestrator(
    config: &HiveConfig,
    backend: &Backend,
    clock: SharedClock,
) -> anyhow::Result<(Arc<DispatchExecutor>, Arc<PipelineOrchestrator>)> {
    let executor = Arc::new(build_executor(config, clock.clone())?);
    let handlers = build_handlers(&config.stages, executor.clone())?;
    let orchestrator = PipelineOrchestrator::new(
        config.pipeline.clone(),
        config.queues.clone(),
        backend.queue.clone(),
        backend.state.clone(),
        handlers,
        clock,
    );
    Ok((executor, Arc::new(orchestrator)))
}

fn snapshot_store(config: &HiveConfig, backend: &Backend) -> HealthSnapshotStore {
    HealthSnapshotStore::new(backend.redis.clone(), config.queues.prefix.clone())
}

// ============================================================================
// run
// ============================================================================

async fn run_service(mut config: HiveConfig, args: RunArgs) -> anyhow::Result<()> {
    if let Some(workers) = args.workers {
        anyhow::ensure!(workers > 0, "--workers must be greater than 0");
        config.workers.workers_per_queue = workers;
    }
    let clock = system_clock();
    let backend = connect_backend(&config, clock.clone()).await?;
    let (executor, orchestrator) = build_orchestrator(&config, &backend, clock.clone())?;

    info!(
        providers = executor.providers().len(),
        credentials = config.credential_count(),
        workers_per_queue = config.workers.workers_per_queue,
        "Starting hive-forge"
    );

    let mut pool = WorkerPool::new(config.workers.clone(), orchestrator.clone());
    pool.start().await?;

    let (shutdown_tx, _) = broadcast::channel::<()>(4);
    let mut background = Vec::new();

    if config.schedule.enabled && !args.no_beat {
        let beat = Beat::new(config.schedule.clone(), orchestrator.clone(), clock.clone());
        background.push(beat.spawn(shutdown_tx.subscribe()));
    } else {
        info!("Recurring trigger disabled");
    }

    let checker = Arc::new(HealthChecker::new(
        config.health.clone(),
        executor,
        backend.queue.clone(),
        backend.state.clone(),
        config.queues.all(),
        clock,
    ));
    background.push(spawn_publisher(
        checker,
        snapshot_store(&config, &backend),
        shutdown_tx.subscribe(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    let _ = shutdown_tx.send(());
    let pool_result = pool.shutdown().await;
    for result in futures::future::join_all(background).await {
        if let Err(e) = result {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    let stats = pool.stats();
    info!(
        completed = stats.tasks_completed,
        retried = stats.tasks_retried,
        failed = stats.tasks_failed,
        "hive-forge stopped"
    );
    pool_result?;
    Ok(())
}

// ============================================================================
// trigger
// ============================================================================

async fn run_trigger_command(config: HiveConfig, args: TriggerArgs) -> anyhow::Result<()> {
    let request = match args.source_url {
        Some(url) => {
            let request = ScrapeRequest::new(url);
            match args.query {
                Some(query) => request.with_query(query),
                None => request,
            }
        }
        None => {
            let mut request = config.schedule.sources.first().cloned().ok_or_else(|| {
                anyhow::anyhow!("No source given and no scheduled source configured")
            })?;
            if let Some(query) = args.query {
                request.query = Some(query);
            }
            request
        }
    };

    let clock = system_clock();
    let backend = connect_backend(&config, clock.clone()).await?;
    let (_, orchestrator) = build_orchestrator(&config, &backend, clock)?;

    match orchestrator
        .start_pipeline(request.clone(), args.correlation_id)
        .await?
    {
        Some(cid) => println!("Started pipeline {} for {}", cid, request.source_url),
        None => println!("Pipeline already exists, nothing enqueued"),
    }
    Ok(())
}

// ============================================================================
// health / metrics
// ============================================================================

async fn run_health_command(config: HiveConfig, args: HealthArgs) -> anyhow::Result<()> {
    let clock = system_clock();
    let backend = connect_backend(&config, clock.clone()).await?;

    let report = match snapshot_store(&config, &backend).latest_report().await? {
        Some(report) => report,
        None if args.local => {
            let (executor, _) = build_orchestrator(&config, &backend, clock.clone())?;
            HealthChecker::new(
                config.health.clone(),
                executor,
                backend.queue.clone(),
                backend.state.clone(),
                config.queues.all(),
                clock,
            )
            .check()
            .await
        }
        None => anyhow::bail!(
            "No health report published; is `hive-forge run` up? Use --local for a report from this process"
        ),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_health(&report);
    }

    if report.status == HealthStatus::Unhealthy {
        anyhow::bail!("service is unhealthy");
    }
    Ok(())
}

fn print_health(report: &HealthReport) {
    println!("Status:     {}", report.status);
    println!("Generated:  {}", report.generated_at.to_rfc3339());
    println!(
        "Queue:      {}",
        if report.queue.connected { "connected" } else { "unreachable" }
    );
    for stats in &report.queue.queues {
        print_queue(stats);
    }

    println!("\nProviders:");
    for provider in &report.providers {
        println!(
            "  {:<12} circuit={:<9} credentials={}/{} attempts={} failure_rate={:.1}%",
            provider.name,
            provider.circuit.state,
            provider.credentials_available,
            provider.credentials_total,
            provider.usage.attempts,
            provider.usage.failure_rate()
        );
        for window in &provider.windows {
            println!(
                "               window {}s: {}/{}",
                window.window_secs, window.used, window.capacity
            );
        }
    }

    println!(
        "\nPipelines:  {} published, {} failed",
        report.pipelines.terminal.publish_done, report.pipelines.terminal.failed
    );
    for failure in &report.pipelines.recent_failures {
        println!(
            "  {} {} after {} attempts ({}): {}",
            failure.correlation_id, failure.stage, failure.attempts, failure.kind, failure.error
        );
    }

    if !report.alerts.is_empty() {
        println!("\nAlerts:");
        for alert in &report.alerts {
            println!("  - {}", alert);
        }
    }
}

fn print_queue(stats: &QueueStats) {
    println!(
        "  {:<12} pending={} processing={} delayed={} dead_letter={}",
        stats.queue_name,
        stats.pending_jobs,
        stats.processing_jobs,
        stats.delayed_jobs,
        stats.dead_letter_jobs
    );
}

async fn run_metrics_command(config: HiveConfig) -> anyhow::Result<()> {
    let backend = connect_backend(&config, system_clock()).await?;
    match snapshot_store(&config, &backend).latest_metrics().await? {
        Some(text) => {
            print!("{}", text);
            Ok(())
        }
        None => anyhow::bail!("No metrics published; is `hive-forge run` up?"),
    }
}

// ============================================================================
// status
// ============================================================================

#[derive(Debug, Serialize)]
struct InstanceStatus {
    correlation_id: String,
    state: Option<String>,
}

#[derive(Debug, Serialize)]
struct QueueOverview {
    queues: Vec<QueueStats>,
    publish_done: u64,
    failed: u64,
    dead_letters: Vec<serde_json::Value>,
}

async fn run_status_command(config: HiveConfig, args: StatusArgs) -> anyhow::Result<()> {
    let backend = connect_backend(&config, system_clock()).await?;

    if let Some(cid) = args.correlation_id {
        let state = backend.state.state(&cid).await?;
        let status = InstanceStatus {
            correlation_id: cid,
            state: state.map(|s| s.to_string()),
        };
        if args.json {
            println!("{}", serde_json::to_string_pretty(&status)?);
        } else {
            println!(
                "{}: {}",
                status.correlation_id,
                status.state.as_deref().unwrap_or("unknown")
            );
        }
        return Ok(());
    }

    let mut overview = QueueOverview {
        queues: Vec::new(),
        publish_done: 0,
        failed: 0,
        dead_letters: Vec::new(),
    };
    for name in config.queues.all() {
        overview.queues.push(backend.queue.stats(&name).await?);
        if args.dead_letters > 0 {
            overview
                .dead_letters
                .extend(backend.queue.peek_dead_letter(&name, args.dead_letters).await?);
        }
    }
    let terminal = backend.state.terminal_counts().await?;
    overview.publish_done = terminal.publish_done;
    overview.failed = terminal.failed;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&overview)?);
        return Ok(());
    }

    println!("Queues:");
    for stats in &overview.queues {
        print_queue(stats);
    }
    println!(
        "\nPipelines: {} published, {} failed",
        overview.publish_done, overview.failed
    );
    if !overview.dead_letters.is_empty() {
        println!("\nDead letters:");
        for entry in &overview.dead_letters {
            println!(
                "  {} {}: {}",
                entry["moved_at"].as_str().unwrap_or("-"),
                entry["job"]["correlation_id"].as_str().unwrap_or("-"),
                entry["error"].as_str().unwrap_or("-")
            );
        }
    }
    Ok(())
}

// ============================================================================
// check-config
// ============================================================================

#[derive(Debug, Serialize)]
struct ProviderSummary {
    name: String,
    flavor: String,
    model: String,
    priority: u32,
    credentials: Vec<String>,
    rate_limits: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ConfigSummary {
    redis_url: String,
    providers: Vec<ProviderSummary>,
    queues: Vec<String>,
    schedule_enabled: bool,
    schedule_interval_secs: u64,
    scheduled_sources: usize,
    workers_per_queue: usize,
    publisher: String,
}

fn run_check_config_command(config: HiveConfig, args: CheckConfigArgs) -> anyhow::Result<()> {
    let summary = ConfigSummary {
        redis_url: config.redis_url.clone(),
        providers: config
            .providers
            .iter()
            .map(|p| ProviderSummary {
                name: p.name.clone(),
                flavor: format!("{:?}", p.flavor),
                model: p.model.clone(),
                priority: p.priority,
                credentials: p
                    .resolved_keys
                    .iter()
                    .map(|k| Secret::new(k.clone()).masked())
                    .collect(),
                rate_limits: p
                    .rate_limits
                    .iter()
                    .map(|w| format!("{}/{}s", w.capacity, w.window_secs))
                    .collect(),
            })
            .collect(),
        queues: config.queues.all(),
        schedule_enabled: config.schedule.enabled,
        schedule_interval_secs: config.schedule.interval_secs,
        scheduled_sources: config.schedule.sources.len(),
        workers_per_queue: config.workers.workers_per_queue,
        publisher: match &config.stages.publisher.webhook_url {
            Some(url) => format!("webhook {}", url),
            None => "log".to_string(),
        },
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("Configuration OK");
    println!("Redis:      {}", summary.redis_url);
    println!("Queues:     {}", summary.queues.join(", "));
    println!(
        "Schedule:   {} every {}s, {} source(s)",
        if summary.schedule_enabled { "enabled" } else { "disabled" },
        summary.schedule_interval_secs,
        summary.scheduled_sources
    );
    println!("Workers:    {} per queue", summary.workers_per_queue);
    println!("Publisher:  {}", summary.publisher);
    println!("Providers:");
    for provider in &summary.providers {
        println!(
            "  {:<12} {} {} priority={} credentials=[{}] limits=[{}]",
            provider.name,
            provider.flavor,
            provider.model,
            provider.priority,
            provider.credentials.join(", "),
            provider.rate_limits.join(", ")
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_trigger() {
        let cli = Cli::try_parse_from([
            "hive-forge",
            "--config",
            "hive.yaml",
            "trigger",
            "https://news.example.com",
            "--query",
            "rust",
        ])
        .expect("parse");

        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("hive.yaml")));
        match cli.command {
            Commands::Trigger(args) => {
                assert_eq!(args.source_url.as_deref(), Some("https://news.example.com"));
                assert_eq!(args.query.as_deref(), Some("rust"));
                assert!(args.correlation_id.is_none());
            }
            _ => panic!("expected trigger"),
        }
    }

    #[test]
    fn test_parse_run_and_check_config() {
        let cli = Cli::try_parse_from(["hive-forge", "run", "-w", "4", "--no-beat"]).expect("parse");
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.workers, Some(4));
                assert!(args.no_beat);
            }
            _ => panic!("expected run"),
        }

        let cli = Cli::try_parse_from(["hive-forge", "check-config", "--json", "-l", "debug"])
            .expect("parse");
        assert_eq!(cli.log_level, "debug");
        assert!(matches!(cli.command, Commands::CheckConfig(CheckConfigArgs { json: true })));
    }
}
