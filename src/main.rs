use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use shardbeat::admin::JobOperator;
use shardbeat::config::{JobConfig, RegistryConfig, Schedule};
use shardbeat::instance::{local_ip, InstanceId};
use shardbeat::registry::{MemoryRegistry, RegistryCenter};
use shardbeat::schedule::{ScriptJob, ShardJob};
use shardbeat::sharding::{ShardingInput, StrategyRegistry};
use shardbeat::shutdown::install_shutdown_handler;
use shardbeat::{CoordinatorRegistry, JobCoordinator};

#[derive(Parser, Debug)]
#[command(name = "shardbeat")]
#[command(version)]
#[command(about = "Sharded job scheduling coordinated through a watchable registry")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run simulated instances of one or more jobs on an in-process registry
    Run(RunArgs),

    /// Print the assignment a sharding strategy computes
    Plan(PlanArgs),
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Job definition files (JSON). Without any, a job is built from the flags below
    #[arg(long = "config")]
    configs: Vec<PathBuf>,

    /// Shell command run per shard item; sees SHARD_ITEM, SHARD_PARAM, SHARD_TOTAL, JOB_NAME, JOB_PARAM
    #[arg(long, default_value = "echo \"$JOB_NAME item $SHARD_ITEM/$SHARD_TOTAL\"")]
    command: String,

    /// Number of simulated instances
    #[arg(long, default_value = "3")]
    instances: u32,

    #[arg(long, default_value = "demo")]
    job_name: String,

    /// Sharding total count
    #[arg(long, default_value = "6")]
    total: u32,

    /// Six or seven field cron expression; overrides --interval-ms
    #[arg(long)]
    cron: Option<String>,

    #[arg(long, default_value = "5000")]
    interval_ms: u64,

    /// Per-item parameters, "0=a,1=b"
    #[arg(long, default_value = "")]
    item_parameters: String,

    #[arg(long, default_value = "average")]
    strategy: String,

    #[arg(long)]
    failover: bool,

    /// Registry namespace
    #[arg(long, default_value = "shardbeat")]
    namespace: String,

    /// Host ip used in instance ids (defaults to the outbound interface)
    #[arg(long)]
    ip: Option<String>,

    /// Log the assignment this often; 0 disables
    #[arg(long, default_value = "10000")]
    status_interval_ms: u64,
}

// =============================================================================
// Plan Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct PlanArgs {
    /// Instance ids (comma-separated, "ip@-@n"); generated from --count when empty
    #[arg(long, default_value = "")]
    instances: String,

    /// Number of generated instances on 127.0.0.1
    #[arg(long, default_value = "3")]
    count: u32,

    #[arg(long, default_value = "10")]
    total: u32,

    #[arg(long, default_value = "demo")]
    job_name: String,

    #[arg(long, default_value = "average")]
    strategy: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct PlanOutput {
    job_name: String,
    strategy: String,
    total: u32,
    assignment: BTreeMap<String, Vec<u32>>,
}

// =============================================================================
// Run Implementation
// =============================================================================

fn job_from_flags(args: &RunArgs) -> JobConfig {
    let schedule = match &args.cron {
        Some(expr) => Schedule::Cron { expr: expr.clone() },
        None => Schedule::Interval {
            interval_ms: args.interval_ms,
        },
    };
    JobConfig::new(args.job_name.clone(), schedule, args.total)
        .with_item_parameters(args.item_parameters.clone())
        .with_strategy(args.strategy.clone())
        .with_failover(args.failover)
}

async fn run_jobs(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let jobs = if args.configs.is_empty() {
        vec![job_from_flags(&args)]
    } else {
        args.configs
            .iter()
            .map(|path| JobConfig::from_json_file(path))
            .collect::<Result<Vec<_>, _>>()?
    };
    for job in &jobs {
        job.validate()?;
    }

    let registry = MemoryRegistry::new();
    let registry_config = RegistryConfig::new(args.namespace.clone());
    let ip = args.ip.clone().unwrap_or_else(local_ip);
    let body: Arc<dyn ShardJob> = Arc::new(ScriptJob::new(args.command.clone()));

    tracing::info!(
        instances = args.instances,
        jobs = ?jobs.iter().map(|j| j.job_name.as_str()).collect::<Vec<_>>(),
        ip = %ip,
        "Starting shardbeat"
    );

    // One arena per simulated process; every job gets its own session.
    let mut processes = Vec::new();
    for n in 1..=args.instances {
        let local = InstanceId::new(&ip, format!("{}-{}", std::process::id(), n));
        let mut arena = CoordinatorRegistry::new();
        for job in &jobs {
            let session: Arc<dyn RegistryCenter> = Arc::new(registry.connect().await);
            let coordinator =
                JobCoordinator::start(session, &registry_config, job.clone(), body.clone(), local.clone())
                    .await?;
            arena.insert(coordinator)?;
        }
        processes.push(arena);
    }

    let shutdown = install_shutdown_handler();
    let operator_session: Arc<dyn RegistryCenter> = Arc::new(registry.connect().await);
    let operators: Vec<JobOperator> = jobs
        .iter()
        .map(|job| JobOperator::new(operator_session.clone(), &registry_config, &job.job_name))
        .collect();

    if args.status_interval_ms > 0 {
        let mut ticker = tokio::time::interval(Duration::from_millis(args.status_interval_ms));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    for operator in &operators {
                        log_status(operator).await;
                    }
                }
            }
        }
    } else {
        shutdown.cancelled().await;
    }

    for arena in processes {
        arena.shutdown_all().await;
    }
    operator_session.close().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn log_status(operator: &JobOperator) {
    match (operator.assignment().await, operator.leader().await) {
        (Ok(assignment), Ok(leader)) => {
            let mut by_owner: BTreeMap<String, Vec<u32>> = BTreeMap::new();
            for (item, owner) in assignment {
                by_owner.entry(owner.to_string()).or_default().push(item);
            }
            tracing::info!(
                job = operator.job_name(),
                leader = ?leader.map(|l| l.to_string()),
                assignment = ?by_owner,
                "Job status"
            );
        }
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!(job = operator.job_name(), error = %e, "Failed to read job status");
        }
    }
}

// =============================================================================
// Plan Implementation
// =============================================================================

fn handle_plan(args: PlanArgs) -> Result<(), Box<dyn std::error::Error>> {
    let instances: Vec<InstanceId> = if args.instances.trim().is_empty() {
        (1..=args.count).map(|n| InstanceId::new("127.0.0.1", n)).collect()
    } else {
        args.instances
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|raw| InstanceId::parse(raw).ok_or_else(|| format!("invalid instance id: {}", raw)))
            .collect::<Result<_, _>>()?
    };
    if args.total == 0 {
        return Err("--total must be greater than zero".into());
    }

    let strategy = StrategyRegistry::default().resolve(&args.strategy)?;
    let params = BTreeMap::new();
    let plan = strategy.shard(&ShardingInput {
        job_name: &args.job_name,
        instances: &instances,
        total_count: args.total,
        item_parameters: &params,
    });

    match args.output {
        OutputFormat::Json => {
            let output = PlanOutput {
                job_name: args.job_name,
                strategy: strategy.name().to_string(),
                total: args.total,
                assignment: plan
                    .iter()
                    .map(|(instance, items)| (instance.to_string(), items.clone()))
                    .collect(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("{:<30} {:<6} ITEMS", "INSTANCE", "COUNT");
            println!("{}", "-".repeat(60));
            for instance in &instances {
                let items = plan.get(instance).cloned().unwrap_or_default();
                let list = items
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                println!("{:<30} {:<6} {}", instance, items.len(), list);
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match args.command {
        Commands::Run(run_args) => run_jobs(run_args).await?,
        Commands::Plan(plan_args) => handle_plan(plan_args)?,
    }

    Ok(())
}
