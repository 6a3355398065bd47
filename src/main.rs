use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};

use taskweave::config::Config;
use taskweave::orchestration::simulate::{simulated_download, FailureMode, SimulatedOrderServices};
use taskweave::orchestration::{join, OrderRequest, OrderWorkflow, Orchestrator, WorkerPool};
use taskweave::{twlog, twlog_error, Result};

/// Taskweave - dependent async task orchestration with bounded concurrency
#[derive(Parser, Debug)]
#[command(name = "taskweave")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    TASKWEAVE_DEBUG=1     Enable debug logging (alternative to --debug)"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.taskweave/taskweave.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Config file to use instead of ~/.taskweave/taskweave.toml
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Override the pool's concurrency limit
    #[arg(short = 'j', long)]
    pub concurrency: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Process one order against simulated services and print the run report
    Order {
        /// Order identifier
        #[arg(long, default_value = "order-1")]
        order_id: String,

        #[arg(long, default_value = "user-1")]
        user: String,

        #[arg(long, default_value = "product-1")]
        product: String,

        #[arg(long, default_value_t = 1)]
        quantity: u32,

        /// Make this step fail (fetch-user, fetch-product, check-stock, pay, pay-backup, notify)
        #[arg(long)]
        fail_step: Option<String>,

        /// Inject a transient failure instead of a permanent one
        #[arg(long)]
        transient: bool,

        /// Latency of every simulated service call
        #[arg(long, default_value_t = 20)]
        latency_ms: u64,
    },

    /// Run N simulated downloads in parallel and report the wall time
    Batch {
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,

        /// Duration of each download
        #[arg(long, default_value_t = 50)]
        latency_ms: u64,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    taskweave::log::init(cli.debug);
    twlog!("taskweave starting: {:?}", cli.command);

    let loaded = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    let mut config = loaded.map_err(|e| {
        twlog_error!("failed to load config: {}", e);
        e
    })?;
    if let Some(n) = cli.concurrency {
        config.pool.max_concurrency = n;
        if let Err(e) = config.pool.validate() {
            twlog_error!("rejected --concurrency {}: {}", n, e);
            return Err(e);
        }
    }

    match cli.command {
        Command::Order {
            order_id,
            user,
            product,
            quantity,
            fail_step,
            transient,
            latency_ms,
        } => {
            let request = OrderRequest {
                order_id,
                user_id: user,
                product_id: product,
                quantity,
            };
            let mode = if transient {
                FailureMode::Transient
            } else {
                FailureMode::Permanent
            };
            run_order(&config, request, fail_step, mode, latency_ms)
        }
        Command::Batch { count, latency_ms } => run_batch(&config, count, latency_ms),
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

/// Run the order workflow once and print its report as JSON.
///
/// Exits with status 1 when the run does not succeed.
fn run_order(
    config: &Config,
    request: OrderRequest,
    fail_step: Option<String>,
    mode: FailureMode,
    latency_ms: u64,
) -> Result<()> {
    let mut services =
        SimulatedOrderServices::new().with_latency(Duration::from_millis(latency_ms));
    if let Some(step) = fail_step {
        services = services.failing(step, mode);
    }

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let pool = WorkerPool::from_config(config)?;
        let orchestrator = Orchestrator::new(pool.clone(), OrderWorkflow::new(services))
            .with_config(config.orchestrator.clone());
        let result = orchestrator.run(request).await;
        pool.shutdown(true).await;
        Ok::<_, taskweave::Error>(result.report())
    })?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    twlog!("order run {} finished: {}", report.run_id, report.status);

    if report.failed_step.is_some() {
        std::process::exit(1);
    }
    Ok(())
}

/// Fan out `count` downloads through one join and report how the pool
/// spread them.
fn run_batch(config: &Config, count: usize, latency_ms: u64) -> Result<()> {
    let latency = Duration::from_millis(latency_ms);
    let downloads = (0..count)
        .map(|i| simulated_download(format!("file-{:03}", i), latency))
        .collect();

    let rt = tokio::runtime::Runtime::new()?;
    let (outcome, elapsed, stats) = rt.block_on(async {
        let pool = WorkerPool::from_config(config)?;
        let start = Instant::now();
        let outcome = match pool.submit(join("batch", downloads)).await {
            Ok(handle) => handle.wait().await,
            Err(failure) => {
                twlog_error!("batch rejected: {}", failure.describe());
                Err(failure)
            }
        };
        let elapsed = start.elapsed();
        let stats = pool.stats();
        pool.shutdown(true).await;
        Ok::<_, taskweave::Error>((outcome, elapsed, stats))
    })?;

    let json_output = match outcome {
        Ok(files) => serde_json::json!({
            "status": "succeeded",
            "downloads": files.len(),
            "bytes": files.iter().map(|f| f.bytes).sum::<u64>(),
            "max_concurrency": config.pool.max_concurrency,
            "peak_running": stats.peak_running,
            "elapsed_ms": elapsed.as_millis() as u64,
        }),
        Err(failure) => serde_json::json!({
            "status": "failed",
            "failed_step": failure.step,
            "error": failure.describe(),
            "elapsed_ms": elapsed.as_millis() as u64,
        }),
    };
    println!("{}", serde_json::to_string_pretty(&json_output)?);
    Ok(())
}
