use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use poi_crawler::config::{CrawlerConfig, CrawlerConfigBuilder};
use poi_crawler::crawl_engine::{CheckpointManager, Orchestrator, ResourceScheduler, SchedulerConfig};
use poi_crawler::extract::MapsFetcher;
use poi_crawler::session_pool::{SessionPool, SessionPoolConfig};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Preset {
    Default,
    Fast,
    Stable,
    Debug,
}

#[derive(Parser, Debug)]
#[command(
    name = "poi-crawler",
    version,
    about = "Extract POI records from map place pages, one CSV batch at a time"
)]
struct Cli {
    /// Input CSV files (FormattedAddress / Address / ConvertedAddress columns)
    inputs: Vec<PathBuf>,

    /// Configuration preset
    #[arg(long, value_enum, default_value = "default")]
    preset: Preset,

    /// Concurrent worker tasks (default: auto from CPU count)
    #[arg(long)]
    workers: Option<usize>,

    /// Browser session ceiling (default: derived from workers)
    #[arg(long)]
    sessions: Option<usize>,

    /// Flush interval in seconds for buffered results
    #[arg(long)]
    flush_interval: Option<u64>,

    /// Ignore existing checkpoints and start batches fresh
    #[arg(long)]
    no_resume: bool,

    /// Enable resource-aware session scaling
    #[arg(long)]
    adaptive: bool,

    /// Run with a visible browser window
    #[arg(long)]
    headed: bool,

    /// Progress (checkpoint) directory
    #[arg(long)]
    progress_dir: Option<PathBuf>,

    /// Output directory for result CSVs
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// List batches with unfinished checkpoints and exit
    #[arg(long)]
    status: bool,

    /// Delete all checkpoints and exit
    #[arg(long)]
    clean_progress: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    // The engine hot path logs through the `log` facade.
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_level),
    )
    .format_timestamp_secs()
    .try_init();
}

fn build_config(cli: &Cli) -> Result<CrawlerConfig> {
    let preset = match cli.preset {
        Preset::Default => CrawlerConfig::default(),
        Preset::Fast => CrawlerConfig::fast(),
        Preset::Stable => CrawlerConfig::stable(),
        Preset::Debug => CrawlerConfig::debug(),
    };
    let mut builder = CrawlerConfigBuilder::from_preset(preset).resume(!cli.no_resume);
    if let Some(workers) = cli.workers {
        builder = builder.workers(workers);
    }
    if let Some(sessions) = cli.sessions {
        builder = builder.max_sessions(sessions);
    }
    if let Some(secs) = cli.flush_interval {
        builder = builder.flush_max_age(std::time::Duration::from_secs(secs));
    }
    if cli.adaptive {
        builder = builder.adaptive(true);
    }
    if cli.headed {
        builder = builder.headless(false);
    }
    if let Some(dir) = &cli.progress_dir {
        builder = builder.progress_dir(dir);
    }
    if let Some(dir) = &cli.output_dir {
        builder = builder.output_dir(dir);
    }
    builder.build()
}

fn print_status(config: &CrawlerConfig) -> Result<()> {
    let manager = CheckpointManager::new(&config.progress_dir)?;
    let pending = manager.pending_batches()?;
    if pending.is_empty() {
        println!("no unfinished batches");
        return Ok(());
    }
    println!("unfinished batches:");
    for record in pending {
        println!(
            "  {}: {} completed ({} ok / {} failed / {} excluded), output {}, updated {}",
            record.batch_id,
            record.completed_len(),
            record.success_count,
            record.failure_count,
            record.excluded_count,
            record.output_path,
            record.updated_at.format("%Y-%m-%d %H:%M:%S UTC"),
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = build_config(&cli)?;

    if cli.status {
        return print_status(&config);
    }
    if cli.clean_progress {
        let manager = CheckpointManager::new(&config.progress_dir)?;
        let removed = manager.clean()?;
        println!("removed {removed} checkpoint file(s)");
        return Ok(());
    }
    if cli.inputs.is_empty() {
        return Err(anyhow!("no input files given (see --help)"));
    }

    let pool = SessionPool::new(SessionPoolConfig {
        max_sessions: config.effective_max_sessions(),
        min_sessions: config.min_sessions,
        recycle_after_jobs: config.recycle_after_jobs,
        launch_retry_limit: config.launch_retry_limit,
        headless: config.headless,
    });
    let fetcher = Arc::new(MapsFetcher::new(
        config.base_url.clone(),
        config.render_timeout,
        config.excluded_category_labels.clone(),
    ));

    let scheduler = config.adaptive.then(|| {
        ResourceScheduler::spawn(
            SchedulerConfig {
                sample_interval: config.sample_interval,
                high_water: config.high_water,
                low_water: config.low_water,
            },
            Arc::clone(&pool),
        )
    });

    let orchestrator = Arc::new(Orchestrator::new(
        config,
        Arc::new(Arc::clone(&pool)),
        fetcher,
    )?);

    let stopper = Arc::clone(&orchestrator);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.request_stop();
        }
    });

    let result = orchestrator.run_files(&cli.inputs).await;

    if let Some(scheduler) = scheduler {
        scheduler.stop().await;
    }
    pool.shutdown().await;

    let summaries = result.context("crawl run failed")?;
    for summary in &summaries {
        println!(
            "{}: {}/{} jobs terminal ({} ok, {} failed, {} excluded, {} resumed-skip) \
             in {}s [{:.2} jobs/s]{}",
            summary.batch_id,
            summary.success_count + summary.failure_count + summary.excluded_count,
            summary.total_jobs,
            summary.success_count,
            summary.failure_count,
            summary.excluded_count,
            summary.skipped_completed,
            summary.elapsed_secs,
            summary.jobs_per_second,
            if summary.halted { " (stopped early)" } else { "" },
        );
    }
    if summaries.iter().any(|s| s.halted) {
        println!("stopped before completion; rerun with the same arguments to resume");
    }
    Ok(())
}
