use clap::Parser;
use dotenv::dotenv;
use harvest::aws::{self, SqsQueue};
use harvest::config::{AwsConfig, HarvestConfig};
use harvest::metrics::Metrics;
use harvest::orchestrator::Orchestrator;
use harvest::resolver::IndexResolver;
use harvest::HarvestError;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "cdx_worker")]
#[command(about = "Resolve domain jobs against the archive index and fan out fetch messages", long_about = None)]
struct Cli {
    /// Keep running invocations, sleeping this many seconds between them
    #[arg(long)]
    every_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), HarvestError> {
    dotenv().ok();
    harvest::init_tracing("harvest-cdx");
    let cli = Cli::parse();

    let config = HarvestConfig::from_env()?;
    let aws_config = AwsConfig::from_env()?;
    let sdk = aws::load_sdk_config(&aws_config).await;

    let job_queue = Arc::new(SqsQueue::new(&sdk, &aws_config.job_queue_url)?);
    let fetch_queue = Arc::new(SqsQueue::new(&sdk, &aws_config.fetch_queue_url)?);
    let resolver = Arc::new(IndexResolver::new(&config)?);
    let metrics = Metrics::new();

    let orchestrator = Orchestrator::new(config, job_queue, fetch_queue, resolver, metrics.clone());

    loop {
        let run_id = chrono::Local::now().format("%Y%m%d%H%M").to_string();
        println!("[harvest] Started CDX run ({})", run_id);
        let summary = orchestrator.run().await;
        println!(
            "[harvest] Messages processed: {} (cycles: {}, halted: {})",
            summary.processed_jobs, summary.cycles, summary.halted_by_backpressure
        );

        let Some(secs) = cli.every_secs else { break };
        tracing::debug!(counters = ?metrics.snapshot().counters, "run counters");
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    Ok(())
}
