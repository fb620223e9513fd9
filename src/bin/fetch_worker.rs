use clap::Parser;
use dotenv::dotenv;
use harvest::aws::{self, FirehoseStream, SqsQueue};
use harvest::config::{AwsConfig, HarvestConfig};
use harvest::fetcher::FetchWorker;
use harvest::metrics::Metrics;
use harvest::HarvestError;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "fetch_worker")]
#[command(about = "Fetch archived pages from the fetch queue and deliver their text and links", long_about = None)]
struct Cli {
    /// Messages per receive (1 to 10)
    #[arg(long, default_value_t = 10)]
    batch: usize,
    /// Stop after this many empty receives in a row; 0 runs forever
    #[arg(long, default_value_t = 0)]
    idle_limit: usize,
}

#[tokio::main]
async fn main() -> Result<(), HarvestError> {
    dotenv().ok();
    harvest::init_tracing("harvest-fetch");
    let cli = Cli::parse();

    let config = HarvestConfig::from_env()?;
    let aws_config = AwsConfig::from_env()?;
    let sdk = aws::load_sdk_config(&aws_config).await;

    let fetch_queue = SqsQueue::new(&sdk, &aws_config.fetch_queue_url)?.with_wait(20);
    let stream = FirehoseStream::new(&sdk, &aws_config.delivery_stream)?;
    let metrics = Metrics::new();
    let worker = FetchWorker::new(&config, metrics.clone())?;

    let mut idle = 0usize;
    loop {
        match worker.run_once(&fetch_queue, &stream, cli.batch.clamp(1, 10)).await {
            Ok(report) if report.received == 0 => {
                idle += 1;
                if cli.idle_limit > 0 && idle >= cli.idle_limit {
                    println!("[harvest] Fetch queue idle, stopping");
                    break;
                }
            }
            Ok(report) => {
                idle = 0;
                tracing::info!(
                    received = report.received,
                    acked = report.acked,
                    delivered = report.delivery.delivered,
                    dropped = report.delivery.dropped,
                    "fetch batch done"
                );
            }
            Err(e) => {
                tracing::error!(error = %e, "fetch batch failed");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }

    tracing::info!(counters = ?metrics.snapshot().counters, "fetch worker finished");
    Ok(())
}
