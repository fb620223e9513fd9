use clap::Parser;
use dotenv::dotenv;
use harvest::config::{HarvestConfig, LocalPaths, MatchScope};
use harvest::ledger::{LedgerLocation, RetentionLedger};
use harvest::local::{self, HarvestOptions, LocalHarvester};
use harvest::resolver::IndexResolver;
use harvest::HarvestError;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "harvest")]
#[command(about = "Collect archived snapshot URLs for a list of sites", long_about = None)]
struct Cli {
    /// Text file with one site or URL per line
    #[arg(short, long)]
    input_file: PathBuf,
    #[arg(short, long, default_value = "./ia-urls.json")]
    output_file: PathBuf,
    #[arg(short = 'f', long, default_value_t = 2020)]
    year_from: u32,
    #[arg(short = 't', long, default_value_t = 2024)]
    year_to: u32,
    /// Query the bare domain of each line instead of the full URL
    #[arg(long)]
    get_domain: bool,
    /// Snapshots kept per site, shortest URLs first; 0 keeps all
    #[arg(long, default_value_t = 1)]
    snapshot_limit: usize,
    /// Match the whole URL prefix instead of the exact URL
    #[arg(long)]
    prefix: bool,
    /// Pause between sites, in seconds
    #[arg(long, default_value_t = 1)]
    delay_secs: u64,
    /// Keep the finished-sites ledger in the configured S3 bucket
    #[arg(long)]
    s3_ledger: bool,
}

#[tokio::main]
async fn main() -> Result<(), HarvestError> {
    dotenv().ok();
    harvest::init_tracing("harvest");
    let cli = Cli::parse();

    println!("[harvest] Year from: {}", cli.year_from);
    println!("[harvest] Year to: {}", cli.year_to);
    println!("[harvest] Get domain instead of URL: {}", cli.get_domain);
    println!("[harvest] Snapshot limit: {}", cli.snapshot_limit);

    let contents = tokio::fs::read_to_string(&cli.input_file).await?;
    let (sites, invalid) = local::load_lines(&contents);
    for line in &invalid {
        tracing::info!(%line, "invalid URL");
    }
    println!("[harvest] {} valid URLs", sites.len());

    let config = HarvestConfig {
        match_scope: if cli.prefix { MatchScope::Prefix } else { MatchScope::Exact },
        ..HarvestConfig::from_env()?
    };
    let resolver = Arc::new(IndexResolver::new(&config)?);

    let location = if cli.s3_ledger {
        LedgerLocation::Bucket(".sites".to_string())
    } else {
        LedgerLocation::File(LocalPaths::new(cli.output_file.clone()).ledger_file())
    };
    let ledger = RetentionLedger::open_at(&location).await?;

    let options = HarvestOptions {
        output_file: cli.output_file,
        year_from: cli.year_from,
        year_to: cli.year_to,
        query_domain: cli.get_domain,
        snapshot_limit: cli.snapshot_limit,
        request_delay: Duration::from_secs(cli.delay_secs),
    };
    let mut harvester = LocalHarvester::with_ledger(resolver, options, ledger);
    let summary = harvester.run(&sites).await?;

    println!(
        "[harvest] Done: {} harvested, {} skipped, {} failed",
        summary.harvested, summary.skipped, summary.failed
    );
    Ok(())
}
