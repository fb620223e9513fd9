use clap::Parser;
use dotenv::dotenv;
use harvest::config::HarvestConfig;
use harvest::ledger::{LedgerLocation, RetentionLedger};
use harvest::local;
use harvest::pages::{PAGES_LEDGER, PageGetter, PageOptions};
use harvest::HarvestError;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "get_pages")]
#[command(about = "Fetch the archived pages listed in a harvest output file", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "./ia-urls.json")]
    input_file: PathBuf,
    #[arg(short, long)]
    output_folder: PathBuf,
    /// Pause between pages, in seconds
    #[arg(long, default_value_t = 1)]
    delay_secs: u64,
    /// Keep the finished-sites ledger in the configured S3 bucket
    #[arg(long)]
    s3_ledger: bool,
}

#[tokio::main]
async fn main() -> Result<(), HarvestError> {
    dotenv().ok();
    harvest::init_tracing("get_pages");
    let cli = Cli::parse();
    let config = HarvestConfig::from_env()?;

    println!("[get_pages] Input file: {}", cli.input_file.display());
    println!("[get_pages] Output folder: {}", cli.output_folder.display());
    println!("[get_pages] Formats: txt={} links={}", config.formats.text, config.formats.links);

    let records = local::read_records(&cli.input_file).await?;
    println!("[get_pages] {} sites in input", records.len());

    tokio::fs::create_dir_all(&cli.output_folder).await?;
    let location = if cli.s3_ledger {
        LedgerLocation::Bucket(PAGES_LEDGER.to_string())
    } else {
        LedgerLocation::File(cli.output_folder.join(PAGES_LEDGER))
    };
    let ledger = RetentionLedger::open_at(&location).await?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.http_timeout_secs))
        .build()?;
    let options = PageOptions {
        output_folder: cli.output_folder,
        archive_base: config.archive_base.clone(),
        formats: config.formats,
        request_delay: Duration::from_secs(cli.delay_secs),
    };
    let mut getter = PageGetter::with_ledger(client, options, ledger);
    let summary = getter.run(&records).await?;

    println!(
        "[get_pages] Done: {} sites, {} pages, {} failed pages, {} skipped",
        summary.sites, summary.pages, summary.failed_pages, summary.skipped
    );
    Ok(())
}
