use clap::Parser;
use dotenv::dotenv;
use harvest::aws::{self, SqsQueue};
use harvest::config::AwsConfig;
use harvest::job::{self, SeedOptions, YearWindow};
use harvest::queue;
use harvest::HarvestError;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "seeder")]
#[command(about = "Fill the job queue with domains to resolve against the archive index", long_about = None)]
struct Cli {
    /// Text file with one domain or URL per line
    #[arg(short = 'f', long)]
    infile: PathBuf,
    #[arg(short = 'a', long, default_value = "crunchbase")]
    message_author: String,
    /// Tag that keeps the results of one job together (max. 32 characters)
    #[arg(short = 't', long)]
    job_tag: Option<String>,
    /// First year of the snapshot window; needs --year-to
    #[arg(long, requires = "year_to")]
    year_from: Option<u32>,
    #[arg(long, requires = "year_from")]
    year_to: Option<u32>,
    /// Only count reachable snapshots, do not fetch pages
    #[arg(long)]
    first_stage_only: bool,
}

#[tokio::main]
async fn main() -> Result<(), HarvestError> {
    dotenv().ok();
    harvest::init_tracing("harvest-seeder");
    let cli = Cli::parse();

    let job_tag = match &cli.job_tag {
        Some(tag) => job::clean_job_tag(tag),
        None => {
            let generated = job::clean_job_tag(&job::generated_job_tag());
            println!("[harvest] Generated job tag: {}", generated);
            generated
        }
    };

    let year_window = match (cli.year_from, cli.year_to) {
        (Some(from), Some(to)) if from <= to => Some(YearWindow { from, to }),
        (Some(from), Some(to)) => {
            return Err(HarvestError::Config(format!("year window {}:{} is reversed", from, to)));
        }
        _ => None,
    };

    let contents = tokio::fs::read_to_string(&cli.infile).await?;
    let options = SeedOptions {
        author: cli.message_author,
        job_tag,
        first_stage_only: cli.first_stage_only,
        year_window,
    };
    let messages = job::seed_messages(&contents, &options);
    println!("[harvest] Got {} URLs", messages.len());

    let aws_config = AwsConfig::from_env()?;
    let sdk = aws::load_sdk_config(&aws_config).await;
    let job_queue = SqsQueue::new(&sdk, &aws_config.job_queue_url)?;

    let total = messages.len();
    let failures = queue::send_all(&job_queue, messages).await;
    if !failures.is_empty() {
        println!("[harvest] Failed to send messages to queue: {:?}", failures);
    }
    println!("[harvest] Sent {} messages", total - failures.len());
    Ok(())
}
