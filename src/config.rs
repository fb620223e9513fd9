use crate::HarvestError;
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_CDX_ENDPOINT: &str = "http://web.archive.org/cdx/search/cdx";
pub const DEFAULT_ARCHIVE_BASE: &str = "http://web.archive.org/web";

/// Largest delay the fetch queue accepts on a single message.
pub const MAX_MESSAGE_DELAY_SECS: u32 = 900;

/// Delay escalation applied to fetch messages within one domain's fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayPolicy {
    pub base_secs: u32,
    pub step_secs: u32,
    /// Escalate once for every `every` messages sent.
    pub every: usize,
    pub max_secs: u32,
}

impl Default for DelayPolicy {
    fn default() -> Self {
        Self {
            base_secs: 0,
            step_secs: 10,
            every: 30,
            max_secs: MAX_MESSAGE_DELAY_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchScope {
    Prefix,
    Exact,
}

impl MatchScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchScope::Prefix => "prefix",
            MatchScope::Exact => "exact",
        }
    }
}

/// Which extracted fields the fetch stage keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveFormats {
    pub text: bool,
    pub links: bool,
}

impl SaveFormats {
    pub fn parse(raw: &str) -> Self {
        let mut formats = SaveFormats { text: false, links: false };
        for item in raw.split(',').map(str::trim) {
            match item {
                "txt" => formats.text = true,
                "links" => formats.links = true,
                "" => {}
                other => tracing::warn!(format = other, "ignoring unknown output format"),
            }
        }
        formats
    }
}

impl Default for SaveFormats {
    fn default() -> Self {
        Self { text: true, links: true }
    }
}

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub cdx_endpoint: String,
    pub archive_base: String,
    pub match_scope: MatchScope,
    pub year_from: u32,
    pub year_to: u32,
    /// Global snapshot cap per domain; 0 means unbounded.
    pub url_limit_per_domain: usize,
    pub max_jobs_per_cycle: usize,
    pub cycles_per_invocation: usize,
    /// Fetch queue depth above which fan-out stops for the invocation.
    pub fetch_queue_limit: Option<u64>,
    /// `None` sends every message with no delay.
    pub delay: Option<DelayPolicy>,
    pub message_author: String,
    pub http_timeout_secs: u64,
    pub max_record_bytes: usize,
    pub delivery_chunk: usize,
    pub formats: SaveFormats,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            cdx_endpoint: DEFAULT_CDX_ENDPOINT.to_string(),
            archive_base: DEFAULT_ARCHIVE_BASE.to_string(),
            match_scope: MatchScope::Prefix,
            year_from: 2018,
            year_to: 2019,
            url_limit_per_domain: 1000,
            max_jobs_per_cycle: 10,
            cycles_per_invocation: 2,
            fetch_queue_limit: None,
            delay: None,
            message_author: "author".to_string(),
            http_timeout_secs: 30,
            max_record_bytes: 1_000_000,
            delivery_chunk: 400,
            formats: SaveFormats::default(),
        }
    }
}

impl HarvestConfig {
    pub fn from_env() -> Result<Self, HarvestError> {
        let defaults = Self::default();

        let match_scope = if env_or("HARVEST_MATCH_EXACT", 0u8)? == 1 {
            MatchScope::Exact
        } else {
            MatchScope::Prefix
        };

        let delay = if env_or("HARVEST_DELAY_ESCALATION", 0u8)? == 1 {
            let fallback = DelayPolicy::default();
            let policy = DelayPolicy {
                base_secs: env_or("HARVEST_DELAY_BASE_SECS", fallback.base_secs)?,
                step_secs: env_or("HARVEST_DELAY_STEP_SECS", fallback.step_secs)?,
                every: env_or("HARVEST_DELAY_EVERY", fallback.every)?,
                max_secs: env_or("HARVEST_DELAY_MAX_SECS", fallback.max_secs)?
                    .min(MAX_MESSAGE_DELAY_SECS),
            };
            if policy.every == 0 {
                return Err(HarvestError::Config("HARVEST_DELAY_EVERY must be positive".to_string()));
            }
            Some(policy)
        } else {
            None
        };

        let fetch_queue_limit = match std::env::var("HARVEST_FETCH_QUEUE_LIMIT") {
            Ok(raw) if !raw.trim().is_empty() => Some(parse_value("HARVEST_FETCH_QUEUE_LIMIT", &raw)?),
            _ => None,
        };

        let config = Self {
            cdx_endpoint: env_string("HARVEST_CDX_ENDPOINT", &defaults.cdx_endpoint),
            archive_base: env_string("HARVEST_ARCHIVE_BASE", &defaults.archive_base),
            match_scope,
            year_from: env_or("HARVEST_YEAR_FROM", defaults.year_from)?,
            year_to: env_or("HARVEST_YEAR_TO", defaults.year_to)?,
            url_limit_per_domain: env_or("HARVEST_URL_LIMIT_PER_DOMAIN", defaults.url_limit_per_domain)?,
            max_jobs_per_cycle: env_or("HARVEST_MAX_JOBS_PER_CYCLE", defaults.max_jobs_per_cycle)?.clamp(1, 10),
            cycles_per_invocation: env_or("HARVEST_CYCLES_PER_INVOCATION", defaults.cycles_per_invocation)?,
            fetch_queue_limit,
            delay,
            message_author: env_string("HARVEST_MESSAGE_AUTHOR", &defaults.message_author),
            http_timeout_secs: env_or("HARVEST_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs)?,
            max_record_bytes: env_or("HARVEST_MAX_RECORD_BYTES", defaults.max_record_bytes)?,
            delivery_chunk: env_or("HARVEST_DELIVERY_CHUNK", defaults.delivery_chunk)?.max(1),
            formats: std::env::var("HARVEST_FORMATS")
                .map(|raw| SaveFormats::parse(&raw))
                .unwrap_or_default(),
        };

        Ok(config)
    }
}

/// Locations and settings for the AWS-backed collaborators.
#[cfg(feature = "distributed")]
#[derive(Debug, Clone)]
pub struct AwsConfig {
    pub region: String,
    pub job_queue_url: String,
    pub fetch_queue_url: String,
    pub delivery_stream: String,
    pub bucket: Option<String>,
    pub prefix: String,
    pub endpoint: Option<String>,
}

#[cfg(feature = "distributed")]
impl AwsConfig {
    pub fn from_env() -> Result<Self, HarvestError> {
        Ok(Self {
            region: env_string("HARVEST_AWS_REGION", "eu-central-1"),
            job_queue_url: env_string("HARVEST_JOB_QUEUE_URL", ""),
            fetch_queue_url: env_string("HARVEST_FETCH_QUEUE_URL", ""),
            delivery_stream: env_string("HARVEST_DELIVERY_STREAM", "scrape-kinesis-firehose"),
            bucket: std::env::var("HARVEST_S3_BUCKET").ok().filter(|b| !b.is_empty()),
            prefix: env_string("HARVEST_S3_PREFIX", "harvest"),
            endpoint: std::env::var("HARVEST_S3_ENDPOINT").ok(),
        })
    }

    pub fn require(value: &str, name: &str) -> Result<(), HarvestError> {
        if value.is_empty() {
            return Err(HarvestError::Config(format!("{} is not set", name)));
        }
        Ok(())
    }
}

/// Where the local harvester keeps its output and ledger.
#[derive(Debug, Clone)]
pub struct LocalPaths {
    pub output_file: PathBuf,
}

impl LocalPaths {
    pub fn new(output_file: PathBuf) -> Self {
        Self { output_file }
    }

    /// The ledger sits next to the output file so reruns over the same target skip finished sites.
    pub fn ledger_file(&self) -> PathBuf {
        self.output_file
            .parent()
            .map(|p| p.join(".sites"))
            .unwrap_or_else(|| PathBuf::from(".sites"))
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_or<T: FromStr>(name: &str, default: T) -> Result<T, HarvestError> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => parse_value(name, &raw),
        _ => Ok(default),
    }
}

fn parse_value<T: FromStr>(name: &str, raw: &str) -> Result<T, HarvestError> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| HarvestError::Config(format!("{}={:?} is not a valid value", name, raw)))
}
