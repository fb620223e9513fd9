//! Second local stage: fetches the snapshots listed in a harvest output file.
//!
//! Every site gets one `ia-webscrape-data--<url>.json` file in the output folder.
//! Finished sites are keyed by their `url` in a `.pages` ledger in the same folder.

use crate::config::SaveFormats;
use crate::extract;
use crate::fanout;
use crate::ledger::RetentionLedger;
use crate::local::HarvestRecord;
use crate::HarvestError;
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const PAGES_LEDGER: &str = ".pages";

static UNSAFE_FILE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\da-zA-Z]").expect("file name pattern"));

/// One fetched snapshot as written to a site's output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub domain: String,
    pub url: String,
    pub timestamp: String,
    pub ia_url: String,
    pub text: String,
    pub links: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PageOptions {
    pub output_folder: PathBuf,
    pub archive_base: String,
    pub formats: SaveFormats,
    pub request_delay: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PagesSummary {
    pub sites: usize,
    pub skipped: usize,
    pub pages: usize,
    pub failed_pages: usize,
}

pub fn output_file_name(url: &str) -> String {
    format!("ia-webscrape-data--{}.json", UNSAFE_FILE_CHARS.replace_all(url, "_"))
}

pub struct PageGetter {
    client: reqwest::Client,
    options: PageOptions,
    ledger: RetentionLedger,
}

impl PageGetter {
    /// Opens the `.pages` ledger inside the output folder, creating the folder if needed.
    pub async fn new(options: PageOptions, http_timeout_secs: u64) -> Result<Self, HarvestError> {
        tokio::fs::create_dir_all(&options.output_folder).await?;
        let ledger = RetentionLedger::open_file(options.output_folder.join(PAGES_LEDGER)).await?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(http_timeout_secs))
            .build()?;
        Ok(Self::with_ledger(client, options, ledger))
    }

    pub fn with_ledger(client: reqwest::Client, options: PageOptions, ledger: RetentionLedger) -> Self {
        Self { client, options, ledger }
    }

    pub async fn run(&mut self, records: &[HarvestRecord]) -> Result<PagesSummary, HarvestError> {
        let mut summary = PagesSummary::default();

        for record in records {
            if self.ledger.exists(&record.url) {
                tracing::info!(site = %record.url, "skipping, retrieved previously");
                summary.skipped += 1;
                continue;
            }

            tracing::info!(site = %record.url, snapshots = record.urls.len(), "retrieving pages");
            let mut pages = Vec::with_capacity(record.urls.len());
            for (url, timestamp) in record.urls.values() {
                match self.fetch_page(record, url, timestamp).await {
                    Some(page) => pages.push(page),
                    None => summary.failed_pages += 1,
                }
                tokio::time::sleep(self.options.request_delay).await;
            }

            summary.pages += pages.len();
            let path = self.write_output(&record.url, &pages).await?;
            tracing::info!(output = %path.display(), pages = pages.len(), "wrote pages");
            self.ledger.store(&record.url).await?;
            summary.sites += 1;
        }

        Ok(summary)
    }

    async fn fetch_page(&self, record: &HarvestRecord, url: &str, timestamp: &str) -> Option<PageSnapshot> {
        let ia_url = fanout::archive_url(&self.options.archive_base, timestamp, url);

        let response = match self.client.get(&ia_url).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(url = %ia_url, error = %e, "failed to fetch");
                return None;
            }
        };

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            tracing::error!(url = %ia_url, status = status.as_u16(), domain = %record.domain, "API returned non-200 status");
            return None;
        }

        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(url = %ia_url, error = %e, "failed to read body");
                return None;
            }
        };

        let formats = self.options.formats;
        let (text, links) = extract::extract(&extract::decode_body(&bytes), formats.text, formats.links);

        Some(PageSnapshot {
            domain: record.domain.clone(),
            url: record.url.clone(),
            timestamp: timestamp.to_string(),
            ia_url,
            text,
            links: links.lines().filter(|l| !l.is_empty()).unique().map(str::to_string).collect(),
        })
    }

    async fn write_output(&self, url: &str, pages: &[PageSnapshot]) -> Result<PathBuf, HarvestError> {
        let path = self.options.output_folder.join(output_file_name(url));
        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, serde_json::to_vec(pages)?).await?;
        tokio::fs::rename(&temp_path, &path).await?;
        Ok(path)
    }
}

pub async fn read_pages(path: &Path) -> Result<Vec<PageSnapshot>, HarvestError> {
    let contents = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&contents)?)
}
