//! Single-machine harvester: a text list of sites in, one JSON file of snapshot URLs out.
//!
//! Finished sites are kept in a `.sites` ledger next to the output file, so a rerun
//! over the same output picks up where the last one stopped.

use crate::config::LocalPaths;
use crate::filter::{self, FilteredSet};
use crate::job::{DomainJob, YearWindow};
use crate::ledger::RetentionLedger;
use crate::resolver::SnapshotSource;
use crate::HarvestError;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

static SITE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:https?://)?(?:www\d?\.)?(?P<domain>[\w.-]+\.\w+)(?:/\S*)?").expect("site line pattern")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteLine {
    pub line: String,
    pub domain: String,
}

/// One harvested site in the output file. `urls` maps digest to `[url, timestamp]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestRecord {
    pub domain: String,
    pub url: String,
    pub from: u32,
    pub to: u32,
    pub urls: IndexMap<String, (String, String)>,
}

#[derive(Debug, Clone)]
pub struct HarvestOptions {
    pub output_file: PathBuf,
    pub year_from: u32,
    pub year_to: u32,
    /// Query the bare domain instead of the full input line.
    pub query_domain: bool,
    /// 0 keeps every snapshot.
    pub snapshot_limit: usize,
    pub request_delay: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalSummary {
    pub harvested: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Splits a site list into usable lines and rejects.
pub fn load_lines(contents: &str) -> (Vec<SiteLine>, Vec<String>) {
    let mut valid = Vec::new();
    let mut invalid = Vec::new();
    for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match SITE_LINE.captures(line) {
            Some(caps) => valid.push(SiteLine { line: line.to_string(), domain: caps["domain"].to_string() }),
            None => invalid.push(line.to_string()),
        }
    }
    (valid, invalid)
}

/// Appends `new` to `previous`, one record per `url`; a later record replaces an earlier one in place.
pub fn merge_records(previous: Vec<HarvestRecord>, new: Vec<HarvestRecord>) -> Vec<HarvestRecord> {
    let mut by_url: IndexMap<String, HarvestRecord> = IndexMap::new();
    for record in previous.into_iter().chain(new) {
        by_url.insert(record.url.clone(), record);
    }
    by_url.into_values().collect()
}

pub struct LocalHarvester {
    source: Arc<dyn SnapshotSource>,
    options: HarvestOptions,
    ledger: RetentionLedger,
}

impl LocalHarvester {
    pub async fn new(source: Arc<dyn SnapshotSource>, options: HarvestOptions) -> Result<Self, HarvestError> {
        if options.output_file.is_file() {
            tracing::warn!(output = %options.output_file.display(), "output file already exists; appending");
        }
        let ledger_file = LocalPaths::new(options.output_file.clone()).ledger_file();
        let ledger = RetentionLedger::open_file(ledger_file).await?;
        Ok(Self::with_ledger(source, options, ledger))
    }

    pub fn with_ledger(source: Arc<dyn SnapshotSource>, options: HarvestOptions, ledger: RetentionLedger) -> Self {
        Self { source, options, ledger }
    }

    pub async fn run(&mut self, sites: &[SiteLine]) -> Result<LocalSummary, HarvestError> {
        let mut summary = LocalSummary::default();

        for site in sites {
            let query = if self.options.query_domain { &site.domain } else { &site.line };
            if self.ledger.exists(query) {
                tracing::info!(site = %query, "skipping, retrieved previously");
                summary.skipped += 1;
                continue;
            }

            tracing::info!(site = %query, "retrieving");
            match self.harvest_site(site, query).await? {
                Some(record) => {
                    tracing::info!(site = %query, records = record.urls.len(), "got records");
                    self.save(record).await?;
                    summary.harvested += 1;
                }
                None => summary.failed += 1,
            }
            self.ledger.store(query).await?;

            tokio::time::sleep(self.options.request_delay).await;
        }

        Ok(summary)
    }

    async fn harvest_site(&self, site: &SiteLine, query: &str) -> Result<Option<HarvestRecord>, HarvestError> {
        let window = YearWindow { from: self.options.year_from, to: self.options.year_to };
        let job = DomainJob {
            domain: query.to_string(),
            job_tag: String::new(),
            year_window: Some(window),
            url_cap: None,
            first_stage_only: true,
            source_message_id: String::new(),
            source_receipt_token: String::new(),
        };

        let resolution = self
            .source
            .resolve_batch(vec![job])
            .await
            .into_iter()
            .next()
            .ok_or_else(|| HarvestError::Other(format!("no resolution returned for {}", query)))?;

        if let Some(error) = resolution.error {
            tracing::error!(site = %query, %error, "index lookup failed");
            return Ok(None);
        }

        let filtered = match &resolution.records {
            Some(records) => filter::filter(records),
            None => FilteredSet::new(),
        };
        let capped = filter::cap(filtered, self.options.snapshot_limit);

        Ok(Some(HarvestRecord {
            domain: site.domain.clone(),
            url: query.to_string(),
            from: window.from,
            to: window.to,
            urls: capped
                .iter()
                .map(|(digest, record)| (digest.clone(), (record.url.clone(), record.timestamp.clone())))
                .collect(),
        }))
    }

    async fn save(&self, record: HarvestRecord) -> Result<(), HarvestError> {
        let path = &self.options.output_file;
        let previous = read_records(path).await?;
        let merged = merge_records(previous, vec![record]);
        write_records(path, &merged).await?;
        tracing::info!(output = %path.display(), "wrote output");
        Ok(())
    }
}

pub async fn read_records(path: &Path) -> Result<Vec<HarvestRecord>, HarvestError> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) if contents.trim().is_empty() => Ok(Vec::new()),
        Ok(contents) => Ok(serde_json::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(HarvestError::Io(e)),
    }
}

async fn write_records(path: &Path, records: &[HarvestRecord]) -> Result<(), HarvestError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp_path = path.with_extension("json.tmp");
    tokio::fs::write(&temp_path, serde_json::to_vec(records)?).await?;
    tokio::fs::rename(&temp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_lines() {
        let (valid, invalid) = load_lines("https://www.checkyeti.com/en\n\nwww2.parkbob.com\n???\nkochabo.de\n");
        let domains: Vec<_> = valid.iter().map(|s| s.domain.as_str()).collect();
        assert_eq!(domains, vec!["checkyeti.com", "parkbob.com", "kochabo.de"]);
        assert_eq!(valid[0].line, "https://www.checkyeti.com/en");
        assert_eq!(invalid, vec!["???"]);
    }

    fn record(url: &str, digest: &str) -> HarvestRecord {
        let mut urls = IndexMap::new();
        urls.insert(digest.to_string(), (format!("{}/", url), "20200101000000".to_string()));
        HarvestRecord { domain: url.to_string(), url: url.to_string(), from: 2020, to: 2024, urls }
    }

    #[test]
    fn test_merge_records_dedups_by_url() {
        let merged = merge_records(vec![record("a.com", "1"), record("b.com", "2")], vec![record("a.com", "3")]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].url, "a.com");
        assert!(merged[0].urls.contains_key("3"));
        assert_eq!(merged[1].url, "b.com");
    }

    #[test]
    fn test_record_json_shape() {
        let json = serde_json::to_value(record("a.com", "D")).unwrap();
        assert_eq!(json["urls"]["D"][0], "a.com/");
        assert_eq!(json["urls"]["D"][1], "20200101000000");
        assert_eq!(json["from"], 2020);
    }
}
