use crate::config::{HarvestConfig, MatchScope};
use crate::filter::RawSnapshotRecord;
use crate::job::{DomainJob, YearWindow};
use crate::HarvestError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::task::JoinSet;

const CDX_FIELDS: &str = "urlkey,timestamp,digest,original";
/// Collapse on the first 4 timestamp digits.
const CDX_COLLAPSE: &str = "timestamp:4";
const CDX_STATUS_FILTER: &str = "statuscode:200";

/// Outcome of one index query. At most one of `records`/`error` is set.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub job: DomainJob,
    pub window: YearWindow,
    pub records: Option<Vec<RawSnapshotRecord>>,
    pub error: Option<String>,
}

impl Resolution {
    pub fn raw_count(&self) -> usize {
        self.records.as_ref().map(Vec::len).unwrap_or(0)
    }
}

/// Anything that can turn a batch of jobs into index results.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn resolve_batch(&self, jobs: Vec<DomainJob>) -> Vec<Resolution>;
}

#[derive(Debug, Clone)]
pub struct CdxQuery {
    pub url: String,
    pub match_scope: MatchScope,
    pub window: YearWindow,
}

impl CdxQuery {
    pub fn params(&self) -> Vec<(&'static str, String)> {
        vec![
            ("url", self.url.clone()),
            ("matchType", self.match_scope.as_str().to_string()),
            ("fl", CDX_FIELDS.to_string()),
            ("collapse", CDX_COLLAPSE.to_string()),
            ("from", self.window.from.to_string()),
            ("to", self.window.to.to_string()),
            ("filter", CDX_STATUS_FILTER.to_string()),
            ("output", "json".to_string()),
            ("showResumeKey", "true".to_string()),
        ]
    }
}

#[derive(Clone)]
pub struct IndexResolver {
    client: reqwest::Client,
    endpoint: String,
    match_scope: MatchScope,
    default_window: YearWindow,
}

impl IndexResolver {
    pub fn new(config: &HarvestConfig) -> Result<Self, HarvestError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: reqwest::Client, config: &HarvestConfig) -> Self {
        Self {
            client,
            endpoint: config.cdx_endpoint.clone(),
            match_scope: config.match_scope,
            default_window: YearWindow { from: config.year_from, to: config.year_to },
        }
    }

    pub fn query_for(&self, job: &DomainJob) -> CdxQuery {
        CdxQuery {
            url: job.domain.clone(),
            match_scope: self.match_scope,
            window: job.effective_window(self.default_window.from, self.default_window.to),
        }
    }

    /// One index request. Never fails; transport and API problems land in `error`.
    #[tracing::instrument(skip(self, job), fields(domain = %job.domain))]
    pub async fn resolve(&self, job: DomainJob) -> Resolution {
        let query = self.query_for(&job);
        let mut resolution = Resolution {
            job,
            window: query.window,
            records: None,
            error: None,
        };

        match self.fetch_rows(&query).await {
            Ok(records) => resolution.records = records,
            Err(HarvestError::Api { status, domain }) => {
                resolution.error = Some(HarvestError::Api { status, domain }.to_string());
            }
            Err(e) => {
                tracing::warn!(error = %e, "error while querying index");
                resolution.error = Some(format!("error while getting {}: {}", resolution.job.domain, e));
            }
        }

        resolution
    }

    async fn fetch_rows(&self, query: &CdxQuery) -> Result<Option<Vec<RawSnapshotRecord>>, HarvestError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&query.params())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(HarvestError::Api { status: status.as_u16(), domain: query.url.clone() });
        }

        let body = response.text().await?;
        parse_index_body(&body)
    }

    /// Resolves every job concurrently and joins them all before returning.
    ///
    /// A task that panics is reported as an error for its job; siblings are unaffected.
    pub async fn resolve_all(&self, jobs: Vec<DomainJob>) -> Vec<Resolution> {
        let mut tasks = JoinSet::new();
        let submitted = jobs.clone();

        for (index, job) in jobs.into_iter().enumerate() {
            let resolver = self.clone();
            tasks.spawn(async move { (index, resolver.resolve(job).await) });
        }

        let mut slots: Vec<Option<Resolution>> = vec![None; submitted.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, resolution)) => slots[index] = Some(resolution),
                Err(e) => tracing::error!(error = %e, "index resolution task failed"),
            }
        }

        slots
            .into_iter()
            .zip(submitted)
            .map(|(slot, job)| {
                slot.unwrap_or_else(|| {
                    let window = job.effective_window(self.default_window.from, self.default_window.to);
                    Resolution {
                        error: Some(format!("resolution task for {} did not complete", job.domain)),
                        job,
                        window,
                        records: None,
                    }
                })
            })
            .collect()
    }
}

#[async_trait]
impl SnapshotSource for IndexResolver {
    async fn resolve_batch(&self, jobs: Vec<DomainJob>) -> Vec<Resolution> {
        self.resolve_all(jobs).await
    }
}

/// Parses the index's JSON array-of-arrays.
///
/// An empty body or `[]` means no snapshots. Otherwise zero-length rows are dropped
/// (the resume-key separator), then the header row.
pub fn parse_index_body(body: &str) -> Result<Option<Vec<RawSnapshotRecord>>, HarvestError> {
    if body.trim().is_empty() {
        return Ok(None);
    }

    let rows: Vec<Vec<serde_json::Value>> = serde_json::from_str(body)?;
    if rows.is_empty() {
        return Ok(None);
    }

    let records = rows
        .into_iter()
        .filter(|row| !row.is_empty())
        .skip(1)
        .filter_map(|row| {
            let columns: Vec<String> = row
                .into_iter()
                .map(|v| match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                })
                .collect();
            let record = RawSnapshotRecord::from_row(&columns);
            if record.is_none() {
                tracing::debug!(?columns, "skipping short index row");
            }
            record
        })
        .collect();

    Ok(Some(records))
}
