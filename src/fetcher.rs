use crate::bounder::{self, PageRecord};
use crate::config::{HarvestConfig, SaveFormats};
use crate::extract;
use crate::fanout::FetchMessage;
use crate::job::{QueueMessage, Receipt};
use crate::metrics::{Metrics, ScrapeMetric};
use crate::queue::{self, DeliveryOutcome, DeliveryStreamLike, QueueConsumerLike};
use crate::HarvestError;
use std::time::Duration;

/// Result of fetching one archived page.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// Set when the message is finished with and may be deleted.
    pub ack: Option<Receipt>,
    /// Serialized, size-bounded delivery line.
    pub record: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub retried: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub received: usize,
    pub acked: usize,
    pub delivery: DeliveryReport,
}

/// Backoff before re-sending throttled records, in whole seconds.
#[derive(Debug, Clone, Copy)]
pub struct RetryBackoff {
    pub min_secs: u64,
    pub max_secs: u64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self { min_secs: 1, max_secs: 5 }
    }
}

impl RetryBackoff {
    fn pick(&self) -> Duration {
        Duration::from_secs(fastrand::u64(self.min_secs..=self.max_secs.max(self.min_secs)))
    }
}

#[derive(Clone)]
pub struct FetchWorker {
    client: reqwest::Client,
    formats: SaveFormats,
    max_record_bytes: usize,
    delivery_chunk: usize,
    backoff: RetryBackoff,
    metrics: Metrics,
}

impl FetchWorker {
    pub fn new(config: &HarvestConfig, metrics: Metrics) -> Result<Self, HarvestError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()?;
        Ok(Self::with_client(client, config, metrics))
    }

    pub fn with_client(client: reqwest::Client, config: &HarvestConfig, metrics: Metrics) -> Self {
        Self {
            client,
            formats: config.formats,
            max_record_bytes: config.max_record_bytes,
            delivery_chunk: config.delivery_chunk.max(1),
            backoff: RetryBackoff::default(),
            metrics,
        }
    }

    pub fn with_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Fetches one page. Rate limiting and server errors leave the message unacknowledged.
    #[tracing::instrument(skip(self, message), fields(message_id = %message.message_id))]
    pub async fn fetch_one(&self, message: &QueueMessage) -> FetchOutcome {
        let fetch = match FetchMessage::from_queue_message(message) {
            Ok(fetch) => fetch,
            Err(e) => {
                tracing::warn!(body = %message.body, error = %e, "unreadable fetch message");
                return FetchOutcome { ack: Some(message.receipt()), record: None };
            }
        };
        tracing::info!(url = %fetch.url, "fetch url");

        let response = match self.client.get(&fetch.url).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(url = %fetch.url, error = %e, "failed to fetch");
                self.record_scrape(&fetch, 0, 0);
                return FetchOutcome { ack: Some(message.receipt()), record: None };
            }
        };

        let status = response.status().as_u16();
        if status == 429 || status >= 500 {
            tracing::warn!(url = %fetch.url, status, "server busy, retrying later");
            return FetchOutcome { ack: None, record: None };
        }

        let (text, links) = if status == 200 {
            match response.bytes().await {
                Ok(bytes) => {
                    extract::extract(&extract::decode_body(&bytes), self.formats.text, self.formats.links)
                }
                Err(e) => {
                    tracing::warn!(url = %fetch.url, error = %e, "failed to read body");
                    (String::new(), String::new())
                }
            }
        } else {
            tracing::warn!(url = %fetch.url, status, "failed to get page");
            (String::new(), String::new())
        };

        self.record_scrape(&fetch, text.len(), links.len());
        let record = self.make_record(&fetch, text, links);
        FetchOutcome { ack: Some(message.receipt()), record }
    }

    /// Bounds the page and serializes it as one delivery line. Empty pages make no record.
    pub fn make_record(&self, fetch: &FetchMessage, text: String, links: String) -> Option<String> {
        if text.is_empty() && links.is_empty() {
            return None;
        }
        let page = PageRecord {
            domain: fetch.domain.clone(),
            url: fetch.url.clone(),
            job_tag: fetch.job_tag.clone(),
            timestamp: chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
            page_text: text,
            page_links: links,
        };
        let bounded = bounder::bound(page, self.max_record_bytes);
        if bounded.truncated {
            self.metrics.update(|c| c.truncations += 1);
        }
        match serde_json::to_string(&bounded.record) {
            Ok(line) => Some(line + "\n"),
            Err(e) => {
                tracing::warn!(url = %fetch.url, error = %e, "could not encode record");
                None
            }
        }
    }

    pub async fn fetch_all(&self, messages: &[QueueMessage]) -> Vec<FetchOutcome> {
        futures::future::join_all(messages.iter().map(|m| self.fetch_one(m))).await
    }

    /// Sends records in chunks. Throttled records get one more try after a short random pause.
    pub async fn deliver(&self, stream: &dyn DeliveryStreamLike, records: &[String]) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        for chunk in records.chunks(self.delivery_chunk) {
            let outcomes = match stream.put_batch(chunk).await {
                Ok(outcomes) => outcomes,
                Err(e) => {
                    tracing::warn!(error = %e, size = chunk.len(), "delivery call failed");
                    report.dropped += chunk.len();
                    continue;
                }
            };

            let mut retries: Vec<String> = Vec::new();
            for (record, outcome) in chunk.iter().zip(outcomes) {
                match outcome {
                    DeliveryOutcome::Delivered => report.delivered += 1,
                    DeliveryOutcome::Throttled => retries.push(record.clone()),
                    DeliveryOutcome::Failed { code, message } => {
                        tracing::warn!(%code, %message, "delivery rejected record");
                        report.dropped += 1;
                    }
                }
            }

            if retries.is_empty() {
                continue;
            }
            let pause = self.backoff.pick();
            tracing::warn!(count = retries.len(), secs = pause.as_secs(), "delivery throttled, retrying");
            tokio::time::sleep(pause).await;
            report.retried += retries.len();

            match stream.put_batch(&retries).await {
                Ok(outcomes) => {
                    for outcome in outcomes {
                        match outcome {
                            DeliveryOutcome::Delivered => report.delivered += 1,
                            _ => report.dropped += 1,
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, size = retries.len(), "delivery retry failed");
                    report.dropped += retries.len();
                }
            }
        }

        self.metrics.update(|c| c.records_delivered += report.delivered);
        report
    }

    /// Fetches, delivers, then deletes every acknowledged message.
    pub async fn process_batch(
        &self,
        fetch_queue: &dyn QueueConsumerLike,
        stream: &dyn DeliveryStreamLike,
        messages: &[QueueMessage],
    ) -> BatchReport {
        let outcomes = self.fetch_all(messages).await;

        let mut records = Vec::new();
        let mut acked = Vec::new();
        for outcome in outcomes {
            records.extend(outcome.record);
            acked.extend(outcome.ack);
        }

        let delivery = if records.is_empty() {
            DeliveryReport::default()
        } else {
            self.deliver(stream, &records).await
        };

        let failed = queue::delete_all(fetch_queue, &acked).await;
        if failed > 0 {
            tracing::warn!(failed, total = acked.len(), "delete failed for some fetch messages");
        }

        BatchReport { received: messages.len(), acked: acked.len(), delivery }
    }

    /// Receives up to `max_messages` from the fetch queue and processes them.
    pub async fn run_once(
        &self,
        fetch_queue: &dyn QueueConsumerLike,
        stream: &dyn DeliveryStreamLike,
        max_messages: usize,
    ) -> Result<BatchReport, HarvestError> {
        let messages = fetch_queue.receive(max_messages).await?;
        if messages.is_empty() {
            return Ok(BatchReport::default());
        }
        tracing::info!(count = messages.len(), "fetch worker received messages");
        Ok(self.process_batch(fetch_queue, stream, &messages).await)
    }

    fn record_scrape(&self, fetch: &FetchMessage, text_len: usize, links_len: usize) {
        self.metrics.record_scrape(&ScrapeMetric {
            job_tag: fetch.job_tag.clone(),
            domain: fetch.domain.clone(),
            url: fetch.url.clone(),
            text_len,
            links_len,
        });
    }
}
