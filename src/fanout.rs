use crate::config::{DelayPolicy, HarvestConfig};
use crate::filter::{CanonicalRecord, FilteredSet};
use crate::job::{QueueMessage, ATTR_AUTHOR, ATTR_JOB_TAG};
use crate::queue::{EntryFailure, OutboundMessage, QueueProducerLike, QUEUE_BATCH_LIMIT};
use crate::HarvestError;
use serde::{Deserialize, Serialize};

/// Wire body of a fetch message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchBody {
    pub url: String,
    pub domain: String,
}

/// Archive address of one snapshot: `<archive-base>/<timestamp>/<url>`.
pub fn archive_url(archive_base: &str, timestamp: &str, url: &str) -> String {
    format!("{}/{}/{}", archive_base.trim_end_matches('/'), timestamp, url)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchMessage {
    /// `<archive-base>/<timestamp>/<canonical-url>`
    pub url: String,
    pub domain: String,
    pub job_tag: String,
}

impl FetchMessage {
    pub fn new(archive_base: &str, record: &CanonicalRecord, domain: &str, job_tag: &str) -> Self {
        Self {
            url: archive_url(archive_base, &record.timestamp, &record.url),
            domain: domain.to_string(),
            job_tag: job_tag.to_string(),
        }
    }

    pub fn to_outbound(&self, id: usize, delay_secs: u32, author: &str) -> Result<OutboundMessage, HarvestError> {
        let body = serde_json::to_string(&FetchBody { url: self.url.clone(), domain: self.domain.clone() })?;
        Ok(OutboundMessage {
            id: id.to_string(),
            body,
            delay_secs,
            attributes: vec![
                (ATTR_AUTHOR.to_string(), author.to_string()),
                (ATTR_JOB_TAG.to_string(), self.job_tag.clone()),
            ],
        })
    }

    pub fn from_queue_message(message: &QueueMessage) -> Result<Self, HarvestError> {
        let body: FetchBody = serde_json::from_str(&message.body)?;
        Ok(Self {
            url: body.url,
            domain: body.domain,
            job_tag: message.attribute(ATTR_JOB_TAG).unwrap_or_default().to_string(),
        })
    }
}

/// Delay for the next message of one domain's fan-out.
#[derive(Debug, Clone)]
pub struct DelaySchedule {
    policy: DelayPolicy,
    sent: usize,
}

impl DelaySchedule {
    pub fn new(policy: DelayPolicy) -> Self {
        Self { policy, sent: 0 }
    }

    pub fn current_secs(&self) -> u32 {
        let steps = (self.sent / self.policy.every.max(1)) as u32;
        self.policy
            .base_secs
            .saturating_add(self.policy.step_secs.saturating_mul(steps))
            .min(self.policy.max_secs)
    }

    pub fn record_sent(&mut self, count: usize) {
        self.sent += count;
    }

    pub fn sent(&self) -> usize {
        self.sent
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Messages built for the domain, sent or (in a dry run) only counted.
    pub sent_count: usize,
    pub send_calls: usize,
    pub failures: Vec<EntryFailure>,
}

pub struct FanoutBatcher<'a> {
    queue: &'a dyn QueueProducerLike,
    archive_base: &'a str,
    author: &'a str,
    delay: Option<&'a DelayPolicy>,
}

impl<'a> FanoutBatcher<'a> {
    pub fn new(queue: &'a dyn QueueProducerLike, config: &'a HarvestConfig) -> Self {
        Self {
            queue,
            archive_base: &config.archive_base,
            author: &config.message_author,
            delay: config.delay.as_ref(),
        }
    }

    /// Packs the set into batches of ten and sends them.
    ///
    /// A failed batch is recorded in the report and the remaining batches still go out.
    #[tracing::instrument(skip(self, set), fields(entries = set.len()))]
    pub async fn fanout(&self, job_tag: &str, domain: &str, set: &FilteredSet, dry_run: bool) -> FanoutReport {
        let mut report = FanoutReport::default();
        let mut schedule = self.delay.cloned().map(DelaySchedule::new);
        let mut batch: Vec<OutboundMessage> = Vec::with_capacity(QUEUE_BATCH_LIMIT);

        for record in set.records() {
            report.sent_count += 1;
            if dry_run {
                continue;
            }

            let message = FetchMessage::new(self.archive_base, record, domain, job_tag);
            let delay_secs = schedule.as_ref().map(DelaySchedule::current_secs).unwrap_or(0);
            match message.to_outbound(batch.len(), delay_secs, self.author) {
                Ok(outbound) => batch.push(outbound),
                Err(e) => {
                    tracing::warn!(url = %message.url, error = %e, "could not encode fetch message");
                    continue;
                }
            }
            if let Some(schedule) = schedule.as_mut() {
                schedule.record_sent(1);
            }

            if batch.len() == QUEUE_BATCH_LIMIT {
                self.flush(&mut batch, &mut report).await;
            }
        }

        if !batch.is_empty() {
            self.flush(&mut batch, &mut report).await;
        }

        if !report.failures.is_empty() {
            tracing::warn!(failed = report.failures.len(), "some fetch messages were not sent");
        }
        report
    }

    async fn flush(&self, batch: &mut Vec<OutboundMessage>, report: &mut FanoutReport) {
        let entries = std::mem::take(batch);
        report.send_calls += 1;
        match self.queue.send_batch(entries.clone()).await {
            Ok(failures) => report.failures.extend(failures),
            Err(e) => {
                tracing::warn!(error = %e, size = entries.len(), "fetch queue send failed");
                report.failures.extend(entries.into_iter().map(|entry| EntryFailure {
                    id: entry.id,
                    code: "SendError".to_string(),
                    message: e.to_string(),
                }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MockQueue;

    fn set_of(n: usize) -> FilteredSet {
        (0..n)
            .map(|i| {
                (
                    format!("D{}", i),
                    CanonicalRecord { url: format!("example.com/p{}", i), timestamp: "20190101000000".to_string() },
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_twenty_three_entries_make_three_calls() {
        let queue = MockQueue::new();
        let config = HarvestConfig::default();
        let report = FanoutBatcher::new(&queue, &config).fanout("tag", "example.com", &set_of(23), false).await;

        let sizes: Vec<usize> = queue.sent_batches().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![10, 10, 3]);
        assert_eq!(report.sent_count, 23);
        assert_eq!(report.send_calls, 3);
        assert!(report.failures.is_empty());

        let ids: Vec<String> = queue.sent_batches()[2].iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids, vec!["0", "1", "2"]);
    }

    #[tokio::test]
    async fn test_empty_set_sends_nothing() {
        let queue = MockQueue::new();
        let config = HarvestConfig::default();
        let report = FanoutBatcher::new(&queue, &config).fanout("tag", "example.com", &FilteredSet::new(), false).await;
        assert_eq!(report.sent_count, 0);
        assert!(queue.sent_batches().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_only_counts() {
        let queue = MockQueue::new();
        let config = HarvestConfig::default();
        let report = FanoutBatcher::new(&queue, &config).fanout("tag", "example.com", &set_of(12), true).await;
        assert_eq!(report.sent_count, 12);
        assert_eq!(report.send_calls, 0);
        assert!(queue.sent_batches().is_empty());
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_stop_the_rest() {
        let queue = MockQueue::new();
        queue.fail_send_call(0);
        let config = HarvestConfig::default();
        let report = FanoutBatcher::new(&queue, &config).fanout("tag", "example.com", &set_of(15), false).await;
        assert_eq!(report.send_calls, 2);
        assert_eq!(report.failures.len(), 10);
        assert_eq!(queue.pending_len(), 5);
    }

    #[tokio::test]
    async fn test_message_shape() {
        let queue = MockQueue::new();
        let config = HarvestConfig::default();
        FanoutBatcher::new(&queue, &config).fanout("batch-1", "example.com", &set_of(1), false).await;

        let sent = &queue.sent_batches()[0][0];
        let body: FetchBody = serde_json::from_str(&sent.body).unwrap();
        assert_eq!(body.url, "http://web.archive.org/web/20190101000000/example.com/p0");
        assert_eq!(body.domain, "example.com");
        assert!(sent.attributes.contains(&(ATTR_JOB_TAG.to_string(), "batch-1".to_string())));
        assert!(sent.attributes.contains(&(ATTR_AUTHOR.to_string(), "author".to_string())));
        assert_eq!(sent.delay_secs, 0);
    }

    #[test]
    fn test_delay_increases_once_after_thirty_one() {
        let policy = DelayPolicy { base_secs: 5, step_secs: 10, every: 30, max_secs: 900 };
        let mut schedule = DelaySchedule::new(policy);
        assert_eq!(schedule.current_secs(), 5);
        schedule.record_sent(31);
        assert_eq!(schedule.current_secs(), 15);
        schedule.record_sent(29);
        assert_eq!(schedule.current_secs(), 25);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = DelayPolicy { base_secs: 0, step_secs: 500, every: 1, max_secs: 900 };
        let mut schedule = DelaySchedule::new(policy);
        schedule.record_sent(5);
        assert_eq!(schedule.current_secs(), 900);
    }

    #[tokio::test]
    async fn test_fanout_applies_delay_per_message() {
        let queue = MockQueue::new();
        let config = HarvestConfig {
            delay: Some(DelayPolicy { base_secs: 0, step_secs: 10, every: 30, max_secs: 900 }),
            ..HarvestConfig::default()
        };
        FanoutBatcher::new(&queue, &config).fanout("t", "example.com", &set_of(31), false).await;

        let delays: Vec<u32> = queue.sent_batches().iter().flatten().map(|m| m.delay_secs).collect();
        assert_eq!(delays.len(), 31);
        assert!(delays[..30].iter().all(|d| *d == 0));
        assert_eq!(delays[30], 10);
    }

    #[test]
    fn test_fetch_message_round_trip_from_queue() {
        let message = QueueMessage::new("m", "r", r#"{"url":"http://web.archive.org/web/1/a.com","domain":"a.com"}"#)
            .with_attribute(ATTR_JOB_TAG, "j");
        let fetch = FetchMessage::from_queue_message(&message).unwrap();
        assert_eq!(fetch.domain, "a.com");
        assert_eq!(fetch.job_tag, "j");
    }
}
