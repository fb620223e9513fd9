use crate::config::HarvestConfig;
use crate::fanout::FanoutBatcher;
use crate::filter::{self, FilteredSet};
use crate::job::{DomainJob, Receipt};
use crate::metrics::{DomainMetric, Metrics};
use crate::queue::{self, QueueConsumerLike, QueueProducerLike};
use crate::resolver::{Resolution, SnapshotSource};
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub processed_jobs: usize,
    pub malformed_jobs: usize,
    pub cycles: usize,
    pub halted_by_backpressure: bool,
}

enum DomainStep {
    Done(DomainMetric),
    Halted,
}

/// Pulls domain jobs, resolves them and fans survivors out to the fetch queue.
pub struct Orchestrator {
    config: HarvestConfig,
    job_queue: Arc<dyn QueueConsumerLike>,
    fetch_queue: Arc<dyn QueueProducerLike>,
    source: Arc<dyn SnapshotSource>,
    metrics: Metrics,
}

impl Orchestrator {
    pub fn new(
        config: HarvestConfig,
        job_queue: Arc<dyn QueueConsumerLike>,
        fetch_queue: Arc<dyn QueueProducerLike>,
        source: Arc<dyn SnapshotSource>,
        metrics: Metrics,
    ) -> Self {
        Self { config, job_queue, fetch_queue, source, metrics }
    }

    /// One invocation: up to `cycles_per_invocation` receive/resolve/fan-out rounds.
    ///
    /// Stops early when the job queue is empty or the fetch queue is over its limit.
    /// Jobs not reached before a halt stay undeleted and come back after their
    /// visibility timeout.
    pub async fn run(&self) -> RunSummary {
        let mut summary = RunSummary::default();

        for cycle in 0..self.config.cycles_per_invocation {
            if self.backpressure_exceeded().await {
                summary.halted_by_backpressure = true;
                break;
            }

            let messages = match self.job_queue.receive(self.config.max_jobs_per_cycle).await {
                Ok(messages) => messages,
                Err(e) => {
                    tracing::error!(cycle, error = %e, "could not receive jobs");
                    break;
                }
            };
            if messages.is_empty() {
                tracing::info!(cycle, "job queue is empty");
                break;
            }
            summary.cycles += 1;
            tracing::info!(cycle, jobs = messages.len(), "received jobs");

            let mut done: Vec<Receipt> = Vec::new();
            let mut jobs: Vec<DomainJob> = Vec::with_capacity(messages.len());
            for message in &messages {
                match DomainJob::from_message(message) {
                    Ok(job) => jobs.push(job),
                    Err(e) => {
                        tracing::warn!(body = %message.body, error = %e, "dropping job with unusable domain");
                        summary.malformed_jobs += 1;
                        done.push(message.receipt());
                    }
                }
            }

            let resolutions = self.source.resolve_batch(jobs).await;
            for resolution in resolutions {
                let receipt = resolution.job.receipt();
                match self.process_domain(resolution).await {
                    DomainStep::Done(metric) => {
                        self.metrics.record_domain(&metric);
                        summary.processed_jobs += 1;
                        done.push(receipt);
                    }
                    DomainStep::Halted => {
                        summary.halted_by_backpressure = true;
                        break;
                    }
                }
            }

            let failed = queue::delete_all(self.job_queue.as_ref(), &done).await;
            if failed > 0 {
                tracing::warn!(failed, total = done.len(), "some processed jobs were not deleted");
            }

            if summary.halted_by_backpressure {
                tracing::warn!(cycle, "fetch queue over limit, stopping");
                break;
            }
        }

        tracing::info!(
            processed = summary.processed_jobs,
            cycles = summary.cycles,
            halted = summary.halted_by_backpressure,
            "invocation finished"
        );
        summary
    }

    #[tracing::instrument(skip(self, resolution), fields(domain = %resolution.job.domain))]
    async fn process_domain(&self, resolution: Resolution) -> DomainStep {
        let job = &resolution.job;
        let mut metric = DomainMetric {
            job_tag: job.job_tag.clone(),
            domain: job.domain.clone(),
            year_from: resolution.window.from,
            year_to: resolution.window.to,
            raw_count: resolution.raw_count(),
            pre_cap_count: 0,
            final_count: 0,
        };

        if let Some(error) = &resolution.error {
            tracing::warn!(%error, "no snapshots for domain");
            self.metrics.update(|c| c.domains_failed += 1);
            return DomainStep::Done(metric);
        }

        let filtered = match &resolution.records {
            Some(records) => filter::filter(records),
            None => FilteredSet::new(),
        };
        metric.pre_cap_count = filtered.len();

        let limit = filter::effective_cap(job.url_cap, self.config.url_limit_per_domain);
        let capped = filter::cap(filtered, limit);
        metric.final_count = capped.len();

        let dry_run = job.first_stage_only;
        if !dry_run && !capped.is_empty() && self.backpressure_exceeded().await {
            return DomainStep::Halted;
        }

        let batcher = FanoutBatcher::new(self.fetch_queue.as_ref(), &self.config);
        let report = batcher.fanout(&job.job_tag, &job.domain, &capped, dry_run).await;
        if !dry_run {
            self.metrics.update(|c| {
                c.urls_sent += report.sent_count.saturating_sub(report.failures.len());
                c.send_failures += report.failures.len();
            });
        }
        tracing::debug!(sent = report.sent_count, dry_run, "fan-out finished");

        DomainStep::Done(metric)
    }

    async fn backpressure_exceeded(&self) -> bool {
        let Some(limit) = self.config.fetch_queue_limit else {
            return false;
        };
        match self.fetch_queue.depth().await {
            Ok(depth) if depth > limit => {
                tracing::info!(depth, limit, "fetch queue depth over limit");
                true
            }
            Ok(_) => false,
            Err(e) => {
                tracing::warn!(error = %e, "could not read fetch queue depth");
                false
            }
        }
    }
}
