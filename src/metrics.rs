use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

const MAX_RECENT_LINES: usize = 100;

/// Per-domain outcome of the resolution stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DomainMetric {
    pub job_tag: String,
    pub domain: String,
    pub year_from: u32,
    pub year_to: u32,
    pub raw_count: usize,
    pub pre_cap_count: usize,
    pub final_count: usize,
}

impl DomainMetric {
    pub fn line(&self) -> String {
        format!(
            "[CDX_METRIC] {},{},{},{},{},{},{}",
            self.job_tag, self.domain, self.year_from, self.year_to, self.raw_count, self.pre_cap_count, self.final_count
        )
    }
}

/// Per-page outcome of the fetch stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScrapeMetric {
    pub job_tag: String,
    pub domain: String,
    pub url: String,
    pub text_len: usize,
    pub links_len: usize,
}

impl ScrapeMetric {
    pub fn line(&self) -> String {
        format!(
            "[SCRAPE_METRIC] {},{},{},{},{}",
            self.job_tag, self.domain, self.url, self.text_len, self.links_len
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunCounters {
    pub domains_processed: usize,
    pub domains_failed: usize,
    pub urls_sent: usize,
    pub send_failures: usize,
    pub pages_fetched: usize,
    pub records_delivered: usize,
    pub truncations: usize,
}

#[derive(Default)]
struct MetricsInner {
    counters: RunCounters,
    recent: VecDeque<String>,
}

/// Shared run metrics. Lines are printed to stdout and the most recent are kept.
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<Mutex<MetricsInner>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_domain(&self, metric: &DomainMetric) {
        self.emit(metric.line());
        self.update(|c| c.domains_processed += 1);
    }

    pub fn record_scrape(&self, metric: &ScrapeMetric) {
        self.emit(metric.line());
        self.update(|c| c.pages_fetched += 1);
    }

    pub fn update(&self, update: impl FnOnce(&mut RunCounters)) {
        let mut inner = self.lock();
        update(&mut inner.counters);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.lock();
        MetricsSnapshot {
            counters: inner.counters.clone(),
            recent: inner.recent.iter().cloned().collect(),
        }
    }

    fn emit(&self, line: String) {
        println!("{}", line);
        let mut inner = self.lock();
        inner.recent.push_back(line);
        if inner.recent.len() > MAX_RECENT_LINES {
            inner.recent.pop_front();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MetricsInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone, Debug)]
pub struct MetricsSnapshot {
    pub counters: RunCounters,
    pub recent: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_metric_line() {
        let metric = DomainMetric {
            job_tag: "2024.01.02-03.04".to_string(),
            domain: "example.com".to_string(),
            year_from: 2018,
            year_to: 2019,
            raw_count: 40,
            pre_cap_count: 12,
            final_count: 10,
        };
        assert_eq!(metric.line(), "[CDX_METRIC] 2024.01.02-03.04,example.com,2018,2019,40,12,10");
    }

    #[test]
    fn test_recent_lines_are_bounded() {
        let metrics = Metrics::new();
        let handle = metrics.clone();
        for i in 0..(MAX_RECENT_LINES + 5) {
            handle.record_scrape(&ScrapeMetric {
                job_tag: String::new(),
                domain: "a.com".to_string(),
                url: format!("u{}", i),
                text_len: 0,
                links_len: 0,
            });
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.recent.len(), MAX_RECENT_LINES);
        assert_eq!(snapshot.counters.pages_fetched, MAX_RECENT_LINES + 5);
        assert!(snapshot.recent[0].ends_with("u5,0,0"));
    }
}
