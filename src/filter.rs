//! Canonicalization, noise removal, digest dedup and the per-domain snapshot cap.
//!
//! Index rows arrive as `[url_key, timestamp, digest, original_url]`. Only the
//! original URL and timestamp survive filtering; the digest is the map key and is
//! dropped once the set is fanned out.

use indexmap::IndexMap;
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;

/// Extensions and path suffixes that never point at a landing page.
const BLACKLIST_SUFFIXES: &[&str] = &[
    ".css", ".js", ".map", ".xml", ".png", ".woff", ".gif", ".jpg", ".eot", ".jpeg", ".bmp",
    ".mp4", ".svg", ".woff2", ".ico", ".ttf", ".pdf", ".xls", ".xlsx", ".pps", ".ppsx", ".ogv",
    ".zip", ".glb", ".webm", ".webp", "robots.txt", "/wp-json", "/feed",
];

// A suffix only counts when followed by `/`, `?` or the end of the URL.
static BLACKLIST: Lazy<Regex> = Lazy::new(|| {
    let suffixes = BLACKLIST_SUFFIXES.iter().map(|s| regex::escape(s)).join("|");
    Regex::new(&format!(r"(?i)(?:{})(?:/|\?|$)", suffixes)).expect("blacklist pattern")
});

static SCHEME_AND_WWW: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:https?://)?(?:www\.)?").expect("scheme pattern"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSnapshotRecord {
    pub url_key: String,
    /// 14-digit `YYYYMMDDhhmmss`; fixed width, so string order is time order.
    pub timestamp: String,
    pub digest: String,
    pub original_url: String,
}

impl RawSnapshotRecord {
    pub fn new(url_key: &str, timestamp: &str, digest: &str, original_url: &str) -> Self {
        Self {
            url_key: url_key.to_string(),
            timestamp: timestamp.to_string(),
            digest: digest.to_string(),
            original_url: original_url.to_string(),
        }
    }

    /// Reads one index row. Rows without all four columns yield `None`.
    pub fn from_row(row: &[String]) -> Option<Self> {
        match row {
            [url_key, timestamp, digest, original_url, ..] => Some(Self {
                url_key: url_key.clone(),
                timestamp: timestamp.clone(),
                digest: digest.clone(),
                original_url: original_url.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRecord {
    pub url: String,
    pub timestamp: String,
}

/// Snapshots unique by digest, in walk order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilteredSet {
    entries: IndexMap<String, CanonicalRecord>,
}

impl FilteredSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, digest: &str) -> Option<&CanonicalRecord> {
        self.entries.get(digest)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CanonicalRecord)> {
        self.entries.iter()
    }

    pub fn records(&self) -> impl Iterator<Item = &CanonicalRecord> {
        self.entries.values()
    }

    pub fn into_records(self) -> Vec<CanonicalRecord> {
        self.entries.into_values().collect()
    }
}

impl FromIterator<(String, CanonicalRecord)> for FilteredSet {
    fn from_iter<I: IntoIterator<Item = (String, CanonicalRecord)>>(iter: I) -> Self {
        Self { entries: iter.into_iter().collect() }
    }
}

pub fn canonical_url(original_url: &str) -> String {
    SCHEME_AND_WWW.replace(original_url, "").into_owned()
}

pub fn is_blacklisted(url: &str) -> bool {
    BLACKLIST.is_match(url)
}

/// Builds the digest-unique set.
///
/// Records are walked newest first. A digest keeps the map position of its newest
/// non-blacklisted snapshot, and its value is replaced by each older one met later,
/// so the oldest snapshot of identical content is what gets fetched. Blacklisted
/// records never claim a digest.
///
/// Position from the newest, value from the oldest: this is intended, do not switch
/// it to insert-if-absent.
pub fn filter(records: &[RawSnapshotRecord]) -> FilteredSet {
    let ordered = records
        .iter()
        .map(|r| (canonical_url(&r.original_url), r.timestamp.as_str(), r.digest.as_str()))
        .sorted_by(|a, b| b.1.cmp(a.1));

    let mut entries: IndexMap<String, CanonicalRecord> = IndexMap::new();
    for (url, timestamp, digest) in ordered {
        if is_blacklisted(&url) {
            continue;
        }
        let record = CanonicalRecord { url, timestamp: timestamp.to_string() };
        match entries.get_mut(digest) {
            Some(existing) => *existing = record,
            None => {
                entries.insert(digest.to_string(), record);
            }
        }
    }

    FilteredSet { entries }
}

/// Job-level cap wins when set and non-zero; 0 means unbounded.
pub fn effective_cap(job_cap: Option<usize>, global_cap: usize) -> usize {
    match job_cap {
        Some(cap) if cap > 0 => cap,
        _ => global_cap,
    }
}

/// Keeps the `limit` shortest URLs. Equal lengths keep their set order.
pub fn cap(set: FilteredSet, limit: usize) -> FilteredSet {
    if limit == 0 || set.len() <= limit {
        return set;
    }

    set.entries
        .into_iter()
        .sorted_by_key(|(_, record)| record.url.chars().count())
        .take(limit)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(timestamp: &str, digest: &str, original: &str) -> RawSnapshotRecord {
        RawSnapshotRecord::new("com,example)/", timestamp, digest, original)
    }

    #[test]
    fn test_canonical_url_strips_scheme_and_www() {
        assert_eq!(canonical_url("https://www.example.com/a"), "example.com/a");
        assert_eq!(canonical_url("HTTP://WWW.Example.com/"), "Example.com/");
        assert_eq!(canonical_url("http://example.com"), "example.com");
        assert_eq!(canonical_url("example.com/www.x"), "example.com/www.x");
    }

    #[test]
    fn test_blacklist_is_anchored() {
        assert!(is_blacklisted("example.com/photo.jpg"));
        assert!(is_blacklisted("example.com/photo.jpg?x=1"));
        assert!(is_blacklisted("example.com/photo.JPG/"));
        assert!(!is_blacklisted("example.com/photo.jpgx"));
        assert!(!is_blacklisted("example.com/data.json"));
        assert!(is_blacklisted("example.com/robots.txt"));
        assert!(is_blacklisted("example.com/wp-json/wp/v2"));
        assert!(is_blacklisted("example.com/feed"));
        assert!(is_blacklisted("example.com/feed/"));
        assert!(!is_blacklisted("example.com/feedback"));
        assert!(is_blacklisted("example.com/fonts/a.woff2"));
        assert!(!is_blacklisted("example.com/about"));
    }

    #[test]
    fn test_digest_collision_keeps_oldest() {
        let records = vec![
            rec("20230101000000", "A", "http://example.com/"),
            rec("20220101000000", "A", "http://example.com/"),
        ];
        let set = filter(&records);
        assert_eq!(set.len(), 1);
        assert_eq!(set.get("A").unwrap().timestamp, "20220101000000");
    }

    #[test]
    fn test_collision_keeps_newest_position_with_oldest_value() {
        let records = vec![
            rec("20200101000000", "A", "http://example.com/old"),
            rec("20210101000000", "B", "http://example.com/b"),
            rec("20220101000000", "A", "http://example.com/new"),
        ];
        let entries: Vec<_> = filter(&records).iter().map(|(d, r)| (d.clone(), r.url.clone())).collect();
        assert_eq!(
            entries,
            vec![("A".to_string(), "example.com/old".to_string()), ("B".to_string(), "example.com/b".to_string())]
        );
    }

    #[test]
    fn test_blacklisted_record_does_not_claim_digest() {
        let records = vec![
            rec("20230101000000", "A", "http://example.com/style.css"),
            rec("20220101000000", "A", "http://example.com/"),
        ];
        let set = filter(&records);
        assert_eq!(set.get("A").unwrap().url, "example.com/");
    }

    #[test]
    fn test_filter_orders_newest_first() {
        let records = vec![
            rec("20200101000000", "A", "http://example.com/a"),
            rec("20220101000000", "B", "http://example.com/b"),
            rec("20210101000000", "C", "http://example.com/c"),
        ];
        let urls: Vec<_> = filter(&records).records().map(|r| r.url.clone()).collect();
        assert_eq!(urls, vec!["example.com/b", "example.com/c", "example.com/a"]);
    }

    #[test]
    fn test_filter_is_repeatable_and_digest_unique() {
        let records: Vec<_> = (0..40)
            .map(|i| {
                let ext = if i % 7 == 0 { ".png" } else { "" };
                rec(&format!("2020{:010}", i), &format!("D{}", i % 9), &format!("http://www.example.com/p{}{}", i, ext))
            })
            .collect();
        let first = filter(&records);
        assert_eq!(first, filter(&records));

        let digests: std::collections::HashSet<_> = first.iter().map(|(d, _)| d.clone()).collect();
        assert_eq!(digests.len(), first.len());
        assert!(first.records().all(|r| !is_blacklisted(&r.url)));
    }

    #[test]
    fn test_empty_input() {
        assert!(filter(&[]).is_empty());
    }

    #[test]
    fn test_cap_keeps_shortest() {
        let set: FilteredSet = [("x", 30), ("y", 10), ("z", 20)]
            .iter()
            .map(|(d, n)| {
                (d.to_string(), CanonicalRecord { url: "u".repeat(*n), timestamp: "1".to_string() })
            })
            .collect();
        let capped = cap(set, 2);
        let lens: Vec<_> = capped.records().map(|r| r.url.len()).collect();
        assert_eq!(lens, vec![10, 20]);
    }

    #[test]
    fn test_cap_unbounded_and_under_limit() {
        let set = filter(&[rec("20200101000000", "A", "http://example.com/a")]);
        assert_eq!(cap(set.clone(), 0), set);
        assert_eq!(cap(set.clone(), 5), set);
    }

    #[test]
    fn test_cap_ties_keep_insertion_order() {
        let set: FilteredSet = ["d1", "d2", "d3"]
            .iter()
            .map(|d| (d.to_string(), CanonicalRecord { url: format!("e.com/{}", d), timestamp: "1".to_string() }))
            .collect();
        let kept: Vec<_> = cap(set, 2).iter().map(|(d, _)| d.clone()).collect();
        assert_eq!(kept, vec!["d1", "d2"]);
    }

    #[test]
    fn test_effective_cap() {
        assert_eq!(effective_cap(Some(5), 1000), 5);
        assert_eq!(effective_cap(Some(0), 1000), 1000);
        assert_eq!(effective_cap(None, 0), 0);
    }

    #[test]
    fn test_from_row_requires_four_columns() {
        let row: Vec<String> = ["k", "20200101000000", "D", "http://e.com/"].iter().map(|s| s.to_string()).collect();
        assert!(RawSnapshotRecord::from_row(&row).is_some());
        assert!(RawSnapshotRecord::from_row(&row[..3]).is_none());
    }
}
