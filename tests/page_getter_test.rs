mod common;

use harvest::config::SaveFormats;
use harvest::local::{self, HarvestRecord};
use harvest::pages::{self, PageGetter, PageOptions};
use indexmap::IndexMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const PAGE: &str = r#"<html><body><style>p { color: red }</style><p>Fresh bread</p>
<a href="http://web.archive.org/web/20200101000000/https://partner.org/">Partner</a>
<a href="http://web.archive.org/web/20200101000000/https://partner.org/">Partner again</a>
<a href="/contact">Contact</a></body></html>"#;

async fn archive(hits: Arc<AtomicUsize>) -> String {
    common::spawn_server(move |target| {
        hits.fetch_add(1, Ordering::SeqCst);
        if target.ends_with("/gone") {
            return Some((404, String::new()));
        }
        Some((200, PAGE.to_string()))
    })
    .await
}

fn site(url: &str, snapshots: &[(&str, &str, &str)]) -> HarvestRecord {
    let mut urls = IndexMap::new();
    for (digest, page, timestamp) in snapshots {
        urls.insert(digest.to_string(), (page.to_string(), timestamp.to_string()));
    }
    HarvestRecord { domain: url.to_string(), url: url.to_string(), from: 2020, to: 2024, urls }
}

fn options(folder: &Path, base: &str) -> PageOptions {
    PageOptions {
        output_folder: folder.to_path_buf(),
        archive_base: format!("{}/web", base),
        formats: SaveFormats::default(),
        request_delay: Duration::ZERO,
    }
}

#[tokio::test]
async fn test_pages_written_per_site() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base = archive(hits.clone()).await;
    let dir = tempfile::tempdir().unwrap();

    let input = dir.path().join("ia-urls.json");
    let records = vec![site(
        "a.com",
        &[("D1", "a.com/", "20200101000000"), ("D2", "a.com/gone", "20210101000000")],
    )];
    std::fs::write(&input, serde_json::to_vec(&records).unwrap()).unwrap();

    let folder = dir.path().join("pages");
    let mut getter = PageGetter::new(options(&folder, &base), 5).await.unwrap();
    let summary = getter.run(&local::read_records(&input).await.unwrap()).await.unwrap();

    assert_eq!(summary.sites, 1);
    assert_eq!(summary.pages, 1);
    assert_eq!(summary.failed_pages, 1);

    let written = pages::read_pages(&folder.join("ia-webscrape-data--a_com.json")).await.unwrap();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].timestamp, "20200101000000");
    assert_eq!(written[0].ia_url, format!("{}/web/20200101000000/a.com/", base));
    assert_eq!(written[0].text, "Fresh bread\nPartner\nPartner again\nContact");
    assert_eq!(written[0].links, vec!["https://partner.org/".to_string()]);

    assert_eq!(std::fs::read_to_string(folder.join(".pages")).unwrap(), "a.com\n");
}

#[tokio::test]
async fn test_rerun_skips_fetched_sites() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base = archive(hits.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let folder = dir.path().to_path_buf();

    let first = vec![site("a.com", &[("D1", "a.com/", "20200101000000")])];
    let mut getter = PageGetter::new(options(&folder, &base), 5).await.unwrap();
    getter.run(&first).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let second = vec![
        site("a.com", &[("D1", "a.com/", "20200101000000")]),
        site("b.com", &[("D9", "b.com/", "20220101000000")]),
    ];
    let mut again = PageGetter::new(options(&folder, &base), 5).await.unwrap();
    let summary = again.run(&second).await.unwrap();

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.sites, 1);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert!(folder.join("ia-webscrape-data--b_com.json").is_file());
    assert_eq!(std::fs::read_to_string(folder.join(".pages")).unwrap(), "a.com\nb.com\n");
}
