use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

static NOISE_BLOCKS: Lazy<Vec<Regex>> = Lazy::new(|| {
    ["svg", "script", "style"]
        .iter()
        .map(|tag| Regex::new(&format!(r"(?i)<{tag}[\s\S]+?/{tag}>")).expect("noise block pattern"))
        .collect()
});

static ARCHIVE_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^https?://web\.archive\.org/web/\d+/").expect("archive prefix pattern"));

static ARCHIVED_SCHEME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?:https?://)?").expect("scheme pattern"));

static ANCHORS: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").expect("anchor selector"));

/// Drops `<svg>`, `<script>` and `<style>` blocks.
pub fn clean_html(html: &str) -> String {
    NOISE_BLOCKS
        .iter()
        .fold(html.to_string(), |acc, re| re.replace_all(&acc, "").into_owned())
}

/// Strips the archive's `http(s)://web.archive.org/web/<digits>/` prefix.
///
/// With `keep_archived_scheme` false the scheme of the archived URL goes too.
pub fn remove_archive_prefix(url: &str, keep_archived_scheme: bool) -> String {
    let stripped = ARCHIVE_PREFIX.replace(url, "");
    if keep_archived_scheme {
        stripped.into_owned()
    } else {
        ARCHIVED_SCHEME.replace(&stripped, "").into_owned()
    }
}

/// Visible text, one stripped text node per line.
pub fn page_text(document: &Html) -> String {
    document
        .root_element()
        .text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Absolute outbound links with archive prefixes removed, one per line.
pub fn page_links(document: &Html) -> String {
    document
        .select(&ANCHORS)
        .filter_map(|a| a.value().attr("href"))
        .map(|href| remove_archive_prefix(href.trim(), true))
        .filter(|link| has_host(link))
        .collect::<Vec<_>>()
        .join("\n")
}

fn has_host(link: &str) -> bool {
    if link.starts_with("//") {
        return link.len() > 2;
    }
    Url::parse(link)
        .ok()
        .and_then(|u| u.host_str().map(|h| !h.is_empty()))
        .unwrap_or(false)
}

/// Page body as UTF-8, replacing invalid sequences.
pub fn decode_body(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(body) => body.to_string(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Text and links of a page body, each empty when not requested or not found.
pub fn extract(body: &str, want_text: bool, want_links: bool) -> (String, String) {
    if !want_text && !want_links {
        return (String::new(), String::new());
    }
    let document = Html::parse_document(&clean_html(body));
    let text = if want_text { page_text(&document) } else { String::new() };
    let links = if want_links { page_links(&document) } else { String::new() };
    (text, links)
}
