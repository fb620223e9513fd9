use crate::queue::OutboundMessage;
use crate::HarvestError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use url::Url;

pub const ATTR_JOB_TAG: &str = "JobTag";
pub const ATTR_YEAR_WINDOW: &str = "YearWindow";
pub const ATTR_FIRST_STAGE_ONLY: &str = "FirstStageOnly";
pub const ATTR_URL_CAP: &str = "UrlCap";
pub const ATTR_AUTHOR: &str = "Author";

const MAX_JOB_TAG_LEN: usize = 32;
const SEED_DELAY_SECS: u32 = 5;

static JOB_TAG_DISALLOWED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-zA-Z0-9!._*'()#-]").expect("job tag pattern"));

/// A message as it comes off a queue: body plus string attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: String,
    pub receipt_token: String,
    pub body: String,
    pub attributes: HashMap<String, String>,
}

impl QueueMessage {
    pub fn new(message_id: &str, receipt_token: &str, body: &str) -> Self {
        Self {
            message_id: message_id.to_string(),
            receipt_token: receipt_token.to_string(),
            body: body.to_string(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.attributes.insert(name.to_string(), value.to_string());
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn receipt(&self) -> Receipt {
        Receipt {
            message_id: self.message_id.clone(),
            receipt_token: self.receipt_token.clone(),
        }
    }
}

/// Handle needed to delete a received message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Receipt {
    pub message_id: String,
    pub receipt_token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YearWindow {
    pub from: u32,
    pub to: u32,
}

impl YearWindow {
    /// Parses `"<from>:<to>"`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (from, to) = raw.trim().split_once(':')?;
        Some(Self {
            from: from.trim().parse().ok()?,
            to: to.trim().parse().ok()?,
        })
    }

    pub fn to_attribute(&self) -> String {
        format!("{}:{}", self.from, self.to)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainJob {
    pub domain: String,
    pub job_tag: String,
    pub year_window: Option<YearWindow>,
    pub url_cap: Option<usize>,
    pub first_stage_only: bool,
    pub source_message_id: String,
    pub source_receipt_token: String,
}

impl DomainJob {
    pub fn from_message(message: &QueueMessage) -> Result<Self, HarvestError> {
        let domain = domain_of(&message.body)?;

        let year_window = match message.attribute(ATTR_YEAR_WINDOW) {
            Some(raw) => {
                let parsed = YearWindow::parse(raw);
                if parsed.is_none() {
                    tracing::warn!(domain = %domain, value = raw, "ignoring malformed YearWindow attribute");
                }
                parsed
            }
            None => None,
        };

        let url_cap = match message.attribute(ATTR_URL_CAP) {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(cap) => Some(cap),
                Err(_) => {
                    tracing::warn!(domain = %domain, value = raw, "ignoring malformed UrlCap attribute");
                    None
                }
            },
            None => None,
        };

        Ok(Self {
            domain,
            job_tag: message.attribute(ATTR_JOB_TAG).unwrap_or_default().to_string(),
            year_window,
            url_cap,
            first_stage_only: message.attribute(ATTR_FIRST_STAGE_ONLY) == Some("y"),
            source_message_id: message.message_id.clone(),
            source_receipt_token: message.receipt_token.clone(),
        })
    }

    pub fn receipt(&self) -> Receipt {
        Receipt {
            message_id: self.source_message_id.clone(),
            receipt_token: self.source_receipt_token.clone(),
        }
    }

    /// The job's own window, or the configured one.
    pub fn effective_window(&self, default_from: u32, default_to: u32) -> YearWindow {
        self.year_window.unwrap_or(YearWindow { from: default_from, to: default_to })
    }
}

/// Host of a domain or URL string with any leading `www.` removed.
pub fn domain_of(raw: &str) -> Result<String, HarvestError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(HarvestError::InvalidUrl("empty message body".to_string()));
    }

    let parsed = if trimmed.contains("://") {
        Url::parse(trimmed)?
    } else {
        Url::parse(&format!("https://{}", trimmed))?
    };

    let host = parsed
        .host_str()
        .ok_or_else(|| HarvestError::InvalidUrl(format!("no host in {:?}", trimmed)))?;
    let host = host.strip_prefix("www.").unwrap_or(host);

    Ok(match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

pub fn clean_job_tag(raw: &str) -> String {
    JOB_TAG_DISALLOWED
        .replace_all(raw, "-")
        .chars()
        .take(MAX_JOB_TAG_LEN)
        .collect()
}

/// Tag used when the operator does not supply one: `YYYY.MM.DD-HH.MM`.
pub fn generated_job_tag() -> String {
    chrono::Local::now().format("%Y.%m.%d-%H.%M").to_string()
}

/// Attributes stamped on every seeded job message.
#[derive(Debug, Clone)]
pub struct SeedOptions {
    pub author: String,
    pub job_tag: String,
    pub first_stage_only: bool,
    pub year_window: Option<YearWindow>,
}

/// One job message per non-empty line, ids numbered by line.
pub fn seed_messages(contents: &str, options: &SeedOptions) -> Vec<OutboundMessage> {
    contents
        .lines()
        .map(str::trim)
        .enumerate()
        .filter(|(_, line)| !line.is_empty())
        .map(|(index, line)| {
            let mut attributes = vec![
                (ATTR_AUTHOR.to_string(), options.author.clone()),
                (ATTR_JOB_TAG.to_string(), options.job_tag.clone()),
                (
                    ATTR_FIRST_STAGE_ONLY.to_string(),
                    if options.first_stage_only { "y" } else { "n" }.to_string(),
                ),
            ];
            if let Some(window) = options.year_window {
                attributes.push((ATTR_YEAR_WINDOW.to_string(), window.to_attribute()));
            }
            OutboundMessage {
                id: index.to_string(),
                body: line.to_string(),
                delay_secs: SEED_DELAY_SECS,
                attributes,
            }
        })
        .collect()
}
