use std::fmt;

#[derive(Debug)]
pub enum HarvestError {
    Http(String),
    Api { status: u16, domain: String },
    InvalidUrl(String),
    Queue(String),
    Stream(String),
    Storage(String),
    Config(String),
    Serialization(serde_json::Error),
    Io(std::io::Error),
    Other(String),
}

impl fmt::Display for HarvestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HarvestError::Http(e) => write!(f, "HTTP error: {}", e),
            HarvestError::Api { status, domain } => {
                write!(f, "API returned http-status {} for {}", status, domain)
            }
            HarvestError::InvalidUrl(e) => write!(f, "Not a valid url: {}", e),
            HarvestError::Queue(e) => write!(f, "Queue error: {}", e),
            HarvestError::Stream(e) => write!(f, "Delivery stream error: {}", e),
            HarvestError::Storage(e) => write!(f, "Storage error: {}", e),
            HarvestError::Config(e) => write!(f, "Config error: {}", e),
            HarvestError::Serialization(e) => write!(f, "Serialization error: {}", e),
            HarvestError::Io(e) => write!(f, "IO error: {}", e),
            HarvestError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for HarvestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HarvestError::Serialization(e) => Some(e),
            HarvestError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for HarvestError {
    fn from(err: serde_json::Error) -> Self {
        HarvestError::Serialization(err)
    }
}

impl From<std::io::Error> for HarvestError {
    fn from(err: std::io::Error) -> Self {
        HarvestError::Io(err)
    }
}

impl From<reqwest::Error> for HarvestError {
    fn from(err: reqwest::Error) -> Self {
        HarvestError::Http(err.to_string())
    }
}

impl From<url::ParseError> for HarvestError {
    fn from(err: url::ParseError) -> Self {
        HarvestError::InvalidUrl(err.to_string())
    }
}

impl From<String> for HarvestError {
    fn from(err: String) -> Self {
        HarvestError::Other(err)
    }
}

impl From<&str> for HarvestError {
    fn from(err: &str) -> Self {
        HarvestError::Other(err.to_string())
    }
}
