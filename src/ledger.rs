use crate::HarvestError;
use async_trait::async_trait;
use rustc_hash::FxHashSet;
use std::path::{Path, PathBuf};

/// Backing store for the ledger: the whole key list is read and written at once.
#[async_trait]
pub trait LedgerStorage: Send + Sync {
    /// Current contents; a missing ledger reads as empty.
    async fn read(&self) -> Result<String, HarvestError>;
    async fn write(&self, contents: &str) -> Result<(), HarvestError>;
}

pub struct FileLedgerStorage {
    path: PathBuf,
}

impl FileLedgerStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LedgerStorage for FileLedgerStorage {
    async fn read(&self) -> Result<String, HarvestError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(HarvestError::Io(e)),
        }
    }

    async fn write(&self, contents: &str) -> Result<(), HarvestError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write beside the ledger, then swap it in.
        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, contents).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

/// Where a ledger is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerLocation {
    File(PathBuf),
    /// Object `name` under the configured bucket prefix.
    Bucket(String),
}

/// Keys already resolved for one output target.
///
/// Single writer only: `store` is a read-modify-write of the whole ledger.
pub struct RetentionLedger {
    storage: Box<dyn LedgerStorage>,
    keys: FxHashSet<String>,
}

impl RetentionLedger {
    pub async fn open(storage: Box<dyn LedgerStorage>) -> Result<Self, HarvestError> {
        let keys = parse_keys(&storage.read().await?);
        tracing::debug!(keys = keys.len(), "ledger loaded");
        Ok(Self { storage, keys })
    }

    pub async fn open_file(path: impl Into<PathBuf>) -> Result<Self, HarvestError> {
        Self::open(Box::new(FileLedgerStorage::new(path))).await
    }

    pub async fn open_at(location: &LedgerLocation) -> Result<Self, HarvestError> {
        match location {
            LedgerLocation::File(path) => Self::open_file(path.clone()).await,
            LedgerLocation::Bucket(name) => open_bucket(name).await,
        }
    }

    pub fn exists(&self, key: &str) -> bool {
        self.keys.contains(key.trim())
    }

    /// Re-reads storage, adds `key` and rewrites the full deduplicated set.
    pub async fn store(&mut self, key: &str) -> Result<(), HarvestError> {
        let key = key.trim();
        if key.is_empty() {
            return Err(HarvestError::Other("ledger key is empty".to_string()));
        }

        let on_disk = parse_keys(&self.storage.read().await?);
        self.keys.extend(on_disk);
        self.keys.insert(key.to_string());

        let mut sorted: Vec<&String> = self.keys.iter().collect();
        sorted.sort();
        let mut contents = String::new();
        for k in sorted {
            contents.push_str(k);
            contents.push('\n');
        }
        self.storage.write(&contents).await
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(feature = "distributed")]
async fn open_bucket(name: &str) -> Result<RetentionLedger, HarvestError> {
    let storage = crate::aws::S3LedgerStorage::from_env(name).await?;
    RetentionLedger::open(Box::new(storage)).await
}

#[cfg(not(feature = "distributed"))]
async fn open_bucket(name: &str) -> Result<RetentionLedger, HarvestError> {
    Err(HarvestError::Config(format!(
        "ledger {} is kept in a bucket; build with the distributed feature",
        name
    )))
}

fn parse_keys(contents: &str) -> FxHashSet<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedStorage {
        contents: Arc<Mutex<String>>,
    }

    #[async_trait]
    impl LedgerStorage for SharedStorage {
        async fn read(&self) -> Result<String, HarvestError> {
            Ok(self.contents.lock().unwrap().clone())
        }

        async fn write(&self, contents: &str) -> Result<(), HarvestError> {
            *self.contents.lock().unwrap() = contents.to_string();
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_open_over_any_storage() {
        let storage = SharedStorage::default();
        *storage.contents.lock().unwrap() = "x.com\n".to_string();

        let mut ledger = RetentionLedger::open(Box::new(storage.clone())).await.unwrap();
        assert!(ledger.exists("x.com"));
        ledger.store("y.com").await.unwrap();
        assert_eq!(*storage.contents.lock().unwrap(), "x.com\ny.com\n");
    }

    #[tokio::test]
    async fn test_open_at_file_location() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".pages");
        std::fs::write(&path, "a.com\n").unwrap();
        let ledger = RetentionLedger::open_at(&LedgerLocation::File(path)).await.unwrap();
        assert!(ledger.exists("a.com"));
    }

    #[cfg(not(feature = "distributed"))]
    #[tokio::test]
    async fn test_bucket_location_needs_distributed_build() {
        let opened = RetentionLedger::open_at(&LedgerLocation::Bucket(".sites".to_string())).await;
        assert!(matches!(opened, Err(HarvestError::Config(_))));
    }

    #[tokio::test]
    async fn test_store_then_exists_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".sites");

        let mut ledger = RetentionLedger::open_file(&path).await.unwrap();
        assert!(ledger.is_empty());
        ledger.store("a.com").await.unwrap();
        assert!(ledger.exists("a.com"));

        let reloaded = RetentionLedger::open_file(&path).await.unwrap();
        assert!(reloaded.exists("a.com"));
        assert!(!reloaded.exists("b.com"));
    }

    #[tokio::test]
    async fn test_store_merges_external_edits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".sites");

        let mut ledger = RetentionLedger::open_file(&path).await.unwrap();
        ledger.store("a.com").await.unwrap();
        std::fs::write(&path, "a.com\nz.com\n").unwrap();

        ledger.store("b.com").await.unwrap();
        assert!(ledger.exists("z.com"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a.com\nb.com\nz.com\n");
    }

    #[tokio::test]
    async fn test_duplicate_store_writes_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".sites");
        let mut ledger = RetentionLedger::open_file(&path).await.unwrap();
        ledger.store("a.com").await.unwrap();
        ledger.store(" a.com ").await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a.com\n");
    }

    #[tokio::test]
    async fn test_empty_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = RetentionLedger::open_file(dir.path().join(".sites")).await.unwrap();
        assert!(ledger.store("  ").await.is_err());
    }
}
