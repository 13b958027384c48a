//! Expiry metadata for records written by this service.
//!
//! Each successful update can leave an [`ExpiryRecord`] behind; the
//! [`sweeper`](crate::sweeper) deletes records whose expiry has passed.

use crate::addr::RecordType;
use crate::config::ExpiryConfig;
use crate::error::{DdnsError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;

/// Store file format version.
const STORE_FILE_VERSION: &str = "1.0";

/// Expiry metadata for one record name and type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryRecord {
    /// Record name without trailing dot.
    pub name: String,
    /// Zone the record was authenticated against, possibly empty.
    pub zone: String,
    pub record_type: RecordType,
    pub value: String,
    pub ttl: u32,
    pub created: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
}

impl ExpiryRecord {
    /// Store key for a record name and type.
    pub fn key_for(name: &str, record_type: RecordType) -> String {
        format!("{}/{}", name, record_type)
    }

    pub fn key(&self) -> String {
        Self::key_for(&self.name, self.record_type)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry < now
    }
}

/// Keyed storage of expiry metadata.
///
/// Implementations must be safe to call concurrently from request handlers
/// and the sweeper.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExpiryStore: Send + Sync {
    /// Create or replace the record under its key.
    async fn put(&self, record: ExpiryRecord) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<ExpiryRecord>>;

    /// Remove a record. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Snapshot of every stored record.
    async fn list(&self) -> Result<Vec<ExpiryRecord>>;
}

/// Open the store configured in `config`, if expiry tracking is enabled.
pub async fn open_store(config: &ExpiryConfig) -> Result<Option<Arc<dyn ExpiryStore>>> {
    if config.record_expiry_secs.is_none() {
        return Ok(None);
    }
    let store: Arc<dyn ExpiryStore> = match &config.store_path {
        Some(path) => Arc::new(FileExpiryStore::open(path).await?),
        None => Arc::new(MemoryExpiryStore::new()),
    };
    Ok(Some(store))
}

/// In-memory expiry store. Nothing survives a restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryExpiryStore {
    inner: Arc<RwLock<HashMap<String, ExpiryRecord>>>,
}

impl MemoryExpiryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[async_trait]
impl ExpiryStore for MemoryExpiryStore {
    async fn put(&self, record: ExpiryRecord) -> Result<()> {
        self.inner.write().await.insert(record.key(), record);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<ExpiryRecord>> {
        Ok(self.inner.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.write().await.remove(key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ExpiryRecord>> {
        Ok(self.inner.read().await.values().cloned().collect())
    }
}

/// Serializable store file format.
#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: String,
    records: HashMap<String, ExpiryRecord>,
}

/// JSON file backed expiry store.
///
/// The whole map is kept in memory and rewritten on every change through a
/// temporary file and a rename.
#[derive(Debug)]
pub struct FileExpiryStore {
    path: PathBuf,
    records: RwLock<HashMap<String, ExpiryRecord>>,
}

impl FileExpiryStore {
    /// Open the store at `path`, creating parent directories as needed. A
    /// missing file starts an empty store; a corrupt one is an error.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    DdnsError::Store(format!(
                        "Failed to create store directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let records = match fs::read_to_string(&path).await {
            Ok(content) => {
                let file: StoreFile = serde_json::from_str(&content).map_err(|e| {
                    DdnsError::Store(format!("Corrupt store file {}: {}", path.display(), e))
                })?;
                tracing::debug!("Loaded {} expiry records from {}", file.records.len(), path.display());
                file.records
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, records: &HashMap<String, ExpiryRecord>) -> Result<()> {
        let file = StoreFile {
            version: STORE_FILE_VERSION.to_string(),
            records: records.clone(),
        };
        let content = serde_json::to_string_pretty(&file)?;

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl ExpiryStore for FileExpiryStore {
    async fn put(&self, record: ExpiryRecord) -> Result<()> {
        let mut records = self.records.write().await;
        records.insert(record.key(), record);
        self.persist(&records).await
    }

    async fn get(&self, key: &str) -> Result<Option<ExpiryRecord>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut records = self.records.write().await;
        if records.remove(key).is_some() {
            self.persist(&records).await?;
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ExpiryRecord>> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}
