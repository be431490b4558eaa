//! Bookkeeping of which catalog entry each download represents.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::torrent::InfoHash;

/// Whether a record still describes an active download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Active,
    /// Swept into the library; kept for history and resume lookups
    Removed,
}

/// Catalog entry kind a download belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Movie,
    Show,
    Season,
    Episode,
}

impl ContentType {
    pub fn is_show(self) -> bool {
        !matches!(self, ContentType::Movie)
    }
}

/// Persisted link between an info-hash and catalog content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub state: RecordState,
    pub catalog_id: String,
    pub content_type: ContentType,
    pub file_index: usize,
    pub show_id: Option<String>,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    /// Movie or show title, used for library folder names
    pub title: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl DownloadRecord {
    pub fn movie(catalog_id: impl Into<String>, file_index: usize) -> Self {
        Self {
            state: RecordState::Active,
            catalog_id: catalog_id.into(),
            content_type: ContentType::Movie,
            file_index,
            show_id: None,
            season: None,
            episode: None,
            title: None,
            updated_at: Utc::now(),
        }
    }

    pub fn episode(
        catalog_id: impl Into<String>,
        show_id: impl Into<String>,
        season: u32,
        episode: u32,
        file_index: usize,
    ) -> Self {
        Self {
            state: RecordState::Active,
            catalog_id: catalog_id.into(),
            content_type: ContentType::Episode,
            file_index,
            show_id: Some(show_id.into()),
            season: Some(season),
            episode: Some(episode),
            title: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn is_active(&self) -> bool {
        self.state == RecordState::Active
    }
}

/// Errors raised by record stores.
#[derive(Debug, thiserror::Error)]
pub enum RecordStoreError {
    #[error("Record for {info_hash} is corrupt: {reason}")]
    Corrupt { info_hash: InfoHash, reason: String },

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

/// Small keyed store used only through get, set, delete and list.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// # Errors
    ///
    /// - `RecordStoreError::Corrupt` - Stored data cannot be decoded
    /// - `RecordStoreError::Io` - Backend read failed
    async fn get(&self, info_hash: InfoHash) -> Result<Option<DownloadRecord>, RecordStoreError>;

    /// # Errors
    ///
    /// - `RecordStoreError::Io` - Backend write failed
    async fn set(&self, info_hash: InfoHash, record: DownloadRecord)
    -> Result<(), RecordStoreError>;

    /// Deleting a missing record is not an error.
    ///
    /// # Errors
    ///
    /// - `RecordStoreError::Io` - Backend write failed
    async fn delete(&self, info_hash: InfoHash) -> Result<(), RecordStoreError>;

    /// # Errors
    ///
    /// - `RecordStoreError::Io` - Backend read failed
    async fn list(&self) -> Result<Vec<(InfoHash, DownloadRecord)>, RecordStoreError>;
}

/// Reads a record, logging failures and treating them as absent.
pub async fn lookup_record(store: &dyn RecordStore, info_hash: InfoHash) -> Option<DownloadRecord> {
    match store.get(info_hash).await {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!("Failed to read record for {}: {}", info_hash, e);
            None
        }
    }
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<InfoHash, DownloadRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, info_hash: InfoHash) -> Result<Option<DownloadRecord>, RecordStoreError> {
        Ok(self.records.read().get(&info_hash).cloned())
    }

    async fn set(
        &self,
        info_hash: InfoHash,
        record: DownloadRecord,
    ) -> Result<(), RecordStoreError> {
        self.records.write().insert(info_hash, record);
        Ok(())
    }

    async fn delete(&self, info_hash: InfoHash) -> Result<(), RecordStoreError> {
        self.records.write().remove(&info_hash);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<(InfoHash, DownloadRecord)>, RecordStoreError> {
        Ok(self
            .records
            .read()
            .iter()
            .map(|(hash, record)| (*hash, record.clone()))
            .collect())
    }
}

/// One JSON document per info-hash under a directory.
#[derive(Debug, Clone)]
pub struct JsonRecordStore {
    dir: PathBuf,
}

impl JsonRecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, info_hash: InfoHash) -> PathBuf {
        self.dir.join(format!("{info_hash}.json"))
    }
}

#[async_trait]
impl RecordStore for JsonRecordStore {
    async fn get(&self, info_hash: InfoHash) -> Result<Option<DownloadRecord>, RecordStoreError> {
        let bytes = match tokio::fs::read(self.path_for(info_hash)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| RecordStoreError::Corrupt {
                info_hash,
                reason: e.to_string(),
            })
    }

    async fn set(
        &self,
        info_hash: InfoHash,
        record: DownloadRecord,
    ) -> Result<(), RecordStoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_vec_pretty(&record).map_err(|e| RecordStoreError::Corrupt {
            info_hash,
            reason: e.to_string(),
        })?;

        // Write-then-rename so a crash never leaves a truncated document.
        let path = self.path_for(info_hash);
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, json).await?;
        tokio::fs::rename(&staging, &path).await?;
        Ok(())
    }

    async fn delete(&self, info_hash: InfoHash) -> Result<(), RecordStoreError> {
        match tokio::fs::remove_file(self.path_for(info_hash)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<(InfoHash, DownloadRecord)>, RecordStoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(info_hash) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<InfoHash>().ok())
            else {
                continue;
            };
            match self.get(info_hash).await {
                Ok(Some(record)) => records.push((info_hash, record)),
                Ok(None) => {}
                Err(e) => tracing::warn!("Skipping unreadable record {}: {}", path.display(), e),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn hash(byte: u8) -> InfoHash {
        InfoHash::new([byte; 20])
    }

    #[tokio::test]
    async fn test_memory_store_verbs() {
        let store = MemoryRecordStore::new();
        assert!(store.get(hash(1)).await.unwrap().is_none());

        store
            .set(hash(1), DownloadRecord::movie("tt0111161", 0))
            .await
            .unwrap();
        let record = store.get(hash(1)).await.unwrap().unwrap();
        assert_eq!(record.catalog_id, "tt0111161");
        assert!(record.is_active());

        store.delete(hash(1)).await.unwrap();
        store.delete(hash(1)).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_json_store_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        let record = DownloadRecord::episode("ep-42", "show-7", 1, 2, 3).with_title("Show");

        JsonRecordStore::new(dir.path())
            .set(hash(2), record.clone())
            .await
            .unwrap();

        let reopened = JsonRecordStore::new(dir.path());
        assert_eq!(reopened.get(hash(2)).await.unwrap(), Some(record));
        assert_eq!(reopened.list().await.unwrap().len(), 1);

        reopened.delete(hash(2)).await.unwrap();
        assert!(reopened.get(hash(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_json_store_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonRecordStore::new(dir.path().join("absent"));
        assert!(store.list().await.unwrap().is_empty());
        assert!(store.get(hash(3)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_record_reported_and_lookup_absorbs_it() {
        let dir = TempDir::new().unwrap();
        let store = JsonRecordStore::new(dir.path());
        std::fs::write(dir.path().join(format!("{}.json", hash(4))), b"{not json").unwrap();

        assert!(matches!(
            store.get(hash(4)).await,
            Err(RecordStoreError::Corrupt { .. })
        ));
        assert!(lookup_record(&store, hash(4)).await.is_none());
    }
}
