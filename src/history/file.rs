use async_trait::async_trait;
use log::warn;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{ Path, PathBuf };
use tokio::sync::Mutex;

use crate::error::ChatError;
use crate::history::SettingsStore;

/// Settings kept as one JSON object of string entries on disk.
///
/// Every write rewrites the whole file through a temporary sibling and a
/// rename, so a crash mid-write leaves the previous file intact.
pub struct FileSettingsStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSettingsStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_entries(&self) -> Result<BTreeMap<String, String>, ChatError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(BTreeMap::new());
            }
            Err(e) => {
                return Err(
                    ChatError::Persistence(format!("Failed to read {}: {}", self.path.display(), e))
                );
            }
        };
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&raw).map_err(|e|
            ChatError::Persistence(format!("Settings file {} is corrupt: {}", self.path.display(), e))
        )
    }

    async fn write_entries(&self, entries: &BTreeMap<String, String>) -> Result<(), ChatError> {
        let json = serde_json::to_string_pretty(entries).map_err(|e|
            ChatError::Persistence(format!("Failed to encode settings: {}", e))
        )?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e|
                ChatError::Persistence(format!("Failed to create {}: {}", parent.display(), e))
            )?;
        }

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await.map_err(|e|
            ChatError::Persistence(format!("Failed to write {}: {}", tmp.display(), e))
        )?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e|
            ChatError::Persistence(format!("Failed to replace {}: {}", self.path.display(), e))
        )
    }
}

#[async_trait]
impl SettingsStore for FileSettingsStore {
    async fn get(&self, key: &str) -> Result<Option<String>, ChatError> {
        let entries = self.read_entries().await?;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ChatError> {
        let _guard = self.write_lock.lock().await;
        let mut entries = match self.read_entries().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Starting a fresh settings file: {}", e);
                BTreeMap::new()
            }
        };
        entries.insert(key.to_string(), value.to_string());
        self.write_entries(&entries).await
    }
}
