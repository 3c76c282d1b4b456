//! JSON state file for scheduler and group pointers

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, error};

use switchyard_core::{ChannelPointerRecord, Error, GroupPointerRecord, PointerStore, Result};

/// Contents of the state file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointerStateFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelPointerRecord>,
    #[serde(default)]
    pub groups: BTreeMap<i64, GroupPointerRecord>,
}

/// `PointerStore` backed by a single JSON file.
///
/// The file is read on first access and rewritten in full on every upsert,
/// through a sibling `.tmp` file renamed over the original.
#[derive(Debug)]
pub struct JsonPointerStore {
    path: PathBuf,
    state: Mutex<Option<PointerStateFile>>,
}

impl JsonPointerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file contents, loading them if needed
    pub async fn snapshot(&self) -> Result<PointerStateFile> {
        let mut guard = self.state.lock().await;
        Ok(self.loaded(&mut guard).await?.clone())
    }

    async fn loaded<'a>(
        &self,
        slot: &'a mut Option<PointerStateFile>,
    ) -> Result<&'a mut PointerStateFile> {
        if slot.is_none() {
            *slot = Some(self.read_file().await?);
        }
        // Filled above
        Ok(slot.get_or_insert_with(PointerStateFile::default))
    }

    async fn read_file(&self) -> Result<PointerStateFile> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = ?self.path, "No pointer state file yet");
                return Ok(PointerStateFile::default());
            }
            Err(e) => {
                error!("Failed to read pointer state {:?}: {}", self.path, e);
                return Err(Error::Io(e));
            }
        };
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(PointerStateFile::default());
        }
        serde_json::from_slice(&bytes).map_err(|e| {
            error!("Corrupt pointer state {:?}: {}", self.path, e);
            Error::Serialization(e)
        })
    }

    async fn write_file(&self, state: &PointerStateFile) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let data = serde_json::to_vec_pretty(state)?;
        let temp_path = temp_path(&self.path);
        tokio::fs::write(&temp_path, &data).await?;
        if let Err(e) = tokio::fs::rename(&temp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            error!("Failed to replace pointer state {:?}: {}", self.path, e);
            return Err(Error::Io(e));
        }
        debug!(path = ?self.path, bytes = data.len(), "Wrote pointer state");
        Ok(())
    }
}

fn temp_path(final_path: &Path) -> PathBuf {
    let mut temp = final_path.as_os_str().to_owned();
    temp.push(".tmp");
    PathBuf::from(temp)
}

#[async_trait]
impl PointerStore for JsonPointerStore {
    async fn get_channel_pointer(&self) -> Result<Option<ChannelPointerRecord>> {
        let mut guard = self.state.lock().await;
        Ok(self.loaded(&mut guard).await?.channel.clone())
    }

    async fn upsert_channel_pointer(&self, record: &ChannelPointerRecord) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = self.loaded(&mut guard).await?;
        let mut next = state.clone();
        next.channel = Some(record.clone());
        self.write_file(&next).await?;
        *state = next;
        Ok(())
    }

    async fn get_group_pointer(&self, group_id: i64) -> Result<Option<GroupPointerRecord>> {
        let mut guard = self.state.lock().await;
        Ok(self.loaded(&mut guard).await?.groups.get(&group_id).cloned())
    }

    async fn upsert_group_pointer(&self, record: &GroupPointerRecord) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = self.loaded(&mut guard).await?;
        let mut next = state.clone();
        next.groups.insert(record.group_id, record.clone());
        self.write_file(&next).await?;
        *state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::{POINTER_RECORD_VERSION, PointerReason};
    use tempfile::TempDir;

    fn channel_record(channel_id: i64, pinned: bool) -> ChannelPointerRecord {
        ChannelPointerRecord {
            v: POINTER_RECORD_VERSION,
            channel_id,
            pinned,
            moved_at_unix_ms: 1_700_000_000_000,
            reason: PointerReason::Manual,
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonPointerStore::new(dir.path().join("pointers.json"));

        assert!(store.get_channel_pointer().await.unwrap().is_none());
        assert!(store.get_group_pointer(1).await.unwrap().is_none());
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_upsert_creates_parent_dirs_and_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("nested").join("pointers.json");
        let store = JsonPointerStore::new(&path);

        store.upsert_channel_pointer(&channel_record(7, true)).await.unwrap();

        assert!(path.exists());
        assert!(!temp_path(&path).exists());
        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["channel"]["channel_id"], 7);
        assert_eq!(value["channel"]["pinned"], true);
        assert_eq!(value["channel"]["reason"], "manual");
    }

    #[tokio::test]
    async fn test_group_upsert_keeps_channel_pointer() {
        let dir = TempDir::new().unwrap();
        let store = JsonPointerStore::new(dir.path().join("pointers.json"));
        store.upsert_channel_pointer(&channel_record(3, false)).await.unwrap();

        let group = GroupPointerRecord {
            group_id: 9,
            channel_id: 4,
            pinned: true,
            moved_at_unix_ms: 5,
            reason: PointerReason::Ban,
        };
        store.upsert_group_pointer(&group).await.unwrap();

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.channel.unwrap().channel_id, 3);
        assert_eq!(snapshot.groups.get(&9), Some(&group));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_serialization_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pointers.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = JsonPointerStore::new(&path);

        let result = store.get_channel_pointer().await;
        assert!(matches!(result, Err(Error::Serialization(_))));
    }

    #[tokio::test]
    async fn test_blank_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pointers.json");
        std::fs::write(&path, "\n").unwrap();
        let store = JsonPointerStore::new(&path);

        assert!(store.get_channel_pointer().await.unwrap().is_none());
    }
}
