use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use error_stack::ResultExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::ports::{CursorStore, CursorStoreError};

/// Cursor store backed by a single JSON object on disk (`{"<key>": <height>, ...}`). Writes go to
/// a sibling temporary file first and are renamed into place, so a crash never leaves a
/// truncated file behind.
#[derive(Debug)]
pub struct JsonFileCursorStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileCursorStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    async fn read_all(&self) -> error_stack::Result<BTreeMap<String, u64>, CursorStoreError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(error_stack::Report::new(e)
                    .change_context(CursorStoreError::ReadError)
                    .attach_printable(format!("Path: {}", self.path.display())))
            }
        };
        serde_json::from_str(&contents)
            .change_context(CursorStoreError::ReadError)
            .attach_printable_lazy(|| format!("Path: {}", self.path.display()))
    }
}

#[async_trait::async_trait]
impl CursorStore for JsonFileCursorStore {
    async fn get(&self, key: &str) -> error_stack::Result<Option<u64>, CursorStoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.get(key).copied())
    }

    async fn set(&self, key: &str, height: u64) -> error_stack::Result<(), CursorStoreError> {
        let _guard = self.lock.lock().await;
        let mut cursors = self
            .read_all()
            .await
            .change_context(CursorStoreError::WriteError)?;
        cursors.insert(key.to_string(), height);

        let contents = serde_json::to_string_pretty(&cursors)
            .change_context(CursorStoreError::WriteError)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, contents)
            .await
            .change_context(CursorStoreError::WriteError)
            .attach_printable_lazy(|| format!("Path: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .change_context(CursorStoreError::WriteError)
            .attach_printable_lazy(|| format!("Path: {}", self.path.display()))?;
        debug!(key, height, "Cursor persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileCursorStore::new(dir.path().join("cursors.json"));
        assert_eq!(store.get("latest_block_height_processed_fil").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cursors_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursors.json");
        {
            let store = JsonFileCursorStore::new(&path);
            store.set("latest_block_height_processed_fil", 10).await.unwrap();
            store.set("latest_block_height_processed_sol", 20).await.unwrap();
            store.set("latest_block_height_processed_fil", 11).await.unwrap();
        }
        let store = JsonFileCursorStore::new(&path);
        assert_eq!(store.get("latest_block_height_processed_fil").await.unwrap(), Some(11));
        assert_eq!(store.get("latest_block_height_processed_sol").await.unwrap(), Some(20));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursors.json");
        std::fs::write(&path, "not json").unwrap();
        let store = JsonFileCursorStore::new(&path);
        let report = store.get("anything").await.unwrap_err();
        assert!(matches!(report.current_context(), CursorStoreError::ReadError));
    }
}
