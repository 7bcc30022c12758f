use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::ports::{CursorStore, CursorStoreError};

/// Cursor store that lives as long as the process. Useful for one-shot scans and tests.
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    cursors: RwLock<HashMap<String, u64>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CursorStore for MemoryCursorStore {
    async fn get(&self, key: &str) -> error_stack::Result<Option<u64>, CursorStoreError> {
        Ok(self.cursors.read().await.get(key).copied())
    }

    async fn set(&self, key: &str, height: u64) -> error_stack::Result<(), CursorStoreError> {
        self.cursors.write().await.insert(key.to_string(), height);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_after_set() {
        let store = MemoryCursorStore::new();
        assert_eq!(store.get("latest_block_height_processed_sol").await.unwrap(), None);
        store.set("latest_block_height_processed_sol", 42).await.unwrap();
        assert_eq!(store.get("latest_block_height_processed_sol").await.unwrap(), Some(42));
    }
}
