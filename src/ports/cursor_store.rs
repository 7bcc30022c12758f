use std::fmt::Debug;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CursorStoreError {
    #[error("Failed to read cursor")]
    ReadError,
    #[error("Failed to write cursor")]
    WriteError,
}

/// Key under which the scanner persists the last fully processed block of `chain`.
pub fn cursor_key(chain: &str) -> String {
    format!("latest_block_height_processed_{chain}")
}

/// External key-value store holding one block height per chain. Only the block scanner writes to
/// it, and callers must make sure a single scanner runs per chain.
#[async_trait::async_trait]
pub trait CursorStore: Send + Sync + Debug {
    async fn get(&self, key: &str) -> error_stack::Result<Option<u64>, CursorStoreError>;

    async fn set(&self, key: &str, height: u64) -> error_stack::Result<(), CursorStoreError>;
}
