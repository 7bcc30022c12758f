use std::sync::Arc;

use error_stack::{Report, ResultExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::explorer::{ExplorerError, ExplorerInterface};
use crate::adapters::config::ScannerConfig;
use crate::domain::TransferMaps;
use crate::ports::{cursor_key, CursorStore, OperationKind};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("Explorer failed during scan")]
    Explorer,
    #[error("Cursor store failed during scan")]
    CursorStore,
    #[error("Scan was cancelled")]
    Cancelled,
}

pub type ScanResult<T> = error_stack::Result<T, ScanError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScannerSettings {
    pub initial_lag: u64,
    pub max_blocks_per_scan: u64,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self::from(&ScannerConfig::default())
    }
}

impl From<&ScannerConfig> for ScannerSettings {
    fn from(config: &ScannerConfig) -> Self {
        Self {
            initial_lag: config.initial_lag,
            max_blocks_per_scan: config.max_blocks_per_scan.max(1),
        }
    }
}

/// Requested bounds. Missing bounds come from the cursor and the head.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanRange {
    pub from: Option<u64>,
    pub to: Option<u64>,
}

impl ScanRange {
    /// Everything after the stored cursor.
    pub fn next() -> Self {
        Self::default()
    }

    pub fn between(from: u64, to: u64) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanOutcome {
    pub from_height: u64,
    pub to_height: u64,
    pub head_height: u64,
    pub transfers: TransferMaps,
    pub cursor_advanced: bool,
}

impl ScanOutcome {
    /// Nothing new between the cursor and the head.
    pub fn is_empty_range(&self) -> bool {
        self.from_height > self.to_height
    }
}

fn map_explorer_error(report: Report<ExplorerError>) -> Report<ScanError> {
    let context = match report.current_context() {
        ExplorerError::Cancelled => ScanError::Cancelled,
        _ => ScanError::Explorer,
    };
    report.change_context(context)
}

/// Cursor-driven block range scanner for one chain. A single scanner should own the cursor of
/// its chain; concurrent scans of the same chain must be serialized by the caller.
#[derive(Debug)]
pub struct BlockRangeScanner {
    explorer: Arc<ExplorerInterface>,
    cursor_store: Arc<dyn CursorStore>,
    settings: ScannerSettings,
}

impl BlockRangeScanner {
    pub fn new(
        explorer: Arc<ExplorerInterface>,
        cursor_store: Arc<dyn CursorStore>,
        settings: ScannerSettings,
    ) -> Self {
        Self {
            explorer,
            cursor_store,
            settings,
        }
    }

    pub fn explorer(&self) -> &Arc<ExplorerInterface> {
        &self.explorer
    }

    fn cursor_key(&self) -> String {
        cursor_key(&self.explorer.chain().id)
    }

    pub async fn cursor(&self) -> ScanResult<Option<u64>> {
        let key = self.cursor_key();
        self.cursor_store
            .get(&key)
            .await
            .change_context(ScanError::CursorStore)
            .attach_printable_lazy(|| format!("Key: {key}"))
    }

    pub async fn scan_next(&self, cancel: &CancellationToken) -> ScanResult<ScanOutcome> {
        self.scan(ScanRange::next(), cancel).await
    }

    /// Fetches every successful transfer in the resolved range and files it by address. The
    /// cursor moves to `to_height` only after the whole range was fetched, and only forward.
    #[instrument(skip(self, cancel), fields(chain = %self.explorer.chain().id))]
    pub async fn scan(
        &self,
        range: ScanRange,
        cancel: &CancellationToken,
    ) -> ScanResult<ScanOutcome> {
        let head_height = self
            .explorer
            .get_block_head(cancel)
            .await
            .map_err(map_explorer_error)?;
        let effective_head = head_height.saturating_sub(self.explorer.chain().block_height_offset);
        let cursor = self.cursor().await?;

        let from_height = match (range.from, cursor) {
            (Some(from), _) => from,
            (None, Some(cursor)) => cursor.saturating_add(1),
            (None, None) => effective_head.saturating_sub(self.settings.initial_lag),
        };
        let max_to = from_height.saturating_add(self.settings.max_blocks_per_scan.max(1) - 1);
        let to_height = range
            .to
            .unwrap_or(effective_head)
            .min(effective_head)
            .min(max_to);

        if from_height > to_height {
            debug!(from_height, to_height, head_height, "Nothing to scan");
            return Ok(ScanOutcome {
                from_height,
                to_height,
                head_height,
                transfers: TransferMaps::default(),
                cursor_advanced: false,
            });
        }

        let transfers = self
            .explorer
            .get_block_txs(from_height, to_height, Some(head_height), cancel)
            .await
            .map_err(map_explorer_error)
            .attach_printable_lazy(|| format!("Range: {from_height}..={to_height}"))?;

        let fetched = transfers.len();
        let mut maps = TransferMaps::default();
        maps.extend(transfers.into_iter().filter(|t| t.success));

        let advances = match cursor {
            None => true,
            Some(cursor) => from_height <= cursor.saturating_add(1) && to_height > cursor,
        };
        if advances {
            if cancel.is_cancelled() {
                return Err(Report::new(ScanError::Cancelled))
                    .attach_printable(format!("Range: {from_height}..={to_height}"));
            }
            let key = self.cursor_key();
            self.cursor_store
                .set(&key, to_height)
                .await
                .change_context(ScanError::CursorStore)
                .attach_printable_lazy(|| format!("Key: {key}"))?;
        }

        info!(
            from_height,
            to_height,
            head_height,
            fetched,
            incoming = maps.incoming.len(),
            outgoing = maps.outgoing.len(),
            cursor_advanced = advances,
            "Scanned block range"
        );
        Ok(ScanOutcome {
            from_height,
            to_height,
            head_height,
            transfers: maps,
            cursor_advanced: advances,
        })
    }

    /// Address-indexed counterpart of [`scan`](Self::scan). The cursor is not touched.
    #[instrument(skip(self, cancel), fields(chain = %self.explorer.chain().id))]
    pub async fn get_wallet_transactions(
        &self,
        address: &str,
        cancel: &CancellationToken,
    ) -> ScanResult<TransferMaps> {
        let head = if self.explorer.has_providers(OperationKind::BlockHead) {
            Some(
                self.explorer
                    .get_block_head(cancel)
                    .await
                    .map_err(map_explorer_error)?,
            )
        } else {
            None
        };
        let chain = self.explorer.chain();
        let transfers = self
            .explorer
            .get_address_txs(address, head, cancel)
            .await
            .map_err(map_explorer_error)?;

        let mut maps = TransferMaps::default();
        maps.extend(transfers.into_iter().filter(|t| {
            t.success
                && (chain.same_address(&t.from_address, address)
                    || chain.same_address(&t.to_address, address))
        }));
        Ok(maps)
    }
}
