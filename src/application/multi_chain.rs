use std::collections::BTreeMap;
use std::sync::Arc;

use error_stack::{Report, ResultExt};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use super::explorer::{ExplorerError, ExplorerInterface, ExplorerResult};
use super::scanner::{BlockRangeScanner, ScanError, ScanOutcome, ScanRange, ScanResult};
use crate::domain::{BalanceRecord, TransferMaps, TransferTx, TxDetails};
use crate::ports::OperationKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TxDirection {
    Incoming,
    Outgoing,
    #[default]
    Both,
}

#[derive(Debug)]
struct ChainServices {
    explorer: Arc<ExplorerInterface>,
    scanner: BlockRangeScanner,
}

/// Entry point keyed by chain id. Every chain has its own explorer and scanner; nothing is
/// shared between chains except the cursor store.
#[derive(Debug, Default)]
pub struct MultiChainExplorer {
    chains: BTreeMap<String, ChainServices>,
}

impl MultiChainExplorer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `scanner` (and the explorer it wraps) under its chain id.
    pub fn insert(&mut self, scanner: BlockRangeScanner) {
        let explorer = scanner.explorer().clone();
        self.chains.insert(
            explorer.chain().id.clone(),
            ChainServices { explorer, scanner },
        );
    }

    pub fn chains(&self) -> impl Iterator<Item = &str> {
        self.chains.keys().map(String::as_str)
    }

    fn services(&self, chain: &str) -> ExplorerResult<&ChainServices> {
        self.chains
            .get(chain)
            .ok_or_else(|| Report::new(ExplorerError::UnknownChain(chain.to_string())))
    }

    pub fn explorer(&self, chain: &str) -> ExplorerResult<&Arc<ExplorerInterface>> {
        Ok(&self.services(chain)?.explorer)
    }

    fn scanner(&self, chain: &str) -> ScanResult<&BlockRangeScanner> {
        self.services(chain)
            .map(|services| &services.scanner)
            .change_context(ScanError::Explorer)
    }

    pub async fn get_block_head(
        &self,
        chain: &str,
        cancel: &CancellationToken,
    ) -> ExplorerResult<u64> {
        self.explorer(chain)?.get_block_head(cancel).await
    }

    pub async fn get_balance(
        &self,
        chain: &str,
        address: &str,
        cancel: &CancellationToken,
    ) -> ExplorerResult<BalanceRecord> {
        self.explorer(chain)?.get_balance(address, cancel).await
    }

    pub async fn get_balances(
        &self,
        chain: &str,
        addresses: &[String],
        cancel: &CancellationToken,
    ) -> ExplorerResult<Vec<BalanceRecord>> {
        self.explorer(chain)?.get_balances(addresses, cancel).await
    }

    /// Looks up the head first so confirmations can be filled in. A chain without a working
    /// head provider still answers, without confirmations.
    #[instrument(skip(self, cancel))]
    pub async fn get_tx_details(
        &self,
        chain: &str,
        hash: &str,
        cancel: &CancellationToken,
    ) -> ExplorerResult<TxDetails> {
        let explorer = self.explorer(chain)?;
        let head = self.optional_head(explorer, cancel).await?;
        explorer.get_tx_details(hash, head, cancel).await
    }

    #[instrument(skip(self, hashes, cancel), fields(count = hashes.len()))]
    pub async fn get_tx_details_batch(
        &self,
        chain: &str,
        hashes: &[String],
        cancel: &CancellationToken,
    ) -> ExplorerResult<BTreeMap<String, TxDetails>> {
        let explorer = self.explorer(chain)?;
        if hashes.is_empty() {
            return Ok(BTreeMap::new());
        }
        let head = self.optional_head(explorer, cancel).await?;
        explorer.get_tx_details_batch(hashes, head, cancel).await
    }

    #[instrument(skip(self, cancel))]
    pub async fn get_address_txs(
        &self,
        chain: &str,
        address: &str,
        direction: TxDirection,
        cancel: &CancellationToken,
    ) -> ExplorerResult<Vec<TransferTx>> {
        let explorer = self.explorer(chain)?;
        let head = self.optional_head(explorer, cancel).await?;
        let spec = explorer.chain();
        let transfers = explorer.get_address_txs(address, head, cancel).await?;
        Ok(transfers
            .into_iter()
            .filter(|t| match direction {
                TxDirection::Incoming => spec.same_address(&t.to_address, address),
                TxDirection::Outgoing => spec.same_address(&t.from_address, address),
                TxDirection::Both => {
                    spec.same_address(&t.to_address, address)
                        || spec.same_address(&t.from_address, address)
                }
            })
            .collect())
    }

    /// Explicit range scan. The cursor only moves when the range continues from it.
    pub async fn get_block_txs(
        &self,
        chain: &str,
        from_height: u64,
        to_height: u64,
        cancel: &CancellationToken,
    ) -> ScanResult<ScanOutcome> {
        self.scanner(chain)?
            .scan(ScanRange::between(from_height, to_height), cancel)
            .await
    }

    pub async fn get_wallet_transactions(
        &self,
        chain: &str,
        address: &str,
        cancel: &CancellationToken,
    ) -> ScanResult<TransferMaps> {
        self.scanner(chain)?.get_wallet_transactions(address, cancel).await
    }

    /// Scans from the stored cursor up to the head.
    pub async fn scan(&self, chain: &str, cancel: &CancellationToken) -> ScanResult<ScanOutcome> {
        self.scanner(chain)?.scan_next(cancel).await
    }

    async fn optional_head(
        &self,
        explorer: &ExplorerInterface,
        cancel: &CancellationToken,
    ) -> ExplorerResult<Option<u64>> {
        if !explorer.has_providers(OperationKind::BlockHead) {
            return Ok(None);
        }
        match explorer.get_block_head(cancel).await {
            Ok(head) => Ok(Some(head)),
            Err(report) if *report.current_context() == ExplorerError::Cancelled => Err(report),
            Err(report) => {
                warn!(error = ?report, "Head unavailable, confirmations left empty");
                Ok(None)
            }
        }
    }
}
