use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use error_stack::Report;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::retry::RetryPolicy;
use crate::domain::{BalanceRecord, ChainSpec, TransferTx, TxDetails};
use crate::ports::{OperationKind, ProviderEntry, ProviderError, ProviderResult};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExplorerError {
    #[error("Every provider failed {operation} on chain '{chain}'")]
    AllProvidersFailed {
        chain: String,
        operation: OperationKind,
    },
    #[error("Transaction {hash} carries several transfers that cannot be reduced to one")]
    AmbiguousTransfer { hash: String },
    #[error("Operation was cancelled")]
    Cancelled,
    #[error("Chain '{0}' is not configured")]
    UnknownChain(String),
}

pub type ExplorerResult<T> = error_stack::Result<T, ExplorerError>;

/// Ordered providers per operation for one chain.
#[derive(Debug, Clone, Default)]
pub struct ProviderRoutes {
    routes: HashMap<OperationKind, Vec<ProviderEntry>>,
}

impl ProviderRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `entry` as the lowest priority provider for `operation`.
    pub fn with(mut self, operation: OperationKind, entry: ProviderEntry) -> Self {
        self.push(operation, entry);
        self
    }

    pub fn push(&mut self, operation: OperationKind, entry: ProviderEntry) {
        self.routes.entry(operation).or_default().push(entry);
    }

    pub fn providers(&self, operation: OperationKind) -> &[ProviderEntry] {
        self.routes.get(&operation).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Per-chain aggregator. Tries the providers of an operation in order, retrying transient
/// failures on each, and returns the first answer that parses.
#[derive(Debug)]
pub struct ExplorerInterface {
    chain: Arc<ChainSpec>,
    routes: ProviderRoutes,
    retry: RetryPolicy,
}

impl ExplorerInterface {
    pub fn new(chain: Arc<ChainSpec>, routes: ProviderRoutes, retry: RetryPolicy) -> Self {
        Self {
            chain,
            routes,
            retry,
        }
    }

    pub fn chain(&self) -> &Arc<ChainSpec> {
        &self.chain
    }

    pub fn has_providers(&self, operation: OperationKind) -> bool {
        !self.routes.providers(operation).is_empty()
    }

    async fn with_failover<T, F, Fut>(
        &self,
        operation: OperationKind,
        cancel: &CancellationToken,
        attempt: F,
    ) -> ExplorerResult<T>
    where
        F: Fn(ProviderEntry) -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let providers = self.routes.providers(operation);
        let mut failures: Vec<(String, Report<ProviderError>)> =
            Vec::with_capacity(providers.len());

        for entry in providers {
            let provider = entry.name().to_string();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(Report::new(ExplorerError::Cancelled)
                        .attach_printable(format!("Chain: {}", self.chain.id))
                        .attach_printable(format!("Operation: {operation}")));
                }
                result = self.retry.run(|| attempt(entry.clone())) => result,
            };
            match result {
                Ok(value) => {
                    debug!(%provider, %operation, "Provider answered");
                    return Ok(value);
                }
                Err(report) => {
                    warn!(
                        %provider,
                        %operation,
                        error = %report.current_context(),
                        "Provider failed, trying the next one"
                    );
                    failures.push((provider, report));
                }
            }
        }

        let mut report = Report::new(ExplorerError::AllProvidersFailed {
            chain: self.chain.id.clone(),
            operation,
        });
        if failures.is_empty() {
            report = report.attach_printable("No providers configured");
        }
        for (provider, failure) in failures {
            report = report.attach_printable(format!("{provider}: {failure:?}"));
        }
        Err(report)
    }

    #[instrument(skip(self, cancel), fields(chain = %self.chain.id))]
    pub async fn get_block_head(&self, cancel: &CancellationToken) -> ExplorerResult<u64> {
        self.with_failover(OperationKind::BlockHead, cancel, |entry| async move {
            let raw = entry.client.get_block_head().await?;
            entry.parser.parse_block_head(&raw)
        })
        .await
    }

    #[instrument(skip(self, cancel), fields(chain = %self.chain.id))]
    pub async fn get_balance(
        &self,
        address: &str,
        cancel: &CancellationToken,
    ) -> ExplorerResult<BalanceRecord> {
        self.with_failover(OperationKind::Balance, cancel, |entry| async move {
            let raw = entry.client.get_balance(address).await?;
            entry.parser.parse_balance(address, &raw)
        })
        .await
    }

    /// Balances in input order. A provider either answers for every address or is skipped.
    #[instrument(
        skip(self, addresses, cancel),
        fields(chain = %self.chain.id, count = addresses.len())
    )]
    pub async fn get_balances(
        &self,
        addresses: &[String],
        cancel: &CancellationToken,
    ) -> ExplorerResult<Vec<BalanceRecord>> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }
        self.with_failover(OperationKind::Balance, cancel, |entry| async move {
            let raw = entry.client.get_balances(addresses).await?;
            entry.parser.parse_balances(addresses, &raw)
        })
        .await
    }

    /// An ambiguous transaction is a valid answer, so it stops failover and is reported as
    /// [`ExplorerError::AmbiguousTransfer`].
    #[instrument(skip(self, cancel), fields(chain = %self.chain.id))]
    pub async fn get_tx_details(
        &self,
        hash: &str,
        head: Option<u64>,
        cancel: &CancellationToken,
    ) -> ExplorerResult<TxDetails> {
        let details = self
            .with_failover(OperationKind::TxDetails, cancel, |entry| async move {
                let raw = entry.client.get_tx_details(hash).await?;
                entry.parser.parse_tx_details(&raw, head)
            })
            .await?;
        match details {
            TxDetails::Ambiguous { hash, transfers } => {
                Err(Report::new(ExplorerError::AmbiguousTransfer { hash })
                    .attach_printable(format!("Transfers: {}", transfers.len())))
            }
            details => Ok(details),
        }
    }

    /// Details for several transactions from a single provider, keyed by hash. A hash the
    /// provider does not know maps to [`TxDetails::Unsuccessful`]. Ambiguous transactions are
    /// returned as such rather than failing the whole batch.
    #[instrument(
        skip(self, hashes, cancel),
        fields(chain = %self.chain.id, count = hashes.len())
    )]
    pub async fn get_tx_details_batch(
        &self,
        hashes: &[String],
        head: Option<u64>,
        cancel: &CancellationToken,
    ) -> ExplorerResult<BTreeMap<String, TxDetails>> {
        if hashes.is_empty() {
            return Ok(BTreeMap::new());
        }
        let details = self
            .with_failover(OperationKind::TxDetails, cancel, |entry| async move {
                let raw = entry.client.get_tx_details_batch(hashes).await?;
                entry.parser.parse_tx_details_batch(hashes, &raw, head)
            })
            .await?;
        Ok(hashes.iter().cloned().zip(details).collect())
    }

    #[instrument(skip(self, cancel), fields(chain = %self.chain.id))]
    pub async fn get_address_txs(
        &self,
        address: &str,
        head: Option<u64>,
        cancel: &CancellationToken,
    ) -> ExplorerResult<Vec<TransferTx>> {
        self.with_failover(OperationKind::AddressTxs, cancel, |entry| async move {
            let raw = entry.client.get_address_txs(address, None).await?;
            entry.parser.parse_address_txs(address, &raw, head)
        })
        .await
    }

    /// Every transfer in `[from_height, to_height]` from a single provider.
    #[instrument(skip(self, cancel), fields(chain = %self.chain.id))]
    pub async fn get_block_txs(
        &self,
        from_height: u64,
        to_height: u64,
        head: Option<u64>,
        cancel: &CancellationToken,
    ) -> ExplorerResult<Vec<TransferTx>> {
        self.with_failover(OperationKind::BlockTxs, cancel, |entry| async move {
            let raw = entry.client.get_block_txs(from_height, to_height).await?;
            entry.parser.parse_block_txs(&raw, head)
        })
        .await
    }
}
